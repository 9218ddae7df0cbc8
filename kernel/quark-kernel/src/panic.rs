//! The fatal-error path.
//!
//! Unrecoverable conditions (kernel-mode fault with no matching
//! region, corrupted allocator state, assertion failures) end here:
//! interrupts off, a banner and register dump on the console, then a
//! halt loop. A re-entrant panic skips the banner so a broken console
//! path cannot recurse forever.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::x86_64::idt::TrapFrame;
use crate::arch::x86_64::interrupts;
use crate::console;

static IN_PANIC: AtomicBool = AtomicBool::new(false);

/// Halts the machine after reporting `args` and an optional trap frame.
pub fn fatal(args: fmt::Arguments<'_>, frame: Option<&TrapFrame>) -> ! {
    interrupts::disable();

    // A panic inside the panic path skips straight to the halt.
    if !IN_PANIC.swap(true, Ordering::SeqCst) {
        console::write_fmt(format_args!(
            "\n==================== KERNEL PANIC ====================\n{args}\n"
        ));
        if let Some(f) = frame {
            dump_frame(f);
        }
        console::write_fmt(format_args!(
            "======================================================\n"
        ));
    }

    halt()
}

fn dump_frame(f: &TrapFrame) {
    console::write_fmt(format_args!(
        "vector={} error={:#x}\n\
         rip={:#018x} cs={:#06x} rflags={:#010x}\n\
         rsp={:#018x} ss={:#06x}\n\
         rax={:#018x} rbx={:#018x} rcx={:#018x}\n\
         rdx={:#018x} rsi={:#018x} rdi={:#018x}\n\
         rbp={:#018x} r8 ={:#018x} r9 ={:#018x}\n\
         r10={:#018x} r11={:#018x} r12={:#018x}\n\
         r13={:#018x} r14={:#018x} r15={:#018x}\n",
        f.vector,
        f.error,
        f.rip,
        f.cs,
        f.rflags,
        f.rsp,
        f.ss,
        f.rax,
        f.rbx,
        f.rcx,
        f.rdx,
        f.rsi,
        f.rdi,
        f.rbp,
        f.r8,
        f.r9,
        f.r10,
        f.r11,
        f.r12,
        f.r13,
        f.r14,
        f.r15,
    ));
}

fn halt() -> ! {
    loop {
        // SAFETY: CLI;HLT parks the CPU.
        unsafe {
            core::arch::asm!("cli", "hlt", options(nomem, nostack));
        }
    }
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    fatal(format_args!("{info}"), None)
}
