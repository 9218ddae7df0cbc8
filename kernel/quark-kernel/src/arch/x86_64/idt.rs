//! IDT with exception gates and the `int 0x80` syscall gate.
//!
//! Every gate funnels through a stub that builds a uniform
//! [`TrapFrame`] (all GPRs + vector + error code + the CPU's iretq
//! frame) and calls the Rust dispatcher. The timer vector is not
//! installed here: the platform timer driver owns its IRQ stub and
//! calls into the scheduler, installing the gate via [`set_gate`].

use core::arch::global_asm;
use core::cell::UnsafeCell;
use core::mem::size_of;

use super::gdt::KERNEL_CS;

/// Vector of the syscall software interrupt.
pub const SYSCALL_VECTOR: u8 = 0x80;

/// Page fault vector.
pub const PAGE_FAULT_VECTOR: u8 = 14;

/// Saved machine state on any trap entry.
///
/// Field order mirrors the push sequence of the assembly stubs; the
/// tail is the frame the CPU pushed for the interrupt.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    /// General-purpose registers, in stub push order.
    pub r15: u64,
    /// See `r15`.
    pub r14: u64,
    /// See `r15`.
    pub r13: u64,
    /// See `r15`.
    pub r12: u64,
    /// See `r15`.
    pub r11: u64,
    /// See `r15`.
    pub r10: u64,
    /// See `r15`.
    pub r9: u64,
    /// See `r15`.
    pub r8: u64,
    /// See `r15`.
    pub rbp: u64,
    /// See `r15`.
    pub rdi: u64,
    /// See `r15`.
    pub rsi: u64,
    /// See `r15`.
    pub rdx: u64,
    /// See `r15`.
    pub rcx: u64,
    /// See `r15`.
    pub rbx: u64,
    /// See `r15`.
    pub rax: u64,
    /// Interrupt vector number.
    pub vector: u64,
    /// Hardware error code, or 0.
    pub error: u64,
    /// Interrupted instruction pointer.
    pub rip: u64,
    /// Interrupted code selector.
    pub cs: u64,
    /// Interrupted RFLAGS.
    pub rflags: u64,
    /// Interrupted stack pointer.
    pub rsp: u64,
    /// Interrupted stack selector.
    pub ss: u64,
}

impl TrapFrame {
    /// Whether the trap came from ring 3.
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

/// One 16-byte IDT gate.
#[repr(C)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    options: u16,
    offset_mid: u16,
    offset_high: u32,
    _reserved: u32,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            options: 0,
            offset_mid: 0,
            offset_high: 0,
            _reserved: 0,
        }
    }

    fn new(handler: u64, user_accessible: bool) -> Self {
        // Present, interrupt gate (IF cleared on entry), DPL 0 or 3.
        let mut options = 0x8E00u16;
        if user_accessible {
            options |= 3 << 13;
        }
        Self {
            offset_low: handler as u16,
            selector: KERNEL_CS,
            options,
            offset_mid: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            _reserved: 0,
        }
    }
}

struct Idt(UnsafeCell<[IdtEntry; 256]>);

// SAFETY: Mutated only during single-CPU boot.
unsafe impl Sync for Idt {}

static IDT: Idt = Idt(UnsafeCell::new([IdtEntry::missing(); 256]));

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u64,
}

unsafe extern "C" {
    fn exc_stub_table();
    fn int80_entry();
}

/// Installs a gate, optionally callable from ring 3.
///
/// Used by platform drivers to hook their IRQ stubs (the timer).
///
/// # Safety
///
/// `handler` must be a correct interrupt stub that preserves all
/// machine state it does not intend to change.
pub unsafe fn set_gate(vector: u8, handler: u64, user_accessible: bool) {
    // SAFETY: Gate writes are word-sized stores into a static table;
    // callers serialize (boot, or driver init with interrupts off).
    unsafe {
        (*IDT.0.get())[vector as usize] = IdtEntry::new(handler, user_accessible);
    }
}

/// Builds the exception gates and the syscall gate, then loads the IDT.
///
/// # Safety
///
/// Boot-time only, single CPU.
pub unsafe fn init() {
    // The stub table is 32 entries of 16 bytes each.
    let base = exc_stub_table as u64;
    for vector in 0..32u8 {
        // SAFETY: Each stub lives at a fixed 16-byte stride.
        unsafe { set_gate(vector, base + u64::from(vector) * 16, false) };
    }
    // SAFETY: int80_entry is a complete trap stub.
    unsafe { set_gate(SYSCALL_VECTOR, int80_entry as u64, true) };

    let pointer = IdtPointer {
        limit: (size_of::<[IdtEntry; 256]>() - 1) as u16,
        base: IDT.0.get() as u64,
    };
    // SAFETY: The pointer references the live IDT.
    unsafe {
        core::arch::asm!("lidt [{}]", in(reg) &pointer, options(nostack));
    }
}

/// Rust-side exception dispatch; called from the assembly stubs.
#[unsafe(no_mangle)]
extern "C" fn exception_dispatch(frame: &mut TrapFrame) {
    if frame.vector == u64::from(PAGE_FAULT_VECTOR) {
        crate::mm::page_fault(frame);
        return;
    }

    if frame.from_user() {
        quark_core::kerror!(
            "exception {} at {:#x} in user task, killing",
            frame.vector,
            frame.rip
        );
        crate::sched::exit_current(-1);
    }

    crate::panic::fatal(format_args!("unhandled CPU exception"), Some(frame));
}

// Exception stubs: vectors with a hardware error code (8, 10-14, 17)
// push only the vector; the rest push a zero placeholder first. Each
// stub is padded to 16 bytes so gates can be computed by stride.
global_asm!(
    r"
.macro EXC_NOERR vec
    .align 16
    push 0
    push \vec
    jmp exception_common
.endm
.macro EXC_ERR vec
    .align 16
    push \vec
    jmp exception_common
.endm

.global exc_stub_table
.align 16
exc_stub_table:
    EXC_NOERR 0
    EXC_NOERR 1
    EXC_NOERR 2
    EXC_NOERR 3
    EXC_NOERR 4
    EXC_NOERR 5
    EXC_NOERR 6
    EXC_NOERR 7
    EXC_ERR   8
    EXC_NOERR 9
    EXC_ERR   10
    EXC_ERR   11
    EXC_ERR   12
    EXC_ERR   13
    EXC_ERR   14
    EXC_NOERR 15
    EXC_NOERR 16
    EXC_ERR   17
    EXC_NOERR 18
    EXC_NOERR 19
    EXC_NOERR 20
    EXC_ERR   21
    EXC_NOERR 22
    EXC_NOERR 23
    EXC_NOERR 24
    EXC_NOERR 25
    EXC_NOERR 26
    EXC_NOERR 27
    EXC_NOERR 28
    EXC_ERR   29
    EXC_ERR   30
    EXC_NOERR 31

exception_common:
    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15
    cld
    mov rdi, rsp
    call exception_dispatch
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rbp
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rbx
    pop rax
    add rsp, 16
    iretq
",
);
