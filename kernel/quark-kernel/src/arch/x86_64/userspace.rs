//! Ring-3 entry.

use core::arch::asm;

use super::gdt::{USER_CS, USER_DS};

/// RFLAGS for fresh user threads: IF plus the always-one bit.
const USER_RFLAGS: u64 = 0x202;

/// Transfers control to user mode at `entry` with stack `stack_top`.
///
/// All general-purpose registers are zeroed except the instruction and
/// stack pointers; the data segments are the user selectors. One-way:
/// the kernel is re-entered only via interrupt or syscall.
///
/// # Safety
///
/// - The current address space must map `entry` and the stack as user
///   pages.
/// - TSS.RSP0 must already point at this thread's kernel stack.
pub unsafe fn enter_user(entry: u64, stack_top: u64) -> ! {
    // SAFETY: Per this function's contract; the iretq frame is built
    // with user selectors so the CPU drops to ring 3.
    unsafe {
        asm!(
            "mov ds, {uds:x}",
            "mov es, {uds:x}",
            "push {uds}",     // ss
            "push {ustk}",    // rsp
            "push {rfl}",     // rflags
            "push {ucs}",     // cs
            "push {uip}",     // rip
            "xor eax, eax",
            "xor ebx, ebx",
            "xor ecx, ecx",
            "xor edx, edx",
            "xor esi, esi",
            "xor edi, edi",
            "xor ebp, ebp",
            "xor r8d, r8d",
            "xor r9d, r9d",
            "xor r10d, r10d",
            "xor r11d, r11d",
            "xor r12d, r12d",
            "xor r13d, r13d",
            "xor r14d, r14d",
            "xor r15d, r15d",
            "iretq",
            uds = in(reg) u64::from(USER_DS),
            ucs = in(reg) u64::from(USER_CS),
            ustk = in(reg) stack_top,
            uip = in(reg) entry,
            rfl = in(reg) USER_RFLAGS,
            options(noreturn),
        );
    }
}
