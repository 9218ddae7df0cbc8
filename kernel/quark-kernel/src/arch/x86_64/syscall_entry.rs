//! The `int 0x80` syscall entry.
//!
//! The stub builds the same [`TrapFrame`](super::idt::TrapFrame) as the
//! exception stubs and calls [`syscall_trap`], which pulls the number
//! from `rax` and the arguments from the System V registers
//! (`rdi, rsi, rdx, r10, r8, r9`), dispatches, and writes the result
//! back into the frame's `rax` for the return to ring 3.

use core::arch::global_asm;

use super::idt::TrapFrame;

/// Rust-side syscall entry; called from the assembly stub.
#[unsafe(no_mangle)]
extern "C" fn syscall_trap(frame: &mut TrapFrame) {
    let result = crate::syscall::dispatch_frame(frame);
    frame.rax = result as u64;
}

global_asm!(
    r"
.global int80_entry
int80_entry:
    push 0
    push 0x80
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
    call syscall_trap
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

// Resume ring 3 from a prepared TrapFrame. rdi points at the frame;
// never returns. Used by the fork child's first run.
.global user_frame_return
user_frame_return:
    mov rsp, rdi
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

unsafe extern "C" {
    /// Resumes ring 3 from `frame`; does not return.
    ///
    /// # Safety
    ///
    /// `frame` must contain a complete, valid user-mode register image
    /// whose `cs`/`ss` are the user selectors and whose address space
    /// is the one currently loaded.
    pub fn user_frame_return(frame: *const TrapFrame) -> !;
}
