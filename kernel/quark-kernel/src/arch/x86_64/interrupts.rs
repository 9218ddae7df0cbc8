//! Local interrupt control.

use core::arch::asm;

/// Disables interrupts.
#[inline]
pub fn disable() {
    // SAFETY: CLI only masks interrupts.
    unsafe { asm!("cli", options(nomem, nostack, preserves_flags)) };
}

/// Enables interrupts.
#[inline]
pub fn enable() {
    // SAFETY: STI only unmasks interrupts.
    unsafe { asm!("sti", options(nomem, nostack, preserves_flags)) };
}

/// Whether interrupts are currently enabled (RFLAGS.IF).
#[inline]
pub fn are_enabled() -> bool {
    let rflags: u64;
    // SAFETY: Reading RFLAGS has no side effects.
    unsafe {
        asm!("pushfq", "pop {}", out(reg) rflags, options(nomem, preserves_flags));
    }
    rflags & (1 << 9) != 0
}

/// Runs `f` with interrupts disabled, restoring the previous state.
///
/// The scheduler's implicit global critical section: every queue
/// manipulation and context-switch decision happens inside one of
/// these.
pub fn without<R>(f: impl FnOnce() -> R) -> R {
    let was_enabled = are_enabled();
    disable();
    let result = f();
    if was_enabled {
        enable();
    }
    result
}

/// Halts the CPU until the next interrupt.
#[inline]
pub fn enable_and_hlt() {
    // SAFETY: STI;HLT is the canonical idle sequence; the one-
    // instruction shadow makes it race-free.
    unsafe { asm!("sti", "hlt", options(nomem, nostack)) };
}
