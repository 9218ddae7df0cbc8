//! Wall-clock source for file timestamps.
//!
//! The kernel registers its timer-backed clock at boot; before that
//! (and in host tests that don't care) timestamps are zero.

use core::sync::atomic::{AtomicPtr, Ordering};

fn zero_clock() -> u64 {
    0
}

static CLOCK_FN: AtomicPtr<()> = AtomicPtr::new(zero_clock as *mut ());

/// Registers the wall-clock function (seconds since boot or epoch).
pub fn set_wall_clock(f: fn() -> u64) {
    CLOCK_FN.store(f as *mut (), Ordering::Release);
}

/// Current time in seconds from the registered source.
pub fn now() -> u64 {
    let ptr = CLOCK_FN.load(Ordering::Acquire);
    // SAFETY: Only `fn() -> u64` values are ever stored.
    let f: fn() -> u64 = unsafe { core::mem::transmute(ptr) };
    f()
}
