//! Timer source and kernel clocks.
//!
//! The platform supplies the actual timer (PIT, HPET, whatever): a
//! monotonic tick counter and its frequency, registered at boot. The
//! platform's timer ISR must save and restore all general-purpose
//! registers and call [`crate::sched::timer_interrupt`] on every tick;
//! the scheduler may context-switch away inside that call.

use core::sync::atomic::{AtomicPtr, Ordering};

use quark_syscall::Timespec;

fn zero_ticks() -> u64 {
    0
}

fn unit_frequency() -> u64 {
    1
}

static TICKS_FN: AtomicPtr<()> = AtomicPtr::new(zero_ticks as *mut ());
static FREQ_FN: AtomicPtr<()> = AtomicPtr::new(unit_frequency as *mut ());

/// Registers the platform timer: a monotonic tick counter and its
/// frequency in Hz.
pub fn set_timer_source(ticks: fn() -> u64, frequency: fn() -> u64) {
    TICKS_FN.store(ticks as *mut (), Ordering::Release);
    FREQ_FN.store(frequency as *mut (), Ordering::Release);
    quark_fs::clock::set_wall_clock(uptime_secs);
}

/// Monotonic ticks since boot.
pub fn ticks() -> u64 {
    let ptr = TICKS_FN.load(Ordering::Acquire);
    // SAFETY: Only `fn() -> u64` values are ever stored.
    let f: fn() -> u64 = unsafe { core::mem::transmute(ptr) };
    f()
}

/// Timer frequency in Hz.
pub fn frequency() -> u64 {
    let ptr = FREQ_FN.load(Ordering::Acquire);
    // SAFETY: Only `fn() -> u64` values are ever stored.
    let f: fn() -> u64 = unsafe { core::mem::transmute(ptr) };
    f().max(1)
}

/// Milliseconds since boot.
pub fn uptime_ms() -> u64 {
    ticks() * 1000 / frequency()
}

/// Seconds since boot.
pub fn uptime_secs() -> u64 {
    ticks() / frequency()
}

/// Nanoseconds since boot.
pub fn uptime_ns() -> u64 {
    let freq = frequency();
    let t = ticks();
    (t / freq) * 1_000_000_000 + (t % freq) * 1_000_000_000 / freq
}

/// Monotonic clock reading as a [`Timespec`].
pub fn monotonic_timespec() -> Timespec {
    let ns = uptime_ns();
    Timespec {
        tv_sec: (ns / 1_000_000_000) as i64,
        tv_nsec: (ns % 1_000_000_000) as i64,
    }
}

/// Clock resolution as a [`Timespec`].
pub fn resolution_timespec() -> Timespec {
    let ns_per_tick = (1_000_000_000 / frequency()).max(1);
    Timespec {
        tv_sec: 0,
        tv_nsec: ns_per_tick as i64,
    }
}
