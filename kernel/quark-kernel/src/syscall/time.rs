//! Clock and sleep handlers.

use quark_syscall::{
    CLOCK_MONOTONIC, CLOCK_REALTIME, EINVAL, Timespec, Timeval,
};

use super::userptr::UserPtr;
use crate::sched;
use crate::time;

/// Only boot-relative time exists; both supported clocks read the
/// monotonic timer.
fn clock_supported(clock: usize) -> bool {
    clock as u64 == CLOCK_REALTIME || clock as u64 == CLOCK_MONOTONIC
}

pub(super) fn sys_gettimeofday(tv: usize) -> isize {
    let out = match UserPtr::<Timeval>::new(tv) {
        Ok(p) => p,
        Err(e) => return e,
    };
    let ts = time::monotonic_timespec();
    let value = Timeval {
        tv_sec: ts.tv_sec,
        tv_usec: ts.tv_nsec / 1000,
    };
    match out.write(&value) {
        Ok(()) => 0,
        Err(e) => e,
    }
}

pub(super) fn sys_clock_gettime(clock: usize, tp: usize) -> isize {
    if !clock_supported(clock) {
        return -EINVAL;
    }
    let out = match UserPtr::<Timespec>::new(tp) {
        Ok(p) => p,
        Err(e) => return e,
    };
    match out.write(&time::monotonic_timespec()) {
        Ok(()) => 0,
        Err(e) => e,
    }
}

pub(super) fn sys_clock_getres(clock: usize, tp: usize) -> isize {
    if !clock_supported(clock) {
        return -EINVAL;
    }
    if tp == 0 {
        return 0;
    }
    let out = match UserPtr::<Timespec>::new(tp) {
        Ok(p) => p,
        Err(e) => return e,
    };
    match out.write(&time::resolution_timespec()) {
        Ok(()) => 0,
        Err(e) => e,
    }
}

pub(super) fn sys_nanosleep(req: usize, rem: usize) -> isize {
    let req_ptr = match UserPtr::<Timespec>::new(req) {
        Ok(p) => p,
        Err(e) => return e,
    };
    let request = match req_ptr.read() {
        Ok(ts) => ts,
        Err(e) => return e,
    };
    if request.tv_sec < 0 || !(0..1_000_000_000).contains(&request.tv_nsec) {
        return -EINVAL;
    }

    let ms = request.tv_sec as u64 * 1000 + request.tv_nsec as u64 / 1_000_000;
    sched::sleep_current_ms(ms.max(1));

    // The sleep is not cancelable, so the remainder is always zero.
    if rem != 0 {
        if let Ok(out) = UserPtr::<Timespec>::new(rem) {
            let _ = out.write(&Timespec::default());
        }
    }
    0
}
