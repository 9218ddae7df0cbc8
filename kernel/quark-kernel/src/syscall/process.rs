//! Process syscall handlers.

use quark_syscall::{EFAULT, EINVAL, ENOMEM};

use crate::proc;
use crate::sched;

pub(super) fn sys_exit(status: usize) -> isize {
    sched::exit_current(status as i32)
}

pub(super) fn sys_fork() -> isize {
    let Some(parent) = proc::current_process() else {
        return -EFAULT;
    };
    let Some(frame) = super::current_frame() else {
        return -EINVAL;
    };
    match proc::fork(&parent, &frame) {
        Ok(child_pid) => child_pid.as_u32() as isize,
        Err(_) => -ENOMEM,
    }
}

pub(super) fn sys_getpid() -> isize {
    proc::current_process().map_or(-EFAULT, |p| p.pid.as_u32() as isize)
}

pub(super) fn sys_getppid() -> isize {
    proc::current_process()
        .map_or(-EFAULT, |p| p.parent.map_or(0, |pp| pp.as_u32() as isize))
}
