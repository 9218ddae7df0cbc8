//! System identification and statistics handlers.

use quark_syscall::{EINVAL, ERANGE, Sysinfo, Utsname};

use super::userptr::{UserPtr, UserSlice};
use crate::proc;

/// Host name reported by `gethostname` / `uname`.
const HOSTNAME: &str = "quark";

/// Stable host identifier.
const HOSTID: u32 = 0x7172_6b31;

const SYSNAME: &str = "Quark";
const RELEASE: &str = "0.1.0";
const VERSION: &str = "quark kernel";
const MACHINE: &str = "x86_64";

fn fill(field: &mut [u8], value: &str) {
    let n = value.len().min(field.len() - 1);
    field[..n].copy_from_slice(&value.as_bytes()[..n]);
}

pub(super) fn sys_gethostname(buf: usize, len: usize) -> isize {
    if len == 0 {
        return -EINVAL;
    }
    let name = HOSTNAME.as_bytes();
    if len < name.len() + 1 {
        return -ERANGE;
    }
    let slice = match UserSlice::new(buf, name.len() + 1) {
        Ok(s) => s,
        Err(e) => return e,
    };
    let mut out = alloc::vec::Vec::with_capacity(name.len() + 1);
    out.extend_from_slice(name);
    out.push(0);
    match slice.copy_out(&out) {
        Ok(()) => 0,
        Err(e) => e,
    }
}

pub(super) fn sys_gethostid() -> isize {
    HOSTID as isize
}

pub(super) fn sys_sysinfo(buf: usize) -> isize {
    let out = match UserPtr::<Sysinfo>::new(buf) {
        Ok(p) => p,
        Err(e) => return e,
    };
    let stats = crate::mm::stats();
    let info = Sysinfo {
        uptime: crate::time::uptime_secs() as i64,
        totalram: stats.usable_frames as u64 * 4096,
        freeram: stats.free_frames as u64 * 4096,
        procs: proc::process_count() as u16,
        pad: [0; 3],
    };
    match out.write(&info) {
        Ok(()) => 0,
        Err(e) => e,
    }
}

pub(super) fn sys_uname(buf: usize) -> isize {
    let out = match UserPtr::<Utsname>::new(buf) {
        Ok(p) => p,
        Err(e) => return e,
    };
    let mut uts = Utsname::default();
    fill(&mut uts.sysname, SYSNAME);
    fill(&mut uts.nodename, HOSTNAME);
    fill(&mut uts.release, RELEASE);
    fill(&mut uts.version, VERSION);
    fill(&mut uts.machine, MACHINE);
    match out.write(&uts) {
        Ok(()) => 0,
        Err(e) => e,
    }
}
