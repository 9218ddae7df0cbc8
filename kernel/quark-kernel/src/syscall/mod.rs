//! Syscall dispatch.
//!
//! The `int 0x80` stub delivers a [`TrapFrame`]; [`dispatch_frame`]
//! pulls the number from `rax` and the arguments from
//! `rdi, rsi, rdx, r10, r8, r9`, then routes through the shared
//! [`SyscallHandler`] trait. Handlers return non-negative results or
//! `-errno`; the stub writes the value back into the frame's `rax`.

mod io;
mod memory;
mod process;
mod query;
mod time;
mod vfs;

pub mod userptr;

use core::sync::atomic::{AtomicPtr, Ordering};

use quark_syscall::{SyscallHandler, dispatch};

use crate::arch::x86_64::idt::TrapFrame;

/// The live trap frame of the in-flight syscall.
///
/// Single CPU, syscalls never nest: set on entry, cleared on exit.
/// `fork` reads it to build the child's register image.
static CURRENT_FRAME: AtomicPtr<TrapFrame> = AtomicPtr::new(core::ptr::null_mut());

/// Returns a copy of the in-flight syscall's trap frame.
pub(crate) fn current_frame() -> Option<TrapFrame> {
    let ptr = CURRENT_FRAME.load(Ordering::Acquire);
    if ptr.is_null() {
        return None;
    }
    // SAFETY: The pointer was published by dispatch_frame for the
    // duration of the in-flight syscall on this (only) CPU.
    Some(unsafe { *ptr })
}

/// Kernel syscall surface.
struct QuarkDispatch;

impl SyscallHandler for QuarkDispatch {
    fn sys_exit(&self, status: usize) -> isize {
        process::sys_exit(status)
    }

    fn sys_fork(&self) -> isize {
        process::sys_fork()
    }

    fn sys_read(&self, fd: usize, buf: usize, len: usize) -> isize {
        io::sys_read(fd, buf, len)
    }

    fn sys_write(&self, fd: usize, buf: usize, len: usize) -> isize {
        io::sys_write(fd, buf, len)
    }

    fn sys_open(&self, path: usize, flags: usize, mode: usize) -> isize {
        vfs::sys_open(path, flags, mode)
    }

    fn sys_close(&self, fd: usize) -> isize {
        vfs::sys_close(fd)
    }

    fn sys_creat(&self, path: usize, mode: usize) -> isize {
        vfs::sys_creat(path, mode)
    }

    fn sys_openat(&self, dirfd: usize, path: usize, flags: usize, mode: usize) -> isize {
        vfs::sys_openat(dirfd, path, flags, mode)
    }

    fn sys_mkdir(&self, path: usize, mode: usize) -> isize {
        vfs::sys_mkdir(path, mode)
    }

    fn sys_mknod(&self, path: usize, mode: usize, dev: usize) -> isize {
        vfs::sys_mknod(path, mode, dev)
    }

    fn sys_rmdir(&self, path: usize) -> isize {
        vfs::sys_rmdir(path)
    }

    fn sys_unlink(&self, path: usize) -> isize {
        vfs::sys_unlink(path)
    }

    fn sys_getcwd(&self, buf: usize, len: usize) -> isize {
        vfs::sys_getcwd(buf, len)
    }

    fn sys_chdir(&self, path: usize) -> isize {
        vfs::sys_chdir(path)
    }

    fn sys_fchdir(&self, fd: usize) -> isize {
        vfs::sys_fchdir(fd)
    }

    fn sys_getdents(&self, fd: usize, buf: usize, len: usize) -> isize {
        vfs::sys_getdents(fd, buf, len)
    }

    fn sys_symlink(&self, target: usize, path: usize) -> isize {
        vfs::sys_symlink(target, path)
    }

    fn sys_readlink(&self, path: usize, buf: usize, len: usize) -> isize {
        vfs::sys_readlink(path, buf, len)
    }

    fn sys_link(&self, old: usize, new: usize) -> isize {
        vfs::sys_link(old, new)
    }

    fn sys_rename(&self, old: usize, new: usize) -> isize {
        vfs::sys_rename(old, new)
    }

    fn sys_truncate(&self, path: usize, size: usize) -> isize {
        vfs::sys_truncate(path, size)
    }

    fn sys_ftruncate(&self, fd: usize, size: usize) -> isize {
        vfs::sys_ftruncate(fd, size)
    }

    fn sys_access(&self, path: usize, amode: usize) -> isize {
        vfs::sys_access(path, amode)
    }

    fn sys_chown(&self, path: usize, uid: usize, gid: usize) -> isize {
        vfs::sys_chown(path, uid, gid)
    }

    fn sys_chmod(&self, path: usize, mode: usize) -> isize {
        vfs::sys_chmod(path, mode)
    }

    fn sys_fcntl(&self, fd: usize, cmd: usize, arg: usize) -> isize {
        vfs::sys_fcntl(fd, cmd, arg)
    }

    fn sys_dup(&self, fd: usize) -> isize {
        vfs::sys_dup(fd)
    }

    fn sys_dup2(&self, old: usize, new: usize) -> isize {
        vfs::sys_dup2(old, new)
    }

    fn sys_stat(&self, path: usize, buf: usize) -> isize {
        vfs::sys_stat(path, buf)
    }

    fn sys_fstat(&self, fd: usize, buf: usize) -> isize {
        vfs::sys_fstat(fd, buf)
    }

    fn sys_lstat(&self, path: usize, buf: usize) -> isize {
        vfs::sys_lstat(path, buf)
    }

    fn sys_lseek(&self, fd: usize, offset: usize, whence: usize) -> isize {
        vfs::sys_lseek(fd, offset, whence)
    }

    fn sys_getpid(&self) -> isize {
        process::sys_getpid()
    }

    fn sys_getppid(&self) -> isize {
        process::sys_getppid()
    }

    fn sys_mmap(&self, addr: usize, len: usize, prot: usize, flags: usize) -> isize {
        memory::sys_mmap(addr, len, prot, flags)
    }

    fn sys_munmap(&self, addr: usize, len: usize) -> isize {
        memory::sys_munmap(addr, len)
    }

    fn sys_mprotect(&self, addr: usize, len: usize, prot: usize) -> isize {
        memory::sys_mprotect(addr, len, prot)
    }

    fn sys_brk(&self, addr: usize) -> isize {
        memory::sys_brk(addr)
    }

    fn sys_gethostname(&self, buf: usize, len: usize) -> isize {
        query::sys_gethostname(buf, len)
    }

    fn sys_gethostid(&self) -> isize {
        query::sys_gethostid()
    }

    fn sys_sysinfo(&self, buf: usize) -> isize {
        query::sys_sysinfo(buf)
    }

    fn sys_uname(&self, buf: usize) -> isize {
        query::sys_uname(buf)
    }

    fn sys_gettimeofday(&self, tv: usize) -> isize {
        time::sys_gettimeofday(tv)
    }

    fn sys_clock_gettime(&self, clock: usize, tp: usize) -> isize {
        time::sys_clock_gettime(clock, tp)
    }

    fn sys_clock_getres(&self, clock: usize, tp: usize) -> isize {
        time::sys_clock_getres(clock, tp)
    }

    fn sys_nanosleep(&self, req: usize, rem: usize) -> isize {
        time::sys_nanosleep(req, rem)
    }
}

static DISPATCH: QuarkDispatch = QuarkDispatch;

/// Routes a trap frame to the handler for its syscall number.
pub fn dispatch_frame(frame: &mut TrapFrame) -> isize {
    CURRENT_FRAME.store(frame as *mut TrapFrame, Ordering::Release);
    let result = dispatch(
        &DISPATCH,
        frame.rax,
        frame.rdi as usize,
        frame.rsi as usize,
        frame.rdx as usize,
        frame.r10 as usize,
        frame.r8 as usize,
        frame.r9 as usize,
    );
    CURRENT_FRAME.store(core::ptr::null_mut(), Ordering::Release);
    result
}
