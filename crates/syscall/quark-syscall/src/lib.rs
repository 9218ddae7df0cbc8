//! Single source of truth for the quark syscall ABI.
//!
//! Shared between the kernel and userspace: syscall numbers, errno
//! values, `#[repr(C)]` structures crossing the boundary, and the
//! [`SyscallHandler`] trait with its [`dispatch`] function.
//!
//! Entry is `int 0x80`: `rax` carries the number in and the result
//! out; arguments travel in `rdi, rsi, rdx, r10, r8, r9`. A negative
//! result is `-errno`.

#![no_std]

// ---------------------------------------------------------------------------
// Syscall numbers
// ---------------------------------------------------------------------------

/// Terminate the calling process.
pub const SYS_EXIT: u64 = 0;
/// Duplicate the calling process.
pub const SYS_FORK: u64 = 1;
/// Read from a file descriptor.
pub const SYS_READ: u64 = 2;
/// Write to a file descriptor.
pub const SYS_WRITE: u64 = 3;
/// Open a path.
pub const SYS_OPEN: u64 = 4;
/// Close a file descriptor.
pub const SYS_CLOSE: u64 = 5;
/// Create a file (open with `O_CREAT|O_WRONLY|O_TRUNC`).
pub const SYS_CREAT: u64 = 6;
/// Open relative to a directory descriptor.
pub const SYS_OPENAT: u64 = 7;
/// Create a directory.
pub const SYS_MKDIR: u64 = 8;
/// Create a device node.
pub const SYS_MKNOD: u64 = 9;
/// Remove an empty directory.
pub const SYS_RMDIR: u64 = 10;
/// Remove a name.
pub const SYS_UNLINK: u64 = 11;
/// Get the current working directory.
pub const SYS_GETCWD: u64 = 12;
/// Change the current working directory.
pub const SYS_CHDIR: u64 = 13;
/// Change the cwd to an open directory.
pub const SYS_FCHDIR: u64 = 14;
/// Read directory entries.
pub const SYS_GETDENTS: u64 = 15;
/// Create a symbolic link.
pub const SYS_SYMLINK: u64 = 16;
/// Read a symbolic link target.
pub const SYS_READLINK: u64 = 17;
/// Create a hard link.
pub const SYS_LINK: u64 = 18;
/// Rename a path.
pub const SYS_RENAME: u64 = 19;
/// Truncate a path.
pub const SYS_TRUNCATE: u64 = 20;
/// Truncate an open file.
pub const SYS_FTRUNCATE: u64 = 21;
/// Check path accessibility.
pub const SYS_ACCESS: u64 = 22;
/// Change ownership.
pub const SYS_CHOWN: u64 = 23;
/// Change permission bits.
pub const SYS_CHMOD: u64 = 24;
/// Descriptor control.
pub const SYS_FCNTL: u64 = 25;
/// Duplicate a descriptor.
pub const SYS_DUP: u64 = 26;
/// Duplicate onto a specific descriptor.
pub const SYS_DUP2: u64 = 27;
/// Stat a path (following symlinks).
pub const SYS_STAT: u64 = 28;
/// Stat an open descriptor.
pub const SYS_FSTAT: u64 = 29;
/// Stat a path without following the final symlink.
pub const SYS_LSTAT: u64 = 30;
/// Reposition a file offset.
pub const SYS_LSEEK: u64 = 31;
/// Process id of the caller.
pub const SYS_GETPID: u64 = 32;
/// Parent process id of the caller.
pub const SYS_GETPPID: u64 = 33;
/// Map anonymous memory.
pub const SYS_MMAP: u64 = 34;
/// Unmap memory.
pub const SYS_MUNMAP: u64 = 35;
/// Change mapping protection.
pub const SYS_MPROTECT: u64 = 36;
/// Move the program break.
pub const SYS_BRK: u64 = 37;
/// Host name.
pub const SYS_GETHOSTNAME: u64 = 38;
/// Host id.
pub const SYS_GETHOSTID: u64 = 39;
/// System statistics.
pub const SYS_SYSINFO: u64 = 40;
/// Kernel identification.
pub const SYS_UNAME: u64 = 41;
/// Wall-clock time of day.
pub const SYS_GETTIMEOFDAY: u64 = 42;
/// Read a posix clock.
pub const SYS_CLOCK_GETTIME: u64 = 43;
/// Resolution of a posix clock.
pub const SYS_CLOCK_GETRES: u64 = 44;
/// High-resolution sleep.
pub const SYS_NANOSLEEP: u64 = 45;

// ---------------------------------------------------------------------------
// errno
// ---------------------------------------------------------------------------

/// No such file or directory.
pub const ENOENT: isize = 2;
/// Interrupted system call.
pub const EINTR: isize = 4;
/// I/O error.
pub const EIO: isize = 5;
/// Bad file descriptor.
pub const EBADF: isize = 9;
/// Cannot allocate memory.
pub const ENOMEM: isize = 12;
/// Permission denied.
pub const EACCES: isize = 13;
/// Bad address.
pub const EFAULT: isize = 14;
/// Device or resource busy.
pub const EBUSY: isize = 16;
/// File exists.
pub const EEXIST: isize = 17;
/// Not a directory.
pub const ENOTDIR: isize = 20;
/// Is a directory.
pub const EISDIR: isize = 21;
/// Invalid argument.
pub const EINVAL: isize = 22;
/// Too many open files.
pub const EMFILE: isize = 24;
/// No space left on device.
pub const ENOSPC: isize = 28;
/// Numerical result out of range.
pub const ERANGE: isize = 34;
/// File name too long.
pub const ENAMETOOLONG: isize = 36;
/// Function not implemented.
pub const ENOSYS: isize = 38;
/// Directory not empty.
pub const ENOTEMPTY: isize = 39;
/// Too many levels of symbolic links.
pub const ELOOP: isize = 40;
/// Exec format error.
pub const ENOEXEC: isize = 8;

// ---------------------------------------------------------------------------
// Shared constants
// ---------------------------------------------------------------------------

/// `openat` sentinel: resolve relative to the cwd.
pub const AT_FDCWD: isize = -100;

/// `lseek` whence: absolute.
pub const SEEK_SET: u64 = 0;
/// `lseek` whence: relative to the current offset.
pub const SEEK_CUR: u64 = 1;
/// `lseek` whence: relative to end of file.
pub const SEEK_END: u64 = 2;

/// Pages may be read.
pub const PROT_READ: u64 = 0x1;
/// Pages may be written.
pub const PROT_WRITE: u64 = 0x2;
/// Pages may be executed.
pub const PROT_EXEC: u64 = 0x4;

/// Modifications are shared.
pub const MAP_SHARED: u64 = 0x01;
/// Modifications are private (copy-on-write).
pub const MAP_PRIVATE: u64 = 0x02;
/// Place the mapping exactly at the hint.
pub const MAP_FIXED: u64 = 0x10;
/// Not backed by a file.
pub const MAP_ANONYMOUS: u64 = 0x20;
/// Error return of `mmap`.
pub const MAP_FAILED: u64 = u64::MAX;

/// `fcntl`: duplicate the descriptor.
pub const F_DUPFD: u64 = 0;
/// `fcntl`: get descriptor flags.
pub const F_GETFD: u64 = 1;
/// `fcntl`: set descriptor flags.
pub const F_SETFD: u64 = 2;
/// `fcntl`: get file status flags.
pub const F_GETFL: u64 = 3;
/// Descriptor flag: close on exec.
pub const FD_CLOEXEC: u64 = 1;

/// Wall clock.
pub const CLOCK_REALTIME: u64 = 0;
/// Monotonic since boot.
pub const CLOCK_MONOTONIC: u64 = 1;

/// File type mask in `st_mode`.
pub const S_IFMT: u32 = 0o170000;
/// Regular file.
pub const S_IFREG: u32 = 0o100000;
/// Directory.
pub const S_IFDIR: u32 = 0o040000;
/// Symbolic link.
pub const S_IFLNK: u32 = 0o120000;
/// Character device.
pub const S_IFCHR: u32 = 0o020000;
/// Block device.
pub const S_IFBLK: u32 = 0o060000;

// ---------------------------------------------------------------------------
// ABI structures
// ---------------------------------------------------------------------------

/// Seconds + nanoseconds.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timespec {
    /// Whole seconds.
    pub tv_sec: i64,
    /// Nanoseconds, `0..1_000_000_000`.
    pub tv_nsec: i64,
}

/// Seconds + microseconds (`gettimeofday`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timeval {
    /// Whole seconds.
    pub tv_sec: i64,
    /// Microseconds, `0..1_000_000`.
    pub tv_usec: i64,
}

/// `stat` result.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Stat {
    /// Device id of the containing filesystem.
    pub st_dev: u64,
    /// Inode number.
    pub st_ino: u64,
    /// Type and permission bits.
    pub st_mode: u32,
    /// Hard link count.
    pub st_nlink: u32,
    /// Owner.
    pub st_uid: u32,
    /// Group.
    pub st_gid: u32,
    /// Device id for device nodes.
    pub st_rdev: u64,
    /// Size in bytes.
    pub st_size: u64,
    /// Access time, seconds.
    pub st_atime: u64,
    /// Modification time, seconds.
    pub st_mtime: u64,
    /// Status change time, seconds.
    pub st_ctime: u64,
}

/// One `getdents` record.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Dirent {
    /// Inode number.
    pub d_ino: u64,
    /// Entry type (`DT_*`).
    pub d_type: u8,
    /// Bytes used of `d_name`.
    pub d_namlen: u8,
    /// Padding for alignment.
    pub d_pad: [u8; 6],
    /// Entry name, not NUL-terminated.
    pub d_name: [u8; 60],
}

/// `Dirent::d_type`: regular file.
pub const DT_REG: u8 = 0;
/// `Dirent::d_type`: directory.
pub const DT_DIR: u8 = 1;
/// `Dirent::d_type`: symlink.
pub const DT_LNK: u8 = 2;
/// `Dirent::d_type`: character device.
pub const DT_CHR: u8 = 3;
/// `Dirent::d_type`: block device.
pub const DT_BLK: u8 = 4;

/// `uname` result.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Utsname {
    /// Operating system name.
    pub sysname: [u8; 65],
    /// Host name.
    pub nodename: [u8; 65],
    /// Kernel release.
    pub release: [u8; 65],
    /// Kernel version / build.
    pub version: [u8; 65],
    /// Hardware identifier.
    pub machine: [u8; 65],
}

impl Default for Utsname {
    fn default() -> Self {
        Self {
            sysname: [0; 65],
            nodename: [0; 65],
            release: [0; 65],
            version: [0; 65],
            machine: [0; 65],
        }
    }
}

/// `sysinfo` result.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Sysinfo {
    /// Seconds since boot.
    pub uptime: i64,
    /// Total usable RAM in bytes.
    pub totalram: u64,
    /// Free RAM in bytes.
    pub freeram: u64,
    /// Number of processes.
    pub procs: u16,
    /// Padding for alignment.
    pub pad: [u16; 3],
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// The kernel's syscall surface; one method per syscall.
///
/// Each handler returns a non-negative value on success or `-errno`.
#[allow(missing_docs)]
pub trait SyscallHandler {
    fn sys_exit(&self, status: usize) -> isize;
    fn sys_fork(&self) -> isize;
    fn sys_read(&self, fd: usize, buf: usize, len: usize) -> isize;
    fn sys_write(&self, fd: usize, buf: usize, len: usize) -> isize;
    fn sys_open(&self, path: usize, flags: usize, mode: usize) -> isize;
    fn sys_close(&self, fd: usize) -> isize;
    fn sys_creat(&self, path: usize, mode: usize) -> isize;
    fn sys_openat(&self, dirfd: usize, path: usize, flags: usize, mode: usize) -> isize;
    fn sys_mkdir(&self, path: usize, mode: usize) -> isize;
    fn sys_mknod(&self, path: usize, mode: usize, dev: usize) -> isize;
    fn sys_rmdir(&self, path: usize) -> isize;
    fn sys_unlink(&self, path: usize) -> isize;
    fn sys_getcwd(&self, buf: usize, len: usize) -> isize;
    fn sys_chdir(&self, path: usize) -> isize;
    fn sys_fchdir(&self, fd: usize) -> isize;
    fn sys_getdents(&self, fd: usize, buf: usize, len: usize) -> isize;
    fn sys_symlink(&self, target: usize, path: usize) -> isize;
    fn sys_readlink(&self, path: usize, buf: usize, len: usize) -> isize;
    fn sys_link(&self, old: usize, new: usize) -> isize;
    fn sys_rename(&self, old: usize, new: usize) -> isize;
    fn sys_truncate(&self, path: usize, size: usize) -> isize;
    fn sys_ftruncate(&self, fd: usize, size: usize) -> isize;
    fn sys_access(&self, path: usize, amode: usize) -> isize;
    fn sys_chown(&self, path: usize, uid: usize, gid: usize) -> isize;
    fn sys_chmod(&self, path: usize, mode: usize) -> isize;
    fn sys_fcntl(&self, fd: usize, cmd: usize, arg: usize) -> isize;
    fn sys_dup(&self, fd: usize) -> isize;
    fn sys_dup2(&self, old: usize, new: usize) -> isize;
    fn sys_stat(&self, path: usize, buf: usize) -> isize;
    fn sys_fstat(&self, fd: usize, buf: usize) -> isize;
    fn sys_lstat(&self, path: usize, buf: usize) -> isize;
    fn sys_lseek(&self, fd: usize, offset: usize, whence: usize) -> isize;
    fn sys_getpid(&self) -> isize;
    fn sys_getppid(&self) -> isize;
    fn sys_mmap(&self, addr: usize, len: usize, prot: usize, flags: usize) -> isize;
    fn sys_munmap(&self, addr: usize, len: usize) -> isize;
    fn sys_mprotect(&self, addr: usize, len: usize, prot: usize) -> isize;
    fn sys_brk(&self, addr: usize) -> isize;
    fn sys_gethostname(&self, buf: usize, len: usize) -> isize;
    fn sys_gethostid(&self) -> isize;
    fn sys_sysinfo(&self, buf: usize) -> isize;
    fn sys_uname(&self, buf: usize) -> isize;
    fn sys_gettimeofday(&self, tv: usize) -> isize;
    fn sys_clock_gettime(&self, clock: usize, tp: usize) -> isize;
    fn sys_clock_getres(&self, clock: usize, tp: usize) -> isize;
    fn sys_nanosleep(&self, req: usize, rem: usize) -> isize;
}

/// Routes a syscall number to its handler method.
///
/// Unknown numbers return `-ENOSYS`.
pub fn dispatch(
    h: &dyn SyscallHandler,
    nr: u64,
    a0: usize,
    a1: usize,
    a2: usize,
    a3: usize,
    _a4: usize,
    _a5: usize,
) -> isize {
    match nr {
        SYS_EXIT => h.sys_exit(a0),
        SYS_FORK => h.sys_fork(),
        SYS_READ => h.sys_read(a0, a1, a2),
        SYS_WRITE => h.sys_write(a0, a1, a2),
        SYS_OPEN => h.sys_open(a0, a1, a2),
        SYS_CLOSE => h.sys_close(a0),
        SYS_CREAT => h.sys_creat(a0, a1),
        SYS_OPENAT => h.sys_openat(a0, a1, a2, a3),
        SYS_MKDIR => h.sys_mkdir(a0, a1),
        SYS_MKNOD => h.sys_mknod(a0, a1, a2),
        SYS_RMDIR => h.sys_rmdir(a0),
        SYS_UNLINK => h.sys_unlink(a0),
        SYS_GETCWD => h.sys_getcwd(a0, a1),
        SYS_CHDIR => h.sys_chdir(a0),
        SYS_FCHDIR => h.sys_fchdir(a0),
        SYS_GETDENTS => h.sys_getdents(a0, a1, a2),
        SYS_SYMLINK => h.sys_symlink(a0, a1),
        SYS_READLINK => h.sys_readlink(a0, a1, a2),
        SYS_LINK => h.sys_link(a0, a1),
        SYS_RENAME => h.sys_rename(a0, a1),
        SYS_TRUNCATE => h.sys_truncate(a0, a1),
        SYS_FTRUNCATE => h.sys_ftruncate(a0, a1),
        SYS_ACCESS => h.sys_access(a0, a1),
        SYS_CHOWN => h.sys_chown(a0, a1, a2),
        SYS_CHMOD => h.sys_chmod(a0, a1),
        SYS_FCNTL => h.sys_fcntl(a0, a1, a2),
        SYS_DUP => h.sys_dup(a0),
        SYS_DUP2 => h.sys_dup2(a0, a1),
        SYS_STAT => h.sys_stat(a0, a1),
        SYS_FSTAT => h.sys_fstat(a0, a1),
        SYS_LSTAT => h.sys_lstat(a0, a1),
        SYS_LSEEK => h.sys_lseek(a0, a1, a2),
        SYS_GETPID => h.sys_getpid(),
        SYS_GETPPID => h.sys_getppid(),
        SYS_MMAP => h.sys_mmap(a0, a1, a2, a3),
        SYS_MUNMAP => h.sys_munmap(a0, a1),
        SYS_MPROTECT => h.sys_mprotect(a0, a1, a2),
        SYS_BRK => h.sys_brk(a0),
        SYS_GETHOSTNAME => h.sys_gethostname(a0, a1),
        SYS_GETHOSTID => h.sys_gethostid(),
        SYS_SYSINFO => h.sys_sysinfo(a0),
        SYS_UNAME => h.sys_uname(a0),
        SYS_GETTIMEOFDAY => h.sys_gettimeofday(a0),
        SYS_CLOCK_GETTIME => h.sys_clock_gettime(a0, a1),
        SYS_CLOCK_GETRES => h.sys_clock_getres(a0, a1),
        SYS_NANOSLEEP => h.sys_nanosleep(a0, a1),
        _ => -ENOSYS,
    }
}
