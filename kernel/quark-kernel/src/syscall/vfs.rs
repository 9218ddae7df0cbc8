//! Filesystem syscall handlers.

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;

use quark_core::id::Fd;
use quark_fs::file::{O_CREAT, O_TRUNC, O_WRONLY, OpenFile, OpenFlags, SeekFrom};
use quark_fs::vfs::{F_OK, R_OK, W_OK, X_OK};
use quark_fs::{FsError, VnodeAttr, VnodeType, path};
use quark_syscall::{
    AT_FDCWD, DT_BLK, DT_CHR, DT_DIR, DT_LNK, DT_REG, Dirent, EBADF, EFAULT, EINVAL, ENOTDIR,
    ERANGE, F_DUPFD, F_GETFD, F_GETFL, F_SETFD, FD_CLOEXEC, S_IFBLK, S_IFCHR, S_IFDIR, S_IFLNK,
    S_IFREG, SEEK_CUR, SEEK_END, SEEK_SET, Stat,
};

use super::userptr::{UserPtr, UserSlice, copy_in_str};
use crate::fs::with_vfs;
use crate::proc::{Process, current_process};

/// Resolves the current process, or `-EFAULT` when there is none.
fn me() -> Result<Arc<Process>, isize> {
    current_process().ok_or(-EFAULT)
}

/// Turns a user path into an absolute, normalized path using the
/// process's cwd.
fn abs_path(process: &Process, user_path: &str) -> String {
    let joined = if path::is_absolute(user_path) {
        String::from(user_path)
    } else {
        path::join(&process.cwd.lock(), user_path)
    };
    path::normalize(&joined)
}

fn err(e: FsError) -> isize {
    -e.to_errno()
}

fn attr_to_stat(attr: &VnodeAttr) -> Stat {
    let type_bits = match attr.kind {
        VnodeType::Regular => S_IFREG,
        VnodeType::Directory => S_IFDIR,
        VnodeType::Symlink => S_IFLNK,
        VnodeType::CharDevice => S_IFCHR,
        VnodeType::BlockDevice => S_IFBLK,
    };
    Stat {
        st_dev: attr.dev,
        st_ino: attr.ino,
        st_mode: type_bits | (attr.mode & 0o7777),
        st_nlink: attr.nlink,
        st_uid: attr.uid,
        st_gid: attr.gid,
        st_rdev: attr.rdev,
        st_size: attr.size,
        st_atime: attr.atime,
        st_mtime: attr.mtime,
        st_ctime: attr.ctime,
    }
}

/// Looks up an open file by descriptor number.
pub(super) fn file_for(fd: usize) -> Result<Arc<OpenFile>, isize> {
    let process = me()?;
    let table = process.fd_table.lock();
    table.get(Fd::new(fd as u32)).map_err(err)
}

// ---------------------------------------------------------------------------
// open / close and friends
// ---------------------------------------------------------------------------

pub(super) fn sys_open(path_ptr: usize, flags: usize, mode: usize) -> isize {
    let process = match me() {
        Ok(p) => p,
        Err(e) => return e,
    };
    let user_path = match copy_in_str(path_ptr) {
        Ok(p) => p,
        Err(e) => return e,
    };
    let p = abs_path(&process, &user_path);

    let open_flags = OpenFlags::from_raw(flags as u32);
    let file = match with_vfs(|vfs| vfs.open(&p, open_flags, mode as u32)) {
        Ok(f) => f,
        Err(e) => return err(e),
    };

    let mut table = process.fd_table.lock();
    match table.insert(file) {
        Ok(fd) => fd.as_u32() as isize,
        Err(e) => err(e),
    }
}

pub(super) fn sys_creat(path_ptr: usize, mode: usize) -> isize {
    sys_open(path_ptr, (O_CREAT | O_WRONLY | O_TRUNC) as usize, mode)
}

pub(super) fn sys_openat(dirfd: usize, path_ptr: usize, flags: usize, mode: usize) -> isize {
    let user_path = match copy_in_str(path_ptr) {
        Ok(p) => p,
        Err(e) => return e,
    };
    if path::is_absolute(&user_path) || dirfd as isize == AT_FDCWD {
        return sys_open(path_ptr, flags, mode);
    }

    // Relative to an open directory: rebuild the absolute path from
    // the directory's remembered open path.
    let dir = match file_for(dirfd) {
        Ok(f) => f,
        Err(e) => return e,
    };
    if dir.vnode().attr().kind != VnodeType::Directory {
        return -ENOTDIR;
    }
    let process = match me() {
        Ok(p) => p,
        Err(e) => return e,
    };
    let p = path::normalize(&path::join(dir.path(), &user_path));

    let open_flags = OpenFlags::from_raw(flags as u32);
    let file = match with_vfs(|vfs| vfs.open(&p, open_flags, mode as u32)) {
        Ok(f) => f,
        Err(e) => return err(e),
    };
    let mut table = process.fd_table.lock();
    match table.insert(file) {
        Ok(fd) => fd.as_u32() as isize,
        Err(e) => err(e),
    }
}

pub(super) fn sys_close(fd: usize) -> isize {
    let process = match me() {
        Ok(p) => p,
        Err(e) => return e,
    };
    let mut table = process.fd_table.lock();
    match table.close(Fd::new(fd as u32)) {
        Ok(()) => 0,
        Err(e) => err(e),
    }
}

// ---------------------------------------------------------------------------
// Namespace operations
// ---------------------------------------------------------------------------

/// Shared shape of the path-only handlers.
fn with_user_path(path_ptr: usize, f: impl FnOnce(&str) -> Result<isize, FsError>) -> isize {
    let process = match me() {
        Ok(p) => p,
        Err(e) => return e,
    };
    let user_path = match copy_in_str(path_ptr) {
        Ok(p) => p,
        Err(e) => return e,
    };
    let p = abs_path(&process, &user_path);
    match f(&p) {
        Ok(v) => v,
        Err(e) => err(e),
    }
}

pub(super) fn sys_mkdir(path_ptr: usize, mode: usize) -> isize {
    with_user_path(path_ptr, |p| {
        with_vfs(|vfs| vfs.mkdir(p, mode as u32)).map(|()| 0)
    })
}

pub(super) fn sys_mknod(path_ptr: usize, mode: usize, dev: usize) -> isize {
    with_user_path(path_ptr, |p| {
        with_vfs(|vfs| vfs.mknod(p, mode as u32, dev as u64)).map(|()| 0)
    })
}

pub(super) fn sys_rmdir(path_ptr: usize) -> isize {
    with_user_path(path_ptr, |p| with_vfs(|vfs| vfs.rmdir(p)).map(|()| 0))
}

pub(super) fn sys_unlink(path_ptr: usize) -> isize {
    with_user_path(path_ptr, |p| with_vfs(|vfs| vfs.unlink(p)).map(|()| 0))
}

pub(super) fn sys_symlink(target_ptr: usize, path_ptr: usize) -> isize {
    let target = match copy_in_str(target_ptr) {
        Ok(t) => t,
        Err(e) => return e,
    };
    with_user_path(path_ptr, |p| {
        with_vfs(|vfs| vfs.symlink(&target, p)).map(|()| 0)
    })
}

pub(super) fn sys_readlink(path_ptr: usize, buf: usize, len: usize) -> isize {
    let slice = match UserSlice::new(buf, len) {
        Ok(s) => s,
        Err(e) => return e,
    };
    with_user_path(path_ptr, |p| {
        let target = with_vfs(|vfs| vfs.readlink(p))?;
        let bytes = target.as_bytes();
        let n = bytes.len().min(slice.len());
        match slice.copy_out(&bytes[..n]) {
            Ok(()) => Ok(n as isize),
            Err(_) => Err(FsError::BadAddress),
        }
    })
}

pub(super) fn sys_link(old_ptr: usize, new_ptr: usize) -> isize {
    let process = match me() {
        Ok(p) => p,
        Err(e) => return e,
    };
    let (old, new) = match (copy_in_str(old_ptr), copy_in_str(new_ptr)) {
        (Ok(o), Ok(n)) => (o, n),
        (Err(e), _) | (_, Err(e)) => return e,
    };
    let old = abs_path(&process, &old);
    let new = abs_path(&process, &new);
    match with_vfs(|vfs| vfs.link(&old, &new)) {
        Ok(()) => 0,
        Err(e) => err(e),
    }
}

pub(super) fn sys_rename(old_ptr: usize, new_ptr: usize) -> isize {
    let process = match me() {
        Ok(p) => p,
        Err(e) => return e,
    };
    let (old, new) = match (copy_in_str(old_ptr), copy_in_str(new_ptr)) {
        (Ok(o), Ok(n)) => (o, n),
        (Err(e), _) | (_, Err(e)) => return e,
    };
    let old = abs_path(&process, &old);
    let new = abs_path(&process, &new);
    match with_vfs(|vfs| vfs.rename(&old, &new)) {
        Ok(()) => 0,
        Err(e) => err(e),
    }
}

pub(super) fn sys_truncate(path_ptr: usize, size: usize) -> isize {
    with_user_path(path_ptr, |p| {
        with_vfs(|vfs| vfs.truncate(p, size as u64)).map(|()| 0)
    })
}

pub(super) fn sys_ftruncate(fd: usize, size: usize) -> isize {
    let file = match file_for(fd) {
        Ok(f) => f,
        Err(e) => return e,
    };
    if !file.flags().writable() {
        return -EBADF;
    }
    match file.vnode().truncate(size as u64) {
        Ok(()) => 0,
        Err(e) => err(e),
    }
}

pub(super) fn sys_access(path_ptr: usize, amode: usize) -> isize {
    let amode = amode as u32;
    if amode & !(R_OK | W_OK | X_OK | F_OK) != 0 {
        return -EINVAL;
    }
    with_user_path(path_ptr, |p| {
        with_vfs(|vfs| vfs.access(p, amode)).map(|()| 0)
    })
}

pub(super) fn sys_chown(path_ptr: usize, uid: usize, gid: usize) -> isize {
    with_user_path(path_ptr, |p| {
        with_vfs(|vfs| vfs.chown(p, uid as u32, gid as u32)).map(|()| 0)
    })
}

pub(super) fn sys_chmod(path_ptr: usize, mode: usize) -> isize {
    with_user_path(path_ptr, |p| {
        with_vfs(|vfs| vfs.chmod(p, mode as u32)).map(|()| 0)
    })
}

// ---------------------------------------------------------------------------
// Working directory
// ---------------------------------------------------------------------------

pub(super) fn sys_getcwd(buf: usize, len: usize) -> isize {
    let process = match me() {
        Ok(p) => p,
        Err(e) => return e,
    };
    let cwd = process.cwd.lock().clone();
    let bytes = cwd.as_bytes();
    if len < bytes.len() + 1 {
        return -ERANGE;
    }
    let slice = match UserSlice::new(buf, bytes.len() + 1) {
        Ok(s) => s,
        Err(e) => return e,
    };
    let mut out = alloc::vec::Vec::with_capacity(bytes.len() + 1);
    out.extend_from_slice(bytes);
    out.push(0);
    match slice.copy_out(&out) {
        Ok(()) => bytes.len() as isize + 1,
        Err(e) => e,
    }
}

pub(super) fn sys_chdir(path_ptr: usize) -> isize {
    let process = match me() {
        Ok(p) => p,
        Err(e) => return e,
    };
    let user_path = match copy_in_str(path_ptr) {
        Ok(p) => p,
        Err(e) => return e,
    };
    let p = abs_path(&process, &user_path);

    match with_vfs(|vfs| vfs.stat(&p)) {
        Ok(attr) if attr.kind == VnodeType::Directory => {
            *process.cwd.lock() = p;
            0
        }
        Ok(_) => -ENOTDIR,
        Err(e) => err(e),
    }
}

pub(super) fn sys_fchdir(fd: usize) -> isize {
    let process = match me() {
        Ok(p) => p,
        Err(e) => return e,
    };
    let file = match file_for(fd) {
        Ok(f) => f,
        Err(e) => return e,
    };
    if file.vnode().attr().kind != VnodeType::Directory {
        return -ENOTDIR;
    }
    if file.path().is_empty() {
        return -EBADF;
    }
    *process.cwd.lock() = String::from(file.path());
    0
}

// ---------------------------------------------------------------------------
// Directory reading
// ---------------------------------------------------------------------------

pub(super) fn sys_getdents(fd: usize, buf: usize, len: usize) -> isize {
    let file = match file_for(fd) {
        Ok(f) => f,
        Err(e) => return e,
    };
    let entry_size = core::mem::size_of::<Dirent>();
    let max_entries = len / entry_size;
    if max_entries == 0 {
        return -EINVAL;
    }

    let entries = match file.vnode().readdir() {
        Ok(e) => e,
        Err(e) => return err(e),
    };

    // The shared file offset is the index of the next entry to emit.
    let start = match file.seek(SeekFrom::Current(0)) {
        Ok(o) => o as usize,
        Err(e) => return err(e),
    };
    if start >= entries.len() {
        return 0;
    }

    let mut written = 0usize;
    let mut out = alloc::vec::Vec::new();
    for entry in entries.iter().skip(start).take(max_entries) {
        let mut record = Dirent {
            d_ino: entry.ino,
            d_type: match entry.kind {
                VnodeType::Regular => DT_REG,
                VnodeType::Directory => DT_DIR,
                VnodeType::Symlink => DT_LNK,
                VnodeType::CharDevice => DT_CHR,
                VnodeType::BlockDevice => DT_BLK,
            },
            d_namlen: 0,
            d_pad: [0; 6],
            d_name: [0; 60],
        };
        let name = entry.name.as_bytes();
        let n = name.len().min(record.d_name.len());
        record.d_name[..n].copy_from_slice(&name[..n]);
        record.d_namlen = n as u8;

        // SAFETY: Dirent is repr(C) plain data.
        let bytes = unsafe {
            core::slice::from_raw_parts(
                (&record as *const Dirent).cast::<u8>(),
                entry_size,
            )
        };
        out.extend_from_slice(bytes);
        written += 1;
    }

    let slice = match UserSlice::new(buf, out.len()) {
        Ok(s) => s,
        Err(e) => return e,
    };
    if let Err(e) = slice.copy_out(&out) {
        return e;
    }
    let _ = file.seek(SeekFrom::Set((start + written) as i64));
    (written * entry_size) as isize
}

// ---------------------------------------------------------------------------
// Descriptor plumbing
// ---------------------------------------------------------------------------

pub(super) fn sys_dup(fd: usize) -> isize {
    let process = match me() {
        Ok(p) => p,
        Err(e) => return e,
    };
    let mut table = process.fd_table.lock();
    match table.dup(Fd::new(fd as u32)) {
        Ok(new) => new.as_u32() as isize,
        Err(e) => err(e),
    }
}

pub(super) fn sys_dup2(old: usize, new: usize) -> isize {
    let process = match me() {
        Ok(p) => p,
        Err(e) => return e,
    };
    let mut table = process.fd_table.lock();
    match table.dup2(Fd::new(old as u32), Fd::new(new as u32)) {
        Ok(new) => new.as_u32() as isize,
        Err(e) => err(e),
    }
}

pub(super) fn sys_fcntl(fd: usize, cmd: usize, arg: usize) -> isize {
    let process = match me() {
        Ok(p) => p,
        Err(e) => return e,
    };
    let fd = Fd::new(fd as u32);
    let mut table = process.fd_table.lock();
    match cmd as u64 {
        F_DUPFD => match table.dup(fd) {
            Ok(new) => new.as_u32() as isize,
            Err(e) => err(e),
        },
        F_GETFD => match table.slot(fd) {
            Ok(slot) => {
                if slot.close_on_exec {
                    FD_CLOEXEC as isize
                } else {
                    0
                }
            }
            Err(e) => err(e),
        },
        F_SETFD => {
            let value = arg as u64 & FD_CLOEXEC != 0;
            match table.set_close_on_exec(fd, value) {
                Ok(()) => 0,
                Err(e) => err(e),
            }
        }
        F_GETFL => match table.get(fd) {
            Ok(file) => file.flags().raw() as isize,
            Err(e) => err(e),
        },
        _ => -EINVAL,
    }
}

// ---------------------------------------------------------------------------
// stat family and lseek
// ---------------------------------------------------------------------------

pub(super) fn sys_stat(path_ptr: usize, buf: usize) -> isize {
    let out = match UserPtr::<Stat>::new(buf) {
        Ok(p) => p,
        Err(e) => return e,
    };
    with_user_path(path_ptr, |p| {
        let attr = with_vfs(|vfs| vfs.stat(p))?;
        match out.write(&attr_to_stat(&attr)) {
            Ok(()) => Ok(0),
            Err(_) => Err(FsError::BadAddress),
        }
    })
}

pub(super) fn sys_lstat(path_ptr: usize, buf: usize) -> isize {
    let out = match UserPtr::<Stat>::new(buf) {
        Ok(p) => p,
        Err(e) => return e,
    };
    with_user_path(path_ptr, |p| {
        let attr = with_vfs(|vfs| vfs.lstat(p))?;
        match out.write(&attr_to_stat(&attr)) {
            Ok(()) => Ok(0),
            Err(_) => Err(FsError::BadAddress),
        }
    })
}

pub(super) fn sys_fstat(fd: usize, buf: usize) -> isize {
    let out = match UserPtr::<Stat>::new(buf) {
        Ok(p) => p,
        Err(e) => return e,
    };
    let file = match file_for(fd) {
        Ok(f) => f,
        Err(e) => return e,
    };
    let attr = file.vnode().attr();
    match out.write(&attr_to_stat(&attr)) {
        Ok(()) => 0,
        Err(e) => e,
    }
}

pub(super) fn sys_lseek(fd: usize, offset: usize, whence: usize) -> isize {
    let file = match file_for(fd) {
        Ok(f) => f,
        Err(e) => return e,
    };
    let offset = offset as i64;
    let seek = match whence as u64 {
        SEEK_SET => SeekFrom::Set(offset),
        SEEK_CUR => SeekFrom::Current(offset),
        SEEK_END => SeekFrom::End(offset),
        _ => return -EINVAL,
    };
    match file.seek(seek) {
        Ok(pos) => pos as isize,
        Err(e) => err(e),
    }
}
