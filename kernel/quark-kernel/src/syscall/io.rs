//! Read/write handlers, including the console fallback for fds 0-2.

use quark_fs::FsError;
use quark_syscall::EBADF;

use super::userptr::UserSlice;
use super::vfs::file_for;
use crate::console;

/// Largest single transfer the kernel will buffer.
const IO_MAX: usize = 1 << 20;

pub(super) fn sys_read(fd: usize, buf: usize, len: usize) -> isize {
    let len = len.min(IO_MAX);
    let slice = match UserSlice::new(buf, len) {
        Ok(s) => s,
        Err(e) => return e,
    };
    if len == 0 {
        return 0;
    }

    match file_for(fd) {
        Ok(file) => {
            let mut kbuf = alloc::vec![0u8; len];
            match file.read(&mut kbuf) {
                Ok(n) => match slice.copy_out(&kbuf[..n]) {
                    Ok(()) => n as isize,
                    Err(e) => e,
                },
                Err(e) => -e.to_errno(),
            }
        }
        // The first three descriptors fall back to the console when no
        // file has been installed.
        Err(_) if fd <= 2 => {
            let mut kbuf = alloc::vec![0u8; len];
            match console::read_line(&mut kbuf) {
                Ok(n) => match slice.copy_out(&kbuf[..n]) {
                    Ok(()) => n as isize,
                    Err(e) => e,
                },
                Err(FsError::Interrupted) => -FsError::Interrupted.to_errno(),
                Err(e) => -e.to_errno(),
            }
        }
        Err(_) => -EBADF,
    }
}

pub(super) fn sys_write(fd: usize, buf: usize, len: usize) -> isize {
    let len = len.min(IO_MAX);
    let slice = match UserSlice::new(buf, len) {
        Ok(s) => s,
        Err(e) => return e,
    };
    if len == 0 {
        return 0;
    }
    let bytes = match slice.copy_in() {
        Ok(b) => b,
        Err(e) => return e,
    };

    match file_for(fd) {
        Ok(file) => match file.write(&bytes) {
            Ok(n) => n as isize,
            Err(e) => -e.to_errno(),
        },
        Err(_) if fd <= 2 => {
            console::write_bytes(&bytes);
            bytes.len() as isize
        }
        Err(_) => -EBADF,
    }
}
