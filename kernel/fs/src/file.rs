//! Open files and per-process descriptor tables.
//!
//! An [`OpenFile`] pairs a vnode with a shared offset and the open
//! flags; `dup` and `fork` clone the `Arc` so duplicated descriptors
//! share one file position, as POSIX requires. The [`FdTable`] is a
//! fixed-capacity slot array with a per-slot close-on-exec flag.

extern crate alloc;

use alloc::sync::Arc;

use quark_core::id::Fd;
use quark_core::sync::SpinLock;

use crate::{FsError, VnodeRef, VnodeType};

/// Access mode mask inside the open flags.
pub const O_ACCMODE: u32 = 0x3;
/// Open read-only.
pub const O_RDONLY: u32 = 0x0;
/// Open write-only.
pub const O_WRONLY: u32 = 0x1;
/// Open read-write.
pub const O_RDWR: u32 = 0x2;
/// Create the file if absent.
pub const O_CREAT: u32 = 0x40;
/// With `O_CREAT`: fail if the file exists.
pub const O_EXCL: u32 = 0x80;
/// Truncate to zero length on open.
pub const O_TRUNC: u32 = 0x200;
/// Every write goes to the current end of file.
pub const O_APPEND: u32 = 0x400;
/// Fail unless the path names a directory.
pub const O_DIRECTORY: u32 = 0x1_0000;
/// Close the descriptor across exec.
pub const O_CLOEXEC: u32 = 0x8_0000;

/// Parsed open flags.
///
/// Not a bitflags type because the POSIX access mode is a two-bit
/// field, not independent bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// Wraps raw flags from the syscall ABI.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw bits.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Whether reads are permitted.
    pub const fn readable(self) -> bool {
        matches!(self.0 & O_ACCMODE, O_RDONLY | O_RDWR)
    }

    /// Whether writes are permitted.
    pub const fn writable(self) -> bool {
        matches!(self.0 & O_ACCMODE, O_WRONLY | O_RDWR)
    }

    /// Whether `bit` is set.
    pub const fn contains(self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

/// Whence values for [`OpenFile::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    /// Absolute offset.
    Set(i64),
    /// Relative to the current offset.
    Current(i64),
    /// Relative to the end of the file.
    End(i64),
}

/// A kernel open-file object.
///
/// Shared by descriptor slots across `dup` and `fork`; the offset is
/// the shared state that makes that sharing observable.
pub struct OpenFile {
    vnode: VnodeRef,
    offset: SpinLock<u64>,
    flags: OpenFlags,
    path: alloc::string::String,
}

impl OpenFile {
    /// Wraps a resolved vnode.
    pub fn new(vnode: VnodeRef, flags: OpenFlags) -> Arc<Self> {
        Self::with_path(vnode, flags, "")
    }

    /// Wraps a resolved vnode, remembering the path it was opened by
    /// (used by `fchdir` and friends).
    pub fn with_path(vnode: VnodeRef, flags: OpenFlags, path: &str) -> Arc<Self> {
        Arc::new(Self {
            vnode,
            offset: SpinLock::new(0),
            flags,
            path: alloc::string::String::from(path),
        })
    }

    /// The path the file was opened by (may be empty for anonymous
    /// objects such as the console).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The backing vnode.
    pub fn vnode(&self) -> &VnodeRef {
        &self.vnode
    }

    /// The open flags.
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// The current file offset.
    pub fn offset(&self) -> u64 {
        *self.offset.lock()
    }

    /// Reads at the current offset, advancing it by the bytes read.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, FsError> {
        if !self.flags.readable() {
            return Err(FsError::BadFd);
        }
        let mut offset = self.offset.lock();
        let n = self.vnode.read(*offset, buf)?;
        *offset += n as u64;
        Ok(n)
    }

    /// Writes at the current offset (or the end for `O_APPEND`),
    /// advancing the offset past the written bytes.
    pub fn write(&self, buf: &[u8]) -> Result<usize, FsError> {
        if !self.flags.writable() {
            return Err(FsError::BadFd);
        }
        let mut offset = self.offset.lock();
        let pos = if self.flags.contains(O_APPEND) {
            self.vnode.attr().size
        } else {
            *offset
        };
        let n = self.vnode.write(pos, buf)?;
        *offset = pos + n as u64;
        Ok(n)
    }

    /// Repositions the offset. Negative results are rejected.
    pub fn seek(&self, whence: SeekFrom) -> Result<u64, FsError> {
        let mut offset = self.offset.lock();
        let base = match whence {
            SeekFrom::Set(_) => 0i64,
            SeekFrom::Current(_) => *offset as i64,
            SeekFrom::End(_) => self.vnode.attr().size as i64,
        };
        let delta = match whence {
            SeekFrom::Set(n) | SeekFrom::Current(n) | SeekFrom::End(n) => n,
        };
        let target = base.checked_add(delta).ok_or(FsError::InvalidArgument)?;
        if target < 0 {
            return Err(FsError::InvalidArgument);
        }
        *offset = target as u64;
        Ok(target as u64)
    }
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        self.vnode.release();
    }
}

/// One descriptor slot.
#[derive(Clone)]
pub struct FdSlot {
    /// The shared open file.
    pub file: Arc<OpenFile>,
    /// Close this descriptor on exec.
    pub close_on_exec: bool,
}

/// Number of descriptor slots per process.
pub const MAX_FDS: usize = 64;

/// Fixed-capacity per-process descriptor table.
pub struct FdTable {
    slots: [Option<FdSlot>; MAX_FDS],
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FdTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            slots: [const { None }; MAX_FDS],
        }
    }

    /// Installs `file` in the lowest free slot.
    pub fn insert(&mut self, file: Arc<OpenFile>) -> Result<Fd, FsError> {
        let close_on_exec = file.flags().contains(O_CLOEXEC);
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(FdSlot {
                    file,
                    close_on_exec,
                });
                return Ok(Fd::new(idx as u32));
            }
        }
        Err(FsError::TooManyFiles)
    }

    /// Installs `file` at a specific descriptor, replacing silently
    /// (dup2 semantics).
    pub fn insert_at(&mut self, fd: Fd, file: Arc<OpenFile>) -> Result<(), FsError> {
        let idx = fd.as_usize();
        if idx >= MAX_FDS {
            return Err(FsError::BadFd);
        }
        let close_on_exec = file.flags().contains(O_CLOEXEC);
        self.slots[idx] = Some(FdSlot {
            file,
            close_on_exec,
        });
        Ok(())
    }

    /// Shared reference to an open file.
    pub fn get(&self, fd: Fd) -> Result<Arc<OpenFile>, FsError> {
        self.slots
            .get(fd.as_usize())
            .and_then(|s| s.as_ref())
            .map(|s| s.file.clone())
            .ok_or(FsError::BadFd)
    }

    /// The full slot, including the close-on-exec flag.
    pub fn slot(&self, fd: Fd) -> Result<&FdSlot, FsError> {
        self.slots
            .get(fd.as_usize())
            .and_then(|s| s.as_ref())
            .ok_or(FsError::BadFd)
    }

    /// Sets the close-on-exec flag of a slot.
    pub fn set_close_on_exec(&mut self, fd: Fd, value: bool) -> Result<(), FsError> {
        self.slots
            .get_mut(fd.as_usize())
            .and_then(|s| s.as_mut())
            .map(|s| s.close_on_exec = value)
            .ok_or(FsError::BadFd)
    }

    /// Closes a descriptor.
    pub fn close(&mut self, fd: Fd) -> Result<(), FsError> {
        let idx = fd.as_usize();
        if idx >= MAX_FDS || self.slots[idx].is_none() {
            return Err(FsError::BadFd);
        }
        self.slots[idx] = None;
        Ok(())
    }

    /// Duplicates `fd` into the lowest free slot.
    pub fn dup(&mut self, fd: Fd) -> Result<Fd, FsError> {
        let file = self.get(fd)?;
        // dup clears close-on-exec on the copy.
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(FdSlot {
                    file,
                    close_on_exec: false,
                });
                return Ok(Fd::new(idx as u32));
            }
        }
        Err(FsError::TooManyFiles)
    }

    /// Duplicates `old` onto `new` (closing `new` first if open).
    pub fn dup2(&mut self, old: Fd, new: Fd) -> Result<Fd, FsError> {
        if new.as_usize() >= MAX_FDS {
            return Err(FsError::BadFd);
        }
        let file = self.get(old)?;
        if old == new {
            return Ok(new);
        }
        self.slots[new.as_usize()] = Some(FdSlot {
            file,
            close_on_exec: false,
        });
        Ok(new)
    }

    /// Clones the whole table for `fork`; every slot shares its
    /// `OpenFile` with the parent.
    pub fn duplicate(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }

    /// Drops every descriptor (process exit).
    pub fn close_all(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    /// Drops descriptors marked close-on-exec.
    pub fn close_on_exec(&mut self) {
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|s| s.close_on_exec) {
                *slot = None;
            }
        }
    }

    /// Number of open descriptors.
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// Rejects opening a directory for writing and applies `O_DIRECTORY`.
pub fn check_open_mode(kind: VnodeType, flags: OpenFlags) -> Result<(), FsError> {
    if kind == VnodeType::Directory && flags.writable() {
        return Err(FsError::IsADirectory);
    }
    if flags.contains(O_DIRECTORY) && kind != VnodeType::Directory {
        return Err(FsError::NotADirectory);
    }
    Ok(())
}
