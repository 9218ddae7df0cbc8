//! Virtual filesystem layer.
//!
//! Core abstractions: the [`Vnode`] operation set (trait objects with
//! default `Unsupported` methods standing in for a nullable vtable),
//! the filesystem registry and mount table ([`vfs`]), open-file objects
//! and descriptor tables ([`file`]), path utilities ([`path`]), the
//! in-memory reference filesystem ([`tmpfs`]), and block/inode helpers
//! for disk-backed filesystems ([`block`]).
//!
//! Everything is host-testable; the kernel crate only adds console
//! wiring and syscall entry points on top.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod block;
pub mod clock;
pub mod file;
pub mod path;
pub mod tmpfs;
pub mod vfs;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;
use core::fmt;

/// Longest accepted path, including the terminating component.
pub const PATH_MAX: usize = 256;

/// Longest accepted name of a single component.
pub const NAME_MAX: usize = 60;

/// Longest symlink target the resolver will read.
pub const SYMLINK_MAX: usize = 256;

/// Symlink chains deeper than this fail with [`FsError::Loop`].
pub const SYMLINK_MAX_DEPTH: usize = 8;

/// Errors reported by the filesystem layer.
///
/// The taxonomy every subsystem reports in; the syscall layer converts
/// to negative errno via [`FsError::to_errno`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Path, component, or object does not exist.
    NotFound,
    /// Create collided with an existing object.
    AlreadyExists,
    /// Access bits reject the operation.
    PermissionDenied,
    /// A directory was required.
    NotADirectory,
    /// A non-directory was required.
    IsADirectory,
    /// Directory not empty.
    NotEmpty,
    /// Out of memory or filesystem space.
    NoSpace,
    /// Invalid file descriptor.
    BadFd,
    /// Bad flags, offsets, or ranges.
    InvalidArgument,
    /// A user pointer failed validation.
    BadAddress,
    /// The vnode does not implement the operation.
    Unsupported,
    /// Symlink resolution exceeded the depth limit.
    Loop,
    /// A path or component exceeds the length limit.
    NameTooLong,
    /// A blocking read was interrupted (Ctrl-C).
    Interrupted,
    /// Too many open files in the process.
    TooManyFiles,
    /// Underlying device error.
    IoError,
    /// The resource is busy (e.g. unmounting the root).
    Busy,
}

impl FsError {
    /// The POSIX errno for this error.
    pub fn to_errno(self) -> isize {
        match self {
            Self::NotFound => 2,          // ENOENT
            Self::Interrupted => 4,       // EINTR
            Self::IoError => 5,           // EIO
            Self::BadFd => 9,             // EBADF
            Self::PermissionDenied => 13, // EACCES
            Self::BadAddress => 14,       // EFAULT
            Self::Busy => 16,             // EBUSY
            Self::AlreadyExists => 17,    // EEXIST
            Self::NotADirectory => 20,    // ENOTDIR
            Self::IsADirectory => 21,     // EISDIR
            Self::InvalidArgument => 22,  // EINVAL
            Self::TooManyFiles => 24,     // EMFILE
            Self::NoSpace => 28,          // ENOSPC
            Self::NameTooLong => 36,      // ENAMETOOLONG
            Self::Unsupported => 38,      // ENOSYS
            Self::NotEmpty => 39,         // ENOTEMPTY
            Self::Loop => 40,             // ELOOP
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// What a vnode is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeType {
    /// Regular file.
    Regular,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
    /// Character device.
    CharDevice,
    /// Block device.
    BlockDevice,
}

/// Attributes of a vnode, as returned by `getattr`.
#[derive(Debug, Clone, Copy)]
pub struct VnodeAttr {
    /// Inode number, unique within the owning filesystem.
    pub ino: u64,
    /// Device / filesystem instance id.
    pub dev: u64,
    /// Object type.
    pub kind: VnodeType,
    /// Permission bits (0o777 space).
    pub mode: u32,
    /// Owning user.
    pub uid: u32,
    /// Owning group.
    pub gid: u32,
    /// Size in bytes (target length for symlinks).
    pub size: u64,
    /// Hard link count.
    pub nlink: u32,
    /// Device number for device nodes.
    pub rdev: u64,
    /// Last access time (seconds).
    pub atime: u64,
    /// Last modification time (seconds).
    pub mtime: u64,
    /// Last status change time (seconds).
    pub ctime: u64,
    /// This vnode is the root of a mounted filesystem.
    pub is_mount_root: bool,
}

/// Attribute updates for `setattr`; `None` fields are left alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttr {
    /// New permission bits.
    pub mode: Option<u32>,
    /// New owner.
    pub uid: Option<u32>,
    /// New group.
    pub gid: Option<u32>,
    /// New access time.
    pub atime: Option<u64>,
    /// New modification time.
    pub mtime: Option<u64>,
}

/// One directory entry from `readdir`.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Entry name.
    pub name: String,
    /// Inode number.
    pub ino: u64,
    /// Entry type.
    pub kind: VnodeType,
}

/// Shared handle to a vnode.
pub type VnodeRef = Arc<dyn Vnode>;

/// The vnode operation set.
///
/// Every operation a filesystem object can support. Default bodies
/// return [`FsError::Unsupported`], which models an absent vtable slot:
/// a filesystem implements exactly the operations that make sense for
/// each node type.
pub trait Vnode: Send + Sync {
    /// Attributes. Every vnode must answer this.
    fn attr(&self) -> VnodeAttr;

    /// Concrete type access for same-filesystem operations (`link`,
    /// `rename`).
    fn as_any(&self) -> &dyn Any;

    /// Reads up to `buf.len()` bytes at `offset`.
    fn read(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize, FsError> {
        Err(FsError::Unsupported)
    }

    /// Writes `buf` at `offset`.
    fn write(&self, _offset: u64, _buf: &[u8]) -> Result<usize, FsError> {
        Err(FsError::Unsupported)
    }

    /// Sets the file size, zero-filling on growth.
    fn truncate(&self, _size: u64) -> Result<(), FsError> {
        Err(FsError::Unsupported)
    }

    /// Lists directory entries.
    fn readdir(&self) -> Result<Vec<DirEntry>, FsError> {
        Err(FsError::Unsupported)
    }

    /// Finds a child by name.
    fn lookup(&self, _name: &str) -> Result<VnodeRef, FsError> {
        Err(FsError::Unsupported)
    }

    /// Creates a regular file child.
    fn create(&self, _name: &str, _mode: u32) -> Result<VnodeRef, FsError> {
        Err(FsError::Unsupported)
    }

    /// Creates a directory child.
    fn mkdir(&self, _name: &str, _mode: u32) -> Result<VnodeRef, FsError> {
        Err(FsError::Unsupported)
    }

    /// Removes an empty directory child.
    fn rmdir(&self, _name: &str) -> Result<(), FsError> {
        Err(FsError::Unsupported)
    }

    /// Removes a non-directory child.
    fn unlink(&self, _name: &str) -> Result<(), FsError> {
        Err(FsError::Unsupported)
    }

    /// Adds a hard link to `target` under this directory.
    fn link(&self, _name: &str, _target: &VnodeRef) -> Result<(), FsError> {
        Err(FsError::Unsupported)
    }

    /// Creates a symlink child pointing at `target`.
    fn symlink(&self, _name: &str, _target: &str) -> Result<VnodeRef, FsError> {
        Err(FsError::Unsupported)
    }

    /// Reads a symlink's target.
    fn readlink(&self) -> Result<String, FsError> {
        Err(FsError::Unsupported)
    }

    /// Creates a device node child.
    fn mknod(&self, _name: &str, _mode: u32, _rdev: u64) -> Result<VnodeRef, FsError> {
        Err(FsError::Unsupported)
    }

    /// Moves a child of this directory under `new_parent`.
    fn rename(
        &self,
        _name: &str,
        _new_parent: &VnodeRef,
        _new_name: &str,
    ) -> Result<(), FsError> {
        Err(FsError::Unsupported)
    }

    /// Updates attributes.
    fn setattr(&self, _attr: SetAttr) -> Result<(), FsError> {
        Err(FsError::Unsupported)
    }

    /// Flushes the vnode to stable storage.
    fn sync(&self) -> Result<(), FsError> {
        Ok(())
    }

    /// Called when the last open file referencing the vnode closes.
    fn release(&self) {}
}

/// A mounted filesystem instance.
pub trait FileSystem: Send + Sync {
    /// Filesystem type name.
    fn name(&self) -> &'static str;

    /// The root vnode.
    fn root(&self) -> VnodeRef;

    /// Filesystem-wide statistics.
    fn statfs(&self) -> Result<StatFs, FsError> {
        Err(FsError::Unsupported)
    }

    /// Flushes all dirty state.
    fn sync(&self) -> Result<(), FsError> {
        Ok(())
    }
}

/// Statistics returned by [`FileSystem::statfs`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StatFs {
    /// Preferred block size.
    pub block_size: u64,
    /// Total capacity in blocks.
    pub total_blocks: u64,
    /// Free capacity in blocks.
    pub free_blocks: u64,
    /// Total inode slots.
    pub total_inodes: u64,
    /// Free inode slots.
    pub free_inodes: u64,
}

/// A registerable filesystem type (the registry record).
pub trait FilesystemType: Send + Sync {
    /// Type name used in `mount`.
    fn name(&self) -> &'static str;

    /// Creates a filesystem instance for a mount request.
    fn mount(
        &self,
        device: Option<&str>,
        flags: vfs::MountFlags,
        data: Option<&str>,
    ) -> Result<Arc<dyn FileSystem>, FsError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bare;

    impl Vnode for Bare {
        fn attr(&self) -> VnodeAttr {
            VnodeAttr {
                ino: 1,
                dev: 0,
                kind: VnodeType::Regular,
                mode: 0o644,
                uid: 0,
                gid: 0,
                size: 0,
                nlink: 1,
                rdev: 0,
                atime: 0,
                mtime: 0,
                ctime: 0,
                is_mount_root: false,
            }
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn absent_ops_report_unsupported() {
        let v = Bare;
        assert_eq!(v.read(0, &mut []), Err(FsError::Unsupported));
        assert_eq!(v.readdir().err(), Some(FsError::Unsupported));
        assert_eq!(v.lookup("x").err(), Some(FsError::Unsupported));
        assert_eq!(v.readlink().err(), Some(FsError::Unsupported));
        // sync and release default to no-ops, not errors.
        assert!(v.sync().is_ok());
        v.release();
    }

    #[test]
    fn errno_mapping_is_posix() {
        assert_eq!(FsError::NotFound.to_errno(), 2);
        assert_eq!(FsError::BadFd.to_errno(), 9);
        assert_eq!(FsError::AlreadyExists.to_errno(), 17);
        assert_eq!(FsError::IsADirectory.to_errno(), 21);
        assert_eq!(FsError::InvalidArgument.to_errno(), 22);
        assert_eq!(FsError::NoSpace.to_errno(), 28);
        assert_eq!(FsError::NotEmpty.to_errno(), 39);
        assert_eq!(FsError::Loop.to_errno(), 40);
    }
}
