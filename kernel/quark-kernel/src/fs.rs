//! Kernel-side VFS state.
//!
//! Owns the global [`Vfs`] instance, registers the built-in filesystem
//! types, and mounts the tmpfs root. All operation logic lives in
//! `quark-fs`; syscall handlers reach it through [`with_vfs`].

extern crate alloc;

use alloc::sync::Arc;

use quark_core::kinfo;
use quark_core::sync::SpinLock;
use quark_fs::tmpfs::TmpfsType;
use quark_fs::vfs::{MountFlags, Vfs};

static VFS: SpinLock<Option<Vfs>> = SpinLock::new(None);

/// Creates the VFS, registers tmpfs, and mounts it at `/`.
///
/// # Panics
///
/// Panics if called twice or if the root mount fails.
pub fn init() {
    let mut vfs = Vfs::new();
    vfs.register_filesystem(Arc::new(TmpfsType))
        .expect("tmpfs registration failed");
    vfs.mount(None, "/", "tmpfs", MountFlags::empty(), None)
        .expect("root mount failed");

    let mut global = VFS.lock();
    assert!(global.is_none(), "VFS already initialized");
    *global = Some(vfs);
    kinfo!("vfs: tmpfs mounted at /");
}

/// Runs `f` with the global VFS.
///
/// # Panics
///
/// Panics if [`init`] has not run.
pub fn with_vfs<R>(f: impl FnOnce(&mut Vfs) -> R) -> R {
    let mut vfs = VFS.lock();
    f(vfs.as_mut().expect("VFS not initialized"))
}
