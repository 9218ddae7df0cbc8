//! Filesystem registry, mount table, and path resolution.
//!
//! Three layers: registered filesystem types (keyed by name), the
//! mount list (the first mount at `/` is the root mount and cannot be
//! unmounted), and the vnode operations reached through resolution.
//!
//! Resolution walks components from the longest-matching mount root,
//! following symlinks by restarting on the rewritten path; a depth
//! counter turns cycles into [`FsError::Loop`]. A name cache maps
//! fully resolved paths to vnodes and is invalidated on every
//! namespace mutation.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::file::{O_CREAT, O_EXCL, O_TRUNC, OpenFile, OpenFlags, check_open_mode};
use crate::{
    FileSystem, FilesystemType, FsError, SYMLINK_MAX, SYMLINK_MAX_DEPTH, SetAttr, StatFs,
    VnodeAttr, VnodeRef, VnodeType, path,
};

bitflags::bitflags! {
    /// Mount-time flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MountFlags: u32 {
        /// Mount read-only.
        const RDONLY = 1 << 0;
        /// Ignore device nodes on this mount.
        const NODEV  = 1 << 1;
    }
}

/// `access` mode: existence only.
pub const F_OK: u32 = 0;
/// `access` mode: execute permission.
pub const X_OK: u32 = 1;
/// `access` mode: write permission.
pub const W_OK: u32 = 2;
/// `access` mode: read permission.
pub const R_OK: u32 = 4;

/// One entry of the mount list.
pub struct VfsMount {
    /// Absolute path the filesystem is mounted on.
    pub mount_point: String,
    /// Backing device name, if any.
    pub device: Option<String>,
    /// Mount flags.
    pub flags: MountFlags,
    /// The filesystem's root vnode.
    pub root: VnodeRef,
    /// The filesystem instance.
    pub fs: Arc<dyn FileSystem>,
}

/// The virtual filesystem: registry + mount table + name cache.
pub struct Vfs {
    fs_types: Vec<Arc<dyn FilesystemType>>,
    mounts: Vec<VfsMount>,
    /// Resolved-path cache; purely an optimization.
    dentries: BTreeMap<String, VnodeRef>,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    /// Creates an empty VFS with no registered types and no mounts.
    pub fn new() -> Self {
        Self {
            fs_types: Vec::new(),
            mounts: Vec::new(),
            dentries: BTreeMap::new(),
        }
    }

    // -----------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------

    /// Registers a filesystem type; duplicate names are rejected.
    pub fn register_filesystem(
        &mut self,
        fs_type: Arc<dyn FilesystemType>,
    ) -> Result<(), FsError> {
        if self.fs_types.iter().any(|t| t.name() == fs_type.name()) {
            return Err(FsError::AlreadyExists);
        }
        self.fs_types.push(fs_type);
        Ok(())
    }

    /// Removes a filesystem type from the registry.
    pub fn unregister_filesystem(&mut self, name: &str) -> Result<(), FsError> {
        let idx = self
            .fs_types
            .iter()
            .position(|t| t.name() == name)
            .ok_or(FsError::NotFound)?;
        self.fs_types.remove(idx);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Mounts
    // -----------------------------------------------------------------

    /// Mounts a filesystem of type `fstype` at `mount_point`.
    ///
    /// The first mount must be at `/` and becomes the root mount.
    /// Later mount points must resolve to existing directories.
    pub fn mount(
        &mut self,
        device: Option<&str>,
        mount_point: &str,
        fstype: &str,
        flags: MountFlags,
        data: Option<&str>,
    ) -> Result<(), FsError> {
        if !path::is_absolute(mount_point) {
            return Err(FsError::InvalidArgument);
        }
        let fs_type = self
            .fs_types
            .iter()
            .find(|t| t.name() == fstype)
            .ok_or(FsError::NotFound)?
            .clone();

        if self.mounts.is_empty() {
            if mount_point != "/" {
                return Err(FsError::InvalidArgument);
            }
        } else {
            if self.mounts.iter().any(|m| m.mount_point == mount_point) {
                return Err(FsError::Busy);
            }
            let target = self.resolve(mount_point)?;
            if target.attr().kind != VnodeType::Directory {
                return Err(FsError::NotADirectory);
            }
        }

        let fs = fs_type.mount(device, flags, data)?;
        let root = fs.root();
        self.mounts.push(VfsMount {
            mount_point: mount_point.to_string(),
            device: device.map(String::from),
            flags,
            root,
            fs,
        });
        self.dentries.clear();
        Ok(())
    }

    /// Unmounts the filesystem at `mount_point`.
    ///
    /// The root mount and mount points with nested mounts refuse with
    /// [`FsError::Busy`]. Dirty state is synced first.
    pub fn unmount(&mut self, mount_point: &str) -> Result<(), FsError> {
        if mount_point == "/" {
            return Err(FsError::Busy);
        }
        let idx = self
            .mounts
            .iter()
            .position(|m| m.mount_point == mount_point)
            .ok_or(FsError::NotFound)?;

        let nested = self.mounts.iter().any(|m| {
            m.mount_point != mount_point
                && m.mount_point.starts_with(mount_point)
                && m.mount_point.as_bytes().get(mount_point.len()) == Some(&b'/')
        });
        if nested {
            return Err(FsError::Busy);
        }

        self.mounts[idx].fs.sync()?;
        self.mounts.remove(idx);
        self.dentries.clear();
        Ok(())
    }

    /// The mount list.
    pub fn mounts(&self) -> &[VfsMount] {
        &self.mounts
    }

    /// The root mount's root vnode.
    pub fn root_vnode(&self) -> Result<VnodeRef, FsError> {
        self.mounts
            .iter()
            .find(|m| m.mount_point == "/")
            .map(|m| m.root.clone())
            .ok_or(FsError::NotFound)
    }

    /// Syncs every mounted filesystem.
    pub fn sync_all(&self) -> Result<(), FsError> {
        for mount in &self.mounts {
            mount.fs.sync()?;
        }
        Ok(())
    }

    /// statfs for the filesystem containing `p`.
    pub fn statfs(&self, p: &str) -> Result<StatFs, FsError> {
        let mp = path::longest_prefix_match(p, self.mounts.iter().map(|m| m.mount_point.as_str()))
            .ok_or(FsError::NotFound)?;
        let mount = self
            .mounts
            .iter()
            .find(|m| m.mount_point == mp)
            .expect("prefix match returned an unknown mount");
        mount.fs.statfs()
    }

    // -----------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------

    /// Resolves `p` to a vnode, following symlinks including the final
    /// component.
    pub fn resolve(&self, p: &str) -> Result<VnodeRef, FsError> {
        path::check_lengths(p)?;
        if let Some(hit) = self.dentries.get(p) {
            return Ok(hit.clone());
        }
        self.resolve_inner(p, true, 0)
    }

    /// Resolves `p` and records the result in the name cache.
    pub fn resolve_cached(&mut self, p: &str) -> Result<VnodeRef, FsError> {
        path::check_lengths(p)?;
        if let Some(hit) = self.dentries.get(p) {
            return Ok(hit.clone());
        }
        let vnode = self.resolve_inner(p, true, 0)?;
        self.dentries.insert(p.to_string(), vnode.clone());
        Ok(vnode)
    }

    /// Resolves `p` without following a symlink in the final component
    /// (the `lstat` / `unlink` flavor).
    pub fn resolve_nofollow(&self, p: &str) -> Result<VnodeRef, FsError> {
        path::check_lengths(p)?;
        self.resolve_inner(p, false, 0)
    }

    fn resolve_inner(
        &self,
        p: &str,
        follow_final: bool,
        depth: usize,
    ) -> Result<VnodeRef, FsError> {
        if depth > SYMLINK_MAX_DEPTH {
            return Err(FsError::Loop);
        }
        if !path::is_absolute(p) {
            return Err(FsError::InvalidArgument);
        }

        let mp = path::longest_prefix_match(p, self.mounts.iter().map(|m| m.mount_point.as_str()))
            .ok_or(FsError::NotFound)?;
        let mount = self
            .mounts
            .iter()
            .find(|m| m.mount_point == mp)
            .expect("prefix match returned an unknown mount");

        let mut current = mount.root.clone();
        let rest = path::strip_mount_prefix(p, mp);
        let comps: Vec<&str> = path::components(rest).collect();
        // Directory prefix of the component being looked up, used to
        // rebuild the path when a relative symlink target is found.
        let mut consumed = String::from(mp);

        for (i, comp) in comps.iter().enumerate() {
            if current.attr().kind != VnodeType::Directory {
                return Err(FsError::NotADirectory);
            }
            let next = current.lookup(comp)?;
            let last = i + 1 == comps.len();

            if next.attr().kind == VnodeType::Symlink && (follow_final || !last) {
                let target = next.readlink()?;
                if target.len() > SYMLINK_MAX {
                    return Err(FsError::NameTooLong);
                }
                let tail = comps[i + 1..].join("/");
                let rewritten = if path::is_absolute(&target) {
                    path::join(&target, &tail)
                } else {
                    path::join(&path::join(&consumed, &target), &tail)
                };
                return self.resolve_inner(&rewritten, follow_final, depth + 1);
            }

            consumed = path::join(&consumed, comp);
            current = next;
        }

        Ok(current)
    }

    /// Resolves the parent directory of `p` and returns it with the
    /// final component name.
    pub fn resolve_parent(&self, p: &str) -> Result<(VnodeRef, String), FsError> {
        path::check_lengths(p)?;
        let (parent, name) = path::split_parent(p)?;
        let dir = self.resolve_inner(parent, true, 0)?;
        if dir.attr().kind != VnodeType::Directory {
            return Err(FsError::NotADirectory);
        }
        Ok((dir, String::from(name)))
    }

    // -----------------------------------------------------------------
    // Namespace operations
    // -----------------------------------------------------------------

    /// Opens (and possibly creates) the file at `p`.
    pub fn open(
        &mut self,
        p: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<Arc<OpenFile>, FsError> {
        path::check_lengths(p)?;
        let vnode = match self.resolve_inner(p, true, 0) {
            Ok(found) => {
                if flags.contains(O_CREAT) && flags.contains(O_EXCL) {
                    return Err(FsError::AlreadyExists);
                }
                found
            }
            Err(FsError::NotFound) if flags.contains(O_CREAT) => {
                let (dir, name) = self.resolve_parent(p)?;
                dir.create(&name, mode)?
            }
            Err(e) => return Err(e),
        };

        check_open_mode(vnode.attr().kind, flags)?;
        if flags.contains(O_TRUNC) && flags.writable() {
            vnode.truncate(0)?;
        }
        Ok(OpenFile::with_path(vnode, flags, p))
    }

    /// Creates a directory.
    pub fn mkdir(&mut self, p: &str, mode: u32) -> Result<(), FsError> {
        let (dir, name) = self.resolve_parent(p)?;
        dir.mkdir(&name, mode)?;
        Ok(())
    }

    /// Removes an empty directory.
    pub fn rmdir(&mut self, p: &str) -> Result<(), FsError> {
        let (dir, name) = self.resolve_parent(p)?;
        dir.rmdir(&name)?;
        self.invalidate(p);
        Ok(())
    }

    /// Removes a non-directory name.
    pub fn unlink(&mut self, p: &str) -> Result<(), FsError> {
        let (dir, name) = self.resolve_parent(p)?;
        dir.unlink(&name)?;
        self.invalidate(p);
        Ok(())
    }

    /// Creates a symlink at `p` pointing to `target`.
    pub fn symlink(&mut self, target: &str, p: &str) -> Result<(), FsError> {
        if target.len() > SYMLINK_MAX {
            return Err(FsError::NameTooLong);
        }
        let (dir, name) = self.resolve_parent(p)?;
        dir.symlink(&name, target)?;
        Ok(())
    }

    /// Reads the target of the symlink at `p`.
    pub fn readlink(&self, p: &str) -> Result<String, FsError> {
        let vnode = self.resolve_nofollow(p)?;
        if vnode.attr().kind != VnodeType::Symlink {
            return Err(FsError::InvalidArgument);
        }
        vnode.readlink()
    }

    /// Creates a hard link `new` to the file at `old`.
    pub fn link(&mut self, old: &str, new: &str) -> Result<(), FsError> {
        let target = self.resolve_inner(old, true, 0)?;
        let (dir, name) = self.resolve_parent(new)?;
        dir.link(&name, &target)?;
        Ok(())
    }

    /// Renames `old` to `new` (same filesystem only).
    pub fn rename(&mut self, old: &str, new: &str) -> Result<(), FsError> {
        let (old_dir, old_name) = self.resolve_parent(old)?;
        let (new_dir, new_name) = self.resolve_parent(new)?;
        old_dir.rename(&old_name, &new_dir, &new_name)?;
        self.invalidate(old);
        self.invalidate(new);
        Ok(())
    }

    /// Creates a device node.
    pub fn mknod(&mut self, p: &str, mode: u32, rdev: u64) -> Result<(), FsError> {
        let (dir, name) = self.resolve_parent(p)?;
        dir.mknod(&name, mode, rdev)?;
        Ok(())
    }

    /// Attributes of `p`, following symlinks.
    pub fn stat(&self, p: &str) -> Result<VnodeAttr, FsError> {
        Ok(self.resolve(p)?.attr())
    }

    /// Attributes of `p` itself (symlinks not followed).
    pub fn lstat(&self, p: &str) -> Result<VnodeAttr, FsError> {
        Ok(self.resolve_nofollow(p)?.attr())
    }

    /// Truncates the file at `p`.
    pub fn truncate(&mut self, p: &str, size: u64) -> Result<(), FsError> {
        let vnode = self.resolve(p)?;
        if vnode.attr().kind == VnodeType::Directory {
            return Err(FsError::IsADirectory);
        }
        vnode.truncate(size)
    }

    /// Checks accessibility of `p` against the owner permission class.
    pub fn access(&self, p: &str, amode: u32) -> Result<(), FsError> {
        let attr = self.resolve(p)?.attr();
        if amode == F_OK {
            return Ok(());
        }
        let owner_bits = (attr.mode >> 6) & 0o7;
        if owner_bits & amode == amode {
            Ok(())
        } else {
            Err(FsError::PermissionDenied)
        }
    }

    /// Changes permission bits.
    pub fn chmod(&mut self, p: &str, mode: u32) -> Result<(), FsError> {
        self.resolve(p)?.setattr(SetAttr {
            mode: Some(mode),
            ..Default::default()
        })
    }

    /// Changes ownership.
    pub fn chown(&mut self, p: &str, uid: u32, gid: u32) -> Result<(), FsError> {
        self.resolve(p)?.setattr(SetAttr {
            uid: Some(uid),
            gid: Some(gid),
            ..Default::default()
        })
    }

    /// Drops `p` and everything below it from the name cache.
    fn invalidate(&mut self, p: &str) {
        self.dentries.retain(|cached, _| {
            !(cached == p
                || (cached.starts_with(p) && cached.as_bytes().get(p.len()) == Some(&b'/')))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{O_RDONLY, O_RDWR, O_WRONLY, SeekFrom};
    use crate::tmpfs::TmpfsType;

    fn vfs_with_root() -> Vfs {
        let mut vfs = Vfs::new();
        vfs.register_filesystem(Arc::new(TmpfsType)).unwrap();
        vfs.mount(None, "/", "tmpfs", MountFlags::empty(), None)
            .unwrap();
        vfs
    }

    fn flags(raw: u32) -> OpenFlags {
        OpenFlags::from_raw(raw)
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut vfs = Vfs::new();
        vfs.register_filesystem(Arc::new(TmpfsType)).unwrap();
        assert_eq!(
            vfs.register_filesystem(Arc::new(TmpfsType)).err(),
            Some(FsError::AlreadyExists)
        );
    }

    #[test]
    fn first_mount_must_be_root() {
        let mut vfs = Vfs::new();
        vfs.register_filesystem(Arc::new(TmpfsType)).unwrap();
        assert_eq!(
            vfs.mount(None, "/mnt", "tmpfs", MountFlags::empty(), None)
                .err(),
            Some(FsError::InvalidArgument)
        );
        vfs.mount(None, "/", "tmpfs", MountFlags::empty(), None)
            .unwrap();
    }

    #[test]
    fn unknown_fstype_not_found() {
        let mut vfs = Vfs::new();
        assert_eq!(
            vfs.mount(None, "/", "xfs", MountFlags::empty(), None).err(),
            Some(FsError::NotFound)
        );
    }

    #[test]
    fn root_resolves_to_mount_root() {
        let vfs = vfs_with_root();
        let root = vfs.resolve("/").unwrap();
        assert!(root.attr().is_mount_root);
        assert_eq!(root.attr().kind, VnodeType::Directory);
    }

    #[test]
    fn tmpfs_lifecycle_end_to_end() {
        let mut vfs = vfs_with_root();

        vfs.mkdir("/a", 0o755).unwrap();

        let fd = vfs
            .open("/a/x", flags(O_CREAT | O_WRONLY), 0o644)
            .unwrap();
        assert_eq!(fd.write(b"hello").unwrap(), 5);
        drop(fd);

        let fd2 = vfs.open("/a/x", flags(O_RDONLY), 0).unwrap();
        assert_eq!(fd2.seek(SeekFrom::End(0)).unwrap(), 5);
        assert_eq!(fd2.seek(SeekFrom::Set(0)).unwrap(), 0);
        let mut buf = [0u8; 10];
        assert_eq!(fd2.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        drop(fd2);

        vfs.unlink("/a/x").unwrap();
        assert_eq!(
            vfs.open("/a/x", flags(O_RDONLY), 0).err(),
            Some(FsError::NotFound)
        );
        vfs.rmdir("/a").unwrap();
        assert_eq!(vfs.stat("/a").err(), Some(FsError::NotFound));
    }

    #[test]
    fn excl_create_fails_second_time() {
        let mut vfs = vfs_with_root();
        vfs.open("/f", flags(O_CREAT | O_EXCL | O_WRONLY), 0o644)
            .unwrap();
        assert_eq!(
            vfs.open("/f", flags(O_CREAT | O_EXCL | O_WRONLY), 0o644)
                .err(),
            Some(FsError::AlreadyExists)
        );
    }

    #[test]
    fn write_read_round_trip_via_reopen() {
        let mut vfs = vfs_with_root();
        let w = vfs.open("/data", flags(O_CREAT | O_RDWR), 0o644).unwrap();
        w.write(b"abc123").unwrap();
        w.seek(SeekFrom::Set(0)).unwrap();
        let mut buf = [0u8; 6];
        w.read(&mut buf).unwrap();
        assert_eq!(&buf, b"abc123");
    }

    #[test]
    fn trunc_on_open_clears_file() {
        let mut vfs = vfs_with_root();
        let w = vfs.open("/f", flags(O_CREAT | O_WRONLY), 0o644).unwrap();
        w.write(b"old contents").unwrap();
        drop(w);

        let t = vfs.open("/f", flags(O_WRONLY | O_TRUNC), 0).unwrap();
        drop(t);
        assert_eq!(vfs.stat("/f").unwrap().size, 0);
    }

    #[test]
    fn symlink_scenario() {
        let mut vfs = vfs_with_root();

        let f = vfs
            .open("/target", flags(O_CREAT | O_WRONLY), 0o644)
            .unwrap();
        f.write(b"abc").unwrap();
        drop(f);

        vfs.symlink("/target", "/link").unwrap();
        assert_eq!(vfs.readlink("/link").unwrap(), "/target");

        let fd = vfs.open("/link", flags(O_RDONLY), 0).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(fd.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"abc");

        assert_eq!(vfs.lstat("/link").unwrap().kind, VnodeType::Symlink);
        assert_eq!(vfs.stat("/link").unwrap().kind, VnodeType::Regular);
        // Resolving through the link lands on the same vnode.
        assert_eq!(
            vfs.stat("/link").unwrap().ino,
            vfs.stat("/target").unwrap().ino
        );
    }

    #[test]
    fn symlink_through_directories() {
        let mut vfs = vfs_with_root();
        vfs.mkdir("/real", 0o755).unwrap();
        let f = vfs
            .open("/real/file", flags(O_CREAT | O_WRONLY), 0o644)
            .unwrap();
        f.write(b"deep").unwrap();
        drop(f);

        // Absolute and relative intermediate links.
        vfs.symlink("/real", "/abs").unwrap();
        vfs.symlink("real", "/rel").unwrap();

        assert_eq!(vfs.stat("/abs/file").unwrap().size, 4);
        assert_eq!(vfs.stat("/rel/file").unwrap().size, 4);
    }

    #[test]
    fn symlink_loop_detected() {
        let mut vfs = vfs_with_root();
        vfs.symlink("/b", "/a").unwrap();
        vfs.symlink("/a", "/b").unwrap();
        assert_eq!(vfs.stat("/a").err(), Some(FsError::Loop));
    }

    #[test]
    fn dangling_symlink_not_found() {
        let mut vfs = vfs_with_root();
        vfs.symlink("/nowhere", "/l").unwrap();
        assert_eq!(vfs.stat("/l").err(), Some(FsError::NotFound));
        // But lstat still sees the link itself.
        assert_eq!(vfs.lstat("/l").unwrap().kind, VnodeType::Symlink);
    }

    #[test]
    fn hard_link_via_paths() {
        let mut vfs = vfs_with_root();
        let f = vfs.open("/f", flags(O_CREAT | O_WRONLY), 0o644).unwrap();
        f.write(b"x").unwrap();
        drop(f);

        vfs.link("/f", "/g").unwrap();
        assert_eq!(vfs.stat("/g").unwrap().nlink, 2);
        vfs.unlink("/f").unwrap();
        assert_eq!(vfs.stat("/g").unwrap().nlink, 1);
    }

    #[test]
    fn rename_via_paths() {
        let mut vfs = vfs_with_root();
        vfs.mkdir("/d", 0o755).unwrap();
        let f = vfs.open("/f", flags(O_CREAT | O_WRONLY), 0o644).unwrap();
        f.write(b"moved").unwrap();
        drop(f);

        vfs.rename("/f", "/d/f2").unwrap();
        assert_eq!(vfs.stat("/f").err(), Some(FsError::NotFound));
        assert_eq!(vfs.stat("/d/f2").unwrap().size, 5);
    }

    #[test]
    fn nested_mounts_resolve_longest_prefix() {
        let mut vfs = vfs_with_root();
        vfs.mkdir("/mnt", 0o755).unwrap();
        vfs.mount(None, "/mnt", "tmpfs", MountFlags::empty(), None)
            .unwrap();

        // A file in the outer fs under /mnt is shadowed by the mount.
        let f = vfs
            .open("/mnt/inner", flags(O_CREAT | O_WRONLY), 0o644)
            .unwrap();
        drop(f);
        let inner_dev = vfs.stat("/mnt/inner").unwrap().dev;
        let root_dev = vfs.stat("/").unwrap().dev;
        assert_ne!(inner_dev, root_dev);

        // Unmount frees the name again.
        vfs.unmount("/mnt").unwrap();
        assert_eq!(vfs.stat("/mnt/inner").err(), Some(FsError::NotFound));
    }

    #[test]
    fn mount_point_must_exist_and_be_dir() {
        let mut vfs = vfs_with_root();
        assert_eq!(
            vfs.mount(None, "/missing", "tmpfs", MountFlags::empty(), None)
                .err(),
            Some(FsError::NotFound)
        );
        let f = vfs.open("/file", flags(O_CREAT | O_WRONLY), 0o644).unwrap();
        drop(f);
        assert_eq!(
            vfs.mount(None, "/file", "tmpfs", MountFlags::empty(), None)
                .err(),
            Some(FsError::NotADirectory)
        );
    }

    #[test]
    fn root_mount_cannot_be_unmounted() {
        let mut vfs = vfs_with_root();
        assert_eq!(vfs.unmount("/").err(), Some(FsError::Busy));
    }

    #[test]
    fn readdir_enumerates_each_entry_once() {
        let mut vfs = vfs_with_root();
        for name in ["a", "b", "c"] {
            let p = alloc::format!("/{name}");
            drop(vfs.open(&p, flags(O_CREAT | O_WRONLY), 0o644).unwrap());
        }
        let root = vfs.resolve("/").unwrap();
        let mut seen: Vec<String> =
            root.readdir().unwrap().into_iter().map(|e| e.name).collect();
        seen.sort();
        assert_eq!(seen, ["a", "b", "c"]);
    }

    #[test]
    fn access_checks_owner_bits() {
        let mut vfs = vfs_with_root();
        drop(vfs.open("/f", flags(O_CREAT | O_WRONLY), 0o600).unwrap());

        vfs.access("/f", F_OK).unwrap();
        vfs.access("/f", R_OK | W_OK).unwrap();
        assert_eq!(vfs.access("/f", X_OK).err(), Some(FsError::PermissionDenied));

        vfs.chmod("/f", 0o100).unwrap();
        vfs.access("/f", X_OK).unwrap();
        assert_eq!(vfs.access("/f", R_OK).err(), Some(FsError::PermissionDenied));
    }

    #[test]
    fn chown_updates_attr() {
        let mut vfs = vfs_with_root();
        drop(vfs.open("/f", flags(O_CREAT | O_WRONLY), 0o644).unwrap());
        vfs.chown("/f", 1000, 100).unwrap();
        let attr = vfs.stat("/f").unwrap();
        assert_eq!((attr.uid, attr.gid), (1000, 100));
    }

    #[test]
    fn dentry_cache_serves_and_invalidates() {
        let mut vfs = vfs_with_root();
        drop(vfs.open("/dir", flags(O_CREAT | O_WRONLY), 0o644).unwrap());
        vfs.unlink("/dir").unwrap();

        vfs.mkdir("/dir", 0o755).unwrap();
        drop(
            vfs.open("/dir/f", flags(O_CREAT | O_WRONLY), 0o644)
                .unwrap(),
        );

        let first = vfs.resolve_cached("/dir/f").unwrap();
        let second = vfs.resolve_cached("/dir/f").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        vfs.unlink("/dir/f").unwrap();
        assert_eq!(vfs.resolve_cached("/dir/f").err(), Some(FsError::NotFound));
    }

    #[test]
    fn path_too_long_rejected() {
        let vfs = vfs_with_root();
        let long = alloc::format!("/{}", "a".repeat(300));
        assert_eq!(vfs.stat(&long).err(), Some(FsError::NameTooLong));
    }
}
