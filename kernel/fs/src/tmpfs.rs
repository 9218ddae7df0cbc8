//! In-memory reference filesystem.
//!
//! All data lives on the kernel heap. Files keep their bytes in a
//! growable buffer (capacity at least doubles on growth), directories
//! hold a name-ordered child map, symlinks store their target as the
//! node's data. Link counts are maintained per node; a node's storage
//! is returned when the last hard link and the last open reference are
//! gone. A filesystem-wide byte limit (64 MiB by default) bounds
//! memory use.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::any::Any;
use core::sync::atomic::{AtomicU64, Ordering};

use quark_core::sync::SpinLock;

use crate::vfs::MountFlags;
use crate::{
    DirEntry, FileSystem, FilesystemType, FsError, SetAttr, StatFs, Vnode, VnodeAttr, VnodeRef,
    VnodeType, clock,
};

/// Default capacity limit per tmpfs instance: 64 MiB.
pub const DEFAULT_LIMIT: u64 = 64 * 1024 * 1024;

/// Next device id handed to a tmpfs instance.
static NEXT_DEV: AtomicU64 = AtomicU64::new(1);

/// The registry record for `tmpfs`.
pub struct TmpfsType;

impl FilesystemType for TmpfsType {
    fn name(&self) -> &'static str {
        "tmpfs"
    }

    fn mount(
        &self,
        _device: Option<&str>,
        _flags: MountFlags,
        _data: Option<&str>,
    ) -> Result<Arc<dyn FileSystem>, FsError> {
        Ok(Arc::new(TmpFs::new(DEFAULT_LIMIT)))
    }
}

/// State shared by every node of one tmpfs instance.
struct TmpfsShared {
    dev: u64,
    next_ino: AtomicU64,
    used_bytes: AtomicU64,
    limit: u64,
}

impl TmpfsShared {
    fn alloc_ino(&self) -> u64 {
        self.next_ino.fetch_add(1, Ordering::Relaxed)
    }

    /// Accounts `grow` more bytes, failing when the limit is reached.
    fn charge(&self, grow: u64) -> Result<(), FsError> {
        let mut used = self.used_bytes.load(Ordering::Relaxed);
        loop {
            if used + grow > self.limit {
                return Err(FsError::NoSpace);
            }
            match self.used_bytes.compare_exchange_weak(
                used,
                used + grow,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => used = actual,
            }
        }
    }

    fn refund(&self, shrink: u64) {
        self.used_bytes.fetch_sub(shrink, Ordering::Relaxed);
    }
}

/// A tmpfs filesystem instance.
pub struct TmpFs {
    shared: Arc<TmpfsShared>,
    root: Arc<TmpNode>,
}

impl TmpFs {
    /// Creates an instance with the given byte limit.
    pub fn new(limit: u64) -> Self {
        let shared = Arc::new(TmpfsShared {
            dev: NEXT_DEV.fetch_add(1, Ordering::Relaxed),
            next_ino: AtomicU64::new(2),
            used_bytes: AtomicU64::new(0),
            limit,
        });
        let root = TmpNode::new(&shared, 1, VnodeType::Directory, 0o755, 0, true);
        Self { shared, root }
    }

    /// Bytes currently accounted against the limit.
    pub fn used_bytes(&self) -> u64 {
        self.shared.used_bytes.load(Ordering::Relaxed)
    }
}

impl FileSystem for TmpFs {
    fn name(&self) -> &'static str {
        "tmpfs"
    }

    fn root(&self) -> VnodeRef {
        self.root.clone()
    }

    fn statfs(&self) -> Result<StatFs, FsError> {
        let used = self.used_bytes();
        Ok(StatFs {
            block_size: 4096,
            total_blocks: self.shared.limit / 4096,
            free_blocks: (self.shared.limit - used) / 4096,
            total_inodes: u64::MAX,
            free_inodes: u64::MAX,
        })
    }
}

/// Mutable metadata of a node.
struct Meta {
    mode: u32,
    uid: u32,
    gid: u32,
    nlink: u32,
    atime: u64,
    mtime: u64,
    ctime: u64,
}

/// One tmpfs node: file, directory, symlink, or device.
pub struct TmpNode {
    shared: Arc<TmpfsShared>,
    myself: Weak<TmpNode>,
    ino: u64,
    kind: VnodeType,
    is_root: bool,
    rdev: u64,
    /// File bytes, or the symlink target.
    data: SpinLock<Vec<u8>>,
    /// Directory children.
    children: SpinLock<BTreeMap<String, Arc<TmpNode>>>,
    meta: SpinLock<Meta>,
}

impl TmpNode {
    fn new(
        shared: &Arc<TmpfsShared>,
        ino: u64,
        kind: VnodeType,
        mode: u32,
        rdev: u64,
        is_root: bool,
    ) -> Arc<Self> {
        let now = clock::now();
        let nlink = if kind == VnodeType::Directory { 2 } else { 1 };
        Arc::new_cyclic(|myself| Self {
            shared: shared.clone(),
            myself: myself.clone(),
            ino,
            kind,
            is_root,
            rdev,
            data: SpinLock::new(Vec::new()),
            children: SpinLock::new(BTreeMap::new()),
            meta: SpinLock::new(Meta {
                mode,
                uid: 0,
                gid: 0,
                nlink,
                atime: now,
                mtime: now,
                ctime: now,
            }),
        })
    }

    fn new_child(&self, kind: VnodeType, mode: u32, rdev: u64) -> Arc<Self> {
        Self::new(&self.shared, self.shared.alloc_ino(), kind, mode, rdev, false)
    }

    fn require_dir(&self) -> Result<(), FsError> {
        if self.kind != VnodeType::Directory {
            return Err(FsError::NotADirectory);
        }
        Ok(())
    }

    /// Inserts a freshly created child, failing on name collisions.
    fn attach(&self, name: &str, child: Arc<TmpNode>) -> Result<VnodeRef, FsError> {
        self.require_dir()?;
        let mut children = self.children.lock();
        if children.contains_key(name) {
            return Err(FsError::AlreadyExists);
        }
        if child.kind == VnodeType::Directory {
            self.meta.lock().nlink += 1;
        }
        children.insert(name.to_string(), child.clone());
        self.touch_mtime();
        Ok(child)
    }

    fn touch_mtime(&self) {
        let now = clock::now();
        let mut meta = self.meta.lock();
        meta.mtime = now;
        meta.ctime = now;
    }

    /// Grows the data buffer to hold `needed` bytes, doubling capacity.
    fn grow_data(&self, data: &mut Vec<u8>, needed: usize) -> Result<(), FsError> {
        if needed <= data.len() {
            return Ok(());
        }
        let grow = (needed - data.len()) as u64;
        self.shared.charge(grow)?;
        if needed > data.capacity() {
            let target = needed.max(data.capacity() * 2);
            data.reserve(target - data.len());
        }
        data.resize(needed, 0);
        Ok(())
    }
}

impl Drop for TmpNode {
    fn drop(&mut self) {
        // Give the file bytes back to the instance accounting.
        let len = self.data.lock().len() as u64;
        if len > 0 {
            self.shared.refund(len);
        }
    }
}

impl Vnode for TmpNode {
    fn attr(&self) -> VnodeAttr {
        let meta = self.meta.lock();
        let size = match self.kind {
            VnodeType::Regular | VnodeType::Symlink => self.data.lock().len() as u64,
            _ => 0,
        };
        VnodeAttr {
            ino: self.ino,
            dev: self.shared.dev,
            kind: self.kind,
            mode: meta.mode,
            uid: meta.uid,
            gid: meta.gid,
            size,
            nlink: meta.nlink,
            rdev: self.rdev,
            atime: meta.atime,
            mtime: meta.mtime,
            ctime: meta.ctime,
            is_mount_root: self.is_root,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        match self.kind {
            VnodeType::Regular => {}
            VnodeType::Directory => return Err(FsError::IsADirectory),
            _ => return Err(FsError::Unsupported),
        }
        let data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<usize, FsError> {
        match self.kind {
            VnodeType::Regular => {}
            VnodeType::Directory => return Err(FsError::IsADirectory),
            _ => return Err(FsError::Unsupported),
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let end = (offset as usize)
            .checked_add(buf.len())
            .ok_or(FsError::InvalidArgument)?;
        let mut data = self.data.lock();
        self.grow_data(&mut data, end)?;
        data[offset as usize..end].copy_from_slice(buf);
        drop(data);
        self.touch_mtime();
        Ok(buf.len())
    }

    fn truncate(&self, size: u64) -> Result<(), FsError> {
        if self.kind != VnodeType::Regular {
            return Err(FsError::InvalidArgument);
        }
        let size = size as usize;
        let mut data = self.data.lock();
        if size > data.len() {
            self.grow_data(&mut data, size)?;
        } else {
            self.shared.refund((data.len() - size) as u64);
            data.truncate(size);
        }
        drop(data);
        self.touch_mtime();
        Ok(())
    }

    fn readdir(&self) -> Result<Vec<DirEntry>, FsError> {
        self.require_dir()?;
        let children = self.children.lock();
        Ok(children
            .iter()
            .map(|(name, node)| DirEntry {
                name: name.clone(),
                ino: node.ino,
                kind: node.kind,
            })
            .collect())
    }

    fn lookup(&self, name: &str) -> Result<VnodeRef, FsError> {
        self.require_dir()?;
        let children = self.children.lock();
        children
            .get(name)
            .cloned()
            .map(|n| n as VnodeRef)
            .ok_or(FsError::NotFound)
    }

    fn create(&self, name: &str, mode: u32) -> Result<VnodeRef, FsError> {
        let child = self.new_child(VnodeType::Regular, mode & 0o7777, 0);
        self.attach(name, child)
    }

    fn mkdir(&self, name: &str, mode: u32) -> Result<VnodeRef, FsError> {
        let child = self.new_child(VnodeType::Directory, mode & 0o7777, 0);
        self.attach(name, child)
    }

    fn rmdir(&self, name: &str) -> Result<(), FsError> {
        self.require_dir()?;
        let mut children = self.children.lock();
        let child = children.get(name).ok_or(FsError::NotFound)?;
        if child.kind != VnodeType::Directory {
            return Err(FsError::NotADirectory);
        }
        if !child.children.lock().is_empty() {
            return Err(FsError::NotEmpty);
        }
        let child = children.remove(name).expect("checked above");
        child.meta.lock().nlink = 0;
        drop(children);
        self.meta.lock().nlink -= 1;
        self.touch_mtime();
        drop(child);
        Ok(())
    }

    fn unlink(&self, name: &str) -> Result<(), FsError> {
        self.require_dir()?;
        let mut children = self.children.lock();
        let child = children.get(name).ok_or(FsError::NotFound)?;
        if child.kind == VnodeType::Directory {
            return Err(FsError::IsADirectory);
        }
        let child = children.remove(name).expect("checked above");
        child.meta.lock().nlink -= 1;
        drop(children);
        self.touch_mtime();
        // The node's storage goes away with its last Arc once the link
        // count and any open files are gone.
        drop(child);
        Ok(())
    }

    fn link(&self, name: &str, target: &VnodeRef) -> Result<(), FsError> {
        self.require_dir()?;
        let node = target
            .as_any()
            .downcast_ref::<TmpNode>()
            .ok_or(FsError::Unsupported)?;
        if !Arc::ptr_eq(&node.shared, &self.shared) {
            return Err(FsError::Unsupported);
        }
        if node.kind == VnodeType::Directory {
            return Err(FsError::IsADirectory);
        }
        let node = node.myself.upgrade().ok_or(FsError::NotFound)?;

        let mut children = self.children.lock();
        if children.contains_key(name) {
            return Err(FsError::AlreadyExists);
        }
        node.meta.lock().nlink += 1;
        children.insert(name.to_string(), node);
        drop(children);
        self.touch_mtime();
        Ok(())
    }

    fn symlink(&self, name: &str, target: &str) -> Result<VnodeRef, FsError> {
        let child = self.new_child(VnodeType::Symlink, 0o777, 0);
        self.shared.charge(target.len() as u64)?;
        *child.data.lock() = target.as_bytes().to_vec();
        self.attach(name, child)
    }

    fn readlink(&self) -> Result<String, FsError> {
        if self.kind != VnodeType::Symlink {
            return Err(FsError::InvalidArgument);
        }
        let data = self.data.lock();
        core::str::from_utf8(&data)
            .map(String::from)
            .map_err(|_| FsError::IoError)
    }

    fn mknod(&self, name: &str, mode: u32, rdev: u64) -> Result<VnodeRef, FsError> {
        let child = self.new_child(VnodeType::CharDevice, mode & 0o7777, rdev);
        self.attach(name, child)
    }

    fn rename(
        &self,
        name: &str,
        new_parent: &VnodeRef,
        new_name: &str,
    ) -> Result<(), FsError> {
        self.require_dir()?;
        let dst = new_parent
            .as_any()
            .downcast_ref::<TmpNode>()
            .ok_or(FsError::Unsupported)?;
        dst.require_dir()?;
        if !Arc::ptr_eq(&dst.shared, &self.shared) {
            return Err(FsError::Unsupported);
        }

        let node = {
            let mut children = self.children.lock();
            children.remove(name).ok_or(FsError::NotFound)?
        };

        let same_dir = core::ptr::eq(self, dst);
        let mut dst_children = dst.children.lock();
        if dst_children.contains_key(new_name) {
            // Put the entry back where it was.
            drop(dst_children);
            self.children.lock().insert(name.to_string(), node);
            return Err(FsError::AlreadyExists);
        }
        let is_dir = node.kind == VnodeType::Directory;
        dst_children.insert(new_name.to_string(), node);
        drop(dst_children);

        if is_dir && !same_dir {
            self.meta.lock().nlink -= 1;
            dst.meta.lock().nlink += 1;
        }
        self.touch_mtime();
        dst.touch_mtime();
        Ok(())
    }

    fn setattr(&self, attr: SetAttr) -> Result<(), FsError> {
        let mut meta = self.meta.lock();
        if let Some(mode) = attr.mode {
            meta.mode = mode & 0o7777;
        }
        if let Some(uid) = attr.uid {
            meta.uid = uid;
        }
        if let Some(gid) = attr.gid {
            meta.gid = gid;
        }
        if let Some(atime) = attr.atime {
            meta.atime = atime;
        }
        if let Some(mtime) = attr.mtime {
            meta.mtime = mtime;
        }
        meta.ctime = clock::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root_of(fs: &TmpFs) -> VnodeRef {
        fs.root()
    }

    #[test]
    fn create_write_read() {
        let fs = TmpFs::new(DEFAULT_LIMIT);
        let root = root_of(&fs);

        let file = root.create("hello.txt", 0o644).unwrap();
        assert_eq!(file.write(0, b"hello").unwrap(), 5);

        let mut buf = [0u8; 16];
        let n = file.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(file.attr().size, 5);
    }

    #[test]
    fn create_collision_rejected() {
        let fs = TmpFs::new(DEFAULT_LIMIT);
        let root = root_of(&fs);
        root.create("x", 0o644).unwrap();
        assert_eq!(root.create("x", 0o644).err(), Some(FsError::AlreadyExists));
    }

    #[test]
    fn sparse_write_zero_fills() {
        let fs = TmpFs::new(DEFAULT_LIMIT);
        let root = root_of(&fs);
        let file = root.create("f", 0o644).unwrap();

        file.write(100, b"x").unwrap();
        let mut buf = [0xFFu8; 101];
        assert_eq!(file.read(0, &mut buf).unwrap(), 101);
        assert!(buf[..100].iter().all(|&b| b == 0));
        assert_eq!(buf[100], b'x');
    }

    #[test]
    fn read_past_eof_returns_zero() {
        let fs = TmpFs::new(DEFAULT_LIMIT);
        let root = root_of(&fs);
        let file = root.create("f", 0o644).unwrap();
        file.write(0, b"abc").unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(file.read(10, &mut buf).unwrap(), 0);
    }

    #[test]
    fn truncate_shrinks_and_grows() {
        let fs = TmpFs::new(DEFAULT_LIMIT);
        let root = root_of(&fs);
        let file = root.create("f", 0o644).unwrap();
        file.write(0, b"0123456789").unwrap();

        file.truncate(4).unwrap();
        assert_eq!(file.attr().size, 4);

        file.truncate(8).unwrap();
        let mut buf = [0xFFu8; 8];
        file.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"0123\0\0\0\0");
    }

    #[test]
    fn readdir_lists_each_entry_once() {
        let fs = TmpFs::new(DEFAULT_LIMIT);
        let root = root_of(&fs);
        root.create("a", 0o644).unwrap();
        root.create("b", 0o644).unwrap();
        root.mkdir("c", 0o755).unwrap();

        let mut names: Vec<String> =
            root.readdir().unwrap().into_iter().map(|e| e.name).collect();
        names.sort();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn rmdir_requires_empty() {
        let fs = TmpFs::new(DEFAULT_LIMIT);
        let root = root_of(&fs);
        let dir = root.mkdir("d", 0o755).unwrap();
        dir.create("f", 0o644).unwrap();

        assert_eq!(root.rmdir("d").err(), Some(FsError::NotEmpty));
        dir.unlink("f").unwrap();
        root.rmdir("d").unwrap();
        assert_eq!(root.lookup("d").err(), Some(FsError::NotFound));
    }

    #[test]
    fn unlink_vs_rmdir_type_mismatch() {
        let fs = TmpFs::new(DEFAULT_LIMIT);
        let root = root_of(&fs);
        root.create("f", 0o644).unwrap();
        root.mkdir("d", 0o755).unwrap();

        assert_eq!(root.unlink("d").err(), Some(FsError::IsADirectory));
        assert_eq!(root.rmdir("f").err(), Some(FsError::NotADirectory));
    }

    #[test]
    fn hard_link_shares_data() {
        let fs = TmpFs::new(DEFAULT_LIMIT);
        let root = root_of(&fs);
        let file = root.create("orig", 0o644).unwrap();
        file.write(0, b"shared").unwrap();

        root.link("alias", &file).unwrap();
        assert_eq!(file.attr().nlink, 2);

        let alias = root.lookup("alias").unwrap();
        let mut buf = [0u8; 6];
        alias.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"shared");

        // Writes through one name are visible through the other.
        alias.write(0, b"SHARED").unwrap();
        file.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"SHARED");

        root.unlink("orig").unwrap();
        assert_eq!(alias.attr().nlink, 1);
        alias.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"SHARED");
    }

    #[test]
    fn link_to_directory_rejected() {
        let fs = TmpFs::new(DEFAULT_LIMIT);
        let root = root_of(&fs);
        let dir = root.mkdir("d", 0o755).unwrap();
        assert_eq!(root.link("d2", &dir).err(), Some(FsError::IsADirectory));
    }

    #[test]
    fn symlink_round_trip() {
        let fs = TmpFs::new(DEFAULT_LIMIT);
        let root = root_of(&fs);
        let link = root.symlink("l", "/target/path").unwrap();
        assert_eq!(link.attr().kind, VnodeType::Symlink);
        assert_eq!(link.readlink().unwrap(), "/target/path");
        assert_eq!(link.attr().size, 12);
    }

    #[test]
    fn rename_moves_between_directories() {
        let fs = TmpFs::new(DEFAULT_LIMIT);
        let root = root_of(&fs);
        let a = root.mkdir("a", 0o755).unwrap();
        let b = root.mkdir("b", 0o755).unwrap();
        let f = a.create("f", 0o644).unwrap();
        f.write(0, b"data").unwrap();

        a.rename("f", &b, "g").unwrap();
        assert_eq!(a.lookup("f").err(), Some(FsError::NotFound));
        let g = b.lookup("g").unwrap();
        let mut buf = [0u8; 4];
        g.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"data");
    }

    #[test]
    fn rename_collision_restores_source() {
        let fs = TmpFs::new(DEFAULT_LIMIT);
        let root = root_of(&fs);
        root.create("src", 0o644).unwrap();
        root.create("dst", 0o644).unwrap();

        assert_eq!(
            root.rename("src", &root_of(&fs), "dst").err(),
            Some(FsError::AlreadyExists)
        );
        // Source is still reachable.
        assert!(root.lookup("src").is_ok());
    }

    #[test]
    fn dir_nlink_accounting() {
        let fs = TmpFs::new(DEFAULT_LIMIT);
        let root = root_of(&fs);
        assert_eq!(root.attr().nlink, 2);
        root.mkdir("a", 0o755).unwrap();
        root.mkdir("b", 0o755).unwrap();
        assert_eq!(root.attr().nlink, 4);
        root.rmdir("a").unwrap();
        assert_eq!(root.attr().nlink, 3);
    }

    #[test]
    fn capacity_limit_enforced() {
        let fs = TmpFs::new(1024);
        let root = root_of(&fs);
        let file = root.create("big", 0o644).unwrap();

        assert_eq!(file.write(0, &[0u8; 512]).unwrap(), 512);
        assert_eq!(file.write(512, &[0u8; 600]).err(), Some(FsError::NoSpace));

        // Freeing space makes room again.
        file.truncate(0).unwrap();
        assert_eq!(file.write(0, &[0u8; 1000]).unwrap(), 1000);
    }

    #[test]
    fn unlink_refunds_capacity() {
        let fs = TmpFs::new(4096);
        let root = root_of(&fs);
        let file = root.create("f", 0o644).unwrap();
        file.write(0, &[1u8; 2048]).unwrap();
        assert_eq!(fs.used_bytes(), 2048);

        root.unlink("f").unwrap();
        drop(file);
        assert_eq!(fs.used_bytes(), 0);
    }

    #[test]
    fn setattr_updates_mode_and_owner() {
        let fs = TmpFs::new(DEFAULT_LIMIT);
        let root = root_of(&fs);
        let file = root.create("f", 0o644).unwrap();

        file.setattr(SetAttr {
            mode: Some(0o600),
            uid: Some(7),
            gid: Some(8),
            ..Default::default()
        })
        .unwrap();
        let attr = file.attr();
        assert_eq!(attr.mode, 0o600);
        assert_eq!(attr.uid, 7);
        assert_eq!(attr.gid, 8);
    }

    #[test]
    fn root_is_flagged() {
        let fs = TmpFs::new(DEFAULT_LIMIT);
        let root = root_of(&fs);
        assert!(root.attr().is_mount_root);
        let sub = root.mkdir("d", 0o755).unwrap();
        assert!(!sub.attr().is_mount_root);
    }
}
