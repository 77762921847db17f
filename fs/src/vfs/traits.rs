//! The inode contract every filesystem implements.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use cinder_abi::fs::{FileKind, MAX_NAME_LEN};
use cinder_lib::IrqMutex;

use crate::blockdev::DevId;
use crate::error::{VfsError, VfsResult};

/// Inode number within one filesystem.
pub type InodeNum = u32;

/// Metadata of one inode.
#[derive(Clone, Copy, Debug)]
pub struct InodeStat {
    pub ino: InodeNum,
    pub kind: FileKind,
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: u32,
    pub nlink: u16,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    /// Device id for device-node inodes.
    pub rdev: u32,
}

impl InodeStat {
    pub fn empty(ino: InodeNum, kind: FileKind) -> Self {
        Self {
            ino,
            kind,
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            nlink: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            rdev: 0,
        }
    }
}

/// One directory entry, as the `getdent` stream reports it.
#[derive(Clone, Copy)]
pub struct DirEntryInfo {
    pub ino: InodeNum,
    pub kind: FileKind,
    pub name_len: u8,
    pub name: [u8; MAX_NAME_LEN],
}

impl DirEntryInfo {
    pub fn new(ino: InodeNum, kind: FileKind, name: &[u8]) -> Self {
        let mut entry = Self {
            ino,
            kind,
            name_len: name.len().min(MAX_NAME_LEN) as u8,
            name: [0; MAX_NAME_LEN],
        };
        entry.name[..entry.name_len as usize].copy_from_slice(&name[..entry.name_len as usize]);
        entry
    }

    pub fn name(&self) -> &[u8] {
        &self.name[..self.name_len as usize]
    }
}

/// A mounted filesystem instance. Operations are inode-based; pathnames
/// never reach a driver.
pub trait FileSystem: Send + Sync {
    fn fs_name(&self) -> &'static str;

    /// Block device this instance lives on (0 for virtual filesystems).
    fn dev(&self) -> DevId;

    fn root_ino(&self) -> InodeNum;

    fn read_only(&self) -> bool {
        false
    }

    fn stat(&self, ino: InodeNum) -> VfsResult<InodeStat>;

    /// Resolve `name` in directory `dir`.
    fn lookup(&self, dir: InodeNum, name: &[u8]) -> VfsResult<InodeNum>;

    /// Create a regular file or directory entry named `name` in `dir`.
    fn create(&self, dir: InodeNum, name: &[u8], kind: FileKind, mode: u16) -> VfsResult<InodeNum>;

    /// Add a hard link `name` in `dir` to an existing inode.
    fn link(&self, dir: InodeNum, name: &[u8], ino: InodeNum) -> VfsResult<()>;

    /// Remove the entry `name` from `dir`. Removing a non-empty directory
    /// fails with `NotEmpty`.
    fn unlink(&self, dir: InodeNum, name: &[u8]) -> VfsResult<()>;

    /// Move `old_name` in `old_dir` to `new_name` in `new_dir` (same
    /// filesystem; the VFS has already rejected cross-device requests).
    fn rename(
        &self,
        old_dir: InodeNum,
        old_name: &[u8],
        new_dir: InodeNum,
        new_name: &[u8],
    ) -> VfsResult<()>;

    fn read(&self, ino: InodeNum, offset: u32, buf: &mut [u8]) -> VfsResult<usize>;

    fn write(&self, ino: InodeNum, offset: u32, buf: &[u8]) -> VfsResult<usize>;

    fn truncate(&self, ino: InodeNum, size: u32) -> VfsResult<()>;

    /// One entry of the directory stream at cursor `pos`; `None` at the
    /// end. The cursor is stable across interleaved calls.
    fn readdir(&self, ino: InodeNum, pos: usize) -> VfsResult<Option<(DirEntryInfo, usize)>>;

    fn set_mode(&self, ino: InodeNum, mode: u16) -> VfsResult<()> {
        let _ = (ino, mode);
        Err(VfsError::NotSupported)
    }

    fn set_times(&self, ino: InodeNum, atime: u32, mtime: u32) -> VfsResult<()> {
        let _ = (ino, atime, mtime);
        Err(VfsError::NotSupported)
    }

    /// Last in-memory reference to `ino` is gone; reclaim its storage if
    /// its link count is zero.
    fn release(&self, ino: InodeNum) -> VfsResult<()> {
        let _ = ino;
        Ok(())
    }

    /// Flush metadata and data to the backing store.
    fn sync(&self) -> VfsResult<()> {
        Ok(())
    }
}

// =============================================================================
// Filesystem driver registry (for mount-by-name)
// =============================================================================

pub type FsProbeFn = fn(DevId) -> VfsResult<Arc<dyn FileSystem>>;

static DRIVERS: IrqMutex<BTreeMap<&'static str, FsProbeFn>> = IrqMutex::new(BTreeMap::new());

/// Register a filesystem driver under its name ("ext2", "fat16").
pub fn register_fs_driver(name: &'static str, probe: FsProbeFn) {
    DRIVERS.lock().insert(name, probe);
}

/// Instantiate a registered driver on a device.
pub fn probe_fs(name: &[u8], dev: DevId) -> VfsResult<Arc<dyn FileSystem>> {
    let drivers = DRIVERS.lock();
    for (driver_name, probe) in drivers.iter() {
        if driver_name.as_bytes() == name {
            let probe = *probe;
            drop(drivers);
            return probe(dev);
        }
    }
    Err(VfsError::NotSupported)
}
