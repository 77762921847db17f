//! The vnode cache.
//!
//! A vnode is the in-memory identity of an inode: exactly one exists per
//! `(dev, ino)` at any time. Vnodes are reference counted explicitly (the
//! count tracks open files, working directories, and mounts, not Rust
//! borrows); when the count drops to zero the vnode leaves the cache and
//! the filesystem gets a `release` callback to reclaim orphaned storage.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use cinder_abi::fs::FileKind;
use cinder_lib::{IrqMutex, RwSem, kernel_bug};

use crate::blockdev::DevId;
use crate::error::VfsResult;

use super::traits::{FileSystem, InodeNum};

/// Sentinel in `mounted_dev` for "nothing mounted here".
const NO_MOUNT: u32 = u32::MAX;

pub struct Vnode {
    pub fs: Arc<dyn FileSystem>,
    pub dev: DevId,
    pub ino: InodeNum,
    pub kind: FileKind,
    /// Open files, cwds, and mounts referencing this vnode.
    refcount: AtomicU32,
    /// Device id of the filesystem mounted over this directory, or
    /// `NO_MOUNT`.
    mounted_dev: AtomicU32,
    /// Serializes data access (readers share, writers exclude).
    pub data_lock: RwSem,
}

pub type VnodeRef = Arc<Vnode>;

impl Vnode {
    /// `true` if a filesystem is mounted on this directory.
    pub fn is_mount_point(&self) -> bool {
        self.mounted_dev.load(Ordering::Acquire) != NO_MOUNT
    }

    pub fn mounted_dev(&self) -> Option<DevId> {
        match self.mounted_dev.load(Ordering::Acquire) {
            NO_MOUNT => None,
            dev => Some(dev as DevId),
        }
    }

    pub(super) fn set_mounted_dev(&self, dev: Option<DevId>) {
        self.mounted_dev
            .store(dev.map_or(NO_MOUNT, |d| d as u32), Ordering::Release);
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }
}

struct VnodeCache {
    entries: BTreeMap<(DevId, InodeNum), VnodeRef>,
}

static CACHE: IrqMutex<VnodeCache> = IrqMutex::new(VnodeCache {
    entries: BTreeMap::new(),
});

/// Get the vnode for `(fs, ino)`, creating it on first use. The returned
/// reference is counted; pair with [`vnode_put`].
pub fn vnode_get(fs: &Arc<dyn FileSystem>, ino: InodeNum) -> VfsResult<VnodeRef> {
    let dev = fs.dev();
    {
        let cache = CACHE.lock();
        if let Some(vnode) = cache.entries.get(&(dev, ino)) {
            vnode.refcount.fetch_add(1, Ordering::AcqRel);
            return Ok(vnode.clone());
        }
    }

    // Stat outside the cache lock; it may hit the block cache.
    let stat = fs.stat(ino)?;
    let vnode = Arc::new(Vnode {
        fs: fs.clone(),
        dev,
        ino,
        kind: stat.kind,
        refcount: AtomicU32::new(1),
        mounted_dev: AtomicU32::new(NO_MOUNT),
        data_lock: RwSem::new(),
    });

    let mut cache = CACHE.lock();
    // A racing get may have inserted meanwhile; keep the winner.
    if let Some(existing) = cache.entries.get(&(dev, ino)) {
        existing.refcount.fetch_add(1, Ordering::AcqRel);
        return Ok(existing.clone());
    }
    cache.entries.insert((dev, ino), vnode.clone());
    Ok(vnode)
}

/// Take an additional reference (dup, cwd copy, mount).
pub fn vnode_ref(vnode: &VnodeRef) -> VnodeRef {
    vnode.refcount.fetch_add(1, Ordering::AcqRel);
    vnode.clone()
}

/// Drop one reference. At zero the vnode leaves the cache and the
/// filesystem may reclaim the inode.
pub fn vnode_put(vnode: VnodeRef) {
    let prev = vnode.refcount.fetch_sub(1, Ordering::AcqRel);
    if prev == 0 {
        kernel_bug!("vnode refcount underflow on ({}, {})", vnode.dev, vnode.ino);
    }
    if prev > 1 {
        return;
    }

    let mut cache = CACHE.lock();
    // Re-check under the lock: a concurrent get may have revived it.
    if vnode.refcount.load(Ordering::Acquire) != 0 {
        return;
    }
    cache.entries.remove(&(vnode.dev, vnode.ino));
    drop(cache);
    let _ = vnode.fs.release(vnode.ino);
}

/// `true` if any vnode of `dev` other than `exclude_ino` still has
/// references (mount/unmount busy checks).
pub fn device_busy(dev: DevId, exclude_ino: Option<InodeNum>) -> bool {
    let cache = CACHE.lock();
    cache.entries.iter().any(|(&(d, ino), vnode)| {
        d == dev && Some(ino) != exclude_ino && vnode.refcount() > 0
    })
}

/// Resident vnode count (diagnostics and tests).
pub fn cached_count() -> usize {
    CACHE.lock().entries.len()
}

/// `true` if `(dev, ino)` is resident (tests: the ref=0 ∧ nlink=0 ⇒ gone
/// invariant).
pub fn is_cached(dev: DevId, ino: InodeNum) -> bool {
    CACHE.lock().entries.contains_key(&(dev, ino))
}
