//! The mount table.
//!
//! Each mount records the filesystem instance, its root vnode, and the
//! covered vnode it hides (none for the root mount). Mount points are
//! marked on the covered vnode itself so path resolution can cross them
//! without consulting the table; the table is what unmount and `..`-at-
//! mount-root traversal need.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use cinder_lib::{IrqMutex, klog_info};

use crate::blockdev::DevId;
use crate::buffer_cache;
use crate::error::{VfsError, VfsResult};

use super::traits::{FileSystem, probe_fs};
use super::vnode::{self, VnodeRef, vnode_get, vnode_put};

struct Mount {
    fs: Arc<dyn FileSystem>,
    root: VnodeRef,
    /// The directory this mount covers; `None` for the root mount.
    covered: Option<VnodeRef>,
}

static MOUNTS: IrqMutex<Vec<Mount>> = IrqMutex::new(Vec::new());

/// Install the root filesystem. Must be the first mount.
pub fn mount_root(fs: Arc<dyn FileSystem>) -> VfsResult<VnodeRef> {
    if !MOUNTS.lock().is_empty() {
        return Err(VfsError::Busy);
    }
    // The root lookup may hit the device; the table lock stays dropped
    // until the vnode is in hand (root mounting is single-threaded boot
    // anyway).
    let root = vnode_get(&fs, fs.root_ino())?;
    let mut mounts = MOUNTS.lock();
    if !mounts.is_empty() {
        vnode_put(root);
        return Err(VfsError::Busy);
    }
    // The table keeps its own counted reference; the caller gets the one
    // taken above.
    mounts.push(Mount {
        fs: fs.clone(),
        root: vnode::vnode_ref(&root),
        covered: None,
    });
    drop(mounts);
    klog_info!("vfs: mounted {} as /", fs.fs_name());
    Ok(root)
}

/// The root vnode of the root mount.
pub fn root_vnode() -> VfsResult<VnodeRef> {
    let mounts = MOUNTS.lock();
    match mounts.first() {
        Some(m) => Ok(super::vnode::vnode_ref(&m.root)),
        None => Err(VfsError::NotFound),
    }
}

/// Mount the named filesystem from `dev` over the directory vnode `point`.
///
/// Rejected while anything below the point is open: the covered directory
/// must have no references besides the caller's and the resolver's.
pub fn do_mount(point: VnodeRef, dev: DevId, fs_name: &[u8]) -> VfsResult<()> {
    if point.kind != cinder_abi::fs::FileKind::Directory {
        vnode_put(point);
        return Err(VfsError::NotDirectory);
    }
    if point.is_mount_point() {
        vnode_put(point);
        return Err(VfsError::Busy);
    }
    // The caller's resolution holds the only expected reference; more
    // means open files or cwds at (or resolved through) the point.
    if point.refcount() > 1 {
        vnode_put(point);
        return Err(VfsError::Busy);
    }

    let fs = probe_fs(fs_name, dev)?;
    let root = vnode_get(&fs, fs.root_ino())?;

    point.set_mounted_dev(Some(fs.dev()));
    let mut mounts = MOUNTS.lock();
    klog_info!("vfs: mounted {} (dev {})", fs.fs_name(), dev);
    mounts.push(Mount {
        fs,
        root,
        covered: Some(point), // the mount keeps the covered vnode's ref
    });
    Ok(())
}

/// Unmount the filesystem whose root is mounted at the directory `point`
/// covers. Rejected while any file on it is open or any cwd is inside it.
pub fn do_unmount(point: VnodeRef) -> VfsResult<()> {
    // Path resolution crosses mounts, so the caller's vnode is usually the
    // mounted root itself; accept the covered directory too.
    let key = (point.dev, point.ino);
    vnode_put(point);

    let mut mounts = MOUNTS.lock();
    let index = mounts
        .iter()
        .position(|m| {
            (m.root.dev, m.root.ino) == key
                || m.covered.as_ref().is_some_and(|c| (c.dev, c.ino) == key)
        })
        .ok_or(VfsError::Invalid)?;

    let fs_dev = mounts[index].fs.dev();
    // Busy check: the mount's own root reference is the only one allowed.
    if vnode::device_busy(fs_dev, Some(mounts[index].root.ino)) {
        return Err(VfsError::Busy);
    }
    if mounts[index].root.refcount() > 1 {
        return Err(VfsError::Busy);
    }

    let mount = mounts.remove(index);
    drop(mounts);

    mount.fs.sync()?;
    buffer_cache::invalidate_device(fs_dev)?;
    if let Some(covered) = mount.covered {
        covered.set_mounted_dev(None);
        vnode_put(covered);
    }
    vnode_put(mount.root);
    klog_info!("vfs: unmounted dev {}", fs_dev);
    Ok(())
}

/// The root vnode of the filesystem mounted at `covered`, if any.
pub fn mounted_root(covered: &VnodeRef) -> Option<VnodeRef> {
    let mounts = MOUNTS.lock();
    mounts
        .iter()
        .find(|m| {
            m.covered
                .as_ref()
                .is_some_and(|c| (c.dev, c.ino) == (covered.dev, covered.ino))
        })
        .map(|m| super::vnode::vnode_ref(&m.root))
}

/// The covered vnode of the mount whose root is `root`, for `..` escapes.
pub fn covered_vnode(root: &VnodeRef) -> Option<VnodeRef> {
    let mounts = MOUNTS.lock();
    mounts
        .iter()
        .find(|m| (m.root.dev, m.root.ino) == (root.dev, root.ino))
        .and_then(|m| m.covered.as_ref().map(super::vnode::vnode_ref))
}

/// `true` if `vnode` is the root of some mount.
pub fn is_mount_root(vnode: &VnodeRef) -> bool {
    let mounts = MOUNTS.lock();
    mounts
        .iter()
        .any(|m| (m.root.dev, m.root.ino) == (vnode.dev, vnode.ino))
}

/// Tear down every mount (shutdown path); leaks busy filesystems rather
/// than corrupting them.
pub fn unmount_all() {
    let mut mounts = MOUNTS.lock();
    while let Some(mount) = mounts.pop() {
        let _ = mount.fs.sync();
        let _ = buffer_cache::sync_device(mount.fs.dev());
        if let Some(covered) = mount.covered {
            covered.set_mounted_dev(None);
            vnode_put(covered);
        }
        vnode_put(mount.root);
    }
}
