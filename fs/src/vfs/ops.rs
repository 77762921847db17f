//! High-level VFS operations over resolved paths.

use cinder_abi::fs::{FileKind, OpenFlags};

use crate::error::{VfsError, VfsResult};

use super::path::{resolve_parent, resolve_path};
use super::traits::{DirEntryInfo, InodeStat};
use super::vnode::{VnodeRef, vnode_get, vnode_put};

/// Resolve a path without side effects.
pub fn vfs_lookup(cwd: &VnodeRef, path: &[u8]) -> VfsResult<VnodeRef> {
    resolve_path(cwd, path)
}

/// Open (and possibly create/truncate) the file at `path`. Returns the
/// referenced vnode.
pub fn vfs_open(cwd: &VnodeRef, path: &[u8], flags: OpenFlags, mode: u16) -> VfsResult<VnodeRef> {
    match resolve_path(cwd, path) {
        Ok(vnode) => {
            if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) {
                vnode_put(vnode);
                return Err(VfsError::Exists);
            }
            if flags.contains(OpenFlags::DIRECTORY) && vnode.kind != FileKind::Directory {
                vnode_put(vnode);
                return Err(VfsError::NotDirectory);
            }
            if vnode.kind == FileKind::Directory && flags.writable() {
                vnode_put(vnode);
                return Err(VfsError::IsDirectory);
            }
            if flags.contains(OpenFlags::TRUNC) && vnode.kind == FileKind::Regular {
                vnode.fs.truncate(vnode.ino, 0)?;
            }
            Ok(vnode)
        }
        Err(VfsError::NotFound) if flags.contains(OpenFlags::CREAT) => {
            vfs_create(cwd, path, FileKind::Regular, mode)
        }
        Err(e) => Err(e),
    }
}

/// Create a file or directory at `path`.
pub fn vfs_create(cwd: &VnodeRef, path: &[u8], kind: FileKind, mode: u16) -> VfsResult<VnodeRef> {
    let (parent, name) = resolve_parent(cwd, path)?;
    if name.is_empty() || name == b"." || name == b".." {
        vnode_put(parent);
        return Err(VfsError::Exists);
    }
    if parent.fs.lookup(parent.ino, name).is_ok() {
        vnode_put(parent);
        return Err(VfsError::Exists);
    }
    let ino = match parent.fs.create(parent.ino, name, kind, mode) {
        Ok(ino) => ino,
        Err(e) => {
            vnode_put(parent);
            return Err(e);
        }
    };
    let fs = parent.fs.clone();
    vnode_put(parent);
    vnode_get(&fs, ino)
}

pub fn vfs_mkdir(cwd: &VnodeRef, path: &[u8], mode: u16) -> VfsResult<()> {
    let vnode = vfs_create(cwd, path, FileKind::Directory, mode)?;
    vnode_put(vnode);
    Ok(())
}

/// Unlink a non-directory name.
pub fn vfs_unlink(cwd: &VnodeRef, path: &[u8]) -> VfsResult<()> {
    let (parent, name) = resolve_parent(cwd, path)?;
    if name.is_empty() || name == b"." || name == b".." {
        vnode_put(parent);
        return Err(VfsError::Invalid);
    }
    let result = match parent.fs.lookup(parent.ino, name) {
        Ok(ino) => match parent.fs.stat(ino) {
            Ok(stat) if stat.kind == FileKind::Directory => Err(VfsError::IsDirectory),
            Ok(_) => {
                let r = parent.fs.unlink(parent.ino, name);
                if r.is_ok() {
                    reclaim_if_orphaned(&parent, ino);
                }
                r
            }
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    };
    vnode_put(parent);
    result
}

/// After the last directory entry of `ino` is gone, its storage goes too,
/// unless an open file keeps the vnode alive (it is reclaimed on the last
/// close instead).
fn reclaim_if_orphaned(parent: &VnodeRef, ino: super::traits::InodeNum) {
    let orphan = parent
        .fs
        .stat(ino)
        .map(|s| s.nlink == 0)
        .unwrap_or(false);
    if orphan && !super::vnode::is_cached(parent.dev, ino) {
        let _ = parent.fs.release(ino);
    }
}

/// Remove an empty directory.
pub fn vfs_rmdir(cwd: &VnodeRef, path: &[u8]) -> VfsResult<()> {
    let (parent, name) = resolve_parent(cwd, path)?;
    if name.is_empty() || name == b"." || name == b".." {
        vnode_put(parent);
        return Err(VfsError::Invalid);
    }
    let result = match parent.fs.lookup(parent.ino, name) {
        Ok(ino) => match parent.fs.stat(ino) {
            Ok(stat) if stat.kind != FileKind::Directory => Err(VfsError::NotDirectory),
            // The driver enforces emptiness and the `NotEmpty` error.
            Ok(_) => {
                let r = parent.fs.unlink(parent.ino, name);
                if r.is_ok() {
                    reclaim_if_orphaned(&parent, ino);
                }
                r
            }
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    };
    vnode_put(parent);
    result
}

/// Hard link `new_path` to the inode at `old_path`. Directories cannot be
/// linked.
pub fn vfs_link(cwd: &VnodeRef, old_path: &[u8], new_path: &[u8]) -> VfsResult<()> {
    let target = resolve_path(cwd, old_path)?;
    if target.kind == FileKind::Directory {
        vnode_put(target);
        return Err(VfsError::Permission);
    }
    let (parent, name) = match resolve_parent(cwd, new_path) {
        Ok(p) => p,
        Err(e) => {
            vnode_put(target);
            return Err(e);
        }
    };
    let result = if parent.dev != target.dev {
        Err(VfsError::CrossDevice)
    } else if name.is_empty() || parent.fs.lookup(parent.ino, name).is_ok() {
        Err(VfsError::Exists)
    } else {
        parent.fs.link(parent.ino, name, target.ino)
    };
    vnode_put(parent);
    vnode_put(target);
    result
}

/// Rename `old_path` to `new_path`, enforcing the directory invariants:
/// `.`/`..` are immovable, directories never move under their own
/// descendants, kinds must match when replacing, and both ends must live
/// on the same filesystem.
pub fn vfs_rename(cwd: &VnodeRef, old_path: &[u8], new_path: &[u8]) -> VfsResult<()> {
    let (old_parent, old_name) = resolve_parent(cwd, old_path)?;
    let (new_parent, new_name) = match resolve_parent(cwd, new_path) {
        Ok(p) => p,
        Err(e) => {
            vnode_put(old_parent);
            return Err(e);
        }
    };

    let result = rename_checked(&old_parent, old_name, &new_parent, new_name);
    vnode_put(new_parent);
    vnode_put(old_parent);
    result
}

fn rename_checked(
    old_parent: &VnodeRef,
    old_name: &[u8],
    new_parent: &VnodeRef,
    new_name: &[u8],
) -> VfsResult<()> {
    if old_name.is_empty()
        || new_name.is_empty()
        || old_name == b"."
        || old_name == b".."
        || new_name == b"."
        || new_name == b".."
    {
        return Err(VfsError::Invalid);
    }
    if old_parent.dev != new_parent.dev {
        return Err(VfsError::CrossDevice);
    }

    let fs = &old_parent.fs;
    let source = fs.lookup(old_parent.ino, old_name)?;
    let source_stat = fs.stat(source)?;

    // rename(a, a): a no-op that must not disturb link counts.
    if old_parent.ino == new_parent.ino && old_name == new_name {
        return Ok(());
    }

    if source_stat.kind == FileKind::Directory {
        // Moving a directory under its own descendant would detach the
        // subtree; walk the destination's ancestry looking for the source.
        let mut cursor = new_parent.ino;
        loop {
            if cursor == source {
                return Err(VfsError::Invalid);
            }
            if cursor == fs.root_ino() {
                break;
            }
            cursor = fs.lookup(cursor, b"..")?;
        }
    }

    // Replacing an existing destination: kinds must agree.
    if let Ok(dest) = fs.lookup(new_parent.ino, new_name) {
        let dest_stat = fs.stat(dest)?;
        match (source_stat.kind, dest_stat.kind) {
            (FileKind::Directory, FileKind::Directory) => {}
            (FileKind::Directory, _) => return Err(VfsError::NotDirectory),
            (_, FileKind::Directory) => return Err(VfsError::IsDirectory),
            _ => {}
        }
    }

    fs.rename(old_parent.ino, old_name, new_parent.ino, new_name)
}

/// Stat a path.
pub fn vfs_stat(cwd: &VnodeRef, path: &[u8]) -> VfsResult<InodeStat> {
    let vnode = resolve_path(cwd, path)?;
    let stat = vnode.fs.stat(vnode.ino);
    vnode_put(vnode);
    stat
}

/// One directory entry at cursor `pos`.
pub fn vfs_readdir(dir: &VnodeRef, pos: usize) -> VfsResult<Option<(DirEntryInfo, usize)>> {
    if dir.kind != FileKind::Directory {
        return Err(VfsError::NotDirectory);
    }
    dir.fs.readdir(dir.ino, pos)
}

pub fn vfs_truncate(vnode: &VnodeRef, size: u32) -> VfsResult<()> {
    if vnode.kind == FileKind::Directory {
        return Err(VfsError::IsDirectory);
    }
    vnode.fs.truncate(vnode.ino, size)
}
