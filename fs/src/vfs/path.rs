//! Pathname resolution.
//!
//! Walks component by component from `/` (absolute paths) or the caller's
//! working directory, crossing mount points transparently in both
//! directions: entering a mounted directory lands on the mounted
//! filesystem's root, and `..` at a mount root climbs out through the
//! covered directory's parent.

use cinder_abi::fs::{FileKind, MAX_NAME_LEN, MAX_PATH_LEN};

use crate::error::{VfsError, VfsResult};

use super::mount;
use super::vnode::{VnodeRef, vnode_get, vnode_put, vnode_ref};

/// Split `path` into its components, rejecting oversized input.
fn components(path: &[u8]) -> VfsResult<impl DoubleEndedIterator<Item = &[u8]>> {
    if path.len() > MAX_PATH_LEN {
        return Err(VfsError::NameTooLong);
    }
    Ok(path.split(|&b| b == b'/').filter(|c| !c.is_empty()))
}

/// Starting vnode for `path`: the root for absolute paths, `cwd` (an
/// additional reference) otherwise.
fn walk_start(cwd: &VnodeRef, path: &[u8]) -> VfsResult<VnodeRef> {
    if path.first() == Some(&b'/') {
        mount::root_vnode()
    } else {
        Ok(vnode_ref(cwd))
    }
}

/// One step: resolve `name` in the directory `current`, consuming the
/// reference on `current` and returning a referenced result.
pub(super) fn step(current: VnodeRef, name: &[u8]) -> VfsResult<VnodeRef> {
    if current.kind != FileKind::Directory {
        vnode_put(current);
        return Err(VfsError::NotDirectory);
    }
    if name.len() > MAX_NAME_LEN {
        vnode_put(current);
        return Err(VfsError::NameTooLong);
    }

    if name == b"." {
        return Ok(current);
    }

    if name == b".." {
        // At a mount root, ".." leaves through the covered directory.
        if mount::is_mount_root(&current) {
            if let Some(covered) = mount::covered_vnode(&current) {
                vnode_put(current);
                let parent_ino = covered.fs.lookup(covered.ino, b"..")?;
                let fs = covered.fs.clone();
                vnode_put(covered);
                return vnode_get(&fs, parent_ino);
            }
            // Root of the root mount: ".." stays put.
            return Ok(current);
        }
    }

    let child_ino = match current.fs.lookup(current.ino, name) {
        Ok(ino) => ino,
        Err(e) => {
            vnode_put(current);
            return Err(e);
        }
    };
    let child = match vnode_get(&current.fs.clone(), child_ino) {
        Ok(v) => v,
        Err(e) => {
            vnode_put(current);
            return Err(e);
        }
    };
    vnode_put(current);

    // Entering a mounted directory lands on the mounted root.
    if child.is_mount_point() {
        if let Some(root) = mount::mounted_root(&child) {
            vnode_put(child);
            return Ok(root);
        }
    }
    Ok(child)
}

/// Resolve `path` to its vnode. The result carries one reference.
pub fn resolve_path(cwd: &VnodeRef, path: &[u8]) -> VfsResult<VnodeRef> {
    let mut current = walk_start(cwd, path)?;
    for name in components(path)? {
        current = step(current, name)?;
    }
    Ok(current)
}

/// Resolve everything but the final component. Returns the referenced
/// parent directory and the final name (empty when `path` is `/`).
pub fn resolve_parent<'a>(cwd: &VnodeRef, path: &'a [u8]) -> VfsResult<(VnodeRef, &'a [u8])> {
    let mut names = components(path)?;
    let last = match names.next_back() {
        Some(last) => last,
        None => return Ok((walk_start(cwd, path)?, b"")),
    };

    let mut current = walk_start(cwd, path)?;
    for name in components(path)? {
        if name.as_ptr() == last.as_ptr() {
            break;
        }
        current = step(current, name)?;
    }
    if current.kind != FileKind::Directory {
        vnode_put(current);
        return Err(VfsError::NotDirectory);
    }
    Ok((current, last))
}
