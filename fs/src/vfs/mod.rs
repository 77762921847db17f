//! Virtual file system: the inode contract, the vnode cache, the mount
//! table, and pathname resolution.

pub mod mount;
pub mod ops;
pub mod path;
pub mod traits;
pub mod vnode;

pub use mount::{do_mount, do_unmount, mount_root};
pub use ops::{
    vfs_create, vfs_link, vfs_lookup, vfs_mkdir, vfs_open, vfs_readdir, vfs_rename, vfs_rmdir,
    vfs_stat, vfs_truncate, vfs_unlink,
};
pub use path::{resolve_parent, resolve_path};
pub use traits::{DirEntryInfo, FileSystem, InodeNum, InodeStat, register_fs_driver};
pub use vnode::{Vnode, VnodeRef, vnode_get, vnode_put, vnode_ref};
