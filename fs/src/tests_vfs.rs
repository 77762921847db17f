//! VFS tests: path resolution, mount crossing, open-file semantics, and
//! pipes.

extern crate alloc;

use alloc::sync::Arc;

use cinder_abi::fs::{FileKind, OpenFlags, SEEK_SET};
use cinder_lib::testing::TestResult;
use cinder_lib::{assert_eq_test, assert_err, assert_ok, assert_test, fail, pass};

use crate::blockdev;
use crate::error::VfsError;
use crate::ext2;
use crate::file_table;
use crate::pipe::Pipe;
use crate::ramdisk::RamDisk;
use crate::vfs::vnode::{self, VnodeRef, vnode_put};
use crate::vfs::{self, mount};

const VFS_ROOT_DEV: u16 = 9;
const VFS_SUB_DEV: u16 = 10;
const TEST_PID: u32 = 4242;

/// Root vnode for the tests; mounts a fresh ext2 RAM disk as `/` when the
/// kernel has not mounted one yet.
fn test_root() -> Option<VnodeRef> {
    if let Ok(root) = mount::root_vnode() {
        return Some(root);
    }
    let disk = Arc::new(RamDisk::new(2048));
    blockdev::register_block_device(VFS_ROOT_DEV, disk);
    ext2::format(VFS_ROOT_DEV).ok()?;
    let fs = ext2::Ext2Fs::probe(VFS_ROOT_DEV).ok()?;
    mount::mount_root(fs).ok()
}

pub fn test_path_resolution_dot_and_dotdot() -> TestResult {
    let Some(root) = test_root() else {
        return fail!("no test root");
    };

    assert_ok!(vfs::vfs_mkdir(&root, b"/pr", 0o755));
    assert_ok!(vfs::vfs_mkdir(&root, b"/pr/a", 0o755));
    assert_ok!(vfs::vfs_mkdir(&root, b"/pr/a/b", 0o755));

    let direct = assert_ok!(vfs::vfs_lookup(&root, b"/pr/a/b"));
    let dotted = assert_ok!(vfs::vfs_lookup(&root, b"/pr/./a/../a/b/."));
    assert_eq_test!(direct.ino, dotted.ino, "dot traversal resolves the same inode");
    vnode_put(direct);
    vnode_put(dotted);

    // Relative resolution from a cwd vnode.
    let cwd = assert_ok!(vfs::vfs_lookup(&root, b"/pr/a"));
    let relative = assert_ok!(vfs::vfs_lookup(&cwd, b"b"));
    assert_test!(relative.kind == FileKind::Directory, "relative lookup works");
    vnode_put(relative);
    vnode_put(cwd);

    vnode_put(root);
    pass!()
}

pub fn test_open_create_excl_trunc() -> TestResult {
    let Some(root) = test_root() else {
        return fail!("no test root");
    };

    let flags = OpenFlags::RDWR | OpenFlags::CREAT;
    let vn = assert_ok!(vfs::vfs_open(&root, b"/excl-test", flags, 0o644));
    assert_ok!(vn.fs.write(vn.ino, 0, b"content"));
    vnode_put(vn);

    assert_err!(
        vfs::vfs_open(&root, b"/excl-test", flags | OpenFlags::EXCL, 0o644),
        VfsError::Exists,
        "O_EXCL on existing file"
    );

    let vn = assert_ok!(vfs::vfs_open(
        &root,
        b"/excl-test",
        OpenFlags::RDWR | OpenFlags::TRUNC,
        0o644
    ));
    assert_eq_test!(assert_ok!(vn.fs.stat(vn.ino)).size, 0, "O_TRUNC emptied it");
    vnode_put(vn);

    assert_ok!(vfs::vfs_unlink(&root, b"/excl-test"));
    vnode_put(root);
    pass!()
}

pub fn test_rename_into_descendant_rejected() -> TestResult {
    let Some(root) = test_root() else {
        return fail!("no test root");
    };

    assert_ok!(vfs::vfs_mkdir(&root, b"/ren", 0o755));
    assert_ok!(vfs::vfs_mkdir(&root, b"/ren/b", 0o755));
    assert_ok!(vfs::vfs_mkdir(&root, b"/ren/b/c", 0o755));

    assert_err!(
        vfs::vfs_rename(&root, b"/ren/b", b"/ren/b/c/d"),
        VfsError::Invalid,
        "moving a directory under its own descendant"
    );
    assert_err!(
        vfs::vfs_rename(&root, b"/ren/b/.", b"/ren/x"),
        VfsError::Invalid,
        "renaming '.'"
    );

    vnode_put(root);
    pass!()
}

pub fn test_unlink_dotdot_rejected() -> TestResult {
    let Some(root) = test_root() else {
        return fail!("no test root");
    };
    assert_ok!(vfs::vfs_mkdir(&root, b"/dots", 0o755));
    assert_err!(
        vfs::vfs_rmdir(&root, b"/dots/.."),
        VfsError::Invalid,
        "rmdir of '..'"
    );
    assert_ok!(vfs::vfs_rmdir(&root, b"/dots"));
    vnode_put(root);
    pass!()
}

pub fn test_mount_crossing_and_unmount_busy() -> TestResult {
    let Some(root) = test_root() else {
        return fail!("no test root");
    };

    // A second ext2 volume mounted over /mnt.
    let disk = Arc::new(RamDisk::new(1024));
    blockdev::register_block_device(VFS_SUB_DEV, disk);
    if ext2::format(VFS_SUB_DEV).is_err() {
        return fail!("format of sub volume failed");
    }
    assert_ok!(vfs::vfs_mkdir(&root, b"/mnt", 0o755));
    let point = assert_ok!(vfs::vfs_lookup(&root, b"/mnt"));
    assert_ok!(mount::do_mount(point, VFS_SUB_DEV, b"ext2"));

    // Crossing downward: files created through the mount land on the
    // mounted volume.
    let vn = assert_ok!(vfs::vfs_open(
        &root,
        b"/mnt/inner",
        OpenFlags::RDWR | OpenFlags::CREAT,
        0o644
    ));
    assert_eq_test!(vn.dev, VFS_SUB_DEV, "file lives on the mounted volume");

    // Crossing upward: '..' at the mount root escapes to the parent fs.
    let escaped = assert_ok!(vfs::vfs_lookup(&root, b"/mnt/.."));
    assert_eq_test!(escaped.dev, root.dev, "'..' escapes the mount");
    vnode_put(escaped);

    // Unmount refuses while the file reference is held.
    let point = assert_ok!(vfs::vfs_lookup(&root, b"/mnt"));
    assert_err!(mount::do_unmount(point), VfsError::Busy, "unmount with open file");

    vnode_put(vn);
    let point = assert_ok!(vfs::vfs_lookup(&root, b"/mnt"));
    assert_ok!(mount::do_unmount(point));

    blockdev::unregister_block_device(VFS_SUB_DEV);
    assert_ok!(vfs::vfs_rmdir(&root, b"/mnt"));
    vnode_put(root);
    pass!()
}

pub fn test_vnode_cache_single_instance() -> TestResult {
    let Some(root) = test_root() else {
        return fail!("no test root");
    };
    assert_ok!(vfs::vfs_mkdir(&root, b"/vn-one", 0o755));
    let a = assert_ok!(vfs::vfs_lookup(&root, b"/vn-one"));
    let b = assert_ok!(vfs::vfs_lookup(&root, b"/vn-one"));
    assert_test!(Arc::ptr_eq(&a, &b), "one vnode per (dev, ino)");
    assert_eq_test!(a.refcount(), 2, "both lookups counted");
    vnode_put(a);
    vnode_put(b);
    assert_ok!(vfs::vfs_rmdir(&root, b"/vn-one"));
    vnode_put(root);
    pass!()
}

pub fn test_unlinked_open_file_survives_until_close() -> TestResult {
    let Some(root) = test_root() else {
        return fail!("no test root");
    };
    let vn = assert_ok!(vfs::vfs_open(
        &root,
        b"/ghost",
        OpenFlags::RDWR | OpenFlags::CREAT,
        0o644
    ));
    assert_ok!(vn.fs.write(vn.ino, 0, b"haunting"));
    let (dev, ino) = (vn.dev, vn.ino);

    assert_ok!(vfs::vfs_unlink(&root, b"/ghost"));
    // Still open: data reachable, vnode cached.
    let mut buf = [0u8; 8];
    assert_ok!(vn.fs.read(vn.ino, 0, &mut buf));
    assert_eq_test!(&buf, b"haunting", "unlinked but open file readable");
    assert_test!(vnode::is_cached(dev, ino), "vnode still cached while open");

    // Last close: refcount 0 and nlink 0 means gone from the cache.
    vnode_put(vn);
    assert_test!(!vnode::is_cached(dev, ino), "vnode evicted after last close");

    vnode_put(root);
    pass!()
}

pub fn test_fd_table_dup_shares_cursor() -> TestResult {
    let Some(root) = test_root() else {
        return fail!("no test root");
    };
    assert_ok!(file_table::fd_table_create(TEST_PID));

    let vn = assert_ok!(vfs::vfs_open(
        &root,
        b"/cursor",
        OpenFlags::RDWR | OpenFlags::CREAT,
        0o644
    ));
    let fd = assert_ok!(file_table::file_open_vnode(TEST_PID, vn, OpenFlags::RDWR));
    assert_ok!(file_table::file_write(TEST_PID, fd, b"0123456789"));

    let dup = assert_ok!(file_table::file_dup(TEST_PID, fd));
    assert_ok!(file_table::file_lseek(TEST_PID, fd, 4, SEEK_SET));

    // The duplicate reads from the shared cursor.
    let mut buf = [0u8; 3];
    assert_eq_test!(assert_ok!(file_table::file_read(TEST_PID, dup, &mut buf)), 3);
    assert_eq_test!(&buf, b"456", "dup shares the cursor");

    assert_ok!(file_table::file_close(TEST_PID, fd));
    assert_ok!(file_table::file_close(TEST_PID, dup));
    file_table::fd_table_destroy(TEST_PID);
    assert_ok!(vfs::vfs_unlink(&root, b"/cursor"));
    vnode_put(root);
    pass!()
}

pub fn test_pipe_data_flow_and_close_semantics() -> TestResult {
    let pipe = Pipe::new();

    assert_eq_test!(assert_ok!(pipe.write_nonblock(b"through the pipe")), 16);
    let mut buf = [0u8; 16];
    assert_eq_test!(assert_ok!(pipe.read_nonblock(&mut buf)), 16);
    assert_eq_test!(&buf, b"through the pipe", "pipe round trip");

    // Empty with a live writer: would block.
    assert_err!(pipe.read_nonblock(&mut buf), VfsError::WouldBlock);

    // Writer gone: end of file.
    pipe.drop_writer();
    assert_eq_test!(assert_ok!(pipe.read_nonblock(&mut buf)), 0, "EOF after writer close");

    // Reader gone: writes break.
    pipe.drop_reader();
    assert_err!(pipe.write_nonblock(b"x"), VfsError::PipeClosed, "write after reader close");

    pass!()
}

pub fn test_pipe_fills_and_reports_space() -> TestResult {
    let pipe = Pipe::new();
    let chunk = [7u8; 1024];
    let mut total = 0usize;
    loop {
        match pipe.write_nonblock(&chunk) {
            Ok(n) => total += n,
            Err(VfsError::WouldBlock) => break,
            Err(e) => return fail!("unexpected error {:?}", e),
        }
    }
    assert_eq_test!(total, 4096, "pipe capacity");
    assert_test!(!pipe.has_space(), "full pipe reports no space");

    let mut buf = [0u8; 100];
    assert_ok!(pipe.read_nonblock(&mut buf));
    assert_test!(pipe.has_space(), "space after drain");
    pass!()
}

cinder_lib::define_test_suite!(
    vfs,
    [
        test_path_resolution_dot_and_dotdot,
        test_open_create_excl_trunc,
        test_rename_into_descendant_rejected,
        test_unlink_dotdot_rejected,
        test_mount_crossing_and_unmount_busy,
        test_vnode_cache_single_instance,
        test_unlinked_open_file_survives_until_close,
        test_fd_table_dup_shares_cursor,
        test_pipe_data_flow_and_close_semantics,
        test_pipe_fills_and_reports_space,
    ]
);
