//! ext2 driver tests over a freshly formatted RAM disk.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec;

use cinder_abi::fs::FileKind;
use cinder_lib::testing::TestResult;
use cinder_lib::{assert_eq_test, assert_err, assert_ok, assert_test, fail, pass};

use crate::blockdev;
use crate::buffer_cache;
use crate::error::VfsError;
use crate::ext2;
use crate::ramdisk::RamDisk;
use crate::vfs::traits::FileSystem;

const EXT2_TEST_DEV: u16 = 8;

/// Fresh formatted filesystem for each test.
fn setup() -> Option<Arc<dyn FileSystem>> {
    let disk = Arc::new(RamDisk::new(2048));
    blockdev::register_block_device(EXT2_TEST_DEV, disk);
    ext2::format(EXT2_TEST_DEV).ok()?;
    ext2::Ext2Fs::probe(EXT2_TEST_DEV).ok()
}

fn teardown() {
    let _ = buffer_cache::invalidate_device(EXT2_TEST_DEV);
    blockdev::unregister_block_device(EXT2_TEST_DEV);
}

pub fn test_ext2_root_shape() -> TestResult {
    let Some(fs) = setup() else {
        return fail!("setup failed");
    };
    let root = fs.root_ino();
    let stat = assert_ok!(fs.stat(root));
    assert_eq_test!(stat.kind, FileKind::Directory, "root is a directory");
    assert_eq_test!(stat.nlink, 2, "fresh root has link count 2");
    assert_eq_test!(assert_ok!(fs.lookup(root, b".")), root, "'.' is self");
    assert_eq_test!(assert_ok!(fs.lookup(root, b"..")), root, "root '..' is itself");
    teardown();
    pass!()
}

pub fn test_ext2_write_then_read_back() -> TestResult {
    let Some(fs) = setup() else {
        return fail!("setup failed");
    };
    let root = fs.root_ino();
    let ino = assert_ok!(fs.create(root, b"hello", FileKind::Regular, 0o644));
    assert_ok!(fs.write(ino, 0, b"hello"));

    let mut buf = [0u8; 5];
    assert_eq_test!(assert_ok!(fs.read(ino, 0, &mut buf)), 5);
    assert_eq_test!(&buf, b"hello", "write/read round trip");

    // Overwrite in place, as the seed scenario does with lseek(0).
    assert_ok!(fs.write(ino, 0, b"aaaaa"));
    assert_ok!(fs.read(ino, 0, &mut buf));
    assert_eq_test!(&buf, b"aaaaa", "overwrite visible");

    teardown();
    pass!()
}

pub fn test_ext2_mkdir_link_counts() -> TestResult {
    let Some(fs) = setup() else {
        return fail!("setup failed");
    };
    let root = fs.root_ino();

    let dir = assert_ok!(fs.create(root, b"testdir", FileKind::Directory, 0o755));
    assert_eq_test!(assert_ok!(fs.stat(dir)).nlink, 2, "fresh dir: '.' plus parent entry");
    assert_eq_test!(assert_ok!(fs.stat(root)).nlink, 3, "root gains the child's '..'");

    // link_count(D) == 2 + number of subdirectories.
    let _sub1 = assert_ok!(fs.create(dir, b"sub1", FileKind::Directory, 0o755));
    let _sub2 = assert_ok!(fs.create(dir, b"sub2", FileKind::Directory, 0o755));
    assert_ok!(fs.create(dir, b"file", FileKind::Regular, 0o644));
    assert_eq_test!(assert_ok!(fs.stat(dir)).nlink, 4, "2 + 2 subdirectories");

    assert_eq_test!(assert_ok!(fs.lookup(dir, b"..")), root, "'..' points at the parent");
    assert_eq_test!(assert_ok!(fs.lookup(dir, b".")), dir, "'.' points at self");

    teardown();
    pass!()
}

pub fn test_ext2_rmdir_rules() -> TestResult {
    let Some(fs) = setup() else {
        return fail!("setup failed");
    };
    let root = fs.root_ino();
    let dir = assert_ok!(fs.create(root, b"busy", FileKind::Directory, 0o755));
    assert_ok!(fs.create(dir, b"occupant", FileKind::Regular, 0o644));

    assert_err!(fs.unlink(root, b"busy"), VfsError::NotEmpty, "non-empty dir refuses unlink");

    assert_ok!(fs.unlink(dir, b"occupant"));
    assert_ok!(fs.unlink(root, b"busy"));
    assert_err!(fs.lookup(root, b"busy"), VfsError::NotFound);
    assert_eq_test!(assert_ok!(fs.stat(root)).nlink, 2, "root link count restored");

    teardown();
    pass!()
}

pub fn test_ext2_indirect_blocks_and_holes() -> TestResult {
    let Some(fs) = setup() else {
        return fail!("setup failed");
    };
    let root = fs.root_ino();
    let ino = assert_ok!(fs.create(root, b"big", FileKind::Regular, 0o644));

    // 40 KiB crosses from direct (12 KiB) well into the single-indirect
    // range.
    let chunk = vec![0xC3u8; 4096];
    for i in 0..10u32 {
        assert_ok!(fs.write(ino, i * 4096, &chunk));
    }
    let mut buf = [0u8; 64];
    assert_ok!(fs.read(ino, 13 * 1024, &mut buf));
    assert_test!(buf.iter().all(|&b| b == 0xC3), "single-indirect data intact");

    // A sparse write far out lands in the double-indirect range
    // (direct 12 KiB + single 256 KiB = 268 KiB).
    assert_ok!(fs.write(ino, 300 * 1024, b"far"));
    assert_ok!(fs.read(ino, 300 * 1024, &mut buf[..3]));
    assert_eq_test!(&buf[..3], b"far", "double-indirect write readable");

    // The hole between the two extents reads as zeros.
    assert_ok!(fs.read(ino, 100 * 1024, &mut buf));
    assert_test!(buf.iter().all(|&b| b == 0), "hole reads as zeros");

    teardown();
    pass!()
}

pub fn test_ext2_truncate_frees_blocks() -> TestResult {
    let Some(fs) = setup() else {
        return fail!("setup failed");
    };
    let root = fs.root_ino();
    let ino = assert_ok!(fs.create(root, b"shrink", FileKind::Regular, 0o644));

    let chunk = vec![1u8; 8192];
    assert_ok!(fs.write(ino, 0, &chunk));
    let size_before = assert_ok!(fs.stat(ino)).size;
    assert_eq_test!(size_before, 8192, "size tracks writes");

    assert_ok!(fs.truncate(ino, 0));
    assert_eq_test!(assert_ok!(fs.stat(ino)).size, 0, "truncate resets size");
    let mut buf = [0u8; 16];
    assert_eq_test!(assert_ok!(fs.read(ino, 0, &mut buf)), 0, "no data past EOF");

    teardown();
    pass!()
}

pub fn test_ext2_hard_links() -> TestResult {
    let Some(fs) = setup() else {
        return fail!("setup failed");
    };
    let root = fs.root_ino();
    let ino = assert_ok!(fs.create(root, b"orig", FileKind::Regular, 0o644));
    assert_ok!(fs.write(ino, 0, b"shared"));

    assert_ok!(fs.link(root, b"alias", ino));
    assert_eq_test!(assert_ok!(fs.stat(ino)).nlink, 2, "link bumps the count");
    assert_eq_test!(assert_ok!(fs.lookup(root, b"alias")), ino, "alias resolves to it");

    assert_ok!(fs.unlink(root, b"orig"));
    assert_eq_test!(assert_ok!(fs.stat(ino)).nlink, 1, "unlink drops one");
    let mut buf = [0u8; 6];
    assert_ok!(fs.read(ino, 0, &mut buf));
    assert_eq_test!(&buf, b"shared", "data survives through the alias");

    teardown();
    pass!()
}

pub fn test_ext2_unlinked_inode_reclaimed_on_release() -> TestResult {
    let Some(fs) = setup() else {
        return fail!("setup failed");
    };
    let root = fs.root_ino();
    let ino = assert_ok!(fs.create(root, b"doomed", FileKind::Regular, 0o644));
    assert_ok!(fs.write(ino, 0, b"last words"));
    assert_ok!(fs.unlink(root, b"doomed"));

    // Unlinked but conceptually still open: the data remains readable.
    let mut buf = [0u8; 10];
    assert_ok!(fs.read(ino, 0, &mut buf));
    assert_eq_test!(&buf, b"last words", "unlinked inode readable until release");

    // Last reference gone: release reclaims the storage.
    assert_ok!(fs.release(ino));
    assert_err!(fs.stat(ino), VfsError::NotFound, "inode gone after release");

    teardown();
    pass!()
}

pub fn test_ext2_rename_same_name_noop() -> TestResult {
    let Some(fs) = setup() else {
        return fail!("setup failed");
    };
    let root = fs.root_ino();
    let ino = assert_ok!(fs.create(root, b"stay", FileKind::Regular, 0o644));
    let links_before = assert_ok!(fs.stat(ino)).nlink;

    assert_ok!(fs.rename(root, b"stay", root, b"stay"));
    assert_eq_test!(assert_ok!(fs.stat(ino)).nlink, links_before, "no-op keeps link count");
    assert_eq_test!(assert_ok!(fs.lookup(root, b"stay")), ino, "entry still present");

    teardown();
    pass!()
}

pub fn test_ext2_rename_directory_across_parents() -> TestResult {
    let Some(fs) = setup() else {
        return fail!("setup failed");
    };
    let root = fs.root_ino();
    let mydir = assert_ok!(fs.create(root, b"mydir", FileKind::Directory, 0o755));
    let second = assert_ok!(fs.create(root, b"myseconddir", FileKind::Directory, 0o755));
    let sub = assert_ok!(fs.create(mydir, b"subdir2", FileKind::Directory, 0o755));

    assert_ok!(fs.rename(mydir, b"subdir2", second, b"subdir1"));

    assert_eq_test!(assert_ok!(fs.lookup(second, b"subdir1")), sub, "entry moved");
    assert_err!(fs.lookup(mydir, b"subdir2"), VfsError::NotFound, "source gone");
    // The moved directory's '..' follows it to the new parent.
    assert_eq_test!(assert_ok!(fs.lookup(sub, b"..")), second, "'..' repointed");
    assert_eq_test!(assert_ok!(fs.stat(mydir)).nlink, 2, "old parent dropped the '..'");
    assert_eq_test!(assert_ok!(fs.stat(second)).nlink, 3, "new parent gained it");

    teardown();
    pass!()
}

pub fn test_ext2_many_entries_directory_growth() -> TestResult {
    let Some(fs) = setup() else {
        return fail!("setup failed");
    };
    let root = fs.root_ino();
    let dir = assert_ok!(fs.create(root, b"crowd", FileKind::Directory, 0o755));

    // Enough entries to grow the directory past its first block.
    for i in 0..80u32 {
        let mut name = *b"entry-00";
        name[6] = b'0' + (i / 10) as u8;
        name[7] = b'0' + (i % 10) as u8;
        assert_ok!(fs.create(dir, &name, FileKind::Regular, 0o644));
    }
    let mut seen = 0;
    let mut pos = 0usize;
    while let Some((_, next)) = assert_ok!(fs.readdir(dir, pos)) {
        seen += 1;
        pos = next;
    }
    assert_eq_test!(seen, 82, "80 files plus '.' and '..'");

    teardown();
    pass!()
}

cinder_lib::define_test_suite!(
    ext2,
    [
        test_ext2_root_shape,
        test_ext2_write_then_read_back,
        test_ext2_mkdir_link_counts,
        test_ext2_rmdir_rules,
        test_ext2_indirect_blocks_and_holes,
        test_ext2_truncate_frees_blocks,
        test_ext2_hard_links,
        test_ext2_unlinked_inode_reclaimed_on_release,
        test_ext2_rename_same_name_noop,
        test_ext2_rename_directory_across_parents,
        test_ext2_many_entries_directory_growth,
    ]
);
