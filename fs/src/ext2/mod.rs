//! ext2-compatible filesystem (revision 0, 1 KiB blocks).
//!
//! The driver maps the inode contract onto group descriptors, inode
//! tables, block/inode bitmaps, and rec_len directory chains, all through
//! the write-back block cache. A per-instance rw-lock serializes metadata
//! mutations against each other while letting lookups proceed in parallel.

mod alloc;
mod dir;
mod disk;
mod inode;

extern crate alloc as alloc_crate;

use alloc_crate::sync::Arc;

use cinder_abi::fs::FileKind;
use cinder_lib::{IrqMutex, RwSem, klog_info};

use crate::blockdev::{self, BLOCK_SIZE, DevId};
use crate::buffer_cache;
use crate::error::{VfsError, VfsResult};
use crate::vfs::traits::{DirEntryInfo, FileSystem, InodeNum, InodeStat};
use crate::vfs::vnode;

use disk::{
    DiskInode, EXT2_MAGIC, EXT2_S_IFDIR, EXT2_S_IFREG, ROOT_INO, SUPERBLOCK_OFFSET, Superblock,
};

pub struct Ext2Fs {
    dev: DevId,
    sb: IrqMutex<Superblock>,
    /// Metadata lock: readers share, mutations exclude.
    meta: RwSem,
}

impl Ext2Fs {
    /// Probe `dev` for an ext2 superblock and build an instance.
    pub fn probe(dev: DevId) -> VfsResult<Arc<dyn FileSystem>> {
        let mut raw = [0u8; 1024];
        buffer_cache::read_bytes(dev, SUPERBLOCK_OFFSET, &mut raw)?;
        let sb = Superblock::parse(&raw);
        if sb.magic != EXT2_MAGIC {
            return Err(VfsError::Invalid);
        }
        if sb.log_block_size != 0 {
            // This core runs a fixed 1 KiB block size.
            return Err(VfsError::NotSupported);
        }
        klog_info!(
            "ext2: dev {} with {} blocks, {} inodes, {} group(s)",
            dev,
            sb.blocks_count,
            sb.inodes_count,
            sb.group_count()
        );
        Ok(Arc::new(Self {
            dev,
            sb: IrqMutex::new(sb),
            meta: RwSem::new(),
        }))
    }

    pub(super) fn flush_superblock(&self) -> VfsResult<()> {
        let mut raw = [0u8; 1024];
        buffer_cache::read_bytes(self.dev, SUPERBLOCK_OFFSET, &mut raw)?;
        self.sb.lock().encode(&mut raw);
        buffer_cache::write_bytes(self.dev, SUPERBLOCK_OFFSET, &raw)
    }

    fn stat_from(&self, ino: InodeNum, inode: &DiskInode) -> InodeStat {
        InodeStat {
            ino,
            kind: inode.kind(),
            mode: inode.mode,
            uid: inode.uid,
            gid: inode.gid,
            size: inode.size,
            nlink: inode.links_count,
            atime: inode.atime,
            mtime: inode.mtime,
            ctime: inode.ctime,
            rdev: 0,
        }
    }

    /// Reclaim an inode whose link count reached zero: free its data, its
    /// indirect trees, and the inode slot itself.
    fn reclaim(&self, ino: InodeNum) -> VfsResult<()> {
        let mut inode = self.read_inode(ino)?;
        let was_dir = inode.is_directory();
        self.truncate_inode(ino, &mut inode, 0)?;
        inode.dtime = 1;
        inode.mode = 0;
        self.write_inode(ino, &inode)?;
        self.free_inode(ino, was_dir)
    }
}

impl FileSystem for Ext2Fs {
    fn fs_name(&self) -> &'static str {
        "ext2"
    }

    fn dev(&self) -> DevId {
        self.dev
    }

    fn root_ino(&self) -> InodeNum {
        ROOT_INO
    }

    fn stat(&self, ino: InodeNum) -> VfsResult<InodeStat> {
        self.meta.with_read(|| {
            let inode = self.read_inode(ino)?;
            if inode.links_count == 0 && inode.mode == 0 {
                return Err(VfsError::NotFound);
            }
            Ok(self.stat_from(ino, &inode))
        })
    }

    fn lookup(&self, dir: InodeNum, name: &[u8]) -> VfsResult<InodeNum> {
        self.meta.with_read(|| {
            let mut dir_inode = self.read_inode(dir)?;
            if !dir_inode.is_directory() {
                return Err(VfsError::NotDirectory);
            }
            self.dir_find(dir, &mut dir_inode, name)
        })
    }

    fn create(&self, dir: InodeNum, name: &[u8], kind: FileKind, mode: u16) -> VfsResult<InodeNum> {
        if kind != FileKind::Regular && kind != FileKind::Directory {
            return Err(VfsError::NotSupported);
        }
        self.meta.with_write(|| {
            let mut parent = self.read_inode(dir)?;
            if !parent.is_directory() {
                return Err(VfsError::NotDirectory);
            }
            if self.dir_find(dir, &mut parent, name).is_ok() {
                return Err(VfsError::Exists);
            }

            let is_dir = kind == FileKind::Directory;
            let home = self.inode_group(dir);
            let ino = self.alloc_inode(home, is_dir)?;

            let mut inode = DiskInode::empty();
            inode.mode = (mode & 0o7777)
                | if is_dir { EXT2_S_IFDIR } else { EXT2_S_IFREG };
            inode.links_count = if is_dir { 2 } else { 1 }; // "." counts for dirs
            self.write_inode(ino, &inode)?;

            if is_dir {
                let mut fresh = self.read_inode(ino)?;
                self.dir_add_entry(ino, &mut fresh, b".", ino)?;
                self.dir_add_entry(ino, &mut fresh, b"..", dir)?;
                self.write_inode(ino, &fresh)?;
                // The child's ".." back-reference adds one to the parent.
                parent.links_count += 1;
            }

            self.dir_add_entry(dir, &mut parent, name, ino)?;
            self.write_inode(dir, &parent)?;
            Ok(ino)
        })
    }

    fn link(&self, dir: InodeNum, name: &[u8], ino: InodeNum) -> VfsResult<()> {
        self.meta.with_write(|| {
            let mut target = self.read_inode(ino)?;
            if target.is_directory() {
                return Err(VfsError::Permission);
            }
            let mut parent = self.read_inode(dir)?;
            if !parent.is_directory() {
                return Err(VfsError::NotDirectory);
            }
            if self.dir_find(dir, &mut parent, name).is_ok() {
                return Err(VfsError::Exists);
            }
            self.dir_add_entry(dir, &mut parent, name, ino)?;
            self.write_inode(dir, &parent)?;
            target.links_count += 1;
            self.write_inode(ino, &target)
        })
    }

    fn unlink(&self, dir: InodeNum, name: &[u8]) -> VfsResult<()> {
        self.meta.with_write(|| {
            let mut parent = self.read_inode(dir)?;
            let ino = self.dir_find(dir, &mut parent, name)?;
            let mut target = self.read_inode(ino)?;

            if target.is_directory() {
                if !self.dir_is_empty(ino, &mut target)? {
                    return Err(VfsError::NotEmpty);
                }
                self.dir_remove_entry(dir, &mut parent, name)?;
                // The dying child drops its "." self-link and the "..".
                parent.links_count = parent.links_count.saturating_sub(1);
                target.links_count = 0;
            } else {
                self.dir_remove_entry(dir, &mut parent, name)?;
                target.links_count = target.links_count.saturating_sub(1);
            }
            self.write_inode(dir, &parent)?;
            self.write_inode(ino, &target)
        })
    }

    fn rename(
        &self,
        old_dir: InodeNum,
        old_name: &[u8],
        new_dir: InodeNum,
        new_name: &[u8],
    ) -> VfsResult<()> {
        self.meta.with_write(|| {
            let mut old_parent = self.read_inode(old_dir)?;
            let source = self.dir_find(old_dir, &mut old_parent, old_name)?;
            let mut source_inode = self.read_inode(source)?;
            let moving_dir = source_inode.is_directory();

            let mut new_parent = if new_dir == old_dir {
                old_parent
            } else {
                self.read_inode(new_dir)?
            };

            // An existing destination gets replaced.
            let mut reclaim_target = None;
            match self.dir_find(new_dir, &mut new_parent, new_name) {
                Ok(dest) if dest == source => return Ok(()),
                Ok(dest) => {
                    let mut dest_inode = self.read_inode(dest)?;
                    if dest_inode.is_directory() {
                        if !self.dir_is_empty(dest, &mut dest_inode)? {
                            return Err(VfsError::NotEmpty);
                        }
                        new_parent.links_count = new_parent.links_count.saturating_sub(1);
                        dest_inode.links_count = 0;
                    } else {
                        dest_inode.links_count = dest_inode.links_count.saturating_sub(1);
                    }
                    self.write_inode(dest, &dest_inode)?;
                    if dest_inode.links_count == 0 {
                        reclaim_target = Some((dest, dest_inode));
                    }
                    self.dir_set_entry_ino(new_dir, &mut new_parent, new_name, source)?;
                }
                Err(VfsError::NotFound) => {
                    self.dir_add_entry(new_dir, &mut new_parent, new_name, source)?;
                }
                Err(e) => return Err(e),
            }

            if new_dir == old_dir {
                self.dir_remove_entry(old_dir, &mut new_parent, old_name)?;
                self.write_inode(new_dir, &new_parent)?;
            } else {
                // Write the destination first: a crash between the two
                // block writes leaves the entry reachable from both
                // parents rather than from neither.
                if moving_dir {
                    self.dir_set_entry_ino(source, &mut source_inode, b"..", new_dir)?;
                    self.write_inode(source, &source_inode)?;
                    new_parent.links_count += 1;
                }
                self.write_inode(new_dir, &new_parent)?;
                let mut old_parent = self.read_inode(old_dir)?;
                self.dir_remove_entry(old_dir, &mut old_parent, old_name)?;
                if moving_dir {
                    old_parent.links_count = old_parent.links_count.saturating_sub(1);
                }
                self.write_inode(old_dir, &old_parent)?;
            }

            // Storage of a fully unlinked, unreferenced replacement goes
            // away now; an open file keeps it until the last close.
            if let Some((dest, _)) = reclaim_target {
                if !vnode::is_cached(self.dev, dest) {
                    self.reclaim(dest)?;
                }
            }
            Ok(())
        })
    }

    fn read(&self, ino: InodeNum, offset: u32, buf: &mut [u8]) -> VfsResult<usize> {
        self.meta.with_read(|| {
            let mut inode = self.read_inode(ino)?;
            self.read_data(ino, &mut inode, offset, buf)
        })
    }

    fn write(&self, ino: InodeNum, offset: u32, buf: &[u8]) -> VfsResult<usize> {
        self.meta.with_write(|| {
            let mut inode = self.read_inode(ino)?;
            let n = self.write_data(ino, &mut inode, offset, buf)?;
            self.write_inode(ino, &inode)?;
            Ok(n)
        })
    }

    fn truncate(&self, ino: InodeNum, size: u32) -> VfsResult<()> {
        self.meta.with_write(|| {
            let mut inode = self.read_inode(ino)?;
            if inode.is_directory() {
                return Err(VfsError::IsDirectory);
            }
            self.truncate_inode(ino, &mut inode, size)?;
            self.write_inode(ino, &inode)
        })
    }

    fn readdir(&self, ino: InodeNum, pos: usize) -> VfsResult<Option<(DirEntryInfo, usize)>> {
        self.meta.with_read(|| {
            let mut dir_inode = self.read_inode(ino)?;
            if !dir_inode.is_directory() {
                return Err(VfsError::NotDirectory);
            }
            let mut result = None;
            self.for_each_entry(ino, &mut dir_inode, |entry| {
                if entry.offset < pos {
                    return true;
                }
                result = Some((entry.ino, entry.offset + entry.rec_len, {
                    let mut name = [0u8; cinder_abi::fs::MAX_NAME_LEN];
                    name[..entry.name_len].copy_from_slice(entry.name());
                    (name, entry.name_len)
                }));
                false
            })?;
            match result {
                Some((entry_ino, next_pos, (name, name_len))) => {
                    let kind = self
                        .read_inode(entry_ino)
                        .map(|i| i.kind())
                        .unwrap_or(FileKind::Regular);
                    Ok(Some((
                        DirEntryInfo::new(entry_ino, kind, &name[..name_len]),
                        next_pos,
                    )))
                }
                None => Ok(None),
            }
        })
    }

    fn set_mode(&self, ino: InodeNum, mode: u16) -> VfsResult<()> {
        self.meta.with_write(|| {
            let mut inode = self.read_inode(ino)?;
            inode.mode = (inode.mode & 0xF000) | (mode & 0o7777);
            self.write_inode(ino, &inode)
        })
    }

    fn set_times(&self, ino: InodeNum, atime: u32, mtime: u32) -> VfsResult<()> {
        self.meta.with_write(|| {
            let mut inode = self.read_inode(ino)?;
            inode.atime = atime;
            inode.mtime = mtime;
            self.write_inode(ino, &inode)
        })
    }

    fn release(&self, ino: InodeNum) -> VfsResult<()> {
        self.meta.with_write(|| {
            let inode = self.read_inode(ino)?;
            if inode.links_count == 0 && inode.mode != 0 {
                self.reclaim(ino)?;
            }
            Ok(())
        })
    }

    fn sync(&self) -> VfsResult<()> {
        self.flush_superblock()?;
        buffer_cache::sync_device(self.dev)
    }
}

/// Register the driver for mount-by-name.
pub fn register_driver() {
    crate::vfs::traits::register_fs_driver("ext2", Ext2Fs::probe);
}

// =============================================================================
// mkfs
// =============================================================================

/// Format `dev` with a fresh single-purpose ext2 layout: one or more block
/// groups, an empty root directory, reserved inodes marked used. Used by
/// the installer path and the filesystem test suites.
pub fn format(dev: DevId) -> VfsResult<()> {
    let device = blockdev::block_device(dev)?;
    let total_blocks = device.block_count();
    if total_blocks < 64 {
        return Err(VfsError::NoSpace);
    }

    let blocks_per_group = (BLOCK_SIZE * 8) as u32; // one bitmap block's worth
    let inodes_per_group = 1024u32.min((BLOCK_SIZE * 8) as u32);
    let inode_table_blocks = inodes_per_group * disk::INODE_SIZE as u32 / BLOCK_SIZE as u32;
    let first_data_block = 1u32;
    let group_count = (total_blocks - first_data_block).div_ceil(blocks_per_group);

    let mut free_blocks = 0u32;
    let mut zero = [0u8; BLOCK_SIZE];

    // Wipe the metadata area.
    for block in 0..total_blocks.min(8) {
        buffer_cache::write_bytes(dev, block * BLOCK_SIZE as u32, &zero)?;
    }

    for group in 0..group_count {
        let group_start = first_data_block + group * blocks_per_group;
        let blocks_here = blocks_per_group.min(total_blocks - group_start);
        // Per-group layout: [superblock copy + descs live only in group 0]
        // block bitmap, inode bitmap, inode table, data.
        let meta_start = if group == 0 { group_start + 2 } else { group_start };
        let block_bitmap = meta_start;
        let inode_bitmap = meta_start + 1;
        let inode_table = meta_start + 2;
        let data_start = inode_table + inode_table_blocks;

        let desc = disk::GroupDesc {
            block_bitmap,
            inode_bitmap,
            inode_table,
            free_blocks_count: (group_start + blocks_here).saturating_sub(data_start) as u16,
            free_inodes_count: inodes_per_group as u16,
            used_dirs_count: 0,
        };
        let mut raw = [0u8; disk::GROUP_DESC_SIZE];
        desc.encode(&mut raw);
        buffer_cache::write_bytes(
            dev,
            disk::GROUP_DESC_BLOCK * BLOCK_SIZE as u32 + group * disk::GROUP_DESC_SIZE as u32,
            &raw,
        )?;

        // Block bitmap: metadata blocks used, the rest free; bits past the
        // device end stay used.
        zero = [0u8; BLOCK_SIZE];
        for bit in 0..blocks_per_group {
            let block = group_start + bit;
            let in_use = block < data_start || block >= total_blocks;
            if in_use {
                zero[(bit / 8) as usize] |= 1 << (bit % 8);
            } else {
                free_blocks += 1;
            }
        }
        buffer_cache::write_bytes(dev, block_bitmap * BLOCK_SIZE as u32, &zero)?;

        // Inode bitmap: all free; group 0 reserves inodes 1..=10.
        zero = [0u8; BLOCK_SIZE];
        if group == 0 {
            for bit in 0..(disk::FIRST_FREE_INO - 1) {
                zero[(bit / 8) as usize] |= 1 << (bit % 8);
            }
        }
        buffer_cache::write_bytes(dev, inode_bitmap * BLOCK_SIZE as u32, &zero)?;

        // Inode table starts zeroed.
        let wipe = [0u8; BLOCK_SIZE];
        for block in inode_table..data_start {
            buffer_cache::write_bytes(dev, block * BLOCK_SIZE as u32, &wipe)?;
        }
    }

    let sb = Superblock {
        inodes_count: inodes_per_group * group_count,
        blocks_count: total_blocks,
        free_blocks_count: free_blocks,
        free_inodes_count: inodes_per_group * group_count - (disk::FIRST_FREE_INO - 1),
        first_data_block,
        log_block_size: 0,
        blocks_per_group,
        inodes_per_group,
        magic: EXT2_MAGIC,
    };
    let mut raw = [0u8; 1024];
    sb.encode(&mut raw);
    buffer_cache::write_bytes(dev, SUPERBLOCK_OFFSET, &raw)?;

    // Root directory.
    let fs = Ext2Fs {
        dev,
        sb: IrqMutex::new(sb),
        meta: RwSem::new(),
    };
    let mut root = DiskInode::empty();
    root.mode = EXT2_S_IFDIR | 0o755;
    root.links_count = 2;
    fs.write_inode(ROOT_INO, &root)?;
    let mut root = fs.read_inode(ROOT_INO)?;
    fs.dir_add_entry(ROOT_INO, &mut root, b".", ROOT_INO)?;
    fs.dir_add_entry(ROOT_INO, &mut root, b"..", ROOT_INO)?;
    fs.write_inode(ROOT_INO, &root)?;
    fs.flush_superblock()?;
    buffer_cache::sync_device(dev)?;
    klog_info!("ext2: formatted dev {} ({} blocks)", dev, total_blocks);
    Ok(())
}
