//! Inode I/O and file block mapping.
//!
//! `bmap` walks the direct, single-, double-, and triple-indirect pointer
//! trees; a zero pointer is a hole, which reads back as zeros and is only
//! materialized when written to.

use crate::blockdev::BLOCK_SIZE;
use crate::buffer_cache;
use crate::error::{VfsError, VfsResult};

use super::Ext2Fs;
use super::disk::{
    DIRECT_BLOCKS, DiskInode, IND_DOUBLE, IND_SINGLE, IND_TRIPLE, INODE_SIZE, PTRS_PER_BLOCK,
    read_le_u32, write_le_u32,
};

/// ext2 counts inode usage in 512-byte sectors.
const SECTORS_PER_BLOCK: u32 = (BLOCK_SIZE / 512) as u32;

impl Ext2Fs {
    fn inode_offset(&self, ino: u32) -> VfsResult<u32> {
        let sb = self.sb.lock();
        if ino == 0 || ino > sb.inodes_count {
            return Err(VfsError::NotFound);
        }
        let index = ino - 1;
        let group = index / sb.inodes_per_group;
        let within = index % sb.inodes_per_group;
        drop(sb);
        let desc = self.read_group_desc(group)?;
        Ok(desc.inode_table * BLOCK_SIZE as u32 + within * INODE_SIZE as u32)
    }

    pub(super) fn read_inode(&self, ino: u32) -> VfsResult<DiskInode> {
        let offset = self.inode_offset(ino)?;
        let mut raw = [0u8; INODE_SIZE];
        buffer_cache::read_bytes(self.dev, offset, &mut raw)?;
        Ok(DiskInode::parse(&raw))
    }

    pub(super) fn write_inode(&self, ino: u32, inode: &DiskInode) -> VfsResult<()> {
        let offset = self.inode_offset(ino)?;
        let mut raw = [0u8; INODE_SIZE];
        inode.encode(&mut raw);
        buffer_cache::write_bytes(self.dev, offset, &raw)
    }

    /// Read one pointer out of an indirect block.
    fn read_ptr(&self, block: u32, index: usize) -> VfsResult<u32> {
        let mut raw = [0u8; 4];
        buffer_cache::read_bytes(self.dev, block * BLOCK_SIZE as u32 + index as u32 * 4, &mut raw)?;
        Ok(read_le_u32(&raw, 0))
    }

    fn write_ptr(&self, block: u32, index: usize, value: u32) -> VfsResult<()> {
        let mut raw = [0u8; 4];
        write_le_u32(&mut raw, 0, value);
        buffer_cache::write_bytes(self.dev, block * BLOCK_SIZE as u32 + index as u32 * 4, &raw)
    }

    /// Walk (or build) one level of indirection.
    fn step_indirect(
        &self,
        table_block: u32,
        index: usize,
        allocate: bool,
        home_group: u32,
        new_blocks: &mut u32,
    ) -> VfsResult<u32> {
        let ptr = self.read_ptr(table_block, index)?;
        if ptr != 0 || !allocate {
            return Ok(ptr);
        }
        let fresh = self.alloc_block(home_group)?;
        *new_blocks += 1;
        self.write_ptr(table_block, index, fresh)?;
        Ok(fresh)
    }

    /// Map `file_block` of `inode` to a device block. Returns 0 for a hole
    /// when `allocate` is false. The inode is updated in place; the caller
    /// writes it back.
    pub(super) fn bmap(
        &self,
        ino: u32,
        inode: &mut DiskInode,
        file_block: u32,
        allocate: bool,
    ) -> VfsResult<u32> {
        let home_group = self.inode_group(ino);
        let mut new_blocks = 0u32;
        let ptrs = PTRS_PER_BLOCK as u32;
        let mut n = file_block as usize;

        let result = if n < DIRECT_BLOCKS {
            let mut ptr = inode.block[n];
            if ptr == 0 && allocate {
                ptr = self.alloc_block(home_group)?;
                new_blocks += 1;
                inode.block[n] = ptr;
            }
            Ok(ptr)
        } else {
            n -= DIRECT_BLOCKS;
            if n < PTRS_PER_BLOCK {
                // Single indirect.
                let mut table = inode.block[IND_SINGLE];
                if table == 0 {
                    if !allocate {
                        return Ok(0);
                    }
                    table = self.alloc_block(home_group)?;
                    new_blocks += 1;
                    inode.block[IND_SINGLE] = table;
                }
                self.step_indirect(table, n, allocate, home_group, &mut new_blocks)
            } else if n < PTRS_PER_BLOCK * (1 + PTRS_PER_BLOCK) {
                // Double indirect.
                n -= PTRS_PER_BLOCK;
                let mut l1 = inode.block[IND_DOUBLE];
                if l1 == 0 {
                    if !allocate {
                        return Ok(0);
                    }
                    l1 = self.alloc_block(home_group)?;
                    new_blocks += 1;
                    inode.block[IND_DOUBLE] = l1;
                }
                let l2 = self.step_indirect(
                    l1,
                    n / PTRS_PER_BLOCK,
                    allocate,
                    home_group,
                    &mut new_blocks,
                )?;
                if l2 == 0 {
                    return Ok(0);
                }
                self.step_indirect(l2, n % PTRS_PER_BLOCK, allocate, home_group, &mut new_blocks)
            } else {
                // Triple indirect.
                n -= PTRS_PER_BLOCK * (1 + PTRS_PER_BLOCK);
                let per_l2 = PTRS_PER_BLOCK * PTRS_PER_BLOCK;
                if n as u32 >= ptrs * ptrs * ptrs {
                    return Err(VfsError::Invalid);
                }
                let mut l1 = inode.block[IND_TRIPLE];
                if l1 == 0 {
                    if !allocate {
                        return Ok(0);
                    }
                    l1 = self.alloc_block(home_group)?;
                    new_blocks += 1;
                    inode.block[IND_TRIPLE] = l1;
                }
                let l2 = self.step_indirect(l1, n / per_l2, allocate, home_group, &mut new_blocks)?;
                if l2 == 0 {
                    return Ok(0);
                }
                let l3 = self.step_indirect(
                    l2,
                    (n % per_l2) / PTRS_PER_BLOCK,
                    allocate,
                    home_group,
                    &mut new_blocks,
                )?;
                if l3 == 0 {
                    return Ok(0);
                }
                self.step_indirect(l3, n % PTRS_PER_BLOCK, allocate, home_group, &mut new_blocks)
            }
        };
        inode.sectors += new_blocks * SECTORS_PER_BLOCK;
        result
    }

    /// Read file bytes; holes read as zeros; the range is clamped at
    /// `inode.size`.
    pub(super) fn read_data(
        &self,
        ino: u32,
        inode: &mut DiskInode,
        offset: u32,
        buf: &mut [u8],
    ) -> VfsResult<usize> {
        if offset >= inode.size {
            return Ok(0);
        }
        let len = (buf.len() as u32).min(inode.size - offset) as usize;
        let mut done = 0usize;
        while done < len {
            let pos = offset as usize + done;
            let file_block = (pos / BLOCK_SIZE) as u32;
            let within = pos % BLOCK_SIZE;
            let chunk = (BLOCK_SIZE - within).min(len - done);
            let block = self.bmap(ino, inode, file_block, false)?;
            if block == 0 {
                buf[done..done + chunk].fill(0);
            } else {
                buffer_cache::read_bytes(
                    self.dev,
                    block * BLOCK_SIZE as u32 + within as u32,
                    &mut buf[done..done + chunk],
                )?;
            }
            done += chunk;
        }
        Ok(len)
    }

    /// Write file bytes, allocating blocks and growing `inode.size` as
    /// needed. The caller persists the inode afterwards.
    pub(super) fn write_data(
        &self,
        ino: u32,
        inode: &mut DiskInode,
        offset: u32,
        buf: &[u8],
    ) -> VfsResult<usize> {
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset as usize + done;
            let file_block = (pos / BLOCK_SIZE) as u32;
            let within = pos % BLOCK_SIZE;
            let chunk = (BLOCK_SIZE - within).min(buf.len() - done);
            let block = self.bmap(ino, inode, file_block, true)?;
            buffer_cache::write_bytes(
                self.dev,
                block * BLOCK_SIZE as u32 + within as u32,
                &buf[done..done + chunk],
            )?;
            done += chunk;
        }
        let end = offset + buf.len() as u32;
        if end > inode.size {
            inode.size = end;
        }
        Ok(buf.len())
    }

    /// Free every data and indirect block past `new_size` (rounded up to a
    /// block) and shrink the inode.
    pub(super) fn truncate_inode(
        &self,
        _ino: u32,
        inode: &mut DiskInode,
        new_size: u32,
    ) -> VfsResult<()> {
        let keep_blocks = new_size.div_ceil(BLOCK_SIZE as u32);
        let had_blocks = inode.size.div_ceil(BLOCK_SIZE as u32);
        let mut freed = 0u32;

        // Direct pointers.
        for i in 0..DIRECT_BLOCKS {
            if (i as u32) >= keep_blocks && inode.block[i] != 0 {
                self.free_block(inode.block[i])?;
                inode.block[i] = 0;
                freed += 1;
            }
        }

        // Indirect trees: only full teardown (truncate to within the
        // direct range or to zero frees them; partial shrink keeps the
        // trees and leaves holes, which is valid ext2).
        if keep_blocks <= DIRECT_BLOCKS as u32 {
            if inode.block[IND_SINGLE] != 0 {
                freed += self.free_indirect_tree(inode.block[IND_SINGLE], 1)?;
                inode.block[IND_SINGLE] = 0;
            }
            if inode.block[IND_DOUBLE] != 0 {
                freed += self.free_indirect_tree(inode.block[IND_DOUBLE], 2)?;
                inode.block[IND_DOUBLE] = 0;
            }
            if inode.block[IND_TRIPLE] != 0 {
                freed += self.free_indirect_tree(inode.block[IND_TRIPLE], 3)?;
                inode.block[IND_TRIPLE] = 0;
            }
        }

        let _ = had_blocks;
        inode.size = new_size;
        inode.sectors = inode.sectors.saturating_sub(freed * SECTORS_PER_BLOCK);
        Ok(())
    }

    /// Free an indirect pointer tree of the given depth; returns blocks
    /// freed (data and table blocks alike).
    pub(super) fn free_indirect_tree(&self, table_block: u32, depth: u8) -> VfsResult<u32> {
        let mut freed = 0u32;
        for index in 0..PTRS_PER_BLOCK {
            let ptr = self.read_ptr(table_block, index)?;
            if ptr == 0 {
                continue;
            }
            if depth > 1 {
                freed += self.free_indirect_tree(ptr, depth - 1)?;
            } else {
                self.free_block(ptr)?;
                freed += 1;
            }
        }
        self.free_block(table_block)?;
        Ok(freed + 1)
    }
}
