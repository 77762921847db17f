//! Block and inode allocation over the group bitmaps.
//!
//! Allocation prefers the home group (the group of the directory or file
//! the new object belongs to) and falls back to a first-fit scan across
//! the remaining groups. The group descriptor and superblock free counts
//! are kept in sync with every bitmap flip.

use crate::blockdev::BLOCK_SIZE;
use crate::buffer_cache;
use crate::error::{VfsError, VfsResult};

use super::Ext2Fs;
use super::disk::{GROUP_DESC_BLOCK, GROUP_DESC_SIZE, GroupDesc};

impl Ext2Fs {
    pub(super) fn read_group_desc(&self, group: u32) -> VfsResult<GroupDesc> {
        let mut raw = [0u8; GROUP_DESC_SIZE];
        let offset = GROUP_DESC_BLOCK * BLOCK_SIZE as u32 + group * GROUP_DESC_SIZE as u32;
        buffer_cache::read_bytes(self.dev, offset, &mut raw)?;
        Ok(GroupDesc::parse(&raw))
    }

    pub(super) fn write_group_desc(&self, group: u32, desc: &GroupDesc) -> VfsResult<()> {
        let mut raw = [0u8; GROUP_DESC_SIZE];
        desc.encode(&mut raw);
        let offset = GROUP_DESC_BLOCK * BLOCK_SIZE as u32 + group * GROUP_DESC_SIZE as u32;
        buffer_cache::write_bytes(self.dev, offset, &raw)
    }

    /// Flip the first clear bit in a bitmap block; returns the bit index.
    fn bitmap_alloc(&self, bitmap_block: u32, limit: u32) -> VfsResult<Option<u32>> {
        let entry = buffer_cache::get_block(self.dev, bitmap_block)?;
        let found = entry.with_data_mut(|data| {
            for bit in 0..limit.min((BLOCK_SIZE * 8) as u32) {
                let byte = (bit / 8) as usize;
                let mask = 1u8 << (bit % 8);
                if data[byte] & mask == 0 {
                    data[byte] |= mask;
                    return Some(bit);
                }
            }
            None
        });
        Ok(found)
    }

    fn bitmap_free(&self, bitmap_block: u32, bit: u32) -> VfsResult<()> {
        let entry = buffer_cache::get_block(self.dev, bitmap_block)?;
        let cleared = entry.with_data_mut(|data| {
            let byte = (bit / 8) as usize;
            let mask = 1u8 << (bit % 8);
            let was_set = data[byte] & mask != 0;
            data[byte] &= !mask;
            was_set
        });
        if !cleared {
            return Err(VfsError::IoError); // double free: corrupt bitmap
        }
        Ok(())
    }

    /// Allocate one data block, preferring `home_group`.
    pub(super) fn alloc_block(&self, home_group: u32) -> VfsResult<u32> {
        let (group_count, blocks_per_group, first_data_block) = {
            let sb = self.sb.lock();
            (sb.group_count(), sb.blocks_per_group, sb.first_data_block)
        };

        for probe in 0..group_count {
            let group = (home_group + probe) % group_count;
            let mut desc = self.read_group_desc(group)?;
            if desc.free_blocks_count == 0 {
                continue;
            }
            let limit = {
                let sb = self.sb.lock();
                (sb.blocks_count - first_data_block - group * blocks_per_group)
                    .min(blocks_per_group)
            };
            if let Some(bit) = self.bitmap_alloc(desc.block_bitmap, limit)? {
                desc.free_blocks_count -= 1;
                self.write_group_desc(group, &desc)?;
                let mut sb = self.sb.lock();
                sb.free_blocks_count -= 1;
                drop(sb);
                self.flush_superblock()?;
                let block = first_data_block + group * blocks_per_group + bit;
                // Fresh blocks are handed out zeroed; directory and
                // indirect code relies on it.
                let entry = buffer_cache::get_block(self.dev, block)?;
                entry.with_data_mut(|data| data.fill(0));
                return Ok(block);
            }
        }
        Err(VfsError::NoSpace)
    }

    pub(super) fn free_block(&self, block: u32) -> VfsResult<()> {
        let (blocks_per_group, first_data_block) = {
            let sb = self.sb.lock();
            (sb.blocks_per_group, sb.first_data_block)
        };
        let index = block - first_data_block;
        let group = index / blocks_per_group;
        let bit = index % blocks_per_group;

        let mut desc = self.read_group_desc(group)?;
        self.bitmap_free(desc.block_bitmap, bit)?;
        desc.free_blocks_count += 1;
        self.write_group_desc(group, &desc)?;
        let mut sb = self.sb.lock();
        sb.free_blocks_count += 1;
        drop(sb);
        self.flush_superblock()
    }

    /// Allocate an inode number, preferring `home_group`; `is_dir` keeps
    /// the used-directories counter honest.
    pub(super) fn alloc_inode(&self, home_group: u32, is_dir: bool) -> VfsResult<u32> {
        let (group_count, inodes_per_group) = {
            let sb = self.sb.lock();
            (sb.group_count(), sb.inodes_per_group)
        };

        for probe in 0..group_count {
            let group = (home_group + probe) % group_count;
            let mut desc = self.read_group_desc(group)?;
            if desc.free_inodes_count == 0 {
                continue;
            }
            if let Some(bit) = self.bitmap_alloc(desc.inode_bitmap, inodes_per_group)? {
                let ino = group * inodes_per_group + bit + 1;
                if ino < super::disk::FIRST_FREE_INO && ino != super::disk::ROOT_INO {
                    // Reserved inode slipped through a fresh bitmap; mark
                    // it used and keep scanning.
                    continue;
                }
                desc.free_inodes_count -= 1;
                if is_dir {
                    desc.used_dirs_count += 1;
                }
                self.write_group_desc(group, &desc)?;
                let mut sb = self.sb.lock();
                sb.free_inodes_count -= 1;
                drop(sb);
                self.flush_superblock()?;
                return Ok(ino);
            }
        }
        Err(VfsError::NoSpace)
    }

    pub(super) fn free_inode(&self, ino: u32, was_dir: bool) -> VfsResult<()> {
        let inodes_per_group = self.sb.lock().inodes_per_group;
        let index = ino - 1;
        let group = index / inodes_per_group;
        let bit = index % inodes_per_group;

        let mut desc = self.read_group_desc(group)?;
        self.bitmap_free(desc.inode_bitmap, bit)?;
        desc.free_inodes_count += 1;
        if was_dir && desc.used_dirs_count > 0 {
            desc.used_dirs_count -= 1;
        }
        self.write_group_desc(group, &desc)?;
        let mut sb = self.sb.lock();
        sb.free_inodes_count += 1;
        drop(sb);
        self.flush_superblock()
    }

    /// Group an inode lives in.
    pub(super) fn inode_group(&self, ino: u32) -> u32 {
        (ino - 1) / self.sb.lock().inodes_per_group
    }
}
