//! Directory entry management.
//!
//! Entries are the classic ext2 rec_len chains. Every mutation touches
//! exactly one 1 KiB block and goes through a single block-cache write, so
//! an aborted update leaves the previous, consistent entry chain in place
//! (the block either has the old bytes or the new bytes).

use cinder_abi::fs::MAX_NAME_LEN;

use crate::blockdev::BLOCK_SIZE;
use crate::buffer_cache;
use crate::error::{VfsError, VfsResult};

use super::Ext2Fs;
use super::disk::{DIRENT_HEADER, DiskInode, dirent_size, read_le_u16, read_le_u32};

/// One parsed directory entry.
pub(super) struct RawEntry {
    /// Byte offset of the entry within the directory file.
    pub offset: usize,
    pub ino: u32,
    pub rec_len: usize,
    pub name: [u8; MAX_NAME_LEN],
    pub name_len: usize,
}

impl RawEntry {
    pub fn name(&self) -> &[u8] {
        &self.name[..self.name_len]
    }
}

impl Ext2Fs {
    /// Walk the entry chain; `f` returns `false` to stop early. Skips
    /// erased entries (ino 0) but reports their space to the callback via
    /// the offsets.
    pub(super) fn for_each_entry(
        &self,
        ino: u32,
        inode: &mut DiskInode,
        mut f: impl FnMut(&RawEntry) -> bool,
    ) -> VfsResult<()> {
        let blocks = inode.size.div_ceil(BLOCK_SIZE as u32);
        for file_block in 0..blocks {
            let device_block = self.bmap(ino, inode, file_block, false)?;
            if device_block == 0 {
                continue; // hole in a directory: nothing to enumerate
            }
            let entry = buffer_cache::get_block(self.dev, device_block)?;
            let stop = entry.with_data(|data| {
                let mut cursor = 0usize;
                while cursor + DIRENT_HEADER <= BLOCK_SIZE {
                    let rec_len = read_le_u16(data, cursor + 4) as usize;
                    if rec_len < DIRENT_HEADER || cursor + rec_len > BLOCK_SIZE {
                        return Err(VfsError::IoError); // corrupt chain
                    }
                    let entry_ino = read_le_u32(data, cursor);
                    if entry_ino != 0 {
                        let name_len = (data[cursor + 6] as usize).min(MAX_NAME_LEN);
                        let mut name = [0u8; MAX_NAME_LEN];
                        name[..name_len]
                            .copy_from_slice(&data[cursor + 8..cursor + 8 + name_len]);
                        let raw = RawEntry {
                            offset: file_block as usize * BLOCK_SIZE + cursor,
                            ino: entry_ino,
                            rec_len,
                            name,
                            name_len,
                        };
                        if !f(&raw) {
                            return Ok(true);
                        }
                    }
                    cursor += rec_len;
                }
                Ok(false)
            })?;
            if stop {
                break;
            }
        }
        Ok(())
    }

    /// Find `name`; returns its inode.
    pub(super) fn dir_find(
        &self,
        ino: u32,
        inode: &mut DiskInode,
        name: &[u8],
    ) -> VfsResult<u32> {
        let mut found = 0u32;
        self.for_each_entry(ino, inode, |entry| {
            if entry.name() == name {
                found = entry.ino;
                false
            } else {
                true
            }
        })?;
        if found == 0 {
            Err(VfsError::NotFound)
        } else {
            Ok(found)
        }
    }

    /// Add an entry, reusing slack in existing blocks before appending a
    /// fresh block. The caller persists the (possibly grown) inode.
    pub(super) fn dir_add_entry(
        &self,
        dir_ino: u32,
        dir_inode: &mut DiskInode,
        name: &[u8],
        target_ino: u32,
    ) -> VfsResult<()> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(VfsError::NameTooLong);
        }
        let needed = dirent_size(name.len());

        // Pass 1: look for slack inside the existing blocks.
        let blocks = dir_inode.size.div_ceil(BLOCK_SIZE as u32);
        for file_block in 0..blocks {
            let device_block = self.bmap(dir_ino, dir_inode, file_block, false)?;
            if device_block == 0 {
                continue;
            }
            let entry = buffer_cache::get_block(self.dev, device_block)?;
            let inserted = entry.with_data_mut(|data| {
                let mut cursor = 0usize;
                while cursor + DIRENT_HEADER <= BLOCK_SIZE {
                    let rec_len = read_le_u16(data, cursor + 4) as usize;
                    if rec_len < DIRENT_HEADER || cursor + rec_len > BLOCK_SIZE {
                        return false;
                    }
                    let entry_ino = read_le_u32(data, cursor);
                    let used = if entry_ino == 0 {
                        0
                    } else {
                        dirent_size(data[cursor + 6] as usize)
                    };
                    if rec_len - used >= needed {
                        // Split: the live entry keeps `used` bytes, the
                        // newcomer takes the tail of the record.
                        let (new_cursor, new_rec) = if used == 0 {
                            (cursor, rec_len)
                        } else {
                            write_rec_len(data, cursor, used);
                            (cursor + used, rec_len - used)
                        };
                        write_dirent(data, new_cursor, target_ino, new_rec, name);
                        return true;
                    }
                    cursor += rec_len;
                }
                false
            });
            if inserted {
                return Ok(());
            }
        }

        // Pass 2: append a fresh block holding just this entry.
        let file_block = blocks;
        let device_block = self.bmap(dir_ino, dir_inode, file_block, true)?;
        let entry = buffer_cache::get_block(self.dev, device_block)?;
        entry.with_data_mut(|data| {
            write_dirent(data, 0, target_ino, BLOCK_SIZE, name);
        });
        dir_inode.size = (file_block + 1) * BLOCK_SIZE as u32;
        Ok(())
    }

    /// Remove the entry `name`. Its record length is merged into the
    /// predecessor in the same block (or the slot is erased when it leads
    /// the block).
    pub(super) fn dir_remove_entry(
        &self,
        dir_ino: u32,
        dir_inode: &mut DiskInode,
        name: &[u8],
    ) -> VfsResult<()> {
        let blocks = dir_inode.size.div_ceil(BLOCK_SIZE as u32);
        for file_block in 0..blocks {
            let device_block = self.bmap(dir_ino, dir_inode, file_block, false)?;
            if device_block == 0 {
                continue;
            }
            let entry = buffer_cache::get_block(self.dev, device_block)?;
            let removed = entry.with_data_mut(|data| {
                let mut prev: Option<usize> = None;
                let mut cursor = 0usize;
                while cursor + DIRENT_HEADER <= BLOCK_SIZE {
                    let rec_len = read_le_u16(data, cursor + 4) as usize;
                    if rec_len < DIRENT_HEADER || cursor + rec_len > BLOCK_SIZE {
                        return false;
                    }
                    let entry_ino = read_le_u32(data, cursor);
                    if entry_ino != 0 {
                        let name_len = data[cursor + 6] as usize;
                        if &data[cursor + 8..cursor + 8 + name_len.min(MAX_NAME_LEN)] == name {
                            match prev {
                                Some(prev_cursor) => {
                                    let prev_rec = read_le_u16(data, prev_cursor + 4) as usize;
                                    write_rec_len(data, prev_cursor, prev_rec + rec_len);
                                }
                                None => {
                                    // Block-leading entry: erase in place.
                                    data[cursor..cursor + 4].fill(0);
                                }
                            }
                            return true;
                        }
                    }
                    prev = Some(cursor);
                    cursor += rec_len;
                }
                false
            });
            if removed {
                return Ok(());
            }
        }
        Err(VfsError::NotFound)
    }

    /// Repoint an existing entry (used to rewrite `..` when a directory
    /// moves).
    pub(super) fn dir_set_entry_ino(
        &self,
        dir_ino: u32,
        dir_inode: &mut DiskInode,
        name: &[u8],
        new_target: u32,
    ) -> VfsResult<()> {
        let blocks = dir_inode.size.div_ceil(BLOCK_SIZE as u32);
        for file_block in 0..blocks {
            let device_block = self.bmap(dir_ino, dir_inode, file_block, false)?;
            if device_block == 0 {
                continue;
            }
            let entry = buffer_cache::get_block(self.dev, device_block)?;
            let done = entry.with_data_mut(|data| {
                let mut cursor = 0usize;
                while cursor + DIRENT_HEADER <= BLOCK_SIZE {
                    let rec_len = read_le_u16(data, cursor + 4) as usize;
                    if rec_len < DIRENT_HEADER || cursor + rec_len > BLOCK_SIZE {
                        return false;
                    }
                    let entry_ino = read_le_u32(data, cursor);
                    if entry_ino != 0 {
                        let name_len = data[cursor + 6] as usize;
                        if &data[cursor + 8..cursor + 8 + name_len.min(MAX_NAME_LEN)] == name {
                            data[cursor..cursor + 4].copy_from_slice(&new_target.to_le_bytes());
                            return true;
                        }
                    }
                    cursor += rec_len;
                }
                false
            });
            if done {
                return Ok(());
            }
        }
        Err(VfsError::NotFound)
    }

    /// `true` if the directory holds only `.` and `..`.
    pub(super) fn dir_is_empty(&self, ino: u32, inode: &mut DiskInode) -> VfsResult<bool> {
        let mut empty = true;
        self.for_each_entry(ino, inode, |entry| {
            if entry.name() != b"." && entry.name() != b".." {
                empty = false;
                false
            } else {
                true
            }
        })?;
        Ok(empty)
    }
}

fn write_rec_len(data: &mut [u8], cursor: usize, rec_len: usize) {
    data[cursor + 4..cursor + 6].copy_from_slice(&(rec_len as u16).to_le_bytes());
}

/// Lay down a complete entry at `cursor`. `file_type` stays zero
/// (revision 0 without the filetype feature).
fn write_dirent(data: &mut [u8], cursor: usize, ino: u32, rec_len: usize, name: &[u8]) {
    data[cursor..cursor + 4].copy_from_slice(&ino.to_le_bytes());
    write_rec_len(data, cursor, rec_len);
    data[cursor + 6] = name.len() as u8;
    data[cursor + 7] = 0;
    data[cursor + 8..cursor + 8 + name.len()].copy_from_slice(name);
}
