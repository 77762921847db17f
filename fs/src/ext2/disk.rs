//! ext2 on-disk structures (revision 0, 1 KiB blocks, little-endian).

use cinder_abi::fs::FileKind;

use crate::blockdev::BLOCK_SIZE;

pub const EXT2_MAGIC: u16 = 0xEF53;
/// Byte offset of the superblock.
pub const SUPERBLOCK_OFFSET: u32 = 1024;
/// With 1 KiB blocks the superblock lives in block 1 and the group
/// descriptor table starts at block 2.
pub const GROUP_DESC_BLOCK: u32 = 2;
pub const GROUP_DESC_SIZE: usize = 32;

pub const ROOT_INO: u32 = 2;
/// First inode available for allocation in revision 0.
pub const FIRST_FREE_INO: u32 = 11;
pub const INODE_SIZE: usize = 128;

/// Block pointers held directly in the inode.
pub const DIRECT_BLOCKS: usize = 12;
/// Pointers per indirect block (1024 / 4).
pub const PTRS_PER_BLOCK: usize = BLOCK_SIZE / 4;

pub const IND_SINGLE: usize = 12;
pub const IND_DOUBLE: usize = 13;
pub const IND_TRIPLE: usize = 14;

// Inode mode bits mirror the VFS mode bits (ext2 inherited them from
// Unix, same as we did).
pub const EXT2_S_IFDIR: u16 = 0x4000;
pub const EXT2_S_IFREG: u16 = 0x8000;

#[inline]
pub fn read_le_u16(bytes: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([bytes[off], bytes[off + 1]])
}

#[inline]
pub fn read_le_u32(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

#[inline]
pub fn write_le_u16(bytes: &mut [u8], off: usize, value: u16) {
    bytes[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_u32(bytes: &mut [u8], off: usize, value: u32) {
    bytes[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

/// Parsed superblock (the fields this driver maintains).
#[derive(Clone, Copy, Debug)]
pub struct Superblock {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub magic: u16,
}

impl Superblock {
    pub fn parse(raw: &[u8]) -> Self {
        Self {
            inodes_count: read_le_u32(raw, 0),
            blocks_count: read_le_u32(raw, 4),
            free_blocks_count: read_le_u32(raw, 12),
            free_inodes_count: read_le_u32(raw, 16),
            first_data_block: read_le_u32(raw, 20),
            log_block_size: read_le_u32(raw, 24),
            blocks_per_group: read_le_u32(raw, 32),
            inodes_per_group: read_le_u32(raw, 40),
            magic: read_le_u16(raw, 56),
        }
    }

    /// Serialize a full 1 KiB superblock image.
    pub fn encode(&self, raw: &mut [u8]) {
        write_le_u32(raw, 0, self.inodes_count);
        write_le_u32(raw, 4, self.blocks_count);
        write_le_u32(raw, 12, self.free_blocks_count);
        write_le_u32(raw, 16, self.free_inodes_count);
        write_le_u32(raw, 20, self.first_data_block);
        write_le_u32(raw, 24, self.log_block_size);
        write_le_u32(raw, 28, self.log_block_size); // frag size tracks block size
        write_le_u32(raw, 32, self.blocks_per_group);
        write_le_u32(raw, 36, self.blocks_per_group);
        write_le_u32(raw, 40, self.inodes_per_group);
        write_le_u16(raw, 52, 1); // mnt_count
        write_le_u16(raw, 54, 0xFFFF); // max_mnt_count: unlimited
        write_le_u16(raw, 56, self.magic);
        write_le_u16(raw, 58, 1); // state: clean
        write_le_u16(raw, 60, 1); // errors: continue
        // rev_level 0 and all feature sets zero: plain revision-0 layout.
    }

    pub fn group_count(&self) -> u32 {
        (self.blocks_count - self.first_data_block).div_ceil(self.blocks_per_group)
    }
}

/// One block group descriptor.
#[derive(Clone, Copy, Debug)]
pub struct GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl GroupDesc {
    pub fn parse(raw: &[u8]) -> Self {
        Self {
            block_bitmap: read_le_u32(raw, 0),
            inode_bitmap: read_le_u32(raw, 4),
            inode_table: read_le_u32(raw, 8),
            free_blocks_count: read_le_u16(raw, 12),
            free_inodes_count: read_le_u16(raw, 14),
            used_dirs_count: read_le_u16(raw, 16),
        }
    }

    pub fn encode(&self, raw: &mut [u8]) {
        write_le_u32(raw, 0, self.block_bitmap);
        write_le_u32(raw, 4, self.inode_bitmap);
        write_le_u32(raw, 8, self.inode_table);
        write_le_u16(raw, 12, self.free_blocks_count);
        write_le_u16(raw, 14, self.free_inodes_count);
        write_le_u16(raw, 16, self.used_dirs_count);
    }
}

/// One on-disk inode.
#[derive(Clone, Copy, Debug)]
pub struct DiskInode {
    pub mode: u16,
    pub uid: u16,
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub gid: u16,
    pub links_count: u16,
    /// In 512-byte sectors, as ext2 counts them.
    pub sectors: u32,
    pub block: [u32; 15],
}

impl DiskInode {
    pub const fn empty() -> Self {
        Self {
            mode: 0,
            uid: 0,
            size: 0,
            atime: 0,
            ctime: 0,
            mtime: 0,
            dtime: 0,
            gid: 0,
            links_count: 0,
            sectors: 0,
            block: [0; 15],
        }
    }

    pub fn parse(raw: &[u8]) -> Self {
        let mut block = [0u32; 15];
        for (i, b) in block.iter_mut().enumerate() {
            *b = read_le_u32(raw, 40 + i * 4);
        }
        Self {
            mode: read_le_u16(raw, 0),
            uid: read_le_u16(raw, 2),
            size: read_le_u32(raw, 4),
            atime: read_le_u32(raw, 8),
            ctime: read_le_u32(raw, 12),
            mtime: read_le_u32(raw, 16),
            dtime: read_le_u32(raw, 20),
            gid: read_le_u16(raw, 24),
            links_count: read_le_u16(raw, 26),
            sectors: read_le_u32(raw, 28),
            block,
        }
    }

    pub fn encode(&self, raw: &mut [u8]) {
        raw.fill(0);
        write_le_u16(raw, 0, self.mode);
        write_le_u16(raw, 2, self.uid);
        write_le_u32(raw, 4, self.size);
        write_le_u32(raw, 8, self.atime);
        write_le_u32(raw, 12, self.ctime);
        write_le_u32(raw, 16, self.mtime);
        write_le_u32(raw, 20, self.dtime);
        write_le_u16(raw, 24, self.gid);
        write_le_u16(raw, 26, self.links_count);
        write_le_u32(raw, 28, self.sectors);
        for (i, b) in self.block.iter().enumerate() {
            write_le_u32(raw, 40 + i * 4, *b);
        }
    }

    pub fn is_directory(&self) -> bool {
        self.mode & 0xF000 == EXT2_S_IFDIR
    }

    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }
}

/// Directory entry header: inode, rec_len, name_len, file_type (written
/// as zero in revision 0), then the name.
pub const DIRENT_HEADER: usize = 8;

/// Bytes a directory entry with `name_len` occupies (4-byte aligned).
#[inline]
pub fn dirent_size(name_len: usize) -> usize {
    (DIRENT_HEADER + name_len + 3) & !3
}
