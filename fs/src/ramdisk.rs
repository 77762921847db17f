//! RAM-backed block device.
//!
//! Boot images are unpacked into one of these; the filesystem test suites
//! run against them as well.

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;

use cinder_lib::IrqMutex;

use crate::blockdev::{BLOCK_SIZE, BlockDevice};
use crate::error::{VfsError, VfsResult};

pub struct RamDisk {
    blocks: u32,
    data: IrqMutex<Vec<u8>>,
}

impl RamDisk {
    /// A zero-filled disk of `blocks` 1 KiB blocks.
    pub fn new(blocks: u32) -> Self {
        Self {
            blocks,
            data: IrqMutex::new(vec![0u8; blocks as usize * BLOCK_SIZE]),
        }
    }

    /// Wrap an existing image (length rounded down to whole blocks).
    pub fn from_image(image: &[u8]) -> Self {
        let blocks = (image.len() / BLOCK_SIZE) as u32;
        let mut data = vec![0u8; blocks as usize * BLOCK_SIZE];
        data.copy_from_slice(&image[..blocks as usize * BLOCK_SIZE]);
        Self {
            blocks,
            data: IrqMutex::new(data),
        }
    }

    fn range(&self, first_block: u32, len: usize) -> VfsResult<core::ops::Range<usize>> {
        if len % BLOCK_SIZE != 0 {
            return Err(VfsError::Invalid);
        }
        let start = first_block as usize * BLOCK_SIZE;
        let end = start + len;
        if end > self.blocks as usize * BLOCK_SIZE {
            return Err(VfsError::Invalid);
        }
        Ok(start..end)
    }
}

impl BlockDevice for RamDisk {
    fn block_count(&self) -> u32 {
        self.blocks
    }

    fn read_blocks(&self, first_block: u32, buf: &mut [u8]) -> VfsResult<()> {
        let range = self.range(first_block, buf.len())?;
        buf.copy_from_slice(&self.data.lock()[range]);
        Ok(())
    }

    fn write_blocks(&self, first_block: u32, buf: &[u8]) -> VfsResult<()> {
        let range = self.range(first_block, buf.len())?;
        self.data.lock()[range].copy_from_slice(buf);
        Ok(())
    }
}
