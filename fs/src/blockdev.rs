//! Block device contract and registry.
//!
//! Drivers (PATA, AHCI, the RAM disk) implement [`BlockDevice`] over fixed
//! 1 KiB blocks and register themselves under a device id. Everything above
//! (block cache, filesystems) addresses storage as `(dev, block)`.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use cinder_lib::IrqMutex;

use crate::error::{VfsError, VfsResult};

/// Fixed block size of the block layer.
pub const BLOCK_SIZE: usize = 1024;

/// Device identifier: the minor number of the registered block device.
pub type DevId = u16;

/// The contract a block driver fulfills. Counts are in whole blocks.
pub trait BlockDevice: Send + Sync {
    /// Prepare the device for I/O.
    fn open(&self) -> VfsResult<()> {
        Ok(())
    }

    /// Flush and quiesce.
    fn close(&self) -> VfsResult<()> {
        Ok(())
    }

    /// Total block count.
    fn block_count(&self) -> u32;

    /// Read `buf.len() / BLOCK_SIZE` blocks starting at `first_block`.
    fn read_blocks(&self, first_block: u32, buf: &mut [u8]) -> VfsResult<()>;

    /// Write `buf.len() / BLOCK_SIZE` blocks starting at `first_block`.
    fn write_blocks(&self, first_block: u32, buf: &[u8]) -> VfsResult<()>;
}

static DEVICES: IrqMutex<BTreeMap<DevId, Arc<dyn BlockDevice>>> = IrqMutex::new(BTreeMap::new());

/// Register a block device under `dev`. Replaces any previous registration.
pub fn register_block_device(dev: DevId, device: Arc<dyn BlockDevice>) {
    DEVICES.lock().insert(dev, device);
}

/// Remove a registration (driver teardown).
pub fn unregister_block_device(dev: DevId) {
    DEVICES.lock().remove(&dev);
}

/// Resolve a device id.
pub fn block_device(dev: DevId) -> VfsResult<Arc<dyn BlockDevice>> {
    DEVICES.lock().get(&dev).cloned().ok_or(VfsError::NotFound)
}
