//! Write-back block cache.
//!
//! A bounded set of 1 KiB blocks keyed by `(dev, block)`, with at most one
//! entry per key. Lookups update a monotonic use counter that stands in
//! for the LRU chain position; eviction takes the least recently used
//! clean entry, or writes back and takes the least recently used dirty one
//! when everything is dirty.
//!
//! Each entry carries its own blocking rw-lock: concurrent readers share
//! an entry, a writer excludes them, and device I/O for a miss happens
//! under the entry's write lock with the cache map lock already dropped
//! (a spinlock is never held across device I/O).

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use cinder_lib::{IrqMutex, RwSem, klog_debug};

use crate::blockdev::{self, BLOCK_SIZE, DevId};
use crate::error::{VfsError, VfsResult};

/// Maximum resident blocks.
const CACHE_CAPACITY: usize = 256;

/// One cached block.
pub struct CacheBlock {
    pub dev: DevId,
    pub block: u32,
    /// Readers share, writers exclude; also held for the miss fill.
    lock: RwSem,
    data: UnsafeCell<[u8; BLOCK_SIZE]>,
    /// Block bytes differ from the device copy.
    dirty: AtomicBool,
    /// Device bytes have been read in (cleared until the first fill).
    loaded: AtomicBool,
    /// LRU position stand-in.
    last_use: AtomicU64,
}

// SAFETY: `data` is only touched under `lock` per the access discipline in
// this module.
unsafe impl Send for CacheBlock {}
unsafe impl Sync for CacheBlock {}

impl CacheBlock {
    fn new(dev: DevId, block: u32) -> Self {
        Self {
            dev,
            block,
            lock: RwSem::new(),
            data: UnsafeCell::new([0; BLOCK_SIZE]),
            dirty: AtomicBool::new(false),
            loaded: AtomicBool::new(false),
            last_use: AtomicU64::new(0),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Read bytes out of the block under the read lock.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8; BLOCK_SIZE]) -> R) -> R {
        self.lock.read_lock();
        // SAFETY: read lock held; writers excluded.
        let r = f(unsafe { &*self.data.get() });
        self.lock.read_unlock();
        r
    }

    /// Mutate the block under the write lock and mark it dirty.
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8; BLOCK_SIZE]) -> R) -> R {
        self.lock.write_lock();
        // SAFETY: write lock held; exclusive.
        let r = f(unsafe { &mut *self.data.get() });
        self.dirty.store(true, Ordering::Release);
        self.lock.write_unlock();
        r
    }

    /// Write the block back to its device if dirty.
    fn writeback(&self) -> VfsResult<()> {
        if !self.dirty.load(Ordering::Acquire) {
            return Ok(());
        }
        let device = blockdev::block_device(self.dev)?;
        self.lock.read_lock();
        // SAFETY: read lock held for a consistent snapshot.
        let result = device.write_blocks(self.block, unsafe { &*self.data.get() });
        self.lock.read_unlock();
        if result.is_ok() {
            self.dirty.store(false, Ordering::Release);
        }
        result
    }
}

struct CacheMap {
    entries: BTreeMap<(DevId, u32), Arc<CacheBlock>>,
}

static CACHE: IrqMutex<CacheMap> = IrqMutex::new(CacheMap {
    entries: BTreeMap::new(),
});

static USE_COUNTER: AtomicU64 = AtomicU64::new(1);

fn touch(entry: &CacheBlock) {
    entry
        .last_use
        .store(USE_COUNTER.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
}

/// Get (loading if needed) the cache entry for `(dev, block)`.
pub fn get_block(dev: DevId, block: u32) -> VfsResult<Arc<CacheBlock>> {
    let (entry, fresh, displaced) = {
        let mut cache = CACHE.lock();
        match cache.entries.get(&(dev, block)) {
            Some(entry) => (entry.clone(), false, None),
            None => {
                let displaced = if cache.entries.len() >= CACHE_CAPACITY {
                    Some(evict_one(&mut cache)?)
                } else {
                    None
                };
                let entry = Arc::new(CacheBlock::new(dev, block));
                cache.entries.insert((dev, block), entry.clone());
                (entry, true, displaced)
            }
        }
    };
    // A dirty victim leaves the map under the lock but hits the device
    // only now; entry locks can sleep and the cache lock must not.
    if let Some(victim) = displaced.flatten() {
        victim.writeback()?;
    }
    touch(&entry);

    if fresh || !entry.loaded.load(Ordering::Acquire) {
        // Fill under the write lock; a racing second miss waits here and
        // then sees `loaded`.
        entry.lock.write_lock();
        if !entry.loaded.load(Ordering::Acquire) {
            let device = blockdev::block_device(dev)?;
            // SAFETY: write lock held; exclusive.
            let result = device.read_blocks(block, unsafe { &mut *entry.data.get() });
            match result {
                Ok(()) => entry.loaded.store(true, Ordering::Release),
                Err(e) => {
                    entry.lock.write_unlock();
                    CACHE.lock().entries.remove(&(dev, block));
                    return Err(e);
                }
            }
        }
        entry.lock.write_unlock();
    }
    Ok(entry)
}

/// Drop the least recently used evictable entry. Prefers clean entries;
/// a dirty victim is removed from the map and handed back so the caller
/// can write it out once the cache lock is gone.
fn evict_one(cache: &mut CacheMap) -> VfsResult<Option<Arc<CacheBlock>>> {
    let mut oldest_clean: Option<((DevId, u32), u64)> = None;
    let mut oldest_dirty: Option<((DevId, u32), u64)> = None;
    for (key, entry) in cache.entries.iter() {
        // Referenced entries (beyond the map's own Arc) are pinned.
        if Arc::strong_count(entry) > 1 {
            continue;
        }
        let stamp = entry.last_use.load(Ordering::Relaxed);
        let slot = if entry.is_dirty() {
            &mut oldest_dirty
        } else {
            &mut oldest_clean
        };
        if slot.is_none_or(|(_, s)| stamp < s) {
            *slot = Some((*key, stamp));
        }
    }

    if let Some((key, _)) = oldest_clean {
        cache.entries.remove(&key);
        return Ok(None);
    }
    if let Some((key, _)) = oldest_dirty {
        return Ok(cache.entries.remove(&key));
    }
    // Everything pinned: the cache is undersized for the workload.
    Err(VfsError::NoSpace)
}

/// Read an arbitrary byte range from a device through the cache.
pub fn read_bytes(dev: DevId, offset: u32, buf: &mut [u8]) -> VfsResult<()> {
    let mut done = 0usize;
    while done < buf.len() {
        let pos = offset as usize + done;
        let block = (pos / BLOCK_SIZE) as u32;
        let within = pos % BLOCK_SIZE;
        let chunk = (BLOCK_SIZE - within).min(buf.len() - done);
        let entry = get_block(dev, block)?;
        entry.with_data(|data| {
            buf[done..done + chunk].copy_from_slice(&data[within..within + chunk]);
        });
        done += chunk;
    }
    Ok(())
}

/// Write an arbitrary byte range through the cache (write-back: entries are
/// only marked dirty here).
pub fn write_bytes(dev: DevId, offset: u32, buf: &[u8]) -> VfsResult<()> {
    let mut done = 0usize;
    while done < buf.len() {
        let pos = offset as usize + done;
        let block = (pos / BLOCK_SIZE) as u32;
        let within = pos % BLOCK_SIZE;
        let chunk = (BLOCK_SIZE - within).min(buf.len() - done);
        let entry = get_block(dev, block)?;
        entry.with_data_mut(|data| {
            data[within..within + chunk].copy_from_slice(&buf[done..done + chunk]);
        });
        done += chunk;
    }
    Ok(())
}

/// Write every dirty block of `dev` back, oldest first.
pub fn sync_device(dev: DevId) -> VfsResult<()> {
    sync_filtered(Some(dev))
}

/// Write every dirty block back, oldest first.
pub fn sync_all() -> VfsResult<()> {
    sync_filtered(None)
}

fn sync_filtered(dev: Option<DevId>) -> VfsResult<()> {
    // Snapshot the dirty set, then write back outside the cache lock in
    // LRU order.
    let mut dirty: alloc::vec::Vec<Arc<CacheBlock>> = {
        let cache = CACHE.lock();
        cache
            .entries
            .values()
            .filter(|e| e.is_dirty() && dev.is_none_or(|d| e.dev == d))
            .cloned()
            .collect()
    };
    dirty.sort_by_key(|e| e.last_use.load(Ordering::Relaxed));
    for entry in dirty {
        entry.writeback()?;
    }
    Ok(())
}

/// Drop every entry of `dev` (unmount); dirty blocks are written back
/// first.
pub fn invalidate_device(dev: DevId) -> VfsResult<()> {
    sync_device(dev)?;
    let mut cache = CACHE.lock();
    let before = cache.entries.len();
    cache.entries.retain(|(d, _), _| *d != dev);
    klog_debug!(
        "bcache: dropped {} entries for dev {}",
        before - cache.entries.len(),
        dev
    );
    Ok(())
}

/// Number of resident entries (diagnostics and tests).
pub fn cached_count() -> usize {
    CACHE.lock().entries.len()
}

/// `true` if `(dev, block)` is resident (test hook).
pub fn is_cached(dev: DevId, block: u32) -> bool {
    CACHE.lock().entries.contains_key(&(dev, block))
}
