//! Blocking reader/writer lock built from two semaphores and a reader
//! count.
//!
//! The first reader takes the writer semaphore on behalf of all readers and
//! the last one releases it; writers take it directly. This is the classic
//! construction and it is deliberately not fair to writers: a continuous
//! stream of readers keeps the writer semaphore held indefinitely. Callers
//! that need writer progress under read load must arrange their own
//! backoff.

use cinder_abi::error::KernelResult;

use crate::IrqMutex;
use crate::semaphore::Semaphore;

pub struct RwSem {
    /// Serializes reader-count updates.
    gate: Semaphore,
    /// Held by the writer, or by the reader block as a whole.
    wrt: Semaphore,
    readers: IrqMutex<u32>,
}

impl RwSem {
    pub const fn new() -> Self {
        Self {
            gate: Semaphore::new(1),
            wrt: Semaphore::new(1),
            readers: IrqMutex::new(0),
        }
    }

    /// Acquire shared access.
    pub fn read_lock(&self) {
        self.gate.down();
        let first = {
            let mut readers = self.readers.lock();
            *readers += 1;
            *readers == 1
        };
        if first {
            self.wrt.down();
        }
        self.gate.up();
    }

    /// Interruptible shared acquire.
    pub fn read_lock_intr(&self) -> KernelResult {
        self.gate.down_intr()?;
        let first = {
            let mut readers = self.readers.lock();
            *readers += 1;
            *readers == 1
        };
        if first {
            if let Err(e) = self.wrt.down_intr() {
                // Undo the count we took; we never got the writer gate.
                let mut readers = self.readers.lock();
                *readers -= 1;
                drop(readers);
                self.gate.up();
                return Err(e);
            }
        }
        self.gate.up();
        Ok(())
    }

    /// Release shared access.
    pub fn read_unlock(&self) {
        let last = {
            let mut readers = self.readers.lock();
            debug_assert!(*readers > 0, "read_unlock without read_lock");
            *readers -= 1;
            *readers == 0
        };
        if last {
            self.wrt.up();
        }
    }

    /// Acquire exclusive access.
    pub fn write_lock(&self) {
        self.wrt.down();
    }

    /// Interruptible exclusive acquire.
    pub fn write_lock_intr(&self) -> KernelResult {
        self.wrt.down_intr()
    }

    /// Release exclusive access.
    pub fn write_unlock(&self) {
        self.wrt.up();
    }

    /// Run `f` under the read lock.
    pub fn with_read<R>(&self, f: impl FnOnce() -> R) -> R {
        self.read_lock();
        let r = f();
        self.read_unlock();
        r
    }

    /// Run `f` under the write lock.
    pub fn with_write<R>(&self, f: impl FnOnce() -> R) -> R {
        self.write_lock();
        let r = f();
        self.write_unlock();
        r
    }
}

impl Default for RwSem {
    fn default() -> Self {
        Self::new()
    }
}
