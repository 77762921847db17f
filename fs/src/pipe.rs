//! Anonymous pipes.
//!
//! A 4 KiB ring with a condition variable per direction. Reads block while
//! the ring is empty and a writer exists; writes block while it is full and
//! a reader exists. A write with no readers fails with `PipeClosed` (the
//! syscall layer turns that into SIGPIPE); a read with no writers drains
//! the ring and then reports end of file.

extern crate alloc;

use alloc::sync::Arc;

use cinder_lib::{CondVar, IrqMutex, RingBuffer};

use crate::error::{VfsError, VfsResult};

const PIPE_CAPACITY: usize = 4096;

struct PipeInner {
    ring: RingBuffer<u8, PIPE_CAPACITY>,
    readers: u32,
    writers: u32,
}

pub struct Pipe {
    inner: IrqMutex<PipeInner>,
    /// Signalled when bytes arrive or the last writer leaves.
    readable: CondVar,
    /// Signalled when space appears or the last reader leaves.
    writable: CondVar,
}

impl Pipe {
    /// A fresh pipe with one reader and one writer reference.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: IrqMutex::new(PipeInner {
                ring: RingBuffer::new_with(0),
                readers: 1,
                writers: 1,
            }),
            readable: CondVar::new(),
            writable: CondVar::new(),
        })
    }

    pub fn add_reader(&self) {
        self.inner.lock().readers += 1;
    }

    pub fn add_writer(&self) {
        self.inner.lock().writers += 1;
    }

    pub fn drop_reader(&self) {
        let mut inner = self.inner.lock();
        inner.readers = inner.readers.saturating_sub(1);
        if inner.readers == 0 {
            drop(inner);
            // Writers blocked on a full ring must learn there is no one
            // left to drain it.
            self.writable.broadcast();
        }
    }

    pub fn drop_writer(&self) {
        let mut inner = self.inner.lock();
        inner.writers = inner.writers.saturating_sub(1);
        if inner.writers == 0 {
            drop(inner);
            self.readable.broadcast();
        }
    }

    /// Blocking read; returns 0 at end of file.
    pub fn read(&self, buf: &mut [u8]) -> VfsResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut guard = self.inner.lock();
        loop {
            if !guard.ring.is_empty() {
                let n = guard.ring.pop_slice(buf);
                drop(guard);
                self.writable.broadcast();
                return Ok(n);
            }
            if guard.writers == 0 {
                return Ok(0); // EOF
            }
            match self.readable.wait_intr(guard) {
                Ok(g) => guard = g,
                Err((_, _)) => return Err(VfsError::Interrupted),
            }
        }
    }

    /// Non-blocking read.
    pub fn read_nonblock(&self, buf: &mut [u8]) -> VfsResult<usize> {
        let mut guard = self.inner.lock();
        if !guard.ring.is_empty() {
            let n = guard.ring.pop_slice(buf);
            drop(guard);
            self.writable.broadcast();
            Ok(n)
        } else if guard.writers == 0 {
            Ok(0)
        } else {
            Err(VfsError::WouldBlock)
        }
    }

    /// Blocking write of the whole buffer (short only on interruption).
    pub fn write(&self, buf: &[u8]) -> VfsResult<usize> {
        let mut written = 0usize;
        let mut guard = self.inner.lock();
        while written < buf.len() {
            if guard.readers == 0 {
                if written > 0 {
                    drop(guard);
                    self.readable.broadcast();
                    return Ok(written);
                }
                return Err(VfsError::PipeClosed);
            }
            let n = guard.ring.push_slice(&buf[written..]);
            if n > 0 {
                written += n;
                drop(guard);
                self.readable.broadcast();
                if written == buf.len() {
                    return Ok(written);
                }
                guard = self.inner.lock();
                continue;
            }
            match self.writable.wait_intr(guard) {
                Ok(g) => guard = g,
                Err((_, _)) => {
                    if written > 0 {
                        return Ok(written);
                    }
                    return Err(VfsError::Interrupted);
                }
            }
        }
        Ok(written)
    }

    /// Non-blocking write.
    pub fn write_nonblock(&self, buf: &[u8]) -> VfsResult<usize> {
        let mut guard = self.inner.lock();
        if guard.readers == 0 {
            return Err(VfsError::PipeClosed);
        }
        let n = guard.ring.push_slice(buf);
        drop(guard);
        if n == 0 {
            Err(VfsError::WouldBlock)
        } else {
            self.readable.broadcast();
            Ok(n)
        }
    }

    /// Bytes currently buffered (select support).
    pub fn bytes_available(&self) -> usize {
        self.inner.lock().ring.len()
    }

    /// `true` if the write side would accept at least one byte.
    pub fn has_space(&self) -> bool {
        let inner = self.inner.lock();
        inner.readers > 0 && !inner.ring.is_full()
    }

    /// `true` when no writer remains.
    pub fn write_side_closed(&self) -> bool {
        self.inner.lock().writers == 0
    }
}
