//! Character device contract and registry.
//!
//! Terminals and other byte-stream devices implement [`CharDevice`] and
//! register under a minor id; device vnodes carry `(major=char, minor)` and
//! the file layer routes their I/O here.

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use cinder_lib::IrqMutex;

use crate::error::{VfsError, VfsResult};

pub type CharDevId = u16;

/// Minimal termios image for `tcgetattr`/`tcsetattr`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Termios {
    pub iflag: u32,
    pub oflag: u32,
    pub cflag: u32,
    pub lflag: u32,
}

/// Canonical mode bit in `lflag`.
pub const ICANON: u32 = 0x2;
/// Echo bit in `lflag`.
pub const ECHO: u32 = 0x8;

pub trait CharDevice: Send + Sync {
    fn open(&self) -> VfsResult<()> {
        Ok(())
    }

    fn close(&self) -> VfsResult<()> {
        Ok(())
    }

    /// Read up to `buf.len()` bytes; may block for input.
    fn read(&self, buf: &mut [u8]) -> VfsResult<usize>;

    /// Write bytes; may block on a full output queue.
    fn write(&self, buf: &[u8]) -> VfsResult<usize>;

    fn ioctl(&self, request: u32, arg: u32) -> VfsResult<u32> {
        let _ = (request, arg);
        Err(VfsError::NotSupported)
    }

    /// `true` for terminal devices (drives `isatty` and job control).
    fn is_terminal(&self) -> bool {
        false
    }

    fn tcgetattr(&self) -> VfsResult<Termios> {
        Err(VfsError::NotSupported)
    }

    fn tcsetattr(&self, termios: &Termios) -> VfsResult<()> {
        let _ = termios;
        Err(VfsError::NotSupported)
    }
}

static DEVICES: IrqMutex<BTreeMap<CharDevId, Arc<dyn CharDevice>>> = IrqMutex::new(BTreeMap::new());

pub fn register_char_device(dev: CharDevId, device: Arc<dyn CharDevice>) {
    DEVICES.lock().insert(dev, device);
}

pub fn char_device(dev: CharDevId) -> VfsResult<Arc<dyn CharDevice>> {
    DEVICES.lock().get(&dev).cloned().ok_or(VfsError::NotFound)
}
