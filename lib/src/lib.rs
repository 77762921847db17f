//! CinderOS kernel support library.
//!
//! Everything here is usable from any kernel crate without pulling in the
//! scheduler or memory manager: CPU and port primitives, logging, the
//! interrupt-safe locking primitives, the blocking primitives (semaphore,
//! condition variable, rw-lock) that reach the scheduler only through
//! registered hooks, and the in-kernel test harness.

#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

pub mod clock;
pub mod condvar;
pub mod cpu;
pub mod kdiag;
pub mod klog;
pub mod ports;
pub mod ring_buffer;
pub mod rwsem;
pub mod sched_hooks;
pub mod semaphore;
pub mod spinlock;
pub mod testing;
pub mod waitqueue;

#[doc(hidden)]
pub use paste;

pub use condvar::CondVar;
pub use klog::{KlogLevel, klog_get_level, klog_register_backend, klog_set_level};
pub use ring_buffer::RingBuffer;
pub use rwsem::RwSem;
pub use sched_hooks::{SchedHooks, TaskHandle, WakeReason, register_sched_hooks};
pub use semaphore::Semaphore;
pub use spinlock::{IrqMutex, IrqMutexGuard, IrqRwLock, IrqRwLockReadGuard, IrqRwLockWriteGuard};
pub use waitqueue::WaitQueue;

/// Round `value` down to a multiple of `align` (power of two).
#[inline]
pub const fn align_down(value: u32, align: u32) -> u32 {
    value & !(align - 1)
}

/// Round `value` up to a multiple of `align` (power of two).
#[inline]
pub const fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}
