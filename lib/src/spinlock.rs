//! Interrupt-safe spin locks.
//!
//! [`IrqMutex`] is the kernel's spinlock: acquisition saves EFLAGS and
//! disables local interrupts, release restores them. Internally it is a
//! ticket lock, so CPUs acquire in request order and nobody starves under
//! contention. Holders must never reach a suspension point; anything that
//! can sleep uses the blocking primitives instead.
//!
//! [`IrqRwLock`] is the shared/exclusive variant used for read-mostly
//! kernel tables (mount table, socket demux). It prefers writers: once a
//! writer is queued, new readers spin until the writer has been through.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicI32, AtomicU16, AtomicU32, Ordering};

use crate::cpu;

/// Spinlock that disables local interrupts while held.
pub struct IrqMutex<T> {
    /// Next ticket to hand out. Wraps at `u16::MAX`; equality checks are
    /// wrap-safe.
    next_ticket: AtomicU16,
    /// Ticket currently being served; incremented on unlock.
    now_serving: AtomicU16,
    data: UnsafeCell<T>,
}

// SAFETY: exclusive access is guaranteed by ticket acquisition with local
// interrupts disabled, so the protected data may cross contexts.
unsafe impl<T: Send> Send for IrqMutex<T> {}
unsafe impl<T: Send> Sync for IrqMutex<T> {}

pub struct IrqMutexGuard<'a, T> {
    mutex: &'a IrqMutex<T>,
    saved_flags: u32,
}

impl<T> IrqMutex<T> {
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            next_ticket: AtomicU16::new(0),
            now_serving: AtomicU16::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// `true` if the lock is currently held or has waiters.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.next_ticket.load(Ordering::Relaxed) != self.now_serving.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let saved_flags = cpu::save_flags_cli();
        let my_ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        // Acquire on now_serving so the previous holder's writes are
        // visible once our ticket comes up.
        loop {
            let serving = self.now_serving.load(Ordering::Acquire);
            if serving == my_ticket {
                break;
            }
            // Back off proportionally to queue distance to cut cache-line
            // traffic when several CPUs are queued.
            let distance = my_ticket.wrapping_sub(serving) as u32;
            for _ in 0..distance.min(64) {
                spin_loop();
            }
        }

        IrqMutexGuard {
            mutex: self,
            saved_flags,
        }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<IrqMutexGuard<'_, T>> {
        let saved_flags = cpu::save_flags_cli();
        let current = self.now_serving.load(Ordering::Relaxed);
        if self
            .next_ticket
            .compare_exchange(
                current,
                current.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            Some(IrqMutexGuard {
                mutex: self,
                saved_flags,
            })
        } else {
            cpu::restore_flags(saved_flags);
            None
        }
    }
}

impl<'a, T> IrqMutexGuard<'a, T> {
    /// The mutex this guard locks. Used by [`crate::CondVar`] to reacquire
    /// after a wait.
    #[inline]
    pub fn mutex(&self) -> &'a IrqMutex<T> {
        self.mutex
    }
}

impl<'a, T> Deref for IrqMutexGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> DerefMut for IrqMutexGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T> Drop for IrqMutexGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        // Release hands the lock to the next ticket holder and publishes
        // our writes to it.
        self.mutex.now_serving.fetch_add(1, Ordering::Release);
        cpu::restore_flags(self.saved_flags);
    }
}

// =============================================================================
// IrqRwLock
// =============================================================================

/// Writer-preferring reader/writer spinlock with interrupts disabled while
/// held.
///
/// This is an internal building block for kernel tables, not the §4.6
/// blocking rw-lock; see [`crate::rwsem::RwSem`] for that one.
pub struct IrqRwLock<T> {
    /// 0 = free, -1 = write-locked, >0 = reader count.
    state: AtomicI32,
    /// Writers queued. While non-zero, new readers spin.
    writers_waiting: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: access is synchronized through the atomic state with local
// interrupts disabled.
unsafe impl<T: Send> Send for IrqRwLock<T> {}
unsafe impl<T: Send + Sync> Sync for IrqRwLock<T> {}

pub struct IrqRwLockReadGuard<'a, T> {
    lock: &'a IrqRwLock<T>,
    saved_flags: u32,
}

pub struct IrqRwLockWriteGuard<'a, T> {
    lock: &'a IrqRwLock<T>,
    saved_flags: u32,
}

impl<T> IrqRwLock<T> {
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            state: AtomicI32::new(0),
            writers_waiting: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire shared access. Spins while a writer holds or waits.
    #[inline]
    pub fn read(&self) -> IrqRwLockReadGuard<'_, T> {
        let saved_flags = cpu::save_flags_cli();
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state >= 0
                && self.writers_waiting.load(Ordering::Relaxed) == 0
                && self
                    .state
                    .compare_exchange_weak(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return IrqRwLockReadGuard {
                    lock: self,
                    saved_flags,
                };
            }
            spin_loop();
        }
    }

    /// Acquire exclusive access.
    #[inline]
    pub fn write(&self) -> IrqRwLockWriteGuard<'_, T> {
        let saved_flags = cpu::save_flags_cli();
        self.writers_waiting.fetch_add(1, Ordering::Relaxed);
        loop {
            if self
                .state
                .compare_exchange_weak(0, -1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.writers_waiting.fetch_sub(1, Ordering::Relaxed);
                return IrqRwLockWriteGuard {
                    lock: self,
                    saved_flags,
                };
            }
            spin_loop();
        }
    }
}

impl<'a, T> Deref for IrqRwLockReadGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: read guard excludes writers.
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> Drop for IrqRwLockReadGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
        cpu::restore_flags(self.saved_flags);
    }
}

impl<'a, T> Deref for IrqRwLockWriteGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: write guard is exclusive.
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for IrqRwLockWriteGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: write guard is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for IrqRwLockWriteGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
        cpu::restore_flags(self.saved_flags);
    }
}
