//! Condition variable.
//!
//! `wait` atomically releases the caller's [`IrqMutex`] guard and blocks;
//! on wakeup the lock is reacquired before control returns, so the caller
//! re-checks its predicate under the lock as usual. `signal` wakes the
//! highest-priority waiter (FIFO within a priority); `broadcast` wakes all.
//!
//! Atomicity of release+block: the waiter is enqueued while the caller's
//! lock is still held, and the scheduler's pending-wakeup flag covers the
//! window between dropping the lock and actually blocking. A `signal` in
//! that window is consumed, not lost.

use cinder_abi::error::KernelError;

use crate::clock;
use crate::sched_hooks::{self, WakeReason};
use crate::spinlock::IrqMutexGuard;
use crate::waitqueue::WaitQueue;

pub struct CondVar {
    queue: WaitQueue,
}

impl CondVar {
    pub const fn new() -> Self {
        Self {
            queue: WaitQueue::new(),
        }
    }

    /// Release `guard`, block until signalled, reacquire, and return the
    /// new guard.
    pub fn wait<'a, T>(&self, guard: IrqMutexGuard<'a, T>) -> IrqMutexGuard<'a, T> {
        match self.wait_common(guard, false, 0) {
            Ok(g) => g,
            // Uninterruptible untimed wait cannot fail.
            Err((g, _)) => g,
        }
    }

    /// Like [`wait`](Self::wait) but a signal targeting the caller ends the
    /// wait with `Interrupted`. The lock is reacquired either way.
    pub fn wait_intr<'a, T>(
        &self,
        guard: IrqMutexGuard<'a, T>,
    ) -> Result<IrqMutexGuard<'a, T>, (IrqMutexGuard<'a, T>, KernelError)> {
        self.wait_common(guard, true, 0)
    }

    /// Like [`wait`](Self::wait) with a tick budget; `TimedOut` when it
    /// runs out. The lock is reacquired either way.
    pub fn wait_timed<'a, T>(
        &self,
        guard: IrqMutexGuard<'a, T>,
        timeout_ticks: u64,
    ) -> Result<IrqMutexGuard<'a, T>, (IrqMutexGuard<'a, T>, KernelError)> {
        self.wait_common(guard, false, timeout_ticks)
    }

    fn wait_common<'a, T>(
        &self,
        guard: IrqMutexGuard<'a, T>,
        interruptible: bool,
        timeout_ticks: u64,
    ) -> Result<IrqMutexGuard<'a, T>, (IrqMutexGuard<'a, T>, KernelError)> {
        let mutex = guard.mutex();

        // Enqueue before releasing the lock; a concurrent signal now either
        // sees us in the queue or has already fired before the caller
        // checked its predicate.
        let task = self.queue.enqueue_current();
        drop(guard);

        let reason = match task {
            Some(_) => sched_hooks::block_current(interruptible, timeout_ticks),
            // No scheduler yet: treat the wait as a yield so boot-time
            // callers spin on their predicate.
            None => {
                sched_hooks::yield_now();
                WakeReason::Woken
            }
        };

        let guard = mutex.lock();
        match reason {
            WakeReason::Woken => Ok(guard),
            WakeReason::Interrupted => {
                if let Some(task) = task {
                    self.queue.remove(task);
                }
                Err((guard, KernelError::Interrupted))
            }
            WakeReason::TimedOut => {
                if let Some(task) = task {
                    self.queue.remove(task);
                }
                Err((guard, KernelError::TimedOut))
            }
        }
    }

    /// Block until `pred` holds, releasing and reacquiring the lock around
    /// each sleep. Returns the guard with `pred` true under it.
    pub fn wait_while<'a, T, F: FnMut(&mut T) -> bool>(
        &self,
        mut guard: IrqMutexGuard<'a, T>,
        mut pred: F,
    ) -> IrqMutexGuard<'a, T> {
        while !pred(&mut guard) {
            guard = self.wait(guard);
        }
        guard
    }

    /// Interruptible [`wait_while`](Self::wait_while).
    pub fn wait_while_intr<'a, T, F: FnMut(&mut T) -> bool>(
        &self,
        mut guard: IrqMutexGuard<'a, T>,
        mut pred: F,
    ) -> Result<IrqMutexGuard<'a, T>, KernelError> {
        while !pred(&mut guard) {
            match self.wait_intr(guard) {
                Ok(g) => guard = g,
                Err((_, e)) => return Err(e),
            }
        }
        Ok(guard)
    }

    /// Interruptible, timed [`wait_while`](Self::wait_while). The deadline
    /// covers the whole predicate wait, not each individual sleep.
    pub fn wait_while_timed<'a, T, F: FnMut(&mut T) -> bool>(
        &self,
        mut guard: IrqMutexGuard<'a, T>,
        mut pred: F,
        timeout_ticks: u64,
    ) -> Result<IrqMutexGuard<'a, T>, KernelError> {
        let deadline = clock::uptime_ticks() + timeout_ticks;
        while !pred(&mut guard) {
            let now = clock::uptime_ticks();
            if now >= deadline {
                return Err(KernelError::TimedOut);
            }
            match self.wait_timed(guard, deadline - now) {
                Ok(g) => guard = g,
                Err((_, e)) => return Err(e),
            }
        }
        Ok(guard)
    }

    /// Wake one waiter (highest priority, FIFO within it).
    pub fn signal(&self) -> bool {
        self.queue.wake_one()
    }

    /// Wake every waiter.
    pub fn broadcast(&self) -> usize {
        self.queue.wake_all()
    }

    pub fn has_waiters(&self) -> bool {
        self.queue.has_waiters()
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}
