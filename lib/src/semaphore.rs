//! Counting semaphore.
//!
//! `down` sleeps while the count is zero; `up` increments and wakes one
//! waiter, and never sleeps itself, so it is safe from interrupt handlers.
//! The interruptible and timed variants return [`KernelError::Interrupted`]
//! and [`KernelError::TimedOut`] respectively instead of waiting forever.

use cinder_abi::error::{KernelError, KernelResult};

use crate::IrqMutex;
use crate::clock;
use crate::sched_hooks::{self, WakeReason};
use crate::waitqueue::WaitQueue;

pub struct Semaphore {
    count: IrqMutex<u32>,
    queue: WaitQueue,
}

impl Semaphore {
    pub const fn new(initial: u32) -> Self {
        Self {
            count: IrqMutex::new(initial),
            queue: WaitQueue::new(),
        }
    }

    /// Current count. Racy by nature; diagnostic use only.
    pub fn value(&self) -> u32 {
        *self.count.lock()
    }

    /// Decrement, sleeping until the count is positive.
    pub fn down(&self) {
        // The uninterruptible, untimed wait cannot fail.
        let _ = self.down_common(false, 0);
    }

    /// Decrement, or return `Interrupted` if a signal targets the caller
    /// while it sleeps.
    pub fn down_intr(&self) -> KernelResult {
        self.down_common(true, 0)
    }

    /// Decrement, or return `TimedOut` after `timeout_ticks`.
    pub fn down_timed(&self, timeout_ticks: u64) -> KernelResult {
        self.down_common(false, timeout_ticks)
    }

    /// Decrement without sleeping; `WouldBlock` if the count is zero.
    pub fn try_down(&self) -> KernelResult {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            Ok(())
        } else {
            Err(KernelError::WouldBlock)
        }
    }

    fn down_common(&self, interruptible: bool, timeout_ticks: u64) -> KernelResult {
        let deadline = if timeout_ticks > 0 {
            Some(clock::uptime_ticks() + timeout_ticks)
        } else {
            None
        };

        loop {
            let task = {
                let mut count = self.count.lock();
                if *count > 0 {
                    *count -= 1;
                    return Ok(());
                }
                // Count is zero: enqueue while still holding the count lock
                // so an `up` cannot slip between the check and the enqueue.
                match self.queue.enqueue_current() {
                    Some(task) => task,
                    // No task context (early boot) or queue full: spin via
                    // yield instead of sleeping.
                    None => {
                        drop(count);
                        sched_hooks::yield_now();
                        continue;
                    }
                }
            };

            let remaining = match deadline {
                Some(d) => {
                    let now = clock::uptime_ticks();
                    if now >= d {
                        self.queue.remove(task);
                        return Err(KernelError::TimedOut);
                    }
                    d - now
                }
                None => 0,
            };

            match sched_hooks::block_current(interruptible, remaining) {
                WakeReason::Woken => {
                    // Loop: the count may already be gone again to a faster
                    // waiter.
                }
                WakeReason::Interrupted => {
                    self.queue.remove(task);
                    return Err(KernelError::Interrupted);
                }
                WakeReason::TimedOut => {
                    self.queue.remove(task);
                    return Err(KernelError::TimedOut);
                }
            }
        }
    }

    /// Increment and wake one waiter. Never sleeps.
    pub fn up(&self) {
        {
            let mut count = self.count.lock();
            *count += 1;
        }
        self.queue.wake_one();
    }
}
