//! Wait queue: the ordered set of tasks sleeping on some condition.
//!
//! A fixed-capacity table of task handles, each stamped with the task's
//! priority and an enqueue sequence number. Wakeups pick the highest
//! priority first and FIFO within a priority, which is the ordering the
//! condition variable and semaphore primitives promise.
//!
//! Lost wakeups are prevented by the scheduler's pending-wakeup flag: if
//! `wake_one` lands between a waiter's enqueue and its actual block, the
//! block call returns immediately.

use crate::IrqMutex;
use crate::sched_hooks::{self, TaskHandle};

/// Maximum simultaneous waiters on one queue.
pub const WAITQUEUE_CAPACITY: usize = 32;

#[derive(Clone, Copy)]
struct Waiter {
    task: TaskHandle,
    priority: u8,
    seq: u64,
}

struct WaitQueueInner {
    slots: [Option<Waiter>; WAITQUEUE_CAPACITY],
    next_seq: u64,
    count: usize,
}

// SAFETY: task handles are opaque scheduler-owned pointers; access is
// serialized by the IrqMutex around the inner state.
unsafe impl Send for WaitQueueInner {}

impl WaitQueueInner {
    const fn new() -> Self {
        Self {
            slots: [None; WAITQUEUE_CAPACITY],
            next_seq: 0,
            count: 0,
        }
    }

    fn enqueue(&mut self, task: TaskHandle) -> bool {
        if task.is_null() {
            return false;
        }
        let priority = sched_hooks::task_priority(task);
        for slot in self.slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(Waiter {
                    task,
                    priority,
                    seq: self.next_seq,
                });
                self.next_seq += 1;
                self.count += 1;
                return true;
            }
        }
        false
    }

    /// Pick the best waiter: highest priority, earliest sequence within it.
    fn dequeue_best(&mut self) -> Option<TaskHandle> {
        let mut best: Option<(usize, u8, u64)> = None;
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(w) = slot {
                let better = match best {
                    None => true,
                    Some((_, priority, seq)) => {
                        w.priority > priority || (w.priority == priority && w.seq < seq)
                    }
                };
                if better {
                    best = Some((i, w.priority, w.seq));
                }
            }
        }
        let (idx, _, _) = best?;
        let task = self.slots[idx].take().map(|w| w.task);
        self.count -= 1;
        task
    }

    fn remove(&mut self, task: TaskHandle) -> bool {
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some(w) if w.task == task) {
                *slot = None;
                self.count -= 1;
                return true;
            }
        }
        false
    }
}

/// A queue of tasks blocked on a condition. See module docs for ordering.
pub struct WaitQueue {
    inner: IrqMutex<WaitQueueInner>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            inner: IrqMutex::new(WaitQueueInner::new()),
        }
    }

    /// Add the current task to the queue. Returns the handle enqueued, or
    /// `None` if there is no current task or the queue is full.
    pub fn enqueue_current(&self) -> Option<TaskHandle> {
        let task = sched_hooks::current_task();
        if task.is_null() {
            return None;
        }
        let mut inner = self.inner.lock();
        if inner.enqueue(task) { Some(task) } else { None }
    }

    /// Remove a task (used when a wait is abandoned on timeout/interrupt).
    pub fn remove(&self, task: TaskHandle) -> bool {
        self.inner.lock().remove(task)
    }

    /// Wake the best waiter. Returns `true` if one was woken.
    pub fn wake_one(&self) -> bool {
        let task = self.inner.lock().dequeue_best();
        match task {
            Some(task) => {
                sched_hooks::unblock(task);
                true
            }
            None => false,
        }
    }

    /// Wake every waiter, returning how many.
    pub fn wake_all(&self) -> usize {
        // Drain under the lock, unblock outside it so the scheduler never
        // runs while we hold the queue lock.
        let mut tasks = [core::ptr::null_mut(); WAITQUEUE_CAPACITY];
        let mut n = 0;
        {
            let mut inner = self.inner.lock();
            while let Some(task) = inner.dequeue_best() {
                tasks[n] = task;
                n += 1;
            }
        }
        for &task in &tasks[..n] {
            sched_hooks::unblock(task);
        }
        n
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.lock().count
    }

    pub fn has_waiters(&self) -> bool {
        self.waiter_count() != 0
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
