//! Scheduler hooks.
//!
//! The blocking primitives live in this crate but the scheduler lives in
//! the core crate, which depends on us. The cycle is broken the same way as
//! for the klog backend: the scheduler registers a table of function
//! pointers at boot and everything here calls through it. Before
//! registration (early boot, host-side unit tests) blocking degrades to an
//! immediate return, which is correct for code that re-checks its condition
//! in a loop.

use core::ffi::c_void;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Opaque scheduler task handle. Owned and interpreted by the scheduler.
pub type TaskHandle = *mut c_void;

/// Why a blocked task resumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WakeReason {
    /// Someone called `unblock` (or the hooks are not registered yet).
    Woken,
    /// A signal targeted the task during an interruptible block.
    Interrupted,
    /// The timeout budget ran out first.
    TimedOut,
}

/// Scheduler entry points the blocking primitives need.
pub struct SchedHooks {
    /// Handle of the task running on this CPU, null outside task context.
    pub current_task: fn() -> TaskHandle,
    /// Scheduling priority of a task (higher runs first).
    pub task_priority: fn(TaskHandle) -> u8,
    /// Block the current task. `interruptible` lets pending signals end the
    /// block; `timeout_ticks` of 0 means no timeout. A wakeup that raced
    /// ahead of this call (unblock between enqueue and block) must be
    /// consumed instead of lost.
    pub block_current: fn(interruptible: bool, timeout_ticks: u64) -> WakeReason,
    /// Make a blocked task runnable. Safe to call from interrupt context.
    pub unblock: fn(TaskHandle),
    /// Give up the CPU without blocking.
    pub yield_now: fn(),
}

static HOOKS: AtomicPtr<SchedHooks> = AtomicPtr::new(core::ptr::null_mut());

/// Install the scheduler's hook table. Called once at boot.
pub fn register_sched_hooks(hooks: &'static SchedHooks) {
    HOOKS.store(hooks as *const SchedHooks as *mut SchedHooks, Ordering::Release);
}

#[inline]
fn hooks() -> Option<&'static SchedHooks> {
    let ptr = HOOKS.load(Ordering::Acquire);
    // SAFETY: only 'static references are ever stored.
    unsafe { ptr.as_ref() }
}

/// `true` once the scheduler has registered itself.
pub fn sched_hooks_registered() -> bool {
    !HOOKS.load(Ordering::Acquire).is_null()
}

/// Current task handle, or null when no scheduler is running.
#[inline]
pub fn current_task() -> TaskHandle {
    match hooks() {
        Some(h) => (h.current_task)(),
        None => core::ptr::null_mut(),
    }
}

/// Priority of `task`, 0 when no scheduler is running.
#[inline]
pub fn task_priority(task: TaskHandle) -> u8 {
    match hooks() {
        Some(h) => (h.task_priority)(task),
        None => 0,
    }
}

/// Block the current task; see [`SchedHooks::block_current`].
#[inline]
pub fn block_current(interruptible: bool, timeout_ticks: u64) -> WakeReason {
    match hooks() {
        Some(h) => (h.block_current)(interruptible, timeout_ticks),
        None => WakeReason::Woken,
    }
}

/// Unblock `task` if it is blocked, or flag a pending wakeup if it is about
/// to block.
#[inline]
pub fn unblock(task: TaskHandle) {
    if let Some(h) = hooks() {
        (h.unblock)(task);
    }
}

/// Yield the CPU.
#[inline]
pub fn yield_now() {
    if let Some(h) = hooks() {
        (h.yield_now)();
    }
}
