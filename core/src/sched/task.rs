//! The task control block and the global task table.

extern crate alloc;

use alloc::boxed::Box;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicU32, AtomicU64, Ordering};

use cinder_abi::signal::SigSet;
use cinder_abi::task::{
    CpuAffinity, INVALID_TASK_ID, MAX_TASKS, TASK_DEFAULT_QUANTUM, TaskState,
};
use cinder_lib::IrqMutex;
use cinder_mm::addr_space::KernelStack;

use super::switch::{SwitchFrame, UserFrame};

pub type TaskId = u32;

/// Sentinel for "not running on any CPU".
pub const NO_CPU: u8 = u8::MAX;

/// Why a blocked task was made runnable again; consumed by the primitive
/// that blocked.
pub const WAKE_NORMAL: u8 = 0;
pub const WAKE_INTERRUPTED: u8 = 1;
pub const WAKE_TIMED_OUT: u8 = 2;

/// One kernel task.
///
/// Tasks are boxed at creation and registered in [`TASKS`]; the scheduler
/// deals in raw pointers because a task must be reachable from interrupt
/// context without taking the table lock.
pub struct Task {
    pub id: TaskId,
    pub process_id: u32,
    state: AtomicU8,
    pub priority: u8,
    pub affinity: CpuAffinity,
    /// CPU the task is currently running on, or [`NO_CPU`].
    pub cpu: AtomicU8,
    /// Explicit dispatch override used by IPI-driven balancing.
    pub target_cpu: AtomicU8,
    pub quantum_remaining: AtomicU32,
    pub kernel_stack: KernelStack,
    /// Parked callee-saved state while not running.
    pub switch_frame: SwitchFrame,
    /// The trap frame to rewrite for signal delivery; points into the
    /// kernel stack while the task is inside the kernel, null otherwise.
    pub user_frame: AtomicPtr<UserFrame>,
    /// Signals generated but not yet delivered.
    pub pending_signals: AtomicU32,
    /// Signals the task currently blocks.
    pub blocked_signals: AtomicU32,
    /// Set by `unblock` when the task is not blocked yet; the next block
    /// attempt consumes it instead of sleeping (lost-wakeup guard).
    pub pending_wakeup: AtomicBool,
    /// Reason the last wakeup happened (`WAKE_*`).
    pub wake_reason: AtomicU8,
    /// Tick at which a timed block expires; 0 when untimed.
    pub wake_deadline: AtomicU64,
    /// `true` while the task blocks interruptibly (a signal may wake it).
    pub interruptible: AtomicBool,
    /// Exit status once the task reaches Zombie.
    pub exit_status: AtomicU32,
    /// Entry function and argument for fresh kernel tasks; the start thunk
    /// reads them on first dispatch.
    pub entry_point: usize,
    pub entry_arg: usize,
    /// Trap-frame image a forked child resumes from (EAX pre-set to 0).
    pub fork_frame: UserFrame,
    /// User address of the signal context pushed for the running handler;
    /// 0 when no handler is active.
    pub signal_context: AtomicU32,
    /// Intrusive ready-queue link.
    pub(super) next_ready: AtomicPtr<Task>,
}

impl Task {
    fn new(
        id: TaskId,
        process_id: u32,
        priority: u8,
        affinity: CpuAffinity,
        kernel_stack: KernelStack,
    ) -> Self {
        Self {
            id,
            process_id,
            state: AtomicU8::new(TaskState::Ready as u8),
            priority,
            affinity,
            cpu: AtomicU8::new(NO_CPU),
            target_cpu: AtomicU8::new(NO_CPU),
            quantum_remaining: AtomicU32::new(TASK_DEFAULT_QUANTUM),
            kernel_stack,
            switch_frame: SwitchFrame::zero(),
            user_frame: AtomicPtr::new(ptr::null_mut()),
            pending_signals: AtomicU32::new(0),
            blocked_signals: AtomicU32::new(0),
            pending_wakeup: AtomicBool::new(false),
            wake_reason: AtomicU8::new(WAKE_NORMAL),
            wake_deadline: AtomicU64::new(0),
            interruptible: AtomicBool::new(false),
            exit_status: AtomicU32::new(0),
            entry_point: 0,
            entry_arg: 0,
            fork_frame: UserFrame::default(),
            signal_context: AtomicU32::new(0),
            next_ready: AtomicPtr::new(ptr::null_mut()),
        }
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        match self.state.load(Ordering::Acquire) {
            0 => TaskState::Ready,
            1 => TaskState::Running,
            2 => TaskState::Blocked,
            3 => TaskState::Stopped,
            _ => TaskState::Zombie,
        }
    }

    #[inline]
    pub fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Atomically transition `from -> to`; `false` if the state changed
    /// under us.
    pub fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Add a signal to the pending set.
    pub fn post_signal(&self, sig: u8) {
        self.pending_signals
            .fetch_or(cinder_abi::signal::sig_bit(sig), Ordering::AcqRel);
    }

    /// Pending signals not currently blocked.
    #[inline]
    pub fn deliverable_signals(&self) -> SigSet {
        self.pending_signals.load(Ordering::Acquire) & !self.blocked_signals.load(Ordering::Acquire)
    }

    pub fn reset_quantum(&self) {
        self.quantum_remaining
            .store(TASK_DEFAULT_QUANTUM, Ordering::Relaxed);
    }
}

// SAFETY: every mutable field is atomic or only touched by the scheduler
// while it owns the task (current / queue ownership discipline).
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

/// Global task registry: stable pointers, id-indexed.
struct TaskTable {
    slots: [*mut Task; MAX_TASKS],
    next_id: u32,
}

// SAFETY: raw pointers guarded by the IrqMutex around the table.
unsafe impl Send for TaskTable {}

static TASKS: IrqMutex<TaskTable> = IrqMutex::new(TaskTable {
    slots: [ptr::null_mut(); MAX_TASKS],
    next_id: 0,
});

/// Allocate and register a task. The returned pointer stays valid until
/// [`task_destroy`].
pub fn task_create(
    process_id: u32,
    priority: u8,
    affinity: CpuAffinity,
    kernel_stack: KernelStack,
) -> Option<*mut Task> {
    let mut table = TASKS.lock();
    let slot = table.slots.iter().position(|p| p.is_null())?;
    // Task ids encode the slot so lookup is O(1); the generation in the
    // high bits keeps stale ids from resolving.
    let generation = table.next_id;
    table.next_id = table.next_id.wrapping_add(1);
    let id = (generation << 8) | slot as u32;
    let task = Box::into_raw(Box::new(Task::new(
        id,
        process_id,
        priority,
        affinity,
        kernel_stack,
    )));
    table.slots[slot] = task;
    Some(task)
}

/// Resolve a task id; null for stale or invalid ids.
pub fn task_by_id(id: TaskId) -> *mut Task {
    if id == INVALID_TASK_ID {
        return ptr::null_mut();
    }
    let table = TASKS.lock();
    let slot = (id & 0xFF) as usize;
    if slot >= MAX_TASKS {
        return ptr::null_mut();
    }
    let task = table.slots[slot];
    // SAFETY: non-null slots always point at live boxed tasks.
    if !task.is_null() && unsafe { (*task).id } == id {
        task
    } else {
        ptr::null_mut()
    }
}

/// Unregister and free a task. The caller guarantees no CPU or queue still
/// references it.
pub fn task_destroy(task: *mut Task) {
    if task.is_null() {
        return;
    }
    let mut table = TASKS.lock();
    // SAFETY: pointer was handed out by task_create and is still in the
    // table per the caller's contract.
    let slot = unsafe { ((*task).id & 0xFF) as usize };
    if slot < MAX_TASKS && table.slots[slot] == task {
        table.slots[slot] = ptr::null_mut();
        drop(table);
        // SAFETY: removed from the table; we hold the only reference.
        unsafe { drop(Box::from_raw(task)) };
    }
}

/// Walk every live task, e.g. for sleep-queue processing or per-process
/// signal fanout.
pub fn for_each_task(mut f: impl FnMut(*mut Task)) {
    let table = TASKS.lock();
    let slots = table.slots;
    drop(table);
    for task in slots {
        if !task.is_null() {
            f(task);
        }
    }
}

/// Count of live tasks belonging to `process_id`.
pub fn task_count_for_process(process_id: u32) -> usize {
    let mut count = 0;
    for_each_task(|t| {
        // SAFETY: table pointers are live tasks.
        if unsafe { (*t).process_id } == process_id {
            count += 1;
        }
    });
    count
}
