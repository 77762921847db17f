//! Per-CPU dispatch, preemption, and the blocking interface.

use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use cinder_abi::task::{CpuAffinity, MAX_CPUS, TASK_PRIORITY_LEVELS, TaskState};
use cinder_lib::sched_hooks::{SchedHooks, TaskHandle, WakeReason, register_sched_hooks};
use cinder_lib::{IrqMutex, clock, cpu, klog_debug, klog_info};
use cinder_mm::paging;

use super::switch::{SwitchFrame, switch_context};
use super::task::{
    self, NO_CPU, Task, WAKE_INTERRUPTED, WAKE_NORMAL, WAKE_TIMED_OUT, task_create,
};
use crate::process;

/// One intrusive FIFO of ready tasks.
struct ReadyQueue {
    head: *mut Task,
    tail: *mut Task,
    len: usize,
}

impl ReadyQueue {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
        }
    }

    fn push_back(&mut self, task: *mut Task) {
        // SAFETY: the caller owns the task's queue membership.
        unsafe {
            (*task).next_ready.store(ptr::null_mut(), Ordering::Relaxed);
            if self.tail.is_null() {
                self.head = task;
            } else {
                (*self.tail).next_ready.store(task, Ordering::Relaxed);
            }
        }
        self.tail = task;
        self.len += 1;
    }

    fn pop_front(&mut self) -> *mut Task {
        let task = self.head;
        if task.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: head is a live queued task.
        unsafe {
            self.head = (*task).next_ready.load(Ordering::Relaxed);
            (*task).next_ready.store(ptr::null_mut(), Ordering::Relaxed);
        }
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }
        self.len -= 1;
        task
    }
}

// SAFETY: queue pointers are only touched under the per-CPU IrqMutex.
unsafe impl Send for ReadyQueue {}

struct CpuSched {
    current: AtomicPtr<Task>,
    idle: AtomicPtr<Task>,
    queues: IrqMutex<[ReadyQueue; TASK_PRIORITY_LEVELS]>,
    need_resched: AtomicBool,
    ready_count: AtomicUsize,
}

impl CpuSched {
    const fn new() -> Self {
        Self {
            current: AtomicPtr::new(ptr::null_mut()),
            idle: AtomicPtr::new(ptr::null_mut()),
            queues: IrqMutex::new(
                [const { ReadyQueue::new() }; TASK_PRIORITY_LEVELS],
            ),
            need_resched: AtomicBool::new(false),
            ready_count: AtomicUsize::new(0),
        }
    }
}

static CPUS: [CpuSched; MAX_CPUS] = [const { CpuSched::new() }; MAX_CPUS];
static CPU_COUNT: AtomicUsize = AtomicUsize::new(1);

/// Registered getter for the executing CPU's index (the platform layer
/// knows the APIC topology; the core does not). Defaults to CPU 0.
static CURRENT_CPU_FN: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

/// Registered reschedule-IPI sender, for kicking another CPU when a
/// higher-priority task lands on its queue.
static RESCHED_IPI_FN: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

pub fn set_cpu_count(count: usize) {
    CPU_COUNT.store(count.clamp(1, MAX_CPUS), Ordering::Release);
}

pub fn register_current_cpu_fn(f: fn() -> usize) {
    CURRENT_CPU_FN.store(f as *mut (), Ordering::Release);
}

pub fn register_resched_ipi_fn(f: fn(usize)) {
    RESCHED_IPI_FN.store(f as *mut (), Ordering::Release);
}

#[inline]
pub fn current_cpu() -> usize {
    let ptr = CURRENT_CPU_FN.load(Ordering::Acquire);
    if ptr.is_null() {
        0
    } else {
        // SAFETY: only `fn() -> usize` pointers are stored.
        let f: fn() -> usize = unsafe { core::mem::transmute(ptr) };
        f()
    }
}

fn send_resched_ipi(cpu_id: usize) {
    let ptr = RESCHED_IPI_FN.load(Ordering::Acquire);
    if !ptr.is_null() {
        // SAFETY: only `fn(usize)` pointers are stored.
        let f: fn(usize) = unsafe { core::mem::transmute(ptr) };
        f(cpu_id);
    }
}

/// The task running on this CPU.
#[inline]
pub fn current_task() -> *mut Task {
    CPUS[current_cpu()].current.load(Ordering::Acquire)
}

/// Pick the CPU a newly runnable task should land on: an explicit
/// `target_cpu` override wins, then hard affinity, then the least-loaded
/// CPU.
fn choose_cpu(task: *mut Task) -> usize {
    // SAFETY: caller passes a live task.
    let t = unsafe { &*task };
    let target = t.target_cpu.swap(NO_CPU, Ordering::AcqRel);
    if target != NO_CPU {
        return (target as usize).min(CPU_COUNT.load(Ordering::Acquire) - 1);
    }
    if let CpuAffinity::Pinned(cpu_id) = t.affinity {
        return (cpu_id as usize).min(CPU_COUNT.load(Ordering::Acquire) - 1);
    }
    let count = CPU_COUNT.load(Ordering::Acquire);
    let mut best = 0;
    let mut best_load = usize::MAX;
    for cpu_id in 0..count {
        let load = CPUS[cpu_id].ready_count.load(Ordering::Relaxed);
        if load < best_load {
            best = cpu_id;
            best_load = load;
        }
    }
    best
}

/// Put a Ready task on a run queue. Preempts immediately (or via IPI) when
/// it outranks the running task.
pub fn enqueue_ready(task: *mut Task) {
    if task.is_null() {
        return;
    }
    let cpu_id = choose_cpu(task);
    // SAFETY: live task per caller contract.
    let priority = unsafe { (*task).priority } as usize;
    {
        let mut queues = CPUS[cpu_id].queues.lock();
        queues[priority.min(TASK_PRIORITY_LEVELS - 1)].push_back(task);
    }
    CPUS[cpu_id].ready_count.fetch_add(1, Ordering::Relaxed);

    // Higher priority than the running task preempts right away.
    let running = CPUS[cpu_id].current.load(Ordering::Acquire);
    let preempt = if running.is_null() {
        true
    } else {
        // SAFETY: current pointers are live tasks.
        (unsafe { (*running).priority }) < priority as u8
    };
    if preempt {
        CPUS[cpu_id].need_resched.store(true, Ordering::Release);
        if cpu_id != current_cpu() {
            send_resched_ipi(cpu_id);
        }
    }
}

/// Take the best ready task off `cpu_id`'s queues.
fn take_next_ready(cpu_id: usize) -> *mut Task {
    let mut queues = CPUS[cpu_id].queues.lock();
    for priority in (0..TASK_PRIORITY_LEVELS).rev() {
        let task = queues[priority].pop_front();
        if !task.is_null() {
            drop(queues);
            CPUS[cpu_id].ready_count.fetch_sub(1, Ordering::Relaxed);
            return task;
        }
    }
    ptr::null_mut()
}

/// Core dispatch: park the current task and run the best ready one.
///
/// The caller must be in task context with a consistent kernel stack. A
/// Running current task is rotated to the back of its queue; a Blocked,
/// Stopped, or Zombie one is left off the queues.
pub fn schedule() {
    let cpu_id = current_cpu();
    let sched = &CPUS[cpu_id];
    sched.need_resched.store(false, Ordering::Release);

    let current = sched.current.load(Ordering::Acquire);
    let next = take_next_ready(cpu_id);

    if next.is_null() {
        // Nothing else to run. Keep running the current task if it still
        // can run, otherwise fall back to idle.
        if !current.is_null() {
            // SAFETY: live task.
            let state = unsafe { (*current).state() };
            if state == TaskState::Running {
                return;
            }
        }
        let idle = sched.idle.load(Ordering::Acquire);
        if idle.is_null() || idle == current {
            return;
        }
        dispatch(sched, current, idle, cpu_id);
        return;
    }

    if next == current {
        // SAFETY: live task.
        unsafe { (*next).set_state(TaskState::Running) };
        return;
    }

    if !current.is_null() {
        // SAFETY: live task.
        let state = unsafe { (*current).state() };
        if state == TaskState::Running {
            unsafe { (*current).set_state(TaskState::Ready) };
            if current != sched.idle.load(Ordering::Acquire) {
                enqueue_ready(current);
            }
        }
    }

    dispatch(sched, current, next, cpu_id);
}

/// Switch this CPU from `current` to `next`.
fn dispatch(sched: &CpuSched, current: *mut Task, next: *mut Task, cpu_id: usize) {
    // SAFETY: next is a live task owned by this CPU from here on.
    unsafe {
        (*next).set_state(TaskState::Running);
        (*next).cpu.store(cpu_id as u8, Ordering::Release);
        (*next).reset_quantum();
    }
    sched.current.store(next, Ordering::Release);

    // Reload CR3 only when the address space actually differs.
    // SAFETY: live task.
    let next_pid = unsafe { (*next).process_id };
    if let Some(ptd) = process::addr_space_ptd(next_pid) {
        paging::switch_address_space(ptd);
    }

    if current.is_null() {
        // First dispatch on this CPU: nothing to park; jump in via a
        // throwaway frame.
        let mut scratch = SwitchFrame::zero();
        // SAFETY: next's frame was prepared by task creation or a prior
        // park; scratch catches the state we never return to.
        unsafe { switch_context(&mut scratch, &(*next).switch_frame) };
        return;
    }

    // SAFETY: both tasks are live; current's frame is parked here and
    // resumed when it is dispatched again.
    unsafe {
        (*current).cpu.store(NO_CPU, Ordering::Release);
        let old = &mut (*current).switch_frame as *mut SwitchFrame;
        switch_context(old, &(*next).switch_frame);
    }
}

/// Voluntarily give up the CPU.
pub fn yield_now() {
    if current_task().is_null() {
        return;
    }
    schedule();
}

/// Block the current task; see the hooks contract in `cinder-lib`.
pub fn block_current(interruptible: bool, timeout_ticks: u64) -> WakeReason {
    let task = current_task();
    if task.is_null() {
        return WakeReason::Woken;
    }
    // SAFETY: current task is live and owned by this CPU.
    let t = unsafe { &*task };

    // A wakeup that raced ahead of us is consumed instead of sleeping.
    if t.pending_wakeup.swap(false, Ordering::AcqRel) {
        return WakeReason::Woken;
    }
    if interruptible && t.deliverable_signals() != 0 {
        return WakeReason::Interrupted;
    }

    t.interruptible.store(interruptible, Ordering::Release);
    t.wake_reason.store(WAKE_NORMAL, Ordering::Release);
    if timeout_ticks > 0 {
        t.wake_deadline
            .store(clock::uptime_ticks() + timeout_ticks, Ordering::Release);
    }
    t.set_state(TaskState::Blocked);

    // Close the enqueue->block window: an unblock that fired in between
    // set pending_wakeup (it saw us not Blocked yet) or transitioned us
    // back to Ready (it saw Blocked). Either way, don't sleep.
    if t.pending_wakeup.swap(false, Ordering::AcqRel) {
        t.transition(TaskState::Blocked, TaskState::Running);
        t.interruptible.store(false, Ordering::Release);
        t.wake_deadline.store(0, Ordering::Release);
        return WakeReason::Woken;
    }

    schedule();

    // Resumed.
    t.interruptible.store(false, Ordering::Release);
    t.wake_deadline.store(0, Ordering::Release);
    match t.wake_reason.load(Ordering::Acquire) {
        WAKE_INTERRUPTED => WakeReason::Interrupted,
        WAKE_TIMED_OUT => WakeReason::TimedOut,
        _ => WakeReason::Woken,
    }
}

/// Make `task` runnable; lost-wakeup-safe against a concurrent block.
pub fn unblock(task: *mut Task) {
    unblock_with_reason(task, WAKE_NORMAL);
}

pub(crate) fn unblock_with_reason(task: *mut Task, reason: u8) {
    if task.is_null() {
        return;
    }
    // SAFETY: callers pass live tasks.
    let t = unsafe { &*task };
    if t.transition(TaskState::Blocked, TaskState::Ready) {
        t.wake_reason.store(reason, Ordering::Release);
        enqueue_ready(task);
    } else {
        t.pending_wakeup.store(true, Ordering::Release);
    }
}

/// A signal arrived for `task`: end an interruptible block.
pub(crate) fn signal_wake(task: *mut Task) {
    if task.is_null() {
        return;
    }
    // SAFETY: live task.
    let t = unsafe { &*task };
    if t.interruptible.load(Ordering::Acquire) {
        unblock_with_reason(task, WAKE_INTERRUPTED);
    }
}

/// Job control: move a Stopped task back to Ready.
pub(crate) fn continue_task(task: *mut Task) {
    if task.is_null() {
        return;
    }
    // SAFETY: live task.
    if unsafe { (*task).transition(TaskState::Stopped, TaskState::Ready) } {
        enqueue_ready(task);
    }
}

/// Timer tick: advance the clock, wake due sleepers, burn the running
/// task's quantum. Returns `true` when the trap exit should reschedule.
pub fn on_timer_tick() -> bool {
    let now = clock::tick();

    // Wake timed-out blockers.
    task::for_each_task(|t| {
        // SAFETY: live task from the table walk.
        let task = unsafe { &*t };
        let deadline = task.wake_deadline.load(Ordering::Acquire);
        if deadline != 0 && now >= deadline && task.state() == TaskState::Blocked {
            task.wake_deadline.store(0, Ordering::Release);
            unblock_with_reason(t, WAKE_TIMED_OUT);
        }
    });

    process::on_tick(now);

    let cpu_id = current_cpu();
    let current = CPUS[cpu_id].current.load(Ordering::Acquire);
    if current.is_null() {
        return false;
    }
    // SAFETY: live task.
    let t = unsafe { &*current };
    let left = t.quantum_remaining.load(Ordering::Relaxed);
    if left <= 1 {
        t.reset_quantum();
        CPUS[cpu_id].need_resched.store(true, Ordering::Release);
    } else {
        t.quantum_remaining.store(left - 1, Ordering::Relaxed);
    }
    CPUS[cpu_id].need_resched.load(Ordering::Acquire)
}

/// Trap-exit hook: switch away if the tick (or a wake) asked for it.
pub fn preempt_point() {
    let cpu_id = current_cpu();
    if CPUS[cpu_id].need_resched.swap(false, Ordering::AcqRel) {
        schedule();
    }
}

// =============================================================================
// Kernel task spawn and idle
// =============================================================================

/// First-dispatch thunk: every fresh task starts here with its own pointer
/// parked in ESI by the switch stub.
pub extern "C" fn task_entry_thunk(task_ptr: usize) -> ! {
    cpu::sti();
    let task = task_ptr as *mut Task;
    // SAFETY: the thunk only runs on a live, just-dispatched task.
    let (entry, arg) = unsafe { ((*task).entry_point, (*task).entry_arg) };
    if entry != 0 {
        // SAFETY: entry was stored from a `fn(usize)` at spawn time.
        let f: fn(usize) = unsafe { core::mem::transmute(entry) };
        f(arg);
    }
    process::task_exit(0);
}

#[cfg(target_arch = "x86")]
core::arch::global_asm!(
    r#"
    .globl cinder_task_start
    cinder_task_start:
        push esi
        call {thunk}
    "#,
    thunk = sym task_entry_thunk
);

#[cfg(target_arch = "x86")]
unsafe extern "C" {
    fn cinder_task_start();
}

#[cfg(target_arch = "x86")]
pub(crate) fn task_start_addr() -> u32 {
    cinder_task_start as usize as u32
}

#[cfg(not(target_arch = "x86"))]
pub(crate) fn task_start_addr() -> u32 {
    0
}

/// Spawn a kernel task running `entry(arg)` in the kernel address space.
pub fn spawn_kernel_task(
    process_id: u32,
    entry: fn(usize),
    arg: usize,
    priority: u8,
) -> Option<*mut Task> {
    let space = cinder_mm::addr_space::AddrSpace::kernel();
    let stack = space.alloc_kernel_stack().ok()?;
    let task = task_create(process_id, priority, CpuAffinity::Any, stack)?;
    // SAFETY: freshly created task not yet visible to any queue.
    unsafe {
        (*task).entry_point = entry as usize;
        (*task).entry_arg = arg;
        (*task).switch_frame =
            SwitchFrame::new_for_task(task_start_addr(), task as usize as u32, stack.top.as_u32());
    }
    enqueue_ready(task);
    Some(task)
}

fn idle_loop(_arg: usize) {
    loop {
        cpu::hlt();
    }
}

/// Create the idle task for `cpu_id` and pin it.
pub fn create_idle_task(cpu_id: usize) -> Option<*mut Task> {
    let space = cinder_mm::addr_space::AddrSpace::kernel();
    let stack = space.alloc_kernel_stack().ok()?;
    let task = task_create(
        0,
        cinder_abi::task::TASK_PRIORITY_IDLE,
        CpuAffinity::Pinned(cpu_id as u8),
        stack,
    )?;
    // SAFETY: fresh task.
    unsafe {
        (*task).entry_point = idle_loop as *const () as usize;
        (*task).entry_arg = 0;
        (*task).switch_frame =
            SwitchFrame::new_for_task(task_start_addr(), task as usize as u32, stack.top.as_u32());
    }
    CPUS[cpu_id].idle.store(task, Ordering::Release);
    klog_debug!("sched: idle task for cpu {} ready", cpu_id);
    Some(task)
}

// =============================================================================
// Hook table for cinder-lib's blocking primitives
// =============================================================================

fn hook_current_task() -> TaskHandle {
    current_task() as TaskHandle
}

fn hook_task_priority(task: TaskHandle) -> u8 {
    let task = task as *mut Task;
    if task.is_null() {
        0
    } else {
        // SAFETY: handles come from hook_current_task on live tasks.
        unsafe { (*task).priority }
    }
}

fn hook_block_current(interruptible: bool, timeout_ticks: u64) -> WakeReason {
    block_current(interruptible, timeout_ticks)
}

fn hook_unblock(task: TaskHandle) {
    unblock(task as *mut Task);
}

fn hook_yield() {
    yield_now();
}

static HOOKS: SchedHooks = SchedHooks {
    current_task: hook_current_task,
    task_priority: hook_task_priority,
    block_current: hook_block_current,
    unblock: hook_unblock,
    yield_now: hook_yield,
};

/// Wire the scheduler into the support library and report readiness.
pub fn sched_init(cpu_count: usize) {
    set_cpu_count(cpu_count);
    register_sched_hooks(&HOOKS);
    klog_info!("sched: ready, {} cpu(s)", cpu_count);
}

// =============================================================================
// Test access
// =============================================================================

/// Drain one task from a CPU's queues (test hook; mirrors dispatch order).
pub fn testing_take_next(cpu_id: usize) -> *mut Task {
    take_next_ready(cpu_id)
}

/// Ready-queue depth of a CPU (test hook).
pub fn testing_ready_count(cpu_id: usize) -> usize {
    CPUS[cpu_id].ready_count.load(Ordering::Relaxed)
}
