//! Scheduler queue and blocking-primitive tests.
//!
//! These run on the live scheduler, so queue manipulation happens with
//! interrupts off to keep the dispatcher from stealing the scratch tasks
//! mid-test.

use cinder_abi::task::{CpuAffinity, TASK_PRIORITY_HIGH, TASK_PRIORITY_IDLE, TASK_PRIORITY_LOW};
use cinder_lib::sched_hooks::{self, WakeReason};
use cinder_lib::testing::TestResult;
use cinder_lib::{Semaphore, assert_eq_test, assert_test, cpu, fail, pass};
use cinder_mm::addr_space::AddrSpace;

use crate::sched::scheduler::{self, enqueue_ready, testing_take_next, unblock};
use crate::sched::task::{Task, task_by_id, task_create, task_destroy};

/// A parked scratch task that is never dispatched.
fn scratch_task(priority: u8) -> Option<*mut Task> {
    let stack = AddrSpace::kernel().alloc_kernel_stack().ok()?;
    task_create(0, priority, CpuAffinity::Any, stack)
}

fn drop_scratch(task: *mut Task) {
    // SAFETY: scratch tasks are created by this module and never run.
    let slot = unsafe { (*task).kernel_stack.slot };
    task_destroy(task);
    AddrSpace::kernel().free_kernel_stack(slot);
}

pub fn test_ready_queue_fifo_within_priority() -> TestResult {
    let Some(a) = scratch_task(TASK_PRIORITY_LOW) else {
        return fail!("no scratch task");
    };
    let Some(b) = scratch_task(TASK_PRIORITY_LOW) else {
        drop_scratch(a);
        return fail!("no scratch task");
    };

    let flags = cpu::save_flags_cli();
    enqueue_ready(a);
    enqueue_ready(b);
    let first = testing_take_next(scheduler::current_cpu());
    let second = testing_take_next(scheduler::current_cpu());
    cpu::restore_flags(flags);

    assert_eq_test!(first, a, "FIFO: first in, first out");
    assert_eq_test!(second, b, "FIFO: second follows");

    drop_scratch(a);
    drop_scratch(b);
    pass!()
}

pub fn test_ready_queue_priority_order() -> TestResult {
    let Some(low) = scratch_task(TASK_PRIORITY_IDLE) else {
        return fail!("no scratch task");
    };
    let Some(high) = scratch_task(TASK_PRIORITY_HIGH) else {
        drop_scratch(low);
        return fail!("no scratch task");
    };

    let flags = cpu::save_flags_cli();
    enqueue_ready(low);
    enqueue_ready(high);
    let first = testing_take_next(scheduler::current_cpu());
    let second = testing_take_next(scheduler::current_cpu());
    cpu::restore_flags(flags);

    assert_eq_test!(first, high, "higher priority dispatches first");
    assert_eq_test!(second, low, "lower priority follows");

    drop_scratch(low);
    drop_scratch(high);
    pass!()
}

pub fn test_task_id_resolution_and_staleness() -> TestResult {
    let Some(task) = scratch_task(TASK_PRIORITY_LOW) else {
        return fail!("no scratch task");
    };
    // SAFETY: live scratch task.
    let id = unsafe { (*task).id };
    assert_eq_test!(task_by_id(id), task, "id resolves to the task");

    drop_scratch(task);
    assert_test!(task_by_id(id).is_null(), "stale id no longer resolves");
    pass!()
}

pub fn test_pending_wakeup_prevents_lost_wakeup() -> TestResult {
    // Unblock the current task before it blocks: the block must consume
    // the pending wakeup and return immediately.
    let me = scheduler::current_task();
    assert_test!(!me.is_null(), "test runs in task context");
    unblock(me);
    let reason = scheduler::block_current(false, 0);
    assert_eq_test!(reason, WakeReason::Woken, "pre-posted wakeup consumed");
    pass!()
}

pub fn test_block_current_times_out() -> TestResult {
    // Nothing will wake us: the tick-driven timeout must.
    let reason = scheduler::block_current(false, 3);
    assert_eq_test!(reason, WakeReason::TimedOut, "timed block expires");
    pass!()
}

pub fn test_semaphore_down_timed_expires() -> TestResult {
    let sem = Semaphore::new(0);
    let result = sem.down_timed(3);
    assert_test!(result.is_err(), "down_timed on zero count fails");
    pass!()
}

pub fn test_semaphore_counting() -> TestResult {
    let sem = Semaphore::new(2);
    assert_test!(sem.try_down().is_ok(), "first down");
    assert_test!(sem.try_down().is_ok(), "second down");
    assert_test!(sem.try_down().is_err(), "third would block");
    sem.up();
    assert_test!(sem.try_down().is_ok(), "up makes room again");
    sem.up();
    sem.up();
    assert_eq_test!(sem.value(), 2, "count restored");
    pass!()
}

pub fn test_sched_hooks_registered() -> TestResult {
    assert_test!(
        sched_hooks::sched_hooks_registered(),
        "scheduler registered its hooks at boot"
    );
    assert_test!(
        !sched_hooks::current_task().is_null(),
        "hook reports the running task"
    );
    pass!()
}

cinder_lib::define_test_suite!(
    sched,
    [
        test_ready_queue_fifo_within_priority,
        test_ready_queue_priority_order,
        test_task_id_resolution_and_staleness,
        test_pending_wakeup_prevents_lost_wakeup,
        test_block_current_times_out,
        test_semaphore_down_timed_expires,
        test_semaphore_counting,
        test_sched_hooks_registered,
    ]
);
