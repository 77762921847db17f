//! Signal mask, disposition, and status-word tests.

use core::sync::atomic::Ordering;

use cinder_abi::signal::{
    SIG_BLOCK, SIG_SETMASK, SIG_UNBLOCK, SIGINT, SIGKILL, SIGSTOP, SIGTERM, SIGUSR1, UserSigaction,
    sig_bit, w_exitcode, w_stopsig, w_termsig,
};
use cinder_abi::task::{CpuAffinity, TASK_PRIORITY_LOW};
use cinder_lib::testing::TestResult;
use cinder_lib::{assert_eq_test, assert_test, fail, pass};
use cinder_mm::addr_space::AddrSpace;

use crate::sched::task::{task_create, task_destroy};
use crate::signal;

pub fn test_sigprocmask_block_unblock() -> TestResult {
    // Save, mutate, verify, restore.
    let old = match signal::do_sigprocmask(SIG_SETMASK, Some(0)) {
        Ok(old) => old,
        Err(_) => return fail!("sigprocmask failed"),
    };

    let _ = signal::do_sigprocmask(SIG_BLOCK, Some(sig_bit(SIGINT) | sig_bit(SIGUSR1)));
    let current = signal::do_sigprocmask(SIG_BLOCK, Some(0)).unwrap_or(0);
    assert_test!(current & sig_bit(SIGINT) != 0, "SIGINT blocked");
    assert_test!(current & sig_bit(SIGUSR1) != 0, "SIGUSR1 blocked");

    let _ = signal::do_sigprocmask(SIG_UNBLOCK, Some(sig_bit(SIGINT)));
    let current = signal::do_sigprocmask(SIG_BLOCK, Some(0)).unwrap_or(0);
    assert_test!(current & sig_bit(SIGINT) == 0, "SIGINT unblocked");

    let _ = signal::do_sigprocmask(SIG_SETMASK, Some(old));
    pass!()
}

pub fn test_sigprocmask_cannot_block_kill_stop() -> TestResult {
    let old = signal::do_sigprocmask(SIG_SETMASK, Some(0)).unwrap_or(0);

    let _ = signal::do_sigprocmask(SIG_BLOCK, Some(sig_bit(SIGKILL) | sig_bit(SIGSTOP)));
    let current = signal::do_sigprocmask(SIG_BLOCK, Some(0)).unwrap_or(0);
    assert_test!(current & sig_bit(SIGKILL) == 0, "SIGKILL never blockable");
    assert_test!(current & sig_bit(SIGSTOP) == 0, "SIGSTOP never blockable");

    let _ = signal::do_sigprocmask(SIG_SETMASK, Some(old));
    pass!()
}

pub fn test_sigaction_install_and_query() -> TestResult {
    let mut action = UserSigaction::default();
    action.sa_handler = 0x4050_6070;
    action.sa_mask = sig_bit(SIGUSR1);

    let previous = match signal::do_sigaction(SIGTERM, Some(action)) {
        Ok(p) => p,
        Err(_) => return fail!("install failed"),
    };
    let installed = match signal::do_sigaction(SIGTERM, None) {
        Ok(a) => a,
        Err(_) => return fail!("query failed"),
    };
    assert_eq_test!(installed.sa_handler, 0x4050_6070, "handler stored");
    assert_eq_test!(installed.sa_mask, sig_bit(SIGUSR1), "mask stored");

    let _ = signal::do_sigaction(SIGTERM, Some(previous));
    pass!()
}

pub fn test_sigaction_rejects_kill_and_stop() -> TestResult {
    assert_test!(
        signal::do_sigaction(SIGKILL, Some(UserSigaction::default())).is_err(),
        "SIGKILL disposition is immutable"
    );
    assert_test!(
        signal::do_sigaction(SIGSTOP, Some(UserSigaction::default())).is_err(),
        "SIGSTOP disposition is immutable"
    );
    pass!()
}

pub fn test_pending_masked_signals_not_deliverable() -> TestResult {
    let Ok(stack) = AddrSpace::kernel().alloc_kernel_stack() else {
        return fail!("no stack");
    };
    let Some(task) = task_create(0, TASK_PRIORITY_LOW, CpuAffinity::Any, stack) else {
        AddrSpace::kernel().free_kernel_stack(stack.slot);
        return fail!("no task");
    };
    // SAFETY: scratch task, never enqueued.
    let t = unsafe { &*task };

    t.blocked_signals.store(sig_bit(SIGUSR1), Ordering::Release);
    t.post_signal(SIGUSR1);
    t.post_signal(SIGINT);

    let deliverable = t.deliverable_signals();
    assert_test!(deliverable & sig_bit(SIGUSR1) == 0, "masked signal held back");
    assert_test!(deliverable & sig_bit(SIGINT) != 0, "unmasked signal deliverable");

    task_destroy(task);
    AddrSpace::kernel().free_kernel_stack(stack.slot);
    pass!()
}

pub fn test_status_word_encodings() -> TestResult {
    assert_eq_test!(w_exitcode(0), 0u32, "clean exit");
    assert_eq_test!(w_exitcode(42), 42u32 << 8, "exit code in the high byte");
    assert_eq_test!(w_termsig(SIGKILL), SIGKILL as u32, "kill signal in the low byte");
    assert_eq_test!(
        w_stopsig(SIGSTOP),
        ((SIGSTOP as u32) << 8) | 0x7F,
        "stop status carries 0x7F marker"
    );
    pass!()
}

cinder_lib::define_test_suite!(
    signal,
    [
        test_sigprocmask_block_unblock,
        test_sigprocmask_cannot_block_kill_stop,
        test_sigaction_install_and_query,
        test_sigaction_rejects_kill_and_stop,
        test_pending_masked_signals_not_deliverable,
        test_status_word_encodings,
    ]
);
