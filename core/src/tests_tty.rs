//! Job-control gate tests (the logic half of the background-read
//! scenario: stop by default, I/O error when blocked, interruption when
//! handled).

use core::sync::atomic::Ordering;

use cinder_abi::error::KernelError;
use cinder_abi::signal::{SIG_SETMASK, SIGTTIN, UserSigaction, sig_bit};
use cinder_lib::testing::TestResult;
use cinder_lib::{assert_eq_test, assert_test, fail, pass};

use crate::process;
use crate::sched;
use crate::signal;
use crate::tty::{CONSOLE, terminal_read_gate};

/// Clear any SIGTTIN this test left pending on the current task, so later
/// interruptible waits do not see it.
fn clear_pending_ttin() {
    let task = sched::current_task();
    if !task.is_null() {
        // SAFETY: current task is live.
        unsafe {
            (*task)
                .pending_signals
                .fetch_and(!sig_bit(SIGTTIN), Ordering::AcqRel);
        }
    }
}

pub fn test_foreground_read_passes() -> TestResult {
    let my_pgid = process::getpgrp();
    CONSOLE.set_foreground_pgid(my_pgid);
    let result = terminal_read_gate();
    CONSOLE.set_foreground_pgid(0);
    assert_test!(result.is_ok(), "foreground reader proceeds");
    pass!()
}

pub fn test_no_foreground_configured_passes() -> TestResult {
    CONSOLE.set_foreground_pgid(0);
    assert_test!(terminal_read_gate().is_ok(), "no foreground group set");
    pass!()
}

pub fn test_background_read_default_interrupts_and_posts_stop() -> TestResult {
    let my_pgid = process::getpgrp();
    CONSOLE.set_foreground_pgid(my_pgid.wrapping_add(77));

    let result = terminal_read_gate();
    CONSOLE.set_foreground_pgid(0);

    assert_eq_test!(
        result,
        Err(KernelError::Interrupted),
        "background read with default action reports interruption"
    );
    // The stop signal is pending against the task; the actual stop lands
    // at the next return to user mode.
    let task = sched::current_task();
    assert_test!(!task.is_null(), "task context");
    // SAFETY: current task is live.
    let pending = unsafe { (*task).pending_signals.load(Ordering::Acquire) };
    assert_test!(pending & sig_bit(SIGTTIN) != 0, "SIGTTIN queued for the stop");

    clear_pending_ttin();
    pass!()
}

pub fn test_background_read_with_blocked_sigttin_fails_io() -> TestResult {
    let my_pgid = process::getpgrp();
    CONSOLE.set_foreground_pgid(my_pgid.wrapping_add(77));

    let old = signal::do_sigprocmask(SIG_SETMASK, Some(sig_bit(SIGTTIN))).unwrap_or(0);
    let result = terminal_read_gate();
    let _ = signal::do_sigprocmask(SIG_SETMASK, Some(old));
    CONSOLE.set_foreground_pgid(0);

    assert_eq_test!(
        result,
        Err(KernelError::IoError),
        "blocked SIGTTIN turns the read into an I/O error"
    );
    clear_pending_ttin();
    pass!()
}

pub fn test_background_read_with_handler_interrupts() -> TestResult {
    let my_pgid = process::getpgrp();
    CONSOLE.set_foreground_pgid(my_pgid.wrapping_add(77));

    let mut action = UserSigaction::default();
    action.sa_handler = 0x4100_0000;
    let previous = match signal::do_sigaction(SIGTTIN, Some(action)) {
        Ok(p) => p,
        Err(_) => {
            CONSOLE.set_foreground_pgid(0);
            return fail!("sigaction failed");
        }
    };

    let result = terminal_read_gate();

    let _ = signal::do_sigaction(SIGTTIN, Some(previous));
    CONSOLE.set_foreground_pgid(0);

    assert_eq_test!(
        result,
        Err(KernelError::Interrupted),
        "handled SIGTTIN interrupts the read"
    );
    // The handler invocation itself is queued for delivery.
    let task = sched::current_task();
    // SAFETY: current task is live.
    let pending = unsafe { (*task).pending_signals.load(Ordering::Acquire) };
    assert_test!(pending & sig_bit(SIGTTIN) != 0, "SIGTTIN pending for the handler");

    clear_pending_ttin();
    pass!()
}

cinder_lib::define_test_suite!(
    tty_jobctl,
    [
        test_foreground_read_passes,
        test_no_foreground_configured_passes,
        test_background_read_default_interrupts_and_posts_stop,
        test_background_read_with_blocked_sigttin_fails_io,
        test_background_read_with_handler_interrupts,
    ]
);
