//! Controlling terminal state and the job-control read gate.
//!
//! The session's foreground process group lives on the terminal. A read
//! from a process outside that group raises SIGTTIN: by default the
//! process stops; with SIGTTIN blocked or ignored the read fails with an
//! I/O error; with a handler installed the read is interrupted after the
//! handler has been queued. Background writes get the same treatment with
//! SIGTTOU, except that the default there lets the write through unless
//! the terminal is configured to stop them (TOSTOP).

use core::sync::atomic::{AtomicU32, Ordering};

use cinder_abi::error::{KernelError, KernelResult};
use cinder_abi::signal::{SIG_DFL, SIG_IGN, SIGTTIN, SIGTTOU, sig_bit};

use crate::process::{current_pid, with_process};
use crate::sched;
use crate::signal;

/// The controlling terminal (one console terminal in this core).
pub struct Terminal {
    foreground_pgid: AtomicU32,
    session: AtomicU32,
}

pub static CONSOLE: Terminal = Terminal {
    foreground_pgid: AtomicU32::new(0),
    session: AtomicU32::new(0),
};

impl Terminal {
    pub fn foreground_pgid(&self) -> u32 {
        self.foreground_pgid.load(Ordering::Acquire)
    }

    pub fn set_foreground_pgid(&self, pgid: u32) {
        self.foreground_pgid.store(pgid, Ordering::Release);
    }

    pub fn session(&self) -> u32 {
        self.session.load(Ordering::Acquire)
    }

    pub fn set_session(&self, sid: u32) {
        self.session.store(sid, Ordering::Release);
    }
}

/// How the caller relates to the foreground group for signal `sig`.
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    /// In the foreground (or no foreground configured): proceed.
    Foreground,
    /// Background with `sig` blocked or ignored.
    BlockedOrIgnored,
    /// Background with a handler installed for `sig`.
    Handled,
    /// Background with the default action: stop.
    DefaultStop,
}

fn classify(pid: u32, sig: u8) -> Disposition {
    let fg = CONSOLE.foreground_pgid();
    let pgid = with_process(pid, |p| p.pgid).unwrap_or(0);
    if fg == 0 || fg == pgid {
        return Disposition::Foreground;
    }

    let task = sched::current_task();
    let blocked = if task.is_null() {
        false
    } else {
        // SAFETY: current task is live.
        (unsafe { (*task).blocked_signals.load(Ordering::Acquire) }) & sig_bit(sig) != 0
    };
    let handler = with_process(pid, |p| p.actions[(sig - 1) as usize].sa_handler)
        .unwrap_or(SIG_DFL);

    if blocked || handler == SIG_IGN {
        Disposition::BlockedOrIgnored
    } else if handler != SIG_DFL {
        Disposition::Handled
    } else {
        Disposition::DefaultStop
    }
}

/// Gate for terminal reads from the current process; see module docs.
pub fn terminal_read_gate() -> KernelResult<()> {
    let pid = current_pid();
    match classify(pid, SIGTTIN) {
        Disposition::Foreground => Ok(()),
        Disposition::BlockedOrIgnored => Err(KernelError::IoError),
        Disposition::Handled => {
            let _ = signal::send_to_process(pid, SIGTTIN);
            Err(KernelError::Interrupted)
        }
        Disposition::DefaultStop => {
            // The stop itself happens at the return-to-user boundary once
            // the pending SIGTTIN is seen; the read reports interruption.
            let _ = signal::send_to_process(pid, SIGTTIN);
            Err(KernelError::Interrupted)
        }
    }
}

/// Gate for terminal writes; background writers get SIGTTOU only when the
/// terminal asks for it via `tostop`.
pub fn terminal_write_gate(tostop: bool) -> KernelResult<()> {
    if !tostop {
        return Ok(());
    }
    let pid = current_pid();
    match classify(pid, SIGTTOU) {
        Disposition::Foreground | Disposition::BlockedOrIgnored => Ok(()),
        Disposition::Handled | Disposition::DefaultStop => {
            let _ = signal::send_to_process(pid, SIGTTOU);
            Err(KernelError::Interrupted)
        }
    }
}
