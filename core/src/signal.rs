//! Signal generation, delivery, and job control.
//!
//! Generation is cheap: set a bit in the target task's pending set and
//! wake it if it blocks interruptibly. All the real work happens at the
//! return-to-user boundary: [`deliver_pending`] inspects the saved trap
//! frame and either applies a default action (terminate, stop, ignore) or
//! rewrites the frame so the task resumes inside its handler, with a
//! context record on the user stack that [`do_sigreturn`] restores.

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use cinder_abi::addr::VirtAddr;
use cinder_abi::error::{KernelError, KernelResult};
use cinder_abi::signal::{
    NSIG, SA_NODEFER, SA_RESETHAND, SIG_DFL, SIG_IGN, SIG_UNCATCHABLE, SIGCHLD, SIGCONT, SIGKILL,
    SIGSTOP, SIGTSTP, SIGTTIN, SIGTTOU, SigSet, UserSigaction, sig_bit, w_stopsig,
    w_termsig,
};
use cinder_abi::task::TaskState;
use cinder_lib::klog_debug;
use cinder_mm::user_buffer;

use crate::process::{
    self, PROCS, ProcState, WaitEvent, WaitKind, post_wait_event, with_process,
};
use crate::sched::switch::UserFrame;
use crate::sched::task::{self, Task};
use crate::sched::{self, scheduler};

/// Flat user code segment selector, RPL 3 (GDT entry 3).
pub const USER_CODE_SELECTOR: u32 = 0x1B;
/// Flat user data segment selector, RPL 3 (GDT entry 4).
pub const USER_DATA_SELECTOR: u32 = 0x23;

/// The frame image plus signal mask saved on the user stack around a
/// handler invocation.
#[repr(C)]
#[derive(Clone, Copy)]
struct SigContext {
    frame: UserFrame,
    saved_mask: SigSet,
}

const SIGCTX_SIZE: u32 = core::mem::size_of::<SigContext>() as u32;

/// Post `sig` to one process. Signal 0 probes for existence.
pub fn send_to_process(pid: u32, sig: u8) -> KernelResult<usize> {
    let exists = with_process(pid, |p| p.state == ProcState::Alive).unwrap_or(false);
    if !exists {
        return Err(KernelError::NotFound);
    }
    if sig == 0 {
        return Ok(0);
    }

    if sig == SIGCONT {
        continue_process(pid);
        return Ok(0);
    }

    // Pick the delivery task: the main task unless it is gone.
    let mut target: *mut Task = core::ptr::null_mut();
    task::for_each_task(|t| {
        // SAFETY: table walk yields live tasks.
        let task = unsafe { &*t };
        if task.process_id == pid && task.state() != TaskState::Zombie && target.is_null() {
            target = t;
        }
    });
    if target.is_null() {
        return Err(KernelError::NotFound);
    }

    // SAFETY: live task.
    unsafe { (*target).post_signal(sig) };

    if sig == SIGKILL {
        // Unblockable and fatal: mark the process dying and kick every
        // task out of its sleep so the exit happens promptly.
        let _ = with_process(pid, |p| p.dying = true);
        task::for_each_task(|t| {
            // SAFETY: live task.
            let task = unsafe { &*t };
            if task.process_id == pid {
                scheduler::unblock_with_reason(t, task::WAKE_INTERRUPTED);
                scheduler::continue_task(t);
            }
        });
    } else {
        scheduler::signal_wake(target);
    }
    Ok(0)
}

/// Post `sig` to every member of a process group.
pub fn send_to_group(pgid: u32, sig: u8) -> KernelResult<usize> {
    let mut members = Vec::new();
    {
        let table = PROCS.lock();
        for entry in table.iter().flatten() {
            if entry.pgid == pgid && entry.state == ProcState::Alive {
                members.push(entry.pid);
            }
        }
    }
    if members.is_empty() {
        return Err(KernelError::NotFound);
    }
    for pid in members {
        let _ = send_to_process(pid, sig);
    }
    Ok(0)
}

/// kill(-1): every process except init and the kernel.
pub fn send_to_all_except_init(sig: u8) -> KernelResult<usize> {
    let mut targets = Vec::new();
    {
        let table = PROCS.lock();
        for entry in table.iter().flatten() {
            if entry.pid > cinder_abi::task::INIT_PID && entry.state == ProcState::Alive {
                targets.push(entry.pid);
            }
        }
    }
    for pid in targets {
        let _ = send_to_process(pid, sig);
    }
    Ok(0)
}

/// SIGCONT: wake stopped tasks and tell the waiting parent.
fn continue_process(pid: u32) {
    task::for_each_task(|t| {
        // SAFETY: live task.
        if unsafe { (*t).process_id } == pid {
            scheduler::continue_task(t);
            // A pending stop that was never applied is cancelled.
            unsafe {
                (*t).pending_signals.fetch_and(
                    !(sig_bit(SIGSTOP) | sig_bit(SIGTSTP) | sig_bit(SIGTTIN) | sig_bit(SIGTTOU)),
                    Ordering::AcqRel,
                );
            }
        }
    });
    let mut table = PROCS.lock();
    post_wait_event(
        &mut table,
        pid,
        WaitEvent {
            kind: WaitKind::Continued,
            status: cinder_abi::signal::W_CONTINUED,
        },
    );
}

/// sigaction: install a new disposition, returning the old one.
pub fn do_sigaction(sig: u8, new: Option<UserSigaction>) -> KernelResult<UserSigaction> {
    if sig == 0 || sig as usize > NSIG || sig_bit(sig) & SIG_UNCATCHABLE != 0 {
        return Err(KernelError::Invalid);
    }
    with_process(process::current_pid(), |p| {
        let old = p.actions[(sig - 1) as usize];
        if let Some(new) = new {
            p.actions[(sig - 1) as usize] = new;
        }
        old
    })
    .ok_or(KernelError::NotFound)
}

/// sigprocmask on the current task's blocked set.
pub fn do_sigprocmask(how: u32, set: Option<SigSet>) -> KernelResult<SigSet> {
    let task = sched::current_task();
    if task.is_null() {
        return Err(KernelError::Invalid);
    }
    // SAFETY: current task is live.
    let t = unsafe { &*task };
    let old = t.blocked_signals.load(Ordering::Acquire);
    if let Some(set) = set {
        let set = set & !SIG_UNCATCHABLE; // KILL and STOP stay unblockable
        let new = match how {
            cinder_abi::signal::SIG_BLOCK => old | set,
            cinder_abi::signal::SIG_UNBLOCK => old & !set,
            cinder_abi::signal::SIG_SETMASK => set,
            _ => return Err(KernelError::Invalid),
        };
        t.blocked_signals.store(new, Ordering::Release);
    }
    Ok(old)
}

/// Disposition of `sig` for `pid`, with the uncatchable overrides applied.
fn effective_action(pid: u32, sig: u8) -> UserSigaction {
    if sig_bit(sig) & SIG_UNCATCHABLE != 0 {
        return UserSigaction::default();
    }
    with_process(pid, |p| p.actions[(sig - 1) as usize]).unwrap_or(UserSigaction::default())
}

/// Deliver pending signals on the way back to user mode. The saved trap
/// frame may be rewritten to run a handler; default actions may stop or
/// terminate the process (in which case this never returns).
pub fn deliver_pending(frame: &mut UserFrame) {
    let task = sched::current_task();
    if task.is_null() || !frame.from_user_mode() {
        return;
    }
    // SAFETY: current task is live.
    let t = unsafe { &*task };
    let pid = t.process_id;

    if with_process(pid, |p| p.dying).unwrap_or(false) {
        process::task_exit(w_termsig(SIGKILL));
    }

    loop {
        let deliverable = t.deliverable_signals();
        if deliverable == 0 {
            return;
        }
        let sig = (deliverable.trailing_zeros() + 1) as u8;
        t.pending_signals
            .fetch_and(!sig_bit(sig), Ordering::AcqRel);

        let action = effective_action(pid, sig);
        if action.sa_handler == SIG_IGN {
            continue;
        }
        if action.sa_handler == SIG_DFL {
            match default_action(sig) {
                DefaultAction::Ignore => continue,
                DefaultAction::Stop => {
                    stop_current_process(pid, sig);
                    continue; // resumed by SIGCONT
                }
                DefaultAction::Terminate => {
                    process::task_exit(w_termsig(sig));
                }
            }
        }

        // A user handler: save the interrupted context on the user stack
        // and restart inside the handler. The return path goes through
        // the registered restorer, which issues the sigreturn syscall (no
        // kernel-provided trampoline is visible in user space).
        if push_handler_frame(t, frame, sig, &action).is_err() {
            // The stack is gone or unwritable: that is a SIGSEGV-grade
            // failure; take the default fatal action.
            process::task_exit(w_termsig(sig));
        }
        return;
    }
}

enum DefaultAction {
    Terminate,
    Ignore,
    Stop,
}

fn default_action(sig: u8) -> DefaultAction {
    if sig_bit(sig) & cinder_abi::signal::SIG_DEFAULT_STOP != 0 {
        DefaultAction::Stop
    } else if sig_bit(sig) & cinder_abi::signal::SIG_DEFAULT_IGNORE != 0 {
        DefaultAction::Ignore
    } else {
        DefaultAction::Terminate
    }
}

/// Job control stop: every task of the process parks in `Stopped`, the
/// parent learns about it (WUNTRACED), and the current task schedules
/// away until SIGCONT.
fn stop_current_process(pid: u32, sig: u8) {
    klog_debug!("signal: pid {} stopping on signal {}", pid, sig);
    let current = sched::current_task();
    task::for_each_task(|other| {
        if other == current {
            return;
        }
        // SAFETY: live task.
        let o = unsafe { &*other };
        if o.process_id == pid && o.state() != TaskState::Zombie {
            // Remote tasks park at their own next kernel exit.
            o.post_signal(SIGSTOP);
        }
    });

    {
        let mut table = PROCS.lock();
        post_wait_event(
            &mut table,
            pid,
            WaitEvent {
                kind: WaitKind::Stopped,
                status: w_stopsig(sig),
            },
        );
    }
    let _ = send_to_process(
        with_process(pid, |p| p.parent).unwrap_or(0),
        SIGCHLD,
    );

    // SAFETY: current task is live.
    unsafe { (*current).set_state(TaskState::Stopped) };
    scheduler::schedule();
}

/// Lay the signal context and handler arguments onto the user stack and
/// point the frame at the handler.
fn push_handler_frame(
    t: &Task,
    frame: &mut UserFrame,
    sig: u8,
    action: &UserSigaction,
) -> KernelResult<()> {
    let ptd = process::addr_space_of(t.process_id)
        .ok_or(KernelError::NotFound)?
        .ptd();

    let old_mask = t.blocked_signals.load(Ordering::Acquire);
    let context = SigContext {
        frame: *frame,
        saved_mask: old_mask,
    };

    // Stack layout, downward: [SigContext][signum][return address].
    let ctx_addr = (frame.user_esp - SIGCTX_SIZE) & !3;
    let signum_addr = ctx_addr - 4;
    let ret_addr = signum_addr - 4;

    let ctx_bytes = unsafe {
        core::slice::from_raw_parts(
            &context as *const SigContext as *const u8,
            SIGCTX_SIZE as usize,
        )
    };
    user_buffer::validate_buffer(ptd, VirtAddr::new(ret_addr), (frame.user_esp - ret_addr) as usize, true)?;
    user_buffer::copy_to_user(ptd, VirtAddr::new(ctx_addr), ctx_bytes)?;
    user_buffer::copy_to_user(ptd, VirtAddr::new(signum_addr), &(sig as u32).to_le_bytes())?;
    user_buffer::copy_to_user(ptd, VirtAddr::new(ret_addr), &action.sa_restorer.to_le_bytes())?;

    // Remember where the context lives for sigreturn.
    t.signal_context.store(ctx_addr, Ordering::Release);

    // Block the signal itself (unless NODEFER) plus the action's mask
    // while the handler runs.
    let mut new_mask = old_mask | action.sa_mask;
    if action.sa_flags & SA_NODEFER == 0 {
        new_mask |= sig_bit(sig);
    }
    t.blocked_signals
        .store(new_mask & !SIG_UNCATCHABLE, Ordering::Release);

    // One-shot handlers reset to default before running.
    if action.sa_flags & SA_RESETHAND != 0 {
        let _ = with_process(t.process_id, |p| {
            p.actions[(sig - 1) as usize] = UserSigaction::default();
        });
    }

    frame.eip = action.sa_handler;
    frame.user_esp = ret_addr;
    Ok(())
}

/// sigreturn: restore the context pushed by [`push_handler_frame`].
pub fn do_sigreturn(frame: &mut UserFrame) -> KernelResult<usize> {
    let task = sched::current_task();
    if task.is_null() {
        return Err(KernelError::Invalid);
    }
    // SAFETY: current task is live.
    let t = unsafe { &*task };
    let ctx_addr = t.signal_context.swap(0, Ordering::AcqRel);
    if ctx_addr == 0 {
        return Err(KernelError::Invalid);
    }

    let ptd = process::addr_space_of(t.process_id)
        .ok_or(KernelError::NotFound)?
        .ptd();
    let mut raw = [0u8; core::mem::size_of::<SigContext>()];
    user_buffer::validate_buffer(ptd, VirtAddr::new(ctx_addr), raw.len(), false)?;
    user_buffer::copy_from_user(ptd, VirtAddr::new(ctx_addr), &mut raw)?;
    // SAFETY: SigContext is plain old data; any bit pattern is a valid
    // value, and the privileged fields are sanitized below.
    let context: SigContext = unsafe { core::ptr::read(raw.as_ptr() as *const SigContext) };

    let mut restored = context.frame;
    // User mode cannot smuggle in kernel selectors or flags.
    restored.cs = USER_CODE_SELECTOR;
    restored.user_ss = USER_DATA_SELECTOR;
    restored.ds = USER_DATA_SELECTOR;
    restored.es = USER_DATA_SELECTOR;
    restored.fs = USER_DATA_SELECTOR;
    restored.gs = USER_DATA_SELECTOR;
    restored.eflags = (restored.eflags & 0xCD5) | 0x202;

    t.blocked_signals
        .store(context.saved_mask & !SIG_UNCATCHABLE, Ordering::Release);
    *frame = restored;
    Ok(restored.eax as usize)
}

const _: () = {
    // The uncatchable set never grows silently.
    assert!(SIG_UNCATCHABLE == sig_bit(SIGKILL) | sig_bit(SIGSTOP));
};
