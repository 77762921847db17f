//! System call dispatch.
//!
//! `int 0x80` lands here with the number in EAX and arguments in EBX, ECX,
//! EDX, ESI, EDI, EBP. Handlers return an `i32`; negative values are
//! `-errno`. The socket syscalls are registered by the network crate at
//! boot through [`register_syscall`], which keeps this crate below it in
//! the dependency order.

pub mod fs_handlers;
pub mod misc_handlers;
pub mod process_handlers;

use core::sync::atomic::{AtomicPtr, Ordering};

use cinder_abi::error::KernelError;
use cinder_abi::syscall::{self, SYS_MAX};
use cinder_lib::klog_debug;

use crate::sched::scheduler;
use crate::sched::switch::UserFrame;
use crate::signal;

/// Handler contract: the full frame, for syscalls that rewrite it (fork,
/// exec, sigreturn) or read the register arguments.
pub type SyscallHandler = fn(&mut UserFrame) -> i32;

const TABLE_SIZE: usize = SYS_MAX as usize + 1;

static HANDLERS: [AtomicPtr<()>; TABLE_SIZE] =
    [const { AtomicPtr::new(core::ptr::null_mut()) }; TABLE_SIZE];

/// Install a handler for a syscall number. Used by this crate at init and
/// by the network stack for the socket family.
pub fn register_syscall(number: u32, handler: SyscallHandler) {
    if (number as usize) < TABLE_SIZE {
        HANDLERS[number as usize].store(handler as *mut (), Ordering::Release);
    }
}

/// Arguments as the convention lays them out.
#[inline]
pub fn args(frame: &UserFrame) -> [u32; 6] {
    [
        frame.ebx, frame.ecx, frame.edx, frame.esi, frame.edi, frame.ebp,
    ]
}

/// The syscall trap body: dispatch, store the result in EAX, then run the
/// return-to-user work (signal delivery, preemption).
pub fn syscall_entry(frame: &mut UserFrame) {
    let number = frame.eax;
    let result = dispatch(number, frame);
    frame.eax = result as u32;
    return_to_user(frame);
}

fn dispatch(number: u32, frame: &mut UserFrame) -> i32 {
    let handler = if (number as usize) < TABLE_SIZE {
        HANDLERS[number as usize].load(Ordering::Acquire)
    } else {
        core::ptr::null_mut()
    };
    if handler.is_null() {
        klog_debug!("syscall: unknown number {}", number);
        return KernelError::NotSupported.to_syscall_ret();
    }
    // SAFETY: only SyscallHandler fn pointers are registered.
    let handler: SyscallHandler = unsafe { core::mem::transmute(handler) };
    handler(frame)
}

/// Work every trap performs on its way back to user mode: pending signal
/// delivery (which may rewrite the frame, stop, or kill) and the deferred
/// reschedule from the timer tick.
pub fn return_to_user(frame: &mut UserFrame) {
    signal::deliver_pending(frame);
    scheduler::preempt_point();
}

/// Timer interrupt body: tick bookkeeping, then the trap-exit work.
pub fn timer_interrupt(frame: &mut UserFrame) {
    scheduler::on_timer_tick();
    cinder_net_tick_hook();
    return_to_user(frame);
}

/// The network stack registers its per-tick maintenance (reassembly
/// expiry, TCP timers) here.
static NET_TICK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

pub fn register_net_tick(hook: fn()) {
    NET_TICK.store(hook as *mut (), Ordering::Release);
}

fn cinder_net_tick_hook() {
    let ptr = NET_TICK.load(Ordering::Acquire);
    if !ptr.is_null() {
        // SAFETY: only fn() pointers are stored.
        let hook: fn() = unsafe { core::mem::transmute(ptr) };
        hook();
    }
}

/// Install every handler this crate owns.
pub fn syscall_init() {
    use syscall::*;

    // Process control.
    register_syscall(SYS_FORK, process_handlers::sys_fork);
    register_syscall(SYS_EXECVE, process_handlers::sys_execve);
    register_syscall(SYS_EXIT, process_handlers::sys_exit);
    register_syscall(SYS_WAITPID, process_handlers::sys_waitpid);
    register_syscall(SYS_GETPID, process_handlers::sys_getpid);
    register_syscall(SYS_GETPPID, process_handlers::sys_getppid);
    register_syscall(SYS_SETPGID, process_handlers::sys_setpgid);
    register_syscall(SYS_GETPGRP, process_handlers::sys_getpgrp);
    register_syscall(SYS_SETSID, process_handlers::sys_setsid);
    register_syscall(SYS_GETSID, process_handlers::sys_getsid);
    register_syscall(SYS_KILL, process_handlers::sys_kill);
    register_syscall(SYS_SIGACTION, process_handlers::sys_sigaction);
    register_syscall(SYS_SIGPROCMASK, process_handlers::sys_sigprocmask);
    register_syscall(SYS_SIGRETURN, process_handlers::sys_sigreturn);
    register_syscall(SYS_ALARM, process_handlers::sys_alarm);
    register_syscall(SYS_SLEEP, process_handlers::sys_sleep);

    // Credentials.
    register_syscall(SYS_GETUID, process_handlers::sys_getuid);
    register_syscall(SYS_SETUID, process_handlers::sys_setuid);
    register_syscall(SYS_GETEUID, process_handlers::sys_geteuid);
    register_syscall(SYS_SETEUID, process_handlers::sys_seteuid);
    register_syscall(SYS_GETGID, process_handlers::sys_getgid);
    register_syscall(SYS_SETGID, process_handlers::sys_setgid);
    register_syscall(SYS_GETEGID, process_handlers::sys_getegid);
    register_syscall(SYS_SETEGID, process_handlers::sys_setegid);

    // Files.
    register_syscall(SYS_OPEN, fs_handlers::sys_open);
    register_syscall(SYS_CLOSE, fs_handlers::sys_close);
    register_syscall(SYS_READ, fs_handlers::sys_read);
    register_syscall(SYS_WRITE, fs_handlers::sys_write);
    register_syscall(SYS_LSEEK, fs_handlers::sys_lseek);
    register_syscall(SYS_DUP, fs_handlers::sys_dup);
    register_syscall(SYS_DUP2, fs_handlers::sys_dup2);
    register_syscall(SYS_PIPE, fs_handlers::sys_pipe);
    register_syscall(SYS_STAT, fs_handlers::sys_stat);
    register_syscall(SYS_FSTAT, fs_handlers::sys_fstat);
    register_syscall(SYS_CHMOD, fs_handlers::sys_chmod);
    register_syscall(SYS_UTIME, fs_handlers::sys_utime);
    register_syscall(SYS_LINK, fs_handlers::sys_link);
    register_syscall(SYS_UNLINK, fs_handlers::sys_unlink);
    register_syscall(SYS_RENAME, fs_handlers::sys_rename);
    register_syscall(SYS_MKDIR, fs_handlers::sys_mkdir);
    register_syscall(SYS_RMDIR, fs_handlers::sys_rmdir);
    register_syscall(SYS_CHDIR, fs_handlers::sys_chdir);
    register_syscall(SYS_GETCWD, fs_handlers::sys_getcwd);
    register_syscall(SYS_FTRUNCATE, fs_handlers::sys_ftruncate);
    register_syscall(SYS_ISATTY, fs_handlers::sys_isatty);
    register_syscall(SYS_IOCTL, fs_handlers::sys_ioctl);
    register_syscall(SYS_GETDENT, fs_handlers::sys_getdent);
    register_syscall(SYS_MOUNT, fs_handlers::sys_mount);
    register_syscall(SYS_UNMOUNT, fs_handlers::sys_unmount);

    // Memory and time.
    register_syscall(SYS_SBRK, misc_handlers::sys_sbrk);
    register_syscall(SYS_TIME, misc_handlers::sys_time);
    register_syscall(SYS_TIMES, misc_handlers::sys_times);
}
