//! Processes: resource containers around tasks.
//!
//! A process owns an address space, a descriptor table, credentials, a
//! working directory, a signal-action table, and its position in the
//! process tree rooted at init. Tasks do the running; the process is what
//! fork/exec/exit/wait operate on.

extern crate alloc;

pub mod exec;
pub mod lifecycle;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use cinder_abi::addr::PhysAddr;
use cinder_abi::error::{KernelError, KernelResult};
use cinder_abi::signal::{NSIG, UserSigaction};
use cinder_abi::task::{INIT_PID, MAX_PROCESSES};
use cinder_lib::{CondVar, IrqMutex};
use cinder_fs::vfs::vnode::{VnodeRef, vnode_put, vnode_ref};
use cinder_mm::addr_space::AddrSpace;

use crate::sched::task::TaskId;

pub use exec::{ExecImage, ExecSegment, register_image_loader};
pub use lifecycle::{
    do_clone, do_exec, do_exit, do_fork, do_waitpid, kill, on_tick, process_alarm, process_sleep,
    set_main_task, spawn_init_process, task_exit,
};

/// Liveness of a process table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcState {
    Alive,
    Zombie,
}

/// What a waitable state change looked like.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitKind {
    Exited,
    Stopped,
    Continued,
}

#[derive(Clone, Copy, Debug)]
pub struct WaitEvent {
    pub kind: WaitKind,
    pub status: u32,
}

pub struct Process {
    pub pid: u32,
    pub parent: u32,
    pub pgid: u32,
    pub sid: u32,
    pub uid: u16,
    pub euid: u16,
    pub gid: u16,
    pub egid: u16,
    pub space: Arc<AddrSpace>,
    pub cwd: Option<VnodeRef>,
    pub children: Vec<u32>,
    pub state: ProcState,
    pub actions: [UserSigaction; NSIG],
    /// Unconsumed state change for the parent's wait.
    pub pending_event: Option<WaitEvent>,
    /// Tick at which SIGALRM fires; 0 disarmed.
    pub alarm_deadline: u64,
    /// The first task; signals without a target task land here.
    pub main_task: TaskId,
    /// SIGKILL latch: tasks exit at the next kernel boundary.
    pub dying: bool,
}

pub(crate) type ProcessTable = [Option<Box<Process>>; MAX_PROCESSES];

pub(crate) static PROCS: IrqMutex<ProcessTable> =
    IrqMutex::new([const { None }; MAX_PROCESSES]);

/// Wait condition variables, one per table slot. They live outside the
/// table lock so a waiter can pass the table guard into `wait`.
pub(crate) static CHILD_EVENT: [CondVar; MAX_PROCESSES] =
    [const { CondVar::new() }; MAX_PROCESSES];

static NEXT_PID: IrqMutex<u32> = IrqMutex::new(INIT_PID);

pub(crate) fn alloc_pid() -> u32 {
    let mut next = NEXT_PID.lock();
    let pid = *next;
    *next += 1;
    pid
}

/// Slot index of `pid` within a locked table.
pub(crate) fn slot_of(table: &ProcessTable, pid: u32) -> Option<usize> {
    table
        .iter()
        .position(|p| p.as_ref().is_some_and(|p| p.pid == pid))
}

/// Run `f` on the process entry for `pid`.
pub fn with_process<R>(pid: u32, f: impl FnOnce(&mut Process) -> R) -> Option<R> {
    let mut table = PROCS.lock();
    let slot = slot_of(&table, pid)?;
    table[slot].as_mut().map(|p| f(p))
}

/// Insert a new process entry.
pub(crate) fn insert(process: Box<Process>) -> KernelResult<usize> {
    let mut table = PROCS.lock();
    let slot = table
        .iter()
        .position(|p| p.is_none())
        .ok_or(KernelError::TooManyProcesses)?;
    table[slot] = Some(process);
    Ok(slot)
}

/// Pid of the process the current task belongs to.
pub fn current_pid() -> u32 {
    let task = crate::sched::current_task();
    if task.is_null() {
        0
    } else {
        // SAFETY: current task pointers are live.
        unsafe { (*task).process_id }
    }
}

/// Page directory of `pid`'s address space (for the dispatcher's CR3
/// decision).
pub fn addr_space_ptd(pid: u32) -> Option<PhysAddr> {
    with_process(pid, |p| p.space.ptd())
}

/// The address space of `pid`.
pub fn addr_space_of(pid: u32) -> Option<Arc<AddrSpace>> {
    with_process(pid, |p| p.space.clone())
}

/// A counted reference to `pid`'s working directory.
pub fn cwd_of(pid: u32) -> Option<VnodeRef> {
    with_process(pid, |p| p.cwd.as_ref().map(vnode_ref)).flatten()
}

/// Replace `pid`'s working directory, dropping the old reference.
pub fn set_cwd(pid: u32, new_cwd: VnodeRef) {
    let old = with_process(pid, |p| p.cwd.replace(new_cwd)).flatten();
    if let Some(old) = old {
        vnode_put(old);
    }
}

/// Establish the kernel's own process entry (pid 0) around the kernel
/// address space; the bootstrap task and kernel daemons belong to it.
pub fn init_kernel_process(space: Arc<AddrSpace>, root: Option<VnodeRef>) -> KernelResult<()> {
    let process = Box::new(Process {
        pid: 0,
        parent: 0,
        pgid: 0,
        sid: 0,
        uid: 0,
        euid: 0,
        gid: 0,
        egid: 0,
        space,
        cwd: root,
        children: Vec::new(),
        state: ProcState::Alive,
        actions: [UserSigaction::default(); NSIG],
        pending_event: None,
        alarm_deadline: 0,
        main_task: cinder_abi::task::INVALID_TASK_ID,
        dying: false,
    });
    let _ = cinder_fs::file_table::fd_table_create(0);
    insert(process)?;
    Ok(())
}

// =============================================================================
// Process groups, sessions, credentials
// =============================================================================

pub fn getpid() -> u32 {
    current_pid()
}

pub fn getppid() -> u32 {
    with_process(current_pid(), |p| p.parent).unwrap_or(0)
}

pub fn getpgrp() -> u32 {
    with_process(current_pid(), |p| p.pgid).unwrap_or(0)
}

/// `setpgid(pid, pgid)`: pid 0 means the caller, pgid 0 means "use the
/// target's pid". Only the caller itself or its children may be moved.
pub fn setpgid(pid: u32, pgid: u32) -> KernelResult<usize> {
    let me = current_pid();
    let target = if pid == 0 { me } else { pid };
    let new_pgid = if pgid == 0 { target } else { pgid };

    let allowed =
        target == me || with_process(target, |p| p.parent == me).unwrap_or(false);
    if !allowed {
        return Err(KernelError::Permission);
    }
    with_process(target, |p| p.pgid = new_pgid).ok_or(KernelError::NotFound)?;
    Ok(0)
}

/// `setsid`: the caller becomes leader of a new session and group and
/// loses its controlling terminal.
pub fn setsid() -> KernelResult<usize> {
    let me = current_pid();
    with_process(me, |p| {
        if p.pgid == p.pid {
            return Err(KernelError::Permission); // already a group leader
        }
        p.sid = p.pid;
        p.pgid = p.pid;
        Ok(p.pid as usize)
    })
    .ok_or(KernelError::NotFound)?
}

pub fn getsid(pid: u32) -> KernelResult<usize> {
    let target = if pid == 0 { current_pid() } else { pid };
    with_process(target, |p| p.sid as usize).ok_or(KernelError::NotFound)
}

pub fn getuid() -> u32 {
    with_process(current_pid(), |p| p.uid as u32).unwrap_or(0)
}

pub fn geteuid() -> u32 {
    with_process(current_pid(), |p| p.euid as u32).unwrap_or(0)
}

pub fn getgid() -> u32 {
    with_process(current_pid(), |p| p.gid as u32).unwrap_or(0)
}

pub fn getegid() -> u32 {
    with_process(current_pid(), |p| p.egid as u32).unwrap_or(0)
}

/// The classic rules: root may set anything; others only their own ids.
pub fn setuid(uid: u16) -> KernelResult<usize> {
    with_process(current_pid(), |p| {
        if p.euid == 0 || uid == p.uid {
            p.uid = uid;
            p.euid = uid;
            Ok(0)
        } else {
            Err(KernelError::Permission)
        }
    })
    .ok_or(KernelError::NotFound)?
}

pub fn seteuid(euid: u16) -> KernelResult<usize> {
    with_process(current_pid(), |p| {
        if p.euid == 0 || euid == p.uid {
            p.euid = euid;
            Ok(0)
        } else {
            Err(KernelError::Permission)
        }
    })
    .ok_or(KernelError::NotFound)?
}

pub fn setgid(gid: u16) -> KernelResult<usize> {
    with_process(current_pid(), |p| {
        if p.euid == 0 || gid == p.gid {
            p.gid = gid;
            p.egid = gid;
            Ok(0)
        } else {
            Err(KernelError::Permission)
        }
    })
    .ok_or(KernelError::NotFound)?
}

pub fn setegid(egid: u16) -> KernelResult<usize> {
    with_process(current_pid(), |p| {
        if p.euid == 0 || egid == p.gid {
            p.egid = egid;
            Ok(0)
        } else {
            Err(KernelError::Permission)
        }
    })
    .ok_or(KernelError::NotFound)?
}

/// Signal a waitable state change on `child_slot`'s parent: store the
/// event and wake the parent's wait.
pub(crate) fn post_wait_event(table: &mut ProcessTable, child_pid: u32, event: WaitEvent) {
    let Some(child_slot) = slot_of(table, child_pid) else {
        return;
    };
    let parent_pid = table[child_slot].as_ref().map(|p| p.parent).unwrap_or(0);
    if let Some(p) = table[child_slot].as_mut() {
        p.pending_event = Some(event);
    }
    if let Some(parent_slot) = slot_of(table, parent_pid) {
        CHILD_EVENT[parent_slot].broadcast();
    }
}
