//! fork, exec, exit, wait, kill, alarm.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;

use cinder_abi::error::{KernelError, KernelResult};
use cinder_abi::signal::{
    NSIG, SIGALRM, SIGCHLD, UserSigaction, W_CONTINUED, WCONTINUED, WNOHANG, WUNTRACED, w_exitcode,
};
use cinder_abi::task::{CpuAffinity, INIT_PID, TaskState};
use cinder_fs::file_table;
use cinder_fs::vfs::vnode::{vnode_put, vnode_ref};
use cinder_lib::klog_debug;
use cinder_lib::ports::TICK_FREQUENCY_HZ;
use cinder_lib::{clock, sched_hooks};

use crate::sched::switch::{SwitchFrame, UserFrame, enter_user_frame};
use crate::sched::task::{self, Task, task_create, task_destroy};
use crate::sched::{self, scheduler};
use crate::signal;

use super::{
    CHILD_EVENT, PROCS, ProcState, Process, WaitEvent, WaitKind, alloc_pid, current_pid, insert,
    post_wait_event, slot_of, with_process,
};

/// Every fresh task enters user mode through its parked fork frame.
fn fork_child_entry(arg: usize) {
    let task = arg as *mut Task;
    // SAFETY: the entry only runs on the just-created child task; its
    // fork frame was filled before the task was enqueued.
    unsafe { enter_user_frame(&(*task).fork_frame) };
}

/// Clone the current process. `share_vm` keeps one address space (the
/// thread-style clone); otherwise the user area is deep-copied. Only the
/// calling task exists in the child. Returns the child pid to the parent;
/// the child resumes from `frame` with EAX forced to 0.
pub fn do_clone(frame: &UserFrame, share_vm: bool) -> KernelResult<usize> {
    let parent_task = sched::current_task();
    if parent_task.is_null() {
        return Err(KernelError::Invalid);
    }
    // SAFETY: current task is live.
    let parent_stack_slot = unsafe { (*parent_task).kernel_stack.slot };
    let parent_priority = unsafe { (*parent_task).priority };
    let parent_pid = current_pid();

    let (space, creds, pgid, sid, actions, cwd) = {
        let mut table = PROCS.lock();
        let slot = slot_of(&table, parent_pid).ok_or(KernelError::NotFound)?;
        let parent = table[slot].as_mut().ok_or(KernelError::NotFound)?;
        (
            parent.space.clone(),
            (parent.uid, parent.euid, parent.gid, parent.egid),
            parent.pgid,
            parent.sid,
            parent.actions,
            parent.cwd.as_ref().map(vnode_ref),
        )
    };

    let child_space = if share_vm {
        space
    } else {
        space.clone_for_fork(parent_stack_slot)?
    };

    let child_pid = alloc_pid();
    let child = Box::new(Process {
        pid: child_pid,
        parent: parent_pid,
        pgid,
        sid,
        uid: creds.0,
        euid: creds.1,
        gid: creds.2,
        egid: creds.3,
        space: child_space,
        cwd,
        children: Vec::new(),
        state: ProcState::Alive,
        actions,
        pending_event: None,
        alarm_deadline: 0,
        main_task: cinder_abi::task::INVALID_TASK_ID,
        dying: false,
    });

    // Descriptor table: same files, bumped refs, shared cursors.
    file_table::fd_table_clone(parent_pid, child_pid).map_err(KernelError::from)?;

    let kernel_stack = unsafe { (*parent_task).kernel_stack };
    let child_task = match task_create(
        child_pid,
        parent_priority,
        CpuAffinity::Any,
        kernel_stack,
    ) {
        Some(t) => t,
        None => {
            file_table::fd_table_destroy(child_pid);
            return Err(KernelError::TooManyProcesses);
        }
    };

    // SAFETY: fresh task, not yet visible to the scheduler.
    unsafe {
        (*child_task).fork_frame = *frame;
        (*child_task).fork_frame.eax = 0; // fork returns 0 in the child
        (*child_task).entry_point = fork_child_entry as *const () as usize;
        (*child_task).entry_arg = child_task as usize;
        (*child_task).blocked_signals = core::sync::atomic::AtomicU32::new(
            (*parent_task)
                .blocked_signals
                .load(core::sync::atomic::Ordering::Acquire),
        );
        (*child_task).switch_frame = SwitchFrame::new_for_task(
            scheduler::task_start_addr(),
            child_task as usize as u32,
            kernel_stack.top.as_u32(),
        );
    }

    let mut child = child;
    child.main_task = unsafe { (*child_task).id };
    insert(child)?;

    {
        let mut table = PROCS.lock();
        if let Some(slot) = slot_of(&table, parent_pid) {
            if let Some(parent) = table[slot].as_mut() {
                parent.children.push(child_pid);
            }
        }
    }

    scheduler::enqueue_ready(child_task);
    klog_debug!("proc: fork {} -> {}", parent_pid, child_pid);
    Ok(child_pid as usize)
}

/// Plain fork.
pub fn do_fork(frame: &UserFrame) -> KernelResult<usize> {
    do_clone(frame, false)
}

/// Replace the current image; see `exec` for the loading half.
pub fn do_exec(
    frame: &mut UserFrame,
    path: &[u8],
    argv: &[&[u8]],
    envp: &[&[u8]],
) -> KernelResult<usize> {
    super::exec::exec_current(frame, path, argv, envp)?;
    Ok(0)
}

/// Terminate the current task with an already-encoded status word. When
/// it is the process's last live task the whole process exits. Never
/// returns.
pub fn task_exit(status_word: u32) -> ! {
    let task = sched::current_task();
    if task.is_null() {
        // Exit without task context: nothing to unwind into.
        loop {
            cinder_lib::cpu::hlt();
        }
    }
    let pid = current_pid();
    // SAFETY: current task is live.
    let my_id = unsafe {
        (*task)
            .exit_status
            .store(status_word, core::sync::atomic::Ordering::Release);
        (*task).id
    };

    // Count the other live tasks first; resource teardown below can
    // block, so this task must stay Running until it is done.
    let mut live = 0;
    task::for_each_task(|t| {
        // SAFETY: table pointers are live.
        let t = unsafe { &*t };
        if t.process_id == pid && t.id != my_id && t.state() != TaskState::Zombie {
            live += 1;
        }
    });
    if live == 0 {
        process_exit(pid, status_word);
    }

    // SAFETY: current task is live; after this store it must not block.
    unsafe { (*task).set_state(TaskState::Zombie) };
    scheduler::schedule();
    // A Zombie task is never dispatched again.
    cinder_lib::kernel_bug!("zombie task {} resumed", pid);
}

/// `exit(status)` from a syscall.
pub fn do_exit(status: u8) -> ! {
    task_exit(w_exitcode(status))
}

/// The process-level half of exit: release resources, reparent children,
/// go Zombie, notify the parent.
fn process_exit(pid: u32, status_word: u32) {
    // Resource teardown happens outside the table lock; it can block on
    // filesystem locks.
    file_table::fd_table_destroy(pid);
    let (cwd, space) = {
        let mut table = PROCS.lock();
        match slot_of(&table, pid).and_then(|s| table[s].as_mut()) {
            Some(p) => (p.cwd.take(), Some(p.space.clone())),
            None => (None, None),
        }
    };
    if let Some(cwd) = cwd {
        vnode_put(cwd);
    }
    if let Some(space) = space {
        space.teardown_user_area();
    }

    let mut table = PROCS.lock();

    // Children are reparented to init; zombies among them will be reaped
    // on init's next wait.
    let orphans: Vec<u32> = match slot_of(&table, pid).and_then(|s| table[s].as_mut()) {
        Some(p) => core::mem::take(&mut p.children),
        None => Vec::new(),
    };
    let mut init_has_new_zombie = false;
    for orphan in orphans {
        if let Some(slot) = slot_of(&table, orphan) {
            if let Some(child) = table[slot].as_mut() {
                child.parent = INIT_PID;
                if child.state == ProcState::Zombie {
                    init_has_new_zombie = true;
                }
            }
        }
        if let Some(init_slot) = slot_of(&table, INIT_PID) {
            if let Some(init) = table[init_slot].as_mut() {
                init.children.push(orphan);
            }
        }
    }
    if init_has_new_zombie {
        if let Some(init_slot) = slot_of(&table, INIT_PID) {
            CHILD_EVENT[init_slot].broadcast();
        }
    }

    let parent_pid = match slot_of(&table, pid).and_then(|s| table[s].as_mut()) {
        Some(p) => {
            p.state = ProcState::Zombie;
            p.parent
        }
        None => return,
    };
    post_wait_event(
        &mut table,
        pid,
        WaitEvent {
            kind: WaitKind::Exited,
            status: status_word,
        },
    );
    drop(table);

    let _ = signal::send_to_process(parent_pid, SIGCHLD);
    klog_debug!("proc: {} exited, status {:#x}", pid, status_word);
}

/// Does `child` match the waitpid selector? `my_pgid` is the caller's
/// process group (selector 0).
fn selector_matches(selector: i32, my_pgid: u32, child: &Process) -> bool {
    if selector == -1 {
        true
    } else if selector == 0 {
        my_pgid == child.pgid
    } else if selector > 0 {
        child.pid == selector as u32
    } else {
        child.pgid == (-selector) as u32
    }
}

/// Fully dispose of a reaped zombie: its tasks, its address space, and
/// its table entry.
fn reap(pid: u32) {
    let mut zombies = Vec::new();
    task::for_each_task(|t| {
        // SAFETY: table pointers are live.
        if unsafe { (*t).process_id } == pid {
            zombies.push(t);
        }
    });
    for t in zombies {
        task_destroy(t);
    }
    let entry = {
        let mut table = PROCS.lock();
        slot_of(&table, pid).and_then(|s| table[s].take())
    };
    if let Some(process) = entry {
        // Stacks and page tables go with the address space when this is
        // its last reference.
        if alloc::sync::Arc::strong_count(&process.space) == 1 {
            process.space.destroy();
        }
    }
}

/// waitpid: block until a matching child changes state. Returns
/// `(pid, status_word)`.
pub fn do_waitpid(selector: i32, options: u32) -> KernelResult<(u32, u32)> {
    let me = current_pid();
    let my_slot = {
        let table = PROCS.lock();
        slot_of(&table, me).ok_or(KernelError::NotFound)?
    };

    let mut table = PROCS.lock();
    loop {
        let mut have_candidates = false;
        let mut ready: Option<(u32, WaitEvent)> = None;

        let my_pgid = table[my_slot].as_ref().map(|p| p.pgid).unwrap_or(0);
        let children: Vec<u32> = table[my_slot]
            .as_ref()
            .map(|p| p.children.clone())
            .unwrap_or_default();
        for child_pid in children {
            let Some(child_slot) = slot_of(&table, child_pid) else {
                continue;
            };
            let Some(child) = table[child_slot].as_mut() else {
                continue;
            };
            if !selector_matches(selector, my_pgid, child) {
                continue;
            }
            have_candidates = true;

            let consumable = match child.pending_event {
                Some(e) => match e.kind {
                    WaitKind::Exited => true,
                    WaitKind::Stopped => options & WUNTRACED != 0,
                    WaitKind::Continued => options & WCONTINUED != 0,
                },
                None => false,
            };
            if consumable {
                let event = child.pending_event.take().unwrap_or(WaitEvent {
                    kind: WaitKind::Exited,
                    status: 0,
                });
                ready = Some((child_pid, event));
                break;
            }
        }

        if let Some((child_pid, event)) = ready {
            if event.kind == WaitKind::Exited {
                if let Some(p) = table[my_slot].as_mut() {
                    p.children.retain(|&c| c != child_pid);
                }
                drop(table);
                reap(child_pid);
            }
            return Ok((child_pid, event.status));
        }

        if !have_candidates {
            return Err(KernelError::NoChild);
        }
        if options & WNOHANG != 0 {
            return Ok((0, 0));
        }

        match CHILD_EVENT[my_slot].wait_intr(table) {
            Ok(guard) => table = guard,
            Err((_, e)) => return Err(e),
        }
    }
}

/// kill: positive pid targets one process, 0 the caller's group, -1 every
/// process the caller may signal, and `-pgid` a group.
pub fn kill(selector: i32, sig: u8) -> KernelResult<usize> {
    if sig as usize > cinder_abi::signal::NSIG {
        return Err(KernelError::Invalid);
    }
    let me = current_pid();
    if selector > 0 {
        signal::send_to_process(selector as u32, sig)?;
    } else if selector == 0 {
        let pgid = with_process(me, |p| p.pgid).unwrap_or(0);
        signal::send_to_group(pgid, sig)?;
    } else if selector == -1 {
        signal::send_to_all_except_init(sig)?;
    } else {
        signal::send_to_group((-selector) as u32, sig)?;
    }
    Ok(0)
}

/// alarm(seconds): arm (or cancel with 0) the per-process SIGALRM timer.
/// Returns the seconds that were remaining.
pub fn process_alarm(seconds: u32) -> KernelResult<usize> {
    let now = clock::uptime_ticks();
    let hz = TICK_FREQUENCY_HZ as u64;
    with_process(current_pid(), |p| {
        let remaining = if p.alarm_deadline > now {
            ((p.alarm_deadline - now) / hz) as usize
        } else {
            0
        };
        p.alarm_deadline = if seconds == 0 {
            0
        } else {
            now + seconds as u64 * hz
        };
        remaining
    })
    .ok_or(KernelError::NotFound)
}

/// sleep(seconds): interruptible tick-based sleep; returns unslept whole
/// seconds when a signal cuts it short.
pub fn process_sleep(seconds: u32) -> usize {
    let hz = TICK_FREQUENCY_HZ as u64;
    let deadline = clock::uptime_ticks() + seconds as u64 * hz;
    loop {
        let now = clock::uptime_ticks();
        if now >= deadline {
            return 0;
        }
        match sched_hooks::block_current(true, deadline - now) {
            sched_hooks::WakeReason::Interrupted => {
                let now = clock::uptime_ticks();
                return ((deadline.saturating_sub(now)) / hz) as usize;
            }
            sched_hooks::WakeReason::TimedOut => return 0,
            sched_hooks::WakeReason::Woken => {}
        }
    }
}

/// Timer callback: fire due alarms.
pub fn on_tick(now: u64) {
    let mut due = Vec::new();
    {
        let mut table = PROCS.lock();
        for entry in table.iter_mut().flatten() {
            if entry.alarm_deadline != 0 && now >= entry.alarm_deadline {
                entry.alarm_deadline = 0;
                due.push(entry.pid);
            }
        }
    }
    for pid in due {
        let _ = signal::send_to_process(pid, SIGALRM);
    }
}

/// Build the init process around an already-created user address space
/// and task (the boot path uses this once the root filesystem is up).
pub fn spawn_init_process(
    space: alloc::sync::Arc<cinder_mm::addr_space::AddrSpace>,
    root: cinder_fs::vfs::vnode::VnodeRef,
) -> KernelResult<u32> {
    let pid = alloc_pid();
    debug_assert_eq!(pid, INIT_PID);
    file_table::fd_table_create(pid).map_err(KernelError::from)?;
    let process = Box::new(Process {
        pid,
        parent: 0,
        pgid: pid,
        sid: pid,
        uid: 0,
        euid: 0,
        gid: 0,
        egid: 0,
        space,
        cwd: Some(root),
        children: Vec::new(),
        state: ProcState::Alive,
        actions: [UserSigaction::default(); NSIG],
        pending_event: None,
        alarm_deadline: 0,
        main_task: cinder_abi::task::INVALID_TASK_ID,
        dying: false,
    });
    insert(process)?;
    Ok(pid)
}

/// Record which task is a process's main task (boot path).
pub fn set_main_task(pid: u32, task_id: crate::sched::task::TaskId) {
    let _ = with_process(pid, |p| p.main_task = task_id);
}

/// The `W_CONTINUED` status constant re-exported for the syscall layer.
pub const CONTINUED_STATUS: u32 = W_CONTINUED;
