//! Task and process constants shared across the kernel.

/// Maximum number of processes.
pub const MAX_PROCESSES: usize = 64;

/// Maximum number of tasks across all processes.
pub const MAX_TASKS: usize = 128;

/// Maximum number of CPUs the scheduler dispatches across.
pub const MAX_CPUS: usize = 8;

/// Sentinel for "no process".
pub const INVALID_PROCESS_ID: u32 = u32::MAX;

/// Sentinel for "no task".
pub const INVALID_TASK_ID: u32 = u32::MAX;

/// Pid of the init process; orphans are reparented to it.
pub const INIT_PID: u32 = 1;

/// Kernel stack pages per task.
pub const STACK_PAGES_TASK: u32 = 4;

/// Guard pages between adjacent kernel stack slots.
pub const STACK_PAGES_GAP: u32 = 1;

/// Scheduling priorities. Higher value runs first.
pub const TASK_PRIORITY_IDLE: u8 = 0;
pub const TASK_PRIORITY_LOW: u8 = 1;
pub const TASK_PRIORITY_NORMAL: u8 = 2;
pub const TASK_PRIORITY_HIGH: u8 = 3;
pub const TASK_PRIORITY_LEVELS: usize = 4;

/// Timer ticks a task runs before preemption.
pub const TASK_DEFAULT_QUANTUM: u32 = 10;

/// Scheduling state of a task.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// On a ready queue, runnable.
    Ready = 0,
    /// Currently executing on some CPU.
    Running = 1,
    /// Waiting on a primitive or I/O.
    Blocked = 2,
    /// Stopped by job control (SIGSTOP/SIGTSTP/SIGTTIN/SIGTTOU).
    Stopped = 3,
    /// Exited, awaiting reap.
    Zombie = 4,
}

/// CPU affinity: any CPU, or pinned to one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuAffinity {
    Any,
    Pinned(u8),
}
