//! Preemptive priority scheduler.
//!
//! The schedulable unit is the [`Task`](task::Task); processes are resource
//! containers around them. Each CPU has a ready queue per priority level;
//! dispatch picks the highest non-empty level and round-robins inside it.
//! The timer tick burns the running task's quantum and requests a switch
//! when it hits zero or a higher-priority task becomes ready.

pub mod scheduler;
pub mod switch;
pub mod task;

pub use scheduler::{
    block_current, current_task, enqueue_ready, on_timer_tick, sched_init, schedule,
    set_cpu_count, unblock, yield_now,
};
pub use switch::{SwitchFrame, UserFrame};
pub use task::{Task, TaskId, task_by_id};
