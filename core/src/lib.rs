//! CinderOS process model, scheduler, signals, and syscall dispatch.

#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod process;
pub mod sched;
pub mod signal;
pub mod syscall;
pub mod tty;

pub mod tests_sched;
pub mod tests_signal;
pub mod tests_tty;
