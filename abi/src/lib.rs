//! CinderOS kernel/userland ABI types.
//!
//! Canonical definitions for everything shared between the kernel core and
//! its external collaborators (libc, the ELF loader, drivers). A single
//! source of truth avoids duplicate definitions and ABI drift; everything
//! with a fixed layout is `#[repr(C)]`.

#![no_std]
#![forbid(unsafe_code)]

pub mod addr;
pub mod error;
pub mod fs;
pub mod net;
pub mod signal;
pub mod syscall;
pub mod task;

/// 4 KiB page size, the only page size the core uses.
pub const PAGE_SIZE: u32 = 0x1000;

pub use addr::{PhysAddr, VirtAddr};
pub use error::{KernelError, KernelResult};
