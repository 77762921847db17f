//! Virtual address space layout.
//!
//! ```text
//! 0x0000_0000 ┌──────────────────────────────┐
//!             │ kernel / common area          │  PTD slots 0..256, shared
//!             │ (identity-mapped RAM, image)  │  by every address space
//! 0x4000_0000 ├──────────────────────────────┤
//!             │ user code/data/heap           │  per address space
//! 0xB000_0000 ├──────────────────────────────┤  user stack top
//!             │ (unused)                      │
//! 0xD000_0000 ├──────────────────────────────┤
//!             │ kernel stack arena            │  per address space
//! 0xE000_0000 ├──────────────────────────────┤  kernel stack top
//!             │ (unused)                      │
//! 0xF000_0000 ├──────────────────────────────┤
//!             │ memory-mapped I/O window      │  PTs pre-created, shared
//! 0xFFC0_0000 ├──────────────────────────────┤
//!             │ page-table self-map           │  PTD slot 1023
//! 0xFFFF_FFFF └──────────────────────────────┘
//! ```

use cinder_abi::PAGE_SIZE;
use cinder_abi::addr::VirtAddr;
use cinder_abi::task::{STACK_PAGES_GAP, STACK_PAGES_TASK};

/// Entries per page directory / page table.
pub const PTD_ENTRIES: usize = 1024;
pub const PT_ENTRIES: usize = 1024;

/// Bytes covered by one PTD slot (one page table).
pub const PTD_SLOT_SPAN: u32 = PAGE_SIZE * PT_ENTRIES as u32;

/// PTD slots `0..KERNEL_SHARED_PTD_SLOTS` hold the shared kernel mappings,
/// identical across all address spaces.
pub const KERNEL_SHARED_PTD_SLOTS: usize = 256;

/// Lowest user-mode address; nothing below this resolves for user code.
pub const USER_AREA_BASE: u32 = 0x4000_0000;

/// Top of the user-mode stack.
pub const USER_STACK_TOP: u32 = 0xB000_0000;

/// Pages mapped initially for a fresh user stack.
pub const USER_STACK_INITIAL_PAGES: u32 = 8;

/// Kernel stack arena: slots grow downward from `KERNEL_STACK_TOP`.
pub const KERNEL_STACK_ARENA_BASE: u32 = 0xD000_0000;
pub const KERNEL_STACK_TOP: u32 = 0xE000_0000;

/// Pages per kernel-stack slot including the guard gap below it.
pub const STACK_SLOT_PAGES: u32 = STACK_PAGES_TASK + STACK_PAGES_GAP;

/// Kernel-stack slots available per address space.
pub const MAX_STACK_SLOTS: usize = 64;

/// Memory-mapped I/O window.
pub const MEMIO_BASE: u32 = 0xF000_0000;
pub const MEMIO_END: u32 = 0xFFC0_0000;

/// The PTD self-map occupies the last PTD slot: with it installed, all page
/// tables of the live address space appear at `SELF_MAP_BASE` and the PTD
/// itself at `SELF_MAP_PTD`.
pub const SELF_MAP_SLOT: usize = 1023;
pub const SELF_MAP_BASE: u32 = 0xFFC0_0000;
pub const SELF_MAP_PTD: u32 = 0xFFFF_F000;

/// First PTD slot of the user area.
pub const USER_FIRST_SLOT: usize = (USER_AREA_BASE / PTD_SLOT_SPAN) as usize;

/// PTD slot range of the kernel stack arena.
pub const STACK_ARENA_FIRST_SLOT: usize = (KERNEL_STACK_ARENA_BASE / PTD_SLOT_SPAN) as usize;
pub const STACK_ARENA_END_SLOT: usize = (KERNEL_STACK_TOP / PTD_SLOT_SPAN) as usize;

/// PTD slot range of the mem-I/O window.
pub const MEMIO_FIRST_SLOT: usize = (MEMIO_BASE / PTD_SLOT_SPAN) as usize;
pub const MEMIO_END_SLOT: usize = (MEMIO_END / PTD_SLOT_SPAN) as usize;

/// Top of the kernel stack of slot `index` (exclusive upper bound of the
/// mapped pages). Slot 0 ends at `KERNEL_STACK_TOP`; each further slot sits
/// `STACK_SLOT_PAGES` pages lower, leaving the gap page unmapped between
/// neighbors.
#[inline]
pub const fn stack_slot_top(index: usize) -> VirtAddr {
    VirtAddr::new(KERNEL_STACK_TOP - (index as u32) * STACK_SLOT_PAGES * PAGE_SIZE)
}

/// Lowest mapped page of the kernel stack of slot `index`.
#[inline]
pub const fn stack_slot_base(index: usize) -> VirtAddr {
    VirtAddr::new(stack_slot_top(index).as_u32() - STACK_PAGES_TASK * PAGE_SIZE)
}

/// `true` if `addr` lies in the user-controllable range.
#[inline]
pub const fn is_user_addr(addr: u32) -> bool {
    addr >= USER_AREA_BASE && addr < USER_STACK_TOP
}

const _: () = assert!(USER_AREA_BASE % PTD_SLOT_SPAN == 0);
const _: () = assert!(KERNEL_STACK_ARENA_BASE % PTD_SLOT_SPAN == 0);
const _: () = assert!(MEMIO_BASE % PTD_SLOT_SPAN == 0);
const _: () = assert!(
    stack_slot_base(MAX_STACK_SLOTS - 1).as_u32() >= KERNEL_STACK_ARENA_BASE,
    "stack arena must hold MAX_STACK_SLOTS slots"
);
