//! Two-level x86 page tables.
//!
//! A page directory (PTD) of 1024 entries, each pointing at a page table
//! (PT) of 1024 entries mapping 4 KiB pages. The last PTD slot maps the
//! directory onto itself, so while a directory is live its tables appear at
//! [`SELF_MAP_BASE`](crate::layout::SELF_MAP_BASE) and the directory at
//! [`SELF_MAP_PTD`](crate::layout::SELF_MAP_PTD).
//!
//! Walks go through the self-map when paging is on and the target directory
//! is the active one; otherwise (bootstrap before CR3 is loaded, or when
//! editing another address space) they go through the identity region.

pub mod tables;

pub use tables::{
    MapAttrs, Pte, current_ptd, map_page, new_page_table, paging_enabled, ptd_entry,
    release_ptd_range, set_paging_enabled, switch_address_space, translate, unmap_page,
    unmap_page_keep_frame,
};

use bitflags::bitflags;

bitflags! {
    /// x86 PTE/PDE bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
    }
}

impl PteFlags {
    /// Kernel read/write mapping.
    pub const KERNEL_RW: Self = Self::PRESENT.union(Self::WRITABLE);
    /// User-accessible mapping (read-only unless WRITABLE is added).
    pub const USER_RO: Self = Self::PRESENT.union(Self::USER);
    /// User-accessible read/write mapping.
    pub const USER_RW: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::USER);
}
