//! Memory-mapped I/O window.
//!
//! Device physical ranges are mapped into `MEMIO_BASE..MEMIO_END` with
//! caching disabled. The window's page tables are pre-created at boot and
//! shared into every address space, so a returned pointer stays valid no
//! matter which process is running.
//!
//! Allocation is a bump pointer: pages requested in one call are virtually
//! contiguous, and independent calls never alias.

use cinder_abi::PAGE_SIZE;
use cinder_abi::addr::{PhysAddr, VirtAddr};
use cinder_lib::{IrqMutex, klog_debug};

use crate::addr_space::AddrSpace;
use crate::error::{MmError, MmResult};
use crate::layout::{MEMIO_BASE, MEMIO_END};
use crate::paging::{self, tables::MapAttrs};

struct MemioArena {
    next: u32,
}

static MEMIO: IrqMutex<MemioArena> = IrqMutex::new(MemioArena { next: MEMIO_BASE });

/// Map `length` bytes of device memory starting at `phys` into the mem-I/O
/// window, returning the virtual address corresponding to `phys`.
pub fn map_memio(phys: PhysAddr, length: u32) -> MmResult<VirtAddr> {
    if length == 0 {
        return Err(MmError::InvalidAddress { address: phys.as_u32() });
    }
    let offset = phys.as_u32() & (PAGE_SIZE - 1);
    let first_page = phys.page_base();
    let pages = (offset + length).div_ceil(PAGE_SIZE);

    let base = {
        let mut arena = MEMIO.lock();
        let base = arena.next;
        let span = pages * PAGE_SIZE;
        if base + span > MEMIO_END {
            return Err(MmError::NoMemory);
        }
        arena.next = base + span;
        base
    };

    let ptd = AddrSpace::kernel().ptd();
    for page in 0..pages {
        paging::map_page(
            ptd,
            VirtAddr::new(base + page * PAGE_SIZE),
            first_page + page * PAGE_SIZE,
            MapAttrs::KERNEL_DEVICE,
        )?;
    }
    klog_debug!(
        "mm: memio {:#010x}+{:#x} -> {:#010x}",
        phys.as_u32(),
        length,
        base + offset
    );
    Ok(VirtAddr::new(base + offset))
}
