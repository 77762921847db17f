//! Boot-time memory bring-up.
//!
//! Order matters here and is fixed by the hardware: the frame map first
//! (everything else allocates from it), then the kernel page directory is
//! built and CR3 loaded only after the self-map entry is installed, then
//! paging is switched on, and finally the heap gets its backing so `alloc`
//! starts working.

use cinder_abi::PAGE_SIZE;
use cinder_abi::addr::{PhysAddr, VirtAddr};
use cinder_abi::task::STACK_PAGES_TASK;
use cinder_lib::{cpu, klog_info};

use crate::addr_space::AddrSpace;
use crate::error::MmResult;
use crate::kernel_heap;
use crate::layout::{
    KERNEL_SHARED_PTD_SLOTS, KERNEL_STACK_TOP, MEMIO_END_SLOT, MEMIO_FIRST_SLOT, SELF_MAP_SLOT,
};
use crate::paging::tables::{self, MapAttrs, Pte};
use crate::paging::{self, PteFlags};
use crate::phys::{self, ALLOC_ZERO, MemRegion, PHYS_LIMIT};

/// Pages of physically contiguous heap backing (4 MiB).
const HEAP_PAGES: u32 = 1024;

/// Boot handoff from the loader: the physical memory map and the end of the
/// kernel image (text through BSS).
pub struct BootInfo<'a> {
    pub regions: &'a [MemRegion],
    pub kernel_image_end: PhysAddr,
}

/// Bring up physical memory, paging, and the heap. Returns the kernel
/// address space.
pub fn memory_init(boot: &BootInfo<'_>) -> MmResult<alloc::sync::Arc<AddrSpace>> {
    phys::set_phys_virt_offset(0);
    phys::phys_init(boot.regions);
    // The image and the zero page stay out of the allocator.
    phys::phys_reserve(PhysAddr::NULL, boot.kernel_image_end.as_u32());

    let ptd = build_kernel_ptd(boot)?;

    // CR3 is loaded only now, after the self-map entry exists; enabling
    // paging before that would leave no way to reach the page tables.
    // SAFETY: the directory identity-maps all RAM including the executing
    // kernel image and the bootstrap stack.
    unsafe {
        cpu::write_cr3(ptd.as_u32());
        cpu::enable_paging();
    }
    tables::set_paging_enabled(ptd);

    heap_bootstrap()?;

    let space = AddrSpace::adopt_kernel(ptd);
    let (total, free) = phys::frame_stats();
    klog_info!("mm: paging on, {}/{} frames free, heap ready", free, total);
    Ok(space)
}

/// Build the kernel page directory:
/// identity-map usable RAM read/write supervisor in the shared slots,
/// pre-create every shared and mem-I/O page table so later address spaces
/// can alias them by reference, install the self-map, and map the
/// bootstrap task's kernel stack.
fn build_kernel_ptd(boot: &BootInfo<'_>) -> MmResult<PhysAddr> {
    let ptd = tables::new_page_table()?;

    // Pre-create the page tables for the shared kernel region and the
    // mem-I/O window. Their PDEs never change afterwards, which is what
    // makes copying them by reference into every later directory sound.
    for slot in 0..KERNEL_SHARED_PTD_SLOTS {
        let pt = tables::new_page_table()?;
        tables::set_ptd_entry(ptd, slot, Pte::new(pt, PteFlags::KERNEL_RW));
    }
    for slot in MEMIO_FIRST_SLOT..MEMIO_END_SLOT {
        let pt = tables::new_page_table()?;
        tables::set_ptd_entry(ptd, slot, Pte::new(pt, PteFlags::KERNEL_RW));
    }

    // Identity map RAM. The kernel image itself sits inside this range, so
    // this also covers "the first N pages up to the end of kernel BSS".
    let mut highest = boot.kernel_image_end.as_u32();
    for region in boot.regions {
        if region.usable {
            highest = highest.max(region.base.as_u32().saturating_add(region.length));
        }
    }
    let highest = highest.min(PHYS_LIMIT);
    let mut addr = PAGE_SIZE; // leave page 0 unmapped to catch null derefs
    while addr < highest {
        identity_map(ptd, addr)?;
        addr += PAGE_SIZE;
    }

    // Self-map: the last PTD slot points at the directory itself.
    tables::set_ptd_entry(ptd, SELF_MAP_SLOT, Pte::new(ptd, PteFlags::KERNEL_RW));

    // Bootstrap kernel stack: STACK_PAGES_TASK pages directly below the
    // kernel stack top (arena slot 0).
    for page in 1..=STACK_PAGES_TASK {
        let frame = phys::alloc_frame(ALLOC_ZERO)?;
        let virt = VirtAddr::new(KERNEL_STACK_TOP - page * PAGE_SIZE);
        paging::map_page(ptd, virt, frame, MapAttrs::KERNEL)?;
    }

    Ok(ptd)
}

/// Install `addr -> addr` into the pre-created shared tables without going
/// through `map_page` (the PDE already exists; this is the bootstrap fast
/// path over millions of pages).
fn identity_map(ptd: PhysAddr, addr: u32) -> MmResult {
    let virt = VirtAddr::new(addr);
    let pde = tables::ptd_entry(ptd, virt.ptd_index());
    let pt = pde.frame();
    // SAFETY: pre-created table, paging still off, identity access.
    unsafe {
        let entry = (phys::phys_to_ptr(pt) as *mut Pte).add(virt.pt_index());
        *entry = Pte::new(PhysAddr::new(addr), PteFlags::KERNEL_RW);
    }
    Ok(())
}

/// Hand the heap a contiguous identity-mapped region.
fn heap_bootstrap() -> MmResult {
    let base = phys::alloc_frames_contiguous(HEAP_PAGES, ALLOC_ZERO | phys::ALLOC_KERNEL)?;
    // SAFETY: the run is identity-mapped, exclusively ours, and stays
    // alive for the kernel's lifetime.
    unsafe {
        kernel_heap::heap_init(phys::phys_to_ptr(base), (HEAP_PAGES * PAGE_SIZE) as usize);
    }
    Ok(())
}
