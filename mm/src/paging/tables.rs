//! Page table construction and walks.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use cinder_abi::PAGE_SIZE;
use cinder_abi::addr::{PhysAddr, VirtAddr};
use cinder_lib::cpu;

use super::PteFlags;
use crate::error::{MmError, MmResult};
use crate::layout::{PT_ENTRIES, PTD_ENTRIES, SELF_MAP_BASE, SELF_MAP_PTD, SELF_MAP_SLOT};
use crate::phys::{self, ALLOC_KERNEL, ALLOC_ZERO};

/// One page-table or page-directory entry.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(pub u32);

impl Pte {
    pub const EMPTY: Self = Self(0);

    #[inline]
    pub const fn new(frame: PhysAddr, flags: PteFlags) -> Self {
        Self((frame.as_u32() & !(PAGE_SIZE - 1)) | flags.bits())
    }

    #[inline]
    pub const fn is_present(self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    #[inline]
    pub const fn frame(self) -> PhysAddr {
        PhysAddr::new(self.0 & !(PAGE_SIZE - 1))
    }

    #[inline]
    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & (PAGE_SIZE - 1))
    }
}

/// Attributes for a single mapping, mirroring the `rw`/`user`/`pcd`
/// arguments of the mapping primitive.
#[derive(Clone, Copy, Debug)]
pub struct MapAttrs {
    pub writable: bool,
    pub user: bool,
    pub no_cache: bool,
}

impl MapAttrs {
    pub const KERNEL: Self = Self {
        writable: true,
        user: false,
        no_cache: false,
    };
    pub const KERNEL_DEVICE: Self = Self {
        writable: true,
        user: false,
        no_cache: true,
    };

    pub const fn user_rw() -> Self {
        Self {
            writable: true,
            user: true,
            no_cache: false,
        }
    }

    pub const fn user_ro() -> Self {
        Self {
            writable: false,
            user: true,
            no_cache: false,
        }
    }

    fn pte_flags(self) -> PteFlags {
        let mut flags = PteFlags::PRESENT;
        if self.writable {
            flags |= PteFlags::WRITABLE;
        }
        if self.user {
            flags |= PteFlags::USER;
        }
        if self.no_cache {
            flags |= PteFlags::NO_CACHE;
        }
        flags
    }
}

static PAGING_ENABLED: AtomicBool = AtomicBool::new(false);
static CURRENT_PTD: AtomicU32 = AtomicU32::new(0);

/// Record that CR0.PG has been set; from here on, walks of the active
/// directory go through the self-map.
pub fn set_paging_enabled(ptd: PhysAddr) {
    CURRENT_PTD.store(ptd.as_u32(), Ordering::Release);
    PAGING_ENABLED.store(true, Ordering::Release);
}

#[inline]
pub fn paging_enabled() -> bool {
    PAGING_ENABLED.load(Ordering::Acquire)
}

/// Physical base of the directory currently in CR3 (as last loaded through
/// this module).
#[inline]
pub fn current_ptd() -> PhysAddr {
    PhysAddr::new(CURRENT_PTD.load(Ordering::Acquire))
}

/// Reload CR3 if `ptd` differs from the live directory.
pub fn switch_address_space(ptd: PhysAddr) {
    if current_ptd() == ptd {
        return;
    }
    CURRENT_PTD.store(ptd.as_u32(), Ordering::Release);
    // SAFETY: every directory built by this module keeps the shared kernel
    // mappings, so the executing code and stack stay mapped across the
    // switch.
    unsafe { cpu::write_cr3(ptd.as_u32()) };
}

/// `true` if walks of `ptd` may use the self-map window.
#[inline]
fn walk_via_self_map(ptd: PhysAddr) -> bool {
    paging_enabled() && current_ptd() == ptd
}

/// Pointer to a PTD entry.
#[inline]
fn ptd_entry_ptr(ptd: PhysAddr, ptd_index: usize) -> *mut Pte {
    if walk_via_self_map(ptd) {
        (SELF_MAP_PTD as usize + ptd_index * 4) as *mut Pte
    } else {
        unsafe { (phys::phys_to_ptr(ptd) as *mut Pte).add(ptd_index) }
    }
}

/// Pointer to a PT entry, given the PT's physical base.
#[inline]
fn pt_entry_ptr(ptd: PhysAddr, pt: PhysAddr, ptd_index: usize, pt_index: usize) -> *mut Pte {
    if walk_via_self_map(ptd) {
        (SELF_MAP_BASE as usize + ptd_index * PAGE_SIZE as usize + pt_index * 4) as *mut Pte
    } else {
        unsafe { (phys::phys_to_ptr(pt) as *mut Pte).add(pt_index) }
    }
}

/// Read a PTD entry.
pub fn ptd_entry(ptd: PhysAddr, ptd_index: usize) -> Pte {
    debug_assert!(ptd_index < PTD_ENTRIES);
    // SAFETY: the entry pointer is within the directory page.
    unsafe { *ptd_entry_ptr(ptd, ptd_index) }
}

/// Write a PTD entry.
pub(crate) fn set_ptd_entry(ptd: PhysAddr, ptd_index: usize, entry: Pte) {
    debug_assert!(ptd_index < PTD_ENTRIES);
    // SAFETY: the entry pointer is within the directory page.
    unsafe { *ptd_entry_ptr(ptd, ptd_index) = entry };
}

/// Allocate a zeroed page-table (or directory) frame, pinned to the kernel.
pub fn new_page_table() -> MmResult<PhysAddr> {
    phys::alloc_frame(ALLOC_ZERO | ALLOC_KERNEL)
}

/// Install a single 4 KiB mapping `virt -> phys` in `ptd`, allocating the
/// intermediate page table if absent.
///
/// The PDE of a slot is given USER and WRITABLE permission whenever any
/// mapping below it needs them; the leaf PTE carries the exact attributes.
pub fn map_page(ptd: PhysAddr, virt: VirtAddr, phys_target: PhysAddr, attrs: MapAttrs) -> MmResult {
    if !virt.is_page_aligned() {
        return Err(MmError::NotAligned { address: virt.as_u32() });
    }
    let ptd_index = virt.ptd_index();
    if ptd_index == SELF_MAP_SLOT {
        return Err(MmError::InvalidAddress { address: virt.as_u32() });
    }

    let pde = ptd_entry(ptd, ptd_index);
    let pt = if pde.is_present() {
        // Widen the PDE permissions if this mapping needs more than the
        // slot currently allows.
        let mut pde_flags = pde.flags();
        let want = attrs.pte_flags() & (PteFlags::WRITABLE | PteFlags::USER);
        if !pde_flags.contains(want) {
            pde_flags |= want;
            set_ptd_entry(ptd, ptd_index, Pte::new(pde.frame(), pde_flags));
        }
        pde.frame()
    } else {
        let pt = new_page_table()?;
        let mut pde_flags = PteFlags::PRESENT | PteFlags::WRITABLE;
        if attrs.user {
            pde_flags |= PteFlags::USER;
        }
        set_ptd_entry(ptd, ptd_index, Pte::new(pt, pde_flags));
        pt
    };

    let entry_ptr = pt_entry_ptr(ptd, pt, ptd_index, virt.pt_index());
    // SAFETY: entry pointer is within the page table just resolved.
    unsafe {
        if (*entry_ptr).is_present() {
            return Err(MmError::AlreadyMapped { address: virt.as_u32() });
        }
        *entry_ptr = Pte::new(phys_target, attrs.pte_flags());
    }

    if walk_via_self_map(ptd) {
        cpu::invlpg(virt.as_u32());
    }
    Ok(())
}

/// Clear the leaf entry for `virt` and return the frame to the allocator.
pub fn unmap_page(ptd: PhysAddr, virt: VirtAddr) -> MmResult {
    let frame = unmap_page_keep_frame(ptd, virt)?;
    phys::free_frame(frame);
    Ok(())
}

/// Clear the leaf entry for `virt` and hand the previously mapped frame
/// back to the caller (used for device windows, where the frame is not
/// allocator-owned).
pub fn unmap_page_keep_frame(ptd: PhysAddr, virt: VirtAddr) -> MmResult<PhysAddr> {
    let ptd_index = virt.ptd_index();
    let pde = ptd_entry(ptd, ptd_index);
    if !pde.is_present() {
        return Err(MmError::NotMapped { address: virt.as_u32() });
    }
    let entry_ptr = pt_entry_ptr(ptd, pde.frame(), ptd_index, virt.pt_index());
    // SAFETY: entry pointer is within the present page table.
    let frame = unsafe {
        let entry = *entry_ptr;
        if !entry.is_present() {
            return Err(MmError::NotMapped { address: virt.as_u32() });
        }
        *entry_ptr = Pte::EMPTY;
        entry.frame()
    };
    if walk_via_self_map(ptd) {
        cpu::invlpg(virt.as_u32());
    }
    Ok(frame)
}

/// Resolve `virt` in `ptd` down to its frame and leaf flags.
pub fn translate(ptd: PhysAddr, virt: VirtAddr) -> Option<(PhysAddr, PteFlags)> {
    let pde = ptd_entry(ptd, virt.ptd_index());
    if !pde.is_present() {
        return None;
    }
    let entry_ptr = pt_entry_ptr(ptd, pde.frame(), virt.ptd_index(), virt.pt_index());
    // SAFETY: entry pointer is within the present page table.
    let entry = unsafe { *entry_ptr };
    if !entry.is_present() {
        return None;
    }
    Some((entry.frame() + virt.page_offset(), entry.flags()))
}

/// Drop the page tables of PTD slots `first..end`, freeing every PT frame
/// (the mapped data frames must already be gone). Used when an address
/// space is destroyed.
pub fn release_ptd_range(ptd: PhysAddr, first: usize, end: usize) {
    for slot in first..end.min(PTD_ENTRIES) {
        let pde = ptd_entry(ptd, slot);
        if pde.is_present() {
            phys::free_frame(pde.frame());
            set_ptd_entry(ptd, slot, Pte::EMPTY);
        }
    }
}

/// Iterate present leaf entries of PTD slots `first..end`, calling
/// `f(virt, pte)` for each.
pub(crate) fn for_each_present_page(
    ptd: PhysAddr,
    first: usize,
    end: usize,
    mut f: impl FnMut(VirtAddr, Pte),
) {
    for slot in first..end.min(PTD_ENTRIES) {
        let pde = ptd_entry(ptd, slot);
        if !pde.is_present() {
            continue;
        }
        for idx in 0..PT_ENTRIES {
            let entry_ptr = pt_entry_ptr(ptd, pde.frame(), slot, idx);
            // SAFETY: entry pointer within the present page table.
            let entry = unsafe { *entry_ptr };
            if entry.is_present() {
                let virt =
                    VirtAddr::new((slot as u32) << 22 | (idx as u32) << 12);
                f(virt, entry);
            }
        }
    }
}
