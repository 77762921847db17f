//! Per-process address spaces.
//!
//! An address space owns a page directory, a kernel-stack arena, and the
//! user-area mappings. The shared kernel region and the mem-I/O window are
//! copied into every directory by reference at creation; everything above
//! them is private to the space.
//!
//! Clone (the VM half of fork) deep-copies the user area page by page,
//! copies only the calling task's kernel stack, and drops the other tasks'
//! stacks: they do not survive fork.

extern crate alloc;

use alloc::sync::Arc;

use cinder_abi::PAGE_SIZE;
use cinder_abi::addr::{PhysAddr, VirtAddr};
use cinder_abi::task::STACK_PAGES_TASK;
use cinder_lib::{IrqMutex, klog_debug};
use spin::Once;

use crate::error::{MmError, MmResult};
use crate::layout::{
    KERNEL_SHARED_PTD_SLOTS, MAX_STACK_SLOTS, MEMIO_END_SLOT, MEMIO_FIRST_SLOT, SELF_MAP_SLOT,
    STACK_ARENA_END_SLOT, STACK_ARENA_FIRST_SLOT, USER_AREA_BASE, USER_FIRST_SLOT,
    USER_STACK_INITIAL_PAGES, USER_STACK_TOP, is_user_addr, stack_slot_base, stack_slot_top,
};
use crate::paging::tables::{self, MapAttrs, Pte};
use crate::paging::{self, PteFlags};
use crate::phys::{self, ALLOC_ZERO};

/// PTD slot one past the user area (the slot containing `USER_STACK_TOP`).
const USER_END_SLOT: usize = (USER_STACK_TOP >> 22) as usize;

/// Tracker of kernel-stack slots within one address space.
///
/// Slot `i` maps `STACK_PAGES_TASK` pages ending at `stack_slot_top(i)`,
/// with one unmapped guard page between neighboring slots.
struct StackArena {
    used: u64,
}

impl StackArena {
    const fn new() -> Self {
        Self { used: 0 }
    }

    fn alloc(&mut self) -> Option<usize> {
        for slot in 0..MAX_STACK_SLOTS {
            if self.used & (1 << slot) == 0 {
                self.used |= 1 << slot;
                return Some(slot);
            }
        }
        None
    }

    fn free(&mut self, slot: usize) {
        self.used &= !(1 << slot);
    }

    fn is_used(&self, slot: usize) -> bool {
        self.used & (1 << slot) != 0
    }
}

/// A mapped kernel stack.
#[derive(Clone, Copy, Debug)]
pub struct KernelStack {
    pub slot: usize,
    /// Exclusive upper bound of the stack (initial ESP).
    pub top: VirtAddr,
    /// Lowest mapped address.
    pub base: VirtAddr,
}

struct SpaceInner {
    stacks: StackArena,
    /// Current program break (top of the user heap).
    brk: u32,
}

/// One address space. Shared between the tasks of a process via `Arc`.
pub struct AddrSpace {
    ptd: PhysAddr,
    inner: IrqMutex<SpaceInner>,
}

static KERNEL_SPACE: Once<Arc<AddrSpace>> = Once::new();

impl AddrSpace {
    /// Physical base of this space's page directory.
    #[inline]
    pub fn ptd(&self) -> PhysAddr {
        self.ptd
    }

    /// Wrap the boot-built kernel directory as the kernel address space.
    /// Slot 0 of its stack arena is the bootstrap stack mapped by
    /// `memory_init`.
    pub(crate) fn adopt_kernel(ptd: PhysAddr) -> Arc<Self> {
        let space = Arc::new(Self {
            ptd,
            inner: IrqMutex::new(SpaceInner {
                stacks: StackArena::new(),
                brk: 0,
            }),
        });
        space.inner.lock().stacks.used |= 1; // bootstrap stack in slot 0
        KERNEL_SPACE.call_once(|| space.clone());
        space
    }

    /// The kernel address space. Calling this before `memory_init` is a
    /// boot-ordering bug.
    pub fn kernel() -> Arc<Self> {
        match KERNEL_SPACE.get() {
            Some(space) => space.clone(),
            None => cinder_lib::kernel_bug!("kernel address space used before memory_init"),
        }
    }

    /// Create a fresh user address space: shared kernel slots and the
    /// mem-I/O window by reference, self-map installed, user area empty.
    pub fn new_user() -> MmResult<Arc<Self>> {
        let kernel_ptd = Self::kernel().ptd;
        let ptd = tables::new_page_table()?;
        copy_shared_slots(kernel_ptd, ptd);
        tables::set_ptd_entry(ptd, SELF_MAP_SLOT, Pte::new(ptd, PteFlags::KERNEL_RW));
        Ok(Arc::new(Self {
            ptd,
            inner: IrqMutex::new(SpaceInner {
                stacks: StackArena::new(),
                brk: USER_AREA_BASE,
            }),
        }))
    }

    // -------------------------------------------------------------------
    // Kernel stacks
    // -------------------------------------------------------------------

    /// Reserve a stack slot and map fresh zeroed frames into it.
    pub fn alloc_kernel_stack(&self) -> MmResult<KernelStack> {
        let slot = {
            let mut inner = self.inner.lock();
            inner.stacks.alloc().ok_or(MmError::NoStack)?
        };
        let base = stack_slot_base(slot);
        for page in 0..STACK_PAGES_TASK {
            let frame = match phys::alloc_frame(ALLOC_ZERO) {
                Ok(f) => f,
                Err(e) => {
                    // Roll back the partial mapping and the slot.
                    for undo in 0..page {
                        let va = base + undo * PAGE_SIZE;
                        let _ = paging::unmap_page(self.ptd, va);
                    }
                    self.inner.lock().stacks.free(slot);
                    return Err(e);
                }
            };
            paging::map_page(self.ptd, base + page * PAGE_SIZE, frame, MapAttrs::KERNEL)?;
        }
        Ok(KernelStack {
            slot,
            top: stack_slot_top(slot),
            base,
        })
    }

    /// Unmap and free a kernel stack, releasing its slot.
    pub fn free_kernel_stack(&self, slot: usize) {
        let base = stack_slot_base(slot);
        for page in 0..STACK_PAGES_TASK {
            let _ = paging::unmap_page(self.ptd, base + page * PAGE_SIZE);
        }
        self.inner.lock().stacks.free(slot);
    }

    // -------------------------------------------------------------------
    // User area
    // -------------------------------------------------------------------

    /// Map one loaded segment into the user area and copy its file-backed
    /// prefix in; the tail up to `memsz` reads as zeros. This is the
    /// contract the ELF loader builds on.
    pub fn map_user_segment(
        &self,
        vaddr: VirtAddr,
        file_data: &[u8],
        memsz: u32,
        writable: bool,
    ) -> MmResult {
        if memsz == 0 || (file_data.len() as u32) > memsz {
            return Err(MmError::InvalidAddress { address: vaddr.as_u32() });
        }
        let start = vaddr.page_base();
        let end = VirtAddr::new(vaddr.as_u32() + memsz).page_align_up();
        if !is_user_addr(start.as_u32()) || !is_user_addr(end.as_u32() - 1) {
            return Err(MmError::InvalidAddress { address: vaddr.as_u32() });
        }

        let attrs = if writable {
            MapAttrs::user_rw()
        } else {
            MapAttrs::user_ro()
        };
        let mut page = start;
        while page < end {
            // Tolerate overlap with an earlier segment sharing a page.
            if paging::translate(self.ptd, page).is_none() {
                let frame = phys::alloc_frame(ALLOC_ZERO)?;
                paging::map_page(self.ptd, page, frame, attrs)?;
            }
            page = page + PAGE_SIZE;
        }

        // Copy the file-backed bytes through the physical window so this
        // works no matter which directory is live.
        let mut copied = 0usize;
        while copied < file_data.len() {
            let va = VirtAddr::new(vaddr.as_u32() + copied as u32);
            let (pa, _) = paging::translate(self.ptd, va)
                .ok_or(MmError::NotMapped { address: va.as_u32() })?;
            let chunk = ((PAGE_SIZE - va.page_offset()) as usize).min(file_data.len() - copied);
            // SAFETY: pa resolves inside a frame just allocated for this
            // segment; the identity region makes it addressable.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    file_data.as_ptr().add(copied),
                    phys::phys_to_ptr(pa),
                    chunk,
                );
            }
            copied += chunk;
        }

        // Track the highest mapped address as the initial program break.
        let mut inner = self.inner.lock();
        if end.as_u32() > inner.brk {
            inner.brk = end.as_u32();
        }
        Ok(())
    }

    /// Establish the user-mode stack below `USER_STACK_TOP`.
    pub fn init_user_area(&self) -> MmResult {
        for page in 1..=USER_STACK_INITIAL_PAGES {
            let va = VirtAddr::new(USER_STACK_TOP - page * PAGE_SIZE);
            let frame = phys::alloc_frame(ALLOC_ZERO)?;
            paging::map_page(self.ptd, va, frame, MapAttrs::user_rw())?;
        }
        Ok(())
    }

    /// Unmap and free every user-accessible frame (exec and exit).
    pub fn teardown_user_area(&self) {
        let mut freed = 0u32;
        tables::for_each_present_page(self.ptd, USER_FIRST_SLOT, USER_END_SLOT, |virt, _| {
            if paging::unmap_page(self.ptd, virt).is_ok() {
                freed += 1;
            }
        });
        self.inner.lock().brk = USER_AREA_BASE;
        klog_debug!("mm: teardown freed {} user pages (ptd {})", freed, self.ptd);
    }

    /// Grow or shrink the program break; returns the previous break.
    pub fn sbrk(&self, increment: i32) -> MmResult<VirtAddr> {
        let mut inner = self.inner.lock();
        let old = inner.brk;
        let new = old.wrapping_add_signed(increment);
        if !is_user_addr(new) && new != USER_AREA_BASE {
            return Err(MmError::InvalidAddress { address: new });
        }
        if increment > 0 {
            let mut page = VirtAddr::new(old).page_align_up();
            let end = VirtAddr::new(new).page_align_up();
            while page < end {
                if paging::translate(self.ptd, page).is_none() {
                    let frame = phys::alloc_frame(ALLOC_ZERO)?;
                    paging::map_page(self.ptd, page, frame, MapAttrs::user_rw())?;
                }
                page = page + PAGE_SIZE;
            }
        } else if increment < 0 {
            let mut page = VirtAddr::new(new).page_align_up();
            let end = VirtAddr::new(old).page_align_up();
            while page < end {
                let _ = paging::unmap_page(self.ptd, page);
                page = page + PAGE_SIZE;
            }
        }
        inner.brk = new;
        Ok(VirtAddr::new(old))
    }

    // -------------------------------------------------------------------
    // Clone and teardown
    // -------------------------------------------------------------------

    /// Clone this space for fork.
    ///
    /// Kernel and mem-I/O slots are copied by reference, the user area page
    /// by page to fresh frames, and of the kernel stacks only the slot of
    /// the calling task; other tasks' stacks are intentionally absent in
    /// the child.
    pub fn clone_for_fork(&self, calling_stack_slot: usize) -> MmResult<Arc<Self>> {
        let ptd = tables::new_page_table()?;
        copy_shared_slots(self.ptd, ptd);
        tables::set_ptd_entry(ptd, SELF_MAP_SLOT, Pte::new(ptd, PteFlags::KERNEL_RW));

        let child = Arc::new(Self {
            ptd,
            inner: IrqMutex::new(SpaceInner {
                stacks: StackArena::new(),
                brk: self.inner.lock().brk,
            }),
        });

        // User area: deep copy.
        let mut err = None;
        tables::for_each_present_page(self.ptd, USER_FIRST_SLOT, USER_END_SLOT, |virt, pte| {
            if err.is_some() {
                return;
            }
            if let Err(e) = copy_page_into(ptd, virt, pte) {
                err = Some(e);
            }
        });

        // Calling task's kernel stack only.
        let base = stack_slot_base(calling_stack_slot);
        let top = stack_slot_top(calling_stack_slot);
        tables::for_each_present_page(
            self.ptd,
            STACK_ARENA_FIRST_SLOT,
            STACK_ARENA_END_SLOT,
            |virt, pte| {
                if err.is_some() || virt < base || virt >= top {
                    return;
                }
                if let Err(e) = copy_page_into(ptd, virt, pte) {
                    err = Some(e);
                }
            },
        );
        child.inner.lock().stacks.used = 1u64 << calling_stack_slot;

        if let Some(e) = err {
            child.destroy();
            return Err(e);
        }
        Ok(child)
    }

    /// Drop all page tables above the shared region (user + stack arena
    /// slots). The mem-I/O tables belong to the kernel template and stay.
    pub fn release_page_tables(&self) {
        tables::release_ptd_range(self.ptd, KERNEL_SHARED_PTD_SLOTS, MEMIO_FIRST_SLOT);
    }

    /// Tear the whole space down: user frames, kernel stacks, page tables,
    /// and the directory itself. The space must no longer be live on any
    /// CPU.
    pub fn destroy(&self) {
        self.teardown_user_area();
        let used = self.inner.lock().stacks.used;
        for slot in 0..MAX_STACK_SLOTS {
            if used & (1 << slot) != 0 {
                self.free_kernel_stack(slot);
            }
        }
        self.release_page_tables();
        phys::free_frame(self.ptd);
    }

    /// `true` if the given stack slot is reserved in this space.
    pub fn stack_slot_used(&self, slot: usize) -> bool {
        self.inner.lock().stacks.is_used(slot)
    }
}

/// Copy the shared kernel slots and the mem-I/O window from `src` into
/// `dst` by reference (both directories then point at the same PTs).
fn copy_shared_slots(src: PhysAddr, dst: PhysAddr) {
    for slot in 0..KERNEL_SHARED_PTD_SLOTS {
        tables::set_ptd_entry(dst, slot, tables::ptd_entry(src, slot));
    }
    for slot in MEMIO_FIRST_SLOT..MEMIO_END_SLOT {
        tables::set_ptd_entry(dst, slot, tables::ptd_entry(src, slot));
    }
}

/// Allocate a fresh frame in `dst_ptd` at `virt`, copying the contents and
/// attributes of `src_pte`.
fn copy_page_into(dst_ptd: PhysAddr, virt: VirtAddr, src_pte: Pte) -> MmResult {
    let frame = phys::alloc_frame(0)?;
    // SAFETY: both frames are RAM reachable through the identity region;
    // the destination was just allocated and is exclusively ours.
    unsafe {
        core::ptr::copy_nonoverlapping(
            phys::phys_to_ptr(src_pte.frame()),
            phys::phys_to_ptr(frame),
            PAGE_SIZE as usize,
        );
    }
    let flags = src_pte.flags();
    let attrs = MapAttrs {
        writable: flags.contains(PteFlags::WRITABLE),
        user: flags.contains(PteFlags::USER),
        no_cache: flags.contains(PteFlags::NO_CACHE),
    };
    paging::map_page(dst_ptd, virt, frame, attrs)
}
