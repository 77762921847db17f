//! Kernel heap: the global allocator.
//!
//! A `linked_list_allocator::LockedHeap` over a contiguous identity-mapped
//! region handed over at boot. Allocation before `heap_init` aborts with a
//! kernel bug instead of returning garbage.

use core::alloc::{GlobalAlloc, Layout};
use core::sync::atomic::{AtomicBool, Ordering};

use linked_list_allocator::LockedHeap;

struct KernelHeap {
    heap: LockedHeap,
}

#[global_allocator]
static HEAP: KernelHeap = KernelHeap {
    heap: LockedHeap::empty(),
};

static HEAP_READY: AtomicBool = AtomicBool::new(false);

/// Hand the heap its backing region.
///
/// # Safety
/// `base..base+size` must be mapped, writable, unused by anything else, and
/// live for the rest of the kernel's lifetime.
pub unsafe fn heap_init(base: *mut u8, size: usize) {
    HEAP.heap.lock().init(base, size);
    HEAP_READY.store(true, Ordering::Release);
}

/// `true` once the allocator is usable.
pub fn heap_ready() -> bool {
    HEAP_READY.load(Ordering::Acquire)
}

/// (used, free) heap bytes.
pub fn heap_stats() -> (usize, usize) {
    let heap = HEAP.heap.lock();
    (heap.used(), heap.free())
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if !heap_ready() {
            cinder_lib::kernel_bug!("kernel heap used before heap_init");
        }
        self.heap.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.heap.dealloc(ptr, layout)
    }
}
