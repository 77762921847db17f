//! Physical page frame map.
//!
//! One global bitmap tracks every 4 KiB frame as used or free; a second
//! bitmap marks frames pinned by the kernel (image, page tables handed to
//! the shared region, heap backing). Allocation is first-fit by scan from
//! the lowest free frame.
//!
//! Physical frames are reachable through virtual memory at an
//! identity offset: the shared kernel region identity-maps RAM, so
//! `phys_to_virt` is a plain add. The offset is configurable only so the
//! paging code stays honest about the distinction.

use core::sync::atomic::{AtomicUsize, Ordering};

use cinder_abi::PAGE_SIZE;
use cinder_abi::addr::PhysAddr;
use cinder_lib::{IrqMutex, klog_info};

use crate::error::{MmError, MmResult};

/// Highest physical address the frame map covers (1 GiB: the identity-
/// mapped kernel region; RAM above it is not used by the core).
pub const PHYS_LIMIT: u32 = 0x4000_0000;

/// Number of frames tracked.
pub const MAX_FRAMES: usize = (PHYS_LIMIT / PAGE_SIZE) as usize;

const WORDS: usize = MAX_FRAMES / 32;

/// Zero the frame's bytes after allocation.
pub const ALLOC_ZERO: u32 = 0x1;
/// Pin the frame as kernel-owned.
pub const ALLOC_KERNEL: u32 = 0x2;

/// One physical memory region in the boot handoff.
#[derive(Clone, Copy, Debug)]
pub struct MemRegion {
    pub base: PhysAddr,
    pub length: u32,
    pub usable: bool,
}

struct FrameMap {
    /// Bit set = frame in use.
    used: [u32; WORDS],
    /// Bit set = pinned by the kernel, never handed to an address space.
    pinned: [u32; WORDS],
    total_frames: u32,
    free_frames: u32,
    /// Lowest word that may contain a free bit; keeps the first-fit scan
    /// from rereading permanently-reserved low memory.
    scan_start: usize,
}

impl FrameMap {
    const fn new() -> Self {
        Self {
            // Everything starts reserved; init frees the usable regions.
            used: [u32::MAX; WORDS],
            pinned: [0; WORDS],
            total_frames: 0,
            free_frames: 0,
            scan_start: 0,
        }
    }

    #[inline]
    fn index(frame: u32) -> (usize, u32) {
        ((frame / 32) as usize, 1u32 << (frame % 32))
    }

    fn is_used(&self, frame: u32) -> bool {
        let (w, bit) = Self::index(frame);
        self.used[w] & bit != 0
    }

    fn set_used(&mut self, frame: u32) {
        let (w, bit) = Self::index(frame);
        self.used[w] |= bit;
    }

    fn set_free(&mut self, frame: u32) {
        let (w, bit) = Self::index(frame);
        self.used[w] &= !bit;
        self.pinned[w] &= !bit;
        if w < self.scan_start {
            self.scan_start = w;
        }
    }

    fn set_pinned(&mut self, frame: u32, pinned: bool) {
        let (w, bit) = Self::index(frame);
        if pinned {
            self.pinned[w] |= bit;
        } else {
            self.pinned[w] &= !bit;
        }
    }

    fn is_pinned(&self, frame: u32) -> bool {
        let (w, bit) = Self::index(frame);
        self.pinned[w] & bit != 0
    }

    /// First-fit scan for a free frame.
    fn find_free(&mut self) -> Option<u32> {
        for w in self.scan_start..WORDS {
            let word = self.used[w];
            if word != u32::MAX {
                let bit = word.trailing_ones();
                self.scan_start = w;
                return Some(w as u32 * 32 + bit);
            }
        }
        None
    }
}

static FRAME_MAP: IrqMutex<FrameMap> = IrqMutex::new(FrameMap::new());

/// Offset added to a physical address to reach it through virtual memory.
/// Zero on the kernel target (identity map in the shared region).
static PHYS_VIRT_OFFSET: AtomicUsize = AtomicUsize::new(0);

/// Configure the phys-to-virt offset. Boot calls this once with 0; the
/// harness may point it at a test arena.
pub fn set_phys_virt_offset(offset: usize) {
    PHYS_VIRT_OFFSET.store(offset, Ordering::Release);
}

/// Virtual pointer through which a physical frame's memory is accessed.
#[inline]
pub fn phys_to_ptr(phys: PhysAddr) -> *mut u8 {
    (PHYS_VIRT_OFFSET.load(Ordering::Acquire) + phys.as_u32() as usize) as *mut u8
}

/// Initialize the frame map from the boot memory regions. Frame 0 stays
/// reserved so a zero `PhysAddr` can act as a null sentinel.
pub fn phys_init(regions: &[MemRegion]) {
    let mut map = FRAME_MAP.lock();
    let mut total = 0u32;
    for region in regions {
        if !region.usable {
            continue;
        }
        let first = region.base.page_number();
        let count = region.length / PAGE_SIZE;
        for frame in first..first.saturating_add(count) {
            if frame == 0 || frame as usize >= MAX_FRAMES {
                continue;
            }
            if map.is_used(frame) {
                map.set_free(frame);
                total += 1;
            }
        }
    }
    map.total_frames = total;
    map.free_frames = total;
    map.scan_start = 0;
    drop(map);
    klog_info!(
        "mm: frame map ready, {} frames ({} KiB) usable",
        total,
        total * (PAGE_SIZE / 1024)
    );
}

/// Reserve a physical range (kernel image, boot structures, device holes).
pub fn phys_reserve(base: PhysAddr, length: u32) {
    let mut map = FRAME_MAP.lock();
    let first = base.page_number();
    let count = length.div_ceil(PAGE_SIZE);
    for frame in first..first + count {
        if (frame as usize) < MAX_FRAMES && !map.is_used(frame) {
            map.set_used(frame);
            map.set_pinned(frame, true);
            map.free_frames = map.free_frames.saturating_sub(1);
        }
    }
}

/// Allocate one frame, first-fit.
pub fn alloc_frame(flags: u32) -> MmResult<PhysAddr> {
    let phys = {
        let mut map = FRAME_MAP.lock();
        let frame = map.find_free().ok_or(MmError::NoMemory)?;
        map.set_used(frame);
        if flags & ALLOC_KERNEL != 0 {
            map.set_pinned(frame, true);
        }
        map.free_frames -= 1;
        PhysAddr::from_page_number(frame)
    };

    if flags & ALLOC_ZERO != 0 {
        // SAFETY: the frame was just taken out of the free set; nobody else
        // references it, and it is reachable through the identity region.
        unsafe {
            core::ptr::write_bytes(phys_to_ptr(phys), 0, PAGE_SIZE as usize);
        }
    }
    Ok(phys)
}

/// Allocate `count` physically contiguous frames (needed for the heap
/// backing and DMA-style callers). First-fit over runs.
pub fn alloc_frames_contiguous(count: u32, flags: u32) -> MmResult<PhysAddr> {
    if count == 0 {
        return Err(MmError::NoMemory);
    }
    let base = {
        let mut map = FRAME_MAP.lock();
        let mut run_start = 0u32;
        let mut run_len = 0u32;
        let mut found = None;
        for frame in 1..MAX_FRAMES as u32 {
            if map.is_used(frame) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = frame;
                }
                run_len += 1;
                if run_len == count {
                    found = Some(run_start);
                    break;
                }
            }
        }
        let start = found.ok_or(MmError::NoMemory)?;
        for frame in start..start + count {
            map.set_used(frame);
            if flags & ALLOC_KERNEL != 0 {
                map.set_pinned(frame, true);
            }
        }
        map.free_frames -= count;
        PhysAddr::from_page_number(start)
    };

    if flags & ALLOC_ZERO != 0 {
        // SAFETY: freshly allocated run, exclusively owned.
        unsafe {
            core::ptr::write_bytes(phys_to_ptr(base), 0, (count * PAGE_SIZE) as usize);
        }
    }
    Ok(base)
}

/// Return a frame to the free pool. Freeing a pinned or already-free frame
/// is a kernel bug.
pub fn free_frame(phys: PhysAddr) {
    let frame = phys.page_number();
    if frame == 0 || frame as usize >= MAX_FRAMES {
        cinder_lib::kernel_bug!("free_frame: frame {:#x} out of range", phys.as_u32());
    }
    let mut map = FRAME_MAP.lock();
    if !map.is_used(frame) {
        drop(map);
        cinder_lib::kernel_bug!("free_frame: double free of {:#x}", phys.as_u32());
    }
    map.set_free(frame);
    map.free_frames += 1;
}

/// `true` if the frame is currently allocated.
pub fn frame_is_used(phys: PhysAddr) -> bool {
    FRAME_MAP.lock().is_used(phys.page_number())
}

/// `true` if the frame is pinned kernel memory.
pub fn frame_is_pinned(phys: PhysAddr) -> bool {
    FRAME_MAP.lock().is_pinned(phys.page_number())
}

/// (total, free) frame counts.
pub fn frame_stats() -> (u32, u32) {
    let map = FRAME_MAP.lock();
    (map.total_frames, map.free_frames)
}
