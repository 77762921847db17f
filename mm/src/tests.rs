//! Frame allocator and page table tests. These run inside the booted
//! kernel: real frames, paging on, operations against scratch directories
//! that are never loaded into CR3.

use cinder_abi::PAGE_SIZE;
use cinder_abi::addr::{PhysAddr, VirtAddr};
use cinder_lib::testing::TestResult;
use cinder_lib::{assert_eq_test, assert_err, assert_ok, assert_test, pass};

use crate::error::MmError;
use crate::layout::{SELF_MAP_PTD, SELF_MAP_SLOT};
use crate::paging::tables::{self, MapAttrs, Pte};
use crate::paging::{self, PteFlags};
use crate::phys::{self, ALLOC_ZERO};

// =============================================================================
// Frame allocator
// =============================================================================

pub fn test_frame_alloc_free_cycle() -> TestResult {
    let (_, free_before) = phys::frame_stats();

    let frame = assert_ok!(phys::alloc_frame(0), "allocate a frame");
    assert_test!(!frame.is_null(), "allocated frame is non-null");
    assert_test!(phys::frame_is_used(frame), "frame marked used");

    let (_, free_mid) = phys::frame_stats();
    assert_eq_test!(free_mid, free_before - 1, "free count dropped by one");

    phys::free_frame(frame);
    assert_test!(!phys::frame_is_used(frame), "frame free again");
    let (_, free_after) = phys::frame_stats();
    assert_eq_test!(free_after, free_before, "free count restored");

    pass!()
}

pub fn test_frame_alloc_zeroed() -> TestResult {
    let frame = assert_ok!(phys::alloc_frame(ALLOC_ZERO));
    let ptr = phys::phys_to_ptr(frame);
    for i in (0..PAGE_SIZE as usize).step_by(251) {
        // SAFETY: freshly allocated identity-mapped frame.
        let byte = unsafe { *ptr.add(i) };
        if byte != 0 {
            phys::free_frame(frame);
            return cinder_lib::fail!("zeroed frame has non-zero byte at {}", i);
        }
    }
    phys::free_frame(frame);
    pass!()
}

pub fn test_frame_first_fit_reuses_lowest() -> TestResult {
    let a = assert_ok!(phys::alloc_frame(0));
    let b = assert_ok!(phys::alloc_frame(0));
    // Free the lower one; first-fit must hand it back before anything
    // higher.
    let (low, high) = if a < b { (a, b) } else { (b, a) };
    phys::free_frame(low);
    let c = assert_ok!(phys::alloc_frame(0));
    assert_eq_test!(c, low, "first-fit returns the lowest free frame");
    phys::free_frame(c);
    phys::free_frame(high);
    pass!()
}

pub fn test_frame_contiguous_run() -> TestResult {
    let base = assert_ok!(phys::alloc_frames_contiguous(4, 0));
    for i in 0..4u32 {
        assert_test!(
            phys::frame_is_used(base + i * PAGE_SIZE),
            "run frame {} used",
            i
        );
    }
    for i in 0..4u32 {
        phys::free_frame(base + i * PAGE_SIZE);
    }
    pass!()
}

// =============================================================================
// Page tables
// =============================================================================

/// Build a scratch directory with a self-map entry; never loaded.
fn scratch_ptd() -> Option<PhysAddr> {
    let ptd = tables::new_page_table().ok()?;
    tables::set_ptd_entry(ptd, SELF_MAP_SLOT, Pte::new(ptd, PteFlags::KERNEL_RW));
    Some(ptd)
}

fn scratch_drop(ptd: PhysAddr) {
    tables::release_ptd_range(ptd, 0, SELF_MAP_SLOT);
    phys::free_frame(ptd);
}

pub fn test_map_translate_unmap() -> TestResult {
    let Some(ptd) = scratch_ptd() else {
        return cinder_lib::fail!("no scratch ptd");
    };
    let frame = assert_ok!(phys::alloc_frame(ALLOC_ZERO));
    let virt = VirtAddr::new(0x4000_0000);

    assert_ok!(
        paging::map_page(ptd, virt, frame, MapAttrs::user_rw()),
        "map user page"
    );
    let (resolved, flags) = match paging::translate(ptd, virt + 0x123) {
        Some(t) => t,
        None => return cinder_lib::fail!("translate after map"),
    };
    assert_eq_test!(resolved, frame + 0x123, "translate offsets within page");
    assert_test!(flags.contains(PteFlags::USER), "user bit set");
    assert_test!(flags.contains(PteFlags::WRITABLE), "writable bit set");

    assert_ok!(paging::unmap_page(ptd, virt), "unmap");
    assert_test!(
        paging::translate(ptd, virt).is_none(),
        "translate fails after unmap"
    );
    assert_test!(!phys::frame_is_used(frame), "unmap freed the frame");

    scratch_drop(ptd);
    pass!()
}

pub fn test_map_rejects_double_map() -> TestResult {
    let Some(ptd) = scratch_ptd() else {
        return cinder_lib::fail!("no scratch ptd");
    };
    let frame = assert_ok!(phys::alloc_frame(0));
    let virt = VirtAddr::new(0x4040_0000);

    assert_ok!(paging::map_page(ptd, virt, frame, MapAttrs::KERNEL));
    assert_err!(
        paging::map_page(ptd, virt, frame, MapAttrs::KERNEL),
        MmError::AlreadyMapped { address: virt.as_u32() }
    );

    assert_ok!(paging::unmap_page(ptd, virt));
    scratch_drop(ptd);
    pass!()
}

pub fn test_unmap_unmapped_fails() -> TestResult {
    let Some(ptd) = scratch_ptd() else {
        return cinder_lib::fail!("no scratch ptd");
    };
    let virt = VirtAddr::new(0x4080_0000);
    assert_err!(
        paging::unmap_page(ptd, virt),
        MmError::NotMapped { address: virt.as_u32() }
    );
    scratch_drop(ptd);
    pass!()
}

pub fn test_map_rejects_self_map_slot() -> TestResult {
    let Some(ptd) = scratch_ptd() else {
        return cinder_lib::fail!("no scratch ptd");
    };
    let frame = assert_ok!(phys::alloc_frame(0));
    let virt = VirtAddr::new(0xFFC0_0000);
    assert_test!(
        paging::map_page(ptd, virt, frame, MapAttrs::KERNEL).is_err(),
        "mapping into the self-map window must fail"
    );
    phys::free_frame(frame);
    scratch_drop(ptd);
    pass!()
}

pub fn test_pde_permission_widening() -> TestResult {
    let Some(ptd) = scratch_ptd() else {
        return cinder_lib::fail!("no scratch ptd");
    };
    let f1 = assert_ok!(phys::alloc_frame(0));
    let f2 = assert_ok!(phys::alloc_frame(0));
    let kernel_virt = VirtAddr::new(0x40C0_0000);
    let user_virt = VirtAddr::new(0x40C0_1000);

    // Kernel mapping first: PDE has no USER bit.
    assert_ok!(paging::map_page(ptd, kernel_virt, f1, MapAttrs::KERNEL));
    let pde = tables::ptd_entry(ptd, kernel_virt.ptd_index());
    assert_test!(!pde.flags().contains(PteFlags::USER), "PDE starts kernel-only");

    // User mapping in the same slot must widen the PDE.
    assert_ok!(paging::map_page(ptd, user_virt, f2, MapAttrs::user_rw()));
    let pde = tables::ptd_entry(ptd, user_virt.ptd_index());
    assert_test!(pde.flags().contains(PteFlags::USER), "PDE widened to user");

    assert_ok!(paging::unmap_page(ptd, kernel_virt));
    assert_ok!(paging::unmap_page(ptd, user_virt));
    scratch_drop(ptd);
    pass!()
}

pub fn test_self_map_resolves_to_own_ptd() -> TestResult {
    // Invariant: for every address space, the self-map slot resolves to
    // that space's own directory page. Check the live kernel directory.
    let ptd = tables::current_ptd();
    if ptd.is_null() {
        // Paging not active in this harness configuration.
        return cinder_lib::testing::TestResult::Skipped;
    }
    let entry = tables::ptd_entry(ptd, SELF_MAP_SLOT);
    assert_test!(entry.is_present(), "self-map entry present");
    assert_eq_test!(entry.frame(), ptd, "self-map slot points at its own PTD");

    let resolved = paging::translate(ptd, VirtAddr::new(SELF_MAP_PTD));
    match resolved {
        Some((pa, _)) => assert_eq_test!(pa, ptd, "PTD visible at SELF_MAP_PTD"),
        None => return cinder_lib::fail!("SELF_MAP_PTD does not translate"),
    }
    pass!()
}

cinder_lib::define_test_suite!(
    mm_phys_paging,
    [
        test_frame_alloc_free_cycle,
        test_frame_alloc_zeroed,
        test_frame_first_fit_reuses_lowest,
        test_frame_contiguous_run,
        test_map_translate_unmap,
        test_map_rejects_double_map,
        test_unmap_unmapped_fails,
        test_map_rejects_self_map_slot,
        test_pde_permission_widening,
        test_self_map_resolves_to_own_ptd,
    ]
);
