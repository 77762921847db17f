//! Address-space tests: stack arenas, user segments, clone, buffer
//! validation.

use cinder_abi::PAGE_SIZE;
use cinder_abi::addr::VirtAddr;
use cinder_abi::task::{STACK_PAGES_GAP, STACK_PAGES_TASK};
use cinder_lib::testing::TestResult;
use cinder_lib::{assert_eq_test, assert_ok, assert_test, fail, pass};

use crate::addr_space::AddrSpace;
use crate::error::MmError;
use crate::layout::{KERNEL_SHARED_PTD_SLOTS, MAX_STACK_SLOTS, SELF_MAP_SLOT, USER_AREA_BASE};
use crate::paging::{self, tables};
use crate::phys;
use crate::user_buffer;

pub fn test_new_user_space_shares_kernel_slots() -> TestResult {
    let kernel = AddrSpace::kernel();
    let space = assert_ok!(AddrSpace::new_user());

    // Invariant: the lowest shared slots are identical across spaces.
    for slot in [0usize, 1, KERNEL_SHARED_PTD_SLOTS / 2, KERNEL_SHARED_PTD_SLOTS - 1] {
        let k = tables::ptd_entry(kernel.ptd(), slot);
        let u = tables::ptd_entry(space.ptd(), slot);
        assert_eq_test!(k.0, u.0, "shared kernel slot aliases the same PT");
    }

    // Invariant: the self-map slot resolves to the space's own directory.
    let entry = tables::ptd_entry(space.ptd(), SELF_MAP_SLOT);
    assert_eq_test!(entry.frame(), space.ptd(), "self-map points at own PTD");

    space.destroy();
    pass!()
}

pub fn test_kernel_stack_slots_and_guard_gap() -> TestResult {
    let space = assert_ok!(AddrSpace::new_user());

    let s1 = assert_ok!(space.alloc_kernel_stack());
    let s2 = assert_ok!(space.alloc_kernel_stack());
    assert_test!(s1.slot != s2.slot, "distinct slots");

    // All stack pages mapped, supervisor-only.
    for page in 0..STACK_PAGES_TASK {
        let va = s1.base + page * PAGE_SIZE;
        assert_test!(
            paging::translate(space.ptd(), va).is_some(),
            "stack page {} mapped",
            page
        );
    }

    // The guard page below the stack must not resolve.
    let guard = VirtAddr::new(s1.base.as_u32() - STACK_PAGES_GAP * PAGE_SIZE);
    assert_test!(
        paging::translate(space.ptd(), guard).is_none(),
        "guard page unmapped"
    );

    space.free_kernel_stack(s1.slot);
    assert_test!(
        paging::translate(space.ptd(), s1.base).is_none(),
        "stack unmapped after free"
    );

    space.free_kernel_stack(s2.slot);
    space.destroy();
    pass!()
}

pub fn test_kernel_stack_arena_exhaustion() -> TestResult {
    let space = assert_ok!(AddrSpace::new_user());

    let mut allocated = 0usize;
    loop {
        match space.alloc_kernel_stack() {
            Ok(_) => allocated += 1,
            Err(MmError::NoStack) => break,
            Err(e) => {
                space.destroy();
                return fail!("unexpected error {:?}", e);
            }
        }
        if allocated > MAX_STACK_SLOTS {
            space.destroy();
            return fail!("arena exceeded its slot budget");
        }
    }
    assert_eq_test!(allocated, MAX_STACK_SLOTS, "arena holds exactly its slots");

    space.destroy();
    pass!()
}

pub fn test_user_segment_and_teardown() -> TestResult {
    let space = assert_ok!(AddrSpace::new_user());
    let vaddr = VirtAddr::new(USER_AREA_BASE + 0x1000);
    let payload = [0xABu8; 64];

    assert_ok!(space.map_user_segment(vaddr, &payload, 2 * PAGE_SIZE, true));

    // File-backed prefix readable through the physical window.
    let (pa, _) = match paging::translate(space.ptd(), vaddr) {
        Some(t) => t,
        None => {
            space.destroy();
            return fail!("segment page not mapped");
        }
    };
    // SAFETY: resolved frame belongs to the segment just mapped.
    let first = unsafe { *phys::phys_to_ptr(pa) };
    assert_eq_test!(first, 0xAB, "segment data copied");

    // BSS tail reads as zero.
    let (tail_pa, _) = match paging::translate(space.ptd(), vaddr + PAGE_SIZE) {
        Some(t) => t,
        None => {
            space.destroy();
            return fail!("bss page not mapped");
        }
    };
    // SAFETY: as above.
    let tail = unsafe { *phys::phys_to_ptr(tail_pa) };
    assert_eq_test!(tail, 0, "bss tail zeroed");

    space.teardown_user_area();
    assert_test!(
        paging::translate(space.ptd(), vaddr).is_none(),
        "teardown removed the mapping"
    );

    space.destroy();
    pass!()
}

pub fn test_clone_deep_copies_user_pages() -> TestResult {
    let parent = assert_ok!(AddrSpace::new_user());
    let stack = assert_ok!(parent.alloc_kernel_stack());
    let vaddr = VirtAddr::new(USER_AREA_BASE);
    let payload = [0x5Au8; 32];
    assert_ok!(parent.map_user_segment(vaddr, &payload, PAGE_SIZE, true));

    let child = assert_ok!(parent.clone_for_fork(stack.slot));

    let (ppa, _) = paging::translate(parent.ptd(), vaddr).unwrap();
    let (cpa, _) = match paging::translate(child.ptd(), vaddr) {
        Some(t) => t,
        None => {
            child.destroy();
            parent.destroy();
            return fail!("child missing the user page");
        }
    };
    assert_test!(ppa != cpa, "child owns a distinct frame");

    // SAFETY: both frames are owned by the two spaces under test.
    unsafe {
        assert_eq_test!(*phys::phys_to_ptr(cpa), 0x5A, "content copied");
        // Mutating the parent must not show through in the child.
        *phys::phys_to_ptr(ppa) = 0x77;
        assert_eq_test!(*phys::phys_to_ptr(cpa), 0x5A, "copy, not alias");
    }

    // The calling task's kernel stack is present in the child...
    assert_test!(
        paging::translate(child.ptd(), stack.base).is_some(),
        "calling task's stack copied"
    );
    assert_test!(child.stack_slot_used(stack.slot), "slot reserved in child");

    child.destroy();
    parent.destroy();
    pass!()
}

pub fn test_clone_drops_other_task_stacks() -> TestResult {
    let parent = assert_ok!(AddrSpace::new_user());
    let caller = assert_ok!(parent.alloc_kernel_stack());
    let other = assert_ok!(parent.alloc_kernel_stack());

    let child = assert_ok!(parent.clone_for_fork(caller.slot));

    assert_test!(
        paging::translate(child.ptd(), caller.base).is_some(),
        "caller stack present in child"
    );
    assert_test!(
        paging::translate(child.ptd(), other.base).is_none(),
        "other task's stack absent in child"
    );
    assert_test!(
        !child.stack_slot_used(other.slot),
        "other slot reported free in child"
    );

    child.destroy();
    parent.destroy();
    pass!()
}

// =============================================================================
// Buffer validation
// =============================================================================

pub fn test_validate_buffer_basic() -> TestResult {
    let space = assert_ok!(AddrSpace::new_user());
    let vaddr = VirtAddr::new(USER_AREA_BASE);
    assert_ok!(space.map_user_segment(vaddr, &[1, 2, 3], PAGE_SIZE, true));

    assert_ok!(
        user_buffer::validate_buffer(space.ptd(), vaddr, 64, false),
        "read validation of mapped page"
    );
    assert_ok!(
        user_buffer::validate_buffer(space.ptd(), vaddr, 64, true),
        "write validation of writable page"
    );

    // Crossing into the unmapped second page fails.
    let result = user_buffer::validate_buffer(space.ptd(), vaddr, 2 * PAGE_SIZE as usize, false);
    assert_test!(result.is_err(), "hole in the range is rejected");

    space.destroy();
    pass!()
}

pub fn test_validate_buffer_write_to_readonly() -> TestResult {
    let space = assert_ok!(AddrSpace::new_user());
    let vaddr = VirtAddr::new(USER_AREA_BASE);
    assert_ok!(space.map_user_segment(vaddr, &[1], PAGE_SIZE, false));

    assert_ok!(
        user_buffer::validate_buffer(space.ptd(), vaddr, 16, false),
        "read of read-only page"
    );
    assert_test!(
        user_buffer::validate_buffer(space.ptd(), vaddr, 16, true).is_err(),
        "write validation of read-only page fails"
    );

    space.destroy();
    pass!()
}

pub fn test_validate_string_mode() -> TestResult {
    let space = assert_ok!(AddrSpace::new_user());
    let vaddr = VirtAddr::new(USER_AREA_BASE);
    assert_ok!(space.map_user_segment(vaddr, b"hello\0", PAGE_SIZE, true));

    let len = assert_ok!(
        user_buffer::validate_buffer(space.ptd(), vaddr, 0, false),
        "string validation"
    );
    assert_eq_test!(len, 6, "length includes the NUL");

    // A string running off the mapped page into a hole must fail: fill the
    // whole page with non-NUL bytes.
    let fill = [b'x'; PAGE_SIZE as usize];
    let space2 = assert_ok!(AddrSpace::new_user());
    assert_ok!(space2.map_user_segment(vaddr, &fill, PAGE_SIZE, true));
    assert_test!(
        user_buffer::validate_buffer(space2.ptd(), vaddr, 0, false).is_err(),
        "unterminated string crossing into a hole fails"
    );

    space2.destroy();
    space.destroy();
    pass!()
}

pub fn test_copy_user_roundtrip() -> TestResult {
    let space = assert_ok!(AddrSpace::new_user());
    let vaddr = VirtAddr::new(USER_AREA_BASE);
    assert_ok!(space.map_user_segment(vaddr, &[0u8; 16], PAGE_SIZE, true));

    assert_ok!(user_buffer::copy_to_user(space.ptd(), vaddr, b"cinder"));
    let mut buf = [0u8; 6];
    assert_ok!(user_buffer::copy_from_user(space.ptd(), vaddr, &mut buf));
    assert_eq_test!(&buf, b"cinder", "round trip through user memory");

    space.destroy();
    pass!()
}

pub fn test_sbrk_grow_and_shrink() -> TestResult {
    let space = assert_ok!(AddrSpace::new_user());
    let vaddr = VirtAddr::new(USER_AREA_BASE);
    assert_ok!(space.map_user_segment(vaddr, &[0u8; 8], PAGE_SIZE, true));

    let old = assert_ok!(space.sbrk(2 * PAGE_SIZE as i32));
    let new_page = VirtAddr::new(old.as_u32());
    assert_test!(
        paging::translate(space.ptd(), new_page.page_align_up()).is_some(),
        "sbrk mapped the new range"
    );

    assert_ok!(space.sbrk(-(2 * PAGE_SIZE as i32)));
    space.destroy();
    pass!()
}

cinder_lib::define_test_suite!(
    mm_addr_space,
    [
        test_new_user_space_shares_kernel_slots,
        test_kernel_stack_slots_and_guard_gap,
        test_kernel_stack_arena_exhaustion,
        test_user_segment_and_teardown,
        test_clone_deep_copies_user_pages,
        test_clone_drops_other_task_stacks,
        test_validate_buffer_basic,
        test_validate_buffer_write_to_readonly,
        test_validate_string_mode,
        test_copy_user_roundtrip,
        test_sbrk_grow_and_shrink,
    ]
);
