//! Kernel entry: subsystem bring-up in dependency order, the trap glue
//! the platform layer calls into, and the boot-time test runner.
//!
//! The loader (out of tree) drops us into `kernel_main` in protected mode
//! with a memory map and, optionally, a root filesystem image already in
//! memory.

#![no_std]
#![no_main]
#![allow(unsafe_op_in_unsafe_fn)]

extern crate alloc;

use alloc::sync::Arc;

use cinder_abi::addr::PhysAddr;
use cinder_core::sched::switch::UserFrame;
use cinder_core::{process, sched, syscall};
use cinder_fs::vfs::mount;
use cinder_fs::{blockdev, ext2, fat16, ramdisk::RamDisk};
use cinder_lib::{klog_error, klog_info, kernel_bug};
use cinder_mm::memory_init::{BootInfo, memory_init};
use cinder_mm::phys::MemRegion;

/// Handoff from the loader.
#[repr(C)]
pub struct BootHandoff {
    /// Physical memory map.
    pub regions: *const MemRegion,
    pub region_count: usize,
    /// End of the kernel image (text through BSS), physical.
    pub kernel_image_end: u32,
    /// Optional root filesystem image (ext2), physical; 0 when absent.
    pub initrd_base: u32,
    pub initrd_len: u32,
}

/// Block device id of the boot RAM disk.
const ROOT_DEV: u16 = 1;

/// Main entry, called exactly once by the loader stub with interrupts
/// off.
///
/// # Safety
/// `handoff` must describe the machine truthfully; everything else
/// follows from it.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kernel_main(handoff: *const BootHandoff) -> ! {
    let handoff = &*handoff;
    let regions = core::slice::from_raw_parts(handoff.regions, handoff.region_count);

    klog_info!("cinder: booting");

    let boot = BootInfo {
        regions,
        kernel_image_end: PhysAddr::new(handoff.kernel_image_end),
    };
    let kernel_space = match memory_init(&boot) {
        Ok(space) => space,
        Err(e) => kernel_bug!("memory bring-up failed: {}", e),
    };

    sched::sched_init(1);
    sched::scheduler::create_idle_task(0);
    if process::init_kernel_process(kernel_space, None).is_err() {
        kernel_bug!("kernel process setup failed");
    }

    syscall::syscall_init();

    // Storage: filesystem drivers, then the boot RAM disk as root.
    ext2::register_driver();
    fat16::register_driver();
    if handoff.initrd_base != 0 {
        let image = core::slice::from_raw_parts(
            cinder_mm::phys::phys_to_ptr(PhysAddr::new(handoff.initrd_base)),
            handoff.initrd_len as usize,
        );
        blockdev::register_block_device(ROOT_DEV, Arc::new(RamDisk::from_image(image)));
        match ext2::Ext2Fs::probe(ROOT_DEV).and_then(mount::mount_root) {
            Ok(root) => {
                process::set_cwd(0, root);
            }
            Err(e) => klog_error!("cinder: no root filesystem: {}", e),
        }
    }

    cinder_net::net_init();

    #[cfg(feature = "builtin-tests")]
    sched::scheduler::spawn_kernel_task(0, run_builtin_tests, 0, cinder_abi::task::TASK_PRIORITY_NORMAL);

    klog_info!("cinder: core up, entering the scheduler");
    cinder_lib::cpu::sti();
    loop {
        cinder_lib::cpu::hlt();
    }
}

// =============================================================================
// Trap glue: the IDT stubs (platform layer) land here
// =============================================================================

/// Timer IRQ body.
#[unsafe(no_mangle)]
pub extern "C" fn kernel_timer_interrupt(frame: &mut UserFrame) {
    syscall::timer_interrupt(frame);
}

/// `int 0x80` body.
#[unsafe(no_mangle)]
pub extern "C" fn kernel_syscall_trap(frame: &mut UserFrame) {
    syscall::syscall_entry(frame);
}

/// Any other trap returning to user mode.
#[unsafe(no_mangle)]
pub extern "C" fn kernel_trap_exit(frame: &mut UserFrame) {
    syscall::return_to_user(frame);
}

// =============================================================================
// Built-in test runner
// =============================================================================

#[cfg(feature = "builtin-tests")]
unsafe extern "C" {
    static __start_test_registry: u8;
    static __stop_test_registry: u8;
}

#[cfg(feature = "builtin-tests")]
fn run_builtin_tests(_arg: usize) {
    use cinder_lib::testing::{TestRunSummary, TestSuiteDesc, TestSuiteResult};

    let mut summary = TestRunSummary::default();
    // SAFETY: the linker script collects every registered TestSuiteDesc
    // between these two symbols.
    let (start, end) = unsafe {
        (
            &__start_test_registry as *const u8 as *const TestSuiteDesc,
            &__stop_test_registry as *const u8 as *const TestSuiteDesc,
        )
    };
    let count = (end as usize - start as usize) / core::mem::size_of::<TestSuiteDesc>();
    klog_info!("tests: running {} suites", count);

    for index in 0..count {
        // SAFETY: in-bounds of the registry section.
        let desc = unsafe { &*start.add(index) };
        let Some(run) = desc.run else { continue };
        let mut result = TestSuiteResult::default();
        run(&mut result);
        summary.add_suite_result(&result);
    }

    klog_info!(
        "tests: {} passed, {} failed ({} total)",
        summary.passed,
        summary.failed,
        summary.total_tests
    );
    if summary.failed != 0 {
        klog_error!("tests: FAILURES PRESENT");
    }
}

// =============================================================================
// Panic
// =============================================================================

#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    klog_error!("kernel panic: {}", info);
    cinder_lib::kdiag::debug_trap()
}
