//! Kernel invariant-violation trap.
//!
//! When a subsystem detects a broken invariant (a refcount going negative,
//! a cache entry duplicated) it must not limp on. `kernel_bug!` logs the
//! message and drops into the registered debug hook; the default hook
//! disables interrupts and halts.

use core::sync::atomic::{AtomicPtr, Ordering};

use crate::cpu;

/// Hook invoked after a kernel bug has been logged. A debugger front end
/// (out of scope for the core) registers its prompt loop here.
pub type DebugTrapHook = fn() -> !;

static DEBUG_HOOK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

pub fn register_debug_trap(hook: DebugTrapHook) {
    DEBUG_HOOK.store(hook as *mut (), Ordering::Release);
}

/// Enter the debug trap; never returns.
pub fn debug_trap() -> ! {
    let ptr = DEBUG_HOOK.load(Ordering::Acquire);
    if !ptr.is_null() {
        // SAFETY: only DebugTrapHook fn pointers are stored.
        let hook: DebugTrapHook = unsafe { core::mem::transmute(ptr) };
        hook();
    }
    loop {
        cpu::cli();
        cpu::hlt();
    }
}

#[macro_export]
macro_rules! kernel_bug {
    ($($arg:tt)*) => {{
        $crate::klog_error!("KERNEL BUG: {}", format_args!($($arg)*));
        $crate::kdiag::debug_trap()
    }};
}
