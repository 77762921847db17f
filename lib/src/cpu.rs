//! CPU primitives for 32-bit x86: interrupt flag handling, control
//! registers, TLB maintenance, and port I/O.
//!
//! Everything is a thin wrapper over one or two instructions; no other
//! crate writes inline asm. On non-x86 build targets (the host-side test
//! harness) the interrupt flag is emulated with an atomic so that the lock
//! primitives keep their semantics.

#[cfg(target_arch = "x86")]
use core::arch::asm;

/// EFLAGS interrupt-enable bit.
pub const EFLAGS_IF: u32 = 1 << 9;

#[cfg(target_arch = "x86")]
mod imp {
    use super::{EFLAGS_IF, asm};

    /// Save EFLAGS and disable interrupts. Returns the saved flags for
    /// [`restore_flags`](super::restore_flags).
    #[inline]
    pub fn save_flags_cli() -> u32 {
        let flags: u32;
        unsafe {
            asm!("pushfd", "pop {0}", "cli", out(reg) flags, options(nomem, preserves_flags));
        }
        flags
    }

    /// Restore a previously saved EFLAGS value.
    #[inline]
    pub fn restore_flags(flags: u32) {
        unsafe {
            asm!("push {0}", "popfd", in(reg) flags, options(nomem));
        }
    }

    /// Enable interrupts.
    #[inline]
    pub fn sti() {
        unsafe { asm!("sti", options(nomem, nostack)) };
    }

    /// Disable interrupts.
    #[inline]
    pub fn cli() {
        unsafe { asm!("cli", options(nomem, nostack)) };
    }

    /// `true` if interrupts are currently enabled.
    #[inline]
    pub fn interrupts_enabled() -> bool {
        let flags: u32;
        unsafe {
            asm!("pushfd", "pop {0}", out(reg) flags, options(nomem, preserves_flags));
        }
        flags & EFLAGS_IF != 0
    }

    /// Halt until the next interrupt.
    #[inline]
    pub fn hlt() {
        unsafe { asm!("hlt", options(nomem, nostack)) };
    }

    /// Read CR2 (page-fault linear address).
    #[inline]
    pub fn read_cr2() -> u32 {
        let value: u32;
        unsafe { asm!("mov {0}, cr2", out(reg) value, options(nomem, nostack)) };
        value
    }

    /// Read CR3 (page-directory base).
    #[inline]
    pub fn read_cr3() -> u32 {
        let value: u32;
        unsafe { asm!("mov {0}, cr3", out(reg) value, options(nomem, nostack)) };
        value
    }

    /// Load CR3 with a page-directory physical base, flushing the TLB.
    ///
    /// # Safety
    /// `ptd_phys` must point at a valid page directory whose kernel
    /// mappings cover the currently executing code and stack.
    #[inline]
    pub unsafe fn write_cr3(ptd_phys: u32) {
        unsafe { asm!("mov cr3, {0}", in(reg) ptd_phys, options(nostack)) };
    }

    /// Enable paging (CR0.PG | CR0.WP).
    ///
    /// # Safety
    /// CR3 must already hold a directory that identity-maps the executing
    /// code and stack.
    #[inline]
    pub unsafe fn enable_paging() {
        unsafe {
            asm!(
                "mov eax, cr0",
                "or eax, 0x80010000",
                "mov cr0, eax",
                out("eax") _,
                options(nostack)
            );
        }
    }

    /// Invalidate the TLB entry for one virtual address.
    #[inline]
    pub fn invlpg(virt: u32) {
        unsafe { asm!("invlpg [{0}]", in(reg) virt, options(nostack)) };
    }

    /// Flush the entire TLB by reloading CR3.
    #[inline]
    pub fn flush_tlb() {
        unsafe {
            asm!("mov eax, cr3", "mov cr3, eax", out("eax") _, options(nostack));
        }
    }

    /// Read one byte from an I/O port.
    ///
    /// # Safety
    /// Port I/O has device side effects; the caller must own the port.
    #[inline]
    pub unsafe fn inb(port: u16) -> u8 {
        let value: u8;
        unsafe {
            asm!("in al, dx", in("dx") port, out("al") value,
                 options(nomem, nostack, preserves_flags));
        }
        value
    }

    /// Write one byte to an I/O port.
    ///
    /// # Safety
    /// See [`inb`].
    #[inline]
    pub unsafe fn outb(port: u16, value: u8) {
        unsafe {
            asm!("out dx, al", in("dx") port, in("al") value,
                 options(nomem, nostack, preserves_flags));
        }
    }
}

#[cfg(not(target_arch = "x86"))]
mod imp {
    //! Host-side emulation: the "interrupt flag" is a process-global atomic.
    //! Only the pieces the lock primitives and tests need are provided;
    //! paging and port I/O have no host equivalent and panic if reached.

    use super::EFLAGS_IF;
    use core::sync::atomic::{AtomicBool, Ordering};

    static IF_EMULATED: AtomicBool = AtomicBool::new(true);

    pub fn save_flags_cli() -> u32 {
        let was = IF_EMULATED.swap(false, Ordering::SeqCst);
        if was { EFLAGS_IF } else { 0 }
    }

    pub fn restore_flags(flags: u32) {
        IF_EMULATED.store(flags & EFLAGS_IF != 0, Ordering::SeqCst);
    }

    pub fn sti() {
        IF_EMULATED.store(true, Ordering::SeqCst);
    }

    pub fn cli() {
        IF_EMULATED.store(false, Ordering::SeqCst);
    }

    pub fn interrupts_enabled() -> bool {
        IF_EMULATED.load(Ordering::SeqCst)
    }

    pub fn hlt() {
        core::hint::spin_loop();
    }

    pub fn read_cr2() -> u32 {
        0
    }

    pub fn read_cr3() -> u32 {
        0
    }

    pub unsafe fn write_cr3(_ptd_phys: u32) {
        unreachable!("write_cr3 on a non-x86 target");
    }

    pub unsafe fn enable_paging() {
        unreachable!("enable_paging on a non-x86 target");
    }

    pub fn invlpg(_virt: u32) {}

    pub fn flush_tlb() {}

    pub unsafe fn inb(_port: u16) -> u8 {
        0xFF
    }

    pub unsafe fn outb(_port: u16, _value: u8) {}
}

pub use imp::{
    cli, enable_paging, flush_tlb, hlt, inb, interrupts_enabled, invlpg, outb, read_cr2, read_cr3,
    restore_flags, save_flags_cli, sti, write_cr3,
};
