//! User buffer validation and copy helpers.
//!
//! Syscall handlers never dereference a user pointer directly; they first
//! run it through [`validate_buffer`], which checks that every touched page
//! is present, user-accessible, and writable when writing. A zero length
//! switches to NUL-terminated-string mode: the scan stops at the first NUL
//! and fails if it would cross a page boundary into an unmapped page
//! before finding one.

use cinder_abi::PAGE_SIZE;
use cinder_abi::addr::{PhysAddr, VirtAddr};
use cinder_abi::fs::MAX_PATH_LEN;

use crate::error::{MmError, MmResult};
use crate::paging::{self, PteFlags};
use crate::phys;

/// Hard cap for NUL-terminated string scans.
const MAX_STRING_LEN: usize = MAX_PATH_LEN;

fn page_ok(ptd: PhysAddr, virt: VirtAddr, need_write: bool) -> bool {
    match paging::translate(ptd, virt) {
        Some((_, flags)) => {
            flags.contains(PteFlags::USER) && (!need_write || flags.contains(PteFlags::WRITABLE))
        }
        None => false,
    }
}

/// Validate `len` bytes at `addr` in the address space rooted at `ptd`.
///
/// With `len == 0` the buffer is treated as a NUL-terminated string and the
/// validated length (including the NUL) is returned; otherwise `len` comes
/// back unchanged.
pub fn validate_buffer(ptd: PhysAddr, addr: VirtAddr, len: usize, need_write: bool) -> MmResult<usize> {
    if addr.is_null() {
        return Err(MmError::BadAddress);
    }

    if len == 0 {
        return validate_string(ptd, addr, need_write);
    }

    let start = addr.page_base();
    let end = VirtAddr::new(addr.as_u32().wrapping_add(len as u32 - 1));
    if end < addr {
        return Err(MmError::BadAddress); // wrapped around the address space
    }
    let mut page = start;
    loop {
        if !page_ok(ptd, page, need_write) {
            return Err(MmError::BadAddress);
        }
        if page.as_u32() >= end.page_base().as_u32() {
            break;
        }
        page = page + PAGE_SIZE;
    }
    Ok(len)
}

/// NUL-terminated scan: every page entered must validate before its bytes
/// are inspected.
fn validate_string(ptd: PhysAddr, addr: VirtAddr, need_write: bool) -> MmResult<usize> {
    let mut len = 0usize;
    let mut va = addr;
    let mut page_checked = VirtAddr::NULL;
    while len < MAX_STRING_LEN {
        let page = va.page_base();
        if page != page_checked {
            if !page_ok(ptd, page, need_write) {
                return Err(MmError::BadAddress);
            }
            page_checked = page;
        }
        let (pa, _) = paging::translate(ptd, va).ok_or(MmError::BadAddress)?;
        // SAFETY: the page validated as present user memory.
        let byte = unsafe { *phys::phys_to_ptr(pa) };
        len += 1;
        if byte == 0 {
            return Ok(len);
        }
        va = va + 1;
    }
    Err(MmError::BadAddress)
}

/// Copy bytes from user memory into `dst`. The range must have been
/// validated.
pub fn copy_from_user(ptd: PhysAddr, src: VirtAddr, dst: &mut [u8]) -> MmResult {
    let mut done = 0usize;
    while done < dst.len() {
        let va = src + done as u32;
        let (pa, _) = paging::translate(ptd, va).ok_or(MmError::BadAddress)?;
        let chunk = ((PAGE_SIZE - va.page_offset()) as usize).min(dst.len() - done);
        // SAFETY: source resolves to present RAM; destination is a kernel
        // slice.
        unsafe {
            core::ptr::copy_nonoverlapping(
                phys::phys_to_ptr(pa),
                dst.as_mut_ptr().add(done),
                chunk,
            );
        }
        done += chunk;
    }
    Ok(())
}

/// Copy bytes from `src` into user memory. The range must have been
/// validated writable.
pub fn copy_to_user(ptd: PhysAddr, dst: VirtAddr, src: &[u8]) -> MmResult {
    let mut done = 0usize;
    while done < src.len() {
        let va = dst + done as u32;
        let (pa, _) = paging::translate(ptd, va).ok_or(MmError::BadAddress)?;
        let chunk = ((PAGE_SIZE - va.page_offset()) as usize).min(src.len() - done);
        // SAFETY: destination resolves to present, validated-writable RAM.
        unsafe {
            core::ptr::copy_nonoverlapping(
                src.as_ptr().add(done),
                phys::phys_to_ptr(pa),
                chunk,
            );
        }
        done += chunk;
    }
    Ok(())
}

/// Validate and copy a user string into `buf`; returns its length without
/// the NUL.
pub fn copy_string_from_user(ptd: PhysAddr, src: VirtAddr, buf: &mut [u8]) -> MmResult<usize> {
    let len_with_nul = validate_buffer(ptd, src, 0, false)?;
    let len = len_with_nul - 1;
    if len > buf.len() {
        return Err(MmError::BadAddress);
    }
    copy_from_user(ptd, src, &mut buf[..len])?;
    Ok(len)
}
