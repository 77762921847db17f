//! exec: image loading glue.
//!
//! The ELF parser is an external collaborator; it registers an image
//! loader that turns raw file bytes into an [`ExecImage`] of segment
//! descriptors. This module owns the dangerous part: the point of no
//! return where the old user area is gone and the new image must come up,
//! plus the argv/envp stack layout. A failure before teardown leaves the
//! process untouched; after it, the process is killed.

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicPtr, Ordering};

use cinder_abi::addr::VirtAddr;
use cinder_abi::error::{KernelError, KernelResult};
use cinder_abi::fs::OpenFlags;
use cinder_abi::signal::{SIG_DFL, SIG_IGN, UserSigaction, w_termsig};
use cinder_fs::file_table;
use cinder_fs::vfs::{self, vnode::vnode_put};
use cinder_lib::klog_debug;
use cinder_mm::layout::USER_STACK_TOP;
use cinder_mm::user_buffer;

use crate::sched::switch::UserFrame;
use crate::signal::{USER_CODE_SELECTOR, USER_DATA_SELECTOR};

use super::{current_pid, with_process};

/// One loadable segment.
#[derive(Clone, Copy, Debug)]
pub struct ExecSegment {
    pub vaddr: u32,
    /// Range within the image file backing this segment.
    pub file_offset: usize,
    pub file_len: usize,
    /// Total in-memory span; the tail past `file_len` is BSS.
    pub mem_len: u32,
    pub writable: bool,
}

/// A validated program image.
pub struct ExecImage {
    pub entry: u32,
    pub segments: Vec<ExecSegment>,
}

/// Loader contract: parse and validate `bytes`, or refuse them.
pub type ImageLoaderFn = fn(&[u8]) -> KernelResult<ExecImage>;

static IMAGE_LOADER: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

pub fn register_image_loader(loader: ImageLoaderFn) {
    IMAGE_LOADER.store(loader as *mut (), Ordering::Release);
}

fn load_image(bytes: &[u8]) -> KernelResult<ExecImage> {
    let ptr = IMAGE_LOADER.load(Ordering::Acquire);
    if ptr.is_null() {
        return Err(KernelError::NotSupported);
    }
    // SAFETY: only ImageLoaderFn pointers are stored.
    let loader: ImageLoaderFn = unsafe { core::mem::transmute(ptr) };
    loader(bytes)
}

/// Replace the current process image with the program at `path`.
pub fn exec_current(
    frame: &mut UserFrame,
    path: &[u8],
    argv: &[&[u8]],
    envp: &[&[u8]],
) -> KernelResult<()> {
    let pid = current_pid();
    let space = with_process(pid, |p| p.space.clone()).ok_or(KernelError::NotFound)?;
    let cwd = super::cwd_of(pid).ok_or(KernelError::NotFound)?;

    // Fallible half, process intact: read and validate the image.
    let vnode = match vfs::vfs_open(&cwd, path, OpenFlags::RDONLY, 0) {
        Ok(v) => {
            vnode_put(cwd);
            v
        }
        Err(e) => {
            vnode_put(cwd);
            return Err(e.into());
        }
    };
    let size = vnode.fs.stat(vnode.ino).map_err(KernelError::from)?.size as usize;
    let mut bytes = alloc::vec![0u8; size];
    let read = vnode
        .fs
        .read(vnode.ino, 0, &mut bytes)
        .map_err(KernelError::from);
    vnode_put(vnode);
    if read? != size {
        return Err(KernelError::IoError);
    }
    let image = load_image(&bytes)?;
    if image.segments.is_empty() {
        return Err(KernelError::Invalid);
    }

    // Point of no return: the old user area dies here. Any
    // failure from now on kills the process instead of reporting back.
    file_table::fd_table_close_cloexec(pid);
    space.teardown_user_area();

    let result = build_user_image(&space, &image, &bytes, argv, envp);
    let user_esp = match result {
        Ok(esp) => esp,
        Err(e) => {
            klog_debug!("exec: image build failed after teardown: {}", e);
            super::lifecycle::task_exit(w_termsig(cinder_abi::signal::SIGKILL));
        }
    };

    // Caught signals reset to default; ignored ones stay ignored.
    let _ = with_process(pid, |p| {
        for action in p.actions.iter_mut() {
            if action.sa_handler != SIG_DFL && action.sa_handler != SIG_IGN {
                *action = UserSigaction::default();
            }
        }
    });

    // Resume in the fresh image when this trap returns.
    frame.eip = image.entry;
    frame.user_esp = user_esp;
    frame.eflags = 0x202;
    frame.eax = 0;
    frame.ebx = 0;
    frame.ecx = 0;
    frame.edx = 0;
    frame.esi = 0;
    frame.edi = 0;
    frame.ebp = 0;
    frame.cs = USER_CODE_SELECTOR;
    frame.user_ss = USER_DATA_SELECTOR;
    frame.ds = USER_DATA_SELECTOR;
    frame.es = USER_DATA_SELECTOR;
    frame.fs = USER_DATA_SELECTOR;
    frame.gs = USER_DATA_SELECTOR;

    klog_debug!("exec: pid {} entry {:#x} esp {:#x}", pid, image.entry, user_esp);
    Ok(())
}

/// Map the segments and lay out the initial user stack:
/// `[argc][argv0..argvN][NULL][env0..envM][NULL]` with the string bytes
/// above the pointer block. Returns the initial ESP.
fn build_user_image(
    space: &cinder_mm::addr_space::AddrSpace,
    image: &ExecImage,
    bytes: &[u8],
    argv: &[&[u8]],
    envp: &[&[u8]],
) -> KernelResult<u32> {
    for segment in &image.segments {
        let end = segment.file_offset + segment.file_len;
        if end > bytes.len() || (segment.file_len as u32) > segment.mem_len {
            return Err(KernelError::Invalid);
        }
        space.map_user_segment(
            VirtAddr::new(segment.vaddr),
            &bytes[segment.file_offset..end],
            segment.mem_len,
            segment.writable,
        )?;
    }
    space.init_user_area()?;

    // Strings first, growing down from the stack top.
    let ptd = space.ptd();
    let mut cursor = USER_STACK_TOP;
    let mut arg_ptrs = Vec::with_capacity(argv.len());
    let mut env_ptrs = Vec::with_capacity(envp.len());

    let push_string = |cursor: &mut u32, s: &[u8]| -> KernelResult<u32> {
        *cursor -= s.len() as u32 + 1;
        user_buffer::copy_to_user(ptd, VirtAddr::new(*cursor), s)?;
        user_buffer::copy_to_user(ptd, VirtAddr::new(*cursor + s.len() as u32), &[0])?;
        Ok(*cursor)
    };
    for arg in argv {
        arg_ptrs.push(push_string(&mut cursor, arg)?);
    }
    for env in envp {
        env_ptrs.push(push_string(&mut cursor, env)?);
    }

    // Pointer block, 4-byte aligned: argc, argv..., NULL, envp..., NULL.
    cursor &= !3;
    let words = 1 + arg_ptrs.len() + 1 + env_ptrs.len() + 1;
    cursor -= (words * 4) as u32;
    let mut block = Vec::with_capacity(words);
    block.push(argv.len() as u32);
    block.extend_from_slice(&arg_ptrs);
    block.push(0);
    block.extend_from_slice(&env_ptrs);
    block.push(0);
    let mut raw = Vec::with_capacity(words * 4);
    for word in block {
        raw.extend_from_slice(&word.to_le_bytes());
    }
    user_buffer::copy_to_user(ptd, VirtAddr::new(cursor), &raw)?;

    Ok(cursor)
}
