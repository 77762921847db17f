//! Process-control and credential syscalls.

extern crate alloc;

use alloc::vec::Vec;

use cinder_abi::addr::VirtAddr;
use cinder_abi::error::{KernelError, KernelResult, syscall_ret};
use cinder_abi::fs::MAX_PATH_LEN;
use cinder_abi::signal::UserSigaction;
use cinder_mm::user_buffer;

use crate::process;
use crate::sched::switch::UserFrame;
use crate::signal;

use super::args;

/// Copy a NUL-terminated user string through the current address space.
pub(super) fn user_string(addr: u32, buf: &mut [u8]) -> KernelResult<usize> {
    let ptd = process::addr_space_of(process::current_pid())
        .ok_or(KernelError::NotFound)?
        .ptd();
    Ok(user_buffer::copy_string_from_user(ptd, VirtAddr::new(addr), buf)?)
}

/// Copy a NUL-terminated vector of user string pointers (argv/envp) into
/// owned buffers. Bounded at 32 entries of `MAX_PATH_LEN` bytes.
fn user_string_vec(addr: u32) -> KernelResult<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    if addr == 0 {
        return Ok(out);
    }
    let ptd = process::addr_space_of(process::current_pid())
        .ok_or(KernelError::NotFound)?
        .ptd();
    for index in 0..32u32 {
        let mut raw = [0u8; 4];
        user_buffer::validate_buffer(ptd, VirtAddr::new(addr + index * 4), 4, false)?;
        user_buffer::copy_from_user(ptd, VirtAddr::new(addr + index * 4), &mut raw)?;
        let ptr = u32::from_le_bytes(raw);
        if ptr == 0 {
            break;
        }
        let mut buf = [0u8; MAX_PATH_LEN];
        let len = user_buffer::copy_string_from_user(ptd, VirtAddr::new(ptr), &mut buf)?;
        out.push(buf[..len].to_vec());
    }
    Ok(out)
}

pub fn sys_fork(frame: &mut UserFrame) -> i32 {
    syscall_ret(process::do_fork(frame))
}

pub fn sys_execve(frame: &mut UserFrame) -> i32 {
    let [path_ptr, argv_ptr, envp_ptr, ..] = args(frame);
    let mut path = [0u8; MAX_PATH_LEN];
    let result = (|| -> KernelResult<usize> {
        let len = user_string(path_ptr, &mut path)?;
        let argv = user_string_vec(argv_ptr)?;
        let envp = user_string_vec(envp_ptr)?;
        let argv_refs: Vec<&[u8]> = argv.iter().map(|v| v.as_slice()).collect();
        let envp_refs: Vec<&[u8]> = envp.iter().map(|v| v.as_slice()).collect();
        process::do_exec(frame, &path[..len], &argv_refs, &envp_refs)
    })();
    syscall_ret(result)
}

pub fn sys_exit(frame: &mut UserFrame) -> i32 {
    let [status, ..] = args(frame);
    process::do_exit(status as u8)
}

pub fn sys_waitpid(frame: &mut UserFrame) -> i32 {
    let [pid, status_ptr, options, ..] = args(frame);
    let result = (|| -> KernelResult<usize> {
        let (child, status) = process::do_waitpid(pid as i32, options)?;
        if status_ptr != 0 {
            let ptd = process::addr_space_of(process::current_pid())
                .ok_or(KernelError::NotFound)?
                .ptd();
            user_buffer::validate_buffer(ptd, VirtAddr::new(status_ptr), 4, true)?;
            user_buffer::copy_to_user(ptd, VirtAddr::new(status_ptr), &status.to_le_bytes())?;
        }
        Ok(child as usize)
    })();
    syscall_ret(result)
}

pub fn sys_getpid(_frame: &mut UserFrame) -> i32 {
    process::getpid() as i32
}

pub fn sys_getppid(_frame: &mut UserFrame) -> i32 {
    process::getppid() as i32
}

pub fn sys_setpgid(frame: &mut UserFrame) -> i32 {
    let [pid, pgid, ..] = args(frame);
    syscall_ret(process::setpgid(pid, pgid))
}

pub fn sys_getpgrp(_frame: &mut UserFrame) -> i32 {
    process::getpgrp() as i32
}

pub fn sys_setsid(_frame: &mut UserFrame) -> i32 {
    syscall_ret(process::setsid())
}

pub fn sys_getsid(frame: &mut UserFrame) -> i32 {
    let [pid, ..] = args(frame);
    syscall_ret(process::getsid(pid))
}

pub fn sys_kill(frame: &mut UserFrame) -> i32 {
    let [pid, sig, ..] = args(frame);
    syscall_ret(process::kill(pid as i32, sig as u8))
}

pub fn sys_sigaction(frame: &mut UserFrame) -> i32 {
    let [sig, new_ptr, old_ptr, ..] = args(frame);
    let result = (|| -> KernelResult<usize> {
        let ptd = process::addr_space_of(process::current_pid())
            .ok_or(KernelError::NotFound)?
            .ptd();
        let size = core::mem::size_of::<UserSigaction>();

        let new = if new_ptr != 0 {
            user_buffer::validate_buffer(ptd, VirtAddr::new(new_ptr), size, false)?;
            let mut raw = [0u8; core::mem::size_of::<UserSigaction>()];
            user_buffer::copy_from_user(ptd, VirtAddr::new(new_ptr), &mut raw)?;
            // SAFETY: UserSigaction is plain old data.
            Some(unsafe { core::ptr::read(raw.as_ptr() as *const UserSigaction) })
        } else {
            None
        };

        let old = signal::do_sigaction(sig as u8, new)?;
        if old_ptr != 0 {
            user_buffer::validate_buffer(ptd, VirtAddr::new(old_ptr), size, true)?;
            // SAFETY: plain old data out.
            let raw = unsafe {
                core::slice::from_raw_parts(&old as *const UserSigaction as *const u8, size)
            };
            user_buffer::copy_to_user(ptd, VirtAddr::new(old_ptr), raw)?;
        }
        Ok(0)
    })();
    syscall_ret(result)
}

pub fn sys_sigprocmask(frame: &mut UserFrame) -> i32 {
    let [how, set_ptr, old_ptr, ..] = args(frame);
    let result = (|| -> KernelResult<usize> {
        let ptd = process::addr_space_of(process::current_pid())
            .ok_or(KernelError::NotFound)?
            .ptd();
        let new = if set_ptr != 0 {
            user_buffer::validate_buffer(ptd, VirtAddr::new(set_ptr), 4, false)?;
            let mut raw = [0u8; 4];
            user_buffer::copy_from_user(ptd, VirtAddr::new(set_ptr), &mut raw)?;
            Some(u32::from_le_bytes(raw))
        } else {
            None
        };
        let old = signal::do_sigprocmask(how, new)?;
        if old_ptr != 0 {
            user_buffer::validate_buffer(ptd, VirtAddr::new(old_ptr), 4, true)?;
            user_buffer::copy_to_user(ptd, VirtAddr::new(old_ptr), &old.to_le_bytes())?;
        }
        Ok(0)
    })();
    syscall_ret(result)
}

pub fn sys_sigreturn(frame: &mut UserFrame) -> i32 {
    match signal::do_sigreturn(frame) {
        Ok(eax) => eax as i32,
        Err(e) => e.to_syscall_ret(),
    }
}

pub fn sys_alarm(frame: &mut UserFrame) -> i32 {
    let [seconds, ..] = args(frame);
    syscall_ret(process::process_alarm(seconds))
}

pub fn sys_sleep(frame: &mut UserFrame) -> i32 {
    let [seconds, ..] = args(frame);
    process::process_sleep(seconds) as i32
}

pub fn sys_getuid(_frame: &mut UserFrame) -> i32 {
    process::getuid() as i32
}

pub fn sys_geteuid(_frame: &mut UserFrame) -> i32 {
    process::geteuid() as i32
}

pub fn sys_getgid(_frame: &mut UserFrame) -> i32 {
    process::getgid() as i32
}

pub fn sys_getegid(_frame: &mut UserFrame) -> i32 {
    process::getegid() as i32
}

pub fn sys_setuid(frame: &mut UserFrame) -> i32 {
    let [uid, ..] = args(frame);
    syscall_ret(process::setuid(uid as u16))
}

pub fn sys_seteuid(frame: &mut UserFrame) -> i32 {
    let [euid, ..] = args(frame);
    syscall_ret(process::seteuid(euid as u16))
}

pub fn sys_setgid(frame: &mut UserFrame) -> i32 {
    let [gid, ..] = args(frame);
    syscall_ret(process::setgid(gid as u16))
}

pub fn sys_setegid(frame: &mut UserFrame) -> i32 {
    let [egid, ..] = args(frame);
    syscall_ret(process::setegid(egid as u16))
}
