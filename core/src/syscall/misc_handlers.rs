//! Memory and time syscalls.

use cinder_abi::addr::VirtAddr;
use cinder_abi::error::{KernelError, KernelResult, syscall_ret};
use cinder_lib::clock;
use cinder_lib::ports::TICK_FREQUENCY_HZ;
use cinder_mm::user_buffer;

use crate::process;
use crate::sched::switch::UserFrame;

use super::args;

/// sbrk(increment): returns the previous break.
pub fn sys_sbrk(frame: &mut UserFrame) -> i32 {
    let [increment, ..] = args(frame);
    let result = (|| -> KernelResult<usize> {
        let space = process::addr_space_of(process::current_pid())
            .ok_or(KernelError::NotFound)?;
        let old = space.sbrk(increment as i32)?;
        Ok(old.as_usize())
    })();
    syscall_ret(result)
}

/// time(tloc): seconds since boot (the RTC collaborator supplies wall
/// time in user space).
pub fn sys_time(frame: &mut UserFrame) -> i32 {
    let [tloc, ..] = args(frame);
    let seconds = (clock::uptime_ticks() / TICK_FREQUENCY_HZ as u64) as u32;
    if tloc != 0 {
        let result = (|| -> KernelResult<usize> {
            let ptd = process::addr_space_of(process::current_pid())
                .ok_or(KernelError::NotFound)?
                .ptd();
            user_buffer::validate_buffer(ptd, VirtAddr::new(tloc), 4, true)?;
            user_buffer::copy_to_user(ptd, VirtAddr::new(tloc), &seconds.to_le_bytes())?;
            Ok(seconds as usize)
        })();
        return syscall_ret(result);
    }
    seconds as i32
}

/// times(buf): four tick counters; this core accounts everything to user
/// time.
pub fn sys_times(frame: &mut UserFrame) -> i32 {
    let [buf, ..] = args(frame);
    let ticks = clock::uptime_ticks() as u32;
    if buf != 0 {
        let result = (|| -> KernelResult<usize> {
            let ptd = process::addr_space_of(process::current_pid())
                .ok_or(KernelError::NotFound)?
                .ptd();
            let mut raw = [0u8; 16];
            raw[..4].copy_from_slice(&ticks.to_le_bytes());
            user_buffer::validate_buffer(ptd, VirtAddr::new(buf), raw.len(), true)?;
            user_buffer::copy_to_user(ptd, VirtAddr::new(buf), &raw)?;
            Ok(ticks as usize)
        })();
        return syscall_ret(result);
    }
    ticks as i32
}
