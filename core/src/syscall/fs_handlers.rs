//! File syscalls.

extern crate alloc;

use cinder_abi::addr::VirtAddr;
use cinder_abi::error::{KernelError, KernelResult, syscall_ret};
use cinder_abi::fs::{Dirent, FileKind, MAX_PATH_LEN, OpenFlags, Stat};
use cinder_fs::file_table::{self, FileBacking};
use cinder_fs::vfs::{self, mount, vnode::vnode_put};
use cinder_fs::{blockdev, chardev};
use cinder_mm::user_buffer;

use crate::process;
use crate::sched::switch::UserFrame;
use crate::tty;

use super::args;
use super::process_handlers::user_string;

/// I/O staging buffer: user data crosses in chunks of this size.
const IO_CHUNK: usize = 512;

fn current_ptd() -> KernelResult<cinder_abi::addr::PhysAddr> {
    Ok(process::addr_space_of(process::current_pid())
        .ok_or(KernelError::NotFound)?
        .ptd())
}

fn with_cwd<R>(f: impl FnOnce(&cinder_fs::vfs::vnode::VnodeRef) -> KernelResult<R>) -> KernelResult<R> {
    let cwd = process::cwd_of(process::current_pid()).ok_or(KernelError::NotFound)?;
    let result = f(&cwd);
    vnode_put(cwd);
    result
}

pub fn sys_open(frame: &mut UserFrame) -> i32 {
    let [path_ptr, flags_raw, mode, ..] = args(frame);
    let result = (|| -> KernelResult<usize> {
        let mut path = [0u8; MAX_PATH_LEN];
        let len = user_string(path_ptr, &mut path)?;
        let flags = OpenFlags::from_bits_truncate(flags_raw);
        let pid = process::current_pid();
        with_cwd(|cwd| {
            let vnode = vfs::vfs_open(cwd, &path[..len], flags, mode as u16)?;
            // Device nodes route to their drivers instead of the vnode.
            if vnode.kind == FileKind::CharDevice {
                let rdev = vnode.fs.stat(vnode.ino).map(|s| s.rdev).unwrap_or(0);
                vnode_put(vnode);
                return Ok(file_table::file_open_char(pid, rdev as u16, flags)?);
            }
            Ok(file_table::file_open_vnode(pid, vnode, flags)?)
        })
    })();
    syscall_ret(result)
}

pub fn sys_close(frame: &mut UserFrame) -> i32 {
    let [fd, ..] = args(frame);
    syscall_ret(
        file_table::file_close(process::current_pid(), fd as usize)
            .map(|_| 0)
            .map_err(KernelError::from),
    )
}

/// Terminal-descriptor check for the job-control gates.
fn fd_is_terminal(pid: u32, fd: usize) -> bool {
    file_table::with_file(pid, fd, |file| match file.backing {
        FileBacking::Char(dev) => Ok(chardev::char_device(dev)
            .map(|d| d.is_terminal())
            .unwrap_or(false)),
        _ => Ok(false),
    })
    .unwrap_or(false)
}

pub fn sys_read(frame: &mut UserFrame) -> i32 {
    let [fd, buf_ptr, len, ..] = args(frame);
    let result = (|| -> KernelResult<usize> {
        let pid = process::current_pid();
        let ptd = current_ptd()?;
        let len = len as usize;
        if len == 0 {
            return Ok(0);
        }
        user_buffer::validate_buffer(ptd, VirtAddr::new(buf_ptr), len, true)?;

        // Background reads from the controlling terminal stop the caller
        // (or fail) before any data moves.
        if fd_is_terminal(pid, fd as usize) {
            tty::terminal_read_gate()?;
        }

        let mut staging = [0u8; IO_CHUNK];
        let mut done = 0usize;
        while done < len {
            let chunk = IO_CHUNK.min(len - done);
            let n = file_table::file_read(pid, fd as usize, &mut staging[..chunk])?;
            if n == 0 {
                break;
            }
            user_buffer::copy_to_user(ptd, VirtAddr::new(buf_ptr + done as u32), &staging[..n])?;
            done += n;
            if n < chunk {
                break;
            }
        }
        Ok(done)
    })();
    syscall_ret(result)
}

pub fn sys_write(frame: &mut UserFrame) -> i32 {
    let [fd, buf_ptr, len, ..] = args(frame);
    let result = (|| -> KernelResult<usize> {
        let pid = process::current_pid();
        let ptd = current_ptd()?;
        let len = len as usize;
        if len == 0 {
            return Ok(0);
        }
        user_buffer::validate_buffer(ptd, VirtAddr::new(buf_ptr), len, false)?;

        let mut staging = [0u8; IO_CHUNK];
        let mut done = 0usize;
        while done < len {
            let chunk = IO_CHUNK.min(len - done);
            user_buffer::copy_from_user(
                ptd,
                VirtAddr::new(buf_ptr + done as u32),
                &mut staging[..chunk],
            )?;
            let n = match file_table::file_write(pid, fd as usize, &staging[..chunk]) {
                Ok(n) => n,
                Err(cinder_fs::VfsError::PipeClosed) => {
                    // Writing a widowed pipe raises SIGPIPE on top of the
                    // error return.
                    let _ = crate::signal::send_to_process(
                        pid,
                        cinder_abi::signal::SIGPIPE,
                    );
                    return Err(KernelError::PipeClosed);
                }
                Err(e) => return Err(e.into()),
            };
            done += n;
            if n < chunk {
                break;
            }
        }
        Ok(done)
    })();
    syscall_ret(result)
}

pub fn sys_lseek(frame: &mut UserFrame) -> i32 {
    let [fd, offset, whence, ..] = args(frame);
    syscall_ret(
        file_table::file_lseek(process::current_pid(), fd as usize, offset as i32, whence)
            .map(|pos| pos as usize)
            .map_err(KernelError::from),
    )
}

pub fn sys_dup(frame: &mut UserFrame) -> i32 {
    let [fd, ..] = args(frame);
    syscall_ret(
        file_table::file_dup(process::current_pid(), fd as usize).map_err(KernelError::from),
    )
}

pub fn sys_dup2(frame: &mut UserFrame) -> i32 {
    let [fd, new_fd, ..] = args(frame);
    syscall_ret(
        file_table::file_dup2(process::current_pid(), fd as usize, new_fd as usize)
            .map_err(KernelError::from),
    )
}

pub fn sys_pipe(frame: &mut UserFrame) -> i32 {
    let [fds_ptr, ..] = args(frame);
    let result = (|| -> KernelResult<usize> {
        let ptd = current_ptd()?;
        user_buffer::validate_buffer(ptd, VirtAddr::new(fds_ptr), 8, true)?;
        let (read_fd, write_fd) = file_table::file_open_pipe(process::current_pid())?;
        let mut raw = [0u8; 8];
        raw[..4].copy_from_slice(&(read_fd as u32).to_le_bytes());
        raw[4..].copy_from_slice(&(write_fd as u32).to_le_bytes());
        user_buffer::copy_to_user(ptd, VirtAddr::new(fds_ptr), &raw)?;
        Ok(0)
    })();
    syscall_ret(result)
}

fn stat_to_user(ptd: cinder_abi::addr::PhysAddr, stat_ptr: u32, stat: &Stat) -> KernelResult<()> {
    let size = core::mem::size_of::<Stat>();
    user_buffer::validate_buffer(ptd, VirtAddr::new(stat_ptr), size, true)?;
    // SAFETY: Stat is repr(C) plain old data.
    let raw = unsafe { core::slice::from_raw_parts(stat as *const Stat as *const u8, size) };
    user_buffer::copy_to_user(ptd, VirtAddr::new(stat_ptr), raw)?;
    Ok(())
}

fn fill_stat(dev: u16, stat: &cinder_fs::vfs::traits::InodeStat) -> Stat {
    Stat {
        st_dev: dev as u32,
        st_ino: stat.ino,
        st_mode: stat.mode | stat.kind.mode_bits(),
        st_nlink: stat.nlink,
        st_uid: stat.uid,
        st_gid: stat.gid,
        st_rdev: stat.rdev,
        st_size: stat.size,
        st_atime: stat.atime,
        st_mtime: stat.mtime,
        st_ctime: stat.ctime,
    }
}

pub fn sys_stat(frame: &mut UserFrame) -> i32 {
    let [path_ptr, stat_ptr, ..] = args(frame);
    let result = (|| -> KernelResult<usize> {
        let mut path = [0u8; MAX_PATH_LEN];
        let len = user_string(path_ptr, &mut path)?;
        let ptd = current_ptd()?;
        with_cwd(|cwd| {
            let vnode = vfs::vfs_lookup(cwd, &path[..len])?;
            let stat = vnode.fs.stat(vnode.ino);
            let dev = vnode.dev;
            vnode_put(vnode);
            stat_to_user(ptd, stat_ptr, &fill_stat(dev, &stat?))?;
            Ok(0)
        })
    })();
    syscall_ret(result)
}

pub fn sys_fstat(frame: &mut UserFrame) -> i32 {
    let [fd, stat_ptr, ..] = args(frame);
    let result = (|| -> KernelResult<usize> {
        let ptd = current_ptd()?;
        let pid = process::current_pid();
        let stat = file_table::with_file(pid, fd as usize, |file| match &file.backing {
            FileBacking::Vnode(vnode) => {
                let stat = vnode.fs.stat(vnode.ino)?;
                Ok(fill_stat(vnode.dev, &stat))
            }
            FileBacking::PipeRead(_) | FileBacking::PipeWrite(_) => {
                let mut stat = Stat::default();
                stat.st_mode = cinder_abi::fs::S_IFIFO;
                Ok(stat)
            }
            FileBacking::Char(dev) => {
                let mut stat = Stat::default();
                stat.st_mode = cinder_abi::fs::S_IFCHR;
                stat.st_rdev = *dev as u32;
                Ok(stat)
            }
            FileBacking::External { .. } => {
                let mut stat = Stat::default();
                stat.st_mode = cinder_abi::fs::S_IFSOCK;
                Ok(stat)
            }
        })?;
        stat_to_user(ptd, stat_ptr, &stat)?;
        Ok(0)
    })();
    syscall_ret(result)
}

pub fn sys_chmod(frame: &mut UserFrame) -> i32 {
    let [path_ptr, mode, ..] = args(frame);
    let result = (|| -> KernelResult<usize> {
        let mut path = [0u8; MAX_PATH_LEN];
        let len = user_string(path_ptr, &mut path)?;
        with_cwd(|cwd| {
            let vnode = vfs::vfs_lookup(cwd, &path[..len])?;
            let r = vnode.fs.set_mode(vnode.ino, mode as u16);
            vnode_put(vnode);
            r?;
            Ok(0)
        })
    })();
    syscall_ret(result)
}

pub fn sys_utime(frame: &mut UserFrame) -> i32 {
    let [path_ptr, atime, mtime, ..] = args(frame);
    let result = (|| -> KernelResult<usize> {
        let mut path = [0u8; MAX_PATH_LEN];
        let len = user_string(path_ptr, &mut path)?;
        with_cwd(|cwd| {
            let vnode = vfs::vfs_lookup(cwd, &path[..len])?;
            let r = vnode.fs.set_times(vnode.ino, atime, mtime);
            vnode_put(vnode);
            r?;
            Ok(0)
        })
    })();
    syscall_ret(result)
}

fn two_paths(frame: &UserFrame) -> KernelResult<([u8; MAX_PATH_LEN], usize, [u8; MAX_PATH_LEN], usize)> {
    let [a_ptr, b_ptr, ..] = args(frame);
    let mut a = [0u8; MAX_PATH_LEN];
    let mut b = [0u8; MAX_PATH_LEN];
    let a_len = user_string(a_ptr, &mut a)?;
    let b_len = user_string(b_ptr, &mut b)?;
    Ok((a, a_len, b, b_len))
}

pub fn sys_link(frame: &mut UserFrame) -> i32 {
    let result = (|| -> KernelResult<usize> {
        let (old, old_len, new, new_len) = two_paths(frame)?;
        with_cwd(|cwd| {
            vfs::vfs_link(cwd, &old[..old_len], &new[..new_len])?;
            Ok(0)
        })
    })();
    syscall_ret(result)
}

pub fn sys_unlink(frame: &mut UserFrame) -> i32 {
    let [path_ptr, ..] = args(frame);
    let result = (|| -> KernelResult<usize> {
        let mut path = [0u8; MAX_PATH_LEN];
        let len = user_string(path_ptr, &mut path)?;
        with_cwd(|cwd| {
            vfs::vfs_unlink(cwd, &path[..len])?;
            Ok(0)
        })
    })();
    syscall_ret(result)
}

pub fn sys_rename(frame: &mut UserFrame) -> i32 {
    let result = (|| -> KernelResult<usize> {
        let (old, old_len, new, new_len) = two_paths(frame)?;
        with_cwd(|cwd| {
            vfs::vfs_rename(cwd, &old[..old_len], &new[..new_len])?;
            Ok(0)
        })
    })();
    syscall_ret(result)
}

pub fn sys_mkdir(frame: &mut UserFrame) -> i32 {
    let [path_ptr, mode, ..] = args(frame);
    let result = (|| -> KernelResult<usize> {
        let mut path = [0u8; MAX_PATH_LEN];
        let len = user_string(path_ptr, &mut path)?;
        with_cwd(|cwd| {
            vfs::vfs_mkdir(cwd, &path[..len], mode as u16)?;
            Ok(0)
        })
    })();
    syscall_ret(result)
}

pub fn sys_rmdir(frame: &mut UserFrame) -> i32 {
    let [path_ptr, ..] = args(frame);
    let result = (|| -> KernelResult<usize> {
        let mut path = [0u8; MAX_PATH_LEN];
        let len = user_string(path_ptr, &mut path)?;
        with_cwd(|cwd| {
            vfs::vfs_rmdir(cwd, &path[..len])?;
            Ok(0)
        })
    })();
    syscall_ret(result)
}

pub fn sys_chdir(frame: &mut UserFrame) -> i32 {
    let [path_ptr, ..] = args(frame);
    let result = (|| -> KernelResult<usize> {
        let mut path = [0u8; MAX_PATH_LEN];
        let len = user_string(path_ptr, &mut path)?;
        let new_cwd = with_cwd(|cwd| {
            let vnode = vfs::vfs_lookup(cwd, &path[..len])?;
            if vnode.kind != FileKind::Directory {
                vnode_put(vnode);
                return Err(KernelError::NotDirectory);
            }
            Ok(vnode)
        })?;
        process::set_cwd(process::current_pid(), new_cwd);
        Ok(0)
    })();
    syscall_ret(result)
}

/// Rebuild the cwd's path by climbing `..` and matching inode numbers in
/// each parent's entry stream.
pub fn sys_getcwd(frame: &mut UserFrame) -> i32 {
    let [buf_ptr, buf_len, ..] = args(frame);
    let result = (|| -> KernelResult<usize> {
        let ptd = current_ptd()?;
        let mut path = [0u8; MAX_PATH_LEN];
        let mut path_len = 0usize;

        with_cwd(|cwd| {
            let mut current = cinder_fs::vfs::vnode::vnode_ref(cwd);
            for _ in 0..32 {
                let parent = vfs::vfs_lookup(&current, b"..")?;
                if parent.dev == current.dev && parent.ino == current.ino {
                    vnode_put(parent);
                    break; // reached the root
                }
                // Find our name in the parent.
                let mut pos = 0usize;
                let mut found = None;
                while let Some((entry, next)) = vfs::vfs_readdir(&parent, pos)? {
                    if entry.ino == current.ino
                        && entry.name() != b"."
                        && entry.name() != b".."
                    {
                        found = Some(entry);
                        break;
                    }
                    pos = next;
                }
                let entry = found.ok_or(KernelError::NotFound)?;
                // Prepend "/name".
                let name = entry.name();
                if path_len + name.len() + 1 > path.len() {
                    vnode_put(parent);
                    vnode_put(current);
                    return Err(KernelError::NameTooLong);
                }
                path.copy_within(..path_len, name.len() + 1);
                path[0] = b'/';
                path[1..1 + name.len()].copy_from_slice(name);
                path_len += name.len() + 1;

                vnode_put(current);
                current = parent;
            }
            vnode_put(current);
            Ok(())
        })?;

        if path_len == 0 {
            path[0] = b'/';
            path_len = 1;
        }
        if path_len + 1 > buf_len as usize {
            return Err(KernelError::Invalid);
        }
        user_buffer::validate_buffer(ptd, VirtAddr::new(buf_ptr), path_len + 1, true)?;
        user_buffer::copy_to_user(ptd, VirtAddr::new(buf_ptr), &path[..path_len])?;
        user_buffer::copy_to_user(ptd, VirtAddr::new(buf_ptr + path_len as u32), &[0])?;
        Ok(path_len)
    })();
    syscall_ret(result)
}

pub fn sys_ftruncate(frame: &mut UserFrame) -> i32 {
    let [fd, size, ..] = args(frame);
    let result = file_table::with_file(process::current_pid(), fd as usize, |file| {
        match &file.backing {
            FileBacking::Vnode(vnode) => vnode.fs.truncate(vnode.ino, size),
            _ => Err(cinder_fs::VfsError::Invalid),
        }
    })
    .map(|_| 0)
    .map_err(KernelError::from);
    syscall_ret(result)
}

pub fn sys_isatty(frame: &mut UserFrame) -> i32 {
    let [fd, ..] = args(frame);
    if fd_is_terminal(process::current_pid(), fd as usize) {
        1
    } else {
        KernelError::NotSupported.to_syscall_ret()
    }
}

pub fn sys_ioctl(frame: &mut UserFrame) -> i32 {
    let [fd, request, arg, ..] = args(frame);
    let result = file_table::with_file(process::current_pid(), fd as usize, |file| {
        match &file.backing {
            FileBacking::Char(dev) => chardev::char_device(*dev)?.ioctl(request, arg),
            _ => Err(cinder_fs::VfsError::NotSupported),
        }
    })
    .map(|v| v as usize)
    .map_err(KernelError::from);
    syscall_ret(result)
}

/// getdent: one directory entry per call; the descriptor cursor is the
/// stream position.
pub fn sys_getdent(frame: &mut UserFrame) -> i32 {
    let [fd, dirent_ptr, ..] = args(frame);
    let result = (|| -> KernelResult<usize> {
        let pid = process::current_pid();
        let ptd = current_ptd()?;
        let size = core::mem::size_of::<Dirent>();
        user_buffer::validate_buffer(ptd, VirtAddr::new(dirent_ptr), size, true)?;

        let produced = file_table::with_file(pid, fd as usize, |file| {
            let vnode = match &file.backing {
                FileBacking::Vnode(v) => v,
                _ => return Err(cinder_fs::VfsError::NotDirectory),
            };
            match vfs::vfs_readdir(vnode, file.pos as usize)? {
                Some((entry, next)) => {
                    file.pos = next as u32;
                    let mut out = Dirent::empty();
                    out.d_ino = entry.ino;
                    out.d_kind = entry.kind as u8;
                    out.d_name_len = entry.name_len;
                    out.d_name[..entry.name_len as usize].copy_from_slice(entry.name());
                    Ok(Some(out))
                }
                None => Ok(None),
            }
        })?;

        match produced {
            Some(dirent) => {
                // SAFETY: Dirent is repr(C) plain old data.
                let raw = unsafe {
                    core::slice::from_raw_parts(&dirent as *const Dirent as *const u8, size)
                };
                user_buffer::copy_to_user(ptd, VirtAddr::new(dirent_ptr), raw)?;
                Ok(1)
            }
            None => Ok(0),
        }
    })();
    syscall_ret(result)
}

pub fn sys_mount(frame: &mut UserFrame) -> i32 {
    let [point_ptr, dev, fsname_ptr, ..] = args(frame);
    let result = (|| -> KernelResult<usize> {
        let mut point = [0u8; MAX_PATH_LEN];
        let point_len = user_string(point_ptr, &mut point)?;
        let mut fsname = [0u8; 16];
        let fsname_len = user_string(fsname_ptr, &mut fsname)?;
        blockdev::block_device(dev as u16)?; // fail early on a bad device
        with_cwd(|cwd| {
            let vnode = vfs::vfs_lookup(cwd, &point[..point_len])?;
            mount::do_mount(vnode, dev as u16, &fsname[..fsname_len])?;
            Ok(0)
        })
    })();
    syscall_ret(result)
}

pub fn sys_unmount(frame: &mut UserFrame) -> i32 {
    let [point_ptr, ..] = args(frame);
    let result = (|| -> KernelResult<usize> {
        let mut point = [0u8; MAX_PATH_LEN];
        let point_len = user_string(point_ptr, &mut point)?;
        with_cwd(|cwd| {
            let vnode = vfs::vfs_lookup(cwd, &point[..point_len])?;
            mount::do_unmount(vnode)?;
            Ok(0)
        })
    })();
    syscall_ret(result)
}
