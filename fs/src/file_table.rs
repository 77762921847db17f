//! Open files and per-process descriptor tables.
//!
//! An open file is `(vnode | pipe end | char device | external handle,
//! cursor, flags, refcount)`; the cursor lives here so that descriptors
//! duplicated with `dup`/`fork` share it. Descriptor tables map small
//! integers per process onto the system open-file table.
//!
//! Sockets sit above this crate, so they register as an *external
//! descriptor class*: a vtable of read/write/close/poll callbacks keyed by
//! a class id, with an opaque handle stored in the open file.

extern crate alloc;

use alloc::sync::Arc;

use cinder_abi::fs::{MAX_OPEN_FILES, OpenFlags, SEEK_CUR, SEEK_END, SEEK_SET};
use cinder_abi::task::MAX_PROCESSES;
use cinder_lib::IrqMutex;

use crate::chardev::{self, CharDevId};
use crate::error::{VfsError, VfsResult};
use crate::pipe::Pipe;
use crate::vfs::vnode::{VnodeRef, vnode_put, vnode_ref};

/// System-wide open file limit.
pub const MAX_SYSTEM_FILES: usize = 256;

/// What an open file refers to.
pub enum FileBacking {
    Vnode(VnodeRef),
    PipeRead(Arc<Pipe>),
    PipeWrite(Arc<Pipe>),
    Char(CharDevId),
    /// Registered by an upper layer (sockets): `(class, handle)`.
    External { class: u8, handle: u32 },
}

/// One entry of the system open-file table.
pub struct OpenFile {
    pub backing: FileBacking,
    pub flags: OpenFlags,
    pub pos: u32,
    /// Descriptors (across all processes) referring to this entry.
    pub refcount: u32,
}

/// Vtable for external descriptor classes.
#[derive(Clone, Copy)]
pub struct ExternalOps {
    pub read: fn(handle: u32, buf: &mut [u8], nonblock: bool) -> VfsResult<usize>,
    pub write: fn(handle: u32, buf: &[u8], nonblock: bool) -> VfsResult<usize>,
    pub close: fn(handle: u32),
    /// `true` if a read would not block.
    pub poll_readable: fn(handle: u32) -> bool,
}

const MAX_EXTERNAL_CLASSES: usize = 4;

struct Tables {
    files: [Option<OpenFile>; MAX_SYSTEM_FILES],
    /// Per-process descriptor tables, keyed by pid slot.
    fds: [Option<FdTable>; MAX_PROCESSES],
    external: [Option<ExternalOps>; MAX_EXTERNAL_CLASSES],
}

struct FdTable {
    pid: u32,
    /// Index into `files`, per descriptor; `cloexec` tracked per fd.
    entries: [Option<(u16, bool)>; MAX_OPEN_FILES],
}

static TABLES: IrqMutex<Tables> = IrqMutex::new(Tables {
    files: [const { None }; MAX_SYSTEM_FILES],
    fds: [const { None }; MAX_PROCESSES],
    external: [None; MAX_EXTERNAL_CLASSES],
});

/// Register an external descriptor class; returns its class id.
pub fn register_external_class(ops: ExternalOps) -> VfsResult<u8> {
    let mut tables = TABLES.lock();
    for (i, slot) in tables.external.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(ops);
            return Ok(i as u8);
        }
    }
    Err(VfsError::NoSpace)
}

fn external_ops(tables: &Tables, class: u8) -> VfsResult<ExternalOps> {
    tables
        .external
        .get(class as usize)
        .and_then(|o| *o)
        .ok_or(VfsError::Invalid)
}

// =============================================================================
// Descriptor table lifecycle
// =============================================================================

fn fd_slot<'a>(tables: &'a mut Tables, pid: u32) -> VfsResult<&'a mut FdTable> {
    tables
        .fds
        .iter_mut()
        .flatten()
        .find(|t| t.pid == pid)
        .ok_or(VfsError::Invalid)
}

/// Create an empty descriptor table for a new process.
pub fn fd_table_create(pid: u32) -> VfsResult<()> {
    let mut tables = TABLES.lock();
    if tables.fds.iter().flatten().any(|t| t.pid == pid) {
        return Err(VfsError::Exists);
    }
    let slot = tables
        .fds
        .iter_mut()
        .find(|t| t.is_none())
        .ok_or(VfsError::NoSpace)?;
    *slot = Some(FdTable {
        pid,
        entries: [None; MAX_OPEN_FILES],
    });
    Ok(())
}

/// Duplicate `parent`'s table into a fresh table for `child` (fork): every
/// open file gains a reference; cursors stay shared.
pub fn fd_table_clone(parent: u32, child: u32) -> VfsResult<()> {
    fd_table_create(child)?;
    let mut tables = TABLES.lock();
    let parent_entries = fd_slot(&mut tables, parent)?.entries;
    for (file_index, _) in parent_entries.iter().flatten() {
        if let Some(file) = tables.files[*file_index as usize].as_mut() {
            file.refcount += 1;
        }
    }
    fd_slot(&mut tables, child)?.entries = parent_entries;
    Ok(())
}

/// Close every descriptor of `pid` and drop its table (exit).
pub fn fd_table_destroy(pid: u32) {
    let mut doomed: [Option<Disposal>; MAX_OPEN_FILES] = [const { None }; MAX_OPEN_FILES];
    {
        let mut tables = TABLES.lock();
        let Ok(table) = fd_slot(&mut tables, pid) else {
            return;
        };
        let entries = table.entries;
        table.entries = [None; MAX_OPEN_FILES];
        for (i, (file_index, _)) in entries.iter().flatten().enumerate() {
            doomed[i] = release_file(&mut tables, *file_index);
        }
        for slot in tables.fds.iter_mut() {
            if slot.as_ref().is_some_and(|t| t.pid == pid) {
                *slot = None;
            }
        }
    }
    for disposal in doomed.into_iter().flatten() {
        dispose(disposal);
    }
}

/// Close close-on-exec descriptors (exec).
pub fn fd_table_close_cloexec(pid: u32) {
    let mut doomed: [Option<Disposal>; MAX_OPEN_FILES] = [const { None }; MAX_OPEN_FILES];
    {
        let mut tables = TABLES.lock();
        let Ok(table) = fd_slot(&mut tables, pid) else {
            return;
        };
        let mut to_release = [None; MAX_OPEN_FILES];
        for (fd, entry) in table.entries.iter_mut().enumerate() {
            if let Some((file_index, true)) = entry {
                to_release[fd] = Some(*file_index);
                *entry = None;
            }
        }
        for (i, file_index) in to_release.iter().flatten().enumerate() {
            doomed[i] = release_file(&mut tables, *file_index);
        }
    }
    for disposal in doomed.into_iter().flatten() {
        dispose(disposal);
    }
}

/// Deferred backing teardown: produced under the table lock, performed
/// after it is dropped (releasing a vnode or a pipe end can block on
/// filesystem locks, which a spinlock holder must never do).
struct Disposal {
    backing: FileBacking,
    external: Option<(ExternalOps, u32)>,
}

/// Drop one reference on a system file entry. At zero the entry leaves
/// the table and its backing comes back as a [`Disposal`] for the caller
/// to run outside the lock.
fn release_file(tables: &mut Tables, file_index: u16) -> Option<Disposal> {
    let file = tables.files[file_index as usize].as_mut()?;
    file.refcount -= 1;
    if file.refcount > 0 {
        return None;
    }
    let file = tables.files[file_index as usize].take()?;
    let external = match &file.backing {
        FileBacking::External { class, handle } => {
            external_ops(tables, *class).ok().map(|ops| (ops, *handle))
        }
        _ => None,
    };
    Some(Disposal {
        backing: file.backing,
        external,
    })
}

fn dispose(disposal: Disposal) {
    match disposal.backing {
        FileBacking::Vnode(vnode) => vnode_put(vnode),
        FileBacking::PipeRead(pipe) => pipe.drop_reader(),
        FileBacking::PipeWrite(pipe) => pipe.drop_writer(),
        FileBacking::Char(dev) => {
            if let Ok(device) = chardev::char_device(dev) {
                let _ = device.close();
            }
        }
        FileBacking::External { .. } => {
            if let Some((ops, handle)) = disposal.external {
                (ops.close)(handle);
            }
        }
    }
}

// =============================================================================
// Descriptor operations
// =============================================================================

fn install_fd(
    tables: &mut Tables,
    pid: u32,
    backing: FileBacking,
    flags: OpenFlags,
) -> VfsResult<usize> {
    let file_index = tables
        .files
        .iter()
        .position(|f| f.is_none())
        .ok_or(VfsError::TooManyFiles)? as u16;

    let table = fd_slot(tables, pid)?;
    let fd = table
        .entries
        .iter()
        .position(|e| e.is_none())
        .ok_or(VfsError::TooManyFiles)?;
    table.entries[fd] = Some((file_index, flags.contains(OpenFlags::CLOEXEC)));

    tables.files[file_index as usize] = Some(OpenFile {
        backing,
        flags,
        pos: 0,
        refcount: 1,
    });
    Ok(fd)
}

/// Install an already-resolved vnode as a new descriptor (open).
pub fn file_open_vnode(pid: u32, vnode: VnodeRef, flags: OpenFlags) -> VfsResult<usize> {
    let mut tables = TABLES.lock();
    let mut pos = 0;
    if flags.contains(OpenFlags::APPEND) {
        pos = vnode.fs.stat(vnode.ino).map(|s| s.size).unwrap_or(0);
    }
    let fd = install_fd(&mut tables, pid, FileBacking::Vnode(vnode), flags)?;
    if pos != 0 {
        if let Some((file_index, _)) = fd_slot(&mut tables, pid)?.entries[fd] {
            if let Some(file) = tables.files[file_index as usize].as_mut() {
                file.pos = pos;
            }
        }
    }
    Ok(fd)
}

/// Install a character device descriptor.
pub fn file_open_char(pid: u32, dev: CharDevId, flags: OpenFlags) -> VfsResult<usize> {
    chardev::char_device(dev)?.open()?;
    let mut tables = TABLES.lock();
    install_fd(&mut tables, pid, FileBacking::Char(dev), flags)
}

/// Install an external (socket) descriptor.
pub fn file_open_external(pid: u32, class: u8, handle: u32, flags: OpenFlags) -> VfsResult<usize> {
    let mut tables = TABLES.lock();
    external_ops(&tables, class)?;
    install_fd(&mut tables, pid, FileBacking::External { class, handle }, flags)
}

/// Create a pipe; returns `(read_fd, write_fd)`.
pub fn file_open_pipe(pid: u32) -> VfsResult<(usize, usize)> {
    let pipe = Pipe::new();
    let mut tables = TABLES.lock();
    let read_fd = install_fd(
        &mut tables,
        pid,
        FileBacking::PipeRead(pipe.clone()),
        OpenFlags::RDONLY,
    )?;
    let write_fd = match install_fd(
        &mut tables,
        pid,
        FileBacking::PipeWrite(pipe.clone()),
        OpenFlags::WRONLY,
    ) {
        Ok(fd) => fd,
        Err(e) => {
            // Roll the read end back.
            let taken = fd_slot(&mut tables, pid)
                .ok()
                .and_then(|t| t.entries[read_fd].take());
            let disposal = taken.and_then(|(file_index, _)| release_file(&mut tables, file_index));
            drop(tables);
            if let Some(disposal) = disposal {
                dispose(disposal);
            }
            return Err(e);
        }
    };
    Ok((read_fd, write_fd))
}

fn file_index_of(tables: &mut Tables, pid: u32, fd: usize) -> VfsResult<u16> {
    let table = fd_slot(tables, pid)?;
    if fd >= MAX_OPEN_FILES {
        return Err(VfsError::BadDescriptor);
    }
    table.entries[fd]
        .map(|(i, _)| i)
        .ok_or(VfsError::BadDescriptor)
}

/// Close one descriptor.
pub fn file_close(pid: u32, fd: usize) -> VfsResult<()> {
    let disposal = {
        let mut tables = TABLES.lock();
        let table = fd_slot(&mut tables, pid)?;
        if fd >= MAX_OPEN_FILES {
            return Err(VfsError::BadDescriptor);
        }
        let (file_index, _) = table.entries[fd].take().ok_or(VfsError::BadDescriptor)?;
        release_file(&mut tables, file_index)
    };
    if let Some(disposal) = disposal {
        dispose(disposal);
    }
    Ok(())
}

/// Duplicate `fd` into the lowest free descriptor.
pub fn file_dup(pid: u32, fd: usize) -> VfsResult<usize> {
    let mut tables = TABLES.lock();
    let file_index = file_index_of(&mut tables, pid, fd)?;
    let table = fd_slot(&mut tables, pid)?;
    let new_fd = table
        .entries
        .iter()
        .position(|e| e.is_none())
        .ok_or(VfsError::TooManyFiles)?;
    table.entries[new_fd] = Some((file_index, false));
    if let Some(file) = tables.files[file_index as usize].as_mut() {
        file.refcount += 1;
    }
    Ok(new_fd)
}

/// Duplicate `fd` onto `new_fd`, closing what was there.
pub fn file_dup2(pid: u32, fd: usize, new_fd: usize) -> VfsResult<usize> {
    if new_fd >= MAX_OPEN_FILES {
        return Err(VfsError::BadDescriptor);
    }
    if fd == new_fd {
        let mut tables = TABLES.lock();
        file_index_of(&mut tables, pid, fd)?;
        return Ok(new_fd);
    }
    let disposal = {
        let mut tables = TABLES.lock();
        let file_index = file_index_of(&mut tables, pid, fd)?;
        let table = fd_slot(&mut tables, pid)?;
        let old = table.entries[new_fd].take();
        table.entries[new_fd] = Some((file_index, false));
        if let Some(file) = tables.files[file_index as usize].as_mut() {
            file.refcount += 1;
        }
        old.and_then(|(old_index, _)| release_file(&mut tables, old_index))
    };
    if let Some(disposal) = disposal {
        dispose(disposal);
    }
    Ok(new_fd)
}

/// Run `f` with the open file behind `(pid, fd)`; used by the syscall
/// layer for stat/isatty/ioctl style queries.
pub fn with_file<R>(
    pid: u32,
    fd: usize,
    f: impl FnOnce(&mut OpenFile) -> VfsResult<R>,
) -> VfsResult<R> {
    let mut tables = TABLES.lock();
    let file_index = file_index_of(&mut tables, pid, fd)?;
    let file = tables.files[file_index as usize]
        .as_mut()
        .ok_or(VfsError::BadDescriptor)?;
    f(file)
}

/// Snapshot of an open file's backing for blocking I/O: the table lock
/// must not be held while a pipe or device sleeps.
enum IoTarget {
    Vnode(VnodeRef, u32, OpenFlags),
    PipeRead(Arc<Pipe>, bool),
    PipeWrite(Arc<Pipe>, bool),
    Char(CharDevId),
    External(ExternalOps, u32, bool),
}

fn io_target(pid: u32, fd: usize, write: bool) -> VfsResult<IoTarget> {
    let mut tables = TABLES.lock();
    let file_index = file_index_of(&mut tables, pid, fd)?;
    let file = tables.files[file_index as usize]
        .as_ref()
        .ok_or(VfsError::BadDescriptor)?;
    if write && !file.flags.writable() {
        return Err(VfsError::BadDescriptor);
    }
    if !write && !file.flags.readable() {
        return Err(VfsError::BadDescriptor);
    }
    let nonblock = file.flags.contains(OpenFlags::NONBLOCK);
    Ok(match &file.backing {
        FileBacking::Vnode(vnode) => IoTarget::Vnode(vnode_ref(vnode), file.pos, file.flags),
        FileBacking::PipeRead(pipe) => IoTarget::PipeRead(pipe.clone(), nonblock),
        FileBacking::PipeWrite(pipe) => IoTarget::PipeWrite(pipe.clone(), nonblock),
        FileBacking::Char(dev) => IoTarget::Char(*dev),
        FileBacking::External { class, handle } => {
            IoTarget::External(external_ops(&tables, *class)?, *handle, nonblock)
        }
    })
}

fn advance_pos(pid: u32, fd: usize, delta: u32) {
    let mut tables = TABLES.lock();
    if let Ok(file_index) = file_index_of(&mut tables, pid, fd) {
        if let Some(file) = tables.files[file_index as usize].as_mut() {
            file.pos = file.pos.wrapping_add(delta);
        }
    }
}

/// Read from a descriptor, honoring the shared cursor.
pub fn file_read(pid: u32, fd: usize, buf: &mut [u8]) -> VfsResult<usize> {
    match io_target(pid, fd, false)? {
        IoTarget::Vnode(vnode, pos, _) => {
            vnode.data_lock.read_lock();
            let result = vnode.fs.read(vnode.ino, pos, buf);
            vnode.data_lock.read_unlock();
            vnode_put(vnode);
            let n = result?;
            advance_pos(pid, fd, n as u32);
            Ok(n)
        }
        IoTarget::PipeRead(pipe, nonblock) => {
            if nonblock {
                pipe.read_nonblock(buf)
            } else {
                pipe.read(buf)
            }
        }
        IoTarget::PipeWrite(..) => Err(VfsError::BadDescriptor),
        IoTarget::Char(dev) => chardev::char_device(dev)?.read(buf),
        IoTarget::External(ops, handle, nonblock) => (ops.read)(handle, buf, nonblock),
    }
}

/// Write to a descriptor, honoring the shared cursor and `O_APPEND`.
pub fn file_write(pid: u32, fd: usize, buf: &[u8]) -> VfsResult<usize> {
    match io_target(pid, fd, true)? {
        IoTarget::Vnode(vnode, pos, flags) => {
            vnode.data_lock.write_lock();
            let pos = if flags.contains(OpenFlags::APPEND) {
                vnode.fs.stat(vnode.ino).map(|s| s.size).unwrap_or(pos)
            } else {
                pos
            };
            let result = vnode.fs.write(vnode.ino, pos, buf);
            vnode.data_lock.write_unlock();
            vnode_put(vnode);
            let n = result?;
            advance_pos(pid, fd, n as u32);
            Ok(n)
        }
        IoTarget::PipeRead(..) => Err(VfsError::BadDescriptor),
        IoTarget::PipeWrite(pipe, nonblock) => {
            if nonblock {
                pipe.write_nonblock(buf)
            } else {
                pipe.write(buf)
            }
        }
        IoTarget::Char(dev) => chardev::char_device(dev)?.write(buf),
        IoTarget::External(ops, handle, nonblock) => (ops.write)(handle, buf, nonblock),
    }
}

/// Reposition the shared cursor.
pub fn file_lseek(pid: u32, fd: usize, offset: i32, whence: u32) -> VfsResult<u32> {
    with_file(pid, fd, |file| {
        let size = match &file.backing {
            FileBacking::Vnode(vnode) => vnode.fs.stat(vnode.ino)?.size,
            _ => return Err(VfsError::Invalid), // pipes and devices do not seek
        };
        let base = match whence {
            SEEK_SET => 0i64,
            SEEK_CUR => file.pos as i64,
            SEEK_END => size as i64,
            _ => return Err(VfsError::Invalid),
        };
        let target = base + offset as i64;
        if target < 0 || target > u32::MAX as i64 {
            return Err(VfsError::Invalid);
        }
        file.pos = target as u32;
        Ok(file.pos)
    })
}

/// `true` if a read on `(pid, fd)` would not block (select support).
pub fn file_poll_readable(pid: u32, fd: usize) -> VfsResult<bool> {
    match io_target(pid, fd, false)? {
        IoTarget::Vnode(vnode, ..) => {
            vnode_put(vnode);
            Ok(true)
        }
        IoTarget::PipeRead(pipe, _) => {
            Ok(pipe.bytes_available() > 0 || pipe.write_side_closed())
        }
        IoTarget::PipeWrite(..) => Err(VfsError::BadDescriptor),
        IoTarget::Char(_) => Ok(true),
        IoTarget::External(ops, handle, _) => Ok((ops.poll_readable)(handle)),
    }
}

/// External handle behind a descriptor (socket syscalls resolve their own
/// descriptors through this).
pub fn file_external_handle(pid: u32, fd: usize, class: u8) -> VfsResult<u32> {
    with_file(pid, fd, |file| match file.backing {
        FileBacking::External { class: c, handle } if c == class => Ok(handle),
        _ => Err(VfsError::BadDescriptor),
    })
}
