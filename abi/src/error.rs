//! Unified kernel error kinds and their errno mapping.
//!
//! Subsystems keep their own error enums (`MmError`, `VfsError`, `NetError`)
//! close to the code that produces them; everything converges on
//! [`KernelError`] before crossing the syscall boundary, where it becomes a
//! negative errno in the return register.

use core::fmt;

/// Every error kind the kernel core surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    NotFound,
    Exists,
    Busy,
    NoMemory,
    IoError,
    Invalid,
    BadDescriptor,
    NotDirectory,
    IsDirectory,
    NotEmpty,
    CrossDevice,
    Permission,
    Interrupted,
    WouldBlock,
    TimedOut,
    MessageTooBig,
    AddressInUse,
    AddressUnreachable,
    NotConnected,
    AlreadyConnected,
    ConnectionReset,
    ConnectionRefused,
    PipeClosed,
    BadAddress,
    NoStack,
    NoSpace,
    NameTooLong,
    NoChild,
    NotSupported,
    TooManyFiles,
    TooManyProcesses,
}

/// Result alias used throughout the core.
pub type KernelResult<T = ()> = Result<T, KernelError>;

impl KernelError {
    /// The errno value returned (negated) at the syscall boundary.
    pub const fn errno(self) -> i32 {
        match self {
            Self::Permission => 1,       // EPERM
            Self::NotFound => 2,         // ENOENT
            Self::Interrupted => 4,      // EINTR
            Self::IoError => 5,          // EIO
            Self::BadDescriptor => 9,    // EBADF
            Self::NoChild => 10,         // ECHILD
            Self::WouldBlock => 11,      // EAGAIN
            Self::NoMemory => 12,        // ENOMEM
            Self::BadAddress => 14,      // EFAULT
            Self::NoStack => 12,         // ENOMEM, same as NoMemory
            Self::Busy => 16,            // EBUSY
            Self::Exists => 17,          // EEXIST
            Self::CrossDevice => 18,     // EXDEV
            Self::NotDirectory => 20,    // ENOTDIR
            Self::IsDirectory => 21,     // EISDIR
            Self::Invalid => 22,         // EINVAL
            Self::TooManyFiles => 24,    // EMFILE
            Self::NoSpace => 28,         // ENOSPC
            Self::PipeClosed => 32,      // EPIPE
            Self::NameTooLong => 36,     // ENAMETOOLONG
            Self::NotEmpty => 39,        // ENOTEMPTY
            Self::NotSupported => 95,    // EOPNOTSUPP
            Self::AddressInUse => 98,    // EADDRINUSE
            Self::AddressUnreachable => 101, // ENETUNREACH
            Self::ConnectionReset => 104, // ECONNRESET
            Self::MessageTooBig => 90,   // EMSGSIZE
            Self::NotConnected => 107,   // ENOTCONN
            Self::AlreadyConnected => 106, // EISCONN
            Self::TimedOut => 110,       // ETIMEDOUT
            Self::ConnectionRefused => 111, // ECONNREFUSED
            Self::TooManyProcesses => 11, // EAGAIN, same as WouldBlock
        }
    }

    /// Encode as the negative syscall return value.
    #[inline]
    pub const fn to_syscall_ret(self) -> i32 {
        -self.errno()
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::NotFound => "no such file or directory",
            Self::Exists => "already exists",
            Self::Busy => "resource busy",
            Self::NoMemory => "out of memory",
            Self::IoError => "I/O error",
            Self::Invalid => "invalid argument",
            Self::BadDescriptor => "bad file descriptor",
            Self::NotDirectory => "not a directory",
            Self::IsDirectory => "is a directory",
            Self::NotEmpty => "directory not empty",
            Self::CrossDevice => "cross-device link",
            Self::Permission => "permission denied",
            Self::Interrupted => "interrupted",
            Self::WouldBlock => "operation would block",
            Self::TimedOut => "timed out",
            Self::MessageTooBig => "message too big",
            Self::AddressInUse => "address in use",
            Self::AddressUnreachable => "address unreachable",
            Self::NotConnected => "not connected",
            Self::AlreadyConnected => "already connected",
            Self::ConnectionReset => "connection reset",
            Self::ConnectionRefused => "connection refused",
            Self::PipeClosed => "pipe closed",
            Self::BadAddress => "bad address",
            Self::NoStack => "kernel stack arena exhausted",
            Self::NoSpace => "no space left on device",
            Self::NameTooLong => "name too long",
            Self::NoChild => "no child processes",
            Self::NotSupported => "operation not supported",
            Self::TooManyFiles => "too many open files",
            Self::TooManyProcesses => "process table full",
        };
        f.write_str(msg)
    }
}

/// Convert a `KernelResult<usize>`-style outcome into the i32 a syscall
/// returns: the value on success, `-errno` on failure.
#[inline]
pub fn syscall_ret(res: KernelResult<usize>) -> i32 {
    match res {
        Ok(v) => v as i32,
        Err(e) => e.to_syscall_ret(),
    }
}
