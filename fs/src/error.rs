//! Filesystem error type.

use core::fmt;

use cinder_abi::error::KernelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfsError {
    NotFound,
    Exists,
    Busy,
    IoError,
    Invalid,
    BadDescriptor,
    NotDirectory,
    IsDirectory,
    NotEmpty,
    CrossDevice,
    Permission,
    ReadOnly,
    NoSpace,
    NameTooLong,
    NotSupported,
    PipeClosed,
    Interrupted,
    WouldBlock,
    TooManyFiles,
}

impl fmt::Display for VfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::NotFound => "not found",
            Self::Exists => "already exists",
            Self::Busy => "busy",
            Self::IoError => "I/O error",
            Self::Invalid => "invalid argument",
            Self::BadDescriptor => "bad file descriptor",
            Self::NotDirectory => "not a directory",
            Self::IsDirectory => "is a directory",
            Self::NotEmpty => "directory not empty",
            Self::CrossDevice => "cross-device link",
            Self::Permission => "permission denied",
            Self::ReadOnly => "read-only filesystem",
            Self::NoSpace => "no space left",
            Self::NameTooLong => "name too long",
            Self::NotSupported => "not supported",
            Self::PipeClosed => "pipe closed",
            Self::Interrupted => "interrupted",
            Self::WouldBlock => "would block",
            Self::TooManyFiles => "too many open files",
        };
        f.write_str(msg)
    }
}

impl From<VfsError> for KernelError {
    fn from(e: VfsError) -> Self {
        match e {
            VfsError::NotFound => KernelError::NotFound,
            VfsError::Exists => KernelError::Exists,
            VfsError::Busy => KernelError::Busy,
            VfsError::IoError => KernelError::IoError,
            VfsError::Invalid => KernelError::Invalid,
            VfsError::BadDescriptor => KernelError::BadDescriptor,
            VfsError::NotDirectory => KernelError::NotDirectory,
            VfsError::IsDirectory => KernelError::IsDirectory,
            VfsError::NotEmpty => KernelError::NotEmpty,
            VfsError::CrossDevice => KernelError::CrossDevice,
            VfsError::Permission | VfsError::ReadOnly => KernelError::Permission,
            VfsError::NoSpace => KernelError::NoSpace,
            VfsError::NameTooLong => KernelError::NameTooLong,
            VfsError::NotSupported => KernelError::NotSupported,
            VfsError::PipeClosed => KernelError::PipeClosed,
            VfsError::Interrupted => KernelError::Interrupted,
            VfsError::WouldBlock => KernelError::WouldBlock,
            VfsError::TooManyFiles => KernelError::TooManyFiles,
        }
    }
}

pub type VfsResult<T = ()> = Result<T, VfsError>;
