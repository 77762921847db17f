//! Memory management error type.

use core::fmt;

use cinder_abi::error::KernelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    /// No physical frame available.
    NoMemory,
    /// Address not mapped where a mapping was required.
    NotMapped { address: u32 },
    /// Mapping target already present.
    AlreadyMapped { address: u32 },
    /// Address outside the range valid for the operation.
    InvalidAddress { address: u32 },
    /// A user buffer touches an unmapped or privileged page.
    BadAddress,
    /// Kernel stack arena has no free slot.
    NoStack,
    /// Mis-aligned address where page alignment is required.
    NotAligned { address: u32 },
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMemory => write!(f, "out of physical memory"),
            Self::NotMapped { address } => write!(f, "address {:#x} not mapped", address),
            Self::AlreadyMapped { address } => write!(f, "address {:#x} already mapped", address),
            Self::InvalidAddress { address } => write!(f, "invalid address {:#x}", address),
            Self::BadAddress => write!(f, "bad user buffer"),
            Self::NoStack => write!(f, "kernel stack arena exhausted"),
            Self::NotAligned { address } => write!(f, "address {:#x} not page aligned", address),
        }
    }
}

impl From<MmError> for KernelError {
    fn from(e: MmError) -> Self {
        match e {
            MmError::NoMemory => KernelError::NoMemory,
            MmError::BadAddress => KernelError::BadAddress,
            MmError::NoStack => KernelError::NoStack,
            MmError::NotMapped { .. }
            | MmError::AlreadyMapped { .. }
            | MmError::InvalidAddress { .. }
            | MmError::NotAligned { .. } => KernelError::Invalid,
        }
    }
}

pub type MmResult<T = ()> = Result<T, MmError>;
