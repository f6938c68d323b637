//! Virtual memory errors.

use core::fmt;

use crate::addr::VirtAddr;
use crate::vma::{Access, VmaId};

/// Result type for virtual memory operations
pub type VmResult<T> = Result<T, VmError>;

/// Virtual memory error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Range overlaps an existing mapping
    AddressConflict {
        /// The mapping in the way
        existing: VmaId,
    },
    /// Contradictory or unsupported permission flags
    InvalidFlags(&'static str),
    /// Range is empty, unaligned or beyond the address space
    InvalidRange,
    /// No mapping covers the address
    NotMapped(VirtAddr),
    /// Mapping forbids the access
    PermissionDenied {
        /// Faulting address
        addr: VirtAddr,
        /// Attempted access
        access: Access,
    },
    /// Unknown mapping id
    UnknownVma(VmaId),
    /// No frame available even after pressure relief
    OutOfMemory,
    /// Allocations are denied until pressure clears
    AllocationDenied,
    /// Mapping would exceed the commit limit
    CommitLimit {
        /// Pages requested
        requested: u64,
        /// Pages still committable
        available: u64,
    },
    /// Stored page content failed verification
    Corrupted(VirtAddr),
    /// Swap area is full
    SwapFull,
    /// Configuration rejected
    InvalidConfig(&'static str),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddressConflict { existing } => write!(f, "range overlaps mapping {}", existing),
            Self::InvalidFlags(msg) => write!(f, "invalid mapping flags: {}", msg),
            Self::InvalidRange => write!(f, "invalid address range"),
            Self::NotMapped(addr) => write!(f, "{} is not mapped", addr),
            Self::PermissionDenied { addr, access } => write!(f, "{:?} access to {} denied", access, addr),
            Self::UnknownVma(id) => write!(f, "unknown mapping {}", id),
            Self::OutOfMemory => write!(f, "out of physical memory"),
            Self::AllocationDenied => write!(f, "allocations denied under memory pressure"),
            Self::CommitLimit { requested, available } => write!(
                f,
                "commit limit: {} pages requested, {} available",
                requested, available
            ),
            Self::Corrupted(addr) => write!(f, "page content at {} failed verification", addr),
            Self::SwapFull => write!(f, "swap area full"),
            Self::InvalidConfig(msg) => write!(f, "invalid VM config: {}", msg),
        }
    }
}
