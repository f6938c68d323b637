//! Virtual memory areas.

use alloc::collections::BTreeMap;
use core::fmt;

use bitflags::bitflags;
use helix_numa::{PageRange, PAGE_SIZE};

use crate::addr::{AddrRange, VirtAddr, HUGE_PAGE_SIZE};
use crate::compress::CompressedPage;
use crate::error::{VmError, VmResult};
use crate::swap::SwapSlot;

/// Mapping identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmaId(pub u64);

impl fmt::Display for VmaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vma{}", self.0)
    }
}

bitflags! {
    /// Mapping permissions and hints
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VmaFlags: u32 {
        /// Readable
        const READ = 1 << 0;
        /// Writable
        const WRITE = 1 << 1;
        /// Executable
        const EXEC = 1 << 2;
        /// Shared with other address spaces (not commit-charged)
        const SHARED = 1 << 3;
        /// Huge pages welcome
        const HUGE = 1 << 4;
        /// Never use huge pages
        const NO_HUGE = 1 << 5;
        /// Excluded from compression, deduplication and swap
        const LOCKED = 1 << 6;
    }
}

impl VmaFlags {
    /// Read and write
    pub const RW: Self = Self::READ.union(Self::WRITE);

    /// Reject contradictory combinations
    pub fn validate(self, write_implies_read: bool) -> VmResult<()> {
        if write_implies_read && self.contains(Self::WRITE) && !self.contains(Self::READ) {
            return Err(VmError::InvalidFlags("write without read"));
        }
        if self.contains(Self::HUGE | Self::NO_HUGE) {
            return Err(VmError::InvalidFlags("huge and no-huge both set"));
        }
        Ok(())
    }
}

/// What backs a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backing {
    /// Zero-filled on demand
    Anonymous,
    /// Backed by an external file object
    File {
        /// Opaque file handle owned by the caller
        file: u64,
        /// Byte offset of the mapping start
        offset: u64,
    },
}

impl Backing {
    /// Anonymous?
    #[inline]
    pub const fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }
}

/// Kind of access that faulted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    /// Load
    Read,
    /// Store
    Write,
    /// Instruction fetch
    Execute,
}

impl Access {
    /// Do the flags allow this access?
    pub const fn permitted_by(self, flags: VmaFlags) -> bool {
        match self {
            Self::Read => flags.contains(VmaFlags::READ),
            Self::Write => flags.contains(VmaFlags::WRITE),
            Self::Execute => flags.contains(VmaFlags::EXEC),
        }
    }
}

/// Whether a mapping's pages are held compressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionState {
    /// No compressed pages
    #[default]
    Uncompressed,
    /// Some pages compressed
    Partial,
    /// Every materialised page compressed
    Compressed,
}

/// Where one page's content lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PageState {
    Resident(u64),
    Compressed(CompressedPage),
    Swapped(SwapSlot),
}

#[derive(Debug, Clone)]
pub(crate) struct Page {
    pub state: PageState,
    /// Accesses since the last background pass
    pub accesses: u32,
    pub last_access_ns: u64,
}

impl Page {
    pub fn resident(pfn: u64, now_ns: u64) -> Self {
        Self {
            state: PageState::Resident(pfn),
            accesses: 0,
            last_access_ns: now_ns,
        }
    }

    pub fn pfn(&self) -> Option<u64> {
        match self.state {
            PageState::Resident(pfn) => Some(pfn),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Vma {
    pub id: VmaId,
    pub range: AddrRange,
    pub flags: VmaFlags,
    pub backing: Backing,
    pub huge_eligible: bool,
    /// Pages charged against the commit limit
    pub committed: u64,
    pub accesses: u64,
    pub last_access_ns: u64,
    /// Materialised pages by virtual page number
    pub pages: BTreeMap<u64, Page>,
    /// Promoted windows by virtual huge-page number
    pub huge: BTreeMap<u64, PageRange>,
}

impl Vma {
    pub fn vpn(addr: VirtAddr) -> u64 {
        addr.0 / PAGE_SIZE
    }

    pub fn huge_window(vpn: u64) -> u64 {
        vpn * PAGE_SIZE / HUGE_PAGE_SIZE
    }

    pub fn in_huge_window(&self, vpn: u64) -> bool {
        self.huge.contains_key(&Self::huge_window(vpn))
    }

    /// Excluded from compression, deduplication and swap
    pub fn pinned(&self) -> bool {
        self.flags.contains(VmaFlags::LOCKED)
    }

    pub fn info(&self) -> VmaInfo {
        let mut info = VmaInfo {
            id: self.id,
            range: self.range,
            flags: self.flags,
            backing: self.backing,
            huge_eligible: self.huge_eligible,
            resident_pages: 0,
            compressed_pages: 0,
            swapped_pages: 0,
            huge_pages: self.huge.len() as u64,
            compression: CompressionState::Uncompressed,
            accesses: self.accesses,
            last_access_ns: self.last_access_ns,
        };
        for page in self.pages.values() {
            match page.state {
                PageState::Resident(_) => info.resident_pages += 1,
                PageState::Compressed(_) => info.compressed_pages += 1,
                PageState::Swapped(_) => info.swapped_pages += 1,
            }
        }
        info.compression = match info.compressed_pages {
            0 => CompressionState::Uncompressed,
            n if n == self.pages.len() as u64 => CompressionState::Compressed,
            _ => CompressionState::Partial,
        };
        info
    }
}

/// Read-only view of a mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmaInfo {
    /// Mapping id
    pub id: VmaId,
    /// Virtual range
    pub range: AddrRange,
    /// Permissions and hints
    pub flags: VmaFlags,
    /// Backing object
    pub backing: Backing,
    /// May be promoted to huge pages
    pub huge_eligible: bool,
    /// Pages in frames
    pub resident_pages: u64,
    /// Pages held compressed
    pub compressed_pages: u64,
    /// Pages in swap
    pub swapped_pages: u64,
    /// Promoted huge pages
    pub huge_pages: u64,
    /// Compression state
    pub compression: CompressionState,
    /// Faults and accesses seen
    pub accesses: u64,
    /// Last access (ns)
    pub last_access_ns: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_validation() {
        assert!(VmaFlags::RW.validate(true).is_ok());
        assert_eq!(
            VmaFlags::WRITE.validate(true),
            Err(VmError::InvalidFlags("write without read"))
        );
        assert!(VmaFlags::WRITE.validate(false).is_ok());
        assert!((VmaFlags::READ | VmaFlags::HUGE | VmaFlags::NO_HUGE).validate(true).is_err());
    }

    #[test]
    fn test_access_permission() {
        assert!(Access::Read.permitted_by(VmaFlags::READ));
        assert!(!Access::Write.permitted_by(VmaFlags::READ));
        assert!(Access::Execute.permitted_by(VmaFlags::READ | VmaFlags::EXEC));
    }
}
