//! Virtual addresses, ranges and paging modes.

use core::fmt;

use helix_numa::PAGE_SIZE;

use crate::error::{VmError, VmResult};

/// Largest supported virtual address space (one exabyte)
pub const MAX_VIRTUAL_ADDRESS: u64 = 1 << 60;

/// Huge page size (bytes)
pub const HUGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;

/// Base pages per huge page
pub const HUGE_PAGE_FRAMES: u64 = HUGE_PAGE_SIZE / PAGE_SIZE;

/// Virtual address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    /// Wrap a raw address
    #[inline(always)]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Raw value
    #[inline(always)]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Start of the containing page
    #[inline]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    /// Offset inside the page
    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Is this a page boundary?
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Start of the containing huge page
    #[inline]
    pub const fn huge_base(self) -> Self {
        Self(self.0 & !(HUGE_PAGE_SIZE - 1))
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Half-open, page-aligned virtual range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddrRange {
    start: VirtAddr,
    end: VirtAddr,
}

impl AddrRange {
    /// `[start, end)`; both ends page aligned, non-empty, within the address space
    pub fn new(start: u64, end: u64) -> VmResult<Self> {
        let (start, end) = (VirtAddr(start), VirtAddr(end));
        if start >= end || !start.is_page_aligned() || !end.is_page_aligned() || end.0 > MAX_VIRTUAL_ADDRESS {
            return Err(VmError::InvalidRange);
        }
        Ok(Self { start, end })
    }

    /// `len` bytes from `start`
    pub fn from_len(start: u64, len: u64) -> VmResult<Self> {
        let end = start.checked_add(len).ok_or(VmError::InvalidRange)?;
        Self::new(start, end)
    }

    /// First byte
    #[inline(always)]
    pub const fn start(&self) -> VirtAddr {
        self.start
    }

    /// One past the last byte
    #[inline(always)]
    pub const fn end(&self) -> VirtAddr {
        self.end
    }

    /// Size in bytes
    #[inline]
    pub const fn len(&self) -> u64 {
        self.end.0 - self.start.0
    }

    /// Never true for a constructed range
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size in base pages
    #[inline]
    pub const fn pages(&self) -> u64 {
        self.len() / PAGE_SIZE
    }

    /// Does the range contain `addr`?
    #[inline]
    pub const fn contains(&self, addr: VirtAddr) -> bool {
        addr.0 >= self.start.0 && addr.0 < self.end.0
    }

    /// Do the ranges share any byte?
    #[inline]
    pub const fn overlaps(&self, other: &AddrRange) -> bool {
        self.start.0 < other.end.0 && other.start.0 < self.end.0
    }
}

impl fmt::Display for AddrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Page-table depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PagingMode {
    /// 4 levels, 48-bit addresses
    #[default]
    FourLevel,
    /// 5 levels, 57-bit addresses
    FiveLevel,
    /// 6 levels, 64-bit addresses
    SixLevel,
}

impl PagingMode {
    /// Translation levels
    pub const fn levels(self) -> u32 {
        match self {
            Self::FourLevel => 4,
            Self::FiveLevel => 5,
            Self::SixLevel => 6,
        }
    }

    /// Virtual address bits
    pub const fn address_bits(self) -> u32 {
        match self {
            Self::FourLevel => 48,
            Self::FiveLevel => 57,
            Self::SixLevel => 64,
        }
    }

    /// Highest address (exclusive) the mode can translate
    pub const fn limit(self) -> u128 {
        1u128 << self.address_bits()
    }

    /// Shallowest mode able to translate up to `end` (exclusive)
    pub fn for_end(end: VirtAddr) -> Self {
        let end = end.0 as u128;
        if end <= Self::FourLevel.limit() {
            Self::FourLevel
        } else if end <= Self::FiveLevel.limit() {
            Self::FiveLevel
        } else {
            Self::SixLevel
        }
    }
}

impl fmt::Display for PagingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-level", self.levels())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_validation() {
        assert!(AddrRange::new(0x1000, 0x1000).is_err());
        assert!(AddrRange::new(0x1001, 0x2000).is_err());
        assert!(AddrRange::new(0, MAX_VIRTUAL_ADDRESS + PAGE_SIZE).is_err());
        assert!(AddrRange::from_len(u64::MAX - 0xfff, 0x2000).is_err());
        let r = AddrRange::new(0x1000, 0x5000).unwrap();
        assert_eq!(r.pages(), 4);
        assert!(r.contains(VirtAddr(0x4fff)));
        assert!(!r.contains(VirtAddr(0x5000)));
    }

    #[test]
    fn test_overlap_is_half_open() {
        let a = AddrRange::new(0x1000, 0x3000).unwrap();
        let b = AddrRange::new(0x3000, 0x4000).unwrap();
        let c = AddrRange::new(0x2000, 0x4000).unwrap();
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
    }

    #[test]
    fn test_mode_selection() {
        assert_eq!(PagingMode::for_end(VirtAddr(1 << 40)), PagingMode::FourLevel);
        assert_eq!(PagingMode::for_end(VirtAddr(1 << 48)), PagingMode::FourLevel);
        assert_eq!(PagingMode::for_end(VirtAddr((1 << 48) + PAGE_SIZE)), PagingMode::FiveLevel);
        assert_eq!(PagingMode::for_end(VirtAddr(MAX_VIRTUAL_ADDRESS)), PagingMode::SixLevel);
    }

    #[test]
    fn test_address_helpers() {
        let a = VirtAddr(0x20_1234);
        assert_eq!(a.page_base(), VirtAddr(0x20_1000));
        assert_eq!(a.page_offset(), 0x234);
        assert_eq!(a.huge_base(), VirtAddr(0x20_0000));
    }
}
