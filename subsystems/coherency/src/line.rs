//! Cache-line geometry and padding.
//!
//! Independently written fields must never share a line. Per-core counters
//! in the scheduler and the NUMA manager wrap every slot in [`CachePadded`].

use static_assertions::const_assert_eq;

/// Cache line size assumed for layout (bytes)
pub const CACHE_LINE_SIZE: usize = 64;

/// Address of the line containing `addr`
#[inline(always)]
pub const fn line_of(addr: u64) -> u64 {
    addr & !(CACHE_LINE_SIZE as u64 - 1)
}

/// Offset of `addr` inside its line
#[inline(always)]
pub const fn line_offset(addr: u64) -> usize {
    (addr & (CACHE_LINE_SIZE as u64 - 1)) as usize
}

/// Do both addresses fall in the same line?
#[inline(always)]
pub const fn same_line(a: u64, b: u64) -> bool {
    line_of(a) == line_of(b)
}

/// Round `addr` up to the next line boundary
#[inline(always)]
pub const fn align_to_line(addr: u64) -> u64 {
    (addr + CACHE_LINE_SIZE as u64 - 1) & !(CACHE_LINE_SIZE as u64 - 1)
}

/// Value aligned to, and occupying at least, one full cache line
#[repr(C, align(64))]
#[derive(Clone, Copy, Default)]
pub struct CachePadded<T> {
    value: T,
}

const_assert_eq!(core::mem::align_of::<CachePadded<u8>>(), CACHE_LINE_SIZE);
const_assert_eq!(core::mem::size_of::<CachePadded<u64>>(), CACHE_LINE_SIZE);

impl<T> CachePadded<T> {
    /// Pad a value
    pub const fn new(value: T) -> Self {
        Self { value }
    }

    /// Unwrap
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> core::ops::Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> core::ops::DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for CachePadded<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.value.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_helpers() {
        assert_eq!(line_of(0x1047), 0x1040);
        assert_eq!(line_offset(0x1047), 7);
        assert!(same_line(0x1000, 0x103f));
        assert!(!same_line(0x103f, 0x1040));
        assert_eq!(align_to_line(0x1001), 0x1040);
        assert_eq!(align_to_line(0x1040), 0x1040);
    }

    #[test]
    fn test_padded_slots_do_not_share_lines() {
        let slots = [CachePadded::new(1u32), CachePadded::new(2u32)];
        let a = &*slots[0] as *const u32 as u64;
        let b = &*slots[1] as *const u32 as u64;
        assert!(!same_line(a, b));
        assert_eq!(*slots[1], 2);
    }
}
