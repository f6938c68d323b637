//! In-memory swap area with fixed slot capacity.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::error::{VmError, VmResult};

/// Swap slot index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(pub u32);

/// Swap counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwapStats {
    /// Pages written out
    pub swapped_out: u64,
    /// Pages read back on fault
    pub swapped_in: u64,
    /// Stores refused because the area was full
    pub full: u64,
}

/// Page-sized slots, allocated lowest index first
#[derive(Debug, Default)]
pub struct SwapArea {
    slots: Vec<Option<Box<[u8]>>>,
    /// Free slot indices, highest first so `pop` yields the lowest
    free: Vec<u32>,
    stats: SwapStats,
}

impl SwapArea {
    /// Area of `capacity` slots
    pub fn new(capacity: u32) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).rev().collect(),
            stats: SwapStats::default(),
        }
    }

    /// Total slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Occupied slots
    pub fn used(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Any slot free?
    pub fn has_space(&self) -> bool {
        !self.free.is_empty()
    }

    /// Write a page out
    pub fn store(&mut self, page: &[u8]) -> VmResult<SwapSlot> {
        let Some(index) = self.free.pop() else {
            self.stats.full += 1;
            return Err(VmError::SwapFull);
        };
        self.slots[index as usize] = Some(page.into());
        self.stats.swapped_out += 1;
        Ok(SwapSlot(index))
    }

    /// Read a page back, freeing its slot
    pub fn load(&mut self, slot: SwapSlot) -> Option<Box<[u8]>> {
        let data = self.slots.get_mut(slot.0 as usize)?.take()?;
        self.free.push(slot.0);
        self.stats.swapped_in += 1;
        Some(data)
    }

    /// Drop a slot without reading it
    pub fn release(&mut self, slot: SwapSlot) {
        if let Some(entry) = self.slots.get_mut(slot.0 as usize) {
            if entry.take().is_some() {
                self.free.push(slot.0);
            }
        }
    }

    /// Counters
    pub fn stats(&self) -> SwapStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_load_release() {
        let mut area = SwapArea::new(2);
        let a = area.store(&[1, 2, 3]).unwrap();
        let b = area.store(&[4]).unwrap();
        assert_eq!((a, b), (SwapSlot(0), SwapSlot(1)));
        assert_eq!(area.store(&[5]), Err(VmError::SwapFull));
        assert_eq!(&*area.load(a).unwrap(), &[1, 2, 3]);
        assert!(area.load(a).is_none());
        area.release(b);
        assert_eq!(area.used(), 0);
        assert_eq!(area.stats().full, 1);
    }
}
