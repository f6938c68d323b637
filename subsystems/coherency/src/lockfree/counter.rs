//! Wait-free counters.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::line::CachePadded;

/// Single wait-free counter on its own cache line
#[derive(Debug, Default)]
pub struct AtomicCounter {
    value: CachePadded<AtomicU64>,
}

impl AtomicCounter {
    /// Counter starting at `value`
    pub const fn new(value: u64) -> Self {
        Self {
            value: CachePadded::new(AtomicU64::new(value)),
        }
    }

    /// Add one, returning the previous value
    #[inline]
    pub fn increment(&self) -> u64 {
        self.value.fetch_add(1, Ordering::Relaxed)
    }

    /// Add `n`, returning the previous value
    #[inline]
    pub fn add(&self, n: u64) -> u64 {
        self.value.fetch_add(n, Ordering::Relaxed)
    }

    /// Subtract `n` (wrapping), returning the previous value
    #[inline]
    pub fn sub(&self, n: u64) -> u64 {
        self.value.fetch_sub(n, Ordering::Relaxed)
    }

    /// Current value
    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Reset to zero, returning the old value
    #[inline]
    pub fn take(&self) -> u64 {
        self.value.swap(0, Ordering::Relaxed)
    }
}

/// Counter sharded per core; writers never contend across cores
#[derive(Debug)]
pub struct PerCoreCounter {
    shards: Box<[CachePadded<AtomicU64>]>,
}

impl PerCoreCounter {
    /// One shard per core
    pub fn new(cores: usize) -> Self {
        let shards: Vec<_> = (0..cores.max(1))
            .map(|_| CachePadded::new(AtomicU64::new(0)))
            .collect();
        Self {
            shards: shards.into_boxed_slice(),
        }
    }

    /// Shard count
    #[inline(always)]
    pub fn cores(&self) -> usize {
        self.shards.len()
    }

    /// Add to a core's shard; out-of-range cores fold onto the last shard
    #[inline]
    pub fn add(&self, core: usize, n: u64) {
        let idx = core.min(self.shards.len() - 1);
        self.shards[idx].fetch_add(n, Ordering::Relaxed);
    }

    /// One core's shard
    #[inline]
    pub fn get(&self, core: usize) -> u64 {
        self.shards
            .get(core)
            .map(|s| s.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sum of all shards
    pub fn sum(&self) -> u64 {
        self.shards.iter().map(|s| s.load(Ordering::Relaxed)).sum()
    }

    /// Zero every shard, returning the old sum
    pub fn take(&self) -> u64 {
        self.shards.iter().map(|s| s.swap(0, Ordering::Relaxed)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use std::thread;

    #[test]
    fn test_atomic_counter_concurrent() {
        let c = Arc::new(AtomicCounter::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = c.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        c.increment();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(c.get(), 8000);
        assert_eq!(c.take(), 8000);
        assert_eq!(c.get(), 0);
    }

    #[test]
    fn test_per_core_counter() {
        let c = PerCoreCounter::new(4);
        c.add(0, 3);
        c.add(3, 4);
        c.add(17, 1);
        assert_eq!(c.get(3), 5);
        assert_eq!(c.get(9), 0);
        assert_eq!(c.sum(), 8);
        assert_eq!(c.take(), 8);
        assert_eq!(c.sum(), 0);
    }
}
