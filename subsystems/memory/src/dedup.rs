//! Content hashing for page deduplication.
//!
//! A hash match only nominates a merge; pages are merged after a full byte
//! comparison, so a colliding hasher costs work but never correctness.

/// Page content hash
pub trait PageHasher: Send + Sync {
    /// Hash one page
    fn hash(&self, page: &[u8]) -> u64;
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a
#[derive(Debug, Clone, Copy, Default)]
pub struct Fnv1aHasher;

impl PageHasher for Fnv1aHasher {
    fn hash(&self, page: &[u8]) -> u64 {
        page.iter()
            .fold(FNV_OFFSET, |h, &b| (h ^ b as u64).wrapping_mul(FNV_PRIME))
    }
}

/// Deduplication counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    /// Passes run
    pub passes: u64,
    /// Pages examined
    pub scanned: u64,
    /// Pages merged into a shared frame
    pub merged: u64,
    /// Hash matches whose content differed
    pub collisions: u64,
    /// Shared frames split by a write
    pub cow_breaks: u64,
}

/// Result of one deduplication pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupOutcome {
    /// Pages examined
    pub scanned: u64,
    /// Pages merged
    pub merged: u64,
    /// Collisions rejected by the full comparison
    pub collisions: u64,
    /// Stopped early at a cancellation point
    pub cancelled: bool,
}
