//! # Helix Memory
//!
//! Large-scale virtual memory for address spaces up to one exabyte.
//!
//! ## Components
//!
//! - **Mappings**: explicit `map`/`unmap` of virtual memory areas with
//!   permission checks and overlap detection
//! - **Paging**: four, five or six translation levels chosen from the
//!   highest mapped address
//! - **Huge pages**: opportunistic 2 MiB promotion with silent fallback
//! - **Deduplication**: hash-nominated, byte-verified merging of identical
//!   cold pages into copy-on-write frames
//! - **Compression**: pluggable codec for cold pages, decoded on fault
//! - **Overcommit**: commit accounting for writable private memory
//! - **Pressure**: compress, deduplicate, swap, then deny, in that order

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(test)]
extern crate std;

// ============================================================================
// SUBMODULES
// ============================================================================

pub mod addr;
pub mod compress;
pub mod config;
pub mod dedup;
pub mod error;
pub mod frames;
pub mod manager;
pub mod overcommit;
pub mod pressure;
pub mod swap;
pub mod vma;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use addr::{AddrRange, PagingMode, VirtAddr, HUGE_PAGE_FRAMES, HUGE_PAGE_SIZE, MAX_VIRTUAL_ADDRESS};
pub use compress::{Codec, CompressedPage, CompressionStats, RleCodec};
pub use config::VmConfig;
pub use dedup::{DedupOutcome, DedupStats, Fnv1aHasher, PageHasher};
pub use error::{VmError, VmResult};
pub use frames::FrameProvider;
pub use manager::{BackgroundOutcome, FaultKind, FaultStats, HugeStats, Translation, VmManager, VmStats};
pub use overcommit::{CommitAccounting, OvercommitPolicy};
pub use pressure::{PressureStats, PressureStep};
pub use swap::{SwapArea, SwapSlot, SwapStats};
pub use vma::{Access, Backing, CompressionState, VmaFlags, VmaId, VmaInfo};

// Frame contents are copied and compared in whole cache lines.
static_assertions::const_assert_eq!(helix_numa::PAGE_SIZE % helix_coherency::CACHE_LINE_SIZE as u64, 0);
