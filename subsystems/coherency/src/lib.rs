//! # Helix Coherency
//!
//! Cache-coherency layer.
//!
//! ## Components
//!
//! - **Protocols**: MESI, MOESI, MESIF, Dragon and Firefly behind one
//!   transition contract ([`CoherencyProtocol`])
//! - **Directory**: line states across cache domains with the
//!   single-writer invariant enforced ([`CoherencyDirectory`])
//! - **False-sharing detector**: windowed write sampling per line
//! - **Lock-free primitives**: queue, stack and counters used by the
//!   scheduler and the NUMA manager
//! - **Padding**: [`CachePadded`] and line helpers

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(test)]
extern crate std;

// ============================================================================
// SUBMODULES
// ============================================================================

pub mod cancel;
pub mod directory;
pub mod error;
pub mod false_sharing;
pub mod line;
pub mod lockfree;
pub mod protocol;
pub mod state;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use cancel::CancelToken;
pub use directory::{CoherencyDirectory, CoherencyStats};
pub use error::{CoherencyError, CoherencyResult};
pub use false_sharing::{
    FalseSharingConfig, FalseSharingDetector, FalseSharingReport, Offender, PaddingAction,
    PaddingAdvice,
};
pub use line::{align_to_line, line_of, line_offset, same_line, CachePadded, CACHE_LINE_SIZE};
pub use lockfree::{AtomicCounter, BoundedQueue, BoundedStack, PerCoreCounter};
pub use protocol::CoherencyProtocol;
pub use state::{BusAction, LineState, SnoopEvent, Transition, MAX_BUS_ACTIONS};
