//! # Helix NUMA
//!
//! Topology-aware physical page allocation.
//!
//! ## Components
//!
//! - **Placement**: `Bind`, `Preferred`, `Interleave`, `Local` and `Auto`
//!   policies over per-node extent free lists
//! - **Access tracking**: local and remote accesses per range and per node
//! - **Migration**: asynchronous, rate-limited moves with completion
//!   callbacks
//! - **Balancing**: periodic passes that pull remotely accessed ranges
//!   toward the nodes using them
//!
//! Every allocated frame belongs to exactly one node, and a `Bind(n)`
//! allocation never returns frames outside node `n`.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(test)]
extern crate std;

// ============================================================================
// SUBMODULES
// ============================================================================

pub mod access;
pub mod balancer;
pub mod config;
pub mod error;
pub mod extent;
pub mod manager;
pub mod migration;
mod node;
pub mod types;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use access::{AccessTracker, RangeAccess};
pub use balancer::{BalanceMove, BalanceStats};
pub use config::{NumaConfig, NumaTuning, NS_PER_SEC};
pub use error::{NumaError, NumaResult};
pub use extent::ExtentFreeList;
pub use manager::{AllocStats, NumaManager};
pub use migration::{
    MigrationCallback, MigrationHandle, MigrationOrigin, MigrationStats, MigrationStatus, PendingMigration,
    RETAINED_STATUSES,
};
pub use node::NodeStats;
pub use types::{pages_for, AllocPolicy, CoreLocator, PageRange, PAGE_SHIFT, PAGE_SIZE};
