//! NUMA manager errors.

use core::fmt;

use helix_topology::NodeId;

use crate::migration::MigrationHandle;

/// Result type for NUMA operations
pub type NumaResult<T> = Result<T, NumaError>;

/// NUMA manager error.
///
/// All variants are caller errors: returned as-is, never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumaError {
    /// No node can satisfy the request under the policy
    OutOfMemory {
        /// Pages requested
        pages: u64,
    },
    /// Policy names a node that does not exist
    InvalidPolicy(NodeId),
    /// Node id outside the topology
    UnknownNode(NodeId),
    /// Range is empty, misplaced or not allocated
    InvalidRange,
    /// Handle was never issued, or its status has aged out
    UnknownMigration(MigrationHandle),
    /// Another unfinished migration already covers part of the range
    MigrationPending(MigrationHandle),
    /// Automatic balancing is switched off
    BalancingDisabled,
    /// Configuration rejected
    InvalidConfig(&'static str),
}

impl fmt::Display for NumaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { pages } => write!(f, "out of memory allocating {} pages", pages),
            Self::InvalidPolicy(node) => write!(f, "policy names absent {}", node),
            Self::UnknownNode(node) => write!(f, "{} is not in the topology", node),
            Self::InvalidRange => write!(f, "invalid page range"),
            Self::UnknownMigration(handle) => write!(f, "unknown migration {}", handle.0),
            Self::MigrationPending(handle) => write!(f, "range already migrating under {}", handle.0),
            Self::BalancingDisabled => write!(f, "NUMA balancing is disabled"),
            Self::InvalidConfig(msg) => write!(f, "invalid NUMA config: {}", msg),
        }
    }
}
