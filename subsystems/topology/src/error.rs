//! Topology errors.
//!
//! Every variant is a hardware inconsistency: fatal at boot, never retried.

use core::fmt;

use crate::types::{CoreId, NodeId};

/// Result type for topology operations
pub type TopologyResult<T> = Result<T, HardwareError>;

/// Inconsistent hardware description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareError {
    /// Firmware reported no cores
    NoCores,
    /// Firmware reported no NUMA nodes
    NoNodes,
    /// A core reports a NUMA node absent from the node table
    UnknownNode {
        /// Reporting core
        core: CoreId,
        /// Node it claims
        node: NodeId,
    },
    /// Same core id enumerated twice
    DuplicateCore(CoreId),
    /// Same node id enumerated twice
    DuplicateNode(NodeId),
    /// Node ids are not dense from zero
    NonContiguousNodes(NodeId),
    /// Core id beyond the supported maximum
    CoreOutOfRange(CoreId),
    /// Distance matrix has the wrong shape
    DistanceShape {
        /// Expected dimension
        expected: usize,
        /// Row that was wrong (or `expected` for the row count)
        row: usize,
        /// Actual length
        len: usize,
    },
    /// Self-distance is not zero
    SelfDistance(NodeId),
    /// Distance matrix is not symmetric
    AsymmetricDistance(NodeId, NodeId),
    /// Hot-plug named a core that is not in the topology
    UnknownCore(CoreId),
    /// Hot-plug would remove the last online core
    LastCore(CoreId),
}

impl fmt::Display for HardwareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCores => write!(f, "no cores enumerated"),
            Self::NoNodes => write!(f, "no NUMA nodes enumerated"),
            Self::UnknownNode { core, node } => {
                write!(f, "{} reports {} which is absent from the node table", core, node)
            },
            Self::DuplicateCore(core) => write!(f, "{} enumerated twice", core),
            Self::DuplicateNode(node) => write!(f, "{} enumerated twice", node),
            Self::NonContiguousNodes(node) => write!(f, "node ids not dense, found {}", node),
            Self::CoreOutOfRange(core) => write!(f, "{} exceeds the supported core count", core),
            Self::DistanceShape { expected, row, len } => write!(
                f,
                "distance matrix row {} has {} entries, expected {}",
                row, len, expected
            ),
            Self::SelfDistance(node) => write!(f, "self-distance of {} is not zero", node),
            Self::AsymmetricDistance(a, b) => {
                write!(f, "distance {} -> {} differs from the reverse", a, b)
            },
            Self::UnknownCore(core) => write!(f, "{} is not part of the topology", core),
            Self::LastCore(core) => write!(f, "cannot remove {}, it is the last core", core),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HardwareError::UnknownNode {
            core: CoreId(4),
            node: NodeId(9),
        };
        let display = alloc::format!("{}", err);
        assert!(display.contains("cpu4"));
        assert!(display.contains("node9"));
    }
}
