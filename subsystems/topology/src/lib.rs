//! # Helix Topology
//!
//! Hardware topology model shared by the NUMA, scheduling and monitoring
//! subsystems.
//!
//! ## Model
//!
//! - **Cores** belong to exactly one NUMA node and one last-level cache
//!   domain.
//! - **Nodes** are dense from zero and own one physical memory bank.
//! - **Distances** form a symmetric matrix with zero self-distance.
//!
//! A [`Topology`] is an immutable snapshot. Hot-plug goes through
//! [`TopologyCell`], which publishes a new snapshot with a higher
//! generation while existing readers keep the old one.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(test)]
extern crate std;

// ============================================================================
// SUBMODULES
// ============================================================================

pub mod cell;
pub mod distance;
pub mod error;
pub mod mask;
pub mod probe;
pub mod snapshot;
pub mod types;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use cell::{HotplugEvent, TopologyCell};
pub use distance::{DistanceMatrix, LOCAL_DISTANCE, UNREACHABLE};
pub use error::{HardwareError, TopologyResult};
pub use mask::{CpuMask, MAX_CPUS};
pub use probe::{CoreDescriptor, HardwareDescription, NodeDescriptor, StaticProbe, TopologyProbe};
pub use snapshot::{discover, NumaNodeInfo, Topology, TopologyNode};
pub use types::{CacheDomainId, CoreId, NodeId, PowerState, UnitId};
