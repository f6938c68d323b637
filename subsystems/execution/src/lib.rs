//! # Helix Execution
//!
//! Multi-core scheduling for runnable units.
//!
//! ## Components
//!
//! - **Run-queues**: one per core, lock-free inbox plus an EDF heap for
//!   real-time units and FIFO lists for interactive and batch units
//! - **Placement**: load, NUMA, cache or cost-model driven core selection;
//!   real-time units go where they finish earliest
//! - **Domains**: cache, node and machine levels balanced bottom-up on
//!   their own cadence
//! - **Hot-plug**: removed cores are drained into their nearest siblings
//! - **Power**: per-core governor with thermal throttling
//!
//! A unit is in at most one run-queue at a time, and never on a core its
//! affinity excludes unless the core it was pinned to went away.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(test)]
extern crate std;

// ============================================================================
// SUBMODULES
// ============================================================================

pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod placement;
pub mod power;
pub mod runqueue;
pub mod scheduler;
pub mod unit;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use config::{SchedConfig, SchedTuning};
pub use domain::{DomainId, DomainLevel, DomainTree, SchedDomain};
pub use error::{SchedError, SchedResult};
pub use events::{EventLog, SchedEvent};
pub use placement::{BalanceAlgorithm, CoreLoad, MemoryAffinity, PlacementHint};
pub use power::{PowerGovernor, PowerThresholds};
pub use runqueue::{CoreFlags, QueueEntry, RunQueue, RunningUnit};
pub use scheduler::{BalanceReport, SchedStats, Scheduler};
pub use unit::{PriorityClass, RunnableUnitHandle, UnitDescriptor, UnitState};
