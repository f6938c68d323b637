//! Scheduler errors.

use core::fmt;

use helix_topology::{CoreId, UnitId};

use crate::unit::UnitState;

/// Result type for scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Scheduler error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Unit is not known to the scheduler
    UnknownUnit(UnitId),
    /// Unit already sits in a run-queue, runs, or is blocked
    AlreadyQueued(UnitId),
    /// Affinity admits no online core
    NoEligibleCore(UnitId),
    /// Core is offline or out of range
    InvalidCore(CoreId),
    /// Operation not allowed in the unit's current state
    InvalidTransition {
        /// Unit
        unit: UnitId,
        /// State it was in
        from: UnitState,
        /// State that was requested
        to: UnitState,
    },
    /// Real-time class requested while real-time scheduling is off
    RealtimeDisabled(UnitId),
    /// Configuration rejected
    InvalidConfig(&'static str),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownUnit(unit) => write!(f, "unknown {}", unit),
            Self::AlreadyQueued(unit) => write!(f, "{} is already scheduled", unit),
            Self::NoEligibleCore(unit) => write!(f, "no online core admits {}", unit),
            Self::InvalidCore(core) => write!(f, "{} is not online", core),
            Self::InvalidTransition { unit, from, to } => {
                write!(f, "{}: cannot go from {:?} to {:?}", unit, from, to)
            },
            Self::RealtimeDisabled(unit) => {
                write!(f, "{} is real-time but real-time scheduling is disabled", unit)
            },
            Self::InvalidConfig(msg) => write!(f, "invalid scheduler config: {}", msg),
        }
    }
}
