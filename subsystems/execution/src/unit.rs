//! Runnable units as seen by the scheduler.
//!
//! The process manager owns the unit. The scheduler only reads the handle's
//! accessors and tracks which queue the unit sits in.

use core::fmt;

use helix_topology::{CpuMask, UnitId};

/// Scheduling class
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PriorityClass {
    /// Earliest-deadline-first; preempts everything else
    RealTime,
    /// Latency sensitive
    Interactive,
    /// Throughput
    Batch,
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RealTime => "realtime",
            Self::Interactive => "interactive",
            Self::Batch => "batch",
        };
        f.write_str(name)
    }
}

/// Opaque schedulable handle supplied by the process manager
pub trait RunnableUnitHandle: Send + Sync {
    /// Stable identity
    fn id(&self) -> UnitId;

    /// Cores the unit may run on
    fn affinity(&self) -> CpuMask;

    /// Scheduling class
    fn priority_class(&self) -> PriorityClass;

    /// Absolute deadline (ns), real-time units only
    fn deadline_ns(&self) -> Option<u64>;

    /// Expected runtime per activation (ns), if the owner knows it
    fn expected_runtime_ns(&self) -> Option<u64> {
        None
    }
}

/// Life cycle of a unit inside the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitState {
    /// Waiting in a run-queue
    Queued,
    /// On a core
    Running,
    /// Waiting for an external event
    Blocked,
    /// Gone; the scheduler forgets it
    Terminated,
}

impl UnitState {
    /// Whether `self -> to` is a legal step
    ///
    /// Units may be terminated from any live state since the owner can
    /// kill them while they wait.
    pub const fn can_become(self, to: UnitState) -> bool {
        matches!(
            (self, to),
            (UnitState::Queued, UnitState::Running)
                | (UnitState::Running, UnitState::Queued)
                | (UnitState::Running, UnitState::Blocked)
                | (UnitState::Blocked, UnitState::Queued)
                | (UnitState::Queued, UnitState::Terminated)
                | (UnitState::Running, UnitState::Terminated)
                | (UnitState::Blocked, UnitState::Terminated)
        )
    }
}

/// Plain handle for owners that keep no richer unit object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitDescriptor {
    /// Identity
    pub id: UnitId,
    /// Allowed cores
    pub affinity: CpuMask,
    /// Class
    pub class: PriorityClass,
    /// Absolute deadline (real-time)
    pub deadline_ns: Option<u64>,
    /// Expected runtime
    pub runtime_ns: Option<u64>,
}

impl UnitDescriptor {
    /// Batch unit allowed everywhere
    pub fn batch(id: u64) -> Self {
        Self {
            id: UnitId(id),
            affinity: CpuMask::first_n(helix_topology::MAX_CPUS),
            class: PriorityClass::Batch,
            deadline_ns: None,
            runtime_ns: None,
        }
    }

    /// Interactive unit allowed everywhere
    pub fn interactive(id: u64) -> Self {
        Self {
            class: PriorityClass::Interactive,
            ..Self::batch(id)
        }
    }

    /// Real-time unit with an absolute deadline and expected runtime
    pub fn realtime(id: u64, deadline_ns: u64, runtime_ns: u64) -> Self {
        Self {
            class: PriorityClass::RealTime,
            deadline_ns: Some(deadline_ns),
            runtime_ns: Some(runtime_ns),
            ..Self::batch(id)
        }
    }

    /// Restrict to `mask`
    pub fn with_affinity(mut self, mask: CpuMask) -> Self {
        self.affinity = mask;
        self
    }
}

impl RunnableUnitHandle for UnitDescriptor {
    fn id(&self) -> UnitId {
        self.id
    }

    fn affinity(&self) -> CpuMask {
        self.affinity
    }

    fn priority_class(&self) -> PriorityClass {
        self.class
    }

    fn deadline_ns(&self) -> Option<u64> {
        self.deadline_ns
    }

    fn expected_runtime_ns(&self) -> Option<u64> {
        self.runtime_ns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine() {
        assert!(UnitState::Queued.can_become(UnitState::Running));
        assert!(UnitState::Running.can_become(UnitState::Blocked));
        assert!(UnitState::Blocked.can_become(UnitState::Queued));
        assert!(!UnitState::Blocked.can_become(UnitState::Running));
        assert!(!UnitState::Queued.can_become(UnitState::Blocked));
        assert!(!UnitState::Terminated.can_become(UnitState::Queued));
    }

    #[test]
    fn test_descriptor_presets() {
        let rt = UnitDescriptor::realtime(3, 1_000, 10);
        assert_eq!(rt.priority_class(), PriorityClass::RealTime);
        assert_eq!(rt.deadline_ns(), Some(1_000));
        assert!(rt.affinity().count() > 0);
        assert_eq!(UnitDescriptor::batch(1).deadline_ns(), None);
    }
}
