//! Unified error type.

use core::fmt;

use helix_coherency::CoherencyError;
use helix_execution::SchedError;
use helix_memory::VmError;
use helix_numa::NumaError;
use helix_perf::PerfError;
use helix_topology::HardwareError;

use crate::config::ConfigError;

/// Result type for facade operations
pub type ScaleResult<T> = Result<T, ScaleError>;

/// Any error the subsystem can return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleError {
    /// Topology is inconsistent; fatal at boot
    Hardware(HardwareError),
    /// Coherency layer
    Coherency(CoherencyError),
    /// NUMA manager
    Numa(NumaError),
    /// Virtual memory manager
    Vm(VmError),
    /// Scheduler
    Sched(SchedError),
    /// Performance monitor
    Perf(PerfError),
    /// Configuration rejected
    Config(ConfigError),
    /// `init` has not completed
    NotInitialized,
    /// `init` already ran
    AlreadyInitialized,
}

impl fmt::Display for ScaleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hardware(e) => write!(f, "hardware: {}", e),
            Self::Coherency(e) => write!(f, "coherency: {}", e),
            Self::Numa(e) => write!(f, "numa: {}", e),
            Self::Vm(e) => write!(f, "vm: {}", e),
            Self::Sched(e) => write!(f, "scheduler: {}", e),
            Self::Perf(e) => write!(f, "perf: {}", e),
            Self::Config(e) => write!(f, "config: {}", e),
            Self::NotInitialized => write!(f, "subsystem not initialized"),
            Self::AlreadyInitialized => write!(f, "subsystem already initialized"),
        }
    }
}

macro_rules! from_component {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for ScaleError {
                fn from(e: $ty) -> Self {
                    Self::$variant(e)
                }
            }
        )*
    };
}

from_component! {
    HardwareError => Hardware,
    CoherencyError => Coherency,
    NumaError => Numa,
    VmError => Vm,
    SchedError => Sched,
    PerfError => Perf,
    ConfigError => Config,
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use helix_topology::CoreId;

    #[test]
    fn test_conversions_keep_the_cause() {
        let e: ScaleError = SchedError::InvalidCore(CoreId(3)).into();
        assert_eq!(e, ScaleError::Sched(SchedError::InvalidCore(CoreId(3))));
        let e: ScaleError = ConfigError::DomainSize.into();
        assert_eq!(e.to_string(), "config: domain_size must be non-zero");
    }
}
