//! Scheduler configuration.

use crate::error::{SchedError, SchedResult};
use crate::placement::BalanceAlgorithm;
use crate::power::PowerThresholds;

/// Scheduler settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedConfig {
    /// Placement and balancing strategy
    pub balance_algorithm: BalanceAlgorithm,
    /// Cache-level balancing cadence (ns); node and machine levels run
    /// every 4x and 16x this
    pub balance_interval_ns: u64,
    /// Load gap (units) tolerated between two cores before balancing moves
    /// work, and the slack placement allows for locality
    pub imbalance_threshold: usize,
    /// Maximum cores per cache-level domain
    pub domain_size: usize,
    /// Accept real-time units
    pub enable_realtime: bool,
    /// Run the power governor
    pub enable_power_mgmt: bool,
    /// Lock-free inbox slots per core
    pub inbox_capacity: usize,
    /// Event log capacity
    pub event_capacity: usize,
    /// Runtime assumed for real-time units that do not state one (ns)
    pub default_rt_runtime_ns: u64,
    /// Governor thresholds
    pub power: PowerThresholds,
    /// Temperature that forces a downgrade (°C)
    pub thermal_limit_c: u32,
    /// Cooling needed below the limit before the cap lifts (°C)
    pub thermal_hysteresis_c: u32,
}

impl SchedConfig {
    /// Default settings
    pub const fn new() -> Self {
        Self {
            balance_algorithm: BalanceAlgorithm::NumaAware,
            balance_interval_ns: 4_000_000,
            imbalance_threshold: 1,
            domain_size: 16,
            enable_realtime: true,
            enable_power_mgmt: true,
            inbox_capacity: 256,
            event_capacity: 1024,
            default_rt_runtime_ns: 100_000,
            power: PowerThresholds::new(),
            thermal_limit_c: 95,
            thermal_hysteresis_c: 10,
        }
    }

    /// Small machines: fewer, cheaper balancing passes
    pub const fn small() -> Self {
        Self {
            balance_algorithm: BalanceAlgorithm::LoadBased,
            balance_interval_ns: 10_000_000,
            domain_size: 4,
            inbox_capacity: 64,
            event_capacity: 256,
            ..Self::new()
        }
    }

    /// Large servers: locality first, tighter balancing
    pub const fn server() -> Self {
        Self {
            balance_algorithm: BalanceAlgorithm::ModelBased,
            balance_interval_ns: 2_000_000,
            domain_size: 32,
            inbox_capacity: 1024,
            event_capacity: 4096,
            ..Self::new()
        }
    }

    /// Check invariants
    pub fn validate(&self) -> SchedResult<()> {
        if self.balance_interval_ns == 0 {
            return Err(SchedError::InvalidConfig("balance_interval_ns must be non-zero"));
        }
        if self.imbalance_threshold == 0 {
            return Err(SchedError::InvalidConfig("imbalance_threshold must be non-zero"));
        }
        if self.domain_size == 0 {
            return Err(SchedError::InvalidConfig("domain_size must be non-zero"));
        }
        if self.inbox_capacity == 0 || self.event_capacity == 0 {
            return Err(SchedError::InvalidConfig("queue capacities must be non-zero"));
        }
        if self.thermal_hysteresis_c >= self.thermal_limit_c {
            return Err(SchedError::InvalidConfig("thermal hysteresis exceeds the limit"));
        }
        self.power.validate()
    }
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Runtime retuning; `None` keeps the current value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedTuning {
    /// New base balancing cadence (ns)
    pub balance_interval_ns: Option<u64>,
    /// New imbalance threshold
    pub imbalance_threshold: Option<usize>,
    /// New governor thresholds
    pub power: Option<PowerThresholds>,
}

impl SchedTuning {
    /// Apply onto a config copy
    pub fn applied_to(&self, mut config: SchedConfig) -> SchedConfig {
        if let Some(v) = self.balance_interval_ns {
            config.balance_interval_ns = v;
        }
        if let Some(v) = self.imbalance_threshold {
            config.imbalance_threshold = v;
        }
        if let Some(v) = self.power {
            config.power = v;
        }
        config
    }
}
