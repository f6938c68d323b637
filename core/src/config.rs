//! Subsystem configuration.
//!
//! [`ScaleConfig`] is the whole configuration surface. Every component's
//! own config is derived from it; runtime changes go through each
//! component's tuning entry point afterwards.

use core::fmt;

use helix_execution::{BalanceAlgorithm, SchedConfig};
use helix_memory::VmConfig;
use helix_numa::NumaConfig;
use helix_perf::PerfConfig;
use helix_topology::MAX_CPUS;

/// Configuration errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// `max_cpus` is zero or above what a CPU mask can hold
    MaxCpus(usize),
    /// `max_numa_nodes` is zero
    NoNumaNodes,
    /// `domain_size` is zero
    DomainSize,
    /// `balance_interval_ns` is zero
    BalanceInterval,
    /// `migration_rate_limit` is zero
    MigrationRate,
    /// `sampling_frequency_hz` is zero or absurd
    SamplingFrequency(u32),
    /// Firmware reports more cores than `max_cpus`
    TooManyCpus {
        /// Cores found
        found: usize,
        /// Configured limit
        max: usize,
    },
    /// Firmware reports more nodes than `max_numa_nodes`
    TooManyNodes {
        /// Nodes found
        found: usize,
        /// Configured limit
        max: usize,
    },
    /// A derived component config was rejected
    Component(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxCpus(n) => write!(f, "max_cpus {} outside 1..={}", n, MAX_CPUS),
            Self::NoNumaNodes => write!(f, "max_numa_nodes must be non-zero"),
            Self::DomainSize => write!(f, "domain_size must be non-zero"),
            Self::BalanceInterval => write!(f, "balance_interval must be non-zero"),
            Self::MigrationRate => write!(f, "migration_rate_limit must be non-zero"),
            Self::SamplingFrequency(hz) => write!(f, "sampling_frequency {} Hz out of range", hz),
            Self::TooManyCpus { found, max } => write!(f, "{} cores found, limit is {}", found, max),
            Self::TooManyNodes { found, max } => write!(f, "{} NUMA nodes found, limit is {}", found, max),
            Self::Component(msg) => write!(f, "component config rejected: {}", msg),
        }
    }
}

/// Subsystem configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleConfig {
    /// Most cores the subsystem will manage
    pub max_cpus: usize,
    /// Most NUMA nodes the subsystem will manage
    pub max_numa_nodes: usize,
    /// Cores per cache-level scheduling domain, at most
    pub domain_size: usize,
    /// Placement and balancing strategy
    pub balance_algorithm: BalanceAlgorithm,
    /// Cache-level balancing cadence (ns)
    pub balance_interval_ns: u64,
    /// Page migrations per second, at most
    pub migration_rate_limit: u32,
    /// Accept real-time units
    pub enable_realtime: bool,
    /// Run the power governor
    pub enable_power_mgmt: bool,
    /// Compress cold pages
    pub enable_compression: bool,
    /// Performance samples per second per core
    pub sampling_frequency_hz: u32,
}

impl ScaleConfig {
    /// Default configuration
    pub const fn new() -> Self {
        Self {
            max_cpus: 256,
            max_numa_nodes: 16,
            domain_size: 16,
            balance_algorithm: BalanceAlgorithm::NumaAware,
            balance_interval_ns: 4_000_000,
            migration_rate_limit: 256,
            enable_realtime: true,
            enable_power_mgmt: true,
            enable_compression: true,
            sampling_frequency_hz: 100,
        }
    }

    /// Small machines and tests
    pub const fn small() -> Self {
        Self {
            max_cpus: 16,
            max_numa_nodes: 2,
            domain_size: 4,
            balance_algorithm: BalanceAlgorithm::LoadBased,
            balance_interval_ns: 10_000_000,
            migration_rate_limit: 64,
            sampling_frequency_hz: 10,
            ..Self::new()
        }
    }

    /// Many-core servers
    pub const fn server() -> Self {
        Self {
            max_cpus: MAX_CPUS,
            max_numa_nodes: 64,
            domain_size: 32,
            balance_algorithm: BalanceAlgorithm::ModelBased,
            balance_interval_ns: 2_000_000,
            migration_rate_limit: 4096,
            ..Self::new()
        }
    }

    /// Check the surface itself, then every derived component config
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_cpus == 0 || self.max_cpus > MAX_CPUS {
            return Err(ConfigError::MaxCpus(self.max_cpus));
        }
        if self.max_numa_nodes == 0 {
            return Err(ConfigError::NoNumaNodes);
        }
        if self.domain_size == 0 {
            return Err(ConfigError::DomainSize);
        }
        if self.balance_interval_ns == 0 {
            return Err(ConfigError::BalanceInterval);
        }
        if self.migration_rate_limit == 0 {
            return Err(ConfigError::MigrationRate);
        }
        if self.sampling_frequency_hz == 0 || self.sampling_frequency_hz > 100_000 {
            return Err(ConfigError::SamplingFrequency(self.sampling_frequency_hz));
        }

        let component = |msg: &'static str| ConfigError::Component(msg);
        self.sched_config().validate().map_err(|_| component("scheduler"))?;
        self.numa_config().validate().map_err(|_| component("numa"))?;
        self.vm_config().validate().map_err(|_| component("vm"))?;
        self.perf_config().validate().map_err(|_| component("perf"))?;
        Ok(())
    }

    /// Scheduler view
    pub fn sched_config(&self) -> SchedConfig {
        SchedConfig {
            balance_algorithm: self.balance_algorithm,
            balance_interval_ns: self.balance_interval_ns,
            domain_size: self.domain_size,
            enable_realtime: self.enable_realtime,
            enable_power_mgmt: self.enable_power_mgmt,
            ..self.sched_base()
        }
    }

    fn sched_base(&self) -> SchedConfig {
        if self.max_cpus <= 16 {
            SchedConfig::small()
        } else if self.max_cpus > 256 {
            SchedConfig::server()
        } else {
            SchedConfig::new()
        }
    }

    /// NUMA manager view
    pub fn numa_config(&self) -> NumaConfig {
        let base = if self.max_numa_nodes > 8 {
            NumaConfig::server()
        } else {
            NumaConfig::new()
        };
        NumaConfig {
            migration_rate_limit: self.migration_rate_limit,
            ..base
        }
    }

    /// Virtual memory view
    pub fn vm_config(&self) -> VmConfig {
        VmConfig {
            compression_enabled: self.enable_compression,
            ..VmConfig::new()
        }
    }

    /// Monitor view
    pub fn perf_config(&self) -> PerfConfig {
        let base = if self.max_cpus > 256 {
            PerfConfig::server()
        } else {
            PerfConfig::new()
        };
        PerfConfig {
            sampling_frequency_hz: self.sampling_frequency_hz,
            ..base
        }
    }
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self::new()
    }
}
