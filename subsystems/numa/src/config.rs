//! NUMA manager configuration.

use crate::error::{NumaError, NumaResult};
use crate::types::AllocPolicy;

/// Nanoseconds per second
pub const NS_PER_SEC: u64 = 1_000_000_000;

/// NUMA manager settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumaConfig {
    /// Completed migrations allowed in any one-second window
    pub migration_rate_limit: u32,
    /// Remote/total access ratio above which a node is rebalanced
    pub remote_ratio_threshold: f32,
    /// Balancing cadence (ns)
    pub balance_interval_ns: u64,
    /// Utilisation above which `Auto` avoids a node
    pub pressure_threshold: f32,
    /// Run the automatic balancer
    pub balancing_enabled: bool,
    /// Policy for callers without one
    pub default_policy: AllocPolicy,
}

impl NumaConfig {
    /// Default settings
    pub const fn new() -> Self {
        Self {
            migration_rate_limit: 256,
            remote_ratio_threshold: 0.5,
            balance_interval_ns: 100_000_000,
            pressure_threshold: 0.9,
            balancing_enabled: true,
            default_policy: AllocPolicy::Auto,
        }
    }

    /// Small machines: fewer migrations, slower balancing
    pub const fn small() -> Self {
        Self {
            migration_rate_limit: 64,
            balance_interval_ns: 500_000_000,
            ..Self::new()
        }
    }

    /// Large servers: more migration bandwidth
    pub const fn server() -> Self {
        Self {
            migration_rate_limit: 4096,
            remote_ratio_threshold: 0.3,
            balance_interval_ns: 50_000_000,
            ..Self::new()
        }
    }

    /// Check invariants
    pub fn validate(&self) -> NumaResult<()> {
        if self.migration_rate_limit == 0 {
            return Err(NumaError::InvalidConfig("migration_rate_limit must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.remote_ratio_threshold) {
            return Err(NumaError::InvalidConfig("remote_ratio_threshold must be in 0..=1"));
        }
        if !(0.0..=1.0).contains(&self.pressure_threshold) {
            return Err(NumaError::InvalidConfig("pressure_threshold must be in 0..=1"));
        }
        if self.balance_interval_ns == 0 {
            return Err(NumaError::InvalidConfig("balance_interval_ns must be non-zero"));
        }
        Ok(())
    }
}

impl Default for NumaConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Runtime retuning; `None` keeps the current value
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NumaTuning {
    /// New migration rate limit
    pub migration_rate_limit: Option<u32>,
    /// New remote-ratio threshold
    pub remote_ratio_threshold: Option<f32>,
    /// New balancing cadence (ns)
    pub balance_interval_ns: Option<u64>,
}

impl NumaTuning {
    /// Apply onto a config copy
    pub fn applied_to(&self, mut config: NumaConfig) -> NumaConfig {
        if let Some(v) = self.migration_rate_limit {
            config.migration_rate_limit = v;
        }
        if let Some(v) = self.remote_ratio_threshold {
            config.remote_ratio_threshold = v;
        }
        if let Some(v) = self.balance_interval_ns {
            config.balance_interval_ns = v;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        assert!(NumaConfig::new().validate().is_ok());
        assert!(NumaConfig::small().validate().is_ok());
        assert!(NumaConfig::server().validate().is_ok());
    }

    #[test]
    fn test_tuning_overrides_only_given_fields() {
        let tuned = NumaTuning {
            migration_rate_limit: Some(10),
            ..Default::default()
        }
        .applied_to(NumaConfig::new());
        assert_eq!(tuned.migration_rate_limit, 10);
        assert_eq!(tuned.balance_interval_ns, NumaConfig::new().balance_interval_ns);

        let bad = NumaTuning {
            remote_ratio_threshold: Some(1.5),
            ..Default::default()
        }
        .applied_to(NumaConfig::new());
        assert!(bad.validate().is_err());
    }
}
