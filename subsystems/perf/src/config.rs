//! Monitor configuration.

use crate::contention::ContentionThresholds;
use crate::error::{PerfError, PerfResult};
use crate::regression::DetectorConfig;

/// Performance monitor settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerfConfig {
    /// Samples per second per core
    pub sampling_frequency_hz: u32,
    /// Samples retained per core
    pub ring_capacity: usize,
    /// Values averaged before a baseline is trusted
    pub baseline_warmup: u32,
    /// Baseline EMA weight once warm
    pub baseline_alpha: f64,
    /// Recent samples compared against the baseline
    pub regression_window: usize,
    /// Deviation that counts as a regression (%)
    pub regression_threshold_percent: f64,
    /// Consecutive deviating samples before a regression is raised
    pub regression_sustain: u32,
    /// Samples per core fed to trend prediction
    pub prediction_window: usize,
    /// How far ahead predictions look (ns)
    pub prediction_horizon_ns: u64,
    /// Produce tuning directives
    pub enable_auto_tuning: bool,
    /// Minimum gap between directive batches (ns)
    pub tuning_cooldown_ns: u64,
    /// Contention levels
    pub contention: ContentionThresholds,
    /// Peak memory bandwidth of one core (bytes/s)
    pub peak_bandwidth_bytes_per_sec: u64,
}

impl PerfConfig {
    /// Default settings
    pub const fn new() -> Self {
        Self {
            sampling_frequency_hz: 100,
            ring_capacity: 256,
            baseline_warmup: 16,
            baseline_alpha: 0.05,
            regression_window: 8,
            regression_threshold_percent: 20.0,
            regression_sustain: 3,
            prediction_window: 32,
            prediction_horizon_ns: 1_000_000_000,
            enable_auto_tuning: true,
            tuning_cooldown_ns: 5_000_000_000,
            contention: ContentionThresholds::new(),
            peak_bandwidth_bytes_per_sec: 10_000_000_000,
        }
    }

    /// Small machines: slower sampling, shorter history
    pub const fn small() -> Self {
        Self {
            sampling_frequency_hz: 10,
            ring_capacity: 64,
            prediction_window: 16,
            ..Self::new()
        }
    }

    /// Large servers: longer history
    pub const fn server() -> Self {
        Self {
            ring_capacity: 1024,
            prediction_window: 64,
            peak_bandwidth_bytes_per_sec: 20_000_000_000,
            ..Self::new()
        }
    }

    /// Nanoseconds between samples
    pub const fn sample_interval_ns(&self) -> u64 {
        let hz = if self.sampling_frequency_hz == 0 { 1 } else { self.sampling_frequency_hz };
        1_000_000_000 / hz as u64
    }

    /// Regression detector view
    pub const fn detector(&self) -> DetectorConfig {
        DetectorConfig {
            warmup: self.baseline_warmup,
            alpha: self.baseline_alpha,
            window: self.regression_window,
            threshold_percent: self.regression_threshold_percent,
            sustain: self.regression_sustain,
        }
    }

    /// Check invariants
    pub fn validate(&self) -> PerfResult<()> {
        if self.sampling_frequency_hz == 0 || self.sampling_frequency_hz > 1_000_000 {
            return Err(PerfError::InvalidConfig("sampling_frequency_hz out of range"));
        }
        if self.ring_capacity == 0 || self.regression_window == 0 {
            return Err(PerfError::InvalidConfig("ring and window sizes must be non-zero"));
        }
        if self.regression_window > self.ring_capacity {
            return Err(PerfError::InvalidConfig("regression window exceeds ring capacity"));
        }
        if !(self.baseline_alpha > 0.0 && self.baseline_alpha <= 1.0) {
            return Err(PerfError::InvalidConfig("baseline_alpha must be in (0, 1]"));
        }
        if !(self.regression_threshold_percent > 0.0) {
            return Err(PerfError::InvalidConfig("regression threshold must be positive"));
        }
        if self.regression_sustain == 0 {
            return Err(PerfError::InvalidConfig("regression_sustain must be non-zero"));
        }
        if self.prediction_window < 2 {
            return Err(PerfError::InvalidConfig("prediction_window needs two samples"));
        }
        Ok(())
    }
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        assert!(PerfConfig::new().validate().is_ok());
        assert!(PerfConfig::small().validate().is_ok());
        assert!(PerfConfig::server().validate().is_ok());
        assert_eq!(PerfConfig::new().sample_interval_ns(), 10_000_000);
    }

    #[test]
    fn test_rejects_bad_values() {
        let zero_hz = PerfConfig {
            sampling_frequency_hz: 0,
            ..PerfConfig::new()
        };
        assert!(zero_hz.validate().is_err());
        let nan_alpha = PerfConfig {
            baseline_alpha: f64::NAN,
            ..PerfConfig::new()
        };
        assert!(nan_alpha.validate().is_err());
        let wide = PerfConfig {
            regression_window: 512,
            ..PerfConfig::new()
        };
        assert!(wide.validate().is_err());
    }
}
