//! Reports and recommendations.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use helix_topology::CoreId;

use crate::contention::{ContentionKind, ContentionReport};
use crate::export::samples_to_csv;
use crate::predict::Prediction;
use crate::regression::PerformanceRegression;
use crate::sample::PerfSample;
use crate::tuner::{self, TuningDirective};

/// One core in a report
#[derive(Debug, Clone, PartialEq)]
pub struct CoreReport {
    /// Core
    pub core: CoreId,
    /// Newest sample
    pub latest: PerfSample,
    /// Utilisation baseline, once warm
    pub utilization_baseline: Option<f64>,
    /// Any metric currently regressed
    pub regressed: bool,
}

/// Point-in-time view of the whole machine
#[derive(Debug, Clone, PartialEq)]
pub struct PerfReport {
    /// When the report was taken
    pub timestamp_ns: u64,
    /// Topology generation the report covers
    pub generation: u64,
    /// Cores with at least one sample, ascending id
    pub cores: Vec<CoreReport>,
    /// Mean utilisation (%)
    pub mean_utilization: f64,
    /// Mean IPC
    pub mean_ipc: f64,
    /// Mean cache miss rate (%)
    pub mean_cache_miss_rate: f64,
    /// Mean memory bandwidth (%)
    pub mean_memory_bandwidth: f64,
    /// Hottest core (°C)
    pub max_temperature_c: f64,
    /// Contention over the newest samples
    pub contention: ContentionReport,
    /// Machine-wide trends
    pub predictions: Vec<Prediction>,
    /// Alerts currently firing
    pub active_alerts: usize,
    /// Most recent regressions, oldest first
    pub recent_regressions: Vec<PerformanceRegression>,
}

impl PerfReport {
    /// Newest sample of every core as CSV
    pub fn to_csv(&self) -> String {
        samples_to_csv(self.cores.iter().map(|c| &c.latest))
    }
}

/// What the monitor suggests doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptimizationAction {
    /// Nothing to do
    None,
    /// Spread work across more cores
    Rebalance,
    /// Keep work near its caches
    ImproveLocality,
    /// Move pages next to their users
    MigrateMemory,
    /// Trade speed for temperature
    ReduceHeat,
}

impl fmt::Display for OptimizationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Rebalance => "rebalance",
            Self::ImproveLocality => "improve cache locality",
            Self::MigrateMemory => "migrate memory",
            Self::ReduceHeat => "reduce heat",
        };
        f.write_str(s)
    }
}

/// Result of `optimize`
#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    /// Suggested action
    pub action: OptimizationAction,
    /// Resource that prompted it
    pub cause: ContentionKind,
    /// Expected gain (%)
    pub expected_improvement_percent: f64,
    /// Confidence, 0..=1
    pub confidence: f64,
    /// Concrete parameter changes
    pub directives: Vec<TuningDirective>,
}

impl Recommendation {
    /// Recommendation for a contended resource
    pub fn for_contention(cause: ContentionKind) -> Self {
        let (action, gain, confidence) = match cause {
            ContentionKind::None => (OptimizationAction::None, 0.0, 1.0),
            ContentionKind::Cpu => (OptimizationAction::Rebalance, 10.0, 0.9),
            ContentionKind::Cache => (OptimizationAction::ImproveLocality, 12.0, 0.85),
            ContentionKind::Memory => (OptimizationAction::MigrateMemory, 15.0, 0.8),
            ContentionKind::Thermal => (OptimizationAction::ReduceHeat, 8.0, 0.75),
        };
        Self {
            action,
            cause,
            expected_improvement_percent: gain,
            confidence,
            directives: tuner::for_contention(cause).into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recommendation_table() {
        let quiet = Recommendation::for_contention(ContentionKind::None);
        assert_eq!(quiet.action, OptimizationAction::None);
        assert!(quiet.directives.is_empty());

        let mem = Recommendation::for_contention(ContentionKind::Memory);
        assert_eq!(mem.action, OptimizationAction::MigrateMemory);
        assert_eq!(mem.expected_improvement_percent, 15.0);
        assert_eq!(mem.directives, [TuningDirective::ScaleMigrationRate { percent: 200 }]);
    }
}
