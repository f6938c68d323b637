//! # Helix Perf
//!
//! Per-core performance monitoring with closed-loop, advisory tuning.
//!
//! ## Components
//!
//! - **Samples**: counter deltas turned into utilisation, IPC, cache miss
//!   rate, memory bandwidth and temperature per core
//! - **Rings**: one seqlock ring per core, single writer, lock-free readers
//! - **Baselines**: warm-up mean then EMA, per core and metric
//! - **Regressions**: sustained window-mean deviation from baseline
//! - **Contention**: which resource is saturated, and where
//! - **Prediction**: least-squares trends
//! - **Alerts**: duration-qualified threshold rules
//! - **Auto-tuning**: [`TuningDirective`]s for the scheduler, NUMA manager
//!   and power governor; applying them is the caller's decision

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(test)]
extern crate std;

// ============================================================================
// SUBMODULES
// ============================================================================

pub mod alerts;
pub mod baseline;
pub mod config;
pub mod contention;
pub mod error;
pub mod export;
pub mod monitor;
pub mod predict;
pub mod regression;
pub mod report;
pub mod ring;
pub mod sample;
pub mod tuner;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use alerts::{Alert, AlertEngine, AlertRule, AlertSeverity, Comparison, DEFAULT_RULES};
pub use baseline::Baseline;
pub use config::PerfConfig;
pub use contention::{ContentionKind, ContentionReport, ContentionThresholds};
pub use error::{PerfError, PerfResult};
pub use export::{samples_to_csv, CSV_HEADER};
pub use monitor::{PerfStats, PerfTick, PerformanceMonitor};
pub use predict::Prediction;
pub use regression::{DetectorConfig, PerformanceRegression, RegressionDetector};
pub use report::{CoreReport, OptimizationAction, PerfReport, Recommendation};
pub use ring::{RingWriter, SampleRing};
pub use sample::{CounterReading, CounterSource, ManualCounters, Metric, PerfSample};
pub use tuner::{AutoTuner, TuningDirective, TuningRecord};
