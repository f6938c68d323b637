//! Regression detection.
//!
//! Each (core, metric) pair keeps a short window of recent values. Values
//! leaving the window feed the baseline, except while the metric is
//! deviating, so a sustained regression is not absorbed into the baseline
//! it is measured against. A regression is raised once the window mean has
//! been worse than the baseline by more than the threshold for `sustain`
//! consecutive samples, and is not raised again until the metric recovers.

use alloc::collections::VecDeque;
use core::fmt;

use helix_topology::CoreId;

use crate::baseline::Baseline;
use crate::sample::{Metric, PerfSample};

/// Sustained deviation from baseline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceRegression {
    /// Core
    pub core: CoreId,
    /// Metric that regressed
    pub metric: Metric,
    /// Deviation in the bad direction (% of baseline)
    pub magnitude_percent: f64,
    /// Baseline value
    pub baseline: f64,
    /// Window mean
    pub current: f64,
    /// When it was detected
    pub detected_ns: u64,
}

impl fmt::Display for PerformanceRegression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} regressed {:.1}% ({:.2} -> {:.2})",
            self.core, self.metric, self.magnitude_percent, self.baseline, self.current
        )
    }
}

/// Detector settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorConfig {
    /// Baseline warm-up values
    pub warmup: u32,
    /// Baseline EMA weight
    pub alpha: f64,
    /// Recent window length
    pub window: usize,
    /// Deviation that counts as a regression (%)
    pub threshold_percent: f64,
    /// Consecutive deviating samples needed
    pub sustain: u32,
}

#[derive(Debug, Clone)]
struct Tracker {
    baseline: Baseline,
    window: VecDeque<f64>,
    sum: f64,
    streak: u32,
    latched: bool,
}

impl Tracker {
    fn new(cfg: &DetectorConfig) -> Self {
        Self {
            baseline: Baseline::new(cfg.warmup, cfg.alpha),
            window: VecDeque::with_capacity(cfg.window + 1),
            sum: 0.0,
            streak: 0,
            latched: false,
        }
    }

    /// Returns (baseline, window mean, deviation) when raised
    fn observe(&mut self, cfg: &DetectorConfig, metric: Metric, value: f64) -> Option<(f64, f64, f64)> {
        self.window.push_back(value);
        self.sum += value;
        if self.window.len() > cfg.window {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old;
                if self.streak == 0 && !self.latched {
                    self.baseline.update(old);
                }
            }
        }
        if self.window.len() < cfg.window {
            return None;
        }

        let mean = self.sum / self.window.len() as f64;
        let deviation = self.baseline.deviation_percent(mean, metric.higher_is_worse())?;
        if deviation > cfg.threshold_percent {
            self.streak = self.streak.saturating_add(1);
            if self.streak >= cfg.sustain && !self.latched {
                self.latched = true;
                return Some((self.baseline.value().unwrap_or(0.0), mean, deviation));
            }
        } else {
            self.streak = 0;
            self.latched = false;
        }
        None
    }
}

/// Regression detector for one core
#[derive(Debug, Clone)]
pub struct RegressionDetector {
    core: CoreId,
    config: DetectorConfig,
    trackers: [Tracker; Metric::ALL.len()],
}

impl RegressionDetector {
    /// Fresh detector
    pub fn new(core: CoreId, config: DetectorConfig) -> Self {
        let t = Tracker::new(&config);
        Self {
            core,
            config,
            trackers: [t.clone(), t.clone(), t.clone(), t.clone(), t],
        }
    }

    /// Feed one sample; returns regressions raised by it
    pub fn observe(&mut self, sample: &PerfSample, out: &mut alloc::vec::Vec<PerformanceRegression>) {
        for metric in Metric::ALL {
            let tracker = &mut self.trackers[metric.index()];
            if let Some((baseline, current, magnitude)) =
                tracker.observe(&self.config, metric, sample.get(metric))
            {
                out.push(PerformanceRegression {
                    core: self.core,
                    metric,
                    magnitude_percent: magnitude,
                    baseline,
                    current,
                    detected_ns: sample.timestamp_ns,
                });
            }
        }
    }

    /// Current baseline of a metric
    pub fn baseline(&self, metric: Metric) -> Option<f64> {
        self.trackers[metric.index()].baseline.value()
    }

    /// Whether a metric is currently regressed
    pub fn is_regressed(&self, metric: Metric) -> bool {
        self.trackers[metric.index()].latched
    }
}
