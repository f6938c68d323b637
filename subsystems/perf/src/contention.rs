//! Resource contention analysis.

use alloc::vec::Vec;
use core::fmt;

use helix_topology::CoreId;

use crate::sample::PerfSample;

/// Dominant contended resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentionKind {
    /// Nothing over its threshold
    None,
    /// Cores saturated
    Cpu,
    /// Cache thrashing
    Cache,
    /// Memory bandwidth saturated
    Memory,
    /// Running hot
    Thermal,
}

impl fmt::Display for ContentionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Cpu => "cpu",
            Self::Cache => "cache",
            Self::Memory => "memory",
            Self::Thermal => "thermal",
        };
        f.write_str(name)
    }
}

/// Levels at which a resource counts as contended
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContentionThresholds {
    /// Mean utilisation (%)
    pub utilization: f64,
    /// Mean cache miss rate (%)
    pub cache_miss_rate: f64,
    /// Mean memory bandwidth (%)
    pub memory_bandwidth: f64,
    /// Hottest core (°C)
    pub temperature_c: f64,
}

impl ContentionThresholds {
    /// Default levels
    pub const fn new() -> Self {
        Self {
            utilization: 85.0,
            cache_miss_rate: 10.0,
            memory_bandwidth: 75.0,
            temperature_c: 85.0,
        }
    }
}

impl Default for ContentionThresholds {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of one analysis
#[derive(Debug, Clone, PartialEq)]
pub struct ContentionReport {
    /// Worst resource at or over its threshold
    pub dominant: ContentionKind,
    /// Observed level over threshold for cpu, cache, memory, thermal
    pub scores: [f64; 4],
    /// Cores over any threshold
    pub hot_cores: Vec<CoreId>,
}

impl ContentionReport {
    /// Nothing contended
    pub fn quiet() -> Self {
        Self {
            dominant: ContentionKind::None,
            scores: [0.0; 4],
            hot_cores: Vec::new(),
        }
    }
}

const KINDS: [ContentionKind; 4] = [
    ContentionKind::Cpu,
    ContentionKind::Cache,
    ContentionKind::Memory,
    ContentionKind::Thermal,
];

/// Analyse the latest sample of every core
pub fn analyze(samples: &[PerfSample], t: &ContentionThresholds) -> ContentionReport {
    if samples.is_empty() {
        return ContentionReport::quiet();
    }
    let n = samples.len() as f64;
    let mean = |f: fn(&PerfSample) -> f32| samples.iter().map(|s| f64::from(f(s))).sum::<f64>() / n;
    let hottest = samples
        .iter()
        .map(|s| f64::from(s.temperature_c))
        .fold(f64::MIN, f64::max);

    let ratio = |v: f64, limit: f64| if limit > 0.0 { v / limit } else { 0.0 };
    let scores = [
        ratio(mean(|s| s.utilization), t.utilization),
        ratio(mean(|s| s.cache_miss_rate), t.cache_miss_rate),
        ratio(mean(|s| s.memory_bandwidth), t.memory_bandwidth),
        ratio(hottest, t.temperature_c),
    ];

    // ties go to the earlier kind
    let mut dominant = ContentionKind::None;
    let mut best = 0.0;
    for (kind, score) in KINDS.iter().zip(scores.iter()) {
        if *score >= 1.0 && *score > best {
            dominant = *kind;
            best = *score;
        }
    }

    let hot_cores = samples
        .iter()
        .filter(|s| {
            f64::from(s.utilization) >= t.utilization
                || f64::from(s.cache_miss_rate) >= t.cache_miss_rate
                || f64::from(s.memory_bandwidth) >= t.memory_bandwidth
                || f64::from(s.temperature_c) >= t.temperature_c
        })
        .map(|s| s.core)
        .collect();

    ContentionReport {
        dominant,
        scores,
        hot_cores,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(core: u32, util: f32, miss: f32, bw: f32, temp: f32) -> PerfSample {
        PerfSample {
            utilization: util,
            cache_miss_rate: miss,
            memory_bandwidth: bw,
            temperature_c: temp,
            ..PerfSample::idle(CoreId(core), 0)
        }
    }

    #[test]
    fn test_quiet_system() {
        let t = ContentionThresholds::new();
        let r = analyze(&[s(0, 40.0, 2.0, 10.0, 50.0), s(1, 30.0, 1.0, 5.0, 48.0)], &t);
        assert_eq!(r.dominant, ContentionKind::None);
        assert!(r.hot_cores.is_empty());
        assert_eq!(analyze(&[], &t), ContentionReport::quiet());
    }

    #[test]
    fn test_worst_resource_wins() {
        let t = ContentionThresholds::new();
        // utilisation 90/85, bandwidth 90/75
        let r = analyze(&[s(0, 90.0, 2.0, 90.0, 50.0), s(1, 90.0, 2.0, 90.0, 50.0)], &t);
        assert_eq!(r.dominant, ContentionKind::Memory);
        assert_eq!(r.hot_cores, [CoreId(0), CoreId(1)]);
    }

    #[test]
    fn test_one_hot_core_is_thermal() {
        let t = ContentionThresholds::new();
        let r = analyze(&[s(0, 20.0, 1.0, 5.0, 50.0), s(3, 20.0, 1.0, 5.0, 95.0)], &t);
        assert_eq!(r.dominant, ContentionKind::Thermal);
        assert_eq!(r.hot_cores, [CoreId(3)]);
    }
}
