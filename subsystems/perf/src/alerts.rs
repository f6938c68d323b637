//! Threshold alerts.
//!
//! A rule fires for a core once its condition has held continuously for the
//! rule's duration, and fires again only after the condition has cleared.

use alloc::vec::Vec;
use core::fmt;

use hashbrown::HashMap;
use helix_topology::CoreId;

use crate::sample::{Metric, PerfSample};

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AlertSeverity {
    /// Informational
    Info,
    /// Needs attention
    Warning,
    /// Needs action
    Critical,
    /// Damage imminent
    Emergency,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Emergency => "emergency",
        };
        f.write_str(s)
    }
}

/// Direction of a threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// Strictly above
    Above,
    /// Strictly below
    Below,
}

impl Comparison {
    fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Above => value > threshold,
            Comparison::Below => value < threshold,
        }
    }
}

/// One alert rule
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertRule {
    /// Rule id
    pub id: u32,
    /// Metric watched
    pub metric: Metric,
    /// Threshold
    pub threshold: f64,
    /// Direction
    pub comparison: Comparison,
    /// Severity when fired
    pub severity: AlertSeverity,
    /// How long the condition must hold (ns)
    pub duration_ns: u64,
    /// Rule active
    pub enabled: bool,
}

const SEC: u64 = 1_000_000_000;

/// Built-in rules: sustained high utilisation, overheating, bandwidth
/// saturation
pub const DEFAULT_RULES: [AlertRule; 3] = [
    AlertRule {
        id: 1,
        metric: Metric::Utilization,
        threshold: 90.0,
        comparison: Comparison::Above,
        severity: AlertSeverity::Warning,
        duration_ns: 60 * SEC,
        enabled: true,
    },
    AlertRule {
        id: 2,
        metric: Metric::Temperature,
        threshold: 90.0,
        comparison: Comparison::Above,
        severity: AlertSeverity::Critical,
        duration_ns: 10 * SEC,
        enabled: true,
    },
    AlertRule {
        id: 3,
        metric: Metric::MemoryBandwidth,
        threshold: 80.0,
        comparison: Comparison::Above,
        severity: AlertSeverity::Warning,
        duration_ns: 30 * SEC,
        enabled: true,
    },
];

/// Fired alert
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Alert {
    /// Rule that fired
    pub rule_id: u32,
    /// Core
    pub core: CoreId,
    /// Metric
    pub metric: Metric,
    /// Severity
    pub severity: AlertSeverity,
    /// Value that fired it
    pub value: f64,
    /// Rule threshold
    pub threshold: f64,
    /// When
    pub timestamp_ns: u64,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    since_ns: u64,
    fired: bool,
}

/// Evaluates rules against samples
#[derive(Debug, Clone)]
pub struct AlertEngine {
    rules: Vec<AlertRule>,
    pending: HashMap<(u32, CoreId), Pending>,
}

impl AlertEngine {
    /// Engine with [`DEFAULT_RULES`]
    pub fn new() -> Self {
        Self::with_rules(DEFAULT_RULES.to_vec())
    }

    /// Engine with custom rules
    pub fn with_rules(rules: Vec<AlertRule>) -> Self {
        Self {
            rules,
            pending: HashMap::new(),
        }
    }

    /// Add or replace a rule by id
    pub fn set_rule(&mut self, rule: AlertRule) {
        match self.rules.iter_mut().find(|r| r.id == rule.id) {
            Some(r) => *r = rule,
            None => self.rules.push(rule),
        }
        self.pending.retain(|(id, _), _| *id != rule.id);
    }

    /// Rules in order
    pub fn rules(&self) -> &[AlertRule] {
        &self.rules
    }

    /// Alerts currently firing
    pub fn active(&self) -> usize {
        self.pending.values().filter(|p| p.fired).count()
    }

    /// Check one sample
    pub fn evaluate(&mut self, sample: &PerfSample, out: &mut Vec<Alert>) {
        for rule in self.rules.iter().filter(|r| r.enabled) {
            let key = (rule.id, sample.core);
            let value = sample.get(rule.metric);
            if !rule.comparison.holds(value, rule.threshold) {
                self.pending.remove(&key);
                continue;
            }
            let p = self.pending.entry(key).or_insert(Pending {
                since_ns: sample.timestamp_ns,
                fired: false,
            });
            if !p.fired && sample.timestamp_ns.saturating_sub(p.since_ns) >= rule.duration_ns {
                p.fired = true;
                out.push(Alert {
                    rule_id: rule.id,
                    core: sample.core,
                    metric: rule.metric,
                    severity: rule.severity,
                    value,
                    threshold: rule.threshold,
                    timestamp_ns: sample.timestamp_ns,
                });
            }
        }
    }

    /// Forget a core's pending state
    pub fn forget_core(&mut self, core: CoreId) {
        self.pending.retain(|(_, c), _| *c != core);
    }
}

impl Default for AlertEngine {
    fn default() -> Self {
        Self::new()
    }
}
