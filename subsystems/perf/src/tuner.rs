//! Advisory auto-tuning.
//!
//! The tuner only produces [`TuningDirective`] values. Whoever owns the
//! scheduler and the NUMA manager decides whether and how to apply them
//! through their tuning interfaces.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::fmt;

use crate::contention::{ContentionKind, ContentionReport};
use crate::regression::PerformanceRegression;
use crate::sample::Metric;

/// Parameter change suggested to another subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TuningDirective {
    /// Multiply the scheduler's balancing interval by `percent` / 100
    ScaleBalanceInterval {
        /// New interval relative to the current one
        percent: u32,
    },
    /// Multiply the NUMA migration rate limit by `percent` / 100
    ScaleMigrationRate {
        /// New limit relative to the current one
        percent: u32,
    },
    /// Raise (positive) or lower the power governor's utilisation
    /// thresholds, in percentage points
    ShiftPowerThresholds {
        /// Shift in points
        delta: i8,
    },
}

impl fmt::Display for TuningDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScaleBalanceInterval { percent } => write!(f, "balance interval x{}%", percent),
            Self::ScaleMigrationRate { percent } => write!(f, "migration rate x{}%", percent),
            Self::ShiftPowerThresholds { delta } => write!(f, "power thresholds {:+}", delta),
        }
    }
}

/// Directive answering a contended resource
pub const fn for_contention(kind: ContentionKind) -> Option<TuningDirective> {
    match kind {
        ContentionKind::None => None,
        // balance more often
        ContentionKind::Cpu => Some(TuningDirective::ScaleBalanceInterval { percent: 50 }),
        // keep units on warm caches longer
        ContentionKind::Cache => Some(TuningDirective::ScaleBalanceInterval { percent: 200 }),
        // pull pages local faster
        ContentionKind::Memory => Some(TuningDirective::ScaleMigrationRate { percent: 200 }),
        ContentionKind::Thermal => Some(TuningDirective::ShiftPowerThresholds { delta: 10 }),
    }
}

/// Directive answering a regressed metric
pub const fn for_regression(metric: Metric) -> TuningDirective {
    match metric {
        Metric::Utilization => TuningDirective::ScaleBalanceInterval { percent: 50 },
        Metric::Ipc | Metric::CacheMissRate => TuningDirective::ScaleBalanceInterval { percent: 200 },
        Metric::MemoryBandwidth => TuningDirective::ScaleMigrationRate { percent: 200 },
        Metric::Temperature => TuningDirective::ShiftPowerThresholds { delta: 10 },
    }
}

/// Issued directive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuningRecord {
    /// When
    pub issued_ns: u64,
    /// What
    pub directive: TuningDirective,
}

const HISTORY: usize = 64;

/// Rate-limited directive source
#[derive(Debug, Clone)]
pub struct AutoTuner {
    cooldown_ns: u64,
    last_issue_ns: Option<u64>,
    history: VecDeque<TuningRecord>,
}

impl AutoTuner {
    /// Tuner issuing at most one batch per `cooldown_ns`
    pub fn new(cooldown_ns: u64) -> Self {
        Self {
            cooldown_ns,
            last_issue_ns: None,
            history: VecDeque::with_capacity(HISTORY),
        }
    }

    /// Directives for this round, empty while cooling down
    pub fn advise(
        &mut self,
        now_ns: u64,
        regressions: &[PerformanceRegression],
        contention: &ContentionReport,
    ) -> Vec<TuningDirective> {
        if let Some(last) = self.last_issue_ns {
            if now_ns.saturating_sub(last) < self.cooldown_ns {
                return Vec::new();
            }
        }

        let mut out: Vec<TuningDirective> = Vec::new();
        let candidates = for_contention(contention.dominant)
            .into_iter()
            .chain(regressions.iter().map(|r| for_regression(r.metric)));
        for d in candidates {
            // one directive per knob; first wins
            let same_knob = out
                .iter()
                .any(|o| core::mem::discriminant(o) == core::mem::discriminant(&d));
            if !same_knob {
                out.push(d);
            }
        }

        if !out.is_empty() {
            self.last_issue_ns = Some(now_ns);
            for d in &out {
                if self.history.len() == HISTORY {
                    self.history.pop_front();
                }
                self.history.push_back(TuningRecord {
                    issued_ns: now_ns,
                    directive: *d,
                });
                log::debug!("auto-tune: {}", d);
            }
        }
        out
    }

    /// Recent directives, oldest first
    pub fn history(&self) -> impl Iterator<Item = &TuningRecord> {
        self.history.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helix_topology::CoreId;

    fn regression(metric: Metric) -> PerformanceRegression {
        PerformanceRegression {
            core: CoreId(0),
            metric,
            magnitude_percent: 30.0,
            baseline: 1.0,
            current: 1.3,
            detected_ns: 0,
        }
    }

    fn contended(kind: ContentionKind) -> ContentionReport {
        ContentionReport {
            dominant: kind,
            ..ContentionReport::quiet()
        }
    }

    #[test]
    fn test_contention_takes_precedence_per_knob() {
        let mut t = AutoTuner::new(1_000);
        let out = t.advise(
            0,
            &[regression(Metric::Utilization), regression(Metric::Temperature)],
            &contended(ContentionKind::Cache),
        );
        assert_eq!(
            out,
            [
                TuningDirective::ScaleBalanceInterval { percent: 200 },
                TuningDirective::ShiftPowerThresholds { delta: 10 },
            ]
        );
        assert_eq!(t.history().count(), 2);
    }

    #[test]
    fn test_cooldown() {
        let mut t = AutoTuner::new(1_000);
        let cpu = contended(ContentionKind::Cpu);
        assert_eq!(t.advise(0, &[], &cpu).len(), 1);
        assert!(t.advise(999, &[], &cpu).is_empty());
        assert_eq!(t.advise(1_000, &[], &cpu).len(), 1);
    }

    #[test]
    fn test_quiet_issues_nothing_and_keeps_window_open() {
        let mut t = AutoTuner::new(1_000);
        assert!(t.advise(0, &[], &ContentionReport::quiet()).is_empty());
        assert_eq!(t.advise(1, &[], &contended(ContentionKind::Memory)).len(), 1);
    }
}
