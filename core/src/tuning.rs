//! Auto-tuning routing.
//!
//! The monitor only emits [`TuningDirective`] values. This module turns
//! them into calls on the scheduler's and NUMA manager's tuning entry
//! points. Scaled values stay within a factor of four of what was
//! configured at init so a run of directives cannot drift without bound.

use helix_execution::{PowerThresholds, SchedTuning, Scheduler};
use helix_numa::{NumaManager, NumaTuning};
use helix_perf::TuningDirective;

use crate::config::ScaleConfig;
use crate::error::ScaleResult;

/// Furthest a scaled parameter may move from its configured value
pub const TUNING_RANGE: u64 = 4;

fn scaled(current: u64, percent: u32, configured: u64) -> u64 {
    let next = current.saturating_mul(percent as u64) / 100;
    let lo = (configured / TUNING_RANGE).max(1);
    let hi = configured.saturating_mul(TUNING_RANGE);
    next.clamp(lo, hi)
}

fn shifted(t: PowerThresholds, delta: i8) -> PowerThresholds {
    let shift = |v: u8| (v as i16 + delta as i16).clamp(0, 100) as u8;
    PowerThresholds {
        performance_above: shift(t.performance_above),
        balanced_above: shift(t.balanced_above),
        powersave_above: shift(t.powersave_above),
        sustain: t.sustain,
    }
}

/// Apply one directive; `Ok(false)` if it would change nothing
pub(crate) fn route(
    directive: TuningDirective,
    configured: &ScaleConfig,
    scheduler: &Scheduler,
    numa: &NumaManager,
) -> ScaleResult<bool> {
    match directive {
        TuningDirective::ScaleBalanceInterval { percent } => {
            let current = scheduler.config().balance_interval_ns;
            let next = scaled(current, percent, configured.balance_interval_ns);
            if next == current {
                return Ok(false);
            }
            scheduler.apply_tuning(SchedTuning {
                balance_interval_ns: Some(next),
                ..SchedTuning::default()
            })?;
            log::debug!("Tuning: balance interval {} -> {} ns", current, next);
        },
        TuningDirective::ScaleMigrationRate { percent } => {
            let current = numa.config().migration_rate_limit;
            let next = scaled(current as u64, percent, configured.migration_rate_limit as u64);
            let next = next.min(u32::MAX as u64) as u32;
            if next == current {
                return Ok(false);
            }
            numa.apply_tuning(NumaTuning {
                migration_rate_limit: Some(next),
                ..NumaTuning::default()
            })?;
            log::debug!("Tuning: migration rate {} -> {}/s", current, next);
        },
        TuningDirective::ShiftPowerThresholds { delta } => {
            let current = scheduler.config().power;
            let next = shifted(current, delta);
            if next == current || next.validate().is_err() {
                return Ok(false);
            }
            scheduler.apply_tuning(SchedTuning {
                power: Some(next),
                ..SchedTuning::default()
            })?;
            log::debug!(
                "Tuning: power thresholds {}/{}/{}",
                next.performance_above,
                next.balanced_above,
                next.powersave_above
            );
        },
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use helix_execution::SchedConfig;
    use helix_numa::NumaConfig;
    use helix_topology::{StaticProbe, Topology};

    fn parts() -> (ScaleConfig, Scheduler, NumaManager) {
        let config = ScaleConfig::small();
        let topo = Arc::new(Topology::discover(&StaticProbe::uniform(1, 4, 4, 4096, 10)).unwrap());
        let sched = Scheduler::new(topo.clone(), config.sched_config()).unwrap();
        let numa = NumaManager::new(topo, config.numa_config()).unwrap();
        (config, sched, numa)
    }

    #[test]
    fn test_scaling_is_clamped() {
        assert_eq!(scaled(100, 50, 100), 50);
        assert_eq!(scaled(30, 50, 100), 25);
        assert_eq!(scaled(390, 200, 100), 400);
        assert_eq!(scaled(1, 50, 1), 1);
    }

    #[test]
    fn test_balance_interval_directive_reaches_scheduler() {
        let (config, sched, numa) = parts();
        let d = TuningDirective::ScaleBalanceInterval { percent: 50 };
        assert_eq!(route(d, &config, &sched, &numa), Ok(true));
        assert_eq!(sched.config().balance_interval_ns, config.balance_interval_ns / 2);
        assert_eq!(route(d, &config, &sched, &numa), Ok(true));
        // Floor reached
        assert_eq!(route(d, &config, &sched, &numa), Ok(false));
        assert_eq!(sched.config().balance_interval_ns, config.balance_interval_ns / 4);
    }

    #[test]
    fn test_migration_directive_reaches_numa() {
        let (config, sched, numa) = parts();
        let d = TuningDirective::ScaleMigrationRate { percent: 200 };
        assert_eq!(route(d, &config, &sched, &numa), Ok(true));
        assert_eq!(numa.config().migration_rate_limit, config.migration_rate_limit * 2);
        assert_eq!(NumaConfig::small().migration_rate_limit, config.migration_rate_limit);
    }

    #[test]
    fn test_power_shift_skipped_when_invalid() {
        let (config, sched, numa) = parts();
        let up = TuningDirective::ShiftPowerThresholds { delta: 10 };
        assert_eq!(route(up, &config, &sched, &numa), Ok(true));
        assert_eq!(sched.config().power.performance_above, SchedConfig::new().power.performance_above + 10);
        // 85 and 40 both clamp to 100, so the shifted set is out of order
        // and refused
        let big = TuningDirective::ShiftPowerThresholds { delta: 60 };
        assert_eq!(route(big, &config, &sched, &numa), Ok(false));
        assert_eq!(sched.config().power.performance_above, 85);
    }
}
