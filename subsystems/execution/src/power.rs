//! Per-core power governor.
//!
//! Utilisation samples move a core between power states once the same
//! target has been seen `sustain` times in a row. A temperature at or above
//! the thermal limit forces an immediate downgrade and caps the core at that
//! state until it cools below `limit - hysteresis`.

use hashbrown::HashMap;
use helix_topology::{CoreId, PowerState};
use spin::{Mutex, RwLock};

use crate::error::{SchedError, SchedResult};
use crate::events::SchedEvent;

/// Utilisation thresholds, in percent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerThresholds {
    /// At or above: `Performance`
    pub performance_above: u8,
    /// At or above: `Balanced`
    pub balanced_above: u8,
    /// At or above: `PowerSave`; below: `Sleep`
    pub powersave_above: u8,
    /// Consecutive samples before a change
    pub sustain: u32,
}

impl PowerThresholds {
    /// Default thresholds
    pub const fn new() -> Self {
        Self {
            performance_above: 75,
            balanced_above: 30,
            powersave_above: 5,
            sustain: 3,
        }
    }

    /// State a utilisation sample asks for
    pub fn target(&self, util_percent: u8) -> PowerState {
        if util_percent >= self.performance_above {
            PowerState::Performance
        } else if util_percent >= self.balanced_above {
            PowerState::Balanced
        } else if util_percent >= self.powersave_above {
            PowerState::PowerSave
        } else {
            PowerState::Sleep
        }
    }

    /// Check ordering
    pub fn validate(&self) -> SchedResult<()> {
        if self.performance_above > 100 {
            return Err(SchedError::InvalidConfig("performance threshold above 100%"));
        }
        if !(self.performance_above > self.balanced_above && self.balanced_above > self.powersave_above) {
            return Err(SchedError::InvalidConfig("power thresholds must strictly decrease"));
        }
        if self.sustain == 0 {
            return Err(SchedError::InvalidConfig("power sustain must be non-zero"));
        }
        Ok(())
    }
}

impl Default for PowerThresholds {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
struct CoreGovernor {
    state: PowerState,
    candidate: PowerState,
    streak: u32,
    /// Fastest state allowed while hot
    cap: Option<PowerState>,
}

impl CoreGovernor {
    const fn new() -> Self {
        Self {
            state: PowerState::Performance,
            candidate: PowerState::Performance,
            streak: 0,
            cap: None,
        }
    }
}

/// Power state machine for every online core
#[derive(Debug)]
pub struct PowerGovernor {
    cores: RwLock<HashMap<CoreId, Mutex<CoreGovernor>>>,
    thresholds: RwLock<PowerThresholds>,
    thermal_limit_c: u32,
    hysteresis_c: u32,
}

impl PowerGovernor {
    /// Governor for `cores`, all starting at `Performance`
    pub fn new(
        cores: impl IntoIterator<Item = CoreId>,
        thresholds: PowerThresholds,
        thermal_limit_c: u32,
        hysteresis_c: u32,
    ) -> Self {
        let map = cores
            .into_iter()
            .map(|c| (c, Mutex::new(CoreGovernor::new())))
            .collect();
        Self {
            cores: RwLock::new(map),
            thresholds: RwLock::new(thresholds),
            thermal_limit_c,
            hysteresis_c,
        }
    }

    /// Start governing a new core
    pub fn add_core(&self, core: CoreId) {
        self.cores
            .write()
            .entry(core)
            .or_insert_with(|| Mutex::new(CoreGovernor::new()));
    }

    /// Stop governing a core
    pub fn remove_core(&self, core: CoreId) {
        self.cores.write().remove(&core);
    }

    /// Current state of a core
    pub fn state(&self, core: CoreId) -> Option<PowerState> {
        self.cores.read().get(&core).map(|g| g.lock().state)
    }

    /// Current thresholds
    pub fn thresholds(&self) -> PowerThresholds {
        *self.thresholds.read()
    }

    /// Replace thresholds; streaks restart
    pub fn set_thresholds(&self, thresholds: PowerThresholds) {
        *self.thresholds.write() = thresholds;
        for gov in self.cores.read().values() {
            gov.lock().streak = 0;
        }
    }

    /// Feed one utilisation sample
    pub fn observe(&self, core: CoreId, util_percent: u8) -> Option<SchedEvent> {
        let thresholds = *self.thresholds.read();
        let cores = self.cores.read();
        let mut gov = cores.get(&core)?.lock();

        let mut target = thresholds.target(util_percent);
        if let Some(cap) = gov.cap {
            target = target.max(cap);
        }

        if target == gov.state {
            gov.candidate = target;
            gov.streak = 0;
            return None;
        }
        if target == gov.candidate {
            gov.streak += 1;
        } else {
            gov.candidate = target;
            gov.streak = 1;
        }
        if gov.streak < thresholds.sustain {
            return None;
        }

        let from = gov.state;
        gov.state = target;
        gov.streak = 0;
        log::debug!("Power: {} {} -> {} at {}%", core, from, target, util_percent);
        Some(SchedEvent::PowerStateChanged { core, from, to: target })
    }

    /// Feed one temperature reading
    ///
    /// Returns the throttle event whenever the reading is at or above the
    /// limit, even if the core is already as slow as it gets.
    pub fn thermal(&self, core: CoreId, temperature_c: u32) -> Option<SchedEvent> {
        let cores = self.cores.read();
        let mut gov = cores.get(&core)?.lock();

        if temperature_c >= self.thermal_limit_c {
            let from = gov.state;
            let to = from.downgrade();
            gov.state = to;
            gov.cap = Some(to);
            gov.candidate = to;
            gov.streak = 0;
            log::warn!(
                "Power: {} throttled {} -> {} at {}C",
                core,
                from,
                to,
                temperature_c
            );
            return Some(SchedEvent::ThermalThrottled {
                core,
                from,
                to,
                temperature_c,
            });
        }

        if gov.cap.is_some() && temperature_c + self.hysteresis_c < self.thermal_limit_c {
            gov.cap = None;
            log::debug!("Power: {} cooled to {}C, cap lifted", core, temperature_c);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor() -> PowerGovernor {
        PowerGovernor::new((0..2).map(CoreId), PowerThresholds::new(), 90, 10)
    }

    #[test]
    fn test_change_needs_sustained_samples() {
        let gov = governor();
        assert!(gov.observe(CoreId(0), 10).is_none());
        assert!(gov.observe(CoreId(0), 10).is_none());
        let event = gov.observe(CoreId(0), 10);
        assert_eq!(
            event,
            Some(SchedEvent::PowerStateChanged {
                core: CoreId(0),
                from: PowerState::Performance,
                to: PowerState::PowerSave,
            })
        );
        assert_eq!(gov.state(CoreId(0)), Some(PowerState::PowerSave));
        assert_eq!(gov.state(CoreId(1)), Some(PowerState::Performance));
    }

    #[test]
    fn test_interrupted_streak_restarts() {
        let gov = governor();
        gov.observe(CoreId(0), 40);
        gov.observe(CoreId(0), 40);
        gov.observe(CoreId(0), 90);
        assert!(gov.observe(CoreId(0), 40).is_none());
        assert_eq!(gov.state(CoreId(0)), Some(PowerState::Performance));
    }

    #[test]
    fn test_thermal_throttle_is_reported_and_capped() {
        let gov = governor();
        let event = gov.thermal(CoreId(1), 95);
        assert!(matches!(
            event,
            Some(SchedEvent::ThermalThrottled {
                from: PowerState::Performance,
                to: PowerState::Balanced,
                ..
            })
        ));

        for _ in 0..5 {
            gov.observe(CoreId(1), 100);
        }
        assert_eq!(gov.state(CoreId(1)), Some(PowerState::Balanced));

        // Still warm: cap holds
        assert!(gov.thermal(CoreId(1), 85).is_none());
        for _ in 0..5 {
            gov.observe(CoreId(1), 100);
        }
        assert_eq!(gov.state(CoreId(1)), Some(PowerState::Balanced));

        assert!(gov.thermal(CoreId(1), 70).is_none());
        for _ in 0..3 {
            gov.observe(CoreId(1), 100);
        }
        assert_eq!(gov.state(CoreId(1)), Some(PowerState::Performance));
    }

    #[test]
    fn test_throttle_at_floor_still_reported() {
        let gov = governor();
        for _ in 0..3 {
            gov.thermal(CoreId(0), 99);
        }
        assert_eq!(gov.state(CoreId(0)), Some(PowerState::Sleep));
        assert!(gov.thermal(CoreId(0), 99).is_some());
    }

    #[test]
    fn test_threshold_validation() {
        assert!(PowerThresholds::new().validate().is_ok());
        let bad = PowerThresholds {
            balanced_above: 80,
            ..PowerThresholds::new()
        };
        assert!(bad.validate().is_err());
    }
}
