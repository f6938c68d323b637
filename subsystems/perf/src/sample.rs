//! Counters and samples.
//!
//! A [`CounterSource`] exposes raw, monotonically increasing hardware
//! counters per core. Two consecutive readings make one [`PerfSample`].

use core::fmt;

use hashbrown::HashMap;
use helix_topology::{CoreId, PowerState};
use spin::Mutex;

// ============================================================================
// RAW COUNTERS
// ============================================================================

/// One reading of a core's counters
///
/// Everything except `temperature_c` and `power_state` is cumulative and
/// may wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterReading {
    /// Elapsed cycles
    pub cycles: u64,
    /// Cycles spent not idle
    pub busy_cycles: u64,
    /// Instructions retired
    pub instructions: u64,
    /// Last-level cache references
    pub cache_references: u64,
    /// Last-level cache misses
    pub cache_misses: u64,
    /// Bytes moved by the memory controller on behalf of the core
    pub memory_bytes: u64,
    /// Package temperature
    pub temperature_c: u32,
    /// Current power state
    pub power_state: PowerState,
}

impl CounterReading {
    /// All counters zero, cool, full speed
    pub const fn zero() -> Self {
        Self {
            cycles: 0,
            busy_cycles: 0,
            instructions: 0,
            cache_references: 0,
            cache_misses: 0,
            memory_bytes: 0,
            temperature_c: 40,
            power_state: PowerState::Performance,
        }
    }
}

impl Default for CounterReading {
    fn default() -> Self {
        Self::zero()
    }
}

/// Hardware counter access
pub trait CounterSource: Send + Sync {
    /// Current counters of `core`, `None` if the core cannot be read
    fn read(&self, core: CoreId) -> Option<CounterReading>;
}

/// Counter source fed by software
///
/// Boot code without a PMU driver and tests set readings directly.
#[derive(Debug, Default)]
pub struct ManualCounters {
    readings: Mutex<HashMap<CoreId, CounterReading>>,
}

impl ManualCounters {
    /// No readings yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a core's reading
    pub fn set(&self, core: CoreId, reading: CounterReading) {
        self.readings.lock().insert(core, reading);
    }

    /// Advance a core's counters as if `cycles` elapsed at `util_percent`
    /// busy, retiring `ipc` instructions per busy cycle
    pub fn advance(&self, core: CoreId, cycles: u64, util_percent: u64, ipc: u64) {
        let mut readings = self.readings.lock();
        let r = readings.entry(core).or_default();
        let busy = cycles * util_percent.min(100) / 100;
        r.cycles = r.cycles.wrapping_add(cycles);
        r.busy_cycles = r.busy_cycles.wrapping_add(busy);
        r.instructions = r.instructions.wrapping_add(busy * ipc);
    }

    /// Add cache traffic
    pub fn add_cache(&self, core: CoreId, references: u64, misses: u64) {
        let mut readings = self.readings.lock();
        let r = readings.entry(core).or_default();
        r.cache_references = r.cache_references.wrapping_add(references);
        r.cache_misses = r.cache_misses.wrapping_add(misses);
    }

    /// Add memory traffic
    pub fn add_memory(&self, core: CoreId, bytes: u64) {
        let mut readings = self.readings.lock();
        let r = readings.entry(core).or_default();
        r.memory_bytes = r.memory_bytes.wrapping_add(bytes);
    }

    /// Set temperature and power state
    pub fn set_thermal(&self, core: CoreId, temperature_c: u32, power_state: PowerState) {
        let mut readings = self.readings.lock();
        let r = readings.entry(core).or_default();
        r.temperature_c = temperature_c;
        r.power_state = power_state;
    }
}

impl CounterSource for ManualCounters {
    fn read(&self, core: CoreId) -> Option<CounterReading> {
        self.readings.lock().get(&core).copied()
    }
}

// ============================================================================
// SAMPLES
// ============================================================================

/// Sampled metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Metric {
    /// Busy share of the interval (%)
    Utilization,
    /// Instructions per busy cycle
    Ipc,
    /// Cache misses per reference (%)
    CacheMissRate,
    /// Memory traffic relative to peak bandwidth (%)
    MemoryBandwidth,
    /// Temperature (°C)
    Temperature,
}

impl Metric {
    /// Every metric
    pub const ALL: [Metric; 5] = [
        Metric::Utilization,
        Metric::Ipc,
        Metric::CacheMissRate,
        Metric::MemoryBandwidth,
        Metric::Temperature,
    ];

    /// Dense index
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Whether a rise is a regression
    pub const fn higher_is_worse(self) -> bool {
        !matches!(self, Metric::Ipc)
    }

    /// Short name, used as a CSV column
    pub const fn name(self) -> &'static str {
        match self {
            Metric::Utilization => "utilization",
            Metric::Ipc => "ipc",
            Metric::CacheMissRate => "cache_miss_rate",
            Metric::MemoryBandwidth => "memory_bandwidth",
            Metric::Temperature => "temperature",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One core over one sampling interval
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerfSample {
    /// Core
    pub core: CoreId,
    /// End of the interval
    pub timestamp_ns: u64,
    /// Busy share (%)
    pub utilization: f32,
    /// Instructions per busy cycle
    pub ipc: f32,
    /// Cache misses per reference (%)
    pub cache_miss_rate: f32,
    /// Memory traffic relative to peak (%)
    pub memory_bandwidth: f32,
    /// Temperature (°C)
    pub temperature_c: f32,
    /// Power state at the end of the interval
    pub power_state: PowerState,
}

impl PerfSample {
    /// Idle sample
    pub const fn idle(core: CoreId, timestamp_ns: u64) -> Self {
        Self {
            core,
            timestamp_ns,
            utilization: 0.0,
            ipc: 0.0,
            cache_miss_rate: 0.0,
            memory_bandwidth: 0.0,
            temperature_c: 0.0,
            power_state: PowerState::Performance,
        }
    }

    /// Build from two readings `elapsed_ns` apart
    pub fn from_readings(
        core: CoreId,
        timestamp_ns: u64,
        prev: &CounterReading,
        cur: &CounterReading,
        elapsed_ns: u64,
        peak_bandwidth_bytes_per_sec: u64,
    ) -> Self {
        let cycles = cur.cycles.wrapping_sub(prev.cycles);
        let busy = cur.busy_cycles.wrapping_sub(prev.busy_cycles).min(cycles);
        let instructions = cur.instructions.wrapping_sub(prev.instructions);
        let refs = cur.cache_references.wrapping_sub(prev.cache_references);
        let misses = cur.cache_misses.wrapping_sub(prev.cache_misses).min(refs);
        let bytes = cur.memory_bytes.wrapping_sub(prev.memory_bytes);

        let ratio = |num: u64, den: u64| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        let peak_bytes = peak_bandwidth_bytes_per_sec as f64 * elapsed_ns as f64 / 1e9;
        let bandwidth = if peak_bytes > 0.0 {
            (bytes as f64 / peak_bytes * 100.0).min(100.0)
        } else {
            0.0
        };

        Self {
            core,
            timestamp_ns,
            utilization: (ratio(busy, cycles) * 100.0) as f32,
            ipc: ratio(instructions, busy) as f32,
            cache_miss_rate: (ratio(misses, refs) * 100.0) as f32,
            memory_bandwidth: bandwidth as f32,
            temperature_c: cur.temperature_c as f32,
            power_state: cur.power_state,
        }
    }

    /// Value of one metric
    pub fn get(&self, metric: Metric) -> f64 {
        let v = match metric {
            Metric::Utilization => self.utilization,
            Metric::Ipc => self.ipc,
            Metric::CacheMissRate => self.cache_miss_rate,
            Metric::MemoryBandwidth => self.memory_bandwidth,
            Metric::Temperature => self.temperature_c,
        };
        f64::from(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_from_reading_deltas() {
        let prev = CounterReading::zero();
        let cur = CounterReading {
            cycles: 1_000,
            busy_cycles: 750,
            instructions: 1_500,
            cache_references: 200,
            cache_misses: 10,
            memory_bytes: 500,
            temperature_c: 70,
            power_state: PowerState::Balanced,
        };
        // 1 ms at 1 MB/s peak: 1000 bytes possible
        let s = PerfSample::from_readings(CoreId(3), 9, &prev, &cur, 1_000_000, 1_000_000);
        assert_eq!(s.core, CoreId(3));
        assert_eq!(s.utilization, 75.0);
        assert_eq!(s.ipc, 2.0);
        assert_eq!(s.cache_miss_rate, 5.0);
        assert_eq!(s.memory_bandwidth, 50.0);
        assert_eq!(s.temperature_c, 70.0);
        assert_eq!(s.power_state, PowerState::Balanced);
    }

    #[test]
    fn test_counter_wrap_and_empty_interval() {
        let prev = CounterReading {
            cycles: u64::MAX - 9,
            busy_cycles: u64::MAX - 9,
            ..CounterReading::zero()
        };
        let cur = CounterReading {
            cycles: 10,
            busy_cycles: 0,
            ..CounterReading::zero()
        };
        let s = PerfSample::from_readings(CoreId(0), 0, &prev, &cur, 0, 0);
        assert_eq!(s.utilization, 50.0);
        assert_eq!(s.memory_bandwidth, 0.0);
        assert_eq!(s.cache_miss_rate, 0.0);
    }

    #[test]
    fn test_manual_counters_advance() {
        let src = ManualCounters::new();
        assert!(src.read(CoreId(1)).is_none());
        src.advance(CoreId(1), 1_000, 40, 2);
        let r = src.read(CoreId(1)).unwrap();
        assert_eq!((r.cycles, r.busy_cycles, r.instructions), (1_000, 400, 800));
    }

    #[test]
    fn test_only_ipc_improves_upward() {
        for m in Metric::ALL {
            assert_eq!(m.higher_is_worse(), m != Metric::Ipc);
            assert_eq!(Metric::ALL[m.index()], m);
        }
    }
}
