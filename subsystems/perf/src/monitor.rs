//! Performance monitor.
//!
//! Samples every online core on a fixed cadence into its [`SampleRing`],
//! tracks baselines, raises regressions and alerts, and turns what it sees
//! into advisory [`TuningDirective`]s. It never touches the scheduler or
//! the memory managers itself.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use hashbrown::HashMap;
use helix_topology::{CoreId, Topology};
use spin::{Mutex, RwLock};

use crate::alerts::{Alert, AlertEngine, AlertRule};
use crate::config::PerfConfig;
use crate::contention::{self, ContentionReport};
use crate::error::{PerfError, PerfResult};
use crate::predict::{self, Prediction};
use crate::regression::{PerformanceRegression, RegressionDetector};
use crate::report::{CoreReport, PerfReport, Recommendation};
use crate::ring::{RingWriter, SampleRing};
use crate::sample::{CounterReading, CounterSource, Metric, PerfSample};
use crate::tuner::{AutoTuner, TuningDirective};

const RECENT_REGRESSIONS: usize = 32;

// ============================================================================
// PER-CORE STATE
// ============================================================================

struct CoreWriter {
    writer: RingWriter,
    previous: Option<(u64, CounterReading)>,
    detector: RegressionDetector,
}

struct CoreChannel {
    ring: Arc<SampleRing>,
    writer: Mutex<CoreWriter>,
}

impl CoreChannel {
    fn new(core: CoreId, config: &PerfConfig) -> PerfResult<Self> {
        let ring = SampleRing::new(core, config.ring_capacity);
        let writer = ring.claim_writer()?;
        Ok(Self {
            ring,
            writer: Mutex::new(CoreWriter {
                writer,
                previous: None,
                detector: RegressionDetector::new(core, config.detector()),
            }),
        })
    }
}

struct Analysis {
    alerts: AlertEngine,
    tuner: AutoTuner,
    recent: VecDeque<PerformanceRegression>,
    last_tick_ns: Option<u64>,
}

// ============================================================================
// MONITOR
// ============================================================================

/// Outcome of one [`PerformanceMonitor::tick`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerfTick {
    /// Samples committed
    pub sampled: usize,
    /// Regressions raised
    pub regressions: Vec<PerformanceRegression>,
    /// Alerts fired
    pub alerts: Vec<Alert>,
    /// Tuning directives issued
    pub directives: Vec<TuningDirective>,
}

/// Monitor counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfStats {
    /// Sampling rounds run
    pub ticks: u64,
    /// Samples committed
    pub samples: u64,
    /// Regressions raised
    pub regressions: u64,
    /// Alerts fired
    pub alerts: u64,
    /// Directives issued
    pub directives: u64,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    samples: AtomicU64,
    regressions: AtomicU64,
    alerts: AtomicU64,
    directives: AtomicU64,
}

/// Per-core performance monitor
pub struct PerformanceMonitor {
    config: PerfConfig,
    topology: RwLock<Arc<Topology>>,
    source: Arc<dyn CounterSource>,
    cores: RwLock<HashMap<CoreId, Arc<CoreChannel>>>,
    analysis: Mutex<Analysis>,
    auto_tuning: AtomicBool,
    counters: Counters,
}

impl PerformanceMonitor {
    /// Monitor every online core of `topology`
    pub fn new(
        topology: Arc<Topology>,
        source: Arc<dyn CounterSource>,
        config: PerfConfig,
    ) -> PerfResult<Self> {
        config.validate()?;
        let mut cores: HashMap<CoreId, Arc<CoreChannel>> = HashMap::new();
        for core in topology.online().iter() {
            cores.insert(core, Arc::new(CoreChannel::new(core, &config)?));
        }
        log::info!(
            "Perf: monitoring {} cores at {} Hz",
            cores.len(),
            config.sampling_frequency_hz
        );
        Ok(Self {
            config,
            topology: RwLock::new(topology),
            source,
            cores: RwLock::new(cores),
            analysis: Mutex::new(Analysis {
                alerts: AlertEngine::new(),
                tuner: AutoTuner::new(config.tuning_cooldown_ns),
                recent: VecDeque::with_capacity(RECENT_REGRESSIONS),
                last_tick_ns: None,
            }),
            auto_tuning: AtomicBool::new(config.enable_auto_tuning),
            counters: Counters::default(),
        })
    }

    /// Settings
    pub fn config(&self) -> &PerfConfig {
        &self.config
    }

    /// Turn directive generation on or off
    pub fn set_auto_tuning(&self, enabled: bool) {
        self.auto_tuning.store(enabled, Ordering::Relaxed);
    }

    /// Directive generation on
    pub fn auto_tuning(&self) -> bool {
        self.auto_tuning.load(Ordering::Relaxed)
    }

    /// Add or replace an alert rule
    pub fn set_alert_rule(&self, rule: AlertRule) {
        self.analysis.lock().alerts.set_rule(rule);
    }

    /// Counters
    pub fn stats(&self) -> PerfStats {
        let c = &self.counters;
        PerfStats {
            ticks: c.ticks.load(Ordering::Relaxed),
            samples: c.samples.load(Ordering::Relaxed),
            regressions: c.regressions.load(Ordering::Relaxed),
            alerts: c.alerts.load(Ordering::Relaxed),
            directives: c.directives.load(Ordering::Relaxed),
        }
    }

    fn channel(&self, core: CoreId) -> PerfResult<Arc<CoreChannel>> {
        self.cores
            .read()
            .get(&core)
            .cloned()
            .ok_or(PerfError::InvalidCore(core))
    }

    fn channels(&self) -> Vec<(CoreId, Arc<CoreChannel>)> {
        let mut list: Vec<_> = self
            .cores
            .read()
            .iter()
            .map(|(c, ch)| (*c, Arc::clone(ch)))
            .collect();
        list.sort_unstable_by_key(|(c, _)| *c);
        list
    }

    // ------------------------------------------------------------------------
    // Sampling
    // ------------------------------------------------------------------------

    /// Run one sampling round if the sampling interval has elapsed
    ///
    /// The first reading of a core only primes its counters; samples start
    /// with the second.
    pub fn tick(&self, now_ns: u64) -> PerfTick {
        {
            let mut analysis = self.analysis.lock();
            if let Some(last) = analysis.last_tick_ns {
                if now_ns.saturating_sub(last) < self.config.sample_interval_ns() {
                    return PerfTick::default();
                }
            }
            analysis.last_tick_ns = Some(now_ns);
        }
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);

        let mut out = PerfTick::default();
        let mut fresh = Vec::new();
        for (core, channel) in self.channels() {
            let Some(reading) = self.source.read(core) else {
                continue;
            };
            let mut w = channel.writer.lock();
            if let Some((then, prev)) = w.previous {
                if now_ns > then {
                    let sample = PerfSample::from_readings(
                        core,
                        now_ns,
                        &prev,
                        &reading,
                        now_ns - then,
                        self.config.peak_bandwidth_bytes_per_sec,
                    );
                    Self::commit(&mut w, &sample, &mut out.regressions);
                    fresh.push(sample);
                }
            }
            w.previous = Some((now_ns, reading));
        }
        out.sampled = fresh.len();

        let mut analysis = self.analysis.lock();
        for sample in &fresh {
            analysis.alerts.evaluate(sample, &mut out.alerts);
        }
        Self::remember(&mut analysis, &out.regressions);
        if self.auto_tuning() && !fresh.is_empty() {
            let report = contention::analyze(&fresh, &self.config.contention);
            out.directives = analysis.tuner.advise(now_ns, &out.regressions, &report);
        }
        drop(analysis);

        self.account(&out);
        out
    }

    /// Commit a sample collected elsewhere
    ///
    /// Runs regression and alert checks but never issues directives.
    pub fn record_sample(&self, sample: PerfSample) -> PerfResult<PerfTick> {
        let channel = self.channel(sample.core)?;
        let mut out = PerfTick {
            sampled: 1,
            ..PerfTick::default()
        };
        {
            let mut w = channel.writer.lock();
            Self::commit(&mut w, &sample, &mut out.regressions);
        }
        let mut analysis = self.analysis.lock();
        analysis.alerts.evaluate(&sample, &mut out.alerts);
        Self::remember(&mut analysis, &out.regressions);
        drop(analysis);

        self.account(&out);
        Ok(out)
    }

    fn commit(w: &mut CoreWriter, sample: &PerfSample, regressions: &mut Vec<PerformanceRegression>) {
        w.writer.push(sample);
        let before = regressions.len();
        w.detector.observe(sample, regressions);
        for r in &regressions[before..] {
            log::debug!("Perf: {}", r);
        }
    }

    fn remember(analysis: &mut Analysis, regressions: &[PerformanceRegression]) {
        for r in regressions {
            if analysis.recent.len() == RECENT_REGRESSIONS {
                analysis.recent.pop_front();
            }
            analysis.recent.push_back(*r);
        }
    }

    fn account(&self, out: &PerfTick) {
        let c = &self.counters;
        c.samples.fetch_add(out.sampled as u64, Ordering::Relaxed);
        c.regressions.fetch_add(out.regressions.len() as u64, Ordering::Relaxed);
        c.alerts.fetch_add(out.alerts.len() as u64, Ordering::Relaxed);
        c.directives.fetch_add(out.directives.len() as u64, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------------
    // Readers
    // ------------------------------------------------------------------------

    /// Ring of a core, for lock-free readers
    pub fn ring(&self, core: CoreId) -> PerfResult<Arc<SampleRing>> {
        Ok(Arc::clone(&self.channel(core)?.ring))
    }

    /// Up to `max` newest samples of a core, oldest first
    pub fn samples(&self, core: CoreId, max: usize) -> PerfResult<Vec<PerfSample>> {
        Ok(self.channel(core)?.ring.snapshot(max))
    }

    /// Current baseline of a core's metric
    pub fn baseline(&self, core: CoreId, metric: Metric) -> PerfResult<Option<f64>> {
        Ok(self.channel(core)?.writer.lock().detector.baseline(metric))
    }

    /// Newest sample of every core that has one
    pub fn latest_samples(&self) -> Vec<PerfSample> {
        self.channels()
            .iter()
            .filter_map(|(_, ch)| ch.ring.latest())
            .collect()
    }

    /// Current contention over the newest samples
    pub fn contention(&self) -> ContentionReport {
        contention::analyze(&self.latest_samples(), &self.config.contention)
    }

    /// Machine-wide report
    pub fn snapshot(&self, now_ns: u64) -> PerfReport {
        let channels = self.channels();
        let mut cores = Vec::with_capacity(channels.len());
        let mut series: [Vec<(u64, f64)>; 5] = Default::default();
        for (core, ch) in &channels {
            let Some(latest) = ch.ring.latest() else {
                continue;
            };
            let (utilization_baseline, regressed) = {
                let w = ch.writer.lock();
                let regressed = Metric::ALL.iter().any(|m| w.detector.is_regressed(*m));
                (w.detector.baseline(Metric::Utilization), regressed)
            };
            cores.push(CoreReport {
                core: *core,
                latest,
                utilization_baseline,
                regressed,
            });
            for s in ch.ring.snapshot(self.config.prediction_window) {
                for m in Metric::ALL {
                    series[m.index()].push((s.timestamp_ns, s.get(m)));
                }
            }
        }

        let latest: Vec<PerfSample> = cores.iter().map(|c| c.latest).collect();
        let n = latest.len().max(1) as f64;
        let mean = |m: Metric| latest.iter().map(|s| s.get(m)).sum::<f64>() / n;
        let max_temperature_c = latest
            .iter()
            .map(|s| s.get(Metric::Temperature))
            .fold(0.0, f64::max);

        let predictions: Vec<Prediction> = Metric::ALL
            .iter()
            .filter_map(|m| {
                predict::linear_trend(*m, &series[m.index()], self.config.prediction_horizon_ns)
            })
            .collect();

        let analysis = self.analysis.lock();
        PerfReport {
            timestamp_ns: now_ns,
            generation: self.topology.read().generation(),
            mean_utilization: mean(Metric::Utilization),
            mean_ipc: mean(Metric::Ipc),
            mean_cache_miss_rate: mean(Metric::CacheMissRate),
            mean_memory_bandwidth: mean(Metric::MemoryBandwidth),
            max_temperature_c,
            contention: contention::analyze(&latest, &self.config.contention),
            predictions,
            active_alerts: analysis.alerts.active(),
            recent_regressions: analysis.recent.iter().copied().collect(),
            cores,
        }
    }

    /// Recommendation for the current state
    ///
    /// Advisory only; unlike [`tick`](Self::tick) it ignores the tuning
    /// cooldown and the auto-tuning switch.
    pub fn optimize(&self, now_ns: u64) -> Recommendation {
        let report = self.contention();
        let rec = Recommendation::for_contention(report.dominant);
        log::debug!(
            "Perf: at {} ns recommend {} ({} contention, {:.0}% expected)",
            now_ns,
            rec.action,
            rec.cause,
            rec.expected_improvement_percent
        );
        rec
    }

    // ------------------------------------------------------------------------
    // Hot-plug
    // ------------------------------------------------------------------------

    /// Follow a new topology: start rings for new cores, drop removed ones
    pub fn refresh_topology(&self, next: Arc<Topology>) -> PerfResult<()> {
        let mut removed = Vec::new();
        {
            let mut cores = self.cores.write();
            for core in next.online().iter() {
                if !cores.contains_key(&core) {
                    cores.insert(core, Arc::new(CoreChannel::new(core, &self.config)?));
                }
            }
            cores.retain(|core, _| {
                let keep = next.online().contains(*core);
                if !keep {
                    removed.push(*core);
                }
                keep
            });
        }
        if !removed.is_empty() {
            let mut analysis = self.analysis.lock();
            for core in &removed {
                analysis.alerts.forget_core(*core);
            }
        }
        log::info!(
            "Perf: topology generation {} ({} cores dropped)",
            next.generation(),
            removed.len()
        );
        *self.topology.write() = next;
        Ok(())
    }
}

impl core::fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PerformanceMonitor")
            .field("cores", &self.cores.read().len())
            .field("auto_tuning", &self.auto_tuning())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contention::ContentionKind;
    use crate::report::OptimizationAction;
    use crate::sample::ManualCounters;
    use helix_topology::StaticProbe;

    const MS: u64 = 1_000_000;

    fn topology() -> Arc<Topology> {
        Arc::new(Topology::discover(&StaticProbe::uniform(1, 4, 4, 4096, 20)).unwrap())
    }

    fn monitor(config: PerfConfig) -> (PerformanceMonitor, Arc<ManualCounters>) {
        let counters = Arc::new(ManualCounters::new());
        let topo = topology();
        for core in topo.online().iter() {
            counters.advance(core, 0, 0, 0);
        }
        let m = PerformanceMonitor::new(topo, counters.clone(), config).unwrap();
        (m, counters)
    }

    fn step(m: &PerformanceMonitor, c: &ManualCounters, now: u64, util: u64) -> PerfTick {
        for core in 0..4 {
            c.advance(CoreId(core), 1_000_000, util, 2);
        }
        m.tick(now)
    }

    #[test]
    fn test_first_round_primes_then_samples() {
        let (m, c) = monitor(PerfConfig::new());
        assert_eq!(m.tick(0).sampled, 0);
        let t = step(&m, &c, 10 * MS, 50);
        assert_eq!(t.sampled, 4);
        let s = m.samples(CoreId(2), 10).unwrap();
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].utilization, 50.0);
        assert_eq!(s[0].ipc, 2.0);
        assert_eq!(s[0].timestamp_ns, 10 * MS);
    }

    #[test]
    fn test_rounds_follow_sampling_interval() {
        let (m, c) = monitor(PerfConfig::new());
        m.tick(0);
        assert_eq!(step(&m, &c, 5 * MS, 50).sampled, 0);
        assert_eq!(step(&m, &c, 10 * MS, 50).sampled, 4);
        assert_eq!(m.stats().ticks, 2);
    }

    fn quick() -> PerfConfig {
        PerfConfig {
            baseline_warmup: 2,
            regression_window: 2,
            regression_sustain: 2,
            tuning_cooldown_ns: 0,
            ..PerfConfig::new()
        }
    }

    #[test]
    fn test_saturation_raises_regressions_and_directives() {
        let (m, c) = monitor(quick());
        m.tick(0);
        let mut regressions = Vec::new();
        let mut directives = Vec::new();
        let mut now = 0;
        for util in [40, 40, 40, 40, 40, 40, 95, 95, 95] {
            now += 10 * MS;
            let t = step(&m, &c, now, util);
            regressions.extend(t.regressions);
            directives.extend(t.directives);
        }
        assert_eq!(regressions.len(), 4);
        assert!(regressions.iter().all(|r| r.metric == Metric::Utilization));
        assert!(directives.contains(&TuningDirective::ScaleBalanceInterval { percent: 50 }));
        let base = m.baseline(CoreId(0), Metric::Utilization).unwrap().unwrap();
        assert!((base - 40.0).abs() < 1e-9);

        let report = m.snapshot(now);
        assert_eq!(report.cores.len(), 4);
        assert!(report.cores.iter().all(|c| c.regressed));
        assert_eq!(report.recent_regressions.len(), 4);
        assert_eq!(report.contention.dominant, ContentionKind::Cpu);
        assert_eq!(report.mean_utilization, 95.0);
        let util = report
            .predictions
            .iter()
            .find(|p| p.metric == Metric::Utilization)
            .unwrap();
        assert!(util.slope_per_sec > 0.0);
    }

    #[test]
    fn test_auto_tuning_switch() {
        let (m, c) = monitor(quick());
        m.set_auto_tuning(false);
        m.tick(0);
        for i in 1..=10 {
            assert!(step(&m, &c, i * 10 * MS, 99).directives.is_empty());
        }
        assert_eq!(m.stats().directives, 0);
    }

    #[test]
    fn test_optimize_on_bandwidth_pressure() {
        let (m, _) = monitor(PerfConfig::new());
        assert_eq!(m.optimize(0).action, OptimizationAction::None);
        for core in 0..4 {
            let s = PerfSample {
                memory_bandwidth: 90.0,
                utilization: 30.0,
                ..PerfSample::idle(CoreId(core), 1)
            };
            m.record_sample(s).unwrap();
        }
        let rec = m.optimize(2);
        assert_eq!(rec.action, OptimizationAction::MigrateMemory);
        assert_eq!(rec.confidence, 0.8);
        assert_eq!(rec.directives, [TuningDirective::ScaleMigrationRate { percent: 200 }]);
    }

    #[test]
    fn test_report_csv() {
        let (m, c) = monitor(PerfConfig::new());
        m.tick(0);
        step(&m, &c, 10 * MS, 25);
        let csv = m.snapshot(10 * MS).to_csv();
        assert_eq!(csv.lines().count(), 5);
        assert!(csv.lines().nth(1).unwrap().starts_with("0,10000000,25.00,2.000,"));
    }

    #[test]
    fn test_rings_have_one_writer() {
        let (m, _) = monitor(PerfConfig::new());
        let ring = m.ring(CoreId(1)).unwrap();
        assert_eq!(ring.claim_writer().unwrap_err(), PerfError::WriterClaimed(CoreId(1)));
        assert_eq!(
            m.record_sample(PerfSample::idle(CoreId(9), 0)).unwrap_err(),
            PerfError::InvalidCore(CoreId(9))
        );
    }

    #[test]
    fn test_follows_hotplug() {
        let (m, _) = monitor(PerfConfig::new());
        let topo = topology();
        let smaller = Arc::new(topo.without_core(CoreId(3)).unwrap());
        m.refresh_topology(smaller).unwrap();
        assert_eq!(m.samples(CoreId(3), 4).unwrap_err(), PerfError::InvalidCore(CoreId(3)));
        m.refresh_topology(topo).unwrap();
        assert!(m.samples(CoreId(3), 4).unwrap().is_empty());
    }
}
