//! # Scale Subsystem
//!
//! Owns one instance of every component and drives them as a unit:
//!
//! - `init` discovers the topology and builds the components in dependency
//!   order (NUMA, VM, scheduler, monitor, false-sharing detector)
//! - `tick` runs the periodic work of all of them and routes the monitor's
//!   advisory directives
//! - `hotplug` swaps the topology snapshot and refreshes every holder
//! - `shutdown` stops background work and drops the components in reverse
//!   order
//!
//! Components never call each other except through the narrow traits they
//! were wired with here.

use alloc::sync::Arc;
use alloc::vec::Vec;

use helix_coherency::{CancelToken, FalseSharingConfig, FalseSharingDetector};
use helix_execution::{RunnableUnitHandle, Scheduler};
use helix_memory::{AddrRange, Backing, FrameProvider, PressureStep, VmManager, VmaFlags, VmaId};
use helix_numa::{AllocPolicy, NumaManager, PageRange};
use helix_perf::{PerfReport, PerformanceMonitor, Recommendation};
use helix_topology::{
    CoreId, CpuMask, HardwareError, HotplugEvent, NodeId, Topology, TopologyCell, TopologyProbe, UnitId,
};
use spin::{Mutex, RwLock};

use crate::config::{ConfigError, ScaleConfig};
use crate::error::{ScaleError, ScaleResult};
use crate::events::{EventHub, SystemEvent, SystemEventListener};
use crate::lifecycle::{StateCell, SubsystemState};
use crate::platform::Platform;
use crate::tuning;

/// Cadence of the VM dedup and compression pass (ns)
pub const BACKGROUND_INTERVAL_NS: u64 = 1_000_000_000;

/// Undrained events kept before the oldest is dropped
pub const EVENT_CAPACITY: usize = 4096;

// =============================================================================
// Components
// =============================================================================

struct Components {
    topology: TopologyCell,
    numa: Arc<NumaManager>,
    vm: Arc<VmManager>,
    scheduler: Arc<Scheduler>,
    perf: Arc<PerformanceMonitor>,
    false_sharing: Mutex<FalseSharingDetector>,
    cancel: CancelToken,
    last_background_ns: Mutex<Option<u64>>,
    hotplug: Mutex<()>,
}

impl Components {
    fn build(config: &ScaleConfig, topology: Topology, platform: Platform) -> ScaleResult<Self> {
        let cell = TopologyCell::new(topology);
        let topo = cell.load();

        let numa = Arc::new(NumaManager::new(topo.clone(), config.numa_config())?);
        let vm = Arc::new(VmManager::new(
            numa.clone() as Arc<dyn FrameProvider>,
            config.vm_config(),
        )?);
        if let Some(locator) = &platform.locator {
            numa.set_locator(locator.clone());
            vm.set_locator(locator.clone());
        }

        let scheduler = Arc::new(Scheduler::new(topo.clone(), config.sched_config())?);
        scheduler.set_memory_affinity(numa.clone());

        let perf = Arc::new(PerformanceMonitor::new(
            topo,
            platform.counters,
            config.perf_config(),
        )?);
        let false_sharing = FalseSharingDetector::new(FalseSharingConfig::new())?;

        Ok(Self {
            topology: cell,
            numa,
            vm,
            scheduler,
            perf,
            false_sharing: Mutex::new(false_sharing),
            cancel: CancelToken::new(),
            last_background_ns: Mutex::new(None),
            hotplug: Mutex::new(()),
        })
    }

    fn background_due(&self, now_ns: u64) -> bool {
        let mut last = self.last_background_ns.lock();
        let due = match *last {
            Some(t) => now_ns.saturating_sub(t) >= BACKGROUND_INTERVAL_NS,
            None => true,
        };
        if due {
            *last = Some(now_ns);
        }
        due
    }
}

// =============================================================================
// Tick summary
// =============================================================================

/// What one [`ScaleSubsystem::tick`] did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Pressure step taken by the VM manager
    pub pressure: Option<PressureStep>,
    /// Pages merged or compressed by the background pass
    pub background_pages: u64,
    /// Units moved by scheduler balancing
    pub units_moved: usize,
    /// Performance samples committed
    pub samples: usize,
    /// Regressions raised
    pub regressions: usize,
    /// Alerts fired
    pub alerts: usize,
    /// Directives applied to a component
    pub tuning_applied: usize,
    /// False-sharing reports
    pub false_sharing: usize,
    /// Events published
    pub events: usize,
}

// =============================================================================
// Subsystem
// =============================================================================

/// Topology, NUMA, VM, scheduling and monitoring under one lifecycle
pub struct ScaleSubsystem {
    config: ScaleConfig,
    state: StateCell,
    parts: RwLock<Option<Arc<Components>>>,
    events: EventHub,
}

impl ScaleSubsystem {
    /// Create an uninitialized subsystem
    pub fn new(config: ScaleConfig) -> ScaleResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: StateCell::new(),
            parts: RwLock::new(None),
            events: EventHub::new(EVENT_CAPACITY),
        })
    }

    /// Create and initialize in one step
    pub fn boot(config: ScaleConfig, probe: &dyn TopologyProbe, platform: Platform) -> ScaleResult<Self> {
        let subsystem = Self::new(config)?;
        subsystem.init(probe, platform)?;
        Ok(subsystem)
    }

    /// Discover the topology and bring every component up
    ///
    /// Allowed from `Uninitialized` and `Stopped`. On failure the state
    /// returns to where it was.
    pub fn init(&self, probe: &dyn TopologyProbe, platform: Platform) -> ScaleResult<()> {
        let from = self.state.get();
        if !matches!(from, SubsystemState::Uninitialized | SubsystemState::Stopped)
            || !self.state.advance(from, SubsystemState::Initializing)
        {
            return Err(ScaleError::AlreadyInitialized);
        }

        match self.build(probe, platform) {
            Ok(parts) => {
                let topo = parts.topology.load();
                log::info!(
                    "Scale: running on {} cores in {} NUMA nodes (generation {})",
                    topo.core_count(),
                    topo.node_count(),
                    topo.generation()
                );
                *self.parts.write() = Some(Arc::new(parts));
                self.state.set(SubsystemState::Running);
                Ok(())
            },
            Err(e) => {
                log::error!("Scale: init failed: {}", e);
                self.state.set(from);
                Err(e)
            },
        }
    }

    fn build(&self, probe: &dyn TopologyProbe, platform: Platform) -> ScaleResult<Components> {
        let topology = Topology::discover(probe)?;
        self.check_limits(&topology)?;
        Components::build(&self.config, topology, platform)
    }

    fn check_limits(&self, topology: &Topology) -> ScaleResult<()> {
        if topology.core_count() > self.config.max_cpus {
            return Err(ConfigError::TooManyCpus {
                found: topology.core_count(),
                max: self.config.max_cpus,
            }
            .into());
        }
        if topology.node_count() > self.config.max_numa_nodes {
            return Err(ConfigError::TooManyNodes {
                found: topology.node_count(),
                max: self.config.max_numa_nodes,
            }
            .into());
        }
        Ok(())
    }

    fn parts(&self) -> ScaleResult<Arc<Components>> {
        if self.state.get() != SubsystemState::Running {
            return Err(ScaleError::NotInitialized);
        }
        self.parts.read().clone().ok_or(ScaleError::NotInitialized)
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Configuration in force
    pub fn config(&self) -> &ScaleConfig {
        &self.config
    }

    /// Lifecycle state
    pub fn state(&self) -> SubsystemState {
        self.state.get()
    }

    /// Current topology snapshot
    pub fn topology(&self) -> ScaleResult<Arc<Topology>> {
        Ok(self.parts()?.topology.load())
    }

    /// Scheduler
    pub fn scheduler(&self) -> ScaleResult<Arc<Scheduler>> {
        Ok(self.parts()?.scheduler.clone())
    }

    /// NUMA manager
    pub fn numa(&self) -> ScaleResult<Arc<NumaManager>> {
        Ok(self.parts()?.numa.clone())
    }

    /// Virtual memory manager
    pub fn vm(&self) -> ScaleResult<Arc<VmManager>> {
        Ok(self.parts()?.vm.clone())
    }

    /// Performance monitor
    pub fn perf(&self) -> ScaleResult<Arc<PerformanceMonitor>> {
        Ok(self.parts()?.perf.clone())
    }

    // -------------------------------------------------------------------------
    // Events
    // -------------------------------------------------------------------------

    /// Register a listener for events as they happen
    pub fn subscribe(&self, listener: Arc<dyn SystemEventListener>) {
        self.events.subscribe(listener);
    }

    /// Take every queued event, oldest first
    pub fn drain_events(&self) -> Vec<SystemEvent> {
        self.events.drain()
    }

    /// Events lost because nobody drained the queue
    pub fn events_dropped(&self) -> u64 {
        self.events.dropped()
    }

    // -------------------------------------------------------------------------
    // Process manager interface
    // -------------------------------------------------------------------------

    /// Queue a runnable unit; returns the chosen core
    pub fn enqueue(&self, handle: Arc<dyn RunnableUnitHandle>, now_ns: u64) -> ScaleResult<CoreId> {
        let parts = self.parts()?;
        let core = parts.scheduler.enqueue(handle, now_ns)?;
        self.forward_sched_events(&parts);
        Ok(core)
    }

    /// Restrict a unit to `mask`, moving it if it sits outside
    pub fn set_affinity(&self, unit: UnitId, mask: CpuMask, now_ns: u64) -> ScaleResult<()> {
        let parts = self.parts()?;
        parts.scheduler.set_affinity(unit, mask, now_ns)?;
        Ok(())
    }

    /// Core and node a unit is placed on
    pub fn current_placement(&self, unit: UnitId) -> ScaleResult<(CoreId, NodeId)> {
        Ok(self.parts()?.scheduler.current_placement(unit)?)
    }

    /// Physical memory under `policy`
    pub fn allocate_numa(&self, size: u64, policy: AllocPolicy) -> ScaleResult<PageRange> {
        Ok(self.parts()?.numa.allocate(size, policy)?)
    }

    /// Anonymous mapping that prefers huge pages
    pub fn map_large(&self, range: AddrRange, flags: VmaFlags) -> ScaleResult<VmaId> {
        Ok(self.parts()?.vm.map(range, flags, Backing::Anonymous, true)?)
    }

    /// Feed one observed write to the false-sharing detector
    pub fn record_write(&self, core: CoreId, addr: u64, len: usize, now_ns: u64) -> ScaleResult<()> {
        let parts = self.parts()?;
        let domain = parts
            .topology
            .load()
            .cache_domain_of(core)
            .ok_or(HardwareError::UnknownCore(core))?;
        parts.false_sharing.lock().record_write(domain, addr, len, now_ns);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Monitoring interface
    // -------------------------------------------------------------------------

    /// System-wide performance report
    pub fn get_performance_snapshot(&self, now_ns: u64) -> ScaleResult<PerfReport> {
        Ok(self.parts()?.perf.snapshot(now_ns))
    }

    /// Recommended action for the current state
    pub fn optimize(&self, now_ns: u64) -> ScaleResult<Recommendation> {
        Ok(self.parts()?.perf.optimize(now_ns))
    }

    /// Turn auto-tuning on or off
    pub fn set_auto_tuning(&self, enabled: bool) -> ScaleResult<()> {
        self.parts()?.perf.set_auto_tuning(enabled);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Periodic work
    // -------------------------------------------------------------------------

    /// Drive every component once
    ///
    /// Order: migrations and NUMA balancing, VM pressure and background
    /// pass, scheduler balancing, sampling with regression checks and
    /// tuning, power governor feed, false-sharing detection.
    pub fn tick(&self, now_ns: u64) -> ScaleResult<TickSummary> {
        let parts = self.parts()?;
        let published = self.events.published();
        let mut summary = TickSummary::default();

        parts.numa.tick(now_ns);

        summary.pressure = parts.vm.tick(now_ns);
        if let Some(step) = summary.pressure {
            self.events.publish(SystemEvent::MemoryPressure(step));
        }
        if parts.background_due(now_ns) {
            let outcome = parts.vm.background_pass(&parts.cancel);
            summary.background_pages = outcome.dedup.merged + outcome.compressed;
        }

        summary.units_moved = parts.scheduler.tick(now_ns).total_moved();

        let perf = parts.perf.tick(now_ns);
        summary.samples = perf.sampled;
        summary.regressions = perf.regressions.len();
        summary.alerts = perf.alerts.len();
        for r in perf.regressions {
            log::warn!("Scale: {}", r);
            self.events.publish(SystemEvent::PerformanceRegression(r));
        }
        for a in perf.alerts {
            self.events.publish(SystemEvent::Alert(a));
        }
        for d in perf.directives {
            match tuning::route(d, &self.config, &parts.scheduler, &parts.numa) {
                Ok(true) => {
                    summary.tuning_applied += 1;
                    self.events.publish(SystemEvent::TuningApplied(d));
                },
                Ok(false) => log::debug!("Scale: directive {} changes nothing", d),
                Err(e) => log::warn!("Scale: directive {} rejected: {}", d, e),
            }
        }

        if perf.sampled > 0 {
            for sample in parts.perf.latest_samples() {
                if sample.timestamp_ns != now_ns {
                    continue;
                }
                let util = sample.utilization.clamp(0.0, 100.0) as u8;
                parts.scheduler.observe_utilization(sample.core, util);
                parts.scheduler.thermal_reading(sample.core, sample.temperature_c.max(0.0) as u32);
            }
        }
        self.forward_sched_events(&parts);

        let reports = parts.false_sharing.lock().poll(now_ns);
        summary.false_sharing = reports.len();
        for report in reports {
            log::warn!(
                "Scale: false sharing on line {:#x}, {} domains, {} writes",
                report.line_addr,
                report.offenders.len(),
                report.total_writes()
            );
            self.events.publish(SystemEvent::FalseSharing(report));
        }

        summary.events = (self.events.published() - published) as usize;
        Ok(summary)
    }

    fn forward_sched_events(&self, parts: &Components) {
        for e in parts.scheduler.drain_events() {
            self.events.publish(e.into());
        }
    }

    // -------------------------------------------------------------------------
    // Hot-plug
    // -------------------------------------------------------------------------

    /// Apply a hot-plug event to every component
    ///
    /// A departing core is drained before the new snapshot is published; an
    /// arriving core is published first so the scheduler can place on it.
    /// Returns the units moved off a removed core.
    pub fn hotplug(&self, event: HotplugEvent, now_ns: u64) -> ScaleResult<usize> {
        let parts = self.parts()?;
        let _serial = parts.hotplug.lock();

        let current = parts.topology.load();
        let next = Arc::new(match event {
            HotplugEvent::CoreAdded(node) => current.with_core_added(node)?,
            HotplugEvent::CoreRemoved(core) => current.without_core(core)?,
        });
        self.check_limits(&next)?;

        let moved = match event {
            HotplugEvent::CoreRemoved(_) => {
                let moved = parts.scheduler.hotplug(event, next.clone(), now_ns)?;
                parts.topology.publish(next.clone());
                moved
            },
            HotplugEvent::CoreAdded(_) => {
                parts.topology.publish(next.clone());
                parts.scheduler.hotplug(event, next.clone(), now_ns)?
            },
        };
        parts.numa.refresh_topology(next.clone());
        parts.perf.refresh_topology(next.clone())?;

        self.forward_sched_events(&parts);
        self.events.publish(SystemEvent::TopologyChanged {
            generation: next.generation(),
            cores: next.core_count(),
        });
        log::info!(
            "Scale: {:?} applied, generation {}, {} units moved",
            event,
            next.generation(),
            moved
        );
        Ok(moved)
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Stop background work and drop every component
    ///
    /// Queued migrations get one last chance to complete; whatever remains
    /// is abandoned. Units still queued are the process manager's to
    /// reclaim.
    pub fn shutdown(&self, now_ns: u64) -> ScaleResult<()> {
        if !self.state.advance(SubsystemState::Running, SubsystemState::ShuttingDown) {
            return Err(ScaleError::NotInitialized);
        }
        let parts = self.parts.write().take();
        if let Some(parts) = parts {
            parts.perf.set_auto_tuning(false);
            parts.cancel.cancel();
            parts.numa.process_migrations(now_ns);
            let pending = parts.numa.migrations_queued();
            if pending > 0 {
                log::warn!("Scale: {} migrations abandoned at shutdown", pending);
            }
            let units = parts.scheduler.scheduled_units();
            if units > 0 {
                log::info!("Scale: {} units still scheduled at shutdown", units);
            }
            self.forward_sched_events(&parts);
        }
        self.state.set(SubsystemState::Stopped);
        log::info!("Scale: stopped");
        Ok(())
    }
}

impl core::fmt::Debug for ScaleSubsystem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScaleSubsystem")
            .field("state", &self.state())
            .field("config", &self.config)
            .field("events", &self.events)
            .finish()
    }
}
