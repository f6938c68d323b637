//! # Multi-Core Scheduler
//!
//! Places runnable units on cores, orders each core's queue, balances load
//! bottom-up across the domain hierarchy, drains cores on hot-plug and
//! drives the power governor.
//!
//! ## Locking
//!
//! There is no global lock. Each core owns a [`RunQueue`]; unit records
//! live in a sharded table. Any path that holds both takes run-queue locks
//! first (ascending core id when two are needed), then one unit shard. A
//! unit travelling between queues is briefly `Queued` with no core; the
//! queue it lands in is recorded before its entry becomes visible there.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use helix_topology::{CoreId, CpuMask, HotplugEvent, NodeId, PowerState, Topology, UnitId};
use spin::{Mutex, RwLock};

use crate::config::{SchedConfig, SchedTuning};
use crate::domain::{DomainLevel, DomainTree};
use crate::error::{SchedError, SchedResult};
use crate::events::{EventLog, SchedEvent};
use crate::placement::{choose_core, CoreLoad, MemoryAffinity, PlacementHint};
use crate::power::PowerGovernor;
use crate::runqueue::{CoreFlags, LockedQueue, QueueEntry, RunQueue, RunningUnit};
use crate::unit::{PriorityClass, RunnableUnitHandle, UnitState};

const UNIT_SHARDS: usize = 16;

// ============================================================================
// UNIT RECORDS
// ============================================================================

struct UnitRecord {
    handle: Arc<dyn RunnableUnitHandle>,
    affinity: CpuMask,
    state: UnitState,
    /// Queue holding the unit, `None` while blocked or in transit
    core: Option<CoreId>,
    last_core: Option<CoreId>,
    runtime_ns: u64,
}

impl UnitRecord {
    fn charge(&mut self, running: &RunningUnit, now_ns: u64) {
        self.runtime_ns += now_ns.saturating_sub(running.started_ns);
    }
}

type UnitShard = Mutex<HashMap<UnitId, UnitRecord>>;

/// Outcome of handing a unit to a run-queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Push {
    Queued,
    /// Core is going offline
    Draining,
    /// Unit was terminated or moved meanwhile
    Gone,
}

// ============================================================================
// STATISTICS
// ============================================================================

/// Scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedStats {
    /// Units accepted by `enqueue`
    pub enqueued: u64,
    /// Units put on a core
    pub dispatched: u64,
    /// Running units displaced by a more urgent one
    pub preemptions: u64,
    /// `DeadlineMissed` events raised
    pub deadline_misses: u64,
    /// Balancing moves per level, indexed by [`DomainLevel::index`]
    pub migrations: [u64; 3],
    /// Units moved off removed cores
    pub hotplug_moves: u64,
    /// Units placed outside their affinity after a removal
    pub affinity_overrides: u64,
    /// Queue entries discarded because the unit had moved on
    pub stale_entries: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    dispatched: AtomicU64,
    preemptions: AtomicU64,
    deadline_misses: AtomicU64,
    migrations: [AtomicU64; 3],
    hotplug_moves: AtomicU64,
    affinity_overrides: AtomicU64,
    stale_entries: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SchedStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        SchedStats {
            enqueued: get(&self.enqueued),
            dispatched: get(&self.dispatched),
            preemptions: get(&self.preemptions),
            deadline_misses: get(&self.deadline_misses),
            migrations: [
                get(&self.migrations[0]),
                get(&self.migrations[1]),
                get(&self.migrations[2]),
            ],
            hotplug_moves: get(&self.hotplug_moves),
            affinity_overrides: get(&self.affinity_overrides),
            stale_entries: get(&self.stale_entries),
        }
    }
}

/// Work done by one [`Scheduler::tick`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalanceReport {
    /// Levels whose interval elapsed
    pub levels_run: [bool; 3],
    /// Units moved per level
    pub moved: [usize; 3],
}

impl BalanceReport {
    /// Units moved at all levels
    pub fn total_moved(&self) -> usize {
        self.moved.iter().sum()
    }
}

// ============================================================================
// SCHEDULER
// ============================================================================

/// NUMA-aware multi-core scheduler
pub struct Scheduler {
    config: RwLock<SchedConfig>,
    topology: RwLock<Arc<Topology>>,
    domains: RwLock<Arc<DomainTree>>,
    queues: RwLock<HashMap<CoreId, Arc<RunQueue>>>,
    units: [UnitShard; UNIT_SHARDS],
    memory: RwLock<Option<Arc<dyn MemoryAffinity>>>,
    power: PowerGovernor,
    events: EventLog,
    last_balance: Mutex<[u64; 3]>,
    seq: AtomicU64,
    stats: Counters,
}

impl Scheduler {
    /// Scheduler over every online core of `topology`
    pub fn new(topology: Arc<Topology>, config: SchedConfig) -> SchedResult<Self> {
        config.validate()?;

        let queues: HashMap<CoreId, Arc<RunQueue>> = topology
            .online()
            .iter()
            .map(|c| (c, Arc::new(RunQueue::new(c, config.inbox_capacity))))
            .collect();
        let domains = DomainTree::build(&topology, config.domain_size);
        let power = PowerGovernor::new(
            topology.online().iter(),
            config.power,
            config.thermal_limit_c,
            config.thermal_hysteresis_c,
        );

        log::info!(
            "Scheduler: {} cores, {} cache domains, {} nodes, {:?}",
            topology.core_count(),
            domains.domains(DomainLevel::Cache).len(),
            domains.domains(DomainLevel::Node).len(),
            config.balance_algorithm
        );

        Ok(Self {
            config: RwLock::new(config),
            topology: RwLock::new(topology),
            domains: RwLock::new(Arc::new(domains)),
            queues: RwLock::new(queues),
            units: core::array::from_fn(|_| Mutex::new(HashMap::new())),
            memory: RwLock::new(None),
            power,
            events: EventLog::new(config.event_capacity),
            last_balance: Mutex::new([0; 3]),
            seq: AtomicU64::new(0),
            stats: Counters::default(),
        })
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    /// Current configuration
    pub fn config(&self) -> SchedConfig {
        *self.config.read()
    }

    /// Retune at runtime; rejected tunings leave the config untouched
    pub fn apply_tuning(&self, tuning: SchedTuning) -> SchedResult<()> {
        let next = tuning.applied_to(self.config());
        next.validate()?;
        if tuning.power.is_some() {
            self.power.set_thresholds(next.power);
        }
        *self.config.write() = next;
        log::info!(
            "Scheduler: tuned interval={}ns threshold={}",
            next.balance_interval_ns,
            next.imbalance_threshold
        );
        Ok(())
    }

    /// Source for NUMA-aware placement
    pub fn set_memory_affinity(&self, memory: Arc<dyn MemoryAffinity>) {
        *self.memory.write() = Some(memory);
    }

    /// Topology in use
    pub fn topology(&self) -> Arc<Topology> {
        self.topology.read().clone()
    }

    /// Domain hierarchy in use
    pub fn domains(&self) -> Arc<DomainTree> {
        self.domains.read().clone()
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    /// Counters
    pub fn stats(&self) -> SchedStats {
        self.stats.snapshot()
    }

    /// Take all pending events
    pub fn drain_events(&self) -> Vec<SchedEvent> {
        self.events.drain()
    }

    /// Events lost to log overflow
    pub fn events_dropped(&self) -> u64 {
        self.events.dropped()
    }

    /// Units queued or running on `core`
    pub fn load(&self, core: CoreId) -> Option<usize> {
        self.queue(core).map(|rq| rq.load())
    }

    /// Units waiting on `core`, not counting the running one
    pub fn queued_on(&self, core: CoreId) -> Option<usize> {
        self.queue(core).map(|rq| rq.lock().queued())
    }

    /// Unit running on `core`
    pub fn running_on(&self, core: CoreId) -> Option<UnitId> {
        self.queue(core)
            .and_then(|rq| rq.lock().running())
            .map(|r| r.entry.unit)
    }

    /// Units held by all run-queues, running ones included
    pub fn scheduled_units(&self) -> usize {
        let queues: Vec<Arc<RunQueue>> = self.queues.read().values().cloned().collect();
        queues
            .iter()
            .map(|rq| {
                let q = rq.lock();
                q.queued() + usize::from(q.running().is_some())
            })
            .sum()
    }

    /// State of a unit
    pub fn unit_state(&self, unit: UnitId) -> Option<UnitState> {
        self.shard(unit).lock().get(&unit).map(|r| r.state)
    }

    /// CPU time charged to a unit (ns)
    pub fn runtime_of(&self, unit: UnitId) -> Option<u64> {
        self.shard(unit).lock().get(&unit).map(|r| r.runtime_ns)
    }

    /// Power state of a core
    pub fn power_state(&self, core: CoreId) -> Option<PowerState> {
        self.power.state(core)
    }

    /// Core and node a unit is on, or last ran on when blocked
    pub fn current_placement(&self, unit: UnitId) -> SchedResult<(CoreId, NodeId)> {
        let core = {
            let units = self.shard(unit).lock();
            let rec = units.get(&unit).ok_or(SchedError::UnknownUnit(unit))?;
            rec.core.or(rec.last_core).ok_or(SchedError::UnknownUnit(unit))?
        };
        let node = self
            .topology
            .read()
            .node_of(core)
            .ok_or(SchedError::InvalidCore(core))?;
        Ok((core, node))
    }

    // ------------------------------------------------------------------------
    // Unit life cycle
    // ------------------------------------------------------------------------

    /// Accept a unit; returns the core it was queued on
    ///
    /// A real-time unit that cannot meet its deadline on any eligible core
    /// is still queued and a [`SchedEvent::DeadlineMissed`] is raised.
    pub fn enqueue(&self, handle: Arc<dyn RunnableUnitHandle>, now_ns: u64) -> SchedResult<CoreId> {
        let unit = handle.id();
        if handle.priority_class() == PriorityClass::RealTime && !self.config.read().enable_realtime {
            return Err(SchedError::RealtimeDisabled(unit));
        }

        let affinity = handle.affinity();
        let entry = self.entry_for(handle.as_ref(), affinity);
        {
            let mut units = self.shard(unit).lock();
            if units.contains_key(&unit) {
                return Err(SchedError::AlreadyQueued(unit));
            }
            units.insert(
                unit,
                UnitRecord {
                    handle,
                    affinity,
                    state: UnitState::Queued,
                    core: None,
                    last_core: None,
                    runtime_ns: 0,
                },
            );
        }

        match self.place(entry, None, now_ns) {
            Ok(core) => {
                Counters::bump(&self.stats.enqueued, 1);
                log::debug!("Scheduler: {} ({}) -> {}", unit, entry.class, core);
                Ok(core)
            },
            Err(err) => {
                self.shard(unit).lock().remove(&unit);
                Err(err)
            },
        }
    }

    /// Pick what `core` runs next
    ///
    /// Keeps the running unit unless a more urgent one waits: any real-time
    /// unit beats a non-real-time one, an earlier deadline beats a later
    /// one. Returns `None` when the core should idle.
    pub fn dispatch(&self, core: CoreId, now_ns: u64) -> SchedResult<Option<UnitId>> {
        let rq = self.queue(core).ok_or(SchedError::InvalidCore(core))?;
        rq.take_resched();

        let mut evicted = Vec::new();
        let picked = {
            let mut q = rq.lock();
            let misplaced = q
                .running()
                .map_or(false, |r| !r.entry.affinity.contains(core));
            if misplaced || q.should_preempt() {
                if let Some(running) = q.take_running() {
                    Counters::bump(&self.stats.preemptions, 1);
                    self.requeue_locked(&mut q, running, now_ns, &mut evicted);
                }
            }
            match q.running() {
                Some(r) => Some(r.entry.unit),
                None => self.pick_next_locked(&mut q, now_ns, &mut evicted),
            }
        };

        self.resubmit(evicted, now_ns);
        Ok(picked)
    }

    /// Put the running unit back at the end of its class and pick again
    pub fn yield_current(&self, core: CoreId, now_ns: u64) -> SchedResult<Option<UnitId>> {
        let rq = self.queue(core).ok_or(SchedError::InvalidCore(core))?;
        let mut evicted = Vec::new();
        let picked = {
            let mut q = rq.lock();
            if let Some(running) = q.take_running() {
                self.requeue_locked(&mut q, running, now_ns, &mut evicted);
            }
            self.pick_next_locked(&mut q, now_ns, &mut evicted)
        };
        self.resubmit(evicted, now_ns);
        Ok(picked)
    }

    /// Running unit waits for an event
    pub fn block(&self, unit: UnitId, now_ns: u64) -> SchedResult<()> {
        self.with_unit(unit, |q, rec| {
            let q = match (rec.state, q) {
                (UnitState::Running, Some(q)) => q,
                (from, _) => {
                    return Err(SchedError::InvalidTransition {
                        unit,
                        from,
                        to: UnitState::Blocked,
                    })
                },
            };
            if let Some(running) = take_running_of(q, unit) {
                rec.charge(&running, now_ns);
            }
            rec.state = UnitState::Blocked;
            rec.core = None;
            Ok(())
        })
    }

    /// Blocked unit becomes runnable; returns its new core
    pub fn wake(&self, unit: UnitId, now_ns: u64) -> SchedResult<CoreId> {
        let (entry, last_core) = {
            let mut units = self.shard(unit).lock();
            let rec = units.get_mut(&unit).ok_or(SchedError::UnknownUnit(unit))?;
            if rec.state != UnitState::Blocked {
                return Err(SchedError::InvalidTransition {
                    unit,
                    from: rec.state,
                    to: UnitState::Queued,
                });
            }
            rec.state = UnitState::Queued;
            (self.entry_for(rec.handle.as_ref(), rec.affinity), rec.last_core)
        };

        self.place(entry, last_core, now_ns).map_err(|err| {
            if let Some(rec) = self.shard(unit).lock().get_mut(&unit) {
                if rec.core.is_none() {
                    rec.state = UnitState::Blocked;
                }
            }
            err
        })
    }

    /// Forget a unit, wherever it is
    pub fn terminate(&self, unit: UnitId, now_ns: u64) -> SchedResult<()> {
        self.with_unit(unit, |q, rec| {
            match (rec.state, q) {
                (UnitState::Queued, Some(q)) => {
                    q.remove(unit);
                },
                (UnitState::Running, Some(q)) => {
                    if let Some(running) = take_running_of(q, unit) {
                        rec.charge(&running, now_ns);
                    }
                },
                _ => {},
            }
            rec.state = UnitState::Terminated;
            rec.core = None;
            Ok(())
        })?;
        log::debug!("Scheduler: {} terminated", unit);
        Ok(())
    }

    /// Change where a unit may run
    ///
    /// A queued unit outside the new mask moves at once; a running one is
    /// moved at the core's next dispatch.
    pub fn set_affinity(&self, unit: UnitId, mask: CpuMask, now_ns: u64) -> SchedResult<()> {
        if self.eligible_cores(&mask).is_empty() {
            return Err(SchedError::NoEligibleCore(unit));
        }

        let moved = self.with_unit(unit, |q, rec| {
            rec.affinity = mask;
            let Some(q) = q else {
                return Ok(None);
            };
            let core = q.core();
            match rec.state {
                UnitState::Queued if !mask.contains(core) => match q.remove(unit) {
                    Some(mut entry) => {
                        entry.affinity = mask;
                        rec.core = None;
                        Ok(Some((entry, rec.last_core)))
                    },
                    // Still in flight to the inbox; dispatch hands it back
                    None => Ok(None),
                },
                UnitState::Queued => {
                    q.retarget(unit, mask);
                    Ok(None)
                },
                UnitState::Running => {
                    if let Some(mut running) = take_running_of(q, unit) {
                        running.entry.affinity = mask;
                        q.set_running(running);
                    }
                    Ok(None)
                },
                _ => Ok(None),
            }
        })?;

        let running_elsewhere = {
            let units = self.shard(unit).lock();
            units
                .get(&unit)
                .filter(|r| r.state == UnitState::Running)
                .and_then(|r| r.core)
                .filter(|c| !mask.contains(*c))
        };
        if let Some(core) = running_elsewhere {
            if let Some(rq) = self.queue(core) {
                rq.set_flags(CoreFlags::NEED_RESCHED);
            }
        }

        if let Some((entry, last_core)) = moved {
            self.place(entry, last_core, now_ns)?;
        }
        Ok(())
    }

    /// Does `core` have a pending preemption request?
    pub fn needs_resched(&self, core: CoreId) -> bool {
        self.queue(core)
            .map_or(false, |rq| rq.flags().contains(CoreFlags::NEED_RESCHED))
    }

    // ------------------------------------------------------------------------
    // Balancing
    // ------------------------------------------------------------------------

    /// Run whichever balancing levels are due, narrowest first
    pub fn tick(&self, now_ns: u64) -> BalanceReport {
        let config = self.config();
        let mut report = BalanceReport::default();

        for level in DomainLevel::ALL {
            let i = level.index();
            let interval = config.balance_interval_ns * level.interval_multiplier();
            {
                let mut last = self.last_balance.lock();
                if now_ns < last[i].saturating_add(interval) {
                    continue;
                }
                last[i] = now_ns;
            }
            report.levels_run[i] = true;
            report.moved[i] = self.balance_level(level, config.imbalance_threshold);
            Counters::bump(&self.stats.migrations[i], report.moved[i] as u64);
        }

        if report.total_moved() > 0 {
            log::debug!("Scheduler: balanced {:?}", report.moved);
        }
        report
    }

    /// Balance every domain at `level` once
    pub fn balance_level(&self, level: DomainLevel, threshold: usize) -> usize {
        let tree = self.domains();
        let mut moved = 0;

        for domain in tree.domains(level) {
            if domain.groups.len() < 2 {
                continue;
            }
            let loads: Vec<Vec<CoreLoad>> = domain
                .groups
                .iter()
                .map(|g| self.core_loads(g))
                .collect();

            // Busiest and idlest group by mean load; ties keep the lower id
            let mean = |g: &[CoreLoad]| -> Option<usize> {
                if g.is_empty() {
                    return None;
                }
                Some(g.iter().map(|c| c.load).sum::<usize>() * 1000 / g.len())
            };
            let mut busiest: Option<(usize, usize)> = None;
            let mut idlest: Option<(usize, usize)> = None;
            for (i, g) in loads.iter().enumerate() {
                let Some(m) = mean(&g[..]) else { continue };
                if busiest.map_or(true, |(_, b)| m > b) {
                    busiest = Some((i, m));
                }
                if idlest.map_or(true, |(_, b)| m < b) {
                    idlest = Some((i, m));
                }
            }
            let (Some((bi, _)), Some((ii, _))) = (busiest, idlest) else {
                continue;
            };
            if bi == ii {
                continue;
            }

            let src = loads[bi].iter().copied().max_by(|a, b| {
                a.load.cmp(&b.load).then_with(|| b.core.cmp(&a.core))
            });
            let dst = crate::placement::least_loaded(&loads[ii]);
            let (Some(src), Some(dst)) = (src, dst) else {
                continue;
            };
            if src.load <= dst.load + threshold {
                continue;
            }
            moved += self.migrate_between(src.core, dst.core, threshold);
        }
        moved
    }

    /// Move queued units from `src` to `dst` until their gap is within
    /// `threshold`
    fn migrate_between(&self, src: CoreId, dst: CoreId, threshold: usize) -> usize {
        let (Some(src_rq), Some(dst_rq)) = (self.queue(src), self.queue(dst)) else {
            return 0;
        };
        let (mut from, mut to) = if src < dst {
            let from = src_rq.lock();
            let to = dst_rq.lock();
            (from, to)
        } else {
            let to = dst_rq.lock();
            let from = src_rq.lock();
            (from, to)
        };

        let from_load = from.queued() + usize::from(from.running().is_some());
        let to_load = to.queued() + usize::from(to.running().is_some());
        if from_load <= to_load + threshold {
            return 0;
        }
        let batch = from.take_movable(dst, (from_load - to_load) / 2);

        let mut moved = 0;
        for entry in batch {
            let mut units = self.shard(entry.unit).lock();
            match units.get_mut(&entry.unit) {
                Some(rec) if rec.state == UnitState::Queued && rec.core == Some(src) => {
                    rec.core = Some(dst);
                    to.push(entry);
                    moved += 1;
                },
                _ => Counters::bump(&self.stats.stale_entries, 1),
            }
        }
        moved
    }

    // ------------------------------------------------------------------------
    // Hot-plug
    // ------------------------------------------------------------------------

    /// Apply a hot-plug event; `next` is the snapshot after the event
    ///
    /// Returns the number of units moved off a removed core.
    pub fn hotplug(&self, event: HotplugEvent, next: Arc<Topology>, now_ns: u64) -> SchedResult<usize> {
        match event {
            HotplugEvent::CoreAdded(node) => {
                self.core_added(node.core, next)?;
                Ok(0)
            },
            HotplugEvent::CoreRemoved(core) => self.core_removed(core, next, now_ns),
        }
    }

    fn core_added(&self, core: CoreId, next: Arc<Topology>) -> SchedResult<()> {
        if !next.online().contains(core) {
            return Err(SchedError::InvalidCore(core));
        }
        let capacity = self.config.read().inbox_capacity;
        self.queues
            .write()
            .entry(core)
            .or_insert_with(|| Arc::new(RunQueue::new(core, capacity)));
        self.power.add_core(core);
        self.install_topology(next);
        log::info!("Scheduler: {} online", core);
        Ok(())
    }

    fn core_removed(&self, core: CoreId, next: Arc<Topology>, now_ns: u64) -> SchedResult<usize> {
        let rq = self.queue(core).ok_or(SchedError::InvalidCore(core))?;
        let online: CpuMask = {
            let queues = self.queues.read();
            next.online()
                .iter()
                .filter(|c| *c != core && queues.contains_key(c))
                .collect()
        };
        if online.is_empty() {
            log::error!("Scheduler: refusing to take {} offline, no core would remain", core);
            return Err(SchedError::InvalidCore(core));
        }

        rq.set_flags(CoreFlags::DRAINING);
        let tree = self.domains();
        let mut pending = self.detach_all(&rq, now_ns);
        self.queues.write().remove(&core);
        // Anything submitted between the first drain and the removal
        pending.extend(self.detach_all(&rq, now_ns));

        let mut moved = 0;
        for mut entry in pending {
            let target = [DomainLevel::Cache, DomainLevel::Node, DomainLevel::Machine]
                .iter()
                .find_map(|&level| {
                    let admitted = tree.siblings(core, level).and(&online).and(&entry.affinity);
                    crate::placement::least_loaded(&self.core_loads(&admitted)).map(|c| c.core)
                });

            let target = match target {
                Some(t) => t,
                None => {
                    let Some(fallback) = crate::placement::least_loaded(&self.core_loads(&online)) else {
                        continue;
                    };
                    entry.affinity = online;
                    if let Some(rec) = self.shard(entry.unit).lock().get_mut(&entry.unit) {
                        rec.affinity = online;
                    }
                    Counters::bump(&self.stats.affinity_overrides, 1);
                    log::warn!(
                        "Scheduler: {} affinity overridden, placed on {}",
                        entry.unit,
                        fallback.core
                    );
                    self.events.push(SchedEvent::AffinityOverridden {
                        unit: entry.unit,
                        core: fallback.core,
                    });
                    fallback.core
                },
            };

            let landed = match self.push_to(target, entry) {
                Push::Queued => true,
                Push::Draining => self.place(entry, None, now_ns).is_ok(),
                Push::Gone => false,
            };
            if landed {
                moved += 1;
            }
        }

        self.power.remove_core(core);
        self.install_topology(next);
        Counters::bump(&self.stats.hotplug_moves, moved as u64);
        log::info!("Scheduler: {} offline, {} units moved", core, moved);
        Ok(moved)
    }

    /// Empty a queue; every unit it held becomes queued-in-transit
    fn detach_all(&self, rq: &RunQueue, now_ns: u64) -> Vec<QueueEntry> {
        let core = rq.core();
        let mut q = rq.lock();
        let mut entries = q.drain_all();
        if let Some(running) = q.take_running() {
            entries.insert(0, running.entry);
            if let Some(rec) = self.shard(running.entry.unit).lock().get_mut(&running.entry.unit) {
                rec.charge(&running, now_ns);
            }
        }

        entries.retain(|e| {
            let mut units = self.shard(e.unit).lock();
            match units.get_mut(&e.unit) {
                Some(rec) if rec.core == Some(core) && rec.state != UnitState::Terminated => {
                    rec.state = UnitState::Queued;
                    rec.core = None;
                    true
                },
                _ => false,
            }
        });
        entries
    }

    fn install_topology(&self, next: Arc<Topology>) {
        let domain_size = self.config.read().domain_size;
        let tree = DomainTree::build(&next, domain_size);
        *self.domains.write() = Arc::new(tree);
        *self.topology.write() = next;
    }

    // ------------------------------------------------------------------------
    // Power
    // ------------------------------------------------------------------------

    /// Feed a utilisation sample to the governor
    pub fn observe_utilization(&self, core: CoreId, util_percent: u8) -> Option<PowerState> {
        if !self.config.read().enable_power_mgmt {
            return None;
        }
        let event = self.power.observe(core, util_percent)?;
        self.events.push(event);
        self.power.state(core)
    }

    /// Feed a temperature reading; throttling is always enforced and
    /// reported
    pub fn thermal_reading(&self, core: CoreId, temperature_c: u32) -> Option<PowerState> {
        let event = self.power.thermal(core, temperature_c)?;
        self.events.push(event);
        self.power.state(core)
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn shard(&self, unit: UnitId) -> &UnitShard {
        &self.units[(unit.0 % UNIT_SHARDS as u64) as usize]
    }

    fn queue(&self, core: CoreId) -> Option<Arc<RunQueue>> {
        self.queues.read().get(&core).cloned()
    }

    fn entry_for(&self, handle: &dyn RunnableUnitHandle, affinity: CpuMask) -> QueueEntry {
        let class = handle.priority_class();
        let (deadline_ns, runtime_ns) = match class {
            PriorityClass::RealTime => (
                handle.deadline_ns().unwrap_or(u64::MAX),
                handle
                    .expected_runtime_ns()
                    .unwrap_or(self.config.read().default_rt_runtime_ns),
            ),
            _ => (u64::MAX, handle.expected_runtime_ns().unwrap_or(0)),
        };
        QueueEntry {
            unit: handle.id(),
            class,
            deadline_ns,
            runtime_ns,
            affinity,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Online, non-draining cores in `mask`
    fn eligible_cores(&self, mask: &CpuMask) -> CpuMask {
        let topology = self.topology();
        let queues = self.queues.read();
        topology
            .online()
            .and(mask)
            .iter()
            .filter(|c| {
                queues
                    .get(c)
                    .map_or(false, |rq| !rq.flags().contains(CoreFlags::DRAINING))
            })
            .collect()
    }

    fn core_loads(&self, mask: &CpuMask) -> Vec<CoreLoad> {
        let queues = self.queues.read();
        mask.iter()
            .filter_map(|core| {
                let rq = queues.get(&core)?;
                if rq.flags().contains(CoreFlags::DRAINING) {
                    return None;
                }
                let frequency_percent = self
                    .power
                    .state(core)
                    .map_or(100, PowerState::frequency_percent);
                Some(CoreLoad {
                    core,
                    load: rq.load(),
                    frequency_percent,
                })
            })
            .collect()
    }

    /// Choose a core for an in-transit unit and queue it there
    fn place(&self, entry: QueueEntry, last_core: Option<CoreId>, now_ns: u64) -> SchedResult<CoreId> {
        let unit = entry.unit;
        loop {
            let eligible = self.eligible_cores(&entry.affinity);
            if eligible.is_empty() {
                return Err(SchedError::NoEligibleCore(unit));
            }

            let (core, projected) = if entry.class == PriorityClass::RealTime {
                self.pick_realtime_core(&entry, &eligible, now_ns)
                    .ok_or(SchedError::NoEligibleCore(unit))?
            } else {
                (self.pick_core(&entry, &eligible, last_core)?, None)
            };

            match self.push_to(core, entry) {
                Push::Queued => {},
                // Went offline after we looked; pick again
                Push::Draining => continue,
                Push::Gone => return Err(SchedError::UnknownUnit(unit)),
            }

            if let Some(finish_ns) = projected.filter(|&f| f > entry.deadline_ns) {
                self.deadline_missed(unit, entry.deadline_ns, finish_ns);
            }
            return Ok(core);
        }
    }

    fn pick_core(&self, entry: &QueueEntry, eligible: &CpuMask, last_core: Option<CoreId>) -> SchedResult<CoreId> {
        let config = self.config();
        let topology = self.topology();
        let loads = self.core_loads(eligible);
        let restricted = eligible.count() < self.eligible_cores(topology.online()).count();

        let memory_node = self
            .memory
            .read()
            .as_ref()
            .and_then(|m| m.memory_node_of(entry.unit));
        let hint = PlacementHint {
            last_core,
            memory_node,
        };
        choose_core(
            config.balance_algorithm,
            &topology,
            &loads,
            restricted,
            &hint,
            config.imbalance_threshold,
        )
        .ok_or(SchedError::NoEligibleCore(entry.unit))
    }

    /// Core where the unit would finish earliest under EDF, with that
    /// projected finish
    fn pick_realtime_core(&self, entry: &QueueEntry, eligible: &CpuMask, now_ns: u64) -> Option<(CoreId, Option<u64>)> {
        let mut best: Option<(u64, usize, CoreId)> = None;
        for core in eligible.iter() {
            let Some(rq) = self.queue(core) else { continue };
            let (finish, load) = {
                let q = rq.lock();
                let finish = now_ns
                    .saturating_add(q.rt_work_before(entry.deadline_ns, now_ns))
                    .saturating_add(entry.runtime_ns);
                (finish, q.queued() + usize::from(q.running().is_some()))
            };
            let key = (finish, load, core);
            if best.map_or(true, |b| key < b) {
                best = Some(key);
            }
        }
        best.map(|(finish, _, core)| (core, Some(finish)))
    }

    /// Record `core` as the home of an in-transit unit
    fn claim(&self, unit: UnitId, core: CoreId) -> bool {
        let mut units = self.shard(unit).lock();
        match units.get_mut(&unit) {
            Some(rec) if rec.state == UnitState::Queued && rec.core.is_none() => {
                rec.core = Some(core);
                true
            },
            _ => false,
        }
    }

    /// Queue an in-transit unit on `core`
    ///
    /// Real-time units go in under the local lock so a preemption request
    /// is raised at once; the rest go through the lock-free inbox.
    fn push_to(&self, core: CoreId, entry: QueueEntry) -> Push {
        let Some(rq) = self.queue(core) else {
            return Push::Draining;
        };
        if rq.flags().contains(CoreFlags::DRAINING) {
            return Push::Draining;
        }

        if entry.class == PriorityClass::RealTime {
            let mut q = rq.lock();
            if !self.claim(entry.unit, core) {
                return Push::Gone;
            }
            q.push(entry);
            if q.should_preempt() {
                rq.set_flags(CoreFlags::NEED_RESCHED);
            }
        } else {
            if !self.claim(entry.unit, core) {
                return Push::Gone;
            }
            rq.submit(entry);
        }
        Push::Queued
    }

    /// Put a unit that left the core back in line, or out for re-placement
    /// if the core no longer suits it
    fn requeue_locked(
        &self,
        q: &mut LockedQueue<'_>,
        running: RunningUnit,
        now_ns: u64,
        evicted: &mut Vec<(QueueEntry, Option<CoreId>)>,
    ) {
        let core = q.core();
        let mut entry = running.entry;
        let stays = {
            let mut units = self.shard(entry.unit).lock();
            let Some(rec) = units.get_mut(&entry.unit) else {
                return;
            };
            rec.charge(&running, now_ns);
            rec.state = UnitState::Queued;
            entry.affinity = rec.affinity;
            if entry.affinity.contains(core) {
                true
            } else {
                rec.core = None;
                evicted.push((entry, rec.last_core));
                false
            }
        };
        if stays {
            q.push(entry);
        }
    }

    fn resubmit(&self, evicted: Vec<(QueueEntry, Option<CoreId>)>, now_ns: u64) {
        for (entry, last_core) in evicted {
            if let Err(err) = self.place(entry, last_core, now_ns) {
                log::warn!("Scheduler: re-placing {} failed: {}", entry.unit, err);
            }
        }
    }

    /// Pop until a unit that still belongs here turns up and run it
    ///
    /// Entries of units that moved on are dropped; units whose affinity no
    /// longer admits the core are handed back through `evicted`.
    fn pick_next_locked(
        &self,
        q: &mut LockedQueue<'_>,
        now_ns: u64,
        evicted: &mut Vec<(QueueEntry, Option<CoreId>)>,
    ) -> Option<UnitId> {
        let core = q.core();
        loop {
            let mut entry = q.pop_best()?;
            let runnable = {
                let mut units = self.shard(entry.unit).lock();
                match units.get_mut(&entry.unit) {
                    Some(rec) if rec.state == UnitState::Queued && rec.core == Some(core) => {
                        entry.affinity = rec.affinity;
                        if rec.affinity.contains(core) {
                            rec.state = UnitState::Running;
                            rec.last_core = Some(core);
                            true
                        } else {
                            rec.core = None;
                            evicted.push((entry, rec.last_core));
                            false
                        }
                    },
                    _ => {
                        Counters::bump(&self.stats.stale_entries, 1);
                        false
                    },
                }
            };
            if !runnable {
                continue;
            }

            q.set_running(RunningUnit {
                entry,
                started_ns: now_ns,
            });
            Counters::bump(&self.stats.dispatched, 1);
            if entry.class == PriorityClass::RealTime && now_ns > entry.deadline_ns {
                self.deadline_missed(entry.unit, entry.deadline_ns, now_ns);
            }
            return Some(entry.unit);
        }
    }

    fn deadline_missed(&self, unit: UnitId, deadline_ns: u64, finish_ns: u64) {
        Counters::bump(&self.stats.deadline_misses, 1);
        log::warn!(
            "Scheduler: {} misses deadline {}ns (finish {}ns)",
            unit,
            deadline_ns,
            finish_ns
        );
        self.events.push(SchedEvent::DeadlineMissed {
            unit,
            deadline_ns,
            finish_ns,
        });
    }

    /// Run `f` on a unit's record with the lock of the queue holding it
    fn with_unit<R>(
        &self,
        unit: UnitId,
        f: impl FnOnce(Option<&mut LockedQueue<'_>>, &mut UnitRecord) -> SchedResult<R>,
    ) -> SchedResult<R> {
        loop {
            let core = self
                .shard(unit)
                .lock()
                .get(&unit)
                .ok_or(SchedError::UnknownUnit(unit))?
                .core;

            let rq = match core {
                Some(core) => match self.queue(core) {
                    Some(rq) => Some(rq),
                    None => {
                        // Hot-plug is moving it
                        core::hint::spin_loop();
                        continue;
                    },
                },
                None => None,
            };
            let mut locked = rq.as_ref().map(|rq| rq.lock());

            let mut units = self.shard(unit).lock();
            let rec = units.get_mut(&unit).ok_or(SchedError::UnknownUnit(unit))?;
            if rec.core != core {
                continue;
            }
            let out = f(locked.as_mut(), rec);
            let gone = rec.state == UnitState::Terminated;
            if gone {
                units.remove(&unit);
            }
            return out;
        }
    }
}

/// Take the running unit off `q` if it is `unit`
fn take_running_of(q: &mut LockedQueue<'_>, unit: UnitId) -> Option<RunningUnit> {
    match q.running() {
        Some(r) if r.entry.unit == unit => q.take_running(),
        _ => None,
    }
}

impl core::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config())
            .field("cores", &self.queues.read().len())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::UnitDescriptor;
    use helix_numa::{AllocPolicy, NumaConfig, NumaManager};
    use helix_topology::{CacheDomainId, StaticProbe, TopologyNode};
    use proptest::prelude::*;

    fn topology(nodes: u32, cores_per_node: u32, cores_per_llc: u32) -> Arc<Topology> {
        let probe = StaticProbe::uniform(nodes, cores_per_node, cores_per_llc, 4096, 20);
        Arc::new(Topology::discover(&probe).unwrap())
    }

    fn scheduler(nodes: u32, cores_per_node: u32, cores_per_llc: u32) -> Scheduler {
        Scheduler::new(topology(nodes, cores_per_node, cores_per_llc), SchedConfig::new()).unwrap()
    }

    fn unit(desc: UnitDescriptor) -> Arc<dyn RunnableUnitHandle> {
        Arc::new(desc)
    }

    fn pinned(desc: UnitDescriptor, core: u32) -> Arc<dyn RunnableUnitHandle> {
        unit(desc.with_affinity(CpuMask::single(CoreId(core))))
    }

    /// Run every core's real-time work back to back from t=0; returns the
    /// number of units run
    fn run_realtime(sched: &Scheduler, cores: u32, rt: &HashMap<UnitId, (u64, u64)>) -> usize {
        let mut ran = 0;
        for c in 0..cores {
            let core = CoreId(c);
            let mut now = 0;
            while let Some(id) = sched.dispatch(core, now).unwrap() {
                let Some(&(deadline, runtime)) = rt.get(&id) else {
                    break;
                };
                assert!(now + runtime <= deadline, "{} finished at {} past {}", id, now + runtime, deadline);
                now += runtime;
                sched.terminate(id, now).unwrap();
                ran += 1;
            }
        }
        ran
    }

    #[test]
    fn test_class_order_and_realtime_preemption() {
        let sched = scheduler(1, 2, 2);
        sched.enqueue(pinned(UnitDescriptor::batch(1), 0), 0).unwrap();
        sched.enqueue(pinned(UnitDescriptor::interactive(2), 0), 0).unwrap();
        assert_eq!(sched.dispatch(CoreId(0), 0).unwrap(), Some(UnitId(2)));
        assert!(!sched.needs_resched(CoreId(0)));

        let core = sched
            .enqueue(pinned(UnitDescriptor::realtime(3, 1_000_000, 100), 0), 10)
            .unwrap();
        assert_eq!(core, CoreId(0));
        assert!(sched.needs_resched(CoreId(0)));

        assert_eq!(sched.dispatch(CoreId(0), 20).unwrap(), Some(UnitId(3)));
        assert_eq!(sched.unit_state(UnitId(2)), Some(UnitState::Queued));
        assert_eq!(sched.runtime_of(UnitId(2)), Some(20));
        assert_eq!(sched.stats().preemptions, 1);

        sched.terminate(UnitId(3), 120).unwrap();
        assert_eq!(sched.dispatch(CoreId(0), 120).unwrap(), Some(UnitId(2)));
        // Running unit is kept when nothing more urgent waits
        assert_eq!(sched.dispatch(CoreId(0), 130).unwrap(), Some(UnitId(2)));
    }

    #[test]
    fn test_yield_rotates_within_class() {
        let sched = scheduler(1, 1, 1);
        sched.enqueue(unit(UnitDescriptor::batch(1)), 0).unwrap();
        sched.enqueue(unit(UnitDescriptor::batch(2)), 0).unwrap();
        assert_eq!(sched.dispatch(CoreId(0), 0).unwrap(), Some(UnitId(1)));
        assert_eq!(sched.yield_current(CoreId(0), 5).unwrap(), Some(UnitId(2)));
        assert_eq!(sched.yield_current(CoreId(0), 9).unwrap(), Some(UnitId(1)));
    }

    #[test]
    fn test_affinity_restricts_placement() {
        let sched = scheduler(2, 4, 2);
        let mask: CpuMask = [CoreId(5), CoreId(6)].into_iter().collect();
        let a = sched.enqueue(unit(UnitDescriptor::batch(1).with_affinity(mask)), 0).unwrap();
        let b = sched.enqueue(unit(UnitDescriptor::batch(2).with_affinity(mask)), 0).unwrap();
        assert_eq!((a, b), (CoreId(5), CoreId(6)));

        sched.set_affinity(UnitId(1), CpuMask::single(CoreId(1)), 0).unwrap();
        assert_eq!(sched.current_placement(UnitId(1)).unwrap(), (CoreId(1), NodeId(0)));
        assert_eq!(sched.dispatch(CoreId(1), 0).unwrap(), Some(UnitId(1)));
        assert_eq!(sched.dispatch(CoreId(5), 0).unwrap(), None);

        assert_eq!(
            sched.set_affinity(UnitId(2), CpuMask::empty(), 0),
            Err(SchedError::NoEligibleCore(UnitId(2)))
        );
        assert_eq!(
            sched.enqueue(unit(UnitDescriptor::batch(3).with_affinity(CpuMask::single(CoreId(40)))), 0),
            Err(SchedError::NoEligibleCore(UnitId(3)))
        );
        assert_eq!(sched.unit_state(UnitId(3)), None);
    }

    #[test]
    fn test_running_unit_leaves_excluded_core() {
        let sched = scheduler(1, 2, 2);
        sched.enqueue(pinned(UnitDescriptor::batch(1), 0), 0).unwrap();
        assert_eq!(sched.dispatch(CoreId(0), 0).unwrap(), Some(UnitId(1)));

        sched.set_affinity(UnitId(1), CpuMask::single(CoreId(1)), 5).unwrap();
        assert!(sched.needs_resched(CoreId(0)));
        assert_eq!(sched.dispatch(CoreId(0), 10).unwrap(), None);
        assert_eq!(sched.dispatch(CoreId(1), 10).unwrap(), Some(UnitId(1)));
    }

    #[test]
    fn test_numa_aware_follows_memory() {
        let topo = topology(2, 4, 2);
        let sched = Scheduler::new(topo.clone(), SchedConfig::new()).unwrap();
        let numa = Arc::new(NumaManager::new(topo, NumaConfig::new()).unwrap());
        let range = numa.allocate(8192, AllocPolicy::Bind(NodeId(1))).unwrap();
        numa.record_access(range, UnitId(7), NodeId(0), 1);
        sched.set_memory_affinity(numa);

        assert_eq!(sched.enqueue(unit(UnitDescriptor::batch(7)), 2).unwrap(), CoreId(4));
        // No memory known: least-loaded, lowest id
        assert_eq!(sched.enqueue(unit(UnitDescriptor::batch(8)), 2).unwrap(), CoreId(0));
        assert_eq!(sched.current_placement(UnitId(7)).unwrap(), (CoreId(4), NodeId(1)));
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let sched = scheduler(1, 2, 2);
        sched.enqueue(unit(UnitDescriptor::batch(1)), 0).unwrap();
        assert_eq!(
            sched.enqueue(unit(UnitDescriptor::batch(1)), 0),
            Err(SchedError::AlreadyQueued(UnitId(1)))
        );
        assert!(matches!(
            sched.block(UnitId(1), 0),
            Err(SchedError::InvalidTransition { from: UnitState::Queued, .. })
        ));
        assert!(matches!(
            sched.wake(UnitId(1), 0),
            Err(SchedError::InvalidTransition { from: UnitState::Queued, .. })
        ));
        assert_eq!(sched.block(UnitId(9), 0), Err(SchedError::UnknownUnit(UnitId(9))));

        let core = sched.current_placement(UnitId(1)).unwrap().0;
        assert_eq!(sched.dispatch(core, 0).unwrap(), Some(UnitId(1)));
        sched.block(UnitId(1), 50).unwrap();
        assert_eq!(sched.unit_state(UnitId(1)), Some(UnitState::Blocked));
        assert_eq!(sched.runtime_of(UnitId(1)), Some(50));
        assert_eq!(sched.dispatch(core, 50).unwrap(), None);

        sched.wake(UnitId(1), 60).unwrap();
        assert_eq!(sched.unit_state(UnitId(1)), Some(UnitState::Queued));
        sched.terminate(UnitId(1), 70).unwrap();
        assert_eq!(sched.unit_state(UnitId(1)), None);
        assert_eq!(sched.scheduled_units(), 0);
    }

    #[test]
    fn test_realtime_can_be_disabled() {
        let config = SchedConfig {
            enable_realtime: false,
            ..SchedConfig::new()
        };
        let sched = Scheduler::new(topology(1, 2, 2), config).unwrap();
        assert_eq!(
            sched.enqueue(unit(UnitDescriptor::realtime(1, 100, 10)), 0),
            Err(SchedError::RealtimeDisabled(UnitId(1)))
        );
        assert!(sched.enqueue(unit(UnitDescriptor::batch(2)), 0).is_ok());
    }

    #[test]
    fn test_infeasible_deadline_reported_and_queued() {
        let sched = scheduler(1, 1, 1);
        sched.enqueue(unit(UnitDescriptor::realtime(1, 1_000, 5_000)), 0).unwrap();
        assert_eq!(sched.unit_state(UnitId(1)), Some(UnitState::Queued));
        assert_eq!(
            sched.drain_events(),
            [SchedEvent::DeadlineMissed {
                unit: UnitId(1),
                deadline_ns: 1_000,
                finish_ns: 5_000,
            }]
        );
        assert_eq!(sched.stats().deadline_misses, 1);
    }

    #[test]
    fn test_late_dispatch_reported() {
        let sched = scheduler(1, 1, 1);
        sched.enqueue(unit(UnitDescriptor::realtime(1, 10_000, 1_000)), 0).unwrap();
        assert!(sched.drain_events().is_empty());
        assert_eq!(sched.dispatch(CoreId(0), 20_000).unwrap(), Some(UnitId(1)));
        assert_eq!(
            sched.drain_events(),
            [SchedEvent::DeadlineMissed {
                unit: UnitId(1),
                deadline_ns: 10_000,
                finish_ns: 20_000,
            }]
        );
    }

    #[test]
    fn test_cache_level_balancing_halves_gap() {
        let sched = scheduler(1, 2, 2);
        for id in 0..8 {
            sched.enqueue(pinned(UnitDescriptor::batch(id), 0), 0).unwrap();
            sched.set_affinity(UnitId(id), CpuMask::first_n(2), 0).unwrap();
        }
        assert_eq!(sched.load(CoreId(0)), Some(8));

        let report = sched.tick(SchedConfig::new().balance_interval_ns);
        assert_eq!(report.levels_run, [true, false, false]);
        assert_eq!(report.moved, [4, 0, 0]);
        assert_eq!(sched.load(CoreId(0)), Some(4));
        assert_eq!(sched.load(CoreId(1)), Some(4));
        assert_eq!(sched.stats().migrations, [4, 0, 0]);
        assert_eq!(sched.scheduled_units(), 8);
    }

    #[test]
    fn test_pinned_units_never_balanced() {
        let sched = scheduler(1, 2, 2);
        for id in 0..6 {
            sched.enqueue(pinned(UnitDescriptor::batch(id), 0), 0).unwrap();
        }
        assert_eq!(sched.balance_level(DomainLevel::Cache, 1), 0);
        assert_eq!(sched.load(CoreId(1)), Some(0));
    }

    #[test]
    fn test_balance_ties_break_to_lowest_id() {
        let sched = scheduler(1, 3, 3);
        let all = CpuMask::first_n(3);
        for id in 0..8u64 {
            let core = 1 + (id % 2) as u32;
            sched.enqueue(pinned(UnitDescriptor::batch(id), core), 0).unwrap();
            sched.set_affinity(UnitId(id), all, 0).unwrap();
        }
        assert_eq!(sched.balance_level(DomainLevel::Cache, 1), 2);
        assert_eq!(sched.load(CoreId(0)), Some(2));
        assert_eq!(sched.load(CoreId(1)), Some(2));
        assert_eq!(sched.load(CoreId(2)), Some(4));
    }

    #[test]
    fn test_balance_cadence_per_level() {
        let sched = scheduler(2, 4, 2);
        let base = SchedConfig::new().balance_interval_ns;
        assert_eq!(sched.tick(base / 2).levels_run, [false, false, false]);
        assert_eq!(sched.tick(base).levels_run, [true, false, false]);
        assert_eq!(sched.tick(base * 4).levels_run, [true, true, false]);
        assert_eq!(sched.tick(base * 16).levels_run, [true, true, true]);
        assert_eq!(sched.tick(base * 16 + 1).levels_run, [false, false, false]);
    }

    #[test]
    fn test_hotplug_moves_every_unit() {
        let topo = topology(1, 4, 2);
        let sched = Scheduler::new(topo.clone(), SchedConfig::new()).unwrap();
        sched.enqueue(pinned(UnitDescriptor::batch(1), 1), 0).unwrap();
        for id in 2..=3 {
            sched.enqueue(pinned(UnitDescriptor::batch(id), 1), 0).unwrap();
            sched.set_affinity(UnitId(id), CpuMask::first_n(4), 0).unwrap();
        }
        sched.enqueue(unit(UnitDescriptor::batch(4)), 0).unwrap();
        assert_eq!(sched.dispatch(CoreId(1), 0).unwrap(), Some(UnitId(1)));

        let next = Arc::new(topo.without_core(CoreId(1)).unwrap());
        let moved = sched
            .hotplug(HotplugEvent::CoreRemoved(CoreId(1)), next.clone(), 100)
            .unwrap();
        assert_eq!(moved, 3);
        assert_eq!(sched.scheduled_units(), 4);
        assert_eq!(sched.load(CoreId(1)), None);
        assert_eq!(sched.dispatch(CoreId(1), 100), Err(SchedError::InvalidCore(CoreId(1))));
        assert_eq!(sched.unit_state(UnitId(1)), Some(UnitState::Queued));
        assert_eq!(sched.runtime_of(UnitId(1)), Some(100));

        let stats = sched.stats();
        assert_eq!(stats.hotplug_moves, 3);
        assert_eq!(stats.affinity_overrides, 1);
        assert!(sched
            .drain_events()
            .iter()
            .any(|e| matches!(e, SchedEvent::AffinityOverridden { unit, .. } if *unit == UnitId(1))));

        let node = TopologyNode::new(CoreId(1), NodeId(0), CacheDomainId(0), 2000);
        let back = Arc::new(next.with_core_added(node).unwrap());
        assert_eq!(sched.hotplug(HotplugEvent::CoreAdded(node), back, 200), Ok(0));
        assert_eq!(sched.load(CoreId(1)), Some(0));
        assert_eq!(sched.power_state(CoreId(1)), Some(PowerState::Performance));
    }

    #[test]
    fn test_last_core_cannot_be_removed() {
        let topo = topology(1, 1, 1);
        let sched = Scheduler::new(topo.clone(), SchedConfig::new()).unwrap();
        sched.enqueue(unit(UnitDescriptor::batch(1)), 0).unwrap();
        let empty = Arc::new(topo.without_core(CoreId(0)).unwrap_or_else(|_| (*topo).clone()));
        assert!(sched.hotplug(HotplugEvent::CoreRemoved(CoreId(0)), empty, 0).is_err());
        assert_eq!(sched.scheduled_units(), 1);
    }

    #[test]
    fn test_power_and_thermal_feed_events() {
        let sched = scheduler(1, 2, 2);
        assert_eq!(sched.observe_utilization(CoreId(0), 10), None);
        assert_eq!(sched.observe_utilization(CoreId(0), 10), None);
        assert_eq!(sched.observe_utilization(CoreId(0), 10), Some(PowerState::PowerSave));
        assert_eq!(sched.thermal_reading(CoreId(1), 99), Some(PowerState::Balanced));

        let events = sched.drain_events();
        assert!(matches!(events[0], SchedEvent::PowerStateChanged { to: PowerState::PowerSave, .. }));
        assert!(matches!(events[1], SchedEvent::ThermalThrottled { to: PowerState::Balanced, .. }));
    }

    #[test]
    fn test_thermal_enforced_without_governor() {
        let config = SchedConfig {
            enable_power_mgmt: false,
            ..SchedConfig::new()
        };
        let sched = Scheduler::new(topology(1, 2, 2), config).unwrap();
        for _ in 0..5 {
            assert_eq!(sched.observe_utilization(CoreId(0), 1), None);
        }
        assert_eq!(sched.power_state(CoreId(0)), Some(PowerState::Performance));
        assert_eq!(sched.thermal_reading(CoreId(0), 120), Some(PowerState::Balanced));
    }

    #[test]
    fn test_tuning_rejected_leaves_config() {
        let sched = scheduler(1, 2, 2);
        let bad = SchedTuning {
            balance_interval_ns: Some(0),
            ..Default::default()
        };
        assert!(sched.apply_tuning(bad).is_err());
        assert_eq!(sched.config(), SchedConfig::new());

        let good = SchedTuning {
            imbalance_threshold: Some(4),
            ..Default::default()
        };
        sched.apply_tuning(good).unwrap();
        assert_eq!(sched.config().imbalance_threshold, 4);
    }

    #[test]
    fn test_hundred_realtime_units_meet_deadlines() {
        let sched = scheduler(1, 8, 8);
        for id in 1000..1004 {
            let core = sched.enqueue(unit(UnitDescriptor::batch(id)), 0).unwrap();
            assert_eq!(sched.dispatch(core, 0).unwrap(), Some(UnitId(id)));
        }

        let runtime = 50_000;
        let mut rt = HashMap::new();
        for i in 0..100u64 {
            let k = (i * 37) % 100;
            let deadline = (k + 1) * 100_000;
            sched
                .enqueue(unit(UnitDescriptor::realtime(i, deadline, runtime)), 0)
                .unwrap();
            rt.insert(UnitId(i), (deadline, runtime));
        }

        assert_eq!(run_realtime(&sched, 8, &rt), 100);
        assert_eq!(sched.stats().deadline_misses, 0);
        assert!(!sched
            .drain_events()
            .iter()
            .any(|e| matches!(e, SchedEvent::DeadlineMissed { .. })));
        // Batch work survives preemption
        assert_eq!(sched.scheduled_units(), 4);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_feasible_realtime_sets_never_miss(
            units in prop::collection::vec((10_000u64..100_000, 0u64..5_000_000), 1..40)
        ) {
            let sched = scheduler(1, 4, 4);
            let total: u64 = units.iter().map(|(runtime, _)| runtime).sum();
            let mut rt = HashMap::new();
            for (i, &(runtime, slack)) in units.iter().enumerate() {
                let deadline = total + slack;
                sched
                    .enqueue(unit(UnitDescriptor::realtime(i as u64, deadline, runtime)), 0)
                    .unwrap();
                rt.insert(UnitId(i as u64), (deadline, runtime));
            }

            prop_assert_eq!(run_realtime(&sched, 4, &rt), units.len());
            prop_assert_eq!(sched.stats().deadline_misses, 0);
            prop_assert_eq!(sched.scheduled_units(), 0);
        }
    }
}
