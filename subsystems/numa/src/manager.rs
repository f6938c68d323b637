//! NUMA memory manager.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use helix_coherency::AtomicCounter;
use helix_topology::{CoreId, NodeId, Topology, UnitId};
use spin::{Mutex, RwLock};

use crate::access::AccessTracker;
use crate::balancer::{self, BalanceStats};
use crate::config::{NumaConfig, NumaTuning};
use crate::error::{NumaError, NumaResult};
use crate::migration::{
    MigrationCallback, MigrationEngine, MigrationHandle, MigrationOrigin, MigrationStats, MigrationStatus,
};
use crate::node::{NodeState, NodeStats};
use crate::types::{pages_for, AllocPolicy, CoreLocator, PageRange};

/// Allocation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocStats {
    /// Successful allocations
    pub allocations: u64,
    /// Allocations satisfied away from the first-choice node
    pub fallbacks: u64,
    /// Failed allocations
    pub failures: u64,
    /// Ranges freed
    pub frees: u64,
}

#[derive(Debug, Default)]
struct BalanceState {
    last_ns: Option<u64>,
    stats: BalanceStats,
}

/// Topology-aware physical page manager.
///
/// Each node's free list sits behind its own lock; no operation holds two
/// node locks at once.
pub struct NumaManager {
    topology: RwLock<Arc<Topology>>,
    nodes: Vec<Mutex<NodeState>>,
    config: RwLock<NumaConfig>,
    interleave_cursor: AtomicUsize,
    unit_policies: RwLock<BTreeMap<UnitId, AllocPolicy>>,
    locator: RwLock<Option<Arc<dyn CoreLocator>>>,
    access: Mutex<AccessTracker>,
    migration: Mutex<MigrationEngine>,
    balance: Mutex<BalanceState>,
    allocations: AtomicCounter,
    fallbacks: AtomicCounter,
    failures: AtomicCounter,
    frees: AtomicCounter,
}

impl NumaManager {
    /// Manager over every node of `topology`
    pub fn new(topology: Arc<Topology>, config: NumaConfig) -> NumaResult<Self> {
        config.validate()?;
        if let Some(node) = config.default_policy.named_node() {
            if topology.node(node).is_none() {
                return Err(NumaError::InvalidPolicy(node));
            }
        }
        let nodes = topology
            .nodes()
            .iter()
            .map(|info| Mutex::new(NodeState::new(info)))
            .collect();
        log::info!(
            "NUMA: managing {} nodes, {} pages",
            topology.node_count(),
            topology.nodes().iter().map(|n| n.page_count).sum::<u64>()
        );
        Ok(Self {
            topology: RwLock::new(topology),
            nodes,
            config: RwLock::new(config),
            interleave_cursor: AtomicUsize::new(0),
            unit_policies: RwLock::new(BTreeMap::new()),
            locator: RwLock::new(None),
            access: Mutex::new(AccessTracker::new()),
            migration: Mutex::new(MigrationEngine::new()),
            balance: Mutex::new(BalanceState::default()),
            allocations: AtomicCounter::new(0),
            fallbacks: AtomicCounter::new(0),
            failures: AtomicCounter::new(0),
            frees: AtomicCounter::new(0),
        })
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    /// Current settings
    pub fn config(&self) -> NumaConfig {
        *self.config.read()
    }

    /// Apply advisory retuning
    pub fn apply_tuning(&self, tuning: NumaTuning) -> NumaResult<()> {
        let mut config = self.config.write();
        let next = tuning.applied_to(*config);
        next.validate()?;
        log::debug!(
            "NUMA: tuning rate limit {} -> {}, remote threshold {:.2} -> {:.2}",
            config.migration_rate_limit,
            next.migration_rate_limit,
            config.remote_ratio_threshold,
            next.remote_ratio_threshold
        );
        *config = next;
        Ok(())
    }

    /// Switch the automatic balancer on or off
    pub fn set_balancing_enabled(&self, enabled: bool) {
        self.config.write().balancing_enabled = enabled;
    }

    /// Topology in use
    pub fn topology(&self) -> Arc<Topology> {
        self.topology.read().clone()
    }

    /// Adopt a newer snapshot after hot-plug. Node banks never change, only
    /// the core to node mapping does.
    pub fn refresh_topology(&self, topology: Arc<Topology>) {
        *self.topology.write() = topology;
    }

    /// Source of the caller's current core for `Local` and `Auto`
    pub fn set_locator(&self, locator: Arc<dyn CoreLocator>) {
        *self.locator.write() = Some(locator);
    }

    fn check_policy(&self, policy: AllocPolicy) -> NumaResult<()> {
        match policy.named_node() {
            Some(node) if node.index() >= self.nodes.len() => Err(NumaError::InvalidPolicy(node)),
            _ => Ok(()),
        }
    }

    /// Policy used when a unit has none
    pub fn set_default_policy(&self, policy: AllocPolicy) -> NumaResult<()> {
        self.check_policy(policy)?;
        self.config.write().default_policy = policy;
        Ok(())
    }

    /// Give a unit its own policy
    pub fn set_unit_policy(&self, unit: UnitId, policy: AllocPolicy) -> NumaResult<()> {
        self.check_policy(policy)?;
        self.unit_policies.write().insert(unit, policy);
        Ok(())
    }

    /// Drop a unit's policy
    pub fn clear_unit_policy(&self, unit: UnitId) {
        self.unit_policies.write().remove(&unit);
    }

    /// Effective policy of a unit
    pub fn unit_policy(&self, unit: UnitId) -> AllocPolicy {
        self.unit_policies
            .read()
            .get(&unit)
            .copied()
            .unwrap_or(self.config.read().default_policy)
    }

    // ------------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------------

    fn caller_node(&self) -> Option<NodeId> {
        let core = self.locator.read().as_ref().and_then(|l| l.current_core())?;
        self.topology.read().node_of(core)
    }

    /// Allocate `size` bytes for the calling core
    pub fn allocate(&self, size: u64, policy: AllocPolicy) -> NumaResult<PageRange> {
        self.allocate_frames(pages_for(size), 1, policy, self.caller_node())
    }

    /// Allocate `size` bytes on behalf of a known core
    pub fn allocate_on(&self, core: CoreId, size: u64, policy: AllocPolicy) -> NumaResult<PageRange> {
        let node = self.topology.read().node_of(core);
        self.allocate_frames(pages_for(size), 1, policy, node)
    }

    /// Allocate under a unit's own policy
    pub fn allocate_for(&self, unit: UnitId, size: u64) -> NumaResult<PageRange> {
        self.allocate(size, self.unit_policy(unit))
    }

    /// Allocate `pages` frames whose first frame is `align`-aligned.
    ///
    /// `caller` is the node `Local` and `Auto` measure distance from.
    pub fn allocate_frames(
        &self,
        pages: u64,
        align: u64,
        policy: AllocPolicy,
        caller: Option<NodeId>,
    ) -> NumaResult<PageRange> {
        if pages == 0 {
            return Err(NumaError::InvalidRange);
        }
        self.check_policy(policy)?;

        let order = self.candidate_order(policy, caller);
        for (i, node) in order.iter().enumerate() {
            if let Some(range) = self.nodes[node.index()].lock().allocate(pages, align) {
                self.allocations.increment();
                if i > 0 {
                    self.fallbacks.increment();
                    log::debug!(
                        "NUMA: {} for {} pages fell back from {} to {}",
                        policy,
                        pages,
                        order[0],
                        node
                    );
                }
                return Ok(range);
            }
        }

        self.failures.increment();
        log::debug!("NUMA: {} could not place {} pages", policy, pages);
        Err(NumaError::OutOfMemory { pages })
    }

    /// Nodes to try, best first
    fn candidate_order(&self, policy: AllocPolicy, caller: Option<NodeId>) -> Vec<NodeId> {
        let topology = self.topology.read().clone();
        let with_nearest = |first: NodeId| {
            let mut order = Vec::with_capacity(self.nodes.len());
            order.push(first);
            order.extend(topology.nearest_nodes(first));
            order
        };
        match policy {
            AllocPolicy::Bind(node) => alloc::vec![node],
            AllocPolicy::Preferred(node) => with_nearest(node),
            AllocPolicy::Local => with_nearest(caller.unwrap_or(NodeId(0))),
            AllocPolicy::Interleave => {
                let count = self.nodes.len();
                let start = self.interleave_cursor.fetch_add(1, Ordering::Relaxed) % count;
                (0..count).map(|i| NodeId(((start + i) % count) as u32)).collect()
            },
            AllocPolicy::Auto => self.auto_order(&topology, caller),
        }
    }

    /// Unpressured nodes by (distance, utilisation, id), then pressured ones
    /// in the same order.
    fn auto_order(&self, topology: &Topology, caller: Option<NodeId>) -> Vec<NodeId> {
        let threshold = (self.config.read().pressure_threshold * 1000.0) as u32;
        let mut ranked: Vec<(bool, u8, u32, NodeId)> = self
            .nodes
            .iter()
            .map(|n| {
                let n = n.lock();
                let util = n.utilization_permille();
                let distance = caller.map(|c| topology.distance(c, n.id)).unwrap_or(0);
                (util > threshold, distance, util, n.id)
            })
            .collect();
        ranked.sort_unstable();
        ranked.into_iter().map(|(_, _, _, node)| node).collect()
    }

    /// Return a range to its node.
    ///
    /// Unfinished migrations out of any part of the range are cancelled.
    pub fn free(&self, range: PageRange) -> NumaResult<()> {
        let slot = self.nodes.get(range.node.index()).ok_or(NumaError::InvalidRange)?;
        let revoked = {
            let mut node = slot.lock();
            if range.pages == 0 || !node.owns(&range) || !node.free.free(range.start_pfn, range.pages) {
                return Err(NumaError::InvalidRange);
            }
            self.migration.lock().revoke(&range)
        };
        for req in &revoked {
            self.release_in_flight(req.target);
        }
        if !revoked.is_empty() {
            log::debug!("NUMA: freeing {} cancelled {} migrations", range, revoked.len());
        }
        self.access.lock().forget(range);
        self.frees.increment();
        Ok(())
    }

    /// Node whose bank holds the range, if it lies inside one
    pub fn node_of_range(&self, range: &PageRange) -> Option<NodeId> {
        let topology = self.topology.read();
        let node = topology.node_of_pfn(range.start_pfn)?;
        let info = topology.node(node)?;
        (range.end_pfn() <= info.base_pfn + info.page_count).then_some(node)
    }

    /// Current state of one node
    pub fn node_stats(&self, node: NodeId) -> NumaResult<NodeStats> {
        self.nodes
            .get(node.index())
            .map(|n| n.lock().stats())
            .ok_or(NumaError::UnknownNode(node))
    }

    /// Current state of every node
    pub fn all_node_stats(&self) -> Vec<NodeStats> {
        self.nodes.iter().map(|n| n.lock().stats()).collect()
    }

    /// Number of nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Allocation counters
    pub fn alloc_stats(&self) -> AllocStats {
        AllocStats {
            allocations: self.allocations.get(),
            fallbacks: self.fallbacks.get(),
            failures: self.failures.get(),
            frees: self.frees.get(),
        }
    }

    // ------------------------------------------------------------------------
    // Access tracking
    // ------------------------------------------------------------------------

    /// Note that `owner`, running on `from`, touched `range`
    pub fn record_access(&self, range: PageRange, owner: UnitId, from: NodeId, now_ns: u64) {
        if let Some(slot) = self.nodes.get(range.node.index()) {
            let mut node = slot.lock();
            if from == range.node {
                node.local_accesses += 1;
            } else {
                node.remote_accesses += 1;
            }
        }
        self.access.lock().record(range, owner, from, now_ns);
    }

    /// Node holding the memory `owner` touched most recently
    pub fn memory_node_of(&self, owner: UnitId) -> Option<NodeId> {
        self.access.lock().memory_node_of(owner)
    }

    // ------------------------------------------------------------------------
    // Migration
    // ------------------------------------------------------------------------

    /// Queue a move of `range` to `target`; never blocks.
    ///
    /// Asking again for the same move returns the handle already issued.
    /// A range overlapping another unfinished migration is refused.
    pub fn migrate(&self, range: PageRange, target: NodeId) -> NumaResult<MigrationHandle> {
        self.submit_migration(range, target, MigrationOrigin::Request)
    }

    fn submit_migration(
        &self,
        range: PageRange,
        target: NodeId,
        origin: MigrationOrigin,
    ) -> NumaResult<MigrationHandle> {
        let target_slot = self.nodes.get(target.index()).ok_or(NumaError::UnknownNode(target))?;
        let source = self.nodes.get(range.node.index()).ok_or(NumaError::InvalidRange)?;
        if range.pages == 0 {
            return Err(NumaError::InvalidRange);
        }

        // Counted up front so a fast completion never decrements first.
        let moves = range.node != target;
        if moves {
            target_slot.lock().migrations_in_flight += 1;
        }
        let submitted = {
            let node = source.lock();
            let mut engine = self.migration.lock();
            if !node.owns(&range) || !node.free.is_allocated(range.start_pfn, range.pages) {
                Err(NumaError::InvalidRange)
            } else if let Some(existing) = engine.pending_overlap(&range) {
                if existing.range == range && existing.target == target {
                    Ok((existing.handle, false))
                } else {
                    Err(NumaError::MigrationPending(existing.handle))
                }
            } else if !moves {
                Ok((engine.complete_immediately(range), false))
            } else {
                Ok((engine.submit(range, target, origin), true))
            }
        };
        if moves && !matches!(submitted, Ok((_, true))) {
            self.release_in_flight(target);
        }
        submitted.map(|(handle, _)| handle)
    }

    fn release_in_flight(&self, node: NodeId) {
        if let Some(slot) = self.nodes.get(node.index()) {
            let mut node = slot.lock();
            node.migrations_in_flight = node.migrations_in_flight.saturating_sub(1);
        }
    }

    /// Status of a migration
    pub fn migration_status(&self, handle: MigrationHandle) -> NumaResult<MigrationStatus> {
        self.migration
            .lock()
            .status(handle)
            .ok_or(NumaError::UnknownMigration(handle))
    }

    /// Cancel a queued migration; false if it already ran or was cancelled
    pub fn cancel_migration(&self, handle: MigrationHandle) -> NumaResult<bool> {
        let (cancelled, known) = {
            let mut engine = self.migration.lock();
            let cancelled = engine.cancel(handle);
            (cancelled, engine.status(handle).is_some())
        };
        match cancelled {
            Some(req) => {
                self.release_in_flight(req.target);
                Ok(true)
            },
            None if known => Ok(false),
            None => Err(NumaError::UnknownMigration(handle)),
        }
    }

    /// Register a completion callback
    pub fn on_migration_complete(&self, callback: MigrationCallback) {
        self.migration.lock().on_complete(callback);
    }

    /// Migrations completed in the one-second window ending at `now_ns`
    pub fn migrations_in_window(&self, now_ns: u64) -> u32 {
        self.migration.lock().in_window(now_ns)
    }

    /// Migrations still queued
    pub fn migrations_queued(&self) -> usize {
        self.migration.lock().queued()
    }

    /// Handles whose status can still be queried
    pub fn migrations_tracked(&self) -> usize {
        self.migration.lock().tracked()
    }

    /// Migration counters
    pub fn migration_stats(&self) -> MigrationStats {
        self.migration.lock().stats()
    }

    /// Run queued migrations within the rate budget; returns completions
    pub fn process_migrations(&self, now_ns: u64) -> usize {
        let limit = self.config.read().migration_rate_limit;
        let batch = self.migration.lock().take_batch(now_ns, limit);
        let mut done = Vec::new();

        for req in batch {
            let placed = self.nodes[req.target.index()].lock().allocate(req.range.pages, 1);
            let Some(new_range) = placed else {
                if !self.migration.lock().defer(req) {
                    self.release_in_flight(req.target);
                }
                continue;
            };

            // The claim is checked under the source lock, which `free` also
            // holds while revoking.
            let finished = {
                let mut source = self.nodes[req.range.node.index()].lock();
                let mut engine = self.migration.lock();
                if !engine.is_live(&req) {
                    None
                } else if !source.free.free(req.range.start_pfn, req.range.pages) {
                    log::warn!("NUMA: migration source {} was not allocated", req.range);
                    engine.abandon(&req);
                    None
                } else {
                    Some(engine.finish(&req, new_range, now_ns))
                }
            };
            self.release_in_flight(req.target);

            let Some(status) = finished else {
                self.nodes[req.target.index()]
                    .lock()
                    .free
                    .free(new_range.start_pfn, new_range.pages);
                log::debug!("NUMA: migration {} dropped, source {} is gone", req.handle.0, req.range);
                continue;
            };
            self.access.lock().relocate(req.range, new_range);
            done.push((req.handle, status));
        }

        if !done.is_empty() {
            let callbacks = self.migration.lock().callbacks();
            for (handle, status) in &done {
                for cb in &callbacks {
                    cb(*handle, status);
                }
            }
        }
        done.len()
    }

    // ------------------------------------------------------------------------
    // Balancing
    // ------------------------------------------------------------------------

    /// Balancer counters
    pub fn balance_stats(&self) -> BalanceStats {
        self.balance.lock().stats
    }

    /// Run one balancing pass now; returns moves scheduled
    pub fn balance_now(&self, now_ns: u64) -> NumaResult<usize> {
        let config = self.config();
        if !config.balancing_enabled {
            return Err(NumaError::BalancingDisabled);
        }

        let (budget, pending) = {
            let mut engine = self.migration.lock();
            let remaining = engine.remaining(now_ns, config.migration_rate_limit) as usize;
            let pending: BTreeSet<u64> = engine.pending_starts().collect();
            (remaining.saturating_sub(engine.queued()), pending)
        };

        let ratios: Vec<f32> = self.nodes.iter().map(|n| n.lock().stats().remote_ratio()).collect();
        let moves = {
            let mut tracker = self.access.lock();
            let mut balance = self.balance.lock();
            let moves = balancer::plan(
                &tracker,
                (0..self.nodes.len()).map(|i| NodeId(i as u32)),
                |node| ratios[node.index()],
                config.remote_ratio_threshold,
                budget,
                |pfn| pending.contains(&pfn),
                &mut balance.stats,
            );
            balance.last_ns = Some(now_ns);
            tracker.decay();
            moves
        };

        for slot in &self.nodes {
            let mut node = slot.lock();
            node.local_accesses /= 2;
            node.remote_accesses /= 2;
        }

        let mut scheduled = 0;
        for mv in moves {
            if self.submit_migration(mv.range, mv.target, MigrationOrigin::Balancer).is_ok() {
                scheduled += 1;
            }
        }
        Ok(scheduled)
    }

    /// Periodic work: migrations every call, balancing on its cadence
    pub fn tick(&self, now_ns: u64) {
        self.process_migrations(now_ns);
        let config = self.config();
        if !config.balancing_enabled {
            return;
        }
        let due = match self.balance.lock().last_ns {
            Some(last) => now_ns.saturating_sub(last) >= config.balance_interval_ns,
            None => true,
        };
        if due {
            // Disabled concurrently: nothing to do until re-enabled.
            let _ = self.balance_now(now_ns);
        }
    }
}

impl core::fmt::Debug for NumaManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NumaManager")
            .field("nodes", &self.nodes.len())
            .field("config", &*self.config.read())
            .field("alloc", &self.alloc_stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::RETAINED_STATUSES;
    use core::sync::atomic::AtomicU64;
    use helix_topology::StaticProbe;
    use proptest::prelude::*;

    const PAGES_PER_NODE: u64 = 4096;

    fn four_nodes() -> Arc<Topology> {
        let probe = StaticProbe::uniform(4, 2, 2, PAGES_PER_NODE, 4).distances(&[
            [0u8, 2, 4, 4],
            [2, 0, 4, 4],
            [4, 4, 0, 2],
            [4, 4, 2, 0],
        ]);
        Arc::new(Topology::discover(&probe).unwrap())
    }

    fn manager(config: NumaConfig) -> NumaManager {
        NumaManager::new(four_nodes(), config).unwrap()
    }

    #[test]
    fn test_bind_absent_node_is_invalid_policy() {
        let m = manager(NumaConfig::new());
        assert_eq!(
            m.allocate(4096, AllocPolicy::Bind(NodeId(9))),
            Err(NumaError::InvalidPolicy(NodeId(9)))
        );
        assert_eq!(
            m.allocate(4096, AllocPolicy::Preferred(NodeId(4))),
            Err(NumaError::InvalidPolicy(NodeId(4)))
        );
    }

    #[test]
    fn test_bind_fails_immediately_when_full() {
        let m = manager(NumaConfig::new());
        let big = m.allocate_frames(PAGES_PER_NODE, 1, AllocPolicy::Bind(NodeId(2)), None).unwrap();
        assert_eq!(big.node, NodeId(2));
        assert_eq!(
            m.allocate(1, AllocPolicy::Bind(NodeId(2))),
            Err(NumaError::OutOfMemory { pages: 1 })
        );
        assert_eq!(m.alloc_stats().failures, 1);
    }

    #[test]
    fn test_preferred_falls_back_to_nearest() {
        let m = manager(NumaConfig::new());
        m.allocate_frames(PAGES_PER_NODE, 1, AllocPolicy::Bind(NodeId(2)), None).unwrap();
        let r = m.allocate(4096, AllocPolicy::Preferred(NodeId(2))).unwrap();
        assert_eq!(r.node, NodeId(3));
        assert_eq!(m.alloc_stats().fallbacks, 1);
    }

    #[test]
    fn test_local_uses_caller_core() {
        struct OnCore(u32);
        impl CoreLocator for OnCore {
            fn current_core(&self) -> Option<CoreId> {
                Some(CoreId(self.0))
            }
        }
        let m = manager(NumaConfig::new());
        m.set_locator(Arc::new(OnCore(5)));
        assert_eq!(m.allocate(1, AllocPolicy::Local).unwrap().node, NodeId(2));
        assert_eq!(m.allocate_on(CoreId(1), 1, AllocPolicy::Local).unwrap().node, NodeId(0));
    }

    #[test]
    fn test_interleave_rotates() {
        let m = manager(NumaConfig::new());
        let nodes: Vec<u32> = (0..8)
            .map(|_| m.allocate(4096, AllocPolicy::Interleave).unwrap().node.0)
            .collect();
        assert_eq!(nodes, [0, 1, 2, 3, 0, 1, 2, 3]);
    }

    #[test]
    fn test_auto_prefers_close_unpressured_node() {
        let m = manager(NumaConfig::new());
        // Node 0 at 95 % utilisation.
        m.allocate_frames(PAGES_PER_NODE * 95 / 100, 1, AllocPolicy::Bind(NodeId(0)), None)
            .unwrap();
        let mut per_node = [0u32; 4];
        for _ in 0..1000 {
            let r = m.allocate_on(CoreId(0), 4096, AllocPolicy::Auto).unwrap();
            per_node[r.node.index()] += 1;
        }
        assert!(per_node[1] > 500, "placement {:?}", per_node);
        assert_eq!(per_node[0], 0);
    }

    #[test]
    fn test_auto_all_pressured_uses_distance_then_utilisation() {
        let m = manager(NumaConfig::new());
        for node in 0..4 {
            m.allocate_frames(PAGES_PER_NODE * 95 / 100, 1, AllocPolicy::Bind(NodeId(node)), None)
                .unwrap();
        }
        let r = m.allocate_on(CoreId(6), 4096, AllocPolicy::Auto).unwrap();
        assert_eq!(r.node, NodeId(3));
    }

    #[test]
    fn test_free_returns_pages_and_rejects_double_free() {
        let m = manager(NumaConfig::new());
        let r = m.allocate(10 * 4096, AllocPolicy::Bind(NodeId(1))).unwrap();
        assert_eq!(m.node_stats(NodeId(1)).unwrap().used_pages, 10);
        assert_eq!(m.node_of_range(&r), Some(NodeId(1)));
        m.free(r).unwrap();
        assert_eq!(m.free(r), Err(NumaError::InvalidRange));
        assert_eq!(m.node_stats(NodeId(1)).unwrap().free_pages, PAGES_PER_NODE);
    }

    #[test]
    fn test_unit_policy_and_default() {
        let m = manager(NumaConfig::new());
        m.set_unit_policy(UnitId(7), AllocPolicy::Bind(NodeId(3))).unwrap();
        assert_eq!(m.allocate_for(UnitId(7), 1).unwrap().node, NodeId(3));
        assert!(m.set_unit_policy(UnitId(7), AllocPolicy::Bind(NodeId(12))).is_err());
        m.clear_unit_policy(UnitId(7));
        assert_eq!(m.unit_policy(UnitId(7)), AllocPolicy::Auto);
    }

    #[test]
    fn test_migration_completes_and_notifies() {
        let m = manager(NumaConfig::new());
        let r = m.allocate(8 * 4096, AllocPolicy::Bind(NodeId(0))).unwrap();
        m.record_access(r, UnitId(1), NodeId(2), 10);

        let seen = Arc::new(AtomicU64::new(0));
        let seen2 = seen.clone();
        m.on_migration_complete(Arc::new(move |_, status| {
            if matches!(status, MigrationStatus::Completed(_)) {
                seen2.fetch_add(1, Ordering::Relaxed);
            }
        }));

        let h = m.migrate(r, NodeId(2)).unwrap();
        assert_eq!(m.migration_status(h).unwrap(), MigrationStatus::Queued);
        assert_eq!(m.node_stats(NodeId(2)).unwrap().migrations_in_flight, 1);
        assert_eq!(m.process_migrations(100), 1);

        let MigrationStatus::Completed(new) = m.migration_status(h).unwrap() else {
            panic!("migration did not complete");
        };
        assert_eq!(new.node, NodeId(2));
        assert_eq!(new.pages, 8);
        assert_eq!(m.node_stats(NodeId(0)).unwrap().used_pages, 0);
        assert_eq!(m.node_stats(NodeId(2)).unwrap().migrations_in_flight, 0);
        assert_eq!(m.memory_node_of(UnitId(1)), Some(NodeId(2)));
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_migration_to_full_node_is_retried() {
        let m = manager(NumaConfig::new());
        let filler = m.allocate_frames(PAGES_PER_NODE, 1, AllocPolicy::Bind(NodeId(3)), None).unwrap();
        let r = m.allocate(4096, AllocPolicy::Bind(NodeId(0))).unwrap();
        let h = m.migrate(r, NodeId(3)).unwrap();

        assert_eq!(m.process_migrations(0), 0);
        assert_eq!(m.migration_status(h).unwrap(), MigrationStatus::Queued);
        assert_eq!(m.migration_stats().retried, 1);

        m.free(filler).unwrap();
        assert_eq!(m.process_migrations(1), 1);
        assert!(matches!(m.migration_status(h).unwrap(), MigrationStatus::Completed(_)));
    }

    #[test]
    fn test_cancel_migration() {
        let m = manager(NumaConfig::new());
        let r = m.allocate(4096, AllocPolicy::Bind(NodeId(0))).unwrap();
        let h = m.migrate(r, NodeId(1)).unwrap();
        assert_eq!(m.cancel_migration(h), Ok(true));
        assert_eq!(m.cancel_migration(h), Ok(false));
        assert_eq!(m.migration_status(h).unwrap(), MigrationStatus::Cancelled);
        assert_eq!(m.process_migrations(0), 0);
        assert!(m.cancel_migration(MigrationHandle(999)).is_err());
        assert_eq!(m.migrate(r, NodeId(8)), Err(NumaError::UnknownNode(NodeId(8))));
    }

    #[test]
    fn test_free_cancels_pending_migration() {
        let m = manager(NumaConfig::new());
        let r = m.allocate(4096, AllocPolicy::Bind(NodeId(0))).unwrap();
        let h = m.migrate(r, NodeId(1)).unwrap();
        m.free(r).unwrap();
        assert_eq!(m.migration_status(h).unwrap(), MigrationStatus::Cancelled);
        assert_eq!(m.node_stats(NodeId(1)).unwrap().migrations_in_flight, 0);

        // The frames go to a new owner; the old request must not touch them
        let r2 = m.allocate(4096, AllocPolicy::Bind(NodeId(0))).unwrap();
        assert_eq!(r2, r);
        assert_eq!(m.process_migrations(10), 0);
        let r3 = m.allocate(4096, AllocPolicy::Bind(NodeId(0))).unwrap();
        assert_ne!(r3.start_pfn, r2.start_pfn);
        assert_eq!(m.node_stats(NodeId(0)).unwrap().used_pages, 2);
        assert_eq!(m.node_stats(NodeId(1)).unwrap().used_pages, 0);
        assert_eq!(m.migration_stats().cancelled, 1);
    }

    #[test]
    fn test_repeated_migrate_reuses_handle() {
        let m = manager(NumaConfig::new());
        let r = m.allocate(4096, AllocPolicy::Bind(NodeId(0))).unwrap();
        let a = m.migrate(r, NodeId(1)).unwrap();
        assert_eq!(m.migrate(r, NodeId(1)), Ok(a));
        assert_eq!(m.migrate(r, NodeId(2)), Err(NumaError::MigrationPending(a)));
        assert_eq!(m.node_stats(NodeId(1)).unwrap().migrations_in_flight, 1);
        assert_eq!(m.node_stats(NodeId(2)).unwrap().migrations_in_flight, 0);

        assert_eq!(m.process_migrations(10), 1);
        assert_eq!(m.node_stats(NodeId(1)).unwrap().used_pages, 1);
        assert_eq!(m.node_stats(NodeId(0)).unwrap().used_pages, 0);
        assert_eq!(m.migration_stats().requested, 1);
        // Source frames are free now
        assert_eq!(m.migrate(r, NodeId(2)), Err(NumaError::InvalidRange));
    }

    #[test]
    fn test_overlapping_migration_refused() {
        let m = manager(NumaConfig::new());
        let wide = m.allocate(8 * 4096, AllocPolicy::Bind(NodeId(0))).unwrap();
        let h = m.migrate(wide, NodeId(1)).unwrap();
        let part = PageRange {
            start_pfn: wide.start_pfn + 2,
            pages: 2,
            node: NodeId(0),
        };
        assert_eq!(m.migrate(part, NodeId(2)), Err(NumaError::MigrationPending(h)));

        // Freeing part of the range revokes the whole request
        m.free(part).unwrap();
        assert_eq!(m.migration_status(h).unwrap(), MigrationStatus::Cancelled);
        assert_eq!(m.process_migrations(10), 0);
        assert_eq!(m.node_stats(NodeId(0)).unwrap().used_pages, 6);
        assert_eq!(m.node_stats(NodeId(1)).unwrap().used_pages, 0);
    }

    #[test]
    fn test_migration_statuses_stay_bounded() {
        let m = manager(NumaConfig::new());
        let mut r = m.allocate(4096, AllocPolicy::Bind(NodeId(0))).unwrap();
        let first = m.migrate(r, NodeId(1)).unwrap();
        let mut h = first;
        let step = 10_000_000u64;
        for i in 0..(RETAINED_STATUSES as u64 * 3) {
            if i > 0 {
                let target = if r.node == NodeId(0) { NodeId(1) } else { NodeId(0) };
                h = m.migrate(r, target).unwrap();
            }
            m.tick(i * step);
            let MigrationStatus::Completed(next) = m.migration_status(h).unwrap() else {
                panic!("migration {} did not complete", i);
            };
            r = next;
            assert!(m.migrations_tracked() <= RETAINED_STATUSES);
        }
        assert!(m.balance_stats().passes > 100);
        assert_eq!(m.migration_status(first), Err(NumaError::UnknownMigration(first)));
        assert_eq!(m.node_stats(NodeId(0)).unwrap().used_pages + m.node_stats(NodeId(1)).unwrap().used_pages, 1);
    }

    #[test]
    fn test_rate_limit_holds_under_sustained_imbalance() {
        let config = NumaConfig {
            migration_rate_limit: 20,
            balance_interval_ns: 10_000_000,
            ..NumaConfig::new()
        };
        let m = manager(config);
        let ranges: Vec<PageRange> = (0..400)
            .map(|_| m.allocate(4096, AllocPolicy::Bind(NodeId(0))).unwrap())
            .collect();

        let step = 10_000_000u64;
        for tick in 0..500u64 {
            let now = tick * step;
            // Ranges still on node 0 keep being read from node 2.
            for r in ranges.iter().skip((tick as usize * 7) % 400).take(40) {
                let owner = UnitId(r.start_pfn);
                if m.memory_node_of(owner) != Some(NodeId(2)) {
                    m.record_access(*r, owner, NodeId(2), now);
                }
            }
            m.tick(now);
            assert!(m.migrations_in_window(now) <= 20);
        }
        assert!(m.migration_stats().completed > 0);
        assert!(m.balance_stats().moves_planned > 0);
    }

    #[test]
    fn test_balancing_disabled() {
        let m = manager(NumaConfig::new());
        m.set_balancing_enabled(false);
        assert_eq!(m.balance_now(0), Err(NumaError::BalancingDisabled));
        m.tick(0);
        assert_eq!(m.balance_stats().passes, 0);
    }

    #[test]
    fn test_apply_tuning_validates() {
        let m = manager(NumaConfig::new());
        m.apply_tuning(NumaTuning {
            migration_rate_limit: Some(5),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(m.config().migration_rate_limit, 5);
        assert!(m
            .apply_tuning(NumaTuning {
                migration_rate_limit: Some(0),
                ..Default::default()
            })
            .is_err());
        assert_eq!(m.config().migration_rate_limit, 5);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_bind_range_lies_in_node(requests in proptest::collection::vec((0u32..4, 1u64..600), 1..40)) {
            let m = manager(NumaConfig::new());
            let topo = m.topology();
            for (node, pages) in requests {
                match m.allocate(pages * 4096, AllocPolicy::Bind(NodeId(node))) {
                    Ok(r) => {
                        let info = topo.node(NodeId(node)).unwrap();
                        prop_assert_eq!(r.node, NodeId(node));
                        prop_assert!(r.start_pfn >= info.base_pfn);
                        prop_assert!(r.end_pfn() <= info.base_pfn + info.page_count);
                    },
                    Err(e) => prop_assert_eq!(e, NumaError::OutOfMemory { pages }),
                }
            }
        }
    }
}
