//! Asynchronous page migration.
//!
//! Requests queue immediately and complete on later [`NumaManager::tick`]
//! calls, bounded by a sliding one-second window. Requests whose target
//! node is full stay queued and are retried on the next cycle.
//!
//! At most one request covers any source frame. A request stays pending
//! from submission until it completes or is cancelled, including while a
//! batch is being processed, so freeing its source can revoke it.
//!
//! [`NumaManager::tick`]: crate::NumaManager::tick

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;

use helix_topology::NodeId;

use crate::config::NS_PER_SEC;
use crate::types::PageRange;

/// Identifies one migration request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MigrationHandle(pub u64);

/// Where a migration stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    /// Waiting for rate budget or target capacity
    Queued,
    /// Moved; holds the new range
    Completed(PageRange),
    /// Cancelled before it ran
    Cancelled,
}

/// Who asked for the migration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOrigin {
    /// Explicit `migrate` call
    Request,
    /// Automatic balancer
    Balancer,
}

/// Terminal statuses kept for [`MigrationEngine::status`] queries
pub const RETAINED_STATUSES: usize = 4096;

/// Completion callback
pub type MigrationCallback = Arc<dyn Fn(MigrationHandle, &MigrationStatus) + Send + Sync>;

/// Queued migration
#[derive(Debug, Clone, Copy)]
pub struct MigrationRequest {
    /// Handle returned to the caller
    pub handle: MigrationHandle,
    /// Source range
    pub range: PageRange,
    /// Destination node
    pub target: NodeId,
    /// Origin
    pub origin: MigrationOrigin,
    /// Failed attempts so far
    pub retries: u32,
}

/// Source range claimed by an unfinished request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingMigration {
    /// Request holding the claim
    pub handle: MigrationHandle,
    /// Source range
    pub range: PageRange,
    /// Destination node
    pub target: NodeId,
}

/// Migration counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationStats {
    /// Requests accepted
    pub requested: u64,
    /// Migrations finished
    pub completed: u64,
    /// Migrations cancelled
    pub cancelled: u64,
    /// Attempts deferred because the target was full
    pub retried: u64,
    /// Cycles that ran out of rate budget with work queued
    pub throttled: u64,
    /// Pages moved
    pub pages_moved: u64,
}

/// Sliding one-second window of completion times
#[derive(Debug, Default)]
pub struct RateLimiter {
    completions: VecDeque<u64>,
}

impl RateLimiter {
    fn prune(&mut self, now_ns: u64) {
        while let Some(&t) = self.completions.front() {
            if now_ns.saturating_sub(t) >= NS_PER_SEC {
                self.completions.pop_front();
            } else {
                break;
            }
        }
    }

    /// Completions inside `(now - 1s, now]`
    pub fn in_window(&mut self, now_ns: u64) -> u32 {
        self.prune(now_ns);
        self.completions.len() as u32
    }

    /// Budget left in the current window
    pub fn remaining(&mut self, now_ns: u64, limit: u32) -> u32 {
        limit.saturating_sub(self.in_window(now_ns))
    }

    /// Record one completion
    pub fn record(&mut self, now_ns: u64) {
        self.completions.push_back(now_ns);
    }
}

/// Queue, statuses and rate window of the migration engine
#[derive(Default)]
pub struct MigrationEngine {
    next_handle: u64,
    queue: VecDeque<MigrationRequest>,
    /// Unfinished requests by source start frame; ranges never overlap
    pending: BTreeMap<u64, PendingMigration>,
    status: BTreeMap<MigrationHandle, MigrationStatus>,
    /// Terminal handles, oldest first
    retired: VecDeque<MigrationHandle>,
    callbacks: Vec<MigrationCallback>,
    limiter: RateLimiter,
    stats: MigrationStats,
}

impl MigrationEngine {
    /// Empty engine
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            ..Self::default()
        }
    }

    fn retire(&mut self, handle: MigrationHandle, status: MigrationStatus) {
        self.status.insert(handle, status);
        self.retired.push_back(handle);
        while self.retired.len() > RETAINED_STATUSES {
            if let Some(old) = self.retired.pop_front() {
                self.status.remove(&old);
            }
        }
    }

    /// Pending request whose source overlaps `range`
    pub fn pending_overlap(&self, range: &PageRange) -> Option<PendingMigration> {
        let (_, p) = self.pending.range(..range.end_pfn()).next_back()?;
        (p.range.end_pfn() > range.start_pfn).then_some(*p)
    }

    /// Enqueue a request; the caller has checked [`Self::pending_overlap`]
    pub fn submit(&mut self, range: PageRange, target: NodeId, origin: MigrationOrigin) -> MigrationHandle {
        let handle = MigrationHandle(self.next_handle);
        self.next_handle += 1;
        self.queue.push_back(MigrationRequest {
            handle,
            range,
            target,
            origin,
            retries: 0,
        });
        self.pending.insert(range.start_pfn, PendingMigration { handle, range, target });
        self.status.insert(handle, MigrationStatus::Queued);
        self.stats.requested += 1;
        handle
    }

    /// Record a request that needed no movement
    pub fn complete_immediately(&mut self, range: PageRange) -> MigrationHandle {
        let handle = MigrationHandle(self.next_handle);
        self.next_handle += 1;
        self.retire(handle, MigrationStatus::Completed(range));
        self.stats.requested += 1;
        self.stats.completed += 1;
        handle
    }

    /// Status of a handle; None once it has aged out of the retained set
    pub fn status(&self, handle: MigrationHandle) -> Option<MigrationStatus> {
        self.status.get(&handle).copied()
    }

    /// Handles with a known status
    pub fn tracked(&self) -> usize {
        self.status.len()
    }

    /// Whether `req` still holds its source claim
    pub fn is_live(&self, req: &MigrationRequest) -> bool {
        self.pending
            .get(&req.range.start_pfn)
            .is_some_and(|p| p.handle == req.handle)
    }

    /// Cancel a queued request; returns the dropped request
    pub fn cancel(&mut self, handle: MigrationHandle) -> Option<MigrationRequest> {
        let pos = self.queue.iter().position(|r| r.handle == handle)?;
        let req = self.queue.remove(pos)?;
        self.pending.remove(&req.range.start_pfn);
        self.retire(handle, MigrationStatus::Cancelled);
        self.stats.cancelled += 1;
        Some(req)
    }

    /// Cancel every request whose source overlaps `range`.
    ///
    /// Returns the requests that were still queued. Requests already taken
    /// into a batch lose their claim and are dropped by the processor.
    pub fn revoke(&mut self, range: &PageRange) -> Vec<MigrationRequest> {
        let hit: Vec<PendingMigration> = self
            .pending
            .range(..range.end_pfn())
            .rev()
            .take_while(|(_, p)| p.range.end_pfn() > range.start_pfn)
            .map(|(_, p)| *p)
            .collect();
        let mut queued = Vec::new();
        for p in hit {
            self.pending.remove(&p.range.start_pfn);
            if let Some(pos) = self.queue.iter().position(|r| r.handle == p.handle) {
                if let Some(req) = self.queue.remove(pos) {
                    queued.push(req);
                }
            }
            self.retire(p.handle, MigrationStatus::Cancelled);
            self.stats.cancelled += 1;
        }
        queued
    }

    /// Drop a taken request whose source turned out to be gone
    pub fn abandon(&mut self, req: &MigrationRequest) {
        if self.is_live(req) {
            self.pending.remove(&req.range.start_pfn);
        }
        self.retire(req.handle, MigrationStatus::Cancelled);
        self.stats.cancelled += 1;
    }

    /// Register a completion callback
    pub fn on_complete(&mut self, callback: MigrationCallback) {
        self.callbacks.push(callback);
    }

    /// Snapshot of registered callbacks
    pub fn callbacks(&self) -> Vec<MigrationCallback> {
        self.callbacks.clone()
    }

    /// Start frames of unfinished requests
    pub fn pending_starts(&self) -> impl Iterator<Item = u64> + '_ {
        self.pending.keys().copied()
    }

    /// Queued requests
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Take up to `budget` requests for this cycle
    pub fn take_batch(&mut self, now_ns: u64, limit: u32) -> Vec<MigrationRequest> {
        let budget = self.limiter.remaining(now_ns, limit) as usize;
        if budget < self.queue.len() {
            self.stats.throttled += 1;
            log::debug!(
                "NUMA: migration budget {} for {} queued requests",
                budget,
                self.queue.len()
            );
        }
        let n = budget.min(self.queue.len());
        self.queue.drain(..n).collect()
    }

    /// A request finished
    pub fn finish(&mut self, req: &MigrationRequest, new_range: PageRange, now_ns: u64) -> MigrationStatus {
        let status = MigrationStatus::Completed(new_range);
        self.pending.remove(&req.range.start_pfn);
        self.retire(req.handle, status);
        self.limiter.record(now_ns);
        self.stats.completed += 1;
        self.stats.pages_moved += new_range.pages;
        status
    }

    /// A request could not run; keep it for the next cycle.
    ///
    /// Returns false if it was revoked meanwhile and has been dropped.
    pub fn defer(&mut self, mut req: MigrationRequest) -> bool {
        if !self.is_live(&req) {
            return false;
        }
        req.retries += 1;
        self.stats.retried += 1;
        log::debug!(
            "NUMA: migration {} to {} deferred (attempt {})",
            req.handle.0,
            req.target,
            req.retries
        );
        self.queue.push_back(req);
        true
    }

    /// Completions in the current one-second window
    pub fn in_window(&mut self, now_ns: u64) -> u32 {
        self.limiter.in_window(now_ns)
    }

    /// Rate budget left in the current window
    pub fn remaining(&mut self, now_ns: u64, limit: u32) -> u32 {
        self.limiter.remaining(now_ns, limit)
    }

    /// Counters
    pub fn stats(&self) -> MigrationStats {
        self.stats
    }
}

impl core::fmt::Debug for MigrationEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MigrationEngine")
            .field("queued", &self.queue.len())
            .field("pending", &self.pending.len())
            .field("callbacks", &self.callbacks.len())
            .field("stats", &self.stats)
            .finish()
    }
}
