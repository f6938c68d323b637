//! Per-core run-queues.
//!
//! Remote cores enqueue into a lock-free [`BoundedQueue`] inbox. The owning
//! core drains the inbox under its local lock into an EDF heap for
//! real-time units and FIFO lists for the other classes. Lock order across
//! the scheduler is: run-queue locks in ascending core id, then the unit
//! table.

use alloc::collections::{BinaryHeap, VecDeque};
use alloc::vec::Vec;
use core::cmp::Ordering as CmpOrdering;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use bitflags::bitflags;
use helix_coherency::{BoundedQueue, CachePadded, CACHE_LINE_SIZE};
use helix_topology::{CoreId, CpuMask, UnitId};
use spin::{Mutex, MutexGuard};
use static_assertions::const_assert_eq;

use crate::unit::PriorityClass;

// Load is read by every placing core; keep it off the lock's line.
const_assert_eq!(core::mem::size_of::<CachePadded<AtomicUsize>>(), CACHE_LINE_SIZE);

bitflags! {
    /// Per-core scheduler flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CoreFlags: u8 {
        /// A waiting unit should preempt the running one
        const NEED_RESCHED = 1 << 0;
        /// Core is being taken offline; no new placements
        const DRAINING     = 1 << 1;
    }
}

/// A unit's place in a run-queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    /// Unit
    pub unit: UnitId,
    /// Class at enqueue time
    pub class: PriorityClass,
    /// Absolute deadline; `u64::MAX` for non-real-time units
    pub deadline_ns: u64,
    /// Expected runtime
    pub runtime_ns: u64,
    /// Allowed cores
    pub affinity: CpuMask,
    /// Enqueue order, breaks deadline ties
    pub seq: u64,
}

/// Heap wrapper: earliest deadline first, then oldest
#[derive(Debug, Clone, Copy)]
struct RtEntry(QueueEntry);

impl Ord for RtEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .0
            .deadline_ns
            .cmp(&self.0.deadline_ns)
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

impl PartialOrd for RtEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for RtEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for RtEntry {}

/// Unit currently on the core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunningUnit {
    /// Its queue entry
    pub entry: QueueEntry,
    /// When it started (ns)
    pub started_ns: u64,
}

#[derive(Debug, Default)]
struct LocalQueues {
    rt: BinaryHeap<RtEntry>,
    interactive: VecDeque<QueueEntry>,
    batch: VecDeque<QueueEntry>,
    running: Option<RunningUnit>,
}

impl LocalQueues {
    fn insert(&mut self, entry: QueueEntry) {
        match entry.class {
            PriorityClass::RealTime => self.rt.push(RtEntry(entry)),
            PriorityClass::Interactive => self.interactive.push_back(entry),
            PriorityClass::Batch => self.batch.push_back(entry),
        }
    }

    fn queued(&self) -> usize {
        self.rt.len() + self.interactive.len() + self.batch.len()
    }
}

// ============================================================================
// RUN QUEUE
// ============================================================================

/// Run-queue of one core
pub struct RunQueue {
    core: CoreId,
    inbox: BoundedQueue<QueueEntry>,
    local: Mutex<LocalQueues>,
    load: CachePadded<AtomicUsize>,
    flags: AtomicU8,
}

impl RunQueue {
    /// Empty queue for `core`
    pub fn new(core: CoreId, inbox_capacity: usize) -> Self {
        Self {
            core,
            inbox: BoundedQueue::new(inbox_capacity),
            local: Mutex::new(LocalQueues::default()),
            load: CachePadded::new(AtomicUsize::new(0)),
            flags: AtomicU8::new(0),
        }
    }

    /// Owning core
    #[inline(always)]
    pub fn core(&self) -> CoreId {
        self.core
    }

    /// Units queued or running; a hint, not a snapshot
    #[inline]
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Acquire)
    }

    /// Enqueue from any core without taking the local lock, unless the
    /// inbox is full
    pub fn submit(&self, entry: QueueEntry) {
        match self.inbox.push(entry) {
            Ok(()) => {
                self.load.fetch_add(1, Ordering::AcqRel);
            },
            Err(entry) => self.lock().push(entry),
        }
    }

    /// Take the local lock and fold the inbox in
    pub fn lock(&self) -> LockedQueue<'_> {
        let mut local = self.local.lock();
        while let Some(entry) = self.inbox.pop() {
            local.insert(entry);
        }
        LockedQueue { rq: self, local }
    }

    /// Current flags
    pub fn flags(&self) -> CoreFlags {
        CoreFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Raise flags
    pub fn set_flags(&self, flags: CoreFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Consume a pending reschedule request
    pub fn take_resched(&self) -> bool {
        let prev = self.flags.fetch_and(!CoreFlags::NEED_RESCHED.bits(), Ordering::AcqRel);
        CoreFlags::from_bits_truncate(prev).contains(CoreFlags::NEED_RESCHED)
    }
}

impl core::fmt::Debug for RunQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RunQueue")
            .field("core", &self.core)
            .field("load", &self.load())
            .field("flags", &self.flags())
            .finish()
    }
}

// ============================================================================
// LOCKED VIEW
// ============================================================================

/// Run-queue with its local lock held
pub struct LockedQueue<'a> {
    rq: &'a RunQueue,
    local: MutexGuard<'a, LocalQueues>,
}

impl LockedQueue<'_> {
    /// Owning core
    pub fn core(&self) -> CoreId {
        self.rq.core
    }

    /// Insert an entry
    pub fn push(&mut self, entry: QueueEntry) {
        self.local.insert(entry);
    }

    /// Queued units, not counting the running one
    pub fn queued(&self) -> usize {
        self.local.queued()
    }

    /// Running unit
    pub fn running(&self) -> Option<RunningUnit> {
        self.local.running
    }

    /// Put a unit on the core
    pub fn set_running(&mut self, running: RunningUnit) {
        self.local.running = Some(running);
    }

    /// Take the running unit off the core
    pub fn take_running(&mut self) -> Option<RunningUnit> {
        self.local.running.take()
    }

    /// Next unit by class, then deadline or arrival
    pub fn peek_best(&self) -> Option<QueueEntry> {
        self.local
            .rt
            .peek()
            .map(|e| e.0)
            .or_else(|| self.local.interactive.front().copied())
            .or_else(|| self.local.batch.front().copied())
    }

    /// Remove and return the next unit
    pub fn pop_best(&mut self) -> Option<QueueEntry> {
        if let Some(e) = self.local.rt.pop() {
            return Some(e.0);
        }
        self.local
            .interactive
            .pop_front()
            .or_else(|| self.local.batch.pop_front())
    }

    /// Should the best waiting unit displace the running one?
    pub fn should_preempt(&self) -> bool {
        let (Some(running), Some(best)) = (self.local.running, self.peek_best()) else {
            return false;
        };
        match (running.entry.class, best.class) {
            (PriorityClass::RealTime, PriorityClass::RealTime) => {
                best.deadline_ns < running.entry.deadline_ns
            },
            (_, PriorityClass::RealTime) => true,
            _ => false,
        }
    }

    /// Remove a queued unit
    pub fn remove(&mut self, unit: UnitId) -> Option<QueueEntry> {
        if let Some(found) = self.local.rt.iter().find(|e| e.0.unit == unit).map(|e| e.0) {
            self.local.rt.retain(|e| e.0.unit != unit);
            return Some(found);
        }
        let local = &mut *self.local;
        for list in [&mut local.interactive, &mut local.batch] {
            if let Some(pos) = list.iter().position(|e| e.unit == unit) {
                return list.remove(pos);
            }
        }
        None
    }

    /// Replace the stored affinity of a queued unit
    pub fn retarget(&mut self, unit: UnitId, affinity: CpuMask) -> bool {
        let local = &mut *self.local;
        for list in [&mut local.interactive, &mut local.batch] {
            if let Some(e) = list.iter_mut().find(|e| e.unit == unit) {
                e.affinity = affinity;
                return true;
            }
        }
        if !local.rt.iter().any(|e| e.0.unit == unit) {
            return false;
        }
        let mut entries = core::mem::take(&mut local.rt).into_vec();
        for e in entries.iter_mut().filter(|e| e.0.unit == unit) {
            e.0.affinity = affinity;
        }
        local.rt = BinaryHeap::from(entries);
        true
    }

    /// Real-time work (ns) that runs before a unit due at `deadline_ns`:
    /// queued entries due no later, plus what is left of a running
    /// real-time unit due no later
    pub fn rt_work_before(&self, deadline_ns: u64, now_ns: u64) -> u64 {
        let queued: u64 = self
            .local
            .rt
            .iter()
            .filter(|e| e.0.deadline_ns <= deadline_ns)
            .map(|e| e.0.runtime_ns)
            .sum();
        let running = match self.local.running {
            Some(r) if r.entry.class == PriorityClass::RealTime && r.entry.deadline_ns <= deadline_ns => {
                r.entry
                    .runtime_ns
                    .saturating_sub(now_ns.saturating_sub(r.started_ns))
            },
            _ => 0,
        };
        queued + running
    }

    /// Up to `max` non-real-time units that may run on `dst`, newest first
    pub fn take_movable(&mut self, dst: CoreId, max: usize) -> Vec<QueueEntry> {
        let mut taken = Vec::new();
        let local = &mut *self.local;
        for list in [&mut local.batch, &mut local.interactive] {
            let mut i = list.len();
            while i > 0 && taken.len() < max {
                i -= 1;
                if list[i].affinity.contains(dst) {
                    if let Some(entry) = list.remove(i) {
                        taken.push(entry);
                    }
                }
            }
        }
        taken
    }

    /// Empty the queue, real-time units first
    pub fn drain_all(&mut self) -> Vec<QueueEntry> {
        let mut out: Vec<QueueEntry> = Vec::with_capacity(self.local.queued());
        while let Some(e) = self.local.rt.pop() {
            out.push(e.0);
        }
        out.extend(self.local.interactive.drain(..));
        out.extend(self.local.batch.drain(..));
        out
    }
}

impl Drop for LockedQueue<'_> {
    fn drop(&mut self) {
        let load = self.local.queued() + usize::from(self.local.running.is_some()) + self.rq.inbox.len();
        self.rq.load.store(load, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(unit: u64, class: PriorityClass, deadline_ns: u64) -> QueueEntry {
        QueueEntry {
            unit: UnitId(unit),
            class,
            deadline_ns,
            runtime_ns: 10,
            affinity: CpuMask::first_n(4),
            seq: unit,
        }
    }

    #[test]
    fn test_class_then_deadline_order() {
        let rq = RunQueue::new(CoreId(0), 8);
        rq.submit(entry(1, PriorityClass::Batch, u64::MAX));
        rq.submit(entry(2, PriorityClass::RealTime, 500));
        rq.submit(entry(3, PriorityClass::Interactive, u64::MAX));
        rq.submit(entry(4, PriorityClass::RealTime, 100));
        assert_eq!(rq.load(), 4);

        let mut q = rq.lock();
        let order: Vec<u64> = core::iter::from_fn(|| q.pop_best()).map(|e| e.unit.0).collect();
        assert_eq!(order, [4, 2, 3, 1]);
        drop(q);
        assert_eq!(rq.load(), 0);
    }

    #[test]
    fn test_full_inbox_falls_back_to_lock() {
        let rq = RunQueue::new(CoreId(0), 2);
        for i in 0..5 {
            rq.submit(entry(i, PriorityClass::Batch, u64::MAX));
        }
        assert_eq!(rq.lock().queued(), 5);
        assert_eq!(rq.load(), 5);
    }

    #[test]
    fn test_realtime_preempts_batch_only_by_deadline() {
        let rq = RunQueue::new(CoreId(0), 8);
        let mut q = rq.lock();
        q.set_running(RunningUnit {
            entry: entry(1, PriorityClass::Batch, u64::MAX),
            started_ns: 0,
        });
        q.push(entry(2, PriorityClass::Interactive, u64::MAX));
        assert!(!q.should_preempt());
        q.push(entry(3, PriorityClass::RealTime, 300));
        assert!(q.should_preempt());

        q.take_running();
        q.set_running(RunningUnit {
            entry: entry(4, PriorityClass::RealTime, 200),
            started_ns: 0,
        });
        assert!(!q.should_preempt());
        q.push(entry(5, PriorityClass::RealTime, 100));
        assert!(q.should_preempt());
    }

    #[test]
    fn test_rt_work_before_counts_running_remainder() {
        let rq = RunQueue::new(CoreId(0), 8);
        let mut q = rq.lock();
        q.set_running(RunningUnit {
            entry: entry(1, PriorityClass::RealTime, 50),
            started_ns: 0,
        });
        q.push(entry(2, PriorityClass::RealTime, 100));
        q.push(entry(3, PriorityClass::RealTime, 900));
        // 10 - 4 left of the running unit, plus unit 2
        assert_eq!(q.rt_work_before(100, 4), 16);
        assert_eq!(q.rt_work_before(40, 4), 0);
    }

    #[test]
    fn test_take_movable_respects_affinity() {
        let rq = RunQueue::new(CoreId(0), 8);
        let mut q = rq.lock();
        let mut pinned = entry(1, PriorityClass::Batch, u64::MAX);
        pinned.affinity = CpuMask::single(CoreId(0));
        q.push(pinned);
        q.push(entry(2, PriorityClass::Batch, u64::MAX));
        q.push(entry(3, PriorityClass::RealTime, 10));
        let moved = q.take_movable(CoreId(1), 8);
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].unit, UnitId(2));
        assert_eq!(q.queued(), 2);
    }

    #[test]
    fn test_remove_from_any_class() {
        let rq = RunQueue::new(CoreId(0), 8);
        let mut q = rq.lock();
        q.push(entry(1, PriorityClass::RealTime, 10));
        q.push(entry(2, PriorityClass::Batch, u64::MAX));
        assert!(q.remove(UnitId(1)).is_some());
        assert!(q.remove(UnitId(2)).is_some());
        assert!(q.remove(UnitId(2)).is_none());
        assert_eq!(q.queued(), 0);
    }

    #[test]
    fn test_resched_flag_consumed_once() {
        let rq = RunQueue::new(CoreId(0), 8);
        rq.set_flags(CoreFlags::NEED_RESCHED | CoreFlags::DRAINING);
        assert!(rq.take_resched());
        assert!(!rq.take_resched());
        assert!(rq.flags().contains(CoreFlags::DRAINING));
    }
}
