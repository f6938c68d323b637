//! Access tracking for balancing and placement.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use hashbrown::HashMap;
use helix_topology::{NodeId, UnitId};

use crate::types::PageRange;

/// Access history of one allocated range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeAccess {
    /// The range as currently placed
    pub range: PageRange,
    /// Unit that last touched it
    pub owner: UnitId,
    /// Last access of any kind (ns)
    pub last_access_ns: u64,
    /// Last access from another node (ns)
    pub last_remote_ns: Option<u64>,
    /// Local accesses since the last balance pass
    pub local: u64,
    /// Remote accesses per requesting node since the last balance pass
    pub remote: BTreeMap<NodeId, u64>,
}

impl RangeAccess {
    /// Total remote accesses
    pub fn remote_total(&self) -> u64 {
        self.remote.values().sum()
    }

    /// Node issuing the most remote accesses; ties go to the lower id
    pub fn dominant_remote(&self) -> Option<NodeId> {
        self.remote
            .iter()
            .filter(|(_, n)| **n > 0)
            .max_by(|(na, a), (nb, b)| a.cmp(b).then(nb.cmp(na)))
            .map(|(&node, _)| node)
    }
}

/// Per-range and per-owner access index
#[derive(Debug, Default)]
pub struct AccessTracker {
    /// Keyed by start frame
    ranges: BTreeMap<u64, RangeAccess>,
    /// Owner -> (start frame, time) of its most recent access
    owners: HashMap<UnitId, (u64, u64)>,
}

impl AccessTracker {
    /// Empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one access to `range` by `owner` running on `from`
    pub fn record(&mut self, range: PageRange, owner: UnitId, from: NodeId, now_ns: u64) {
        let entry = self.ranges.entry(range.start_pfn).or_insert_with(|| RangeAccess {
            range,
            owner,
            last_access_ns: now_ns,
            last_remote_ns: None,
            local: 0,
            remote: BTreeMap::new(),
        });
        entry.owner = owner;
        entry.last_access_ns = now_ns;
        if from == entry.range.node {
            entry.local += 1;
        } else {
            entry.last_remote_ns = Some(now_ns);
            *entry.remote.entry(from).or_insert(0) += 1;
        }

        let latest = self.owners.entry(owner).or_insert((range.start_pfn, now_ns));
        if now_ns >= latest.1 {
            *latest = (range.start_pfn, now_ns);
        }
    }

    /// Node of the range the owner touched most recently
    pub fn memory_node_of(&self, owner: UnitId) -> Option<NodeId> {
        let (pfn, _) = self.owners.get(&owner)?;
        self.ranges.get(pfn).map(|r| r.range.node)
    }

    /// History of a range
    pub fn get(&self, start_pfn: u64) -> Option<&RangeAccess> {
        self.ranges.get(&start_pfn)
    }

    /// Ranges currently placed on `node` that saw remote accesses
    pub fn remote_candidates(&self, node: NodeId) -> Vec<&RangeAccess> {
        self.ranges
            .values()
            .filter(|r| r.range.node == node && r.remote_total() > 0)
            .collect()
    }

    /// A range moved; keep its history under the new placement
    pub fn relocate(&mut self, old: PageRange, new: PageRange) {
        if let Some(mut entry) = self.ranges.remove(&old.start_pfn) {
            entry.range = new;
            entry.remote.remove(&new.node);
            self.ranges.insert(new.start_pfn, entry);
        }
        for latest in self.owners.values_mut() {
            if latest.0 == old.start_pfn {
                latest.0 = new.start_pfn;
            }
        }
    }

    /// A range was freed
    pub fn forget(&mut self, range: PageRange) {
        self.ranges.remove(&range.start_pfn);
        self.owners.retain(|_, latest| latest.0 != range.start_pfn);
    }

    /// Halve all counters; called after each balance pass
    pub fn decay(&mut self) {
        for r in self.ranges.values_mut() {
            r.local /= 2;
            r.remote.retain(|_, n| {
                *n /= 2;
                *n > 0
            });
        }
    }
}
