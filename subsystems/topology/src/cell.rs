//! Shared, swappable topology.
//!
//! Readers take an `Arc` snapshot and release the lock immediately; a
//! hot-plug builds the next snapshot off to the side and swaps the pointer.

use alloc::sync::Arc;

use spin::RwLock;

use crate::error::TopologyResult;
use crate::snapshot::{Topology, TopologyNode};
use crate::types::CoreId;

/// Hot-plug notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugEvent {
    /// A core came online
    CoreAdded(TopologyNode),
    /// A core went offline
    CoreRemoved(CoreId),
}

/// Current topology, replaced atomically on hot-plug
pub struct TopologyCell {
    current: RwLock<Arc<Topology>>,
}

impl TopologyCell {
    /// Wrap an initial snapshot
    pub fn new(topology: Topology) -> Self {
        Self {
            current: RwLock::new(Arc::new(topology)),
        }
    }

    /// Current snapshot
    #[inline]
    pub fn load(&self) -> Arc<Topology> {
        self.current.read().clone()
    }

    /// Apply a hot-plug event; returns the snapshot that was replaced
    pub fn on_hotplug(&self, event: HotplugEvent) -> TopologyResult<Arc<Topology>> {
        let mut guard = self.current.write();
        let next = match event {
            HotplugEvent::CoreAdded(node) => guard.with_core_added(node)?,
            HotplugEvent::CoreRemoved(core) => guard.without_core(core)?,
        };
        log::info!(
            "Topology: {:?} -> generation {} ({} cores)",
            event,
            next.generation(),
            next.core_count()
        );
        Ok(core::mem::replace(&mut *guard, Arc::new(next)))
    }

    /// Install a snapshot built elsewhere from the current one; returns the
    /// snapshot that was replaced
    ///
    /// A snapshot older than the current one is refused.
    pub fn publish(&self, next: Arc<Topology>) -> Option<Arc<Topology>> {
        let mut guard = self.current.write();
        if next.generation() <= guard.generation() {
            return None;
        }
        log::info!("Topology: generation {} published ({} cores)", next.generation(), next.core_count());
        Some(core::mem::replace(&mut *guard, next))
    }
}

impl core::fmt::Debug for TopologyCell {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let topo = self.load();
        f.debug_struct("TopologyCell")
            .field("generation", &topo.generation())
            .field("cores", &topo.core_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::StaticProbe;
    use crate::types::{CacheDomainId, NodeId};

    #[test]
    fn test_hotplug_swaps_snapshot() {
        let cell = TopologyCell::new(Topology::discover(&StaticProbe::uniform(2, 2, 2, 64, 10)).unwrap());
        let before = cell.load();

        let prev = cell.on_hotplug(HotplugEvent::CoreRemoved(CoreId(1))).unwrap();
        assert_eq!(prev.generation(), before.generation());
        assert_eq!(cell.load().core_count(), 3);
        assert_eq!(before.core_count(), 4);

        cell.on_hotplug(HotplugEvent::CoreAdded(TopologyNode::new(
            CoreId(9),
            NodeId(1),
            CacheDomainId(4),
            2400,
        )))
        .unwrap();
        let now = cell.load();
        assert_eq!(now.generation(), 2);
        assert_eq!(now.node_of(CoreId(9)), Some(NodeId(1)));
    }

    #[test]
    fn test_failed_hotplug_keeps_snapshot() {
        let cell = TopologyCell::new(Topology::discover(&StaticProbe::uniform(1, 2, 2, 64, 0)).unwrap());
        assert!(cell.on_hotplug(HotplugEvent::CoreRemoved(CoreId(42))).is_err());
        assert_eq!(cell.load().generation(), 0);
    }

    #[test]
    fn test_publish_requires_newer_generation() {
        let cell = TopologyCell::new(Topology::discover(&StaticProbe::uniform(1, 4, 4, 64, 0)).unwrap());
        let base = cell.load();
        let next = Arc::new(base.without_core(CoreId(3)).unwrap());
        assert!(cell.publish(base.clone()).is_none());
        let prev = cell.publish(next).unwrap();
        assert_eq!(prev.generation(), 0);
        assert_eq!(cell.load().core_count(), 3);
        assert!(cell.publish(base).is_none());
    }

    #[test]
    fn test_concurrent_readers_see_whole_snapshots() {
        use std::thread;

        let cell = Arc::new(TopologyCell::new(
            Topology::discover(&StaticProbe::uniform(2, 4, 2, 64, 10)).unwrap(),
        ));
        let reader = {
            let cell = cell.clone();
            thread::spawn(move || {
                for _ in 0..1000 {
                    let topo = cell.load();
                    let per_node: usize = topo.nodes().iter().map(|n| n.cores.count()).sum();
                    assert_eq!(per_node, topo.core_count());
                }
            })
        };
        for core in 0..4 {
            cell.on_hotplug(HotplugEvent::CoreRemoved(CoreId(core))).unwrap();
        }
        reader.join().unwrap();
        assert_eq!(cell.load().core_count(), 4);
    }
}
