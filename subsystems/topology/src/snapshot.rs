//! Immutable topology snapshots.

use alloc::vec::Vec;

use crate::distance::DistanceMatrix;
use crate::error::{HardwareError, TopologyResult};
use crate::mask::{CpuMask, MAX_CPUS};
use crate::probe::{HardwareDescription, TopologyProbe};
use crate::types::{CacheDomainId, CoreId, NodeId, PowerState};

// ============================================================================
// TOPOLOGY NODE
// ============================================================================

/// One core as seen by the topology
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyNode {
    /// Core id
    pub core: CoreId,
    /// NUMA node
    pub node: NodeId,
    /// Last-level cache domain
    pub cache_domain: CacheDomainId,
    /// Base clock (MHz)
    pub base_clock_mhz: u32,
    /// Frequency state at snapshot time
    pub frequency: PowerState,
}

impl TopologyNode {
    /// Core at full frequency
    pub fn new(core: CoreId, node: NodeId, cache_domain: CacheDomainId, base_clock_mhz: u32) -> Self {
        Self {
            core,
            node,
            cache_domain,
            base_clock_mhz,
            frequency: PowerState::Performance,
        }
    }
}

/// One NUMA node and its memory bank
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumaNodeInfo {
    /// Node id
    pub id: NodeId,
    /// First physical frame
    pub base_pfn: u64,
    /// Frames in the bank
    pub page_count: u64,
    /// Cores attached to this node
    pub cores: CpuMask,
}

impl NumaNodeInfo {
    /// Does the frame belong to this node's bank?
    #[inline]
    pub fn contains_pfn(&self, pfn: u64) -> bool {
        pfn >= self.base_pfn && pfn < self.base_pfn + self.page_count
    }
}

// ============================================================================
// TOPOLOGY
// ============================================================================

/// Machine topology snapshot.
///
/// Never mutated after construction. Hot-plug produces a new snapshot with
/// a higher generation; holders of an older one keep a consistent view.
#[derive(Debug, Clone)]
pub struct Topology {
    generation: u64,
    /// Sorted by core id
    cores: Vec<TopologyNode>,
    /// Indexed by node id
    nodes: Vec<NumaNodeInfo>,
    distances: DistanceMatrix,
    online: CpuMask,
}

impl Topology {
    /// Enumerate hardware through `probe` and validate the result
    pub fn discover(probe: &dyn TopologyProbe) -> TopologyResult<Self> {
        let desc = probe.enumerate()?;
        let topology = Self::from_description(&desc, 0)?;
        log::info!(
            "Topology: {} cores, {} nodes, {} cache domains",
            topology.core_count(),
            topology.node_count(),
            topology.cache_domains().len()
        );
        Ok(topology)
    }

    /// Build a snapshot from a raw description
    pub fn from_description(desc: &HardwareDescription, generation: u64) -> TopologyResult<Self> {
        if desc.nodes.is_empty() {
            return Err(HardwareError::NoNodes);
        }
        if desc.cores.is_empty() {
            return Err(HardwareError::NoCores);
        }

        let mut node_descs = desc.nodes.clone();
        node_descs.sort_by_key(|n| n.node);
        for (expected, n) in node_descs.iter().enumerate() {
            if n.node.index() != expected {
                return Err(if n.node.index() < expected {
                    HardwareError::DuplicateNode(n.node)
                } else {
                    HardwareError::NonContiguousNodes(n.node)
                });
            }
        }

        let distances = DistanceMatrix::from_rows(&desc.distances)?;
        if distances.dim() != node_descs.len() {
            return Err(HardwareError::DistanceShape {
                expected: node_descs.len(),
                row: node_descs.len(),
                len: distances.dim(),
            });
        }

        let mut nodes: Vec<NumaNodeInfo> = node_descs
            .iter()
            .map(|n| NumaNodeInfo {
                id: n.node,
                base_pfn: n.base_pfn,
                page_count: n.page_count,
                cores: CpuMask::empty(),
            })
            .collect();

        let mut cores = Vec::with_capacity(desc.cores.len());
        let mut online = CpuMask::empty();
        for c in &desc.cores {
            if c.core.index() >= MAX_CPUS {
                return Err(HardwareError::CoreOutOfRange(c.core));
            }
            if online.contains(c.core) {
                return Err(HardwareError::DuplicateCore(c.core));
            }
            let node = nodes.get_mut(c.node.index()).ok_or(HardwareError::UnknownNode {
                core: c.core,
                node: c.node,
            })?;
            node.cores.set(c.core);
            online.set(c.core);
            cores.push(TopologyNode::new(c.core, c.node, c.cache_domain, c.base_clock_mhz));
        }
        cores.sort_by_key(|c| c.core);

        Ok(Self {
            generation,
            cores,
            nodes,
            distances,
            online,
        })
    }

    /// Next snapshot with `node` added
    pub fn with_core_added(&self, node: TopologyNode) -> TopologyResult<Self> {
        if node.core.index() >= MAX_CPUS {
            return Err(HardwareError::CoreOutOfRange(node.core));
        }
        if self.online.contains(node.core) {
            return Err(HardwareError::DuplicateCore(node.core));
        }
        if node.node.index() >= self.nodes.len() {
            return Err(HardwareError::UnknownNode {
                core: node.core,
                node: node.node,
            });
        }

        let mut next = self.clone();
        next.generation += 1;
        next.online.set(node.core);
        next.nodes[node.node.index()].cores.set(node.core);
        let pos = next.cores.partition_point(|c| c.core < node.core);
        next.cores.insert(pos, node);
        Ok(next)
    }

    /// Next snapshot with `core` removed
    pub fn without_core(&self, core: CoreId) -> TopologyResult<Self> {
        let pos = self
            .cores
            .binary_search_by_key(&core, |c| c.core)
            .map_err(|_| HardwareError::UnknownCore(core))?;
        if self.cores.len() == 1 {
            return Err(HardwareError::LastCore(core));
        }

        let mut next = self.clone();
        next.generation += 1;
        let removed = next.cores.remove(pos);
        next.online.clear(core);
        next.nodes[removed.node.index()].cores.clear(core);
        Ok(next)
    }

    /// Snapshot generation; bumps on every hot-plug
    #[inline(always)]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// All cores, ascending id
    #[inline(always)]
    pub fn cores(&self) -> &[TopologyNode] {
        &self.cores
    }

    /// Number of online cores
    #[inline(always)]
    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    /// Mask of online cores
    #[inline(always)]
    pub fn online(&self) -> &CpuMask {
        &self.online
    }

    /// Look up a core
    pub fn core(&self, core: CoreId) -> Option<&TopologyNode> {
        self.cores
            .binary_search_by_key(&core, |c| c.core)
            .ok()
            .map(|i| &self.cores[i])
    }

    /// NUMA node of a core
    #[inline]
    pub fn node_of(&self, core: CoreId) -> Option<NodeId> {
        self.core(core).map(|c| c.node)
    }

    /// Cache domain of a core
    #[inline]
    pub fn cache_domain_of(&self, core: CoreId) -> Option<CacheDomainId> {
        self.core(core).map(|c| c.cache_domain)
    }

    /// All NUMA nodes, indexed by id
    #[inline(always)]
    pub fn nodes(&self) -> &[NumaNodeInfo] {
        &self.nodes
    }

    /// Number of NUMA nodes
    #[inline(always)]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Look up a node
    #[inline]
    pub fn node(&self, node: NodeId) -> Option<&NumaNodeInfo> {
        self.nodes.get(node.index())
    }

    /// Online cores of a node
    pub fn cores_in_node(&self, node: NodeId) -> CpuMask {
        self.node(node).map(|n| n.cores).unwrap_or_default()
    }

    /// Online cores sharing a last-level cache
    pub fn cores_in_cache_domain(&self, domain: CacheDomainId) -> CpuMask {
        self.cores
            .iter()
            .filter(|c| c.cache_domain == domain)
            .map(|c| c.core)
            .collect()
    }

    /// Distinct cache domains, ascending
    pub fn cache_domains(&self) -> Vec<CacheDomainId> {
        let mut domains: Vec<CacheDomainId> = self.cores.iter().map(|c| c.cache_domain).collect();
        domains.sort_unstable();
        domains.dedup();
        domains
    }

    /// Distance between nodes
    #[inline]
    pub fn distance(&self, from: NodeId, to: NodeId) -> u8 {
        self.distances.get(from, to)
    }

    /// The distance matrix
    #[inline(always)]
    pub fn distances(&self) -> &DistanceMatrix {
        &self.distances
    }

    /// Other nodes ordered by distance from `from`, ties by lower id
    pub fn nearest_nodes(&self, from: NodeId) -> Vec<NodeId> {
        let mut others: Vec<NodeId> = self.nodes.iter().map(|n| n.id).filter(|&n| n != from).collect();
        others.sort_by_key(|&n| (self.distance(from, n), n));
        others
    }

    /// Node whose memory bank holds the frame
    pub fn node_of_pfn(&self, pfn: u64) -> Option<NodeId> {
        self.nodes.iter().find(|n| n.contains_pfn(pfn)).map(|n| n.id)
    }
}

/// Enumerate and validate the machine topology
pub fn discover(probe: &dyn TopologyProbe) -> TopologyResult<Topology> {
    Topology::discover(probe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::StaticProbe;
    use proptest::prelude::*;

    fn four_node_probe() -> StaticProbe {
        StaticProbe::uniform(4, 2, 2, 1000, 4).distances(&[
            [0u8, 2, 4, 4],
            [2, 0, 4, 4],
            [4, 4, 0, 2],
            [4, 4, 2, 0],
        ])
    }

    #[test]
    fn test_discover_four_nodes() {
        let topo = discover(&four_node_probe()).unwrap();
        assert_eq!(topo.core_count(), 8);
        assert_eq!(topo.node_count(), 4);
        assert_eq!(topo.node_of(CoreId(5)), Some(NodeId(2)));
        assert_eq!(topo.cores_in_node(NodeId(3)).count(), 2);
        assert_eq!(topo.cache_domains().len(), 4);
        assert_eq!(topo.nearest_nodes(NodeId(0)), [NodeId(1), NodeId(2), NodeId(3)]);
        assert_eq!(topo.node_of_pfn(2500), Some(NodeId(2)));
    }

    #[test]
    fn test_core_reporting_absent_node_is_hardware_error() {
        let probe = StaticProbe::new()
            .node(0, 0, 100)
            .core(0, 0, 0)
            .core(1, 3, 0)
            .distances(&[[0u8]]);
        assert_eq!(
            discover(&probe).unwrap_err(),
            HardwareError::UnknownNode {
                core: CoreId(1),
                node: NodeId(3)
            }
        );
    }

    #[test]
    fn test_duplicate_core_rejected() {
        let probe = StaticProbe::new()
            .node(0, 0, 100)
            .core(0, 0, 0)
            .core(0, 0, 0)
            .distances(&[[0u8]]);
        assert_eq!(discover(&probe).unwrap_err(), HardwareError::DuplicateCore(CoreId(0)));
    }

    #[test]
    fn test_distance_dimension_must_match_nodes() {
        let probe = StaticProbe::new()
            .node(0, 0, 100)
            .node(1, 100, 100)
            .core(0, 0, 0)
            .distances(&[[0u8]]);
        assert!(matches!(
            discover(&probe).unwrap_err(),
            HardwareError::DistanceShape { expected: 2, .. }
        ));
    }

    #[test]
    fn test_hotplug_snapshots_are_independent() {
        let topo = discover(&four_node_probe()).unwrap();
        let removed = topo.without_core(CoreId(3)).unwrap();
        assert_eq!(removed.generation(), 1);
        assert!(!removed.online().contains(CoreId(3)));
        assert!(topo.online().contains(CoreId(3)));

        let added = removed
            .with_core_added(TopologyNode::new(CoreId(3), NodeId(1), CacheDomainId(1), 2400))
            .unwrap();
        assert_eq!(added.generation(), 2);
        assert_eq!(added.cores_in_node(NodeId(1)).count(), 2);
        assert_eq!(added.cores()[3].core, CoreId(3));
    }

    #[test]
    fn test_cannot_remove_unknown_or_last_core() {
        let topo = discover(&StaticProbe::uniform(1, 1, 1, 10, 0)).unwrap();
        assert_eq!(topo.without_core(CoreId(7)).unwrap_err(), HardwareError::UnknownCore(CoreId(7)));
        assert_eq!(topo.without_core(CoreId(0)).unwrap_err(), HardwareError::LastCore(CoreId(0)));
    }

    fn symmetric_rows(n: usize, cells: &[u8]) -> Vec<Vec<u8>> {
        (0..n)
            .map(|i| {
                (0..n)
                    .map(|j| if i == j { 0 } else { cells[i.min(j) * n + i.max(j)] })
                    .collect()
            })
            .collect()
    }

    proptest! {
        #[test]
        fn prop_nearest_nodes_ordered(
            (n, cells) in (1usize..8).prop_flat_map(|n| (Just(n), proptest::collection::vec(1u8..50, n * n)))
        ) {
            let rows = symmetric_rows(n, &cells);
            let topo = discover(&StaticProbe::uniform(n as u32, 1, 1, 64, 1).distances(&rows)).unwrap();
            for from in 0..n as u32 {
                let from = NodeId(from);
                let order = topo.nearest_nodes(from);
                prop_assert_eq!(order.len(), n - 1);
                prop_assert!(!order.contains(&from));
                for pair in order.windows(2) {
                    let (a, b) = (pair[0], pair[1]);
                    let key = |x: NodeId| (topo.distance(from, x), x);
                    prop_assert!(key(a) < key(b));
                }
            }
        }

        #[test]
        fn prop_hotplug_keeps_online_set_consistent(ops in proptest::collection::vec((any::<bool>(), 0u32..12), 1..40)) {
            let mut topo = discover(&StaticProbe::uniform(2, 4, 2, 64, 4)).unwrap();
            for (add, core) in ops {
                let before = topo.generation();
                let next = if add {
                    topo.with_core_added(TopologyNode::new(CoreId(core), NodeId(core % 2), CacheDomainId(core / 2), 2000))
                } else {
                    topo.without_core(CoreId(core))
                };
                match next {
                    Ok(next) => {
                        prop_assert_eq!(next.generation(), before + 1);
                        prop_assert_eq!(next.online().contains(CoreId(core)), add);
                        topo = next;
                    },
                    Err(_) => prop_assert_eq!(topo.generation(), before),
                }
                prop_assert!(topo.core_count() >= 1);
                prop_assert_eq!(topo.online().count(), topo.core_count());
                let per_node: usize = topo.nodes().iter().map(|n| n.cores.count()).sum();
                prop_assert_eq!(per_node, topo.core_count());
                prop_assert!(topo.cores().windows(2).all(|w| w[0].core < w[1].core));
            }
        }
    }
}
