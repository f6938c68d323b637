//! Hardware enumeration sources.
//!
//! A [`TopologyProbe`] turns firmware tables (SRAT/SLIT/MADT on ACPI
//! systems, the device tree elsewhere) into a flat [`HardwareDescription`].
//! The description is validated when the [`Topology`](crate::Topology) is
//! built, so probes report exactly what the firmware says.

use alloc::vec::Vec;

use crate::error::TopologyResult;
use crate::types::{CacheDomainId, CoreId, NodeId};

/// Base clock assumed when firmware does not report one
pub const DEFAULT_BASE_CLOCK_MHZ: u32 = 2_400;

// ============================================================================
// DESCRIPTORS
// ============================================================================

/// One enumerated core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreDescriptor {
    /// Core id
    pub core: CoreId,
    /// NUMA node the core reports
    pub node: NodeId,
    /// Last-level cache the core shares
    pub cache_domain: CacheDomainId,
    /// Base clock (MHz)
    pub base_clock_mhz: u32,
}

/// One enumerated NUMA node and its memory bank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeDescriptor {
    /// Node id
    pub node: NodeId,
    /// First physical frame of the bank
    pub base_pfn: u64,
    /// Frames in the bank
    pub page_count: u64,
}

/// Raw enumeration result
#[derive(Debug, Clone, Default)]
pub struct HardwareDescription {
    /// Cores, in firmware order
    pub cores: Vec<CoreDescriptor>,
    /// Nodes, in firmware order
    pub nodes: Vec<NodeDescriptor>,
    /// Distance rows indexed by node id
    pub distances: Vec<Vec<u8>>,
}

// ============================================================================
// PROBE
// ============================================================================

/// Source of hardware enumeration
pub trait TopologyProbe {
    /// Enumerate cores, nodes and distances
    fn enumerate(&self) -> TopologyResult<HardwareDescription>;
}

/// Probe backed by a fixed description.
///
/// Used for boot descriptors handed over by the loader and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    desc: HardwareDescription,
}

impl StaticProbe {
    /// Empty probe
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with its memory bank
    pub fn node(mut self, node: u32, base_pfn: u64, page_count: u64) -> Self {
        self.desc.nodes.push(NodeDescriptor {
            node: NodeId(node),
            base_pfn,
            page_count,
        });
        self
    }

    /// Add a core
    pub fn core(mut self, core: u32, node: u32, cache_domain: u32) -> Self {
        self.desc.cores.push(CoreDescriptor {
            core: CoreId(core),
            node: NodeId(node),
            cache_domain: CacheDomainId(cache_domain),
            base_clock_mhz: DEFAULT_BASE_CLOCK_MHZ,
        });
        self
    }

    /// Set the distance matrix
    pub fn distances<R: AsRef<[u8]>>(mut self, rows: &[R]) -> Self {
        self.desc.distances = rows.iter().map(|r| r.as_ref().to_vec()).collect();
        self
    }

    /// Symmetric machine: `nodes` nodes of `cores_per_node` cores each,
    /// `cores_per_llc` cores per last-level cache, `pages_per_node` frames
    /// per node and a uniform remote distance.
    pub fn uniform(
        nodes: u32,
        cores_per_node: u32,
        cores_per_llc: u32,
        pages_per_node: u64,
        remote_distance: u8,
    ) -> Self {
        let mut probe = Self::new();
        let cores_per_llc = cores_per_llc.max(1);
        for node in 0..nodes {
            probe = probe.node(node, node as u64 * pages_per_node, pages_per_node);
            for local in 0..cores_per_node {
                let core = node * cores_per_node + local;
                probe = probe.core(core, node, core / cores_per_llc);
            }
        }

        let n = nodes as usize;
        probe.desc.distances = (0..n)
            .map(|i| {
                (0..n)
                    .map(|j| if i == j { 0 } else { remote_distance })
                    .collect()
            })
            .collect();
        probe
    }

    /// The description this probe reports
    pub fn description(&self) -> &HardwareDescription {
        &self.desc
    }
}

impl TopologyProbe for StaticProbe {
    fn enumerate(&self) -> TopologyResult<HardwareDescription> {
        Ok(self.desc.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_probe_shape() {
        let probe = StaticProbe::uniform(2, 4, 2, 1024, 20);
        let desc = probe.enumerate().unwrap();
        assert_eq!(desc.nodes.len(), 2);
        assert_eq!(desc.cores.len(), 8);
        assert_eq!(desc.nodes[1].base_pfn, 1024);
        assert_eq!(desc.cores[5].node, NodeId(1));
        assert_eq!(desc.cores[5].cache_domain, CacheDomainId(2));
        assert_eq!(desc.distances[0][1], 20);
        assert_eq!(desc.distances[1][1], 0);
    }
}
