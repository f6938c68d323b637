//! Scheduling domains.
//!
//! Three levels, narrowest first: cores sharing a last-level cache, cores
//! sharing a NUMA node, the whole machine. Every online core belongs to
//! exactly one domain per level. The tree is rebuilt from the topology
//! snapshot on hot-plug and never edited in place.

use alloc::vec::Vec;
use core::fmt;

use helix_topology::{CoreId, CpuMask, Topology};

/// Hierarchy level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DomainLevel {
    /// Cores sharing a last-level cache
    Cache,
    /// Cores sharing a NUMA node
    Node,
    /// All cores
    Machine,
}

impl DomainLevel {
    /// Bottom-up order
    pub const ALL: [DomainLevel; 3] = [Self::Cache, Self::Node, Self::Machine];

    /// Position in [`Self::ALL`]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Balancing cadence relative to the base interval
    pub const fn interval_multiplier(self) -> u64 {
        match self {
            Self::Cache => 1,
            Self::Node => 4,
            Self::Machine => 16,
        }
    }
}

impl fmt::Display for DomainLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cache => "cache",
            Self::Node => "node",
            Self::Machine => "machine",
        };
        f.write_str(name)
    }
}

/// Domain index, dense per level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(pub u32);

/// One scheduling domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedDomain {
    /// Index within its level
    pub id: DomainId,
    /// Level
    pub level: DomainLevel,
    /// Member cores
    pub cores: CpuMask,
    /// Balancing groups: single cores at the cache level, child domains above
    pub groups: Vec<CpuMask>,
}

/// Domain hierarchy for one topology generation
#[derive(Debug, Clone)]
pub struct DomainTree {
    levels: [Vec<SchedDomain>; 3],
    generation: u64,
}

impl DomainTree {
    /// Build from a snapshot; cache domains wider than `domain_size` cores
    /// are split into consecutive chunks
    pub fn build(topology: &Topology, domain_size: usize) -> Self {
        let domain_size = domain_size.max(1);

        let mut cache = Vec::new();
        for llc in topology.cache_domains() {
            let members: Vec<CoreId> = topology.cores_in_cache_domain(llc).iter().collect();
            for chunk in members.chunks(domain_size) {
                let cores: CpuMask = chunk.iter().copied().collect();
                cache.push(SchedDomain {
                    id: DomainId(cache.len() as u32),
                    level: DomainLevel::Cache,
                    cores,
                    groups: chunk.iter().map(|&c| CpuMask::single(c)).collect(),
                });
            }
        }

        let mut node = Vec::new();
        for info in topology.nodes() {
            if info.cores.is_empty() {
                continue;
            }
            let groups: Vec<CpuMask> = cache
                .iter()
                .map(|d| d.cores.and(&info.cores))
                .filter(|m| !m.is_empty())
                .collect();
            node.push(SchedDomain {
                id: DomainId(node.len() as u32),
                level: DomainLevel::Node,
                cores: info.cores,
                groups,
            });
        }

        let machine = alloc::vec![SchedDomain {
            id: DomainId(0),
            level: DomainLevel::Machine,
            cores: *topology.online(),
            groups: node.iter().map(|d| d.cores).collect(),
        }];

        Self {
            levels: [cache, node, machine],
            generation: topology.generation(),
        }
    }

    /// Topology generation the tree was built from
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Domains at `level`, ascending id
    pub fn domains(&self, level: DomainLevel) -> &[SchedDomain] {
        &self.levels[level.index()]
    }

    /// Domain holding `core` at `level`
    pub fn domain_of(&self, core: CoreId, level: DomainLevel) -> Option<&SchedDomain> {
        self.levels[level.index()]
            .iter()
            .find(|d| d.cores.contains(core))
    }

    /// Other cores in `core`'s domain at `level`
    pub fn siblings(&self, core: CoreId, level: DomainLevel) -> CpuMask {
        let mut mask = self
            .domain_of(core, level)
            .map(|d| d.cores)
            .unwrap_or_default();
        mask.clear(core);
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helix_topology::StaticProbe;

    fn topo() -> Topology {
        // 2 nodes x 4 cores, 2 cores per LLC
        Topology::discover(&StaticProbe::uniform(2, 4, 2, 1024, 20)).unwrap()
    }

    #[test]
    fn test_every_core_in_one_domain_per_level() {
        let t = topo();
        let tree = DomainTree::build(&t, 16);
        for level in DomainLevel::ALL {
            for core in t.online().iter() {
                let holders = tree
                    .domains(level)
                    .iter()
                    .filter(|d| d.cores.contains(core))
                    .count();
                assert_eq!(holders, 1, "{} at {}", core, level);
            }
        }
        assert_eq!(tree.domains(DomainLevel::Cache).len(), 4);
        assert_eq!(tree.domains(DomainLevel::Node).len(), 2);
        assert_eq!(tree.domains(DomainLevel::Machine)[0].groups.len(), 2);
    }

    #[test]
    fn test_domain_size_splits_cache_domains() {
        let t = Topology::discover(&StaticProbe::uniform(1, 8, 8, 1024, 20)).unwrap();
        let tree = DomainTree::build(&t, 3);
        let sizes: Vec<usize> = tree
            .domains(DomainLevel::Cache)
            .iter()
            .map(|d| d.cores.count())
            .collect();
        assert_eq!(sizes, [3, 3, 2]);
        assert_eq!(tree.domains(DomainLevel::Node)[0].groups.len(), 3);
    }

    #[test]
    fn test_siblings_exclude_self() {
        let tree = DomainTree::build(&topo(), 16);
        let sib = tree.siblings(CoreId(0), DomainLevel::Cache);
        assert_eq!(sib.iter().collect::<Vec<_>>(), [CoreId(1)]);
        assert_eq!(tree.siblings(CoreId(0), DomainLevel::Node).count(), 3);
    }

    #[test]
    fn test_intervals_grow_with_level() {
        assert!(DomainLevel::Cache.interval_multiplier() < DomainLevel::Node.interval_multiplier());
        assert!(DomainLevel::Node.interval_multiplier() < DomainLevel::Machine.interval_multiplier());
    }
}
