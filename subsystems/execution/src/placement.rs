//! Core selection on enqueue.
//!
//! A unit whose affinity excludes some online core goes to the least-loaded
//! core it admits. Otherwise the configured [`BalanceAlgorithm`] decides.
//! Every rule breaks ties by lowest core id.

use helix_numa::NumaManager;
use helix_topology::{CoreId, NodeId, Topology, UnitId};

/// Placement / balancing strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BalanceAlgorithm {
    /// Least-loaded core
    LoadBased,
    /// Node holding the unit's most recently touched memory
    #[default]
    NumaAware,
    /// Core sharing a cache with the last-run core
    CacheAware,
    /// Weighted cost of load, clock, migration distance and memory distance
    ModelBased,
}

/// Where a unit's memory lives
pub trait MemoryAffinity: Send + Sync {
    /// Node of the memory most recently touched by `unit`
    fn memory_node_of(&self, unit: UnitId) -> Option<NodeId>;
}

impl MemoryAffinity for NumaManager {
    fn memory_node_of(&self, unit: UnitId) -> Option<NodeId> {
        NumaManager::memory_node_of(self, unit)
    }
}

/// Load seen on one candidate core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreLoad {
    /// Core
    pub core: CoreId,
    /// Units queued or running
    pub load: usize,
    /// Clock relative to base, percent
    pub frequency_percent: u32,
}

/// What placement knows about the unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlacementHint {
    /// Core it last ran on
    pub last_core: Option<CoreId>,
    /// Node its memory lives on
    pub memory_node: Option<NodeId>,
}

/// Least-loaded candidate; `candidates` ascend by core id
pub fn least_loaded(candidates: &[CoreLoad]) -> Option<CoreLoad> {
    candidates.iter().copied().min_by_key(|c| (c.load, c.core))
}

/// Pick a core among `candidates` (ascending id, all admitted by affinity)
pub fn choose_core(
    algorithm: BalanceAlgorithm,
    topology: &Topology,
    candidates: &[CoreLoad],
    restricted: bool,
    hint: &PlacementHint,
    slack: usize,
) -> Option<CoreId> {
    let global = least_loaded(candidates)?;
    if restricted {
        return Some(global.core);
    }

    let prefer = |keep: &dyn Fn(CoreId) -> bool| -> CoreId {
        let local: alloc::vec::Vec<CoreLoad> =
            candidates.iter().copied().filter(|c| keep(c.core)).collect();
        match least_loaded(&local) {
            Some(best) if best.load <= global.load + slack => best.core,
            _ => global.core,
        }
    };

    let chosen = match algorithm {
        BalanceAlgorithm::LoadBased => global.core,
        BalanceAlgorithm::NumaAware => {
            let node = hint
                .memory_node
                .or_else(|| hint.last_core.and_then(|c| topology.node_of(c)));
            match node {
                Some(node) => prefer(&|c| topology.node_of(c) == Some(node)),
                None => global.core,
            }
        },
        BalanceAlgorithm::CacheAware => {
            match hint.last_core.and_then(|c| topology.cache_domain_of(c)) {
                Some(llc) => prefer(&|c| topology.cache_domain_of(c) == Some(llc)),
                None => global.core,
            }
        },
        BalanceAlgorithm::ModelBased => {
            candidates
                .iter()
                .min_by_key(|c| (model_cost(topology, c, hint), c.core))
                .map_or(global.core, |c| c.core)
        },
    };
    Some(chosen)
}

/// Cost in hundredths of one queued unit at full clock
fn model_cost(topology: &Topology, candidate: &CoreLoad, hint: &PlacementHint) -> u64 {
    let load = candidate.load as u64 * 100 * 100 / u64::from(candidate.frequency_percent.max(1));
    let node = topology.node_of(candidate.core);

    let migration = match hint.last_core {
        None => 0,
        Some(last) if last == candidate.core => 0,
        Some(last) => {
            let last_node = topology.node_of(last);
            if topology.cache_domain_of(last) == topology.cache_domain_of(candidate.core) {
                10
            } else if last_node == node {
                25
            } else {
                match (last_node, node) {
                    (Some(a), Some(b)) => 25 + 10 * u64::from(topology.distance(a, b)),
                    _ => 25,
                }
            }
        },
    };

    let memory = match (hint.memory_node, node) {
        (Some(mem), Some(node)) if mem != node => 5 * u64::from(topology.distance(mem, node)),
        _ => 0,
    };

    load + migration + memory
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use helix_topology::StaticProbe;

    // 2 nodes x 4 cores, 2 cores per cache
    fn topo() -> Topology {
        Topology::discover(&StaticProbe::uniform(2, 4, 2, 1024, 20)).unwrap()
    }

    fn loads(l: &[usize]) -> Vec<CoreLoad> {
        l.iter()
            .enumerate()
            .map(|(i, &load)| CoreLoad {
                core: CoreId(i as u32),
                load,
                frequency_percent: 100,
            })
            .collect()
    }

    #[test]
    fn test_load_based_ties_to_lowest_id() {
        let t = topo();
        let c = loads(&[3, 1, 1, 2, 5, 5, 5, 5]);
        let hint = PlacementHint::default();
        assert_eq!(
            choose_core(BalanceAlgorithm::LoadBased, &t, &c, false, &hint, 1),
            Some(CoreId(1))
        );
    }

    #[test]
    fn test_numa_aware_prefers_memory_node() {
        let t = topo();
        let c = loads(&[0, 0, 0, 0, 1, 1, 0, 1]);
        let hint = PlacementHint {
            last_core: Some(CoreId(0)),
            memory_node: Some(NodeId(1)),
        };
        assert_eq!(
            choose_core(BalanceAlgorithm::NumaAware, &t, &c, false, &hint, 1),
            Some(CoreId(6))
        );

        // Memory node much busier than elsewhere: fall back to global
        let c = loads(&[0, 0, 0, 0, 5, 5, 5, 5]);
        assert_eq!(
            choose_core(BalanceAlgorithm::NumaAware, &t, &c, false, &hint, 1),
            Some(CoreId(0))
        );
    }

    #[test]
    fn test_cache_aware_prefers_last_llc() {
        let t = topo();
        let c = loads(&[0, 0, 0, 0, 1, 1, 0, 0]);
        let hint = PlacementHint {
            last_core: Some(CoreId(5)),
            memory_node: None,
        };
        assert_eq!(
            choose_core(BalanceAlgorithm::CacheAware, &t, &c, false, &hint, 1),
            Some(CoreId(4))
        );
    }

    #[test]
    fn test_model_based_weighs_distance() {
        let t = topo();
        let hint = PlacementHint {
            last_core: Some(CoreId(4)),
            memory_node: Some(NodeId(1)),
        };
        // Equal load everywhere: stay put
        let c = loads(&[1; 8]);
        assert_eq!(
            choose_core(BalanceAlgorithm::ModelBased, &t, &c, false, &hint, 1),
            Some(CoreId(4))
        );

        // Far node much idler: move
        let c = loads(&[0, 0, 0, 0, 9, 9, 9, 9]);
        assert_eq!(
            choose_core(BalanceAlgorithm::ModelBased, &t, &c, false, &hint, 1),
            Some(CoreId(0))
        );
    }

    #[test]
    fn test_model_based_penalises_slow_clock() {
        let t = topo();
        let mut c = loads(&[2, 2, 5, 5, 5, 5, 5, 5]);
        c[0].frequency_percent = 50;
        let hint = PlacementHint::default();
        assert_eq!(
            choose_core(BalanceAlgorithm::ModelBased, &t, &c, false, &hint, 1),
            Some(CoreId(1))
        );
    }

    #[test]
    fn test_restricted_is_least_loaded() {
        let t = topo();
        let c: Vec<CoreLoad> = loads(&[4, 4, 4, 4, 4, 4, 2, 3])[5..].to_vec();
        let hint = PlacementHint {
            last_core: Some(CoreId(5)),
            memory_node: Some(NodeId(0)),
        };
        assert_eq!(
            choose_core(BalanceAlgorithm::CacheAware, &t, &c, true, &hint, 1),
            Some(CoreId(6))
        );
    }
}
