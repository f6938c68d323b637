//! Automatic NUMA balancing.
//!
//! For every node whose remote-access ratio exceeds the threshold, ranges
//! are picked least-recently-remote-accessed first and sent toward the node
//! that accesses them most.

use alloc::vec::Vec;

use helix_topology::NodeId;

use crate::access::AccessTracker;
use crate::types::PageRange;

/// One planned move
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceMove {
    /// Range to move
    pub range: PageRange,
    /// Node requesting it
    pub target: NodeId,
}

/// Balancer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalanceStats {
    /// Passes run
    pub passes: u64,
    /// Nodes found over the threshold
    pub imbalanced_nodes: u64,
    /// Moves scheduled
    pub moves_planned: u64,
}

/// Plan moves for one pass; at most `budget`, skipping ranges `is_pending`
pub fn plan(
    tracker: &AccessTracker,
    nodes: impl Iterator<Item = NodeId>,
    node_ratio: impl Fn(NodeId) -> f32,
    threshold: f32,
    budget: usize,
    is_pending: impl Fn(u64) -> bool,
    stats: &mut BalanceStats,
) -> Vec<BalanceMove> {
    stats.passes += 1;
    let mut moves = Vec::new();
    for node in nodes {
        if moves.len() >= budget {
            break;
        }
        let ratio = node_ratio(node);
        if ratio <= threshold {
            continue;
        }
        stats.imbalanced_nodes += 1;

        let mut candidates = tracker.remote_candidates(node);
        candidates.retain(|r| !is_pending(r.range.start_pfn));
        candidates.sort_by_key(|r| (r.last_remote_ns.unwrap_or(0), r.range.start_pfn));
        for r in candidates {
            if moves.len() >= budget {
                break;
            }
            if let Some(target) = r.dominant_remote() {
                moves.push(BalanceMove {
                    range: r.range,
                    target,
                });
            }
        }
        log::debug!(
            "NUMA: {} remote ratio {:.2} over {:.2}, {} moves planned so far",
            node,
            ratio,
            threshold,
            moves.len()
        );
    }
    stats.moves_planned += moves.len() as u64;
    moves
}
