//! Per-node memory state.

use helix_topology::{NodeId, NumaNodeInfo};

use crate::extent::ExtentFreeList;
use crate::types::PageRange;

/// State of one node, always accessed under that node's lock
#[derive(Debug)]
pub(crate) struct NodeState {
    pub id: NodeId,
    pub base_pfn: u64,
    pub total_pages: u64,
    pub free: ExtentFreeList,
    pub migrations_in_flight: u64,
    pub local_accesses: u64,
    pub remote_accesses: u64,
}

impl NodeState {
    pub fn new(info: &NumaNodeInfo) -> Self {
        Self {
            id: info.id,
            base_pfn: info.base_pfn,
            total_pages: info.page_count,
            free: ExtentFreeList::new(info.base_pfn, info.page_count),
            migrations_in_flight: 0,
            local_accesses: 0,
            remote_accesses: 0,
        }
    }

    pub fn allocate(&mut self, pages: u64, align: u64) -> Option<PageRange> {
        let start_pfn = self.free.allocate_aligned(pages, align)?;
        Some(PageRange {
            start_pfn,
            pages,
            node: self.id,
        })
    }

    pub fn owns(&self, range: &PageRange) -> bool {
        range.node == self.id
            && range.start_pfn >= self.base_pfn
            && range.end_pfn() <= self.base_pfn + self.total_pages
    }

    /// Utilisation in per-mille, so it orders without floats
    pub fn utilization_permille(&self) -> u32 {
        if self.total_pages == 0 {
            return 1000;
        }
        ((self.total_pages - self.free.free_pages()) * 1000 / self.total_pages) as u32
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            node: self.id,
            total_pages: self.total_pages,
            free_pages: self.free.free_pages(),
            used_pages: self.total_pages - self.free.free_pages(),
            largest_free_extent: self.free.largest_extent(),
            migrations_in_flight: self.migrations_in_flight,
            local_accesses: self.local_accesses,
            remote_accesses: self.remote_accesses,
        }
    }
}

/// Point-in-time view of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStats {
    /// Node id
    pub node: NodeId,
    /// Frames in the bank
    pub total_pages: u64,
    /// Free frames
    pub free_pages: u64,
    /// Allocated frames
    pub used_pages: u64,
    /// Longest free run
    pub largest_free_extent: u64,
    /// Migrations targeting this node not yet finished
    pub migrations_in_flight: u64,
    /// Accesses from this node's own cores since the last balance pass
    pub local_accesses: u64,
    /// Accesses from other nodes since the last balance pass
    pub remote_accesses: u64,
}

impl NodeStats {
    /// Fraction of the bank in use
    pub fn utilization(&self) -> f32 {
        if self.total_pages == 0 {
            1.0
        } else {
            self.used_pages as f32 / self.total_pages as f32
        }
    }

    /// Remote share of recent accesses
    pub fn remote_ratio(&self) -> f32 {
        let total = self.local_accesses + self.remote_accesses;
        if total == 0 {
            0.0
        } else {
            self.remote_accesses as f32 / total as f32
        }
    }
}
