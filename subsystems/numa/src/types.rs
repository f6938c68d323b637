//! Page ranges and allocation policies.

use core::fmt;

use helix_topology::{CoreId, NodeId};

/// Base page size (bytes)
pub const PAGE_SIZE: u64 = 4096;

/// log2 of [`PAGE_SIZE`]
pub const PAGE_SHIFT: u32 = 12;

/// Whole pages needed for `bytes`
#[inline]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

/// Physically contiguous frames on one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageRange {
    /// First frame
    pub start_pfn: u64,
    /// Frame count
    pub pages: u64,
    /// Node holding every frame
    pub node: NodeId,
}

impl PageRange {
    /// One past the last frame
    #[inline(always)]
    pub const fn end_pfn(&self) -> u64 {
        self.start_pfn + self.pages
    }

    /// Size in bytes
    #[inline(always)]
    pub const fn bytes(&self) -> u64 {
        self.pages * PAGE_SIZE
    }

    /// Physical address of the first byte
    #[inline(always)]
    pub const fn phys_addr(&self) -> u64 {
        self.start_pfn << PAGE_SHIFT
    }

    /// Does the range include the frame?
    #[inline]
    pub const fn contains_pfn(&self, pfn: u64) -> bool {
        pfn >= self.start_pfn && pfn < self.end_pfn()
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}+{}]@{}", self.start_pfn, self.pages, self.node)
    }
}

/// Node selection rule for an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AllocPolicy {
    /// Only this node; fail rather than spill
    Bind(NodeId),
    /// This node first, then the nearest with room
    Preferred(NodeId),
    /// Rotate across nodes per allocation
    Interleave,
    /// The calling core's node, then the nearest with room
    Local,
    /// Distance and pressure heuristic
    #[default]
    Auto,
}

impl AllocPolicy {
    /// Node named by the policy, if any
    pub const fn named_node(&self) -> Option<NodeId> {
        match self {
            AllocPolicy::Bind(n) | AllocPolicy::Preferred(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for AllocPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocPolicy::Bind(n) => write!(f, "bind({})", n),
            AllocPolicy::Preferred(n) => write!(f, "preferred({})", n),
            AllocPolicy::Interleave => f.write_str("interleave"),
            AllocPolicy::Local => f.write_str("local"),
            AllocPolicy::Auto => f.write_str("auto"),
        }
    }
}

/// Reports the core the caller is running on
pub trait CoreLocator: Send + Sync {
    /// Current core, if known
    fn current_core(&self) -> Option<CoreId>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pages_for_rounds_up() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(4096), 1);
        assert_eq!(pages_for(4097), 2);
    }

    #[test]
    fn test_range_geometry() {
        let r = PageRange {
            start_pfn: 0x100,
            pages: 4,
            node: NodeId(1),
        };
        assert_eq!(r.end_pfn(), 0x104);
        assert_eq!(r.bytes(), 16384);
        assert_eq!(r.phys_addr(), 0x100_000);
        assert!(r.contains_pfn(0x103));
        assert!(!r.contains_pfn(0x104));
    }
}
