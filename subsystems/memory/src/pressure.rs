//! Memory pressure escalation.

use core::fmt;

/// One rung of the pressure ladder, in escalation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PressureStep {
    /// Compress cold pages and reclaim their frames
    ReclaimCompressed,
    /// Merge identical pages
    Deduplicate,
    /// Write cold pages to swap
    SwapOut,
    /// Refuse new allocations until pressure clears
    DenyAllocations,
}

impl PressureStep {
    /// Escalation order
    pub const ALL: [PressureStep; 4] = [
        Self::ReclaimCompressed,
        Self::Deduplicate,
        Self::SwapOut,
        Self::DenyAllocations,
    ];

    /// Position in [`Self::ALL`]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for PressureStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReclaimCompressed => "reclaim-compressed",
            Self::Deduplicate => "deduplicate",
            Self::SwapOut => "swap-out",
            Self::DenyAllocations => "deny-allocations",
        };
        f.write_str(name)
    }
}

/// Pressure counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PressureStats {
    /// Times pressure was found
    pub episodes: u64,
    /// Times each step was the last one taken, indexed by [`PressureStep::index`]
    pub steps: [u64; 4],
    /// Allocations refused while denying
    pub denied: u64,
}

impl PressureStats {
    /// Count for one step
    pub fn count(&self, step: PressureStep) -> u64 {
        self.steps[step.index()]
    }
}
