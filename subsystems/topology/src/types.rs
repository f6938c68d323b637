//! Identifier and state types shared by every subsystem that consumes the
//! topology.

use core::fmt;

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Logical core identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CoreId(pub u32);

impl CoreId {
    /// Create a core id
    #[inline(always)]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Index form, for per-core arrays
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// NUMA node identifier (dense, starting at zero)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Create a node id
    #[inline(always)]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Index form, for per-node arrays
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Last-level cache domain identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CacheDomainId(pub u32);

impl fmt::Display for CacheDomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "llc{}", self.0)
    }
}

/// Opaque schedulable-unit identifier.
///
/// Issued by the process manager; the scheduler and the memory manager use
/// it as a key and never interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct UnitId(pub u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit{}", self.0)
    }
}

// ============================================================================
// POWER STATE
// ============================================================================

/// Per-core power / frequency state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum PowerState {
    /// Full frequency
    #[default]
    Performance = 0,
    /// Balanced frequency scaling
    Balanced    = 1,
    /// Reduced frequency
    PowerSave   = 2,
    /// Core parked
    Sleep       = 3,
}

impl PowerState {
    /// All states, fastest first
    pub const ALL: [PowerState; 4] = [
        PowerState::Performance,
        PowerState::Balanced,
        PowerState::PowerSave,
        PowerState::Sleep,
    ];

    /// One step slower; `Sleep` stays `Sleep`
    #[inline]
    pub const fn downgrade(self) -> Self {
        match self {
            PowerState::Performance => PowerState::Balanced,
            PowerState::Balanced => PowerState::PowerSave,
            PowerState::PowerSave | PowerState::Sleep => PowerState::Sleep,
        }
    }

    /// Relative clock, in percent of base clock
    #[inline]
    pub const fn frequency_percent(self) -> u32 {
        match self {
            PowerState::Performance => 100,
            PowerState::Balanced => 75,
            PowerState::PowerSave => 50,
            PowerState::Sleep => 0,
        }
    }

    /// Decode from the raw representation
    #[inline]
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => PowerState::Performance,
            1 => PowerState::Balanced,
            2 => PowerState::PowerSave,
            _ => PowerState::Sleep,
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PowerState::Performance => "performance",
            PowerState::Balanced => "balanced",
            PowerState::PowerSave => "powersave",
            PowerState::Sleep => "sleep",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_state_downgrade_saturates() {
        assert_eq!(PowerState::Performance.downgrade(), PowerState::Balanced);
        assert_eq!(PowerState::PowerSave.downgrade(), PowerState::Sleep);
        assert_eq!(PowerState::Sleep.downgrade(), PowerState::Sleep);
    }

    #[test]
    fn test_power_state_raw_roundtrip() {
        for state in PowerState::ALL {
            assert_eq!(PowerState::from_raw(state as u8), state);
        }
    }
}
