//! Virtual memory manager configuration.

use crate::error::{VmError, VmResult};
use crate::overcommit::OvercommitPolicy;

/// Virtual memory settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VmConfig {
    /// Commit policy for writable private anonymous mappings
    pub overcommit: OvercommitPolicy,
    /// Frame percentage committable under [`OvercommitPolicy::Never`]
    pub overcommit_ratio_percent: u32,
    /// Promote eligible 2 MiB windows
    pub huge_pages: bool,
    /// Compress cold pages
    pub compression_enabled: bool,
    /// Merge identical cold pages
    pub dedup_enabled: bool,
    /// Pages with fewer accesses per pass than this are cold
    pub cold_access_threshold: u32,
    /// Swap slots (pages); zero disables swap
    pub swap_slots: u32,
    /// Free-frame fraction below which pressure relief starts
    pub pressure_free_ratio: f32,
    /// Reject writable mappings that are not readable
    pub write_implies_read: bool,
}

impl VmConfig {
    /// Default settings
    pub const fn new() -> Self {
        Self {
            overcommit: OvercommitPolicy::Heuristic,
            overcommit_ratio_percent: 50,
            huge_pages: true,
            compression_enabled: true,
            dedup_enabled: true,
            cold_access_threshold: 2,
            swap_slots: 4096,
            pressure_free_ratio: 0.05,
            write_implies_read: true,
        }
    }

    /// Small machines: strict commit, earlier relief
    pub const fn small() -> Self {
        Self {
            overcommit: OvercommitPolicy::Never,
            swap_slots: 1024,
            pressure_free_ratio: 0.10,
            ..Self::new()
        }
    }

    /// Large servers: bigger swap, later relief
    pub const fn server() -> Self {
        Self {
            swap_slots: 1 << 20,
            pressure_free_ratio: 0.02,
            ..Self::new()
        }
    }

    /// Check invariants
    pub fn validate(&self) -> VmResult<()> {
        if !(0.0..1.0).contains(&self.pressure_free_ratio) {
            return Err(VmError::InvalidConfig("pressure_free_ratio must be in 0..1"));
        }
        if self.overcommit == OvercommitPolicy::Never && self.overcommit_ratio_percent == 0 {
            return Err(VmError::InvalidConfig("strict overcommit needs a non-zero ratio"));
        }
        Ok(())
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        assert!(VmConfig::new().validate().is_ok());
        assert!(VmConfig::small().validate().is_ok());
        assert!(VmConfig::server().validate().is_ok());
    }

    #[test]
    fn test_bad_ratio_rejected() {
        let config = VmConfig {
            pressure_free_ratio: 1.0,
            ..VmConfig::new()
        };
        assert!(config.validate().is_err());
    }
}
