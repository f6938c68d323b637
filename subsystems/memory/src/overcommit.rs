//! Commit accounting for writable private anonymous mappings.

use crate::error::{VmError, VmResult};

/// How far commitments may exceed physical memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OvercommitPolicy {
    /// Strict: commit limit = swap + frames × ratio
    Never,
    /// Refuse only single requests larger than frames + swap
    #[default]
    Heuristic,
    /// Never refuse
    Always,
}

/// Committed page count and the policy guarding it
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitAccounting {
    policy: OvercommitPolicy,
    ratio_percent: u32,
    committed: u64,
    refused: u64,
}

impl CommitAccounting {
    /// Empty accounting
    pub const fn new(policy: OvercommitPolicy, ratio_percent: u32) -> Self {
        Self {
            policy,
            ratio_percent,
            committed: 0,
            refused: 0,
        }
    }

    /// Pages committed now
    pub fn committed(&self) -> u64 {
        self.committed
    }

    /// Requests refused
    pub fn refused(&self) -> u64 {
        self.refused
    }

    /// Policy in force
    pub fn policy(&self) -> OvercommitPolicy {
        self.policy
    }

    /// Change policy; existing commitments stay
    pub fn set_policy(&mut self, policy: OvercommitPolicy, ratio_percent: u32) {
        self.policy = policy;
        self.ratio_percent = ratio_percent;
    }

    /// Strict limit, if the policy has one
    pub fn limit(&self, frames: u64, swap_pages: u64) -> Option<u64> {
        match self.policy {
            OvercommitPolicy::Never => Some(swap_pages + frames * self.ratio_percent as u64 / 100),
            OvercommitPolicy::Heuristic | OvercommitPolicy::Always => None,
        }
    }

    /// Charge `pages`, or refuse with the room left
    pub fn charge(&mut self, pages: u64, frames: u64, swap_pages: u64) -> VmResult<()> {
        let available = match self.policy {
            OvercommitPolicy::Never => {
                let limit = swap_pages + frames * self.ratio_percent as u64 / 100;
                Some(limit.saturating_sub(self.committed))
            },
            OvercommitPolicy::Heuristic => Some(frames + swap_pages),
            OvercommitPolicy::Always => None,
        };
        if let Some(available) = available {
            if pages > available {
                self.refused += 1;
                return Err(VmError::CommitLimit {
                    requested: pages,
                    available,
                });
            }
        }
        self.committed += pages;
        Ok(())
    }

    /// Return a charge
    pub fn release(&mut self, pages: u64) {
        self.committed = self.committed.saturating_sub(pages);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_enforces_limit() {
        let mut acct = CommitAccounting::new(OvercommitPolicy::Never, 50);
        assert_eq!(acct.limit(1000, 100), Some(600));
        acct.charge(500, 1000, 100).unwrap();
        assert_eq!(
            acct.charge(200, 1000, 100),
            Err(VmError::CommitLimit {
                requested: 200,
                available: 100
            })
        );
        acct.release(500);
        acct.charge(600, 1000, 100).unwrap();
        assert_eq!(acct.refused(), 1);
    }

    #[test]
    fn test_heuristic_refuses_only_absurd_requests() {
        let mut acct = CommitAccounting::new(OvercommitPolicy::Heuristic, 50);
        for _ in 0..10 {
            acct.charge(1000, 1000, 0).unwrap();
        }
        assert!(acct.charge(1001, 1000, 0).is_err());
        assert_eq!(acct.committed(), 10_000);
    }

    #[test]
    fn test_always_accepts() {
        let mut acct = CommitAccounting::new(OvercommitPolicy::Always, 0);
        acct.charge(u64::MAX / 2, 1, 0).unwrap();
    }
}
