//! Subsystem lifecycle state.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

/// Lifecycle of a [`ScaleSubsystem`](crate::ScaleSubsystem)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SubsystemState {
    /// Created, `init` not run
    Uninitialized = 0,
    /// `init` in progress
    Initializing  = 1,
    /// Serving requests
    Running       = 2,
    /// `shutdown` in progress
    ShuttingDown  = 3,
    /// Shut down; `init` may run again
    Stopped       = 4,
}

impl From<u32> for SubsystemState {
    fn from(value: u32) -> Self {
        match value {
            0 => SubsystemState::Uninitialized,
            1 => SubsystemState::Initializing,
            2 => SubsystemState::Running,
            3 => SubsystemState::ShuttingDown,
            _ => SubsystemState::Stopped,
        }
    }
}

impl fmt::Display for SubsystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::ShuttingDown => "shutting down",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Atomically updated lifecycle state
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU32);

impl StateCell {
    pub(crate) const fn new() -> Self {
        Self(AtomicU32::new(SubsystemState::Uninitialized as u32))
    }

    pub(crate) fn get(&self) -> SubsystemState {
        SubsystemState::from(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn set(&self, state: SubsystemState) {
        self.0.store(state as u32, Ordering::SeqCst);
    }

    /// Move `from -> to`; false if the state was not `from`
    pub(crate) fn advance(&self, from: SubsystemState, to: SubsystemState) -> bool {
        self.0
            .compare_exchange(from as u32, to as u32, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_only_from_expected_state() {
        let cell = StateCell::new();
        assert!(!cell.advance(SubsystemState::Running, SubsystemState::ShuttingDown));
        assert!(cell.advance(SubsystemState::Uninitialized, SubsystemState::Initializing));
        assert_eq!(cell.get(), SubsystemState::Initializing);
        cell.set(SubsystemState::Stopped);
        assert_eq!(SubsystemState::from(cell.get() as u32), SubsystemState::Stopped);
    }
}
