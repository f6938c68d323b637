//! Performance monitor errors.

use core::fmt;

use helix_topology::CoreId;

/// Result type for monitor operations
pub type PerfResult<T> = Result<T, PerfError>;

/// Monitor error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerfError {
    /// Core has no sample ring
    InvalidCore(CoreId),
    /// Another writer holds the core's ring
    WriterClaimed(CoreId),
    /// Configuration rejected
    InvalidConfig(&'static str),
}

impl fmt::Display for PerfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCore(core) => write!(f, "{} is not monitored", core),
            Self::WriterClaimed(core) => write!(f, "sample ring of {} already has a writer", core),
            Self::InvalidConfig(msg) => write!(f, "invalid monitor config: {}", msg),
        }
    }
}
