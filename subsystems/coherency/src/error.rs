//! Coherency layer errors.

use core::fmt;

/// Result type for coherency operations
pub type CoherencyResult<T> = Result<T, CoherencyError>;

/// Coherency layer error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoherencyError {
    /// Domain index outside the directory
    UnknownDomain {
        /// Requested domain
        domain: usize,
        /// Domains tracked
        domains: usize,
    },
    /// Detector configuration rejected
    InvalidConfig(&'static str),
}

impl fmt::Display for CoherencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownDomain { domain, domains } => {
                write!(f, "cache domain {} out of range ({} tracked)", domain, domains)
            },
            Self::InvalidConfig(msg) => write!(f, "invalid coherency config: {}", msg),
        }
    }
}
