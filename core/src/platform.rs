//! Platform hooks handed to [`ScaleSubsystem::init`](crate::ScaleSubsystem::init).
//!
//! The topology probe comes in separately; everything else the components
//! need from the machine at run time lives here.

use alloc::sync::Arc;

use helix_numa::CoreLocator;
use helix_perf::{CounterSource, ManualCounters};

/// Run-time hardware hooks
#[derive(Clone)]
pub struct Platform {
    /// Per-core performance counters
    pub counters: Arc<dyn CounterSource>,
    /// Which core the caller runs on; `Local` and `Auto` allocations use it
    pub locator: Option<Arc<dyn CoreLocator>>,
}

impl Platform {
    /// Platform reading counters from `counters`
    pub fn new(counters: Arc<dyn CounterSource>) -> Self {
        Self {
            counters,
            locator: None,
        }
    }

    /// Software counters the caller advances by hand
    ///
    /// Returns the platform together with the counter handle.
    pub fn software() -> (Self, Arc<ManualCounters>) {
        let counters = Arc::new(ManualCounters::new());
        (Self::new(counters.clone()), counters)
    }

    /// Set the current-core locator
    pub fn with_locator(mut self, locator: Arc<dyn CoreLocator>) -> Self {
        self.locator = Some(locator);
        self
    }
}

impl core::fmt::Debug for Platform {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Platform")
            .field("locator", &self.locator.is_some())
            .finish_non_exhaustive()
    }
}
