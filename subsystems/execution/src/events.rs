//! # Scheduler Events
//!
//! Conditions the scheduler reports instead of hiding: missed deadlines,
//! thermal throttling, overridden affinity. Events land in a bounded log
//! that the integration layer drains; when full, the oldest event is
//! dropped and counted.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use helix_topology::{CoreId, PowerState, UnitId};
use spin::Mutex;

// =============================================================================
// Events
// =============================================================================

/// Scheduler event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedEvent {
    /// A real-time unit cannot, or did not, start in time
    DeadlineMissed {
        /// Unit
        unit: UnitId,
        /// Its deadline (ns)
        deadline_ns: u64,
        /// Projected or actual finish (ns)
        finish_ns: u64,
    },
    /// Temperature forced a core to a slower state
    ThermalThrottled {
        /// Core
        core: CoreId,
        /// State before
        from: PowerState,
        /// State after
        to: PowerState,
        /// Reading that triggered it (°C)
        temperature_c: u32,
    },
    /// No online core satisfied the unit's affinity after a core went away
    AffinityOverridden {
        /// Unit
        unit: UnitId,
        /// Core it was placed on anyway
        core: CoreId,
    },
    /// Governor moved a core to another power state
    PowerStateChanged {
        /// Core
        core: CoreId,
        /// State before
        from: PowerState,
        /// State after
        to: PowerState,
    },
}

// =============================================================================
// Event Log
// =============================================================================

/// Bounded drop-oldest event log
#[derive(Debug)]
pub struct EventLog {
    events: Mutex<VecDeque<SchedEvent>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl EventLog {
    /// Log holding at most `capacity` events
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Append, evicting the oldest event when full
    pub fn push(&self, event: SchedEvent) {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        events.push_back(event);
    }

    /// Take everything logged so far, oldest first
    pub fn drain(&self) -> Vec<SchedEvent> {
        self.events.lock().drain(..).collect()
    }

    /// Events waiting
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Nothing waiting?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events lost to overflow
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
