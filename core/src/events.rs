//! # System Events
//!
//! One stream for everything the components report instead of failing:
//! missed deadlines, throttling, regressions, alerts, false sharing,
//! pressure steps, applied tuning and topology changes.
//!
//! Events are delivered to subscribed listeners as they happen and kept in
//! a bounded queue for polling. When the queue is full the oldest event is
//! dropped and counted.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use helix_coherency::FalseSharingReport;
use helix_execution::SchedEvent;
use helix_memory::PressureStep;
use helix_perf::{Alert, PerformanceRegression, TuningDirective};
use helix_topology::{CoreId, PowerState, UnitId};
use spin::{Mutex, RwLock};

// =============================================================================
// Events
// =============================================================================

/// Subsystem event
#[derive(Debug, Clone, PartialEq)]
pub enum SystemEvent {
    /// A real-time unit cannot, or did not, start in time
    DeadlineMissed {
        /// Unit
        unit: UnitId,
        /// Deadline (ns)
        deadline_ns: u64,
        /// Projected or actual finish (ns)
        finish_ns: u64,
    },
    /// Temperature forced a core slower
    ThermalThrottled {
        /// Core
        core: CoreId,
        /// State before
        from: PowerState,
        /// State after
        to: PowerState,
        /// Reading (°C)
        temperature_c: u32,
    },
    /// Governor changed a core's power state
    PowerStateChanged {
        /// Core
        core: CoreId,
        /// State before
        from: PowerState,
        /// State after
        to: PowerState,
    },
    /// A unit was placed outside its affinity after hot-plug
    AffinityOverridden {
        /// Unit
        unit: UnitId,
        /// Core used
        core: CoreId,
    },
    /// Sustained deviation from baseline
    PerformanceRegression(PerformanceRegression),
    /// Threshold alert fired
    Alert(Alert),
    /// Several cache domains write one line at distinct offsets
    FalseSharing(FalseSharingReport),
    /// Memory pressure relief reached this step
    MemoryPressure(PressureStep),
    /// Auto-tuning changed a component parameter
    TuningApplied(TuningDirective),
    /// Topology snapshot replaced
    TopologyChanged {
        /// New generation
        generation: u64,
        /// Cores online
        cores: usize,
    },
}

impl SystemEvent {
    /// Topic for listener filtering
    pub fn topic(&self) -> EventTopic {
        match self {
            Self::DeadlineMissed { .. } | Self::AffinityOverridden { .. } => EventTopic::Scheduling,
            Self::ThermalThrottled { .. } | Self::PowerStateChanged { .. } => EventTopic::Power,
            Self::PerformanceRegression(_) | Self::Alert(_) | Self::TuningApplied(_) => {
                EventTopic::Performance
            },
            Self::FalseSharing(_) | Self::MemoryPressure(_) => EventTopic::Memory,
            Self::TopologyChanged { .. } => EventTopic::Topology,
        }
    }
}

impl From<SchedEvent> for SystemEvent {
    fn from(e: SchedEvent) -> Self {
        match e {
            SchedEvent::DeadlineMissed {
                unit,
                deadline_ns,
                finish_ns,
            } => Self::DeadlineMissed {
                unit,
                deadline_ns,
                finish_ns,
            },
            SchedEvent::ThermalThrottled {
                core,
                from,
                to,
                temperature_c,
            } => Self::ThermalThrottled {
                core,
                from,
                to,
                temperature_c,
            },
            SchedEvent::AffinityOverridden { unit, core } => Self::AffinityOverridden { unit, core },
            SchedEvent::PowerStateChanged { core, from, to } => Self::PowerStateChanged { core, from, to },
        }
    }
}

/// Event topics for subscription filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTopic {
    /// Deadlines and placement
    Scheduling,
    /// Power states and throttling
    Power,
    /// Regressions, alerts, tuning
    Performance,
    /// Pressure and false sharing
    Memory,
    /// Hot-plug
    Topology,
    /// Everything
    All,
}

impl EventTopic {
    /// Does this subscription cover `event`?
    pub fn matches(self, event: &SystemEvent) -> bool {
        self == EventTopic::All || self == event.topic()
    }
}

/// Receives events as they are published
pub trait SystemEventListener: Send + Sync {
    /// Handle one event
    fn on_event(&self, event: &SystemEvent);

    /// Topics of interest
    fn topics(&self) -> &[EventTopic] {
        &[EventTopic::All]
    }
}

// =============================================================================
// Event Hub
// =============================================================================

/// Bounded queue plus listener fan-out
pub struct EventHub {
    queue: Mutex<VecDeque<SystemEvent>>,
    capacity: usize,
    dropped: AtomicU64,
    published: AtomicU64,
    listeners: RwLock<Vec<Arc<dyn SystemEventListener>>>,
}

impl EventHub {
    /// Hub keeping at most `capacity` undrained events
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
            published: AtomicU64::new(0),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Add a listener
    pub fn subscribe(&self, listener: Arc<dyn SystemEventListener>) {
        self.listeners.write().push(listener);
    }

    /// Publish one event
    pub fn publish(&self, event: SystemEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        for l in self.listeners.read().iter() {
            if l.topics().iter().any(|t| t.matches(&event)) {
                l.on_event(&event);
            }
        }
        let mut q = self.queue.lock();
        if q.len() == self.capacity {
            q.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        q.push_back(event);
    }

    /// Take every queued event, oldest first
    pub fn drain(&self) -> Vec<SystemEvent> {
        self.queue.lock().drain(..).collect()
    }

    /// Events lost to a full queue
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Events ever published
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl core::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventHub")
            .field("queued", &self.queue.lock().len())
            .field("dropped", &self.dropped())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    struct Counting {
        topics: [EventTopic; 1],
        seen: AtomicUsize,
    }

    impl SystemEventListener for Counting {
        fn on_event(&self, _: &SystemEvent) {
            self.seen.fetch_add(1, Ordering::Relaxed);
        }

        fn topics(&self) -> &[EventTopic] {
            &self.topics
        }
    }

    fn pressure() -> SystemEvent {
        SystemEvent::MemoryPressure(PressureStep::SwapOut)
    }

    #[test]
    fn test_drop_oldest_when_full() {
        let hub = EventHub::new(2);
        hub.publish(SystemEvent::TopologyChanged { generation: 1, cores: 4 });
        hub.publish(pressure());
        hub.publish(pressure());
        assert_eq!(hub.dropped(), 1);
        assert_eq!(hub.drain(), [pressure(), pressure()]);
        assert!(hub.drain().is_empty());
        assert_eq!(hub.published(), 3);
    }

    #[test]
    fn test_listeners_filter_by_topic() {
        let hub = EventHub::new(8);
        let memory = Arc::new(Counting {
            topics: [EventTopic::Memory],
            seen: AtomicUsize::new(0),
        });
        let all = Arc::new(Counting {
            topics: [EventTopic::All],
            seen: AtomicUsize::new(0),
        });
        hub.subscribe(memory.clone());
        hub.subscribe(all.clone());
        hub.publish(pressure());
        hub.publish(SystemEvent::TopologyChanged { generation: 1, cores: 4 });
        assert_eq!(memory.seen.load(Ordering::Relaxed), 1);
        assert_eq!(all.seen.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_scheduler_events_map_across() {
        let e: SystemEvent = SchedEvent::AffinityOverridden {
            unit: UnitId(5),
            core: CoreId(1),
        }
        .into();
        assert_eq!(e.topic(), EventTopic::Scheduling);
    }
}
