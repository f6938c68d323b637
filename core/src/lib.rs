//! # Helix Core
//!
//! Integration facade of the many-core scaling subsystem. It wires the
//! topology model, the NUMA memory manager, the virtual memory manager, the
//! scheduler and the performance monitor into one object with one
//! lifecycle, one configuration surface, one error type and one event
//! stream.
//!
//! ## Components
//!
//! - **ScaleSubsystem**: Init, periodic tick, hot-plug and shutdown
//! - **ScaleConfig**: Configuration surface and derived component configs
//! - **SystemEvent**: Deadline misses, regressions, throttling, false
//!   sharing, pressure steps and applied tuning
//! - **Tuning router**: Turns monitor directives into component retuning
//!
//! ## Example
//!
//! ```ignore
//! let (platform, counters) = Platform::software();
//! let scale = ScaleSubsystem::boot(ScaleConfig::new(), &probe, platform)?;
//! let core = scale.enqueue(Arc::new(UnitDescriptor::batch(1)), now)?;
//! scale.tick(now)?;
//! for event in scale.drain_events() { /* ... */ }
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(test)]
extern crate std;

// =============================================================================
// SUBMODULES
// =============================================================================

pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod platform;
pub mod subsystem;
pub mod tuning;

// =============================================================================
// RE-EXPORTS
// =============================================================================

pub use config::{ConfigError, ScaleConfig};
pub use error::{ScaleError, ScaleResult};
pub use events::{EventHub, EventTopic, SystemEvent, SystemEventListener};
pub use lifecycle::SubsystemState;
pub use platform::Platform;
pub use subsystem::{ScaleSubsystem, TickSummary, BACKGROUND_INTERVAL_NS, EVENT_CAPACITY};
pub use tuning::TUNING_RANGE;

pub use helix_coherency as coherency;
pub use helix_execution as execution;
pub use helix_memory as memory;
pub use helix_numa as numa;
pub use helix_perf as perf;
pub use helix_topology as topology;

/// Subsystem version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
