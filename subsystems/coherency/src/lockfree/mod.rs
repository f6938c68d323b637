//! Lock-free primitives for run-queues and free-lists.
//!
//! | Type               | Progress   |
//! |--------------------|------------|
//! | [`BoundedQueue`]   | lock-free  |
//! | [`BoundedStack`]   | lock-free  |
//! | [`AtomicCounter`]  | wait-free  |
//! | [`PerCoreCounter`] | wait-free  |

mod counter;
mod queue;
mod stack;

pub use counter::{AtomicCounter, PerCoreCounter};
pub use queue::BoundedQueue;
pub use stack::BoundedStack;
