//! Small utilities shared across the node loop, p2p layer, and adapters.

pub mod correlation;
pub mod task;
pub mod timeout;

pub use correlation::CorrelationId;
pub use task::{spawn_tracked, TaskTracker, TaskType};
pub use timeout::{TimeoutExt, Timeouts};
