//! Managed task execution
//!
//! [`WorkPool`] is the capacity-policed submission primitive;
//! [`ManagedExecutor`] layers submission-time context capture on top of it.

pub mod managed;
pub mod pool;

pub use managed::{ManagedExecutor, ManagedExecutorBuilder};
pub use pool::WorkPool;
