//! Context capture, descriptors, and propagation
//!
//! The flow: a [`ContextService`] holds an immutable policy per registered
//! context type; [`ContextService::capture`] snapshots the calling thread
//! into a [`ContextDescriptor`]; wrappers and executors carry the descriptor
//! to wherever the work runs and establish it there for exactly the duration
//! of the body, restoring the worker's own state afterwards.

pub mod contextual;
pub mod descriptor;
pub mod provider;
pub mod service;

pub use contextual::Contextual;
pub use descriptor::{ContextDescriptor, ContextGuard};
pub use provider::{ContextCapture, ContextProvider, PriorContext, ThreadStateProvider};
pub use service::{ContextService, ContextServiceBuilder, CurrentContextExecutor};
