//! # Strand - Thread-Context Propagation for Managed Execution
//!
//! Strand captures the ambient execution context (identity, locale,
//! transaction association - any pluggable context type) at the point a unit
//! of work is scheduled, and restores it deterministically when the work
//! later runs:
//! - Immutable context snapshots, safely shared across threads
//! - Guaranteed save/restore around every execution, so workers are never
//!   left contaminated
//! - Managed executors that capture at submission time, not construction time
//! - Asynchronous stages whose continuations run under the context captured
//!   at registration time, not completion time
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use strand_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let identity = Arc::new(ThreadStateProvider::new("identity"));
//!     let service = ContextService::builder()
//!         .provider(identity.clone())
//!         .policy("identity", ContextPolicy::Propagated)
//!         .build()?;
//!
//!     identity.set("alice".to_string());
//!     let executor = service.ambient_executor()?;
//!     let inner = identity.clone();
//!     let stage = executor.submit(move || inner.get())?;
//!     assert_eq!(stage.outcome().await.unwrap(), Some("alice".to_string()));
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **Context providers**: the pluggable capture/establish/restore seam
//! - **Descriptors**: immutable snapshots established around task bodies
//! - **Managed executors**: submission-time capture over a bounded or
//!   unbounded work pool
//! - **Stages**: chained continuations, each with its own captured context

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod stage;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ContextPolicy, ContextServiceConfig};
    pub use crate::context::{
        ContextDescriptor, ContextProvider, ContextService, Contextual, CurrentContextExecutor,
        ThreadStateProvider,
    };
    pub use crate::error::{Result, StrandError};
    pub use crate::executor::{ManagedExecutor, ManagedExecutorBuilder, WorkPool};
    pub use crate::stage::{Failure, ManagedFuture, Outcome};
}
