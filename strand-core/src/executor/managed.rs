//! Managed executors: submission-time context capture over a work pool

use crate::config::ContextPolicy;
use crate::context::descriptor::ContextDescriptor;
use crate::context::provider::ContextProvider;
use crate::context::service::ProviderRegistry;
use crate::error::Result;
use crate::stage::{Failure, ManagedFuture};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::pool::WorkPool;

/// Process-wide sequence for default executor names.
static INSTANCE_COUNT: Lazy<AtomicU64> = Lazy::new(|| AtomicU64::new(0));

pub(crate) fn next_executor_name(max_concurrency: i64, max_queue_size: i64) -> String {
    let instance = INSTANCE_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
    format!("managed-executor-{max_concurrency}-{max_queue_size}-{instance}")
}

/// A task-submission surface that wraps every task with a context descriptor
/// captured from the submitting thread at submission time.
///
/// The executing worker swaps its ambient state for the captured descriptor
/// for the duration of the task, then swaps it back, so workers never carry
/// one task's context into the next.
pub struct ManagedExecutor {
    name: String,
    pool: WorkPool,
    registry: Arc<ProviderRegistry>,
}

impl ManagedExecutor {
    /// Start building an executor with explicit capacity and context policy.
    pub fn builder() -> ManagedExecutorBuilder {
        ManagedExecutorBuilder::new()
    }

    /// Create an unbounded executor over `registry`, named by the default
    /// naming scheme.
    pub(crate) fn unbounded(registry: Arc<ProviderRegistry>) -> Result<Arc<Self>> {
        let name = next_executor_name(-1, -1);
        let pool = WorkPool::new(name.clone(), -1, -1)?;
        Ok(Arc::new(Self {
            name,
            pool,
            registry,
        }))
    }

    /// Executor name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying pool.
    pub fn pool(&self) -> &WorkPool {
        &self.pool
    }

    /// Capture a descriptor from the current thread under this executor's
    /// context policy.
    pub(crate) fn capture_current(&self) -> Arc<ContextDescriptor> {
        self.registry.capture_default()
    }

    /// Submit without capture; the stage machinery wraps its own context.
    pub(crate) fn submit_raw<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.submit(task)
    }

    /// Run a task on the pool under the submitting thread's context.
    ///
    /// # Errors
    ///
    /// Propagates pool rejection (queue full or shut down); an admitted
    /// task's own failure is not reported through this path.
    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let descriptor = self.capture_current();
        tracing::trace!(executor = %self.name, "task submitted");
        self.pool.submit(move || {
            let _ctx = descriptor.establish();
            task();
        })
    }

    /// Run a task on the pool under the submitting thread's context,
    /// returning a stage that completes with the task's result.
    ///
    /// A panicking task fails the stage; the worker's context is restored
    /// either way.
    ///
    /// # Errors
    ///
    /// Propagates pool rejection (queue full or shut down).
    pub fn submit<T, F>(self: &Arc<Self>, task: F) -> Result<ManagedFuture<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let descriptor = self.capture_current();
        let stage = ManagedFuture::pending(self.clone());
        let completer = stage.clone();
        tracing::trace!(executor = %self.name, "task submitted");
        self.pool.submit(move || {
            let result = catch_unwind(AssertUnwindSafe(|| {
                let _ctx = descriptor.establish();
                task()
            }));
            match result {
                Ok(value) => completer.settle(Ok(value)),
                Err(payload) => completer.settle(Err(Failure::from_panic(payload.as_ref()))),
            };
        })?;
        Ok(stage)
    }

    /// Shut down the underlying pool. Idempotent.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    /// Shut down and wait up to `grace` for in-flight tasks to drain.
    pub async fn shutdown_graceful(&self, grace: std::time::Duration) -> bool {
        self.pool.shutdown_graceful(grace).await
    }
}

impl std::fmt::Debug for ManagedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedExecutor")
            .field("name", &self.name)
            .field("pool", &self.pool)
            .finish()
    }
}

/// Builder for [`ManagedExecutor`].
///
/// Capacity bounds default to unbounded (`-1`); context types default to the
/// cleared policy unless named in `propagated`.
pub struct ManagedExecutorBuilder {
    name: Option<String>,
    max_concurrency: i64,
    max_queue_size: i64,
    providers: Vec<Arc<dyn ContextProvider>>,
    policies: BTreeMap<String, ContextPolicy>,
    default_policy: ContextPolicy,
}

impl ManagedExecutorBuilder {
    /// Create a builder with unbounded capacity and no context types.
    pub fn new() -> Self {
        Self {
            name: None,
            max_concurrency: -1,
            max_queue_size: -1,
            providers: Vec::new(),
            policies: BTreeMap::new(),
            default_policy: ContextPolicy::Cleared,
        }
    }

    /// Set the executor name. Defaults to the
    /// `managed-executor-<concurrency>-<queue>-<n>` scheme.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Maximum concurrently-running tasks; `-1` for unbounded.
    pub fn max_concurrency(mut self, max: i64) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Maximum admitted-but-unstarted tasks; `-1` for unbounded.
    pub fn max_queue_size(mut self, max: i64) -> Self {
        self.max_queue_size = max;
        self
    }

    /// Register a context provider with this executor.
    pub fn provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Mark context types as propagated.
    pub fn propagated(mut self, types: &[&str]) -> Self {
        for name in types {
            self.policies
                .insert((*name).to_string(), ContextPolicy::Propagated);
        }
        self
    }

    /// Mark context types as cleared.
    pub fn cleared(mut self, types: &[&str]) -> Self {
        for name in types {
            self.policies
                .insert((*name).to_string(), ContextPolicy::Cleared);
        }
        self
    }

    /// Mark context types as left unchanged on the executing thread.
    pub fn unchanged(mut self, types: &[&str]) -> Self {
        for name in types {
            self.policies
                .insert((*name).to_string(), ContextPolicy::Unchanged);
        }
        self
    }

    /// Build the executor.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for duplicate provider names, invalid
    /// capacity bounds, or construction outside a Tokio runtime.
    pub fn build(self) -> Result<Arc<ManagedExecutor>> {
        let registry = Arc::new(ProviderRegistry::new(
            self.providers,
            &self.policies,
            self.default_policy,
        )?);

        let name = self
            .name
            .unwrap_or_else(|| next_executor_name(self.max_concurrency, self.max_queue_size));
        let pool = WorkPool::new(name.clone(), self.max_concurrency, self.max_queue_size)?;

        tracing::debug!(executor = %name, "created managed executor");
        Ok(Arc::new(ManagedExecutor {
            name,
            pool,
            registry,
        }))
    }
}

impl Default for ManagedExecutorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
