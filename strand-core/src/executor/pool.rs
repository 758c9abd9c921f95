//! Capacity-policed task submission over the Tokio blocking pool
//!
//! [`WorkPool`] is the worker-pool primitive managed executors are built on:
//! a submission surface with configurable maximum concurrency and maximum
//! queue depth (`-1` meaning unbounded for either), and an idempotent
//! shutdown that drops queued-but-unstarted tasks while letting in-flight
//! tasks run to completion.

use crate::error::{Result, StrandError};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;

/// Queue and in-flight occupancy of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PoolCounts {
    queued: usize,
    running: usize,
}

/// A capacity-configurable task-submission service.
///
/// Tasks are plain `FnOnce()` closures executed on Tokio's blocking-thread
/// pool; each admitted task occupies one queue slot until it acquires a
/// concurrency permit and starts running. Construction requires an ambient
/// Tokio runtime; submission does not.
pub struct WorkPool {
    name: String,
    max_queue_size: Option<usize>,
    permits: Option<Arc<Semaphore>>,
    counts: Arc<watch::Sender<PoolCounts>>,
    shutdown: CancellationToken,
    runtime: Handle,
}

impl WorkPool {
    /// Create a pool. `max_concurrency` and `max_queue_size` are capacity
    /// bounds; a negative value means unbounded, zero is rejected.
    pub fn new(name: impl Into<String>, max_concurrency: i64, max_queue_size: i64) -> Result<Self> {
        let name = name.into();
        if max_concurrency == 0 || max_queue_size == 0 {
            return Err(StrandError::Configuration(format!(
                "Pool '{}' capacity bounds must be positive or -1 for unbounded",
                name
            )));
        }
        let runtime = Handle::try_current().map_err(|_| {
            StrandError::Configuration(format!(
                "Pool '{}' must be created within a Tokio runtime",
                name
            ))
        })?;

        let max_concurrency = usize::try_from(max_concurrency).ok();
        let max_queue_size = usize::try_from(max_queue_size).ok();
        let (counts, _) = watch::channel(PoolCounts::default());

        tracing::debug!(
            pool = %name,
            max_concurrency = ?max_concurrency,
            max_queue_size = ?max_queue_size,
            "created work pool"
        );

        Ok(Self {
            name,
            max_queue_size,
            permits: max_concurrency.map(|n| Arc::new(Semaphore::new(n))),
            counts: Arc::new(counts),
            shutdown: CancellationToken::new(),
            runtime,
        })
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of admitted tasks not yet running.
    pub fn queued(&self) -> usize {
        self.counts.borrow().queued
    }

    /// Number of tasks currently running.
    pub fn running(&self) -> usize {
        self.counts.borrow().running
    }

    /// Whether the pool has been shut down.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Submit a task for execution.
    ///
    /// # Errors
    ///
    /// [`StrandError::PoolShutDown`] after [`shutdown`](Self::shutdown);
    /// [`StrandError::QueueFull`] once `max_queue_size` admitted tasks are
    /// waiting to start.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(StrandError::PoolShutDown(self.name.clone()));
        }

        // Queue admission is a check-and-increment under the watch lock so
        // concurrent submitters cannot overshoot the bound.
        let mut admitted = true;
        self.counts.send_modify(|c| {
            match self.max_queue_size {
                Some(limit) if c.queued >= limit => admitted = false,
                _ => c.queued += 1,
            }
        });
        if !admitted {
            let limit = self.max_queue_size.unwrap_or_default();
            tracing::debug!(pool = %self.name, limit, "submission rejected, queue full");
            return Err(StrandError::QueueFull {
                pool: self.name.clone(),
                limit,
            });
        }

        let counts = Arc::clone(&self.counts);
        let permits = self.permits.clone();
        let token = self.shutdown.clone();
        let pool = self.name.clone();

        self.runtime.spawn(async move {
            let permit = match &permits {
                Some(semaphore) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            // Dropped before starting; the task never runs.
                            counts.send_modify(|c| c.queued -= 1);
                            tracing::trace!(pool = %pool, "queued task dropped on shutdown");
                            return;
                        }
                        permit = Arc::clone(semaphore).acquire_owned() => {
                            match permit {
                                Ok(p) => Some(p),
                                Err(_) => {
                                    counts.send_modify(|c| c.queued -= 1);
                                    return;
                                }
                            }
                        }
                    }
                }
                None => {
                    if token.is_cancelled() {
                        counts.send_modify(|c| c.queued -= 1);
                        return;
                    }
                    None
                }
            };

            counts.send_modify(|c| {
                c.queued -= 1;
                c.running += 1;
            });

            let joined = tokio::task::spawn_blocking(task).await;

            drop(permit);
            counts.send_modify(|c| c.running -= 1);

            if let Err(e) = joined {
                if e.is_panic() {
                    tracing::warn!(pool = %pool, "task panicked");
                }
            }
        });

        Ok(())
    }

    /// Shut the pool down. Idempotent; queued tasks that have not started
    /// are dropped, in-flight tasks run to completion.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::debug!(pool = %self.name, "shutting down work pool");
            self.shutdown.cancel();
        }
    }

    /// Shut down and wait up to `grace` for queued and in-flight tasks to
    /// drain. Returns `true` if the pool went idle within the grace period.
    pub async fn shutdown_graceful(&self, grace: std::time::Duration) -> bool {
        self.shutdown();
        let mut rx = self.counts.subscribe();
        tokio::time::timeout(grace, async {
            let _ = rx
                .wait_for(|c| c.queued == 0 && c.running == 0)
                .await;
        })
        .await
        .is_ok()
    }
}

impl std::fmt::Debug for WorkPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkPool")
            .field("name", &self.name)
            .field("max_queue_size", &self.max_queue_size)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
