//! Error types for Strand operations

/// Result type for Strand operations
pub type Result<T> = std::result::Result<T, StrandError>;

/// Error types for the Strand framework
#[derive(Debug, thiserror::Error)]
pub enum StrandError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Task submission rejected because the pool's queue is at capacity
    #[error("Task queue for pool '{pool}' is full (limit {limit})")]
    QueueFull { pool: String, limit: usize },

    /// Task submission rejected because the pool has been shut down
    #[error("Pool '{0}' is shut down")]
    PoolShutDown(String),

    /// The service can no longer hand out its ambient executor
    #[error("Executor unavailable: {0}")]
    ExecutorUnavailable(String),
}
