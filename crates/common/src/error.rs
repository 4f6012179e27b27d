use thiserror::Error;

/// Top-level error type for AntCode master operations.
#[derive(Debug, Error)]
pub enum AntCodeError {
    // --- Request-level errors (rejected at the API boundary) ---
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // --- Dispatch-path errors (converted to execution outcomes) ---
    #[error("Node unavailable: {0}")]
    NodeUnavailable(String),

    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Worker rejected task: {0}")]
    WorkerRejected(String),

    #[error("Execution timed out: {0}")]
    ExecutionTimeout(String),

    #[error("Execution interrupted: {0}")]
    Interrupted(String),

    #[error("Retries exhausted: {0}")]
    RetryExhausted(String),

    // --- Infrastructure errors (bubble to the HTTP layer as 5xx) ---
    #[error("Database error: {0}")]
    Database(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl AntCodeError {
    /// Whether a failed execution with this error kind may be retried.
    ///
    /// `NodeUnavailable` is non-retryable: the fixed/specified strategies
    /// must not silently fall back to another node. `WorkerRejected` means
    /// the envelope itself is bad and will be rejected again.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Validation(_)
                | Self::Conflict(_)
                | Self::Permission(_)
                | Self::NotFound(_)
                | Self::NodeUnavailable(_)
                | Self::WorkerRejected(_)
        )
    }

    /// Whether this error is an infrastructure failure (database, cache)
    /// rather than a per-request outcome.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Cache(_) | Self::Config(_))
    }
}

/// Result type alias for AntCode operations.
pub type Result<T> = std::result::Result<T, AntCodeError>;
