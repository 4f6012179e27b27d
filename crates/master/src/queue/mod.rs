mod memory;
mod redis_backend;

pub use memory::MemoryQueueBackend;
pub use redis_backend::RedisQueueBackend;

use async_trait::async_trait;
use serde_json::Value;

use antcode_common::types::{ProjectType, QueueStatus, QueuedTask};

/// Pluggable FIFO-with-priority store of dispatched tasks.
///
/// Both backends keep the same ordering contract: dequeue returns the entry
/// with the lowest `(priority, enqueue_time)`; a priority update preserves
/// the original enqueue time so the entry does not leapfrog equally
/// prioritized earlier arrivals.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn start(&self) -> Result<(), QueueError>;

    async fn stop(&self) -> Result<(), QueueError>;

    /// Idempotent by task id: a duplicate enqueue returns false and leaves
    /// the existing entry untouched.
    async fn enqueue(
        &self,
        task_id: &str,
        project_id: &str,
        priority: i32,
        data: Value,
        project_type: ProjectType,
    ) -> Result<bool, QueueError>;

    /// Remove and return the head entry; None when empty.
    async fn dequeue(&self) -> Result<Option<QueuedTask>, QueueError>;

    /// Remove a specific entry if present.
    async fn cancel(&self, task_id: &str) -> Result<bool, QueueError>;

    /// Change an entry's priority, keeping its enqueue time.
    async fn update_priority(&self, task_id: &str, new_priority: i32) -> Result<bool, QueueError>;

    /// Non-destructive view of the head.
    async fn peek(&self) -> Result<Option<QueuedTask>, QueueError>;

    async fn contains(&self, task_id: &str) -> bool;

    async fn size(&self) -> usize;

    async fn status(&self) -> QueueStatus;

    /// Drop every entry, returning how many were removed.
    async fn clear(&self) -> Result<usize, QueueError>;
}

/// Build the configured backend. The only place that knows which
/// implementations exist.
pub async fn create_backend(
    backend: &str,
    redis_url: &str,
) -> Result<Box<dyn TaskQueue>, QueueError> {
    match backend {
        "redis" => {
            let queue = RedisQueueBackend::connect(redis_url).await?;
            Ok(Box::new(queue))
        }
        _ => Ok(Box::new(MemoryQueueBackend::new())),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Connection-class failure after reconnect attempts were exhausted.
    /// The dispatcher treats this as "queue unavailable, task not
    /// dispatched".
    #[error("Queue connection error: {0}")]
    Connection(String),

    #[error("Queue operation error: {0}")]
    Operation(String),
}

impl From<QueueError> for antcode_common::AntCodeError {
    fn from(e: QueueError) -> Self {
        antcode_common::AntCodeError::QueueUnavailable(e.to_string())
    }
}

/// Unix seconds with sub-second precision; the FIFO tiebreak.
pub(crate) fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
