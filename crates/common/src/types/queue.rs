use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::ProjectType;

/// In-queue envelope for one dispatched execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueuedTask {
    /// Execution id string — the idempotency key of the queue.
    pub task_id: String,
    /// Public project id.
    pub project_id: String,
    pub project_type: ProjectType,
    /// Lower value dequeues first.
    pub priority: i32,
    /// Unix seconds at enqueue; the FIFO tiebreak within a priority band.
    /// Preserved across priority updates.
    pub enqueue_time: f64,
    /// Opaque dispatch payload.
    #[serde(default)]
    pub data: Value,
}

/// Operation counters shared by both queue backends.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub cancelled: u64,
    pub priority_updates: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_errors: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_attempts: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_successes: Option<u64>,
}

/// Snapshot returned by TaskQueue::status.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueStatus {
    pub backend_type: String,
    /// -1 when the backend cannot be reached.
    pub queue_depth: i64,
    pub running: bool,
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub stats: QueueStats,
}
