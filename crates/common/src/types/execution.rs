use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ExecutionId;
use crate::types::TaskStatus;

/// One attempt of a scheduled task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskExecution {
    #[serde(skip_serializing)]
    pub id: i64,
    pub execution_id: ExecutionId,
    #[serde(skip_serializing)]
    pub task_id: i64,
    pub status: TaskStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_log_path: Option<String>,
    /// Refreshed by worker heartbeats; staleness drives interruption
    /// detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Structured result, also the carrier of the embedded checkpoint blob
    /// under the "checkpoint" key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TaskExecution {
    /// Whether this execution was handed to a node and is awaiting the
    /// node's terminal report.
    pub fn is_distributed_pending(&self) -> bool {
        !self.status.is_terminal()
            && self
                .result_data
                .as_ref()
                .and_then(|d| d.get("distributed"))
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }
}

/// Structured outcome of one execution branch (local run, rule submission
/// or distributed dispatch). The scheduler converges these into terminal
/// execution states.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    /// Set when the task was handed to a node and the real terminal state
    /// will arrive via a worker report.
    #[serde(default)]
    pub distributed: bool,
    #[serde(default)]
    pub pending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Which phase produced the failure ("resolve", "sync", "dispatch",
    /// "execute").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_task_id: Option<String>,
    /// Whether the artifact transfer was skipped because the node already
    /// had the current version.
    #[serde(default)]
    pub transfer_skipped: bool,
}

impl ExecutionOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn failure(phase: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            phase: Some(phase.to_string()),
            ..Self::default()
        }
    }

    /// Dispatch succeeded; the execution is now queued on a node.
    pub fn distributed_pending(node_id: String, node_name: String, remote_task_id: String) -> Self {
        Self {
            success: true,
            distributed: true,
            pending: true,
            message: Some(format!("task handed to node {}", node_name)),
            node_id: Some(node_id),
            node_name: Some(node_name),
            remote_task_id: Some(remote_task_id),
            ..Self::default()
        }
    }
}
