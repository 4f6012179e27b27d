//! Master → node wire payloads: probes, the connect handshake, artifact
//! sync and the batch dispatch channel.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::types::{NodeMetrics, ProjectType};

/// GET {node}/node/info response — identity and live metrics.
#[derive(Clone, Debug, Deserialize)]
pub struct NodeInfoResponse {
    #[serde(default)]
    pub machine_code: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub metrics: Option<NodeMetrics>,
    #[serde(default)]
    pub system: Option<NodeSystemInfo>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NodeSystemInfo {
    #[serde(default)]
    pub os_type: Option<String>,
    #[serde(default)]
    pub os_version: Option<String>,
}

/// POST {node}/node/connect/v2 — tells the node where to push reports.
#[derive(Clone, Debug, Serialize)]
pub struct NodeConnectRequest {
    pub machine_code: String,
    pub api_key: String,
    pub master_url: String,
    pub node_id: String,
    pub secret_key: String,
    /// Hint that the node may upgrade the report channel to a websocket.
    pub use_websocket: bool,
}

/// Inline transfer of a code project, POST {node}/projects/code.
#[derive(Clone, Debug, Serialize)]
pub struct CodePushRequest {
    pub name: String,
    pub code_content: String,
    pub language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    pub master_project_id: String,
}

/// Pull-style sync of an archived project, POST {node}/projects/sync-from-master.
#[derive(Clone, Debug, Serialize)]
pub struct ArchiveSyncRequest {
    pub project_id: String,
    pub name: String,
    pub download_url: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    pub transfer_method: String,
    pub file_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    pub api_key: String,
}

/// One task in a dispatch batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskEnvelope {
    /// Execution id; the node's queue is keyed by it.
    pub task_id: String,
    pub project_id: String,
    pub project_type: ProjectType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    pub timeout: u64,
    #[serde(default)]
    pub require_render: bool,
    // Self-service re-sync metadata: the worker can fetch the artifact on
    // its own if its local copy was evicted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
}

/// POST {node}/queue/batch request body.
#[derive(Clone, Debug, Serialize)]
pub struct QueueBatchRequest {
    pub tasks: Vec<TaskEnvelope>,
    pub node_id: String,
    pub batch_id: String,
}

/// Envelope the node wraps around queue responses.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NodeResponse<T> {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<T>,
}

/// Per-batch accept/reject result from the node's queue.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct QueueBatchData {
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub accepted_count: Option<usize>,
    #[serde(default)]
    pub rejected_count: usize,
    #[serde(default)]
    pub accepted_tasks: Vec<String>,
    #[serde(default)]
    pub rejected_tasks: Vec<RejectedTask>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RejectedTask {
    pub task_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// PUT {node}/queue/tasks/{id}/priority response data.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PriorityUpdateData {
    #[serde(default)]
    pub new_priority: Option<i32>,
    #[serde(default)]
    pub new_position: Option<usize>,
}
