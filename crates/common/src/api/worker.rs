//! Worker → master report payloads (authenticated per the node-auth
//! signature scheme) and the install-key handshake.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ExecutionId;
use crate::types::NodeCapabilities;

/// Which log stream a fragment belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    Output,
    Error,
}

impl LogType {
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Output => "output.log",
            Self::Error => "error.log",
        }
    }
}

/// POST /workers/report-log — single log fragment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReportLogRequest {
    pub execution_id: ExecutionId,
    #[serde(default = "default_log_type")]
    pub log_type: LogType,
    pub content: String,
}

fn default_log_type() -> LogType {
    LogType::Output
}

/// POST /workers/report-logs-batch — up to several hundred fragments.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReportLogsBatchRequest {
    pub logs: Vec<ReportLogRequest>,
}

/// POST /workers/report-task — terminal status of an execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReportTaskRequest {
    pub execution_id: ExecutionId,
    /// "success", "failed", "timeout" or "cancelled".
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// POST /workers/report-heartbeat — lightweight liveness refresh.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReportHeartbeatRequest {
    pub execution_id: ExecutionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

/// POST /workers/report-progress — richer checkpoint update.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReportProgressRequest {
    pub execution_id: ExecutionId,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_data: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_log_offset: Option<u64>,
}

/// POST /workers/generate-install-key response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallKeyResponse {
    pub install_key: String,
    pub expires_at: DateTime<Utc>,
}

/// POST /workers/register-by-key — consumes a one-shot install key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterByKeyRequest {
    pub install_key: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub machine_code: String,
    #[serde(default)]
    pub capabilities: NodeCapabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Credentials returned on a successful key claim.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterByKeyResponse {
    pub worker_id: String,
    pub api_key: String,
    pub secret_key: String,
}
