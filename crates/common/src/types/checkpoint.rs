use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{ExecutionId, NodeId, TaskId};

/// Checkpoint lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointState {
    Pending,
    Running,
    /// Snapshot saved; the execution can be resumed from it.
    Checkpointed,
    Completed,
    Failed,
    /// Consumed by recovery; a fresh execution carries the resume payload.
    Recovered,
}

/// Per-execution progress snapshot.
///
/// Stored redundantly: the authoritative copy lives inside the execution
/// row's result_data, a fast copy in the unified cache.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub execution_id: ExecutionId,
    pub task_id: i64,
    pub task_public_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub state: CheckpointState,
    /// Progress in [0, 1].
    pub progress: f64,
    /// Arbitrary resume data owned by the executing side.
    #[serde(default)]
    pub checkpoint_data: Map<String, Value>,
    /// Byte offset of the last log line the master has seen.
    #[serde(default)]
    pub last_log_offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    /// Recovery attempts so far.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Checkpoint {
    pub fn new(execution_id: ExecutionId, task_id: i64, task_public_id: TaskId) -> Self {
        Self {
            execution_id,
            task_id,
            task_public_id,
            node_id: None,
            state: CheckpointState::Pending,
            progress: 0.0,
            checkpoint_data: Map::new(),
            last_log_offset: 0,
            started_at: None,
            last_checkpoint_at: None,
            retry_count: 0,
            error_message: None,
        }
    }

    pub fn clamp_progress(&mut self) {
        self.progress = self.progress.clamp(0.0, 1.0);
    }

    /// Resume payload injected into a recovered task's execution params.
    pub fn resume_params(&self) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("_resume".into(), Value::Bool(true));
        params.insert(
            "_checkpoint".into(),
            Value::Object(self.checkpoint_data.clone()),
        );
        params.insert("_progress".into(), self.progress.into());
        params.insert("_last_log_offset".into(), self.last_log_offset.into());
        params.insert(
            "_previous_execution_id".into(),
            Value::String(self.execution_id.to_string()),
        );
        params
    }
}
