use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::ids::TaskId;
use crate::types::ExecutionStrategy;

/// How a task's firings are scheduled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Standard 5-field cron expression.
    Cron,
    /// Fixed interval in seconds.
    Interval,
    /// Single run at a given instant.
    Date,
    /// Single run, immediately when no instant is given.
    Once,
}

impl ScheduleKind {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Cron => "cron",
            Self::Interval => "interval",
            Self::Date => "date",
            Self::Once => "once",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cron" => Some(Self::Cron),
            "interval" => Some(Self::Interval),
            "date" => Some(Self::Date),
            "once" => Some(Self::Once),
            _ => None,
        }
    }
}

/// Lifecycle states shared by tasks and their executions.
///
/// Executions move through Pending → Dispatching → Queued/Running and end in
/// one of the terminal states. Tasks additionally use Paused when their
/// trigger is disabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Paused,
    Dispatching,
    Queued,
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paused => "paused",
            Self::Dispatching => "dispatching",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "paused" => Some(Self::Paused),
            "dispatching" => Some(Self::Dispatching),
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "timeout" => Some(Self::Timeout),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// A task in one of these states has an execution in flight; a new
    /// trigger firing must be skipped.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Running | Self::Dispatching | Self::Queued)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }
}

/// A recurring or one-shot schedule over a project.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduledTask {
    #[serde(skip_serializing)]
    pub id: i64,
    pub public_id: TaskId,
    #[serde(skip_serializing)]
    pub project_id: i64,
    #[serde(skip_serializing)]
    pub user_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub schedule_kind: ScheduleKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub status: TaskStatus,
    /// Wall-clock limit enforced by the worker; the master falls back to
    /// its configured default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_seconds: Option<u64>,
    /// 0 is the highest priority band, 4 the lowest.
    pub priority: i32,
    #[serde(default)]
    pub execution_params: Map<String, Value>,
    #[serde(default)]
    pub environment_vars: HashMap<String, String>,
    /// Internal id of the node this task is pinned to, when any. The legacy
    /// node_id column maps onto this same slot.
    #[serde(skip_serializing)]
    pub specified_node_id: Option<i64>,
    /// Task-level override of the project's execution strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_strategy: Option<ExecutionStrategy>,
    pub success_count: i64,
    pub failure_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledTask {
    /// Effective priority, within the 0 (highest) ..= 4 (lowest) range.
    pub fn clamped_priority(&self) -> i32 {
        self.priority.clamp(0, 4)
    }
}
