use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::NodeId;

/// Registered worker lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
    /// Administratively drained; never selected for dispatch.
    Maintenance,
}

impl NodeStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Maintenance => "maintenance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            "maintenance" => Some(Self::Maintenance),
            _ => None,
        }
    }
}

/// Runtime metrics pushed by the node and refreshed by probes.
///
/// Field names follow the node agent's JSON payload.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetrics {
    /// CPU utilisation percentage, 0-100.
    #[serde(default)]
    pub cpu: f64,
    /// Memory utilisation percentage, 0-100.
    #[serde(default)]
    pub memory: f64,
    #[serde(default)]
    pub running_tasks: u32,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: u32,
    /// Historical success percentage, 0-100.
    #[serde(default = "default_success_rate")]
    pub success_rate: f64,
}

fn default_max_concurrent() -> u32 {
    5
}

fn default_success_rate() -> f64 {
    100.0
}

/// A single declared capability, e.g. the browser-render engine.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Capability {
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Declared node capabilities.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeCapabilities {
    /// Headless-browser rendering for scrape rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render: Option<Capability>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl NodeCapabilities {
    pub fn has_render(&self) -> bool {
        self.render.as_ref().is_some_and(|c| c.enabled)
    }
}

/// Per-node overrides of the default resource guards.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_tasks: Option<u32>,
}

/// A registered worker node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    #[serde(skip_serializing)]
    pub id: i64,
    pub public_id: NodeId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub capabilities: NodeCapabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<NodeMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Bearer credential for calls to the node and from it.
    #[serde(skip_serializing)]
    pub api_key: String,
    /// HMAC secret for worker report signatures.
    #[serde(skip_serializing)]
    pub secret_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_limits: Option<ResourceLimits>,
    /// Hardware fingerprint binding the node identity to one host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Node {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Effective concurrency cap, honoring the per-node override.
    pub fn max_concurrent_tasks(&self) -> u32 {
        self.resource_limits
            .as_ref()
            .and_then(|l| l.max_concurrent_tasks)
            .or_else(|| self.metrics.as_ref().map(|m| m.max_concurrent_tasks))
            .unwrap_or(5)
    }
}

/// Cluster-wide aggregation for the stats endpoint.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeAggregateStats {
    pub total: u64,
    pub online: u64,
    pub offline: u64,
    pub maintenance: u64,
    pub suspended: u64,
    pub total_running_tasks: u64,
    pub total_capacity: u64,
}
