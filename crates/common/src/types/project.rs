use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ProjectId;

/// Project variants. The variant decides how the artifact is transferred to
/// a node and how it is executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectType {
    /// Declarative scrape spec executed by the rule engine.
    Rule,
    /// Archive of code files, optionally compressed.
    File,
    /// Single inline source string.
    Code,
}

impl ProjectType {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Rule => "rule",
            Self::File => "file",
            Self::Code => "code",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rule" => Some(Self::Rule),
            "file" => Some(Self::File),
            "code" => Some(Self::Code),
            _ => None,
        }
    }

    /// Default queue priority when the task does not set one. Rule tasks
    /// jump ahead of bulk code/file runs.
    pub fn default_priority(&self) -> i32 {
        match self {
            Self::Rule => 1,
            Self::Code | Self::File => 2,
        }
    }
}

/// Where an execution of this project is routed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Run on the master process itself.
    Local,
    /// Only the project's bound node; fail if it is not online.
    FixedNode,
    /// Only the task's specified node; fail if it is not online.
    Specified,
    /// Best node by load score, falling back to local when none qualifies.
    AutoSelect,
    /// Bound node first, balancer fallback when enabled.
    PreferBound,
}

impl ExecutionStrategy {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::FixedNode => "fixed_node",
            Self::Specified => "specified",
            Self::AutoSelect => "auto_select",
            Self::PreferBound => "prefer_bound",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "fixed_node" => Some(Self::FixedNode),
            "specified" => Some(Self::Specified),
            "auto_select" => Some(Self::AutoSelect),
            "prefer_bound" => Some(Self::PreferBound),
            _ => None,
        }
    }
}

/// Engine used by a rule project.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlEngine {
    #[default]
    Http,
    /// Headless browser; requires a node with render capability.
    Browser,
}

/// URL-pattern pagination of a rule project.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaginationConfig {
    /// "url_pattern" is the only method the master expands itself.
    pub method: String,
    #[serde(default = "default_start_page")]
    pub start_page: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

fn default_start_page() -> u32 {
    1
}

fn default_max_pages() -> u32 {
    10
}

/// Declarative scrape spec.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuleSpec {
    pub target_url: String,
    #[serde(default)]
    pub engine: CrawlEngine,
    /// Field selectors, passed through to the rule engine untouched.
    #[serde(default)]
    pub selectors: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PaginationConfig>,
}

/// Archive of code files stored on the master.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileSpec {
    /// Path of the archive relative to the file storage root.
    pub archive_path: String,
    pub original_name: String,
    pub file_hash: String,
    pub file_size: u64,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
}

/// Single inline source string.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CodeSpec {
    pub source: String,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
}

/// Variant-specific project content.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProjectSpec {
    Rule(RuleSpec),
    File(FileSpec),
    Code(CodeSpec),
}

impl ProjectSpec {
    pub fn project_type(&self) -> ProjectType {
        match self {
            Self::Rule(_) => ProjectType::Rule,
            Self::File(_) => ProjectType::File,
            Self::Code(_) => ProjectType::Code,
        }
    }

    /// Content hash embedded in the spec itself. Code projects hash their
    /// source at write time; the project row carries the result.
    pub fn content_hash(&self) -> Option<&str> {
        match self {
            Self::Rule(_) | Self::Code(_) => None,
            Self::File(f) => Some(&f.file_hash),
        }
    }

    pub fn entry_point(&self) -> Option<&str> {
        match self {
            Self::Rule(_) => None,
            Self::File(f) => f.entry_point.as_deref(),
            Self::Code(c) => c.entry_point.as_deref(),
        }
    }

    /// Whether executing this project needs a browser-capable node.
    pub fn requires_render(&self) -> bool {
        matches!(self, Self::Rule(r) if r.engine == CrawlEngine::Browser)
    }
}

/// A deployable unit owned by a user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Project {
    /// Internal row id, used for joins; never leaves the process.
    #[serde(skip_serializing)]
    pub id: i64,
    pub public_id: ProjectId,
    #[serde(skip_serializing)]
    pub user_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub spec: ProjectSpec,
    /// Authoritative version identifier of the artifact (file/code only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    /// Affinity hint: internal id of the node this project is bound to.
    #[serde(skip_serializing)]
    pub bound_node_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_strategy: Option<ExecutionStrategy>,
    /// Whether prefer-bound may fall back to another node.
    #[serde(default)]
    pub fallback_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn project_type(&self) -> ProjectType {
        self.spec.project_type()
    }
}
