use serde::{Deserialize, Serialize};

/// Top-level master configuration, deserialized from master.toml.
///
/// Connection URLs (database, Redis) come from the environment so that the
/// same file works across deployments.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MasterConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub balancer: BalancerConfig,
    #[serde(default)]
    pub retry: RetryDefaults,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub node_auth: NodeAuthConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            scheduler: SchedulerConfig::default(),
            queue: QueueConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            balancer: BalancerConfig::default(),
            retry: RetryDefaults::default(),
            checkpoint: CheckpointConfig::default(),
            node_auth: NodeAuthConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

/// HTTP server and filesystem layout.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port the master listens on.
    pub port: u16,
    /// Externally reachable base URL, advertised to worker nodes so they
    /// know where to push logs and status reports.
    pub master_url: String,
    /// Directory for per-execution log files.
    pub logs_dir: String,
    /// Directory for local-execution workspaces.
    pub workspace_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            master_url: "http://localhost:8000".into(),
            logs_dir: "data/logs".into(),
            workspace_dir: "data/workspaces".into(),
        }
    }
}

/// Scheduler limits and housekeeping cadence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Semaphore size capping concurrently running executions.
    pub max_concurrent_tasks: usize,
    /// Default per-execution timeout when the task does not set one.
    pub default_timeout_seconds: u64,
    /// Default delay before a retry when the task does not set one.
    pub default_retry_delay_seconds: u64,
    /// Local-execution workspaces older than this are removed by the
    /// nightly cleanup job.
    pub cleanup_max_age_hours: u64,
    /// Interval of the monitoring-stream consolidation job.
    pub monitor_stream_interval_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            default_timeout_seconds: 3600,
            default_retry_delay_seconds: 60,
            cleanup_max_age_hours: 72,
            monitor_stream_interval_seconds: 30,
        }
    }
}

/// Which task-queue backend the master runs with.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// "memory" for a single master, "redis" to share the backlog
    /// between masters.
    pub backend: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: "memory".into(),
        }
    }
}

/// Adaptive node heartbeat parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Probe interval for online nodes, also the tick period.
    pub base_interval_seconds: u64,
    /// Per-probe HTTP timeout.
    pub probe_timeout_seconds: u64,
    /// Back-off cap for failing nodes.
    pub max_interval_seconds: u64,
    /// Consecutive failures after which automatic probing is suspended.
    pub max_failures: u32,
    /// A node whose pushed heartbeat is older than this is offline even if
    /// pull probes succeed.
    pub push_timeout_seconds: i64,
    /// Registry cache TTL before a lazy refresh from the database.
    pub cache_ttl_seconds: u64,
    /// Upper bound on concurrent probes in one tick.
    pub probe_concurrency: usize,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            base_interval_seconds: 3,
            probe_timeout_seconds: 2,
            max_interval_seconds: 60,
            max_failures: 5,
            push_timeout_seconds: 60,
            cache_ttl_seconds: 300,
            probe_concurrency: 16,
        }
    }
}

/// Load balancer guards and latency refresh cadence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Nodes at or above this CPU percentage are filtered out.
    pub max_cpu_percent: f64,
    /// Nodes at or above this memory percentage are filtered out.
    pub max_memory_percent: f64,
    /// Nodes running at or above this fraction of their concurrency cap
    /// are filtered out.
    pub max_tasks_ratio: f64,
    /// Minimum seconds between latency probes of the same node.
    pub latency_refresh_seconds: u64,
    /// Latency probe HTTP timeout.
    pub probe_timeout_seconds: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            max_cpu_percent: 90.0,
            max_memory_percent: 90.0,
            max_tasks_ratio: 0.8,
            latency_refresh_seconds: 60,
            probe_timeout_seconds: 5,
        }
    }
}

/// Default retry parameters; per-task settings override these.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryDefaults {
    pub max_retries: u32,
    /// Base delay in seconds.
    pub base_delay_seconds: u64,
    /// Cap on the computed delay.
    pub max_delay_seconds: u64,
    /// Multiplier for the exponential strategy.
    pub multiplier: f64,
    /// Whether to add ±10% random jitter to computed delays.
    pub jitter: bool,
    /// "fixed", "linear" or "exponential".
    pub strategy: String,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_seconds: 60,
            max_delay_seconds: 3600,
            multiplier: 2.0,
            jitter: true,
            strategy: "exponential".into(),
        }
    }
}

/// Checkpoint persistence and recovery thresholds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// TTL of the fast-path cache copy.
    pub cache_ttl_seconds: u64,
    /// A running execution with no heartbeat for this long is interrupted.
    pub interrupted_threshold_minutes: i64,
    /// Recommended worker heartbeat cadence, advertised in envelopes.
    pub heartbeat_interval_seconds: u64,
    /// Recovery attempts per execution before giving up.
    pub max_recovery_retries: u32,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: 86_400,
            interrupted_threshold_minutes: 2,
            heartbeat_interval_seconds: 30,
            max_recovery_retries: 3,
        }
    }
}

/// Worker-report authentication parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeAuthConfig {
    /// Allowed clock skew on X-Timestamp, seconds.
    pub timestamp_tolerance_seconds: i64,
    /// Sliding window during which a nonce may not repeat, seconds.
    pub nonce_window_seconds: u64,
    /// Cap on remembered nonces (evicted oldest-first).
    pub max_nonces: usize,
    /// Per-node request budget within the rate window.
    pub rate_limit_requests: u32,
    pub rate_limit_window_seconds: u64,
    /// Install key lifetime.
    pub install_key_ttl_seconds: i64,
    /// Failed claim attempts per (key, source) before a temporary block.
    pub install_key_max_failures: u32,
    /// Block duration once the failure threshold is reached.
    pub install_key_block_seconds: u64,
}

impl Default for NodeAuthConfig {
    fn default() -> Self {
        Self {
            timestamp_tolerance_seconds: 300,
            nonce_window_seconds: 600,
            max_nonces: 10_000,
            rate_limit_requests: 1000,
            rate_limit_window_seconds: 60,
            install_key_ttl_seconds: 1800,
            install_key_max_failures: 5,
            install_key_block_seconds: 900,
        }
    }
}

/// Unified cache backend and sizing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// "memory" for an in-process LRU, "redis" when a shared cache is
    /// available.
    pub backend: String,
    /// Entry cap for the memory backend.
    pub capacity: usize,
    /// Default TTL applied when a caller does not pass one.
    pub default_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: "memory".into(),
            capacity: 4096,
            default_ttl_seconds: 300,
        }
    }
}
