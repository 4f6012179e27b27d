use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use antcode_common::config::BalancerConfig;
use antcode_common::types::Node;

/// Latency assigned to nodes whose health probe failed.
const UNREACHABLE_LATENCY_MS: f64 = 999.0;

/// Constraints narrowing the candidate set before scoring.
#[derive(Clone, Debug, Default)]
pub struct SelectionCriteria {
    /// Internal node ids never to pick (e.g. a bound node that already
    /// failed under prefer-bound).
    pub exclude: Vec<i64>,
    pub region: Option<String>,
    /// A candidate must carry at least one of these tags.
    pub tags: Vec<String>,
    /// Only nodes with the browser-render capability qualify.
    pub require_render: bool,
}

/// One entry of the ranking endpoint.
#[derive(Clone, Debug, serde::Serialize)]
pub struct NodeRanking {
    pub node_id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub region: Option<String>,
    pub load_score: f64,
    pub available: bool,
    pub latency_ms: f64,
}

/// Scores online nodes and picks the least-loaded one subject to
/// constraints.
pub struct NodeLoadBalancer {
    http: reqwest::Client,
    config: BalancerConfig,
    /// Guards (latency, refreshed-at) per node; probes run outside it.
    latencies: Mutex<HashMap<i64, (f64, Instant)>>,
}

impl NodeLoadBalancer {
    pub fn new(config: BalancerConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.probe_timeout_seconds))
            .build()
            .unwrap_or_default();

        Self {
            http,
            config,
            latencies: Mutex::new(HashMap::new()),
        }
    }

    /// Weighted load score, lower is better.
    ///
    ///   0.30·cpu + 0.25·mem + 0.20·task-load + 0.15·latency + 0.10·(100 − success)
    pub fn load_score(&self, node: &Node, latency_ms: f64) -> f64 {
        let Some(metrics) = node.metrics.as_ref() else {
            return 100.0;
        };

        let cpu_score = metrics.cpu;
        let memory_score = metrics.memory;

        let max_tasks = node.max_concurrent_tasks().max(1) as f64;
        let task_score = (metrics.running_tasks as f64 / max_tasks) * 100.0;

        let latency_score = latency_score(latency_ms);
        let success_score = 100.0 - metrics.success_rate.clamp(0.0, 100.0);

        let total = cpu_score * 0.30
            + memory_score * 0.25
            + task_score * 0.20
            + latency_score * 0.15
            + success_score * 0.10;

        (total * 100.0).round() / 100.0
    }

    /// Hard guards: a node at its resource ceiling is not a candidate no
    /// matter how it scores. Per-node limit overrides apply here.
    pub fn is_available(&self, node: &Node) -> bool {
        if node.status != antcode_common::types::NodeStatus::Online {
            return false;
        }
        let Some(metrics) = node.metrics.as_ref() else {
            return false;
        };

        let limits = node.resource_limits.as_ref();
        let max_cpu = limits
            .and_then(|l| l.max_cpu_percent)
            .unwrap_or(self.config.max_cpu_percent);
        let max_memory = limits
            .and_then(|l| l.max_memory_percent)
            .unwrap_or(self.config.max_memory_percent);

        if metrics.cpu >= max_cpu || metrics.memory >= max_memory {
            return false;
        }

        let max_tasks = node.max_concurrent_tasks() as f64;
        if metrics.running_tasks as f64 >= max_tasks * self.config.max_tasks_ratio {
            return false;
        }

        true
    }

    /// Pick the minimum-score candidate, or None when none qualifies.
    pub async fn select_best(
        &self,
        nodes: &[Node],
        criteria: &SelectionCriteria,
    ) -> Option<Node> {
        let mut candidates = Vec::new();

        for node in nodes {
            if criteria.exclude.contains(&node.id) {
                continue;
            }
            if let Some(region) = criteria.region.as_deref() {
                if node.region.as_deref() != Some(region) {
                    continue;
                }
            }
            if !criteria.tags.is_empty()
                && !criteria.tags.iter().any(|t| node.tags.contains(t))
            {
                continue;
            }
            if criteria.require_render && !node.capabilities.has_render() {
                tracing::debug!(node = %node.name, "No render capability, skipping");
                continue;
            }
            if !self.is_available(node) {
                tracing::debug!(node = %node.name, "Node at resource ceiling, skipping");
                continue;
            }
            candidates.push(node);
        }

        if candidates.is_empty() {
            if criteria.require_render {
                tracing::warn!("No render-capable node available");
            } else {
                tracing::warn!("No node available");
            }
            return None;
        }

        let mut best: Option<(&Node, f64)> = None;
        for node in candidates {
            let latency = self.node_latency(node).await;
            let score = self.load_score(node, latency);
            tracing::debug!(node = %node.name, score = score, "Load score");

            match best {
                Some((_, best_score)) if best_score <= score => {}
                _ => best = Some((node, score)),
            }
        }

        let (node, score) = best?;
        tracing::info!(node = %node.name, score = score, "Node selected");
        metrics::counter!("balancer.selections").increment(1);
        Some(node.clone())
    }

    /// Candidates sorted by score, for UI display.
    pub async fn rank(
        &self,
        nodes: &[Node],
        region: Option<&str>,
        top_n: usize,
    ) -> Vec<NodeRanking> {
        let mut rankings = Vec::new();

        for node in nodes {
            if let Some(region) = region {
                if node.region.as_deref() != Some(region) {
                    continue;
                }
            }

            let latency = self.node_latency(node).await;
            rankings.push(NodeRanking {
                node_id: node.public_id.to_string(),
                name: node.name.clone(),
                host: node.host.clone(),
                port: node.port,
                region: node.region.clone(),
                load_score: self.load_score(node, latency),
                available: self.is_available(node),
                latency_ms: latency,
            });
        }

        rankings.sort_by(|a, b| a.load_score.total_cmp(&b.load_score));
        rankings.truncate(top_n);
        rankings
    }

    /// Round-trip latency to a node, refreshed at most once per minute.
    async fn node_latency(&self, node: &Node) -> f64 {
        {
            let latencies = self.latencies.lock().await;
            if let Some((latency, at)) = latencies.get(&node.id) {
                if at.elapsed() < Duration::from_secs(self.config.latency_refresh_seconds) {
                    return *latency;
                }
            }
        }

        let url = format!("{}/health", node.base_url());
        let started = Instant::now();
        let latency = match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                started.elapsed().as_secs_f64() * 1000.0
            }
            _ => UNREACHABLE_LATENCY_MS,
        };

        let mut latencies = self.latencies.lock().await;
        latencies.insert(node.id, (latency, Instant::now()));
        latency
    }
}

/// Map RTT to a [0, 100] score: flat 0 below 10 ms, flat 100 above 1 s,
/// `25·log10(rtt/10)` between.
fn latency_score(latency_ms: f64) -> f64 {
    if latency_ms <= 10.0 {
        0.0
    } else if latency_ms >= 1000.0 {
        100.0
    } else {
        (25.0 * (latency_ms / 10.0).log10()).clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use antcode_common::ids::NodeId;
    use antcode_common::types::{
        Capability, Node, NodeCapabilities, NodeMetrics, NodeStatus, ResourceLimits,
    };
    use chrono::Utc;

    fn node(id: i64, cpu: f64, memory: f64, running: u32) -> Node {
        Node {
            id,
            public_id: NodeId::new(),
            name: format!("node-{}", id),
            host: "127.0.0.1".into(),
            port: 9000 + id as u16,
            status: NodeStatus::Online,
            region: None,
            tags: Vec::new(),
            capabilities: NodeCapabilities::default(),
            metrics: Some(NodeMetrics {
                cpu,
                memory,
                running_tasks: running,
                max_concurrent_tasks: 10,
                success_rate: 100.0,
            }),
            last_heartbeat: Some(Utc::now()),
            api_key: "key".into(),
            secret_key: "secret".into(),
            resource_limits: None,
            machine_code: None,
            version: None,
            os_type: None,
            created_at: Utc::now(),
        }
    }

    fn balancer() -> NodeLoadBalancer {
        NodeLoadBalancer::new(antcode_common::config::BalancerConfig::default())
    }

    #[test]
    fn hard_guards_filter_hot_nodes() {
        let b = balancer();
        assert!(b.is_available(&node(1, 50.0, 50.0, 2)));
        assert!(!b.is_available(&node(2, 95.0, 50.0, 2)));
        assert!(!b.is_available(&node(3, 50.0, 92.0, 2)));
        // 8 of 10 slots used trips the 0.8 ratio guard.
        assert!(!b.is_available(&node(4, 50.0, 50.0, 8)));

        let mut offline = node(5, 10.0, 10.0, 0);
        offline.status = NodeStatus::Offline;
        assert!(!b.is_available(&offline));
    }

    #[test]
    fn resource_limit_overrides_apply() {
        let b = balancer();
        let mut lenient = node(1, 95.0, 50.0, 2);
        lenient.resource_limits = Some(ResourceLimits {
            max_cpu_percent: Some(99.0),
            max_memory_percent: None,
            max_concurrent_tasks: None,
        });
        assert!(b.is_available(&lenient));
    }

    #[test]
    fn lower_load_scores_lower() {
        let b = balancer();
        let idle = b.load_score(&node(1, 10.0, 10.0, 1), 10.0);
        let busy = b.load_score(&node(2, 80.0, 70.0, 7), 10.0);
        assert!(idle < busy);

        // No metrics means worst-case score.
        let mut bare = node(3, 0.0, 0.0, 0);
        bare.metrics = None;
        assert_eq!(b.load_score(&bare, 10.0), 100.0);
    }

    #[test]
    fn latency_score_maps_log_curve() {
        assert_eq!(latency_score(5.0), 0.0);
        assert_eq!(latency_score(1500.0), 100.0);
        assert!((latency_score(100.0) - 25.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn select_best_prefers_idle_node() {
        let b = balancer();
        // Seed latencies so no real probe fires.
        {
            let mut latencies = b.latencies.lock().await;
            latencies.insert(1, (10.0, Instant::now()));
            latencies.insert(2, (10.0, Instant::now()));
        }

        let nodes = vec![node(1, 70.0, 60.0, 5), node(2, 10.0, 15.0, 1)];
        let best = b.select_best(&nodes, &SelectionCriteria::default()).await;
        assert_eq!(best.map(|n| n.id), Some(2));
    }

    #[tokio::test]
    async fn criteria_filters_apply() {
        let b = balancer();
        {
            let mut latencies = b.latencies.lock().await;
            for id in 1..=3 {
                latencies.insert(id, (10.0, Instant::now()));
            }
        }

        let mut render_node = node(1, 30.0, 30.0, 1);
        render_node.capabilities = NodeCapabilities {
            render: Some(Capability {
                enabled: true,
                extra: Default::default(),
            }),
            extra: Default::default(),
        };
        let plain = node(2, 10.0, 10.0, 0);
        let excluded = node(3, 5.0, 5.0, 0);

        let nodes = vec![render_node.clone(), plain.clone(), excluded.clone()];

        let best = b
            .select_best(
                &nodes,
                &SelectionCriteria {
                    require_render: true,
                    ..SelectionCriteria::default()
                },
            )
            .await;
        assert_eq!(best.map(|n| n.id), Some(1));

        let best = b
            .select_best(
                &nodes,
                &SelectionCriteria {
                    exclude: vec![3],
                    ..SelectionCriteria::default()
                },
            )
            .await;
        assert_eq!(best.map(|n| n.id), Some(2));

        let best = b
            .select_best(
                &nodes,
                &SelectionCriteria {
                    tags: vec!["gpu".into()],
                    ..SelectionCriteria::default()
                },
            )
            .await;
        assert!(best.is_none());
    }
}
