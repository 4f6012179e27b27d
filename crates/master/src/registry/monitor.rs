use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use antcode_common::api::node::NodeInfoResponse;
use antcode_common::config::HeartbeatConfig;
use antcode_common::types::{Node, NodeStatus};

use super::{NodeRegistry, ProbeState};

/// Outcome summary of one adaptive check tick.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct CheckSummary {
    pub total: usize,
    pub checked: usize,
    pub skipped: usize,
    pub online: usize,
    pub offline: usize,
    pub suspended: u64,
    pub elapsed_ms: u64,
}

/// Adaptive node health monitor.
///
/// One periodic tick probes every cached node that is due: online nodes on
/// the base interval, failing nodes with exponential back-off, suspended
/// nodes not at all until a manual test revives them.
pub struct HeartbeatMonitor {
    registry: Arc<NodeRegistry>,
    http: reqwest::Client,
    config: HeartbeatConfig,
    /// Throttles heartbeat-history samples to one per node per minute.
    history_stamps: tokio::sync::Mutex<HashMap<i64, Instant>>,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<NodeRegistry>, config: HeartbeatConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.probe_timeout_seconds))
            .build()
            .unwrap_or_default();

        Self {
            registry,
            http,
            config,
            history_stamps: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// One adaptive check pass over the fleet. Driven by the scheduler's
    /// heartbeat maintenance job.
    pub async fn tick(&self) -> Result<CheckSummary, antcode_common::AntCodeError> {
        let started = Instant::now();
        self.registry.refresh_cache(false).await?;

        let now = Utc::now();
        let due = self.registry.due_for_probe(now).await;
        let cached_total = self.registry.all_cached().await.len();

        let mut summary = CheckSummary {
            total: cached_total,
            skipped: cached_total.saturating_sub(due.len()),
            suspended: self.registry.suspended_count().await,
            ..CheckSummary::default()
        };

        // Probes run concurrently outside the registry lock, bounded so a
        // large fleet cannot open hundreds of sockets in one tick.
        let semaphore = Arc::new(Semaphore::new(self.config.probe_concurrency.max(1)));
        let mut probes = JoinSet::new();

        for (node, state) in due {
            let permit = Arc::clone(&semaphore);
            let http = self.http.clone();
            probes.spawn(async move {
                let _permit = permit.acquire().await;
                let info = probe_node(&http, &node).await;
                (node, state, info)
            });
        }

        while let Some(joined) = probes.join_next().await {
            let Ok((node, state, info)) = joined else {
                summary.offline += 1;
                continue;
            };
            summary.checked += 1;

            match info {
                Some(info) => {
                    summary.online += 1;
                    self.handle_probe_success(&node, info).await?;
                }
                None => {
                    summary.offline += 1;
                    self.handle_probe_failure(&node, state).await?;
                }
            }
        }

        self.reconcile_stale_heartbeats().await?;

        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        if summary.checked > 0 {
            tracing::debug!(
                total = summary.total,
                checked = summary.checked,
                online = summary.online,
                offline = summary.offline,
                suspended = summary.suspended,
                elapsed_ms = summary.elapsed_ms,
                "Heartbeat tick complete"
            );
        }
        metrics::gauge!("nodes.suspended").set(summary.suspended as f64);

        Ok(summary)
    }

    async fn handle_probe_success(
        &self,
        node: &Node,
        info: NodeInfoResponse,
    ) -> Result<(), antcode_common::AntCodeError> {
        let came_online = node.status != NodeStatus::Online;

        self.registry
            .set_probe_state(
                node.id,
                ProbeState {
                    failures: 0,
                    next_check: Utc::now()
                        + chrono::Duration::seconds(self.config.base_interval_seconds as i64),
                    suspended: false,
                },
            )
            .await;

        let metrics_update = info.metrics.clone();
        let version = info.version.clone();
        let os_type = info.system.as_ref().and_then(|s| s.os_type.clone());
        self.registry
            .update_cached(node.id, |cached| {
                cached.status = NodeStatus::Online;
                cached.last_heartbeat = Some(Utc::now());
                if let Some(m) = metrics_update {
                    cached.metrics = Some(m);
                }
                if version.is_some() {
                    cached.version = version;
                }
                if os_type.is_some() {
                    cached.os_type = os_type;
                }
            })
            .await;

        // The row is written only on an actual transition; metric refreshes
        // stay in the cache.
        if came_online {
            self.registry
                .store()
                .update_node_probe(
                    node.id,
                    NodeStatus::Online,
                    info.metrics.as_ref(),
                    info.version.as_deref(),
                    info.system.as_ref().and_then(|s| s.os_type.as_deref()),
                )
                .await?;
            tracing::info!(node = %node.name, "Node back online");
        }

        if let Some(metrics) = info.metrics.as_ref() {
            let mut stamps = self.history_stamps.lock().await;
            let due = stamps
                .get(&node.id)
                .is_none_or(|at| at.elapsed() >= Duration::from_secs(60));
            if due {
                stamps.insert(node.id, Instant::now());
                drop(stamps);
                self.registry
                    .store()
                    .record_node_heartbeat(node.id, metrics)
                    .await?;
            }
        }

        Ok(())
    }

    async fn handle_probe_failure(
        &self,
        node: &Node,
        state: ProbeState,
    ) -> Result<(), antcode_common::AntCodeError> {
        let failures = state.failures + 1;
        let went_offline = node.status != NodeStatus::Offline;

        if failures >= self.config.max_failures {
            self.registry
                .set_probe_state(
                    node.id,
                    ProbeState {
                        failures,
                        next_check: Utc::now(),
                        suspended: true,
                    },
                )
                .await;
            tracing::warn!(
                node = %node.name,
                failures = failures,
                "Node suspended after consecutive probe failures; waiting for manual test"
            );
        } else {
            let interval = backoff_seconds(
                self.config.base_interval_seconds,
                failures,
                self.config.max_interval_seconds,
            );
            self.registry
                .set_probe_state(
                    node.id,
                    ProbeState {
                        failures,
                        next_check: Utc::now() + chrono::Duration::seconds(interval as i64),
                        suspended: false,
                    },
                )
                .await;
            tracing::debug!(
                node = %node.name,
                failures = failures,
                next_probe_s = interval,
                "Node probe failed, backing off"
            );
        }

        self.registry
            .update_cached(node.id, |cached| {
                cached.status = NodeStatus::Offline;
            })
            .await;

        if went_offline {
            self.registry
                .store()
                .set_node_status(node.id, NodeStatus::Offline)
                .await?;
            tracing::warn!(node = %node.name, "Node offline");
        }

        Ok(())
    }

    /// Pull probes can succeed while the node itself stopped pushing
    /// reports; a stale pushed heartbeat also means offline.
    async fn reconcile_stale_heartbeats(&self) -> Result<(), antcode_common::AntCodeError> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.push_timeout_seconds);

        for node in self.registry.all_cached().await {
            if node.status == NodeStatus::Online
                && node.last_heartbeat.is_some_and(|hb| hb < cutoff)
            {
                self.registry
                    .update_cached(node.id, |cached| cached.status = NodeStatus::Offline)
                    .await;
                self.registry
                    .store()
                    .set_node_status(node.id, NodeStatus::Offline)
                    .await?;
                tracing::warn!(node = %node.name, "Node heartbeat stale, marked offline");
            }
        }
        Ok(())
    }

    /// Forcibly probe a node regardless of suspension. Success resumes
    /// adaptive probing.
    pub async fn manual_test(&self, node_id: i64) -> Result<bool, antcode_common::AntCodeError> {
        self.registry.refresh_cache(true).await?;

        let Some(node) = self.registry.get(node_id).await? else {
            return Err(antcode_common::AntCodeError::NotFound(format!(
                "node {}",
                node_id
            )));
        };

        let info = probe_node(&self.http, &node).await;
        match info {
            Some(info) => {
                self.handle_probe_success(&node, info).await?;
                tracing::info!(node = %node.name, "Manual test succeeded, adaptive probing resumed");
                Ok(true)
            }
            None => {
                let state = self
                    .registry
                    .probe_state(node_id)
                    .await
                    .unwrap_or(ProbeState {
                        failures: 0,
                        next_check: Utc::now(),
                        suspended: false,
                    });
                self.handle_probe_failure(&node, state).await?;
                Ok(false)
            }
        }
    }
}

/// `min(base · 2^failures, cap)` — the adaptive back-off schedule.
pub fn backoff_seconds(base: u64, failures: u32, cap: u64) -> u64 {
    base.saturating_mul(1u64 << failures.min(32)).min(cap)
}

async fn probe_node(http: &reqwest::Client, node: &Node) -> Option<NodeInfoResponse> {
    let url = format!("{}/node/info", node.base_url());
    let response = http.get(&url).send().await.ok()?;
    if !response.status().is_success() {
        return None;
    }
    response.json::<NodeInfoResponse>().await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        // 3·2^N capped at 60.
        assert_eq!(backoff_seconds(3, 1, 60), 6);
        assert_eq!(backoff_seconds(3, 2, 60), 12);
        assert_eq!(backoff_seconds(3, 3, 60), 24);
        assert_eq!(backoff_seconds(3, 4, 60), 48);
        assert_eq!(backoff_seconds(3, 5, 60), 60);
        assert_eq!(backoff_seconds(3, 20, 60), 60);
    }
}
