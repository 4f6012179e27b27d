mod monitor;

pub use monitor::HeartbeatMonitor;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use antcode_common::config::HeartbeatConfig;
use antcode_common::ids::NodeId;
use antcode_common::types::{Node, NodeStatus};

use crate::store::StoreClient;

/// Per-node adaptive probe state.
#[derive(Clone, Debug)]
pub struct ProbeState {
    pub failures: u32,
    pub next_check: DateTime<Utc>,
    /// Automatic probing stopped after too many consecutive failures;
    /// only a manual test resumes it.
    pub suspended: bool,
}

impl ProbeState {
    fn fresh() -> Self {
        Self {
            failures: 0,
            next_check: Utc::now(),
            suspended: false,
        }
    }
}

struct RegistryInner {
    nodes: HashMap<i64, Node>,
    states: HashMap<i64, ProbeState>,
    refreshed_at: Option<Instant>,
}

/// Authoritative in-memory view of the worker fleet.
///
/// The cache refreshes lazily from the database when its TTL elapses and
/// eagerly on node create/delete. Probe state lives alongside each cached
/// node; probes themselves run outside the lock.
pub struct NodeRegistry {
    store: Arc<StoreClient>,
    inner: Mutex<RegistryInner>,
    cache_ttl: Duration,
    push_timeout_seconds: i64,
}

impl NodeRegistry {
    pub fn new(store: Arc<StoreClient>, config: &HeartbeatConfig) -> Self {
        Self {
            store,
            inner: Mutex::new(RegistryInner {
                nodes: HashMap::new(),
                states: HashMap::new(),
                refreshed_at: None,
            }),
            cache_ttl: Duration::from_secs(config.cache_ttl_seconds),
            push_timeout_seconds: config.push_timeout_seconds,
        }
    }

    /// Reload the cache from the database when the TTL elapsed (or always,
    /// when forced). Probe states of surviving nodes are preserved.
    pub async fn refresh_cache(&self, force: bool) -> Result<(), antcode_common::AntCodeError> {
        {
            let inner = self.inner.lock().await;
            let fresh = inner
                .refreshed_at
                .is_some_and(|at| at.elapsed() < self.cache_ttl);
            if fresh && !force {
                return Ok(());
            }
        }

        let nodes = self.store.get_all_nodes().await?;

        let mut inner = self.inner.lock().await;
        let mut new_nodes = HashMap::with_capacity(nodes.len());
        let mut new_states = HashMap::with_capacity(nodes.len());
        for node in nodes {
            let state = inner
                .states
                .get(&node.id)
                .cloned()
                .unwrap_or_else(ProbeState::fresh);
            new_states.insert(node.id, state);
            new_nodes.insert(node.id, node);
        }
        inner.nodes = new_nodes;
        inner.states = new_states;
        inner.refreshed_at = Some(Instant::now());

        tracing::debug!(count = inner.nodes.len(), "Node cache refreshed");
        Ok(())
    }

    /// Cached node by internal id, falling back to the database on a miss.
    pub async fn get(&self, id: i64) -> Result<Option<Node>, antcode_common::AntCodeError> {
        self.refresh_cache(false).await?;

        {
            let inner = self.inner.lock().await;
            if let Some(node) = inner.nodes.get(&id) {
                return Ok(Some(node.clone()));
            }
        }

        // Miss: the node may have been created after the last refresh.
        let Some(node) = self.store.get_node(id).await? else {
            return Ok(None);
        };
        self.insert(node.clone()).await;
        Ok(Some(node))
    }

    pub async fn get_by_public_id(
        &self,
        public_id: NodeId,
    ) -> Result<Option<Node>, antcode_common::AntCodeError> {
        self.refresh_cache(false).await?;

        {
            let inner = self.inner.lock().await;
            if let Some(node) = inner.nodes.values().find(|n| n.public_id == public_id) {
                return Ok(Some(node.clone()));
            }
        }

        let Some(node) = self.store.get_node_by_public_id(public_id).await? else {
            return Ok(None);
        };
        self.insert(node.clone()).await;
        Ok(Some(node))
    }

    /// All cached nodes currently online, with the pushed-heartbeat timeout
    /// applied: a node whose own reports went silent is not offered for
    /// dispatch even if pull probes succeed.
    pub async fn online(&self) -> Result<Vec<Node>, antcode_common::AntCodeError> {
        self.refresh_cache(false).await?;
        let cutoff = Utc::now() - chrono::Duration::seconds(self.push_timeout_seconds);

        let inner = self.inner.lock().await;
        Ok(inner
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::Online)
            .filter(|n| n.last_heartbeat.is_none_or(|hb| hb >= cutoff))
            .cloned()
            .collect())
    }

    /// Every cached node, regardless of status.
    pub async fn all_cached(&self) -> Vec<Node> {
        let inner = self.inner.lock().await;
        inner.nodes.values().cloned().collect()
    }

    /// Eager insert after node creation or registration.
    pub async fn insert(&self, node: Node) {
        let mut inner = self.inner.lock().await;
        inner.states.entry(node.id).or_insert_with(ProbeState::fresh);
        inner.nodes.insert(node.id, node);
    }

    /// Eager removal after node deletion.
    pub async fn remove(&self, id: i64) {
        let mut inner = self.inner.lock().await;
        inner.nodes.remove(&id);
        inner.states.remove(&id);
    }

    /// Update the cached copy of a node in place.
    pub async fn update_cached<F>(&self, id: i64, apply: F)
    where
        F: FnOnce(&mut Node),
    {
        let mut inner = self.inner.lock().await;
        if let Some(node) = inner.nodes.get_mut(&id) {
            apply(node);
        }
    }

    /// Snapshot of (node, probe state) pairs due for a probe.
    pub(crate) async fn due_for_probe(&self, now: DateTime<Utc>) -> Vec<(Node, ProbeState)> {
        let inner = self.inner.lock().await;
        inner
            .nodes
            .values()
            .filter_map(|node| {
                let state = inner.states.get(&node.id)?;
                if node.status == NodeStatus::Maintenance {
                    return None;
                }
                if state.suspended || state.next_check > now {
                    return None;
                }
                Some((node.clone(), state.clone()))
            })
            .collect()
    }

    pub(crate) async fn set_probe_state(&self, id: i64, state: ProbeState) {
        let mut inner = self.inner.lock().await;
        inner.states.insert(id, state);
    }

    pub async fn probe_state(&self, id: i64) -> Option<ProbeState> {
        let inner = self.inner.lock().await;
        inner.states.get(&id).cloned()
    }

    pub async fn suspended_count(&self) -> u64 {
        let inner = self.inner.lock().await;
        inner.states.values().filter(|s| s.suspended).count() as u64
    }

    pub fn store(&self) -> &Arc<StoreClient> {
        &self.store
    }
}

/// Node resolution seam used by the execution resolver, kept narrow so
/// strategy logic is testable without a database.
#[async_trait]
pub trait NodeLookup: Send + Sync {
    async fn node_by_internal_id(&self, id: i64) -> Option<Node>;

    async fn online_nodes(&self) -> Vec<Node>;
}

#[async_trait]
impl NodeLookup for NodeRegistry {
    async fn node_by_internal_id(&self, id: i64) -> Option<Node> {
        self.get(id).await.ok().flatten()
    }

    async fn online_nodes(&self) -> Vec<Node> {
        self.online().await.unwrap_or_default()
    }
}
