use std::sync::Arc;

use antcode_common::types::{ExecutionStrategy, Node, NodeStatus, Project, ScheduledTask};

use crate::balancer::{NodeLoadBalancer, SelectionCriteria};
use crate::registry::NodeLookup;

/// Where an execution will run.
#[derive(Clone, Debug)]
pub struct Resolution {
    /// None means the master runs it locally.
    pub node: Option<Node>,
    /// The strategy that actually applied after fallback inference.
    pub strategy: ExecutionStrategy,
    pub require_render: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The strategy names a node that cannot take the work. Deliberately
    /// non-retryable: fixed and specified must not fall back elsewhere.
    #[error("Node unavailable: {0}")]
    NodeUnavailable(String),
}

impl From<ResolveError> for antcode_common::AntCodeError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::NodeUnavailable(msg) => {
                antcode_common::AntCodeError::NodeUnavailable(msg)
            }
        }
    }
}

/// Maps (task, project) to a target node — or local execution — according
/// to the execution strategy.
pub struct ExecutionResolver {
    lookup: Arc<dyn NodeLookup>,
    balancer: Arc<NodeLoadBalancer>,
}

impl ExecutionResolver {
    pub fn new(lookup: Arc<dyn NodeLookup>, balancer: Arc<NodeLoadBalancer>) -> Self {
        Self { lookup, balancer }
    }

    /// Task-level strategy wins, then the project's, then legacy
    /// inference from pinned node fields.
    pub fn effective_strategy(task: &ScheduledTask, project: &Project) -> ExecutionStrategy {
        if let Some(strategy) = task.execution_strategy {
            return strategy;
        }
        if let Some(strategy) = project.execution_strategy {
            return strategy;
        }
        if task.specified_node_id.is_some() {
            return ExecutionStrategy::Specified;
        }
        if project.bound_node_id.is_some() {
            return ExecutionStrategy::PreferBound;
        }
        ExecutionStrategy::Local
    }

    pub async fn resolve(
        &self,
        task: &ScheduledTask,
        project: &Project,
    ) -> Result<Resolution, ResolveError> {
        let strategy = Self::effective_strategy(task, project);
        let require_render = project.spec.requires_render();

        tracing::debug!(
            task = %task.name,
            strategy = strategy.as_db_str(),
            require_render = require_render,
            "Resolving execution target"
        );

        let node = match strategy {
            ExecutionStrategy::Local => None,
            ExecutionStrategy::FixedNode => Some(self.resolve_fixed(project).await?),
            ExecutionStrategy::Specified => Some(self.resolve_specified(task).await?),
            ExecutionStrategy::AutoSelect => self.resolve_auto(require_render, &[]).await,
            ExecutionStrategy::PreferBound => {
                self.resolve_prefer_bound(project, require_render).await?
            }
        };

        if let Some(node) = &node {
            tracing::info!(
                task = %task.name,
                node = %node.name,
                strategy = strategy.as_db_str(),
                "Execution target resolved"
            );
        }

        Ok(Resolution {
            node,
            strategy,
            require_render,
        })
    }

    async fn resolve_fixed(&self, project: &Project) -> Result<Node, ResolveError> {
        let Some(bound_id) = project.bound_node_id else {
            return Err(ResolveError::NodeUnavailable(
                "project has no bound node".into(),
            ));
        };

        let Some(node) = self.lookup.node_by_internal_id(bound_id).await else {
            return Err(ResolveError::NodeUnavailable(format!(
                "bound node does not exist (id={})",
                bound_id
            )));
        };

        if node.status != NodeStatus::Online {
            return Err(ResolveError::NodeUnavailable(format!(
                "bound node [{}] is not online (status: {})",
                node.name,
                node.status.as_db_str()
            )));
        }

        Ok(node)
    }

    async fn resolve_specified(&self, task: &ScheduledTask) -> Result<Node, ResolveError> {
        let Some(node_id) = task.specified_node_id else {
            return Err(ResolveError::NodeUnavailable(
                "task specifies no node".into(),
            ));
        };

        let Some(node) = self.lookup.node_by_internal_id(node_id).await else {
            return Err(ResolveError::NodeUnavailable(format!(
                "specified node does not exist (id={})",
                node_id
            )));
        };

        if node.status != NodeStatus::Online {
            return Err(ResolveError::NodeUnavailable(format!(
                "specified node [{}] is not online (status: {})",
                node.name,
                node.status.as_db_str()
            )));
        }

        Ok(node)
    }

    /// Balancer pick; None falls back to local execution.
    async fn resolve_auto(&self, require_render: bool, exclude: &[i64]) -> Option<Node> {
        let candidates = self.lookup.online_nodes().await;
        let criteria = SelectionCriteria {
            exclude: exclude.to_vec(),
            require_render,
            ..SelectionCriteria::default()
        };

        let best = self.balancer.select_best(&candidates, &criteria).await;
        if best.is_none() {
            tracing::warn!("No node qualifies, falling back to local execution");
        }
        best
    }

    async fn resolve_prefer_bound(
        &self,
        project: &Project,
        require_render: bool,
    ) -> Result<Option<Node>, ResolveError> {
        if let Some(bound_id) = project.bound_node_id {
            match self.lookup.node_by_internal_id(bound_id).await {
                Some(node) if node.status == NodeStatus::Online => {
                    return Ok(Some(node));
                }
                Some(node) => {
                    tracing::warn!(
                        node = %node.name,
                        status = node.status.as_db_str(),
                        "Bound node not online"
                    );
                }
                None => {
                    tracing::warn!(bound_id = bound_id, "Bound node does not exist");
                }
            }

            if !project.fallback_enabled {
                return Err(ResolveError::NodeUnavailable(
                    "bound node unavailable and fallback is disabled".into(),
                ));
            }

            return Ok(self.resolve_auto(require_render, &[bound_id]).await);
        }

        // No bound node at all: with fallback, balance; without, local.
        if project.fallback_enabled {
            Ok(self.resolve_auto(require_render, &[]).await)
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use antcode_common::ids::{NodeId, ProjectId, TaskId};
    use antcode_common::types::{
        CodeSpec, NodeCapabilities, NodeMetrics, ProjectSpec, ScheduleKind, TaskStatus,
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;

    struct StubLookup {
        nodes: HashMap<i64, Node>,
    }

    #[async_trait]
    impl NodeLookup for StubLookup {
        async fn node_by_internal_id(&self, id: i64) -> Option<Node> {
            self.nodes.get(&id).cloned()
        }

        async fn online_nodes(&self) -> Vec<Node> {
            self.nodes
                .values()
                .filter(|n| n.status == NodeStatus::Online)
                .cloned()
                .collect()
        }
    }

    fn node(id: i64, status: NodeStatus) -> Node {
        Node {
            id,
            public_id: NodeId::new(),
            name: format!("node-{}", id),
            host: "127.0.0.1".into(),
            port: 9000,
            status,
            region: None,
            tags: Vec::new(),
            capabilities: NodeCapabilities::default(),
            metrics: Some(NodeMetrics {
                cpu: 10.0,
                memory: 10.0,
                running_tasks: 0,
                max_concurrent_tasks: 5,
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

    fn project(strategy: Option<ExecutionStrategy>, bound: Option<i64>) -> Project {
        Project {
            id: 1,
            public_id: ProjectId::new(),
            user_id: 1,
            name: "p".into(),
            description: String::new(),
            spec: ProjectSpec::Code(CodeSpec {
                source: "print('hi')".into(),
                language: "python".into(),
                entry_point: None,
            }),
            file_hash: Some("abc".into()),
            bound_node_id: bound,
            execution_strategy: strategy,
            fallback_enabled: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn task(strategy: Option<ExecutionStrategy>, specified: Option<i64>) -> ScheduledTask {
        ScheduledTask {
            id: 1,
            public_id: TaskId::new(),
            project_id: 1,
            user_id: 1,
            name: "t".into(),
            description: String::new(),
            schedule_kind: ScheduleKind::Once,
            cron_expression: None,
            interval_seconds: None,
            scheduled_time: None,
            is_active: true,
            status: TaskStatus::Pending,
            timeout_seconds: None,
            max_retries: 0,
            retry_delay_seconds: None,
            priority: 2,
            execution_params: Default::default(),
            environment_vars: Default::default(),
            specified_node_id: specified,
            execution_strategy: strategy,
            success_count: 0,
            failure_count: 0,
            last_run_time: None,
            next_run_time: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn resolver(nodes: Vec<Node>) -> ExecutionResolver {
        let lookup = StubLookup {
            nodes: nodes.into_iter().map(|n| (n.id, n)).collect(),
        };
        ExecutionResolver::new(
            Arc::new(lookup),
            Arc::new(NodeLoadBalancer::new(
                antcode_common::config::BalancerConfig::default(),
            )),
        )
    }

    #[test]
    fn effective_strategy_fallback_chain() {
        // Task override wins.
        assert_eq!(
            ExecutionResolver::effective_strategy(
                &task(Some(ExecutionStrategy::Local), Some(1)),
                &project(Some(ExecutionStrategy::AutoSelect), Some(2)),
            ),
            ExecutionStrategy::Local
        );
        // Then project.
        assert_eq!(
            ExecutionResolver::effective_strategy(
                &task(None, None),
                &project(Some(ExecutionStrategy::AutoSelect), None),
            ),
            ExecutionStrategy::AutoSelect
        );
        // Legacy inference: pinned task node.
        assert_eq!(
            ExecutionResolver::effective_strategy(&task(None, Some(1)), &project(None, None)),
            ExecutionStrategy::Specified
        );
        // Legacy inference: bound project node.
        assert_eq!(
            ExecutionResolver::effective_strategy(&task(None, None), &project(None, Some(2))),
            ExecutionStrategy::PreferBound
        );
        // Default local.
        assert_eq!(
            ExecutionResolver::effective_strategy(&task(None, None), &project(None, None)),
            ExecutionStrategy::Local
        );
    }

    #[tokio::test]
    async fn fixed_node_offline_fails_without_fallback() {
        let r = resolver(vec![node(7, NodeStatus::Offline)]);
        let result = r
            .resolve(
                &task(Some(ExecutionStrategy::FixedNode), None),
                &project(None, Some(7)),
            )
            .await;
        assert!(matches!(result, Err(ResolveError::NodeUnavailable(_))));
    }

    #[tokio::test]
    async fn fixed_node_online_is_used() {
        let r = resolver(vec![node(7, NodeStatus::Online)]);
        let resolution = r
            .resolve(
                &task(Some(ExecutionStrategy::FixedNode), None),
                &project(None, Some(7)),
            )
            .await
            .unwrap();
        assert_eq!(resolution.node.map(|n| n.id), Some(7));
    }

    #[tokio::test]
    async fn specified_node_must_be_online() {
        let r = resolver(vec![node(3, NodeStatus::Offline)]);
        let result = r
            .resolve(
                &task(Some(ExecutionStrategy::Specified), Some(3)),
                &project(None, None),
            )
            .await;
        assert!(matches!(result, Err(ResolveError::NodeUnavailable(_))));
    }

    #[tokio::test]
    async fn auto_select_falls_back_to_local_when_empty() {
        let r = resolver(vec![]);
        let resolution = r
            .resolve(
                &task(Some(ExecutionStrategy::AutoSelect), None),
                &project(None, None),
            )
            .await
            .unwrap();
        assert!(resolution.node.is_none());
        assert_eq!(resolution.strategy, ExecutionStrategy::AutoSelect);
    }

    #[tokio::test]
    async fn prefer_bound_uses_online_bound_node() {
        let r = resolver(vec![node(5, NodeStatus::Online), node(6, NodeStatus::Online)]);
        let resolution = r
            .resolve(
                &task(Some(ExecutionStrategy::PreferBound), None),
                &project(None, Some(5)),
            )
            .await
            .unwrap();
        assert_eq!(resolution.node.map(|n| n.id), Some(5));
    }

    #[tokio::test]
    async fn prefer_bound_without_fallback_fails_when_bound_offline() {
        let r = resolver(vec![node(5, NodeStatus::Offline), node(6, NodeStatus::Online)]);
        let result = r
            .resolve(
                &task(Some(ExecutionStrategy::PreferBound), None),
                &project(None, Some(5)),
            )
            .await;
        assert!(matches!(result, Err(ResolveError::NodeUnavailable(_))));
    }

    #[tokio::test]
    async fn prefer_bound_with_fallback_excludes_bound_node() {
        let r = resolver(vec![node(5, NodeStatus::Offline), node(6, NodeStatus::Online)]);
        let mut p = project(None, Some(5));
        p.fallback_enabled = true;

        let resolution = r
            .resolve(&task(Some(ExecutionStrategy::PreferBound), None), &p)
            .await
            .unwrap();
        assert_eq!(resolution.node.map(|n| n.id), Some(6));
    }

    #[tokio::test]
    async fn resolution_is_deterministic_until_state_changes() {
        let r = resolver(vec![node(1, NodeStatus::Online), node(2, NodeStatus::Online)]);
        let t = task(Some(ExecutionStrategy::AutoSelect), None);
        let p = project(None, None);

        let first = r.resolve(&t, &p).await.unwrap().node.map(|n| n.id);
        for _ in 0..3 {
            let again = r.resolve(&t, &p).await.unwrap().node.map(|n| n.id);
            assert_eq!(first, again);
        }
    }
}
