use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use antcode_common::api::node::{
    NodeConnectRequest, NodeInfoResponse, NodeResponse, PriorityUpdateData, QueueBatchData,
    QueueBatchRequest, RejectedTask, TaskEnvelope,
};
use antcode_common::ids::NodeId;
use antcode_common::types::{Node, NodeStatus, ProjectType, QueueStatus};

use crate::balancer::{NodeLoadBalancer, SelectionCriteria};
use crate::queue::TaskQueue;
use crate::registry::NodeRegistry;
use crate::sync::ProjectSyncService;

/// Node choice passed into a dispatch call.
#[derive(Clone, Debug, Default)]
pub struct DispatchTarget {
    /// Explicit node; must be online. When absent the balancer picks.
    pub node_id: Option<NodeId>,
    pub region: Option<String>,
    pub tags: Vec<String>,
    pub require_render: bool,
}

/// Result of a batch dispatch.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct BatchOutcome {
    pub success: bool,
    pub node_id: Option<String>,
    pub node_name: Option<String>,
    pub batch_id: Option<String>,
    pub accepted_count: usize,
    pub rejected_count: usize,
    pub accepted_tasks: Vec<String>,
    pub rejected_tasks: Vec<RejectedTask>,
    pub error: Option<String>,
    pub sync_report: Option<crate::sync::SyncReport>,
}

/// Result of a single-task dispatch.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct DispatchOutcome {
    pub success: bool,
    pub node_id: Option<String>,
    pub node_name: Option<String>,
    pub task_id: Option<String>,
    pub transfer_skipped: bool,
    /// The node's queue explicitly refused the envelope (bad project,
    /// malformed payload). Not retryable, unlike transport failures.
    pub rejected: bool,
    pub message: Option<String>,
    pub error: Option<String>,
}

/// Assembles batches, guarantees artifact parity via the sync service, and
/// routes work to a node's priority queue. Also fronts the master-side
/// buffer queue and proxies queue-control calls to nodes.
pub struct NodeDispatcher {
    registry: Arc<NodeRegistry>,
    balancer: Arc<NodeLoadBalancer>,
    sync: Arc<ProjectSyncService>,
    queue: Arc<dyn TaskQueue>,
    http: reqwest::Client,
    master_url: String,
}

impl NodeDispatcher {
    pub fn new(
        registry: Arc<NodeRegistry>,
        balancer: Arc<NodeLoadBalancer>,
        sync: Arc<ProjectSyncService>,
        queue: Arc<dyn TaskQueue>,
        master_url: String,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();

        Self {
            registry,
            balancer,
            sync,
            queue,
            http,
            master_url,
        }
    }

    // --- Master-side buffer queue passthrough ---

    pub async fn master_queue_cancel(
        &self,
        task_id: &str,
    ) -> Result<bool, antcode_common::AntCodeError> {
        Ok(self.queue.cancel(task_id).await?)
    }

    pub async fn master_queue_update_priority(
        &self,
        task_id: &str,
        priority: i32,
    ) -> Result<bool, antcode_common::AntCodeError> {
        Ok(self.queue.update_priority(task_id, priority).await?)
    }

    pub async fn master_queue_status(&self) -> QueueStatus {
        self.queue.status().await
    }

    // --- Dispatch ---

    /// Dispatch a single task by wrapping it in a one-element batch.
    #[allow(clippy::too_many_arguments)]
    pub async fn dispatch_task(
        &self,
        execution_id: &str,
        project_id: &str,
        project_type: ProjectType,
        priority: Option<i32>,
        params: serde_json::Map<String, Value>,
        environment: HashMap<String, String>,
        timeout: u64,
        target: DispatchTarget,
    ) -> DispatchOutcome {
        let require_render = target.require_render;
        let effective_priority = priority.unwrap_or_else(|| project_type.default_priority());
        let envelope = TaskEnvelope {
            task_id: execution_id.to_string(),
            project_id: project_id.to_string(),
            project_type,
            priority: Some(effective_priority),
            params,
            environment,
            timeout,
            require_render,
            download_url: None,
            api_key: None,
            file_hash: None,
            entry_point: None,
        };

        // Buffer through the master queue first. The idempotent enqueue is
        // the duplicate-dispatch guard; a connection failure means "queue
        // unavailable, task not dispatched".
        let envelope_json = serde_json::to_value(&envelope).unwrap_or_default();
        match self
            .queue
            .enqueue(
                execution_id,
                project_id,
                effective_priority,
                envelope_json,
                project_type,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                return DispatchOutcome {
                    success: false,
                    task_id: Some(execution_id.to_string()),
                    error: Some("execution already queued for dispatch".into()),
                    ..DispatchOutcome::default()
                };
            }
            Err(e) => {
                return DispatchOutcome {
                    success: false,
                    task_id: Some(execution_id.to_string()),
                    error: Some(format!("queue unavailable: {}", e)),
                    ..DispatchOutcome::default()
                };
            }
        }

        let batch = self.dispatch_batch(vec![envelope], target).await;

        // The buffer entry is spent either way: success hands the task to
        // the node, failure hands the decision back to the scheduler.
        if let Err(e) = self.queue.cancel(execution_id).await {
            tracing::warn!(execution_id = execution_id, error = %e, "Buffer drain failed");
        }

        let rejected_entry = batch
            .rejected_tasks
            .iter()
            .find(|r| r.task_id == execution_id);

        if batch.success && rejected_entry.is_none() {
            DispatchOutcome {
                success: true,
                node_id: batch.node_id,
                node_name: batch.node_name,
                task_id: Some(execution_id.to_string()),
                transfer_skipped: batch
                    .sync_report
                    .as_ref()
                    .is_some_and(|r| r.skipped.iter().any(|p| p == project_id)),
                rejected: false,
                message: Some("task queued on node".into()),
                error: None,
            }
        } else {
            let rejected = rejected_entry.is_some();
            let error = rejected_entry
                .and_then(|r| r.reason.clone())
                .or(batch.error)
                .or_else(|| Some("dispatch failed".into()));
            DispatchOutcome {
                success: false,
                node_id: batch.node_id,
                node_name: batch.node_name,
                task_id: Some(execution_id.to_string()),
                transfer_skipped: false,
                rejected,
                message: None,
                error,
            }
        }
    }

    /// Dispatch a batch: resolve the node, make sure it talks back to this
    /// master, sync every referenced project, enrich the envelopes with
    /// download metadata and push to the node queue.
    pub async fn dispatch_batch(
        &self,
        mut tasks: Vec<TaskEnvelope>,
        target: DispatchTarget,
    ) -> BatchOutcome {
        if tasks.is_empty() {
            return BatchOutcome {
                error: Some("empty batch".into()),
                ..BatchOutcome::default()
            };
        }

        let require_render = target.require_render || tasks.iter().any(|t| t.require_render);

        let node = match self.select_node(&target, require_render).await {
            Ok(node) => node,
            Err(e) => {
                return BatchOutcome {
                    error: Some(e),
                    ..BatchOutcome::default()
                }
            }
        };

        if !self.ensure_node_connected(&node).await {
            return BatchOutcome {
                node_id: Some(node.public_id.to_string()),
                node_name: Some(node.name.clone()),
                error: Some(format!("node not connected: {}", node.name)),
                ..BatchOutcome::default()
            };
        }

        // Sync the distinct set of referenced projects once per batch.
        let mut project_ids: Vec<String> = tasks.iter().map(|t| t.project_id.clone()).collect();
        project_ids.sort();
        project_ids.dedup();

        let (report, download_info) = self.sync_projects(&node, &project_ids).await;

        for task in &mut tasks {
            if let Some(info) = download_info.get(&task.project_id) {
                task.download_url = Some(info.download_url.clone());
                task.api_key = Some(node.api_key.clone());
                task.file_hash = info.file_hash.clone();
                task.entry_point = info.entry_point.clone();
            }
        }

        let batch_id = Uuid::new_v4().to_string();
        let mut outcome = self.send_batch(&node, tasks, &batch_id).await;
        outcome.node_id = Some(node.public_id.to_string());
        outcome.node_name = Some(node.name.clone());
        outcome.sync_report = Some(report);

        if outcome.success {
            metrics::counter!("dispatch.batches").increment(1);
            metrics::counter!("dispatch.tasks_accepted").increment(outcome.accepted_count as u64);
        } else {
            metrics::counter!("dispatch.failures").increment(1);
        }
        outcome
    }

    async fn select_node(
        &self,
        target: &DispatchTarget,
        require_render: bool,
    ) -> Result<Node, String> {
        if let Some(node_id) = target.node_id {
            let node = self
                .registry
                .get_by_public_id(node_id)
                .await
                .map_err(|e| e.to_string())?
                .ok_or_else(|| format!("node does not exist: {}", node_id))?;

            if node.status != NodeStatus::Online {
                return Err(format!("node offline: {}", node.name));
            }
            if require_render && !node.capabilities.has_render() {
                return Err(format!("node [{}] has no render capability", node.name));
            }
            return Ok(node);
        }

        let candidates = self.registry.online().await.map_err(|e| e.to_string())?;
        let criteria = SelectionCriteria {
            region: target.region.clone(),
            tags: target.tags.clone(),
            require_render,
            ..SelectionCriteria::default()
        };

        self.balancer
            .select_best(&candidates, &criteria)
            .await
            .ok_or_else(|| "no available node".to_string())
    }

    /// Make sure the node knows this master's address for pushing reports,
    /// reconciling the stored machine code on the way.
    async fn ensure_node_connected(&self, node: &Node) -> bool {
        let machine_code = match &node.machine_code {
            Some(code) => code.clone(),
            None => {
                // The record predates fingerprinting; pull it off the node.
                let url = format!("{}/node/info", node.base_url());
                let fetched = match self.http.get(&url).send().await {
                    Ok(resp) if resp.status().is_success() => resp
                        .json::<NodeInfoResponse>()
                        .await
                        .ok()
                        .and_then(|info| info.machine_code),
                    Ok(resp) => {
                        tracing::warn!(
                            node = %node.name,
                            status = %resp.status(),
                            "Machine code fetch failed"
                        );
                        None
                    }
                    Err(e) => {
                        tracing::warn!(node = %node.name, error = %e, "Machine code fetch failed");
                        None
                    }
                };

                let Some(code) = fetched else {
                    tracing::warn!(node = %node.name, "Node has no machine code, cannot connect");
                    return false;
                };

                if let Err(e) = self
                    .registry
                    .store()
                    .set_node_machine_code(node.id, &code)
                    .await
                {
                    tracing::warn!(node = %node.name, error = %e, "Machine code save failed");
                }
                self.registry
                    .update_cached(node.id, |cached| cached.machine_code = Some(code.clone()))
                    .await;
                tracing::info!(node = %node.name, "Machine code synced from node");
                code
            }
        };

        let body = NodeConnectRequest {
            machine_code,
            api_key: node.api_key.clone(),
            master_url: self.master_url.clone(),
            node_id: node.public_id.to_string(),
            secret_key: node.secret_key.clone(),
            use_websocket: true,
        };

        let url = format!("{}/node/connect/v2", node.base_url());
        match self
            .http
            .post(&url)
            .bearer_auth(&node.api_key)
            .json(&body)
            .timeout(Duration::from_secs(15))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                // Give the node a beat to finish setting up its link.
                tokio::time::sleep(Duration::from_millis(500)).await;
                tracing::info!(node = %node.name, master = %self.master_url, "Node linked to master");
                true
            }
            Ok(resp) => {
                tracing::warn!(node = %node.name, status = %resp.status(), "Node connect rejected");
                false
            }
            Err(e) => {
                tracing::warn!(node = %node.name, error = %e, "Node connect failed");
                false
            }
        }
    }

    async fn sync_projects(
        &self,
        node: &Node,
        project_ids: &[String],
    ) -> (
        crate::sync::SyncReport,
        HashMap<String, crate::sync::DownloadInfo>,
    ) {
        let mut report = crate::sync::SyncReport::default();
        let mut download_info = HashMap::new();

        for project_id in project_ids {
            let Some(public_id) = antcode_common::ids::ProjectId::parse(project_id) else {
                report
                    .failed
                    .push((project_id.clone(), "invalid project id".into()));
                continue;
            };

            let project = match self.registry.store().get_project_by_public_id(public_id).await {
                Ok(Some(project)) => project,
                Ok(None) => {
                    report
                        .failed
                        .push((project_id.clone(), "project does not exist".into()));
                    continue;
                }
                Err(e) => {
                    report.failed.push((project_id.clone(), e.to_string()));
                    continue;
                }
            };

            download_info.insert(project_id.clone(), self.sync.download_info(&project));

            match self.sync.sync_to_node(node, &project).await {
                Ok(true) => report.synced.push(project_id.clone()),
                Ok(false) => report.skipped.push(project_id.clone()),
                Err(e) => {
                    tracing::error!(project = project_id, error = %e, "Project sync failed");
                    report.failed.push((project_id.clone(), e.to_string()));
                }
            }
        }

        (report, download_info)
    }

    async fn send_batch(
        &self,
        node: &Node,
        tasks: Vec<TaskEnvelope>,
        batch_id: &str,
    ) -> BatchOutcome {
        let task_count = tasks.len();
        let body = QueueBatchRequest {
            tasks,
            node_id: node.public_id.to_string(),
            batch_id: batch_id.to_string(),
        };

        let url = format!("{}/queue/batch", node.base_url());
        let response = match self
            .http
            .post(&url)
            .bearer_auth(&node.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                return BatchOutcome {
                    error: Some("node connection timed out".into()),
                    ..BatchOutcome::default()
                }
            }
            Err(e) if e.is_connect() => {
                return BatchOutcome {
                    error: Some("node connection failed".into()),
                    ..BatchOutcome::default()
                }
            }
            Err(e) => {
                return BatchOutcome {
                    error: Some(e.to_string()),
                    ..BatchOutcome::default()
                }
            }
        };

        let status = response.status();
        // 200: processed synchronously. 202: accepted for async intake.
        if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::ACCEPTED {
            let detail = response
                .json::<NodeResponse<Value>>()
                .await
                .ok()
                .and_then(|r| r.message)
                .unwrap_or_default();
            return BatchOutcome {
                error: Some(format!("batch rejected: HTTP {} {}", status, detail).trim().into()),
                ..BatchOutcome::default()
            };
        }

        let data = response
            .json::<NodeResponse<QueueBatchData>>()
            .await
            .ok()
            .and_then(|r| r.data)
            .unwrap_or_default();

        // A 202 without counts still means the whole batch was taken.
        let accepted_count = data
            .accepted_count
            .unwrap_or(if status == reqwest::StatusCode::ACCEPTED {
                task_count
            } else {
                0
            });

        BatchOutcome {
            success: true,
            batch_id: Some(data.batch_id.unwrap_or_else(|| batch_id.to_string())),
            accepted_count,
            rejected_count: data.rejected_count,
            accepted_tasks: data.accepted_tasks,
            rejected_tasks: data.rejected_tasks,
            ..BatchOutcome::default()
        }
    }

    /// Look a node up through the registry cache (for callers that only
    /// hold the public id, e.g. cancellation).
    pub async fn registry_node(&self, node_id: NodeId) -> Option<Node> {
        self.registry.get_by_public_id(node_id).await.ok().flatten()
    }

    // --- Queue control proxies to a node ---

    pub async fn node_queue_status(&self, node: &Node) -> Result<Value, antcode_common::AntCodeError> {
        let url = format!("{}/queue/status", node.base_url());
        let response = self
            .http
            .get(&url)
            .bearer_auth(&node.api_key)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| antcode_common::AntCodeError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(antcode_common::AntCodeError::Transport(format!(
                "queue status failed: HTTP {}",
                response.status()
            )));
        }

        let wrapped = response
            .json::<NodeResponse<Value>>()
            .await
            .map_err(|e| antcode_common::AntCodeError::Transport(e.to_string()))?;
        Ok(wrapped.data.unwrap_or(Value::Null))
    }

    pub async fn update_task_priority(
        &self,
        node: &Node,
        task_id: &str,
        priority: i32,
    ) -> Result<PriorityUpdateData, antcode_common::AntCodeError> {
        let url = format!("{}/queue/tasks/{}/priority", node.base_url(), task_id);
        let response = self
            .http
            .put(&url)
            .bearer_auth(&node.api_key)
            .json(&serde_json::json!({ "priority": priority }))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| antcode_common::AntCodeError::Transport(e.to_string()))?;

        match response.status() {
            reqwest::StatusCode::OK => {
                let wrapped = response
                    .json::<NodeResponse<PriorityUpdateData>>()
                    .await
                    .map_err(|e| antcode_common::AntCodeError::Transport(e.to_string()))?;
                Ok(wrapped.data.unwrap_or_default())
            }
            reqwest::StatusCode::NOT_FOUND => Err(antcode_common::AntCodeError::NotFound(format!(
                "queued task {}",
                task_id
            ))),
            status => Err(antcode_common::AntCodeError::Transport(format!(
                "priority update failed: HTTP {}",
                status
            ))),
        }
    }

    pub async fn cancel_queued_task(
        &self,
        node: &Node,
        task_id: &str,
    ) -> Result<bool, antcode_common::AntCodeError> {
        let url = format!("{}/queue/tasks/{}", node.base_url(), task_id);
        let response = self
            .http
            .delete(&url)
            .bearer_auth(&node.api_key)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| antcode_common::AntCodeError::Transport(e.to_string()))?;

        Ok(response.status().is_success())
    }

    pub async fn task_status_from_node(
        &self,
        node: &Node,
        task_id: &str,
    ) -> Result<Value, antcode_common::AntCodeError> {
        let url = format!("{}/tasks/{}", node.base_url(), task_id);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&node.api_key)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| antcode_common::AntCodeError::Transport(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(antcode_common::AntCodeError::NotFound(format!(
                "task {} on node {}",
                task_id, node.name
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| antcode_common::AntCodeError::Transport(e.to_string()))
    }

    pub async fn task_logs_from_node(
        &self,
        node: &Node,
        task_id: &str,
        log_type: &str,
        tail: u32,
    ) -> Result<Value, antcode_common::AntCodeError> {
        let url = format!("{}/tasks/{}/logs", node.base_url(), task_id);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&node.api_key)
            .query(&[("log_type", log_type), ("tail", &tail.to_string())])
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| antcode_common::AntCodeError::Transport(e.to_string()))?;

        response
            .json::<Value>()
            .await
            .map_err(|e| antcode_common::AntCodeError::Transport(e.to_string()))
    }
}
