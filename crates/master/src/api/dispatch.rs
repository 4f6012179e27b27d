use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use antcode_common::api::node::TaskEnvelope;
use antcode_common::ids::NodeId;
use antcode_common::types::{Node, ProjectType};
use antcode_common::AntCodeError;

use super::{current_user, require_admin, ApiError, ApiResult, AppState};
use crate::dispatch::DispatchTarget;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/nodes/dispatch/task", post(dispatch_task))
        .route("/nodes/dispatch/batch", post(dispatch_batch))
        .route("/nodes/dispatch/queue/{node}/status", get(queue_status))
        .route(
            "/nodes/dispatch/queue/{node}/tasks/{tid}/priority",
            put(update_priority),
        )
        .route(
            "/nodes/dispatch/queue/{node}/tasks/{tid}",
            delete(cancel_queued).get(task_status),
        )
        .route(
            "/nodes/dispatch/queue/{node}/tasks/{tid}/logs",
            get(task_logs),
        )
}

async fn resolve_node(state: &AppState, id: &str) -> ApiResult<Node> {
    let node = match NodeId::parse(id) {
        Some(public_id) => state.registry.get_by_public_id(public_id).await?,
        None => None,
    };
    node.ok_or_else(|| ApiError(AntCodeError::NotFound(format!("node {}", id))))
}

#[derive(Deserialize)]
struct DispatchTaskRequest {
    /// Execution id keying the node's queue.
    task_id: String,
    project_id: String,
    #[serde(default = "default_project_type")]
    project_type: ProjectType,
    #[serde(default)]
    priority: Option<i32>,
    #[serde(default)]
    params: Map<String, Value>,
    #[serde(default)]
    environment: HashMap<String, String>,
    #[serde(default = "default_timeout")]
    timeout: u64,
    #[serde(default)]
    node_id: Option<NodeId>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    require_render: bool,
}

fn default_project_type() -> ProjectType {
    ProjectType::Code
}

fn default_timeout() -> u64 {
    3600
}

async fn dispatch_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<DispatchTaskRequest>,
) -> ApiResult<Json<Value>> {
    require_admin(&state, &headers).await?;
    let outcome = state
        .dispatcher
        .dispatch_task(
            &request.task_id,
            &request.project_id,
            request.project_type,
            request.priority,
            request.params,
            request.environment,
            request.timeout,
            DispatchTarget {
                node_id: request.node_id,
                region: request.region,
                tags: request.tags,
                require_render: request.require_render,
            },
        )
        .await;

    Ok(Json(json!(outcome)))
}

#[derive(Deserialize)]
struct DispatchBatchRequest {
    tasks: Vec<TaskEnvelope>,
    #[serde(default)]
    node_id: Option<NodeId>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    require_render: bool,
}

async fn dispatch_batch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<DispatchBatchRequest>,
) -> ApiResult<Json<Value>> {
    require_admin(&state, &headers).await?;
    let outcome = state
        .dispatcher
        .dispatch_batch(
            request.tasks,
            DispatchTarget {
                node_id: request.node_id,
                region: request.region,
                tags: request.tags,
                require_render: request.require_render,
            },
        )
        .await;

    Ok(Json(json!(outcome)))
}

async fn queue_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(node): Path<String>,
) -> ApiResult<Json<Value>> {
    current_user(&state, &headers).await?;
    let node = resolve_node(&state, &node).await?;
    let status = state.dispatcher.node_queue_status(&node).await?;
    Ok(Json(status))
}

#[derive(Deserialize)]
struct PriorityRequest {
    priority: i32,
}

async fn update_priority(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((node, tid)): Path<(String, String)>,
    Json(request): Json<PriorityRequest>,
) -> ApiResult<Json<Value>> {
    require_admin(&state, &headers).await?;
    let node = resolve_node(&state, &node).await?;
    let result = state
        .dispatcher
        .update_task_priority(&node, &tid, request.priority)
        .await?;
    Ok(Json(json!({
        "task_id": tid,
        "new_priority": result.new_priority,
        "new_position": result.new_position,
    })))
}

async fn cancel_queued(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((node, tid)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    require_admin(&state, &headers).await?;
    let node = resolve_node(&state, &node).await?;
    let cancelled = state.dispatcher.cancel_queued_task(&node, &tid).await?;
    Ok(Json(json!({ "cancelled": cancelled })))
}

async fn task_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((node, tid)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    current_user(&state, &headers).await?;
    let node = resolve_node(&state, &node).await?;
    let status = state.dispatcher.task_status_from_node(&node, &tid).await?;
    Ok(Json(status))
}

#[derive(Deserialize)]
struct TaskLogsQuery {
    #[serde(default = "default_log_type")]
    log_type: String,
    #[serde(default = "default_tail")]
    tail: u32,
}

fn default_log_type() -> String {
    "output".into()
}

fn default_tail() -> u32 {
    100
}

async fn task_logs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((node, tid)): Path<(String, String)>,
    axum::extract::Query(query): axum::extract::Query<TaskLogsQuery>,
) -> ApiResult<Json<Value>> {
    current_user(&state, &headers).await?;
    let node = resolve_node(&state, &node).await?;
    let logs = state
        .dispatcher
        .task_logs_from_node(&node, &tid, &query.log_type, query.tail)
        .await?;
    Ok(Json(logs))
}
