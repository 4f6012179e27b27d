use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use antcode_common::ids::NodeId;
use antcode_common::types::{Node, NodeCapabilities, NodeStatus, ResourceLimits};
use antcode_common::AntCodeError;

use super::{current_user, require_admin, ApiError, ApiResult, AppState};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/nodes", post(create_node).get(list_nodes))
        .route("/nodes/stats", get(node_stats))
        .route("/nodes/ranking", get(node_ranking))
        .route("/nodes/cluster/metrics/history", get(cluster_metrics_history))
        .route("/nodes/connect", post(connect_node))
        .route("/nodes/{id}", get(get_node).delete(delete_node))
        .route("/nodes/{id}/rebind", post(rebind_node))
        .route("/nodes/{id}/test", post(test_node))
        .route("/nodes/{id}/disconnect", post(disconnect_node))
        .route("/nodes/{id}/queue/status", get(node_queue_status))
        .route("/nodes/{id}/sync-stats", get(node_sync_stats))
}

async fn resolve_node(state: &AppState, id: &str) -> ApiResult<Node> {
    let node = match NodeId::parse(id) {
        Some(public_id) => state.registry.get_by_public_id(public_id).await?,
        None => match id.parse::<i64>() {
            Ok(internal) => state.registry.get(internal).await?,
            Err(_) => None,
        },
    };
    node.ok_or_else(|| ApiError(AntCodeError::NotFound(format!("node {}", id))))
}

fn random_hex(bytes: usize) -> String {
    use rand::RngCore;
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[derive(Deserialize)]
struct CreateNodeRequest {
    name: String,
    host: String,
    port: u16,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    capabilities: NodeCapabilities,
    #[serde(default)]
    resource_limits: Option<ResourceLimits>,
}

async fn create_node(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CreateNodeRequest>,
) -> ApiResult<impl IntoResponse> {
    require_admin(&state, &headers).await?;

    if state
        .store
        .get_node_by_address(&request.host, request.port)
        .await?
        .is_some()
    {
        return Err(ApiError(AntCodeError::Conflict(format!(
            "node address {}:{} already registered",
            request.host, request.port
        ))));
    }

    let mut node = Node {
        id: 0,
        public_id: NodeId::new(),
        name: request.name,
        host: request.host,
        port: request.port,
        status: NodeStatus::Offline,
        region: request.region,
        tags: request.tags,
        capabilities: request.capabilities,
        metrics: None,
        last_heartbeat: None,
        api_key: random_hex(24),
        secret_key: random_hex(32),
        resource_limits: request.resource_limits,
        machine_code: None,
        version: None,
        os_type: None,
        created_at: Utc::now(),
    };

    node.id = state.store.create_node(&node).await?;
    state.registry.insert(node.clone()).await;

    tracing::info!(node = %node.name, "Node created");

    // Creation is the one place credentials are returned in full.
    let body = json!({
        "node_id": node.public_id,
        "name": node.name,
        "host": node.host,
        "port": node.port,
        "api_key": node.api_key,
        "secret_key": node.secret_key,
    });
    Ok((StatusCode::CREATED, Json(body)))
}

#[derive(Deserialize)]
struct ListNodesQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    search: Option<String>,
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_size")]
    size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_size() -> u32 {
    20
}

async fn list_nodes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListNodesQuery>,
) -> ApiResult<Json<Value>> {
    current_user(&state, &headers).await?;
    let status = query.status.as_deref().and_then(NodeStatus::parse);
    let (nodes, total) = state
        .store
        .list_nodes(
            status,
            query.region.as_deref(),
            query.search.as_deref(),
            query.page,
            query.size,
        )
        .await?;

    Ok(Json(json!({
        "nodes": nodes,
        "total": total,
        "page": query.page,
        "size": query.size,
    })))
}

async fn node_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    current_user(&state, &headers).await?;
    let mut stats = state.store.node_aggregate_stats().await?;
    stats.suspended = state.registry.suspended_count().await;

    // Capacity figures come from the live cache rather than another query.
    for node in state.registry.all_cached().await {
        if node.status == NodeStatus::Online {
            stats.total_capacity += node.max_concurrent_tasks() as u64;
            if let Some(metrics) = &node.metrics {
                stats.total_running_tasks += metrics.running_tasks as u64;
            }
        }
    }

    Ok(Json(json!(stats)))
}

#[derive(Deserialize)]
struct RankingQuery {
    #[serde(default)]
    region: Option<String>,
    #[serde(default = "default_top_n")]
    top_n: usize,
}

fn default_top_n() -> usize {
    10
}

async fn node_ranking(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<RankingQuery>,
) -> ApiResult<Json<Value>> {
    current_user(&state, &headers).await?;
    let nodes = state.registry.online().await?;
    let rankings = state
        .balancer
        .rank(&nodes, query.region.as_deref(), query.top_n)
        .await;
    Ok(Json(json!({ "rankings": rankings })))
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_hours")]
    hours: i64,
}

fn default_hours() -> i64 {
    24
}

async fn cluster_metrics_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    current_user(&state, &headers).await?;
    let history = state
        .store
        .cluster_metrics_history(query.hours.clamp(1, 720))
        .await?;
    Ok(Json(json!({ "history": history })))
}

#[derive(Deserialize)]
struct ConnectNodeRequest {
    host: String,
    port: u16,
    machine_code: String,
}

/// Connect an already-registered node by address. The machine code must
/// match the stored fingerprint (or set it on first connect).
async fn connect_node(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ConnectNodeRequest>,
) -> ApiResult<Json<Value>> {
    current_user(&state, &headers).await?;
    let node = state
        .store
        .get_node_by_address(&request.host, request.port)
        .await?
        .ok_or_else(|| {
            ApiError(AntCodeError::NotFound(format!(
                "no node registered at {}:{}",
                request.host, request.port
            )))
        })?;

    match &node.machine_code {
        Some(stored) if stored != &request.machine_code => {
            return Err(ApiError(AntCodeError::Conflict(
                "machine code does not match the registered host".into(),
            )));
        }
        Some(_) => {}
        None => {
            state
                .store
                .set_node_machine_code(node.id, &request.machine_code)
                .await?;
        }
    }

    state
        .store
        .update_node_probe(node.id, NodeStatus::Online, None, None, None)
        .await?;
    state
        .registry
        .update_cached(node.id, |cached| {
            cached.status = NodeStatus::Online;
            cached.last_heartbeat = Some(Utc::now());
            cached.machine_code = Some(request.machine_code.clone());
        })
        .await;

    tracing::info!(node = %node.name, "Node connected");
    Ok(Json(json!({ "node_id": node.public_id, "status": "online" })))
}

async fn get_node(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    current_user(&state, &headers).await?;
    let node = resolve_node(&state, &id).await?;
    let probe_state = state.registry.probe_state(node.id).await;

    let mut body = serde_json::to_value(&node)?;
    if let Value::Object(map) = &mut body {
        map.insert(
            "suspended".into(),
            json!(probe_state.as_ref().is_some_and(|s| s.suspended)),
        );
        map.insert(
            "probe_failures".into(),
            json!(probe_state.map(|s| s.failures).unwrap_or(0)),
        );
    }
    Ok(Json(body))
}

async fn delete_node(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    require_admin(&state, &headers).await?;
    let node = resolve_node(&state, &id).await?;

    state.store.delete_node(node.id).await?;
    state.registry.remove(node.id).await;

    tracing::info!(node = %node.name, "Node deleted");
    Ok(Json(json!({ "deleted": true })))
}

#[derive(Deserialize)]
struct RebindRequest {
    machine_code: String,
}

/// Re-pin the node identity to a new hardware fingerprint (host swap).
async fn rebind_node(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<RebindRequest>,
) -> ApiResult<Json<Value>> {
    require_admin(&state, &headers).await?;
    let node = resolve_node(&state, &id).await?;

    state
        .store
        .set_node_machine_code(node.id, &request.machine_code)
        .await?;
    state
        .registry
        .update_cached(node.id, |cached| {
            cached.machine_code = Some(request.machine_code.clone());
        })
        .await;

    tracing::info!(node = %node.name, "Node machine code rebound");
    Ok(Json(json!({ "rebound": true })))
}

/// Forcibly probe a node; success revives a suspended one.
async fn test_node(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    current_user(&state, &headers).await?;
    let node = resolve_node(&state, &id).await?;
    let online = state.monitor.manual_test(node.id).await?;
    Ok(Json(json!({ "node_id": node.public_id, "online": online })))
}

async fn disconnect_node(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    require_admin(&state, &headers).await?;
    let node = resolve_node(&state, &id).await?;

    state
        .store
        .set_node_status(node.id, NodeStatus::Offline)
        .await?;
    state
        .registry
        .update_cached(node.id, |cached| cached.status = NodeStatus::Offline)
        .await;

    tracing::info!(node = %node.name, "Node disconnected");
    Ok(Json(json!({ "disconnected": true })))
}

async fn node_queue_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    current_user(&state, &headers).await?;
    let node = resolve_node(&state, &id).await?;
    let status = state.dispatcher.node_queue_status(&node).await?;
    Ok(Json(status))
}

/// Artifact sync totals per transfer method for one node.
async fn node_sync_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    current_user(&state, &headers).await?;
    let node = resolve_node(&state, &id).await?;
    let stats = state.store.node_project_sync_stats(Some(node.id)).await?;

    let by_method: serde_json::Map<String, Value> = stats
        .into_iter()
        .map(|(method, count)| (method, json!(count)))
        .collect();
    Ok(Json(json!({ "node_id": node.public_id, "syncs": by_method })))
}
