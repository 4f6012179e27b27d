use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use antcode_common::api::worker::{
    RegisterByKeyRequest, ReportHeartbeatRequest, ReportLogRequest, ReportLogsBatchRequest,
    ReportProgressRequest, ReportTaskRequest,
};
use antcode_common::ids::NodeId;
use antcode_common::types::Node;
use antcode_common::AntCodeError;

use super::{ApiError, ApiResult, AppState};
use crate::auth::{AuthError, ReportHeaders};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/workers/report-log", post(report_log))
        .route("/workers/report-logs-batch", post(report_logs_batch))
        .route("/workers/report-heartbeat", post(report_heartbeat))
        .route("/workers/report-progress", post(report_progress))
        .route("/workers/report-task", post(report_task))
        .route("/workers/generate-install-key", post(generate_install_key))
        .route("/workers/register-by-key", post(register_by_key))
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn extract_report_headers(headers: &HeaderMap) -> Result<ReportHeaders, ApiError> {
    let api_key = header(headers, "authorization")
        .and_then(|v| v.strip_prefix("Bearer ").map(str::to_string))
        .ok_or(ApiError(AuthError::MissingHeaders.into()))?;

    let node_id = header(headers, "x-node-id");
    let machine_code = header(headers, "x-machine-code");
    let timestamp = header(headers, "x-timestamp").and_then(|v| v.parse::<i64>().ok());
    let nonce = header(headers, "x-nonce");
    let signature = header(headers, "x-signature");

    match (node_id, machine_code, timestamp, nonce, signature) {
        (Some(node_id), Some(machine_code), Some(timestamp), Some(nonce), Some(signature)) => {
            Ok(ReportHeaders {
                node_id,
                machine_code,
                timestamp,
                nonce,
                signature,
                api_key,
            })
        }
        _ => Err(ApiError(AuthError::MissingHeaders.into())),
    }
}

/// Authenticate a worker report: load the node, verify the HMAC signature
/// over the raw body, and hand back the node plus the typed payload.
async fn authenticate<T: DeserializeOwned>(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(Node, T), ApiError> {
    let report_headers = extract_report_headers(headers)?;

    let node_id = NodeId::parse(&report_headers.node_id)
        .ok_or(ApiError(AuthError::UnknownNode.into()))?;
    let node = state
        .registry
        .get_by_public_id(node_id)
        .await?
        .ok_or(ApiError(AuthError::UnknownNode.into()))?;

    let raw: Value = serde_json::from_slice(body)
        .map_err(|e| ApiError(AntCodeError::Validation(format!("invalid JSON body: {}", e))))?;

    state
        .node_auth
        .verify(&node, &report_headers, &raw)
        .map_err(|e| ApiError(e.into()))?;

    let typed: T = serde_json::from_value(raw)
        .map_err(|e| ApiError(AntCodeError::Validation(format!("invalid payload: {}", e))))?;
    Ok((node, typed))
}

async fn report_log(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> ApiResult<Json<Value>> {
    let (_node, request): (_, ReportLogRequest) = authenticate(&state, &headers, &body).await?;
    state.ingestor.report_log(request).await?;
    Ok(Json(json!({ "accepted": true })))
}

async fn report_logs_batch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> ApiResult<Json<Value>> {
    let (_node, request): (_, ReportLogsBatchRequest) =
        authenticate(&state, &headers, &body).await?;
    let result = Arc::clone(&state.ingestor).report_logs_batch(request).await;
    Ok(Json(json!(result)))
}

async fn report_heartbeat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> ApiResult<Json<Value>> {
    let (_node, request): (_, ReportHeartbeatRequest) =
        authenticate(&state, &headers, &body).await?;
    let known = state.ingestor.report_heartbeat(request).await?;
    Ok(Json(json!({ "accepted": known })))
}

async fn report_progress(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> ApiResult<Json<Value>> {
    let (_node, request): (_, ReportProgressRequest) =
        authenticate(&state, &headers, &body).await?;
    state.ingestor.report_progress(request).await?;
    Ok(Json(json!({ "accepted": true })))
}

async fn report_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> ApiResult<Json<Value>> {
    let (_node, request): (_, ReportTaskRequest) = authenticate(&state, &headers, &body).await?;
    state.ingestor.report_task(request).await?;
    Ok(Json(json!({ "accepted": true })))
}

/// Mint a one-shot install key. Admin only.
async fn generate_install_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let admin = super::require_admin(&state, &headers).await?;
    let response = state.install_keys.generate(Some(admin.id)).await?;
    Ok(Json(json!(response)))
}

/// Consume an install key and register the calling worker. Unauthenticated
/// by design; the key plus source binding is the credential.
async fn register_by_key(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<RegisterByKeyRequest>,
) -> ApiResult<Json<Value>> {
    // Honor the proxy header when present; the socket address otherwise.
    let source = header(&headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|s| s.trim().to_string()))
        .unwrap_or_else(|| addr.ip().to_string());

    let (_node, response) = state.install_keys.register(&request, &source).await?;
    Ok(Json(json!(response)))
}
