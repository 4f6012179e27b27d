mod dispatch;
mod nodes;
mod projects;
mod scheduler;
mod workers;

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;

use antcode_common::config::MasterConfig;
use antcode_common::AntCodeError;

use crate::auth::{InstallKeyService, NodeAuthVerifier};
use crate::balancer::NodeLoadBalancer;
use crate::cache::UnifiedCache;
use crate::checkpoint::RecoveryService;
use crate::dispatch::NodeDispatcher;
use crate::ingest::ReportIngestor;
use crate::logs::TaskLogService;
use crate::registry::{HeartbeatMonitor, NodeRegistry};
use crate::scheduler::SchedulerService;
use crate::store::StoreClient;
use crate::sync::ProjectSyncService;

/// Shared application state accessible from axum handlers.
pub struct AppState {
    pub config: Arc<MasterConfig>,
    pub store: Arc<StoreClient>,
    pub cache: Arc<UnifiedCache>,
    pub registry: Arc<NodeRegistry>,
    pub balancer: Arc<NodeLoadBalancer>,
    pub dispatcher: Arc<NodeDispatcher>,
    pub scheduler: Arc<SchedulerService>,
    pub monitor: Arc<HeartbeatMonitor>,
    pub recovery: Arc<RecoveryService>,
    pub ingestor: Arc<ReportIngestor>,
    pub install_keys: Arc<InstallKeyService>,
    pub node_auth: Arc<NodeAuthVerifier>,
    pub logs: Arc<TaskLogService>,
    pub sync: Arc<ProjectSyncService>,
    pub metrics_handle: PrometheusHandle,
}

/// Error wrapper mapping the taxonomy onto HTTP statuses.
pub struct ApiError(pub AntCodeError);

impl<E: Into<AntCodeError>> From<E> for ApiError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AntCodeError::Validation(_) => StatusCode::BAD_REQUEST,
            AntCodeError::Conflict(_) => StatusCode::CONFLICT,
            AntCodeError::Permission(_) => StatusCode::FORBIDDEN,
            AntCodeError::NotFound(_) => StatusCode::NOT_FOUND,
            AntCodeError::NodeUnavailable(_) | AntCodeError::QueueUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AntCodeError::Transport(_) | AntCodeError::WorkerRejected(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }

        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Resolve the calling user from its bearer token. User management itself
/// is external; this layer only maps tokens onto user rows for the ACL
/// checks.
pub(crate) async fn current_user(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<crate::store::UserRecord, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError(AntCodeError::Permission(
            "missing user credentials".into(),
        )))?;

    state
        .store
        .get_user_by_token(token)
        .await?
        .ok_or(ApiError(AntCodeError::Permission(
            "invalid user credentials".into(),
        )))
}

/// Admin-only surfaces reject everyone else.
pub(crate) async fn require_admin(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<crate::store::UserRecord, ApiError> {
    let user = current_user(state, headers).await?;
    if !user.is_admin {
        return Err(ApiError(AntCodeError::Permission(
            "administrator privileges required".into(),
        )));
    }
    Ok(user)
}

/// Owned resources are visible and mutable to their owner and to admins.
pub(crate) fn check_owner(user: &crate::store::UserRecord, owner_id: i64) -> Result<(), ApiError> {
    if user.is_admin || user.id == owner_id {
        Ok(())
    } else {
        Err(ApiError(AntCodeError::Permission(
            "not the owner of this resource".into(),
        )))
    }
}

/// Build the full HTTP surface.
pub fn router(state: Arc<AppState>) -> Router {
    let v1 = Router::new()
        .merge(scheduler::routes())
        .merge(nodes::routes())
        .merge(dispatch::routes())
        .merge(workers::routes())
        .merge(projects::routes());

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/cache/stats", get(cache_stats_handler))
        .nest("/api/v1", v1)
        .with_state(state)
}

/// Health check endpoint. Reports database and queue reachability.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let postgres_ok = state.store.health_check().await.is_ok();
    let queue_status = state.dispatcher.master_queue_status().await;

    let all_healthy = postgres_ok && queue_status.healthy;
    let status = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = serde_json::json!({
        "status": if all_healthy { "healthy" } else { "unhealthy" },
        "services": {
            "postgres": if postgres_ok { "healthy" } else { "unhealthy" },
            "queue": if queue_status.healthy { "healthy" } else { "unhealthy" },
        },
        "queue_backend": queue_status.backend_type,
    });

    (status, Json(body))
}

/// Prometheus metrics endpoint.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

/// Unified cache hit/miss counters, for operational debugging.
async fn cache_stats_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!(state.cache.stats()))
}
