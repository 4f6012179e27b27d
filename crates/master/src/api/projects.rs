use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use antcode_common::ids::ProjectId;
use antcode_common::types::{ExecutionStrategy, Node, Project, ProjectSpec};
use antcode_common::AntCodeError;

use super::{check_owner, current_user, ApiError, ApiResult, AppState};
use crate::store::UserRecord;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/projects", post(create_project))
        .route(
            "/projects/{id}",
            get(get_project).put(update_project).delete(delete_project),
        )
        .route("/projects/{id}/node-download", get(node_download))
        .route("/projects/{id}/sync-callback", post(sync_callback))
}

/// The content hash doubles as the artifact version. Code projects hash
/// their source at write time; file projects carry the archive hash.
fn content_hash_for(spec: &ProjectSpec) -> Option<String> {
    match spec {
        ProjectSpec::Code(code) => {
            use sha2::{Digest, Sha256};
            Some(hex::encode(Sha256::digest(code.source.as_bytes())))
        }
        ProjectSpec::File(file) => Some(file.file_hash.clone()),
        ProjectSpec::Rule(_) => None,
    }
}

async fn resolve_project(state: &AppState, id: &str) -> ApiResult<Project> {
    let project = match ProjectId::parse(id) {
        Some(public_id) => state.store.get_project_by_public_id(public_id).await?,
        None => match id.parse::<i64>() {
            Ok(internal) => state.store.get_project(internal).await?,
            Err(_) => None,
        },
    };
    project.ok_or_else(|| ApiError(AntCodeError::NotFound(format!("project {}", id))))
}

/// Resolve a project for a user-facing handler and enforce ownership.
async fn resolve_owned_project(
    state: &AppState,
    user: &UserRecord,
    id: &str,
) -> ApiResult<Project> {
    let project = resolve_project(state, id).await?;
    check_owner(user, project.user_id)?;
    Ok(project)
}

#[derive(Deserialize)]
struct CreateProjectRequest {
    name: String,
    #[serde(default)]
    description: String,
    spec: ProjectSpec,
    #[serde(default)]
    bound_node_id: Option<antcode_common::ids::NodeId>,
    #[serde(default)]
    execution_strategy: Option<ExecutionStrategy>,
    #[serde(default)]
    fallback_enabled: bool,
}

async fn create_project(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CreateProjectRequest>,
) -> ApiResult<impl IntoResponse> {
    let user = current_user(&state, &headers).await?;

    let bound_node_id = match request.bound_node_id {
        Some(node_id) => Some(
            state
                .registry
                .get_by_public_id(node_id)
                .await?
                .ok_or_else(|| ApiError(AntCodeError::NotFound(format!("node {}", node_id))))?
                .id,
        ),
        None => None,
    };

    let file_hash = content_hash_for(&request.spec);

    let mut project = Project {
        id: 0,
        public_id: ProjectId::new(),
        user_id: user.id,
        name: request.name,
        description: request.description,
        spec: request.spec,
        file_hash,
        bound_node_id,
        execution_strategy: request.execution_strategy,
        fallback_enabled: request.fallback_enabled,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };

    project.id = state.store.create_project(&project).await?;

    tracing::info!(project = %project.name, "Project created");
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Project>> {
    let user = current_user(&state, &headers).await?;
    let project = resolve_owned_project(&state, &user, &id).await?;
    Ok(Json(project))
}

#[derive(Deserialize)]
struct UpdateProjectRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    spec: Option<ProjectSpec>,
    #[serde(default)]
    bound_node_id: Option<antcode_common::ids::NodeId>,
    #[serde(default)]
    execution_strategy: Option<ExecutionStrategy>,
    #[serde(default)]
    fallback_enabled: Option<bool>,
}

async fn update_project(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<UpdateProjectRequest>,
) -> ApiResult<Json<Project>> {
    let user = current_user(&state, &headers).await?;
    let mut project = resolve_owned_project(&state, &user, &id).await?;

    if let Some(name) = request.name {
        project.name = name;
    }
    if let Some(description) = request.description {
        project.description = description;
    }
    if let Some(node_id) = request.bound_node_id {
        let node = state
            .registry
            .get_by_public_id(node_id)
            .await?
            .ok_or_else(|| ApiError(AntCodeError::NotFound(format!("node {}", node_id))))?;
        project.bound_node_id = Some(node.id);
    }
    if let Some(strategy) = request.execution_strategy {
        project.execution_strategy = Some(strategy);
    }
    if let Some(fallback) = request.fallback_enabled {
        project.fallback_enabled = fallback;
    }

    let content_changed = if let Some(spec) = request.spec {
        if spec.project_type() != project.project_type() {
            return Err(ApiError(AntCodeError::Validation(
                "a project's variant cannot change".into(),
            )));
        }
        project.file_hash = content_hash_for(&spec);
        project.spec = spec;
        true
    } else {
        false
    };

    state.store.update_project_spec(&project).await?;

    // A new artifact version invalidates every node's copy; the next
    // dispatch re-syncs.
    if content_changed {
        let outdated = state
            .store
            .mark_project_outdated(project.public_id)
            .await?;
        if outdated > 0 {
            tracing::info!(
                project = %project.name,
                nodes = outdated,
                "Per-node copies marked outdated"
            );
        }
    }

    tracing::info!(project = %project.name, "Project updated");
    Ok(Json(project))
}

async fn delete_project(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers).await?;
    let project = resolve_owned_project(&state, &user, &id).await?;
    state.store.delete_project(project.id).await?;

    tracing::info!(project = %project.name, "Project deleted");
    Ok(Json(json!({ "deleted": true })))
}

/// Authenticate a node's pull request by its bearer api key.
async fn authenticate_node(state: &AppState, headers: &HeaderMap) -> ApiResult<Node> {
    let api_key = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError(AntCodeError::Permission(
            "missing node credentials".into(),
        )))?;

    state
        .store
        .get_node_by_api_key(api_key)
        .await?
        .ok_or(ApiError(AntCodeError::Permission(
            "unrecognized node credentials".into(),
        )))
}

#[derive(Deserialize)]
struct SyncCallbackRequest {
    file_hash: String,
    file_size: u64,
    transfer_method: String,
    /// Per-file manifest of what the node now holds, for incremental
    /// transfer next time.
    #[serde(default)]
    files: Vec<SyncedFile>,
}

#[derive(Deserialize)]
struct SyncedFile {
    path: String,
    hash: String,
}

/// A node confirms it finished pulling an artifact. Records the sync, the
/// per-file manifest, and answers with the delta against the previous
/// manifest.
async fn sync_callback(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<SyncCallbackRequest>,
) -> ApiResult<Json<Value>> {
    let node = authenticate_node(&state, &headers).await?;
    let project = resolve_project(&state, &id).await?;

    let reported: Vec<(String, String)> = request
        .files
        .into_iter()
        .map(|f| (f.path, f.hash))
        .collect();
    let diff = state
        .sync
        .incremental_changes(&node, &project, &reported)
        .await?;

    let node_project_id = state
        .store
        .record_project_sync(
            node.id,
            project.id,
            project.public_id,
            &request.file_hash,
            request.file_size,
            &request.transfer_method,
        )
        .await?;
    if !reported.is_empty() {
        state
            .store
            .replace_node_project_files(node_project_id, &reported)
            .await?;
    }

    tracing::info!(
        project = %project.name,
        node = %node.name,
        method = %request.transfer_method,
        "Node confirmed artifact sync"
    );
    Ok(Json(json!({ "recorded": true, "diff": diff })))
}

/// Artifact pull endpoint for workers re-syncing on their own.
async fn node_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let node = authenticate_node(&state, &headers).await?;
    let project = resolve_project(&state, &id).await?;

    match &project.spec {
        ProjectSpec::File(file) => {
            let bytes = tokio::fs::read(&file.archive_path).await.map_err(|e| {
                ApiError(AntCodeError::NotFound(format!(
                    "archive for project {}: {}",
                    project.public_id, e
                )))
            })?;

            state
                .store
                .mark_node_project_used(node.id, project.public_id)
                .await?;

            tracing::info!(
                project = %project.name,
                node = %node.name,
                bytes = bytes.len(),
                "Archive served to node"
            );

            let headers = [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", file.original_name),
                ),
                (
                    header::HeaderName::from_static("x-transfer-method"),
                    "original".to_string(),
                ),
                (
                    header::HeaderName::from_static("x-file-hash"),
                    file.file_hash.clone(),
                ),
                (
                    header::HeaderName::from_static("x-file-size"),
                    file.file_size.to_string(),
                ),
            ];
            Ok((headers, bytes))
        }
        ProjectSpec::Code(_) => Err(ApiError(AntCodeError::Validation(
            "code projects transfer inline, not by download".into(),
        ))),
        ProjectSpec::Rule(_) => Err(ApiError(AntCodeError::Validation(
            "rule projects have no artifact".into(),
        ))),
    }
}
