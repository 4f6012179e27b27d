use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use antcode_common::api::worker::LogType;
use antcode_common::ids::{ExecutionId, ProjectId, TaskId};
use antcode_common::types::{ExecutionStrategy, ScheduleKind, ScheduledTask, TaskStatus};
use antcode_common::AntCodeError;

use super::{check_owner, current_user, require_admin, ApiError, ApiResult, AppState};
use crate::store::{StoreClient, UserRecord};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/scheduler/tasks", post(create_task).get(list_tasks))
        .route(
            "/scheduler/tasks/{id}",
            get(get_task).put(update_task).delete(delete_task),
        )
        .route("/scheduler/tasks/{id}/pause", post(pause_task))
        .route("/scheduler/tasks/{id}/resume", post(resume_task))
        .route("/scheduler/tasks/{id}/trigger", post(trigger_task))
        .route("/scheduler/tasks/{id}/executions", get(list_executions))
        .route("/scheduler/tasks/{id}/stats", get(task_stats))
        .route("/scheduler/executions/{id}/cancel", post(cancel_execution))
        .route("/scheduler/executions/{id}/retry", post(retry_execution))
        .route("/scheduler/executions/{id}/recover", post(recover_execution))
        .route("/scheduler/executions/{id}", get(get_execution))
        .route("/scheduler/executions/{id}/logs/file", get(execution_logs))
        .route("/scheduler/stats", get(scheduler_stats))
        .route("/scheduler/running", get(running_tasks))
        .route("/scheduler/retries", get(pending_retries))
        .route("/scheduler/queue/status", get(master_queue_status))
        .route(
            "/scheduler/queue/tasks/{tid}/priority",
            axum::routing::put(master_queue_priority),
        )
        .route(
            "/scheduler/queue/tasks/{tid}",
            axum::routing::delete(master_queue_cancel),
        )
}

/// Resolve a path id that may be either a public UUID or an internal row
/// id, and enforce ownership.
async fn resolve_task(store: &StoreClient, user: &UserRecord, id: &str) -> ApiResult<ScheduledTask> {
    let task = match TaskId::parse(id) {
        Some(public_id) => store.get_task_by_public_id(public_id).await?,
        None => match id.parse::<i64>() {
            Ok(internal) => store.get_task(internal).await?,
            Err(_) => None,
        },
    };
    let task = task.ok_or_else(|| ApiError(AntCodeError::NotFound(format!("task {}", id))))?;
    check_owner(user, task.user_id)?;
    Ok(task)
}

/// Executions inherit their task's ownership. Orphans (task deleted) stay
/// visible to admins only.
async fn authorize_execution(
    store: &StoreClient,
    user: &UserRecord,
    task_id: i64,
) -> ApiResult<()> {
    match store.get_task(task_id).await? {
        Some(task) => check_owner(user, task.user_id),
        None if user.is_admin => Ok(()),
        None => Err(ApiError(AntCodeError::Permission(
            "not the owner of this resource".into(),
        ))),
    }
}

#[derive(Deserialize)]
struct CreateTaskRequest {
    name: String,
    #[serde(default)]
    description: String,
    project_id: ProjectId,
    schedule_kind: ScheduleKind,
    #[serde(default)]
    cron_expression: Option<String>,
    #[serde(default)]
    interval_seconds: Option<u64>,
    #[serde(default)]
    scheduled_time: Option<DateTime<Utc>>,
    #[serde(default = "default_active")]
    is_active: bool,
    #[serde(default)]
    timeout_seconds: Option<u64>,
    #[serde(default)]
    max_retries: u32,
    #[serde(default)]
    retry_delay_seconds: Option<u64>,
    #[serde(default = "default_priority")]
    priority: i32,
    #[serde(default)]
    execution_params: Map<String, Value>,
    #[serde(default)]
    environment_vars: HashMap<String, String>,
    #[serde(default)]
    node_id: Option<antcode_common::ids::NodeId>,
    #[serde(default)]
    execution_strategy: Option<ExecutionStrategy>,
}

fn default_active() -> bool {
    true
}

fn default_priority() -> i32 {
    2
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CreateTaskRequest>,
) -> ApiResult<impl IntoResponse> {
    let user = current_user(&state, &headers).await?;

    if !(0..=4).contains(&request.priority) {
        return Err(ApiError(AntCodeError::Validation(
            "priority must be in 0..=4".into(),
        )));
    }

    let project = state
        .store
        .get_project_by_public_id(request.project_id)
        .await?
        .ok_or_else(|| {
            ApiError(AntCodeError::NotFound(format!(
                "project {}",
                request.project_id
            )))
        })?;
    // Tasks schedule only projects the caller owns.
    check_owner(&user, project.user_id)?;

    let specified_node_id = match request.node_id {
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

    let mut task = ScheduledTask {
        id: 0,
        public_id: TaskId::new(),
        project_id: project.id,
        user_id: user.id,
        name: request.name,
        description: request.description,
        schedule_kind: request.schedule_kind,
        cron_expression: request.cron_expression,
        interval_seconds: request.interval_seconds,
        scheduled_time: request.scheduled_time,
        is_active: request.is_active,
        status: TaskStatus::Pending,
        timeout_seconds: request.timeout_seconds,
        max_retries: request.max_retries,
        retry_delay_seconds: request.retry_delay_seconds,
        priority: request.priority,
        execution_params: request.execution_params,
        environment_vars: request.environment_vars,
        specified_node_id,
        execution_strategy: request.execution_strategy,
        success_count: 0,
        failure_count: 0,
        last_run_time: None,
        next_run_time: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };

    // Reject unschedulable definitions before they reach the wheel.
    crate::scheduler::Trigger::from_task(&task)?;

    task.id = state.store.create_task(&task).await?;
    if task.is_active {
        state.scheduler.add_task(&task).await?;
    }

    tracing::info!(task = %task.name, task_id = task.id, "Task created");
    Ok((StatusCode::CREATED, Json(task)))
}

#[derive(Deserialize)]
struct ListTasksQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    is_active: Option<bool>,
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

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListTasksQuery>,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers).await?;
    // Admins see the whole fleet; everyone else their own tasks.
    let scope = if user.is_admin { None } else { Some(user.id) };

    let status = query.status.as_deref().and_then(TaskStatus::parse);
    let (tasks, total) = state
        .store
        .list_tasks(scope, status, query.is_active, query.page, query.size)
        .await?;

    Ok(Json(json!({
        "tasks": tasks,
        "total": total,
        "page": query.page,
        "size": query.size,
        "pages": (total + query.size as i64 - 1) / query.size.max(1) as i64,
    })))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers).await?;
    let task = resolve_task(&state.store, &user, &id).await?;
    let next_run = state.scheduler.next_run_time(task.id).await;

    let mut body = serde_json::to_value(&task)?;
    if let Value::Object(map) = &mut body {
        map.insert("next_run_time".into(), json!(next_run));
    }
    Ok(Json(body))
}

#[derive(Deserialize)]
struct UpdateTaskRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    cron_expression: Option<String>,
    #[serde(default)]
    interval_seconds: Option<u64>,
    #[serde(default)]
    scheduled_time: Option<DateTime<Utc>>,
    #[serde(default)]
    is_active: Option<bool>,
    #[serde(default)]
    timeout_seconds: Option<u64>,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    retry_delay_seconds: Option<u64>,
    #[serde(default)]
    priority: Option<i32>,
    #[serde(default)]
    execution_params: Option<Map<String, Value>>,
    #[serde(default)]
    environment_vars: Option<HashMap<String, String>>,
    #[serde(default)]
    node_id: Option<antcode_common::ids::NodeId>,
    #[serde(default)]
    execution_strategy: Option<ExecutionStrategy>,
}

async fn update_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<UpdateTaskRequest>,
) -> ApiResult<Json<ScheduledTask>> {
    let user = current_user(&state, &headers).await?;
    let mut task = resolve_task(&state.store, &user, &id).await?;

    if let Some(name) = request.name {
        task.name = name;
    }
    if let Some(description) = request.description {
        task.description = description;
    }
    if let Some(expr) = request.cron_expression {
        task.cron_expression = Some(expr);
    }
    if let Some(seconds) = request.interval_seconds {
        task.interval_seconds = Some(seconds);
    }
    if let Some(at) = request.scheduled_time {
        task.scheduled_time = Some(at);
    }
    if let Some(active) = request.is_active {
        task.is_active = active;
    }
    if let Some(timeout) = request.timeout_seconds {
        task.timeout_seconds = Some(timeout);
    }
    if let Some(retries) = request.max_retries {
        task.max_retries = retries;
    }
    if let Some(delay) = request.retry_delay_seconds {
        task.retry_delay_seconds = Some(delay);
    }
    if let Some(priority) = request.priority {
        if !(0..=4).contains(&priority) {
            return Err(ApiError(AntCodeError::Validation(
                "priority must be in 0..=4".into(),
            )));
        }
        task.priority = priority;
    }
    if let Some(params) = request.execution_params {
        task.execution_params = params;
    }
    if let Some(env) = request.environment_vars {
        task.environment_vars = env;
    }
    if let Some(node_id) = request.node_id {
        let node = state
            .registry
            .get_by_public_id(node_id)
            .await?
            .ok_or_else(|| ApiError(AntCodeError::NotFound(format!("node {}", node_id))))?;
        task.specified_node_id = Some(node.id);
    }
    if let Some(strategy) = request.execution_strategy {
        task.execution_strategy = Some(strategy);
    }

    // Validate the (possibly changed) schedule before persisting.
    crate::scheduler::Trigger::from_task(&task)?;
    state.store.update_task(&task).await?;

    // Scheduling fields changed: re-register or drop the trigger.
    if task.is_active {
        state.scheduler.add_task(&task).await?;
    } else {
        state.scheduler.remove_task(task.id).await;
    }

    tracing::info!(task = %task.name, "Task updated");
    Ok(Json(task))
}

async fn delete_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers).await?;
    let task = resolve_task(&state.store, &user, &id).await?;

    state.scheduler.remove_task(task.id).await;
    state.store.delete_task(task.id).await?;

    tracing::info!(task = %task.name, "Task deleted");
    Ok(Json(json!({ "deleted": true })))
}

async fn pause_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers).await?;
    let task = resolve_task(&state.store, &user, &id).await?;
    state.scheduler.pause_task(task.id).await?;
    Ok(Json(json!({ "paused": true })))
}

async fn resume_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers).await?;
    let task = resolve_task(&state.store, &user, &id).await?;
    state.scheduler.resume_task(task.id).await?;
    Ok(Json(json!({ "resumed": true })))
}

async fn trigger_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers).await?;
    let task = resolve_task(&state.store, &user, &id).await?;
    state.scheduler.trigger_task(task.id).await;
    Ok(Json(json!({ "triggered": true })))
}

#[derive(Deserialize)]
struct ListExecutionsQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_size")]
    size: u32,
}

async fn list_executions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<ListExecutionsQuery>,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers).await?;
    let task = resolve_task(&state.store, &user, &id).await?;
    let status = query.status.as_deref().and_then(TaskStatus::parse);
    let (executions, total) = state
        .store
        .list_executions(task.id, status, query.page, query.size)
        .await?;

    Ok(Json(json!({
        "executions": executions,
        "total": total,
        "page": query.page,
        "size": query.size,
    })))
}

async fn task_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers).await?;
    let task = resolve_task(&state.store, &user, &id).await?;
    let stats = state.store.execution_stats(task.id).await?;

    let success_rate = if stats.total > 0 {
        stats.success as f64 / stats.total as f64 * 100.0
    } else {
        0.0
    };

    Ok(Json(json!({
        "task_id": task.public_id,
        "total_executions": stats.total,
        "success_count": stats.success,
        "failed_count": stats.failed,
        "running_count": stats.running,
        "success_rate": success_rate,
        "avg_duration": stats.avg_duration,
    })))
}

fn parse_execution_id(id: &str) -> ApiResult<ExecutionId> {
    ExecutionId::parse(id)
        .ok_or_else(|| ApiError(AntCodeError::Validation(format!("invalid execution id {}", id))))
}

async fn get_execution(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers).await?;
    let execution_id = parse_execution_id(&id)?;
    let execution = state
        .store
        .get_execution(execution_id)
        .await?
        .ok_or_else(|| ApiError(AntCodeError::NotFound(format!("execution {}", id))))?;
    authorize_execution(&state.store, &user, execution.task_id).await?;
    Ok(Json(serde_json::to_value(&execution)?))
}

async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers).await?;
    let execution_id = parse_execution_id(&id)?;
    let execution = state
        .store
        .get_execution(execution_id)
        .await?
        .ok_or_else(|| ApiError(AntCodeError::NotFound(format!("execution {}", id))))?;
    authorize_execution(&state.store, &user, execution.task_id).await?;
    state.scheduler.cancel_execution(execution_id).await?;
    Ok(Json(json!({ "cancelled": true })))
}

async fn retry_execution(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers).await?;
    let execution_id = parse_execution_id(&id)?;
    let execution = state
        .store
        .get_execution(execution_id)
        .await?
        .ok_or_else(|| ApiError(AntCodeError::NotFound(format!("execution {}", id))))?;
    authorize_execution(&state.store, &user, execution.task_id).await?;
    let attempt = state.scheduler.manual_retry(execution_id).await?;
    Ok(Json(json!({ "triggered": true, "attempt": attempt })))
}

/// Resume a single interrupted execution from its checkpoint on demand.
async fn recover_execution(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers).await?;
    let execution_id = parse_execution_id(&id)?;
    let execution = state
        .store
        .get_execution(execution_id)
        .await?
        .ok_or_else(|| ApiError(AntCodeError::NotFound(format!("execution {}", id))))?;
    authorize_execution(&state.store, &user, execution.task_id).await?;
    let recovered = state.recovery.recover_single(execution_id).await?;
    Ok(Json(json!({ "recovered": recovered })))
}

#[derive(Deserialize)]
struct LogsQuery {
    #[serde(default)]
    log_type: Option<String>,
    #[serde(default = "default_lines")]
    lines: usize,
}

fn default_lines() -> usize {
    100
}

async fn execution_logs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<Value>> {
    let user = current_user(&state, &headers).await?;
    let execution_id = parse_execution_id(&id)?;
    let execution = state
        .store
        .get_execution(execution_id)
        .await?
        .ok_or_else(|| ApiError(AntCodeError::NotFound(format!("execution {}", id))))?;
    authorize_execution(&state.store, &user, execution.task_id).await?;

    let log_type = match query.log_type.as_deref() {
        Some("error") => LogType::Error,
        _ => LogType::Output,
    };
    let path = match log_type {
        LogType::Output => execution.log_file_path,
        LogType::Error => execution.error_log_path,
    }
    .unwrap_or_else(|| state.logs.path_for(execution_id, log_type));

    let lines = state.logs.tail(&path, query.lines.min(10_000)).await?;
    Ok(Json(json!({
        "execution_id": execution_id,
        "log_type": log_type,
        "lines": lines,
    })))
}

async fn scheduler_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    current_user(&state, &headers).await?;
    let stats = state.scheduler.stats().await;
    Ok(Json(json!(stats)))
}

async fn running_tasks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    current_user(&state, &headers).await?;
    Ok(Json(json!({ "running": state.scheduler.running_tasks().await })))
}

async fn pending_retries(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    current_user(&state, &headers).await?;
    Ok(Json(json!({ "retries": state.scheduler.pending_retries().await })))
}

async fn master_queue_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    current_user(&state, &headers).await?;
    Ok(Json(json!(state.dispatcher.master_queue_status().await)))
}

#[derive(Deserialize)]
struct QueuePriorityRequest {
    priority: i32,
}

async fn master_queue_priority(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(tid): Path<String>,
    Json(request): Json<QueuePriorityRequest>,
) -> ApiResult<Json<Value>> {
    require_admin(&state, &headers).await?;
    let updated = state
        .dispatcher
        .master_queue_update_priority(&tid, request.priority)
        .await?;
    if !updated {
        return Err(ApiError(AntCodeError::NotFound(format!(
            "queued task {}",
            tid
        ))));
    }
    Ok(Json(json!({ "updated": true })))
}

async fn master_queue_cancel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(tid): Path<String>,
) -> ApiResult<Json<Value>> {
    require_admin(&state, &headers).await?;
    let cancelled = state.dispatcher.master_queue_cancel(&tid).await?;
    Ok(Json(json!({ "cancelled": cancelled })))
}
