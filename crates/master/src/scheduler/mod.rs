mod retry;
mod trigger;

pub use retry::{CompensationRegistry, PendingRetries, PendingRetry, RetryPolicy, RetryStrategy};
pub use trigger::{parse_cron, FireEvent, JobKind, Trigger, TriggerWheel};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};

use antcode_common::config::{RetryDefaults, SchedulerConfig};
use antcode_common::ids::ExecutionId;
use antcode_common::types::{
    ExecutionOutcome, Project, ProjectSpec, ScheduledTask, TaskExecution, TaskStatus,
};
use antcode_common::{AntCodeError, Result};

use crate::dispatch::{DispatchTarget, NodeDispatcher};
use crate::executor::LocalExecutor;
use crate::logs::TaskLogService;
use crate::registry::HeartbeatMonitor;
use crate::resolver::ExecutionResolver;
use crate::rulegw::RuleGateway;
use crate::store::StoreClient;

const JOB_WORKSPACE_CLEANUP: &str = "workspace_cleanup";
const JOB_MONITORING_STREAM: &str = "monitoring_stream";
const JOB_MONITORING_CLEANUP: &str = "monitoring_cleanup";
const JOB_NODE_HEARTBEAT: &str = "node_heartbeat_check";

/// Outcome of one execution branch plus how the scheduler may react to a
/// failure.
struct BranchResult {
    outcome: ExecutionOutcome,
    retryable: bool,
    timed_out: bool,
}

/// An execution currently in flight (or awaiting a node's terminal
/// report).
#[derive(Clone, Debug, serde::Serialize)]
pub struct RunningEntry {
    pub execution_id: ExecutionId,
    pub task_id: i64,
    pub task_name: String,
    pub started_at: DateTime<Utc>,
}

/// Live counters surfaced by the stats endpoint.
#[derive(Clone, Debug, serde::Serialize)]
pub struct SchedulerStats {
    pub total_executed: u64,
    pub currently_running: u64,
    pub success_count: u64,
    pub failed_count: u64,
    pub success_rate: f64,
    pub max_concurrent_tasks: usize,
    pub available_slots: u64,
}

/// Owns the trigger wheel and the lifecycle of every execution: firing,
/// de-duplication, routing, terminal bookkeeping, retries and the
/// housekeeping jobs.
pub struct SchedulerService {
    store: Arc<StoreClient>,
    resolver: Arc<ExecutionResolver>,
    dispatcher: Arc<NodeDispatcher>,
    executor: Arc<LocalExecutor>,
    rulegw: Arc<RuleGateway>,
    logs: Arc<TaskLogService>,
    monitor: Arc<HeartbeatMonitor>,
    wheel: Arc<TriggerWheel>,
    semaphore: Arc<Semaphore>,
    running: Mutex<HashMap<ExecutionId, RunningEntry>>,
    compensation: Arc<CompensationRegistry>,
    pending_retries: Arc<PendingRetries>,
    config: SchedulerConfig,
    retry_defaults: RetryDefaults,
    heartbeat_interval_seconds: u64,

    total_executed: AtomicU64,
    currently_running: AtomicU64,
    success_count: AtomicU64,
    failed_count: AtomicU64,
}

impl SchedulerService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<StoreClient>,
        resolver: Arc<ExecutionResolver>,
        dispatcher: Arc<NodeDispatcher>,
        executor: Arc<LocalExecutor>,
        rulegw: Arc<RuleGateway>,
        logs: Arc<TaskLogService>,
        monitor: Arc<HeartbeatMonitor>,
        wheel: Arc<TriggerWheel>,
        config: SchedulerConfig,
        retry_defaults: RetryDefaults,
        heartbeat_interval_seconds: u64,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_tasks));
        Self {
            store,
            resolver,
            dispatcher,
            executor,
            rulegw,
            logs,
            monitor,
            wheel,
            semaphore,
            running: Mutex::new(HashMap::new()),
            compensation: Arc::new(CompensationRegistry::new()),
            pending_retries: Arc::new(PendingRetries::new()),
            config,
            retry_defaults,
            heartbeat_interval_seconds,
            total_executed: AtomicU64::new(0),
            currently_running: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failed_count: AtomicU64::new(0),
        }
    }

    /// Install triggers for every active task and register the
    /// housekeeping jobs.
    pub async fn start(&self) -> Result<()> {
        let active = self.store.get_active_tasks().await?;
        let count = active.len();
        for task in active {
            if let Err(e) = self.add_task(&task).await {
                tracing::error!(task = %task.name, error = %e, "Failed to install trigger");
            }
        }
        tracing::info!(tasks = count, "Scheduler loaded active tasks");

        // Housekeeping: nightly workspace cleanup, metrics consolidation,
        // history pruning, and the adaptive node heartbeat tick.
        self.wheel
            .add_job(
                JOB_WORKSPACE_CLEANUP,
                JobKind::Maintenance(JOB_WORKSPACE_CLEANUP.into()),
                parse_cron("0 2 * * *")?,
            )
            .await;
        self.wheel
            .add_job(
                JOB_MONITORING_STREAM,
                JobKind::Maintenance(JOB_MONITORING_STREAM.into()),
                Trigger::Interval(chrono::Duration::seconds(
                    self.config.monitor_stream_interval_seconds.max(1) as i64,
                )),
            )
            .await;
        self.wheel
            .add_job(
                JOB_MONITORING_CLEANUP,
                JobKind::Maintenance(JOB_MONITORING_CLEANUP.into()),
                parse_cron("30 3 * * *")?,
            )
            .await;
        self.wheel
            .add_job(
                JOB_NODE_HEARTBEAT,
                JobKind::Maintenance(JOB_NODE_HEARTBEAT.into()),
                Trigger::Interval(chrono::Duration::seconds(
                    self.heartbeat_interval_seconds.max(1) as i64,
                )),
            )
            .await;

        tracing::info!("Scheduler started");
        Ok(())
    }

    /// Consume trigger firings until shutdown. Spawn on its own task.
    pub async fn run(
        self: Arc<Self>,
        mut fire_rx: mpsc::UnboundedReceiver<FireEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = fire_rx.recv() => {
                    let Some(event) = event else { break };
                    let scheduler = Arc::clone(&self);
                    tokio::spawn(async move { scheduler.handle_fire(event).await });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("Scheduler stopping");
                        break;
                    }
                }
            }
        }
    }

    async fn handle_fire(&self, event: FireEvent) {
        match event.kind {
            JobKind::Task(task_id) => self.execute_task(task_id, 0).await,
            JobKind::Retry { task_id, attempt } => {
                self.pending_retries.remove(&event.job_id).await;
                self.execute_task(task_id, attempt).await;
            }
            JobKind::Maintenance(name) => self.run_maintenance(&name).await,
        }
    }

    // --- Task registration ---

    pub async fn add_task(&self, task: &ScheduledTask) -> Result<()> {
        let trigger = Trigger::from_task(task)?;
        self.wheel
            .add_job(&task.id.to_string(), JobKind::Task(task.id), trigger)
            .await;
        let next = self.wheel.next_run_time(&task.id.to_string()).await;
        self.store.set_task_next_run(task.id, next).await?;
        tracing::info!(task = %task.name, "Task scheduled");
        Ok(())
    }

    pub async fn remove_task(&self, task_id: i64) {
        self.wheel.remove_job(&task_id.to_string()).await;
    }

    pub async fn pause_task(&self, task_id: i64) -> Result<()> {
        self.wheel.pause_job(&task_id.to_string()).await?;
        self.store.set_task_status(task_id, TaskStatus::Paused).await?;
        self.store.set_task_active(task_id, false).await?;
        tracing::info!(task_id = task_id, "Task paused");
        Ok(())
    }

    pub async fn resume_task(&self, task_id: i64) -> Result<()> {
        if self.wheel.contains(&task_id.to_string()).await {
            self.wheel.resume_job(&task_id.to_string()).await?;
        } else {
            // One-shots drop off the wheel after firing; reinstall.
            let task = self
                .store
                .get_task(task_id)
                .await?
                .ok_or_else(|| AntCodeError::NotFound(format!("task {}", task_id)))?;
            self.add_task(&task).await?;
        }
        self.store.set_task_status(task_id, TaskStatus::Pending).await?;
        self.store.set_task_active(task_id, true).await?;
        tracing::info!(task_id = task_id, "Task resumed");
        Ok(())
    }

    /// Fire a task immediately, outside its schedule.
    pub async fn trigger_task(&self, task_id: i64) {
        self.wheel
            .fire_now(&task_id.to_string(), JobKind::Task(task_id))
            .await;
        tracing::info!(task_id = task_id, "Task triggered manually");
    }

    /// Fire a task carrying a recovery/retry attempt number; the new
    /// execution records it as its retry count.
    pub async fn trigger_task_with_attempt(&self, task_id: i64, attempt: u32) {
        let job_id = format!("recover:{}:{}", task_id, uuid::Uuid::new_v4());
        self.wheel
            .add_job(
                &job_id,
                JobKind::Retry { task_id, attempt },
                Trigger::Date(Utc::now()),
            )
            .await;
    }

    // --- Execution ---

    /// Run one firing of a task under the concurrency cap.
    pub async fn execute_task(&self, task_id: i64, attempt: u32) {
        let Ok(_permit) = self.semaphore.acquire().await else {
            return;
        };
        self.total_executed.fetch_add(1, Ordering::Relaxed);
        self.currently_running.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("scheduler.running").increment(1.0);

        match self.execute_task_inner(task_id, attempt).await {
            Ok(ran) => {
                if !ran {
                    // The firing was skipped; it never counted as a run.
                    self.total_executed.fetch_sub(1, Ordering::Relaxed);
                }
            }
            Err(e) => {
                tracing::error!(task_id = task_id, error = %e, "Execution pipeline error");
            }
        }

        self.currently_running.fetch_sub(1, Ordering::Relaxed);
        metrics::gauge!("scheduler.running").decrement(1.0);
    }

    async fn execute_task_inner(&self, task_id: i64, attempt: u32) -> Result<bool> {
        // 1. Load task and project; abort when either is gone or inactive.
        let Some(task) = self.store.get_task(task_id).await? else {
            tracing::error!(task_id = task_id, "Task does not exist, skipping firing");
            return Ok(false);
        };
        if !task.is_active {
            tracing::warn!(task = %task.name, "Task inactive, skipping firing");
            return Ok(false);
        }

        // 2. Re-entry guard: one in-flight execution per task.
        if task.status.is_busy() {
            tracing::warn!(
                task = %task.name,
                status = task.status.as_db_str(),
                "Task already in flight, skipping overlapping firing"
            );
            metrics::counter!("scheduler.skipped_reentry").increment(1);
            return Ok(false);
        }

        let Some(project) = self.store.get_project(task.project_id).await? else {
            tracing::error!(task = %task.name, "Project does not exist, skipping firing");
            return Ok(false);
        };

        // A recovered firing reads its resume payload from the task params;
        // the row is restored right away so later schedules run clean. The
        // in-memory copy keeps the payload for this run.
        if task.execution_params.contains_key("_resume") {
            let mut restored = task.execution_params.clone();
            for key in [
                "_resume",
                "_checkpoint",
                "_progress",
                "_last_log_offset",
                "_previous_execution_id",
            ] {
                restored.remove(key);
            }
            self.store
                .set_task_execution_params(task.id, &restored)
                .await?;
            tracing::info!(task = %task.name, "Resuming from checkpoint payload");
        }

        tracing::info!(
            task = %task.name,
            running = self.currently_running.load(Ordering::Relaxed),
            max = self.config.max_concurrent_tasks,
            "Executing task"
        );

        // 3. Create the execution record with fresh log paths.
        let execution_id = ExecutionId::new();
        let log_paths = self.logs.generate_paths(execution_id);
        let now = Utc::now();
        let execution = TaskExecution {
            id: 0,
            execution_id,
            task_id: task.id,
            status: TaskStatus::Running,
            start_time: now,
            end_time: None,
            duration_seconds: None,
            exit_code: None,
            retry_count: attempt,
            log_file_path: Some(log_paths.output.clone()),
            error_log_path: Some(log_paths.error.clone()),
            last_heartbeat: None,
            result_data: None,
            error_message: None,
        };
        self.store.create_execution(&execution).await?;

        // 4. Stamp the task.
        self.store
            .stamp_task_run(task.id, TaskStatus::Running, now)
            .await?;

        {
            let mut running = self.running.lock().await;
            running.insert(
                execution_id,
                RunningEntry {
                    execution_id,
                    task_id: task.id,
                    task_name: task.name.clone(),
                    started_at: now,
                },
            );
        }

        let _ = self
            .logs
            .append(&log_paths.output, &format!("[INFO] task started: {}", task.name))
            .await;

        // 5. Resolve the target, visible as the dispatching state.
        self.store
            .set_task_status(task.id, TaskStatus::Dispatching)
            .await?;
        self.store
            .update_execution_status(execution_id, TaskStatus::Dispatching, None, None)
            .await?;
        let _ = self
            .logs
            .append(&log_paths.output, "[INFO] resolving execution target")
            .await;

        // 6. Branch on the resolution.
        let branch = match self.resolver.resolve(&task, &project).await {
            Ok(resolution) => {
                let target = resolution
                    .node
                    .as_ref()
                    .map(|n| n.name.as_str())
                    .unwrap_or("local");
                let _ = self
                    .logs
                    .append(
                        &log_paths.output,
                        &format!(
                            "[INFO] strategy {} selected target {}",
                            resolution.strategy.as_db_str(),
                            target
                        ),
                    )
                    .await;

                match resolution.node {
                    Some(node) => {
                        self.dispatch_distributed(
                            &task,
                            &project,
                            execution_id,
                            node,
                            resolution.require_render,
                            &log_paths,
                        )
                        .await
                    }
                    None => match &project.spec {
                        ProjectSpec::Rule(rule) => {
                            let outcome = self
                                .rulegw
                                .submit(&project, rule, execution_id, &task.execution_params)
                                .await;
                            BranchResult {
                                retryable: !outcome.success,
                                timed_out: false,
                                outcome,
                            }
                        }
                        _ => self.run_local(&task, &project, execution_id, &log_paths).await,
                    },
                }
            }
            Err(e) => {
                let message = e.to_string();
                let _ = self
                    .logs
                    .append(&log_paths.error, &format!("[ERROR] {}", message))
                    .await;
                // Fixed/specified must not fall back; the failure is final.
                BranchResult {
                    outcome: ExecutionOutcome::failure("resolve", message),
                    retryable: false,
                    timed_out: false,
                }
            }
        };

        // 7./8. Converge the branch result into terminal state.
        let distributed_pending =
            branch.outcome.success && branch.outcome.distributed && branch.outcome.pending;

        if branch.outcome.success {
            if distributed_pending {
                let _ = self
                    .logs
                    .append(
                        &log_paths.output,
                        "[INFO] task queued on node, awaiting terminal report",
                    )
                    .await;
            } else {
                self.store
                    .update_execution_status(
                        execution_id,
                        TaskStatus::Success,
                        branch.outcome.exit_code,
                        None,
                    )
                    .await?;
                self.store.set_task_status(task.id, TaskStatus::Success).await?;
                self.store.bump_task_counter(task.id, true).await?;
                self.success_count.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("scheduler.executions", "result" => "success").increment(1);

                let _ = self
                    .logs
                    .append(
                        &log_paths.output,
                        &format!(
                            "[INFO] task finished: {}",
                            branch.outcome.message.as_deref().unwrap_or("done")
                        ),
                    )
                    .await;
            }
        } else {
            let status = if branch.timed_out {
                TaskStatus::Timeout
            } else {
                TaskStatus::Failed
            };
            let error = branch
                .outcome
                .error
                .clone()
                .unwrap_or_else(|| "execution failed".into());

            self.store
                .update_execution_status(
                    execution_id,
                    status,
                    branch.outcome.exit_code,
                    Some(&error),
                )
                .await?;
            self.store.set_task_status(task.id, status).await?;
            self.store.bump_task_counter(task.id, false).await?;
            self.failed_count.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("scheduler.executions", "result" => "failed").increment(1);

            let _ = self
                .logs
                .append(&log_paths.error, &format!("[ERROR] task failed: {}", error))
                .await;

            self.consider_retry(&task, execution_id, attempt, branch.retryable, &error)
                .await;
        }

        // 9. Bookkeeping; distributed executions stay in the running map
        // until the node reports back.
        if !distributed_pending {
            let mut running = self.running.lock().await;
            running.remove(&execution_id);
        }

        let next = self.wheel.next_run_time(&task.id.to_string()).await;
        self.store.set_task_next_run(task.id, next).await?;

        Ok(true)
    }

    async fn dispatch_distributed(
        &self,
        task: &ScheduledTask,
        project: &Project,
        execution_id: ExecutionId,
        node: antcode_common::types::Node,
        require_render: bool,
        log_paths: &crate::logs::LogPaths,
    ) -> BranchResult {
        let _ = self
            .logs
            .append(
                &log_paths.output,
                &format!("[INFO] dispatching to node {} ({})", node.name, node.base_url()),
            )
            .await;

        let timeout = task
            .timeout_seconds
            .unwrap_or(self.config.default_timeout_seconds);
        let mut params = task.execution_params.clone();
        params.insert(
            "heartbeat_interval".into(),
            self.heartbeat_interval_seconds.into(),
        );

        let result = self
            .dispatcher
            .dispatch_task(
                &execution_id.to_string(),
                &project.public_id.to_string(),
                project.project_type(),
                Some(task.clamped_priority()),
                params,
                task.environment_vars.clone(),
                timeout,
                DispatchTarget {
                    node_id: Some(node.public_id),
                    require_render,
                    ..DispatchTarget::default()
                },
            )
            .await;

        if result.success {
            let queued = async {
                self.store.set_task_status(task.id, TaskStatus::Queued).await?;
                self.store
                    .set_execution_result(
                        execution_id,
                        &json!({
                            "distributed": true,
                            "node_id": result.node_id,
                            "node_name": result.node_name,
                            "remote_task_id": result.task_id,
                            "transfer_skipped": result.transfer_skipped,
                        }),
                    )
                    .await?;
                self.store
                    .update_execution_status(execution_id, TaskStatus::Queued, None, None)
                    .await?;
                Ok::<_, AntCodeError>(())
            }
            .await;

            if let Err(e) = queued {
                tracing::error!(error = %e, "Failed to persist queued state");
            }

            BranchResult {
                outcome: ExecutionOutcome::distributed_pending(
                    result.node_id.unwrap_or_default(),
                    result.node_name.unwrap_or_default(),
                    result.task_id.unwrap_or_default(),
                ),
                retryable: true,
                timed_out: false,
            }
        } else {
            let error = result.error.unwrap_or_else(|| "dispatch failed".into());
            let _ = self
                .logs
                .append(&log_paths.error, &format!("[ERROR] dispatch failed: {}", error))
                .await;
            BranchResult {
                outcome: ExecutionOutcome::failure("dispatch", error),
                // A worker's explicit refusal will repeat; transport
                // failures may not.
                retryable: !result.rejected,
                timed_out: false,
            }
        }
    }

    async fn run_local(
        &self,
        task: &ScheduledTask,
        project: &Project,
        execution_id: ExecutionId,
        log_paths: &crate::logs::LogPaths,
    ) -> BranchResult {
        let timeout = Duration::from_secs(
            task.timeout_seconds
                .unwrap_or(self.config.default_timeout_seconds),
        );

        let result = self
            .executor
            .execute(
                project,
                execution_id,
                &task.execution_params,
                &task.environment_vars,
                timeout,
                &self.logs,
                log_paths,
            )
            .await;

        let mut outcome = if result.success {
            ExecutionOutcome::success("local execution complete")
        } else {
            ExecutionOutcome::failure(
                "execute",
                result.error.clone().unwrap_or_else(|| "local run failed".into()),
            )
        };
        outcome.exit_code = result.exit_code;

        BranchResult {
            outcome,
            retryable: true,
            timed_out: result.timed_out,
        }
    }

    /// Schedule the next attempt, or run compensation when the budget is
    /// spent.
    async fn consider_retry(
        &self,
        task: &ScheduledTask,
        execution_id: ExecutionId,
        attempt: u32,
        retryable: bool,
        error: &str,
    ) {
        let policy = RetryPolicy::for_task(task, &self.retry_defaults);

        if policy.should_retry(attempt, retryable) {
            let next_attempt = attempt + 1;
            let delay = policy.delay_seconds(attempt);
            let retry_at = Utc::now() + chrono::Duration::seconds(delay as i64);
            // The id embeds task, execution and attempt so retries collide
            // neither with the main schedule nor with each other.
            let job_id = format!("retry:{}:{}:{}", task.id, execution_id, next_attempt);

            self.wheel
                .add_job(
                    &job_id,
                    JobKind::Retry {
                        task_id: task.id,
                        attempt: next_attempt,
                    },
                    Trigger::Date(retry_at),
                )
                .await;
            self.pending_retries
                .insert(
                    &job_id,
                    PendingRetry {
                        task_id: task.id,
                        execution_id,
                        attempt: next_attempt,
                        retry_at,
                    },
                )
                .await;

            tracing::info!(
                task = %task.name,
                attempt = next_attempt,
                max = policy.max_retries,
                delay_s = delay,
                "Retry scheduled"
            );
            metrics::counter!("scheduler.retries_scheduled").increment(1);
        } else if retryable {
            // Retries exhausted on a retryable failure — with a zero budget
            // that is the very first one. Compensate and alert.
            tracing::error!(
                task = %task.name,
                retries = attempt,
                error = error,
                "Retries exhausted"
            );
            metrics::counter!("scheduler.retries_exhausted").increment(1);

            let task_type = self
                .store
                .get_project(task.project_id)
                .await
                .ok()
                .flatten()
                .map(|p| p.project_type().as_db_str().to_string())
                .unwrap_or_else(|| "default".into());
            self.compensation
                .run(&task_type, task.id, execution_id, error.to_string())
                .await;
        }
    }

    // --- Distributed terminal reports (via log ingestion) ---

    /// Complete a pending distributed execution from a worker's terminal
    /// report.
    pub async fn complete_distributed(
        &self,
        execution_id: ExecutionId,
        status: TaskStatus,
        exit_code: Option<i32>,
        error_message: Option<String>,
    ) -> Result<()> {
        let Some(execution) = self.store.get_execution(execution_id).await? else {
            return Err(AntCodeError::NotFound(format!("execution {}", execution_id)));
        };
        if execution.status.is_terminal() {
            tracing::debug!(
                execution_id = %execution_id,
                "Terminal report for already-closed execution, ignoring"
            );
            return Ok(());
        }

        self.store
            .update_execution_status(execution_id, status, exit_code, error_message.as_deref())
            .await?;

        let task = self.store.get_task(execution.task_id).await?;
        if let Some(task) = &task {
            self.store.set_task_status(task.id, status).await?;
            self.store
                .bump_task_counter(task.id, status == TaskStatus::Success)
                .await?;
        }

        {
            let mut running = self.running.lock().await;
            running.remove(&execution_id);
        }

        match status {
            TaskStatus::Success => {
                self.success_count.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("scheduler.executions", "result" => "success").increment(1);
            }
            TaskStatus::Failed | TaskStatus::Timeout => {
                self.failed_count.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("scheduler.executions", "result" => "failed").increment(1);

                if let Some(task) = &task {
                    let error = error_message.unwrap_or_else(|| "worker reported failure".into());
                    self.consider_retry(task, execution_id, execution.retry_count, true, &error)
                        .await;
                }
            }
            _ => {}
        }

        tracing::info!(
            execution_id = %execution_id,
            status = status.as_db_str(),
            "Distributed execution closed"
        );
        Ok(())
    }

    // --- Cancellation ---

    /// Cancel an execution. The master-side state is definitive; the
    /// remote cancel is best-effort.
    pub async fn cancel_execution(&self, execution_id: ExecutionId) -> Result<()> {
        let Some(execution) = self.store.get_execution(execution_id).await? else {
            return Err(AntCodeError::NotFound(format!("execution {}", execution_id)));
        };
        if execution.status.is_terminal() {
            return Err(AntCodeError::Conflict(format!(
                "execution {} already {}",
                execution_id,
                execution.status.as_db_str()
            )));
        }

        // Forward the cancel to the owning node when the task left the
        // master.
        let node_public_id = execution
            .result_data
            .as_ref()
            .and_then(|d| d.get("node_id"))
            .and_then(|v| v.as_str())
            .and_then(antcode_common::ids::NodeId::parse);
        if let Some(node_id) = node_public_id {
            match self.dispatcher.registry_node(node_id).await {
                Some(node) => {
                    let cancelled = self
                        .dispatcher
                        .cancel_queued_task(&node, &execution_id.to_string())
                        .await
                        .unwrap_or(false);
                    tracing::info!(
                        execution_id = %execution_id,
                        node = %node.name,
                        remote_cancelled = cancelled,
                        "Remote cancel forwarded"
                    );
                }
                None => {
                    tracing::warn!(execution_id = %execution_id, "Owning node unknown, local cancel only");
                }
            }
        }

        self.store
            .update_execution_status(execution_id, TaskStatus::Cancelled, None, Some("cancelled"))
            .await?;
        if let Some(task) = self.store.get_task(execution.task_id).await? {
            self.store.set_task_status(task.id, TaskStatus::Cancelled).await?;
        }

        {
            let mut running = self.running.lock().await;
            running.remove(&execution_id);
        }

        tracing::info!(execution_id = %execution_id, "Execution cancelled");
        Ok(())
    }

    /// Re-run a finished execution on demand.
    pub async fn manual_retry(&self, execution_id: ExecutionId) -> Result<u32> {
        let Some(execution) = self.store.get_execution(execution_id).await? else {
            return Err(AntCodeError::NotFound(format!("execution {}", execution_id)));
        };
        if !execution.status.is_terminal() {
            return Err(AntCodeError::Conflict("execution still in flight".into()));
        }

        let attempt = execution.retry_count + 1;
        self.store
            .set_execution_retry_count(execution_id, attempt)
            .await?;
        self.trigger_task_with_attempt(execution.task_id, attempt).await;
        Ok(attempt)
    }

    // --- Maintenance ---

    async fn run_maintenance(&self, name: &str) {
        match name {
            JOB_WORKSPACE_CLEANUP => {
                let max_age = Duration::from_secs(self.config.cleanup_max_age_hours * 3600);
                self.executor.cleanup_old_workspaces(max_age).await;
            }
            JOB_MONITORING_STREAM => {
                let stats = self.stats().await;
                metrics::gauge!("scheduler.available_slots").set(stats.available_slots as f64);
                metrics::gauge!("scheduler.success_rate").set(stats.success_rate);
                let queue_status = self.dispatcher.master_queue_status().await;
                metrics::gauge!("queue.depth").set(queue_status.queue_depth.max(0) as f64);
            }
            JOB_MONITORING_CLEANUP => {
                match self.store.prune_node_heartbeats(7).await {
                    Ok(removed) if removed > 0 => {
                        tracing::info!(removed = removed, "Heartbeat history pruned");
                    }
                    Err(e) => tracing::error!(error = %e, "Heartbeat history prune failed"),
                    _ => {}
                }
                match self.store.cleanup_stale_node_projects(30).await {
                    Ok(removed) if removed > 0 => {
                        tracing::info!(removed = removed, "Stale node-project records removed");
                    }
                    Err(e) => tracing::error!(error = %e, "Node-project cleanup failed"),
                    _ => {}
                }
            }
            JOB_NODE_HEARTBEAT => {
                if let Err(e) = self.monitor.tick().await {
                    tracing::error!(error = %e, "Node heartbeat tick failed");
                }
            }
            other => tracing::warn!(job = other, "Unknown maintenance job"),
        }
    }

    // --- Introspection ---

    pub async fn stats(&self) -> SchedulerStats {
        let total = self.total_executed.load(Ordering::Relaxed);
        let success = self.success_count.load(Ordering::Relaxed);
        SchedulerStats {
            total_executed: total,
            currently_running: self.currently_running.load(Ordering::Relaxed),
            success_count: success,
            failed_count: self.failed_count.load(Ordering::Relaxed),
            success_rate: if total > 0 {
                success as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            max_concurrent_tasks: self.config.max_concurrent_tasks,
            available_slots: self.semaphore.available_permits() as u64,
        }
    }

    pub async fn running_tasks(&self) -> Vec<RunningEntry> {
        let running = self.running.lock().await;
        running.values().cloned().collect()
    }

    pub async fn pending_retries(&self) -> Vec<PendingRetry> {
        self.pending_retries.list().await
    }

    pub fn compensation(&self) -> &Arc<CompensationRegistry> {
        &self.compensation
    }

    pub async fn next_run_time(&self, task_id: i64) -> Option<DateTime<Utc>> {
        self.wheel.next_run_time(&task_id.to_string()).await
    }
}
