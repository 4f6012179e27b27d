use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, Semaphore};

use antcode_common::api::worker::{
    LogType, ReportHeartbeatRequest, ReportLogRequest, ReportLogsBatchRequest,
    ReportProgressRequest, ReportTaskRequest,
};
use antcode_common::ids::ExecutionId;
use antcode_common::types::TaskStatus;
use antcode_common::{AntCodeError, Result};

use crate::checkpoint::CheckpointService;
use crate::logs::TaskLogService;
use crate::scheduler::SchedulerService;
use crate::store::StoreClient;

/// Cap on concurrent per-group writers in a batch report.
const BATCH_WRITERS: usize = 16;

/// Live fan-out capacity per execution before slow subscribers lag.
const SUBSCRIBER_BUFFER: usize = 256;

/// A log fragment offered to live subscribers.
#[derive(Clone, Debug)]
pub struct LogFragment {
    pub execution_id: ExecutionId,
    pub log_type: LogType,
    pub content: String,
}

/// Result of a batch report.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct BatchIngestResult {
    pub groups: usize,
    pub written: usize,
    pub failed: usize,
}

/// Receives log fragments and status updates from workers, fans fragments
/// out to storage and live subscribers, and closes pending distributed
/// executions on terminal reports.
pub struct ReportIngestor {
    store: Arc<StoreClient>,
    scheduler: Arc<SchedulerService>,
    logs: Arc<TaskLogService>,
    checkpoints: Arc<CheckpointService>,
    subscribers: Mutex<HashMap<ExecutionId, broadcast::Sender<LogFragment>>>,
    write_semaphore: Arc<Semaphore>,
}

impl ReportIngestor {
    pub fn new(
        store: Arc<StoreClient>,
        scheduler: Arc<SchedulerService>,
        logs: Arc<TaskLogService>,
        checkpoints: Arc<CheckpointService>,
    ) -> Self {
        Self {
            store,
            scheduler,
            logs,
            checkpoints,
            subscribers: Mutex::new(HashMap::new()),
            write_semaphore: Arc::new(Semaphore::new(BATCH_WRITERS)),
        }
    }

    /// Single log fragment.
    pub async fn report_log(&self, request: ReportLogRequest) -> Result<()> {
        self.write_group(
            request.execution_id,
            request.log_type,
            vec![request.content],
        )
        .await
    }

    /// Batched fragments, grouped by (execution, stream) and written with
    /// bounded concurrency. One failing group does not abort the rest.
    pub async fn report_logs_batch(self: Arc<Self>, request: ReportLogsBatchRequest) -> BatchIngestResult {
        let mut groups: HashMap<(ExecutionId, LogType), Vec<String>> = HashMap::new();
        for log in request.logs {
            groups
                .entry((log.execution_id, log.log_type))
                .or_default()
                .push(log.content);
        }

        let mut result = BatchIngestResult {
            groups: groups.len(),
            ..BatchIngestResult::default()
        };

        let mut writes = tokio::task::JoinSet::new();
        for ((execution_id, log_type), contents) in groups {
            let this = Arc::clone(&self);
            writes.spawn(async move {
                let _permit = this.write_semaphore.acquire().await;
                this.write_group(execution_id, log_type, contents).await
            });
        }

        while let Some(joined) = writes.join_next().await {
            match joined {
                Ok(Ok(())) => result.written += 1,
                Ok(Err(e)) => {
                    result.failed += 1;
                    tracing::warn!(error = %e, "Log group write failed");
                }
                Err(e) => {
                    result.failed += 1;
                    tracing::warn!(error = %e, "Log group writer panicked");
                }
            }
        }

        metrics::counter!("ingest.batches").increment(1);
        result
    }

    /// Write one (execution, stream) group: resolve the file, append every
    /// fragment, offer each to live subscribers.
    async fn write_group(
        &self,
        execution_id: ExecutionId,
        log_type: LogType,
        contents: Vec<String>,
    ) -> Result<()> {
        let path = self.resolve_log_path(execution_id, log_type).await?;

        for content in contents {
            self.logs.append(&path, &content).await?;
            self.offer_live(LogFragment {
                execution_id,
                log_type,
                content,
            })
            .await;
        }

        metrics::counter!("ingest.fragments").increment(1);
        Ok(())
    }

    async fn resolve_log_path(
        &self,
        execution_id: ExecutionId,
        log_type: LogType,
    ) -> Result<String> {
        let execution = self.store.get_execution(execution_id).await?;
        let Some(execution) = execution else {
            return Err(AntCodeError::NotFound(format!("execution {}", execution_id)));
        };

        let stored = match log_type {
            LogType::Output => execution.log_file_path,
            LogType::Error => execution.error_log_path,
        };
        Ok(stored.unwrap_or_else(|| self.logs.path_for(execution_id, log_type)))
    }

    /// Terminal status report. Success/failed/timeout complete the
    /// scheduler's pending distributed wait.
    pub async fn report_task(&self, request: ReportTaskRequest) -> Result<()> {
        let status = TaskStatus::parse(&request.status)
            .filter(TaskStatus::is_terminal)
            .ok_or_else(|| {
                AntCodeError::Validation(format!("invalid terminal status '{}'", request.status))
            })?;

        self.scheduler
            .complete_distributed(
                request.execution_id,
                status,
                request.exit_code,
                request.error_message,
            )
            .await
    }

    /// Liveness refresh; an optional progress piggybacks onto the
    /// checkpoint.
    pub async fn report_heartbeat(&self, request: ReportHeartbeatRequest) -> Result<bool> {
        let known = self.checkpoints.update_heartbeat(request.execution_id).await?;
        if let Some(progress) = request.progress {
            self.checkpoints
                .update_progress(request.execution_id, progress, None, None)
                .await?;
        }
        Ok(known)
    }

    /// Richer progress/checkpoint update.
    pub async fn report_progress(&self, request: ReportProgressRequest) -> Result<()> {
        self.checkpoints.update_heartbeat(request.execution_id).await?;
        self.checkpoints
            .update_progress(
                request.execution_id,
                request.progress,
                request.checkpoint_data,
                request.last_log_offset,
            )
            .await
    }

    /// Subscribe to an execution's live log stream.
    pub async fn subscribe(&self, execution_id: ExecutionId) -> broadcast::Receiver<LogFragment> {
        let mut subscribers = self.subscribers.lock().await;
        subscribers
            .entry(execution_id)
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_BUFFER).0)
            .subscribe()
    }

    async fn offer_live(&self, fragment: LogFragment) {
        let mut subscribers = self.subscribers.lock().await;
        if let Some(sender) = subscribers.get(&fragment.execution_id) {
            if sender.receiver_count() == 0 {
                subscribers.remove(&fragment.execution_id);
            } else {
                // Lagging subscribers drop frames; delivery is best-effort.
                let _ = sender.send(fragment);
            }
        }
    }
}
