use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use antcode_common::config::CheckpointConfig;
use antcode_common::ids::ExecutionId;
use antcode_common::types::{Checkpoint, CheckpointState};
use antcode_common::{AntCodeError, Result};

use crate::cache::UnifiedCache;
use crate::scheduler::SchedulerService;
use crate::store::StoreClient;

const CACHE_PREFIX: &str = "checkpoint:";

/// Persists per-execution progress snapshots.
///
/// The authoritative copy rides inside the execution row's result_data and
/// survives master restarts; the cache copy is the fast path with a 24-hour
/// TTL.
pub struct CheckpointService {
    store: Arc<StoreClient>,
    cache: Arc<UnifiedCache>,
    config: CheckpointConfig,
}

impl CheckpointService {
    pub fn new(store: Arc<StoreClient>, cache: Arc<UnifiedCache>, config: CheckpointConfig) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    pub async fn save(&self, checkpoint: &mut Checkpoint) -> Result<()> {
        checkpoint.clamp_progress();
        checkpoint.last_checkpoint_at = Some(Utc::now());

        // Database first, then cache, so a crash between the two never
        // leaves the cache ahead of durable state.
        self.save_to_db(checkpoint).await?;

        let payload = serde_json::to_value(&*checkpoint)?;
        self.cache
            .set(
                &format!("{}{}", CACHE_PREFIX, checkpoint.execution_id),
                payload,
                Some(Duration::from_secs(self.config.cache_ttl_seconds)),
            )
            .await;

        tracing::debug!(
            execution_id = %checkpoint.execution_id,
            progress = checkpoint.progress,
            "Checkpoint saved"
        );
        Ok(())
    }

    async fn save_to_db(&self, checkpoint: &Checkpoint) -> Result<()> {
        let Some(execution) = self.store.get_execution(checkpoint.execution_id).await? else {
            return Err(AntCodeError::NotFound(format!(
                "execution {}",
                checkpoint.execution_id
            )));
        };

        let mut result_data = match execution.result_data {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        result_data.insert("checkpoint".into(), serde_json::to_value(checkpoint)?);

        self.store
            .set_execution_result(checkpoint.execution_id, &Value::Object(result_data))
            .await?;
        Ok(())
    }

    /// Cache first, database as the fallback.
    pub async fn get(&self, execution_id: ExecutionId) -> Result<Option<Checkpoint>> {
        let cache_key = format!("{}{}", CACHE_PREFIX, execution_id);
        if let Some(cached) = self.cache.get(&cache_key).await {
            if let Ok(checkpoint) = serde_json::from_value(cached) {
                return Ok(Some(checkpoint));
            }
        }

        let Some(execution) = self.store.get_execution(execution_id).await? else {
            return Ok(None);
        };

        Ok(execution
            .result_data
            .as_ref()
            .and_then(|d| d.get("checkpoint"))
            .and_then(|c| serde_json::from_value(c.clone()).ok()))
    }

    pub async fn delete(&self, execution_id: ExecutionId) {
        self.cache
            .delete(&format!("{}{}", CACHE_PREFIX, execution_id))
            .await;
    }

    /// Lightweight liveness refresh pushed by workers.
    pub async fn update_heartbeat(&self, execution_id: ExecutionId) -> Result<bool> {
        Ok(self.store.touch_execution_heartbeat(execution_id).await?)
    }

    /// Progress update without a full snapshot from the worker's side.
    pub async fn update_progress(
        &self,
        execution_id: ExecutionId,
        progress: f64,
        checkpoint_data: Option<serde_json::Map<String, Value>>,
        last_log_offset: Option<u64>,
    ) -> Result<()> {
        let Some(mut checkpoint) = self.get(execution_id).await? else {
            tracing::debug!(execution_id = %execution_id, "Progress update without checkpoint, ignoring");
            return Ok(());
        };

        checkpoint.progress = progress;
        checkpoint.state = CheckpointState::Checkpointed;
        if let Some(data) = checkpoint_data {
            for (key, value) in data {
                checkpoint.checkpoint_data.insert(key, value);
            }
        }
        if let Some(offset) = last_log_offset {
            checkpoint.last_log_offset = offset;
        }

        self.save(&mut checkpoint).await
    }

    /// Executions marked running whose heartbeat went silent. Orphans
    /// (owning task deleted) are failed in place and not returned.
    pub async fn find_interrupted(&self) -> Result<Vec<Checkpoint>> {
        let threshold = chrono::Duration::minutes(self.config.interrupted_threshold_minutes);
        let interrupted = self.store.find_interrupted_executions(threshold).await?;
        if interrupted.is_empty() {
            return Ok(Vec::new());
        }

        let mut orphans = Vec::new();
        let mut checkpoints = Vec::new();

        for execution in interrupted {
            let Some(task) = self.store.get_task(execution.task_id).await? else {
                orphans.push(execution.execution_id);
                continue;
            };

            let mut checkpoint = execution
                .result_data
                .as_ref()
                .and_then(|d| d.get("checkpoint"))
                .and_then(|c| serde_json::from_value::<Checkpoint>(c.clone()).ok())
                .unwrap_or_else(|| {
                    let mut fresh =
                        Checkpoint::new(execution.execution_id, execution.task_id, task.public_id);
                    fresh.started_at = Some(execution.start_time);
                    fresh
                });
            checkpoint.state = CheckpointState::Checkpointed;
            checkpoints.push(checkpoint);
        }

        if !orphans.is_empty() {
            let failed = self
                .store
                .fail_executions(&orphans, "task deleted")
                .await?;
            tracing::info!(count = failed, "Orphan executions reaped (task deleted)");
        }

        Ok(checkpoints)
    }

    pub fn max_recovery_retries(&self) -> u32 {
        self.config.max_recovery_retries
    }
}

/// Statistics of one recovery pass.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct RecoveryStats {
    pub recovered: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// Resumes interrupted executions at master startup.
pub struct RecoveryService {
    checkpoints: Arc<CheckpointService>,
    store: Arc<StoreClient>,
    scheduler: Arc<SchedulerService>,
    /// Prevents concurrent recovery passes.
    recovering: AtomicBool,
}

impl RecoveryService {
    pub fn new(
        checkpoints: Arc<CheckpointService>,
        store: Arc<StoreClient>,
        scheduler: Arc<SchedulerService>,
    ) -> Self {
        Self {
            checkpoints,
            store,
            scheduler,
            recovering: AtomicBool::new(false),
        }
    }

    /// Find every interrupted execution and either reschedule it with its
    /// resume payload or fail it for good.
    pub async fn recover_on_startup(&self) -> Result<RecoveryStats> {
        if self
            .recovering
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!("Recovery already in progress");
            return Ok(RecoveryStats::default());
        }

        let result = self.recover_all().await;
        self.recovering.store(false, Ordering::SeqCst);
        result
    }

    async fn recover_all(&self) -> Result<RecoveryStats> {
        tracing::info!("Scanning for interrupted executions");
        let interrupted = self.checkpoints.find_interrupted().await?;
        tracing::info!(count = interrupted.len(), "Interrupted executions found");

        let mut stats = RecoveryStats::default();
        let retry_cap = self.checkpoints.max_recovery_retries();

        for checkpoint in interrupted {
            if checkpoint.retry_count >= retry_cap {
                tracing::warn!(
                    execution_id = %checkpoint.execution_id,
                    retries = checkpoint.retry_count,
                    "Recovery retry limit reached, failing execution"
                );
                self.fail_checkpoint(&checkpoint, "recovery retry limit exceeded")
                    .await?;
                stats.failed += 1;
                continue;
            }

            match self.recover_one(checkpoint).await {
                Ok(true) => stats.recovered += 1,
                Ok(false) => stats.skipped += 1,
                Err(e) => {
                    tracing::error!(error = %e, "Recovery of execution failed");
                    stats.failed += 1;
                }
            }
        }

        tracing::info!(
            recovered = stats.recovered,
            failed = stats.failed,
            skipped = stats.skipped,
            "Recovery pass complete"
        );
        metrics::counter!("recovery.recovered").increment(stats.recovered);
        metrics::counter!("recovery.failed").increment(stats.failed);
        Ok(stats)
    }

    async fn recover_one(&self, mut checkpoint: Checkpoint) -> Result<bool> {
        let Some(task) = self.store.get_task(checkpoint.task_id).await? else {
            tracing::warn!(task_id = checkpoint.task_id, "Task vanished before recovery");
            return Ok(false);
        };

        checkpoint.state = CheckpointState::Recovered;
        checkpoint.retry_count += 1;
        self.checkpoints.save(&mut checkpoint).await?;

        // The stuck execution is closed out; a fresh one takes over.
        self.store
            .fail_executions(&[checkpoint.execution_id], "interrupted, rescheduled")
            .await?;

        // Inject the resume payload into the task's execution params; the
        // scheduler strips it back out after the recovered firing reads it.
        let mut params = task.execution_params.clone();
        for (key, value) in checkpoint.resume_params() {
            params.insert(key, value);
        }
        self.store.set_task_execution_params(task.id, &params).await?;

        self.scheduler
            .trigger_task_with_attempt(task.id, checkpoint.retry_count)
            .await;

        tracing::info!(
            execution_id = %checkpoint.execution_id,
            task = %task.name,
            progress = checkpoint.progress,
            retry = checkpoint.retry_count,
            "Interrupted execution rescheduled"
        );
        Ok(true)
    }

    async fn fail_checkpoint(&self, checkpoint: &Checkpoint, reason: &str) -> Result<()> {
        self.store
            .fail_executions(&[checkpoint.execution_id], reason)
            .await?;
        self.checkpoints.delete(checkpoint.execution_id).await;
        Ok(())
    }

    /// Manual recovery of a single execution.
    pub async fn recover_single(&self, execution_id: ExecutionId) -> Result<bool> {
        let Some(checkpoint) = self.checkpoints.get(execution_id).await? else {
            tracing::warn!(execution_id = %execution_id, "No checkpoint to recover from");
            return Ok(false);
        };
        self.recover_one(checkpoint).await
    }
}
