use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::Mutex;

use antcode_common::config::RetryDefaults;
use antcode_common::ids::ExecutionId;
use antcode_common::types::ScheduledTask;

/// Delay growth shape between attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryStrategy {
    Fixed,
    Linear,
    Exponential,
}

impl RetryStrategy {
    pub fn parse(s: &str) -> Self {
        match s {
            "fixed" => Self::Fixed,
            "linear" => Self::Linear,
            _ => Self::Exponential,
        }
    }
}

/// Effective retry parameters for one task.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_seconds: u64,
    pub max_delay_seconds: u64,
    pub multiplier: f64,
    pub jitter: bool,
    pub strategy: RetryStrategy,
}

impl RetryPolicy {
    /// Task-level settings over the configured defaults.
    pub fn for_task(task: &ScheduledTask, defaults: &RetryDefaults) -> Self {
        Self {
            max_retries: task.max_retries,
            base_delay_seconds: task
                .retry_delay_seconds
                .unwrap_or(defaults.base_delay_seconds),
            max_delay_seconds: defaults.max_delay_seconds,
            multiplier: defaults.multiplier,
            jitter: defaults.jitter,
            strategy: RetryStrategy::parse(&defaults.strategy),
        }
    }

    /// Delay before attempt `attempt + 1`, given `attempt` failures so far.
    /// Capped at max_delay; ±10% jitter when enabled.
    pub fn delay_seconds(&self, attempt: u32) -> u64 {
        let base = self.base_delay_seconds as f64;
        let raw = match self.strategy {
            RetryStrategy::Fixed => base,
            RetryStrategy::Linear => base * (attempt as f64 + 1.0),
            RetryStrategy::Exponential => base * self.multiplier.powi(attempt as i32),
        };

        let capped = raw.min(self.max_delay_seconds as f64);

        let jittered = if self.jitter {
            let spread = capped * 0.1;
            capped + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            capped
        };

        jittered.max(0.0) as u64
    }

    pub fn should_retry(&self, attempt: u32, retryable: bool) -> bool {
        retryable && attempt < self.max_retries
    }
}

/// A scheduled-but-not-yet-fired retry, for the observability endpoint.
#[derive(Clone, Debug, serde::Serialize)]
pub struct PendingRetry {
    pub task_id: i64,
    pub execution_id: ExecutionId,
    pub attempt: u32,
    pub retry_at: DateTime<Utc>,
}

type CompensationHandler = Arc<
    dyn Fn(i64, ExecutionId, String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync,
>;

/// Side-effect cleanup hooks invoked once when a task runs out of retries.
/// Keyed by task type; a missing handler is not an error.
#[derive(Default)]
pub struct CompensationRegistry {
    handlers: Mutex<HashMap<String, CompensationHandler>>,
}

impl CompensationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, task_type: &str, handler: CompensationHandler) {
        let mut handlers = self.handlers.lock().await;
        handlers.insert(task_type.to_string(), handler);
        tracing::info!(task_type = task_type, "Compensation handler registered");
    }

    /// Invoke the handler for a task type, at most once per call site.
    /// Handlers are expected to be idempotent.
    pub async fn run(&self, task_type: &str, task_id: i64, execution_id: ExecutionId, error: String) {
        let handler = {
            let handlers = self.handlers.lock().await;
            handlers.get(task_type).cloned()
        };

        if let Some(handler) = handler {
            handler(task_id, execution_id, error).await;
            tracing::info!(task_type = task_type, task_id = task_id, "Compensation complete");
        }
    }
}

/// Book-keeping of retries waiting to fire.
#[derive(Default)]
pub struct PendingRetries {
    entries: Mutex<HashMap<String, PendingRetry>>,
}

impl PendingRetries {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, job_id: &str, entry: PendingRetry) {
        self.entries.lock().await.insert(job_id.to_string(), entry);
    }

    pub async fn remove(&self, job_id: &str) {
        self.entries.lock().await.remove(job_id);
    }

    pub async fn list(&self) -> Vec<PendingRetry> {
        let mut entries: Vec<PendingRetry> =
            self.entries.lock().await.values().cloned().collect();
        entries.sort_by_key(|e| e.retry_at);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: RetryStrategy, base: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay_seconds: base,
            max_delay_seconds: 3600,
            multiplier: 2.0,
            jitter: false,
            strategy,
        }
    }

    #[test]
    fn exponential_sequence_doubles() {
        // base 10, multiplier 2, jitter off: 10, 20, 40.
        let p = policy(RetryStrategy::Exponential, 10);
        assert_eq!(p.delay_seconds(0), 10);
        assert_eq!(p.delay_seconds(1), 20);
        assert_eq!(p.delay_seconds(2), 40);
    }

    #[test]
    fn delay_is_capped() {
        let mut p = policy(RetryStrategy::Exponential, 1000);
        p.max_delay_seconds = 1800;
        assert_eq!(p.delay_seconds(5), 1800);
    }

    #[test]
    fn fixed_and_linear_shapes() {
        let fixed = policy(RetryStrategy::Fixed, 60);
        assert_eq!(fixed.delay_seconds(0), 60);
        assert_eq!(fixed.delay_seconds(4), 60);

        let linear = policy(RetryStrategy::Linear, 30);
        assert_eq!(linear.delay_seconds(0), 30);
        assert_eq!(linear.delay_seconds(2), 90);
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let mut p = policy(RetryStrategy::Fixed, 100);
        p.jitter = true;
        for _ in 0..50 {
            let d = p.delay_seconds(0);
            assert!((90..=110).contains(&d), "jittered delay {} out of band", d);
        }
    }

    #[test]
    fn retry_budget_and_retryability() {
        let p = policy(RetryStrategy::Exponential, 10);
        assert!(p.should_retry(0, true));
        assert!(p.should_retry(2, true));
        assert!(!p.should_retry(3, true));
        assert!(!p.should_retry(0, false));
    }

    #[test]
    fn zero_budget_is_exhausted_on_first_failure() {
        let mut p = policy(RetryStrategy::Exponential, 10);
        p.max_retries = 0;
        // No retry — the caller goes straight to compensation.
        assert!(!p.should_retry(0, true));
    }
}
