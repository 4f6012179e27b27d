use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use serde_json::Value;
use tokio::sync::Mutex;

use antcode_common::types::{ProjectType, QueueStats, QueueStatus, QueuedTask};

use super::{now_epoch, QueueError, TaskQueue};

const QUEUE_KEY: &str = "antcode:task_queue";
const TASK_DATA_PREFIX: &str = "antcode:task_data:";

const MAX_RECONNECT_ATTEMPTS: u32 = 3;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Priority bands are 0..=4, so one band spans 1e10 score units — far wider
/// than any epoch timestamp, keeping bands disjoint.
const PRIORITY_SCALE: f64 = 1e10;

type OpFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, redis::RedisError>> + Send + 'a>>;

/// Redis-backed priority queue for multi-master deployments sharing one
/// backlog.
///
/// A sorted set keyed by task id with score `priority * 1e10 +
/// enqueue_time`, plus a companion string per task carrying the serialized
/// envelope. ZPOPMIN keeps dequeue atomic across masters. Connection-class
/// failures trigger up to three reconnect attempts with linear back-off
/// before surfacing as `QueueError::Connection`.
pub struct RedisQueueBackend {
    url: String,
    conn: Mutex<Option<MultiplexedConnection>>,
    /// Serializes check-then-write sequences (enqueue, priority update).
    op_lock: Mutex<()>,
    running: AtomicBool,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    cancelled: AtomicU64,
    priority_updates: AtomicU64,
    connection_errors: AtomicU64,
    reconnect_attempts: AtomicU64,
    reconnect_successes: AtomicU64,
}

fn data_key(task_id: &str) -> String {
    format!("{}{}", TASK_DATA_PREFIX, task_id)
}

fn score_for(priority: i32, enqueue_time: f64) -> f64 {
    priority as f64 * PRIORITY_SCALE + enqueue_time
}

fn is_connection_error(e: &redis::RedisError) -> bool {
    e.is_io_error() || e.is_timeout() || e.is_connection_refusal() || e.is_connection_dropped()
}

impl RedisQueueBackend {
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let backend = Self {
            url: url.to_string(),
            conn: Mutex::new(None),
            op_lock: Mutex::new(()),
            running: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            priority_updates: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            reconnect_successes: AtomicU64::new(0),
        };
        backend.ensure_connection().await?;
        tracing::info!(backend = "redis", "Task queue connected");
        Ok(backend)
    }

    /// Hand out a live connection, dialing a fresh one when the cached
    /// connection is gone or fails a ping.
    async fn ensure_connection(&self) -> Result<MultiplexedConnection, QueueError> {
        let mut guard = self.conn.lock().await;

        if let Some(conn) = guard.as_ref() {
            let mut probe = conn.clone();
            let pong: Result<String, _> = redis::cmd("PING").query_async(&mut probe).await;
            match pong {
                Ok(_) => return Ok(conn.clone()),
                Err(e) => {
                    tracing::warn!(error = %e, "Redis connection lost, redialing");
                    *guard = None;
                }
            }
        }

        let client = redis::Client::open(self.url.as_str()).map_err(|e| {
            self.connection_errors.fetch_add(1, Ordering::Relaxed);
            QueueError::Connection(e.to_string())
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                self.connection_errors.fetch_add(1, Ordering::Relaxed);
                QueueError::Connection(e.to_string())
            })?;

        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Linear back-off reconnect loop. Returns whether a connection was
    /// re-established.
    async fn reconnect(&self) -> bool {
        {
            let mut guard = self.conn.lock().await;
            *guard = None;
        }

        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                attempt = attempt,
                max = MAX_RECONNECT_ATTEMPTS,
                "Attempting Redis reconnect"
            );

            match self.ensure_connection().await {
                Ok(_) => {
                    self.reconnect_successes.fetch_add(1, Ordering::Relaxed);
                    tracing::info!("Redis reconnect succeeded");
                    return true;
                }
                Err(e) => {
                    tracing::warn!(attempt = attempt, error = %e, "Redis reconnect failed");
                    if attempt < MAX_RECONNECT_ATTEMPTS {
                        tokio::time::sleep(RECONNECT_DELAY * attempt).await;
                    }
                }
            }
        }

        tracing::error!(
            attempts = MAX_RECONNECT_ATTEMPTS,
            "Redis reconnect attempts exhausted"
        );
        false
    }

    /// Run an operation, retrying once after a successful reconnect when it
    /// failed with a connection-class error.
    async fn with_retry<T>(
        &self,
        name: &str,
        mut op: impl for<'a> FnMut(&'a mut MultiplexedConnection) -> OpFuture<'a, T>,
    ) -> Result<T, QueueError> {
        let mut conn = self.ensure_connection().await?;

        match op(&mut conn).await {
            Ok(value) => Ok(value),
            Err(e) if is_connection_error(&e) => {
                self.connection_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(operation = name, error = %e, "Redis operation failed, reconnecting");

                if !self.reconnect().await {
                    return Err(QueueError::Connection(format!(
                        "Redis unreachable, operation '{}' not executed",
                        name
                    )));
                }

                let mut conn = self.ensure_connection().await?;
                op(&mut conn).await.map_err(|e| {
                    QueueError::Connection(format!("'{}' failed after reconnect: {}", name, e))
                })
            }
            Err(e) => Err(QueueError::Operation(e.to_string())),
        }
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            priority_updates: self.priority_updates.load(Ordering::Relaxed),
            connection_errors: Some(self.connection_errors.load(Ordering::Relaxed)),
            reconnect_attempts: Some(self.reconnect_attempts.load(Ordering::Relaxed)),
            reconnect_successes: Some(self.reconnect_successes.load(Ordering::Relaxed)),
        }
    }
}

#[async_trait::async_trait]
impl TaskQueue for RedisQueueBackend {
    async fn start(&self) -> Result<(), QueueError> {
        self.ensure_connection().await?;
        self.running.store(true, Ordering::Relaxed);
        tracing::info!(backend = "redis", "Task queue started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), QueueError> {
        self.running.store(false, Ordering::Relaxed);
        let mut guard = self.conn.lock().await;
        *guard = None;
        tracing::info!(backend = "redis", "Task queue stopped");
        Ok(())
    }

    async fn enqueue(
        &self,
        task_id: &str,
        project_id: &str,
        priority: i32,
        data: Value,
        project_type: ProjectType,
    ) -> Result<bool, QueueError> {
        let _guard = self.op_lock.lock().await;

        let task = QueuedTask {
            task_id: task_id.to_string(),
            project_id: project_id.to_string(),
            project_type,
            priority,
            enqueue_time: now_epoch(),
            data,
        };
        let payload = serde_json::to_string(&task)
            .map_err(|e| QueueError::Operation(format!("serialize envelope: {}", e)))?;
        let score = score_for(priority, task.enqueue_time);

        let accepted = self
            .with_retry("enqueue", move |conn| {
                let task_id = task.task_id.clone();
                let payload = payload.clone();
                Box::pin(async move {
                    let existing: Option<f64> = redis::cmd("ZSCORE")
                        .arg(QUEUE_KEY)
                        .arg(&task_id)
                        .query_async(conn)
                        .await?;
                    if existing.is_some() {
                        return Ok(false);
                    }

                    let mut pipe = redis::pipe();
                    pipe.atomic()
                        .cmd("ZADD")
                        .arg(QUEUE_KEY)
                        .arg(score)
                        .arg(&task_id)
                        .ignore()
                        .cmd("SET")
                        .arg(data_key(&task_id))
                        .arg(&payload)
                        .ignore();
                    pipe.query_async::<()>(conn).await?;
                    Ok(true)
                })
            })
            .await?;

        if accepted {
            self.enqueued.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("queue.enqueued", "backend" => "redis").increment(1);
            tracing::debug!(task_id = task_id, priority = priority, "Task enqueued");
        } else {
            tracing::warn!(task_id = task_id, "Task already queued, rejecting duplicate");
        }
        Ok(accepted)
    }

    async fn dequeue(&self) -> Result<Option<QueuedTask>, QueueError> {
        let popped = self
            .with_retry("dequeue", |conn| {
                Box::pin(async move {
                    let popped: Vec<(String, f64)> = redis::cmd("ZPOPMIN")
                        .arg(QUEUE_KEY)
                        .arg(1)
                        .query_async(conn)
                        .await?;

                    let Some((task_id, _score)) = popped.into_iter().next() else {
                        return Ok(None);
                    };

                    let payload: Option<String> = redis::cmd("GET")
                        .arg(data_key(&task_id))
                        .query_async(conn)
                        .await?;
                    let _: i64 = redis::cmd("DEL")
                        .arg(data_key(&task_id))
                        .query_async(conn)
                        .await?;

                    Ok(payload.map(|p| (task_id, p)))
                })
            })
            .await?;

        let Some((task_id, payload)) = popped else {
            return Ok(None);
        };

        let task: QueuedTask = serde_json::from_str(&payload).map_err(|e| {
            QueueError::Operation(format!("corrupt envelope for {}: {}", task_id, e))
        })?;

        self.dequeued.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("queue.dequeued", "backend" => "redis").increment(1);
        tracing::debug!(task_id = %task.task_id, "Task dequeued");
        Ok(Some(task))
    }

    async fn cancel(&self, task_id: &str) -> Result<bool, QueueError> {
        let removed = self
            .with_retry("cancel", |conn| {
                let task_id = task_id.to_string();
                Box::pin(async move {
                    let mut pipe = redis::pipe();
                    pipe.atomic()
                        .cmd("ZREM")
                        .arg(QUEUE_KEY)
                        .arg(&task_id)
                        .cmd("DEL")
                        .arg(data_key(&task_id))
                        .ignore();
                    let (removed,): (i64,) = pipe.query_async(conn).await?;
                    Ok(removed > 0)
                })
            })
            .await?;

        if removed {
            self.cancelled.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("queue.cancelled", "backend" => "redis").increment(1);
            tracing::debug!(task_id = task_id, "Queued task cancelled");
        }
        Ok(removed)
    }

    async fn update_priority(&self, task_id: &str, new_priority: i32) -> Result<bool, QueueError> {
        let _guard = self.op_lock.lock().await;

        let updated = self
            .with_retry("update_priority", |conn| {
                let task_id = task_id.to_string();
                Box::pin(async move {
                    let payload: Option<String> = redis::cmd("GET")
                        .arg(data_key(&task_id))
                        .query_async(conn)
                        .await?;
                    let Some(payload) = payload else {
                        return Ok(false);
                    };
                    let Ok(mut task) = serde_json::from_str::<QueuedTask>(&payload) else {
                        return Ok(false);
                    };

                    task.priority = new_priority;
                    // Keep the original enqueue time so the entry does not
                    // leapfrog within its new band.
                    let new_score = score_for(new_priority, task.enqueue_time);
                    let Ok(new_payload) = serde_json::to_string(&task) else {
                        return Ok(false);
                    };

                    let mut pipe = redis::pipe();
                    pipe.atomic()
                        .cmd("ZADD")
                        .arg(QUEUE_KEY)
                        .arg("XX")
                        .arg(new_score)
                        .arg(&task_id)
                        .ignore()
                        .cmd("SET")
                        .arg(data_key(&task_id))
                        .arg(&new_payload)
                        .ignore();
                    pipe.query_async::<()>(conn).await?;

                    let present: Option<f64> = redis::cmd("ZSCORE")
                        .arg(QUEUE_KEY)
                        .arg(&task_id)
                        .query_async(conn)
                        .await?;
                    Ok(present.is_some())
                })
            })
            .await?;

        if updated {
            self.priority_updates.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                task_id = task_id,
                new_priority = new_priority,
                "Queued task priority updated"
            );
        }
        Ok(updated)
    }

    async fn peek(&self) -> Result<Option<QueuedTask>, QueueError> {
        let payload = self
            .with_retry("peek", |conn| {
                Box::pin(async move {
                    let head: Vec<String> = redis::cmd("ZRANGE")
                        .arg(QUEUE_KEY)
                        .arg(0)
                        .arg(0)
                        .query_async(conn)
                        .await?;

                    let Some(task_id) = head.into_iter().next() else {
                        return Ok(None);
                    };

                    let payload: Option<String> = redis::cmd("GET")
                        .arg(data_key(&task_id))
                        .query_async(conn)
                        .await?;
                    Ok(payload)
                })
            })
            .await?;

        Ok(payload.and_then(|p| serde_json::from_str(&p).ok()))
    }

    async fn contains(&self, task_id: &str) -> bool {
        let result = self
            .with_retry("contains", |conn| {
                let task_id = task_id.to_string();
                Box::pin(async move {
                    let score: Option<f64> = redis::cmd("ZSCORE")
                        .arg(QUEUE_KEY)
                        .arg(&task_id)
                        .query_async(conn)
                        .await?;
                    Ok(score.is_some())
                })
            })
            .await;
        result.unwrap_or(false)
    }

    async fn size(&self) -> usize {
        let result = self
            .with_retry("size", |conn| {
                Box::pin(async move {
                    let depth: i64 = redis::cmd("ZCARD").arg(QUEUE_KEY).query_async(conn).await?;
                    Ok(depth.max(0) as usize)
                })
            })
            .await;
        result.unwrap_or(0)
    }

    async fn status(&self) -> QueueStatus {
        let start = std::time::Instant::now();
        let depth = self
            .with_retry("status", |conn| {
                Box::pin(async move {
                    let depth: i64 = redis::cmd("ZCARD").arg(QUEUE_KEY).query_async(conn).await?;
                    let _: String = redis::cmd("PING").query_async(conn).await?;
                    Ok(depth)
                })
            })
            .await;

        match depth {
            Ok(depth) => QueueStatus {
                backend_type: "redis".into(),
                queue_depth: depth,
                running: self.running.load(Ordering::Relaxed),
                healthy: true,
                latency_ms: Some(start.elapsed().as_secs_f64() * 1000.0),
                error: None,
                stats: self.stats(),
            },
            Err(e) => QueueStatus {
                backend_type: "redis".into(),
                queue_depth: -1,
                running: self.running.load(Ordering::Relaxed),
                healthy: false,
                latency_ms: None,
                error: Some(e.to_string()),
                stats: self.stats(),
            },
        }
    }

    async fn clear(&self) -> Result<usize, QueueError> {
        let _guard = self.op_lock.lock().await;

        self.with_retry("clear", |conn| {
            Box::pin(async move {
                let task_ids: Vec<String> = redis::cmd("ZRANGE")
                    .arg(QUEUE_KEY)
                    .arg(0)
                    .arg(-1)
                    .query_async(conn)
                    .await?;
                let count = task_ids.len();

                if count > 0 {
                    let mut pipe = redis::pipe();
                    pipe.atomic().cmd("DEL").arg(QUEUE_KEY).ignore();
                    for task_id in &task_ids {
                        pipe.cmd("DEL").arg(data_key(task_id)).ignore();
                    }
                    pipe.query_async::<()>(conn).await?;
                }

                Ok(count)
            })
        })
        .await
    }
}
