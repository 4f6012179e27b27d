use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::Mutex;

use antcode_common::types::{ProjectType, QueueStats, QueueStatus, QueuedTask};

use super::{now_epoch, QueueError, TaskQueue};

/// In-memory priority queue for single-master deployments.
///
/// A min-heap keyed by `(priority, enqueue_time, seq)` plus a map
/// `task_id → entry`. Cancellation is lazy: the map entry is dropped and the
/// stale heap item is skipped at dequeue. A priority update pushes a fresh
/// heap item with a bumped version; the superseded item is likewise skipped.
pub struct MemoryQueueBackend {
    inner: Mutex<Inner>,
    running: AtomicBool,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    cancelled: AtomicU64,
    priority_updates: AtomicU64,
}

struct Inner {
    heap: BinaryHeap<Reverse<HeapItem>>,
    map: HashMap<String, MapEntry>,
    seq: u64,
}

struct MapEntry {
    task: QueuedTask,
    version: u64,
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct HeapItem {
    priority: i32,
    /// Microsecond-resolution enqueue time, for a total order.
    enqueue_micros: u64,
    seq: u64,
    version: u64,
    task_id: String,
}

fn micros(epoch_seconds: f64) -> u64 {
    (epoch_seconds * 1_000_000.0) as u64
}

impl MemoryQueueBackend {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                map: HashMap::new(),
                seq: 0,
            }),
            running: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            priority_updates: AtomicU64::new(0),
        }
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            priority_updates: self.priority_updates.load(Ordering::Relaxed),
            connection_errors: None,
            reconnect_attempts: None,
            reconnect_successes: None,
        }
    }
}

impl Default for MemoryQueueBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TaskQueue for MemoryQueueBackend {
    async fn start(&self) -> Result<(), QueueError> {
        self.running.store(true, Ordering::Relaxed);
        tracing::info!(backend = "memory", "Task queue started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), QueueError> {
        self.running.store(false, Ordering::Relaxed);
        tracing::info!(backend = "memory", "Task queue stopped");
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
        let mut inner = self.inner.lock().await;

        if inner.map.contains_key(task_id) {
            tracing::warn!(task_id = task_id, "Task already queued, rejecting duplicate");
            return Ok(false);
        }

        let task = QueuedTask {
            task_id: task_id.to_string(),
            project_id: project_id.to_string(),
            project_type,
            priority,
            enqueue_time: now_epoch(),
            data,
        };

        inner.seq += 1;
        let item = HeapItem {
            priority,
            enqueue_micros: micros(task.enqueue_time),
            seq: inner.seq,
            version: 0,
            task_id: task_id.to_string(),
        };

        inner.heap.push(Reverse(item));
        inner
            .map
            .insert(task_id.to_string(), MapEntry { task, version: 0 });

        self.enqueued.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("queue.enqueued", "backend" => "memory").increment(1);
        tracing::debug!(task_id = task_id, priority = priority, "Task enqueued");
        Ok(true)
    }

    async fn dequeue(&self) -> Result<Option<QueuedTask>, QueueError> {
        let mut inner = self.inner.lock().await;

        // Skip heap tops superseded by cancel or priority update.
        while let Some(Reverse(item)) = inner.heap.pop() {
            let live = inner
                .map
                .get(&item.task_id)
                .is_some_and(|entry| entry.version == item.version);
            if !live {
                continue;
            }

            let entry = inner
                .map
                .remove(&item.task_id)
                .ok_or_else(|| QueueError::Operation("queue map desynced".into()))?;

            self.dequeued.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("queue.dequeued", "backend" => "memory").increment(1);
            tracing::debug!(task_id = %item.task_id, "Task dequeued");
            return Ok(Some(entry.task));
        }

        Ok(None)
    }

    async fn cancel(&self, task_id: &str) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().await;

        if inner.map.remove(task_id).is_none() {
            return Ok(false);
        }

        self.cancelled.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("queue.cancelled", "backend" => "memory").increment(1);
        tracing::debug!(task_id = task_id, "Queued task cancelled");
        Ok(true)
    }

    async fn update_priority(&self, task_id: &str, new_priority: i32) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().await;

        let Some(entry) = inner.map.get_mut(task_id) else {
            return Ok(false);
        };

        let old_priority = entry.task.priority;
        entry.task.priority = new_priority;
        entry.version += 1;
        let version = entry.version;
        // The original enqueue time is kept: the entry moves between bands
        // without cutting ahead within one.
        let enqueue_micros = micros(entry.task.enqueue_time);

        inner.seq += 1;
        let seq = inner.seq;
        inner.heap.push(Reverse(HeapItem {
            priority: new_priority,
            enqueue_micros,
            seq,
            version,
            task_id: task_id.to_string(),
        }));

        self.priority_updates.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            task_id = task_id,
            old_priority = old_priority,
            new_priority = new_priority,
            "Queued task priority updated"
        );
        Ok(true)
    }

    async fn peek(&self) -> Result<Option<QueuedTask>, QueueError> {
        let mut inner = self.inner.lock().await;

        // Drop stale tops while peeking so garbage stays bounded.
        loop {
            let (task_id, version) = match inner.heap.peek() {
                Some(Reverse(item)) => (item.task_id.clone(), item.version),
                None => return Ok(None),
            };

            let live = inner
                .map
                .get(&task_id)
                .is_some_and(|entry| entry.version == version);
            if live {
                return Ok(inner.map.get(&task_id).map(|e| e.task.clone()));
            }
            inner.heap.pop();
        }
    }

    async fn contains(&self, task_id: &str) -> bool {
        self.inner.lock().await.map.contains_key(task_id)
    }

    async fn size(&self) -> usize {
        self.inner.lock().await.map.len()
    }

    async fn status(&self) -> QueueStatus {
        let inner = self.inner.lock().await;
        QueueStatus {
            backend_type: "memory".into(),
            queue_depth: inner.map.len() as i64,
            running: self.running.load(Ordering::Relaxed),
            healthy: true,
            latency_ms: None,
            error: None,
            stats: self.stats(),
        }
    }

    async fn clear(&self) -> Result<usize, QueueError> {
        let mut inner = self.inner.lock().await;
        let count = inner.map.len();
        inner.heap.clear();
        inner.map.clear();
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn enqueue(queue: &MemoryQueueBackend, id: &str, priority: i32) {
        assert!(queue
            .enqueue(id, "p1", priority, json!({}), ProjectType::Code)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn dequeues_by_priority_then_fifo() {
        let queue = MemoryQueueBackend::new();
        enqueue(&queue, "a", 2).await;
        enqueue(&queue, "b", 0).await;
        enqueue(&queue, "c", 2).await;
        enqueue(&queue, "d", 1).await;

        assert_eq!(queue.dequeue().await.unwrap().unwrap().task_id, "b");
        assert_eq!(queue.dequeue().await.unwrap().unwrap().task_id, "d");
        assert_eq!(queue.dequeue().await.unwrap().unwrap().task_id, "a");
        assert_eq!(queue.dequeue().await.unwrap().unwrap().task_id, "c");
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_rejected() {
        let queue = MemoryQueueBackend::new();
        enqueue(&queue, "a", 1).await;
        assert!(!queue
            .enqueue("a", "p1", 0, json!({}), ProjectType::Code)
            .await
            .unwrap());
        assert_eq!(queue.size().await, 1);

        // The original entry is untouched.
        let head = queue.peek().await.unwrap().unwrap();
        assert_eq!(head.priority, 1);
    }

    #[tokio::test]
    async fn cancelled_task_never_surfaces() {
        let queue = MemoryQueueBackend::new();
        enqueue(&queue, "a", 1).await;
        enqueue(&queue, "b", 2).await;

        assert!(queue.cancel("a").await.unwrap());
        assert!(!queue.cancel("a").await.unwrap());
        assert!(!queue.contains("a").await);

        assert_eq!(queue.peek().await.unwrap().unwrap().task_id, "b");
        assert_eq!(queue.dequeue().await.unwrap().unwrap().task_id, "b");
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn priority_update_keeps_fifo_within_band() {
        // S6: A, B, C all at priority 2; a no-op value update of C must not
        // let it cut ahead.
        let queue = MemoryQueueBackend::new();
        enqueue(&queue, "a", 2).await;
        enqueue(&queue, "b", 2).await;
        enqueue(&queue, "c", 2).await;

        assert!(queue.update_priority("c", 2).await.unwrap());

        assert_eq!(queue.dequeue().await.unwrap().unwrap().task_id, "a");
        assert_eq!(queue.dequeue().await.unwrap().unwrap().task_id, "b");
        assert_eq!(queue.dequeue().await.unwrap().unwrap().task_id, "c");

        enqueue(&queue, "d", 0).await;
        assert_eq!(queue.dequeue().await.unwrap().unwrap().task_id, "d");
    }

    #[tokio::test]
    async fn priority_update_moves_between_bands() {
        let queue = MemoryQueueBackend::new();
        enqueue(&queue, "a", 3).await;
        enqueue(&queue, "b", 3).await;

        assert!(queue.update_priority("b", 0).await.unwrap());
        assert!(!queue.update_priority("missing", 0).await.unwrap());

        assert_eq!(queue.dequeue().await.unwrap().unwrap().task_id, "b");
        assert_eq!(queue.dequeue().await.unwrap().unwrap().task_id, "a");
    }

    #[tokio::test]
    async fn clear_empties_everything() {
        let queue = MemoryQueueBackend::new();
        enqueue(&queue, "a", 1).await;
        enqueue(&queue, "b", 1).await;

        assert_eq!(queue.clear().await.unwrap(), 2);
        assert_eq!(queue.size().await, 0);
        assert!(queue.dequeue().await.unwrap().is_none());
    }
}
