//! Integration tests for the Redis queue backend.
//! All tests are `#[ignore]` — run with `cargo test -- --ignored` against a
//! live Redis (REDIS_URL, defaults to redis://localhost:6379).

use serde_json::json;

use antcode_common::types::ProjectType;
use antcode_master::queue::{RedisQueueBackend, TaskQueue};

async fn setup() -> RedisQueueBackend {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
    let queue = RedisQueueBackend::connect(&url)
        .await
        .expect("Failed to connect to Redis");
    queue.start().await.expect("Failed to start queue");
    queue.clear().await.expect("Failed to clear queue");
    queue
}

#[tokio::test]
#[ignore]
async fn redis_orders_by_priority_then_enqueue_time() {
    let queue = setup().await;

    for (id, priority) in [("a", 2), ("b", 0), ("c", 2), ("d", 1)] {
        assert!(queue
            .enqueue(id, "p1", priority, json!({}), ProjectType::Code)
            .await
            .unwrap());
    }

    let mut order = Vec::new();
    while let Some(task) = queue.dequeue().await.unwrap() {
        order.push(task.task_id);
    }
    assert_eq!(order, vec!["b", "d", "a", "c"]);
}

#[tokio::test]
#[ignore]
async fn redis_enqueue_is_idempotent() {
    let queue = setup().await;

    assert!(queue
        .enqueue("dup", "p1", 1, json!({"n": 1}), ProjectType::Code)
        .await
        .unwrap());
    assert!(!queue
        .enqueue("dup", "p1", 0, json!({"n": 2}), ProjectType::Code)
        .await
        .unwrap());

    assert_eq!(queue.size().await, 1);
    let head = queue.peek().await.unwrap().unwrap();
    assert_eq!(head.priority, 1, "duplicate must not modify the entry");

    queue.clear().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn redis_cancel_removes_entry_and_data() {
    let queue = setup().await;

    queue
        .enqueue("x", "p1", 1, json!({}), ProjectType::Rule)
        .await
        .unwrap();
    assert!(queue.cancel("x").await.unwrap());
    assert!(!queue.cancel("x").await.unwrap());
    assert!(!queue.contains("x").await);
    assert!(queue.dequeue().await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
async fn redis_priority_update_keeps_band_fifo() {
    let queue = setup().await;

    // S6: three entries in one band; a same-value update must not reorder.
    for id in ["a", "b", "c"] {
        queue
            .enqueue(id, "p1", 2, json!({}), ProjectType::Code)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert!(queue.update_priority("c", 2).await.unwrap());

    assert_eq!(queue.dequeue().await.unwrap().unwrap().task_id, "a");
    assert_eq!(queue.dequeue().await.unwrap().unwrap().task_id, "b");
    assert_eq!(queue.dequeue().await.unwrap().unwrap().task_id, "c");

    queue
        .enqueue("d", "p1", 0, json!({}), ProjectType::Code)
        .await
        .unwrap();
    assert_eq!(queue.dequeue().await.unwrap().unwrap().task_id, "d");
}

#[tokio::test]
#[ignore]
async fn redis_status_reports_depth_and_latency() {
    let queue = setup().await;

    queue
        .enqueue("s1", "p1", 1, json!({}), ProjectType::Code)
        .await
        .unwrap();

    let status = queue.status().await;
    assert!(status.healthy);
    assert_eq!(status.backend_type, "redis");
    assert_eq!(status.queue_depth, 1);
    assert!(status.latency_ms.is_some());

    queue.clear().await.unwrap();
}
