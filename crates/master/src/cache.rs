use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use redis::aio::MultiplexedConnection;
use serde_json::Value;

/// Bounded cache with explicit TTL eviction, backed either by an in-process
/// LRU or a shared Redis instance.
///
/// Used for node-state fast paths, checkpoint copies and install-key
/// bookkeeping. The database stays authoritative; writers invalidate here
/// after committing there.
pub struct UnifiedCache {
    backend: Backend,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

enum Backend {
    /// Guards the LRU map. std Mutex because it is never held across await
    /// points.
    Memory(Mutex<LruCache<String, MemoryEntry>>),
    Redis(MultiplexedConnection),
}

struct MemoryEntry {
    value: Value,
    expires_at: Instant,
}

/// Counter snapshot for the cache stats endpoint.
#[derive(Clone, Debug, serde::Serialize)]
pub struct CacheStats {
    pub backend_type: &'static str,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
}

impl UnifiedCache {
    pub fn memory(capacity: usize, default_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            backend: Backend::Memory(Mutex::new(LruCache::new(capacity))),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn redis(conn: MultiplexedConnection, default_ttl: Duration) -> Self {
        Self {
            backend: Backend::Redis(conn),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let result = match &self.backend {
            Backend::Memory(map) => {
                let mut map = map.lock().unwrap_or_else(|p| p.into_inner());
                match map.get(key) {
                    Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
                    Some(_) => {
                        map.pop(key);
                        None
                    }
                    None => None,
                }
            }
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                let raw: Result<Option<String>, _> = redis::cmd("GET")
                    .arg(format!("antcode:cache:{}", key))
                    .query_async(&mut conn)
                    .await;
                match raw {
                    Ok(raw) => raw.and_then(|s| serde_json::from_str(&s).ok()),
                    Err(e) => {
                        self.errors.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(key = key, error = %e, "Cache read failed");
                        None
                    }
                }
            }
        };

        if result.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("cache.hit").increment(1);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("cache.miss").increment(1);
        }
        result
    }

    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);

        match &self.backend {
            Backend::Memory(map) => {
                let mut map = map.lock().unwrap_or_else(|p| p.into_inner());
                map.put(
                    key.to_string(),
                    MemoryEntry {
                        value,
                        expires_at: Instant::now() + ttl,
                    },
                );
            }
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                let raw = value.to_string();
                let result: Result<(), _> = redis::cmd("SET")
                    .arg(format!("antcode:cache:{}", key))
                    .arg(raw)
                    .arg("EX")
                    .arg(ttl.as_secs().max(1))
                    .query_async(&mut conn)
                    .await;
                if let Err(e) = result {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key = key, error = %e, "Cache write failed");
                }
            }
        }
    }

    pub async fn delete(&self, key: &str) {
        match &self.backend {
            Backend::Memory(map) => {
                let mut map = map.lock().unwrap_or_else(|p| p.into_inner());
                map.pop(key);
            }
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                let result: Result<i64, _> = redis::cmd("DEL")
                    .arg(format!("antcode:cache:{}", key))
                    .query_async(&mut conn)
                    .await;
                if let Err(e) = result {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key = key, error = %e, "Cache delete failed");
                }
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            backend_type: match self.backend {
                Backend::Memory(_) => "memory",
                Backend::Redis(_) => "redis",
            },
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_hit_and_expiry() {
        let cache = UnifiedCache::memory(16, Duration::from_millis(20));
        cache.set("k", json!({"v": 1}), None).await;
        assert_eq!(cache.get("k").await, Some(json!({"v": 1})));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("k").await.is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn memory_lru_evicts_oldest() {
        let cache = UnifiedCache::memory(2, Duration::from_secs(60));
        cache.set("a", json!(1), None).await;
        cache.set("b", json!(2), None).await;
        cache.set("c", json!(3), None).await;

        assert!(cache.get("a").await.is_none());
        assert_eq!(cache.get("b").await, Some(json!(2)));
        assert_eq!(cache.get("c").await, Some(json!(3)));
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let cache = UnifiedCache::memory(16, Duration::from_secs(60));
        cache.set("k", json!(true), None).await;
        cache.delete("k").await;
        assert!(cache.get("k").await.is_none());
    }
}
