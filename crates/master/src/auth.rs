use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use lru::LruCache;
use rand::RngCore;
use serde_json::Value;
use sha2::Sha256;

use antcode_common::api::worker::{InstallKeyResponse, RegisterByKeyRequest, RegisterByKeyResponse};
use antcode_common::config::NodeAuthConfig;
use antcode_common::ids::NodeId;
use antcode_common::types::{Node, NodeStatus};
use antcode_common::{AntCodeError, Result};

use crate::cache::UnifiedCache;
use crate::registry::NodeRegistry;
use crate::store::StoreClient;

type HmacSha256 = Hmac<Sha256>;

/// Authentication headers carried by every worker → master report.
#[derive(Clone, Debug)]
pub struct ReportHeaders {
    pub node_id: String,
    pub machine_code: String,
    pub timestamp: i64,
    pub nonce: String,
    pub signature: String,
    pub api_key: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing or malformed auth headers")]
    MissingHeaders,

    #[error("request rate limit exceeded")]
    RateLimited,

    #[error("timestamp outside tolerance")]
    TimestampSkew,

    #[error("nonce invalid or already used")]
    NonceReplayed,

    #[error("unknown node")]
    UnknownNode,

    #[error("signature mismatch")]
    InvalidSignature,
}

impl From<AuthError> for AntCodeError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::MissingHeaders => AntCodeError::Validation(e.to_string()),
            AuthError::UnknownNode => AntCodeError::NotFound(e.to_string()),
            other => AntCodeError::Permission(other.to_string()),
        }
    }
}

struct VerifierInner {
    /// Seen nonces with their timestamps; the LRU cap bounds memory and
    /// evicts oldest entries first.
    nonces: LruCache<String, i64>,
    /// Per-node (count, window start).
    rates: HashMap<String, (u32, Instant)>,
}

/// Validates worker report signatures: HMAC-SHA256 over
/// `"{ts}.{nonce}.{canonical_json(body)}"`, with replay protection from
/// the timestamp window, single-use nonces and a per-node rate limit.
pub struct NodeAuthVerifier {
    config: NodeAuthConfig,
    /// std Mutex — held only for map lookups, never across await points.
    inner: Mutex<VerifierInner>,
}

impl NodeAuthVerifier {
    pub fn new(config: NodeAuthConfig) -> Self {
        let cap = NonZeroUsize::new(config.max_nonces).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            inner: Mutex::new(VerifierInner {
                nonces: LruCache::new(cap),
                rates: HashMap::new(),
            }),
        }
    }

    /// Validate a report against the node's stored credentials.
    ///
    /// Check order matters: the timestamp gate runs before any nonce state
    /// is touched, so a stale request cannot pollute the nonce window.
    pub fn verify(&self, node: &Node, headers: &ReportHeaders, body: &Value) -> std::result::Result<(), AuthError> {
        if !self.check_rate_limit(&headers.node_id) {
            metrics::counter!("auth.rejected", "reason" => "rate_limit").increment(1);
            return Err(AuthError::RateLimited);
        }

        let now = chrono::Utc::now().timestamp();
        if (now - headers.timestamp).abs() > self.config.timestamp_tolerance_seconds {
            metrics::counter!("auth.rejected", "reason" => "timestamp").increment(1);
            tracing::warn!(
                node_id = %headers.node_id,
                skew_s = (now - headers.timestamp).abs(),
                "Report timestamp outside tolerance"
            );
            return Err(AuthError::TimestampSkew);
        }

        if !self.consume_nonce(&headers.nonce, headers.timestamp, now) {
            metrics::counter!("auth.rejected", "reason" => "nonce").increment(1);
            tracing::warn!(node_id = %headers.node_id, "Nonce rejected");
            return Err(AuthError::NonceReplayed);
        }

        if headers.api_key != node.api_key {
            metrics::counter!("auth.rejected", "reason" => "api_key").increment(1);
            return Err(AuthError::InvalidSignature);
        }

        let payload = sign_payload(headers.timestamp, &headers.nonce, body);
        let Ok(signature_bytes) = hex::decode(&headers.signature) else {
            metrics::counter!("auth.rejected", "reason" => "signature").increment(1);
            return Err(AuthError::InvalidSignature);
        };

        let mut mac = HmacSha256::new_from_slice(node.secret_key.as_bytes())
            .map_err(|_| AuthError::InvalidSignature)?;
        mac.update(payload.as_bytes());
        // verify_slice is the constant-time comparison.
        if mac.verify_slice(&signature_bytes).is_err() {
            metrics::counter!("auth.rejected", "reason" => "signature").increment(1);
            tracing::warn!(node_id = %headers.node_id, "Signature mismatch");
            return Err(AuthError::InvalidSignature);
        }

        Ok(())
    }

    fn consume_nonce(&self, nonce: &str, timestamp: i64, now: i64) -> bool {
        if nonce.len() < 8 {
            return false;
        }

        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(seen_at) = inner.nonces.get(nonce) {
            if now - *seen_at < self.config.nonce_window_seconds as i64 {
                return false;
            }
        }
        inner.nonces.put(nonce.to_string(), timestamp);
        true
    }

    fn check_rate_limit(&self, node_id: &str) -> bool {
        let window = Duration::from_secs(self.config.rate_limit_window_seconds);
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());

        match inner.rates.get_mut(node_id) {
            Some((count, started)) if started.elapsed() < window => {
                if *count >= self.config.rate_limit_requests {
                    return false;
                }
                *count += 1;
                true
            }
            _ => {
                inner.rates.insert(node_id.to_string(), (1, Instant::now()));
                true
            }
        }
    }
}

/// `"{ts}.{nonce}.{canonical_json(body)}"` — the signed string.
pub fn sign_payload(timestamp: i64, nonce: &str, body: &Value) -> String {
    format!("{}.{}.{}", timestamp, nonce, canonical_json(body))
}

/// Compute a valid report signature; the worker side of the contract,
/// used by tests and by the install flow's credential echo.
pub fn compute_signature(secret: &str, timestamp: i64, nonce: &str, body: &Value) -> String {
    let payload = sign_payload(timestamp, nonce, body);
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Compact JSON with object keys sorted lexicographically at every level,
/// so both sides serialize the body identically.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// One-shot install keys: generation, claim with source binding, and the
/// failure-counter block. All three replay invariants (nonce uniqueness is
/// the verifier's; freshness, binding and one-shot claim are here) live in
/// this module so none can be skipped.
pub struct InstallKeyService {
    store: Arc<StoreClient>,
    cache: Arc<UnifiedCache>,
    registry: Arc<NodeRegistry>,
    config: NodeAuthConfig,
}

impl InstallKeyService {
    pub fn new(
        store: Arc<StoreClient>,
        cache: Arc<UnifiedCache>,
        registry: Arc<NodeRegistry>,
        config: NodeAuthConfig,
    ) -> Self {
        Self {
            store,
            cache,
            registry,
            config,
        }
    }

    /// Mint a fresh one-shot key.
    pub async fn generate(&self, created_by: Option<i64>) -> Result<InstallKeyResponse> {
        let key = random_hex(24);
        let record = self
            .store
            .create_install_key(&key, created_by, self.config.install_key_ttl_seconds)
            .await?;

        tracing::info!(expires_at = %record.expires_at, "Install key generated");
        Ok(InstallKeyResponse {
            install_key: record.install_key,
            expires_at: record.expires_at,
        })
    }

    /// Consume a key: verify freshness, enforce the per-(key, source)
    /// failure block, bind the first claimant's source, register the node
    /// and return its credentials.
    pub async fn register(
        &self,
        request: &RegisterByKeyRequest,
        source: &str,
    ) -> Result<(Node, RegisterByKeyResponse)> {
        let block_key = format!("install_block:{}:{}", request.install_key, source);
        if self.cache.get(&block_key).await.is_some() {
            return Err(AntCodeError::Permission(
                "too many failed attempts, temporarily blocked".into(),
            ));
        }

        let record = match self.store.get_install_key(&request.install_key).await? {
            Some(record) if !record.is_expired() && !record.is_claimed() => record,
            Some(record) if record.is_expired() => {
                self.record_failure(&request.install_key, source).await;
                return Err(AntCodeError::Permission("install key expired".into()));
            }
            Some(_) => {
                self.record_failure(&request.install_key, source).await;
                return Err(AntCodeError::Conflict("install key already claimed".into()));
            }
            None => {
                self.record_failure(&request.install_key, source).await;
                return Err(AntCodeError::Permission("unknown install key".into()));
            }
        };

        // First successful claimant binds the source address; anyone else
        // is rejected from then on.
        let bound = self
            .store
            .bind_install_key_source(&record.install_key, source)
            .await?;
        if bound.as_deref() != Some(source) {
            self.record_failure(&request.install_key, source).await;
            return Err(AntCodeError::Permission(
                "install key is bound to another source".into(),
            ));
        }

        let node = Node {
            id: 0,
            public_id: NodeId::new(),
            name: request.name.clone(),
            host: request.host.clone(),
            port: request.port,
            status: NodeStatus::Online,
            region: request.region.clone(),
            tags: request.tags.clone(),
            capabilities: request.capabilities.clone(),
            metrics: None,
            last_heartbeat: Some(chrono::Utc::now()),
            api_key: random_hex(24),
            secret_key: random_hex(32),
            resource_limits: None,
            machine_code: Some(request.machine_code.clone()),
            version: None,
            os_type: None,
            created_at: chrono::Utc::now(),
        };

        let node_id = self.store.create_node(&node).await.map_err(|e| {
            AntCodeError::Conflict(format!("node registration failed: {}", e))
        })?;

        // The key is spent exactly once; losing this race means another
        // claimant with the same source got in between.
        if !self
            .store
            .claim_install_key(&record.install_key, node_id)
            .await?
        {
            self.store.delete_node(node_id).await?;
            return Err(AntCodeError::Conflict("install key already claimed".into()));
        }

        let mut node = node;
        node.id = node_id;
        self.registry.insert(node.clone()).await;
        self.clear_failures(&request.install_key, source).await;

        tracing::info!(node = %node.name, source = source, "Worker registered via install key");
        metrics::counter!("install_keys.claimed").increment(1);

        let response = RegisterByKeyResponse {
            worker_id: node.public_id.to_string(),
            api_key: node.api_key.clone(),
            secret_key: node.secret_key.clone(),
        };
        Ok((node, response))
    }

    async fn record_failure(&self, key: &str, source: &str) {
        let fail_key = format!("install_fail:{}:{}", key, source);
        let count = self
            .cache
            .get(&fail_key)
            .await
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
            + 1;

        self.cache
            .set(
                &fail_key,
                count.into(),
                Some(Duration::from_secs(self.config.install_key_block_seconds)),
            )
            .await;

        if count >= self.config.install_key_max_failures as u64 {
            let block_key = format!("install_block:{}:{}", key, source);
            self.cache
                .set(
                    &block_key,
                    true.into(),
                    Some(Duration::from_secs(self.config.install_key_block_seconds)),
                )
                .await;
            tracing::warn!(source = source, "Install key source blocked after repeated failures");
            metrics::counter!("install_keys.blocked").increment(1);
        }
    }

    async fn clear_failures(&self, key: &str, source: &str) {
        self.cache
            .delete(&format!("install_fail:{}:{}", key, source))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use antcode_common::ids::NodeId;
    use chrono::Utc;
    use serde_json::json;

    fn node_with_secret(secret: &str) -> Node {
        Node {
            id: 1,
            public_id: NodeId::new(),
            name: "n1".into(),
            host: "127.0.0.1".into(),
            port: 9001,
            status: NodeStatus::Online,
            region: None,
            tags: Vec::new(),
            capabilities: Default::default(),
            metrics: None,
            last_heartbeat: None,
            api_key: "api-key".into(),
            secret_key: secret.into(),
            resource_limits: None,
            machine_code: Some("mc".into()),
            version: None,
            os_type: None,
            created_at: Utc::now(),
        }
    }

    fn headers(node: &Node, timestamp: i64, nonce: &str, body: &Value) -> ReportHeaders {
        ReportHeaders {
            node_id: node.public_id.to_string(),
            machine_code: "mc".into(),
            timestamp,
            nonce: nonce.into(),
            signature: compute_signature(&node.secret_key, timestamp, nonce, body),
            api_key: node.api_key.clone(),
        }
    }

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let value = json!({"b": 1, "a": {"d": true, "c": [1, {"z": 0, "y": 1}]}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"c":[1,{"y":1,"z":0}],"d":true},"b":1}"#
        );
    }

    #[test]
    fn valid_signature_verifies() {
        let verifier = NodeAuthVerifier::new(NodeAuthConfig::default());
        let node = node_with_secret("topsecret");
        let body = json!({"execution_id": "e1", "status": "success"});
        let h = headers(&node, Utc::now().timestamp(), "nonce-0001", &body);

        assert!(verifier.verify(&node, &h, &body).is_ok());
    }

    #[test]
    fn replayed_nonce_is_rejected() {
        let verifier = NodeAuthVerifier::new(NodeAuthConfig::default());
        let node = node_with_secret("topsecret");
        let body = json!({"k": "v"});
        let h = headers(&node, Utc::now().timestamp(), "nonce-0002", &body);

        assert!(verifier.verify(&node, &h, &body).is_ok());
        let err = verifier.verify(&node, &h, &body).unwrap_err();
        assert!(matches!(err, AuthError::NonceReplayed));
    }

    #[test]
    fn stale_timestamp_rejected_before_nonce_state() {
        let verifier = NodeAuthVerifier::new(NodeAuthConfig::default());
        let node = node_with_secret("topsecret");
        let body = json!({"k": "v"});
        let stale = Utc::now().timestamp() - 301;
        let h = headers(&node, stale, "nonce-0003", &body);

        let err = verifier.verify(&node, &h, &body).unwrap_err();
        assert!(matches!(err, AuthError::TimestampSkew));

        // The nonce was never consumed: a fresh request may still use it.
        let fresh = headers(&node, Utc::now().timestamp(), "nonce-0003", &body);
        assert!(verifier.verify(&node, &fresh, &body).is_ok());
    }

    #[test]
    fn tampered_body_fails_verification() {
        let verifier = NodeAuthVerifier::new(NodeAuthConfig::default());
        let node = node_with_secret("topsecret");
        let body = json!({"status": "success"});
        let h = headers(&node, Utc::now().timestamp(), "nonce-0004", &body);

        let tampered = json!({"status": "failed"});
        let err = verifier.verify(&node, &h, &tampered).unwrap_err();
        assert!(matches!(err, AuthError::InvalidSignature));
    }

    #[test]
    fn short_nonce_is_rejected() {
        let verifier = NodeAuthVerifier::new(NodeAuthConfig::default());
        let node = node_with_secret("topsecret");
        let body = json!({});
        let h = headers(&node, Utc::now().timestamp(), "short", &body);

        let err = verifier.verify(&node, &h, &body).unwrap_err();
        assert!(matches!(err, AuthError::NonceReplayed));
    }

    #[test]
    fn rate_limit_trips_at_budget() {
        let config = NodeAuthConfig {
            rate_limit_requests: 3,
            ..NodeAuthConfig::default()
        };
        let verifier = NodeAuthVerifier::new(config);
        let node = node_with_secret("topsecret");
        let body = json!({});

        for i in 0..3 {
            let h = headers(&node, Utc::now().timestamp(), &format!("nonce-10{}", i), &body);
            assert!(verifier.verify(&node, &h, &body).is_ok());
        }

        let h = headers(&node, Utc::now().timestamp(), "nonce-1099", &body);
        let err = verifier.verify(&node, &h, &body).unwrap_err();
        assert!(matches!(err, AuthError::RateLimited));
    }

    #[test]
    fn wrong_api_key_is_rejected() {
        let verifier = NodeAuthVerifier::new(NodeAuthConfig::default());
        let node = node_with_secret("topsecret");
        let body = json!({});
        let mut h = headers(&node, Utc::now().timestamp(), "nonce-0005", &body);
        h.api_key = "other-key".into();

        let err = verifier.verify(&node, &h, &body).unwrap_err();
        assert!(matches!(err, AuthError::InvalidSignature));
    }
}
