use chrono::{DateTime, Duration, Utc};

use super::{StoreClient, StoreError};

/// A one-shot worker install key.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct InstallKeyRecord {
    pub id: i64,
    pub install_key: String,
    pub created_by: Option<i64>,
    pub expires_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_node: Option<i64>,
    pub allowed_source: Option<String>,
}

impl InstallKeyRecord {
    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed_at.is_some()
    }
}

impl StoreClient {
    pub async fn create_install_key(
        &self,
        key: &str,
        created_by: Option<i64>,
        ttl_seconds: i64,
    ) -> Result<InstallKeyRecord, StoreError> {
        let expires_at = Utc::now() + Duration::seconds(ttl_seconds);

        let row = sqlx::query_as::<_, InstallKeyRecord>(
            r#"
            INSERT INTO task_install_keys (install_key, created_by, expires_at)
            VALUES ($1, $2, $3)
            RETURNING id, install_key, created_by, expires_at, claimed_at, claimed_node, allowed_source
            "#,
        )
        .bind(key)
        .bind(created_by)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(row)
    }

    pub async fn get_install_key(&self, key: &str) -> Result<Option<InstallKeyRecord>, StoreError> {
        let row = sqlx::query_as::<_, InstallKeyRecord>(
            r#"
            SELECT id, install_key, created_by, expires_at, claimed_at, claimed_node, allowed_source
            FROM task_install_keys
            WHERE install_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(row)
    }

    /// Atomically bind the key's first claimant source. Returns the bound
    /// source — which differs from `source` when another claimant got there
    /// first.
    pub async fn bind_install_key_source(
        &self,
        key: &str,
        source: &str,
    ) -> Result<Option<String>, StoreError> {
        sqlx::query(
            "UPDATE task_install_keys SET allowed_source = $2 WHERE install_key = $1 AND allowed_source IS NULL",
        )
        .bind(key)
        .bind(source)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT allowed_source FROM task_install_keys WHERE install_key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(row.and_then(|r| r.0))
    }

    /// One-shot claim: succeeds for exactly one caller.
    pub async fn claim_install_key(&self, key: &str, node_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE task_install_keys
            SET claimed_at = now(), claimed_node = $2
            WHERE install_key = $1 AND claimed_at IS NULL AND expires_at > now()
            "#,
        )
        .bind(key)
        .bind(node_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}
