use chrono::{DateTime, Utc};
use uuid::Uuid;

use antcode_common::ids::ProjectId;

use super::{StoreClient, StoreError};

/// Materialised belief of "node N has project P at hash H via method M".
#[derive(Clone, Debug, sqlx::FromRow, serde::Serialize)]
pub struct NodeProjectRecord {
    pub id: i64,
    pub node_id: i64,
    pub project_id: i64,
    pub project_public_id: Uuid,
    pub status: String,
    pub file_hash: String,
    pub file_size: i64,
    pub transfer_method: String,
    pub sync_count: i64,
    pub synced_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Per-file hash captured when incremental transfer is used.
#[derive(Clone, Debug, sqlx::FromRow, serde::Serialize)]
pub struct ProjectFileRecord {
    pub file_path: String,
    pub file_hash: String,
}

impl StoreClient {
    pub async fn get_node_project(
        &self,
        node_id: i64,
        project_public_id: ProjectId,
    ) -> Result<Option<NodeProjectRecord>, StoreError> {
        let row = sqlx::query_as::<_, NodeProjectRecord>(
            r#"
            SELECT id, node_id, project_id, project_public_id, status, file_hash,
                   file_size, transfer_method, sync_count, synced_at, last_used_at
            FROM node_projects
            WHERE node_id = $1 AND project_public_id = $2
            "#,
        )
        .bind(node_id)
        .bind(project_public_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(row)
    }

    /// Upsert after a successful transfer: bump sync_count, stamp synced_at.
    pub async fn record_project_sync(
        &self,
        node_id: i64,
        project_id: i64,
        project_public_id: ProjectId,
        file_hash: &str,
        file_size: u64,
        transfer_method: &str,
    ) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO node_projects (node_id, project_id, project_public_id, status,
                                       file_hash, file_size, transfer_method, sync_count, synced_at)
            VALUES ($1, $2, $3, 'synced', $4, $5, $6, 1, now())
            ON CONFLICT (node_id, project_public_id) DO UPDATE
            SET status = 'synced',
                file_hash = EXCLUDED.file_hash,
                file_size = EXCLUDED.file_size,
                transfer_method = EXCLUDED.transfer_method,
                sync_count = node_projects.sync_count + 1,
                synced_at = now()
            RETURNING id
            "#,
        )
        .bind(node_id)
        .bind(project_id)
        .bind(project_public_id.0)
        .bind(file_hash)
        .bind(file_size as i64)
        .bind(transfer_method)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(row.0)
    }

    pub async fn mark_node_project_used(
        &self,
        node_id: i64,
        project_public_id: ProjectId,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE node_projects SET last_used_at = now() WHERE node_id = $1 AND project_public_id = $2",
        )
        .bind(node_id)
        .bind(project_public_id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    /// Invalidate every node's copy of a project (e.g. after the artifact
    /// changed); the next dispatch re-syncs.
    pub async fn mark_project_outdated(
        &self,
        project_public_id: ProjectId,
    ) -> Result<u64, StoreError> {
        let result =
            sqlx::query("UPDATE node_projects SET status = 'outdated' WHERE project_public_id = $1")
                .bind(project_public_id.0)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(result.rows_affected())
    }

    /// Remove sync records unused for longer than the retention window.
    pub async fn cleanup_stale_node_projects(&self, max_age_days: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM node_projects
            WHERE status = 'outdated'
              AND COALESCE(last_used_at, synced_at) < now() - make_interval(days => $1::int)
            "#,
        )
        .bind(max_age_days)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(result.rows_affected())
    }

    /// Replace the per-file hash inventory for a node/project pair.
    pub async fn replace_node_project_files(
        &self,
        node_project_id: i64,
        files: &[(String, String)],
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        sqlx::query("DELETE FROM node_project_files WHERE node_project_id = $1")
            .bind(node_project_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        for (path, hash) in files {
            sqlx::query(
                "INSERT INTO node_project_files (node_project_id, file_path, file_hash) VALUES ($1, $2, $3)",
            )
            .bind(node_project_id)
            .bind(path)
            .bind(hash)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    pub async fn get_node_project_files(
        &self,
        node_project_id: i64,
    ) -> Result<Vec<ProjectFileRecord>, StoreError> {
        let rows = sqlx::query_as::<_, ProjectFileRecord>(
            "SELECT file_path, file_hash FROM node_project_files WHERE node_project_id = $1",
        )
        .bind(node_project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(rows)
    }

    /// Sync totals per transfer method for the statistics endpoint.
    pub async fn node_project_sync_stats(
        &self,
        node_id: Option<i64>,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        let rows: Vec<(String, i64)> = match node_id {
            Some(id) => sqlx::query_as(
                "SELECT transfer_method, SUM(sync_count) FROM node_projects WHERE node_id = $1 GROUP BY transfer_method",
            )
            .bind(id)
            .fetch_all(&self.pool)
            .await,
            None => sqlx::query_as(
                "SELECT transfer_method, SUM(sync_count) FROM node_projects GROUP BY transfer_method",
            )
            .fetch_all(&self.pool)
            .await,
        }
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(rows)
    }
}
