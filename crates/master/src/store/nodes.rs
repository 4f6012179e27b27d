use chrono::{DateTime, Utc};
use uuid::Uuid;

use antcode_common::ids::NodeId;
use antcode_common::types::{Node, NodeAggregateStats, NodeMetrics, NodeStatus};

use super::{StoreClient, StoreError};

impl StoreClient {
    pub async fn create_node(&self, node: &Node) -> Result<i64, StoreError> {
        let tags = serde_json::to_value(&node.tags).unwrap_or_default();
        let capabilities = serde_json::to_value(&node.capabilities).unwrap_or_default();
        let metrics = node
            .metrics
            .as_ref()
            .map(|m| serde_json::to_value(m).unwrap_or_default());
        let limits = node
            .resource_limits
            .as_ref()
            .map(|l| serde_json::to_value(l).unwrap_or_default());

        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO nodes (public_id, name, host, port, status, region, tags,
                               capabilities, metrics, last_heartbeat, api_key, secret_key,
                               resource_limits, machine_code, version, os_type, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING id
            "#,
        )
        .bind(node.public_id.0)
        .bind(&node.name)
        .bind(&node.host)
        .bind(node.port as i32)
        .bind(node.status.as_db_str())
        .bind(&node.region)
        .bind(tags)
        .bind(capabilities)
        .bind(metrics)
        .bind(node.last_heartbeat)
        .bind(&node.api_key)
        .bind(&node.secret_key)
        .bind(limits)
        .bind(&node.machine_code)
        .bind(&node.version)
        .bind(&node.os_type)
        .bind(node.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Query(format!("node address already registered: {}", db))
            }
            other => StoreError::Query(other.to_string()),
        })?;

        Ok(row.0)
    }

    pub async fn get_node(&self, id: i64) -> Result<Option<Node>, StoreError> {
        let row = sqlx::query_as::<_, NodeRow>(&format!("{} WHERE id = $1", NODE_SELECT))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(row.map(Into::into))
    }

    pub async fn get_node_by_public_id(
        &self,
        public_id: NodeId,
    ) -> Result<Option<Node>, StoreError> {
        let row = sqlx::query_as::<_, NodeRow>(&format!("{} WHERE public_id = $1", NODE_SELECT))
            .bind(public_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(row.map(Into::into))
    }

    pub async fn get_node_by_address(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Option<Node>, StoreError> {
        let row = sqlx::query_as::<_, NodeRow>(&format!(
            "{} WHERE host = $1 AND port = $2",
            NODE_SELECT
        ))
        .bind(host)
        .bind(port as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(row.map(Into::into))
    }

    pub async fn get_node_by_api_key(&self, api_key: &str) -> Result<Option<Node>, StoreError> {
        let row = sqlx::query_as::<_, NodeRow>(&format!("{} WHERE api_key = $1", NODE_SELECT))
            .bind(api_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(row.map(Into::into))
    }

    pub async fn get_all_nodes(&self) -> Result<Vec<Node>, StoreError> {
        let rows = sqlx::query_as::<_, NodeRow>(&format!("{} ORDER BY id", NODE_SELECT))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn list_nodes(
        &self,
        status: Option<NodeStatus>,
        region: Option<&str>,
        search: Option<&str>,
        page: u32,
        size: u32,
    ) -> Result<(Vec<Node>, i64), StoreError> {
        let mut filter = String::from("TRUE");
        let mut idx = 0;
        if status.is_some() {
            idx += 1;
            filter.push_str(&format!(" AND status = ${}", idx));
        }
        if region.is_some() {
            idx += 1;
            filter.push_str(&format!(" AND region = ${}", idx));
        }
        if search.is_some() {
            idx += 1;
            filter.push_str(&format!(" AND (name ILIKE ${0} OR host ILIKE ${0})", idx));
        }

        let count_sql = format!("SELECT COUNT(*) FROM nodes WHERE {}", filter);
        let page_sql = format!(
            "{} WHERE {} ORDER BY id LIMIT {} OFFSET {}",
            NODE_SELECT,
            filter,
            size.min(100),
            (page.max(1) - 1) * size.min(100),
        );

        let mut count_query = sqlx::query_as::<_, (i64,)>(&count_sql);
        let mut page_query = sqlx::query_as::<_, NodeRow>(&page_sql);
        if let Some(s) = status {
            count_query = count_query.bind(s.as_db_str());
            page_query = page_query.bind(s.as_db_str());
        }
        if let Some(r) = region {
            count_query = count_query.bind(r.to_string());
            page_query = page_query.bind(r.to_string());
        }
        if let Some(q) = search {
            let pattern = format!("%{}%", q);
            count_query = count_query.bind(pattern.clone());
            page_query = page_query.bind(pattern);
        }

        let total = count_query
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?
            .0;
        let rows = page_query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok((rows.into_iter().map(Into::into).collect(), total))
    }

    /// Persist a status transition. Written only on actual change.
    pub async fn set_node_status(&self, id: i64, status: NodeStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE nodes SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_db_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    /// Refresh probe-derived fields: metrics, liveness stamp, version info.
    pub async fn update_node_probe(
        &self,
        id: i64,
        status: NodeStatus,
        metrics: Option<&NodeMetrics>,
        version: Option<&str>,
        os_type: Option<&str>,
    ) -> Result<(), StoreError> {
        let metrics_json = metrics.map(|m| serde_json::to_value(m).unwrap_or_default());
        sqlx::query(
            r#"
            UPDATE nodes
            SET status = $2,
                metrics = COALESCE($3, metrics),
                last_heartbeat = now(),
                version = COALESCE($4, version),
                os_type = COALESCE($5, os_type)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_db_str())
        .bind(metrics_json)
        .bind(version)
        .bind(os_type)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    pub async fn set_node_machine_code(
        &self,
        id: i64,
        machine_code: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE nodes SET machine_code = $2 WHERE id = $1")
            .bind(id)
            .bind(machine_code)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    /// Delete a node. Heartbeat history and sync records cascade; tasks
    /// pinned to it lose their pin.
    pub async fn delete_node(&self, id: i64) -> Result<bool, StoreError> {
        sqlx::query(
            "UPDATE scheduled_tasks SET specified_node_id = NULL, node_id = NULL
             WHERE specified_node_id = $1 OR node_id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        sqlx::query("UPDATE projects SET bound_node_id = NULL WHERE bound_node_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let result = sqlx::query("DELETE FROM nodes WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Append a metrics sample to the heartbeat history.
    pub async fn record_node_heartbeat(
        &self,
        node_id: i64,
        metrics: &NodeMetrics,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO node_heartbeats (node_id, cpu, memory, running_tasks) VALUES ($1, $2, $3, $4)",
        )
        .bind(node_id)
        .bind(metrics.cpu)
        .bind(metrics.memory)
        .bind(metrics.running_tasks as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    /// Drop heartbeat samples older than the retention window.
    pub async fn prune_node_heartbeats(&self, max_age_days: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM node_heartbeats WHERE recorded_at < now() - make_interval(days => $1::int)",
        )
        .bind(max_age_days)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(result.rows_affected())
    }

    /// Hourly cluster-wide averages over the heartbeat history.
    pub async fn cluster_metrics_history(
        &self,
        hours: i64,
    ) -> Result<Vec<ClusterMetricsPoint>, StoreError> {
        let rows: Vec<ClusterMetricsPoint> = sqlx::query_as(
            r#"
            SELECT date_trunc('hour', recorded_at) AS bucket,
                   AVG(cpu) AS avg_cpu,
                   AVG(memory) AS avg_memory,
                   AVG(running_tasks)::DOUBLE PRECISION AS avg_running_tasks,
                   COUNT(DISTINCT node_id) AS node_count
            FROM node_heartbeats
            WHERE recorded_at > now() - make_interval(hours => $1::int)
            GROUP BY bucket
            ORDER BY bucket
            "#,
        )
        .bind(hours)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(rows)
    }

    pub async fn node_aggregate_stats(&self) -> Result<NodeAggregateStats, StoreError> {
        let row: (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE status = 'online'),
                   COUNT(*) FILTER (WHERE status = 'offline'),
                   COUNT(*) FILTER (WHERE status = 'maintenance')
            FROM nodes
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(NodeAggregateStats {
            total: row.0 as u64,
            online: row.1 as u64,
            offline: row.2 as u64,
            maintenance: row.3 as u64,
            ..NodeAggregateStats::default()
        })
    }
}

/// One bucket of the cluster metrics history.
#[derive(Clone, Debug, sqlx::FromRow, serde::Serialize)]
pub struct ClusterMetricsPoint {
    pub bucket: DateTime<Utc>,
    pub avg_cpu: f64,
    pub avg_memory: f64,
    pub avg_running_tasks: f64,
    pub node_count: i64,
}

const NODE_SELECT: &str = r#"
    SELECT id, public_id, name, host, port, status, region, tags, capabilities,
           metrics, last_heartbeat, api_key, secret_key, resource_limits,
           machine_code, version, os_type, created_at
    FROM nodes
"#;

#[derive(sqlx::FromRow)]
struct NodeRow {
    id: i64,
    public_id: Uuid,
    name: String,
    host: String,
    port: i32,
    status: String,
    region: Option<String>,
    tags: serde_json::Value,
    capabilities: serde_json::Value,
    metrics: Option<serde_json::Value>,
    last_heartbeat: Option<DateTime<Utc>>,
    api_key: String,
    secret_key: String,
    resource_limits: Option<serde_json::Value>,
    machine_code: Option<String>,
    version: Option<String>,
    os_type: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<NodeRow> for Node {
    fn from(row: NodeRow) -> Self {
        Self {
            id: row.id,
            public_id: NodeId::from_uuid(row.public_id),
            name: row.name,
            host: row.host,
            port: row.port.clamp(0, u16::MAX as i32) as u16,
            status: NodeStatus::parse(&row.status).unwrap_or(NodeStatus::Offline),
            region: row.region,
            tags: serde_json::from_value(row.tags).unwrap_or_default(),
            capabilities: serde_json::from_value(row.capabilities).unwrap_or_default(),
            metrics: row.metrics.and_then(|v| serde_json::from_value(v).ok()),
            last_heartbeat: row.last_heartbeat,
            api_key: row.api_key,
            secret_key: row.secret_key,
            resource_limits: row
                .resource_limits
                .and_then(|v| serde_json::from_value(v).ok()),
            machine_code: row.machine_code,
            version: row.version,
            os_type: row.os_type,
            created_at: row.created_at,
        }
    }
}
