use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use antcode_common::ids::ExecutionId;
use antcode_common::types::{TaskExecution, TaskStatus};

use super::{StoreClient, StoreError};

impl StoreClient {
    pub async fn create_execution(&self, execution: &TaskExecution) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO task_executions
                (execution_id, task_id, status, start_time, retry_count,
                 log_file_path, error_log_path, result_data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(execution.execution_id.0)
        .bind(execution.task_id)
        .bind(execution.status.as_db_str())
        .bind(execution.start_time)
        .bind(execution.retry_count as i32)
        .bind(&execution.log_file_path)
        .bind(&execution.error_log_path)
        .bind(&execution.result_data)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(row.0)
    }

    pub async fn get_execution(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<TaskExecution>, StoreError> {
        let row = sqlx::query_as::<_, ExecutionRow>(&format!(
            "{} WHERE execution_id = $1",
            EXECUTION_SELECT
        ))
        .bind(execution_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    /// Update an execution's state. End time and duration are stamped when
    /// the state is terminal.
    pub async fn update_execution_status(
        &self,
        execution_id: ExecutionId,
        status: TaskStatus,
        exit_code: Option<i32>,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let end_time = if status.is_terminal() {
            Some(Utc::now())
        } else {
            None
        };

        sqlx::query(
            r#"
            UPDATE task_executions
            SET status = $2,
                exit_code = COALESCE($3, exit_code),
                error_message = COALESCE($4, error_message),
                end_time = COALESCE($5, end_time),
                duration_seconds = CASE
                    WHEN $5::timestamptz IS NOT NULL
                    THEN EXTRACT(EPOCH FROM ($5::timestamptz - start_time))
                    ELSE duration_seconds
                END
            WHERE execution_id = $1
            "#,
        )
        .bind(execution_id.0)
        .bind(status.as_db_str())
        .bind(exit_code)
        .bind(error_message)
        .bind(end_time)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    pub async fn set_execution_result(
        &self,
        execution_id: ExecutionId,
        result_data: &serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE task_executions SET result_data = $2 WHERE execution_id = $1")
            .bind(execution_id.0)
            .bind(result_data)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    pub async fn set_execution_retry_count(
        &self,
        execution_id: ExecutionId,
        retry_count: u32,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE task_executions SET retry_count = $2 WHERE execution_id = $1")
            .bind(execution_id.0)
            .bind(retry_count as i32)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    /// Refresh the worker-driven liveness stamp. Returns false when the
    /// execution does not exist.
    pub async fn touch_execution_heartbeat(
        &self,
        execution_id: ExecutionId,
    ) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE task_executions SET last_heartbeat = now() WHERE execution_id = $1")
                .bind(execution_id.0)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    /// Executions still marked running whose heartbeat (or, failing that,
    /// start time) is older than the threshold. Capped; recovery drains the
    /// backlog across restarts.
    pub async fn find_interrupted_executions(
        &self,
        threshold: Duration,
    ) -> Result<Vec<TaskExecution>, StoreError> {
        let cutoff = Utc::now() - threshold;

        let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
            r#"{}
            WHERE status = 'running'
              AND (last_heartbeat < $1 OR (last_heartbeat IS NULL AND start_time < $1))
            ORDER BY start_time
            LIMIT 100
            "#,
            EXECUTION_SELECT
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Mark a set of executions failed in one statement (orphan cleanup).
    pub async fn fail_executions(
        &self,
        execution_ids: &[ExecutionId],
        error_message: &str,
    ) -> Result<u64, StoreError> {
        if execution_ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = execution_ids.iter().map(|e| e.0).collect();

        let result = sqlx::query(
            r#"
            UPDATE task_executions
            SET status = 'failed', error_message = $2, end_time = now()
            WHERE execution_id = ANY($1)
            "#,
        )
        .bind(&ids)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(result.rows_affected())
    }

    pub async fn list_executions(
        &self,
        task_id: i64,
        status: Option<TaskStatus>,
        page: u32,
        size: u32,
    ) -> Result<(Vec<TaskExecution>, i64), StoreError> {
        let (filter, bind_status) = match status {
            Some(s) => ("task_id = $1 AND status = $2", Some(s)),
            None => ("task_id = $1", None),
        };

        let count_sql = format!("SELECT COUNT(*) FROM task_executions WHERE {}", filter);
        let page_sql = format!(
            "{} WHERE {} ORDER BY start_time DESC LIMIT {} OFFSET {}",
            EXECUTION_SELECT,
            filter,
            size.min(100),
            (page.max(1) - 1) * size.min(100),
        );

        let mut count_query = sqlx::query_as::<_, (i64,)>(&count_sql).bind(task_id);
        let mut page_query = sqlx::query_as::<_, ExecutionRow>(&page_sql).bind(task_id);
        if let Some(s) = bind_status {
            count_query = count_query.bind(s.as_db_str());
            page_query = page_query.bind(s.as_db_str());
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

    /// Per-task execution statistics for the stats endpoint.
    pub async fn execution_stats(&self, task_id: i64) -> Result<ExecutionStatsRow, StoreError> {
        let row: ExecutionStatsRow = sqlx::query_as(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE status = 'success') AS success,
                   COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                   COUNT(*) FILTER (WHERE status = 'running') AS running,
                   COALESCE(AVG(duration_seconds) FILTER (WHERE duration_seconds IS NOT NULL), 0) AS avg_duration
            FROM task_executions
            WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(row)
    }
}

/// Aggregate execution counters for one task.
#[derive(Clone, Debug, sqlx::FromRow, serde::Serialize)]
pub struct ExecutionStatsRow {
    pub total: i64,
    pub success: i64,
    pub failed: i64,
    pub running: i64,
    pub avg_duration: f64,
}

const EXECUTION_SELECT: &str = r#"
    SELECT id, execution_id, task_id, status, start_time, end_time, duration_seconds,
           exit_code, retry_count, log_file_path, error_log_path, last_heartbeat,
           result_data, error_message
    FROM task_executions
"#;

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: i64,
    execution_id: Uuid,
    task_id: i64,
    status: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    duration_seconds: Option<f64>,
    exit_code: Option<i32>,
    retry_count: i32,
    log_file_path: Option<String>,
    error_log_path: Option<String>,
    last_heartbeat: Option<DateTime<Utc>>,
    result_data: Option<serde_json::Value>,
    error_message: Option<String>,
}

impl From<ExecutionRow> for TaskExecution {
    fn from(row: ExecutionRow) -> Self {
        Self {
            id: row.id,
            execution_id: ExecutionId::from_uuid(row.execution_id),
            task_id: row.task_id,
            status: TaskStatus::parse(&row.status).unwrap_or(TaskStatus::Pending),
            start_time: row.start_time,
            end_time: row.end_time,
            duration_seconds: row.duration_seconds,
            exit_code: row.exit_code,
            retry_count: row.retry_count.max(0) as u32,
            log_file_path: row.log_file_path,
            error_log_path: row.error_log_path,
            last_heartbeat: row.last_heartbeat,
            result_data: row.result_data,
            error_message: row.error_message,
        }
    }
}
