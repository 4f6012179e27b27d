use chrono::{DateTime, Utc};
use uuid::Uuid;

use antcode_common::ids::TaskId;
use antcode_common::types::{ExecutionStrategy, ScheduleKind, ScheduledTask, TaskStatus};

use super::{StoreClient, StoreError};

impl StoreClient {
    pub async fn create_task(&self, task: &ScheduledTask) -> Result<i64, StoreError> {
        let environment = serde_json::to_value(&task.environment_vars).unwrap_or_default();

        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO scheduled_tasks
                (public_id, project_id, user_id, name, description, schedule_kind,
                 cron_expression, interval_seconds, scheduled_time, is_active, status,
                 timeout_seconds, max_retries, retry_delay_seconds, priority,
                 execution_params, environment_vars, specified_node_id, execution_strategy,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                    $12, $13, $14, $15, $16, $17, $18, $19, $20, $20)
            RETURNING id
            "#,
        )
        .bind(task.public_id.0)
        .bind(task.project_id)
        .bind(task.user_id)
        .bind(&task.name)
        .bind(&task.description)
        .bind(task.schedule_kind.as_db_str())
        .bind(&task.cron_expression)
        .bind(task.interval_seconds.map(|s| s as i64))
        .bind(task.scheduled_time)
        .bind(task.is_active)
        .bind(task.status.as_db_str())
        .bind(task.timeout_seconds.map(|s| s as i64))
        .bind(task.max_retries as i32)
        .bind(task.retry_delay_seconds.map(|s| s as i64))
        .bind(task.priority)
        .bind(serde_json::Value::Object(task.execution_params.clone()))
        .bind(environment)
        .bind(task.specified_node_id)
        .bind(task.execution_strategy.map(|s| s.as_db_str()))
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(row.0)
    }

    pub async fn get_task(&self, id: i64) -> Result<Option<ScheduledTask>, StoreError> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "{} WHERE id = $1",
            TASK_SELECT
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    pub async fn get_task_by_public_id(
        &self,
        public_id: TaskId,
    ) -> Result<Option<ScheduledTask>, StoreError> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "{} WHERE public_id = $1",
            TASK_SELECT
        ))
        .bind(public_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    /// All tasks with an active schedule, loaded at startup.
    pub async fn get_active_tasks(&self) -> Result<Vec<ScheduledTask>, StoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "{} WHERE is_active = TRUE ORDER BY id",
            TASK_SELECT
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn list_tasks(
        &self,
        user_id: Option<i64>,
        status: Option<TaskStatus>,
        is_active: Option<bool>,
        page: u32,
        size: u32,
    ) -> Result<(Vec<ScheduledTask>, i64), StoreError> {
        let mut filter = String::from("TRUE");
        let mut idx = 0;
        if user_id.is_some() {
            idx += 1;
            filter.push_str(&format!(" AND user_id = ${}", idx));
        }
        if status.is_some() {
            idx += 1;
            filter.push_str(&format!(" AND status = ${}", idx));
        }
        if is_active.is_some() {
            idx += 1;
            filter.push_str(&format!(" AND is_active = ${}", idx));
        }

        // Two passes: count then page. Bind order mirrors condition order.
        let count_sql = format!("SELECT COUNT(*) FROM scheduled_tasks WHERE {}", filter);
        let page_sql = format!(
            "{} WHERE {} ORDER BY created_at DESC LIMIT {} OFFSET {}",
            TASK_SELECT,
            filter,
            size.min(100),
            (page.max(1) - 1) * size.min(100),
        );

        let mut count_query = sqlx::query_as::<_, (i64,)>(&count_sql);
        let mut page_query = sqlx::query_as::<_, TaskRow>(&page_sql);
        if let Some(uid) = user_id {
            count_query = count_query.bind(uid);
            page_query = page_query.bind(uid);
        }
        if let Some(status) = status {
            count_query = count_query.bind(status.as_db_str());
            page_query = page_query.bind(status.as_db_str());
        }
        if let Some(active) = is_active {
            count_query = count_query.bind(active);
            page_query = page_query.bind(active);
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

    /// Persist mutable scheduling fields. Writes the canonical
    /// specified_node_id column and clears the legacy slot.
    pub async fn update_task(&self, task: &ScheduledTask) -> Result<(), StoreError> {
        let environment = serde_json::to_value(&task.environment_vars).unwrap_or_default();

        sqlx::query(
            r#"
            UPDATE scheduled_tasks
            SET name = $2, description = $3, schedule_kind = $4, cron_expression = $5,
                interval_seconds = $6, scheduled_time = $7, is_active = $8,
                timeout_seconds = $9, max_retries = $10, retry_delay_seconds = $11,
                priority = $12, execution_params = $13, environment_vars = $14,
                specified_node_id = $15, node_id = NULL, execution_strategy = $16,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(task.id)
        .bind(&task.name)
        .bind(&task.description)
        .bind(task.schedule_kind.as_db_str())
        .bind(&task.cron_expression)
        .bind(task.interval_seconds.map(|s| s as i64))
        .bind(task.scheduled_time)
        .bind(task.is_active)
        .bind(task.timeout_seconds.map(|s| s as i64))
        .bind(task.max_retries as i32)
        .bind(task.retry_delay_seconds.map(|s| s as i64))
        .bind(task.priority)
        .bind(serde_json::Value::Object(task.execution_params.clone()))
        .bind(environment)
        .bind(task.specified_node_id)
        .bind(task.execution_strategy.map(|s| s.as_db_str()))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    pub async fn set_task_status(&self, id: i64, status: TaskStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE scheduled_tasks SET status = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(status.as_db_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    pub async fn set_task_active(&self, id: i64, active: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE scheduled_tasks SET is_active = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    pub async fn stamp_task_run(
        &self,
        id: i64,
        status: TaskStatus,
        last_run: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE scheduled_tasks SET status = $2, last_run_time = $3, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_db_str())
        .bind(last_run)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    pub async fn set_task_next_run(
        &self,
        id: i64,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE scheduled_tasks SET next_run_time = $2 WHERE id = $1")
            .bind(id)
            .bind(next_run)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    /// Increment the success or failure counter.
    pub async fn bump_task_counter(&self, id: i64, success: bool) -> Result<(), StoreError> {
        let sql = if success {
            "UPDATE scheduled_tasks SET success_count = success_count + 1 WHERE id = $1"
        } else {
            "UPDATE scheduled_tasks SET failure_count = failure_count + 1 WHERE id = $1"
        };
        sqlx::query(sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    /// Replace a task's execution params (used to inject and later restore
    /// checkpoint resume data).
    pub async fn set_task_execution_params(
        &self,
        id: i64,
        params: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE scheduled_tasks SET execution_params = $2 WHERE id = $1")
            .bind(id)
            .bind(serde_json::Value::Object(params.clone()))
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    /// Delete a task and its execution history.
    pub async fn delete_task(&self, id: i64) -> Result<bool, StoreError> {
        let deleted = sqlx::query("DELETE FROM task_executions WHERE task_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?
            .rows_affected();
        if deleted > 0 {
            tracing::info!(task_id = id, executions = deleted, "Deleted execution history");
        }

        let result = sqlx::query("DELETE FROM scheduled_tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

// The legacy node_id column folds into specified_node_id on read.
const TASK_SELECT: &str = r#"
    SELECT id, public_id, project_id, user_id, name, description, schedule_kind,
           cron_expression, interval_seconds, scheduled_time, is_active, status,
           timeout_seconds, max_retries, retry_delay_seconds, priority,
           execution_params, environment_vars,
           COALESCE(specified_node_id, node_id) AS specified_node_id,
           execution_strategy, success_count, failure_count,
           last_run_time, next_run_time, created_at, updated_at
    FROM scheduled_tasks
"#;

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: i64,
    public_id: Uuid,
    project_id: i64,
    user_id: i64,
    name: String,
    description: String,
    schedule_kind: String,
    cron_expression: Option<String>,
    interval_seconds: Option<i64>,
    scheduled_time: Option<DateTime<Utc>>,
    is_active: bool,
    status: String,
    timeout_seconds: Option<i64>,
    max_retries: i32,
    retry_delay_seconds: Option<i64>,
    priority: i32,
    execution_params: serde_json::Value,
    environment_vars: serde_json::Value,
    specified_node_id: Option<i64>,
    execution_strategy: Option<String>,
    success_count: i64,
    failure_count: i64,
    last_run_time: Option<DateTime<Utc>>,
    next_run_time: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<TaskRow> for ScheduledTask {
    fn from(row: TaskRow) -> Self {
        let execution_params = match row.execution_params {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        let environment_vars = serde_json::from_value(row.environment_vars).unwrap_or_default();

        Self {
            id: row.id,
            public_id: TaskId::from_uuid(row.public_id),
            project_id: row.project_id,
            user_id: row.user_id,
            name: row.name,
            description: row.description,
            schedule_kind: ScheduleKind::parse(&row.schedule_kind).unwrap_or(ScheduleKind::Once),
            cron_expression: row.cron_expression,
            interval_seconds: row.interval_seconds.map(|s| s.max(0) as u64),
            scheduled_time: row.scheduled_time,
            is_active: row.is_active,
            status: TaskStatus::parse(&row.status).unwrap_or(TaskStatus::Pending),
            timeout_seconds: row.timeout_seconds.map(|s| s.max(0) as u64),
            max_retries: row.max_retries.max(0) as u32,
            retry_delay_seconds: row.retry_delay_seconds.map(|s| s.max(0) as u64),
            priority: row.priority,
            execution_params,
            environment_vars,
            specified_node_id: row.specified_node_id,
            execution_strategy: row
                .execution_strategy
                .as_deref()
                .and_then(ExecutionStrategy::parse),
            success_count: row.success_count,
            failure_count: row.failure_count,
            last_run_time: row.last_run_time,
            next_run_time: row.next_run_time,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
