use chrono::Utc;
use uuid::Uuid;

use antcode_common::ids::ProjectId;
use antcode_common::types::{
    CodeSpec, CrawlEngine, ExecutionStrategy, FileSpec, Project, ProjectSpec, ProjectType, RuleSpec,
};

use super::{StoreClient, StoreError};

impl StoreClient {
    /// Create a project together with its variant detail row.
    pub async fn create_project(&self, project: &Project) -> Result<i64, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO projects (public_id, user_id, name, description, project_type,
                                  file_hash, bound_node_id, execution_strategy, fallback_enabled,
                                  created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            RETURNING id
            "#,
        )
        .bind(project.public_id.0)
        .bind(project.user_id)
        .bind(&project.name)
        .bind(&project.description)
        .bind(project.project_type().as_db_str())
        .bind(&project.file_hash)
        .bind(project.bound_node_id)
        .bind(project.execution_strategy.map(|s| s.as_db_str()))
        .bind(project.fallback_enabled)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        let project_id = row.0;

        match &project.spec {
            ProjectSpec::Rule(rule) => {
                let pagination = rule
                    .pagination
                    .as_ref()
                    .map(|p| serde_json::to_value(p).unwrap_or_default());
                sqlx::query(
                    r#"
                    INSERT INTO project_rules (project_id, target_url, engine, selectors, pagination)
                    VALUES ($1, $2, $3, $4, $5)
                    "#,
                )
                .bind(project_id)
                .bind(&rule.target_url)
                .bind(engine_str(rule.engine))
                .bind(&rule.selectors)
                .bind(pagination)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;
            }
            ProjectSpec::File(file) => {
                sqlx::query(
                    r#"
                    INSERT INTO project_files (project_id, archive_path, original_name,
                                               file_hash, file_size, compressed, entry_point)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    "#,
                )
                .bind(project_id)
                .bind(&file.archive_path)
                .bind(&file.original_name)
                .bind(&file.file_hash)
                .bind(file.file_size as i64)
                .bind(file.compressed)
                .bind(&file.entry_point)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;
            }
            ProjectSpec::Code(code) => {
                sqlx::query(
                    r#"
                    INSERT INTO project_codes (project_id, source, language, entry_point)
                    VALUES ($1, $2, $3, $4)
                    "#,
                )
                .bind(project_id)
                .bind(&code.source)
                .bind(&code.language)
                .bind(&code.entry_point)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(project_id)
    }

    /// Retrieve a project by internal id.
    pub async fn get_project(&self, id: i64) -> Result<Option<Project>, StoreError> {
        let row = sqlx::query_as::<_, ProjectRow>(
            r#"
            SELECT id, public_id, user_id, name, description, project_type, file_hash,
                   bound_node_id, execution_strategy, fallback_enabled, created_at, updated_at
            FROM projects
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        match row {
            Some(row) => Ok(Some(self.load_spec(row).await?)),
            None => Ok(None),
        }
    }

    /// Retrieve a project by public id.
    pub async fn get_project_by_public_id(
        &self,
        public_id: ProjectId,
    ) -> Result<Option<Project>, StoreError> {
        let row = sqlx::query_as::<_, ProjectRow>(
            r#"
            SELECT id, public_id, user_id, name, description, project_type, file_hash,
                   bound_node_id, execution_strategy, fallback_enabled, created_at, updated_at
            FROM projects
            WHERE public_id = $1
            "#,
        )
        .bind(public_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        match row {
            Some(row) => Ok(Some(self.load_spec(row).await?)),
            None => Ok(None),
        }
    }

    /// Replace a project's variant detail and content hash. The variant
    /// itself cannot change; that would be a different project.
    pub async fn update_project_spec(
        &self,
        project: &Project,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        sqlx::query(
            r#"
            UPDATE projects
            SET name = $2, description = $3, file_hash = $4, bound_node_id = $5,
                execution_strategy = $6, fallback_enabled = $7, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(project.id)
        .bind(&project.name)
        .bind(&project.description)
        .bind(&project.file_hash)
        .bind(project.bound_node_id)
        .bind(project.execution_strategy.map(|s| s.as_db_str()))
        .bind(project.fallback_enabled)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        match &project.spec {
            ProjectSpec::Rule(rule) => {
                let pagination = rule
                    .pagination
                    .as_ref()
                    .map(|p| serde_json::to_value(p).unwrap_or_default());
                sqlx::query(
                    r#"
                    UPDATE project_rules
                    SET target_url = $2, engine = $3, selectors = $4, pagination = $5
                    WHERE project_id = $1
                    "#,
                )
                .bind(project.id)
                .bind(&rule.target_url)
                .bind(engine_str(rule.engine))
                .bind(&rule.selectors)
                .bind(pagination)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;
            }
            ProjectSpec::File(file) => {
                sqlx::query(
                    r#"
                    UPDATE project_files
                    SET archive_path = $2, original_name = $3, file_hash = $4,
                        file_size = $5, compressed = $6, entry_point = $7
                    WHERE project_id = $1
                    "#,
                )
                .bind(project.id)
                .bind(&file.archive_path)
                .bind(&file.original_name)
                .bind(&file.file_hash)
                .bind(file.file_size as i64)
                .bind(file.compressed)
                .bind(&file.entry_point)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;
            }
            ProjectSpec::Code(code) => {
                sqlx::query(
                    r#"
                    UPDATE project_codes
                    SET source = $2, language = $3, entry_point = $4
                    WHERE project_id = $1
                    "#,
                )
                .bind(project.id)
                .bind(&code.source)
                .bind(&code.language)
                .bind(&code.entry_point)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    /// Delete a project. Tasks, detail rows and per-node sync records
    /// cascade at the schema level.
    pub async fn delete_project(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Attach the variant detail to a bare project row.
    async fn load_spec(&self, row: ProjectRow) -> Result<Project, StoreError> {
        let project_type = ProjectType::parse(&row.project_type)
            .ok_or_else(|| StoreError::Query(format!("unknown project type {}", row.project_type)))?;

        let spec = match project_type {
            ProjectType::Rule => {
                let detail = sqlx::query_as::<_, RuleRow>(
                    "SELECT target_url, engine, selectors, pagination FROM project_rules WHERE project_id = $1",
                )
                .bind(row.id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?
                .ok_or_else(|| StoreError::NotFound(format!("rule detail for project {}", row.id)))?;

                ProjectSpec::Rule(RuleSpec {
                    target_url: detail.target_url,
                    engine: if detail.engine == "browser" {
                        CrawlEngine::Browser
                    } else {
                        CrawlEngine::Http
                    },
                    selectors: detail.selectors,
                    pagination: detail
                        .pagination
                        .and_then(|v| serde_json::from_value(v).ok()),
                })
            }
            ProjectType::File => {
                let detail = sqlx::query_as::<_, FileRow>(
                    r#"
                    SELECT archive_path, original_name, file_hash, file_size, compressed, entry_point
                    FROM project_files WHERE project_id = $1
                    "#,
                )
                .bind(row.id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?
                .ok_or_else(|| StoreError::NotFound(format!("file detail for project {}", row.id)))?;

                ProjectSpec::File(FileSpec {
                    archive_path: detail.archive_path,
                    original_name: detail.original_name,
                    file_hash: detail.file_hash,
                    file_size: detail.file_size.max(0) as u64,
                    compressed: detail.compressed,
                    entry_point: detail.entry_point,
                })
            }
            ProjectType::Code => {
                let detail = sqlx::query_as::<_, CodeRow>(
                    "SELECT source, language, entry_point FROM project_codes WHERE project_id = $1",
                )
                .bind(row.id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?
                .ok_or_else(|| StoreError::NotFound(format!("code detail for project {}", row.id)))?;

                ProjectSpec::Code(CodeSpec {
                    source: detail.source,
                    language: detail.language,
                    entry_point: detail.entry_point,
                })
            }
        };

        Ok(Project {
            id: row.id,
            public_id: ProjectId::from_uuid(row.public_id),
            user_id: row.user_id,
            name: row.name,
            description: row.description,
            spec,
            file_hash: row.file_hash,
            bound_node_id: row.bound_node_id,
            execution_strategy: row
                .execution_strategy
                .as_deref()
                .and_then(ExecutionStrategy::parse),
            fallback_enabled: row.fallback_enabled,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn engine_str(engine: CrawlEngine) -> &'static str {
    match engine {
        CrawlEngine::Http => "http",
        CrawlEngine::Browser => "browser",
    }
}

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: i64,
    public_id: Uuid,
    user_id: i64,
    name: String,
    description: String,
    project_type: String,
    file_hash: Option<String>,
    bound_node_id: Option<i64>,
    execution_strategy: Option<String>,
    fallback_enabled: bool,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct RuleRow {
    target_url: String,
    engine: String,
    selectors: serde_json::Value,
    pagination: Option<serde_json::Value>,
}

#[derive(sqlx::FromRow)]
struct FileRow {
    archive_path: String,
    original_name: String,
    file_hash: String,
    file_size: i64,
    compressed: bool,
    entry_point: Option<String>,
}

#[derive(sqlx::FromRow)]
struct CodeRow {
    source: String,
    language: String,
    entry_point: Option<String>,
}
