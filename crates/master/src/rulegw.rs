use redis::aio::MultiplexedConnection;
use serde_json::{json, Map, Value};

use antcode_common::ids::ExecutionId;
use antcode_common::types::{ExecutionOutcome, Project, RuleSpec};

/// Redis list the rule engine consumes from.
const RULE_QUEUE_KEY: &str = "antcode:rule_tasks";

/// Hands scrape-rule executions to the rule engine.
///
/// With Redis configured the envelope is pushed onto a shared list the
/// engine drains; without it submission fails fast — the engine is a
/// separate process and the master does not embed one.
pub struct RuleGateway {
    redis: Option<MultiplexedConnection>,
}

impl RuleGateway {
    pub fn new(redis: Option<MultiplexedConnection>) -> Self {
        Self { redis }
    }

    /// Submit a rule execution. URL-pattern pagination expands into one
    /// envelope per page, suffixing the execution id.
    pub async fn submit(
        &self,
        project: &Project,
        rule: &RuleSpec,
        execution_id: ExecutionId,
        params: &Map<String, Value>,
    ) -> ExecutionOutcome {
        let pages = rule
            .pagination
            .as_ref()
            .filter(|p| p.method == "url_pattern");

        match pages {
            Some(pagination) => {
                let mut submitted = Vec::new();
                let end = pagination.start_page + pagination.max_pages;

                for page in pagination.start_page..end {
                    let mut page_params = params.clone();
                    page_params.insert("page_number".into(), page.into());

                    let target_url = if rule.target_url.contains("{}") {
                        rule.target_url.replace("{}", &page.to_string())
                    } else {
                        rule.target_url.clone()
                    };

                    let task_id = format!("{}_page_{}", execution_id, page);
                    match self
                        .push_envelope(project, rule, &task_id, &target_url, &page_params)
                        .await
                    {
                        Ok(()) => submitted.push(task_id),
                        Err(e) => {
                            tracing::error!(page = page, error = %e, "Rule page submission failed");
                        }
                    }
                }

                if submitted.is_empty() {
                    ExecutionOutcome::failure("execute", "no rule pages were accepted")
                } else {
                    ExecutionOutcome::success(format!(
                        "{} rule tasks handed to the rule engine",
                        submitted.len()
                    ))
                }
            }
            None => {
                let task_id = execution_id.to_string();
                match self
                    .push_envelope(project, rule, &task_id, &rule.target_url, params)
                    .await
                {
                    Ok(()) => ExecutionOutcome::success("rule task handed to the rule engine"),
                    Err(e) => ExecutionOutcome::failure("execute", e),
                }
            }
        }
    }

    async fn push_envelope(
        &self,
        project: &Project,
        rule: &RuleSpec,
        task_id: &str,
        target_url: &str,
        params: &Map<String, Value>,
    ) -> Result<(), String> {
        let Some(conn) = &self.redis else {
            return Err("rule gateway unavailable: no Redis configured".into());
        };

        let envelope = json!({
            "meta": {
                "task_id": task_id,
                "project_id": project.public_id.to_string(),
                "project_name": project.name,
            },
            "rule": {
                "target_url": target_url,
                "engine": rule.engine,
                "selectors": rule.selectors,
            },
            "params": params,
        });

        let mut conn = conn.clone();
        redis::cmd("LPUSH")
            .arg(RULE_QUEUE_KEY)
            .arg(envelope.to_string())
            .query_async::<i64>(&mut conn)
            .await
            .map_err(|e| format!("rule queue push failed: {}", e))?;

        metrics::counter!("rulegw.submitted").increment(1);
        tracing::debug!(task_id = task_id, "Rule envelope queued");
        Ok(())
    }
}
