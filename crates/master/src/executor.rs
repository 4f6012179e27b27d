use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;

use antcode_common::ids::ExecutionId;
use antcode_common::types::{Project, ProjectSpec};

use crate::logs::{LogPaths, TaskLogService};

/// Result of one local run.
#[derive(Clone, Debug)]
pub struct LocalRunResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub error: Option<String>,
}

/// Runs code and file projects on the master itself, each execution in its
/// own workspace directory. Stdout and stderr stream into the execution's
/// log files.
pub struct LocalExecutor {
    workspace_root: PathBuf,
}

impl LocalExecutor {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }

    pub async fn execute(
        &self,
        project: &Project,
        execution_id: ExecutionId,
        params: &Map<String, Value>,
        environment: &HashMap<String, String>,
        timeout: Duration,
        logs: &TaskLogService,
        log_paths: &LogPaths,
    ) -> LocalRunResult {
        let workspace = self.workspace_root.join(execution_id.to_string());

        let (program, args, cwd) = match self.prepare(project, &workspace).await {
            Ok(prepared) => prepared,
            Err(e) => {
                return LocalRunResult {
                    success: false,
                    exit_code: None,
                    timed_out: false,
                    error: Some(e),
                }
            }
        };

        let mut command = tokio::process::Command::new(&program);
        command
            .args(&args)
            .current_dir(&cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A timed-out child must not outlive its dropped future.
            .kill_on_drop(true)
            .env("ANTCODE_EXECUTION_ID", execution_id.to_string())
            .env(
                "ANTCODE_PARAMS",
                Value::Object(params.clone()).to_string(),
            )
            .envs(environment);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return LocalRunResult {
                    success: false,
                    exit_code: None,
                    timed_out: false,
                    error: Some(format!("failed to spawn {}: {}", program, e)),
                }
            }
        };

        let waited = tokio::time::timeout(timeout, child.wait_with_output()).await;

        match waited {
            Ok(Ok(output)) => {
                if !output.stdout.is_empty() {
                    let text = String::from_utf8_lossy(&output.stdout);
                    let _ = logs.append(&log_paths.output, &text).await;
                }
                if !output.stderr.is_empty() {
                    let text = String::from_utf8_lossy(&output.stderr);
                    let _ = logs.append(&log_paths.error, &text).await;
                }

                let exit_code = output.status.code();
                LocalRunResult {
                    success: output.status.success(),
                    exit_code,
                    timed_out: false,
                    error: if output.status.success() {
                        None
                    } else {
                        Some(format!(
                            "process exited with code {}",
                            exit_code.unwrap_or(-1)
                        ))
                    },
                }
            }
            Ok(Err(e)) => LocalRunResult {
                success: false,
                exit_code: None,
                timed_out: false,
                error: Some(format!("process wait failed: {}", e)),
            },
            Err(_) => LocalRunResult {
                success: false,
                exit_code: None,
                timed_out: true,
                error: Some(format!("execution exceeded {} s", timeout.as_secs())),
            },
        }
    }

    /// Materialise the project in the workspace and decide what to run.
    async fn prepare(
        &self,
        project: &Project,
        workspace: &Path,
    ) -> Result<(String, Vec<String>, PathBuf), String> {
        tokio::fs::create_dir_all(workspace)
            .await
            .map_err(|e| format!("create workspace: {}", e))?;

        match &project.spec {
            ProjectSpec::Code(code) => {
                let entry = code.entry_point.clone().unwrap_or_else(|| {
                    match code.language.as_str() {
                        "python" => "main.py".to_string(),
                        "javascript" => "main.js".to_string(),
                        "shell" => "main.sh".to_string(),
                        _ => "main.txt".to_string(),
                    }
                });
                let entry_path = workspace.join(&entry);

                let mut file = tokio::fs::File::create(&entry_path)
                    .await
                    .map_err(|e| format!("write entry file: {}", e))?;
                file.write_all(code.source.as_bytes())
                    .await
                    .map_err(|e| format!("write entry file: {}", e))?;

                let (program, args) = interpreter_for(&code.language, &entry);
                Ok((program, args, workspace.to_path_buf()))
            }
            ProjectSpec::File(file) => {
                // File projects run from a pre-extracted archive directory;
                // extraction is the file store's concern.
                let source_dir = PathBuf::from(&file.archive_path);
                if !source_dir.is_dir() {
                    return Err(format!(
                        "file project archive not extracted at {}",
                        file.archive_path
                    ));
                }
                let entry = file
                    .entry_point
                    .clone()
                    .ok_or_else(|| "file project has no entry point".to_string())?;

                let (program, args) = interpreter_for("python", &entry);
                Ok((program, args, source_dir))
            }
            ProjectSpec::Rule(_) => {
                Err("rule projects run through the rule gateway, not the local executor".into())
            }
        }
    }

    /// Remove workspaces older than the retention window. Returns how many
    /// were deleted.
    pub async fn cleanup_old_workspaces(&self, max_age: Duration) -> usize {
        let mut removed = 0;
        let Ok(mut entries) = tokio::fs::read_dir(&self.workspace_root).await else {
            return 0;
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            let stale = metadata
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .is_some_and(|age| age > max_age);

            if stale && tokio::fs::remove_dir_all(entry.path()).await.is_ok() {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed = removed, "Stale execution workspaces cleaned");
        }
        removed
    }
}

fn interpreter_for(language: &str, entry: &str) -> (String, Vec<String>) {
    match language {
        "javascript" => ("node".to_string(), vec![entry.to_string()]),
        "shell" => ("sh".to_string(), vec![entry.to_string()]),
        _ => ("python3".to_string(), vec![entry.to_string()]),
    }
}
