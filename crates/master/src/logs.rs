use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use antcode_common::api::worker::LogType;
use antcode_common::ids::ExecutionId;
use antcode_common::{AntCodeError, Result};

/// Paths of one execution's log pair.
#[derive(Clone, Debug)]
pub struct LogPaths {
    pub output: String,
    pub error: String,
}

/// Owns per-execution log files: path layout, appends, tail reads.
pub struct TaskLogService {
    logs_dir: PathBuf,
}

impl TaskLogService {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
        }
    }

    /// `{logs_dir}/{execution_id}/output.log` and `error.log`.
    pub fn generate_paths(&self, execution_id: ExecutionId) -> LogPaths {
        let dir = self.logs_dir.join(execution_id.to_string());
        LogPaths {
            output: dir.join(LogType::Output.file_name()).display().to_string(),
            error: dir.join(LogType::Error.file_name()).display().to_string(),
        }
    }

    pub fn path_for(&self, execution_id: ExecutionId, log_type: LogType) -> String {
        self.logs_dir
            .join(execution_id.to_string())
            .join(log_type.file_name())
            .display()
            .to_string()
    }

    /// Append a fragment, creating the directory on first write. A trailing
    /// newline is added when the fragment lacks one.
    pub async fn append(&self, path: &str, content: &str) -> Result<()> {
        let path = Path::new(path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AntCodeError::Internal(format!("create log dir: {}", e)))?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| AntCodeError::Internal(format!("open log file: {}", e)))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| AntCodeError::Internal(format!("write log: {}", e)))?;
        if !content.ends_with('\n') {
            file.write_all(b"\n")
                .await
                .map_err(|e| AntCodeError::Internal(format!("write log: {}", e)))?;
        }

        Ok(())
    }

    /// Last `lines` lines of a log file. Missing files read as empty.
    pub async fn tail(&self, path: &str, lines: usize) -> Result<Vec<String>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AntCodeError::Internal(format!("read log: {}", e))),
        };

        let all: Vec<&str> = content.lines().collect();
        let start = all.len().saturating_sub(lines);
        Ok(all[start..].iter().map(|s| s.to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_and_tail_roundtrip() {
        let dir = std::env::temp_dir().join(format!("antcode-logs-{}", uuid::Uuid::new_v4()));
        let service = TaskLogService::new(&dir);
        let paths = service.generate_paths(ExecutionId::new());

        service.append(&paths.output, "line 1").await.unwrap();
        service.append(&paths.output, "line 2\n").await.unwrap();
        service.append(&paths.output, "line 3").await.unwrap();

        let tail = service.tail(&paths.output, 2).await.unwrap();
        assert_eq!(tail, vec!["line 2", "line 3"]);

        let missing = service.tail(&paths.error, 10).await.unwrap();
        assert!(missing.is_empty());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
