use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use antcode_common::api::node::{ArchiveSyncRequest, CodePushRequest};
use antcode_common::types::{Node, Project, ProjectSpec};

use crate::store::StoreClient;

/// How an artifact reaches a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferMethod {
    /// Inline source sent directly in the request body.
    Code,
    /// Full archive pulled by the worker from the signed download endpoint.
    Original,
    /// Per-file deltas against the node's recorded copy.
    Incremental,
}

impl TransferMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Original => "original",
            Self::Incremental => "incremental",
        }
    }
}

/// Computed transfer plan for one (node, project) pair.
#[derive(Clone, Debug)]
pub struct TransferPlan {
    pub method: TransferMethod,
    pub file_hash: String,
    pub file_size: u64,
    pub entry_point: Option<String>,
    /// Inline source, present for the code method only.
    pub content: Option<String>,
    pub language: Option<String>,
}

/// Download metadata attached to dispatched envelopes so the worker can
/// re-sync on its own if its copy was evicted.
#[derive(Clone, Debug)]
pub struct DownloadInfo {
    pub download_url: String,
    pub file_hash: Option<String>,
    pub entry_point: Option<String>,
}

/// Per-file delta set for incremental transfer.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct FileDiff {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: Vec<String>,
}

impl FileDiff {
    /// Diff the master's current manifest against the node's recorded
    /// hashes.
    pub fn compute(current: &[(String, String)], recorded: &[(String, String)]) -> Self {
        let recorded_map: HashMap<&str, &str> = recorded
            .iter()
            .map(|(path, hash)| (path.as_str(), hash.as_str()))
            .collect();
        let current_map: HashMap<&str, &str> = current
            .iter()
            .map(|(path, hash)| (path.as_str(), hash.as_str()))
            .collect();

        let mut diff = FileDiff::default();
        for (path, hash) in current {
            match recorded_map.get(path.as_str()) {
                None => diff.added.push(path.clone()),
                Some(old) if *old != hash => diff.modified.push(path.clone()),
                Some(_) => diff.unchanged.push(path.clone()),
            }
        }
        for (path, _) in recorded {
            if !current_map.contains_key(path.as_str()) {
                diff.deleted.push(path.clone());
            }
        }
        diff
    }
}

/// Aggregate result of syncing a batch's projects to one node.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct SyncReport {
    pub synced: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Guarantees a node holds the exact artifact version before a task runs
/// on it, and records what each node currently has.
pub struct ProjectSyncService {
    store: Arc<StoreClient>,
    http: reqwest::Client,
    master_url: String,
}

impl ProjectSyncService {
    pub fn new(store: Arc<StoreClient>, master_url: String) -> Self {
        // Archive pushes can be large; allow minutes.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .unwrap_or_default();

        Self {
            store,
            http,
            master_url,
        }
    }

    /// Build the transfer plan for a project. Rule projects carry their
    /// spec inside the dispatch envelope and have no artifact to move.
    pub fn plan_for(&self, project: &Project) -> Option<TransferPlan> {
        match &project.spec {
            ProjectSpec::Rule(_) => None,
            ProjectSpec::File(file) => Some(TransferPlan {
                method: TransferMethod::Original,
                file_hash: file.file_hash.clone(),
                file_size: file.file_size,
                entry_point: file.entry_point.clone(),
                content: None,
                language: None,
            }),
            ProjectSpec::Code(code) => Some(TransferPlan {
                method: TransferMethod::Code,
                file_hash: project.file_hash.clone().unwrap_or_default(),
                file_size: code.source.len() as u64,
                entry_point: code.entry_point.clone(),
                content: Some(code.source.clone()),
                language: Some(code.language.clone()),
            }),
        }
    }

    pub fn download_info(&self, project: &Project) -> DownloadInfo {
        DownloadInfo {
            download_url: format!(
                "{}/api/v1/projects/{}/node-download",
                self.master_url.trim_end_matches('/'),
                project.public_id
            ),
            file_hash: project.file_hash.clone(),
            entry_point: project.spec.entry_point().map(str::to_string),
        }
    }

    /// Ensure the node holds the project's current version. Returns whether
    /// a transfer actually happened (false = skipped as already in sync).
    pub async fn sync_to_node(
        &self,
        node: &Node,
        project: &Project,
    ) -> Result<bool, antcode_common::AntCodeError> {
        let Some(plan) = self.plan_for(project) else {
            return Ok(false);
        };

        // Pre-transfer check: a synced record at the current hash means the
        // node already has this version.
        let record = self
            .store
            .get_node_project(node.id, project.public_id)
            .await?;
        if let Some(record) = &record {
            if record.status == "synced" && record.file_hash == plan.file_hash {
                tracing::debug!(
                    node = %node.name,
                    project = %project.public_id,
                    "Artifact current on node, transfer skipped"
                );
                metrics::counter!("sync.skipped").increment(1);
                return Ok(false);
            }
        }

        self.transfer(node, project, &plan).await?;

        self.store
            .record_project_sync(
                node.id,
                project.id,
                project.public_id,
                &plan.file_hash,
                plan.file_size,
                plan.method.as_str(),
            )
            .await?;

        metrics::counter!("sync.transfers", "method" => plan.method.as_str()).increment(1);
        tracing::info!(
            node = %node.name,
            project = %project.public_id,
            method = plan.method.as_str(),
            bytes = plan.file_size,
            "Artifact synced to node"
        );
        Ok(true)
    }

    async fn transfer(
        &self,
        node: &Node,
        project: &Project,
        plan: &TransferPlan,
    ) -> Result<(), antcode_common::AntCodeError> {
        let response = match plan.method {
            TransferMethod::Code => {
                let body = CodePushRequest {
                    name: project.name.clone(),
                    code_content: plan.content.clone().unwrap_or_default(),
                    language: plan.language.clone().unwrap_or_else(|| "python".into()),
                    entry_point: plan.entry_point.clone(),
                    master_project_id: project.public_id.to_string(),
                };
                self.http
                    .post(format!("{}/projects/code", node.base_url()))
                    .bearer_auth(&node.api_key)
                    .json(&body)
                    .send()
                    .await
            }
            TransferMethod::Original | TransferMethod::Incremental => {
                let info = self.download_info(project);
                let body = ArchiveSyncRequest {
                    project_id: project.public_id.to_string(),
                    name: project.name.clone(),
                    download_url: info.download_url,
                    description: project.description.clone(),
                    entry_point: plan.entry_point.clone(),
                    transfer_method: plan.method.as_str().to_string(),
                    file_hash: plan.file_hash.clone(),
                    file_size: Some(plan.file_size),
                    api_key: node.api_key.clone(),
                };
                self.http
                    .post(format!("{}/projects/sync-from-master", node.base_url()))
                    .bearer_auth(&node.api_key)
                    .json(&body)
                    .send()
                    .await
            }
        };

        let response = response.map_err(|e| {
            antcode_common::AntCodeError::Transport(format!(
                "sync to {} failed: {}",
                node.name, e
            ))
        })?;

        if !response.status().is_success() {
            return Err(antcode_common::AntCodeError::Transport(format!(
                "sync to {} rejected: HTTP {}",
                node.name,
                response.status()
            )));
        }
        Ok(())
    }

    /// Incremental delta for a node that holds a prior copy. The current
    /// manifest comes from the archive store; the recorded side from the
    /// node's last sync.
    pub async fn incremental_changes(
        &self,
        node: &Node,
        project: &Project,
        current_manifest: &[(String, String)],
    ) -> Result<FileDiff, antcode_common::AntCodeError> {
        let record = self
            .store
            .get_node_project(node.id, project.public_id)
            .await?;

        let recorded = match record {
            Some(record) => self
                .store
                .get_node_project_files(record.id)
                .await?
                .into_iter()
                .map(|f| (f.file_path, f.file_hash))
                .collect(),
            None => Vec::new(),
        };

        Ok(FileDiff::compute(current_manifest, &recorded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(entries: &[(&str, &str)]) -> Vec<(String, String)> {
        entries
            .iter()
            .map(|(p, h)| (p.to_string(), h.to_string()))
            .collect()
    }

    #[test]
    fn diff_partitions_all_files() {
        let current = manifest(&[("a.py", "h1"), ("b.py", "h2x"), ("d.py", "h4")]);
        let recorded = manifest(&[("a.py", "h1"), ("b.py", "h2"), ("c.py", "h3")]);

        let diff = FileDiff::compute(&current, &recorded);
        assert_eq!(diff.added, vec!["d.py"]);
        assert_eq!(diff.modified, vec!["b.py"]);
        assert_eq!(diff.deleted, vec!["c.py"]);
        assert_eq!(diff.unchanged, vec!["a.py"]);
    }

    #[test]
    fn diff_of_fresh_node_is_all_added() {
        let current = manifest(&[("a.py", "h1"), ("b.py", "h2")]);
        let diff = FileDiff::compute(&current, &[]);
        assert_eq!(diff.added.len(), 2);
        assert!(diff.modified.is_empty());
        assert!(diff.deleted.is_empty());
    }
}
