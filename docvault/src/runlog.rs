//! Run logs: one structured JSON document per backup run.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::codec::FormatKind;
use crate::retention::Tier;
use crate::utils::errors::Result;

pub const LOG_DIR: &str = "logs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Success,
    PartialSuccess,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::InProgress)
    }
}

/// One file produced for one (collection, format) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub collection: String,
    pub format: FormatKind,
    pub path: PathBuf,
    pub record_count: usize,
    pub byte_size: u64,
    /// SHA-256 of the file as written, hex encoded.
    #[serde(default)]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionError {
    /// `None` for run-level errors that are not tied to one collection.
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<FormatKind>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLog {
    pub run_id: String,
    pub tier: Tier,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub collections_attempted: usize,
    pub records_exported: usize,
    pub manifests: Vec<BackupManifest>,
    pub errors: Vec<CollectionError>,
    pub status: RunStatus,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub dry_run: bool,
    /// Collections the run resolved to; filled for every run so dry runs
    /// can report what they would have exported.
    #[serde(default)]
    pub planned_collections: Vec<String>,
}

impl RunLog {
    pub fn begin(run_id: String, tier: Tier, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            tier,
            started_at,
            duration_ms: 0,
            collections_attempted: 0,
            records_exported: 0,
            manifests: Vec::new(),
            errors: Vec::new(),
            status: RunStatus::InProgress,
            cancelled: false,
            dry_run: false,
            planned_collections: Vec::new(),
        }
    }

    /// Collections with at least one manifest.
    pub fn succeeded_collections(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.manifests.iter().map(|m| m.collection.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Derive the terminal status from what was recorded.
    pub fn finalize(&mut self, finished_at: DateTime<Utc>) {
        self.duration_ms = (finished_at - self.started_at).num_milliseconds().max(0) as u64;
        self.status = if self.errors.is_empty() && !self.cancelled {
            RunStatus::Success
        } else if !self.manifests.is_empty() {
            RunStatus::PartialSuccess
        } else {
            RunStatus::Failed
        };
    }

    /// Finalize as failed with a single run-level error.
    pub fn fail(&mut self, message: impl Into<String>, finished_at: DateTime<Utc>) {
        self.errors.push(CollectionError {
            collection: None,
            format: None,
            message: message.into(),
        });
        self.duration_ms = (finished_at - self.started_at).num_milliseconds().max(0) as u64;
        self.status = RunStatus::Failed;
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            tier: self.tier,
            status: self.status,
            started_at: self.started_at,
            duration_ms: self.duration_ms,
            collections_attempted: self.collections_attempted,
            records_exported: self.records_exported,
            artifact_count: self.manifests.len(),
            error_count: self.errors.len(),
            cancelled: self.cancelled,
        }
    }
}

/// Condensed view of a run log for history listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub tier: Tier,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub collections_attempted: usize,
    pub records_exported: usize,
    pub artifact_count: usize,
    pub error_count: usize,
    pub cancelled: bool,
}

/// Append-only store of finalized run logs under `root/logs/`.
///
/// Concurrent runs (different tiers) share one store; writes go through a
/// mutex so two logs are never written at the same time.
pub struct RunLogStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl RunLogStore {
    pub fn new(root: &Path) -> Self {
        Self {
            dir: root.join(LOG_DIR),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", run_id))
    }

    pub async fn write(&self, log: &RunLog) -> Result<PathBuf> {
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&log.run_id);
        let tmp = self.dir.join(format!(".{}.json.partial", log.run_id));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(log)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(path)
    }

    pub async fn read(&self, run_id: &str) -> Result<RunLog> {
        let bytes = tokio::fs::read(self.path_for(run_id)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Every readable log, newest first. Unparsable files are skipped.
    pub async fn list(&self) -> Result<Vec<RunLog>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut logs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            let parsed = tokio::fs::read(entry.path())
                .await
                .map_err(crate::utils::errors::VaultError::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<RunLog>(&bytes)?));
            match parsed {
                Ok(log) => logs.push(log),
                Err(e) => warn!(file = %name, error = %e, "Skipping unreadable run log"),
            }
        }
        logs.sort_by(|a, b| b.run_id.cmp(&a.run_id));
        Ok(logs)
    }
}
