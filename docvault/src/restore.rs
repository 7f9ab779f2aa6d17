//! Restore engine.
//!
//! Resolves a backup, picks a codec, decodes the full artifact and only then
//! starts writing records. Any resolution, decompression or decoding failure
//! aborts before the first write.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::{Catalog, ResolvedBackup};
use crate::codec::FormatKind;
use crate::compress::Compressor;
use crate::record::Record;
use crate::retention::Artifact;
use crate::store::RecordStore;
use crate::utils::errors::{Result, VaultError};

#[derive(Debug, Clone, Default)]
pub struct RestoreRequest {
    pub backup_id: String,
    /// `None` picks the format automatically; the tabular format is only
    /// used when named here.
    pub format: Option<FormatKind>,
    /// Defaults to the collection the backup was taken from.
    pub target_collection: Option<String>,
    pub overwrite: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreFailure {
    pub id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreResult {
    pub backup_id: String,
    pub source: PathBuf,
    pub format: FormatKind,
    pub target_collection: String,
    pub written: usize,
    /// Records never attempted because the restore stopped early.
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<RestoreFailure>,
}

pub struct RestoreEngine {
    store: Arc<dyn RecordStore>,
    catalog: Arc<Catalog>,
    compressor: Compressor,
}

impl RestoreEngine {
    pub fn new(store: Arc<dyn RecordStore>, catalog: Arc<Catalog>) -> Self {
        Self {
            store,
            catalog,
            compressor: Compressor::default(),
        }
    }

    pub async fn restore(&self, request: &RestoreRequest) -> Result<RestoreResult> {
        let resolved = self.catalog.resolve(&request.backup_id).await?;
        let (artifact, format) = select_artifact(&resolved, request)?;

        let target = request
            .target_collection
            .clone()
            .or_else(|| resolved.collection.clone())
            .ok_or_else(|| {
                VaultError::Configuration(format!(
                    "cannot tell which collection '{}' belongs to; name a target collection",
                    request.backup_id
                ))
            })?;

        let records = self.load(artifact, format).await?;
        info!(
            backup_id = %request.backup_id,
            format = %format,
            target = %target,
            records = records.len(),
            overwrite = request.overwrite,
            "Restoring backup"
        );

        let mut result = RestoreResult {
            backup_id: request.backup_id.clone(),
            source: artifact.path.clone(),
            format,
            target_collection: target.clone(),
            written: 0,
            skipped: 0,
            failed: 0,
            failures: Vec::new(),
        };

        let total = records.len();
        for (idx, record) in records.iter().enumerate() {
            match self.store.write_record(&target, record, request.overwrite).await {
                Ok(()) => result.written += 1,
                Err(e @ VaultError::Permission(_)) => {
                    warn!(target = %target, error = %e, "Restore stopped: write access denied");
                    result.failed += 1;
                    result.failures.push(RestoreFailure {
                        id: record.id.clone(),
                        message: e.to_string(),
                    });
                    result.skipped = total - idx - 1;
                    break;
                }
                Err(e) => {
                    result.failed += 1;
                    result.failures.push(RestoreFailure {
                        id: record.id.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            target = %target,
            written = result.written,
            failed = result.failed,
            skipped = result.skipped,
            "Restore finished"
        );
        Ok(result)
    }

    /// Read, decompress and decode an artifact completely.
    async fn load(&self, artifact: &Artifact, format: FormatKind) -> Result<Vec<Record>> {
        let raw = tokio::fs::read(&artifact.path).await.map_err(|e| {
            VaultError::NotFound(format!("{}: {}", artifact.path.display(), e))
        })?;
        let payload = if format.is_compressed() {
            self.compressor.decompress(raw).await?
        } else {
            raw
        };
        tokio::task::spawn_blocking(move || format.codec().decode(&payload))
            .await
            .map_err(|e| VaultError::corrupt(format!("decoder task failed: {}", e)))?
    }
}

fn select_artifact<'a>(
    resolved: &'a ResolvedBackup,
    request: &RestoreRequest,
) -> Result<(&'a Artifact, FormatKind)> {
    if let Some(format) = request.format {
        if let Some(artifact) = resolved.artifact(format) {
            return Ok((artifact, format));
        }
        // an explicitly forced codec on a single file
        if let (true, Some(artifact)) = (resolved.single_file, resolved.artifacts.first()) {
            return Ok((artifact, format));
        }
        return Err(VaultError::NotFound(format!(
            "backup '{}' has no {} artifact",
            request.backup_id, format
        )));
    }

    if resolved.single_file {
        return match resolved.artifacts.first() {
            Some(artifact) if !artifact.format.is_lossy() => Ok((artifact, artifact.format)),
            Some(artifact) => Err(VaultError::Configuration(format!(
                "{} dumps are lossy and only restored when the format is given explicitly",
                artifact.format
            ))),
            None => Err(VaultError::Configuration(format!(
                "cannot detect the format of '{}'",
                request.backup_id
            ))),
        };
    }

    FormatKind::RESTORE_PREFERENCE
        .into_iter()
        .find_map(|format| resolved.artifact(format).map(|a| (a, format)))
        .ok_or_else(|| {
            VaultError::NotFound(format!(
                "backup '{}' has no losslessly restorable artifact",
                request.backup_id
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ExportContext;
    use crate::record::Value;
    use crate::retention::{ArtifactName, Tier};
    use crate::runlog::RunLogStore;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};
    use std::path::Path;
    use tempfile::TempDir;

    const TS: &str = "2026-10-19T02-00-00.000Z";

    fn records() -> Vec<Record> {
        let ts = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap();
        vec![
            Record::new("a", ts).with_field("tags", Value::Array(vec![Value::from("x")])),
            Record::new("b", ts).with_field("n", 2i64),
            Record::new("c", ts),
        ]
    }

    async fn write_artifact(root: &Path, format: FormatKind) -> PathBuf {
        let ctx = ExportContext {
            collection: "users",
            exported_at: Utc::now(),
        };
        let encoded = format.codec().encode(&ctx, &records()).unwrap();
        let bytes = if format.is_compressed() {
            Compressor::default().compress(&encoded).await.unwrap()
        } else {
            encoded
        };
        let dir = Tier::Daily.dir(root);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(ArtifactName::new("users", TS, format).file_name());
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn engine(root: &Path, store: Arc<MemoryStore>) -> RestoreEngine {
        let catalog = Arc::new(Catalog::new(root, Arc::new(RunLogStore::new(root))));
        RestoreEngine::new(store, catalog)
    }

    fn request(id: &str) -> RestoreRequest {
        RestoreRequest {
            backup_id: id.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_auto_prefers_document_dump() {
        let dir = TempDir::new().unwrap();
        for format in FormatKind::ALL {
            write_artifact(dir.path(), format).await;
        }
        let store = Arc::new(MemoryStore::new());
        let engine = engine(dir.path(), store.clone());

        let result = engine
            .restore(&request(&format!("daily/users_{}", TS)))
            .await
            .unwrap();
        assert_eq!(result.format, FormatKind::Bson);
        assert_eq!(result.target_collection, "users");
        assert_eq!(result.written, 3);
        assert_eq!(store.records("users").await, records());
    }

    #[tokio::test]
    async fn test_second_restore_reports_duplicates() {
        let dir = TempDir::new().unwrap();
        write_artifact(dir.path(), FormatKind::Sql).await;
        let store = Arc::new(MemoryStore::new());
        let engine = engine(dir.path(), store.clone());
        let mut req = request(&format!("daily/users_{}", TS));
        req.target_collection = Some("users_copy".into());

        let first = engine.restore(&req).await.unwrap();
        assert_eq!((first.written, first.failed), (3, 0));

        let second = engine.restore(&req).await.unwrap();
        assert_eq!(second.written, 0);
        assert_eq!(second.failed, 3);
        assert_eq!(second.failures.len(), 3);
        assert!(second.failures.iter().all(|f| f.message.contains("Duplicate")));

        req.overwrite = true;
        let third = engine.restore(&req).await.unwrap();
        assert_eq!((third.written, third.failed), (3, 0));
        assert_eq!(store.records("users_copy").await.len(), 3);
    }

    #[tokio::test]
    async fn test_tabular_only_when_forced() {
        let dir = TempDir::new().unwrap();
        write_artifact(dir.path(), FormatKind::Xlsx).await;
        let store = Arc::new(MemoryStore::new());
        let engine = engine(dir.path(), store.clone());
        let id = format!("daily/users_{}", TS);

        assert!(matches!(
            engine.restore(&request(&id)).await,
            Err(VaultError::NotFound(_))
        ));
        let single = format!("daily/users_{}.xlsx", TS);
        assert!(matches!(
            engine.restore(&request(&single)).await,
            Err(VaultError::Configuration(_))
        ));

        let mut forced = request(&id);
        forced.format = Some(FormatKind::Xlsx);
        let result = engine.restore(&forced).await.unwrap();
        assert_eq!(result.written, 3);
        assert!(store.records("users").await.iter().any(|r| r.id == "b"));
    }

    #[tokio::test]
    async fn test_corrupt_archive_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let path = write_artifact(dir.path(), FormatKind::Bson).await;
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        let store = Arc::new(MemoryStore::new());
        let engine = engine(dir.path(), store.clone());

        let err = engine
            .restore(&request(&format!("daily/users_{}", TS)))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::CorruptArchive(_)));
        assert!(store.records("users").await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_backup_fails_fast() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let engine = engine(dir.path(), store);
        assert!(matches!(
            engine.restore(&request("daily/users_2026-01-01T00-00-00.000Z")).await,
            Err(VaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_permission_error_stops_and_counts_skipped() {
        let dir = TempDir::new().unwrap();
        write_artifact(dir.path(), FormatKind::Bson).await;
        let store = Arc::new(MemoryStore::new());
        store.deny_writes("users").await;
        let engine = engine(dir.path(), store);

        let result = engine
            .restore(&request(&format!("daily/users_{}", TS)))
            .await
            .unwrap();
        assert_eq!(result.written, 0);
        assert_eq!(result.failed, 1);
        assert_eq!(result.skipped, 2);
    }
}
