//! Collection exporter.
//!
//! Pages through one collection, encodes the full snapshot once per enabled
//! format and writes one artifact per format. Paging failures discard
//! everything fetched so far; encoding failures only affect their format.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{ExportContext, FormatKind};
use crate::compress::Compressor;
use crate::config::PerformanceConfig;
use crate::record::Record;
use crate::retention::{is_safe_component, ArtifactName};
use crate::runlog::{BackupManifest, CollectionError};
use crate::store::{Page, RecordStore};
use crate::utils::errors::{Result, VaultError};

/// What to export and where.
#[derive(Debug, Clone)]
pub struct ExportJob {
    pub collection: String,
    pub formats: Vec<FormatKind>,
    pub dest_dir: PathBuf,
    pub run_timestamp: String,
    pub exported_at: DateTime<Utc>,
}

/// Result of a collection whose records were fetched. Individual formats may
/// still have failed; those failures are in `errors`.
#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub collection: String,
    pub record_count: usize,
    pub manifests: Vec<BackupManifest>,
    pub errors: Vec<CollectionError>,
}

pub struct CollectionExporter {
    store: Arc<dyn RecordStore>,
    performance: PerformanceConfig,
    compressor: Compressor,
}

impl CollectionExporter {
    pub fn new(store: Arc<dyn RecordStore>, performance: PerformanceConfig) -> Self {
        let compressor = Compressor::new(performance.compression_level);
        Self {
            store,
            performance,
            compressor,
        }
    }

    /// Export one collection. An `Err` means nothing was written for it.
    pub async fn export(&self, job: &ExportJob, cancel: &CancellationToken) -> Result<ExportOutcome> {
        if !is_safe_component(&job.collection) {
            return Err(VaultError::Configuration(format!(
                "collection name '{}' cannot be used as a file name",
                job.collection
            )));
        }
        let records = Arc::new(self.fetch_all(&job.collection, cancel).await?);
        debug!(collection = %job.collection, records = records.len(), "Fetched collection");

        tokio::fs::create_dir_all(&job.dest_dir).await?;

        let mut outcome = ExportOutcome {
            collection: job.collection.clone(),
            record_count: records.len(),
            manifests: Vec::new(),
            errors: Vec::new(),
        };

        for &format in &job.formats {
            match self.write_format(job, format, Arc::clone(&records)).await {
                Ok(manifest) => outcome.manifests.push(manifest),
                Err(e) => {
                    warn!(collection = %job.collection, format = %format, error = %e, "Format export failed");
                    outcome.errors.push(CollectionError {
                        collection: Some(job.collection.clone()),
                        format: Some(format),
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            collection = %job.collection,
            records = outcome.record_count,
            artifacts = outcome.manifests.len(),
            "Exported collection"
        );
        Ok(outcome)
    }

    /// Page through the collection until exhausted. Cancellation is checked
    /// between pages only.
    async fn fetch_all(&self, collection: &str, cancel: &CancellationToken) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            if cancel.is_cancelled() {
                return Err(VaultError::Cancelled);
            }
            let page = self.fetch_page(collection, cursor.as_deref(), cancel).await?;
            records.extend(page.records);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(records),
            }
        }
    }

    /// One page with timeout and bounded exponential backoff on transient errors.
    async fn fetch_page(
        &self,
        collection: &str,
        cursor: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Page> {
        let timeout = self.performance.page_timeout();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                timeout,
                self.store
                    .page_records(collection, cursor, self.performance.page_size),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(VaultError::TransientStore(format!(
                    "page fetch timed out after {} ms",
                    timeout.as_millis()
                ))),
            };

            match result {
                Ok(page) => return Ok(page),
                Err(e) if e.is_transient() && attempt < self.performance.retry_attempts => {
                    let delay = self.performance.retry_delay(attempt);
                    warn!(
                        collection = %collection,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Page fetch failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(VaultError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn write_format(
        &self,
        job: &ExportJob,
        format: FormatKind,
        records: Arc<Vec<Record>>,
    ) -> Result<BackupManifest> {
        let record_count = records.len();
        let collection = job.collection.clone();
        let exported_at = job.exported_at;
        let encoded = tokio::task::spawn_blocking(move || {
            let ctx = ExportContext {
                collection: &collection,
                exported_at,
            };
            format.codec().encode(&ctx, &records)
        })
        .await
        .map_err(|e| VaultError::format(format.as_str(), format!("encoder task failed: {}", e)))??;

        let bytes = if format.is_compressed() {
            self.compressor.compress(&encoded).await?
        } else {
            encoded
        };

        let file_name = ArtifactName::new(&job.collection, &job.run_timestamp, format).file_name();
        let path = job.dest_dir.join(&file_name);
        write_atomic(&job.dest_dir, &file_name, &bytes).await?;

        Ok(BackupManifest {
            collection: job.collection.clone(),
            format,
            path,
            record_count,
            byte_size: bytes.len() as u64,
            checksum: Some(hex::encode(Sha256::digest(&bytes))),
        })
    }
}

/// Write to a hidden `.{name}.partial` file, then rename into place.
async fn write_atomic(dir: &Path, file_name: &str, bytes: &[u8]) -> Result<()> {
    let tmp = dir.join(format!(".{}.partial", file_name));
    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    tokio::fs::rename(&tmp, dir.join(file_name)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::record::Value;
    use tempfile::TempDir;

    fn perf() -> PerformanceConfig {
        PerformanceConfig {
            page_size: 2,
            page_timeout_ms: 200,
            retry_attempts: 3,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 5,
            ..PerformanceConfig::default()
        }
    }

    fn job(dir: &Path, collection: &str, formats: &[FormatKind]) -> ExportJob {
        ExportJob {
            collection: collection.to_string(),
            formats: formats.to_vec(),
            dest_dir: dir.join("daily"),
            run_timestamp: "2026-10-19T02-00-00.000Z".to_string(),
            exported_at: Utc::now(),
        }
    }

    async fn store_with(collection: &str, n: usize) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let records = (0..n)
            .map(|i| Record::new(format!("r{}", i), Utc::now()).with_field("n", i as i64))
            .collect();
        store.insert_collection(collection, records).await;
        store
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().to_string())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_exports_every_format_with_checksums() {
        let dir = TempDir::new().unwrap();
        let store = store_with("users", 5).await;
        let exporter = CollectionExporter::new(store.clone(), perf());
        let job = job(dir.path(), "users", &FormatKind::ALL);

        let outcome = exporter
            .export(&job, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.record_count, 5);
        assert_eq!(outcome.manifests.len(), 3);
        assert!(outcome.errors.is_empty());
        assert_eq!(store.page_calls("users").await, 3);

        for manifest in &outcome.manifests {
            assert_eq!(manifest.record_count, 5);
            let bytes = std::fs::read(&manifest.path).unwrap();
            assert_eq!(bytes.len() as u64, manifest.byte_size);
            assert_eq!(
                manifest.checksum.as_deref(),
                Some(hex::encode(Sha256::digest(&bytes)).as_str())
            );
        }
        assert_eq!(
            files_in(&job.dest_dir),
            vec![
                "users_2026-10-19T02-00-00.000Z.bson.zst",
                "users_2026-10-19T02-00-00.000Z.sql.zst",
                "users_2026-10-19T02-00-00.000Z.xlsx",
            ]
        );
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let dir = TempDir::new().unwrap();
        let store = store_with("users", 3).await;
        store.fail_transiently("users", 2).await;
        let exporter = CollectionExporter::new(store.clone(), perf());

        let outcome = exporter
            .export(&job(dir.path(), "users", &[FormatKind::Bson]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.record_count, 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_write_nothing() {
        let dir = TempDir::new().unwrap();
        let store = store_with("users", 3).await;
        store.fail_transiently("users", 10).await;
        let exporter = CollectionExporter::new(store.clone(), perf());
        let job = job(dir.path(), "users", &FormatKind::ALL);

        let err = exporter.export(&job, &CancellationToken::new()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.page_calls("users").await, 3);
        assert!(files_in(&job.dest_dir).is_empty());
    }

    #[tokio::test]
    async fn test_permission_error_mid_listing_discards_partial_data() {
        let dir = TempDir::new().unwrap();
        let store = store_with("users", 6).await;
        store.fail_after_pages("users", 1).await;
        let exporter = CollectionExporter::new(store.clone(), perf());
        let job = job(dir.path(), "users", &FormatKind::ALL);

        let err = exporter.export(&job, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, VaultError::Permission(_)));
        assert_eq!(store.page_calls("users").await, 2);
        assert!(files_in(&job.dest_dir).is_empty());
    }

    #[tokio::test]
    async fn test_slow_pages_time_out() {
        let dir = TempDir::new().unwrap();
        let store = store_with("users", 1).await;
        store.set_page_delay(std::time::Duration::from_millis(500)).await;
        let exporter = CollectionExporter::new(
            store.clone(),
            PerformanceConfig {
                page_timeout_ms: 20,
                retry_attempts: 2,
                ..perf()
            },
        );

        let err = exporter
            .export(&job(dir.path(), "users", &[FormatKind::Sql]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_format_error_is_isolated_to_its_codec() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store
            .insert_collection(
                "metrics",
                vec![Record::new("m1", Utc::now()).with_field("ratio", Value::Float(f64::NAN))],
            )
            .await;
        let exporter = CollectionExporter::new(store, perf());

        let outcome = exporter
            .export(&job(dir.path(), "metrics", &FormatKind::ALL), &CancellationToken::new())
            .await
            .unwrap();
        let ok: Vec<_> = outcome.manifests.iter().map(|m| m.format).collect();
        assert_eq!(ok, vec![FormatKind::Bson]);
        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome.errors.iter().all(|e| e.format.is_some()));
    }

    #[tokio::test]
    async fn test_collection_name_cannot_escape_tier_dir() {
        let dir = TempDir::new().unwrap();
        let store = store_with("../escape", 2).await;
        let exporter = CollectionExporter::new(store, perf());

        let err = exporter
            .export(&job(dir.path(), "../escape", &[FormatKind::Sql]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Configuration(_)));
        assert!(files_in(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_first_page() {
        let dir = TempDir::new().unwrap();
        let store = store_with("users", 3).await;
        let exporter = CollectionExporter::new(store.clone(), perf());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = exporter
            .export(&job(dir.path(), "users", &FormatKind::ALL), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Cancelled));
        assert_eq!(store.page_calls("users").await, 0);
    }
}
