//! Record store backed by a directory of JSON-lines files.
//!
//! Each collection is `<root>/<collection>.jsonl`, one flattened record per
//! line. Used by the CLI so the pipeline can run without a database server.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{page_of, parse_offset, Page, RecordStore};
use crate::record::Record;
use crate::utils::errors::{Result, VaultError};

const EXTENSION: &str = "jsonl";

pub struct JsonDirStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_path(&self, collection: &str) -> Result<PathBuf> {
        if collection.is_empty()
            || collection.starts_with('.')
            || collection.contains(['/', '\\'])
        {
            return Err(VaultError::Permission(format!(
                "collection name '{}' is not allowed",
                collection
            )));
        }
        Ok(self.root.join(format!("{}.{}", collection, EXTENSION)))
    }

    async fn load(&self, collection: &str) -> Result<Vec<Record>> {
        let path = self.collection_path(collection)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| store_error(e, collection))?;
        let created_at: DateTime<Utc> = tokio::fs::metadata(&path)
            .await
            .and_then(|m| m.modified())
            .map(DateTime::from)
            .unwrap_or_else(|_| Utc::now());

        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                let json: serde_json::Value = serde_json::from_str(line).map_err(|e| {
                    VaultError::TransientStore(format!(
                        "{}:{} is not valid JSON: {}",
                        path.display(),
                        idx + 1,
                        e
                    ))
                })?;
                Record::from_json(&json, created_at)
            })
            .collect()
    }

    async fn save(&self, collection: &str, records: &[Record]) -> Result<()> {
        let path = self.collection_path(collection)?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| store_error(e, collection))?;

        let mut body = String::new();
        for record in records {
            body.push_str(&serde_json::to_string(&record.to_json())?);
            body.push('\n');
        }
        let tmp = self.root.join(format!(".{}.{}.tmp", collection, EXTENSION));
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| store_error(e, collection))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| store_error(e, collection))?;
        Ok(())
    }
}

fn store_error(err: std::io::Error, collection: &str) -> VaultError {
    match err.kind() {
        ErrorKind::NotFound => VaultError::NotFound(format!("collection '{}'", collection)),
        ErrorKind::PermissionDenied => {
            VaultError::Permission(format!("collection '{}': {}", collection, err))
        }
        _ => VaultError::TransientStore(format!("collection '{}': {}", collection, err)),
    }
}

#[async_trait]
impl RecordStore for JsonDirStore {
    async fn list_collections(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(store_error(e, "*")),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with('.') {
                continue;
            }
            if let Some(name) = file_name.strip_suffix(&format!(".{}", EXTENSION)) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn page_records(
        &self,
        collection: &str,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<Page> {
        let offset = parse_offset(cursor)?;
        let records = self.load(collection).await?;
        Ok(page_of(&records, offset, page_size))
    }

    async fn write_record(&self, collection: &str, record: &Record, overwrite: bool) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut records = match self.load(collection).await {
            Ok(records) => records,
            Err(VaultError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) if overwrite => *existing = record.clone(),
            Some(_) => {
                return Err(VaultError::DuplicateRecord {
                    collection: collection.to_string(),
                    id: record.id.clone(),
                })
            }
            None => records.push(record.clone()),
        }
        self.save(collection, &records).await
    }
}
