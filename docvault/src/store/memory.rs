//! In-process record store with fault injection.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{page_of, parse_offset, Page, RecordStore};
use crate::record::Record;
use crate::utils::errors::{Result, VaultError};

/// A failure mode attached to one collection.
#[derive(Debug, Clone)]
enum Fault {
    /// The next `remaining` page calls fail with a transient error.
    Transient { remaining: usize },
    /// Every page call fails with a permission error.
    DenyReads,
    /// The next `remaining` pages succeed, every later call fails with a
    /// permission error.
    FailAfterPages { remaining: usize },
}

#[derive(Default)]
struct Inner {
    collections: BTreeMap<String, Vec<Record>>,
    faults: HashMap<String, Fault>,
    denied_writes: HashMap<String, String>,
    page_calls: HashMap<String, usize>,
    page_delay: Option<Duration>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents of a collection.
    pub async fn insert_collection(&self, name: impl Into<String>, records: Vec<Record>) {
        self.inner.lock().await.collections.insert(name.into(), records);
    }

    pub async fn records(&self, collection: &str) -> Vec<Record> {
        self.inner
            .lock()
            .await
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of page requests served (or failed) for a collection.
    pub async fn page_calls(&self, collection: &str) -> usize {
        self.inner
            .lock()
            .await
            .page_calls
            .get(collection)
            .copied()
            .unwrap_or(0)
    }

    /// Delay every page fetch, simulating a slow store.
    pub async fn set_page_delay(&self, delay: Duration) {
        self.inner.lock().await.page_delay = Some(delay);
    }

    pub async fn fail_transiently(&self, collection: &str, times: usize) {
        self.set_fault(collection, Fault::Transient { remaining: times }).await;
    }

    pub async fn deny_reads(&self, collection: &str) {
        self.set_fault(collection, Fault::DenyReads).await;
    }

    pub async fn fail_after_pages(&self, collection: &str, pages: usize) {
        self.set_fault(collection, Fault::FailAfterPages { remaining: pages })
            .await;
    }

    /// Make every write to `collection` fail with a permission error.
    pub async fn deny_writes(&self, collection: &str) {
        self.inner.lock().await.denied_writes.insert(
            collection.to_string(),
            format!("write access to '{}' denied", collection),
        );
    }

    pub async fn clear_faults(&self) {
        let mut inner = self.inner.lock().await;
        inner.faults.clear();
        inner.denied_writes.clear();
    }

    async fn set_fault(&self, collection: &str, fault: Fault) {
        self.inner
            .lock()
            .await
            .faults
            .insert(collection.to_string(), fault);
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn list_collections(&self) -> Result<Vec<String>> {
        Ok(self.inner.lock().await.collections.keys().cloned().collect())
    }

    async fn page_records(
        &self,
        collection: &str,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<Page> {
        let delay = self.inner.lock().await.page_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock().await;
        *inner.page_calls.entry(collection.to_string()).or_insert(0) += 1;

        match inner.faults.get_mut(collection) {
            Some(Fault::Transient { remaining }) if *remaining > 0 => {
                *remaining -= 1;
                return Err(VaultError::TransientStore(format!(
                    "store unreachable while reading '{}'",
                    collection
                )));
            }
            Some(Fault::DenyReads) => {
                return Err(VaultError::Permission(format!(
                    "read access to '{}' denied",
                    collection
                )));
            }
            Some(Fault::FailAfterPages { remaining }) => {
                if *remaining == 0 {
                    return Err(VaultError::Permission(format!(
                        "read access to '{}' revoked mid-listing",
                        collection
                    )));
                }
                *remaining -= 1;
            }
            _ => {}
        }

        let records = inner
            .collections
            .get(collection)
            .ok_or_else(|| VaultError::NotFound(format!("collection '{}'", collection)))?;
        let offset = parse_offset(cursor)?;
        Ok(page_of(records, offset, page_size))
    }

    async fn write_record(&self, collection: &str, record: &Record, overwrite: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(reason) = inner.denied_writes.get(collection) {
            return Err(VaultError::Permission(reason.clone()));
        }
        let records = inner.collections.entry(collection.to_string()).or_default();
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
        Ok(())
    }
}
