//! Record store contract consumed by the pipeline.
//!
//! The pipeline never talks to a database directly; it lists collections,
//! pages through records and writes records back through [`RecordStore`].

pub mod json_dir;
pub mod memory;

use async_trait::async_trait;

use crate::record::Record;
use crate::utils::errors::Result;

pub use json_dir::JsonDirStore;
pub use memory::MemoryStore;

/// One page of a collection listing.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<Record>,
    /// Cursor for the next page, `None` once the listing is exhausted.
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Names of all collections, in a stable order.
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Fetch up to `page_size` records starting at `cursor` (`None` = first page).
    ///
    /// Pages are not pinned to a snapshot: writes that land between two calls
    /// may or may not be visible in later pages.
    async fn page_records(
        &self,
        collection: &str,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<Page>;

    /// Write one record. With `overwrite` an existing record with the same id
    /// is replaced, otherwise it fails with `VaultError::DuplicateRecord`.
    async fn write_record(&self, collection: &str, record: &Record, overwrite: bool) -> Result<()>;
}

/// Offset cursors shared by the bundled stores.
pub(crate) fn parse_offset(cursor: Option<&str>) -> Result<usize> {
    match cursor {
        None => Ok(0),
        Some(raw) => raw.parse().map_err(|_| {
            crate::utils::errors::VaultError::TransientStore(format!("invalid page cursor '{}'", raw))
        }),
    }
}

/// Slice out one page starting at `offset`.
pub(crate) fn page_of(records: &[Record], offset: usize, page_size: usize) -> Page {
    let start = offset.min(records.len());
    let end = start.saturating_add(page_size.max(1)).min(records.len());
    Page {
        records: records[start..end].to_vec(),
        next_cursor: (end < records.len()).then(|| end.to_string()),
    }
}
