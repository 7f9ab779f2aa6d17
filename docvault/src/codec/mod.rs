//! Archive codecs.
//!
//! Each codec turns an ordered sequence of [`Record`]s into a byte stream and
//! back. Compression is applied separately by [`crate::compress`].

pub mod bson;
pub mod sql;
pub mod xlsx;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{is_reserved, Record};
use crate::utils::errors::{Result, VaultError};

/// The three archive formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    /// Relational dump: schema + one INSERT per record.
    Sql,
    /// Document dump: length-prefixed binary documents.
    Bson,
    /// Tabular dump: spreadsheet workbook. Lossy for nested values.
    Xlsx,
}

impl FormatKind {
    pub const ALL: [FormatKind; 3] = [FormatKind::Sql, FormatKind::Bson, FormatKind::Xlsx];

    /// Candidates for automatic restore, most faithful first. The lossy
    /// tabular format is never auto-selected.
    pub const RESTORE_PREFERENCE: [FormatKind; 2] = [FormatKind::Bson, FormatKind::Sql];

    pub fn as_str(self) -> &'static str {
        match self {
            FormatKind::Sql => "sql",
            FormatKind::Bson => "bson",
            FormatKind::Xlsx => "xlsx",
        }
    }

    /// Full artifact file extension, including the compression suffix.
    pub fn extension(self) -> &'static str {
        match self {
            FormatKind::Sql => "sql.zst",
            FormatKind::Bson => "bson.zst",
            FormatKind::Xlsx => "xlsx",
        }
    }

    pub fn is_compressed(self) -> bool {
        !matches!(self, FormatKind::Xlsx)
    }

    pub fn is_lossy(self) -> bool {
        matches!(self, FormatKind::Xlsx)
    }

    /// Detect the format from an artifact file name by its extension.
    pub fn from_file_name(name: &str) -> Option<FormatKind> {
        FormatKind::ALL
            .into_iter()
            .find(|kind| name.ends_with(&format!(".{}", kind.extension())))
    }

    pub fn codec(self) -> Box<dyn Codec> {
        match self {
            FormatKind::Sql => Box::new(sql::SqlCodec),
            FormatKind::Bson => Box::new(bson::BsonCodec),
            FormatKind::Xlsx => Box::new(xlsx::XlsxCodec),
        }
    }
}

impl fmt::Display for FormatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FormatKind {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sql" | "relational" => Ok(FormatKind::Sql),
            "bson" | "document" => Ok(FormatKind::Bson),
            "xlsx" | "tabular" => Ok(FormatKind::Xlsx),
            other => Err(VaultError::Configuration(format!(
                "unknown format '{}' (expected sql, bson or xlsx)",
                other
            ))),
        }
    }
}

/// Information about the export that some formats embed in their output.
#[derive(Debug, Clone)]
pub struct ExportContext<'a> {
    pub collection: &'a str,
    pub exported_at: DateTime<Utc>,
}

pub trait Codec: Send + Sync {
    fn kind(&self) -> FormatKind;

    /// Encode a full collection snapshot. Never fails on an empty slice.
    fn encode(&self, ctx: &ExportContext<'_>, records: &[Record]) -> Result<Vec<u8>>;

    /// Decode a byte stream produced by [`Codec::encode`]. Malformed input
    /// yields [`VaultError::CorruptArchive`].
    fn decode(&self, bytes: &[u8]) -> Result<Vec<Record>>;
}

/// Field names in first-seen order across all records.
pub(crate) fn field_union(records: &[Record]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut names = Vec::new();
    for record in records {
        for key in record.fields.keys() {
            if seen.insert(key) {
                names.push(key.to_string());
            }
        }
    }
    names
}

/// User fields may not shadow the reserved `_id` / `_updated_at` fields.
pub(crate) fn reject_reserved(kind: FormatKind, record: &Record) -> Result<()> {
    match record.fields.keys().find(|k| is_reserved(k)) {
        Some(key) => Err(VaultError::format(
            kind.as_str(),
            format!("record '{}' uses reserved field name '{}'", record.id, key),
        )),
        None => Ok(()),
    }
}
