//! docvault library
//!
//! Scheduled backup, retention and restore of document-database collections
//! into relational, document and tabular dumps.

pub mod catalog;
pub mod codec;
pub mod compress;
pub mod config;
pub mod daemon;
pub mod export;
pub mod orchestrator;
pub mod record;
pub mod restore;
pub mod retention;
pub mod runlog;
pub mod scheduler;
pub mod store;
pub mod utils;
pub mod vault;

// Re-export commonly used types
pub use codec::FormatKind;
pub use config::Config;
pub use orchestrator::BackupRequest;
pub use record::{Document, Record, Value};
pub use restore::{RestoreRequest, RestoreResult};
pub use retention::Tier;
pub use runlog::{RunLog, RunStatus};
pub use store::RecordStore;
pub use utils::errors::{Result, VaultError};
pub use vault::Vault;
