//! Error taxonomy for the backup pipeline.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VaultError {
    /// Network hiccup or timeout talking to the record store. Retried with backoff.
    #[error("Transient store error: {0}")]
    TransientStore(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    /// A value that the named codec cannot represent.
    #[error("Format error ({codec}): {message}")]
    Format { codec: String, message: String },

    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("Duplicate record '{id}' in collection '{collection}'")]
    DuplicateRecord { collection: String, id: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("A run for tier '{0}' is already in progress")]
    TierBusy(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VaultError {
    pub fn format(codec: impl Into<String>, message: impl Into<String>) -> Self {
        VaultError::Format {
            codec: codec.into(),
            message: message.into(),
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        VaultError::CorruptArchive(message.into())
    }

    /// Whether the operation may succeed if simply tried again.
    pub fn is_transient(&self) -> bool {
        matches!(self, VaultError::TransientStore(_))
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
