//! zstd compression for the relational and document dumps.

use async_compression::tokio::bufread::ZstdEncoder;
use async_compression::Level;
use tokio::io::{AsyncReadExt, BufReader};

use crate::utils::errors::{Result, VaultError};

/// Default zstd level used when the config does not say otherwise.
pub const DEFAULT_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct Compressor {
    level: i32,
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(DEFAULT_LEVEL)
    }
}

impl Compressor {
    pub fn new(level: i32) -> Self {
        Self { level }
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    /// Stream `data` through the zstd encoder.
    pub async fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZstdEncoder::with_quality(BufReader::new(data), Level::Precise(self.level));
        let mut out = Vec::with_capacity(data.len() / 4 + 64);
        encoder.read_to_end(&mut out).await?;
        Ok(out)
    }

    /// Decompress a complete zstd stream. Truncated, empty or otherwise
    /// malformed input is a [`VaultError::CorruptArchive`]; partial output is
    /// never returned.
    pub async fn decompress(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Err(VaultError::corrupt("compressed stream is empty"));
        }
        tokio::task::spawn_blocking(move || zstd::decode_all(data.as_slice()))
            .await
            .map_err(|e| VaultError::corrupt(format!("decompression task failed: {}", e)))?
            .map_err(|e| VaultError::corrupt(format!("zstd decompression failed: {}", e)))
    }
}
