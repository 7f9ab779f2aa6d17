//! Configuration management for the backup pipeline.
//!
//! Loads configuration from a TOML file with environment variable overrides.
//! Every field has a default, so a partial (or missing) file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::FormatKind;
use crate::retention::Tier;
use crate::utils::errors::{Result, VaultError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub tiers: TiersConfig,
    #[serde(default)]
    pub formats: FormatsConfig,
    #[serde(default)]
    pub collections: CollectionsConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the backup tree (`daily/`, `weekly/`, `monthly/`, `manual/`, `logs/`)
    #[serde(default = "default_root")]
    pub root: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TiersConfig {
    #[serde(default)]
    pub daily: TierConfig,
    #[serde(default)]
    pub weekly: TierConfig,
    #[serde(default)]
    pub monthly: TierConfig,
}

/// Per-tier settings. Unset schedule/retention fall back to the tier's default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Five-field cron expression
    #[serde(default)]
    pub schedule: Option<String>,

    /// Number of runs to keep
    #[serde(default)]
    pub retention: Option<usize>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Fully resolved settings of one scheduled tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierSettings {
    pub tier: Tier,
    pub schedule: String,
    pub retention: usize,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatsConfig {
    #[serde(default = "default_true")]
    pub sql: bool,
    #[serde(default = "default_true")]
    pub bson: bool,
    #[serde(default = "default_true")]
    pub xlsx: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionsConfig {
    /// When set, exactly these collections are exported
    #[serde(default)]
    pub include: Option<Vec<String>>,

    /// Subtracted from the discovered collections when no include list is set
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Collections exported concurrently
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Records per page fetch
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Timeout of a single page fetch
    #[serde(default = "default_page_timeout_ms")]
    pub page_timeout_ms: u64,

    /// Attempts per page before a transient error fails the collection
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Compression level (1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_root() -> PathBuf {
    PathBuf::from("./backups")
}

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    3
}

fn default_page_size() -> usize {
    500
}

fn default_page_timeout_ms() -> u64 {
    30_000
}

fn default_retry_attempts() -> u32 {
    4
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_retry_max_delay_ms() -> u64 {
    5_000
}

fn default_compression_level() -> i32 {
    crate::compress::DEFAULT_LEVEL
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn default_schedule(tier: Tier) -> &'static str {
    match tier {
        Tier::Daily => "0 2 * * *",
        Tier::Weekly => "0 3 * * 0",
        Tier::Monthly | Tier::Manual => "0 4 1 * *",
    }
}

pub fn default_retention(tier: Tier) -> usize {
    match tier {
        Tier::Daily => 7,
        Tier::Weekly => 4,
        Tier::Monthly | Tier::Manual => 12,
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
        }
    }
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            schedule: None,
            retention: None,
            enabled: true,
        }
    }
}

impl Default for FormatsConfig {
    fn default() -> Self {
        Self {
            sql: true,
            bson: true,
            xlsx: true,
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            page_size: default_page_size(),
            page_timeout_ms: default_page_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            compression_level: default_compression_level(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl FormatsConfig {
    pub fn enabled(&self) -> Vec<FormatKind> {
        FormatKind::ALL
            .into_iter()
            .filter(|kind| match kind {
                FormatKind::Sql => self.sql,
                FormatKind::Bson => self.bson,
                FormatKind::Xlsx => self.xlsx,
            })
            .collect()
    }
}

impl PerformanceConfig {
    pub fn page_timeout(&self) -> Duration {
        Duration::from_millis(self.page_timeout_ms)
    }

    /// Backoff before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        let delay = self.retry_base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.retry_max_delay_ms))
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            VaultError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            VaultError::Configuration(format!("invalid config {}: {}", path.display(), e))
        })
    }

    /// File (or defaults), then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `DOCVAULT_*` overrides. `lookup` abstracts the environment.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(root) = lookup("DOCVAULT_ROOT") {
            self.storage.root = PathBuf::from(root);
        }
        if let Some(workers) = lookup("DOCVAULT_WORKERS") {
            self.performance.workers = parse_env("DOCVAULT_WORKERS", &workers)?;
        }
        if let Some(page_size) = lookup("DOCVAULT_PAGE_SIZE") {
            self.performance.page_size = parse_env("DOCVAULT_PAGE_SIZE", &page_size)?;
        }
        if let Some(level) = lookup("DOCVAULT_LOG_LEVEL") {
            self.log.level = level;
        }
        Ok(())
    }

    pub fn tier(&self, tier: Tier) -> TierSettings {
        let raw = match tier {
            Tier::Daily => Some(&self.tiers.daily),
            Tier::Weekly => Some(&self.tiers.weekly),
            Tier::Monthly => Some(&self.tiers.monthly),
            Tier::Manual => None,
        };
        TierSettings {
            tier,
            schedule: raw
                .and_then(|t| t.schedule.clone())
                .unwrap_or_else(|| default_schedule(tier).to_string()),
            retention: raw
                .and_then(|t| t.retention)
                .unwrap_or_else(|| default_retention(tier)),
            enabled: raw.map(|t| t.enabled).unwrap_or(false),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.performance.workers == 0 {
            return Err(VaultError::Configuration("workers must be at least 1".into()));
        }
        if self.performance.page_size == 0 {
            return Err(VaultError::Configuration("page_size must be at least 1".into()));
        }
        if self.performance.retry_attempts == 0 {
            return Err(VaultError::Configuration(
                "retry_attempts must be at least 1".into(),
            ));
        }
        if self.formats.enabled().is_empty() {
            return Err(VaultError::Configuration("every format is disabled".into()));
        }
        for tier in Tier::SCHEDULED {
            let settings = self.tier(tier);
            if !settings.enabled {
                continue;
            }
            if settings.retention == 0 {
                return Err(VaultError::Configuration(format!(
                    "tier '{}' is enabled with a retention of 0",
                    tier
                )));
            }
            crate::scheduler::Schedule::parse(&settings.schedule).map_err(|e| {
                VaultError::Configuration(format!("tier '{}': {}", tier, e))
            })?;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| VaultError::Configuration(format!("{}='{}' is not a valid number", key, raw)))
}
