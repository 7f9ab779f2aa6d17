//! Retention tiers, artifact naming and pruning.
//!
//! Artifacts live in `root/{tier}/{collection}_{runTimestamp}.{ext}`. All
//! files sharing `{collection}_{runTimestamp}` form one artifact group. A
//! tier keeps the artifact groups of its `keep` most recent runs.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::FormatKind;
use crate::utils::errors::{Result, VaultError};

/// ISO-8601 with colons replaced by dashes, millisecond precision.
pub const RUN_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.3fZ";

const STAGING_PREFIX: &str = ".pruning-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Daily,
    Weekly,
    Monthly,
    /// Ad-hoc runs: no schedule, never pruned.
    Manual,
}

impl Tier {
    pub const SCHEDULED: [Tier; 3] = [Tier::Daily, Tier::Weekly, Tier::Monthly];
    pub const ALL: [Tier; 4] = [Tier::Daily, Tier::Weekly, Tier::Monthly, Tier::Manual];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Daily => "daily",
            Tier::Weekly => "weekly",
            Tier::Monthly => "monthly",
            Tier::Manual => "manual",
        }
    }

    pub fn is_scheduled(self) -> bool {
        !matches!(self, Tier::Manual)
    }

    pub fn dir(self, root: &Path) -> PathBuf {
        root.join(self.as_str())
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Tier::Daily),
            "weekly" => Ok(Tier::Weekly),
            "monthly" => Ok(Tier::Monthly),
            "manual" => Ok(Tier::Manual),
            other => Err(VaultError::Configuration(format!("unknown tier '{}'", other))),
        }
    }
}

pub fn format_run_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(RUN_TIMESTAMP_FORMAT).to_string()
}

pub fn parse_run_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, RUN_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Whether `name` can be used as one path component inside a tier
/// directory: non-empty, no separators or NUL, not hidden.
pub fn is_safe_component(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains(['/', '\\', '\0'])
}

/// Parsed `{collection}_{runTimestamp}.{ext}` file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    pub collection: String,
    pub run_timestamp: String,
    pub format: FormatKind,
}

impl ArtifactName {
    pub fn new(collection: &str, run_timestamp: &str, format: FormatKind) -> Self {
        Self {
            collection: collection.to_string(),
            run_timestamp: run_timestamp.to_string(),
            format,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.{}", self.group_key(), self.format.extension())
    }

    /// `{collection}_{runTimestamp}`, shared by every format of one export.
    pub fn group_key(&self) -> String {
        group_key(&self.collection, &self.run_timestamp)
    }

    pub fn parse(file_name: &str) -> Option<Self> {
        let format = FormatKind::from_file_name(file_name)?;
        let stem = file_name.strip_suffix(&format!(".{}", format.extension()))?;
        let (collection, run_timestamp) = split_group_key(stem)?;
        Some(Self {
            collection: collection.to_string(),
            run_timestamp: run_timestamp.to_string(),
            format,
        })
    }
}

pub fn group_key(collection: &str, run_timestamp: &str) -> String {
    format!("{}_{}", collection, run_timestamp)
}

/// Split `{collection}_{runTimestamp}` on its last underscore. Collection
/// names may themselves contain underscores; timestamps never do.
pub fn split_group_key(key: &str) -> Option<(&str, &str)> {
    let (collection, ts) = key.rsplit_once('_')?;
    if collection.is_empty() || parse_run_timestamp(ts).is_none() {
        return None;
    }
    Some((collection, ts))
}

#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    pub format: FormatKind,
    pub path: PathBuf,
    pub byte_size: u64,
}

/// Every file one collection export produced in one run.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactGroup {
    pub tier: Tier,
    pub collection: String,
    pub run_timestamp: String,
    pub artifacts: Vec<Artifact>,
}

impl ArtifactGroup {
    /// Backup identifier: `{tier}/{collection}_{runTimestamp}`.
    pub fn id(&self) -> String {
        format!("{}/{}", self.tier, group_key(&self.collection, &self.run_timestamp))
    }

    pub fn formats(&self) -> Vec<FormatKind> {
        self.artifacts.iter().map(|a| a.format).collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.artifacts.iter().map(|a| a.byte_size).sum()
    }

    pub fn artifact(&self, format: FormatKind) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.format == format)
    }
}

/// List the artifact groups of a tier, newest run first. Hidden files
/// (in-flight writes, staging directories) and unrecognized names are skipped.
pub async fn scan_tier(root: &Path, tier: Tier) -> Result<Vec<ArtifactGroup>> {
    let dir = tier.dir(root);
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut groups: Vec<ArtifactGroup> = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name().to_string_lossy().to_string();
        if file_name.starts_with('.') {
            continue;
        }
        let Some(name) = ArtifactName::parse(&file_name) else {
            debug!(tier = %tier, file = %file_name, "Ignoring unrecognized file");
            continue;
        };
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let artifact = Artifact {
            format: name.format,
            path: entry.path(),
            byte_size: metadata.len(),
        };
        match groups
            .iter_mut()
            .find(|g| g.collection == name.collection && g.run_timestamp == name.run_timestamp)
        {
            Some(group) => group.artifacts.push(artifact),
            None => groups.push(ArtifactGroup {
                tier,
                collection: name.collection,
                run_timestamp: name.run_timestamp,
                artifacts: vec![artifact],
            }),
        }
    }

    for group in &mut groups {
        group.artifacts.sort_by_key(|a| a.format);
    }
    groups.sort_by(|a, b| {
        b.run_timestamp
            .cmp(&a.run_timestamp)
            .then_with(|| a.collection.cmp(&b.collection))
    });
    Ok(groups)
}

/// Delete every file of a group, or none of them.
///
/// Files are first moved into a per-group staging directory; if any move
/// fails the moved files are put back before the error is returned.
pub async fn remove_group(group: &ArtifactGroup) -> Result<()> {
    let Some(dir) = group.artifacts.first().and_then(|a| a.path.parent()) else {
        return Ok(());
    };
    let staging = dir.join(format!(
        "{}{}",
        STAGING_PREFIX,
        group_key(&group.collection, &group.run_timestamp)
    ));
    tokio::fs::create_dir_all(&staging).await?;

    let mut moved: Vec<(PathBuf, PathBuf)> = Vec::new();
    for artifact in &group.artifacts {
        let Some(file_name) = artifact.path.file_name() else {
            continue;
        };
        let staged = staging.join(file_name);
        if let Err(e) = tokio::fs::rename(&artifact.path, &staged).await {
            for (original, staged) in moved.iter().rev() {
                if let Err(undo) = tokio::fs::rename(staged, original).await {
                    warn!(path = %original.display(), error = %undo, "Failed to restore staged artifact");
                }
            }
            let _ = tokio::fs::remove_dir(&staging).await;
            return Err(e.into());
        }
        moved.push((artifact.path.clone(), staged));
    }

    tokio::fs::remove_dir_all(&staging).await?;
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneReport {
    pub kept_runs: Vec<String>,
    pub deleted: Vec<String>,
    pub failures: Vec<(String, String)>,
}

pub struct RetentionManager {
    root: PathBuf,
}

impl RetentionManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Keep the artifact groups of the `keep` newest runs in `tier` and
    /// delete the rest, oldest first. A group that fails to delete is
    /// reported and does not stop the others.
    pub async fn prune(&self, tier: Tier, keep: usize) -> Result<PruneReport> {
        let groups = scan_tier(&self.root, tier).await?;

        let runs: BTreeSet<&str> = groups.iter().map(|g| g.run_timestamp.as_str()).collect();
        let kept: BTreeSet<&str> = runs.iter().rev().take(keep).copied().collect();

        let mut report = PruneReport {
            kept_runs: kept.iter().rev().map(|s| s.to_string()).collect(),
            ..Default::default()
        };

        for group in groups
            .iter()
            .rev()
            .filter(|g| !kept.contains(g.run_timestamp.as_str()))
        {
            match remove_group(group).await {
                Ok(()) => {
                    info!(tier = %tier, group = %group.id(), "Removed expired backup");
                    report.deleted.push(group.id());
                }
                Err(e) => {
                    warn!(tier = %tier, group = %group.id(), error = %e, "Failed to remove expired backup");
                    report.failures.push((group.id(), e.to_string()));
                }
            }
        }

        Ok(report)
    }
}
