//! Backup catalog: history, artifact listing and backup identifiers.
//!
//! A backup identifier is either `{tier}/{collection}_{runTimestamp}` (every
//! format of one export), `{tier}/{file name}` (one artifact) or, for
//! restores, a filesystem path to an artifact.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::codec::FormatKind;
use crate::retention::{
    is_safe_component, remove_group, scan_tier, split_group_key, Artifact, ArtifactGroup,
    ArtifactName, Tier,
};
use crate::runlog::{RunLogStore, RunSummary};
use crate::utils::errors::{Result, VaultError};

/// What a backup identifier points at.
#[derive(Debug, Clone)]
pub struct ResolvedBackup {
    /// Collection the artifacts were exported from, when it can be told.
    pub collection: Option<String>,
    pub artifacts: Vec<Artifact>,
    /// The identifier named one specific file.
    pub single_file: bool,
}

impl ResolvedBackup {
    pub fn artifact(&self, format: FormatKind) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.format == format)
    }
}

pub struct Catalog {
    root: PathBuf,
    logs: Arc<RunLogStore>,
}

impl Catalog {
    pub fn new(root: impl Into<PathBuf>, logs: Arc<RunLogStore>) -> Self {
        Self {
            root: root.into(),
            logs,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run summaries, newest first.
    pub async fn list_history(&self) -> Result<Vec<RunSummary>> {
        Ok(self.logs.list().await?.iter().map(|log| log.summary()).collect())
    }

    /// Artifact groups of one tier, or of every tier, newest first.
    pub async fn list_artifacts(&self, tier: Option<Tier>) -> Result<Vec<ArtifactGroup>> {
        let tiers: Vec<Tier> = match tier {
            Some(tier) => vec![tier],
            None => Tier::ALL.to_vec(),
        };
        let mut groups = Vec::new();
        for tier in tiers {
            groups.extend(scan_tier(&self.root, tier).await?);
        }
        groups.sort_by(|a, b| b.run_timestamp.cmp(&a.run_timestamp));
        Ok(groups)
    }

    /// Resolve an identifier to existing artifacts.
    pub async fn resolve(&self, backup_id: &str) -> Result<ResolvedBackup> {
        if let Some(resolved) = self.resolve_id(backup_id).await? {
            return Ok(resolved);
        }

        let path = Path::new(backup_id);
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => {
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                let parsed = ArtifactName::parse(&file_name);
                let format = parsed
                    .as_ref()
                    .map(|n| n.format)
                    .or_else(|| FormatKind::from_file_name(&file_name));
                let artifacts = format
                    .map(|format| Artifact {
                        format,
                        path: path.to_path_buf(),
                        byte_size: meta.len(),
                    })
                    .into_iter()
                    .collect();
                Ok(ResolvedBackup {
                    collection: parsed.map(|n| n.collection),
                    artifacts,
                    single_file: true,
                })
            }
            _ => Err(VaultError::NotFound(format!("backup '{}'", backup_id))),
        }
    }

    /// Delete a backup by identifier: one artifact or a whole group.
    pub async fn delete_backup(&self, backup_id: &str) -> Result<Vec<PathBuf>> {
        let resolved = self
            .resolve_id(backup_id)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("backup '{}'", backup_id)))?;

        let Some(first) = resolved.artifacts.first() else {
            return Err(VaultError::NotFound(format!("backup '{}'", backup_id)));
        };
        let name = first
            .path
            .file_name()
            .and_then(|n| ArtifactName::parse(&n.to_string_lossy()))
            .ok_or_else(|| VaultError::NotFound(format!("backup '{}'", backup_id)))?;
        let (tier, _) = split_id(backup_id).ok_or_else(|| VaultError::NotFound(backup_id.to_string()))?;

        let group = ArtifactGroup {
            tier,
            collection: name.collection,
            run_timestamp: name.run_timestamp,
            artifacts: resolved.artifacts,
        };
        remove_group(&group).await?;

        let paths: Vec<PathBuf> = group.artifacts.into_iter().map(|a| a.path).collect();
        info!(backup_id = %backup_id, files = paths.len(), "Deleted backup");
        Ok(paths)
    }

    /// `{tier}/...` identifiers. `Ok(None)` means the id is not of that shape.
    async fn resolve_id(&self, backup_id: &str) -> Result<Option<ResolvedBackup>> {
        let Some((tier, rest)) = split_id(backup_id) else {
            return Ok(None);
        };
        let not_found = || VaultError::NotFound(format!("backup '{}'", backup_id));

        if let Some(name) = ArtifactName::parse(rest) {
            let path = tier.dir(&self.root).join(rest);
            let meta = tokio::fs::metadata(&path).await.map_err(|_| not_found())?;
            return Ok(Some(ResolvedBackup {
                collection: Some(name.collection),
                artifacts: vec![Artifact {
                    format: name.format,
                    path,
                    byte_size: meta.len(),
                }],
                single_file: true,
            }));
        }

        let (collection, run_timestamp) = split_group_key(rest).ok_or_else(not_found)?;
        let group = scan_tier(&self.root, tier)
            .await?
            .into_iter()
            .find(|g| g.collection == collection && g.run_timestamp == run_timestamp)
            .ok_or_else(not_found)?;
        Ok(Some(ResolvedBackup {
            collection: Some(group.collection),
            artifacts: group.artifacts,
            single_file: false,
        }))
    }
}

/// Split `{tier}/{rest}`; `rest` must be a plain file-name-like component.
fn split_id(backup_id: &str) -> Option<(Tier, &str)> {
    let (tier, rest) = backup_id.split_once('/')?;
    let tier: Tier = tier.parse().ok()?;
    if !is_safe_component(rest) {
        return None;
    }
    Some((tier, rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TS: &str = "2026-10-19T02-00-00.000Z";

    fn seed(root: &Path) {
        let dir = Tier::Daily.dir(root);
        std::fs::create_dir_all(&dir).unwrap();
        for format in FormatKind::ALL {
            let name = ArtifactName::new("users", TS, format).file_name();
            std::fs::write(dir.join(name), b"data").unwrap();
        }
    }

    fn catalog(root: &Path) -> Catalog {
        Catalog::new(root, Arc::new(RunLogStore::new(root)))
    }

    #[tokio::test]
    async fn test_resolve_group_and_single_file() {
        let dir = TempDir::new().unwrap();
        seed(dir.path());
        let catalog = catalog(dir.path());

        let group = catalog.resolve(&format!("daily/users_{}", TS)).await.unwrap();
        assert!(!group.single_file);
        assert_eq!(group.artifacts.len(), 3);
        assert_eq!(group.collection.as_deref(), Some("users"));

        let single = catalog
            .resolve(&format!("daily/users_{}.sql.zst", TS))
            .await
            .unwrap();
        assert!(single.single_file);
        assert!(single.artifact(FormatKind::Sql).is_some());

        let by_path = single.artifacts[0].path.to_string_lossy().to_string();
        let resolved = catalog.resolve(&by_path).await.unwrap();
        assert_eq!(resolved.collection.as_deref(), Some("users"));
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let dir = TempDir::new().unwrap();
        seed(dir.path());
        let catalog = catalog(dir.path());
        for id in [
            "daily/users_2020-01-01T00-00-00.000Z",
            "weekly/users_2026-10-19T02-00-00.000Z",
            "daily/../secrets",
            "nonsense",
        ] {
            assert!(
                matches!(catalog.resolve(id).await, Err(VaultError::NotFound(_))),
                "{}",
                id
            );
        }
    }

    #[tokio::test]
    async fn test_delete_group_then_not_found() {
        let dir = TempDir::new().unwrap();
        seed(dir.path());
        let catalog = catalog(dir.path());
        let id = format!("daily/users_{}", TS);

        let deleted = catalog.delete_backup(&id).await.unwrap();
        assert_eq!(deleted.len(), 3);
        assert!(deleted.iter().all(|p| !p.exists()));
        assert!(catalog.list_artifacts(None).await.unwrap().is_empty());
        assert!(matches!(
            catalog.delete_backup(&id).await,
            Err(VaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_single_artifact_keeps_siblings() {
        let dir = TempDir::new().unwrap();
        seed(dir.path());
        let catalog = catalog(dir.path());

        catalog
            .delete_backup(&format!("daily/users_{}.xlsx", TS))
            .await
            .unwrap();
        let groups = catalog.list_artifacts(Some(Tier::Daily)).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].formats(), vec![FormatKind::Sql, FormatKind::Bson]);
    }
}
