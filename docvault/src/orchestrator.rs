//! Run orchestrator.
//!
//! One backup run moves through
//! `idle -> resolving-collections -> exporting -> finalizing -> {success, partial-success, failed}`.
//! Collection exports run on a bounded worker pool and are merged into the
//! run log as each one finishes.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::FormatKind;
use crate::config::Config;
use crate::export::{CollectionExporter, ExportJob, ExportOutcome};
use crate::retention::{format_run_timestamp, RetentionManager, Tier};
use crate::runlog::{CollectionError, RunLog, RunLogStore, RunStatus};
use crate::store::RecordStore;
use crate::utils::errors::{Result, VaultError};

/// Parameters of one backup run. Unset fields fall back to the configuration.
#[derive(Debug, Clone, Default)]
pub struct BackupRequest {
    /// `None` is a manual run: written under `manual/`, never pruned.
    pub tier: Option<Tier>,
    pub collections: Option<Vec<String>>,
    pub formats: Option<Vec<FormatKind>>,
    pub dry_run: bool,
}

impl BackupRequest {
    pub fn for_tier(tier: Tier) -> Self {
        Self {
            tier: Some(tier),
            ..Default::default()
        }
    }

    pub fn manual() -> Self {
        Self::default()
    }

    fn effective_tier(&self) -> Tier {
        self.tier.unwrap_or(Tier::Manual)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    ResolvingCollections,
    Exporting,
    Finalizing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::ResolvingCollections => "resolving-collections",
            Phase::Exporting => "exporting",
            Phase::Finalizing => "finalizing",
        })
    }
}

pub struct Orchestrator {
    config: Arc<Config>,
    store: Arc<dyn RecordStore>,
    exporter: Arc<CollectionExporter>,
    logs: Arc<RunLogStore>,
    retention: RetentionManager,
    last_start: Mutex<Option<DateTime<Utc>>>,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, store: Arc<dyn RecordStore>, logs: Arc<RunLogStore>) -> Self {
        let exporter = Arc::new(CollectionExporter::new(
            Arc::clone(&store),
            config.performance.clone(),
        ));
        let retention = RetentionManager::new(config.storage.root.clone());
        Self {
            config,
            store,
            exporter,
            logs,
            retention,
            last_start: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn logs(&self) -> &Arc<RunLogStore> {
        &self.logs
    }

    /// Execute one run. Partial failures are reported in the returned log,
    /// never as an `Err`.
    pub async fn run(&self, request: BackupRequest, cancel: CancellationToken) -> RunLog {
        let tier = request.effective_tier();
        let started_at = self.next_start().await;
        let mut log = RunLog::begin(format_run_timestamp(&started_at), tier, started_at);
        log.dry_run = request.dry_run;
        info!(run_id = %log.run_id, tier = %tier, dry_run = request.dry_run, "Backup run started");

        self.enter(&log, Phase::ResolvingCollections);
        let plan = match self.plan(&request).await {
            Ok(plan) => plan,
            Err(e) => {
                error!(run_id = %log.run_id, error = %e, "Backup run aborted");
                log.fail(e.to_string(), Utc::now());
                self.persist(&log).await;
                return log;
            }
        };
        log.planned_collections = plan.collections.clone();
        log.collections_attempted = plan.collections.len();

        if request.dry_run {
            log.finalize(Utc::now());
            info!(
                run_id = %log.run_id,
                collections = ?log.planned_collections,
                formats = ?plan.formats,
                "Dry run complete, nothing written"
            );
            return log;
        }

        let dest_dir = tier.dir(&self.config.storage.root);
        if let Err(e) = tokio::fs::create_dir_all(&dest_dir).await {
            let message = format!("cannot create {}: {}", dest_dir.display(), e);
            error!(run_id = %log.run_id, error = %message, "Backup run aborted");
            log.fail(message, Utc::now());
            self.persist(&log).await;
            return log;
        }

        self.enter(&log, Phase::Exporting);
        self.export_all(&mut log, plan, dest_dir, &cancel).await;
        if cancel.is_cancelled() {
            log.cancelled = true;
        }

        self.enter(&log, Phase::Finalizing);
        log.finalize(Utc::now());
        self.persist(&log).await;

        if tier.is_scheduled() && log.status != RunStatus::Failed {
            let keep = self.config.tier(tier).retention;
            match self.retention.prune(tier, keep).await {
                Ok(report) if !report.deleted.is_empty() => {
                    info!(tier = %tier, deleted = report.deleted.len(), "Retention applied")
                }
                Ok(_) => {}
                Err(e) => warn!(tier = %tier, error = %e, "Retention pass failed"),
            }
        }

        info!(
            run_id = %log.run_id,
            status = ?log.status,
            records = log.records_exported,
            artifacts = log.manifests.len(),
            errors = log.errors.len(),
            duration_ms = log.duration_ms,
            "Backup run finished"
        );
        log
    }

    fn enter(&self, log: &RunLog, phase: Phase) {
        debug!(run_id = %log.run_id, phase = %phase, "Run phase");
    }

    async fn export_all(
        &self,
        log: &mut RunLog,
        plan: Plan,
        dest_dir: PathBuf,
        cancel: &CancellationToken,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.config.performance.workers.max(1)));
        let mut tasks = JoinSet::new();

        for collection in plan.collections {
            let semaphore = Arc::clone(&semaphore);
            let exporter = Arc::clone(&self.exporter);
            let cancel = cancel.clone();
            let job = ExportJob {
                collection,
                formats: plan.formats.clone(),
                dest_dir: dest_dir.clone(),
                run_timestamp: log.run_id.clone(),
                exported_at: log.started_at,
            };
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => exporter.export(&job, &cancel).await,
                    Err(_) => Err(VaultError::Cancelled),
                };
                (job.collection, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => merge(log, outcome),
                Ok((collection, Err(VaultError::Cancelled))) => {
                    debug!(run_id = %log.run_id, collection = %collection, "Export cancelled");
                    log.cancelled = true;
                }
                Ok((collection, Err(e))) => {
                    warn!(run_id = %log.run_id, collection = %collection, error = %e, "Collection export failed");
                    log.errors.push(CollectionError {
                        collection: Some(collection),
                        format: None,
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    error!(run_id = %log.run_id, error = %e, "Export task panicked");
                    log.errors.push(CollectionError {
                        collection: None,
                        format: None,
                        message: format!("export task failed: {}", e),
                    });
                }
            }
        }
    }

    async fn persist(&self, log: &RunLog) {
        if log.dry_run {
            return;
        }
        if let Err(e) = self.logs.write(log).await {
            error!(run_id = %log.run_id, error = %e, "Failed to write run log");
        }
    }

    /// Resolve collections and formats before any export starts.
    async fn plan(&self, request: &BackupRequest) -> Result<Plan> {
        let formats = dedup(
            request
                .formats
                .clone()
                .unwrap_or_else(|| self.config.formats.enabled()),
        );
        if formats.is_empty() {
            return Err(VaultError::Configuration("no output format selected".into()));
        }

        let discovered = self.store.list_collections().await.map_err(|e| {
            VaultError::Configuration(format!("cannot list collections: {}", e))
        })?;

        let include = request
            .collections
            .clone()
            .or_else(|| self.config.collections.include.clone());

        let collections = match include {
            Some(include) => {
                let include = dedup(include);
                let known: HashSet<&str> = discovered.iter().map(String::as_str).collect();
                let unknown: Vec<&str> = include
                    .iter()
                    .map(String::as_str)
                    .filter(|name| !known.contains(name))
                    .collect();
                if !unknown.is_empty() {
                    return Err(VaultError::Configuration(format!(
                        "unknown collection(s): {}",
                        unknown.join(", ")
                    )));
                }
                include
            }
            None => {
                let exclude: HashSet<&str> = self
                    .config
                    .collections
                    .exclude
                    .iter()
                    .map(String::as_str)
                    .collect();
                discovered
                    .into_iter()
                    .filter(|name| !exclude.contains(name.as_str()))
                    .collect()
            }
        };
        if collections.is_empty() {
            return Err(VaultError::Configuration(
                "no collection left to back up after filtering".into(),
            ));
        }

        Ok(Plan {
            collections,
            formats,
        })
    }

    /// Run start time, strictly later than the previous run's so run ids
    /// (and artifact names) never collide.
    async fn next_start(&self) -> DateTime<Utc> {
        let mut last = self.last_start.lock().await;
        let now = Utc::now();
        let now = now
            .duration_trunc(ChronoDuration::milliseconds(1))
            .unwrap_or(now);
        let start = match *last {
            Some(prev) if now <= prev => prev + ChronoDuration::milliseconds(1),
            _ => now,
        };
        *last = Some(start);
        start
    }
}

struct Plan {
    collections: Vec<String>,
    formats: Vec<FormatKind>,
}

fn merge(log: &mut RunLog, outcome: ExportOutcome) {
    if !outcome.manifests.is_empty() {
        log.records_exported += outcome.record_count;
    }
    log.manifests.extend(outcome.manifests);
    log.errors.extend(outcome.errors);
}

fn dedup<T: Clone + Eq + std::hash::Hash>(items: Vec<T>) -> Vec<T> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Record, Value};
    use crate::retention::scan_tier;
    use crate::store::MemoryStore;
    use tempfile::TempDir;

    fn config(root: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.storage.root = root.to_path_buf();
        config.performance.page_size = 2;
        config.performance.retry_base_delay_ms = 1;
        config.performance.retry_max_delay_ms = 2;
        config
    }

    async fn store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for name in ["orders", "sessions", "users"] {
            let records = (0..3)
                .map(|i| Record::new(format!("{}-{}", name, i), Utc::now()).with_field("i", i as i64))
                .collect();
            store.insert_collection(name, records).await;
        }
        store
    }

    fn orchestrator(config: Config, store: Arc<MemoryStore>) -> Orchestrator {
        let logs = Arc::new(RunLogStore::new(&config.storage.root));
        Orchestrator::new(Arc::new(config), store, logs)
    }

    #[tokio::test]
    async fn test_exclude_list_is_subtracted() {
        let dir = TempDir::new().unwrap();
        let mut config = config(dir.path());
        config.collections.exclude = vec!["sessions".into()];
        let orch = orchestrator(config, store().await);

        let log = orch
            .run(BackupRequest::for_tier(Tier::Daily), CancellationToken::new())
            .await;
        assert_eq!(log.status, RunStatus::Success);
        assert_eq!(log.planned_collections, vec!["orders", "users"]);
        assert_eq!(log.manifests.len(), 6);
        assert_eq!(log.records_exported, 6);
        assert!(orch.logs().path_for(&log.run_id).exists());
    }

    #[tokio::test]
    async fn test_unknown_include_fails_before_export() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(config(dir.path()), store().await);
        let request = BackupRequest {
            collections: Some(vec!["ghost".into()]),
            ..BackupRequest::manual()
        };

        let log = orch.run(request, CancellationToken::new()).await;
        assert_eq!(log.status, RunStatus::Failed);
        assert_eq!(log.errors.len(), 1);
        assert!(log.errors[0].message.contains("ghost"));
        assert!(scan_tier(dir.path(), Tier::Manual).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_selection_fails() {
        let dir = TempDir::new().unwrap();
        let mut config = config(dir.path());
        config.collections.exclude = vec!["orders".into(), "sessions".into(), "users".into()];
        let orch = orchestrator(config, store().await);

        let log = orch
            .run(BackupRequest::for_tier(Tier::Daily), CancellationToken::new())
            .await;
        assert_eq!(log.status, RunStatus::Failed);
        assert_eq!(log.errors.len(), 1);
        assert!(log.errors[0].collection.is_none());
        assert!(log.planned_collections.is_empty());
        assert!(!dir.path().join("daily").exists());
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(config(dir.path()), store().await);
        let request = BackupRequest {
            dry_run: true,
            ..BackupRequest::for_tier(Tier::Daily)
        };

        let log = orch.run(request, CancellationToken::new()).await;
        assert_eq!(log.status, RunStatus::Success);
        assert!(log.dry_run);
        assert_eq!(log.planned_collections.len(), 3);
        assert!(log.manifests.is_empty());
        assert!(!dir.path().join("daily").exists());
        assert!(!orch.logs().path_for(&log.run_id).exists());
    }

    #[tokio::test]
    async fn test_collection_failures_are_isolated() {
        let dir = TempDir::new().unwrap();
        let store = store().await;
        store.deny_reads("sessions").await;
        store
            .insert_collection(
                "metrics",
                vec![Record::new("m", Utc::now()).with_field("v", Value::Float(f64::INFINITY))],
            )
            .await;
        let orch = orchestrator(config(dir.path()), store);

        let log = orch
            .run(BackupRequest::for_tier(Tier::Weekly), CancellationToken::new())
            .await;
        assert_eq!(log.status, RunStatus::PartialSuccess);
        assert_eq!(log.collections_attempted, 4);
        // sessions: one error; metrics: sql + xlsx errors, bson ok
        assert_eq!(log.errors.len(), 3);
        assert!(log
            .errors
            .iter()
            .any(|e| e.collection.as_deref() == Some("sessions") && e.format.is_none()));
        assert_eq!(log.succeeded_collections(), vec!["metrics", "orders", "users"]);
    }

    #[tokio::test]
    async fn test_run_ids_are_unique() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(config(dir.path()), store().await);
        let a = orch.next_start().await;
        let b = orch.next_start().await;
        assert!(b > a);
        assert_ne!(format_run_timestamp(&a), format_run_timestamp(&b));
    }

    #[tokio::test]
    async fn test_cancelled_run_is_marked() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(config(dir.path()), store().await);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let log = orch.run(BackupRequest::manual(), cancel).await;
        assert!(log.cancelled);
        assert_eq!(log.status, RunStatus::Failed);
        assert!(log.manifests.is_empty());
    }
}
