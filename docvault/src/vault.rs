//! Caller-facing entry points of the backup pipeline.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::catalog::Catalog;
use crate::config::Config;
use crate::orchestrator::{BackupRequest, Orchestrator};
use crate::restore::{RestoreEngine, RestoreRequest, RestoreResult};
use crate::retention::{ArtifactGroup, Tier};
use crate::runlog::{RunLog, RunLogStore, RunSummary};
use crate::scheduler::{Scheduler, TierStatus};
use crate::store::RecordStore;
use crate::utils::errors::Result;

pub struct Vault {
    config: Arc<Config>,
    scheduler: Arc<Scheduler>,
    restore: RestoreEngine,
    catalog: Arc<Catalog>,
}

impl Vault {
    /// Wire the pipeline together. Configuration errors surface here, before
    /// any backup I/O.
    pub async fn new(config: Config, store: Arc<dyn RecordStore>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let root = config.storage.root.clone();

        let logs = Arc::new(RunLogStore::new(&root));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&logs),
        ));
        let scheduler = Arc::new(Scheduler::new(&config, orchestrator)?);
        scheduler.seed_history(&logs.list().await?).await;

        let catalog = Arc::new(Catalog::new(root, logs));
        let restore = RestoreEngine::new(store, Arc::clone(&catalog));

        Ok(Self {
            config,
            scheduler,
            restore,
            catalog,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    /// Run a backup now. With a scheduled tier the run is pruned like a
    /// scheduled one and is refused while that tier is already running.
    pub async fn trigger_backup(&self, request: BackupRequest) -> Result<RunLog> {
        match request.tier {
            Some(tier) if tier.is_scheduled() => self.scheduler.trigger_tier(request).await,
            _ => Ok(self.scheduler.trigger_manual(request).await),
        }
    }

    pub async fn trigger_restore(&self, request: RestoreRequest) -> Result<RestoreResult> {
        self.restore.restore(&request).await
    }

    pub async fn list_history(&self) -> Result<Vec<RunSummary>> {
        self.catalog.list_history().await
    }

    pub async fn list_artifacts(&self, tier: Option<Tier>) -> Result<Vec<ArtifactGroup>> {
        self.catalog.list_artifacts(tier).await
    }

    pub async fn delete_backup(&self, backup_id: &str) -> Result<Vec<PathBuf>> {
        self.catalog.delete_backup(backup_id).await
    }

    pub async fn status(&self) -> Vec<TierStatus> {
        self.scheduler.status().await
    }

    /// Run the scheduler until `shutdown` fires.
    pub async fn run_scheduler(&self, shutdown: CancellationToken) {
        Arc::clone(&self.scheduler).run(shutdown).await;
    }
}
