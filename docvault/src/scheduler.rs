//! Tier scheduler.
//!
//! Each scheduled tier carries a parsed cron schedule. The loop computes the
//! next fire time of every enabled tier, sleeps until the earliest one and
//! starts the due runs. A tier never runs concurrently with itself: a trigger
//! that fires while the previous run of the same tier is still going is
//! skipped. Different tiers may run at the same time.
//!
//! Every run is tracked. Stopping the loop cancels the runs in flight and
//! waits for them, so each one still finalizes and persists its run log.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use croner::Cron;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config::{Config, TierSettings};
use crate::orchestrator::{BackupRequest, Orchestrator};
use crate::retention::Tier;
use crate::runlog::{RunLog, RunStatus};
use crate::utils::errors::{Result, VaultError};

/// A parsed five-field cron expression.
pub struct Schedule {
    expression: String,
    cron: Cron,
}

impl Schedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let cron = Cron::new(expression).parse().map_err(|e| {
            VaultError::Configuration(format!("invalid schedule '{}': {}", expression, e))
        })?;
        Ok(Self {
            expression: expression.to_string(),
            cron,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cron.find_next_occurrence(after, false).ok()
    }
}

/// Caller-facing view of one tier.
#[derive(Debug, Clone, Serialize)]
pub struct TierStatus {
    pub tier: Tier,
    pub enabled: bool,
    pub schedule: String,
    pub retention: usize,
    pub running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub last_status: Option<RunStatus>,
    pub next_run: Option<DateTime<Utc>>,
}

struct TierSlot {
    settings: TierSettings,
    schedule: Option<Schedule>,
    last_run: Option<DateTime<Utc>>,
    last_status: Option<RunStatus>,
}

/// Marks a tier as running; removing the mark on drop keeps the set correct
/// even if the run panics.
struct RunningGuard {
    running: Arc<StdMutex<HashSet<Tier>>>,
    tier: Tier,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        lock(&self.running).remove(&self.tier);
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    slots: Mutex<BTreeMap<Tier, TierSlot>>,
    running: Arc<StdMutex<HashSet<Tier>>>,
    /// Parent of every run's token; replaced after each `cancel_runs`.
    cancel: StdMutex<CancellationToken>,
    runs: TaskTracker,
}

impl Scheduler {
    /// Build a scheduler for the scheduled tiers of `config`. Fails on an
    /// unparsable schedule of an enabled tier.
    pub fn new(config: &Config, orchestrator: Arc<Orchestrator>) -> Result<Self> {
        let mut slots = BTreeMap::new();
        for tier in Tier::SCHEDULED {
            let settings = config.tier(tier);
            let schedule = if settings.enabled {
                Some(Schedule::parse(&settings.schedule)?)
            } else {
                None
            };
            slots.insert(
                tier,
                TierSlot {
                    settings,
                    schedule,
                    last_run: None,
                    last_status: None,
                },
            );
        }
        Ok(Self {
            orchestrator,
            slots: Mutex::new(slots),
            running: Arc::new(StdMutex::new(HashSet::new())),
            cancel: StdMutex::new(CancellationToken::new()),
            runs: TaskTracker::new(),
        })
    }

    /// Seed last-run information from earlier run logs (newest first).
    pub async fn seed_history(&self, logs: &[RunLog]) {
        let mut slots = self.slots.lock().await;
        for log in logs {
            if let Some(slot) = slots.get_mut(&log.tier) {
                if slot.last_run.is_none() {
                    slot.last_run = Some(log.started_at);
                    slot.last_status = Some(log.status);
                }
            }
        }
    }

    /// Next fire time of every enabled tier, strictly after `now`.
    pub async fn next_fire_times(&self, now: DateTime<Utc>) -> Vec<(Tier, DateTime<Utc>)> {
        let slots = self.slots.lock().await;
        slots
            .iter()
            .filter_map(|(tier, slot)| {
                let schedule = slot.schedule.as_ref()?;
                Some((*tier, schedule.next_after(&now)?))
            })
            .collect()
    }

    pub fn is_running(&self, tier: Tier) -> bool {
        lock(&self.running).contains(&tier)
    }

    /// Drive scheduled runs until `shutdown` is cancelled. In-flight runs are
    /// then cancelled cooperatively and awaited before this returns.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Scheduler started");
        self.runs.reopen();
        let mut cursor = Utc::now();
        loop {
            let now = Utc::now().max(cursor);
            let upcoming = self.next_fire_times(now).await;
            let Some(when) = upcoming.iter().map(|(_, at)| *at).min() else {
                info!("No tier is enabled, scheduler idle");
                shutdown.cancelled().await;
                break;
            };
            let due: Vec<Tier> = upcoming
                .iter()
                .filter(|(_, at)| *at == when)
                .map(|(tier, _)| *tier)
                .collect();

            let wait = (when - Utc::now()).to_std().unwrap_or_default();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            cursor = when;

            for tier in due {
                let this = Arc::clone(&self);
                self.runs.spawn(async move {
                    this.fire(tier).await;
                });
            }
        }

        self.cancel_runs();
        self.runs.close();
        if !self.runs.is_empty() {
            info!(runs = self.runs.len(), "Waiting for in-flight runs to finish");
        }
        self.runs.wait().await;
        info!("Scheduler stopped");
    }

    /// A schedule trigger for `tier`. Returns `None` when skipped because the
    /// previous run of the tier is still in progress.
    pub async fn fire(&self, tier: Tier) -> Option<RunLog> {
        let _tracked = self.runs.token();
        let Some(guard) = self.try_claim(tier) else {
            warn!(tier = %tier, "Skipping scheduled run: tier already running");
            return None;
        };
        info!(tier = %tier, "Starting scheduled backup");
        let log = self
            .orchestrator
            .run(BackupRequest::for_tier(tier), self.run_token())
            .await;
        drop(guard);
        self.record(&log).await;
        if log.status == RunStatus::Failed {
            error!(tier = %tier, run_id = %log.run_id, "Scheduled backup failed");
        }
        Some(log)
    }

    /// Explicit run of a tier outside its schedule: tier semantics and
    /// pruning apply, the schedule is unaffected.
    pub async fn trigger_tier(&self, request: BackupRequest) -> Result<RunLog> {
        let tier = request.tier.unwrap_or(Tier::Manual);
        if !tier.is_scheduled() {
            return Ok(self.trigger_manual(request).await);
        }
        let guard = self
            .try_claim(tier)
            .ok_or_else(|| VaultError::TierBusy(tier.to_string()))?;
        let _tracked = self.runs.token();
        let log = self.orchestrator.run(request, self.run_token()).await;
        drop(guard);
        if !log.dry_run {
            self.record(&log).await;
        }
        Ok(log)
    }

    /// Ad-hoc run without tier semantics: written under `manual/`, never pruned.
    pub async fn trigger_manual(&self, mut request: BackupRequest) -> RunLog {
        request.tier = None;
        let _tracked = self.runs.token();
        self.orchestrator.run(request, self.run_token()).await
    }

    pub async fn status(&self) -> Vec<TierStatus> {
        let now = Utc::now();
        let slots = self.slots.lock().await;
        slots
            .iter()
            .map(|(tier, slot)| TierStatus {
                tier: *tier,
                enabled: slot.settings.enabled,
                schedule: slot.settings.schedule.clone(),
                retention: slot.settings.retention,
                running: self.is_running(*tier),
                last_run: slot.last_run,
                last_status: slot.last_status,
                next_run: slot.schedule.as_ref().and_then(|s| s.next_after(&now)),
            })
            .collect()
    }

    /// Cancel every run currently in flight. Runs started afterwards are
    /// unaffected.
    pub fn cancel_runs(&self) {
        let mut current = lock(&self.cancel);
        current.cancel();
        *current = CancellationToken::new();
    }

    fn run_token(&self) -> CancellationToken {
        lock(&self.cancel).child_token()
    }

    fn try_claim(&self, tier: Tier) -> Option<RunningGuard> {
        let mut running = lock(&self.running);
        if !running.insert(tier) {
            return None;
        }
        Some(RunningGuard {
            running: Arc::clone(&self.running),
            tier,
        })
    }

    async fn record(&self, log: &RunLog) {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get_mut(&log.tier) {
            slot.last_run = Some(log.started_at);
            slot.last_status = Some(log.status);
        }
    }
}
