//! End-to-end backup, retention and restore scenarios through the `Vault` facade.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use docvault::record::Document;
use docvault::retention::{scan_tier, ArtifactName};
use docvault::store::MemoryStore;
use docvault::{
    BackupRequest, Config, FormatKind, Record, RestoreRequest, RunStatus, Tier, Value, Vault,
    VaultError,
};
use tempfile::TempDir;

fn config(root: &Path) -> Config {
    let mut config = Config::default();
    config.storage.root = root.to_path_buf();
    config.performance.page_size = 2;
    config.performance.retry_base_delay_ms = 1;
    config.performance.retry_max_delay_ms = 2;
    config
}

fn user(id: &str, name: &str) -> Record {
    let ts = Utc.with_ymd_and_hms(2026, 9, 1, 12, 0, 0).unwrap();
    let mut address = Document::new();
    address.insert("city", "Lyon");
    address.insert("zip", 69001i64);
    Record::new(id, ts)
        .with_field("name", name)
        .with_field("age", 30i64)
        .with_field("address", Value::Object(address))
        .with_field("roles", Value::Array(vec![Value::from("admin"), Value::Null]))
}

async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store
        .insert_collection(
            "users",
            vec![user("u1", "Ada"), user("u2", "Grace"), user("u3", "Edsger")],
        )
        .await;
    store
}

#[tokio::test]
async fn daily_backup_of_three_records_in_every_format() {
    let dir = TempDir::new().unwrap();
    let vault = Vault::new(config(dir.path()), seeded_store().await)
        .await
        .unwrap();

    let log = vault
        .trigger_backup(BackupRequest::for_tier(Tier::Daily))
        .await
        .unwrap();

    assert_eq!(log.status, RunStatus::Success);
    assert_eq!(log.manifests.len(), 3);
    assert!(log.manifests.iter().all(|m| m.record_count == 3));
    assert_eq!(log.records_exported, 3);

    let files: Vec<String> = log
        .manifests
        .iter()
        .map(|m| m.path.file_name().unwrap().to_string_lossy().to_string())
        .collect();
    for format in FormatKind::ALL {
        let expected = ArtifactName::new("users", &log.run_id, format).file_name();
        assert!(files.contains(&expected), "missing {}", expected);
    }

    let history = vault.list_history().await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].run_id, log.run_id);
    assert_eq!(history[0].artifact_count, 3);
}

#[tokio::test]
async fn retention_keeps_the_two_most_recent_daily_runs() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path());
    config.tiers.daily.retention = Some(2);
    let vault = Vault::new(config, seeded_store().await).await.unwrap();

    let mut run_ids = Vec::new();
    for _ in 0..3 {
        let log = vault
            .trigger_backup(BackupRequest::for_tier(Tier::Daily))
            .await
            .unwrap();
        assert_eq!(log.status, RunStatus::Success);
        run_ids.push(log.run_id);
    }

    let groups = scan_tier(dir.path(), Tier::Daily).await.unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].run_timestamp, run_ids[2]);
    assert_eq!(groups[1].run_timestamp, run_ids[1]);
    assert!(groups.iter().all(|g| g.artifacts.len() == 3));
}

#[tokio::test]
async fn unknown_include_collection_fails_without_files() {
    let dir = TempDir::new().unwrap();
    let vault = Vault::new(config(dir.path()), seeded_store().await)
        .await
        .unwrap();

    let log = vault
        .trigger_backup(BackupRequest {
            collections: Some(vec!["does_not_exist".into()]),
            ..BackupRequest::manual()
        })
        .await
        .unwrap();

    assert_eq!(log.status, RunStatus::Failed);
    assert_eq!(log.errors.len(), 1);
    assert!(log.errors[0].message.contains("does_not_exist"));
    assert!(vault.list_artifacts(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn format_error_yields_partial_success() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store().await;
    store
        .insert_collection(
            "readings",
            vec![Record::new("r1", Utc::now()).with_field("value", Value::Float(f64::NAN))],
        )
        .await;
    let vault = Vault::new(config(dir.path()), store).await.unwrap();

    let log = vault
        .trigger_backup(BackupRequest {
            formats: Some(vec![FormatKind::Sql]),
            ..BackupRequest::manual()
        })
        .await
        .unwrap();

    assert_eq!(log.status, RunStatus::PartialSuccess);
    assert_eq!(log.succeeded_collections(), vec!["users"]);
    assert_eq!(log.errors.len(), 1);
    assert_eq!(log.errors[0].collection.as_deref(), Some("readings"));
}

#[tokio::test]
async fn restore_into_empty_collection_then_again_reports_duplicates() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store().await;
    let vault = Vault::new(config(dir.path()), store.clone()).await.unwrap();

    let log = vault
        .trigger_backup(BackupRequest {
            formats: Some(vec![FormatKind::Bson]),
            ..BackupRequest::for_tier(Tier::Weekly)
        })
        .await
        .unwrap();
    let backup_id = format!("weekly/users_{}", log.run_id);
    let request = RestoreRequest {
        backup_id,
        target_collection: Some("users_restored".into()),
        ..Default::default()
    };

    let first = vault.trigger_restore(request.clone()).await.unwrap();
    assert_eq!(first.format, FormatKind::Bson);
    assert_eq!(first.written, 3);
    assert!(first.failures.is_empty());
    assert_eq!(
        store.records("users_restored").await,
        store.records("users").await
    );

    let second = vault.trigger_restore(request).await.unwrap();
    assert_eq!(second.written, 0);
    assert_eq!(second.failed, 3);
    let ids: Vec<&str> = second.failures.iter().map(|f| f.id.as_str()).collect();
    assert_eq!(ids, vec!["u1", "u2", "u3"]);
}

#[tokio::test]
async fn relational_dump_restores_with_widening_only() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store().await;
    let vault = Vault::new(config(dir.path()), store.clone()).await.unwrap();

    let log = vault
        .trigger_backup(BackupRequest {
            formats: Some(vec![FormatKind::Sql]),
            ..BackupRequest::manual()
        })
        .await
        .unwrap();
    let result = vault
        .trigger_restore(RestoreRequest {
            backup_id: format!("manual/users_{}", log.run_id),
            target_collection: Some("copy".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(result.format, FormatKind::Sql);
    assert_eq!(store.records("copy").await, store.records("users").await);
}

#[tokio::test]
async fn delete_backup_then_not_found() {
    let dir = TempDir::new().unwrap();
    let vault = Vault::new(config(dir.path()), seeded_store().await)
        .await
        .unwrap();
    let log = vault.trigger_backup(BackupRequest::manual()).await.unwrap();
    let id = format!("manual/users_{}", log.run_id);

    assert_eq!(vault.delete_backup(&id).await.unwrap().len(), 3);
    assert!(matches!(
        vault.delete_backup(&id).await,
        Err(VaultError::NotFound(_))
    ));
    assert!(matches!(
        vault
            .trigger_restore(RestoreRequest {
                backup_id: id,
                ..Default::default()
            })
            .await,
        Err(VaultError::NotFound(_))
    ));
}

#[tokio::test]
async fn tier_does_not_overlap_with_itself() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store().await;
    store.set_page_delay(Duration::from_millis(200)).await;
    let vault = Arc::new(Vault::new(config(dir.path()), store).await.unwrap());

    let running = {
        let vault = Arc::clone(&vault);
        tokio::spawn(async move {
            vault
                .trigger_backup(BackupRequest::for_tier(Tier::Monthly))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let scheduler = vault.scheduler();
    assert!(scheduler.fire(Tier::Monthly).await.is_none());
    assert!(matches!(
        vault
            .trigger_backup(BackupRequest::for_tier(Tier::Monthly))
            .await,
        Err(VaultError::TierBusy(_))
    ));

    let log = running.await.unwrap().unwrap();
    assert_eq!(log.status, RunStatus::Success);

    let status = vault.status().await;
    let monthly = status.iter().find(|s| s.tier == Tier::Monthly).unwrap();
    assert_eq!(monthly.last_status, Some(RunStatus::Success));
    assert!(monthly.next_run.is_some());
    assert!(!monthly.running);
}

#[tokio::test]
async fn invalid_schedule_is_rejected_at_startup() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path());
    config.tiers.weekly.schedule = Some("61 * * * *".into());
    let err = Vault::new(config, seeded_store().await)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, VaultError::Configuration(_)));
}

#[tokio::test]
async fn cancel_mid_run_keeps_finished_collections() {
    let dir = TempDir::new().unwrap();
    let store = seeded_store().await;
    for name in ["orders", "sessions"] {
        let records = (0..5)
            .map(|i| Record::new(format!("{}-{}", name, i), Utc::now()).with_field("i", i as i64))
            .collect();
        store.insert_collection(name, records).await;
    }
    store.set_page_delay(Duration::from_millis(100)).await;
    let mut config = config(dir.path());
    config.performance.workers = 1;
    let vault = Arc::new(Vault::new(config, store).await.unwrap());

    let running = {
        let vault = Arc::clone(&vault);
        tokio::spawn(async move { vault.trigger_backup(BackupRequest::manual()).await })
    };

    // wait until the first collection has all of its artifacts
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let groups = scan_tier(dir.path(), Tier::Manual).await.unwrap();
            if groups.iter().any(|g| g.artifacts.len() == FormatKind::ALL.len()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    vault.scheduler().cancel_runs();

    let log = running.await.unwrap().unwrap();
    assert!(log.cancelled);
    assert_eq!(log.status, RunStatus::PartialSuccess);
    assert!(log.errors.is_empty());
    assert_eq!(log.succeeded_collections().len(), 1);
    assert_eq!(log.manifests.len(), FormatKind::ALL.len());
    assert!(log.manifests.iter().all(|m| m.path.exists()));

    let history = vault.list_history().await.unwrap();
    assert_eq!(history[0].run_id, log.run_id);
    assert!(history[0].cancelled);
}
