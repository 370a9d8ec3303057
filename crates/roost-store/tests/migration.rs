//! Legacy JSON collection to SQLite migration.

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use roost_schema::{
    Instance, InstanceId, InstanceStatus, LifecycleAction, OperatorId, ResourceSpec,
};
use roost_store::{
    migrate_legacy, InstanceFilter, InstanceStore, LegacyStore, SqliteStore, StoreError,
};
use std::fs;
use std::path::Path;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(2);

fn record(i: usize) -> Instance {
    let created = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::minutes(i as i64);
    let mut spec = ResourceSpec::new("ubuntu:22.04");
    spec.memory_mb = Some(256 + i as u64);
    spec.env.insert("WELCOME_MESSAGE".to_owned(), format!("vps {i}"));
    let mut inst = Instance::new_pending(
        InstanceId::new(format!("{i:016x}")),
        OperatorId::new(format!("user{}", i % 3)),
        &format!("vps-{i}"),
        spec,
        created,
        Some(created + ChronoDuration::days(7)),
    );
    let later = created + ChronoDuration::seconds(5);
    match i % 4 {
        0 => inst.succeed(InstanceStatus::Running, "created", later),
        1 => {
            inst.succeed(InstanceStatus::Running, "created", later);
            inst.succeed(InstanceStatus::Stopped, "stopped", later);
        }
        2 => inst.fail(LifecycleAction::Create, "pull failed", later),
        _ => inst.succeed(InstanceStatus::Removed, "deleted", later),
    }
    inst
}

fn legacy_with(dir: &Path, n: usize) -> LegacyStore {
    let legacy = LegacyStore::open(dir.join("instances.json"), TIMEOUT).unwrap();
    for i in 0..n {
        let inst = record(i);
        let guard = legacy.lock(inst.id.as_str()).unwrap();
        legacy.put(&guard, &inst).unwrap();
    }
    legacy
}

#[test]
fn migrates_every_record_field_for_field() {
    let dir = tempfile::tempdir().unwrap();
    let legacy = legacy_with(dir.path(), 12);
    let target = SqliteStore::open(dir.path().join("roost.db"), TIMEOUT).unwrap();

    let report = migrate_legacy(&legacy, &target).unwrap();
    assert_eq!(report.total, 12);
    assert_eq!(report.migrated, 12);
    assert_eq!(report.unchanged, 0);
    assert!(report.is_clean(), "{report:?}");

    let source = legacy.list(&InstanceFilter::all()).unwrap();
    let migrated = target.list(&InstanceFilter::all()).unwrap();
    assert_eq!(source, migrated);
}

#[test]
fn rerun_leaves_target_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let legacy = legacy_with(dir.path(), 5);
    let target = SqliteStore::open(dir.path().join("roost.db"), TIMEOUT).unwrap();

    migrate_legacy(&legacy, &target).unwrap();
    let before = target.list(&InstanceFilter::all()).unwrap();

    let report = migrate_legacy(&legacy, &target).unwrap();
    assert_eq!(report.migrated, 0);
    assert_eq!(report.unchanged, 5);
    assert!(report.is_clean());
    assert_eq!(target.list(&InstanceFilter::all()).unwrap(), before);
}

#[test]
fn backup_is_written_before_migration() {
    let dir = tempfile::tempdir().unwrap();
    let legacy = legacy_with(dir.path(), 2);
    let original = fs::read(legacy.path()).unwrap();
    let target = SqliteStore::open(dir.path().join("roost.db"), TIMEOUT).unwrap();

    let report = migrate_legacy(&legacy, &target).unwrap();
    let backup = report.backup_path.expect("backup path");
    assert!(backup
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("instances.json.backup."));
    assert_eq!(fs::read(backup).unwrap(), original);
}

#[test]
fn invalid_records_are_reported_and_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let legacy = legacy_with(dir.path(), 3);

    let mut doc: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(legacy.path()).unwrap()).unwrap();
    let mut broken = doc["instances"][format!("{:016x}", 0)].clone();
    broken["id"] = serde_json::json!("ffffffffffffffff");
    broken["engine_ref"] = serde_json::Value::Null;
    doc["instances"]["ffffffffffffffff"] = broken;
    doc["instances"]["mislabelled"] = doc["instances"][format!("{:016x}", 1)].clone();
    fs::write(legacy.path(), serde_json::to_string_pretty(&doc).unwrap()).unwrap();

    let target = SqliteStore::open(dir.path().join("roost.db"), TIMEOUT).unwrap();
    let report = migrate_legacy(&legacy, &target).unwrap();
    assert_eq!(report.total, 5);
    assert_eq!(report.migrated, 3);
    assert_eq!(report.invalid.len(), 2);
    assert!(!report.is_clean());

    let keys: Vec<&str> = report.invalid.iter().map(|i| i.key.as_str()).collect();
    assert!(keys.contains(&"ffffffffffffffff"));
    assert!(keys.contains(&"mislabelled"));
    assert!(!target
        .contains(&InstanceId::new("ffffffffffffffff"))
        .unwrap());

    assert!(matches!(
        report.into_result(),
        Err(StoreError::MigrationValidation { count: 2 })
    ));
}

#[test]
fn migration_into_partially_populated_target_overwrites_stale_rows() {
    let dir = tempfile::tempdir().unwrap();
    let legacy = legacy_with(dir.path(), 4);
    let target = SqliteStore::open(dir.path().join("roost.db"), TIMEOUT).unwrap();

    let mut stale = record(0);
    stale.last_error = Some("stale".to_owned());
    stale.succeed(InstanceStatus::Stopped, "out of date", Utc::now());
    let guard = target.lock(stale.id.as_str()).unwrap();
    target.put(&guard, &stale).unwrap();
    drop(guard);

    let report = migrate_legacy(&legacy, &target).unwrap();
    assert_eq!(report.migrated, 4);
    assert!(report.is_clean());
    assert_eq!(
        target.get(&stale.id).unwrap().unwrap(),
        legacy.get(&stale.id).unwrap().unwrap()
    );
}
