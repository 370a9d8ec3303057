//! Legacy-to-relational migration.
//!
//! Copies every record of a [`LegacyStore`] into a target store. The legacy
//! file is backed up before anything is read, each record is validated and
//! upserted independently under its per-id guard, and a final pass compares
//! every migrated record field by field. Re-running against the same target
//! leaves it unchanged.

use crate::legacy::LegacyStore;
use crate::{fsync_dir, InstanceStore, StoreError};
use roost_schema::Instance;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// A legacy record that could not be migrated.
#[derive(Debug)]
pub struct MigrationIssue {
    pub key: String,
    pub error: StoreError,
}

#[derive(Debug, Default)]
pub struct MigrationReport {
    pub total: usize,
    pub migrated: usize,
    /// Already present in the target with identical content.
    pub unchanged: usize,
    pub invalid: Vec<MigrationIssue>,
    /// Ids whose target record differs from the legacy one after the upsert.
    pub mismatched: Vec<String>,
    pub backup_path: Option<PathBuf>,
}

impl MigrationReport {
    pub fn is_clean(&self) -> bool {
        self.invalid.is_empty() && self.mismatched.is_empty()
    }

    /// Collapse a non-clean report into the matching error.
    pub fn into_result(self) -> Result<Self, StoreError> {
        if !self.invalid.is_empty() {
            return Err(StoreError::MigrationValidation {
                count: self.invalid.len(),
            });
        }
        if !self.mismatched.is_empty() {
            return Err(StoreError::MigrationMismatch {
                ids: self.mismatched,
            });
        }
        Ok(self)
    }
}

fn backup_legacy_file(path: &Path) -> Result<Option<PathBuf>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".backup.{timestamp}"));
    let backup = PathBuf::from(name);

    fs::copy(path, &backup)?;
    fs::File::open(&backup)?.sync_all()?;
    if let Some(dir) = backup.parent().filter(|p| !p.as_os_str().is_empty()) {
        fsync_dir(dir)?;
    }
    info!("backed up legacy store to {}", backup.display());
    Ok(Some(backup))
}

/// Upsert one validated record. Returns `true` when the target changed.
fn upsert(target: &dyn InstanceStore, instance: &Instance) -> Result<bool, StoreError> {
    let guard = target.lock(instance.id.as_str())?;
    if target.get(&instance.id)?.as_ref() == Some(instance) {
        return Ok(false);
    }
    target.put(&guard, instance)?;
    Ok(true)
}

/// Upsert every record, then read each one back and compare it field by field.
pub(crate) fn load_records(
    target: &dyn InstanceStore,
    records: &[Instance],
    report: &mut MigrationReport,
) -> Result<(), StoreError> {
    for instance in records {
        if upsert(target, instance)? {
            report.migrated += 1;
        } else {
            report.unchanged += 1;
        }
    }

    for instance in records {
        let stored = target.get(&instance.id)?;
        if stored.as_ref() != Some(instance) {
            warn!("migrated record '{}' does not match its source", instance.id);
            report.mismatched.push(instance.id.to_string());
        }
    }
    Ok(())
}

/// Migrate every legacy record into `target`.
///
/// Invalid records are reported and skipped; they never abort the run. Store
/// failures on the target abort with the error.
pub fn migrate_legacy(
    legacy: &LegacyStore,
    target: &dyn InstanceStore,
) -> Result<MigrationReport, StoreError> {
    let mut report = MigrationReport {
        backup_path: backup_legacy_file(legacy.path())?,
        ..MigrationReport::default()
    };

    let mut valid: Vec<Instance> = Vec::new();
    for entry in legacy.list_with_errors()? {
        report.total += 1;
        match entry {
            Ok(instance) => valid.push(instance),
            Err((key, error)) => {
                warn!("legacy record '{key}' failed validation: {error}");
                report.invalid.push(MigrationIssue { key, error });
            }
        }
    }

    load_records(target, &valid, &mut report)?;

    info!(
        "migrated {} record(s) into {} store: {} new, {} unchanged, {} invalid, {} mismatched",
        report.total,
        target.backend(),
        report.migrated,
        report.unchanged,
        report.invalid.len(),
        report.mismatched.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InstanceFilter, SqliteStore};
    use chrono::Utc;
    use roost_schema::{InstanceId, InstanceStatus, OperatorId, ResourceSpec};
    use std::time::Duration;

    fn sample(id: &str) -> Instance {
        Instance::new_pending(
            InstanceId::new(id),
            OperatorId::new("alice"),
            "box",
            ResourceSpec::new("alpine"),
            Utc::now(),
            None,
        )
    }

    #[test]
    fn empty_legacy_store_migrates_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = LegacyStore::open(dir.path().join("instances.json"), Duration::from_secs(1))
            .unwrap();
        let target =
            SqliteStore::open(dir.path().join("roost.db"), Duration::from_secs(1)).unwrap();
        let report = migrate_legacy(&legacy, &target).unwrap();
        assert_eq!(report.total, 0);
        assert!(report.backup_path.is_none());
        assert!(report.is_clean());
    }

    #[test]
    fn into_result_surfaces_invalid_records() {
        let report = MigrationReport {
            invalid: vec![MigrationIssue {
                key: "k".to_owned(),
                error: StoreError::NotFound("k".to_owned()),
            }],
            ..MigrationReport::default()
        };
        assert!(matches!(
            report.into_result(),
            Err(StoreError::MigrationValidation { count: 1 })
        ));
    }

    #[test]
    fn single_record_lands_in_target() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = LegacyStore::open(dir.path().join("instances.json"), Duration::from_secs(1))
            .unwrap();
        let mut inst = sample("aaaa0000");
        inst.succeed(InstanceStatus::Running, "created", Utc::now());
        let guard = legacy.lock("aaaa0000").unwrap();
        legacy.put(&guard, &inst).unwrap();
        drop(guard);

        let target =
            SqliteStore::open(dir.path().join("roost.db"), Duration::from_secs(1)).unwrap();
        assert!(!target.contains(&inst.id).unwrap());
        let report = migrate_legacy(&legacy, &target).unwrap();
        assert_eq!(report.migrated, 1);
        assert_eq!(target.get(&inst.id).unwrap(), Some(inst));
        assert_eq!(target.list(&InstanceFilter::all()).unwrap().len(), 1);
    }
}
