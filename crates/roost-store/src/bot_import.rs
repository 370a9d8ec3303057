//! Import of the instance records kept by the Discord bot Roost replaces.
//!
//! The bot keyed each container by its `eaglenode-<name>-<owner_id>` name and
//! kept `owner_id`, `image`, a naive UTC `created_at`, the engine's
//! `container_id` and `short_id`, plus a free-form `meta` that is not carried
//! over. Two dumps of that state are read: a JSON object keyed by container
//! name, and the `vps` table written by the bot's own SQLite migration.
//!
//! Every mappable record becomes a running instance without expiry. Its id is
//! derived from the container name, so importing the same dump again leaves
//! the target unchanged. Records that cannot be mapped are reported in
//! [`MigrationReport::invalid`] and never abort the run.

use crate::migration::{load_records, MigrationIssue, MigrationReport};
use crate::{validate_record, InstanceFilter, InstanceStore, StoreError};
use chrono::{DateTime, NaiveDateTime, Utc};
use roost_schema::{
    EngineRef, Instance, InstanceId, InstanceStatus, OperatorId, ResourceSpec, Transition,
};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

const CONTAINER_PREFIX: &str = "eaglenode-";
const IMPORTED_ID_LEN: usize = 16;
const IMPORT_REASON: &str = "imported from bot state";

/// On-disk shape of a bot state dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotDumpFormat {
    /// JSON object mapping container name to record.
    Json,
    /// SQLite database holding the bot's `vps` table.
    Sqlite,
}

/// One bot record as dumped, before mapping.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct BotRecord {
    /// Discord user id, dumped as a number or a string.
    #[serde(default)]
    pub owner_id: Option<serde_json::Value>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub short_id: Option<String>,
}

type DumpEntry = (String, Result<BotRecord, StoreError>);

fn unmappable(key: &str, reason: impl Into<String>) -> StoreError {
    StoreError::Unmappable {
        key: key.to_owned(),
        reason: reason.into(),
    }
}

/// Stable instance id for the bot container `key`.
pub fn imported_id(key: &str) -> InstanceId {
    let hex = blake3::hash(format!("bot:{key}").as_bytes()).to_hex();
    InstanceId::new(&hex.as_str()[..IMPORTED_ID_LEN])
}

/// The name the operator originally chose, recovered from the container name.
fn instance_name<'a>(key: &'a str, owner: &str) -> &'a str {
    let base = key.strip_prefix(CONTAINER_PREFIX).unwrap_or(key);
    base.strip_suffix(owner)
        .and_then(|b| b.strip_suffix('-'))
        .filter(|b| !b.is_empty())
        .unwrap_or(base)
}

/// The bot wrote `datetime.utcnow().isoformat()`: no offset, optional fraction.
fn parse_bot_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|t| t.and_utc())
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|t| t.with_timezone(&Utc))
        })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

impl BotRecord {
    /// Map the record stored under container name `key` onto an [`Instance`].
    pub fn into_instance(self, key: &str) -> Result<Instance, StoreError> {
        let owner = match &self.owner_id {
            Some(serde_json::Value::Number(n)) => n.to_string(),
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s.trim().to_owned(),
            _ => return Err(unmappable(key, "missing owner_id")),
        };
        let image = non_blank(self.image).ok_or_else(|| unmappable(key, "missing image"))?;
        let raw_time =
            non_blank(self.created_at).ok_or_else(|| unmappable(key, "missing created_at"))?;
        let created_at = parse_bot_time(&raw_time)
            .ok_or_else(|| unmappable(key, format!("unparseable created_at '{raw_time}'")))?;
        let engine_ref = non_blank(self.container_id)
            .or_else(|| non_blank(self.short_id))
            .ok_or_else(|| unmappable(key, "no container_id or short_id"))?;

        let instance = Instance {
            id: imported_id(key),
            name: instance_name(key, &owner).to_owned(),
            owner: OperatorId::new(owner),
            engine_ref: Some(EngineRef::new(engine_ref)),
            status: InstanceStatus::Running,
            created_at,
            updated_at: created_at,
            expires_at: None,
            resource_spec: ResourceSpec::new(image),
            last_error: None,
            last_action: None,
            transitions: vec![Transition {
                from: None,
                to: InstanceStatus::Running,
                at: created_at,
                reason: IMPORT_REASON.to_owned(),
            }],
        };
        validate_record(&instance)?;
        Ok(instance)
    }
}

fn read_json_dump(path: &Path) -> Result<Vec<DumpEntry>, StoreError> {
    let content = fs::read_to_string(path)?;
    let entries: BTreeMap<String, serde_json::Value> = serde_json::from_str(&content)?;
    Ok(entries
        .into_iter()
        .map(|(key, value)| {
            let record = serde_json::from_value(value).map_err(StoreError::from);
            (key, record)
        })
        .collect())
}

fn owner_column(value: ValueRef<'_>) -> Option<serde_json::Value> {
    match value {
        ValueRef::Integer(i) => Some(serde_json::Value::from(i)),
        ValueRef::Text(t) => Some(serde_json::Value::String(
            String::from_utf8_lossy(t).into_owned(),
        )),
        _ => None,
    }
}

fn read_sqlite_dump(path: &Path) -> Result<Vec<DumpEntry>, StoreError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let mut stmt = conn.prepare(
        "SELECT name, owner_id, image, created_at, container_id, short_id FROM vps ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| {
        let record = BotRecord {
            owner_id: owner_column(row.get_ref(1)?),
            image: row.get(2)?,
            created_at: row.get(3)?,
            container_id: row.get(4)?,
            short_id: row.get(5)?,
        };
        Ok((row.get::<_, String>(0)?, record))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (key, record) = row?;
        out.push((key, Ok(record)));
    }
    Ok(out)
}

/// Whether `instance` would duplicate an active name its owner already holds.
fn name_taken(
    target: &dyn InstanceStore,
    instance: &Instance,
    batch: &HashSet<(OperatorId, String)>,
) -> Result<bool, StoreError> {
    if batch.contains(&(instance.owner.clone(), instance.name.clone())) {
        return Ok(true);
    }
    Ok(target
        .list(&InstanceFilter::owned_by(instance.owner.clone()))?
        .iter()
        .any(|other| other.name == instance.name && other.id != instance.id))
}

/// Import every record of the bot dump at `path` into `target`.
///
/// A dump that cannot be read at all aborts with the error. Individual
/// records that fail to map, validate, or that collide with an owner's
/// existing instance name land in the report.
pub fn import_bot_state(
    path: &Path,
    format: BotDumpFormat,
    target: &dyn InstanceStore,
) -> Result<MigrationReport, StoreError> {
    let entries = match format {
        BotDumpFormat::Json => read_json_dump(path)?,
        BotDumpFormat::Sqlite => read_sqlite_dump(path)?,
    };

    let mut report = MigrationReport::default();
    let mut valid: Vec<Instance> = Vec::new();
    let mut names = HashSet::new();
    for (key, record) in entries {
        report.total += 1;
        let mapped = record.and_then(|r| r.into_instance(&key)).and_then(|inst| {
            if name_taken(target, &inst, &names)? {
                Err(unmappable(
                    &key,
                    format!("owner {} already has an instance named '{}'", inst.owner, inst.name),
                ))
            } else {
                Ok(inst)
            }
        });
        match mapped {
            Ok(instance) => {
                names.insert((instance.owner.clone(), instance.name.clone()));
                valid.push(instance);
            }
            Err(error) => {
                warn!("bot record '{key}' cannot be imported: {error}");
                report.invalid.push(MigrationIssue { key, error });
            }
        }
    }

    load_records(target, &valid, &mut report)?;

    info!(
        "imported {} bot record(s) into {} store: {} new, {} unchanged, {} invalid, {} mismatched",
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

    fn record(owner: serde_json::Value) -> BotRecord {
        BotRecord {
            owner_id: Some(owner),
            image: Some("ubuntu:22.04".to_owned()),
            created_at: Some("2024-05-01T12:30:45.123456".to_owned()),
            container_id: Some("3f2a9c0d1e7b".repeat(4)),
            short_id: Some("3f2a9c0d1e".to_owned()),
        }
    }

    #[test]
    fn name_is_recovered_from_container_name() {
        assert_eq!(instance_name("eaglenode-web-123456", "123456"), "web");
        assert_eq!(instance_name("eaglenode-my-box-42", "42"), "my-box");
        assert_eq!(instance_name("eaglenode-web", "42"), "web");
        assert_eq!(instance_name("custom", "42"), "custom");
        assert_eq!(instance_name("eaglenode--42", "42"), "-42");
    }

    #[test]
    fn naive_and_offset_timestamps_parse_as_utc() {
        let at = parse_bot_time("2024-05-01T12:30:45.123456").unwrap();
        assert_eq!(at.to_rfc3339(), "2024-05-01T12:30:45.123456+00:00");
        assert!(parse_bot_time("2024-05-01T12:30:45").is_some());
        let at = parse_bot_time("2024-05-01T14:30:45+02:00").unwrap();
        assert_eq!(at.format("%H:%M").to_string(), "12:30");
        assert!(parse_bot_time("yesterday").is_none());
    }

    #[test]
    fn record_maps_onto_running_instance() {
        let inst = record(serde_json::json!(331_234_567_890_123_456_u64))
            .into_instance("eaglenode-web-331234567890123456")
            .unwrap();
        assert_eq!(inst.owner.as_str(), "331234567890123456");
        assert_eq!(inst.name, "web");
        assert_eq!(inst.status, InstanceStatus::Running);
        assert_eq!(inst.expires_at, None);
        assert_eq!(inst.resource_spec.image, "ubuntu:22.04");
        assert_eq!(
            inst.engine_ref.as_ref().map(EngineRef::as_str),
            Some("3f2a9c0d1e7b".repeat(4).as_str())
        );
        assert_eq!(inst.id, imported_id("eaglenode-web-331234567890123456"));
        assert_eq!(inst.id.len(), IMPORTED_ID_LEN);
    }

    #[test]
    fn short_id_stands_in_for_missing_container_id() {
        let mut rec = record(serde_json::json!("42"));
        rec.container_id = None;
        let inst = rec.into_instance("eaglenode-db-42").unwrap();
        assert_eq!(
            inst.engine_ref.as_ref().map(EngineRef::as_str),
            Some("3f2a9c0d1e")
        );
    }

    #[test]
    fn unmappable_records_are_errors() {
        let key = "eaglenode-x-1";
        let mut rec = record(serde_json::json!(1));
        rec.owner_id = None;
        assert!(matches!(rec.into_instance(key), Err(StoreError::Unmappable { .. })));

        let mut rec = record(serde_json::json!(1));
        rec.created_at = Some("last tuesday".to_owned());
        assert!(matches!(rec.into_instance(key), Err(StoreError::Unmappable { .. })));

        let mut rec = record(serde_json::json!(1));
        rec.container_id = None;
        rec.short_id = Some("  ".to_owned());
        assert!(matches!(rec.into_instance(key), Err(StoreError::Unmappable { .. })));

        let rec = record(serde_json::json!(1));
        assert!(matches!(
            rec.into_instance("eaglenode-caf\u{e9}-1"),
            Err(StoreError::InvalidRecord { .. })
        ));
    }
}
