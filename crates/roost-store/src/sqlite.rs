//! Relational backend on a single SQLite file.
//!
//! One row per instance in `instances`, the status history in `transitions`
//! keyed by `(instance_id, seq)`, and a `schema_meta` row carrying the schema
//! version. Each `put` replaces the row and its history in one transaction.

use crate::locks::{IdGuard, IdLocks};
use crate::{
    check_guard, lock_dir_for, sort_instances, validate_record, InstanceFilter, InstanceStore,
    StoreError,
};
use chrono::{DateTime, SecondsFormat, Utc};
use roost_schema::{
    EngineRef, Instance, InstanceId, InstanceStatus, LifecycleAction, OperatorId, ResourceSpec,
    Transition,
};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

const SCHEMA_VERSION: u32 = 1;
const BUSY_TIMEOUT_MS: u32 = 5000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS instances (
    id            TEXT PRIMARY KEY,
    owner         TEXT NOT NULL,
    name          TEXT NOT NULL,
    engine_ref    TEXT,
    status        TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    expires_at    TEXT,
    resource_spec TEXT NOT NULL,
    last_error    TEXT,
    last_action   TEXT
);
CREATE INDEX IF NOT EXISTS idx_instances_owner ON instances(owner);
CREATE INDEX IF NOT EXISTS idx_instances_status ON instances(status);
CREATE TABLE IF NOT EXISTS transitions (
    instance_id TEXT NOT NULL REFERENCES instances(id),
    seq         INTEGER NOT NULL,
    from_status TEXT,
    to_status   TEXT NOT NULL,
    at          TEXT NOT NULL,
    reason      TEXT NOT NULL,
    PRIMARY KEY (instance_id, seq)
);
";

const SELECT_INSTANCE: &str = "SELECT id, owner, name, engine_ref, status, created_at, updated_at, \
     expires_at, resource_spec, last_error, last_action FROM instances";

pub struct SqliteStore {
    path: PathBuf,
    conn: Mutex<Connection>,
    locks: IdLocks,
    read_only: bool,
}

impl SqliteStore {
    /// Open or create the database at `path`, applying the schema.
    pub fn open(path: impl Into<PathBuf>, lock_timeout: Duration) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS)?;
        conn.execute_batch(SCHEMA)?;
        check_schema_version(&conn, true)?;
        let locks = IdLocks::shared(lock_dir_for(&path), lock_timeout)?;
        debug!("opened sqlite store at {}", path.display());

        Ok(Self {
            path,
            conn: Mutex::new(conn),
            locks,
            read_only: false,
        })
    }

    /// Open an existing database for reading only. Every `put` fails with
    /// [`StoreError::ReadOnly`], so its guards never leave this handle.
    pub fn open_read_only(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS)?;
        check_schema_version(&conn, false)?;

        Ok(Self {
            path,
            conn: Mutex::new(conn),
            locks: IdLocks::new(Duration::ZERO),
            read_only: true,
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_transitions(conn: &Connection, id: &str) -> Result<Vec<Transition>, StoreError> {
        let mut stmt = conn.prepare_cached(
            "SELECT from_status, to_status, at, reason FROM transitions \
             WHERE instance_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let corrupt = |reason: String| StoreError::Corrupt {
            id: id.to_owned(),
            reason,
        };
        let mut out = Vec::new();
        for row in rows {
            let (from, to, at, reason) = row?;
            out.push(Transition {
                from: from
                    .as_deref()
                    .map(parse_status)
                    .transpose()
                    .map_err(corrupt)?,
                to: parse_status(&to).map_err(corrupt)?,
                at: parse_time(&at).map_err(corrupt)?,
                reason,
            });
        }
        Ok(out)
    }

    fn load(conn: &Connection, raw: RawRow) -> Result<Instance, StoreError> {
        let transitions = Self::load_transitions(conn, &raw.id)?;
        let id = raw.id.clone();
        raw.into_instance(transitions)
            .map_err(|reason| StoreError::Corrupt { id, reason })
    }
}

/// Columns of one `instances` row before decoding.
struct RawRow {
    id: String,
    owner: String,
    name: String,
    engine_ref: Option<String>,
    status: String,
    created_at: String,
    updated_at: String,
    expires_at: Option<String>,
    resource_spec: String,
    last_error: Option<String>,
    last_action: Option<String>,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner: row.get(1)?,
            name: row.get(2)?,
            engine_ref: row.get(3)?,
            status: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            expires_at: row.get(7)?,
            resource_spec: row.get(8)?,
            last_error: row.get(9)?,
            last_action: row.get(10)?,
        })
    }

    fn into_instance(self, transitions: Vec<Transition>) -> Result<Instance, String> {
        Ok(Instance {
            status: parse_status(&self.status)?,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            expires_at: self.expires_at.as_deref().map(parse_time).transpose()?,
            resource_spec: serde_json::from_str::<ResourceSpec>(&self.resource_spec)
                .map_err(|e| format!("resource_spec: {e}"))?,
            last_action: self
                .last_action
                .as_deref()
                .map(str::parse::<LifecycleAction>)
                .transpose()
                .map_err(|e| e.to_string())?,
            id: InstanceId::new(self.id),
            owner: OperatorId::new(self.owner),
            name: self.name,
            engine_ref: self.engine_ref.map(EngineRef::new),
            last_error: self.last_error,
            transitions,
        })
    }
}

/// `WHERE` clause and its positional parameters for the rows `filter` admits.
fn filter_clause(filter: &InstanceFilter) -> (String, Vec<String>) {
    let mut clauses = Vec::new();
    let mut args = Vec::new();
    if let Some(owner) = &filter.owner {
        args.push(owner.to_string());
        clauses.push(format!("owner = ?{}", args.len()));
    }
    match &filter.statuses {
        Some(statuses) if statuses.is_empty() => clauses.push("0".to_owned()),
        Some(statuses) => {
            let mut slots = Vec::with_capacity(statuses.len());
            for status in statuses {
                args.push(status.as_str().to_owned());
                slots.push(format!("?{}", args.len()));
            }
            clauses.push(format!("status IN ({})", slots.join(", ")));
        }
        None if filter.include_removed => {}
        None => {
            args.push(InstanceStatus::Removed.as_str().to_owned());
            clauses.push(format!("status != ?{}", args.len()));
        }
    }
    if clauses.is_empty() {
        (String::new(), args)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), args)
    }
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp '{s}': {e}"))
}

fn parse_status(s: &str) -> Result<InstanceStatus, String> {
    s.parse().map_err(|e: roost_schema::RecordError| e.to_string())
}

fn check_schema_version(conn: &Connection, initialize: bool) -> Result<(), StoreError> {
    let found: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_meta WHERE key = 'version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match found {
        None if initialize => {
            conn.execute(
                "INSERT INTO schema_meta (key, value) VALUES ('version', ?1)",
                params![SCHEMA_VERSION.to_string()],
            )?;
            Ok(())
        }
        None => Err(StoreError::VersionMismatch {
            expected: SCHEMA_VERSION,
            found: 0,
        }),
        Some(v) => {
            let found = v.parse::<u32>().unwrap_or(0);
            if found == SCHEMA_VERSION {
                Ok(())
            } else {
                Err(StoreError::VersionMismatch {
                    expected: SCHEMA_VERSION,
                    found,
                })
            }
        }
    }
}

impl InstanceStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn locks(&self) -> &IdLocks {
        &self.locks
    }

    fn get(&self, id: &InstanceId) -> Result<Option<Instance>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let raw = conn
            .query_row(
                &format!("{SELECT_INSTANCE} WHERE id = ?1"),
                params![id.as_str()],
                RawRow::from_row,
            )
            .optional()?;
        raw.map(|raw| Self::load(&conn, raw)).transpose()
    }

    fn list(&self, filter: &InstanceFilter) -> Result<Vec<Instance>, StoreError> {
        let (clause, args) = filter_clause(filter);
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let raws = {
            let mut stmt = conn.prepare_cached(&format!("{SELECT_INSTANCE}{clause}"))?;
            let rows = stmt.query_map(params_from_iter(args.iter()), RawRow::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut out = raws
            .into_iter()
            .map(|raw| Self::load(&conn, raw))
            .collect::<Result<Vec<_>, _>>()?;
        sort_instances(&mut out);
        Ok(out)
    }

    fn list_ids(&self, filter: &InstanceFilter) -> Result<Vec<InstanceId>, StoreError> {
        let (clause, args) = filter_clause(filter);
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt =
            conn.prepare_cached(&format!("SELECT id FROM instances{clause} ORDER BY id"))?;
        let ids = stmt
            .query_map(params_from_iter(args.iter()), |row| row.get::<_, String>(0))?
            .map(|id| id.map(InstanceId::new))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn put(&self, guard: &IdGuard<'_>, instance: &Instance) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        check_guard(&self.locks, guard, &instance.id)?;
        validate_record(instance)?;

        let spec = serde_json::to_string(&instance.resource_spec)?;
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO instances (id, owner, name, engine_ref, status, created_at, updated_at, \
             expires_at, resource_spec, last_error, last_action) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
             ON CONFLICT(id) DO UPDATE SET owner = excluded.owner, name = excluded.name, \
             engine_ref = excluded.engine_ref, status = excluded.status, \
             created_at = excluded.created_at, updated_at = excluded.updated_at, \
             expires_at = excluded.expires_at, resource_spec = excluded.resource_spec, \
             last_error = excluded.last_error, last_action = excluded.last_action",
            params![
                instance.id.as_str(),
                instance.owner.as_str(),
                instance.name,
                instance.engine_ref.as_ref().map(EngineRef::as_str),
                instance.status.as_str(),
                format_time(&instance.created_at),
                format_time(&instance.updated_at),
                instance.expires_at.as_ref().map(format_time),
                spec,
                instance.last_error,
                instance.last_action.map(LifecycleAction::as_str),
            ],
        )?;
        tx.execute(
            "DELETE FROM transitions WHERE instance_id = ?1",
            params![instance.id.as_str()],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO transitions (instance_id, seq, from_status, to_status, at, reason) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (seq, t) in instance.transitions.iter().enumerate() {
                stmt.execute(params![
                    instance.id.as_str(),
                    i64::try_from(seq).unwrap_or(i64::MAX),
                    t.from.map(InstanceStatus::as_str),
                    t.to.as_str(),
                    format_time(&t.at),
                    t.reason,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn count_active(&self, owner: Option<&OperatorId>) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = InstanceStatus::Removed.as_str();
        let count: i64 = match owner {
            Some(owner) => conn.query_row(
                "SELECT COUNT(*) FROM instances WHERE owner = ?1 AND status != ?2",
                params![owner.as_str(), removed],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM instances WHERE status != ?1",
                params![removed],
                |row| row.get(0),
            )?,
        };
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn test_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            SqliteStore::open(dir.path().join("roost.db"), Duration::from_secs(1)).unwrap();
        (dir, store)
    }

    fn sample(id: &str, owner: &str) -> Instance {
        let mut spec = ResourceSpec::new("ubuntu:22.04");
        spec.memory_mb = Some(512);
        spec.ports.push("2222:22".parse().unwrap());
        let now = Utc::now();
        Instance::new_pending(
            InstanceId::new(id),
            OperatorId::new(owner),
            "box",
            spec,
            now,
            Some(now + ChronoDuration::hours(2)),
        )
    }

    #[test]
    fn put_then_get_preserves_every_field() {
        let (_dir, store) = test_store();
        let mut inst = sample("aaaa0000", "alice");
        inst.fail(LifecycleAction::Create, "pull failed", Utc::now());
        let guard = store.lock("aaaa0000").unwrap();
        store.put(&guard, &inst).unwrap();

        assert_eq!(store.get(&inst.id).unwrap(), Some(inst));
    }

    #[test]
    fn put_replaces_transitions() {
        let (_dir, store) = test_store();
        let mut inst = sample("aaaa0000", "alice");
        let guard = store.lock("aaaa0000").unwrap();
        store.put(&guard, &inst).unwrap();
        inst.succeed(InstanceStatus::Running, "created", Utc::now());
        inst.succeed(InstanceStatus::Stopped, "stopped", Utc::now());
        store.put(&guard, &inst).unwrap();

        let back = store.get(&inst.id).unwrap().unwrap();
        assert_eq!(back.transitions.len(), 3);
        assert_eq!(back.status, InstanceStatus::Stopped);
    }

    #[test]
    fn list_filters_and_counts() {
        let (_dir, store) = test_store();
        for (id, owner) in [("a1", "alice"), ("a2", "alice"), ("b1", "bob")] {
            let guard = store.lock(id).unwrap();
            store.put(&guard, &sample(id, owner)).unwrap();
        }
        let mut gone = sample("a3", "alice");
        gone.succeed(InstanceStatus::Removed, "deleted", Utc::now());
        let guard = store.lock("a3").unwrap();
        store.put(&guard, &gone).unwrap();

        let alice = OperatorId::new("alice");
        assert_eq!(
            store
                .list(&InstanceFilter::owned_by(alice.clone()))
                .unwrap()
                .len(),
            2
        );
        assert_eq!(
            store
                .list(&InstanceFilter::owned_by(alice.clone()).including_removed())
                .unwrap()
                .len(),
            3
        );
        assert_eq!(store.count_active(Some(&alice)).unwrap(), 2);
        assert_eq!(store.count_active(None).unwrap(), 3);
    }

    #[test]
    fn reopen_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roost.db");
        let inst = sample("aaaa0000", "alice");
        {
            let store = SqliteStore::open(&path, Duration::from_secs(1)).unwrap();
            let guard = store.lock("aaaa0000").unwrap();
            store.put(&guard, &inst).unwrap();
        }
        let store = SqliteStore::open(&path, Duration::from_secs(1)).unwrap();
        assert!(store.contains(&inst.id).unwrap());
    }

    #[test]
    fn read_only_rejects_writes() {
        let (dir, store) = test_store();
        let inst = sample("aaaa0000", "alice");
        let guard = store.lock("aaaa0000").unwrap();
        store.put(&guard, &inst).unwrap();

        let ro = SqliteStore::open_read_only(dir.path().join("roost.db")).unwrap();
        assert_eq!(ro.list(&InstanceFilter::active()).unwrap().len(), 1);
        let guard = ro.lock("aaaa0000").unwrap();
        assert!(matches!(ro.put(&guard, &inst), Err(StoreError::ReadOnly)));
    }

    #[test]
    fn rejects_invalid_record() {
        let (_dir, store) = test_store();
        let mut inst = sample("aaaa0000", "alice");
        inst.name = "bad name".to_owned();
        let guard = store.lock("aaaa0000").unwrap();
        assert!(matches!(
            store.put(&guard, &inst),
            Err(StoreError::InvalidRecord { .. })
        ));
        assert!(!store.contains(&inst.id).unwrap());
    }

    #[test]
    fn active_listing_never_decodes_tombstones() {
        let (_dir, store) = test_store();
        let live = sample("aaaa0000", "alice");
        let mut gone = sample("bbbb0000", "alice");
        gone.succeed(InstanceStatus::Removed, "deleted", Utc::now());
        for inst in [&live, &gone] {
            let guard = store.lock(inst.id.as_str()).unwrap();
            store.put(&guard, inst).unwrap();
        }
        store
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE instances SET resource_spec = 'not json' WHERE id = 'bbbb0000'",
                [],
            )
            .unwrap();

        let alice = OperatorId::new("alice");
        let active = store.list(&InstanceFilter::active()).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, live.id);
        assert_eq!(
            store.list(&InstanceFilter::owned_by(alice.clone())).unwrap().len(),
            1
        );
        assert_eq!(store.count_active(Some(&alice)).unwrap(), 1);
        assert_eq!(
            store.list_ids(&InstanceFilter::all()).unwrap(),
            vec![live.id.clone(), gone.id.clone()]
        );
        assert!(matches!(
            store.list(&InstanceFilter::all()),
            Err(StoreError::Corrupt { id, .. }) if id == "bbbb0000"
        ));
    }

    #[test]
    fn filter_clause_pushes_down_owner_and_status() {
        let (clause, args) = filter_clause(&InstanceFilter::active());
        assert_eq!(clause, " WHERE status != ?1");
        assert_eq!(args, vec!["removed"]);

        let filter = InstanceFilter::owned_by(OperatorId::new("alice"))
            .with_statuses(&[InstanceStatus::Running, InstanceStatus::Stopped]);
        let (clause, args) = filter_clause(&filter);
        assert_eq!(clause, " WHERE owner = ?1 AND status IN (?2, ?3)");
        assert_eq!(args, vec!["alice", "running", "stopped"]);

        assert_eq!(filter_clause(&InstanceFilter::all()).0, "");
        let (clause, _) = filter_clause(&InstanceFilter::active().with_statuses(&[]));
        assert_eq!(clause, " WHERE 0");
    }

    #[test]
    fn read_only_on_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SqliteStore::open_read_only(dir.path().join("absent.db")).is_err());
    }
}
