//! Persistent instance records for Roost.
//!
//! Two interchangeable backends implement [`InstanceStore`]: the
//! [`LegacyStore`] whole-collection JSON file and the relational
//! [`SqliteStore`]. Both enforce record validation on every write and hand out
//! per-id [`IdGuard`]s so at most one transition touches an instance at a time,
//! across every handle and process opened on the same store file.
//! [`migrate_legacy`] is the sanctioned path from the former to the latter, and
//! [`import_bot_state`] brings over the records of the Discord bot Roost replaces.

pub mod bot_import;
pub mod legacy;
pub mod locks;
pub mod migration;
pub mod sqlite;

pub use bot_import::{import_bot_state, BotDumpFormat, BotRecord};
pub use legacy::LegacyStore;
pub use locks::{FileLock, IdGuard, IdLocks};
pub use migration::{migrate_legacy, MigrationIssue, MigrationReport};
pub use sqlite::SqliteStore;

use roost_schema::{
    Instance, InstanceId, InstanceStatus, OperatorId, RecordError, StoreBackend, StoreSection,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Directory holding the per-key lock files of the store at `store_file`.
pub(crate) fn lock_dir_for(store_file: &Path) -> PathBuf {
    let mut name = store_file.as_os_str().to_owned();
    name.push(".locks");
    PathBuf::from(name)
}

/// Replace `dest` with `content` via a synced temp file in the same directory.
pub(crate) fn write_atomic(dest: &Path, content: &[u8]) -> Result<(), StoreError> {
    let dir = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid record '{id}': {source}")]
    InvalidRecord {
        id: String,
        #[source]
        source: RecordError,
    },
    #[error("corrupt record '{id}': {reason}")]
    Corrupt { id: String, reason: String },
    #[error("cannot map record '{key}': {reason}")]
    Unmappable { key: String, reason: String },
    #[error("record stored under '{key}' carries id '{id}'")]
    KeyMismatch { key: String, id: String },
    #[error("instance not found: {0}")]
    NotFound(String),
    #[error("timed out waiting for lock on '{0}'")]
    LockTimeout(String),
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("guard for '{held}' cannot write instance '{id}'")]
    GuardMismatch { held: String, id: String },
    #[error("store was opened read-only")]
    ReadOnly,
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("migration validation failed for {count} record(s)")]
    MigrationValidation { count: usize },
    #[error("migration verification failed for: {}", ids.join(", "))]
    MigrationMismatch { ids: Vec<String> },
}

/// Which records a [`InstanceStore::list`] call returns.
///
/// With no explicit statuses, `removed` tombstones are left out unless
/// `include_removed` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceFilter {
    pub owner: Option<OperatorId>,
    pub statuses: Option<Vec<InstanceStatus>>,
    pub include_removed: bool,
}

impl InstanceFilter {
    /// Every non-removed instance.
    pub fn active() -> Self {
        Self::default()
    }

    /// Every record including tombstones.
    pub fn all() -> Self {
        Self {
            include_removed: true,
            ..Self::default()
        }
    }

    pub fn owned_by(owner: OperatorId) -> Self {
        Self {
            owner: Some(owner),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_statuses(mut self, statuses: &[InstanceStatus]) -> Self {
        self.statuses = Some(statuses.to_vec());
        self
    }

    #[must_use]
    pub fn including_removed(mut self) -> Self {
        self.include_removed = true;
        self
    }

    pub fn matches(&self, instance: &Instance) -> bool {
        if let Some(owner) = &self.owner {
            if instance.owner != *owner {
                return false;
            }
        }
        match &self.statuses {
            Some(statuses) => statuses.contains(&instance.status),
            None => self.include_removed || instance.is_active(),
        }
    }
}

/// Orders listings by creation time, then id.
pub(crate) fn sort_instances(instances: &mut [Instance]) {
    instances.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

pub(crate) fn validate_record(instance: &Instance) -> Result<(), StoreError> {
    instance
        .validate()
        .map_err(|source| StoreError::InvalidRecord {
            id: instance.id.to_string(),
            source,
        })
}

/// Durable instance records with per-id write exclusion.
///
/// Reads never take the per-id lock and may observe the state just before or
/// just after a concurrent transition. Writes require an [`IdGuard`] obtained
/// from this store for the record's id.
pub trait InstanceStore: Send + Sync {
    fn backend(&self) -> &'static str;

    fn locks(&self) -> &IdLocks;

    /// Block until the exclusion for `key` is free, up to the configured timeout.
    fn lock(&self, key: &str) -> Result<IdGuard<'_>, StoreError> {
        self.locks().lock(key)
    }

    /// Take the exclusion for `key` only if nobody holds it.
    fn try_lock(&self, key: &str) -> Result<Option<IdGuard<'_>>, StoreError> {
        self.locks().try_lock(key)
    }

    fn get(&self, id: &InstanceId) -> Result<Option<Instance>, StoreError>;

    fn list(&self, filter: &InstanceFilter) -> Result<Vec<Instance>, StoreError>;

    /// Ids of the records `filter` selects, in listing order.
    fn list_ids(&self, filter: &InstanceFilter) -> Result<Vec<InstanceId>, StoreError> {
        Ok(self.list(filter)?.into_iter().map(|i| i.id).collect())
    }

    /// Insert or fully replace the record for `instance.id`.
    fn put(&self, guard: &IdGuard<'_>, instance: &Instance) -> Result<(), StoreError>;

    fn contains(&self, id: &InstanceId) -> Result<bool, StoreError> {
        Ok(self.get(id)?.is_some())
    }

    /// Number of non-removed instances, optionally for a single owner.
    fn count_active(&self, owner: Option<&OperatorId>) -> Result<usize, StoreError> {
        let filter = InstanceFilter {
            owner: owner.cloned(),
            ..InstanceFilter::active()
        };
        Ok(self.list(&filter)?.len())
    }
}

/// Reject a write whose guard does not cover `id` or came from another store.
pub(crate) fn check_guard(
    locks: &IdLocks,
    guard: &IdGuard<'_>,
    id: &InstanceId,
) -> Result<(), StoreError> {
    if !guard.belongs_to(locks) || guard.key() != id.as_str() {
        return Err(StoreError::GuardMismatch {
            held: guard.key().to_owned(),
            id: id.to_string(),
        });
    }
    Ok(())
}

/// Open the backend named in the `[store]` config section.
pub fn open_store(section: &StoreSection) -> Result<Arc<dyn InstanceStore>, StoreError> {
    std::fs::create_dir_all(&section.path)?;
    let timeout = Duration::from_secs(section.lock_timeout_secs);
    let store: Arc<dyn InstanceStore> = match section.backend {
        StoreBackend::Legacy => Arc::new(LegacyStore::open(section.legacy_file(), timeout)?),
        StoreBackend::Sqlite => Arc::new(SqliteStore::open(section.sqlite_file(), timeout)?),
    };
    tracing::debug!(
        "opened {} store at {}",
        store.backend(),
        section.path.display()
    );
    Ok(store)
}
