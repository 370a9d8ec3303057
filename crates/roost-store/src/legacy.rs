//! Whole-collection JSON backend.
//!
//! Every record lives in one `instances.json` document that is rewritten
//! atomically on each `put`. A [`FileLock`] on a sibling `.lock` file
//! serialises the read-modify-write across processes, and per-id guards live
//! in the sibling `.locks/` directory. Suitable only for small
//! instance counts; new deployments use [`SqliteStore`](crate::SqliteStore).

use crate::locks::{FileLock, IdGuard, IdLocks};
use crate::{
    check_guard, lock_dir_for, sort_instances, validate_record, write_atomic, InstanceFilter,
    InstanceStore, StoreError,
};
use roost_schema::{Instance, InstanceId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const LEGACY_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct LegacyDocument {
    format_version: u32,
    #[serde(default)]
    instances: BTreeMap<String, serde_json::Value>,
}

impl Default for LegacyDocument {
    fn default() -> Self {
        Self {
            format_version: LEGACY_FORMAT_VERSION,
            instances: BTreeMap::new(),
        }
    }
}

pub struct LegacyStore {
    path: PathBuf,
    locks: IdLocks,
}

impl LegacyStore {
    /// Open the collection at `path`. The file itself is created on first write.
    pub fn open(path: impl Into<PathBuf>, lock_timeout: Duration) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let locks = IdLocks::shared(lock_dir_for(&path), lock_timeout)?;
        Ok(Self { path, locks })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    fn read_document(&self) -> Result<LegacyDocument, StoreError> {
        if !self.path.exists() {
            return Ok(LegacyDocument::default());
        }
        let content = fs::read_to_string(&self.path)?;
        let doc: LegacyDocument = serde_json::from_str(&content)?;
        if doc.format_version != LEGACY_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: LEGACY_FORMAT_VERSION,
                found: doc.format_version,
            });
        }
        Ok(doc)
    }

    fn decode(key: &str, value: serde_json::Value) -> Result<Instance, StoreError> {
        let instance: Instance = serde_json::from_value(value)?;
        if instance.id.as_str() != key {
            return Err(StoreError::KeyMismatch {
                key: key.to_owned(),
                id: instance.id.to_string(),
            });
        }
        validate_record(&instance)?;
        Ok(instance)
    }

    /// Raw `(key, json)` pairs exactly as stored, without decoding.
    pub fn list_raw(&self) -> Result<Vec<(String, serde_json::Value)>, StoreError> {
        Ok(self.read_document()?.instances.into_iter().collect())
    }

    /// Like `list()`, but reports every record individually so callers can
    /// surface records that fail to decode or validate.
    #[allow(clippy::type_complexity)]
    pub fn list_with_errors(
        &self,
    ) -> Result<Vec<Result<Instance, (String, StoreError)>>, StoreError> {
        Ok(self
            .list_raw()?
            .into_iter()
            .map(|(key, value)| Self::decode(&key, value).map_err(|e| (key, e)))
            .collect())
    }
}

impl InstanceStore for LegacyStore {
    fn backend(&self) -> &'static str {
        "legacy"
    }

    fn locks(&self) -> &IdLocks {
        &self.locks
    }

    fn get(&self, id: &InstanceId) -> Result<Option<Instance>, StoreError> {
        let mut doc = self.read_document()?;
        match doc.instances.remove(id.as_str()) {
            Some(value) => Self::decode(id.as_str(), value).map(Some),
            None => Ok(None),
        }
    }

    fn list(&self, filter: &InstanceFilter) -> Result<Vec<Instance>, StoreError> {
        let mut out = Vec::new();
        for entry in self.list_with_errors()? {
            match entry {
                Ok(instance) if filter.matches(&instance) => out.push(instance),
                Ok(_) => {}
                Err((key, e)) => warn!("skipping unreadable legacy record '{key}': {e}"),
            }
        }
        sort_instances(&mut out);
        Ok(out)
    }

    fn put(&self, guard: &IdGuard<'_>, instance: &Instance) -> Result<(), StoreError> {
        check_guard(&self.locks, guard, &instance.id)?;
        validate_record(instance)?;

        let _file_lock = FileLock::acquire(&self.lock_path())?;
        let mut doc = self.read_document()?;
        doc.instances
            .insert(instance.id.to_string(), serde_json::to_value(instance)?);
        let content = serde_json::to_string_pretty(&doc)?;
        write_atomic(&self.path, content.as_bytes())
    }
}
