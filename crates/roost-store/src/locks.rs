use crate::StoreError;
use fs2::FileExt;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

const FILE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Exclusive `fs2` advisory lock on a file, released on drop.
///
/// The lock belongs to the open file description, so two handles in one
/// process exclude each other just like two processes do.
#[derive(Debug)]
pub struct FileLock {
    lock_file: File,
    path: PathBuf,
}

impl FileLock {
    fn open(path: &Path) -> Result<File, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?)
    }

    /// Block until the lock is free.
    pub fn acquire(path: &Path) -> Result<Self, StoreError> {
        let file = Self::open(path)?;
        file.lock_exclusive()
            .map_err(|e| StoreError::LockFailed(format!("{}: {e}", path.display())))?;
        Ok(Self {
            lock_file: file,
            path: path.to_path_buf(),
        })
    }

    /// Take the lock only if no other handle holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, StoreError> {
        let file = Self::open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                lock_file: file,
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(StoreError::LockFailed(format!("{}: {e}", path.display()))),
        }
    }

    /// Poll for the lock until `deadline`; `None` if it never came free.
    pub fn acquire_until(path: &Path, deadline: Instant) -> Result<Option<Self>, StoreError> {
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(Some(lock));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(FILE_POLL_INTERVAL.min(deadline - now));
        }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

/// Per-key exclusion table.
///
/// Keys are instance ids, or `quota:<owner>` for the short section of a
/// creation that checks and reserves quota. Holding one key never blocks
/// another.
///
/// A table built with [`IdLocks::shared`] also takes a [`FileLock`] per key
/// under its lock directory, so every handle on the same store (in this
/// process or another) sees the same exclusion. [`IdLocks::new`] only
/// excludes threads sharing this table.
#[derive(Debug)]
pub struct IdLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
    timeout: Duration,
    lock_dir: Option<PathBuf>,
}

/// Exclusive hold on one key of an [`IdLocks`] table, released on drop.
#[derive(Debug)]
pub struct IdGuard<'a> {
    locks: &'a IdLocks,
    key: String,
    file: Option<FileLock>,
}

/// Lock file name for `key`: safe bytes kept, everything else `%XX`.
fn key_file_name(key: &str) -> String {
    let mut name = String::with_capacity(key.len() + 5);
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            name.push(char::from(b));
        } else {
            name.push_str(&format!("%{b:02X}"));
        }
    }
    name.push_str(".lock");
    name
}

impl IdLocks {
    /// A table that only excludes threads holding a reference to it.
    pub fn new(timeout: Duration) -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
            timeout,
            lock_dir: None,
        }
    }

    /// A table backed by lock files in `lock_dir`, created if missing.
    pub fn shared(lock_dir: impl Into<PathBuf>, timeout: Duration) -> Result<Self, StoreError> {
        let lock_dir = lock_dir.into();
        std::fs::create_dir_all(&lock_dir)?;
        Ok(Self {
            lock_dir: Some(lock_dir),
            ..Self::new(timeout)
        })
    }

    pub fn lock_dir(&self) -> Option<&Path> {
        self.lock_dir.as_deref()
    }

    fn key_path(&self, key: &str) -> Option<PathBuf> {
        self.lock_dir.as_ref().map(|dir| dir.join(key_file_name(key)))
    }

    pub fn lock(&self, key: &str) -> Result<IdGuard<'_>, StoreError> {
        let deadline = Instant::now() + self.timeout;
        {
            let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
            while held.contains(key) {
                let now = Instant::now();
                if now >= deadline {
                    return Err(StoreError::LockTimeout(key.to_owned()));
                }
                let (guard, _) = self
                    .released
                    .wait_timeout(held, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner);
                held = guard;
            }
            held.insert(key.to_owned());
        }

        let file = match self.key_path(key) {
            None => None,
            Some(path) => match FileLock::acquire_until(&path, deadline) {
                Ok(Some(file)) => Some(file),
                Ok(None) => {
                    self.release(key);
                    return Err(StoreError::LockTimeout(key.to_owned()));
                }
                Err(e) => {
                    self.release(key);
                    return Err(e);
                }
            },
        };
        Ok(IdGuard {
            locks: self,
            key: key.to_owned(),
            file,
        })
    }

    /// Take `key` only if no thread or other store handle holds it.
    pub fn try_lock(&self, key: &str) -> Result<Option<IdGuard<'_>>, StoreError> {
        {
            let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
            if !held.insert(key.to_owned()) {
                return Ok(None);
            }
        }

        let file = match self.key_path(key) {
            None => None,
            Some(path) => match FileLock::try_acquire(&path) {
                Ok(Some(file)) => Some(file),
                Ok(None) => {
                    self.release(key);
                    return Ok(None);
                }
                Err(e) => {
                    self.release(key);
                    return Err(e);
                }
            },
        };
        Ok(Some(IdGuard {
            locks: self,
            key: key.to_owned(),
            file,
        }))
    }

    /// Whether a guard from this table currently holds `key`.
    pub fn is_held(&self, key: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    fn release(&self, key: &str) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.remove(key);
        drop(held);
        self.released.notify_all();
    }
}

impl IdGuard<'_> {
    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether this guard was issued by `locks`.
    pub fn belongs_to(&self, locks: &IdLocks) -> bool {
        std::ptr::eq(self.locks, locks)
    }
}

impl Drop for IdGuard<'_> {
    fn drop(&mut self) {
        drop(self.file.take());
        self.locks.release(&self.key);
    }
}
