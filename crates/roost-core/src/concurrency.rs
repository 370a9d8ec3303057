use crate::CoreError;
use roost_store::FileLock;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Keeps a second reconciler daemon off the same store directory.
///
/// Per-instance exclusion between the daemon and CLI commands is the store's
/// job; this only guarantees a single sweeping process.
pub struct DaemonLock {
    lock: FileLock,
}

impl DaemonLock {
    /// Take the lock, or fail with [`CoreError::DaemonRunning`] if another
    /// daemon holds it.
    pub fn acquire(lock_path: &Path) -> Result<Self, CoreError> {
        match FileLock::try_acquire(lock_path)? {
            Some(lock) => Ok(Self { lock }),
            None => Err(CoreError::DaemonRunning(lock_path.to_path_buf())),
        }
    }

    pub fn path(&self) -> &Path {
        self.lock.path()
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(1);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\nshutdown requested, finishing current sweep...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
