//! Per-path mutual exclusion
//!
//! Live events and reconciliation both take the lock of a path for the
//! whole decide+execute span. Waiters queue in arrival order (tokio's
//! mutex is fair). Entries are removed once nobody holds or awaits them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<PathBuf, Arc<Mutex<()>>>;

/// Lock table keyed by absolute path
#[derive(Debug, Default, Clone)]
pub struct PathLockTable {
    locks: Arc<LockMap>,
}

impl PathLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `path`
    pub async fn acquire(&self, path: &Path) -> PathLockGuard {
        let lock = self
            .locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        PathLockGuard {
            locks: Arc::clone(&self.locks),
            path: path.to_path_buf(),
            guard: Some(guard),
        }
    }

    /// Number of paths currently locked or awaited
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Held while a path is being processed
#[derive(Debug)]
pub struct PathLockGuard {
    locks: Arc<LockMap>,
    path: PathBuf,
    guard: Option<OwnedMutexGuard<()>>,
}

impl PathLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        // The owned guard holds a reference to the mutex; release it first so
        // the count below only sees the table and waiters.
        drop(self.guard.take());
        self.locks
            .remove_if(&self.path, |_, lock| Arc::strong_count(lock) == 1);
    }
}
