//! Last-known-synced state per path
//!
//! Markers live in memory only; after a restart the resolver falls back to
//! its cold-start rule and reconciliation rebuilds them. The table also
//! remembers permanent failures so a failing path is not retried until
//! one of its sides changes.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use autosync_core::domain::{FileRecord, RemoteObjectRecord, SyncMarker};

/// What both sides looked like when a path failed permanently
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureFingerprint {
    local_exists: bool,
    local_size: u64,
    local_modified: Option<DateTime<Utc>>,
    remote_exists: bool,
    remote_size: u64,
    remote_etag: Option<String>,
    remote_modified: Option<DateTime<Utc>>,
}

impl FailureFingerprint {
    pub fn of(local: &FileRecord, remote: &RemoteObjectRecord) -> Self {
        Self {
            local_exists: local.exists,
            local_size: local.size,
            local_modified: local.modified,
            remote_exists: remote.exists,
            remote_size: remote.size,
            remote_etag: remote.etag.clone(),
            remote_modified: remote.content_modified(),
        }
    }
}

/// Sync markers and permanent-failure memory of one folder
#[derive(Debug, Default)]
pub struct SyncStateTable {
    markers: DashMap<PathBuf, SyncMarker>,
    failures: DashMap<PathBuf, FailureFingerprint>,
}

impl SyncStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn marker(&self, path: &Path) -> Option<SyncMarker> {
        self.markers.get(path).map(|m| m.value().clone())
    }

    /// Records a successful sync and clears any remembered failure
    pub fn record_sync(&self, path: &Path, marker: SyncMarker) {
        self.failures.remove(path);
        self.markers.insert(path.to_path_buf(), marker);
    }

    /// Drops the marker, e.g. once both sides are gone
    pub fn forget(&self, path: &Path) {
        self.markers.remove(path);
    }

    pub fn record_failure(&self, path: &Path, fingerprint: FailureFingerprint) {
        self.failures.insert(path.to_path_buf(), fingerprint);
    }

    /// Whether `path` already failed permanently in exactly this state
    ///
    /// A stale entry (either side changed since) is discarded.
    pub fn is_known_failure(&self, path: &Path, current: &FailureFingerprint) -> bool {
        match self.failures.get(path) {
            Some(known) if known.value() == current => true,
            Some(known) => {
                drop(known);
                self.failures.remove(path);
                false
            }
            None => false,
        }
    }

    pub fn marker_count(&self) -> usize {
        self.markers.len()
    }
}
