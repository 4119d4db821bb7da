//! Local and remote state snapshots
//!
//! [`FileRecord`] and [`RemoteObjectRecord`] are produced fresh for every
//! decision. [`SyncMarker`] remembers what both sides looked like right
//! after the last successful transfer of a path.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of a local file at decision time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Absolute path on disk
    pub path: PathBuf,
    /// Path relative to the folder root, `/`-separated
    pub relative_path: String,
    /// Whether a regular file exists at `path`
    pub exists: bool,
    /// Size in bytes (0 when missing)
    pub size: u64,
    /// Last modification time
    pub modified: Option<DateTime<Utc>>,
}

impl FileRecord {
    /// Record for a path with no file behind it
    pub fn missing(path: PathBuf, relative_path: impl Into<String>) -> Self {
        Self {
            path,
            relative_path: relative_path.into(),
            exists: false,
            size: 0,
            modified: None,
        }
    }
}

/// Snapshot of a remote object at decision time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObjectRecord {
    pub bucket: String,
    pub key: String,
    pub exists: bool,
    pub size: u64,
    /// Store-reported Last-Modified
    pub last_modified: Option<DateTime<Utc>>,
    /// Local mtime recorded in object metadata when autosync uploaded it
    pub source_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

impl RemoteObjectRecord {
    /// Record for a key with no object behind it
    pub fn missing(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            exists: false,
            size: 0,
            last_modified: None,
            source_modified: None,
            etag: None,
        }
    }

    /// Modification time of the content, preferring the uploader's mtime
    pub fn content_modified(&self) -> Option<DateTime<Utc>> {
        self.source_modified.or(self.last_modified)
    }
}

/// Last-known-synced state of one path
///
/// Only valid when both sides existed after the transfer that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMarker {
    pub local_size: u64,
    pub local_modified: Option<DateTime<Utc>>,
    pub remote_size: u64,
    pub remote_modified: Option<DateTime<Utc>>,
    pub remote_etag: Option<String>,
    pub synced_at: DateTime<Utc>,
}

impl SyncMarker {
    /// Captures both sides as they are right after a transfer
    pub fn capture(local: &FileRecord, remote: &RemoteObjectRecord) -> Self {
        Self {
            local_size: local.size,
            local_modified: local.modified,
            remote_size: remote.size,
            remote_modified: remote.content_modified(),
            remote_etag: remote.etag.clone(),
            synced_at: Utc::now(),
        }
    }

    /// Whether the local file differs from the synced state
    pub fn local_changed(&self, local: &FileRecord) -> bool {
        local.size != self.local_size || local.modified != self.local_modified
    }

    /// Whether the remote object differs from the synced state
    ///
    /// ETags are authoritative when both are known.
    pub fn remote_changed(&self, remote: &RemoteObjectRecord) -> bool {
        if let (Some(current), Some(known)) = (remote.etag.as_deref(), self.remote_etag.as_deref())
        {
            return current != known;
        }
        remote.size != self.remote_size || remote.content_modified() != self.remote_modified
    }
}
