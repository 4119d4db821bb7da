//! Sync decisions and backup records

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::records::{FileRecord, RemoteObjectRecord};

/// Side that wins a true conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictWinner {
    Local,
    Remote,
}

/// What to do with one path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Upload,
    Download,
    BackupThenUpload,
    BackupThenDownload,
    Skip,
    /// Both sides changed since the last synced state
    Conflict(ConflictWinner),
}

impl SyncAction {
    /// Concrete action to execute; conflicts always back up the losing side
    pub fn resolved(self) -> SyncAction {
        match self {
            SyncAction::Conflict(ConflictWinner::Local) => SyncAction::BackupThenUpload,
            SyncAction::Conflict(ConflictWinner::Remote) => SyncAction::BackupThenDownload,
            other => other,
        }
    }

    pub fn needs_backup(self) -> bool {
        matches!(
            self.resolved(),
            SyncAction::BackupThenUpload | SyncAction::BackupThenDownload
        )
    }

    pub fn is_upload(self) -> bool {
        matches!(
            self.resolved(),
            SyncAction::Upload | SyncAction::BackupThenUpload
        )
    }

    pub fn is_download(self) -> bool {
        matches!(
            self.resolved(),
            SyncAction::Download | SyncAction::BackupThenDownload
        )
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncAction::Upload => "upload",
            SyncAction::Download => "download",
            SyncAction::BackupThenUpload => "backup_then_upload",
            SyncAction::BackupThenDownload => "backup_then_download",
            SyncAction::Skip => "skip",
            SyncAction::Conflict(ConflictWinner::Local) => "conflict_local_wins",
            SyncAction::Conflict(ConflictWinner::Remote) => "conflict_remote_wins",
        };
        write!(f, "{s}")
    }
}

/// Why a decision was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    BothMissing,
    LocalOnly,
    RemoteOnly,
    Unchanged,
    LocalChanged,
    RemoteChanged,
    BothChanged,
    /// No marker; timestamps agree within tolerance
    WithinTolerance,
    /// No marker; local content is newer
    ColdStartLocalNewer,
    /// No marker; remote content is newer
    ColdStartRemoteNewer,
    /// Local file is empty and empty uploads are disabled
    EmptyLocalFile,
    /// The last attempt failed permanently and neither side changed since
    PermanentFailure,
    /// The folder only ships local content
    DownloadDisabled,
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecisionReason::BothMissing => "both_missing",
            DecisionReason::LocalOnly => "local_only",
            DecisionReason::RemoteOnly => "remote_only",
            DecisionReason::Unchanged => "unchanged",
            DecisionReason::LocalChanged => "local_changed",
            DecisionReason::RemoteChanged => "remote_changed",
            DecisionReason::BothChanged => "both_changed",
            DecisionReason::WithinTolerance => "within_tolerance",
            DecisionReason::ColdStartLocalNewer => "cold_start_local_newer",
            DecisionReason::ColdStartRemoteNewer => "cold_start_remote_newer",
            DecisionReason::EmptyLocalFile => "empty_local_file",
            DecisionReason::PermanentFailure => "permanent_failure",
            DecisionReason::DownloadDisabled => "download_disabled",
        };
        write!(f, "{s}")
    }
}

/// Outcome of conflict resolution for one path
///
/// Carries the records it was computed from so the decision can be
/// audited after the fact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncDecision {
    pub action: SyncAction,
    pub reason: DecisionReason,
    pub local: FileRecord,
    pub remote: RemoteObjectRecord,
    /// Also the timestamp baked into any backup key for this decision
    pub decided_at: DateTime<Utc>,
}

impl SyncDecision {
    pub fn new(
        action: SyncAction,
        reason: DecisionReason,
        local: FileRecord,
        remote: RemoteObjectRecord,
    ) -> Self {
        Self {
            action,
            reason,
            local,
            remote,
            decided_at: Utc::now(),
        }
    }

    /// Replaces the action with `Skip`, keeping the records
    pub fn into_skip(self, reason: DecisionReason) -> Self {
        Self {
            action: SyncAction::Skip,
            reason,
            ..self
        }
    }
}

/// What a backup preserved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupSource {
    /// Server-side copy of the remote object about to be replaced
    Remote { key: String },
    /// Local file content about to be replaced by a download
    Local { path: PathBuf },
}

/// Point-in-time copy taken before an overwrite; never mutated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub source: BackupSource,
    pub bucket: String,
    pub backup_key: String,
    pub created_at: DateTime<Utc>,
}
