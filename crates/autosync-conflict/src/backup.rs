//! Backup-before-overwrite
//!
//! Whatever a decision is about to replace is copied to a backup key
//! first. A failed backup surfaces as [`ConflictError::BackupFailed`] and
//! the caller must abandon the overwrite.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use autosync_core::domain::{BackupRecord, BackupSource, SyncAction, SyncDecision};
use autosync_core::ports::{ObjectLocation, RemoteObjectStore};

use crate::error::ConflictError;
use crate::namer::BackupNamer;

/// Preserves the side a decision overwrites
pub struct BackupManager {
    store: Arc<dyn RemoteObjectStore>,
}

impl BackupManager {
    pub fn new(store: Arc<dyn RemoteObjectStore>) -> Self {
        Self { store }
    }

    /// Takes the backup `decision` requires, if any
    ///
    /// `BackupThenUpload` copies the remote object server-side;
    /// `BackupThenDownload` stores the local file's content. Returns
    /// `Ok(None)` when the action overwrites nothing.
    pub async fn backup_for(
        &self,
        decision: &SyncDecision,
        location: &ObjectLocation,
    ) -> Result<Option<BackupRecord>, ConflictError> {
        match decision.action.resolved() {
            SyncAction::BackupThenUpload if decision.remote.exists => self
                .backup_remote(location, decision.decided_at)
                .await
                .map(Some),
            SyncAction::BackupThenDownload if decision.local.exists => self
                .backup_local(
                    &decision.local.path,
                    decision.local.modified,
                    location,
                    decision.decided_at,
                )
                .await
                .map(Some),
            _ => Ok(None),
        }
    }

    /// Server-side copy of the remote object at `location`
    pub async fn backup_remote(
        &self,
        location: &ObjectLocation,
        decided_at: DateTime<Utc>,
    ) -> Result<BackupRecord, ConflictError> {
        let backup_key = BackupNamer::backup_key(&location.key, decided_at);
        debug!(key = %location.key, %backup_key, "Backing up remote object");

        self.store
            .copy(location, &backup_key)
            .await
            .map_err(|error| ConflictError::BackupFailed {
                source_key: location.key.clone(),
                backup_key: backup_key.clone(),
                error,
            })?;

        info!(bucket = %location.bucket, key = %location.key, %backup_key, "Remote object backed up");
        Ok(BackupRecord {
            source: BackupSource::Remote {
                key: location.key.clone(),
            },
            bucket: location.bucket.clone(),
            backup_key,
            created_at: Utc::now(),
        })
    }

    /// Uploads the local file at `path` to the backup key of `location`
    pub async fn backup_local(
        &self,
        path: &Path,
        modified: Option<DateTime<Utc>>,
        location: &ObjectLocation,
        decided_at: DateTime<Utc>,
    ) -> Result<BackupRecord, ConflictError> {
        let backup_key = BackupNamer::backup_key(&location.key, decided_at);
        debug!(path = %path.display(), %backup_key, "Backing up local file");

        self.store
            .put(&location.with_key(backup_key.clone()), path, modified)
            .await
            .map_err(|error| ConflictError::BackupFailed {
                source_key: path.display().to_string(),
                backup_key: backup_key.clone(),
                error,
            })?;

        info!(bucket = %location.bucket, path = %path.display(), %backup_key, "Local file backed up");
        Ok(BackupRecord {
            source: BackupSource::Local {
                path: path.to_path_buf(),
            },
            bucket: location.bucket.clone(),
            backup_key,
            created_at: Utc::now(),
        })
    }
}
