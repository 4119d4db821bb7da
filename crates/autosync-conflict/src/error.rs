//! Error types for the conflict engine

use autosync_core::domain::StoreError;
use thiserror::Error;

/// Errors that can occur while preserving the overwritten side
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConflictError {
    /// The copy to the backup key failed; the overwrite must not proceed
    #[error("backup of {source_key} to {backup_key} failed: {error}")]
    BackupFailed {
        source_key: String,
        backup_key: String,
        error: StoreError,
    },
}

impl ConflictError {
    /// Whether retrying the same backup may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ConflictError::BackupFailed { error, .. } => error.is_transient(),
        }
    }

    pub fn store_error(&self) -> &StoreError {
        match self {
            ConflictError::BackupFailed { error, .. } => error,
        }
    }
}
