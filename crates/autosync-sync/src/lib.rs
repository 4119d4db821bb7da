//! autosync sync - folder watching and synchronization engine
//!
//! Provides:
//! - Native filesystem watching behind a [`WatchSource`] capability
//! - Debounced, close-aware change coalescing
//! - Per-folder coordination with bounded concurrency and per-path locks
//! - Periodic full reconciliation against the remote prefix
//!
//! ## Modules
//!
//! - [`watcher`] - Watch capability, notify adapter and debounce queue
//! - [`pipeline`] - Feeds settled, accepted paths of one folder to its coordinator
//! - [`engine`] - `SyncCoordinator`: decide and execute per path
//! - [`supervisor`] - Starts the watch, coordinator and reconciliation of a folder
//! - [`filesystem`] - Local stat/walk and atomic download placement
//! - [`retry`] - Deadlines and exponential backoff for remote calls

pub mod engine;
pub mod filesystem;
pub mod locks;
pub mod markers;
pub mod pipeline;
pub mod retry;
pub mod supervisor;
pub mod watcher;

use std::path::PathBuf;

use thiserror::Error;

use autosync_conflict::ConflictError;
use autosync_core::domain::{DomainError, StoreError};

pub use engine::{
    PathOutcome, ReconcileReport, ShutdownReport, SyncCoordinator, SyncMode, SyncSettings,
    TransferOutcome,
};
pub use retry::RetryPolicy;
pub use supervisor::{FolderHandle, FolderSupervisor};
pub use watcher::{ChangeKind, NotifyWatchSource, WatchEvent, WatchSource, WatchSubscription};

/// Errors that can occur during synchronization operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// An I/O error occurred during local file operations
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// The native watch could not be established
    #[error("Failed to watch {path}: {reason}")]
    WatchFailed { path: PathBuf, reason: String },

    /// The folder does not exist and `auto_create` is off
    #[error("Watched directory does not exist: {0}")]
    MissingDirectory(PathBuf),

    /// A remote store call failed
    #[error("Remote store error: {0}")]
    Store(#[from] StoreError),

    /// The backup preceding an overwrite failed
    #[error(transparent)]
    Backup(#[from] ConflictError),

    /// A domain-level error propagated from autosync-core
    #[error("Domain error: {0}")]
    DomainError(#[from] DomainError),
}

impl SyncError {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Store(err) => err.is_transient(),
            SyncError::Backup(err) => err.is_transient(),
            SyncError::IoError(err) => matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Short classification used as a log field
    pub fn class(&self) -> &'static str {
        match self {
            SyncError::IoError(_) => "local_io",
            SyncError::WatchFailed { .. } => "watch",
            SyncError::MissingDirectory(_) => "missing_directory",
            SyncError::Store(err) => err.class(),
            SyncError::Backup(_) => "backup",
            SyncError::DomainError(_) => "configuration",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::Store(StoreError::Timeout(10)).is_transient());
        assert!(!SyncError::Store(StoreError::PermissionDenied("k".into())).is_transient());
        assert!(SyncError::IoError(std::io::Error::from(std::io::ErrorKind::TimedOut)).is_transient());
        assert!(!SyncError::IoError(std::io::Error::from(std::io::ErrorKind::NotFound)).is_transient());
        assert!(!SyncError::MissingDirectory(PathBuf::from("/x")).is_transient());
    }

    #[test]
    fn test_backup_failure_follows_store_error() {
        let err = SyncError::from(ConflictError::BackupFailed {
            source_key: "k".into(),
            backup_key: "k.bak-1".into(),
            error: StoreError::Transient("503".into()),
        });
        assert!(err.is_transient());
        assert_eq!(err.class(), "backup");
    }
}
