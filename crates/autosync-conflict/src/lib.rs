//! autosync conflict - sync decisions and backups
//!
//! Provides:
//! - [`ConflictResolver`]: turns a local/remote snapshot pair into a
//!   [`SyncDecision`](autosync_core::domain::SyncDecision)
//! - [`BackupManager`]: preserves whichever side a decision overwrites
//! - [`BackupNamer`]: deterministic backup key naming

pub mod backup;
pub mod error;
pub mod namer;
pub mod resolver;

pub use backup::BackupManager;
pub use error::ConflictError;
pub use namer::BackupNamer;
pub use resolver::ConflictResolver;
