//! Domain entities and business logic
//!
//! This module contains the core domain types for autosync:
//! - Watched folders and their filter rules
//! - Local and remote state snapshots, plus the last-synced marker
//! - Sync decisions and backup records
//! - Monitored databases and dump jobs
//! - Domain-specific error types

pub mod database;
pub mod decision;
pub mod errors;
pub mod folder;
pub mod records;

// Re-export commonly used types
pub use database::{
    parse_interval, DbEndpoint, DbMonitor, DumpJob, DumpOutcome, DumpSchedule, ParameterTarget,
};
pub use decision::{
    BackupRecord, BackupSource, ConflictWinner, DecisionReason, SyncAction, SyncDecision,
};
pub use errors::{DomainError, StoreError};
pub use folder::{normalize_prefix, CredentialOverride, FilterEngine, Priority, WatchedFolder};
pub use records::{FileRecord, RemoteObjectRecord, SyncMarker};
