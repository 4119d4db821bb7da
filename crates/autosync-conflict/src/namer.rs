//! Backup key naming
//!
//! Backups live next to the object they preserve, following the pattern
//! `<key>.bak-<unix milliseconds>`. The timestamp is the decision time,
//! so retrying the same decision rewrites the same key.

use chrono::{DateTime, Utc};

const BACKUP_MARKER: &str = ".bak-";

/// Generates and recognizes backup keys
pub struct BackupNamer;

impl BackupNamer {
    /// Backup key for `key` taken by a decision made at `decided_at`
    pub fn backup_key(key: &str, decided_at: DateTime<Utc>) -> String {
        format!("{key}{BACKUP_MARKER}{}", decided_at.timestamp_millis())
    }

    /// Whether `key` was produced by [`BackupNamer::backup_key`]
    pub fn is_backup_key(key: &str) -> bool {
        match key.rsplit_once(BACKUP_MARKER) {
            Some((original, stamp)) => {
                !original.is_empty()
                    && !stamp.is_empty()
                    && stamp.bytes().all(|b| b.is_ascii_digit())
            }
            None => false,
        }
    }
}
