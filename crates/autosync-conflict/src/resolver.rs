//! Sync decision core
//!
//! [`ConflictResolver::decide`] maps a fresh local/remote snapshot pair to
//! a [`SyncDecision`]:
//!
//! | local | remote | marker | outcome |
//! |---|---|---|---|
//! | no | no | - | `Skip` |
//! | yes | no | - | `Upload` |
//! | no | yes | - | `Download` |
//! | yes | yes | only local changed | `Upload` |
//! | yes | yes | only remote changed | `Download` |
//! | yes | yes | both changed | `Conflict`, winner picked by priority |
//! | yes | yes | neither changed | `Skip` |
//! | yes | yes | absent | newer side wins, loser always backed up |
//!
//! Without a marker, timestamps that agree within the tolerance mean the
//! sides are already in sync.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::trace;

use autosync_core::domain::{
    ConflictWinner, DecisionReason, FileRecord, Priority, RemoteObjectRecord, SyncAction,
    SyncDecision, SyncMarker,
};

/// Default tolerance for comparing local and remote timestamps
pub const DEFAULT_MTIME_TOLERANCE: Duration = Duration::from_secs(1);

/// Produces sync decisions; holds no per-path state
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    tolerance: chrono::Duration,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(DEFAULT_MTIME_TOLERANCE)
    }
}

impl ConflictResolver {
    pub fn new(tolerance: Duration) -> Self {
        Self {
            tolerance: chrono::Duration::from_std(tolerance)
                .unwrap_or_else(|_| chrono::Duration::seconds(1)),
        }
    }

    /// Decides what to do with one path
    ///
    /// `marker` is the last-known-synced state of the path, if any.
    pub fn decide(
        &self,
        local: FileRecord,
        remote: RemoteObjectRecord,
        priority: Priority,
        marker: Option<&SyncMarker>,
    ) -> SyncDecision {
        let (action, reason) = self.classify(&local, &remote, priority, marker);
        trace!(
            path = %local.path.display(),
            key = %remote.key,
            %action,
            %reason,
            "Decision reached"
        );
        SyncDecision::new(action, reason, local, remote)
    }

    fn classify(
        &self,
        local: &FileRecord,
        remote: &RemoteObjectRecord,
        priority: Priority,
        marker: Option<&SyncMarker>,
    ) -> (SyncAction, DecisionReason) {
        match (local.exists, remote.exists) {
            (false, false) => (SyncAction::Skip, DecisionReason::BothMissing),
            (true, false) => (SyncAction::Upload, DecisionReason::LocalOnly),
            (false, true) => (SyncAction::Download, DecisionReason::RemoteOnly),
            (true, true) => match marker {
                Some(marker) => {
                    match (marker.local_changed(local), marker.remote_changed(remote)) {
                        (false, false) => (SyncAction::Skip, DecisionReason::Unchanged),
                        (true, false) => (SyncAction::Upload, DecisionReason::LocalChanged),
                        (false, true) => (SyncAction::Download, DecisionReason::RemoteChanged),
                        (true, true) => (
                            SyncAction::Conflict(winner(priority)),
                            DecisionReason::BothChanged,
                        ),
                    }
                }
                None => self.cold_start(local, remote),
            },
        }
    }

    // No marker: any divergence is treated as a conflict, so whichever side
    // is replaced gets backed up.
    fn cold_start(
        &self,
        local: &FileRecord,
        remote: &RemoteObjectRecord,
    ) -> (SyncAction, DecisionReason) {
        let local_mtime = local.modified;
        let remote_mtime = remote.content_modified();

        if self.within_tolerance(local_mtime, remote_mtime) {
            return (SyncAction::Skip, DecisionReason::WithinTolerance);
        }
        if local_mtime > remote_mtime {
            (
                SyncAction::BackupThenUpload,
                DecisionReason::ColdStartLocalNewer,
            )
        } else {
            (
                SyncAction::BackupThenDownload,
                DecisionReason::ColdStartRemoteNewer,
            )
        }
    }

    fn within_tolerance(&self, a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
        match (a, b) {
            (Some(a), Some(b)) => (a - b).abs() <= self.tolerance,
            _ => false,
        }
    }
}

fn winner(priority: Priority) -> ConflictWinner {
    match priority {
        Priority::Local => ConflictWinner::Local,
        Priority::RemoteStore => ConflictWinner::Remote,
    }
}
