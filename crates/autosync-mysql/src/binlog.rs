//! Binary log rotation detection
//!
//! The server appends to one binary log segment at a time and opens a new
//! one on rotation. A segment is shipped once it is sealed:
//!
//! - where the watch source reports closes, a `Closed` event for an
//!   accepted segment seals it;
//! - elsewhere, a segment that has been quiet for the debounce window is
//!   shipped, and the first quiet segment with a new name counts as a
//!   rotation.
//!
//! Sealed segments go to the bin_logs folder's coordinator. With
//! `trigger_on_rotation`, each rotation also requests a dump.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use autosync_core::domain::WatchedFolder;
use autosync_sync::filesystem::LocalFileSystemAdapter;
use autosync_sync::watcher::DebouncedChangeQueue;
use autosync_sync::{ChangeKind, WatchSubscription};

use crate::scheduler::DumpTrigger;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Ships sealed binary log segments of one database
pub struct BinlogRotationDetector {
    folder: Arc<WatchedFolder>,
    uploads: mpsc::Sender<PathBuf>,
    dump_trigger: Option<DumpTrigger>,
    /// Quiet-period detection, used when closes are not reported
    fallback: Option<DebouncedChangeQueue>,
    last_segment: Option<PathBuf>,
    poll_interval: Duration,
}

impl BinlogRotationDetector {
    /// # Arguments
    /// * `uploads` - Path sender of the bin_logs folder's coordinator
    /// * `close_events` - Whether the watch source reports closes
    /// * `debounce` - Quiet period used when it does not
    pub fn new(
        folder: Arc<WatchedFolder>,
        uploads: mpsc::Sender<PathBuf>,
        close_events: bool,
        debounce: Duration,
    ) -> Self {
        Self {
            folder,
            uploads,
            dump_trigger: None,
            fallback: (!close_events).then(|| DebouncedChangeQueue::new(debounce, false)),
            last_segment: None,
            poll_interval: (debounce / 4).clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL),
        }
    }

    /// Requests a dump on every rotation
    pub fn with_dump_trigger(mut self, trigger: DumpTrigger) -> Self {
        self.dump_trigger = Some(trigger);
        self
    }

    /// Whether `path` is a binary log segment of this folder
    pub fn observes(&self, path: &Path) -> bool {
        if LocalFileSystemAdapter::is_temp_path(path) {
            return false;
        }
        self.folder
            .relative_path(path)
            .is_some_and(|rel| self.folder.accepts(&rel))
    }

    /// Runs until `shutdown` fires, the watch ends or the coordinator goes
    /// away
    pub async fn run(mut self, mut subscription: WatchSubscription, shutdown: CancellationToken) {
        info!(
            folder = %self.folder.path().display(),
            close_events = self.fallback.is_none(),
            "Binlog rotation detector started"
        );
        let mut poll_timer = tokio::time::interval(self.poll_interval);
        poll_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = subscription.next() => match event {
                    Some(event) if self.observes(&event.path) => {
                        let sealed = match (&mut self.fallback, event.kind) {
                            (_, ChangeKind::Deleted) => None,
                            (None, ChangeKind::Closed) => Some(event.path),
                            (None, _) => None,
                            (Some(queue), _) => {
                                queue.push(event);
                                None
                            }
                        };
                        if let Some(path) = sealed {
                            if !self.seal(path).await {
                                return;
                            }
                        }
                    }
                    Some(_) => {}
                    None => {
                        info!(folder = %self.folder.path().display(), "Watch ended");
                        break;
                    }
                },
                _ = poll_timer.tick(), if self.fallback.is_some() => {
                    let settled = self
                        .fallback
                        .as_mut()
                        .map(DebouncedChangeQueue::poll)
                        .unwrap_or_default();
                    for event in settled {
                        if !self.seal(event.path).await {
                            return;
                        }
                    }
                }
            }
        }

        info!(folder = %self.folder.path().display(), "Binlog rotation detector stopped");
    }

    /// Hands a sealed segment to the coordinator; false once it is gone
    async fn seal(&mut self, path: PathBuf) -> bool {
        let rotated = match (&self.fallback, &self.last_segment) {
            (None, _) => true,
            (Some(_), Some(last)) => *last != path,
            (Some(_), None) => false,
        };
        self.last_segment = Some(path.clone());

        debug!(path = %path.display(), rotated, "Binlog segment sealed");
        if self.uploads.send(path.clone()).await.is_err() {
            debug!("Coordinator gone, stopping rotation detector");
            return false;
        }

        if rotated {
            if let Some(trigger) = &self.dump_trigger {
                let queued = trigger.request();
                info!(path = %path.display(), queued, "Binlog rotated, dump requested");
            }
        }
        true
    }
}
