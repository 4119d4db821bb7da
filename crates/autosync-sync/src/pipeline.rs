//! Folder pipeline - settles watch events into sync requests
//!
//! The [`FolderPipeline`] sits between a folder's [`WatchSubscription`] and
//! its [`SyncCoordinator`](crate::engine::SyncCoordinator). It drops events
//! the folder's filter rejects, feeds the rest through a
//! [`DebouncedChangeQueue`], and forwards each settled path.
//!
//! ## Flow
//!
//! ```text
//! WatchSubscription ──→ FolderPipeline ──→ mpsc::Sender<PathBuf> ──→ SyncCoordinator
//!                             │
//!                      DebouncedChangeQueue
//! ```
//!
//! Paths waiting in the queue are published as [`UnsettledPaths`] so the
//! coordinator's reconciliation leaves them alone.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use autosync_core::domain::WatchedFolder;

use crate::filesystem::LocalFileSystemAdapter;
use crate::watcher::{DebouncedChangeQueue, WatchSubscription};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Paths with watch events that have not settled yet
#[derive(Debug, Clone, Default)]
pub struct UnsettledPaths(Arc<DashMap<PathBuf, ()>>);

impl UnsettledPaths {
    pub fn contains(&self, path: &Path) -> bool {
        self.0.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn mark(&self, path: &Path) {
        self.0.insert(path.to_path_buf(), ());
    }

    fn sync_with(&self, queue: &DebouncedChangeQueue) {
        self.0.retain(|path, _| queue.is_pending(path));
    }
}

/// Turns the raw events of one folder into settled sync requests
pub struct FolderPipeline {
    folder: Arc<WatchedFolder>,
    queue: DebouncedChangeQueue,
    unsettled: UnsettledPaths,
    poll_interval: Duration,
}

impl FolderPipeline {
    /// # Arguments
    /// * `debounce` - Quiet period before a path is forwarded
    /// * `require_close` - Whether the watch source reports closes, so
    ///   written files wait for theirs
    pub fn new(folder: Arc<WatchedFolder>, debounce: Duration, require_close: bool) -> Self {
        Self {
            folder,
            queue: DebouncedChangeQueue::new(debounce, require_close),
            unsettled: UnsettledPaths::default(),
            poll_interval: (debounce / 4).clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL),
        }
    }

    /// Publishes queued paths into `unsettled`
    pub fn with_unsettled(mut self, unsettled: UnsettledPaths) -> Self {
        self.unsettled = unsettled;
        self
    }

    /// Whether events for `path` are relevant to this folder
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
    pub async fn run(
        mut self,
        mut subscription: WatchSubscription,
        output: mpsc::Sender<PathBuf>,
        shutdown: CancellationToken,
    ) {
        info!(folder = %self.folder.path().display(), "Folder pipeline started");
        let mut poll_timer = tokio::time::interval(self.poll_interval);
        poll_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        'events: loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = subscription.next() => match event {
                    Some(event) if self.observes(&event.path) => {
                        debug!(path = %event.path.display(), kind = ?event.kind, "Change observed");
                        self.unsettled.mark(&event.path);
                        self.queue.push(event);
                    }
                    Some(_) => {}
                    None => {
                        info!(folder = %self.folder.path().display(), "Watch ended");
                        break;
                    }
                },
                _ = poll_timer.tick() => {
                    let settled = self.queue.poll();
                    self.unsettled.sync_with(&self.queue);
                    for event in settled {
                        // A full channel must not hold up shutdown.
                        tokio::select! {
                            biased;
                            _ = shutdown.cancelled() => break 'events,
                            sent = output.send(event.path) => if sent.is_err() {
                                debug!("Coordinator gone, stopping pipeline");
                                return;
                            },
                        }
                    }
                }
            }
        }

        info!(
            folder = %self.folder.path().display(),
            dropped = self.queue.pending_count(),
            "Folder pipeline stopped"
        );
    }
}
