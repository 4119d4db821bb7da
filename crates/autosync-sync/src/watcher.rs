//! File watching and debounced change queue
//!
//! A [`WatchSource`] turns native filesystem notifications for a directory
//! tree into a stream of [`WatchEvent`] values. [`NotifyWatchSource`] is the
//! production adapter over the `notify` crate.
//!
//! The [`DebouncedChangeQueue`] collects rapid-fire events and coalesces them
//! so that downstream consumers only see the final state of a path after it
//! has been quiet for the debounce window. On platforms that report file
//! closes, a written file is only released once its close has been seen.
//!
//! ## Architecture
//!
//! ```text
//! inotify / kqueue / ...
//!       │
//!       ▼
//!  WatchSource ──→ WatchSubscription ──→ DebouncedChangeQueue ──→ SyncCoordinator
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::SyncError;

/// Capacity of the channel between the native watcher thread and its consumer
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Pending entries still waiting for a close after this long are dropped
const STALE_PENDING_AFTER: Duration = Duration::from_secs(3600);

// ============================================================================
// ChangeKind / WatchEvent
// ============================================================================

/// Kind of change observed for one path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// A new file appeared
    Created,
    /// Content was written; the writer may still hold the file open
    Modified,
    /// A writer closed the file, or a complete file was moved into place
    Closed,
    /// The file is gone
    Deleted,
}

/// A filesystem change detected by a [`WatchSource`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl WatchEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

// ============================================================================
// WatchSource capability
// ============================================================================

/// Platform-specific source of filesystem notifications
pub trait WatchSource: Send + Sync {
    /// Starts watching `root` recursively
    ///
    /// Events flow until the returned subscription is dropped.
    fn subscribe(&self, root: &Path) -> Result<WatchSubscription, SyncError>;

    /// Whether this source emits [`ChangeKind::Closed`] after writes
    fn supports_close_events(&self) -> bool;
}

/// Live watch on a directory tree
///
/// Holds whatever keeps the native watch alive; dropping the subscription
/// stops it.
pub struct WatchSubscription {
    events: mpsc::Receiver<WatchEvent>,
    _guard: Box<dyn Any + Send>,
}

impl WatchSubscription {
    pub fn new(events: mpsc::Receiver<WatchEvent>, guard: impl Any + Send) -> Self {
        Self {
            events,
            _guard: Box::new(guard),
        }
    }

    /// Next event; `None` once the source has shut down
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }
}

impl std::fmt::Debug for WatchSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSubscription").finish_non_exhaustive()
    }
}

// ============================================================================
// NotifyWatchSource
// ============================================================================

/// Watches directories using the OS-native mechanism via `notify`
///
/// On Linux this uses inotify, which reports `IN_CLOSE_WRITE`; other
/// backends fall back to debounce-only settling.
#[derive(Debug, Default, Clone)]
pub struct NotifyWatchSource;

impl NotifyWatchSource {
    pub fn new() -> Self {
        Self
    }
}

impl WatchSource for NotifyWatchSource {
    fn subscribe(&self, root: &Path) -> Result<WatchSubscription, SyncError> {
        if !root.is_dir() {
            return Err(SyncError::MissingDirectory(root.to_path_buf()));
        }

        let (event_tx, event_rx) = mpsc::channel::<WatchEvent>(EVENT_CHANNEL_CAPACITY);
        let watch_failed = |err: notify::Error| SyncError::WatchFailed {
            path: root.to_path_buf(),
            reason: err.to_string(),
        };

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    for change in map_notify_event(&event) {
                        if let Err(e) = event_tx.blocking_send(change) {
                            warn!(error = %e, "Failed to send change event (receiver dropped)");
                            return;
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "File watcher error");
                }
            },
            notify::Config::default(),
        )
        .map_err(watch_failed)?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(watch_failed)?;

        info!(path = %root.display(), "Started recursive watch");
        Ok(WatchSubscription::new(event_rx, watcher))
    }

    fn supports_close_events(&self) -> bool {
        cfg!(target_os = "linux")
    }
}

// ============================================================================
// Event mapping - notify::Event → WatchEvent
// ============================================================================

/// Converts a `notify::Event` into zero or more [`WatchEvent`]s
///
/// - `Create(Folder)`, `Remove(Folder)`, metadata changes and reads are ignored
/// - `Create(*)` → `Created`, `Modify(Data | Any | Other)` → `Modified`
/// - `Access(Close(Write))` → `Closed`
/// - rename target → `Closed`, rename source → `Deleted`
/// - `Remove(*)` → `Deleted`
pub(crate) fn map_notify_event(event: &notify::Event) -> Vec<WatchEvent> {
    let paths = &event.paths;
    let Some(first) = paths.first() else {
        return Vec::new();
    };
    let one = |kind| vec![WatchEvent::new(first.clone(), kind)];

    match &event.kind {
        EventKind::Create(CreateKind::Folder) => Vec::new(),
        EventKind::Create(_) => one(ChangeKind::Created),

        EventKind::Access(AccessKind::Close(AccessMode::Write)) => one(ChangeKind::Closed),

        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::To => one(ChangeKind::Closed),
            RenameMode::From => one(ChangeKind::Deleted),
            RenameMode::Both => {
                let mut changes = vec![WatchEvent::new(first.clone(), ChangeKind::Deleted)];
                if let Some(new) = paths.get(1) {
                    changes.push(WatchEvent::new(new.clone(), ChangeKind::Closed));
                }
                changes
            }
            _ => {
                if first.exists() {
                    one(ChangeKind::Closed)
                } else {
                    one(ChangeKind::Deleted)
                }
            }
        },
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => one(ChangeKind::Modified),

        EventKind::Remove(RemoveKind::Folder) => Vec::new(),
        EventKind::Remove(_) => one(ChangeKind::Deleted),

        _ => {
            debug!(kind = ?event.kind, "Ignoring event kind");
            Vec::new()
        }
    }
}

// ============================================================================
// DebouncedChangeQueue
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct PendingChange {
    kind: ChangeKind,
    last_event: Instant,
    closed: bool,
}

/// Queue that coalesces rapid filesystem changes into debounced events
///
/// Multiple events for one path collapse into one entry whose timer is
/// reset by every event. An entry settles once it has been quiet for the
/// debounce delay and, when `require_close` is set, a close has been seen
/// since its last write. Deletions never wait for a close.
pub struct DebouncedChangeQueue {
    pending: HashMap<PathBuf, PendingChange>,
    debounce_delay: Duration,
    require_close: bool,
}

impl DebouncedChangeQueue {
    /// Creates a queue
    ///
    /// # Arguments
    /// * `debounce_delay` - How long a path must be quiet before its event is emitted
    /// * `require_close` - Hold written files until a `Closed` event arrives
    pub fn new(debounce_delay: Duration, require_close: bool) -> Self {
        Self {
            pending: HashMap::new(),
            debounce_delay,
            require_close,
        }
    }

    /// Inserts or updates the pending change for the event's path
    pub fn push(&mut self, event: WatchEvent) {
        let now = Instant::now();
        let entry = self.pending.entry(event.path).or_insert(PendingChange {
            kind: event.kind,
            last_event: now,
            closed: false,
        });
        entry.last_event = now;
        entry.kind = event.kind;
        entry.closed = event.kind == ChangeKind::Closed;
    }

    /// Removes and returns every change that has settled
    pub fn poll(&mut self) -> Vec<WatchEvent> {
        let now = Instant::now();
        let mut settled = Vec::new();

        self.pending.retain(|path, change| {
            let quiet = now.duration_since(change.last_event);
            if quiet < self.debounce_delay {
                return true;
            }
            let ready = change.closed || !self.require_close || change.kind == ChangeKind::Deleted;
            if ready {
                settled.push(WatchEvent::new(path.clone(), change.kind));
                return false;
            }
            if quiet >= STALE_PENDING_AFTER {
                debug!(path = %path.display(), "Dropping change that never closed");
                return false;
            }
            true
        });

        if !settled.is_empty() {
            debug!(count = settled.len(), "Polled settled change events");
        }
        settled
    }

    /// Whether `path` has a change that has not settled yet
    pub fn is_pending(&self, path: &Path) -> bool {
        self.pending.contains_key(path)
    }

    /// Returns the number of pending (unsettled) events
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if there are no pending events
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::DataChange;

    fn ev(path: &str, kind: ChangeKind) -> WatchEvent {
        WatchEvent::new(path, kind)
    }

    fn notify_event(kind: EventKind, paths: &[&str]) -> notify::Event {
        notify::Event {
            kind,
            paths: paths.iter().map(PathBuf::from).collect(),
            attrs: Default::default(),
        }
    }

    // ------------------------------------------------------------------
    // DebouncedChangeQueue
    // ------------------------------------------------------------------

    #[test]
    fn test_push_coalesces_same_path() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_millis(100), false);
        queue.push(ev("/a.txt", ChangeKind::Created));
        queue.push(ev("/a.txt", ChangeKind::Modified));
        queue.push(ev("/b.txt", ChangeKind::Modified));
        assert_eq!(queue.pending_count(), 2);
    }

    #[test]
    fn test_many_modifies_yield_one_event() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_millis(0), false);
        for _ in 0..50 {
            queue.push(ev("/a.txt", ChangeKind::Modified));
        }
        std::thread::sleep(Duration::from_millis(5));
        let settled = queue.poll();
        assert_eq!(settled, vec![ev("/a.txt", ChangeKind::Modified)]);
        assert!(queue.poll().is_empty());
    }

    #[test]
    fn test_poll_returns_nothing_for_recent_events() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_secs(60), false);
        queue.push(ev("/a.txt", ChangeKind::Created));
        assert!(queue.poll().is_empty());
        assert_eq!(queue.pending_count(), 1);
    }

    #[test]
    fn test_coalescing_resets_timestamp() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_millis(50), false);
        queue.push(ev("/a.txt", ChangeKind::Created));
        std::thread::sleep(Duration::from_millis(30));
        queue.push(ev("/a.txt", ChangeKind::Modified));
        std::thread::sleep(Duration::from_millis(30));
        assert!(queue.poll().is_empty());

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(queue.poll(), vec![ev("/a.txt", ChangeKind::Modified)]);
    }

    #[test]
    fn test_write_held_until_close() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_millis(0), true);
        queue.push(ev("/a.txt", ChangeKind::Created));
        queue.push(ev("/a.txt", ChangeKind::Modified));
        std::thread::sleep(Duration::from_millis(5));
        assert!(queue.poll().is_empty());
        assert_eq!(queue.pending_count(), 1);

        queue.push(ev("/a.txt", ChangeKind::Closed));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(queue.poll(), vec![ev("/a.txt", ChangeKind::Closed)]);
    }

    #[test]
    fn test_write_after_close_reopens_entry() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_millis(0), true);
        queue.push(ev("/a.txt", ChangeKind::Closed));
        queue.push(ev("/a.txt", ChangeKind::Modified));
        std::thread::sleep(Duration::from_millis(5));
        assert!(queue.poll().is_empty());
    }

    #[test]
    fn test_delete_settles_without_close() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_millis(0), true);
        queue.push(ev("/a.txt", ChangeKind::Modified));
        queue.push(ev("/a.txt", ChangeKind::Deleted));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(queue.poll(), vec![ev("/a.txt", ChangeKind::Deleted)]);
    }

    #[test]
    fn test_without_close_support_debounce_is_enough() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_millis(0), false);
        queue.push(ev("/a.txt", ChangeKind::Modified));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(queue.poll().len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_poll_partial_settlement() {
        let mut queue = DebouncedChangeQueue::new(Duration::from_millis(50), false);
        queue.push(ev("/old.txt", ChangeKind::Created));
        std::thread::sleep(Duration::from_millis(60));
        queue.push(ev("/new.txt", ChangeKind::Created));

        assert_eq!(queue.poll(), vec![ev("/old.txt", ChangeKind::Created)]);
        assert_eq!(queue.pending_count(), 1);
    }

    // ------------------------------------------------------------------
    // Event mapping
    // ------------------------------------------------------------------

    #[test]
    fn test_map_create_event() {
        let mapped = map_notify_event(&notify_event(
            EventKind::Create(CreateKind::File),
            &["/a.txt"],
        ));
        assert_eq!(mapped, vec![ev("/a.txt", ChangeKind::Created)]);
    }

    #[test]
    fn test_map_folder_events_ignored() {
        assert!(
            map_notify_event(&notify_event(EventKind::Create(CreateKind::Folder), &["/d"]))
                .is_empty()
        );
        assert!(
            map_notify_event(&notify_event(EventKind::Remove(RemoveKind::Folder), &["/d"]))
                .is_empty()
        );
    }

    #[test]
    fn test_map_modify_data_event() {
        let mapped = map_notify_event(&notify_event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &["/a.txt"],
        ));
        assert_eq!(mapped, vec![ev("/a.txt", ChangeKind::Modified)]);
    }

    #[test]
    fn test_map_close_write_event() {
        let mapped = map_notify_event(&notify_event(
            EventKind::Access(AccessKind::Close(AccessMode::Write)),
            &["/a.txt"],
        ));
        assert_eq!(mapped, vec![ev("/a.txt", ChangeKind::Closed)]);
    }

    #[test]
    fn test_map_close_after_read_ignored() {
        let mapped = map_notify_event(&notify_event(
            EventKind::Access(AccessKind::Close(AccessMode::Read)),
            &["/a.txt"],
        ));
        assert!(mapped.is_empty());
    }

    #[test]
    fn test_map_rename_both() {
        let mapped = map_notify_event(&notify_event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/.a.txt.autosync-tmp", "/a.txt"],
        ));
        assert_eq!(
            mapped,
            vec![
                ev("/.a.txt.autosync-tmp", ChangeKind::Deleted),
                ev("/a.txt", ChangeKind::Closed),
            ]
        );
    }

    #[test]
    fn test_map_rename_halves() {
        let from = map_notify_event(&notify_event(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            &["/old.txt"],
        ));
        assert_eq!(from, vec![ev("/old.txt", ChangeKind::Deleted)]);

        let to = map_notify_event(&notify_event(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            &["/new.txt"],
        ));
        assert_eq!(to, vec![ev("/new.txt", ChangeKind::Closed)]);
    }

    #[test]
    fn test_map_metadata_ignored() {
        let mapped = map_notify_event(&notify_event(
            EventKind::Modify(ModifyKind::Metadata(notify::event::MetadataKind::Permissions)),
            &["/a.txt"],
        ));
        assert!(mapped.is_empty());
    }

    #[test]
    fn test_map_remove_event() {
        let mapped = map_notify_event(&notify_event(
            EventKind::Remove(RemoveKind::File),
            &["/a.txt"],
        ));
        assert_eq!(mapped, vec![ev("/a.txt", ChangeKind::Deleted)]);
    }

    #[test]
    fn test_map_event_no_paths() {
        assert!(map_notify_event(&notify_event(EventKind::Create(CreateKind::File), &[])).is_empty());
    }

    // ------------------------------------------------------------------
    // NotifyWatchSource
    // ------------------------------------------------------------------

    #[test]
    fn test_subscribe_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = NotifyWatchSource::new().subscribe(&missing).unwrap_err();
        assert!(matches!(err, SyncError::MissingDirectory(p) if p == missing));
    }

    #[tokio::test]
    async fn test_subscribe_reports_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut sub = NotifyWatchSource::new().subscribe(dir.path()).unwrap();
        let file = dir.path().join("a.txt");
        tokio::fs::write(&file, b"hello").await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match sub.next().await {
                    Some(e) if e.path.ends_with("a.txt") => return Some(e),
                    Some(_) => continue,
                    None => return None,
                }
            }
        })
        .await
        .unwrap()
        .unwrap();
        assert!(event.path.ends_with("a.txt"));
    }
}
