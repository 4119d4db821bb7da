//! Per-folder synchronization coordinator
//!
//! [`SyncCoordinator`] owns the decide+execute loop of one watched folder:
//!
//! 1. take the path's lock, then a worker permit
//! 2. stat the local file and HEAD the remote object (fresh, every time)
//! 3. ask the [`ConflictResolver`] for a decision
//! 4. back up whatever the decision overwrites; a failed backup aborts
//! 5. transfer, record the sync marker and broadcast a [`TransferOutcome`]
//!
//! Live events arrive through [`SyncCoordinator::run`]; events for a path
//! already in flight are coalesced into a single follow-up pass.
//! [`SyncCoordinator::reconcile`] walks the local tree and the remote
//! prefix and pushes every candidate through the same path. Files still
//! being written, by the debounce window or by pending watch events, are
//! left to the live path.
//!
//! A coordinator in [`SyncMode::UploadOnly`] never writes locally. Its
//! reconciliation ignores remote-only keys and holds back the newest local
//! file, which an appending writer may still have open.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use autosync_conflict::{BackupManager, BackupNamer, ConflictResolver};
use autosync_core::config::SyncConfig;
use autosync_core::domain::{
    BackupRecord, DecisionReason, SyncAction, SyncDecision, SyncMarker, WatchedFolder,
};
use autosync_core::ports::{ObjectLocation, RemoteObjectStore};

use crate::filesystem::LocalFileSystemAdapter;
use crate::locks::PathLockTable;
use crate::markers::{FailureFingerprint, SyncStateTable};
use crate::pipeline::UnsettledPaths;
use crate::retry::{with_retry, RetryPolicy};
use crate::SyncError;

// ============================================================================
// Settings and reports
// ============================================================================

/// Engine tuning shared by every folder
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Paths processed concurrently per folder
    pub workers: usize,
    pub debounce: Duration,
    pub reconcile_interval: Duration,
    pub mtime_tolerance: Duration,
    /// Time in-flight transfers get after shutdown is requested
    pub shutdown_grace: Duration,
    pub skip_empty_files: bool,
    pub retry: RetryPolicy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl SyncSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            workers: config.workers_per_folder.max(1),
            debounce: config.debounce(),
            reconcile_interval: config.reconcile_interval(),
            mtime_tolerance: config.mtime_tolerance(),
            shutdown_grace: config.shutdown_grace(),
            skip_empty_files: config.skip_empty_files,
            retry: RetryPolicy::from_config(config),
        }
    }
}

/// Directions a coordinator moves content in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncMode {
    /// Whatever the conflict table decides
    #[default]
    TwoWay,
    /// Local to remote only, for append-only folders such as binary logs
    UploadOnly,
}

/// A completed transfer, broadcast to interested components
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    /// Root of the watched folder
    pub folder: PathBuf,
    pub local_path: PathBuf,
    pub bucket: String,
    pub key: String,
    pub action: SyncAction,
    pub backup: Option<BackupRecord>,
}

/// Result of processing one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathOutcome {
    /// Content moved; `action` is the decision as reached
    Transferred {
        action: SyncAction,
        backup: Option<BackupRecord>,
    },
    Skipped(DecisionReason),
    /// Outside the folder or rejected by its filter
    Ignored,
}

/// Counters of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub examined: usize,
    pub uploaded: usize,
    pub downloaded: usize,
    pub backups: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Paths cut off by shutdown
    pub incomplete: Vec<PathBuf>,
}

impl ReconcileReport {
    pub fn transfers(&self) -> usize {
        self.uploaded + self.downloaded
    }

    fn record(&mut self, path: &Path, result: Result<PathOutcome, SyncError>) {
        self.examined += 1;
        match result {
            Ok(PathOutcome::Transferred { action, backup }) => {
                if action.is_upload() {
                    self.uploaded += 1;
                } else {
                    self.downloaded += 1;
                }
                if backup.is_some() {
                    self.backups += 1;
                }
            }
            Ok(_) => self.skipped += 1,
            Err(err) => {
                self.failed += 1;
                log_failure(path, &err);
            }
        }
    }
}

/// What a coordinator left behind when it stopped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub folder: PathBuf,
    /// Worker passes that ran to completion
    pub completed: usize,
    /// Paths whose transfer was cancelled or never started
    pub incomplete: Vec<PathBuf>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.incomplete.is_empty()
    }
}

// ============================================================================
// SyncCoordinator
// ============================================================================

/// Decides and executes sync actions for one watched folder
pub struct SyncCoordinator {
    folder: Arc<WatchedFolder>,
    store: Arc<dyn RemoteObjectStore>,
    backups: BackupManager,
    resolver: ConflictResolver,
    fs: LocalFileSystemAdapter,
    locks: PathLockTable,
    state: SyncStateTable,
    permits: Semaphore,
    settings: SyncSettings,
    mode: SyncMode,
    unsettled: UnsettledPaths,
    outcomes: broadcast::Sender<TransferOutcome>,
}

impl SyncCoordinator {
    pub fn new(
        folder: Arc<WatchedFolder>,
        store: Arc<dyn RemoteObjectStore>,
        settings: SyncSettings,
        outcomes: broadcast::Sender<TransferOutcome>,
    ) -> Self {
        Self {
            backups: BackupManager::new(Arc::clone(&store)),
            resolver: ConflictResolver::new(settings.mtime_tolerance),
            fs: LocalFileSystemAdapter::new(),
            locks: PathLockTable::new(),
            state: SyncStateTable::new(),
            permits: Semaphore::new(settings.workers),
            folder,
            store,
            settings,
            mode: SyncMode::TwoWay,
            unsettled: UnsettledPaths::default(),
            outcomes,
        }
    }

    pub fn with_mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    /// Paths reconciliation must leave to the live pipeline
    pub fn with_unsettled(mut self, unsettled: UnsettledPaths) -> Self {
        self.unsettled = unsettled;
        self
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn folder(&self) -> &WatchedFolder {
        &self.folder
    }

    pub fn state(&self) -> &SyncStateTable {
        &self.state
    }

    /// Relative path of `path` when this folder syncs it
    fn observed_relative(&self, path: &Path) -> Option<String> {
        if LocalFileSystemAdapter::is_temp_path(path) {
            return None;
        }
        let relative = self.folder.relative_path(path)?;
        self.folder.accepts(&relative).then_some(relative)
    }

    /// Brings one path in sync, holding its lock throughout
    #[instrument(skip(self), fields(folder = %self.folder.path().display(), path = %path.display()))]
    pub async fn sync_path(&self, path: &Path) -> Result<PathOutcome, SyncError> {
        let Some(relative) = self.observed_relative(path) else {
            return Ok(PathOutcome::Ignored);
        };

        let _lock = self.locks.acquire(path).await;
        let Ok(_permit) = self.permits.acquire().await else {
            return Ok(PathOutcome::Ignored);
        };

        let location = ObjectLocation::new(
            self.folder.bucket(),
            self.folder.remote_key(&relative),
            self.folder.credentials().cloned(),
        );
        let retry = &self.settings.retry;

        let local = self.fs.stat(path, &relative).await?;
        let remote = with_retry("head", retry, || self.store.head(&location)).await?;

        let fingerprint = FailureFingerprint::of(&local, &remote);
        if self.state.is_known_failure(path, &fingerprint) {
            debug!("Path failed permanently in this state, skipping");
            return Ok(PathOutcome::Skipped(DecisionReason::PermanentFailure));
        }

        let marker = self.state.marker(path);
        let mut decision =
            self.resolver
                .decide(local, remote, self.folder.priority(), marker.as_ref());
        if self.settings.skip_empty_files && decision.action.is_upload() && decision.local.size == 0
        {
            decision = decision.into_skip(DecisionReason::EmptyLocalFile);
        }
        if self.mode == SyncMode::UploadOnly && decision.action.is_download() {
            decision = decision.into_skip(DecisionReason::DownloadDisabled);
        }

        match self.apply(&decision, &location).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                // Backup failures stay eligible for the next reconciliation.
                if !err.is_transient() && !matches!(err, SyncError::Backup(_)) {
                    self.state.record_failure(path, fingerprint);
                }
                Err(err)
            }
        }
    }

    async fn apply(
        &self,
        decision: &SyncDecision,
        location: &ObjectLocation,
    ) -> Result<PathOutcome, SyncError> {
        let path = decision.local.path.as_path();
        let action = decision.action.resolved();

        if action == SyncAction::Skip {
            match decision.reason {
                DecisionReason::WithinTolerance => self.state.record_sync(
                    path,
                    SyncMarker::capture(&decision.local, &decision.remote),
                ),
                DecisionReason::BothMissing => self.state.forget(path),
                _ => {}
            }
            debug!(reason = %decision.reason, "Nothing to do");
            return Ok(PathOutcome::Skipped(decision.reason));
        }

        let backup = if action.needs_backup() {
            with_retry("backup", &self.settings.retry, || {
                self.backups.backup_for(decision, location)
            })
            .await?
        } else {
            None
        };

        let marker = if action.is_upload() {
            self.upload(decision, location).await?
        } else {
            self.download(decision, location).await?
        };
        self.state.record_sync(path, marker);

        info!(
            key = %location.key,
            action = %decision.action,
            reason = %decision.reason,
            backup_key = backup.as_ref().map(|b| b.backup_key.as_str()),
            "Decision executed"
        );

        // No subscribers is fine.
        let _ = self.outcomes.send(TransferOutcome {
            folder: self.folder.path().to_path_buf(),
            local_path: path.to_path_buf(),
            bucket: location.bucket.clone(),
            key: location.key.clone(),
            action: decision.action,
            backup: backup.clone(),
        });

        Ok(PathOutcome::Transferred {
            action: decision.action,
            backup,
        })
    }

    async fn upload(
        &self,
        decision: &SyncDecision,
        location: &ObjectLocation,
    ) -> Result<SyncMarker, SyncError> {
        let retry = &self.settings.retry;
        let source = decision.local.path.as_path();
        with_retry("put", retry, || {
            self.store.put(location, source, decision.local.modified)
        })
        .await?;
        let remote = with_retry("head", retry, || self.store.head(location)).await?;
        Ok(SyncMarker::capture(&decision.local, &remote))
    }

    async fn download(
        &self,
        decision: &SyncDecision,
        location: &ObjectLocation,
    ) -> Result<SyncMarker, SyncError> {
        let target = decision.local.path.as_path();
        if let Some(parent) = target.parent() {
            self.fs.ensure_dir(parent).await?;
        }

        let staged = LocalFileSystemAdapter::temp_path_for(target);
        let fetched = with_retry("get", &self.settings.retry, || {
            self.store.get(location, &staged)
        })
        .await;
        if let Err(err) = fetched {
            self.fs.discard(&staged).await;
            return Err(err);
        }
        if let Err(err) = self
            .fs
            .commit(&staged, target, decision.remote.content_modified())
            .await
        {
            self.fs.discard(&staged).await;
            return Err(err.into());
        }

        let local = self.fs.stat(target, &decision.local.relative_path).await?;
        Ok(SyncMarker::capture(&local, &decision.remote))
    }

    // ========================================================================
    // Live event loop
    // ========================================================================

    /// Processes paths from `paths` until the channel closes or `shutdown`
    /// fires
    ///
    /// On shutdown, intake stops at once; in-flight work gets the grace
    /// period and is then aborted and reported as incomplete.
    pub async fn run(
        self: Arc<Self>,
        mut paths: mpsc::Receiver<PathBuf>,
        shutdown: CancellationToken,
    ) -> ShutdownReport {
        let in_flight: Arc<DashMap<PathBuf, bool>> = Arc::new(DashMap::new());
        let mut workers: JoinSet<PathBuf> = JoinSet::new();
        let mut completed = 0usize;

        info!(
            folder = %self.folder.path().display(),
            workers = self.settings.workers,
            "Sync coordinator started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if joined.is_ok() {
                        completed += 1;
                    }
                }
                next = paths.recv() => match next {
                    Some(path) => self.dispatch(path, &mut workers, &in_flight),
                    None => break,
                },
            }
        }

        paths.close();
        let mut incomplete = Vec::new();
        while let Ok(path) = paths.try_recv() {
            incomplete.push(path);
        }

        let grace = if shutdown.is_cancelled() {
            self.settings.shutdown_grace
        } else {
            Duration::MAX
        };
        drain_with_grace(&mut workers, grace, |_| completed += 1).await;

        incomplete.extend(in_flight.iter().map(|entry| entry.key().clone()));
        incomplete.sort();
        incomplete.dedup();

        let report = ShutdownReport {
            folder: self.folder.path().to_path_buf(),
            completed,
            incomplete,
        };
        if report.is_clean() {
            info!(folder = %report.folder.display(), completed, "Sync coordinator stopped");
        } else {
            warn!(
                folder = %report.folder.display(),
                completed,
                incomplete = report.incomplete.len(),
                paths = ?report.incomplete,
                "Sync coordinator stopped with incomplete transfers"
            );
        }
        report
    }

    fn dispatch(
        self: &Arc<Self>,
        path: PathBuf,
        workers: &mut JoinSet<PathBuf>,
        in_flight: &Arc<DashMap<PathBuf, bool>>,
    ) {
        match in_flight.entry(path.clone()) {
            Entry::Occupied(mut entry) => {
                *entry.get_mut() = true;
                debug!(path = %path.display(), "Coalesced into in-flight sync");
            }
            Entry::Vacant(entry) => {
                entry.insert(false);
                let this = Arc::clone(self);
                let in_flight = Arc::clone(in_flight);
                workers.spawn(async move { this.work(path, in_flight).await });
            }
        }
    }

    /// Syncs `path`, once more for every burst of events that arrived
    /// meanwhile
    async fn work(self: Arc<Self>, path: PathBuf, in_flight: Arc<DashMap<PathBuf, bool>>) -> PathBuf {
        loop {
            if let Err(err) = self.sync_path(&path).await {
                log_failure(&path, &err);
            }
            if in_flight.remove_if(&path, |_, dirty| !*dirty).is_some() {
                break;
            }
            if let Some(mut dirty) = in_flight.get_mut(&path) {
                *dirty = false;
            }
        }
        path
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Full comparison of the local tree and the remote prefix
    #[instrument(skip(self, shutdown), fields(folder = %self.folder.path().display()))]
    pub async fn reconcile(
        self: &Arc<Self>,
        shutdown: &CancellationToken,
    ) -> Result<ReconcileReport, SyncError> {
        let candidates = self.reconcile_candidates().await?;
        debug!(candidates = candidates.len(), "Reconciliation started");

        let mut report = ReconcileReport::default();
        let mut pending = BTreeSet::new();
        let mut tasks: JoinSet<(PathBuf, Result<PathOutcome, SyncError>)> = JoinSet::new();

        for path in candidates {
            if shutdown.is_cancelled() {
                break;
            }
            pending.insert(path.clone());
            let this = Arc::clone(self);
            tasks.spawn(async move {
                let result = this.sync_path(&path).await;
                (path, result)
            });
        }

        let mut on_done = |(path, result): (PathBuf, Result<PathOutcome, SyncError>)| {
            pending.remove(&path);
            report.record(&path, result);
        };

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    drain_with_grace(&mut tasks, self.settings.shutdown_grace, &mut on_done).await;
                    break;
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok(done)) => on_done(done),
                    Some(Err(err)) => error!(error = %err, "Reconciliation task failed"),
                    None => break,
                },
            }
        }

        report.incomplete = pending.into_iter().collect();
        info!(
            examined = report.examined,
            uploaded = report.uploaded,
            downloaded = report.downloaded,
            backups = report.backups,
            skipped = report.skipped,
            failed = report.failed,
            "Reconciliation finished"
        );
        Ok(report)
    }

    async fn reconcile_candidates(&self) -> Result<BTreeSet<PathBuf>, SyncError> {
        let local: Vec<PathBuf> = self
            .fs
            .walk(self.folder.path())
            .await?
            .into_iter()
            .filter(|p| self.observed_relative(p).is_some())
            .collect();

        // Keys already claimed by a local file are not mapped back; without
        // preserve_path several local files may flatten onto one key.
        let claimed: BTreeSet<String> = local
            .iter()
            .filter_map(|p| self.folder.relative_path(p))
            .map(|rel| self.folder.remote_key(&rel))
            .collect();

        let mut stamped = Vec::with_capacity(local.len());
        for path in local {
            match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
                Ok(at) => stamped.push((at, path)),
                Err(err) => debug!(path = %path.display(), error = %err, "Vanished during walk"),
            }
        }

        // The newest file of an upload-only folder is the segment still
        // being appended to.
        let active = match self.mode {
            SyncMode::UploadOnly => stamped.iter().max().map(|(_, path)| path.clone()),
            SyncMode::TwoWay => None,
        };

        let settled = stamped.into_iter().filter_map(|(at, path)| {
            if active.as_ref() == Some(&path) {
                debug!(path = %path.display(), "Holding back the active file");
                return None;
            }
            if self.unsettled.contains(&path) {
                debug!(path = %path.display(), "Watch events pending, left to the pipeline");
                return None;
            }
            // Future timestamps count as settled.
            if at.elapsed().is_ok_and(|age| age < self.settings.debounce) {
                debug!(path = %path.display(), "Modified within the debounce window");
                return None;
            }
            Some(path)
        });

        if self.mode == SyncMode::UploadOnly {
            return Ok(settled.collect());
        }

        let mut candidates: BTreeSet<PathBuf> = settled.collect();

        let listing = with_retry("list", &self.settings.retry, || {
            self.store.list(
                self.folder.bucket(),
                self.folder.key_prefix(),
                self.folder.credentials(),
            )
        })
        .await?;

        for object in listing {
            if BackupNamer::is_backup_key(&object.key) || claimed.contains(&object.key) {
                continue;
            }
            if let Some(local) = self.folder.local_path_for_key(&object.key) {
                if self.observed_relative(&local).is_some() && !self.unsettled.contains(&local) {
                    candidates.insert(local);
                }
            }
        }
        Ok(candidates)
    }
}

/// Waits up to `grace` for `tasks`, then aborts what is left
async fn drain_with_grace<T: 'static>(
    tasks: &mut JoinSet<T>,
    grace: Duration,
    mut on_done: impl FnMut(T),
) {
    let drained = tokio::time::timeout(grace, async {
        while let Some(joined) = tasks.join_next().await {
            if let Ok(value) = joined {
                on_done(value);
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(remaining = tasks.len(), "Grace period elapsed, aborting transfers");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

fn log_failure(path: &Path, err: &SyncError) {
    if err.is_transient() || matches!(err, SyncError::Backup(_)) {
        warn!(
            path = %path.display(),
            class = err.class(),
            error = %err,
            "Sync failed, will retry"
        );
    } else {
        error!(
            path = %path.display(),
            class = err.class(),
            error = %err,
            "Sync failed permanently, skipping until the path changes"
        );
    }
}

// ============================================================================
// Unit tests
// ============================================================================
