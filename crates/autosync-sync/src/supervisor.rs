//! Folder supervisor
//!
//! Brings a watched folder to life: makes sure its directory exists,
//! establishes the watch, and spawns the coordinator, the event pipeline
//! and the periodic reconciliation. Failures here are scoped to the folder
//! being started.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use autosync_core::domain::WatchedFolder;
use autosync_core::ports::RemoteObjectStore;

use crate::engine::{ShutdownReport, SyncCoordinator, SyncMode, SyncSettings, TransferOutcome};
use crate::pipeline::{FolderPipeline, UnsettledPaths};
use crate::watcher::{WatchSource, WatchSubscription};
use crate::SyncError;

/// Buffered paths between a pipeline and its coordinator
const PATH_CHANNEL_CAPACITY: usize = 1024;

/// Buffered transfer outcomes per subscriber
const OUTCOME_CHANNEL_CAPACITY: usize = 256;

/// Running tasks of one folder
pub struct FolderHandle {
    folder: Arc<WatchedFolder>,
    sender: mpsc::Sender<PathBuf>,
    unsettled: UnsettledPaths,
    coordinator: JoinHandle<ShutdownReport>,
    background: Vec<JoinHandle<()>>,
}

impl FolderHandle {
    pub fn folder(&self) -> &WatchedFolder {
        &self.folder
    }

    /// Enqueues paths directly, bypassing the debounce queue
    pub fn sender(&self) -> mpsc::Sender<PathBuf> {
        self.sender.clone()
    }

    /// Ties another task to this folder's lifetime
    pub fn attach(&mut self, task: JoinHandle<()>) {
        self.background.push(task);
    }

    /// Waits for every task of the folder to stop
    pub async fn join(self) -> ShutdownReport {
        for task in self.background {
            if let Err(e) = task.await {
                error!(folder = %self.folder.path().display(), error = %e, "Folder task failed");
            }
        }
        drop(self.sender);
        match self.coordinator.await {
            Ok(report) => report,
            Err(e) => {
                error!(folder = %self.folder.path().display(), error = %e, "Coordinator task failed");
                ShutdownReport {
                    folder: self.folder.path().to_path_buf(),
                    ..Default::default()
                }
            }
        }
    }
}

/// Starts and wires the per-folder machinery
pub struct FolderSupervisor {
    store: Arc<dyn RemoteObjectStore>,
    watch_source: Arc<dyn WatchSource>,
    settings: SyncSettings,
    outcomes: broadcast::Sender<TransferOutcome>,
    shutdown: CancellationToken,
}

impl FolderSupervisor {
    pub fn new(
        store: Arc<dyn RemoteObjectStore>,
        watch_source: Arc<dyn WatchSource>,
        settings: SyncSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Self {
            store,
            watch_source,
            settings,
            outcomes,
            shutdown,
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Every transfer completed by any folder from now on
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<TransferOutcome> {
        self.outcomes.subscribe()
    }

    pub fn supports_close_events(&self) -> bool {
        self.watch_source.supports_close_events()
    }

    /// Creates the folder's directory when allowed, otherwise requires it
    pub fn prepare(&self, folder: &WatchedFolder) -> Result<(), SyncError> {
        let path = folder.path();
        if path.is_dir() {
            return Ok(());
        }
        if !folder.auto_create() {
            return Err(SyncError::MissingDirectory(path.to_path_buf()));
        }
        std::fs::create_dir_all(path)?;
        info!(path = %path.display(), "Created watched directory");
        Ok(())
    }

    /// Prepares the folder and establishes its watch
    pub fn subscribe(&self, folder: &WatchedFolder) -> Result<WatchSubscription, SyncError> {
        self.prepare(folder)?;
        self.watch_source.subscribe(folder.path())
    }

    /// Spawns the coordinator and reconciliation loop, without a watch
    ///
    /// Callers that consume the folder's events themselves feed paths
    /// through [`FolderHandle::sender`].
    pub fn start_coordinator(
        &self,
        folder: WatchedFolder,
        mode: SyncMode,
    ) -> Result<FolderHandle, SyncError> {
        self.prepare(&folder)?;
        let folder = Arc::new(folder);
        let unsettled = UnsettledPaths::default();
        let coordinator = Arc::new(
            SyncCoordinator::new(
                Arc::clone(&folder),
                Arc::clone(&self.store),
                self.settings.clone(),
                self.outcomes.clone(),
            )
            .with_mode(mode)
            .with_unsettled(unsettled.clone()),
        );

        let (sender, receiver) = mpsc::channel(PATH_CHANNEL_CAPACITY);
        let run = tokio::spawn(Arc::clone(&coordinator).run(receiver, self.shutdown.clone()));
        let reconcile = tokio::spawn(reconcile_loop(
            coordinator,
            self.settings.reconcile_interval,
            self.shutdown.clone(),
        ));

        Ok(FolderHandle {
            folder,
            sender,
            unsettled,
            coordinator: run,
            background: vec![reconcile],
        })
    }

    /// Starts a folder end to end: watch, pipeline, coordinator
    pub fn start(&self, folder: WatchedFolder) -> Result<FolderHandle, SyncError> {
        let subscription = self.subscribe(&folder)?;
        let mut handle = self.start_coordinator(folder, SyncMode::TwoWay)?;

        let pipeline = FolderPipeline::new(
            Arc::clone(&handle.folder),
            self.settings.debounce,
            self.watch_source.supports_close_events(),
        )
        .with_unsettled(handle.unsettled.clone());
        let task = tokio::spawn(pipeline.run(
            subscription,
            handle.sender(),
            self.shutdown.clone(),
        ));
        handle.attach(task);

        info!(
            folder = %handle.folder.path().display(),
            bucket = handle.folder.bucket(),
            prefix = handle.folder.key_prefix(),
            "Folder started"
        );
        Ok(handle)
    }
}

async fn reconcile_loop(
    coordinator: Arc<SyncCoordinator>,
    interval: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match coordinator.reconcile(&shutdown).await {
                    Ok(report) if !report.incomplete.is_empty() => warn!(
                        folder = %coordinator.folder().path().display(),
                        incomplete = report.incomplete.len(),
                        paths = ?report.incomplete,
                        "Reconciliation interrupted"
                    ),
                    Ok(_) => {}
                    Err(err) => warn!(
                        folder = %coordinator.folder().path().display(),
                        class = err.class(),
                        error = %err,
                        "Reconciliation failed"
                    ),
                }
            }
        }
    }
}
