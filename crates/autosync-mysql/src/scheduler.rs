//! Periodic dump jobs per monitored database
//!
//! Each [`MysqlDumpScheduler`] owns one database's dump timer. Ticks and
//! explicit requests (see [`DumpTrigger`]) start a job unless one is still
//! running, so at most one dump per database is ever in flight. The
//! produced file is handed to the dump folder's coordinator; once the
//! coordinator reports its upload, the file's `s3://bucket/key` location
//! is written to the configured parameter. Dump jobs and parameter writes
//! run as tasks, so retries never hold up the timer or shutdown.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use autosync_core::domain::{DbMonitor, DumpJob, DumpSchedule, ParameterTarget, WatchedFolder};
use autosync_core::ports::{DumpProducer, ParameterStore};
use autosync_sync::retry::with_retry;
use autosync_sync::{RetryPolicy, TransferOutcome};

use crate::DumpError;

/// Requests an out-of-schedule dump
///
/// Requests made while one is already queued collapse into it.
#[derive(Debug, Clone)]
pub struct DumpTrigger {
    sender: mpsc::Sender<()>,
}

impl DumpTrigger {
    pub fn new(sender: mpsc::Sender<()>) -> Self {
        Self { sender }
    }

    /// Returns false when a request was already pending or the scheduler
    /// has stopped
    pub fn request(&self) -> bool {
        self.sender.try_send(()).is_ok()
    }
}

/// Shared state of a scheduler and its running job
struct DumpContext {
    monitor: Arc<DbMonitor>,
    schedule: DumpSchedule,
    producer: Arc<dyn DumpProducer>,
    parameters: Arc<dyn ParameterStore>,
    retry: RetryPolicy,
    in_flight: AtomicBool,
    /// Produced files waiting for their upload
    pending: DashMap<PathBuf, DumpJob>,
}

/// Resets the in-flight flag even if the job panics
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Dump timer of one database
pub struct MysqlDumpScheduler {
    context: Arc<DumpContext>,
    trigger: DumpTrigger,
    requests: mpsc::Receiver<()>,
}

impl MysqlDumpScheduler {
    pub fn new(
        monitor: Arc<DbMonitor>,
        producer: Arc<dyn DumpProducer>,
        parameters: Arc<dyn ParameterStore>,
        retry: RetryPolicy,
    ) -> Result<Self, DumpError> {
        let schedule = monitor
            .dumps
            .clone()
            .ok_or_else(|| DumpError::NotScheduled(monitor.name.clone()))?;
        let (sender, requests) = mpsc::channel(1);

        Ok(Self {
            context: Arc::new(DumpContext {
                monitor,
                schedule,
                producer,
                parameters,
                retry,
                in_flight: AtomicBool::new(false),
                pending: DashMap::new(),
            }),
            trigger: DumpTrigger::new(sender),
            requests,
        })
    }

    pub fn trigger(&self) -> DumpTrigger {
        self.trigger.clone()
    }

    /// Folder the dumps are written into
    pub fn dump_folder(&self) -> &WatchedFolder {
        &self.context.schedule.folder
    }

    /// Runs the timer until `shutdown` fires or the outcome stream ends
    ///
    /// # Arguments
    /// * `outcomes` - Transfers reported by the coordinators
    /// * `uploads` - Path sender of the dump folder's coordinator
    pub async fn run(
        mut self,
        mut outcomes: broadcast::Receiver<TransferOutcome>,
        uploads: mpsc::Sender<PathBuf>,
        shutdown: CancellationToken,
    ) {
        let interval = self.context.schedule.interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut jobs = JoinSet::new();

        info!(
            database = %self.context.monitor.name,
            interval_secs = interval.as_secs(),
            folder = %self.context.schedule.folder.path().display(),
            "Dump scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => launch(&self.context, &mut jobs, &uploads),
                Some(()) = self.requests.recv() => {
                    debug!(database = %self.context.monitor.name, "Dump requested");
                    launch(&self.context, &mut jobs, &uploads);
                }
                received = outcomes.recv() => match received {
                    Ok(outcome) => on_transfer(&self.context, &mut jobs, &outcome),
                    Err(RecvError::Lagged(missed)) => warn!(
                        database = %self.context.monitor.name,
                        missed,
                        "Transfer outcomes dropped"
                    ),
                    Err(RecvError::Closed) => break,
                },
                Some(result) = jobs.join_next() => {
                    if let Err(e) = result {
                        error!(database = %self.context.monitor.name, error = %e, "Dump scheduler task failed");
                    }
                }
            }
        }

        if !jobs.is_empty() {
            warn!(
                database = %self.context.monitor.name,
                tasks = jobs.len(),
                "Cancelling running dump tasks"
            );
        }
        jobs.shutdown().await;
        info!(database = %self.context.monitor.name, "Dump scheduler stopped");
    }
}

fn launch(context: &Arc<DumpContext>, jobs: &mut JoinSet<()>, uploads: &mpsc::Sender<PathBuf>) {
    if context.in_flight.swap(true, Ordering::AcqRel) {
        debug!(database = %context.monitor.name, "Dump already running, request coalesced");
        return;
    }
    let context = Arc::clone(context);
    let uploads = uploads.clone();
    jobs.spawn(async move {
        let _guard = InFlightGuard(&context.in_flight);
        context.run_job(&uploads).await;
    });
}

impl DumpContext {
    async fn run_job(&self, uploads: &mpsc::Sender<PathBuf>) {
        let mut job = DumpJob::new(self.monitor.name.as_str());
        info!(database = %self.monitor.name, job = %job.id, "Dump started");

        match self
            .producer
            .produce(&self.monitor, self.schedule.folder.path())
            .await
        {
            Ok(file) => {
                job.produced(file.clone());
                self.pending.retain(|path, _| path.exists());
                self.pending.insert(file.clone(), job);
                if uploads.send(file).await.is_err() {
                    debug!("Dump folder coordinator gone");
                }
            }
            Err(err) => {
                job.failed(format!("{err:#}"));
                error!(
                    database = %self.monitor.name,
                    job = %job.id,
                    error = %format!("{err:#}"),
                    "Dump failed"
                );
            }
        }
    }

    async fn publish(&self, parameter: &ParameterTarget, location: &str) {
        let written = with_retry("put_parameter", &self.retry, || {
            self.parameters
                .put(&parameter.name, location, parameter.credentials.as_ref())
        })
        .await;
        match written {
            Ok(()) => info!(parameter = %parameter.name, location = %location, "Latest dump location published"),
            Err(err) => error!(
                parameter = %parameter.name,
                class = err.class(),
                error = %err,
                "Failed to publish latest dump location"
            ),
        }
    }
}

/// Marks the uploaded dump and spawns the write of its location
fn on_transfer(context: &Arc<DumpContext>, jobs: &mut JoinSet<()>, outcome: &TransferOutcome) {
    if !outcome.action.is_upload() {
        return;
    }
    let Some((_, mut job)) = context.pending.remove(&outcome.local_path) else {
        return;
    };

    let location = format!("s3://{}/{}", outcome.bucket, outcome.key);
    job.uploaded(location.clone());
    info!(database = %context.monitor.name, job = %job.id, location = %location, "Dump uploaded");

    let Some(parameter) = context.schedule.parameter.clone() else {
        return;
    };
    let context = Arc::clone(context);
    jobs.spawn(async move { context.publish(&parameter, &location).await });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use autosync_core::config::{
        BinLogsConfig, DumpsConfig, FolderConfig, IntervalValue, MysqlConfig, S3TargetConfig,
        SsmBackupConfig,
    };
    use autosync_core::domain::{CredentialOverride, StoreError, SyncAction};
    use autosync_core::ports::MemoryParameterStore;
    use tokio::sync::Semaphore;

    /// Writes numbered files; each call waits for a permit
    struct FakeProducer {
        calls: AtomicUsize,
        gate: Semaphore,
    }

    impl FakeProducer {
        fn open() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(Semaphore::MAX_PERMITS),
            }
        }

        fn gated() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl DumpProducer for FakeProducer {
        async fn produce(&self, _monitor: &DbMonitor, destination: &Path) -> anyhow::Result<PathBuf> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.gate.acquire().await?.forget();
            std::fs::create_dir_all(destination)?;
            let path = destination.join(format!("shop-{n}.sql"));
            std::fs::write(&path, "-- dump")?;
            Ok(path)
        }
    }

    fn monitor(dumps: &Path, parameter: Option<&str>) -> Arc<DbMonitor> {
        let config = MysqlConfig {
            hostname: Some("db".into()),
            username: Some("backup".into()),
            database: Some("shop".into()),
            bin_logs: Some(BinLogsConfig {
                path: Some(PathBuf::from("/var/lib/mysql")),
                folder: Some(FolderConfig {
                    s3: Some(S3TargetConfig {
                        bucket_name: Some("backups".into()),
                        key_prefix: Some("db".into()),
                        ..Default::default()
                    }),
                    whitelist_regex: vec![r"mariadb-bin\.[0-9]+$".into()],
                    ..Default::default()
                }),
            }),
            dumps: Some(DumpsConfig {
                path: Some(dumps.to_path_buf()),
                interval: Some(IntervalValue::Text("1m".into())),
                ssm_backup: parameter.map(|name| SsmBackupConfig {
                    parameter_name: Some(name.into()),
                    iam_override: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        Arc::new(DbMonitor::from_config("main", &config).unwrap())
    }

    fn retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            call_timeout: Duration::from_secs(5),
        }
    }

    fn uploaded(path: &Path, key: &str) -> TransferOutcome {
        TransferOutcome {
            folder: path.parent().unwrap().to_path_buf(),
            local_path: path.to_path_buf(),
            bucket: "backups".into(),
            key: key.into(),
            action: SyncAction::Upload,
            backup: None,
        }
    }

    struct Harness {
        outcomes: broadcast::Sender<TransferOutcome>,
        uploads: mpsc::Receiver<PathBuf>,
        trigger: DumpTrigger,
        token: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(scheduler: MysqlDumpScheduler) -> Harness {
        let (outcomes, outcome_rx) = broadcast::channel(16);
        let (upload_tx, uploads) = mpsc::channel(16);
        let token = CancellationToken::new();
        let trigger = scheduler.trigger();
        let task = tokio::spawn(scheduler.run(outcome_rx, upload_tx, token.clone()));
        Harness {
            outcomes,
            uploads,
            trigger,
            token,
            task,
        }
    }

    #[test]
    fn test_monitor_without_dumps_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = (*monitor(dir.path(), None)).clone();
        monitor.dumps = None;
        let result = MysqlDumpScheduler::new(
            Arc::new(monitor),
            Arc::new(FakeProducer::open()),
            Arc::new(MemoryParameterStore::new()),
            retry(),
        );
        assert!(matches!(result, Err(DumpError::NotScheduled(name)) if name == "main"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_tick_produces_dump() {
        let dir = tempfile::tempdir().unwrap();
        let producer = Arc::new(FakeProducer::open());
        let scheduler = MysqlDumpScheduler::new(
            monitor(dir.path(), None),
            producer.clone(),
            Arc::new(MemoryParameterStore::new()),
            retry(),
        )
        .unwrap();
        assert_eq!(scheduler.dump_folder().path(), dir.path());
        let mut h = start(scheduler);

        let file = tokio::time::timeout(Duration::from_secs(61), h.uploads.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(file, dir.path().join("shop-1.sql"));
        assert_eq!(producer.calls.load(Ordering::SeqCst), 1);

        h.token.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_coalesce_while_dump_runs() {
        let dir = tempfile::tempdir().unwrap();
        let producer = Arc::new(FakeProducer::gated());
        let scheduler = MysqlDumpScheduler::new(
            monitor(dir.path(), None),
            producer.clone(),
            Arc::new(MemoryParameterStore::new()),
            retry(),
        )
        .unwrap();
        let mut h = start(scheduler);

        assert!(h.trigger.request());
        while producer.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for _ in 0..5 {
            h.trigger.request();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(producer.calls.load(Ordering::SeqCst), 1);

        producer.gate.add_permits(1);
        let file = tokio::time::timeout(Duration::from_secs(2), h.uploads.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(file, dir.path().join("shop-1.sql"));
        assert_eq!(producer.calls.load(Ordering::SeqCst), 1);

        h.token.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_upload_publishes_location() {
        let dir = tempfile::tempdir().unwrap();
        let parameters = Arc::new(MemoryParameterStore::new());
        let scheduler = MysqlDumpScheduler::new(
            monitor(dir.path(), Some("/backups/shop/latest")),
            Arc::new(FakeProducer::open()),
            parameters.clone(),
            retry(),
        )
        .unwrap();
        let mut h = start(scheduler);

        h.trigger.request();
        let file = h.uploads.recv().await.unwrap();

        // An unrelated upload publishes nothing.
        h.outcomes
            .send(uploaded(&dir.path().join("other.sql"), "db/main/dumps/other.sql"))
            .unwrap();
        h.outcomes
            .send(uploaded(&file, "db/main/dumps/shop-1.sql"))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while parameters.value("/backups/shop/latest").is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            parameters.writes(),
            vec![(
                "/backups/shop/latest".to_string(),
                "s3://backups/db/main/dumps/shop-1.sql".to_string()
            )]
        );

        h.token.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_parameter_failure_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let parameters = Arc::new(MemoryParameterStore::new());
        parameters.fail_next(StoreError::Transient("throttled".into()));
        let scheduler = MysqlDumpScheduler::new(
            monitor(dir.path(), Some("/latest")),
            Arc::new(FakeProducer::open()),
            parameters.clone(),
            retry(),
        )
        .unwrap();
        let mut h = start(scheduler);

        h.trigger.request();
        let file = h.uploads.recv().await.unwrap();
        h.outcomes.send(uploaded(&file, "k.sql")).unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while parameters.value("/latest").is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(parameters.value("/latest").as_deref(), Some("s3://backups/k.sql"));

        h.token.cancel();
        h.task.await.unwrap();
    }

    /// Parameter store that is always throttled
    struct ThrottledParameterStore {
        attempts: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ParameterStore for ThrottledParameterStore {
        async fn put(
            &self,
            _name: &str,
            _value: &str,
            _credentials: Option<&CredentialOverride>,
        ) -> Result<(), StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Transient("throttled".into()))
        }

        async fn get(
            &self,
            _name: &str,
            _credentials: Option<&CredentialOverride>,
        ) -> Result<Option<String>, StoreError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_publish_backoff_does_not_block_dumps_or_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let parameters = Arc::new(ThrottledParameterStore {
            attempts: AtomicUsize::new(0),
        });
        let producer = Arc::new(FakeProducer::open());
        let scheduler = MysqlDumpScheduler::new(
            monitor(dir.path(), Some("/latest")),
            producer.clone(),
            parameters.clone(),
            RetryPolicy {
                max_retries: 5,
                base_delay: Duration::from_secs(30),
                call_timeout: Duration::from_secs(5),
            },
        )
        .unwrap();
        let mut h = start(scheduler);

        h.trigger.request();
        let file = h.uploads.recv().await.unwrap();
        h.outcomes.send(uploaded(&file, "k.sql")).unwrap();
        while parameters.attempts.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // The write is now backing off; the scheduler still serves requests.
        let second = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                h.trigger.request();
                let next = tokio::time::timeout(Duration::from_millis(50), h.uploads.recv()).await;
                if let Ok(Some(path)) = next {
                    return path;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(second, dir.path().join("shop-2.sql"));

        h.token.cancel();
        tokio::time::timeout(Duration::from_secs(2), h.task)
            .await
            .expect("scheduler should stop while a write is backing off")
            .unwrap();
        assert_eq!(parameters.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stops_when_outcomes_close() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = MysqlDumpScheduler::new(
            monitor(dir.path(), None),
            Arc::new(FakeProducer::open()),
            Arc::new(MemoryParameterStore::new()),
            retry(),
        )
        .unwrap();
        let h = start(scheduler);
        drop(h.outcomes);

        tokio::time::timeout(Duration::from_secs(2), h.task)
            .await
            .unwrap()
            .unwrap();
    }
}
