//! autosync daemon - keeps local folders and database backups in sync with S3
//!
//! This binary runs as a long-lived service and handles:
//! - One coordinator, watch and reconciliation loop per configured folder
//! - Binary log shipping and scheduled dumps per configured database
//! - Graceful shutdown on SIGTERM/SIGINT
//!
//! # Architecture
//!
//! The configuration is read once at startup. Every valid folder and
//! database is started through a [`FolderSupervisor`]; invalid entries are
//! logged and skipped. All tasks share one `CancellationToken` that is
//! triggered on receipt of SIGTERM or SIGINT, after which every folder is
//! joined and its incomplete transfers are reported.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use autosync_aws::{S3ObjectStore, SsmParameterStore};
use autosync_core::config::{Config, LoggingConfig, DEFAULT_CONFIG_ENV_VAR};
use autosync_core::domain::{DbMonitor, WatchedFolder};
use autosync_core::ports::{DumpProducer, ParameterStore, RemoteObjectStore};
use autosync_mysql::{BinlogRotationDetector, MysqlDumpProducer, MysqlDumpScheduler};
use autosync_sync::{FolderHandle, FolderSupervisor, NotifyWatchSource, SyncMode, SyncSettings};

/// Exit status when no configuration source was given
const USAGE_EXIT_CODE: i32 = 2;

// ============================================================================
// Command line
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "autosyncd",
    version,
    about = "Keeps local folders and database backups in sync with S3"
)]
struct Cli {
    /// Read the configuration document from this file
    #[arg(long, value_name = "PATH", conflicts_with = "from_env_var")]
    from_file: Option<PathBuf>,

    /// Read the configuration document from this environment variable
    #[arg(long, value_name = "NAME")]
    from_env_var: Option<String>,
}

/// Where the configuration document comes from
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConfigSource {
    File(PathBuf),
    EnvVar(String),
}

impl ConfigSource {
    /// Picks the source named on the command line, falling back to the
    /// default variable when it is set
    fn resolve(cli: &Cli, fallback_present: bool) -> Option<Self> {
        match (&cli.from_file, &cli.from_env_var) {
            (Some(path), _) => Some(Self::File(path.clone())),
            (None, Some(name)) => Some(Self::EnvVar(name.clone())),
            (None, None) if fallback_present => {
                Some(Self::EnvVar(DEFAULT_CONFIG_ENV_VAR.to_string()))
            }
            (None, None) => None,
        }
    }

    fn load(&self) -> Result<Config> {
        match self {
            Self::File(path) => Config::load(path),
            Self::EnvVar(name) => Config::from_env_var(name),
        }
    }
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(path) => write!(f, "file {}", path.display()),
            Self::EnvVar(name) => write!(f, "environment variable {name}"),
        }
    }
}

// ============================================================================
// Logging
// ============================================================================

/// Installs the global subscriber; `RUST_LOG` overrides the configured level
fn init_tracing(logging: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}

/// Splits validation problems into fatal ones and ones that only disable
/// a single folder or database
fn check_config(config: &Config) -> Result<()> {
    let errors = config.validate();
    let mut fatal = 0usize;
    for err in &errors {
        if err.is_scoped() {
            warn!(field = %err.field, error = %err.message, "Configuration entry disabled");
        } else {
            error!(field = %err.field, error = %err.message, "Invalid configuration");
            fatal += 1;
        }
    }
    if fatal > 0 {
        anyhow::bail!("Configuration has {fatal} fatal error(s)");
    }
    Ok(())
}

// ============================================================================
// DaemonService
// ============================================================================

/// Wires the configured folders and databases and runs them to shutdown
struct DaemonService {
    config: Config,
    supervisor: FolderSupervisor,
    producer: Arc<dyn DumpProducer>,
    parameters: Arc<dyn ParameterStore>,
}

impl DaemonService {
    fn new(
        config: Config,
        store: Arc<dyn RemoteObjectStore>,
        parameters: Arc<dyn ParameterStore>,
        shutdown: CancellationToken,
    ) -> Self {
        let supervisor = FolderSupervisor::new(
            store,
            Arc::new(NotifyWatchSource::new()),
            SyncSettings::from_config(&config.sync),
            shutdown,
        );
        Self {
            config,
            supervisor,
            producer: Arc::new(MysqlDumpProducer::default()),
            parameters,
        }
    }

    /// Starts every valid entry; entries that fail are logged and skipped
    fn start(&self) -> Vec<FolderHandle> {
        let mut handles = Vec::new();

        for (path, folder_config) in &self.config.folders {
            // Invalid entries were reported by validation.
            let Ok(folder) = WatchedFolder::from_config(path, folder_config) else {
                continue;
            };
            match self.supervisor.start(folder) {
                Ok(handle) => handles.push(handle),
                Err(e) => error!(
                    folder = %path.display(),
                    class = e.class(),
                    error = %e,
                    "Folder disabled"
                ),
            }
        }

        for (name, db_config) in &self.config.mysql_db {
            let Ok(monitor) = DbMonitor::from_config(name, db_config) else {
                continue;
            };
            if let Err(e) = self.start_database(Arc::new(monitor), &mut handles) {
                error!(database = %name, error = %format!("{e:#}"), "Database disabled");
            }
        }

        handles
    }

    /// Starts the dump folder and scheduler, then the binlog folder and its
    /// rotation detector
    fn start_database(&self, monitor: Arc<DbMonitor>, handles: &mut Vec<FolderHandle>) -> Result<()> {
        let shutdown = self.supervisor.shutdown_token();
        let mut trigger = None;

        if let Some(schedule) = &monitor.dumps {
            let scheduler = MysqlDumpScheduler::new(
                Arc::clone(&monitor),
                Arc::clone(&self.producer),
                Arc::clone(&self.parameters),
                self.supervisor.settings().retry,
            )?;
            let mut handle = self
                .supervisor
                .start(schedule.folder.clone())
                .context("Failed to start dump folder")?;
            if schedule.trigger_on_rotation {
                trigger = Some(scheduler.trigger());
            }
            handle.attach(tokio::spawn(scheduler.run(
                self.supervisor.subscribe_outcomes(),
                handle.sender(),
                shutdown.clone(),
            )));
            handles.push(handle);
        }

        let subscription = self
            .supervisor
            .subscribe(&monitor.bin_logs)
            .context("Failed to watch binary logs")?;
        let mut handle = self
            .supervisor
            .start_coordinator(monitor.bin_logs.clone(), SyncMode::UploadOnly)
            .context("Failed to start binary log folder")?;
        let mut detector = BinlogRotationDetector::new(
            Arc::new(monitor.bin_logs.clone()),
            handle.sender(),
            self.supervisor.supports_close_events(),
            self.supervisor.settings().debounce,
        );
        if let Some(trigger) = trigger {
            detector = detector.with_dump_trigger(trigger);
        }
        handle.attach(tokio::spawn(detector.run(subscription, shutdown)));
        handles.push(handle);

        info!(
            database = %monitor.name,
            bin_logs = %monitor.bin_logs.path().display(),
            dumps = monitor.dumps.is_some(),
            "Database monitor started"
        );
        Ok(())
    }

    /// Runs until the shutdown token fires, then joins every folder
    async fn run(&self) -> Result<()> {
        let handles = self.start();
        if handles.is_empty() {
            anyhow::bail!("No folder or database could be started");
        }
        info!(folders = handles.len(), "Daemon running");

        self.supervisor.shutdown_token().cancelled().await;
        info!("Shutting down, waiting for in-flight transfers");

        for handle in handles {
            let report = handle.join().await;
            if report.is_clean() {
                info!(
                    folder = %report.folder.display(),
                    completed = report.completed,
                    "Folder stopped"
                );
            } else {
                warn!(
                    folder = %report.folder.display(),
                    completed = report.completed,
                    incomplete = ?report.incomplete,
                    "Folder stopped with incomplete transfers"
                );
            }
        }
        Ok(())
    }
}

// ============================================================================
// Graceful shutdown signal handler
// ============================================================================

/// Waits for SIGTERM or SIGINT and triggers the cancellation token
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }

    token.cancel();
}

// ============================================================================
// Main entry point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let fallback_present = std::env::var_os(DEFAULT_CONFIG_ENV_VAR).is_some();
    let Some(source) = ConfigSource::resolve(&cli, fallback_present) else {
        eprintln!("Either --from-file or --from-env-var is required\n");
        Cli::command().print_help()?;
        std::process::exit(USAGE_EXIT_CODE);
    };

    let config = source
        .load()
        .with_context(|| format!("Failed to load configuration from {source}"))?;
    init_tracing(&config.logging);
    info!(source = %source, "autosync daemon starting (autosyncd)");
    check_config(&config)?;

    let shutdown_token = CancellationToken::new();
    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    let store: Arc<dyn RemoteObjectStore> = Arc::new(S3ObjectStore::from_environment().await);
    let parameters: Arc<dyn ParameterStore> =
        Arc::new(SsmParameterStore::from_environment().await);

    let service = DaemonService::new(config, store, parameters, shutdown_token);
    let result = service.run().await;

    match &result {
        Ok(()) => info!("autosync daemon shut down gracefully"),
        Err(e) => error!(error = %e, "autosync daemon exiting with error"),
    }
    result
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use autosync_core::ports::{MemoryObjectStore, MemoryParameterStore};
    use std::time::Duration;

    #[test]
    fn test_from_file_selects_file_source() {
        let cli = Cli::try_parse_from(["autosyncd", "--from-file", "/etc/autosync.yaml"]).unwrap();
        assert_eq!(
            ConfigSource::resolve(&cli, true),
            Some(ConfigSource::File(PathBuf::from("/etc/autosync.yaml")))
        );
    }

    #[test]
    fn test_from_env_var_selects_variable() {
        let cli = Cli::try_parse_from(["autosyncd", "--from-env-var", "MY_CONFIG"]).unwrap();
        assert_eq!(
            ConfigSource::resolve(&cli, false),
            Some(ConfigSource::EnvVar("MY_CONFIG".into()))
        );
    }

    #[test]
    fn test_conflicting_sources_rejected() {
        let result = Cli::try_parse_from([
            "autosyncd",
            "--from-file",
            "a.yaml",
            "--from-env-var",
            "B",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_default_variable_fallback() {
        let cli = Cli::try_parse_from(["autosyncd"]).unwrap();
        assert_eq!(
            ConfigSource::resolve(&cli, true),
            Some(ConfigSource::EnvVar(DEFAULT_CONFIG_ENV_VAR.into()))
        );
        assert_eq!(ConfigSource::resolve(&cli, false), None);
    }

    #[test]
    fn test_file_source_loads_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "folders:\n  /srv/data:\n    S3:\n      bucket_name: b\n    whitelist_regex: ['\\.csv$']\n",
        )
        .unwrap();
        let config = ConfigSource::File(path).load().unwrap();
        assert_eq!(config.folders.len(), 1);
        assert!(check_config(&config).is_ok());
    }

    #[test]
    fn test_empty_config_is_fatal() {
        assert!(check_config(&Config::default()).is_err());
    }

    #[test]
    fn test_scoped_error_is_not_fatal() {
        let config = Config::parse(
            "folders:\n  /srv/ok:\n    S3:\n      bucket_name: b\n    whitelist: [a.csv]\n  /srv/bad:\n    S3:\n      bucket_name: b\n",
        )
        .unwrap();
        assert!(!config.validate().is_empty());
        assert!(check_config(&config).is_ok());
    }

    #[tokio::test]
    async fn test_database_and_folder_start_and_stop() {
        let data = tempfile::tempdir().unwrap();
        let binlogs = tempfile::tempdir().unwrap();
        let dumps = tempfile::tempdir().unwrap();
        let document = format!(
            r#"
folders:
  {data}:
    S3:
      bucket_name: b
    whitelist_regex: ['\.csv$']
mysqlDb:
  main:
    hostname: db
    username: backup
    database: shop
    bin_logs:
      path: {binlogs}
      folder:
        S3:
          bucket_name: backups
        whitelist_regex: ['mariadb-bin\.[0-9]+$']
    dumps:
      path: {dumps}
      interval: 1h
      trigger_on_rotation: true
sync:
  shutdown_grace_secs: 1
"#,
            data = data.path().display(),
            binlogs = binlogs.path().display(),
            dumps = dumps.path().display(),
        );
        let config = Config::parse(&document).unwrap();
        assert!(check_config(&config).is_ok());

        let token = CancellationToken::new();
        let service = DaemonService::new(
            config,
            Arc::new(MemoryObjectStore::new()),
            Arc::new(MemoryParameterStore::new()),
            token.clone(),
        );

        let run = tokio::spawn(async move { service.run().await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_nothing_started_is_an_error() {
        let config = Config::parse(
            "folders:\n  /nonexistent/autosync-test:\n    S3:\n      bucket_name: b\n    whitelist: [a]\n",
        )
        .unwrap();
        let service = DaemonService::new(
            config,
            Arc::new(MemoryObjectStore::new()),
            Arc::new(MemoryParameterStore::new()),
            CancellationToken::new(),
        );
        assert!(service.run().await.is_err());
    }
}
