//! Configuration module for autosync.
//!
//! Provides typed configuration structs that map to the YAML (or JSON)
//! document, with loading, validation and defaults. Folder and database
//! entries are checked by building their domain objects, so a problem in
//! one entry is reported against that entry alone.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::domain::database::DbMonitor;
use crate::domain::folder::WatchedFolder;

/// Environment variable read when no explicit source is given
pub const DEFAULT_CONFIG_ENV_VAR: &str = "FILES_CONFIG";

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Watched folders keyed by local path.
    pub folders: BTreeMap<PathBuf, FolderConfig>,
    /// Monitored MySQL/MariaDB databases keyed by name.
    #[serde(rename = "mysqlDb", alias = "mysql_db")]
    pub mysql_db: BTreeMap<String, MysqlConfig>,
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
}

/// One `folders.<path>` entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FolderConfig {
    /// Create the directory when it does not exist.
    pub auto_create: bool,
    /// `remote`/`local` (local wins, default) or `s3`/`remote-store`.
    pub priority: Option<String>,
    #[serde(rename = "S3", alias = "s3")]
    pub s3: Option<S3TargetConfig>,
    /// Exact relative paths (or bare file names) that are always synced.
    pub whitelist: Vec<String>,
    pub whitelist_regex: Vec<String>,
    pub blacklist_regex: Vec<String>,
}

/// Remote target of a folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3TargetConfig {
    #[serde(default)]
    pub bucket_name: Option<String>,
    /// Defaults to the folder's basename.
    #[serde(default, alias = "prefix_key")]
    pub key_prefix: Option<String>,
    /// Append the file's relative subpath to the prefix (otherwise only its name).
    #[serde(default = "default_true")]
    pub preserve_folder_path: bool,
    #[serde(default)]
    pub iam_override: Option<IamOverrideConfig>,
}

impl Default for S3TargetConfig {
    fn default() -> Self {
        Self {
            bucket_name: None,
            key_prefix: None,
            preserve_folder_path: true,
            iam_override: None,
        }
    }
}

/// Role assumption descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IamOverrideConfig {
    #[serde(alias = "iam_role")]
    pub role_arn: Option<String>,
    pub session_name: Option<String>,
    pub external_id: Option<String>,
}

/// One `mysqlDb.<name>` entry.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MysqlConfig {
    pub socket_path: Option<PathBuf>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub bin_logs: Option<BinLogsConfig>,
    pub dumps: Option<DumpsConfig>,
}

impl std::fmt::Debug for MysqlConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MysqlConfig")
            .field("socket_path", &self.socket_path)
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .field("bin_logs", &self.bin_logs)
            .field("dumps", &self.dumps)
            .finish()
    }
}

/// Binary log directory and the folder rules used to ship it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BinLogsConfig {
    pub path: Option<PathBuf>,
    pub folder: Option<FolderConfig>,
}

/// Periodic dump settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DumpsConfig {
    /// Directory dumps are written to; defaults to a temporary directory.
    pub path: Option<PathBuf>,
    /// Defaults to the binlog folder rules restricted to `.sql` files.
    pub folder: Option<FolderConfig>,
    pub interval: Option<IntervalValue>,
    pub ssm_backup: Option<SsmBackupConfig>,
    /// Also request a dump whenever a binlog segment is sealed.
    pub trigger_on_rotation: bool,
}

/// Interval written as seconds or as a `15m`-style string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntervalValue {
    Seconds(u64),
    Text(String),
}

/// Parameter store target for the latest dump location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SsmBackupConfig {
    pub parameter_name: Option<String>,
    pub iam_override: Option<IamOverrideConfig>,
}

/// Engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet period that coalesces bursts of events for one path.
    pub debounce_ms: u64,
    /// Paths processed concurrently per folder.
    pub workers_per_folder: usize,
    /// Seconds between full reconciliation passes.
    pub reconcile_interval_secs: u64,
    /// Clock skew tolerated when comparing local and remote timestamps.
    pub mtime_tolerance_ms: u64,
    /// Seconds in-flight transfers get after a shutdown signal.
    pub shutdown_grace_secs: u64,
    /// Deadline of every remote store call.
    pub remote_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Hold back uploads of zero-byte files.
    pub skip_empty_files: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1000,
            workers_per_folder: 4,
            reconcile_interval_secs: 300,
            mtime_tolerance_ms: 1000,
            shutdown_grace_secs: 30,
            remote_timeout_secs: 60,
            max_retries: 5,
            retry_base_delay_ms: 500,
            skip_empty_files: true,
        }
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn mtime_tolerance(&self) -> Duration {
        Duration::from_millis(self.mtime_tolerance_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Output format: `text` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML or JSON file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Load configuration from the document stored in environment variable `name`.
    pub fn from_env_var(name: &str) -> anyhow::Result<Self> {
        let content = std::env::var(name)
            .with_context(|| format!("Environment variable {name} is not set"))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config from environment variable {name}"))
    }

    /// Parse a document, trying YAML first and JSON second.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        match serde_yaml::from_str::<Config>(content) {
            Ok(config) => Ok(config),
            Err(yaml_err) => serde_json::from_str::<Config>(content)
                .map_err(|_| anyhow::Error::new(yaml_err).context("Invalid YAML or JSON")),
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sync.debounce_ms"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl ValidationError {
    /// Whether the error only disables one folder or database.
    pub fn is_scoped(&self) -> bool {
        self.field.starts_with("folders.") || self.field.starts_with("mysqlDb.")
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid values for `logging.format`.
const VALID_LOG_FORMATS: &[&str] = &["text", "json"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- folders ---
        if self.folders.is_empty() && self.mysql_db.is_empty() {
            errors.push(ValidationError {
                field: "folders".into(),
                message: "no folders or databases configured".into(),
            });
        }
        for (path, folder) in &self.folders {
            if let Err(err) = WatchedFolder::from_config(path, folder) {
                errors.push(ValidationError {
                    field: format!("folders.{}", path.display()),
                    message: err.to_string(),
                });
            }
        }

        // --- mysqlDb ---
        for (name, db) in &self.mysql_db {
            if let Err(err) = DbMonitor::from_config(name, db) {
                errors.push(ValidationError {
                    field: format!("mysqlDb.{name}"),
                    message: err.to_string(),
                });
            }
        }

        // --- sync ---
        for (field, value) in [
            ("sync.debounce_ms", self.sync.debounce_ms),
            ("sync.workers_per_folder", self.sync.workers_per_folder as u64),
            ("sync.reconcile_interval_secs", self.sync.reconcile_interval_secs),
            ("sync.remote_timeout_secs", self.sync.remote_timeout_secs),
            ("sync.retry_base_delay_ms", self.sync.retry_base_delay_ms),
        ] {
            if value == 0 {
                errors.push(ValidationError {
                    field: field.into(),
                    message: "must be greater than 0".into(),
                });
            }
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }
        if !VALID_LOG_FORMATS.contains(&self.logging.format.as_str()) {
            errors.push(ValidationError {
                field: "logging.format".into(),
                message: format!(
                    "invalid format '{}'; valid options: {}",
                    self.logging.format,
                    VALID_LOG_FORMATS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
