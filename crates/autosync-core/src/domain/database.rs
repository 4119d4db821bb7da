//! Monitored databases and dump jobs

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{FolderConfig, IntervalValue, MysqlConfig};
use crate::domain::errors::DomainError;
use crate::domain::folder::{CredentialOverride, WatchedFolder};

/// Interval used when `dumps.interval` is omitted
pub const DEFAULT_DUMP_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Port used for TCP connections when none is configured
pub const DEFAULT_MYSQL_PORT: u16 = 3306;

/// How to reach the database server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbEndpoint {
    Socket(PathBuf),
    Tcp { host: String, port: u16 },
}

/// Parameter that receives the location of the latest uploaded dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterTarget {
    pub name: String,
    pub credentials: Option<CredentialOverride>,
}

/// Periodic dump configuration of one database
#[derive(Debug, Clone)]
pub struct DumpSchedule {
    /// Folder the dump files are written into and synced from
    pub folder: WatchedFolder,
    pub interval: Duration,
    pub parameter: Option<ParameterTarget>,
    /// A sealed binlog segment also requests a dump
    pub trigger_on_rotation: bool,
}

/// A database whose binary logs and dumps are shipped to the store
#[derive(Clone)]
pub struct DbMonitor {
    pub name: String,
    pub endpoint: DbEndpoint,
    pub username: String,
    password: String,
    pub database: String,
    pub bin_logs: WatchedFolder,
    pub dumps: Option<DumpSchedule>,
}

impl fmt::Debug for DbMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbMonitor")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("bin_logs", &self.bin_logs.path())
            .field("dumps", &self.dumps.as_ref().map(|d| d.folder.path()))
            .finish()
    }
}

impl DbMonitor {
    /// Builds a monitor from its `mysqlDb.<name>` configuration entry
    pub fn from_config(name: &str, config: &MysqlConfig) -> Result<Self, DomainError> {
        let field = |f: &str| DomainError::MissingField(format!("mysqlDb.{name}.{f}"));

        let endpoint = match (&config.socket_path, &config.hostname) {
            (Some(socket), _) => DbEndpoint::Socket(socket.clone()),
            (None, Some(host)) if !host.trim().is_empty() => DbEndpoint::Tcp {
                host: host.trim().to_string(),
                port: config.port.unwrap_or(DEFAULT_MYSQL_PORT),
            },
            _ => return Err(field("socket_path|hostname")),
        };

        let username = config.username.clone().ok_or_else(|| field("username"))?;
        let database = config.database.clone().ok_or_else(|| field("database"))?;

        let bin_logs_config = config.bin_logs.as_ref().ok_or_else(|| field("bin_logs"))?;
        let bin_logs_path = bin_logs_config
            .path
            .as_ref()
            .ok_or_else(|| field("bin_logs.path"))?;
        let bin_logs_folder = bin_logs_config
            .folder
            .as_ref()
            .ok_or_else(|| field("bin_logs.folder"))?;
        let bin_logs = WatchedFolder::from_config(bin_logs_path, bin_logs_folder)?;

        let dumps = match &config.dumps {
            None => None,
            Some(dumps) => {
                let path = dumps.path.clone().unwrap_or_else(|| {
                    std::env::temp_dir()
                        .join("autosync")
                        .join(name)
                        .join("dumps")
                });
                let folder_config = match &dumps.folder {
                    Some(folder) => folder.clone(),
                    None => derived_dump_folder(name, bin_logs_folder, bin_logs.key_prefix()),
                };
                let folder = WatchedFolder::from_config(&path, &folder_config)?;

                let interval = match &dumps.interval {
                    None => DEFAULT_DUMP_INTERVAL,
                    Some(IntervalValue::Seconds(0)) => {
                        return Err(DomainError::InvalidInterval("0".into()))
                    }
                    Some(IntervalValue::Seconds(secs)) => Duration::from_secs(*secs),
                    Some(IntervalValue::Text(text)) => parse_interval(text)?,
                };

                let parameter = match &dumps.ssm_backup {
                    None => None,
                    Some(ssm) => Some(ParameterTarget {
                        name: ssm
                            .parameter_name
                            .clone()
                            .filter(|n| !n.trim().is_empty())
                            .ok_or_else(|| field("dumps.ssm_backup.parameter_name"))?,
                        credentials: ssm
                            .iam_override
                            .as_ref()
                            .map(CredentialOverride::from_config)
                            .transpose()?,
                    }),
                };

                Some(DumpSchedule {
                    folder,
                    interval,
                    parameter,
                    trigger_on_rotation: dumps.trigger_on_rotation,
                })
            }
        };

        Ok(Self {
            name: name.to_string(),
            endpoint,
            username,
            password: config.password.clone().unwrap_or_default(),
            database,
            bin_logs,
            dumps,
        })
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

// Dumps share the binlog target, filtered to `.sql` files under `<name>/dumps/`.
fn derived_dump_folder(name: &str, bin_logs: &FolderConfig, bin_logs_prefix: &str) -> FolderConfig {
    let mut folder = bin_logs.clone();
    folder.whitelist = Vec::new();
    folder.whitelist_regex = vec![r"\.sql$".to_string()];
    folder.blacklist_regex = Vec::new();
    folder.auto_create = true;
    if let Some(s3) = folder.s3.as_mut() {
        s3.key_prefix = Some(format!("{bin_logs_prefix}{name}/dumps"));
    }
    folder
}

/// Parses `30s`, `15m`, `1h`, `1d` or a bare number of seconds
pub fn parse_interval(value: &str) -> Result<Duration, DomainError> {
    let trimmed = value.trim();
    let invalid = || DomainError::InvalidInterval(value.to_string());

    let (digits, multiplier) = match trimmed.char_indices().last() {
        Some((idx, unit)) if unit.is_ascii_alphabetic() => {
            let multiplier = match unit.to_ascii_lowercase() {
                's' => 1,
                'm' => 60,
                'h' => 3600,
                'd' => 86_400,
                _ => return Err(invalid()),
            };
            (&trimmed[..idx], multiplier)
        }
        Some(_) => (trimmed, 1),
        None => return Err(invalid()),
    };

    let amount: u64 = digits.trim().parse().map_err(|_| invalid())?;
    if amount == 0 {
        return Err(invalid());
    }
    amount
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(invalid)
}

/// Lifecycle of one produced dump
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpOutcome {
    /// Producer is running
    Pending,
    /// File is on disk, waiting for its upload
    Produced,
    /// Uploaded; `location` is `s3://bucket/key`
    Uploaded { location: String },
    Failed { reason: String },
}

/// One run of a monitor's dump producer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpJob {
    pub id: Uuid,
    pub monitor: String,
    pub scheduled_at: DateTime<Utc>,
    pub file: Option<PathBuf>,
    pub outcome: DumpOutcome,
}

impl DumpJob {
    pub fn new(monitor: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            monitor: monitor.into(),
            scheduled_at: Utc::now(),
            file: None,
            outcome: DumpOutcome::Pending,
        }
    }

    pub fn produced(&mut self, file: PathBuf) {
        self.file = Some(file);
        self.outcome = DumpOutcome::Produced;
    }

    pub fn uploaded(&mut self, location: String) {
        self.outcome = DumpOutcome::Uploaded { location };
    }

    pub fn failed(&mut self, reason: impl Into<String>) {
        self.outcome = DumpOutcome::Failed {
            reason: reason.into(),
        };
    }
}
