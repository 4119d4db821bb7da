//! Dump production through the MySQL client tools
//!
//! The primary path is `mysqldump`, connecting over TCP or a Unix socket
//! with the password passed through `MYSQL_PWD`. When it fails, the binary
//! logs listed in every `*-bin.index` file under the monitor's binlog
//! directory are replayed through `mysqlbinlog` instead.
//!
//! Output is written to a hidden staging sibling and renamed into place,
//! so a watcher never sees a half-written `.sql` file.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use autosync_core::domain::{DbEndpoint, DbMonitor};
use autosync_core::ports::DumpProducer;
use autosync_sync::filesystem::LocalFileSystemAdapter;

use crate::DumpError;

/// Suffix of the index files listing binary log segments
const BINLOG_INDEX_SUFFIX: &str = "-bin.index";

/// Name prefix of dumps rebuilt from binary logs
const BINLOG_DUMP_PREFIX: &str = "from-binary-files_";

/// Longest stderr excerpt kept in an error
const MAX_STDERR_LEN: usize = 2048;

/// [`DumpProducer`] backed by `mysqldump` and `mysqlbinlog`
#[derive(Debug, Clone)]
pub struct MysqlDumpProducer {
    mysqldump: PathBuf,
    mysqlbinlog: PathBuf,
}

impl Default for MysqlDumpProducer {
    fn default() -> Self {
        Self::with_programs("mysqldump", "mysqlbinlog")
    }
}

impl MysqlDumpProducer {
    /// Producer using the client tools found on `PATH`
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_programs(mysqldump: impl Into<PathBuf>, mysqlbinlog: impl Into<PathBuf>) -> Self {
        Self {
            mysqldump: mysqldump.into(),
            mysqlbinlog: mysqlbinlog.into(),
        }
    }

    /// Runs `mysqldump` into `<destination>/<database>-<stamp>.sql`
    pub async fn dump_database(
        &self,
        monitor: &DbMonitor,
        destination: &Path,
        stamp: &str,
    ) -> Result<PathBuf, DumpError> {
        let target = destination.join(format!("{}-{stamp}.sql", monitor.database));
        let staged = LocalFileSystemAdapter::temp_path_for(&target);
        let output = tokio::fs::File::create(&staged).await?.into_std().await;

        let mut command = Command::new(&self.mysqldump);
        command.args(mysqldump_args(monitor));
        if !monitor.password().is_empty() {
            command.env("MYSQL_PWD", monitor.password());
        }

        if let Err(err) = run(command, &self.mysqldump, output).await {
            discard(&staged).await;
            return Err(err);
        }
        tokio::fs::rename(&staged, &target).await?;
        Ok(target)
    }

    /// Rebuilds a dump by replaying every listed binary log
    pub async fn dump_from_binary_logs(
        &self,
        monitor: &DbMonitor,
        destination: &Path,
        stamp: &str,
    ) -> Result<PathBuf, DumpError> {
        let logs = binary_logs(monitor.bin_logs.path()).await?;
        if logs.is_empty() {
            return Err(DumpError::NoBinaryLogs(monitor.bin_logs.path().to_path_buf()));
        }
        debug!(segments = logs.len(), "Replaying binary logs");

        let target = destination.join(format!("{BINLOG_DUMP_PREFIX}{stamp}.sql"));
        let staged = LocalFileSystemAdapter::temp_path_for(&target);
        let output = tokio::fs::File::create(&staged).await?.into_std().await;

        for log in &logs {
            let mut command = Command::new(&self.mysqlbinlog);
            command
                .arg("--skip-annotate-row-events")
                .arg("--short-form")
                .arg(log)
                .arg("-d")
                .arg(&monitor.database);
            let segment_output = match output.try_clone() {
                Ok(file) => file,
                Err(err) => {
                    discard(&staged).await;
                    return Err(err.into());
                }
            };
            if let Err(err) = run(command, &self.mysqlbinlog, segment_output).await {
                discard(&staged).await;
                return Err(err);
            }
        }
        drop(output);

        tokio::fs::rename(&staged, &target).await?;
        Ok(target)
    }
}

#[async_trait]
impl DumpProducer for MysqlDumpProducer {
    #[instrument(skip(self, monitor, destination), fields(database = %monitor.name, destination = %destination.display()))]
    async fn produce(&self, monitor: &DbMonitor, destination: &Path) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(destination).await?;
        let stamp = Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string();

        let path = match self.dump_database(monitor, destination, &stamp).await {
            Ok(path) => path,
            Err(err) => {
                warn!(error = %err, "mysqldump failed, rebuilding dump from binary logs");
                self.dump_from_binary_logs(monitor, destination, &stamp)
                    .await?
            }
        };

        info!(file = %path.display(), "Dump written");
        Ok(path)
    }
}

/// Connection and selection arguments for `mysqldump`
pub fn mysqldump_args(monitor: &DbMonitor) -> Vec<String> {
    let mut args = match &monitor.endpoint {
        DbEndpoint::Tcp { host, port } => vec![
            "--protocol=TCP".to_string(),
            format!("--host={host}"),
            format!("--port={port}"),
        ],
        DbEndpoint::Socket(socket) => vec![format!("--socket={}", socket.display())],
    };
    args.push(format!("--user={}", monitor.username));
    args.push(monitor.database.clone());
    args
}

/// Existing segments listed by the index files under `root`, in index order
pub async fn binary_logs(root: &Path) -> Result<Vec<PathBuf>, DumpError> {
    let files = LocalFileSystemAdapter::new().walk(root).await?;
    let mut logs = Vec::new();

    for index in files.iter().filter(|p| {
        p.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(BINLOG_INDEX_SUFFIX))
    }) {
        debug!(index = %index.display(), "Reading binary log index");
        let content = tokio::fs::read_to_string(index).await?;
        let index_dir = index.parent().unwrap_or(root);

        for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let listed = Path::new(line);
            let candidate = if listed.is_absolute() && listed.exists() {
                listed.to_path_buf()
            } else {
                match listed.file_name() {
                    Some(name) => index_dir.join(name),
                    None => continue,
                }
            };
            if candidate.exists() && !logs.contains(&candidate) {
                logs.push(candidate);
            }
        }
    }
    Ok(logs)
}

async fn run(mut command: Command, program: &Path, stdout: std::fs::File) -> Result<(), DumpError> {
    let program = program.display().to_string();
    let child = command
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| DumpError::Spawn {
            program: program.clone(),
            source,
        })?;
    let output = child.wait_with_output().await?;

    if output.status.success() {
        return Ok(());
    }
    let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.len() > MAX_STDERR_LEN {
        let mut cut = MAX_STDERR_LEN;
        while !stderr.is_char_boundary(cut) {
            cut -= 1;
        }
        stderr.truncate(cut);
    }
    Err(DumpError::CommandFailed {
        program,
        status: output.status.to_string(),
        stderr,
    })
}

async fn discard(staged: &Path) {
    if let Err(e) = tokio::fs::remove_file(staged).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %staged.display(), error = %e, "Failed to remove partial dump");
        }
    }
}
