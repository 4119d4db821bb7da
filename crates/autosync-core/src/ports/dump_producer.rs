//! Dump producer port
//!
//! The database client is an external collaborator: given a monitor and a
//! destination directory it leaves one complete dump file behind and
//! reports its path.

use std::path::{Path, PathBuf};

use crate::domain::database::DbMonitor;

/// Materializes a database dump on local disk
///
/// Uses `anyhow::Result` because failures are tool-specific (exit codes,
/// stderr) and only ever logged by the caller.
#[async_trait::async_trait]
pub trait DumpProducer: Send + Sync {
    /// Writes a dump of `monitor` into `destination` and returns the file path
    ///
    /// The file must only appear under its final name once complete.
    async fn produce(&self, monitor: &DbMonitor, destination: &Path) -> anyhow::Result<PathBuf>;
}
