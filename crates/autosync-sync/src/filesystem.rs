//! Local filesystem adapter
//!
//! Produces fresh [`FileRecord`] snapshots, walks folder trees for
//! reconciliation, and places downloaded content atomically: data is
//! written to a hidden sibling, stamped with the remote content mtime and
//! renamed over the target.

use std::future::Future;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use autosync_core::domain::FileRecord;

const TEMP_SUFFIX: &str = ".autosync-tmp";

/// Local filesystem operations used by the sync engine
#[derive(Debug, Default, Clone)]
pub struct LocalFileSystemAdapter;

impl LocalFileSystemAdapter {
    pub fn new() -> Self {
        Self
    }

    /// Stats `path`; directories and missing paths report `exists == false`
    #[instrument(skip(self), level = "trace", fields(path = %path.display()))]
    pub async fn stat(&self, path: &Path, relative_path: &str) -> io::Result<FileRecord> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(FileRecord::missing(path.to_path_buf(), relative_path));
            }
            Err(e) => return Err(e),
        };
        if !metadata.is_file() {
            return Ok(FileRecord::missing(path.to_path_buf(), relative_path));
        }

        Ok(FileRecord {
            path: path.to_path_buf(),
            relative_path: relative_path.to_string(),
            exists: true,
            size: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    /// Every regular file below `root`, skipping in-progress downloads
    pub async fn walk(&self, root: &Path) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        walk_directory(root.to_path_buf(), &mut files).await?;
        files.sort();
        Ok(files)
    }

    /// Creates `dir` and its parents
    pub async fn ensure_dir(&self, dir: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(dir).await
    }

    /// Hidden sibling a download of `target` is staged in
    pub fn temp_path_for(target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        target.with_file_name(format!(".{name}{TEMP_SUFFIX}"))
    }

    /// Whether `path` is a staging file produced by [`Self::temp_path_for`]
    pub fn is_temp_path(path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.') && n.ends_with(TEMP_SUFFIX))
    }

    /// Moves a staged download into place
    ///
    /// The mtime is set on the staged file before the rename so the target
    /// never appears with the download time as its mtime.
    #[instrument(skip(self), fields(target = %target.display()))]
    pub async fn commit(
        &self,
        staged: &Path,
        target: &Path,
        modified: Option<DateTime<Utc>>,
    ) -> io::Result<()> {
        if let Some(modified) = modified {
            if let Err(e) = set_modified(staged, modified).await {
                warn!(error = %e, "Failed to set modification time on download");
            }
        }
        tokio::fs::rename(staged, target).await?;
        debug!("Download committed");
        Ok(())
    }

    /// Removes a staged download after a failed transfer
    pub async fn discard(&self, staged: &Path) {
        if let Err(e) = tokio::fs::remove_file(staged).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %staged.display(), error = %e, "Failed to remove staged download");
            }
        }
    }
}

async fn set_modified(path: &Path, modified: DateTime<Utc>) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::options().write(true).open(&path)?;
        file.set_modified(SystemTime::from(modified))
    })
    .await
    .map_err(io::Error::other)?
}

fn walk_directory<'a>(
    dir: PathBuf,
    files: &'a mut Vec<PathBuf>,
) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                walk_directory(path, files).await?;
            } else if file_type.is_file() && !LocalFileSystemAdapter::is_temp_path(&path) {
                files.push(path);
            }
        }
        Ok(())
    })
}

// ============================================================================
// Unit tests
// ============================================================================
