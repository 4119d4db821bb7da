//! Watched folders and their filter rules
//!
//! A [`WatchedFolder`] pairs a local directory tree with a bucket/prefix
//! target. It is built once from configuration and then shared read-only
//! by every worker of that folder.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{FolderConfig, IamOverrideConfig};
use crate::domain::errors::DomainError;

/// Session name used when an `iam_override` omits one
pub const DEFAULT_SESSION_NAME: &str = "S3File@FilesAutoSync";

// ============================================================================
// Priority
// ============================================================================

/// Tie-break applied when both sides changed since the last synced state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// The local file wins (configured as `remote` or `local`)
    #[default]
    Local,
    /// The remote object wins (configured as `s3` or `remote-store`)
    RemoteStore,
}

impl FromStr for Priority {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "remote" | "local" => Ok(Priority::Local),
            "s3" | "remote-store" | "remote_store" => Ok(Priority::RemoteStore),
            other => Err(DomainError::InvalidPriority(other.to_string())),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Local => write!(f, "local"),
            Priority::RemoteStore => write!(f, "remote-store"),
        }
    }
}

// ============================================================================
// CredentialOverride
// ============================================================================

/// Role to assume for remote calls made on behalf of one folder
///
/// The core never interprets this; it is handed to the store adapters
/// as opaque context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialOverride {
    pub role_arn: String,
    pub session_name: String,
    pub external_id: Option<String>,
}

impl CredentialOverride {
    pub fn from_config(config: &IamOverrideConfig) -> Result<Self, DomainError> {
        let role_arn = config
            .role_arn
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DomainError::MissingField("iam_override.role_arn".into()))?;

        Ok(Self {
            role_arn: role_arn.to_string(),
            session_name: config
                .session_name
                .clone()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SESSION_NAME.to_string()),
            external_id: config.external_id.clone().filter(|s| !s.is_empty()),
        })
    }
}

// ============================================================================
// FilterEngine
// ============================================================================

/// Compiled include/exclude rules for one folder
///
/// Evaluation order is fixed:
/// 1. exact whitelist entry → accept
/// 2. any blacklist pattern → reject
/// 3. any whitelist pattern → accept
/// 4. otherwise → reject
///
/// Patterns are searched anywhere in the `/`-separated relative path, so
/// `\.csv$` accepts `a.csv` and `2024/a.csv` alike. Use `^` to pin a
/// pattern to the folder root.
#[derive(Debug, Clone)]
pub struct FilterEngine {
    whitelist: Vec<String>,
    whitelist_patterns: Vec<Regex>,
    blacklist_patterns: Vec<Regex>,
}

impl FilterEngine {
    /// Compiles the rules, rejecting malformed patterns and empty rule sets
    pub fn new(
        whitelist: &[String],
        whitelist_regex: &[String],
        blacklist_regex: &[String],
    ) -> Result<Self, DomainError> {
        if whitelist.is_empty() && whitelist_regex.is_empty() && blacklist_regex.is_empty() {
            return Err(DomainError::UnconstrainedFolder(String::new()));
        }

        Ok(Self {
            whitelist: whitelist.to_vec(),
            whitelist_patterns: compile_all(whitelist_regex)?,
            blacklist_patterns: compile_all(blacklist_regex)?,
        })
    }

    /// Whether changes to `relative_path` are observed at all
    pub fn accepts(&self, relative_path: &str) -> bool {
        if self.matches_exact(relative_path) {
            return true;
        }
        if self
            .blacklist_patterns
            .iter()
            .any(|re| re.is_match(relative_path))
        {
            return false;
        }
        self.whitelist_patterns
            .iter()
            .any(|re| re.is_match(relative_path))
    }

    // An entry without a separator names a file anywhere in the tree.
    fn matches_exact(&self, relative_path: &str) -> bool {
        let file_name = relative_path.rsplit('/').next().unwrap_or(relative_path);
        self.whitelist.iter().any(|entry| {
            entry == relative_path || (!entry.contains('/') && entry == file_name)
        })
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>, DomainError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| DomainError::InvalidPattern {
                pattern: p.clone(),
                reason: e.to_string(),
            })
        })
        .collect()
}

// ============================================================================
// WatchedFolder
// ============================================================================

/// A local directory tree paired with a remote bucket/prefix and filter rules
#[derive(Debug, Clone)]
pub struct WatchedFolder {
    path: PathBuf,
    bucket: String,
    key_prefix: String,
    preserve_path: bool,
    priority: Priority,
    auto_create: bool,
    filter: FilterEngine,
    credentials: Option<CredentialOverride>,
}

impl WatchedFolder {
    /// Builds a folder from its `folders.<path>` configuration entry
    pub fn from_config(path: &Path, config: &FolderConfig) -> Result<Self, DomainError> {
        let label = path.display().to_string();
        if path.as_os_str().is_empty() {
            return Err(DomainError::InvalidPath(label));
        }
        let path = std::path::absolute(path)
            .map_err(|e| DomainError::InvalidPath(format!("{label}: {e}")))?;

        let target = config
            .s3
            .as_ref()
            .ok_or_else(|| DomainError::MissingField(format!("{label}.S3")))?;
        let bucket = target
            .bucket_name
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .ok_or_else(|| DomainError::MissingField(format!("{label}.S3.bucket_name")))?
            .to_string();

        let raw_prefix = match target.key_prefix.as_deref() {
            Some(prefix) => prefix.to_string(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };

        let priority = match config.priority.as_deref() {
            Some(p) => p.parse()?,
            None => Priority::default(),
        };

        let filter = FilterEngine::new(
            &config.whitelist,
            &config.whitelist_regex,
            &config.blacklist_regex,
        )
        .map_err(|e| match e {
            DomainError::UnconstrainedFolder(_) => DomainError::UnconstrainedFolder(label.clone()),
            other => other,
        })?;

        let credentials = target
            .iam_override
            .as_ref()
            .map(CredentialOverride::from_config)
            .transpose()?;

        Ok(Self {
            path,
            bucket,
            key_prefix: normalize_prefix(&raw_prefix),
            preserve_path: target.preserve_folder_path,
            priority,
            auto_create: config.auto_create,
            filter,
            credentials,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Normalized prefix: no leading `/`, trailing `/` unless empty
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn preserve_path(&self) -> bool {
        self.preserve_path
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn auto_create(&self) -> bool {
        self.auto_create
    }

    pub fn filter(&self) -> &FilterEngine {
        &self.filter
    }

    pub fn credentials(&self) -> Option<&CredentialOverride> {
        self.credentials.as_ref()
    }

    /// Path of `absolute` relative to the folder root, `/`-separated
    ///
    /// Returns `None` for paths outside the folder and for the root itself.
    pub fn relative_path(&self, absolute: &Path) -> Option<String> {
        let rest = absolute.strip_prefix(&self.path).ok()?;
        let mut parts = Vec::new();
        for component in rest.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                _ => return None,
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }

    /// Whether the filter rules accept `relative_path`
    pub fn accepts(&self, relative_path: &str) -> bool {
        self.filter.accepts(relative_path)
    }

    /// Remote key for a relative path
    pub fn remote_key(&self, relative_path: &str) -> String {
        let tail = if self.preserve_path {
            relative_path
        } else {
            relative_path.rsplit('/').next().unwrap_or(relative_path)
        };
        collapse_slashes(&format!("{}{}", self.key_prefix, tail))
    }

    /// Local path a remote key maps back to, if it belongs to this folder
    ///
    /// Keys outside the prefix, directory markers, keys with `..` segments
    /// and (without `preserve_path`) nested keys have no local counterpart.
    pub fn local_path_for_key(&self, key: &str) -> Option<PathBuf> {
        let rest = key.strip_prefix(self.key_prefix.as_str())?;
        if rest.is_empty() || rest.ends_with('/') {
            return None;
        }
        if !self.preserve_path && rest.contains('/') {
            return None;
        }
        let mut local = self.path.clone();
        for segment in rest.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return None;
            }
            local.push(segment);
        }
        Some(local)
    }
}

/// Normalizes a key prefix the way remote keys are written
pub fn normalize_prefix(raw: &str) -> String {
    let collapsed = collapse_slashes(raw.trim());
    let trimmed = collapsed.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}

fn collapse_slashes(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut previous_slash = false;
    for ch in value.chars() {
        if ch == '/' {
            if !previous_slash {
                out.push(ch);
            }
            previous_slash = true;
        } else {
            out.push(ch);
            previous_slash = false;
        }
    }
    out
}
