//! Domain error types
//!
//! [`DomainError`] covers configuration-derived construction failures
//! (patterns, filters, paths, intervals). [`StoreError`] is the error shape
//! shared by every remote boundary, classified so callers can decide whether
//! a retry is worthwhile.

use thiserror::Error;

/// Errors that can occur while building domain objects from configuration
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// A whitelist or blacklist regular expression failed to compile
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The pattern as written in the configuration
        pattern: String,
        /// Compiler diagnostic
        reason: String,
    },

    /// Folder declares no whitelist, whitelist_regex or blacklist_regex
    #[error("Folder has no filter rules: {0}")]
    UnconstrainedFolder(String),

    /// A required configuration field is absent
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Unknown priority value
    #[error("Invalid priority '{0}'; valid options: remote, local, s3, remote-store")]
    InvalidPriority(String),

    /// Interval string could not be parsed
    #[error("Invalid interval '{0}'; expected e.g. 30s, 15m, 1h, 1d or a number of seconds")]
    InvalidInterval(String),

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

/// Errors returned by the remote object store and parameter store ports
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The object or parameter does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Credentials were rejected or lack the required permission
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Network failure, throttling or a server-side error
    #[error("Transient store error: {0}")]
    Transient(String),

    /// The call did not complete before its deadline
    #[error("Store call timed out after {0} ms")]
    Timeout(u64),

    /// Local I/O failure while streaming to or from the store
    #[error("Local I/O error: {0}")]
    Io(String),

    /// Any other failure; not retried
    #[error("Store error: {0}")]
    Other(String),
}

impl StoreError {
    /// Whether a retry with backoff may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_) | StoreError::Timeout(_))
    }

    /// Short classification label used in log fields
    pub fn class(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "not_found",
            StoreError::PermissionDenied(_) => "permission_denied",
            StoreError::Transient(_) => "transient",
            StoreError::Timeout(_) => "timeout",
            StoreError::Io(_) => "io",
            StoreError::Other(_) => "other",
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DomainError::InvalidPath("".to_string());
        assert_eq!(err.to_string(), "Invalid path: ");

        let err = DomainError::InvalidPattern {
            pattern: "([".to_string(),
            reason: "unclosed group".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid pattern '([': unclosed group");

        let err = DomainError::UnconstrainedFolder("/data".to_string());
        assert_eq!(err.to_string(), "Folder has no filter rules: /data");
    }

    #[test]
    fn test_store_error_classification() {
        assert!(StoreError::Transient("503".into()).is_transient());
        assert!(StoreError::Timeout(1000).is_transient());
        assert!(!StoreError::NotFound("k".into()).is_transient());
        assert!(!StoreError::PermissionDenied("k".into()).is_transient());
        assert!(!StoreError::Other("bad request".into()).is_transient());
        assert!(!StoreError::Io("disk full".into()).is_transient());
    }

    #[test]
    fn test_store_error_class_labels() {
        assert_eq!(StoreError::Timeout(5).class(), "timeout");
        assert_eq!(StoreError::PermissionDenied(String::new()).class(), "permission_denied");
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: StoreError = io.into();
        assert!(matches!(err, StoreError::Io(msg) if msg.contains("boom")));
    }
}
