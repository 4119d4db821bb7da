//! Remote object store port (driven/secondary port)
//!
//! The sync engine talks to the bucket exclusively through
//! [`RemoteObjectStore`]. Every call names its target with an
//! [`ObjectLocation`], which also carries the folder's optional
//! role-assumption descriptor as opaque context.
//!
//! ## Design Notes
//!
//! - Errors are [`StoreError`] rather than `anyhow::Error` because the
//!   engine retries only transient failures and must tell them apart.
//! - `head` reports a missing object as a record with `exists == false`,
//!   not as an error.
//! - Content moves through files on disk, never whole-object buffers.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::domain::errors::StoreError;
use crate::domain::folder::CredentialOverride;
use crate::domain::records::RemoteObjectRecord;

/// Bucket, key and credential context of one remote call
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
    pub credentials: Option<CredentialOverride>,
}

impl ObjectLocation {
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        credentials: Option<CredentialOverride>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            credentials,
        }
    }

    /// Same bucket and credentials, different key
    pub fn with_key(&self, key: impl Into<String>) -> Self {
        Self {
            bucket: self.bucket.clone(),
            key: key.into(),
            credentials: self.credentials.clone(),
        }
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Bucket operations used by the sync engine
#[async_trait::async_trait]
pub trait RemoteObjectStore: Send + Sync {
    /// Metadata of the object; `exists == false` when there is none
    async fn head(&self, location: &ObjectLocation) -> Result<RemoteObjectRecord, StoreError>;

    /// Streams the object into `destination`, returning the bytes written
    async fn get(&self, location: &ObjectLocation, destination: &Path) -> Result<u64, StoreError>;

    /// Uploads `source`, recording `source_modified` as object metadata
    async fn put(
        &self,
        location: &ObjectLocation,
        source: &Path,
        source_modified: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Server-side copy of `source` to `destination_key` in the same bucket
    async fn copy(&self, source: &ObjectLocation, destination_key: &str) -> Result<(), StoreError>;

    async fn delete(&self, location: &ObjectLocation) -> Result<(), StoreError>;

    /// Every object whose key starts with `prefix`
    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        credentials: Option<&CredentialOverride>,
    ) -> Result<Vec<RemoteObjectRecord>, StoreError>;
}
