//! S3 implementation of [`RemoteObjectStore`]
//!
//! Uploads carry the local file's modification time as user metadata
//! (`x-amz-meta-autosync-mtime`, RFC 3339 with nanoseconds) so the
//! conflict resolver compares content times instead of upload times.
//! Objects are streamed to and from disk, never buffered whole.
//!
//! A single PUT or CopyObject is capped at 5 GiB. Above the multipart
//! threshold, uploads go through `UploadPart` and copies through
//! `UploadPartCopy`; a failed multipart transfer is aborted so no parts
//! linger in the bucket.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_s3::primitives::{ByteStream, DateTime as SmithyDateTime, Length};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use autosync_core::domain::errors::StoreError;
use autosync_core::domain::folder::CredentialOverride;
use autosync_core::domain::records::RemoteObjectRecord;
use autosync_core::ports::{ObjectLocation, RemoteObjectStore};

use crate::clients::{environment_config, ClientCache};
use crate::error::{classify_sdk_error, status_of};

/// User metadata key holding the source file's modification time
pub const SOURCE_MTIME_METADATA: &str = "autosync-mtime";

/// Largest object a single PUT or CopyObject may write
pub const SINGLE_REQUEST_LIMIT: u64 = 5 * 1024 * 1024 * 1024;

/// Default part size of multipart transfers
pub const DEFAULT_PART_SIZE: u64 = 64 * 1024 * 1024;

/// Most parts one multipart upload may have
const MAX_PARTS: u64 = 10_000;

/// S3 object store with one client per credential context
pub struct S3ObjectStore {
    clients: ClientCache<Client>,
    multipart_threshold: u64,
    part_size: u64,
}

impl S3ObjectStore {
    /// Store using the ambient AWS configuration
    pub async fn from_environment() -> Self {
        Self::new(environment_config().await, false)
    }

    /// # Arguments
    /// * `config` - Base SDK configuration
    /// * `force_path_style` - Address buckets as `<endpoint>/<bucket>`, as
    ///   S3-compatible servers usually require
    pub fn new(config: SdkConfig, force_path_style: bool) -> Self {
        let clients = ClientCache::new(config, move |sdk: &SdkConfig| {
            let s3_config = aws_sdk_s3::config::Builder::from(sdk)
                .force_path_style(force_path_style)
                .build();
            Client::from_conf(s3_config)
        });
        Self {
            clients,
            multipart_threshold: DEFAULT_PART_SIZE,
            part_size: DEFAULT_PART_SIZE,
        }
    }

    /// Objects larger than `threshold` bytes move in `part_size` parts
    ///
    /// S3 requires every part but the last to be at least 5 MiB, and
    /// `threshold` is capped at [`SINGLE_REQUEST_LIMIT`].
    pub fn with_multipart(mut self, threshold: u64, part_size: u64) -> Self {
        self.multipart_threshold = threshold.min(SINGLE_REQUEST_LIMIT);
        self.part_size = part_size.max(1);
        self
    }

    async fn client(&self, credentials: Option<&CredentialOverride>) -> Client {
        self.clients.client(credentials).await
    }
}

#[async_trait]
impl RemoteObjectStore for S3ObjectStore {
    #[instrument(skip(self, location), fields(location = %location))]
    async fn head(&self, location: &ObjectLocation) -> Result<RemoteObjectRecord, StoreError> {
        let client = self.client(location.credentials.as_ref()).await;
        let response = client
            .head_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await;

        match response {
            Ok(output) => Ok(RemoteObjectRecord {
                bucket: location.bucket.clone(),
                key: location.key.clone(),
                exists: true,
                size: output.content_length().unwrap_or(0).max(0) as u64,
                last_modified: output.last_modified().and_then(to_chrono),
                source_modified: output.metadata().and_then(source_mtime),
                etag: output.e_tag().map(str::to_string),
            }),
            Err(err) if status_of(&err) == Some(404) => {
                debug!("Object does not exist");
                Ok(RemoteObjectRecord::missing(&location.bucket, &location.key))
            }
            Err(err) => Err(classify_sdk_error(err)),
        }
    }

    #[instrument(skip(self, location, destination), fields(location = %location, destination = %destination.display()))]
    async fn get(&self, location: &ObjectLocation, destination: &Path) -> Result<u64, StoreError> {
        let client = self.client(location.credentials.as_ref()).await;
        let output = client
            .get_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
            .map_err(classify_sdk_error)?;

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(destination).await?;
        let mut body = output.body.into_async_read();
        let written = tokio::io::copy(&mut body, &mut file)
            .await
            .map_err(|e| StoreError::Transient(format!("Download interrupted: {e}")))?;
        file.flush().await?;
        file.sync_all().await?;

        debug!(bytes = written, "Object downloaded");
        Ok(written)
    }

    #[instrument(skip(self, location, source), fields(location = %location, source = %source.display()))]
    async fn put(
        &self,
        location: &ObjectLocation,
        source: &Path,
        source_modified: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let client = self.client(location.credentials.as_ref()).await;
        let size = tokio::fs::metadata(source)
            .await
            .map_err(|e| StoreError::Io(format!("{}: {e}", source.display())))?
            .len();
        if size > self.multipart_threshold {
            let metadata = source_modified.map(|modified| {
                HashMap::from([(
                    SOURCE_MTIME_METADATA.to_string(),
                    modified.to_rfc3339_opts(SecondsFormat::Nanos, true),
                )])
            });
            let parts = part_ranges(size, self.part_size);
            return multipart(&client, location, &location.key, metadata, parts, |upload_id, part| {
                upload_part(&client, location, source, upload_id, part)
            })
            .await;
        }

        let body = ByteStream::from_path(source)
            .await
            .map_err(|e| StoreError::Io(format!("{}: {e}", source.display())))?;

        let mut request = client
            .put_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .body(body);
        if let Some(modified) = source_modified {
            request = request.metadata(
                SOURCE_MTIME_METADATA,
                modified.to_rfc3339_opts(SecondsFormat::Nanos, true),
            );
        }
        request.send().await.map_err(classify_sdk_error)?;

        debug!("Object uploaded");
        Ok(())
    }

    #[instrument(skip(self, source), fields(source = %source))]
    async fn copy(&self, source: &ObjectLocation, destination_key: &str) -> Result<(), StoreError> {
        let client = self.client(source.credentials.as_ref()).await;
        let head = client
            .head_object()
            .bucket(&source.bucket)
            .key(&source.key)
            .send()
            .await
            .map_err(classify_sdk_error)?;
        let size = head.content_length().unwrap_or(0).max(0) as u64;
        if size > self.multipart_threshold {
            let parts = part_ranges(size, self.part_size);
            return multipart(
                &client,
                source,
                destination_key,
                head.metadata().cloned(),
                parts,
                |upload_id, part| copy_part(&client, source, destination_key, upload_id, part),
            )
            .await;
        }

        client
            .copy_object()
            .bucket(&source.bucket)
            .copy_source(copy_source(&source.bucket, &source.key))
            .key(destination_key)
            .send()
            .await
            .map_err(classify_sdk_error)?;
        Ok(())
    }

    #[instrument(skip(self, location), fields(location = %location))]
    async fn delete(&self, location: &ObjectLocation) -> Result<(), StoreError> {
        let client = self.client(location.credentials.as_ref()).await;
        client
            .delete_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
            .map_err(classify_sdk_error)?;
        Ok(())
    }

    #[instrument(skip(self, credentials))]
    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        credentials: Option<&CredentialOverride>,
    ) -> Result<Vec<RemoteObjectRecord>, StoreError> {
        let client = self.client(credentials).await;
        let mut pages = client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut records = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(classify_sdk_error)?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                records.push(RemoteObjectRecord {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    exists: true,
                    size: object.size().unwrap_or(0).max(0) as u64,
                    last_modified: object.last_modified().and_then(to_chrono),
                    source_modified: None,
                    etag: object.e_tag().map(str::to_string),
                });
            }
        }

        debug!(objects = records.len(), "Prefix listed");
        Ok(records)
    }
}

// ============================================================================
// Multipart transfers
// ============================================================================

/// One part of a multipart transfer: number, first byte, length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PartRange {
    number: i32,
    offset: u64,
    length: u64,
}

impl PartRange {
    fn last_byte(&self) -> u64 {
        self.offset + self.length - 1
    }
}

/// Splits `size` bytes into parts of `part_size`, grown as needed to stay
/// within the part count limit
fn part_ranges(size: u64, part_size: u64) -> Vec<PartRange> {
    let part_size = part_size.max(size.div_ceil(MAX_PARTS)).max(1);
    (0..size.div_ceil(part_size))
        .map(|index| {
            let offset = index * part_size;
            PartRange {
                number: (index + 1) as i32,
                offset,
                length: part_size.min(size - offset),
            }
        })
        .collect()
}

/// Runs a multipart upload into `destination_key`, aborting it on failure
async fn multipart<F, Fut>(
    client: &Client,
    location: &ObjectLocation,
    destination_key: &str,
    metadata: Option<HashMap<String, String>>,
    parts: Vec<PartRange>,
    send_part: F,
) -> Result<(), StoreError>
where
    F: Fn(String, PartRange) -> Fut,
    Fut: std::future::Future<Output = Result<Option<String>, StoreError>>,
{
    let created = client
        .create_multipart_upload()
        .bucket(&location.bucket)
        .key(destination_key)
        .set_metadata(metadata)
        .send()
        .await
        .map_err(classify_sdk_error)?;
    let upload_id = created
        .upload_id()
        .map(str::to_string)
        .ok_or_else(|| StoreError::Transient("Multipart upload started without an id".into()))?;
    debug!(upload_id = %upload_id, parts = parts.len(), "Multipart transfer started");

    let mut completed = Vec::with_capacity(parts.len());
    let mut failure = None;
    for part in parts {
        match send_part(upload_id.clone(), part).await {
            Ok(etag) => completed.push(
                CompletedPart::builder()
                    .part_number(part.number)
                    .set_e_tag(etag)
                    .build(),
            ),
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }

    let result = match failure {
        Some(err) => Err(err),
        None => client
            .complete_multipart_upload()
            .bucket(&location.bucket)
            .key(destination_key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map(|_| ())
            .map_err(classify_sdk_error),
    };

    if let Err(err) = &result {
        let aborted = client
            .abort_multipart_upload()
            .bucket(&location.bucket)
            .key(destination_key)
            .upload_id(&upload_id)
            .send()
            .await;
        warn!(
            upload_id = %upload_id,
            error = %err,
            aborted = aborted.is_ok(),
            "Multipart transfer failed"
        );
    } else {
        debug!(upload_id = %upload_id, "Multipart transfer completed");
    }
    result
}

async fn upload_part(
    client: &Client,
    location: &ObjectLocation,
    source: &Path,
    upload_id: String,
    part: PartRange,
) -> Result<Option<String>, StoreError> {
    let body = ByteStream::read_from()
        .path(source)
        .offset(part.offset)
        .length(Length::Exact(part.length))
        .build()
        .await
        .map_err(|e| StoreError::Io(format!("{}: {e}", source.display())))?;
    let output = client
        .upload_part()
        .bucket(&location.bucket)
        .key(&location.key)
        .upload_id(upload_id)
        .part_number(part.number)
        .body(body)
        .send()
        .await
        .map_err(classify_sdk_error)?;
    Ok(output.e_tag().map(str::to_string))
}

async fn copy_part(
    client: &Client,
    source: &ObjectLocation,
    destination_key: &str,
    upload_id: String,
    part: PartRange,
) -> Result<Option<String>, StoreError> {
    let output = client
        .upload_part_copy()
        .bucket(&source.bucket)
        .key(destination_key)
        .upload_id(upload_id)
        .part_number(part.number)
        .copy_source(copy_source(&source.bucket, &source.key))
        .copy_source_range(format!("bytes={}-{}", part.offset, part.last_byte()))
        .send()
        .await
        .map_err(classify_sdk_error)?;
    Ok(output
        .copy_part_result()
        .and_then(|result| result.e_tag())
        .map(str::to_string))
}

fn to_chrono(value: &SmithyDateTime) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(value.secs(), value.subsec_nanos()).single()
}

fn source_mtime(metadata: &HashMap<String, String>) -> Option<DateTime<Utc>> {
    metadata
        .get(SOURCE_MTIME_METADATA)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// `x-amz-copy-source` value: `<bucket>/<url-encoded key>`
fn copy_source(bucket: &str, key: &str) -> String {
    let mut encoded = String::with_capacity(bucket.len() + key.len() + 1);
    encoded.push_str(bucket);
    encoded.push('/');
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}
