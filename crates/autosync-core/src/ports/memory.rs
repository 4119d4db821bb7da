//! In-memory port implementations
//!
//! [`MemoryObjectStore`] and [`MemoryParameterStore`] keep everything in
//! process. They record every call and can be told to fail the next call
//! of a given kind, which is how the engine's ordering and retry rules are
//! exercised without a network.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::domain::errors::StoreError;
use crate::domain::folder::CredentialOverride;
use crate::domain::records::RemoteObjectRecord;
use crate::ports::object_store::{ObjectLocation, RemoteObjectStore};
use crate::ports::parameter_store::ParameterStore;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A call observed by [`MemoryObjectStore`], in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOperation {
    Head(String),
    Get(String),
    Put(String),
    Copy { from: String, to: String },
    Delete(String),
    List(String),
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    last_modified: DateTime<Utc>,
    source_modified: Option<DateTime<Utc>>,
    etag: String,
}

/// Bucket store backed by a map
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), StoredObject>>,
    operations: Mutex<Vec<StoreOperation>>,
    failures: Mutex<HashMap<&'static str, VecDeque<StoreError>>>,
    version: AtomicU64,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places an object as an external writer would (no source metadata)
    pub fn insert(
        &self,
        bucket: &str,
        key: &str,
        data: impl Into<Vec<u8>>,
        last_modified: DateTime<Utc>,
    ) {
        let object = StoredObject {
            data: data.into(),
            last_modified,
            source_modified: None,
            etag: self.next_etag(),
        };
        locked(&self.objects).insert((bucket.to_string(), key.to_string()), object);
    }

    /// Content of an object, if present
    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        locked(&self.objects)
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
    }

    /// All keys of a bucket in lexical order
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        locked(&self.objects)
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn operations(&self) -> Vec<StoreOperation> {
        locked(&self.operations).clone()
    }

    pub fn clear_operations(&self) {
        locked(&self.operations).clear();
    }

    /// Makes the next call named `operation` (`head`, `get`, `put`, `copy`,
    /// `delete`, `list`) fail with `error`. Queued failures are consumed in
    /// order.
    pub fn fail_next(&self, operation: &'static str, error: StoreError) {
        locked(&self.failures)
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    fn take_failure(&self, operation: &'static str) -> Result<(), StoreError> {
        match locked(&self.failures)
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn record(&self, op: StoreOperation) {
        locked(&self.operations).push(op);
    }

    fn next_etag(&self) -> String {
        format!("\"v{}\"", self.version.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn to_record(bucket: &str, key: &str, object: &StoredObject) -> RemoteObjectRecord {
        RemoteObjectRecord {
            bucket: bucket.to_string(),
            key: key.to_string(),
            exists: true,
            size: object.data.len() as u64,
            last_modified: Some(object.last_modified),
            source_modified: object.source_modified,
            etag: Some(object.etag.clone()),
        }
    }
}

#[async_trait::async_trait]
impl RemoteObjectStore for MemoryObjectStore {
    async fn head(&self, location: &ObjectLocation) -> Result<RemoteObjectRecord, StoreError> {
        self.record(StoreOperation::Head(location.key.clone()));
        self.take_failure("head")?;
        let objects = locked(&self.objects);
        Ok(
            match objects.get(&(location.bucket.clone(), location.key.clone())) {
                Some(object) => Self::to_record(&location.bucket, &location.key, object),
                None => RemoteObjectRecord::missing(&location.bucket, &location.key),
            },
        )
    }

    async fn get(&self, location: &ObjectLocation, destination: &Path) -> Result<u64, StoreError> {
        self.record(StoreOperation::Get(location.key.clone()));
        self.take_failure("get")?;
        let data = self
            .object(&location.bucket, &location.key)
            .ok_or_else(|| StoreError::NotFound(location.to_string()))?;
        std::fs::write(destination, &data)?;
        Ok(data.len() as u64)
    }

    async fn put(
        &self,
        location: &ObjectLocation,
        source: &Path,
        source_modified: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.record(StoreOperation::Put(location.key.clone()));
        self.take_failure("put")?;
        let data = std::fs::read(source)?;
        let object = StoredObject {
            data,
            last_modified: Utc::now(),
            source_modified,
            etag: self.next_etag(),
        };
        locked(&self.objects).insert((location.bucket.clone(), location.key.clone()), object);
        Ok(())
    }

    async fn copy(&self, source: &ObjectLocation, destination_key: &str) -> Result<(), StoreError> {
        self.record(StoreOperation::Copy {
            from: source.key.clone(),
            to: destination_key.to_string(),
        });
        self.take_failure("copy")?;
        let mut objects = locked(&self.objects);
        let mut object = objects
            .get(&(source.bucket.clone(), source.key.clone()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(source.to_string()))?;
        object.last_modified = Utc::now();
        object.etag = self.next_etag();
        objects.insert((source.bucket.clone(), destination_key.to_string()), object);
        Ok(())
    }

    async fn delete(&self, location: &ObjectLocation) -> Result<(), StoreError> {
        self.record(StoreOperation::Delete(location.key.clone()));
        self.take_failure("delete")?;
        locked(&self.objects).remove(&(location.bucket.clone(), location.key.clone()));
        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        _credentials: Option<&CredentialOverride>,
    ) -> Result<Vec<RemoteObjectRecord>, StoreError> {
        self.record(StoreOperation::List(prefix.to_string()));
        self.take_failure("list")?;
        Ok(locked(&self.objects)
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((b, k), o)| Self::to_record(b, k, o))
            .collect())
    }
}

/// Parameter store backed by a map
#[derive(Debug, Default)]
pub struct MemoryParameterStore {
    values: Mutex<HashMap<String, String>>,
    writes: Mutex<Vec<(String, String)>>,
    failures: Mutex<VecDeque<StoreError>>,
}

impl MemoryParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self, name: &str) -> Option<String> {
        locked(&self.values).get(name).cloned()
    }

    /// Every successful `put`, in order
    pub fn writes(&self) -> Vec<(String, String)> {
        locked(&self.writes).clone()
    }

    pub fn fail_next(&self, error: StoreError) {
        locked(&self.failures).push_back(error);
    }
}

#[async_trait::async_trait]
impl ParameterStore for MemoryParameterStore {
    async fn put(
        &self,
        name: &str,
        value: &str,
        _credentials: Option<&CredentialOverride>,
    ) -> Result<(), StoreError> {
        if let Some(err) = locked(&self.failures).pop_front() {
            return Err(err);
        }
        locked(&self.values).insert(name.to_string(), value.to_string());
        locked(&self.writes).push((name.to_string(), value.to_string()));
        Ok(())
    }

    async fn get(
        &self,
        name: &str,
        _credentials: Option<&CredentialOverride>,
    ) -> Result<Option<String>, StoreError> {
        Ok(self.value(name))
    }
}
