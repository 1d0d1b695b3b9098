/*!
Object storage port and adapters.

`ObjectStore` is the narrow set of bucket operations the snapshot store
needs. The S3 adapter implements it over the AWS SDK; tests use an
in-memory implementation. Every method is a single network round trip (or
a lazy stream of them) so callers can put one deadline around each call.
*/

pub mod s3;

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::path::Path;
use tokio::io::AsyncRead;

pub use s3::S3ObjectStore;

/// Listing entry for one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Body of a fetched object
pub struct ObjectBody {
    /// Size reported by the object store
    pub size: u64,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl std::fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBody").field("size", &self.size).finish()
    }
}

/// Bucket-scoped object storage operations
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Check whether the configured bucket exists
    ///
    /// # Returns
    /// `Ok(false)` when the store answered that the bucket is absent, an
    /// error when the store could not be reached or refused the request
    async fn bucket_exists(&self) -> Result<bool>;

    /// Upload a local file to `key`
    ///
    /// # Returns
    /// Number of bytes transferred
    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> Result<u64>;

    /// Fetch an object
    ///
    /// # Returns
    /// `Ok(None)` when the object does not exist
    async fn get_object(&self, key: &str) -> Result<Option<ObjectBody>>;

    /// Lazily list every object whose key starts with `prefix`, recursively
    ///
    /// Dropping the stream stops the enumeration.
    fn list(&self, prefix: &str) -> BoxStream<'static, Result<ObjectInfo>>;

    /// Delete one object
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Memory-based object store for testing
///
/// Stores objects in a map guarded by a mutex and records every call so
/// tests can assert on the traffic a store operation produced.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryObjectStore {
    bucket_exists: bool,
    objects: std::sync::Mutex<std::collections::BTreeMap<String, (Vec<u8>, DateTime<Utc>)>>,
    content_types: std::sync::Mutex<std::collections::HashMap<String, String>>,
    deleted: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            bucket_exists: true,
            ..Default::default()
        }
    }

    pub fn without_bucket() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, data: &[u8], last_modified: DateTime<Utc>) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (data.to_vec(), last_modified));
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn data(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).map(|(data, _)| data.clone())
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.content_types.lock().unwrap().get(key).cloned()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn bucket_exists(&self) -> Result<bool> {
        Ok(self.bucket_exists)
    }

    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> Result<u64> {
        let data = tokio::fs::read(path).await?;
        let size = data.len() as u64;
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (data, Utc::now()));
        self.content_types
            .lock()
            .unwrap()
            .insert(key.to_string(), content_type.to_string());
        Ok(size)
    }

    async fn get_object(&self, key: &str) -> Result<Option<ObjectBody>> {
        let data = self.data(key);
        Ok(data.map(|data| ObjectBody {
            size: data.len() as u64,
            reader: Box::new(std::io::Cursor::new(data)),
        }))
    }

    fn list(&self, prefix: &str) -> BoxStream<'static, Result<ObjectInfo>> {
        let objects: Vec<Result<ObjectInfo>> = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, (data, modified))| {
                Ok(ObjectInfo {
                    key: key.clone(),
                    size: data.len() as u64,
                    last_modified: *modified,
                })
            })
            .collect();
        Box::pin(futures::stream::iter(objects))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(key);
        self.deleted.lock().unwrap().push(key.to_string());
        Ok(())
    }
}
