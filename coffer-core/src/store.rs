/*!
Snapshot store: the handle every snapshot operation goes through.

A [`SnapshotStore`] is only handed out once the configuration validated and
the bucket was confirmed to exist. Each network-bound call it makes is
bounded by its own deadline derived from [`StoreConfig::timeout`] and by the
store's cancellation token. Nothing here retries; callers own that policy
(see `coffer-retry`).
*/

use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::UploadFailure;
#[cfg(feature = "metrics")]
use crate::observability::{CofferMetrics, MetricsTimer};
use crate::record::{content_type_for, join_key, SnapshotRecord};
use crate::snapshot_dir::SnapshotDirResolver;
use crate::storage::{ObjectInfo, ObjectStore, S3ObjectStore};
use crate::{CofferError, Result};

/// Handle to a validated, reachable snapshot bucket
///
/// # Example
/// ```rust,no_run
/// use coffer_core::{SnapshotStore, StoreConfig};
///
/// # async fn run() -> coffer_core::Result<()> {
/// let mut config = StoreConfig::with_bucket("etcd-backups");
/// config.folder = "cluster-a".to_string();
///
/// let store = SnapshotStore::open(config).await?;
/// for (key, record) in store.list().await? {
///     println!("{key}: {} ({} bytes)", record.object_key, record.size);
/// }
/// # Ok(())
/// # }
/// ```
pub struct SnapshotStore<O: ObjectStore = S3ObjectStore> {
    config: StoreConfig,
    objects: O,
    cancel: CancellationToken,
}

impl SnapshotStore<S3ObjectStore> {
    /// Open a store backed by S3
    ///
    /// # Errors
    /// - `Configuration` when the bucket name is empty; no client is built
    /// - `InvalidCertificate` when the custom CA cannot be parsed
    /// - `BackendUnavailable` when the bucket check fails or times out
    /// - `BucketNotFound` when the bucket does not exist
    pub async fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let objects = S3ObjectStore::connect(&config).await?;
        Self::with_object_store(config, objects).await
    }
}

impl<O: ObjectStore> SnapshotStore<O> {
    /// Open a store over an arbitrary object store
    ///
    /// Performs the same validation and bucket check as [`SnapshotStore::open`].
    pub async fn with_object_store(config: StoreConfig, objects: O) -> Result<Self> {
        Self::with_cancellation(config, objects, CancellationToken::new()).await
    }

    /// Open a store whose operations are cancelled together with `cancel`
    pub async fn with_cancellation(
        config: StoreConfig,
        objects: O,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let store = SnapshotStore {
            config,
            objects,
            cancel,
        };

        let bucket = store.config.bucket.clone();
        info!(bucket = %bucket, "Checking if S3 bucket {} exists", bucket);
        let exists = store
            .bounded("bucket_exists", store.objects.bucket_exists())
            .await
            .map_err(|e| match e {
                CofferError::Cancelled(op) => CofferError::Cancelled(op),
                e => CofferError::BackendUnavailable(format!(
                    "failed to test for existence of bucket {bucket}: {e}"
                )),
            })?;
        if !exists {
            return Err(CofferError::BucketNotFound(bucket));
        }

        info!(bucket = %bucket, "S3 bucket {} exists", bucket);
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn object_store(&self) -> &O {
        &self.objects
    }

    /// Token that aborts every in-flight and future operation of this store
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Upload a local snapshot file to `<folder>/<file name>`
    ///
    /// `metadata_source` is attached to the returned record untouched. On
    /// failure the record is still returned inside [`UploadFailure`] with a
    /// failed status and the base64-encoded error text.
    pub async fn upload(
        &self,
        snapshot: &Path,
        metadata_source: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> std::result::Result<SnapshotRecord, UploadFailure> {
        let mut record = SnapshotRecord::for_upload(snapshot, &self.config, metadata_source, now);
        let content_type = content_type_for(snapshot);

        info!(
            bucket = %self.config.bucket,
            key = %record.object_key,
            "Uploading snapshot {} to S3",
            snapshot.display()
        );

        let uploaded = self
            .bounded(
                "upload",
                self.objects.put_file(&record.object_key, snapshot, content_type),
            )
            .await;

        match uploaded {
            Ok(size) => {
                debug!(key = %record.object_key, size = size, "Snapshot uploaded");
                record.mark_successful(size);
                Ok(record)
            }
            Err(e) => {
                warn!(key = %record.object_key, error = %e, "Snapshot upload failed");
                record.mark_failed(&e);
                let source = CofferError::transfer(record.object_key.clone(), e);
                Err(UploadFailure {
                    record: Box::new(record),
                    source,
                })
            }
        }
    }

    /// Download `<folder>/<name>` into `dest_dir/<name>`
    ///
    /// A missing object, or a fetch that fails before any data arrives, is
    /// not an error: `Ok(None)` is returned and nothing is written. Callers
    /// that need the file must check the result.
    pub async fn download(&self, name: &str, dest_dir: &Path) -> Result<Option<PathBuf>> {
        self.download_into(name, || Ok(dest_dir.to_path_buf())).await
    }

    /// Download the configured restore path into the resolver's snapshot directory
    ///
    /// # Returns
    /// The local path the snapshot landed at, or `None` if nothing was fetched
    pub async fn restore<R>(&self, resolver: &R) -> Result<Option<PathBuf>>
    where
        R: SnapshotDirResolver + ?Sized,
    {
        let name = self
            .config
            .restore_path
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| CofferError::configuration("restore path was not set"))?;

        self.download_into(name, || resolver.snapshot_dir(true)).await
    }

    async fn download_into<F>(&self, name: &str, dest_dir: F) -> Result<Option<PathBuf>>
    where
        F: FnOnce() -> Result<PathBuf>,
    {
        let key = join_key(&self.config.folder, name);
        debug!(bucket = %self.config.bucket, key = %key, "retrieving snapshot: {}", key);

        let body = match self.bounded("download", self.objects.get_object(&key)).await {
            Ok(Some(body)) => body,
            Ok(None) => {
                info!(key = %key, "Snapshot not found in S3, nothing to restore");
                return Ok(None);
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to fetch snapshot from S3, nothing to restore");
                return Ok(None);
            }
        };

        let dir = dest_dir()?;
        let local_path = dir.join(name.trim_start_matches('/'));
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let size = body.size;
        let written = self
            .bounded("download", async {
                let mut file = create_private_file(&local_path).await?;
                let mut reader = body.reader.take(size);
                let copied = tokio::io::copy(&mut reader, &mut file).await?;
                if copied < size {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("expected {size} bytes, received {copied}"),
                    )
                    .into());
                }
                file.flush().await?;
                Ok(())
            })
            .await;

        if let Err(e) = written {
            if let Err(remove_err) = tokio::fs::remove_file(&local_path).await {
                if remove_err.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        path = %local_path.display(),
                        error = %remove_err,
                        "Failed to remove partial snapshot"
                    );
                }
            }
            return Err(CofferError::transfer(key, e));
        }

        restrict_permissions(&local_path).await?;

        info!(key = %key, path = %local_path.display(), size = size, "Snapshot downloaded");
        Ok(Some(local_path))
    }

    /// List every snapshot under the folder, keyed by [`SnapshotRecord::derived_key`]
    ///
    /// Zero-byte objects are skipped. The first listing error aborts the
    /// whole call and no partial result is returned.
    pub async fn list(&self) -> Result<BTreeMap<String, SnapshotRecord>> {
        let prefix = listing_prefix(&self.config.folder);
        let mut objects = self.objects.list(&prefix);

        let records = self
            .bounded("list", async {
                let mut records = BTreeMap::new();
                while let Some(object) = objects.next().await {
                    let object = object?;
                    if object.size == 0 {
                        debug!(key = %object.key, "Skipping zero-size object");
                        continue;
                    }
                    let record = SnapshotRecord::from_listing(&object, &self.config);
                    records.insert(record.derived_key(), record);
                }
                Ok(records)
            })
            .await
            .map_err(|e| CofferError::listing(prefix.clone(), e))?;

        debug!(prefix = %prefix, count = records.len(), "Listed snapshots");
        Ok(records)
    }

    /// Delete the oldest snapshots beyond the retention count
    ///
    /// Only keys under `<folder>/<snapshot name>` are considered. Objects are
    /// ordered newest first by last-modified time and everything past the
    /// retention count is removed one at a time; the first failed removal
    /// stops the pass.
    ///
    /// # Returns
    /// Keys that were removed, oldest last
    pub async fn enforce_retention(&self) -> Result<Vec<String>> {
        if self.config.retention < 1 {
            return Ok(Vec::new());
        }

        let prefix = join_key(&self.config.folder, &self.config.snapshot_name);
        info!(
            prefix = %prefix,
            retention = self.config.retention,
            "Applying snapshot retention policy in S3"
        );

        let mut stream = self.objects.list(&prefix);
        let mut objects: Vec<ObjectInfo> = self
            .bounded("list", async {
                let mut objects = Vec::new();
                while let Some(object) = stream.next().await {
                    objects.push(object?);
                }
                Ok(objects)
            })
            .await
            .map_err(|e| CofferError::listing(prefix.clone(), e))?;

        let retention = self.config.retention as usize;
        if objects.len() <= retention {
            debug!(prefix = %prefix, count = objects.len(), "Nothing to prune");
            return Ok(Vec::new());
        }

        sort_newest_first(&mut objects);

        let mut removed = Vec::with_capacity(objects.len() - retention);
        for object in &objects[retention..] {
            info!(key = %object.key, "Removing S3 snapshot: {}", object.key);
            self.bounded("delete", self.objects.delete(&object.key))
                .await
                .map_err(|e| CofferError::deletion(object.key.clone(), e))?;

            #[cfg(feature = "metrics")]
            CofferMetrics::global().record_pruned();
            removed.push(object.key.clone());
        }

        Ok(removed)
    }

    /// Run `fut` under a fresh deadline and the store's cancellation token
    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timeout = self.config.timeout();

        #[cfg(feature = "metrics")]
        let timer = MetricsTimer::start(operation);

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CofferError::Cancelled(operation)),
            outcome = tokio::time::timeout(timeout, fut) => match outcome {
                Ok(result) => result,
                Err(_) => Err(CofferError::Timeout { operation, timeout }),
            },
        };

        #[cfg(feature = "metrics")]
        match &result {
            Ok(_) => timer.finish(),
            Err(_) => timer.finish_with_error(),
        }

        result
    }
}

/// Listing prefix for a folder; a trailing slash keeps sibling folders out
fn listing_prefix(folder: &str) -> String {
    let folder = folder.trim_matches('/');
    if folder.is_empty() {
        String::new()
    } else {
        format!("{folder}/")
    }
}

/// Newest first; equal timestamps fall back to reverse key order
fn sort_newest_first(objects: &mut [ObjectInfo]) {
    objects.sort_by(|a, b| {
        b.last_modified
            .cmp(&a.last_modified)
            .then_with(|| b.key.cmp(&a.key))
    });
}

/// Create or truncate `path`; on unix the file is never readable by others
async fn create_private_file(path: &Path) -> std::io::Result<tokio::fs::File> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path).await
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
