/*!
Synchronous facade over [`SnapshotStore`].

For callers without their own async runtime. Every call is driven to
completion on a process-wide multi-thread runtime, so these methods must
not be called from inside a Tokio runtime.
*/

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use crate::config::StoreConfig;
use crate::error::UploadFailure;
use crate::record::SnapshotRecord;
use crate::snapshot_dir::SnapshotDirResolver;
use crate::storage::{ObjectStore, S3ObjectStore};
use crate::store::SnapshotStore;
use crate::Result;

static GLOBAL_RT: Lazy<Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .thread_name("coffer-rt")
        .enable_all()
        .build()
        .expect("Failed to create global async runtime")
});

/// Blocking wrapper for a snapshot store
pub struct BlockingSnapshotStore<O: ObjectStore = S3ObjectStore> {
    inner: SnapshotStore<O>,
}

impl BlockingSnapshotStore<S3ObjectStore> {
    /// Blocking version of [`SnapshotStore::open`]
    pub fn open(config: StoreConfig) -> Result<Self> {
        GLOBAL_RT
            .block_on(SnapshotStore::open(config))
            .map(|inner| Self { inner })
    }
}

impl<O: ObjectStore> BlockingSnapshotStore<O> {
    pub fn with_object_store(config: StoreConfig, objects: O) -> Result<Self> {
        GLOBAL_RT
            .block_on(SnapshotStore::with_object_store(config, objects))
            .map(|inner| Self { inner })
    }

    pub fn upload(
        &self,
        snapshot: &Path,
        metadata_source: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> std::result::Result<SnapshotRecord, UploadFailure> {
        GLOBAL_RT.block_on(self.inner.upload(snapshot, metadata_source, now))
    }

    pub fn download(&self, name: &str, dest_dir: &Path) -> Result<Option<PathBuf>> {
        GLOBAL_RT.block_on(self.inner.download(name, dest_dir))
    }

    pub fn restore<R>(&self, resolver: &R) -> Result<Option<PathBuf>>
    where
        R: SnapshotDirResolver + ?Sized,
    {
        GLOBAL_RT.block_on(self.inner.restore(resolver))
    }

    pub fn list(&self) -> Result<BTreeMap<String, SnapshotRecord>> {
        GLOBAL_RT.block_on(self.inner.list())
    }

    pub fn enforce_retention(&self) -> Result<Vec<String>> {
        GLOBAL_RT.block_on(self.inner.enforce_retention())
    }

    /// Token that cancels operations running on another thread
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancellation_token()
    }

    pub fn inner(&self) -> &SnapshotStore<O> {
        &self.inner
    }

    pub fn into_inner(self) -> SnapshotStore<O> {
        self.inner
    }
}
