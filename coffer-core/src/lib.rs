/*!
# Coffer Core

S3-compatible snapshot repository for datastore backups.

Snapshots are local files (optionally `.zip` archives) that are uploaded to
a bucket under a folder prefix, listed back as [`SnapshotRecord`]s, pruned by
a retention count and restored into a local snapshot directory.

## Usage

```rust,no_run
use coffer_core::{LocalSnapshotDir, SnapshotStore, StoreConfig};
use std::path::Path;

# async fn run() -> Result<(), Box<dyn std::error::Error>> {
let mut config = StoreConfig::from_uri("s3://etcd-backups/cluster-a")?;
config.endpoint = "minio.internal:9000".to_string();
config.retention = 5;

let store = SnapshotStore::open(config).await?;

let record = store
    .upload(Path::new("/var/lib/db/snapshots/snapshot-1700000000.zip"), None, chrono::Utc::now())
    .await?;
println!("uploaded {} ({} bytes)", record.object_key, record.size);

let pruned = store.enforce_retention().await?;
println!("pruned {} old snapshots", pruned.len());

let restored = store
    .download("snapshot-1700000000.zip", LocalSnapshotDir::new("/tmp/restore").path())
    .await?;
# Ok(())
# }
```

The core never retries; wrap calls with `coffer-retry` where that is wanted.
*/

pub mod blocking;
pub mod config;
pub mod error;
pub mod observability;
pub mod record;
pub mod snapshot_dir;
pub mod storage;
pub mod store;
pub mod transport;

pub use blocking::BlockingSnapshotStore;
pub use config::StoreConfig;
pub use error::{CofferError, Result, UploadFailure};
pub use record::{SnapshotRecord, SnapshotStatus};
pub use snapshot_dir::{LocalSnapshotDir, SnapshotDirResolver};
pub use storage::{ObjectStore, S3ObjectStore};
pub use store::SnapshotStore;
