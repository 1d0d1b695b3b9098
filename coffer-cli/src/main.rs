/*!
Coffer CLI - store, list, restore and prune snapshots in S3-compatible object storage.

Connection settings come from flags or `COFFER_S3_*` environment variables.
*/

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use coffer_core::config::{
    DEFAULT_ENDPOINT, DEFAULT_REGION, DEFAULT_RETENTION, DEFAULT_SNAPSHOT_NAME,
    DEFAULT_TIMEOUT_SECS,
};
use coffer_core::observability::init_observability;
use coffer_core::{LocalSnapshotDir, SnapshotRecord, SnapshotStore, StoreConfig};
use coffer_retry::{with_custom_backoff, LimitedBackoff};
use std::path::PathBuf;
use tabled::{Table, Tabled};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "coffer")]
#[command(about = "Snapshot repository backed by S3-compatible object storage")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "COFFER_LOG_JSON")]
    json_logs: bool,

    /// Retry opening the store this many times on transient failures
    #[arg(long, global = true, env = "COFFER_RETRIES", default_value_t = 0)]
    retries: u32,

    /// Print Prometheus metrics after the command finishes
    #[cfg(feature = "metrics")]
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(flatten)]
    s3: S3Args,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct S3Args {
    /// S3 endpoint host, optionally with scheme
    #[arg(long = "s3-endpoint", env = "COFFER_S3_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    endpoint: String,

    /// Custom CA for the endpoint, base64-encoded PEM or a file path
    #[arg(long = "s3-endpoint-ca", env = "COFFER_S3_ENDPOINT_CA")]
    endpoint_ca: Option<String>,

    /// Skip TLS certificate verification
    #[arg(long = "s3-skip-ssl-verify", env = "COFFER_S3_SKIP_SSL_VERIFY")]
    skip_ssl_verify: bool,

    /// Access key; leave both keys empty to use ambient credentials
    #[arg(long = "s3-access-key", env = "COFFER_S3_ACCESS_KEY", default_value = "")]
    access_key: String,

    #[arg(
        long = "s3-secret-key",
        env = "COFFER_S3_SECRET_KEY",
        default_value = "",
        hide_env_values = true
    )]
    secret_key: String,

    #[arg(long = "s3-bucket", env = "COFFER_S3_BUCKET", default_value = "")]
    bucket: String,

    #[arg(long = "s3-region", env = "COFFER_S3_REGION", default_value = DEFAULT_REGION)]
    region: String,

    /// Folder prefix for every snapshot key
    #[arg(long = "s3-folder", env = "COFFER_S3_FOLDER", default_value = "")]
    folder: String,

    /// Use plain HTTP
    #[arg(long = "s3-insecure", env = "COFFER_S3_INSECURE")]
    insecure: bool,

    /// Per-operation timeout in seconds
    #[arg(long = "s3-timeout", env = "COFFER_S3_TIMEOUT", default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout_secs: u64,

    /// Snapshot base name; retention only looks at keys starting with it
    #[arg(long = "snapshot-name", env = "COFFER_SNAPSHOT_NAME", default_value = DEFAULT_SNAPSHOT_NAME)]
    snapshot_name: String,

    /// Number of snapshots to keep (0 disables pruning)
    #[arg(long = "snapshot-retention", env = "COFFER_SNAPSHOT_RETENTION", default_value_t = DEFAULT_RETENTION)]
    retention: u32,
}

impl S3Args {
    fn to_config(&self) -> StoreConfig {
        StoreConfig {
            endpoint: self.endpoint.clone(),
            endpoint_ca: self.endpoint_ca.clone().filter(|ca| !ca.is_empty()),
            skip_ssl_verify: self.skip_ssl_verify,
            access_key: self.access_key.clone(),
            secret_key: self.secret_key.clone(),
            bucket: self.bucket.clone(),
            region: self.region.clone(),
            folder: self.folder.clone(),
            insecure: self.insecure,
            timeout_secs: self.timeout_secs,
            snapshot_name: self.snapshot_name.clone(),
            retention: self.retention,
            restore_path: None,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upload a snapshot file, then apply retention
    Save {
        /// Local snapshot file
        snapshot: PathBuf,
        /// JSON metadata attached to the printed record
        #[arg(long)]
        metadata: Option<String>,
        /// Skip retention after the upload
        #[arg(long)]
        no_prune: bool,
    },
    /// Download a snapshot into a local directory
    Restore {
        /// Snapshot name relative to the folder
        name: String,
        /// Destination directory, created if missing
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
    /// List snapshots in the bucket
    List {
        /// Print records as JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Delete snapshots beyond the retention count
    Prune,
}

#[derive(Tabled)]
struct SnapshotInfo {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Compressed")]
    compressed: bool,
    #[tabled(rename = "Object Key")]
    object_key: String,
}

impl From<&SnapshotRecord> for SnapshotInfo {
    fn from(record: &SnapshotRecord) -> Self {
        SnapshotInfo {
            name: record.name.clone(),
            created: format_timestamp(record.created_at.timestamp()),
            size: format_size(record.size),
            compressed: record.compressed,
            object_key: record.object_key.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "coffer=debug" } else { "coffer=info" };
    init_observability(cli.json_logs, Some(filter))?;

    let mut config = cli.s3.to_config();
    if let Commands::Restore { name, .. } = &cli.command {
        config.restore_path = Some(name.clone());
    }

    let store = open_store(config, cli.retries).await?;
    let cancel = store.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling in-flight operations");
            cancel.cancel();
        }
    });

    match cli.command {
        Commands::Save {
            snapshot,
            metadata,
            no_prune,
        } => save_snapshot(&store, snapshot, metadata.as_deref(), no_prune).await?,
        Commands::Restore { name, dir } => restore_snapshot(&store, &name, dir).await?,
        Commands::List { json } => list_snapshots(&store, json).await?,
        Commands::Prune => prune_snapshots(&store).await?,
    }

    #[cfg(feature = "metrics")]
    if cli.print_metrics {
        print!(
            "{}",
            coffer_core::observability::CofferMetrics::global().gather_metrics()?
        );
    }

    Ok(())
}

async fn open_store(config: StoreConfig, retries: u32) -> Result<SnapshotStore, anyhow::Error> {
    info!(bucket = %config.bucket, endpoint = %config.endpoint, "Opening snapshot store");
    let store = with_custom_backoff("open", LimitedBackoff::new(retries), || {
        SnapshotStore::open(config.clone())
    })
    .await
    .context("failed to open snapshot store")?;
    Ok(store)
}

async fn save_snapshot(
    store: &SnapshotStore,
    snapshot: PathBuf,
    metadata: Option<&str>,
    no_prune: bool,
) -> Result<(), anyhow::Error> {
    let metadata = metadata
        .map(|raw| serde_json::from_str::<serde_json::Value>(raw))
        .transpose()
        .context("--metadata is not valid JSON")?;

    match store.upload(&snapshot, metadata, chrono::Utc::now()).await {
        Ok(record) => {
            println!(
                "✓ Uploaded {} ({})",
                record.object_key,
                format_size(record.size)
            );
        }
        Err(failure) => {
            error!(
                key = %failure.record.object_key,
                "Upload failed: {}",
                failure.record.decoded_message().unwrap_or_default()
            );
            eprintln!("{}", serde_json::to_string_pretty(&failure.record)?);
            return Err(failure.into());
        }
    }

    if !no_prune {
        prune_snapshots(store).await?;
    }
    Ok(())
}

async fn restore_snapshot(
    store: &SnapshotStore,
    name: &str,
    dir: PathBuf,
) -> Result<(), anyhow::Error> {
    let resolver = LocalSnapshotDir::new(dir);
    match store.restore(&resolver).await? {
        Some(path) => {
            println!("✓ Restored {name} to {}", path.display());
            Ok(())
        }
        None => Err(anyhow::anyhow!(
            "snapshot {name} was not restored from bucket {}",
            store.config().bucket
        )),
    }
}

async fn list_snapshots(store: &SnapshotStore, json: bool) -> Result<(), anyhow::Error> {
    let records = store.list().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No snapshots found");
        return Ok(());
    }

    let mut rows: Vec<&SnapshotRecord> = records.values().collect();
    rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
    let table = Table::new(rows.into_iter().map(SnapshotInfo::from));
    println!("{table}");
    Ok(())
}

async fn prune_snapshots(store: &SnapshotStore) -> Result<(), anyhow::Error> {
    let removed = store.enforce_retention().await?;
    if removed.is_empty() {
        println!("Nothing to prune");
    } else {
        for key in &removed {
            println!("✓ Removed {key}");
        }
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

fn format_timestamp(timestamp: i64) -> String {
    use chrono::{Local, TimeZone};

    match Local.timestamp_opt(timestamp, 0) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => timestamp.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(16 * 1024 * 1024), "16.0 MB");
    }

    #[test]
    fn test_format_timestamp_out_of_range() {
        assert_eq!(format_timestamp(i64::MAX), i64::MAX.to_string());
    }

    #[test]
    fn test_parse_save_command() {
        let cli = Cli::try_parse_from([
            "coffer",
            "--s3-bucket",
            "backups",
            "--s3-folder",
            "etcd",
            "--retries",
            "3",
            "save",
            "/var/lib/db/snapshot-1700000000.zip",
            "--no-prune",
        ])
        .unwrap();

        assert_eq!(cli.retries, 3);
        let config = cli.s3.to_config();
        assert_eq!(config.bucket, "backups");
        assert_eq!(config.folder, "etcd");
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.endpoint_ca, None);
        assert_eq!(config.retention, DEFAULT_RETENTION);
        assert!(matches!(cli.command, Commands::Save { no_prune: true, .. }));
    }

    #[test]
    fn test_parse_restore_command() {
        let cli = Cli::try_parse_from([
            "coffer",
            "--s3-bucket",
            "backups",
            "--s3-insecure",
            "restore",
            "snapshot-node1-1700000000",
            "--dir",
            "/tmp/restore",
        ])
        .unwrap();

        assert!(cli.s3.insecure);
        match cli.command {
            Commands::Restore { name, dir } => {
                assert_eq!(name, "snapshot-node1-1700000000");
                assert_eq!(dir, PathBuf::from("/tmp/restore"));
            }
            other => panic!("Expected restore, got {other:?}"),
        }
    }

    #[test]
    fn test_restore_requires_name() {
        assert!(Cli::try_parse_from(["coffer", "restore"]).is_err());
    }
}
