/*!
Snapshot records and the object naming conventions they are rebuilt from.

A record is produced authoritatively by an upload, or reconstructed on a
best-effort basis from an object listing. Both paths must agree on the
derived key so that a reporting layer indexing records by that key sees the
same entry before and after a listing.
*/

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::config::StoreConfig;
use crate::storage::ObjectInfo;

/// Filename suffix marking a compressed snapshot archive
pub const COMPRESSED_EXTENSION: &str = ".zip";

/// Node name recorded for snapshots that live in object storage
pub const S3_ORIGIN: &str = "s3";

/// Content type used for compressed snapshots
pub const CONTENT_TYPE_ARCHIVE: &str = "application/zip";

/// Content type used for every other snapshot
pub const CONTENT_TYPE_BINARY: &str = "application/octet-stream";

/// Outcome of a snapshot upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Successful,
    Failed,
}

/// Storage settings needed to locate a snapshot again later
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Location {
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_ca: Option<String>,
    pub skip_ssl_verify: bool,
    pub bucket: String,
    pub region: String,
    pub folder: String,
    pub insecure: bool,
}

impl From<&StoreConfig> for S3Location {
    fn from(config: &StoreConfig) -> Self {
        S3Location {
            endpoint: config.endpoint.clone(),
            endpoint_ca: config.endpoint_ca.clone(),
            skip_ssl_verify: config.skip_ssl_verify,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            folder: config.folder.clone(),
            insecure: config.insecure,
        }
    }
}

/// One persisted or listed snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    /// Base filename of the object, including any compression suffix
    pub name: String,

    /// Origin of the snapshot; always [`S3_ORIGIN`] for records built here
    pub node_name: String,

    /// Creation time (authoritative on upload, reconstructed on listing)
    pub created_at: DateTime<Utc>,

    /// Size in bytes as reported by the object store
    pub size: u64,

    pub status: SnapshotStatus,

    /// Base64-encoded error text, only present on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    pub compressed: bool,

    /// Full object key inside the bucket
    pub object_key: String,

    pub s3: S3Location,

    /// Caller-supplied metadata passed through untouched; never persisted
    #[serde(skip)]
    pub metadata_source: Option<serde_json::Value>,
}

impl SnapshotRecord {
    /// Build the record for an upload of `snapshot` that has not completed yet
    ///
    /// The status starts out as failed with no message; callers settle it
    /// with [`SnapshotRecord::mark_successful`] or [`SnapshotRecord::mark_failed`].
    pub(crate) fn for_upload(
        snapshot: &Path,
        config: &StoreConfig,
        metadata_source: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Self {
        let name = base_name(snapshot);
        SnapshotRecord {
            object_key: join_key(&config.folder, &name),
            compressed: name.ends_with(COMPRESSED_EXTENSION),
            name,
            node_name: S3_ORIGIN.to_string(),
            created_at: now,
            size: 0,
            status: SnapshotStatus::Failed,
            message: None,
            s3: S3Location::from(config),
            metadata_source,
        }
    }

    pub(crate) fn mark_successful(&mut self, size: u64) {
        self.status = SnapshotStatus::Successful;
        self.size = size;
        self.message = None;
    }

    pub(crate) fn mark_failed(&mut self, error: &dyn std::fmt::Display) {
        self.status = SnapshotStatus::Failed;
        self.message = Some(BASE64_STANDARD.encode(error.to_string()));
    }

    /// Reconstruct a record from a listed object
    ///
    /// The creation time comes from the trailing `-<unix seconds>` of the
    /// name; when that does not parse, the object's last-modified time is
    /// used instead. Listed objects are always successful uploads.
    pub fn from_listing(object: &ObjectInfo, config: &StoreConfig) -> Self {
        let name = object
            .key
            .rsplit('/')
            .next()
            .unwrap_or(object.key.as_str())
            .to_string();
        let parsed = parse_snapshot_filename(&name);
        let created_at = parsed
            .timestamp
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or(object.last_modified);

        SnapshotRecord {
            name,
            node_name: S3_ORIGIN.to_string(),
            created_at,
            size: object.size,
            status: SnapshotStatus::Successful,
            message: None,
            compressed: parsed.compressed,
            object_key: object.key.clone(),
            s3: S3Location::from(config),
            metadata_source: None,
        }
    }

    /// Deterministic key used to index records outside the object store
    ///
    /// Format: `s3-<sanitized name>-<8 hex chars>`, where the hash covers the
    /// bucket and object key. Only characters valid in ConfigMap keys survive
    /// sanitization.
    pub fn derived_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.s3.bucket.as_bytes());
        hasher.update(b"/");
        hasher.update(self.object_key.as_bytes());
        let digest = format!("{:x}", hasher.finalize());

        let name: String = self
            .name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        format!("{}-{}-{}", self.node_name, name, &digest[..8])
    }

    /// Decode the failure message back into readable text
    pub fn decoded_message(&self) -> Option<String> {
        let encoded = self.message.as_ref()?;
        let bytes = BASE64_STANDARD.decode(encoded).ok()?;
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn is_successful(&self) -> bool {
        self.status == SnapshotStatus::Successful
    }
}

/// Name properties recovered from a snapshot's filename
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedSnapshotName {
    pub compressed: bool,
    /// Unix seconds after the last hyphen, if they parse
    pub timestamp: Option<i64>,
}

/// Recover compression and creation time from a snapshot filename
///
/// ```rust
/// use coffer_core::record::parse_snapshot_filename;
///
/// let parsed = parse_snapshot_filename("etcd-snapshot-node1-1700000000.zip");
/// assert!(parsed.compressed);
/// assert_eq!(parsed.timestamp, Some(1_700_000_000));
/// ```
pub fn parse_snapshot_filename(filename: &str) -> ParsedSnapshotName {
    let (stem, compressed) = match filename.strip_suffix(COMPRESSED_EXTENSION) {
        Some(stem) => (stem, true),
        None => (filename, false),
    };
    let tail = match stem.rfind('-') {
        Some(idx) => &stem[idx + 1..],
        None => stem,
    };

    ParsedSnapshotName {
        compressed,
        timestamp: tail.parse::<i64>().ok(),
    }
}

/// Content type for a local snapshot file, based on its suffix
pub fn content_type_for(path: &Path) -> &'static str {
    if path.to_string_lossy().ends_with(COMPRESSED_EXTENSION) {
        CONTENT_TYPE_ARCHIVE
    } else {
        CONTENT_TYPE_BINARY
    }
}

/// Join a folder prefix and a name into an object key
///
/// Redundant slashes are dropped; an empty folder yields the bare name.
pub fn join_key(folder: &str, name: &str) -> String {
    let folder = folder.trim_matches('/');
    let name = name.trim_start_matches('/');
    if folder.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        folder.to_string()
    } else {
        format!("{folder}/{name}")
    }
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config() -> StoreConfig {
        let mut config = StoreConfig::with_bucket("backups");
        config.folder = "etcd".to_string();
        config
    }

    fn object(key: &str, size: u64, modified_secs: i64) -> ObjectInfo {
        ObjectInfo {
            key: key.to_string(),
            size,
            last_modified: Utc.timestamp_opt(modified_secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_parse_compressed_name() {
        let parsed = parse_snapshot_filename("snapshot-node1-1700000000.zip");
        assert!(parsed.compressed);
        assert_eq!(parsed.timestamp, Some(1_700_000_000));
    }

    #[test]
    fn test_parse_plain_name() {
        let parsed = parse_snapshot_filename("snapshot-node1-1700000000");
        assert!(!parsed.compressed);
        assert_eq!(parsed.timestamp, Some(1_700_000_000));
    }

    #[test]
    fn test_parse_non_numeric_tail() {
        let parsed = parse_snapshot_filename("snapshot-node1-latest.zip");
        assert!(parsed.compressed);
        assert_eq!(parsed.timestamp, None);
    }

    #[test]
    fn test_parse_without_hyphen_uses_whole_stem() {
        assert_eq!(parse_snapshot_filename("1700000000").timestamp, Some(1_700_000_000));
        assert_eq!(parse_snapshot_filename("snapshot").timestamp, None);
    }

    #[test]
    fn test_listing_falls_back_to_last_modified() {
        let obj = object("etcd/snapshot-node1-latest", 42, 1_650_000_000);
        let record = SnapshotRecord::from_listing(&obj, &config());

        assert_eq!(record.created_at, obj.last_modified);
        assert_eq!(record.name, "snapshot-node1-latest");
        assert!(!record.compressed);
        assert!(record.is_successful());
        assert_eq!(record.size, 42);
    }

    #[test]
    fn test_listing_uses_name_timestamp() {
        let obj = object("etcd/snapshot-node1-1700000000.zip", 42, 1_650_000_000);
        let record = SnapshotRecord::from_listing(&obj, &config());

        assert_eq!(record.created_at.timestamp(), 1_700_000_000);
        assert!(record.compressed);
        assert_eq!(record.node_name, S3_ORIGIN);
        assert_eq!(record.s3.bucket, "backups");
        assert_eq!(record.s3.folder, "etcd");
    }

    #[test]
    fn test_out_of_range_timestamp_falls_back() {
        let obj = object("etcd/snapshot-99999999999999999", 1, 1_650_000_000);
        let record = SnapshotRecord::from_listing(&obj, &config());
        assert_eq!(record.created_at, obj.last_modified);
    }

    #[test]
    fn test_upload_and_listing_share_derived_key() {
        let now = Utc.timestamp_opt(1_800_000_000, 0).unwrap();
        for name in ["snapshot-20240101.zip", "snapshot-node1-1700000000"] {
            let uploaded =
                SnapshotRecord::for_upload(Path::new("/var/lib/snapshots").join(name).as_path(), &config(), None, now);
            let listed = SnapshotRecord::from_listing(&object(&format!("etcd/{name}"), 10, 1), &config());

            assert_eq!(uploaded.object_key, listed.object_key);
            assert_eq!(uploaded.derived_key(), listed.derived_key());
        }
    }

    #[test]
    fn test_derived_key_separates_nested_objects() {
        let a = SnapshotRecord::from_listing(&object("etcd/a/snapshot-latest", 1, 10), &config());
        let b = SnapshotRecord::from_listing(&object("etcd/b/snapshot-latest", 1, 20), &config());

        assert_eq!(a.name, b.name);
        assert_ne!(a.derived_key(), b.derived_key());
    }

    #[test]
    fn test_derived_key_is_sanitized() {
        let record = SnapshotRecord::from_listing(&object("etcd/snap shot+1", 1, 10), &config());
        let key = record.derived_key();

        assert!(key.starts_with("s3-snap_shot_1-"));
        assert!(key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')));
        assert_eq!(key, record.derived_key());
    }

    #[test]
    fn test_failed_message_is_base64() {
        let now = Utc::now();
        let mut record = SnapshotRecord::for_upload(Path::new("snapshot-1.zip"), &config(), None, now);
        record.mark_failed(&"access denied: \"bucket\"\n<xml/>");

        assert_eq!(record.status, SnapshotStatus::Failed);
        let message = record.message.as_deref().unwrap();
        assert!(!message.contains('"'));
        assert_eq!(
            record.decoded_message().as_deref(),
            Some("access denied: \"bucket\"\n<xml/>")
        );
    }

    #[test]
    fn test_record_serialization() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut record = SnapshotRecord::for_upload(
            Path::new("snapshot-1700000000.zip"),
            &config(),
            Some(serde_json::json!({"node": "n1"})),
            now,
        );
        record.mark_successful(1024);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["nodeName"], "s3");
        assert_eq!(json["status"], "successful");
        assert_eq!(json["objectKey"], "etcd/snapshot-1700000000.zip");
        assert_eq!(json["s3"]["bucket"], "backups");
        assert!(json.get("message").is_none());
        assert!(json.get("metadataSource").is_none());
    }

    #[test]
    fn test_join_key() {
        assert_eq!(join_key("", "a.zip"), "a.zip");
        assert_eq!(join_key("etcd", "a.zip"), "etcd/a.zip");
        assert_eq!(join_key("etcd/", "/a.zip"), "etcd/a.zip");
        assert_eq!(join_key("/nested/dir/", "a"), "nested/dir/a");
        assert_eq!(join_key("etcd", ""), "etcd");
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for(Path::new("/tmp/snapshot-1.zip")), CONTENT_TYPE_ARCHIVE);
        assert_eq!(content_type_for(Path::new("/tmp/snapshot-1")), CONTENT_TYPE_BINARY);
        assert_eq!(content_type_for(Path::new("/tmp/snapshot-1.zip.part")), CONTENT_TYPE_BINARY);
    }
}
