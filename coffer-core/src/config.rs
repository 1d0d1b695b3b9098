//! Configuration for the S3-backed snapshot repository
//!
//! `StoreConfig` is immutable once a store has been opened. It is usually
//! populated by a CLI or by an embedding application; this module only
//! provides defaults, a URI shorthand and validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default S3 endpoint
pub const DEFAULT_ENDPOINT: &str = "s3.amazonaws.com";
/// Default region used for request signing
pub const DEFAULT_REGION: &str = "us-east-1";
/// Default per-operation timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 5 * 60;
/// Default base name of snapshots, used to scope retention
pub const DEFAULT_SNAPSHOT_NAME: &str = "snapshot";
/// Default number of snapshots kept by retention
pub const DEFAULT_RETENTION: u32 = 5;

/// Configuration for one bucket of the snapshot repository
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreConfig {
    /// Endpoint host (optionally with scheme), e.g. `s3.amazonaws.com` or `minio:9000`
    pub endpoint: String,
    /// Custom CA bundle, either base64-encoded PEM or a path to a PEM file
    pub endpoint_ca: Option<String>,
    /// Skip TLS certificate verification
    pub skip_ssl_verify: bool,
    /// Static access key; empty together with `secret_key` selects ambient credentials
    pub access_key: String,
    /// Static secret key
    #[serde(skip_serializing)]
    pub secret_key: String,
    /// Bucket holding the snapshots (required)
    pub bucket: String,
    /// Region used for request signing
    pub region: String,
    /// Folder prefix prepended to every object key
    pub folder: String,
    /// Use plain HTTP instead of HTTPS
    pub insecure: bool,
    /// Timeout applied to each individual network operation, in seconds
    pub timeout_secs: u64,
    /// Base name of snapshots; retention only considers keys starting with it
    pub snapshot_name: String,
    /// Number of snapshots to keep; values below 1 disable retention
    pub retention: u32,
    /// Snapshot name to fetch on restore, relative to the folder
    pub restore_path: Option<String>,
}

impl StoreConfig {
    /// Create a configuration for the given bucket with all other fields defaulted
    pub fn with_bucket(bucket: impl Into<String>) -> Self {
        StoreConfig {
            bucket: bucket.into(),
            ..Default::default()
        }
    }

    /// Parse a storage URI of the form `s3://bucket[/folder]`
    ///
    /// The remainder after the bucket becomes the folder prefix.
    pub fn from_uri(uri: &str) -> crate::Result<StoreConfig> {
        let s3_part = uri.strip_prefix("s3://").ok_or_else(|| {
            crate::CofferError::configuration(format!("Invalid S3 URI '{uri}': expected s3://bucket/folder"))
        })?;

        let (bucket, folder) = match s3_part.split_once('/') {
            Some((bucket, folder)) => (bucket, folder.trim_matches('/')),
            None => (s3_part, ""),
        };
        if bucket.is_empty() {
            return Err(crate::CofferError::configuration(
                "Invalid S3 URI: missing bucket name",
            ));
        }

        let mut config = StoreConfig::with_bucket(bucket);
        config.folder = folder.to_string();
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.bucket.is_empty() {
            return Err(crate::CofferError::configuration(
                "s3 bucket name was not set",
            ));
        }
        Ok(())
    }

    /// Timeout applied to each network operation
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Whether both static keys are empty and ambient credentials should be used
    pub fn uses_ambient_credentials(&self) -> bool {
        self.access_key.is_empty() && self.secret_key.is_empty()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            endpoint_ca: None,
            skip_ssl_verify: false,
            access_key: String::new(),
            secret_key: String::new(),
            bucket: String::new(),
            region: DEFAULT_REGION.to_string(),
            folder: String::new(),
            insecure: false,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            snapshot_name: DEFAULT_SNAPSHOT_NAME.to_string(),
            retention: DEFAULT_RETENTION,
            restore_path: None,
        }
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secret = if self.secret_key.is_empty() { "" } else { "<redacted>" };
        f.debug_struct("StoreConfig")
            .field("endpoint", &self.endpoint)
            .field("endpoint_ca", &self.endpoint_ca.as_ref().map(|_| "<set>"))
            .field("skip_ssl_verify", &self.skip_ssl_verify)
            .field("access_key", &self.access_key)
            .field("secret_key", &secret)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("folder", &self.folder)
            .field("insecure", &self.insecure)
            .field("timeout_secs", &self.timeout_secs)
            .field("snapshot_name", &self.snapshot_name)
            .field("retention", &self.retention)
            .field("restore_path", &self.restore_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.endpoint, "s3.amazonaws.com");
        assert_eq!(config.region, "us-east-1");
        assert_eq!(config.timeout(), Duration::from_secs(300));
        assert_eq!(config.retention, 5);
        assert!(config.bucket.is_empty());
        assert!(config.uses_ambient_credentials());
    }

    #[test]
    fn test_from_uri_with_folder() {
        let config = StoreConfig::from_uri("s3://test-bucket/path/to/folder/").unwrap();
        assert_eq!(config.bucket, "test-bucket");
        assert_eq!(config.folder, "path/to/folder");
    }

    #[test]
    fn test_from_uri_bucket_only() {
        let config = StoreConfig::from_uri("s3://test-bucket").unwrap();
        assert_eq!(config.bucket, "test-bucket");
        assert_eq!(config.folder, "");
    }

    #[test]
    fn test_from_uri_invalid() {
        let result = StoreConfig::from_uri("s3://");
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("missing bucket name"));

        assert!(StoreConfig::from_uri("/local/path").is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = StoreConfig::with_bucket("snapshots");
        assert!(config.validate().is_ok());

        config.bucket = String::new();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, crate::CofferError::Configuration(_)));
    }

    #[test]
    fn test_partial_credentials_are_static() {
        let mut config = StoreConfig::with_bucket("b");
        config.access_key = "AKIA".to_string();
        assert!(!config.uses_ambient_credentials());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let mut config = StoreConfig::with_bucket("b");
        config.secret_key = "super-secret".to_string();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: StoreConfig =
            serde_json::from_str(r#"{"bucket": "b", "folder": "etcd", "retention": 2}"#).unwrap();
        assert_eq!(config.bucket, "b");
        assert_eq!(config.folder, "etcd");
        assert_eq!(config.retention, 2);
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
    }
}
