/*!
Error types for the Coffer snapshot repository.
*/

use std::time::Duration;

use coffer_retry::RetryableError;
use thiserror::Error;

use crate::record::SnapshotRecord;

/// Result type used throughout the Coffer core.
pub type Result<T> = std::result::Result<T, CofferError>;

/// Errors that can occur while talking to the snapshot repository.
#[derive(Error, Debug)]
pub enum CofferError {
    /// Invalid or incomplete configuration (e.g. missing bucket name)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The configured endpoint CA could not be decoded or parsed
    #[error("endpoint-ca is not a valid x509 certificate: {0}")]
    InvalidCertificate(String),

    /// Network or authentication failure while reaching the object store
    #[error("Object store unavailable: {0}")]
    BackendUnavailable(String),

    /// The object store answered but the bucket does not exist
    #[error("bucket: {0} does not exist")]
    BucketNotFound(String),

    /// Upload or download of a single object failed
    #[error("Transfer of {key} failed: {source}")]
    Transfer {
        key: String,
        #[source]
        source: Box<CofferError>,
    },

    /// Enumerating objects failed; no partial results are returned
    #[error("Listing objects under '{prefix}' failed: {source}")]
    Listing {
        prefix: String,
        #[source]
        source: Box<CofferError>,
    },

    /// Removing an object failed; earlier removals stand
    #[error("Removing {key} failed: {source}")]
    Deletion {
        key: String,
        #[source]
        source: Box<CofferError>,
    },

    /// A bounded operation exceeded the configured timeout
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The store's cancellation token fired while an operation was running
    #[error("{0} was cancelled")]
    Cancelled(&'static str),

    /// Raw error reported by an object store adapter
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O errors during local file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CofferError {
    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new invalid certificate error
    pub fn invalid_certificate<S: Into<String>>(msg: S) -> Self {
        Self::InvalidCertificate(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    pub(crate) fn transfer(key: impl Into<String>, source: CofferError) -> Self {
        Self::Transfer {
            key: key.into(),
            source: Box::new(source),
        }
    }

    pub(crate) fn listing(prefix: impl Into<String>, source: CofferError) -> Self {
        Self::Listing {
            prefix: prefix.into(),
            source: Box::new(source),
        }
    }

    pub(crate) fn deletion(key: impl Into<String>, source: CofferError) -> Self {
        Self::Deletion {
            key: key.into(),
            source: Box::new(source),
        }
    }
}

impl RetryableError for CofferError {
    fn is_transient(&self) -> bool {
        match self {
            CofferError::BackendUnavailable(_) | CofferError::Timeout { .. } => true,
            CofferError::Storage(msg) => {
                msg.contains("timed out")
                    || msg.contains("dispatch")
                    || msg.contains("InternalError")
                    || msg.contains("SlowDown")
                    || msg.contains("503")
                    || msg.contains("502")
                    || msg.contains("500")
            }
            CofferError::Transfer { source, .. }
            | CofferError::Listing { source, .. }
            | CofferError::Deletion { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

/// A failed upload.
///
/// The record is still populated (status failed, encoded message) so it can
/// be reported alongside the error.
#[derive(Error, Debug)]
#[error("{source}")]
pub struct UploadFailure {
    pub record: Box<SnapshotRecord>,
    #[source]
    pub source: CofferError,
}

impl From<UploadFailure> for CofferError {
    fn from(failure: UploadFailure) -> Self {
        failure.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_display() {
        let error = CofferError::configuration("s3 bucket name was not set");
        assert_eq!(
            error.to_string(),
            "Configuration error: s3 bucket name was not set"
        );

        let error = CofferError::BucketNotFound("backups".to_string());
        assert_eq!(error.to_string(), "bucket: backups does not exist");

        let error = CofferError::storage("test storage error");
        assert_eq!(error.to_string(), "Storage error: test storage error");
    }

    #[test]
    fn test_wrapped_errors_keep_their_source() {
        use std::error::Error as _;

        let error = CofferError::listing(
            "snapshots/",
            CofferError::storage("S3 list_objects_v2 request timed out"),
        );
        assert!(error.to_string().contains("snapshots/"));
        assert!(error
            .source()
            .unwrap()
            .to_string()
            .contains("timed out"));
    }

    #[test]
    fn test_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        assert!(matches!(CofferError::from(io_error), CofferError::Io(_)));
    }

    #[test]
    fn test_is_transient() {
        assert!(CofferError::BackendUnavailable("connection refused".into()).is_transient());
        assert!(CofferError::Timeout {
            operation: "list",
            timeout: Duration::from_secs(1)
        }
        .is_transient());
        assert!(CofferError::storage("S3 get_object request failed to dispatch").is_transient());
        assert!(CofferError::deletion("k", CofferError::storage("503 Slow Down")).is_transient());

        assert!(!CofferError::storage("Access denied to S3").is_transient());
        assert!(!CofferError::BucketNotFound("b".into()).is_transient());
        assert!(!CofferError::configuration("missing bucket").is_transient());
        assert!(CofferError::invalid_certificate("bad pem").is_permanent());
        assert!(!CofferError::Cancelled("upload").is_transient());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<CofferError>();
        assert_sync::<CofferError>();
    }
}
