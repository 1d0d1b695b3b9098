/*!
S3-compatible object store adapter.

This module provides the `ObjectStore` implementation over the official AWS
SDK. The transport (custom CA, TLS bypass), credentials and addressing style
are resolved once by [`crate::transport`] when the client is built.
*/

use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::{ByteStream, Length};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use async_trait::async_trait;
use chrono::DateTime;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::path::Path;
use tracing::{debug, error, info, warn};

use super::{ObjectBody, ObjectInfo, ObjectStore};
use crate::config::StoreConfig;
use crate::transport;
use crate::{CofferError, Result};

/// Files above this size are uploaded in parts
pub const MULTIPART_THRESHOLD: u64 = 16 * 1024 * 1024;

/// Size of each multipart upload part
pub const PART_SIZE: u64 = 16 * 1024 * 1024;

/// Number of parts uploaded concurrently
pub const UPLOAD_CONCURRENCY: usize = 2;

/// S3 object store bound to a single bucket
///
/// The underlying client is cheap to clone and safe for concurrent use; the
/// adapter itself holds no locks.
///
/// # Example
/// ```rust,no_run
/// use coffer_core::{storage::S3ObjectStore, StoreConfig};
///
/// # async fn run() -> coffer_core::Result<()> {
/// let mut config = StoreConfig::with_bucket("snapshots");
/// config.endpoint = "minio.internal:9000".to_string();
/// config.access_key = "minio".to_string();
/// config.secret_key = "minio123".to_string();
///
/// let store = S3ObjectStore::connect(&config).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Build a client for the bucket in `config`
    ///
    /// No network call is made here; bucket validation is the caller's job.
    ///
    /// # Errors
    /// Returns `InvalidCertificate` if the custom endpoint CA is malformed
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let client = transport::build_client(config).await?;

        info!(
            bucket = %config.bucket,
            endpoint = %config.endpoint,
            "Initialized S3 client"
        );

        Ok(S3ObjectStore {
            client,
            bucket: config.bucket.clone(),
        })
    }

    /// Wrap an already configured client
    pub fn with_client(client: S3Client, bucket: impl Into<String>) -> Self {
        S3ObjectStore {
            client,
            bucket: bucket.into(),
        }
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_single(&self, key: &str, path: &Path, content_type: &str) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| CofferError::storage(format!("Failed to open {}: {e}", path.display())))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| map_s3_error("put_object", e, key))?;
        Ok(())
    }

    async fn put_multipart(&self, key: &str, path: &Path, content_type: &str, size: u64) -> Result<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| map_s3_error("create_multipart_upload", e, key))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| CofferError::storage("S3 create_multipart_upload returned no upload id"))?
            .to_string();

        let part_count = size.div_ceil(PART_SIZE);
        debug!(
            bucket = %self.bucket,
            key = %key,
            parts = part_count,
            "Starting multipart upload"
        );

        let upload = S3MultipartUpload {
            client: &self.client,
            bucket: &self.bucket,
            key,
            path,
            upload_id,
            size,
        };
        drive_multipart(&upload, part_count).await
    }
}

/// One side of a multipart upload that already has an upload id
#[async_trait]
trait MultipartTarget: Send + Sync {
    async fn upload_part(&self, index: u64) -> Result<CompletedPart>;

    async fn complete(&self, parts: Vec<CompletedPart>) -> Result<()>;

    /// Fire-and-forget abort; must not block since it runs from `Drop`
    fn abort(&self);
}

/// Aborts the upload when dropped, unless disarmed after completion
struct AbortOnDrop<'a, T: MultipartTarget + ?Sized> {
    target: &'a T,
    armed: bool,
}

impl<T: MultipartTarget + ?Sized> Drop for AbortOnDrop<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.target.abort();
        }
    }
}

/// Upload every part, then complete
///
/// Any error aborts the upload, and so does dropping the future half way
/// through a deadline or cancellation.
async fn drive_multipart<T: MultipartTarget + ?Sized>(target: &T, part_count: u64) -> Result<()> {
    let mut guard = AbortOnDrop {
        target,
        armed: true,
    };

    let parts = stream::iter(0..part_count)
        .map(|index| target.upload_part(index))
        .buffered(UPLOAD_CONCURRENCY)
        .try_collect::<Vec<_>>()
        .await?;
    target.complete(parts).await?;

    guard.armed = false;
    Ok(())
}

struct S3MultipartUpload<'a> {
    client: &'a S3Client,
    bucket: &'a str,
    key: &'a str,
    path: &'a Path,
    upload_id: String,
    size: u64,
}

#[async_trait]
impl MultipartTarget for S3MultipartUpload<'_> {
    async fn upload_part(&self, index: u64) -> Result<CompletedPart> {
        let offset = index * PART_SIZE;
        let length = PART_SIZE.min(self.size - offset);
        let part_number = i32::try_from(index + 1)
            .map_err(|_| CofferError::storage(format!("Too many parts for {}", self.key)))?;

        let body = ByteStream::read_from()
            .path(self.path)
            .offset(offset)
            .length(Length::Exact(length))
            .build()
            .await
            .map_err(|e| {
                CofferError::storage(format!("Failed to read {}: {e}", self.path.display()))
            })?;

        let output = self
            .client
            .upload_part()
            .bucket(self.bucket)
            .key(self.key)
            .upload_id(&self.upload_id)
            .part_number(part_number)
            .body(body)
            .send()
            .await
            .map_err(|e| map_s3_error("upload_part", e, self.key))?;

        Ok(CompletedPart::builder()
            .set_e_tag(output.e_tag().map(str::to_string))
            .part_number(part_number)
            .build())
    }

    async fn complete(&self, parts: Vec<CompletedPart>) -> Result<()> {
        self.client
            .complete_multipart_upload()
            .bucket(self.bucket)
            .key(self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| map_s3_error("complete_multipart_upload", e, self.key))?;
        Ok(())
    }

    fn abort(&self) {
        let bucket = self.bucket.to_string();
        let key = self.key.to_string();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(bucket = %bucket, key = %key, "No runtime left to abort multipart upload");
            return;
        };

        let request = self
            .client
            .abort_multipart_upload()
            .bucket(&bucket)
            .key(&key)
            .upload_id(&self.upload_id);
        runtime.spawn(async move {
            match request.send().await {
                Ok(_) => debug!(bucket = %bucket, key = %key, "Aborted multipart upload"),
                Err(err) => warn!(
                    bucket = %bucket,
                    key = %key,
                    error = %err,
                    "Failed to abort multipart upload"
                ),
            }
        });
    }
}

/// Body length of a fetched object; an unknown length cannot be verified
fn object_size(content_length: Option<i64>, key: &str) -> Result<u64> {
    let length = content_length.ok_or_else(|| {
        CofferError::storage(format!("S3 get_object returned no content length for '{key}'"))
    })?;
    u64::try_from(length).map_err(|_| {
        CofferError::storage(format!("S3 get_object returned invalid content length {length} for '{key}'"))
    })
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn bucket_exists(&self) -> Result<bool> {
        debug!(bucket = %self.bucket, "Starting S3 head_bucket operation");

        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(true),
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|service_err| service_err.is_not_found())
                {
                    return Ok(false);
                }
                Err(map_s3_error("head_bucket", err, &self.bucket))
            }
        }
    }

    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> Result<u64> {
        let size = tokio::fs::metadata(path).await?.len();
        debug!(
            bucket = %self.bucket,
            key = %key,
            size = size,
            content_type = %content_type,
            "Starting S3 upload"
        );

        let result = if size > MULTIPART_THRESHOLD {
            self.put_multipart(key, path, content_type, size).await
        } else {
            self.put_single(key, path, content_type).await
        };

        match result {
            Ok(()) => {
                debug!(bucket = %self.bucket, key = %key, size = size, "Successfully uploaded object");
                Ok(size)
            }
            Err(err) => {
                error!(bucket = %self.bucket, key = %key, error = %err, "Failed to upload object");
                Err(err)
            }
        }
    }

    async fn get_object(&self, key: &str) -> Result<Option<ObjectBody>> {
        debug!(bucket = %self.bucket, key = %key, "Starting S3 get_object operation");

        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|service_err| service_err.is_no_such_key())
                {
                    return Ok(None);
                }
                return Err(map_s3_error("get_object", err, key));
            }
        };

        let size = object_size(output.content_length(), key)?;
        Ok(Some(ObjectBody {
            size,
            reader: Box::new(Box::pin(output.body.into_async_read())),
        }))
    }

    fn list(&self, prefix: &str) -> BoxStream<'static, Result<ObjectInfo>> {
        let prefix = prefix.to_string();
        let pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&prefix)
            .into_paginator()
            .send();

        stream::unfold(pages, |mut pages| async move {
            let page = pages.next().await?;
            Some((page, pages))
        })
        .map(move |page| page.map_err(|e| map_s3_error("list_objects_v2", e, &prefix)))
        .map_ok(|output| {
            let objects = output
                .contents
                .unwrap_or_default()
                .into_iter()
                .filter_map(|object| {
                    let key = object.key?;
                    let last_modified = object
                        .last_modified
                        .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
                        .unwrap_or_default();
                    Some(Ok(ObjectInfo {
                        key,
                        size: object.size.unwrap_or_default().max(0) as u64,
                        last_modified,
                    }))
                })
                .collect::<Vec<_>>();
            stream::iter(objects)
        })
        .try_flatten()
        .boxed()
    }

    async fn delete(&self, key: &str) -> Result<()> {
        debug!(bucket = %self.bucket, key = %key, "Starting S3 delete_object operation");

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_s3_error("delete_object", e, key))?;
        Ok(())
    }
}

/// Map AWS SDK errors to CofferError with appropriate context
pub(crate) fn map_s3_error<E>(op: &str, error: SdkError<E>, key: &str) -> CofferError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
{
    match &error {
        SdkError::DispatchFailure(dispatch_err) => {
            CofferError::storage(format!("S3 {op} request failed to dispatch: {dispatch_err:?}"))
        }
        SdkError::TimeoutError(_) => {
            CofferError::storage(format!("S3 {op} request timed out (key: {key})"))
        }
        SdkError::ResponseError(response_err) => {
            CofferError::storage(format!("S3 {op} response error: {response_err:?}"))
        }
        SdkError::ServiceError(service_err) => match service_err.err().code() {
            Some("NoSuchBucket") => CofferError::storage("S3 bucket not found"),
            Some("NoSuchKey") => CofferError::storage(format!("S3 object '{key}' not found")),
            Some("AccessDenied") | Some("Forbidden") => CofferError::storage(
                "Access denied to S3 (check credentials and permissions)",
            ),
            Some("InvalidBucketName") => CofferError::storage("Invalid S3 bucket name"),
            Some(code) => CofferError::storage(format!(
                "S3 service error ({}): {}",
                code,
                service_err.err().message().unwrap_or("Unknown error")
            )),
            None => CofferError::storage(format!(
                "S3 {op} service error (HTTP {})",
                service_err.raw().status().as_u16()
            )),
        },
        _ => CofferError::storage(format!("S3 {op} error: {}", error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::operation::delete_object::DeleteObjectError;
    use aws_sdk_s3::operation::get_object::GetObjectError;
    use coffer_retry::RetryableError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_timeout_error_mapping() {
        let err: SdkError<GetObjectError> = SdkError::timeout_error("deadline elapsed");
        let mapped = map_s3_error("get_object", err, "test-key");

        match mapped {
            CofferError::Storage(ref msg) => {
                assert!(msg.contains("timed out"));
                assert!(msg.contains("test-key"));
            }
            other => panic!("Expected storage error for timeout, got {other:?}"),
        }
        assert!(mapped.is_transient());
    }

    #[test]
    fn test_construction_failure_mapping() {
        let err: SdkError<DeleteObjectError> = SdkError::construction_failure("missing key");
        let mapped = map_s3_error("delete_object", err, "k");

        assert!(matches!(mapped, CofferError::Storage(ref msg) if msg.contains("delete_object")));
        assert!(!mapped.is_transient());
    }

    /// Multipart target that records what the driver asked of it
    #[derive(Default)]
    struct RecordingUpload {
        stall_parts: bool,
        fail_part: Option<u64>,
        uploaded: AtomicUsize,
        completed: AtomicBool,
        aborts: AtomicUsize,
    }

    #[async_trait]
    impl MultipartTarget for RecordingUpload {
        async fn upload_part(&self, index: u64) -> Result<CompletedPart> {
            if self.stall_parts {
                futures::future::pending::<()>().await;
            }
            if self.fail_part == Some(index) {
                return Err(CofferError::storage("S3 upload_part failed: SlowDown"));
            }
            self.uploaded.fetch_add(1, Ordering::SeqCst);
            Ok(CompletedPart::builder()
                .part_number(index as i32 + 1)
                .build())
        }

        async fn complete(&self, parts: Vec<CompletedPart>) -> Result<()> {
            assert_eq!(parts.len(), self.uploaded.load(Ordering::SeqCst));
            self.completed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn abort(&self) {
            self.aborts.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_multipart_completes_without_abort() {
        let upload = RecordingUpload::default();

        drive_multipart(&upload, 3).await.unwrap();

        assert_eq!(upload.uploaded.load(Ordering::SeqCst), 3);
        assert!(upload.completed.load(Ordering::SeqCst));
        assert_eq!(upload.aborts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_multipart_part_failure_aborts() {
        let upload = RecordingUpload {
            fail_part: Some(1),
            ..Default::default()
        };

        let err = drive_multipart(&upload, 4).await.unwrap_err();

        assert!(matches!(err, CofferError::Storage(ref msg) if msg.contains("SlowDown")));
        assert!(!upload.completed.load(Ordering::SeqCst));
        assert_eq!(upload.aborts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multipart_aborted_when_deadline_passes() {
        let upload = RecordingUpload {
            stall_parts: true,
            ..Default::default()
        };

        let result =
            tokio::time::timeout(Duration::from_secs(5), drive_multipart(&upload, 3)).await;

        assert!(result.is_err());
        assert!(!upload.completed.load(Ordering::SeqCst));
        assert_eq!(upload.aborts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_multipart_aborted_on_cancellation() {
        let upload = RecordingUpload {
            stall_parts: true,
            ..Default::default()
        };
        let token = CancellationToken::new();
        token.cancel();

        tokio::select! {
            biased;
            _ = token.cancelled() => {}
            _ = drive_multipart(&upload, 2) => panic!("stalled upload should not finish"),
        }

        assert_eq!(upload.aborts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_object_size_requires_content_length() {
        assert_eq!(object_size(Some(42), "etcd/snapshot-1").unwrap(), 42);
        assert_eq!(object_size(Some(0), "etcd/snapshot-1").unwrap(), 0);

        let err = object_size(None, "etcd/snapshot-1").unwrap_err();
        assert!(matches!(err, CofferError::Storage(ref msg) if msg.contains("no content length")));
        assert!(object_size(Some(-1), "etcd/snapshot-1").is_err());
    }

    #[test]
    fn test_multipart_constants() {
        assert!(PART_SIZE >= 5 * 1024 * 1024, "S3 rejects parts below 5 MiB");
        assert!(MULTIPART_THRESHOLD >= PART_SIZE);
        assert_eq!(UPLOAD_CONCURRENCY, 2);
    }
}
