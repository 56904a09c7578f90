//! S3-compatible sink built on aws-sdk-s3.
//!
//! Defaults target the GCS XML API (HMAC credentials via the usual `AWS_ACCESS_KEY_ID` /
//! `AWS_SECRET_ACCESS_KEY` provider chain), but any S3-compatible endpoint works.
//! Objects are written with a single `PutObject`; the call returns only after the
//! service has acknowledged the whole object.

use super::{RemoteSink, SinkError, SinkResult};
use crate::config::StorageConfig;
use async_trait::async_trait;
use aws_config::{ConfigLoader, SdkConfig};
use aws_sdk_s3::config::{Region, RequestChecksumCalculation, ResponseChecksumValidation};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::{ByteStream, Length};
use aws_sdk_s3::Client;
use tokio::fs::File;
use tracing::{debug, warn};

/// Shared, clonable handle. The underlying client is safe for concurrent use.
#[derive(Debug, Clone)]
pub struct S3Sink {
    client: Client,
    bucket: String,
}

impl S3Sink {
    pub async fn connect(bucket: impl Into<String>, storage: &StorageConfig) -> Self {
        let shared = config_loader(storage).load().await;
        Self::from_sdk_config(bucket, &shared, storage)
    }

    /// Build the client from an already loaded SDK config.
    ///
    /// Checksums are only computed when an operation requires one. With the SDK default a
    /// streamed `PutObject` is sent `aws-chunked` with a trailing checksum, which the GCS
    /// XML API and several other S3-compatible stores reject.
    pub fn from_sdk_config(
        bucket: impl Into<String>,
        shared: &SdkConfig,
        storage: &StorageConfig,
    ) -> Self {
        let conf = aws_sdk_s3::config::Builder::from(shared)
            .force_path_style(storage.force_path_style)
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
            .response_checksum_validation(ResponseChecksumValidation::WhenRequired)
            .build();

        let bucket = bucket.into();
        debug!(bucket = %bucket, endpoint = ?storage.endpoint, "Object store client ready");
        Self {
            client: Client::from_conf(conf),
            bucket,
        }
    }

    /// Best-effort reachability check. Writers with object-create-only permissions can
    /// get a denial here and still upload, so callers should only warn on failure.
    pub async fn check_bucket(&self) -> SinkResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| {
                warn!(bucket = %self.bucket, error = %DisplayErrorContext(&e), "Bucket check failed");
                SinkError::Remote {
                    message: DisplayErrorContext(&e).to_string(),
                }
            })
    }
}

fn config_loader(storage: &StorageConfig) -> ConfigLoader {
    let loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new(storage.region.clone()));
    match &storage.endpoint {
        Some(endpoint) => loader.endpoint_url(endpoint),
        None => loader,
    }
}

#[async_trait]
impl RemoteSink for S3Sink {
    async fn put_object(
        &self,
        key: &str,
        body: File,
        len: u64,
        content_type: &str,
    ) -> SinkResult<u64> {
        let content_length = i64::try_from(len).map_err(|_| SinkError::Body {
            message: format!("object too large: {len} bytes"),
        })?;

        let stream = ByteStream::read_from()
            .file(body)
            .length(Length::Exact(len))
            .build()
            .await
            .map_err(|e| SinkError::Body {
                message: e.to_string(),
            })?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .content_length(content_length)
            .body(stream)
            .send()
            .await
            .map_err(|e| SinkError::Remote {
                message: DisplayErrorContext(&e).to_string(),
            })?;

        Ok(len)
    }

    fn describe(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }
}
