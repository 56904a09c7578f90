//! Remote sink: the one capability the pipeline needs from object storage.
//!
//! "Create or overwrite the object at `key` from this local byte stream." Implementations
//! must only return `Ok` once the whole object is committed; on `Err` the caller treats
//! the object as not written.

pub mod localfs;
pub mod s3;

use crate::config::OffloadConfig;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::File;

pub use localfs::LocalFsSink;
pub use s3::S3Sink;

/// Errors returned by sink writes.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("invalid object key '{key}'")]
    InvalidKey { key: String },

    #[error("failed to prepare upload body: {message}")]
    Body { message: String },

    #[error("remote store rejected write: {message}")]
    Remote { message: String },

    #[error("short read: expected {expected} bytes, streamed {actual}")]
    ShortRead { expected: u64, actual: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SinkResult<T> = std::result::Result<T, SinkError>;

#[async_trait]
pub trait RemoteSink: Send + Sync {
    /// Stream exactly `len` bytes from `body` into the object at `key`, overwriting any
    /// previous object. Returns the number of bytes committed.
    async fn put_object(
        &self,
        key: &str,
        body: File,
        len: u64,
        content_type: &str,
    ) -> SinkResult<u64>;

    /// Human readable location of `key`, for logs.
    fn describe(&self, key: &str) -> String;
}

/// Build the sink selected by the configuration.
///
/// A `storage.local_dir` selects [`LocalFsSink`] rooted at `<local_dir>/<bucket>`;
/// otherwise an [`S3Sink`] is built against the configured endpoint.
pub async fn connect(config: &OffloadConfig) -> crate::Result<Arc<dyn RemoteSink>> {
    let bucket = config.bucket()?;
    match &config.storage.local_dir {
        Some(dir) => Ok(Arc::new(LocalFsSink::new(dir.join(bucket)))),
        None => {
            let sink = S3Sink::connect(bucket, &config.storage).await;
            // Denials here are logged but not fatal: uploads may still be permitted.
            let _ = sink.check_bucket().await;
            Ok(Arc::new(sink))
        }
    }
}

/// Reject keys that could escape the bucket namespace on a filesystem-backed sink.
pub(crate) fn validate_key(key: &str) -> SinkResult<()> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(SinkError::InvalidKey {
            key: key.to_string(),
        });
    }
    Ok(())
}
