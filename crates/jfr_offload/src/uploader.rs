//! Streams one local artifact into the remote sink under `<source_id>/<file_name>`.

use crate::artifact::object_key;
use crate::config::CONTENT_TYPE;
use crate::error::{NotReadyReason, OffloadError, Result};
use crate::sink::{RemoteSink, SinkError};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tracing::{debug, info};

/// Outcome of a committed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub key: String,
    pub location: String,
    pub bytes: u64,
}

/// Reusable uploader. Holds no per-call state, so concurrent calls for different files
/// only share the sink handle.
#[derive(Clone)]
pub struct Uploader {
    sink: Arc<dyn RemoteSink>,
    recheck_delay: Duration,
}

impl Uploader {
    pub fn new(sink: Arc<dyn RemoteSink>, recheck_delay: Duration) -> Self {
        Self {
            sink,
            recheck_delay,
        }
    }

    /// Upload `path` for `source_id` with only the uploader's own size re-check.
    pub async fn upload(&self, path: &Path, source_id: &str) -> Result<UploadReceipt> {
        self.upload_checked(path, source_id, None).await
    }

    /// Upload `path`, additionally requiring the size to still equal `expected_size`
    /// (the size the stability probe accepted).
    ///
    /// Size drift is reported as [`OffloadError::NotReady`]; sink failures as
    /// [`OffloadError::Transfer`]. The local file is never modified.
    pub async fn upload_checked(
        &self,
        path: &Path,
        source_id: &str,
        expected_size: Option<u64>,
    ) -> Result<UploadReceipt> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| OffloadError::structural(path, "file name is missing or not UTF-8"))?;
        let key = object_key(source_id, file_name);

        let file = File::open(path).await?;
        let opened_size = file.metadata().await?.len();
        if let Some(expected) = expected_size {
            if expected != opened_size {
                return Err(OffloadError::not_ready(
                    path,
                    NotReadyReason::Drifted {
                        expected,
                        actual: opened_size,
                    },
                ));
            }
        }

        tokio::time::sleep(self.recheck_delay).await;

        let size = file.metadata().await?.len();
        if size != opened_size {
            return Err(OffloadError::not_ready(
                path,
                NotReadyReason::Drifted {
                    expected: opened_size,
                    actual: size,
                },
            ));
        }
        if size == 0 {
            return Err(OffloadError::not_ready(path, NotReadyReason::Empty));
        }

        let location = self.sink.describe(&key);
        info!(
            local_path = %path.display(),
            location = %location,
            size_bytes = size,
            "Uploading file"
        );

        let bytes = self
            .sink
            .put_object(&key, file, size, CONTENT_TYPE)
            .await
            .map_err(|source| OffloadError::Transfer {
                key: key.clone(),
                source,
            })?;
        if bytes != size {
            return Err(OffloadError::Transfer {
                key,
                source: SinkError::ShortRead {
                    expected: size,
                    actual: bytes,
                },
            });
        }

        debug!(bytes_written = bytes, location = %location, "Successfully uploaded file");
        Ok(UploadReceipt {
            key,
            location,
            bytes,
        })
    }
}
