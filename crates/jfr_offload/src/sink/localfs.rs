//! Local directory sink, for development runs and tests.
//!
//! Objects land at `<root>/<key>`. Each write goes to a hidden temp file next to the
//! destination, is fsynced, then renamed over the destination, so readers never see a
//! partial object.

use super::{validate_key, RemoteSink, SinkError, SinkResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, Clone)]
pub struct LocalFsSink {
    root: PathBuf,
}

impl LocalFsSink {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    async fn write_via_temp(&self, tmp: &Path, dest: &Path, body: File, len: u64) -> SinkResult<u64> {
        let mut out = File::create(tmp).await?;
        let mut reader = body.take(len);
        let copied = tokio::io::copy(&mut reader, &mut out).await?;
        if copied != len {
            return Err(SinkError::ShortRead {
                expected: len,
                actual: copied,
            });
        }
        out.flush().await?;
        out.sync_all().await?;
        drop(out);
        fs::rename(tmp, dest).await?;
        Ok(copied)
    }
}

#[async_trait]
impl RemoteSink for LocalFsSink {
    async fn put_object(
        &self,
        key: &str,
        body: File,
        len: u64,
        _content_type: &str,
    ) -> SinkResult<u64> {
        validate_key(key)?;
        let dest = self.path_for(key);
        let dir = dest.parent().ok_or_else(|| SinkError::InvalidKey {
            key: key.to_string(),
        })?;
        fs::create_dir_all(dir).await?;

        let file_name = dest
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = dir.join(format!(".{}.{}.partial", file_name, uuid::Uuid::new_v4()));

        let result = self.write_via_temp(&tmp, &dest, body, len).await;
        if result.is_err() {
            let _ = fs::remove_file(&tmp).await;
        }
        result
    }

    fn describe(&self, key: &str) -> String {
        format!("file://{}", self.path_for(key).display())
    }
}
