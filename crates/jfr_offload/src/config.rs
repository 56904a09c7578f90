//! Configuration for the offload daemon
//!
//! Layering: built-in defaults, then an optional TOML file, then environment variables and
//! command-line flags (see [`OffloadArgs`]).

use crate::error::{OffloadError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_ROOT: &str = "/tmp/jfr";
pub const DEFAULT_EXTENSION: &str = "jfr";
pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";
pub const DEFAULT_REGION: &str = "auto";
pub const CONTENT_TYPE: &str = "application/octet-stream";
/// Upper bound on `max_concurrent_uploads`; each slot may hold an open file and a connection.
pub const MAX_CONCURRENT_UPLOADS_LIMIT: usize = 1024;

/// Main configuration for the offload pipeline
#[derive(Debug, Clone, Deserialize)]
pub struct OffloadConfig {
    /// Target bucket. Required; a missing bucket is a fatal startup error.
    #[serde(default)]
    pub bucket: Option<String>,

    /// Root of the watched tree (`<root>/<source_id>/<file>`)
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Artifact extension, without the dot
    #[serde(default = "default_extension")]
    pub extension: String,

    /// Wait between the two size reads of the stability probe
    #[serde(default = "default_settle_interval_ms")]
    pub settle_interval_ms: u64,

    /// Wait between the two size reads the uploader does on the open handle
    #[serde(default = "default_recheck_delay_ms")]
    pub recheck_delay_ms: u64,

    /// Period of the full-tree reconciliation scan
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    /// Maximum transfers running at once
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,

    /// Subscribe to filesystem notifications. When false only the scanner discovers files.
    #[serde(default = "default_watch")]
    pub watch: bool,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// Remote store connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// S3-compatible endpoint URL
    #[serde(default = "default_endpoint")]
    pub endpoint: Option<String>,

    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default = "default_force_path_style")]
    pub force_path_style: bool,

    /// Write objects under this local directory instead of a remote store
    #[serde(default)]
    pub local_dir: Option<PathBuf>,
}

fn default_root() -> PathBuf {
    PathBuf::from(DEFAULT_ROOT)
}

fn default_extension() -> String {
    DEFAULT_EXTENSION.to_string()
}

fn default_settle_interval_ms() -> u64 {
    5_000
}

fn default_recheck_delay_ms() -> u64 {
    2_000
}

fn default_scan_interval_secs() -> u64 {
    30
}

fn default_max_concurrent_uploads() -> usize {
    4
}

fn default_watch() -> bool {
    true
}

fn default_endpoint() -> Option<String> {
    Some(DEFAULT_ENDPOINT.to_string())
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

fn default_force_path_style() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            region: default_region(),
            force_path_style: default_force_path_style(),
            local_dir: None,
        }
    }
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            root: default_root(),
            extension: default_extension(),
            settle_interval_ms: default_settle_interval_ms(),
            recheck_delay_ms: default_recheck_delay_ms(),
            scan_interval_secs: default_scan_interval_secs(),
            max_concurrent_uploads: default_max_concurrent_uploads(),
            watch: default_watch(),
            storage: StorageConfig::default(),
        }
    }
}

impl OffloadConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| OffloadError::Config(e.to_string()))
    }

    /// The configured bucket, or a config error when it is missing or blank.
    pub fn bucket(&self) -> Result<&str> {
        match self.bucket.as_deref().map(str::trim) {
            Some(bucket) if !bucket.is_empty() => Ok(bucket),
            _ => Err(OffloadError::Config(
                "target bucket is required (set GCS_BUCKET or --bucket)".to_string(),
            )),
        }
    }

    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }

    pub fn recheck_delay(&self) -> Duration {
        Duration::from_millis(self.recheck_delay_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    /// Check everything that can be checked without touching the filesystem.
    pub fn validate(&self) -> Result<()> {
        self.bucket()?;
        if self.extension.trim_start_matches('.').is_empty() {
            return Err(OffloadError::Config("artifact extension must not be empty".to_string()));
        }
        if self.settle_interval_ms == 0 {
            return Err(OffloadError::Config("settle interval must be non-zero".to_string()));
        }
        if self.scan_interval_secs == 0 {
            return Err(OffloadError::Config("scan interval must be non-zero".to_string()));
        }
        if self.max_concurrent_uploads == 0 {
            return Err(OffloadError::Config(
                "max_concurrent_uploads must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_uploads > MAX_CONCURRENT_UPLOADS_LIMIT {
            return Err(OffloadError::Config(format!(
                "max_concurrent_uploads must be at most {MAX_CONCURRENT_UPLOADS_LIMIT}"
            )));
        }
        Ok(())
    }
}

/// Command-line / environment overrides for [`OffloadConfig`].
#[derive(clap::Args, Debug, Clone, Default)]
pub struct OffloadArgs {
    /// TOML configuration file
    #[arg(long, env = "JFR_OFFLOAD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Target bucket
    #[arg(long, env = "GCS_BUCKET")]
    pub bucket: Option<String>,

    /// Root directory to watch (default: /tmp/jfr)
    #[arg(long, env = "JFR_ROOT")]
    pub root: Option<PathBuf>,

    /// Artifact file extension (default: jfr)
    #[arg(long)]
    pub extension: Option<String>,

    /// Settle interval for the stability probe, in milliseconds
    #[arg(long = "settle-ms", env = "SETTLE_INTERVAL_MS")]
    pub settle_interval_ms: Option<u64>,

    /// Delay of the uploader's size re-check, in milliseconds
    #[arg(long = "recheck-ms", env = "RECHECK_DELAY_MS")]
    pub recheck_delay_ms: Option<u64>,

    /// Period of the reconciliation scan, in seconds
    #[arg(long, env = "SCAN_INTERVAL_SECS")]
    pub scan_interval_secs: Option<u64>,

    /// Maximum concurrent uploads
    #[arg(long)]
    pub max_concurrent_uploads: Option<usize>,

    /// Disable filesystem notifications (scan-only mode)
    #[arg(long)]
    pub no_watch: bool,

    /// S3-compatible endpoint URL
    #[arg(long, env = "STORAGE_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Region passed to the object store client
    #[arg(long, env = "STORAGE_REGION")]
    pub region: Option<String>,

    /// Write objects to this local directory instead of a remote store
    #[arg(long)]
    pub local_sink_dir: Option<PathBuf>,
}

impl OffloadArgs {
    /// Build the effective configuration: file (if any) with flags and env applied on top.
    pub fn resolve(&self) -> Result<OffloadConfig> {
        let mut config = match &self.config {
            Some(path) => OffloadConfig::load(path)?,
            None => OffloadConfig::default(),
        };
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply(&self, config: &mut OffloadConfig) {
        if let Some(bucket) = &self.bucket {
            config.bucket = Some(bucket.clone());
        }
        if let Some(root) = &self.root {
            config.root = root.clone();
        }
        if let Some(extension) = &self.extension {
            config.extension = extension.trim_start_matches('.').to_string();
        }
        if let Some(ms) = self.settle_interval_ms {
            config.settle_interval_ms = ms;
        }
        if let Some(ms) = self.recheck_delay_ms {
            config.recheck_delay_ms = ms;
        }
        if let Some(secs) = self.scan_interval_secs {
            config.scan_interval_secs = secs;
        }
        if let Some(max) = self.max_concurrent_uploads {
            config.max_concurrent_uploads = max;
        }
        if self.no_watch {
            config.watch = false;
        }
        if let Some(endpoint) = &self.endpoint {
            config.storage.endpoint = Some(endpoint.clone());
        }
        if let Some(region) = &self.region {
            config.storage.region = region.clone();
        }
        if let Some(dir) = &self.local_sink_dir {
            config.storage.local_dir = Some(dir.clone());
        }
    }
}
