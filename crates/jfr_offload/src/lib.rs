//! JFR offload pipeline.
//!
//! Watches a directory tree of profiling recordings laid out as
//! `<root>/<source_id>/<name>.jfr`, waits until each file has stopped growing, streams it
//! to object storage as `<bucket>/<source_id>/<name>.jfr` and deletes the local copy once
//! the upload is committed. The filesystem is the only queue: anything not yet uploaded
//! is still on disk and is found again by the next reconciliation scan.

pub mod artifact;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod prober;
pub mod scanner;
pub mod sink;
pub mod uploader;
pub mod watcher;

pub use artifact::{Candidate, DiscoveredBy};
pub use config::{OffloadArgs, OffloadConfig, StorageConfig};
pub use error::{NotReadyReason, OffloadError, Result};
pub use pipeline::{
    process_candidate, AttemptContext, AttemptOutcome, Pipeline, PipelineStats, StatsSnapshot,
};
pub use prober::{Readiness, StabilityProber};
pub use scanner::{ReconciliationScanner, ScanReport};
pub use sink::{LocalFsSink, RemoteSink, S3Sink, SinkError};
pub use uploader::{UploadReceipt, Uploader};
pub use watcher::{DirectoryWatcher, WatchEvent, WatchKind};
