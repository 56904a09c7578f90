//! Error types for the offload pipeline

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::sink::SinkError;

/// Why a candidate was judged not ready for transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotReadyReason {
    /// Zero-byte file: the producer has allocated but not yet written it.
    Empty,
    /// Size changed across the settle interval.
    Growing { before: u64, after: u64 },
    /// Size drifted between the prober's check and the uploader's re-check.
    Drifted { expected: u64, actual: u64 },
}

impl std::fmt::Display for NotReadyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotReadyReason::Empty => write!(f, "empty file"),
            NotReadyReason::Growing { before, after } => {
                write!(f, "still being written ({before} -> {after} bytes)")
            }
            NotReadyReason::Drifted { expected, actual } => {
                write!(f, "size drifted before upload ({expected} -> {actual} bytes)")
            }
        }
    }
}

impl NotReadyReason {
    /// Short label used as the `reason` field of skip log events.
    pub fn label(&self) -> &'static str {
        match self {
            NotReadyReason::Empty => "empty-file",
            NotReadyReason::Growing { .. } | NotReadyReason::Drifted { .. } => "not-ready",
        }
    }
}

/// Offload error type.
///
/// Variants follow the operational taxonomy: structural problems are skipped,
/// readiness problems are silently retried, transfer failures are retried on the next
/// discovery, and the rest are fatal when they happen during startup.
#[derive(Error, Debug)]
pub enum OffloadError {
    #[error("Invalid artifact path {}: {reason}", path.display())]
    Structural { path: PathBuf, reason: String },

    #[error("Not ready {}: {reason}", path.display())]
    NotReady { path: PathBuf, reason: NotReadyReason },

    #[error("Transfer of {key} failed: {source}")]
    Transfer {
        key: String,
        #[source]
        source: SinkError,
    },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl OffloadError {
    pub fn structural(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        OffloadError::Structural {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn not_ready(path: impl Into<PathBuf>, reason: NotReadyReason) -> Self {
        OffloadError::NotReady {
            path: path.into(),
            reason,
        }
    }

    pub fn is_structural(&self) -> bool {
        matches!(self, OffloadError::Structural { .. })
    }

    /// Transient readiness: not a failure, the next event or scan tick retries.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, OffloadError::NotReady { .. })
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, OffloadError>;
