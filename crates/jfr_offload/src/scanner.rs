//! Reconciliation scanner: periodic full-tree walk independent of notifications.
//!
//! Finds every artifact under the root on each pass, however it was (or was not)
//! discovered before. Entries that vanish or cannot be read mid-walk are skipped; a
//! single bad entry never aborts the pass.

use crate::artifact::has_artifact_extension;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Scan error details
#[derive(Debug, Clone)]
pub struct ScanError {
    pub path: Option<PathBuf>,
    pub message: String,
}

/// Result of one pass
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Artifact files found, in walk order
    pub artifacts: Vec<PathBuf>,
    pub dirs_scanned: u64,
    pub duration_ms: u64,
    pub errors: Vec<ScanError>,
}

#[derive(Debug, Clone)]
pub struct ReconciliationScanner {
    root: PathBuf,
    extension: String,
}

impl ReconciliationScanner {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
        }
    }

    /// Walk the whole tree once. Blocking; run it off the async executor.
    pub fn scan(&self) -> ScanReport {
        let start = Instant::now();
        let mut report = ScanReport::default();

        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf);
                    if e.io_error().map(|io| io.kind()) == Some(std::io::ErrorKind::NotFound) {
                        debug!(path = ?path, "Entry vanished during scan");
                    } else {
                        warn!(path = ?path, error = %e, "Error accessing path during scan");
                    }
                    report.errors.push(ScanError {
                        path,
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            let file_type = entry.file_type();
            if file_type.is_dir() {
                report.dirs_scanned += 1;
                continue;
            }
            if file_type.is_file() && has_artifact_extension(entry.path(), &self.extension) {
                report.artifacts.push(entry.into_path());
            }
        }

        report.duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        report
    }
}
