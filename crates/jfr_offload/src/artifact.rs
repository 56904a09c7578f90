//! Artifact path model and candidate work items.
//!
//! Layout consumed: `<root>/<source_id>/<name>.<ext>`. The first segment under the root
//! names the originating workload and becomes the remote object prefix.

use crate::error::{OffloadError, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};

/// How a candidate reached the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveredBy {
    Event,
    Scan,
}

impl fmt::Display for DiscoveredBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveredBy::Event => write!(f, "event"),
            DiscoveredBy::Scan => write!(f, "scan"),
        }
    }
}

/// One pending transfer attempt. Lives only for the duration of that attempt;
/// the file on disk is the durable record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub source_id: String,
    pub file_name: String,
    pub discovered_by: DiscoveredBy,
}

impl Candidate {
    /// Resolve a discovered path against the watch root.
    ///
    /// Fails with a structural error when the path is outside the root, has fewer than
    /// two segments below it, or carries names that are not valid UTF-8.
    pub fn resolve(root: &Path, path: &Path, discovered_by: DiscoveredBy) -> Result<Self> {
        let relative = path
            .strip_prefix(root)
            .map_err(|_| OffloadError::structural(path, "path is outside the watch root"))?;

        let segments: Vec<&str> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_str()),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| OffloadError::structural(path, "path is not valid UTF-8"))?;

        if segments.len() < 2 {
            return Err(OffloadError::structural(
                path,
                "expected <source_id>/<file> below the watch root",
            ));
        }

        let source_id = segments[0].to_string();
        let file_name = segments[segments.len() - 1].to_string();

        Ok(Self {
            path: path.to_path_buf(),
            source_id,
            file_name,
            discovered_by,
        })
    }

    /// Remote object key: `<source_id>/<file_name>`.
    pub fn object_key(&self) -> String {
        object_key(&self.source_id, &self.file_name)
    }
}

pub fn object_key(source_id: &str, file_name: &str) -> String {
    format!("{}/{}", source_id, file_name)
}

/// Whether `path` carries the artifact extension (compared case-sensitively, no dot).
pub fn has_artifact_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext == extension.trim_start_matches('.'))
        .unwrap_or(false)
}

/// Size and modification time observed for an artifact file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactStat {
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

impl ArtifactStat {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            size: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        }
    }
}
