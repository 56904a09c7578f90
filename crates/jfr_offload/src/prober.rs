//! Stability probe: has the producer finished writing this file?
//!
//! Reads the size, waits the settle interval, reads it again. Equal non-zero sizes mean
//! stable. This is a heuristic; a writer that pauses for exactly the settle interval
//! can still be reported stable.

use crate::artifact::ArtifactStat;
use crate::error::{NotReadyReason, Result};
use std::io;
use std::path::Path;
use std::time::Duration;

/// Probe verdict for one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready(ArtifactStat),
    NotReady(NotReadyReason),
    /// The file disappeared before or during the probe.
    Vanished,
}

#[derive(Debug, Clone)]
pub struct StabilityProber {
    settle_interval: Duration,
}

impl StabilityProber {
    pub fn new(settle_interval: Duration) -> Self {
        Self { settle_interval }
    }

    /// Probe `path`. Errors other than not-found are returned to the caller.
    pub async fn probe(&self, path: &Path) -> Result<Readiness> {
        let Some(first) = stat(path).await? else {
            return Ok(Readiness::Vanished);
        };
        if first.size == 0 {
            return Ok(Readiness::NotReady(NotReadyReason::Empty));
        }

        tokio::time::sleep(self.settle_interval).await;

        let Some(second) = stat(path).await? else {
            return Ok(Readiness::Vanished);
        };
        if second.size != first.size {
            return Ok(Readiness::NotReady(NotReadyReason::Growing {
                before: first.size,
                after: second.size,
            }));
        }

        Ok(Readiness::Ready(second))
    }
}

async fn stat(path: &Path) -> Result<Option<ArtifactStat>> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => Ok(Some(ArtifactStat::from_metadata(&metadata))),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
