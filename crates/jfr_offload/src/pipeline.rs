//! Pipeline coordinator.
//!
//! One control loop merges watcher notifications and scan ticks into candidate work
//! items. Each candidate runs on its own task: probe, upload, then delete. The local
//! file is only removed after the sink reported a committed object; every other outcome
//! leaves it on disk, where the next scan finds it again. There is no persisted queue.
//!
//! Features:
//! - Per-path in-flight guard (a path is never attempted twice at once)
//! - Semaphore bounded transfers; the settle wait does not hold a slot
//! - Graceful shutdown via shutdown channel

use crate::artifact::{has_artifact_extension, Candidate, DiscoveredBy};
use crate::config::OffloadConfig;
use crate::error::{NotReadyReason, OffloadError, Result};
use crate::prober::{Readiness, StabilityProber};
use crate::scanner::ReconciliationScanner;
use crate::sink::RemoteSink;
use crate::uploader::Uploader;
use crate::watcher::{DirectoryWatcher, WatchEvent, WatchKind};
use notify::Event;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How long shutdown waits for running attempts before aborting them.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Running totals, shared with the spawned attempts.
#[derive(Debug, Default)]
pub struct PipelineStats {
    discovered: AtomicU64,
    delivered: AtomicU64,
    bytes_delivered: AtomicU64,
    deleted: AtomicU64,
    not_ready: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub discovered: u64,
    pub delivered: u64,
    pub bytes_delivered: u64,
    pub deleted: u64,
    pub not_ready: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            discovered: self.discovered.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            bytes_delivered: self.bytes_delivered.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            not_ready: self.not_ready.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &AttemptOutcome) {
        match outcome {
            AttemptOutcome::Delivered { bytes, deleted, .. } => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                self.bytes_delivered.fetch_add(*bytes, Ordering::Relaxed);
                if *deleted {
                    self.deleted.fetch_add(1, Ordering::Relaxed);
                }
            }
            AttemptOutcome::NotReady(_) => {
                self.not_ready.fetch_add(1, Ordering::Relaxed);
            }
            AttemptOutcome::Failed(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            AttemptOutcome::Vanished => {}
        }
    }
}

/// Result of one transfer attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// Uploaded. `deleted` is false when the local file was already gone.
    Delivered { key: String, bytes: u64, deleted: bool },
    /// Dropped for now; a later event or scan retries.
    NotReady(NotReadyReason),
    /// The file disappeared before it could be read.
    Vanished,
    /// Probe, transfer or delete failed; the local file is left in place.
    Failed(OffloadError),
}

impl AttemptOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, AttemptOutcome::Delivered { .. })
    }
}

/// Everything one attempt needs. Cheap to clone into a task.
#[derive(Clone)]
pub struct AttemptContext {
    pub prober: StabilityProber,
    pub uploader: Uploader,
    pub stats: Arc<PipelineStats>,
    /// Bounds concurrent transfers. Taken after the file is stable.
    upload_slots: Arc<Semaphore>,
}

impl AttemptContext {
    pub fn new(config: &OffloadConfig, sink: Arc<dyn RemoteSink>) -> Self {
        Self {
            prober: StabilityProber::new(config.settle_interval()),
            uploader: Uploader::new(sink, config.recheck_delay()),
            stats: Arc::new(PipelineStats::default()),
            upload_slots: Arc::new(Semaphore::new(config.max_concurrent_uploads)),
        }
    }
}

/// Drive one candidate through probe, upload and delete.
pub async fn process_candidate(ctx: &AttemptContext, candidate: &Candidate) -> AttemptOutcome {
    let outcome = attempt(ctx, candidate).await;
    ctx.stats.record(&outcome);
    outcome
}

async fn attempt(ctx: &AttemptContext, candidate: &Candidate) -> AttemptOutcome {
    let path = &candidate.path;

    let stat = match ctx.prober.probe(path).await {
        Ok(Readiness::Ready(stat)) => stat,
        Ok(Readiness::NotReady(reason)) => return not_ready(path, reason),
        Ok(Readiness::Vanished) => return vanished(path),
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to probe file");
            return AttemptOutcome::Failed(e);
        }
    };

    debug!(
        path = %path.display(),
        size = stat.size,
        modified = ?stat.modified.map(|m| m.to_rfc3339()),
        "File is stable"
    );

    let Ok(_slot) = ctx.upload_slots.acquire().await else {
        return AttemptOutcome::Failed(OffloadError::Io(io::Error::other("upload slots closed")));
    };

    let receipt = match ctx
        .uploader
        .upload_checked(path, &candidate.source_id, Some(stat.size))
        .await
    {
        Ok(receipt) => receipt,
        Err(OffloadError::NotReady { reason, .. }) => return not_ready(path, reason),
        Err(OffloadError::Io(e)) if e.kind() == io::ErrorKind::NotFound => return vanished(path),
        Err(e) => {
            error!(
                path = %path.display(),
                key = %candidate.object_key(),
                error = %e,
                "Upload failed, file left for retry"
            );
            return AttemptOutcome::Failed(e);
        }
    };

    match remove_local(path).await {
        Ok(deleted) => {
            info!(
                path = %path.display(),
                location = %receipt.location,
                bytes = receipt.bytes,
                "Offloaded file"
            );
            AttemptOutcome::Delivered {
                key: receipt.key,
                bytes: receipt.bytes,
                deleted,
            }
        }
        Err(e) => {
            // Uploaded but still on disk: the next scan uploads it again.
            error!(path = %path.display(), error = %e, "Failed to delete uploaded file");
            AttemptOutcome::Failed(e)
        }
    }
}

fn not_ready(path: &Path, reason: NotReadyReason) -> AttemptOutcome {
    debug!(
        path = %path.display(),
        reason = reason.label(),
        detail = %reason,
        "Skipping file"
    );
    AttemptOutcome::NotReady(reason)
}

fn vanished(path: &Path) -> AttemptOutcome {
    debug!(path = %path.display(), "File vanished before transfer");
    AttemptOutcome::Vanished
}

/// Delete an uploaded file. `Ok(false)` when it is already gone.
pub async fn remove_local(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            info!(path = %path.display(), "Deleted local file");
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "Local file already removed");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Attempts currently running, keyed by path.
#[derive(Debug, Default)]
pub struct InFlight {
    attempts: HashMap<PathBuf, JoinHandle<()>>,
}

impl InFlight {
    pub fn is_busy(&self, path: &Path) -> bool {
        self.attempts
            .get(path)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn insert(&mut self, path: PathBuf, handle: JoinHandle<()>) {
        self.attempts.insert(path, handle);
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    /// Drop handles of finished attempts.
    pub fn reap(&mut self) {
        self.attempts.retain(|path, handle| {
            if handle.is_finished() {
                debug!(path = %path.display(), "Reaped finished attempt");
                false
            } else {
                true
            }
        });
    }

    fn drain(&mut self) -> Vec<(PathBuf, JoinHandle<()>)> {
        self.attempts.drain().collect()
    }
}

pub struct Pipeline {
    root: PathBuf,
    extension: String,
    scan_interval: Duration,
    shutdown_grace: Duration,
    ctx: AttemptContext,
    scanner: ReconciliationScanner,
    watcher: Option<DirectoryWatcher>,
    in_flight: InFlight,
    shutdown_rx: mpsc::Receiver<()>,
}

impl Pipeline {
    /// Build the coordinator and subscribe the watch root.
    ///
    /// Returns (Pipeline, shutdown sender). A missing or unreadable root, or a root that
    /// cannot be watched, is fatal.
    pub fn new(
        config: &OffloadConfig,
        sink: Arc<dyn RemoteSink>,
    ) -> Result<(Self, mpsc::Sender<()>)> {
        config.validate()?;

        let root = config.root.canonicalize().map_err(|e| {
            OffloadError::Config(format!(
                "watch root {} is not accessible: {}",
                config.root.display(),
                e
            ))
        })?;
        if !root.is_dir() {
            return Err(OffloadError::Config(format!(
                "watch root {} is not a directory",
                root.display()
            )));
        }
        std::fs::read_dir(&root)?;

        let watcher = if config.watch {
            Some(DirectoryWatcher::start(&root)?)
        } else {
            info!("Directory watcher disabled, relying on periodic scan");
            None
        };

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let pipeline = Self {
            scanner: ReconciliationScanner::new(&root, &config.extension),
            root,
            extension: config.extension.clone(),
            scan_interval: config.scan_interval(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            ctx: AttemptContext::new(config, sink),
            watcher,
            in_flight: InFlight::default(),
            shutdown_rx,
        };
        Ok((pipeline, shutdown_tx))
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.ctx.stats)
    }

    /// Main loop - consumes self. The first scan runs immediately.
    pub async fn run(mut self) -> Result<()> {
        info!(
            root = %self.root.display(),
            scan_interval_secs = self.scan_interval.as_secs(),
            watching = self.watcher.is_some(),
            "Pipeline started"
        );

        let mut scan_tick = tokio::time::interval(self.scan_interval);
        scan_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.in_flight.reap();

            tokio::select! {
                biased;

                _ = self.shutdown_rx.recv() => {
                    info!(in_flight = self.in_flight.len(), "Shutdown signal received");
                    break;
                }

                _ = scan_tick.tick() => {
                    self.reconcile().await;
                }

                event = next_watch_event(&mut self.watcher) => {
                    self.handle_watch_event(event);
                }
            }
        }

        self.wait_for_in_flight(Some(self.shutdown_grace)).await;
        let stats = self.ctx.stats.snapshot();
        info!(
            discovered = stats.discovered,
            delivered = stats.delivered,
            bytes_delivered = stats.bytes_delivered,
            deleted = stats.deleted,
            not_ready = stats.not_ready,
            skipped = stats.skipped,
            failed = stats.failed,
            "Pipeline stopped"
        );
        Ok(())
    }

    /// One scan pass with every candidate processed to completion.
    pub async fn reconcile_once(&mut self) -> StatsSnapshot {
        self.reconcile().await;
        self.wait_for_in_flight(None).await;
        self.ctx.stats.snapshot()
    }

    async fn reconcile(&mut self) {
        let scanner = self.scanner.clone();
        let report = match tokio::task::spawn_blocking(move || scanner.scan()).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Reconciliation scan task failed");
                return;
            }
        };

        info!(
            artifacts = report.artifacts.len(),
            dirs_scanned = report.dirs_scanned,
            errors = report.errors.len(),
            duration_ms = report.duration_ms,
            "Reconciliation scan complete"
        );

        for path in report.artifacts {
            self.dispatch(path, DiscoveredBy::Scan);
        }
    }

    fn handle_watch_event(&mut self, event: Option<notify::Result<Event>>) {
        let event = match event {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                warn!(error = %e, "Watcher error");
                return;
            }
            None => {
                warn!("Watcher channel closed, relying on periodic scan");
                self.watcher = None;
                return;
            }
        };

        let changes = match self.watcher.as_mut() {
            Some(watcher) => watcher.translate(event),
            None => return,
        };
        for WatchEvent { path, kind } in changes {
            if !has_artifact_extension(&path, &self.extension) {
                continue;
            }
            match kind {
                WatchKind::Create | WatchKind::Write => self.dispatch(path, DiscoveredBy::Event),
                WatchKind::Remove => debug!(path = %path.display(), "Artifact removed"),
                WatchKind::Other => {}
            }
        }
    }

    fn dispatch(&mut self, path: PathBuf, discovered_by: DiscoveredBy) {
        let candidate = match Candidate::resolve(&self.root, &path, discovered_by) {
            Ok(candidate) => candidate,
            Err(e) => {
                self.ctx.stats.skipped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    path = %path.display(),
                    reason = "structural",
                    error = %e,
                    "Skipping file"
                );
                return;
            }
        };

        if self.in_flight.is_busy(&candidate.path) {
            debug!(path = %path.display(), "Attempt already in flight");
            return;
        }

        self.ctx.stats.discovered.fetch_add(1, Ordering::Relaxed);
        info!(
            path = %path.display(),
            source_id = %candidate.source_id,
            discovered_by = %discovered_by,
            "Discovered file"
        );

        let ctx = self.ctx.clone();
        let handle = tokio::spawn(async move {
            process_candidate(&ctx, &candidate).await;
        });
        self.in_flight.insert(path, handle);
    }

    /// Wait for running attempts. With a grace period, whatever is still running at the
    /// deadline is aborted; the files stay on disk for the next run.
    async fn wait_for_in_flight(&mut self, grace: Option<Duration>) {
        let attempts = self.in_flight.drain();
        if attempts.is_empty() {
            return;
        }
        info!(count = attempts.len(), "Waiting for in-flight attempts");

        let deadline = grace.map(|grace| Instant::now() + grace);
        for (path, mut handle) in attempts {
            let joined = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, &mut handle).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(path = %path.display(), "Aborting in-flight attempt");
                        handle.abort();
                        continue;
                    }
                },
                None => handle.await,
            };
            if let Err(e) = joined {
                warn!(path = %path.display(), error = %e, "Attempt task failed");
            }
        }
    }
}

async fn next_watch_event(
    watcher: &mut Option<DirectoryWatcher>,
) -> Option<notify::Result<Event>> {
    match watcher {
        Some(watcher) => watcher.recv().await,
        None => std::future::pending().await,
    }
}
