//! End-to-end tests for the offload pipeline
//!
//! Every test runs against a temp directory tree and a local-directory sink (or an
//! in-test sink that fails on purpose), so no object store is needed.

use async_trait::async_trait;
use jfr_offload::artifact::{Candidate, DiscoveredBy};
use jfr_offload::pipeline::remove_local;
use jfr_offload::sink::{LocalFsSink, RemoteSink, SinkError, SinkResult};
use jfr_offload::{
    process_candidate, AttemptContext, AttemptOutcome, NotReadyReason, OffloadConfig, Pipeline,
    Uploader,
};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::fs::File;
use tokio::sync::Semaphore;

/// Create a test environment with temp directories
struct TestEnv {
    /// Temp directory (cleaned up on drop)
    _temp: TempDir,
    /// Watched root
    pub root: PathBuf,
    /// Where the local sink stores objects
    pub remote: PathBuf,
}

impl TestEnv {
    fn new() -> Self {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let base = temp.path().canonicalize().expect("Failed to resolve temp dir");
        let root = base.join("jfr");
        let remote = base.join("remote");
        fs::create_dir_all(&root).expect("Failed to create root");

        Self {
            _temp: temp,
            root,
            remote,
        }
    }

    fn config(&self, watch: bool, scan_interval_secs: u64) -> OffloadConfig {
        OffloadConfig {
            bucket: Some("profiles".to_string()),
            root: self.root.clone(),
            settle_interval_ms: 100,
            recheck_delay_ms: 20,
            scan_interval_secs,
            watch,
            ..OffloadConfig::default()
        }
    }

    fn sink(&self) -> Arc<dyn RemoteSink> {
        Arc::new(LocalFsSink::new(&self.remote))
    }

    fn write_file(&self, rel: &str, content: &[u8]) -> PathBuf {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).ok();
        }
        fs::write(&path, content).expect("Failed to write file");
        path
    }

    fn remote_object(&self, key: &str) -> PathBuf {
        self.remote.join(key)
    }
}

/// Sink that rejects every write and counts the attempts.
#[derive(Default)]
struct FailingSink {
    calls: AtomicUsize,
}

#[async_trait]
impl RemoteSink for FailingSink {
    async fn put_object(
        &self,
        _key: &str,
        _body: File,
        _len: u64,
        _content_type: &str,
    ) -> SinkResult<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(SinkError::Remote {
            message: "503 Service Unavailable".to_string(),
        })
    }

    fn describe(&self, key: &str) -> String {
        format!("failing://{key}")
    }
}

/// Sink that holds every write until the test releases it, then accepts it.
struct BlockingSink {
    calls: AtomicUsize,
    gate: Semaphore,
}

impl BlockingSink {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            gate: Semaphore::new(0),
        }
    }

    fn release(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl RemoteSink for BlockingSink {
    async fn put_object(
        &self,
        _key: &str,
        _body: File,
        len: u64,
        _content_type: &str,
    ) -> SinkResult<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _permit = self.gate.acquire().await.map_err(|e| SinkError::Remote {
            message: e.to_string(),
        })?;
        Ok(len)
    }

    fn describe(&self, key: &str) -> String {
        format!("blocking://{key}")
    }
}

async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}

fn is_delivered(local: &Path, remote: &Path, len: u64) -> bool {
    !local.exists() && fs::metadata(remote).map(|m| m.len() == len).unwrap_or(false)
}

// ============================================================================
// Single pass
// ============================================================================

#[tokio::test]
async fn test_single_file_is_uploaded_and_deleted() {
    let env = TestEnv::new();
    let local = env.write_file("pod-7/run1.jfr", &[0xAB; 1000]);

    let (mut pipeline, _shutdown) = Pipeline::new(&env.config(false, 30), env.sink()).unwrap();
    let stats = pipeline.reconcile_once().await;

    assert!(!local.exists(), "local file should be deleted after upload");
    let uploaded = fs::read(env.remote_object("pod-7/run1.jfr")).unwrap();
    assert_eq!(uploaded, vec![0xAB; 1000]);
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.bytes_delivered, 1000);
}

#[tokio::test]
async fn test_failed_upload_keeps_local_file() {
    let env = TestEnv::new();
    let local = env.write_file("pod-7/run1.jfr", b"recording that cannot be uploaded");
    let sink = Arc::new(FailingSink::default());

    let (mut pipeline, _shutdown) = Pipeline::new(&env.config(false, 30), sink.clone()).unwrap();
    let first = pipeline.reconcile_once().await;
    assert!(local.exists(), "file must survive a failed upload");
    assert_eq!(first.failed, 1);
    assert_eq!(first.deleted, 0);

    // Every pass is a fresh retry
    let second = pipeline.reconcile_once().await;
    assert!(local.exists());
    assert_eq!(second.failed, 2);
    assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_empty_file_is_never_uploaded_or_deleted() {
    let env = TestEnv::new();
    let local = env.write_file("pod-7/allocated.jfr", b"");

    let (mut pipeline, _shutdown) = Pipeline::new(&env.config(false, 30), env.sink()).unwrap();
    let stats = pipeline.reconcile_once().await;

    assert!(local.exists());
    assert!(!env.remote_object("pod-7/allocated.jfr").exists());
    assert_eq!(stats.not_ready, 1);
    assert_eq!(stats.delivered, 0);
}

#[tokio::test]
async fn test_file_directly_under_root_is_skipped() {
    let env = TestEnv::new();
    let loose = env.write_file("loose.jfr", b"no source directory");

    let (mut pipeline, _shutdown) = Pipeline::new(&env.config(false, 30), env.sink()).unwrap();
    let stats = pipeline.reconcile_once().await;

    assert!(loose.exists());
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.discovered, 0);
    assert!(!env.remote.exists() || fs::read_dir(&env.remote).unwrap().next().is_none());
}

#[tokio::test]
async fn test_non_artifact_files_are_ignored() {
    let env = TestEnv::new();
    let notes = env.write_file("pod-7/notes.txt", b"not a recording");

    let (mut pipeline, _shutdown) = Pipeline::new(&env.config(false, 30), env.sink()).unwrap();
    let stats = pipeline.reconcile_once().await;

    assert!(notes.exists());
    assert_eq!(stats.discovered, 0);
}

#[tokio::test]
async fn test_settle_wait_does_not_hold_upload_slot() {
    let env = TestEnv::new();
    for i in 0..4 {
        env.write_file(&format!("pod-{i}/run.jfr"), &[i as u8 + 1; 256]);
    }
    let config = OffloadConfig {
        settle_interval_ms: 400,
        recheck_delay_ms: 5,
        max_concurrent_uploads: 1,
        ..env.config(false, 30)
    };

    let (mut pipeline, _shutdown) = Pipeline::new(&config, env.sink()).unwrap();
    let started = std::time::Instant::now();
    let stats = pipeline.reconcile_once().await;
    let elapsed = started.elapsed();

    assert_eq!(stats.delivered, 4);
    // All four settle together; only the short transfers are serialized.
    assert!(
        elapsed < Duration::from_millis(1200),
        "settle waits were serialized: {elapsed:?}"
    );
}

#[tokio::test]
async fn test_missing_bucket_is_fatal() {
    let env = TestEnv::new();
    let config = OffloadConfig {
        bucket: None,
        ..env.config(false, 30)
    };
    assert!(Pipeline::new(&config, env.sink()).is_err());
}

// ============================================================================
// Readiness gating and idempotence
// ============================================================================

#[tokio::test]
async fn test_growing_file_waits_until_growth_stops() {
    let env = TestEnv::new();
    let local = env.write_file("pod-7/live.jfr", b"first chunk;");
    let config = OffloadConfig {
        settle_interval_ms: 300,
        ..env.config(false, 30)
    };
    let ctx = AttemptContext::new(&config, env.sink());
    let candidate = Candidate::resolve(&env.root, &local, DiscoveredBy::Event).unwrap();

    let writer_path = local.clone();
    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut file = fs::OpenOptions::new().append(true).open(&writer_path).unwrap();
        file.write_all(b"second chunk").unwrap();
    });

    let first = process_candidate(&ctx, &candidate).await;
    writer.await.unwrap();
    assert!(
        matches!(first, AttemptOutcome::NotReady(NotReadyReason::Growing { .. })),
        "unexpected outcome: {first:?}"
    );
    assert!(local.exists());
    assert!(!env.remote_object("pod-7/live.jfr").exists());

    let second = process_candidate(&ctx, &candidate).await;
    assert!(second.is_delivered(), "unexpected outcome: {second:?}");
    assert_eq!(
        fs::read(env.remote_object("pod-7/live.jfr")).unwrap(),
        b"first chunk;second chunk"
    );
    assert!(!local.exists());
}

#[tokio::test]
async fn test_duplicate_upload_and_delete_are_harmless() {
    let env = TestEnv::new();
    let local = env.write_file("pod-7/run1.jfr", b"same bytes twice");
    let uploader = Uploader::new(env.sink(), Duration::from_millis(5));

    let first = uploader.upload(&local, "pod-7").await.unwrap();
    let second = uploader.upload(&local, "pod-7").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(
        fs::read(env.remote_object("pod-7/run1.jfr")).unwrap(),
        b"same bytes twice"
    );

    assert!(remove_local(&local).await.unwrap());
    assert!(!remove_local(&local).await.unwrap());
}

// ============================================================================
// Long-running loop
// ============================================================================

#[tokio::test]
async fn test_scanner_alone_converges() {
    let env = TestEnv::new();
    let (pipeline, shutdown) = Pipeline::new(&env.config(false, 1), env.sink()).unwrap();
    let stats = pipeline.stats();
    let handle = tokio::spawn(pipeline.run());

    // Let the immediate first scan pass over an empty tree
    tokio::time::sleep(Duration::from_millis(200)).await;
    let local = env.write_file("pod-3/late.jfr", &[7u8; 4096]);
    let remote = env.remote_object("pod-3/late.jfr");

    // One scan interval plus settle and recheck, with slack
    let converged = wait_until(Duration::from_secs(5), || is_delivered(&local, &remote, 4096)).await;
    assert!(converged, "scanner did not pick up the file");

    shutdown.send(()).await.unwrap();
    handle.await.unwrap().unwrap();
    assert_eq!(stats.snapshot().delivered, 1);
}

#[tokio::test]
async fn test_scan_does_not_restart_running_attempt() {
    let env = TestEnv::new();
    let local = env.write_file("pod-7/run1.jfr", &[4u8; 300]);
    let sink = Arc::new(BlockingSink::new());
    let (pipeline, shutdown) = Pipeline::new(&env.config(false, 1), sink.clone()).unwrap();
    let stats = pipeline.stats();
    let handle = tokio::spawn(pipeline.run());

    let started = wait_until(Duration::from_secs(5), || sink.calls.load(Ordering::SeqCst) == 1).await;
    assert!(started, "first scan never reached the sink");

    // At least two more scan ticks pass while the transfer is held open
    tokio::time::sleep(Duration::from_millis(2200)).await;
    assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    assert_eq!(stats.snapshot().discovered, 1);

    sink.release();
    let deleted = wait_until(Duration::from_secs(5), || !local.exists()).await;
    assert!(deleted, "released transfer did not finish");

    shutdown.send(()).await.unwrap();
    handle.await.unwrap().unwrap();
    assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    assert_eq!(stats.snapshot().delivered, 1);
}

#[tokio::test]
async fn test_watcher_picks_up_new_source_directory() {
    let env = TestEnv::new();
    // Scan interval far beyond the test so only notifications can find the file
    let (pipeline, shutdown) = Pipeline::new(&env.config(true, 3600), env.sink()).unwrap();
    let handle = tokio::spawn(pipeline.run());
    tokio::time::sleep(Duration::from_millis(200)).await;

    let staging = env.write_file("pod-new/run.jfr.tmp", &[1u8; 2048]);
    let local = env.root.join("pod-new/run.jfr");
    fs::rename(&staging, &local).unwrap();
    let remote = env.remote_object("pod-new/run.jfr");

    let delivered = wait_until(Duration::from_secs(5), || is_delivered(&local, &remote, 2048)).await;
    assert!(delivered, "watcher did not deliver the file");

    shutdown.send(()).await.unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_waits_for_running_attempt() {
    let env = TestEnv::new();
    let local = env.write_file("pod-7/run1.jfr", &[5u8; 512]);
    let config = OffloadConfig {
        settle_interval_ms: 300,
        ..env.config(false, 3600)
    };
    let (pipeline, shutdown) = Pipeline::new(&config, env.sink()).unwrap();
    let stats = pipeline.stats();
    let handle = tokio::spawn(pipeline.run());

    // The first scan dispatches immediately; stop while the probe is still settling
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.send(()).await.unwrap();
    handle.await.unwrap().unwrap();

    assert!(!local.exists());
    assert!(env.remote_object("pod-7/run1.jfr").exists());
    assert_eq!(stats.snapshot().deleted, 1);
}
