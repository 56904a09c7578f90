//! Directory watcher over a tree that grows at runtime.
//!
//! Every directory is subscribed individually (non-recursive) and tracked in an explicit
//! subscription set. New directories are picked up from create notifications; when one
//! is subscribed its current files are emitted as synthetic creates, because they may
//! have been written before the subscription existed. Anything still missed is the
//! reconciliation scanner's job.
//!
//! Only the coordinator loop calls [`DirectoryWatcher::translate`], so the subscription
//! set has a single writer and needs no lock.

use crate::error::Result;
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Operation kind of a normalized notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Create,
    Write,
    Remove,
    Other,
}

/// One normalized filesystem change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: WatchKind,
}

impl WatchEvent {
    pub fn new(path: impl Into<PathBuf>, kind: WatchKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

pub struct DirectoryWatcher {
    inner: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    subscribed: HashSet<PathBuf>,
}

impl DirectoryWatcher {
    /// Subscribe to `root` and every directory below it.
    ///
    /// Failing to watch the root is an error; failing to watch a subdirectory is logged
    /// and left to periodic scanning.
    pub fn start(root: &Path) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let inner = notify::recommended_watcher(move |event: notify::Result<Event>| {
            if tx.send(event).is_err() {
                debug!("watch event dropped because the coordinator is gone");
            }
        })?;

        let mut watcher = Self {
            inner,
            events: rx,
            subscribed: HashSet::new(),
        };

        watcher.inner.watch(root, RecursiveMode::NonRecursive)?;
        watcher.subscribed.insert(root.to_path_buf());
        info!(path = %root.display(), "Watching directory");

        let existing: Vec<PathBuf> = WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) if entry.file_type().is_dir() => Some(entry.into_path()),
                Ok(_) => None,
                Err(e) => {
                    warn!(error = %e, "Error walking watch root");
                    None
                }
            })
            .collect();
        for dir in existing {
            watcher.subscribe(&dir, false);
        }

        Ok(watcher)
    }

    pub fn is_subscribed(&self, dir: &Path) -> bool {
        self.subscribed.contains(dir)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribed.len()
    }

    /// Next raw notification. `None` once the notification backend has shut down.
    pub async fn recv(&mut self) -> Option<notify::Result<Event>> {
        self.events.recv().await
    }

    /// Normalize a raw notification, subscribing any directory it reports as created.
    ///
    /// Directory creations are not returned themselves; the files found inside a newly
    /// subscribed directory are returned as [`WatchKind::Create`] events instead.
    pub fn translate(&mut self, event: Event) -> Vec<WatchEvent> {
        let mut out = Vec::new();
        for change in classify(event) {
            if change.kind == WatchKind::Create && change.path.is_dir() {
                self.subscribe_tree(&change.path, &mut out);
                continue;
            }
            out.push(change);
        }
        out
    }

    fn subscribe_tree(&mut self, dir: &Path, out: &mut Vec<WatchEvent>) {
        for entry in WalkDir::new(dir) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(error = %e, "Entry vanished while subscribing new directory");
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                // Re-watch even if already known: a directory deleted and recreated under the
                // same name has lost its kernel watch.
                self.subscribe(entry.path(), true);
            } else if entry.file_type().is_file() {
                out.push(WatchEvent::new(entry.into_path(), WatchKind::Create));
            }
        }
    }

    fn subscribe(&mut self, dir: &Path, force: bool) -> bool {
        if !force && self.subscribed.contains(dir) {
            return false;
        }
        match self.inner.watch(dir, RecursiveMode::NonRecursive) {
            Ok(()) => {
                if self.subscribed.insert(dir.to_path_buf()) {
                    info!(path = %dir.display(), "Watching directory");
                }
                true
            }
            Err(e) => {
                warn!(
                    path = %dir.display(),
                    error = %e,
                    "Failed to watch directory, relying on periodic scan"
                );
                false
            }
        }
    }
}

/// Map a raw notify event onto normalized changes, one per affected path.
pub fn classify(event: Event) -> Vec<WatchEvent> {
    let Event { kind, paths, .. } = event;

    if let EventKind::Modify(ModifyKind::Name(mode)) = kind {
        return classify_rename(paths, mode);
    }

    let kind = match kind {
        EventKind::Create(_) => WatchKind::Create,
        EventKind::Modify(ModifyKind::Metadata(_)) => WatchKind::Other,
        EventKind::Modify(_) => WatchKind::Write,
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => WatchKind::Write,
        EventKind::Remove(_) => WatchKind::Remove,
        _ => WatchKind::Other,
    };

    paths
        .into_iter()
        .map(|path| WatchEvent::new(path, kind))
        .collect()
}

fn classify_rename(paths: Vec<PathBuf>, mode: RenameMode) -> Vec<WatchEvent> {
    match mode {
        RenameMode::Both => {
            let mut events = Vec::with_capacity(2);
            if let Some(from) = paths.first() {
                events.push(WatchEvent::new(from.clone(), WatchKind::Remove));
            }
            if let Some(to) = paths.get(1) {
                events.push(WatchEvent::new(to.clone(), WatchKind::Create));
            }
            events
        }
        RenameMode::From => paths
            .into_iter()
            .map(|path| WatchEvent::new(path, WatchKind::Remove))
            .collect(),
        RenameMode::To => paths
            .into_iter()
            .map(|path| WatchEvent::new(path, WatchKind::Create))
            .collect(),
        RenameMode::Any | RenameMode::Other => paths
            .into_iter()
            .map(|path| {
                let kind = if path.exists() {
                    WatchKind::Create
                } else {
                    WatchKind::Remove
                };
                WatchEvent::new(path, kind)
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_classify_basic_kinds() {
        let create = Event::new(EventKind::Create(CreateKind::File)).add_path("/r/p/a.jfr".into());
        assert_eq!(classify(create), vec![WatchEvent::new("/r/p/a.jfr", WatchKind::Create)]);

        let write = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path("/r/p/a.jfr".into());
        assert_eq!(classify(write)[0].kind, WatchKind::Write);

        let close = Event::new(EventKind::Access(AccessKind::Close(AccessMode::Write)))
            .add_path("/r/p/a.jfr".into());
        assert_eq!(classify(close)[0].kind, WatchKind::Write);

        let chmod = Event::new(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)))
            .add_path("/r/p/a.jfr".into());
        assert_eq!(classify(chmod)[0].kind, WatchKind::Other);

        let remove = Event::new(EventKind::Remove(RemoveKind::File)).add_path("/r/p/a.jfr".into());
        assert_eq!(classify(remove)[0].kind, WatchKind::Remove);
    }

    #[test]
    fn test_classify_rename_both_splits_into_remove_and_create() {
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path("/r/p/a.jfr.tmp".into())
            .add_path("/r/p/a.jfr".into());
        let mapped = classify(event);
        assert_eq!(
            mapped,
            vec![
                WatchEvent::new("/r/p/a.jfr.tmp", WatchKind::Remove),
                WatchEvent::new("/r/p/a.jfr", WatchKind::Create),
            ]
        );
    }

    #[test]
    fn test_classify_rename_to_is_create() {
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To)))
            .add_path("/r/p/a.jfr".into());
        assert_eq!(classify(event)[0].kind, WatchKind::Create);
    }

    #[tokio::test]
    async fn test_start_subscribes_existing_tree() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join("pod-1/nested")).unwrap();
        std::fs::create_dir_all(root.join("pod-2")).unwrap();

        let watcher = DirectoryWatcher::start(&root).unwrap();
        assert_eq!(watcher.subscription_count(), 4);
        assert!(watcher.is_subscribed(&root.join("pod-1/nested")));
    }

    #[tokio::test]
    async fn test_start_fails_for_missing_root() {
        let temp = TempDir::new().unwrap();
        assert!(DirectoryWatcher::start(&temp.path().join("absent")).is_err());
    }

    #[tokio::test]
    async fn test_new_directory_is_subscribed_and_its_files_reported() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let mut watcher = DirectoryWatcher::start(&root).unwrap();

        let pod_dir = root.join("pod-9");
        std::fs::create_dir(&pod_dir).unwrap();
        let early = pod_dir.join("early.jfr");
        std::fs::write(&early, b"written before subscription").unwrap();

        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !seen.iter().any(|e: &WatchEvent| e.path == early) {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let raw = tokio::time::timeout(remaining, watcher.recv())
                .await
                .expect("timed out waiting for watch events")
                .expect("watch channel closed");
            if let Ok(event) = raw {
                seen.extend(watcher.translate(event));
            }
        }

        assert!(watcher.is_subscribed(&pod_dir));
    }
}
