//! Watch manager with a bounded watch count.
//!
//! Keeps one notify watcher over individually watched file paths, capped
//! at the configured maximum. Records past the cap fall back to mtime
//! polling. Change events are forwarded to the coordinator over a tokio
//! channel; rename and remove events close the watch so the cap stays
//! exact and the slot becomes reusable.

use crate::error::{CacheError, CacheResult};
use crate::record::RecordKey;
use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Observed modification time of a record's file.
///
/// `Missing` stands in for the −1 sentinel: the file is gone or
/// unreadable (not-found or permission-denied).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mtime {
    /// File absent or unreadable
    Missing,
    /// Modification time in milliseconds since the epoch
    At(u64),
}

/// Probe a file's modification time.
///
/// Not-found and permission-denied collapse to [`Mtime::Missing`]; any
/// other error propagates.
pub async fn probe_mtime(path: &Path) -> CacheResult<Mtime> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => {
            let modified = meta.modified().map_err(CacheError::from)?;
            let millis = modified
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64;
            Ok(Mtime::At(millis))
        }
        Err(err)
            if matches!(
                err.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ) =>
        {
            Ok(Mtime::Missing)
        }
        Err(err) => Err(err.into()),
    }
}

/// Kind of change observed on a watched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// Contents changed
    Change,
    /// File renamed or deleted
    Removed,
}

/// Change notification delivered to the coordinator.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    /// Store key of the affected record
    pub key: RecordKey,
    /// What happened to the file
    pub kind: WatchEventKind,
}

struct WatchEntry {
    key: RecordKey,
    path: PathBuf,
}

struct WatchState {
    watcher: Option<RecommendedWatcher>,
    watching: Vec<WatchEntry>,
}

struct WatchShared {
    max_watch_count: usize,
    event_tx: mpsc::UnboundedSender<WatchEvent>,
    state: parking_lot::Mutex<WatchState>,
}

/// Bounded filesystem watch manager.
#[derive(Clone)]
pub struct WatchManager {
    inner: Arc<WatchShared>,
}

impl WatchManager {
    /// Create a manager and the receiver its events are delivered on.
    pub fn new(max_watch_count: usize) -> (Self, mpsc::UnboundedReceiver<WatchEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(WatchShared {
                max_watch_count,
                event_tx,
                state: parking_lot::Mutex::new(WatchState {
                    watcher: None,
                    watching: Vec::new(),
                }),
            }),
        };
        (manager, event_rx)
    }

    /// Open a watch for `key`, unless the cap is reached.
    ///
    /// Returns whether a watch is now active; `false` means the record
    /// must fall back to mtime polling.
    pub fn watch(&self, key: &RecordKey, path: &Path) -> bool {
        let mut state = self.inner.state.lock();
        if state.watching.len() >= self.inner.max_watch_count {
            debug!(record = %key, "watch cap reached, falling back to mtime polling");
            return false;
        }

        if state.watcher.is_none() {
            match self.create_watcher() {
                Ok(watcher) => state.watcher = Some(watcher),
                Err(err) => {
                    warn!(error = %err, "failed to create file watcher");
                    return false;
                }
            }
        }

        let Some(watcher) = state.watcher.as_mut() else {
            return false;
        };
        if let Err(err) = watcher.watch(path, RecursiveMode::NonRecursive) {
            warn!(record = %key, error = %err, "failed to watch file");
            return false;
        }
        state.watching.push(WatchEntry {
            key: key.clone(),
            path: path.to_path_buf(),
        });
        true
    }

    /// Close and unlist the watch for `key`, freeing its slot.
    pub fn unwatch(&self, key: &RecordKey) {
        let mut state = self.inner.state.lock();
        let Some(index) = state.watching.iter().position(|entry| &entry.key == key) else {
            return;
        };
        let entry = state.watching.remove(index);
        // The same path may still be watched under another variant.
        let still_watched = state.watching.iter().any(|other| other.path == entry.path);
        if !still_watched {
            if let Some(watcher) = state.watcher.as_mut() {
                if let Err(err) = watcher.unwatch(&entry.path) {
                    debug!(record = %key, error = %err, "unwatch failed");
                }
            }
        }
        debug!(record = %key, "watch closed");
    }

    /// Number of live watches.
    pub fn watch_count(&self) -> usize {
        self.inner.state.lock().watching.len()
    }

    /// Close every watch and drop the underlying watcher.
    pub fn close_all(&self) {
        let mut state = self.inner.state.lock();
        state.watching.clear();
        state.watcher = None;
    }

    fn create_watcher(&self) -> notify::Result<RecommendedWatcher> {
        let shared = Arc::downgrade(&self.inner);
        notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
            let Ok(event) = res else { return };
            let Some(kind) = classify(&event.kind) else { return };
            dispatch(&shared, &event.paths, kind);
        })
    }
}

fn classify(kind: &EventKind) -> Option<WatchEventKind> {
    match kind {
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => {
            Some(WatchEventKind::Removed)
        }
        EventKind::Create(_) | EventKind::Modify(_) => Some(WatchEventKind::Change),
        _ => None,
    }
}

fn dispatch(shared: &Weak<WatchShared>, paths: &[PathBuf], kind: WatchEventKind) {
    let Some(shared) = shared.upgrade() else { return };
    let state = shared.state.lock();
    for path in paths {
        for entry in state.watching.iter().filter(|entry| &entry.path == path) {
            let _ = shared.event_tx.send(WatchEvent {
                key: entry.key.clone(),
                kind,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Variant;
    use std::time::Duration;
    use tempfile::TempDir;

    fn key(path: &Path) -> RecordKey {
        RecordKey::new(path.to_string_lossy(), Variant::Module)
    }

    #[tokio::test]
    async fn test_watch_cap_enforced() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.js");
        let b = dir.path().join("b.js");
        std::fs::write(&a, "a").unwrap();
        std::fs::write(&b, "b").unwrap();

        let (manager, _rx) = WatchManager::new(1);
        assert!(manager.watch(&key(&a), &a));
        assert!(!manager.watch(&key(&b), &b));
        assert_eq!(manager.watch_count(), 1);
    }

    #[tokio::test]
    async fn test_unwatch_frees_slot() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.js");
        let b = dir.path().join("b.js");
        std::fs::write(&a, "a").unwrap();
        std::fs::write(&b, "b").unwrap();

        let (manager, _rx) = WatchManager::new(1);
        let key_a = key(&a);
        assert!(manager.watch(&key_a, &a));
        manager.unwatch(&key_a);
        assert!(manager.watch(&key(&b), &b));
        assert_eq!(manager.watch_count(), 1);
    }

    #[tokio::test]
    async fn test_probe_mtime_missing_file() {
        let dir = TempDir::new().unwrap();
        let gone = dir.path().join("gone.js");
        assert_eq!(probe_mtime(&gone).await.unwrap(), Mtime::Missing);
    }

    #[tokio::test]
    async fn test_probe_mtime_real_file() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.js");
        std::fs::write(&a, "a").unwrap();
        assert!(matches!(probe_mtime(&a).await.unwrap(), Mtime::At(_)));
    }

    #[tokio::test]
    async fn test_change_event_delivered() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.js");
        std::fs::write(&a, "before").unwrap();

        let (manager, mut rx) = WatchManager::new(8);
        let key_a = key(&a);
        assert!(manager.watch(&key_a, &a));

        std::fs::write(&a, "after").unwrap();

        // Event delivery is asynchronous; poll with a deadline.
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no watch event within deadline")
            .expect("watch channel closed");
        assert_eq!(event.key, key_a);
    }
}
