//! Per-file cache records.
//!
//! A record is the unit of caching: one per `(path, variant)` pair,
//! holding the current source, the analyzed dependency list, the
//! composite hash, the last transform output, and the two single-shot
//! phase slots that coalesce concurrent work.

use crate::error::{CacheError, CacheResult};
use crate::watcher::Mtime;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Which transform a record was requested under.
///
/// Different variants of the same file are distinct records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    /// Standard module transform
    Module,
    /// Legacy transform, selected by a `?dew` request suffix
    Legacy,
}

impl Variant {
    /// The lookup-key suffix for this variant.
    pub fn suffix(&self) -> &'static str {
        match self {
            Variant::Module => "",
            Variant::Legacy => "?dew",
        }
    }

    /// Split a request path into its filesystem path and variant.
    pub fn split(request: &str) -> (&str, Variant) {
        match request.strip_suffix("?dew") {
            Some(path) => (path, Variant::Legacy),
            None => (request, Variant::Module),
        }
    }
}

/// Store key for a record: normalized path plus variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    path: String,
    variant: Variant,
}

impl RecordKey {
    /// Build a key from an absolute path and variant.
    ///
    /// The path is normalized to forward slashes.
    pub fn new(path: impl AsRef<str>, variant: Variant) -> Self {
        Self {
            path: path.as_ref().replace('\\', "/"),
            variant,
        }
    }

    /// The normalized filesystem path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The record variant.
    pub fn variant(&self) -> Variant {
        self.variant
    }

    /// Whether this is a legacy-variant record.
    pub fn is_legacy(&self) -> bool {
        self.variant == Variant::Legacy
    }

    /// The composite store key, `path ++ variant suffix`.
    pub fn storage_key(&self) -> String {
        format!("{}{}", self.path, self.variant.suffix())
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.path, self.variant.suffix())
    }
}

/// Mutable state of a record, guarded by its async mutex.
#[derive(Debug)]
pub struct RecordState {
    /// Current file text
    pub original_source: Option<String>,
    /// Hash of `original_source` when dependencies were last analyzed
    pub original_source_hash: Option<String>,
    /// Raw specifiers from the last analysis
    pub deps: Option<Vec<String>>,
    /// Composite `source hash ++ resolve-map hash` exposed to callers
    pub full_hash: Option<String>,
    /// Last transform output
    pub source: Option<String>,
    /// Source map of the last transform output
    pub source_map: Option<String>,
    /// Last observed modification time
    pub mtime: Option<Mtime>,
    /// Whether the file lives under a symlinked shared package cache
    pub is_global_cache: bool,
    /// Wall time of the last freshness check
    pub check_time: Instant,
    /// Whether a filesystem watch is active for this record
    pub watched: bool,
}

impl RecordState {
    fn new(source: String, mtime: Option<Mtime>, watched: bool) -> Self {
        Self {
            original_source: Some(source),
            original_source_hash: None,
            deps: None,
            full_hash: None,
            source: None,
            source_map: None,
            mtime,
            is_global_cache: false,
            check_time: Instant::now(),
            watched,
        }
    }
}

/// Shared, clonable single-shot future for a phase.
pub type SharedPhase<T> = Shared<BoxFuture<'static, Result<T, CacheError>>>;

/// Slot holding the in-flight (or, for JSON transforms, retained) phase
/// future of a record.
///
/// Coalescing is subscribe-if-present-else-start: `get_or_start` returns
/// the current future when one exists, so at most one phase of each kind
/// runs per record at any instant.
pub struct PhaseSlot<T: Clone> {
    inner: parking_lot::Mutex<Option<SharedPhase<T>>>,
}

impl<T: Clone + Send + 'static> PhaseSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(None),
        }
    }

    /// The current phase future, if one is set.
    pub fn current(&self) -> Option<SharedPhase<T>> {
        self.inner.lock().clone()
    }

    /// Subscribe to the current phase, or start a new one.
    ///
    /// The builder is only invoked when no phase is set; the new future is
    /// spawned so it runs to completion even if every subscriber drops.
    pub fn get_or_start<F, Fut>(&self, build: F) -> SharedPhase<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<T>> + Send + 'static,
    {
        let mut slot = self.inner.lock();
        if let Some(existing) = slot.as_ref() {
            return existing.clone();
        }
        let handle = tokio::spawn(build());
        let shared = async move {
            match handle.await {
                Ok(result) => result,
                Err(err) => Err(CacheError::Io(format!("phase task failed: {err}"))),
            }
        }
        .boxed()
        .shared();
        *slot = Some(shared.clone());
        shared
    }

    /// Clear the slot so the next request may start a fresh phase.
    pub fn clear(&self) {
        *self.inner.lock() = None;
    }
}

/// One per `(path, variant)`: the in-flight or completed transform entry.
pub struct FileRecord {
    key: RecordKey,
    /// Mutable record fields; phases and the coordinator lock this across
    /// suspension points, so it is an async mutex.
    pub state: Mutex<RecordState>,
    /// In-flight hash phase, cleared on a deferred timer
    pub hash_phase: PhaseSlot<HashOutcome>,
    /// In-flight transform phase; retained permanently for JSON records
    pub transform_phase: PhaseSlot<()>,
}

impl FileRecord {
    /// Allocate a record with freshly read source.
    pub fn new(key: RecordKey, source: String, mtime: Option<Mtime>, watched: bool) -> Arc<Self> {
        Arc::new(Self {
            key,
            state: Mutex::new(RecordState::new(source, mtime, watched)),
            hash_phase: PhaseSlot::new(),
            transform_phase: PhaseSlot::new(),
        })
    }

    /// The record's store key.
    pub fn key(&self) -> &RecordKey {
        &self.key
    }

    /// Whether the record's path has a JSON extension.
    pub fn is_json(&self) -> bool {
        self.key.path().ends_with(".json")
    }
}

/// Result of a completed hash phase.
///
/// The worker lease, when one was acquired for analysis, rides in a
/// shared slot: the first consumer takes it, either passing it to the
/// transform phase or dropping it back to the pool.
#[derive(Clone)]
pub struct HashOutcome {
    /// The record's new composite hash
    pub full_hash: String,
    /// Resolve map for the transform phase; absent for JSON files
    pub resolve_map: Option<crate::worker::ResolveMap>,
    /// Worker bound during analysis, if any
    pub worker: crate::pool::SharedLease,
}
