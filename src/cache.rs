//! Request coordinator.
//!
//! The public front door of the cache: looks up or creates the record
//! for a request, keeps it fresh via watches or mtime probes, drives the
//! hash and transform phases, and short-circuits with a not-modified
//! reply when the caller already holds the current hash. Concurrent
//! requests on one key coalesce onto the same phases.

use crate::builtins::BuiltinTable;
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::hash::run_hash_phase;
use crate::pool::WorkerPool;
use crate::record::{FileRecord, HashOutcome, RecordKey, Variant};
use crate::resolver::{ModuleFormat, ModuleResolver, Resolved, ResolverFacade};
use crate::transform::run_transform_phase;
use crate::watcher::{probe_mtime, WatchEvent, WatchEventKind, WatchManager};
use crate::worker::TransformEngine;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Result of a completed transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformedModule {
    /// Transformed source text
    pub source: String,
    /// Source map, when the worker produced one
    pub source_map: Option<String>,
    /// Composite content hash
    pub hash: String,
    /// Whether the file lives under a symlinked shared package cache
    pub is_global_cache: bool,
}

/// Outcome of a [`TransformCache::get`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetOutcome {
    /// Full transform result
    Transformed(TransformedModule),
    /// The caller's known hash is current; source and map are omitted
    NotModified { hash: String },
    /// This variant needs no transform; the caller should request the
    /// appropriate sibling variant instead
    NoTransform,
}

/// Shared handle over an in-flight or completed record creation.
///
/// `None` means the variant needs no transform; that reply is cached so
/// repeat requests short-circuit.
type RecordSlot = Shared<BoxFuture<'static, Result<Option<Arc<FileRecord>>, CacheError>>>;

pub(crate) struct CacheShared {
    pub(crate) config: CacheConfig,
    pub(crate) resolver: ResolverFacade,
    pub(crate) pool: WorkerPool,
    pub(crate) builtins: BuiltinTable,
    pub(crate) watches: WatchManager,
    records: Mutex<HashMap<String, RecordSlot>>,
}

/// Incremental file-transform cache.
pub struct TransformCache {
    shared: Arc<CacheShared>,
    clear_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    event_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl TransformCache {
    /// Create a cache over the given resolver and transform engines.
    ///
    /// Embedders conventionally pass one engine per CPU
    /// ([`WorkerPool::default_worker_count`]).
    pub fn new(
        config: CacheConfig,
        resolver: Arc<dyn ModuleResolver>,
        engines: Vec<Arc<dyn TransformEngine>>,
        builtins: BuiltinTable,
    ) -> Self {
        let facade = ResolverFacade::new(resolver, config.production, config.cache_clear_interval);
        let (watches, event_rx) = WatchManager::new(config.max_watch_count);
        let pool = WorkerPool::new(engines, config.production);
        let shared = Arc::new(CacheShared {
            config,
            resolver: facade,
            pool,
            builtins,
            watches,
            records: Mutex::new(HashMap::new()),
        });

        let clear_task = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let interval = shared.config.cache_clear_interval;
                loop {
                    tokio::time::sleep(interval).await;
                    shared.resolver.clear_cache(interval);
                }
            })
        };
        let event_task = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move { run_event_loop(shared, event_rx).await })
        };

        Self {
            shared,
            clear_task: parking_lot::Mutex::new(Some(clear_task)),
            event_task: parking_lot::Mutex::new(Some(event_task)),
        }
    }

    /// Fetch the transformed form of `file_path`.
    ///
    /// A `?dew` suffix selects the legacy variant and is stripped for all
    /// filesystem operations. When `known_hash` matches the current
    /// hash, the reply is [`GetOutcome::NotModified`] and no transform
    /// round trip happens.
    pub async fn get(&self, file_path: &str, known_hash: Option<&str>) -> CacheResult<GetOutcome> {
        let (path, variant) = Variant::split(file_path);
        let key = RecordKey::new(path, variant);
        let storage = key.storage_key();

        let slot = {
            let mut records = self.shared.records.lock().await;
            match records.get(&storage) {
                Some(slot) => slot.clone(),
                None => {
                    let slot = spawn_record_slot(Arc::clone(&self.shared), key.clone());
                    records.insert(storage.clone(), slot.clone());
                    slot
                }
            }
        };

        let record = match slot.clone().await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(GetOutcome::NoTransform),
            Err(err) => {
                // A failed creation does not poison the key; the next
                // request rebuilds from scratch.
                let mut records = self.shared.records.lock().await;
                if records.get(&storage).map(|current| slot.ptr_eq(current)).unwrap_or(false) {
                    records.remove(&storage);
                }
                return Err(err);
            }
        };

        self.drive(record, known_hash).await
    }

    /// Resolve a specifier against a parent module path.
    pub async fn resolve(&self, name: &str, parent: &str, legacy: bool) -> CacheResult<Resolved> {
        self.shared.resolver.resolve(name, parent, legacy).await
    }

    /// The package root containing `path`, if any.
    pub async fn package_path(&self, path: &str) -> CacheResult<Option<String>> {
        self.shared.resolver.package_path(path).await
    }

    /// Tear the cache down: stop the clear timer and close every watch.
    ///
    /// Idempotent. In-flight phases are not cancelled; they run to
    /// completion against the now-dead store.
    pub fn dispose(&self) {
        if let Some(task) = self.clear_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }
        self.shared.watches.close_all();
        debug!("transform cache disposed");
    }

    /// Drive the per-record state machine for one request.
    async fn drive(
        &self,
        record: Arc<FileRecord>,
        known_hash: Option<&str>,
    ) -> CacheResult<GetOutcome> {
        let hash_current = record.hash_phase.current();
        let transform_current = record.transform_phase.current();

        match (hash_current, transform_current) {
            // In-flight (or, for JSON, retained) transform.
            (None, Some(transform)) => {
                if let Some(hash) = known_hash {
                    let state = record.state.lock().await;
                    if state.full_hash.as_deref() == Some(hash) {
                        return Ok(GetOutcome::NotModified { hash: hash.to_string() });
                    }
                }
                transform.await?;
                completed(&record).await
            }

            // Both phases settled: check freshness, then rehash.
            (None, None) => {
                if let Some(outcome) = self.check_freshness(&record).await? {
                    return Ok(outcome);
                }
                let outcome = self.drive_hash(&record).await?;
                if known_hash == Some(outcome.full_hash.as_str()) {
                    drop(outcome.worker.take());
                    return Ok(GetOutcome::NotModified { hash: outcome.full_hash });
                }
                self.drive_transform(&record, &outcome).await?;
                completed(&record).await
            }

            // In-flight hash.
            (Some(hash), _) => {
                let outcome = hash.await?;
                if known_hash == Some(outcome.full_hash.as_str()) {
                    drop(outcome.worker.take());
                    return Ok(GetOutcome::NotModified { hash: outcome.full_hash });
                }
                match record.transform_phase.current() {
                    Some(transform) => transform.await?,
                    None => self.drive_transform(&record, &outcome).await?,
                }
                completed(&record).await
            }
        }
    }

    /// Probe mtime for unwatched records and re-read on change.
    ///
    /// Returns `Some(NoTransform)` when the file disappeared: the record
    /// handle collapses to the cached-absent reply.
    async fn check_freshness(&self, record: &Arc<FileRecord>) -> CacheResult<Option<GetOutcome>> {
        let (watched, check_time) = {
            let state = record.state.lock().await;
            (state.watched, state.check_time)
        };
        if watched || check_time >= self.shared.resolver.next_expiry() {
            return Ok(None);
        }

        let path = record.key().path().to_string();
        let probed = probe_mtime(Path::new(&path)).await?;
        let mut state = record.state.lock().await;
        state.check_time = Instant::now();
        if state.mtime == Some(probed) {
            return Ok(None);
        }

        match tokio::fs::read_to_string(&path).await {
            Ok(source) => {
                debug!(record = %record.key(), "source re-read after mtime change");
                state.original_source = Some(source);
                state.mtime = Some(probed);
                Ok(None)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                drop(state);
                let mut records = self.shared.records.lock().await;
                records.insert(record.key().storage_key(), absent_slot());
                Ok(Some(GetOutcome::NoTransform))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn drive_hash(&self, record: &Arc<FileRecord>) -> CacheResult<HashOutcome> {
        let shared = Arc::clone(&self.shared);
        let rec = Arc::clone(record);
        record
            .hash_phase
            .get_or_start(move || run_hash_phase(shared, rec))
            .await
    }

    async fn drive_transform(
        &self,
        record: &Arc<FileRecord>,
        outcome: &HashOutcome,
    ) -> CacheResult<()> {
        let shared = Arc::clone(&self.shared);
        let rec = Arc::clone(record);
        let resolve_map = outcome.resolve_map.clone();
        let worker = outcome.worker.clone();
        record
            .transform_phase
            .get_or_start(move || run_transform_phase(shared, rec, resolve_map, worker))
            .await
    }
}

impl Drop for TransformCache {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Build the completed reply from record state.
async fn completed(record: &Arc<FileRecord>) -> CacheResult<GetOutcome> {
    let state = record.state.lock().await;
    let source = state
        .source
        .clone()
        .ok_or_else(|| CacheError::Transform("transform produced no output".into()))?;
    let hash = state
        .full_hash
        .clone()
        .ok_or_else(|| CacheError::Transform("record hash missing after transform".into()))?;
    Ok(GetOutcome::Transformed(TransformedModule {
        source,
        source_map: state.source_map.clone(),
        hash,
        is_global_cache: state.is_global_cache,
    }))
}

/// A ready slot carrying the cached-absent reply.
fn absent_slot() -> RecordSlot {
    async { Ok(None) }.boxed().shared()
}

fn spawn_record_slot(shared: Arc<CacheShared>, key: RecordKey) -> RecordSlot {
    let handle = tokio::spawn(create_record(shared, key));
    async move {
        match handle.await {
            Ok(result) => result,
            Err(err) => Err(CacheError::Io(format!("record task failed: {err}"))),
        }
    }
    .boxed()
    .shared()
}

/// First-time path: read source and format in parallel, gate on the
/// variant, then allocate the record and register its watch.
async fn create_record(
    shared: Arc<CacheShared>,
    key: RecordKey,
) -> CacheResult<Option<Arc<FileRecord>>> {
    let path = key.path().to_string();
    let legacy = key.is_legacy();
    let (read_result, format) = tokio::join!(
        tokio::fs::read_to_string(&path),
        shared.resolver.format(&path, legacy)
    );
    let format = format?;

    match key.variant() {
        Variant::Legacy => {
            if !matches!(format, ModuleFormat::Legacy | ModuleFormat::Json) {
                return Err(CacheError::NoTransform(key.storage_key()));
            }
        }
        Variant::Module => match format {
            ModuleFormat::Module => {}
            // The caller rewrites its specifier to the sibling variant.
            ModuleFormat::Json | ModuleFormat::Legacy => return Ok(None),
            ModuleFormat::Builtin | ModuleFormat::Unknown => {
                return Err(CacheError::UnsupportedFormat(path));
            }
        },
    }

    let source = match read_result {
        Ok(source) => source,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(CacheError::NotFound(path));
        }
        Err(err) => return Err(err.into()),
    };

    let watched = shared.watches.watch(&key, Path::new(&path));
    let mtime = if watched {
        None
    } else {
        Some(probe_mtime(Path::new(&path)).await?)
    };
    debug!(record = %key, watched, "record created");
    Ok(Some(FileRecord::new(key, source, mtime, watched)))
}

/// React to filesystem events until the channel closes.
async fn run_event_loop(shared: Arc<CacheShared>, mut event_rx: mpsc::UnboundedReceiver<WatchEvent>) {
    while let Some(event) = event_rx.recv().await {
        handle_watch_event(&shared, event).await;
    }
}

async fn handle_watch_event(shared: &Arc<CacheShared>, event: WatchEvent) {
    let slot = {
        let records = shared.records.lock().await;
        match records.get(&event.key.storage_key()) {
            Some(slot) => slot.clone(),
            None => return,
        }
    };
    let record = match slot.await {
        Ok(Some(record)) => record,
        _ => return,
    };

    match event.kind {
        WatchEventKind::Removed => {
            // Close the watch so the slot is reusable; the next request
            // falls back to an mtime probe.
            shared.watches.unwatch(&event.key);
            let mut state = record.state.lock().await;
            state.watched = false;
            state.check_time = Instant::now();
            debug!(record = %event.key, "watch lost, record downgraded to polling");
        }
        WatchEventKind::Change => {
            match tokio::fs::read_to_string(event.key.path()).await {
                Ok(source) => record.state.lock().await.original_source = Some(source),
                Err(err) => {
                    warn!(record = %event.key, error = %err, "re-read after change failed");
                    return;
                }
            }
            let previous = record.state.lock().await.full_hash.clone();

            // Let any in-flight work settle before rehashing.
            if let Some(hash) = record.hash_phase.current() {
                let _ = hash.await;
            }
            if let Some(transform) = record.transform_phase.current() {
                let _ = transform.await;
            }

            record.hash_phase.clear();
            let shared_for_hash = Arc::clone(shared);
            let rec = Arc::clone(&record);
            let outcome = match record
                .hash_phase
                .get_or_start(move || run_hash_phase(shared_for_hash, rec))
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(record = %event.key, error = %err, "rehash after change failed");
                    return;
                }
            };

            if previous.as_deref() == Some(outcome.full_hash.as_str()) {
                drop(outcome.worker.take());
                return;
            }
            record.transform_phase.clear();
            let shared_for_transform = Arc::clone(shared);
            let rec = Arc::clone(&record);
            let resolve_map = outcome.resolve_map.clone();
            let worker = outcome.worker.clone();
            if let Err(err) = record
                .transform_phase
                .get_or_start(move || run_transform_phase(shared_for_transform, rec, resolve_map, worker))
                .await
            {
                warn!(record = %event.key, error = %err, "retransform after change failed");
            }
        }
    }
}
