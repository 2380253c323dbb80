//! Transform phase.
//!
//! Turns a hashed record into servable output: the JSON wrapper for JSON
//! files, the source itself for module records with no dependencies, or
//! a worker transform round trip with the resolve map. A global-cache
//! probe runs in the background and lands on the record when the phase
//! ends.

use crate::cache::CacheShared;
use crate::error::{CacheError, CacheResult};
use crate::pool::SharedLease;
use crate::record::FileRecord;
use crate::worker::{ResolveMap, WorkerReply, WorkerRequest};
use std::sync::Arc;
use tracing::debug;

/// Run the transform phase for a record.
///
/// The pending slot is cleared on success and failure, except for JSON
/// records: their output only invalidates with the source itself, so the
/// completed phase is left in place. A worker failure also clears the
/// analyzed source hash so the next request re-analyzes.
pub(crate) async fn run_transform_phase(
    shared: Arc<CacheShared>,
    record: Arc<FileRecord>,
    resolve_map: Option<ResolveMap>,
    worker: SharedLease,
) -> CacheResult<()> {
    let result = transform_inner(&shared, &record, resolve_map, worker).await;
    if !(record.is_json() && result.is_ok()) {
        record.transform_phase.clear();
    }
    if result.is_err() {
        record.state.lock().await.original_source_hash = None;
    }
    result
}

async fn transform_inner(
    shared: &Arc<CacheShared>,
    record: &Arc<FileRecord>,
    resolve_map: Option<ResolveMap>,
    worker: SharedLease,
) -> CacheResult<()> {
    let probe = {
        let shared = Arc::clone(shared);
        let path = record.key().path().to_string();
        tokio::spawn(async move { probe_global_cache(&shared, &path).await })
    };

    if record.is_json() {
        drop(worker.take());
        let is_global_cache = probe.await.unwrap_or(false);
        let mut state = record.state.lock().await;
        let source = state
            .original_source
            .clone()
            .ok_or_else(|| CacheError::NotFound(record.key().path().to_string()))?;
        state.source = Some(format!(
            "export var __dew__ = null; export var exports = {source}"
        ));
        state.source_map = None;
        state.is_global_cache = is_global_cache;
        debug!(record = %record.key(), "json wrapped");
        return Ok(());
    }

    let (source, deps_empty) = {
        let state = record.state.lock().await;
        (
            state.original_source.clone(),
            state.deps.as_ref().map(Vec::is_empty).unwrap_or(true),
        )
    };
    let source =
        source.ok_or_else(|| CacheError::NotFound(record.key().path().to_string()))?;

    // A module with no dependencies is served as written.
    if !record.key().is_legacy() && deps_empty {
        drop(worker.take());
        let is_global_cache = probe.await.unwrap_or(false);
        let mut state = record.state.lock().await;
        state.source = Some(source);
        state.source_map = None;
        state.is_global_cache = is_global_cache;
        return Ok(());
    }

    let lease = match worker.take() {
        Some(lease) => lease,
        None => shared.pool.assign(record.key(), &source).await?,
    };
    let resolve_map = resolve_map.unwrap_or_default();
    let request = if record.key().is_legacy() {
        WorkerRequest::TransformLegacy { resolve_map }
    } else {
        WorkerRequest::TransformModule { resolve_map }
    };
    let reply = lease.request(request).await;
    drop(lease);

    let (out_source, out_map) = match reply? {
        WorkerReply::Transformed { source, source_map } => (source, source_map),
        other => {
            return Err(CacheError::Transform(format!(
                "unexpected worker reply to transform: {other:?}"
            )))
        }
    };

    let is_global_cache = probe.await.unwrap_or(false);
    let mut state = record.state.lock().await;
    state.source = Some(out_source);
    state.source_map = out_map;
    state.is_global_cache = is_global_cache;
    debug!(record = %record.key(), "transform complete");
    Ok(())
}

/// Whether the file's package root is a symlink into a shared cache.
async fn probe_global_cache(shared: &Arc<CacheShared>, path: &str) -> bool {
    let package = match shared.resolver.package_path(path).await {
        Ok(Some(package)) => package,
        _ => return false,
    };
    match tokio::fs::symlink_metadata(&package).await {
        Ok(meta) => meta.file_type().is_symlink(),
        Err(_) => false,
    }
}
