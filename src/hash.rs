//! Hash phase.
//!
//! Computes the composite content hash of a record: the md5 of the
//! current source, concatenated with a rolling md5 over the ordered
//! resolution of its dependency list. Analysis (a worker round trip) only
//! happens when the source hash moved since the last analysis; the
//! resolve map is rebuilt every time because the resolver cache is wiped
//! on an interval.

use crate::builtins::{BuiltinSubstitute, EMPTY_MODULE};
use crate::cache::CacheShared;
use crate::error::{CacheError, CacheResult};
use crate::pool::{SharedLease, WorkerLease};
use crate::record::{FileRecord, HashOutcome, RecordKey};
use crate::resolver::ModuleFormat;
use crate::worker::{ResolveMap, WorkerReply, WorkerRequest};
use md5::{Digest, Md5};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Hex md5 of a string.
pub(crate) fn hex_md5(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Run the hash phase for a record.
///
/// On return the record's `full_hash` reflects this generation (or is
/// cleared on failure), and the slot clear is scheduled for one clear
/// interval later so freshness checks may rerun.
pub(crate) async fn run_hash_phase(
    shared: Arc<CacheShared>,
    record: Arc<FileRecord>,
) -> CacheResult<HashOutcome> {
    let result = hash_inner(&shared, &record).await;
    if result.is_err() {
        record.state.lock().await.full_hash = None;
    }
    schedule_slot_clear(record, shared.config.cache_clear_interval);
    result
}

fn schedule_slot_clear(record: Arc<FileRecord>, interval: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(interval).await;
        record.hash_phase.clear();
    });
}

async fn hash_inner(shared: &Arc<CacheShared>, record: &Arc<FileRecord>) -> CacheResult<HashOutcome> {
    let (source, analyzed_hash, known_deps) = {
        let state = record.state.lock().await;
        (
            state.original_source.clone(),
            state.original_source_hash.clone(),
            state.deps.clone(),
        )
    };
    let source =
        source.ok_or_else(|| CacheError::NotFound(record.key().path().to_string()))?;
    let source_hash = hex_md5(&source);

    // JSON needs no analysis and no resolve map.
    if record.is_json() {
        record.state.lock().await.full_hash = Some(source_hash.clone());
        return Ok(HashOutcome {
            full_hash: source_hash,
            resolve_map: None,
            worker: SharedLease::empty(),
        });
    }

    let mut lease: Option<WorkerLease> = None;
    let deps = match known_deps {
        Some(deps) if analyzed_hash.as_deref() == Some(source_hash.as_str()) => deps,
        _ => {
            let worker = shared.pool.assign(record.key(), &source).await?;
            let request = if record.key().is_legacy() {
                WorkerRequest::AnalyzeLegacy
            } else {
                WorkerRequest::AnalyzeModule
            };
            let deps = match worker.request(request).await? {
                WorkerReply::Deps { deps } => deps,
                other => {
                    return Err(CacheError::Transform(format!(
                        "unexpected worker reply to analyze: {other:?}"
                    )))
                }
            };
            let mut state = record.state.lock().await;
            state.deps = Some(deps.clone());
            state.original_source_hash = Some(source_hash.clone());
            lease = Some(worker);
            deps
        }
    };
    debug!(record = %record.key(), deps = deps.len(), "dependencies analyzed");

    let (resolve_map, resolve_hash) = build_resolve_map(shared, record.key(), &deps).await?;
    let full_hash = format!("{source_hash}{resolve_hash}");
    record.state.lock().await.full_hash = Some(full_hash.clone());

    Ok(HashOutcome {
        full_hash,
        resolve_map: Some(resolve_map),
        worker: lease.map(SharedLease::holding).unwrap_or_default(),
    })
}

/// Resolve every dependency and derive the resolve map and its hash.
///
/// The rolling hash covers the full ordered sequence of
/// `(dep, resolved)` or `(dep, "@empty")` pairs; map entries are only
/// emitted when the rewritten specifier differs from the original.
async fn build_resolve_map(
    shared: &Arc<CacheShared>,
    key: &RecordKey,
    deps: &[String],
) -> CacheResult<(ResolveMap, String)> {
    let base = parent_dir(key.path());
    let legacy = key.is_legacy();
    let mut map = ResolveMap::new();
    let mut rolling = Md5::new();

    for dep in deps {
        let mut resolved = shared.resolver.resolve(dep, key.path(), legacy).await?;

        let mut empty = false;
        if resolved.format == ModuleFormat::Builtin {
            match shared.builtins.substitute(&resolved.path) {
                BuiltinSubstitute::Empty => empty = true,
                BuiltinSubstitute::Replace(replacement) => {
                    resolved = shared.resolver.resolve(&replacement, key.path(), legacy).await?;
                }
            }
        }

        if empty {
            map.insert_empty(dep.clone());
            rolling.update(dep.as_bytes());
            rolling.update(EMPTY_MODULE.as_bytes());
            continue;
        }

        let resolved_path = resolved.path.replace('\\', "/");
        let mut rel = relative(base, &resolved_path);
        if !rel.starts_with("../") {
            rel.insert_str(0, "./");
        }
        if !resolved_path.starts_with(&shared.config.public_dir) {
            return Err(CacheError::Transform(format!(
                "dependency {dep} resolves to {rel}, outside the public directory"
            )));
        }

        let suffix = if legacy {
            "?dew"
        } else if matches!(resolved.format, ModuleFormat::Legacy | ModuleFormat::Json) {
            "?cjs"
        } else {
            ""
        };
        let rewritten = format!("{rel}{suffix}");
        if *dep != rewritten {
            map.insert(dep.clone(), rewritten);
        }
        rolling.update(dep.as_bytes());
        rolling.update(resolved_path.as_bytes());
    }

    Ok((map, hex::encode(rolling.finalize())))
}

/// Directory portion of a forward-slash path.
fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(index) => &path[..index],
        None => "",
    }
}

/// Relative path between two absolute forward-slash paths.
fn relative(base: &str, target: &str) -> String {
    let base_parts: Vec<&str> = base.split('/').filter(|part| !part.is_empty()).collect();
    let target_parts: Vec<&str> = target.split('/').filter(|part| !part.is_empty()).collect();
    let common = base_parts
        .iter()
        .zip(&target_parts)
        .take_while(|(a, b)| a == b)
        .count();

    let mut parts: Vec<&str> = Vec::new();
    for _ in common..base_parts.len() {
        parts.push("..");
    }
    parts.extend(&target_parts[common..]);
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_hex_md5_known_vector() {
        assert_eq!(hex_md5("abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("/pub/lib/a.js"), "/pub/lib");
        assert_eq!(parent_dir("/a.js"), "/");
        assert_eq!(parent_dir("a.js"), "");
    }

    #[test]
    fn test_relative_sibling() {
        assert_eq!(relative("/pub", "/pub/b.js"), "b.js");
        assert_eq!(relative("/pub/lib", "/pub/b.js"), "../b.js");
        assert_eq!(relative("/pub", "/pub/lib/b.js"), "lib/b.js");
    }

    #[test]
    fn test_relative_disjoint() {
        assert_eq!(relative("/pub", "/other/c.js"), "../other/c.js");
    }

    #[test]
    fn test_rolling_hash_is_order_sensitive() {
        let mut forward = Md5::new();
        forward.update(b"a");
        forward.update(b"/pub/a.js");
        forward.update(b"b");
        forward.update(b"/pub/b.js");

        let mut reversed = Md5::new();
        reversed.update(b"b");
        reversed.update(b"/pub/b.js");
        reversed.update(b"a");
        reversed.update(b"/pub/a.js");

        assert_ne!(hex::encode(forward.finalize()), hex::encode(reversed.finalize()));
    }

    proptest! {
        #[test]
        fn prop_relative_roundtrips_under_base(
            base_segments in prop::collection::vec("[a-z]{1,8}", 0..4),
            target_segments in prop::collection::vec("[a-z]{1,8}", 1..4),
        ) {
            let base = format!("/{}", base_segments.join("/"));
            let target = format!("{}/{}", base.trim_end_matches('/'), target_segments.join("/"));
            let rel = relative(&base, &target);
            prop_assert!(!rel.starts_with(".."));
            let rejoined = format!("{}/{}", base.trim_end_matches('/'), rel);
            prop_assert_eq!(rejoined, target);
        }

        #[test]
        fn prop_hex_md5_deterministic(input in ".*") {
            prop_assert_eq!(hex_md5(&input), hex_md5(&input));
        }
    }
}
