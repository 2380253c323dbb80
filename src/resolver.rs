//! Resolver facade over the external module resolver.
//!
//! The facade owns the process-wide lookup cache the resolver consults
//! and wipes it wholesale on a fixed interval; `next_expiry` advances on
//! each clear and drives the coordinator's freshness checks. Beyond the
//! cache it is purely functional, performing no I/O of its own.

use crate::error::CacheResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Module format reported by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleFormat {
    /// Standard module
    Module,
    /// Legacy module
    Legacy,
    /// JSON
    Json,
    /// Builtin specifier to be substituted
    Builtin,
    /// Anything else
    Unknown,
}

/// Resolver environment knobs.
#[derive(Debug, Clone, Copy)]
pub struct ResolveEnv {
    pub production: bool,
    pub browser: bool,
}

/// A resolved dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// Absolute resolved path (or builtin id for builtin formats)
    pub path: String,
    /// Format of the resolution target
    pub format: ModuleFormat,
}

/// External module resolver seam.
#[async_trait]
pub trait ModuleResolver: Send + Sync {
    /// Resolve a specifier against a parent module path.
    async fn resolve(
        &self,
        specifier: &str,
        parent: &str,
        cache: &ResolverCache,
        env: &ResolveEnv,
        legacy: bool,
    ) -> CacheResult<Resolved>;

    /// Report the format of a module path.
    async fn format(
        &self,
        path: &str,
        cache: &ResolverCache,
        legacy: bool,
    ) -> CacheResult<ModuleFormat>;

    /// The package root containing `path`, if any.
    async fn package_path(&self, path: &str, cache: &ResolverCache) -> CacheResult<Option<String>>;
}

/// Lookup cache consumed by the resolver.
///
/// The contents are opaque to the cache layer; resolvers use it as a
/// plain keyed table. It is emptied wholesale on the clear interval.
#[derive(Default)]
pub struct ResolverCache {
    entries: parking_lot::RwLock<HashMap<String, serde_json::Value>>,
}

impl ResolverCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a cached value.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.read().get(key).cloned()
    }

    /// Store a value.
    pub fn insert(&self, key: impl Into<String>, value: serde_json::Value) {
        self.entries.write().insert(key.into(), value);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Facade wrapping the resolver with the shared cache and clear clock.
#[derive(Clone)]
pub struct ResolverFacade {
    resolver: Arc<dyn ModuleResolver>,
    cache: Arc<ResolverCache>,
    env: ResolveEnv,
    next_expiry: Arc<parking_lot::Mutex<Instant>>,
}

impl ResolverFacade {
    /// Wrap a resolver. `clear_interval` seeds the first expiry window.
    pub fn new(resolver: Arc<dyn ModuleResolver>, production: bool, clear_interval: Duration) -> Self {
        Self {
            resolver,
            cache: Arc::new(ResolverCache::new()),
            env: ResolveEnv {
                production,
                browser: true,
            },
            next_expiry: Arc::new(parking_lot::Mutex::new(Instant::now() + clear_interval)),
        }
    }

    /// Resolve a specifier against a parent path.
    ///
    /// A trailing `/` on the specifier is stripped before resolution.
    pub async fn resolve(&self, specifier: &str, parent: &str, legacy: bool) -> CacheResult<Resolved> {
        let specifier = specifier.trim_end_matches('/');
        self.resolver
            .resolve(specifier, parent, &self.cache, &self.env, legacy)
            .await
    }

    /// Report the format of a module path.
    pub async fn format(&self, path: &str, legacy: bool) -> CacheResult<ModuleFormat> {
        self.resolver.format(path, &self.cache, legacy).await
    }

    /// The package root containing `path`, if any.
    pub async fn package_path(&self, path: &str) -> CacheResult<Option<String>> {
        self.resolver.package_path(path, &self.cache).await
    }

    /// Empty the lookup cache and advance the expiry window.
    pub fn clear_cache(&self, clear_interval: Duration) {
        self.cache.clear();
        *self.next_expiry.lock() = Instant::now() + clear_interval;
        debug!("resolver cache cleared");
    }

    /// End of the current expiry window.
    pub fn next_expiry(&self) -> Instant {
        *self.next_expiry.lock()
    }

    /// The shared lookup cache.
    pub fn cache(&self) -> &Arc<ResolverCache> {
        &self.cache
    }
}
