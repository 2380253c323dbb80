//! Shared fixtures: a scripted transform engine and a table-driven
//! resolver over a temp directory tree.

#![allow(dead_code)]

use async_trait::async_trait;
use dx_transform_cache::{
    BuiltinTable, CacheConfig, CacheError, CacheResult, ModuleFormat, ModuleResolver, Resolved,
    ResolveEnv, ResolverCache, TransformCache, TransformEngine, WorkerReply, WorkerRequest,
};
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

/// Engine that replays a per-file dependency table and appends a marker
/// to transformed sources. Every request is logged for assertions.
pub struct ScriptedEngine {
    deps: Arc<parking_lot::Mutex<HashMap<String, Vec<String>>>>,
    log: Arc<parking_lot::Mutex<Vec<WorkerRequest>>>,
    fail_analyze: bool,
    delay: std::time::Duration,
    primed: parking_lot::Mutex<Option<(String, String)>>,
}

#[async_trait]
impl TransformEngine for ScriptedEngine {
    async fn request(&self, request: WorkerRequest) -> CacheResult<WorkerReply> {
        self.log.lock().push(request.clone());
        match request {
            WorkerRequest::Source { source, filename, .. } => {
                *self.primed.lock() = Some((filename, source));
                Ok(WorkerReply::Ack)
            }
            WorkerRequest::AnalyzeModule | WorkerRequest::AnalyzeLegacy => {
                tokio::time::sleep(self.delay).await;
                if self.fail_analyze {
                    return Err(CacheError::Transform("scripted analyze failure".into()));
                }
                let (filename, _) = self
                    .primed
                    .lock()
                    .clone()
                    .ok_or_else(|| CacheError::Transform("analyze before priming".into()))?;
                let deps = self.deps.lock().get(&filename).cloned().unwrap_or_default();
                Ok(WorkerReply::Deps { deps })
            }
            WorkerRequest::TransformModule { .. } | WorkerRequest::TransformLegacy { .. } => {
                tokio::time::sleep(self.delay).await;
                let (_, source) = self
                    .primed
                    .lock()
                    .clone()
                    .ok_or_else(|| CacheError::Transform("transform before priming".into()))?;
                Ok(WorkerReply::Transformed {
                    source: format!("{source} /*tx*/"),
                    source_map: Some("{\"version\":3}".into()),
                })
            }
        }
    }
}

/// Resolver backed by plain tables: specifier resolutions, per-path
/// format overrides, and package roots for the global-cache probe.
pub struct TableResolver {
    resolutions: Arc<parking_lot::Mutex<HashMap<String, Resolved>>>,
    formats: Arc<parking_lot::Mutex<HashMap<String, ModuleFormat>>>,
    package_roots: Arc<parking_lot::Mutex<HashMap<String, String>>>,
}

impl TableResolver {
    fn format_of(&self, path: &str) -> ModuleFormat {
        if let Some(format) = self.formats.lock().get(path) {
            return *format;
        }
        if path.ends_with(".json") {
            ModuleFormat::Json
        } else {
            ModuleFormat::Module
        }
    }
}

#[async_trait]
impl ModuleResolver for TableResolver {
    async fn resolve(
        &self,
        specifier: &str,
        _parent: &str,
        _cache: &ResolverCache,
        _env: &ResolveEnv,
        _legacy: bool,
    ) -> CacheResult<Resolved> {
        self.resolutions
            .lock()
            .get(specifier)
            .cloned()
            .ok_or_else(|| CacheError::Resolve {
                specifier: specifier.to_string(),
                message: "no table entry".into(),
            })
    }

    async fn format(
        &self,
        path: &str,
        _cache: &ResolverCache,
        _legacy: bool,
    ) -> CacheResult<ModuleFormat> {
        Ok(self.format_of(path))
    }

    async fn package_path(
        &self,
        path: &str,
        _cache: &ResolverCache,
    ) -> CacheResult<Option<String>> {
        Ok(self.package_roots.lock().get(path).cloned())
    }
}

/// One temp tree plus the shared tables the resolver and engines read.
pub struct Harness {
    pub dir: TempDir,
    deps: Arc<parking_lot::Mutex<HashMap<String, Vec<String>>>>,
    resolutions: Arc<parking_lot::Mutex<HashMap<String, Resolved>>>,
    formats: Arc<parking_lot::Mutex<HashMap<String, ModuleFormat>>>,
    package_roots: Arc<parking_lot::Mutex<HashMap<String, String>>>,
    log: Arc<parking_lot::Mutex<Vec<WorkerRequest>>>,
    fail_analyze: bool,
    delay: std::time::Duration,
    pub builtins: BuiltinTable,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("temp dir"),
            deps: Arc::default(),
            resolutions: Arc::default(),
            formats: Arc::default(),
            package_roots: Arc::default(),
            log: Arc::default(),
            fail_analyze: false,
            delay: std::time::Duration::ZERO,
            builtins: BuiltinTable::new(),
        }
    }

    pub fn failing_analyze(mut self) -> Self {
        self.fail_analyze = true;
        self
    }

    /// Slow every analyze/transform reply down, widening race windows so
    /// concurrency tests observe in-flight phases deterministically.
    pub fn with_engine_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Absolute forward-slash path of a file name in the tree.
    pub fn path(&self, name: &str) -> String {
        format!(
            "{}/{}",
            self.dir.path().to_string_lossy().replace('\\', "/"),
            name
        )
    }

    /// Write a file into the tree, returning its absolute path.
    pub fn write(&self, name: &str, contents: &str) -> String {
        let path = self.path(name);
        std::fs::write(&path, contents).expect("write fixture");
        path
    }

    /// Script the dependency list analysis reports for a file.
    pub fn set_deps(&self, path: &str, deps: &[&str]) {
        self.deps
            .lock()
            .insert(path.to_string(), deps.iter().map(|d| d.to_string()).collect());
    }

    /// Table a specifier resolution.
    pub fn add_resolution(&self, specifier: &str, target: &str, format: ModuleFormat) {
        self.resolutions.lock().insert(
            specifier.to_string(),
            Resolved {
                path: target.to_string(),
                format,
            },
        );
    }

    /// Override the reported format of a path.
    pub fn set_format(&self, path: &str, format: ModuleFormat) {
        self.formats.lock().insert(path.to_string(), format);
    }

    /// Table a package root for the global-cache probe.
    pub fn set_package_root(&self, path: &str, root: &str) {
        self.package_roots.lock().insert(path.to_string(), root.to_string());
    }

    /// Build a cache over the tree with `workers` scripted engines.
    pub fn cache(&self, workers: usize, config: impl FnOnce(CacheConfig) -> CacheConfig) -> TransformCache {
        let resolver = Arc::new(TableResolver {
            resolutions: Arc::clone(&self.resolutions),
            formats: Arc::clone(&self.formats),
            package_roots: Arc::clone(&self.package_roots),
        });
        let engines: Vec<Arc<dyn TransformEngine>> = (0..workers)
            .map(|_| {
                Arc::new(ScriptedEngine {
                    deps: Arc::clone(&self.deps),
                    log: Arc::clone(&self.log),
                    fail_analyze: self.fail_analyze,
                    delay: self.delay,
                    primed: parking_lot::Mutex::new(None),
                }) as Arc<dyn TransformEngine>
            })
            .collect();
        TransformCache::new(
            config(CacheConfig::new(self.dir.path())),
            resolver,
            engines,
            self.builtins.clone(),
        )
    }

    pub fn requests(&self) -> Vec<WorkerRequest> {
        self.log.lock().clone()
    }

    pub fn analyze_count(&self) -> usize {
        self.requests()
            .iter()
            .filter(|r| matches!(r, WorkerRequest::AnalyzeModule | WorkerRequest::AnalyzeLegacy))
            .count()
    }

    pub fn transform_count(&self) -> usize {
        self.requests()
            .iter()
            .filter(|r| {
                matches!(
                    r,
                    WorkerRequest::TransformModule { .. } | WorkerRequest::TransformLegacy { .. }
                )
            })
            .count()
    }

    /// The resolve map of the last transform request, if any.
    pub fn last_resolve_map(&self) -> Option<dx_transform_cache::ResolveMap> {
        self.requests().iter().rev().find_map(|r| match r {
            WorkerRequest::TransformModule { resolve_map }
            | WorkerRequest::TransformLegacy { resolve_map } => Some(resolve_map.clone()),
            _ => None,
        })
    }
}

pub fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Rolling md5 over `(dep, resolved)` pairs, matching the resolve-map
/// hash construction.
pub fn rolling_md5(pairs: &[(&str, &str)]) -> String {
    let mut hasher = Md5::new();
    for (dep, resolved) in pairs {
        hasher.update(dep.as_bytes());
        hasher.update(resolved.as_bytes());
    }
    hex::encode(hasher.finalize())
}
