//! Incremental file-transform cache for the dx dev server.
//!
//! Sits in front of the module resolver and a pool of out-of-process
//! transform workers. A request for a source file (optionally under its
//! legacy `?dew` variant) yields the transformed source, a source map,
//! and a stable content hash; repeat requests with an unchanged input
//! graph return instantly, and a caller that already holds the hash gets
//! a not-modified reply with no worker round trip.
//!
//! Freshness combines a bounded set of filesystem watches, mtime probes
//! for records past the watch cap, and periodic wholesale invalidation
//! of the resolver's lookup cache. All three feed the composite content
//! hash that drives cache validity.

pub mod builtins;
pub mod cache;
pub mod config;
pub mod error;
pub mod pool;
pub mod record;
pub mod resolver;
pub mod watcher;
pub mod worker;

mod hash;
mod transform;

pub use builtins::{BuiltinSubstitute, BuiltinTable, EMPTY_MODULE};
pub use cache::{GetOutcome, TransformCache, TransformedModule};
pub use config::CacheConfig;
pub use error::{CacheError, CacheResult};
pub use pool::{WorkerLease, WorkerPool};
pub use record::{RecordKey, Variant};
pub use resolver::{ModuleFormat, ModuleResolver, ResolveEnv, Resolved, ResolverCache};
pub use watcher::{Mtime, WatchManager};
pub use worker::{ResolveMap, TransformEngine, WorkerReply, WorkerRequest};
