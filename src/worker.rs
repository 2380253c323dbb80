//! Worker message protocol.
//!
//! Each worker is an opaque bidirectional message peer: one outbound
//! request is answered by exactly one reply, with no multiplexing. The
//! pairing is enforced by the pool bookkeeping, not by the wire.

use crate::error::CacheResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mapping from original import specifiers to rewritten specifiers.
///
/// A `null` value marks an empty-module substitution; specifiers absent
/// from the map are kept as written in the source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResolveMap {
    entries: BTreeMap<String, Option<String>>,
}

impl ResolveMap {
    /// Create an empty resolve map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a specifier rewrite.
    pub fn insert(&mut self, specifier: impl Into<String>, rewritten: impl Into<String>) {
        self.entries.insert(specifier.into(), Some(rewritten.into()));
    }

    /// Record an empty-module substitution.
    pub fn insert_empty(&mut self, specifier: impl Into<String>) {
        self.entries.insert(specifier.into(), None);
    }

    /// Look up the rewrite for a specifier.
    pub fn get(&self, specifier: &str) -> Option<&Option<String>> {
        self.entries.get(specifier)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map carries no rewrites.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outbound worker message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerRequest {
    /// Prime the worker with the source it will operate on
    Source {
        source: String,
        filename: String,
        production: bool,
    },
    /// Extract the raw dependency list of the primed module source
    AnalyzeModule,
    /// Extract the raw dependency list of the primed legacy source
    AnalyzeLegacy,
    /// Transform the primed module source with the given specifier rewrites
    TransformModule { resolve_map: ResolveMap },
    /// Transform the primed legacy source with the given specifier rewrites
    TransformLegacy { resolve_map: ResolveMap },
}

/// Inbound worker reply on the success path.
///
/// A failing worker surfaces through the engine's error return instead,
/// and the caller tags it *transform-error*.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerReply {
    /// Acknowledgment of a `source` priming message
    Ack,
    /// Dependency list from an `analyze-*` request
    Deps { deps: Vec<String> },
    /// Output of a `transform-*` request
    Transformed {
        source: String,
        source_map: Option<String>,
    },
}

/// Opaque transform engine peer.
///
/// Implementations typically bridge to an out-of-process engine; tests
/// use scripted in-memory peers.
#[async_trait]
pub trait TransformEngine: Send + Sync {
    /// Send one request and await its reply.
    async fn request(&self, request: WorkerRequest) -> CacheResult<WorkerReply>;
}
