//! Worker pool with a FIFO waiting queue.
//!
//! Owns the long-lived transform engines, hands them out one record at a
//! time, and parks excess requesters in strict arrival order. A worker is
//! either idle or bound to exactly one record with at most one
//! outstanding message.

use crate::error::{CacheError, CacheResult};
use crate::record::RecordKey;
use crate::worker::{TransformEngine, WorkerReply, WorkerRequest};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// Pool of transform workers.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    engines: Vec<Arc<dyn TransformEngine>>,
    production: bool,
    state: parking_lot::Mutex<PoolState>,
}

struct PoolState {
    /// Record currently bound to each worker, `None` when idle
    bound: Vec<Option<RecordKey>>,
    /// Requesters awaiting a worker, strict FIFO
    wait_queue: VecDeque<(RecordKey, oneshot::Sender<usize>)>,
}

impl WorkerPool {
    /// Create a pool over the given engines.
    ///
    /// Embedders spawn one engine per CPU; see [`default_worker_count`].
    ///
    /// [`default_worker_count`]: WorkerPool::default_worker_count
    pub fn new(engines: Vec<Arc<dyn TransformEngine>>, production: bool) -> Self {
        let count = engines.len();
        Self {
            inner: Arc::new(PoolInner {
                engines,
                production,
                state: parking_lot::Mutex::new(PoolState {
                    bound: vec![None; count],
                    wait_queue: VecDeque::new(),
                }),
            }),
        }
    }

    /// The conventional pool size: one worker per CPU.
    pub fn default_worker_count() -> usize {
        num_cpus::get()
    }

    /// Bind an idle worker to `key`, waiting FIFO if none is idle, then
    /// prime it with `source` and await the acknowledgment.
    pub async fn assign(&self, key: &RecordKey, source: &str) -> CacheResult<WorkerLease> {
        let pending = {
            let mut state = self.inner.state.lock();
            match state.bound.iter().position(Option::is_none) {
                Some(index) => {
                    state.bound[index] = Some(key.clone());
                    Ok(index)
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    state.wait_queue.push_back((key.clone(), tx));
                    Err(rx)
                }
            }
        };

        let index = match pending {
            Ok(index) => index,
            Err(rx) => rx
                .await
                .map_err(|_| CacheError::Transform("worker pool shut down".into()))?,
        };
        debug!(worker = index, record = %key, "worker assigned");

        let lease = WorkerLease {
            pool: Arc::clone(&self.inner),
            index,
        };
        // Reply data to the priming message is ignored; an error reply
        // returns the worker to the pool via the lease drop.
        lease
            .request(WorkerRequest::Source {
                source: source.to_string(),
                filename: key.path().to_string(),
                production: self.inner.production,
            })
            .await?;
        Ok(lease)
    }

    /// Number of workers in the pool.
    pub fn worker_count(&self) -> usize {
        self.inner.engines.len()
    }

    /// Number of currently idle workers.
    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().bound.iter().filter(|b| b.is_none()).count()
    }

    /// Number of requesters parked in the wait queue.
    pub fn queued_waiters(&self) -> usize {
        self.inner.state.lock().wait_queue.len()
    }
}

/// Exclusive hold on one pooled worker.
///
/// Dropping the lease frees the worker; if waiters are queued the worker
/// is re-bound to the oldest one instead of going idle.
pub struct WorkerLease {
    pool: Arc<PoolInner>,
    index: usize,
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease").field("index", &self.index).finish()
    }
}

impl WorkerLease {
    /// Send one request to the bound worker and await its reply.
    ///
    /// Anything the worker rejects surfaces as a *transform-error*.
    pub async fn request(&self, request: WorkerRequest) -> CacheResult<WorkerReply> {
        self.pool.engines[self.index]
            .request(request)
            .await
            .map_err(|err| match err {
                transform @ CacheError::Transform(_) => transform,
                other => CacheError::Transform(other.to_string()),
            })
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        state.bound[self.index] = None;
        while let Some((key, tx)) = state.wait_queue.pop_front() {
            state.bound[self.index] = Some(key.clone());
            if tx.send(self.index).is_ok() {
                debug!(worker = self.index, record = %key, "worker handed to waiter");
                return;
            }
            // Waiter dropped its handle; try the next one.
            state.bound[self.index] = None;
        }
        debug!(worker = self.index, "worker freed");
    }
}

/// Shared slot carrying the worker acquired during a hash phase.
///
/// Every subscriber of the phase sees the same slot; the first consumer
/// takes the lease, either passing it on to the transform phase or
/// dropping it back to the pool.
#[derive(Clone, Default)]
pub struct SharedLease {
    inner: Arc<parking_lot::Mutex<Option<WorkerLease>>>,
}

impl SharedLease {
    /// Slot holding no worker.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Slot holding a bound worker.
    pub fn holding(lease: WorkerLease) -> Self {
        Self {
            inner: Arc::new(parking_lot::Mutex::new(Some(lease))),
        }
    }

    /// Take the lease out of the slot, if still present.
    pub fn take(&self) -> Option<WorkerLease> {
        self.inner.lock().take()
    }
}
