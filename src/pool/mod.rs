//! Parallel filter evaluation over batches (C5).
//!
//! [`WorkerPool`] evaluates a configured filter chain over a batch of
//! samples using `W` workers. The pool takes a [`FilterFactory`], not
//! pre-built filter instances: each worker slot builds its own chain
//! once, on construction, so stateful internals (cached decoders,
//! thread-hostile handles) are never shared between workers. Filters
//! that need cross-worker state — deduplication — reach through to
//! [`crate::dedup::DedupStore`], which is external and thread-safe.
//!
//! Concurrency is built on `crossbeam::thread::scope` and one scoped
//! thread per worker slot per batch: the scope blocks the caller until
//! every worker has finished its share of the batch, which is exactly
//! `process_batch`'s synchronous contract. [`Verdict`]s are returned in
//! the batch's original order regardless of how work was split.

#[cfg(test)]
mod tests;

use std::sync::Mutex;

use thiserror::Error;
use tracing::warn;

use crate::filter::Filter;
use crate::sample::Sample;

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Errors returned by worker pool operations.
#[derive(Debug, Error, Clone)]
pub enum PoolError {
    /// One or more workers failed to build their filter chain at
    /// construction. Fatal: the pool refuses every `process_batch` call.
    #[error("worker pool failed to initialize: {0}")]
    WorkerInitFailed(String),

    /// A worker thread panicked outside of filter evaluation (filter
    /// panics are caught and treated as per-sample rejections, not pool
    /// failures).
    #[error("worker thread panicked during batch processing")]
    WorkerPanicked,

    /// `process_batch` was called after `shutdown`.
    #[error("worker pool has been shut down")]
    Stopped,

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Verdicts
// ------------------------------------------------------------------------------------------------

/// The outcome of evaluating one sample's filter chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Dataset id of the evaluated sample.
    pub dataset_id: String,
    /// Sample id of the evaluated sample.
    pub sample_id: String,
    /// Whether the sample passed every filter in the chain.
    pub passed: bool,
}

// ------------------------------------------------------------------------------------------------
// FilterFactory
// ------------------------------------------------------------------------------------------------

/// Builds one worker's private filter chain.
///
/// Called once per worker slot at [`WorkerPool::new`] time, never
/// shared: each call must return an independently-owned chain.
pub trait FilterFactory: Send + Sync {
    /// Construct a fresh filter chain, in evaluation order.
    fn build(&self) -> Result<Vec<Box<dyn Filter>>, String>;
}

// ------------------------------------------------------------------------------------------------
// Worker lifecycle
// ------------------------------------------------------------------------------------------------

/// Lifecycle state of a single worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Slot reserved, filter chain not yet built.
    Spawned,
    /// Filter chain built successfully.
    Initialized,
    /// Idle, available for the next batch.
    Ready,
    /// Evaluating its share of the current batch.
    Processing,
    /// Pool shutdown in progress.
    Draining,
    /// Pool shut down; slot will accept no further work.
    Stopped,
}

// ------------------------------------------------------------------------------------------------
// WorkerPool
// ------------------------------------------------------------------------------------------------

/// Fixed-size pool of filter-chain workers.
pub struct WorkerPool {
    chains: Vec<Mutex<Vec<Box<dyn Filter>>>>,
    states: Vec<Mutex<WorkerState>>,
    init_error: Option<String>,
}

impl WorkerPool {
    /// Build a pool of `worker_count` workers (clamped to at least 1),
    /// each with its own filter chain from `factory`.
    ///
    /// A chain build failure is recorded but does not panic: the pool is
    /// constructed successfully, and every subsequent `process_batch`
    /// call fails fast with [`PoolError::WorkerInitFailed`].
    pub fn new(worker_count: usize, factory: &dyn FilterFactory) -> Self {
        let worker_count = worker_count.max(1);
        let mut chains = Vec::with_capacity(worker_count);
        let mut states = Vec::with_capacity(worker_count);
        let mut init_error = None;

        for _ in 0..worker_count {
            match factory.build() {
                Ok(chain) => {
                    chains.push(Mutex::new(chain));
                    states.push(Mutex::new(WorkerState::Initialized));
                }
                Err(message) => {
                    warn!(error = %message, "worker filter chain failed to initialize");
                    chains.push(Mutex::new(Vec::new()));
                    states.push(Mutex::new(WorkerState::Stopped));
                    if init_error.is_none() {
                        init_error = Some(message);
                    }
                }
            }
        }

        Self {
            chains,
            states,
            init_error,
        }
    }

    /// Number of worker slots in the pool.
    pub fn worker_count(&self) -> usize {
        self.chains.len()
    }

    /// Snapshot of every worker slot's current lifecycle state.
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.states
            .iter()
            .map(|s| *s.lock().expect("worker state mutex poisoned"))
            .collect()
    }

    /// Evaluate the filter chain over `samples`, returning verdicts in
    /// the same order as the input.
    pub fn process_batch(&self, samples: &[Sample]) -> Result<Vec<Verdict>, PoolError> {
        if let Some(message) = &self.init_error {
            return Err(PoolError::WorkerInitFailed(message.clone()));
        }
        let mut all_stopped = true;
        for s in self.states.iter() {
            if !matches!(*s.lock().map_err(poison)?, WorkerState::Stopped) {
                all_stopped = false;
                break;
            }
        }
        if all_stopped {
            return Err(PoolError::Stopped);
        }
        if samples.is_empty() {
            return Ok(Vec::new());
        }

        let worker_count = self.chains.len();
        let chunk_size = samples.len().div_ceil(worker_count).max(1);
        let chunks: Vec<&[Sample]> = samples.chunks(chunk_size).collect();

        for state in self.states.iter().take(chunks.len()) {
            *state.lock().map_err(poison)? = WorkerState::Processing;
        }

        let scoped: Result<Vec<Vec<(usize, Verdict)>>, PoolError> =
            crossbeam::thread::scope(|scope| {
                let mut base = 0usize;
                let handles: Vec<_> = chunks
                    .iter()
                    .enumerate()
                    .map(|(worker_id, chunk)| {
                        let start = base;
                        base += chunk.len();
                        let chain_lock = &self.chains[worker_id];
                        scope.spawn(move |_| {
                            let chain = chain_lock.lock().expect("filter chain mutex poisoned");
                            chunk
                                .iter()
                                .enumerate()
                                .map(|(i, sample)| (start + i, evaluate(&chain, sample)))
                                .collect::<Vec<_>>()
                        })
                    })
                    .collect();

                handles
                    .into_iter()
                    .map(|h| h.join().map_err(|_| PoolError::WorkerPanicked))
                    .collect()
            })
            .map_err(|_| PoolError::WorkerPanicked)?;

        for state in self.states.iter().take(chunks.len()) {
            *state.lock().map_err(poison)? = WorkerState::Ready;
        }

        let mut flat: Vec<(usize, Verdict)> = scoped?.into_iter().flatten().collect();
        flat.sort_by_key(|(idx, _)| *idx);
        Ok(flat.into_iter().map(|(_, v)| v).collect())
    }

    /// Mark every worker slot as stopped. Subsequent `process_batch`
    /// calls fail with [`PoolError::Stopped`].
    pub fn shutdown(&self) -> Result<(), PoolError> {
        for state in &self.states {
            let mut guard = state.lock().map_err(poison)?;
            *guard = WorkerState::Draining;
            *guard = WorkerState::Stopped;
        }
        Ok(())
    }
}

fn poison<T>(_: std::sync::PoisonError<T>) -> PoolError {
    PoolError::Internal("worker state mutex poisoned".into())
}

/// Evaluate one sample through a worker's filter chain, in declared
/// order, short-circuiting on the first rejection. A filter returning
/// `Err` or panicking is logged and treated as a rejection for this
/// sample only.
fn evaluate(chain: &[Box<dyn Filter>], sample: &Sample) -> Verdict {
    let mut passed = true;
    for filter in chain {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| filter.apply(sample)));
        match outcome {
            Ok(Ok(true)) => continue,
            Ok(Ok(false)) => {
                passed = false;
                break;
            }
            Ok(Err(e)) => {
                warn!(
                    filter = filter.name(),
                    dataset_id = sample.dataset_id(),
                    sample_id = sample.sample_id(),
                    error = %e,
                    "filter error; rejecting sample"
                );
                passed = false;
                break;
            }
            Err(_) => {
                warn!(
                    filter = filter.name(),
                    dataset_id = sample.dataset_id(),
                    sample_id = sample.sample_id(),
                    "filter panicked; rejecting sample"
                );
                passed = false;
                break;
            }
        }
    }

    Verdict {
        dataset_id: sample.dataset_id().to_string(),
        sample_id: sample.sample_id().to_string(),
        passed,
    }
}
