//! Pipeline driver (C9): orchestrates C7 -> C5 -> C2/C6, owns checkpointing.
//!
//! The driver is single-threaded and is the sole writer of the manifest
//! and checkpoint stores; the worker pool it drives is the only
//! concurrent piece. Adapters run to completion one at a time, in
//! configuration order — the next adapter starts only once the current
//! one is fully drained.

#[cfg(test)]
mod tests;

use tracing::{debug, error, info, warn};

use thiserror::Error;

use crate::adapter::DatasetAdapter;
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::manifest::{ManifestError, ManifestStore};
use crate::pool::{PoolError, WorkerPool};
use crate::sample::Sample;
use crate::shard::{ShardWriter, SinkError};

/// Errors that abort an entire pipeline run.
///
/// `AdapterError` is deliberately absent: a mid-stream adapter failure
/// aborts only the current dataset (see [`DatasetOutcome::stream_error`])
/// and the driver proceeds to the next one, per the error policy table.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The worker pool could not evaluate a batch.
    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),
    /// A manifest commit failed.
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
    /// A checkpoint update failed.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    /// A shard write failed.
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
}

/// Driver configuration for a single run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Samples accumulated per call to the worker pool.
    pub batch_size: usize,
}

/// Summary of processing one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetOutcome {
    /// The adapter's id.
    pub dataset_id: String,
    /// Samples that passed every filter and were committed.
    pub accepted: usize,
    /// Samples that were evaluated and rejected.
    pub rejected: usize,
    /// `true` once the adapter's stream was fully consumed and
    /// `checkpoint.mark_complete` succeeded.
    pub completed: bool,
    /// `true` if the dataset was already complete on entry and no work
    /// was done this run.
    pub skipped: bool,
    /// Set if the adapter's stream raised mid-run; the dataset is left
    /// incomplete so the next run resumes it.
    pub stream_error: Option<String>,
}

/// Orchestrates the ingestion-filter-manifest pipeline across a set of
/// dataset adapters.
pub struct PipelineDriver {
    adapters: Vec<Box<dyn DatasetAdapter>>,
    pool: WorkerPool,
    manifest: ManifestStore,
    checkpoint: CheckpointStore,
    sink: Option<ShardWriter>,
    config: PipelineConfig,
}

impl PipelineDriver {
    /// Construct a driver over `adapters`, processed in the given order.
    pub fn new(
        adapters: Vec<Box<dyn DatasetAdapter>>,
        pool: WorkerPool,
        manifest: ManifestStore,
        checkpoint: CheckpointStore,
        sink: Option<ShardWriter>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            adapters,
            pool,
            manifest,
            checkpoint,
            sink,
            config,
        }
    }

    /// Run every configured adapter to completion, in order.
    ///
    /// Returns as soon as a manifest, checkpoint, sink, or pool error
    /// occurs — these are fatal for the whole run. Adapter stream errors
    /// are not fatal: they abort only the offending dataset, recorded in
    /// its [`DatasetOutcome`].
    pub fn run(&mut self) -> Result<Vec<DatasetOutcome>, PipelineError> {
        let mut outcomes = Vec::with_capacity(self.adapters.len());
        for adapter in &self.adapters {
            let outcome = run_dataset(
                adapter.as_ref(),
                &self.pool,
                &self.manifest,
                &self.checkpoint,
                self.sink.as_mut(),
                self.config.batch_size,
            )?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

fn resume_skip(resume_point: Option<String>) -> Option<usize> {
    resume_point.and_then(|s| s.parse::<usize>().ok()).map(|n| n + 1)
}

fn run_dataset(
    adapter: &dyn DatasetAdapter,
    pool: &WorkerPool,
    manifest: &ManifestStore,
    checkpoint: &CheckpointStore,
    mut sink: Option<&mut ShardWriter>,
    batch_size: usize,
) -> Result<DatasetOutcome, PipelineError> {
    let dataset_id = adapter.id().to_string();
    let batch_size = batch_size.max(1);

    if checkpoint.is_complete(&dataset_id)? {
        info!(dataset_id = %dataset_id, "dataset already complete, skipping");
        return Ok(DatasetOutcome {
            dataset_id,
            accepted: 0,
            rejected: 0,
            completed: true,
            skipped: true,
            stream_error: None,
        });
    }

    let skip = resume_skip(checkpoint.resume_point(&dataset_id)?);
    info!(dataset_id = %dataset_id, ?skip, "starting dataset stream");

    let mut batch: Vec<Sample> = Vec::with_capacity(batch_size);
    let mut accepted = 0usize;
    let mut rejected = 0usize;
    let mut stream_error: Option<String> = None;

    for item in adapter.stream(skip) {
        match item {
            Ok(sample) => batch.push(sample),
            Err(e) => {
                error!(dataset_id = %dataset_id, error = %e, "adapter stream failed, aborting dataset");
                stream_error = Some(e.to_string());
                break;
            }
        }

        if batch.len() >= batch_size {
            let (a, r) = commit_batch(&dataset_id, &mut batch, pool, manifest, checkpoint, sink.as_deref_mut())?;
            accepted += a;
            rejected += r;
        }
    }

    if !batch.is_empty() {
        if stream_error.is_none() {
            let (a, r) = commit_batch(&dataset_id, &mut batch, pool, manifest, checkpoint, sink.as_deref_mut())?;
            accepted += a;
            rejected += r;
        } else {
            warn!(
                dataset_id = %dataset_id,
                dropped = batch.len(),
                "discarding uncommitted tail after stream error; will be re-emitted on resume"
            );
        }
    }

    let completed = stream_error.is_none();
    if completed {
        checkpoint.mark_complete(&dataset_id)?;
        info!(dataset_id = %dataset_id, accepted, rejected, "dataset complete");
    }

    Ok(DatasetOutcome {
        dataset_id,
        accepted,
        rejected,
        completed,
        skipped: false,
        stream_error,
    })
}

/// Evaluate `batch` through the pool and commit the accepted samples in
/// the strict order the crash semantics depend on: manifest, then sink,
/// then checkpoint. Clears `batch` on success.
fn commit_batch(
    dataset_id: &str,
    batch: &mut Vec<Sample>,
    pool: &WorkerPool,
    manifest: &ManifestStore,
    checkpoint: &CheckpointStore,
    sink: Option<&mut ShardWriter>,
) -> Result<(usize, usize), PipelineError> {
    let verdicts = pool.process_batch(batch)?;

    let mut accepted_pairs = Vec::new();
    let mut accepted_samples = Vec::new();
    for (sample, verdict) in batch.iter().zip(verdicts.iter()) {
        if verdict.passed {
            accepted_pairs.push((sample.dataset_id().to_string(), sample.sample_id().to_string()));
            accepted_samples.push(sample.clone());
        }
    }

    manifest.add_batch(&accepted_pairs)?;

    if let Some(sink) = sink {
        sink.write_batch(&accepted_samples)?;
    }

    if let Some(last) = batch.last() {
        checkpoint.update(dataset_id, last.sample_id())?;
    }

    let accepted = accepted_pairs.len();
    let rejected = batch.len() - accepted;
    debug!(dataset_id = %dataset_id, accepted, rejected, "committed batch");
    batch.clear();
    Ok((accepted, rejected))
}
