//! Per-sample filter contract and reference filters (C8, C13).
//!
//! A [`Filter`] is a pure, thread-safe predicate over a single sample.
//! [`crate::pool`] builds one filter chain per worker (never shared
//! across workers) and evaluates filters in declared order, short-
//! circuiting on the first rejection. A filter that inspects a variant
//! it does not handle returns `Ok(true)` — pass-through, not rejection.


use std::sync::Arc;

use crc32fast::Hasher as Crc32;
use thiserror::Error;

use crate::dedup::DedupStore;
use crate::sample::Sample;

/// Errors raised while evaluating a filter.
///
/// A filter returning `Err` is treated by the pool as a rejection for
/// that sample only — it never aborts the worker.
#[derive(Debug, Error)]
pub enum FilterError {
    /// The filter's own logic failed (e.g. the image bytes could not be
    /// decoded to inspect their dimensions).
    #[error("filter {filter} failed on sample {dataset_id}/{sample_id}: {message}")]
    Failed {
        /// Name of the filter that raised.
        filter: String,
        /// Dataset id of the offending sample.
        dataset_id: String,
        /// Sample id of the offending sample.
        sample_id: String,
        /// Human-readable failure detail.
        message: String,
    },

    /// The shared dedup store could not be reached.
    #[error("dedup store error: {0}")]
    Dedup(#[from] crate::dedup::DedupError),
}

/// A pure, thread-safe per-sample predicate.
pub trait Filter: Send + Sync {
    /// A short, stable name used in logs and error messages.
    fn name(&self) -> &str;

    /// Evaluate the filter against `sample`. Must not mutate `sample`.
    /// Variants outside the filter's scope return `Ok(true)`.
    fn apply(&self, sample: &Sample) -> Result<bool, FilterError>;
}

// ------------------------------------------------------------------------------------------------
// Content hashing
// ------------------------------------------------------------------------------------------------

/// Deterministic content hash used for deduplication.
///
/// Hashes the sample's payload bytes (image bytes, then text bytes, in
/// that order) with CRC32 — the same checksum primitive the WAL and
/// durable stores already depend on, so no additional hashing crate is
/// pulled in for this one purpose.
pub fn content_hash(sample: &Sample) -> String {
    let mut hasher = Crc32::new();
    if let Some(image) = sample.image() {
        hasher.update(&image.bytes);
    }
    if let Some(text) = sample.text() {
        hasher.update(text.as_bytes());
    }
    format!("{:08x}", hasher.finalize())
}

// ------------------------------------------------------------------------------------------------
// MinResolution
// ------------------------------------------------------------------------------------------------

/// Rejects `Image`/`ImageText` samples whose decoded pixel dimensions
/// fall below a configured minimum. `Text` samples pass through.
pub struct MinResolution {
    min_width: u32,
    min_height: u32,
}

impl MinResolution {
    /// Construct a filter requiring at least `min_width` x `min_height`
    /// pixels.
    pub fn new(min_width: u32, min_height: u32) -> Self {
        Self {
            min_width,
            min_height,
        }
    }
}

impl Filter for MinResolution {
    fn name(&self) -> &str {
        "min_resolution"
    }

    fn apply(&self, sample: &Sample) -> Result<bool, FilterError> {
        let Some(image) = sample.image() else {
            return Ok(true);
        };

        let format = match image.format {
            crate::sample::ImageFormat::Png => image::ImageFormat::Png,
            crate::sample::ImageFormat::Jpeg => image::ImageFormat::Jpeg,
        };

        let decoded = image::load_from_memory_with_format(&image.bytes, format).map_err(|e| {
            FilterError::Failed {
                filter: self.name().to_string(),
                dataset_id: sample.dataset_id().to_string(),
                sample_id: sample.sample_id().to_string(),
                message: e.to_string(),
            }
        })?;

        let (width, height) = (decoded.width(), decoded.height());
        Ok(width >= self.min_width && height >= self.min_height)
    }
}

// ------------------------------------------------------------------------------------------------
// ContentHashDedup
// ------------------------------------------------------------------------------------------------

/// Wraps a shared [`DedupStore`]: computes a content hash for each
/// sample and admits only its first occurrence across the whole run.
pub struct ContentHashDedup {
    store: Arc<DedupStore>,
}

impl ContentHashDedup {
    /// Construct a filter backed by `store`, shared across every worker.
    pub fn new(store: Arc<DedupStore>) -> Self {
        Self { store }
    }
}

impl Filter for ContentHashDedup {
    fn name(&self) -> &str {
        "content_hash_dedup"
    }

    fn apply(&self, sample: &Sample) -> Result<bool, FilterError> {
        let hash = content_hash(sample);
        Ok(self
            .store
            .check_and_insert(&hash, sample.dataset_id(), sample.sample_id())?)
    }
}
