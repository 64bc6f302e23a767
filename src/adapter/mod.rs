//! Dataset adapter contract (C7).
//!
//! An adapter is the sole source of samples for one dataset. It owns
//! ordering and id assignment; the driver only ever asks it to resume
//! from a point by skip count, never to seek.


use thiserror::Error;

use crate::sample::Sample;

/// Errors raised while streaming samples from a dataset source.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The underlying data source could not be read (network, disk, decode).
    #[error("dataset {dataset_id} source error: {message}")]
    Source {
        /// The failing adapter's id.
        dataset_id: String,
        /// Human-readable failure detail.
        message: String,
    },

    /// The source yielded a sample that fails basic shape invariants
    /// (empty `sample_id`, empty `dataset_id`).
    #[error("dataset {dataset_id} emitted a malformed sample: {message}")]
    MalformedSample {
        /// The offending adapter's id.
        dataset_id: String,
        /// Human-readable failure detail.
        message: String,
    },
}

/// A provider of samples for exactly one dataset.
///
/// Implementations must yield samples in a reproducible order across
/// runs of the same configuration: the checkpoint store's resume
/// mechanism depends on it.
pub trait DatasetAdapter: Send + Sync {
    /// Stable identifier, distinct across adapters configured in one run.
    fn id(&self) -> &str;

    /// Stream every sample in this dataset's emission order. When
    /// `skip_count` is `Some(n)`, the first `n` samples are skipped
    /// before the first yielded item.
    fn stream(
        &self,
        skip_count: Option<usize>,
    ) -> Box<dyn Iterator<Item = Result<Sample, AdapterError>> + Send + '_>;
}

/// An in-memory [`DatasetAdapter`] backed by a fixed sample list.
///
/// Not a production data source — a minimal reference implementation
/// used by this crate's own tests and suitable as a starting point for
/// dataset sources that already materialize their samples in memory.
pub struct VecAdapter {
    id: String,
    samples: Vec<Sample>,
}

impl VecAdapter {
    /// Construct an adapter over `samples`, yielded in the given order.
    pub fn new(id: impl Into<String>, samples: Vec<Sample>) -> Self {
        Self {
            id: id.into(),
            samples,
        }
    }
}

impl DatasetAdapter for VecAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn stream(
        &self,
        skip_count: Option<usize>,
    ) -> Box<dyn Iterator<Item = Result<Sample, AdapterError>> + Send + '_> {
        let skip = skip_count.unwrap_or(0);
        Box::new(self.samples.iter().skip(skip).cloned().map(Ok))
    }
}
