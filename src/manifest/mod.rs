//! Durable manifest of accepted samples (C2).
//!
//! The manifest is the source of truth for "has this sample already been
//! committed to an output shard". [`ManifestStore::add_batch`] is the
//! only mutation: it is atomic per call (one WAL record covers the whole
//! batch) and idempotent (re-adding an already-accepted pair is a no-op),
//! so a crash between the WAL append and the in-memory apply can never
//! leave the manifest in a state a replay cannot reconstruct.
//!
//! Durability follows a WAL + periodic snapshot model: every batch is
//! appended to `manifest.wal` before the in-memory index is updated;
//! [`ManifestStore::compact`] writes a full snapshot and truncates the
//! WAL so recovery after a long run does not require replaying every
//! batch ever committed.

#[cfg(test)]
mod tests;

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{info, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::wal::{Wal, WalError};

const SNAPSHOT_FILENAME: &str = "MANIFEST-SNAPSHOT";
const SNAPSHOT_TMP_SUFFIX: &str = ".tmp";
const WAL_FILENAME: &str = "manifest.wal";

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Errors returned by manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying WAL failure.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding/decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Snapshot file failed checksum verification.
    #[error("manifest snapshot checksum mismatch")]
    SnapshotChecksumMismatch,

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Durable state
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Default, Clone, PartialEq)]
struct ManifestData {
    /// dataset_id -> accepted sample_ids.
    accepted: BTreeMap<String, BTreeSet<String>>,
}

impl Encode for ManifestData {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let entries: Vec<(String, Vec<String>)> = self
            .accepted
            .iter()
            .map(|(k, v)| (k.clone(), v.iter().cloned().collect()))
            .collect();
        encoding::encode_vec(&entries, buf)
    }
}

impl Decode for ManifestData {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (entries, n) = encoding::decode_vec::<(String, Vec<String>)>(buf)?;
        let accepted = entries
            .into_iter()
            .map(|(k, v)| (k, v.into_iter().collect()))
            .collect();
        Ok((Self { accepted }, n))
    }
}

impl Encode for (String, Vec<String>) {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.0.encode_to(buf)?;
        encoding::encode_vec(&self.1, buf)
    }
}

impl Decode for (String, Vec<String>) {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (k, n1) = String::decode_from(buf)?;
        let (v, n2) = encoding::decode_vec::<String>(&buf[n1..])?;
        Ok(((k, v), n1 + n2))
    }
}

/// A single WAL record: one batch of accepted `(dataset_id, sample_id)`
/// pairs, committed atomically.
#[derive(Debug)]
struct ManifestEvent {
    pairs: Vec<(String, String)>,
}

impl Encode for ManifestEvent {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::encode_vec(&self.pairs, buf)
    }
}

impl Decode for ManifestEvent {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (pairs, n) = encoding::decode_vec::<(String, String)>(buf)?;
        Ok((Self { pairs }, n))
    }
}

impl Encode for (String, String) {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.0.encode_to(buf)?;
        self.1.encode_to(buf)
    }
}

impl Decode for (String, String) {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (a, n1) = String::decode_from(buf)?;
        let (b, n2) = String::decode_from(&buf[n1..])?;
        Ok(((a, b), n1 + n2))
    }
}

struct ManifestSnapshot {
    data: ManifestData,
    checksum: u32,
}

impl Encode for ManifestSnapshot {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.data.encode_to(buf)?;
        self.checksum.encode_to(buf)
    }
}

impl Decode for ManifestSnapshot {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (data, n1) = ManifestData::decode_from(buf)?;
        let (checksum, n2) = u32::decode_from(&buf[n1..])?;
        Ok((Self { data, checksum }, n1 + n2))
    }
}

// ------------------------------------------------------------------------------------------------
// ManifestStore
// ------------------------------------------------------------------------------------------------

/// Durable set of accepted `(dataset_id, sample_id)` pairs.
#[derive(Debug)]
pub struct ManifestStore {
    path: PathBuf,
    wal: Wal<ManifestEvent>,
    data: Mutex<ManifestData>,
}

impl ManifestStore {
    /// Open (or create) the manifest rooted at `path`.
    ///
    /// Loads the last snapshot if present, then replays `manifest.wal` on
    /// top of it. A corrupted snapshot is logged and discarded — the WAL
    /// is ground truth since the last successful checkpoint.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let snapshot_path = path.join(SNAPSHOT_FILENAME);
        let mut data = ManifestData::default();

        if snapshot_path.exists() {
            match read_snapshot(&snapshot_path) {
                Ok(snap) => data = snap,
                Err(e) => {
                    warn!(
                        path = %snapshot_path.display(),
                        error = %e,
                        "manifest snapshot unreadable, replaying WAL from scratch"
                    );
                }
            }
        }

        let wal = Wal::<ManifestEvent>::open(path.join(WAL_FILENAME), None)?;

        let mut store = Self {
            path,
            wal,
            data: Mutex::new(data),
        };
        store.replay()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, ManifestData>, ManifestError> {
        self.data
            .lock()
            .map_err(|_| ManifestError::Internal("mutex poisoned".into()))
    }

    fn replay(&mut self) -> Result<(), ManifestError> {
        let iter = self.wal.replay_iter()?;
        let mut count = 0u64;
        for item in iter {
            match item {
                Ok(event) => {
                    let mut guard = self.lock()?;
                    apply(&mut guard, &event);
                    count += 1;
                }
                Err(e) => {
                    warn!(error = %e, "manifest WAL replay stopped on error");
                    break;
                }
            }
        }
        info!(path = %self.path.display(), records = count, "manifest WAL replayed");
        Ok(())
    }

    /// Atomically accept a batch of `(dataset_id, sample_id)` pairs.
    ///
    /// Idempotent: pairs already present are silently skipped.
    pub fn add_batch(&self, pairs: &[(String, String)]) -> Result<(), ManifestError> {
        if pairs.is_empty() {
            return Ok(());
        }
        let event = ManifestEvent {
            pairs: pairs.to_vec(),
        };
        self.wal.append(&event)?;
        let mut guard = self.lock()?;
        apply(&mut guard, &event);
        Ok(())
    }

    /// Check whether a `(dataset_id, sample_id)` pair has been accepted.
    pub fn exists(&self, dataset_id: &str, sample_id: &str) -> Result<bool, ManifestError> {
        Ok(self
            .lock()?
            .accepted
            .get(dataset_id)
            .is_some_and(|set| set.contains(sample_id)))
    }

    /// Number of accepted samples for `dataset_id`.
    pub fn count(&self, dataset_id: &str) -> Result<usize, ManifestError> {
        Ok(self
            .lock()?
            .accepted
            .get(dataset_id)
            .map_or(0, BTreeSet::len))
    }

    /// All accepted sample ids for `dataset_id`, in sorted order.
    ///
    /// Returns an owned `Vec` rather than a lazy iterator: the backing
    /// `BTreeSet` lives behind this store's single `Mutex`, and a borrowed
    /// iterator would have to hold that lock for as long as the caller
    /// keeps iterating, blocking every concurrent `add_batch`/`exists`
    /// call for the duration. Cloning the ids up front keeps the lock hold
    /// time bounded to the clone itself.
    pub fn iter(&self, dataset_id: &str) -> Result<Vec<String>, ManifestError> {
        Ok(self
            .lock()?
            .accepted
            .get(dataset_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Write a full snapshot of the current state and truncate the WAL.
    ///
    /// Requires `&mut self` so no concurrent `add_batch` can race with the
    /// truncate step.
    pub fn compact(&mut self) -> Result<(), ManifestError> {
        let data = self.lock()?.clone();
        let mut snapshot = ManifestSnapshot { data, checksum: 0 };
        let unchecksummed = encoding::encode_to_vec(&snapshot)?;
        let mut hasher = Crc32::new();
        hasher.update(&unchecksummed);
        snapshot.checksum = hasher.finalize();
        let bytes = encoding::encode_to_vec(&snapshot)?;

        let tmp_path = self.path.join(format!("{SNAPSHOT_FILENAME}{SNAPSHOT_TMP_SUFFIX}"));
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        let final_path = self.path.join(SNAPSHOT_FILENAME);
        fs::rename(&tmp_path, &final_path)?;
        File::open(&self.path)?.sync_all()?;

        self.wal.truncate()?;
        info!(path = %final_path.display(), "manifest snapshot written");
        Ok(())
    }
}

fn apply(data: &mut ManifestData, event: &ManifestEvent) {
    for (dataset_id, sample_id) in &event.pairs {
        data.accepted
            .entry(dataset_id.clone())
            .or_default()
            .insert(sample_id.clone());
    }
}

fn read_snapshot(path: &Path) -> Result<ManifestData, ManifestError> {
    let mut f = File::open(path)?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf)?;

    let (snap, _) = encoding::decode_from_slice::<ManifestSnapshot>(&buf)?;
    let verify = ManifestSnapshot {
        data: snap.data.clone(),
        checksum: 0,
    };
    let verify_bytes = encoding::encode_to_vec(&verify)?;
    let mut hasher = Crc32::new();
    hasher.update(&verify_bytes);
    if hasher.finalize() != snap.checksum {
        return Err(ManifestError::SnapshotChecksumMismatch);
    }
    Ok(snap.data)
}
