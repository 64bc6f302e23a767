//! Content-hash deduplication store shared across workers (C4).
//!
//! [`DedupStore::check_and_insert`] is the single atomic operation: it
//! reports whether `hash` has been seen before and, if not, records it as
//! seen in the same step — no caller can observe a gap between the check
//! and the insert. A `bloomfilter`-backed fast path (the same
//! point-lookup idiom the teacher uses for SSTable membership tests)
//! lets the common "definitely new" case skip the full lookup.
//!
//! Durability follows the same WAL + snapshot recipe as
//! [`crate::manifest`] and [`crate::checkpoint`]: every insert is a WAL
//! record applied to an in-memory, mutex-guarded table. Deduplication
//! persists by default across restarts; call [`DedupStore::wipe`] to
//! start a fresh run with no prior history.


use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{info, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::wal::{Wal, WalError};

const SNAPSHOT_FILENAME: &str = "DEDUP-SNAPSHOT";
const SNAPSHOT_TMP_SUFFIX: &str = ".tmp";
const WAL_FILENAME: &str = "dedup.wal";

/// Capacity the bloom filter is sized for. Past this many distinct
/// hashes the false-positive rate degrades gracefully rather than the
/// filter becoming unusable — every bloom "maybe" still falls through to
/// the authoritative map lookup.
const BLOOM_EXPECTED_ITEMS: usize = 4 * 1024 * 1024;
const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.001;

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Errors returned by dedup store operations.
#[derive(Debug, Error)]
pub enum DedupError {
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
    #[error("dedup snapshot checksum mismatch")]
    SnapshotChecksumMismatch,

    /// The bloom filter could not be constructed for the configured
    /// capacity and false-positive rate.
    #[error("failed to build bloom filter: {0}")]
    BloomInit(String),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Durable state
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Default, Clone, PartialEq)]
struct DedupData {
    /// content hash -> first-seen (dataset_id, sample_id).
    seen: BTreeMap<String, (String, String)>,
}

impl Encode for DedupData {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let entries: Vec<(String, (String, String))> = self
            .seen
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        encoding::encode_vec(&entries, buf)
    }
}

impl Decode for DedupData {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (entries, n) = encoding::decode_vec::<(String, (String, String))>(buf)?;
        Ok((
            Self {
                seen: entries.into_iter().collect(),
            },
            n,
        ))
    }
}

impl Encode for (String, (String, String)) {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.0.encode_to(buf)?;
        self.1.0.encode_to(buf)?;
        self.1.1.encode_to(buf)
    }
}

impl Decode for (String, (String, String)) {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (hash, n1) = String::decode_from(buf)?;
        let (dataset_id, n2) = String::decode_from(&buf[n1..])?;
        let (sample_id, n3) = String::decode_from(&buf[n1 + n2..])?;
        Ok(((hash, (dataset_id, sample_id)), n1 + n2 + n3))
    }
}

/// A single WAL record: one newly-seen hash.
#[derive(Debug)]
struct DedupEvent {
    hash: String,
    dataset_id: String,
    sample_id: String,
}

impl Encode for DedupEvent {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.hash.encode_to(buf)?;
        self.dataset_id.encode_to(buf)?;
        self.sample_id.encode_to(buf)
    }
}

impl Decode for DedupEvent {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (hash, n1) = String::decode_from(buf)?;
        let (dataset_id, n2) = String::decode_from(&buf[n1..])?;
        let (sample_id, n3) = String::decode_from(&buf[n1 + n2..])?;
        Ok((
            Self {
                hash,
                dataset_id,
                sample_id,
            },
            n1 + n2 + n3,
        ))
    }
}

struct DedupSnapshot {
    data: DedupData,
    checksum: u32,
}

impl Encode for DedupSnapshot {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.data.encode_to(buf)?;
        self.checksum.encode_to(buf)
    }
}

impl Decode for DedupSnapshot {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (data, n1) = DedupData::decode_from(buf)?;
        let (checksum, n2) = u32::decode_from(&buf[n1..])?;
        Ok((Self { data, checksum }, n1 + n2))
    }
}

// ------------------------------------------------------------------------------------------------
// DedupStore
// ------------------------------------------------------------------------------------------------

struct DedupState {
    data: DedupData,
    bloom: Bloom<String>,
}

fn new_bloom() -> Result<Bloom<String>, DedupError> {
    Bloom::new_for_fp_rate(BLOOM_EXPECTED_ITEMS, BLOOM_FALSE_POSITIVE_RATE)
        .map_err(|e| DedupError::BloomInit(e.to_string()))
}

/// Durable content-hash dedup store, shared (by reference) across
/// worker threads.
pub struct DedupStore {
    path: PathBuf,
    wal: Wal<DedupEvent>,
    state: Mutex<DedupState>,
}

impl std::fmt::Debug for DedupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl DedupStore {
    /// Open (or create) the dedup store rooted at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DedupError> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let snapshot_path = path.join(SNAPSHOT_FILENAME);
        let mut data = DedupData::default();
        if snapshot_path.exists() {
            match read_snapshot(&snapshot_path) {
                Ok(snap) => data = snap,
                Err(e) => {
                    warn!(
                        path = %snapshot_path.display(),
                        error = %e,
                        "dedup snapshot unreadable, replaying WAL from scratch"
                    );
                }
            }
        }

        let mut bloom = new_bloom()?;
        for hash in data.seen.keys() {
            bloom.set(hash);
        }

        let wal = Wal::<DedupEvent>::open(path.join(WAL_FILENAME), None)?;
        let mut store = Self {
            path,
            wal,
            state: Mutex::new(DedupState { data, bloom }),
        };
        store.replay()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, DedupState>, DedupError> {
        self.state
            .lock()
            .map_err(|_| DedupError::Internal("mutex poisoned".into()))
    }

    fn replay(&mut self) -> Result<(), DedupError> {
        let iter = self.wal.replay_iter()?;
        let mut count = 0u64;
        for item in iter {
            match item {
                Ok(event) => {
                    let mut state = self.lock()?;
                    apply(&mut state, &event);
                    count += 1;
                }
                Err(e) => {
                    warn!(error = %e, "dedup WAL replay stopped on error");
                    break;
                }
            }
        }
        info!(path = %self.path.display(), records = count, "dedup WAL replayed");
        Ok(())
    }

    /// Atomically check whether `hash` has been seen before and, if not,
    /// record it as first-seen for `(dataset_id, sample_id)`.
    ///
    /// Returns `true` when `hash` is new (the caller should keep the
    /// sample), `false` when it has already been seen (the caller should
    /// drop it as a duplicate).
    pub fn check_and_insert(
        &self,
        hash: &str,
        dataset_id: &str,
        sample_id: &str,
    ) -> Result<bool, DedupError> {
        let mut state = self.lock()?;

        if state.bloom.check(&hash.to_string()) && state.data.seen.contains_key(hash) {
            return Ok(false);
        }

        let event = DedupEvent {
            hash: hash.to_string(),
            dataset_id: dataset_id.to_string(),
            sample_id: sample_id.to_string(),
        };
        self.wal.append(&event)?;
        apply(&mut state, &event);
        Ok(true)
    }

    /// Whether `hash` has already been recorded, without mutating state.
    pub fn contains(&self, hash: &str) -> Result<bool, DedupError> {
        let state = self.lock()?;
        Ok(state.bloom.check(&hash.to_string()) && state.data.seen.contains_key(hash))
    }

    /// Number of distinct hashes recorded.
    pub fn len(&self) -> Result<usize, DedupError> {
        Ok(self.lock()?.data.seen.len())
    }

    /// Whether the store has recorded any hashes.
    pub fn is_empty(&self) -> Result<bool, DedupError> {
        Ok(self.len()? == 0)
    }

    /// Write a full snapshot of the current state and truncate the WAL.
    pub fn compact(&mut self) -> Result<(), DedupError> {
        let data = self.lock()?.data.clone();
        let mut snapshot = DedupSnapshot { data, checksum: 0 };
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
        info!(path = %final_path.display(), "dedup snapshot written");
        Ok(())
    }

    /// Delete all recorded history and start fresh.
    ///
    /// Removes the WAL and snapshot files on disk and reopens an empty
    /// store at the same path. Used when a run should not carry
    /// deduplication state from a prior invocation.
    pub fn wipe(&mut self) -> Result<(), DedupError> {
        let mut state = self.lock()?;
        state.data = DedupData::default();
        state.bloom = new_bloom()?;
        drop(state);

        self.wal.truncate()?;
        let snapshot_path = self.path.join(SNAPSHOT_FILENAME);
        if snapshot_path.exists() {
            fs::remove_file(&snapshot_path)?;
        }
        info!(path = %self.path.display(), "dedup store wiped");
        Ok(())
    }
}

fn apply(state: &mut DedupState, event: &DedupEvent) {
    state.bloom.set(&event.hash);
    state
        .data
        .seen
        .entry(event.hash.clone())
        .or_insert_with(|| (event.dataset_id.clone(), event.sample_id.clone()));
}

fn read_snapshot(path: &Path) -> Result<DedupData, DedupError> {
    let mut f = File::open(path)?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf)?;

    let (snap, _) = encoding::decode_from_slice::<DedupSnapshot>(&buf)?;
    let verify = DedupSnapshot {
        data: snap.data.clone(),
        checksum: 0,
    };
    let verify_bytes = encoding::encode_to_vec(&verify)?;
    let mut hasher = Crc32::new();
    hasher.update(&verify_bytes);
    if hasher.finalize() != snap.checksum {
        return Err(DedupError::SnapshotChecksumMismatch);
    }
    Ok(snap.data)
}
