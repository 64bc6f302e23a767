//! Durable per-dataset resume pointer (C3).
//!
//! The checkpoint store records, per dataset, the last sample id
//! successfully committed and whether the dataset has been fully
//! consumed. [`crate::driver`] commits to the checkpoint strictly after
//! committing to the manifest and the sink, so a resumed run never marks
//! a dataset complete while samples are still missing from the manifest.
//!
//! Durability follows the same WAL + snapshot recipe as
//! [`crate::manifest`]: every [`CheckpointStore::update`] or
//! [`CheckpointStore::mark_complete`] call is a single WAL record applied
//! to an in-memory, mutex-guarded table; [`CheckpointStore::compact`]
//! snapshots and truncates.

#[cfg(test)]
mod tests;

use std::{
    collections::BTreeMap,
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

const SNAPSHOT_FILENAME: &str = "CHECKPOINT-SNAPSHOT";
const SNAPSHOT_TMP_SUFFIX: &str = ".tmp";
const WAL_FILENAME: &str = "checkpoint.wal";

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Errors returned by checkpoint operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
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
    #[error("checkpoint snapshot checksum mismatch")]
    SnapshotChecksumMismatch,

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Durable state
// ------------------------------------------------------------------------------------------------

/// Resume state tracked for a single dataset.
#[derive(Debug, Clone, PartialEq, Default)]
struct DatasetProgress {
    last_sample_id: Option<String>,
    completed: bool,
}

impl Encode for DatasetProgress {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.last_sample_id.encode_to(buf)?;
        self.completed.encode_to(buf)
    }
}

impl Decode for DatasetProgress {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (last_sample_id, n1) = Option::<String>::decode_from(buf)?;
        let (completed, n2) = bool::decode_from(&buf[n1..])?;
        Ok((
            Self {
                last_sample_id,
                completed,
            },
            n1 + n2,
        ))
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
struct CheckpointData {
    datasets: BTreeMap<String, DatasetProgress>,
}

impl Encode for CheckpointData {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let entries: Vec<(String, DatasetProgress)> = self
            .datasets
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        encoding::encode_vec(&entries, buf)
    }
}

impl Decode for CheckpointData {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (entries, n) = encoding::decode_vec::<(String, DatasetProgress)>(buf)?;
        Ok((
            Self {
                datasets: entries.into_iter().collect(),
            },
            n,
        ))
    }
}

impl Encode for (String, DatasetProgress) {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.0.encode_to(buf)?;
        self.1.encode_to(buf)
    }
}

impl Decode for (String, DatasetProgress) {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (k, n1) = String::decode_from(buf)?;
        let (v, n2) = DatasetProgress::decode_from(&buf[n1..])?;
        Ok(((k, v), n1 + n2))
    }
}

/// A single WAL record.
#[derive(Debug)]
enum CheckpointEvent {
    Update { dataset_id: String, sample_id: String },
    MarkComplete { dataset_id: String },
}

impl Encode for CheckpointEvent {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            CheckpointEvent::Update { dataset_id, sample_id } => {
                0u32.encode_to(buf)?;
                dataset_id.encode_to(buf)?;
                sample_id.encode_to(buf)?;
            }
            CheckpointEvent::MarkComplete { dataset_id } => {
                1u32.encode_to(buf)?;
                dataset_id.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl Decode for CheckpointEvent {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u32::decode_from(buf)?;
        let event = match tag {
            0 => {
                let (dataset_id, n) = String::decode_from(&buf[offset..])?;
                offset += n;
                let (sample_id, n) = String::decode_from(&buf[offset..])?;
                offset += n;
                CheckpointEvent::Update { dataset_id, sample_id }
            }
            1 => {
                let (dataset_id, n) = String::decode_from(&buf[offset..])?;
                offset += n;
                CheckpointEvent::MarkComplete { dataset_id }
            }
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: other,
                    type_name: "CheckpointEvent",
                });
            }
        };
        Ok((event, offset))
    }
}

struct CheckpointSnapshot {
    data: CheckpointData,
    checksum: u32,
}

impl Encode for CheckpointSnapshot {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.data.encode_to(buf)?;
        self.checksum.encode_to(buf)
    }
}

impl Decode for CheckpointSnapshot {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (data, n1) = CheckpointData::decode_from(buf)?;
        let (checksum, n2) = u32::decode_from(&buf[n1..])?;
        Ok((Self { data, checksum }, n1 + n2))
    }
}

// ------------------------------------------------------------------------------------------------
// CheckpointStore
// ------------------------------------------------------------------------------------------------

/// Durable per-dataset resume pointer and completion flag.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    wal: Wal<CheckpointEvent>,
    data: Mutex<CheckpointData>,
}

impl CheckpointStore {
    /// Open (or create) the checkpoint store rooted at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let snapshot_path = path.join(SNAPSHOT_FILENAME);
        let mut data = CheckpointData::default();
        if snapshot_path.exists() {
            match read_snapshot(&snapshot_path) {
                Ok(snap) => data = snap,
                Err(e) => {
                    warn!(
                        path = %snapshot_path.display(),
                        error = %e,
                        "checkpoint snapshot unreadable, replaying WAL from scratch"
                    );
                }
            }
        }

        let wal = Wal::<CheckpointEvent>::open(path.join(WAL_FILENAME), None)?;
        let mut store = Self {
            path,
            wal,
            data: Mutex::new(data),
        };
        store.replay()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, CheckpointData>, CheckpointError> {
        self.data
            .lock()
            .map_err(|_| CheckpointError::Internal("mutex poisoned".into()))
    }

    fn replay(&mut self) -> Result<(), CheckpointError> {
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
                    warn!(error = %e, "checkpoint WAL replay stopped on error");
                    break;
                }
            }
        }
        info!(path = %self.path.display(), records = count, "checkpoint WAL replayed");
        Ok(())
    }

    /// Record `sample_id` as the last sample committed for `dataset_id`.
    pub fn update(&self, dataset_id: &str, sample_id: &str) -> Result<(), CheckpointError> {
        let event = CheckpointEvent::Update {
            dataset_id: dataset_id.to_string(),
            sample_id: sample_id.to_string(),
        };
        self.wal.append(&event)?;
        let mut guard = self.lock()?;
        apply(&mut guard, &event);
        Ok(())
    }

    /// Mark `dataset_id` as fully consumed.
    pub fn mark_complete(&self, dataset_id: &str) -> Result<(), CheckpointError> {
        let event = CheckpointEvent::MarkComplete {
            dataset_id: dataset_id.to_string(),
        };
        self.wal.append(&event)?;
        let mut guard = self.lock()?;
        apply(&mut guard, &event);
        Ok(())
    }

    /// Whether `dataset_id` has been marked complete.
    pub fn is_complete(&self, dataset_id: &str) -> Result<bool, CheckpointError> {
        Ok(self
            .lock()?
            .datasets
            .get(dataset_id)
            .is_some_and(|p| p.completed))
    }

    /// The last committed sample id for `dataset_id`, if any progress has
    /// been recorded.
    pub fn resume_point(&self, dataset_id: &str) -> Result<Option<String>, CheckpointError> {
        Ok(self
            .lock()?
            .datasets
            .get(dataset_id)
            .and_then(|p| p.last_sample_id.clone()))
    }

    /// Write a full snapshot of the current state and truncate the WAL.
    pub fn compact(&mut self) -> Result<(), CheckpointError> {
        let data = self.lock()?.clone();
        let mut snapshot = CheckpointSnapshot { data, checksum: 0 };
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
        info!(path = %final_path.display(), "checkpoint snapshot written");
        Ok(())
    }
}

fn apply(data: &mut CheckpointData, event: &CheckpointEvent) {
    match event {
        CheckpointEvent::Update { dataset_id, sample_id } => {
            let progress = data.datasets.entry(dataset_id.clone()).or_default();
            progress.last_sample_id = Some(sample_id.clone());
        }
        CheckpointEvent::MarkComplete { dataset_id } => {
            data.datasets.entry(dataset_id.clone()).or_default().completed = true;
        }
    }
}

fn read_snapshot(path: &Path) -> Result<CheckpointData, CheckpointError> {
    let mut f = File::open(path)?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf)?;

    let (snap, _) = encoding::decode_from_slice::<CheckpointSnapshot>(&buf)?;
    let verify = CheckpointSnapshot {
        data: snap.data.clone(),
        checksum: 0,
    };
    let verify_bytes = encoding::encode_to_vec(&verify)?;
    let mut hasher = Crc32::new();
    hasher.update(&verify_bytes);
    if hasher.finalize() != snap.checksum {
        return Err(CheckpointError::SnapshotChecksumMismatch);
    }
    Ok(snap.data)
}
