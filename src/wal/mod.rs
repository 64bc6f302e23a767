//! A single-segment write-ahead log shared by every durable store in the
//! pipeline (manifest, checkpoint, dedup ledger).
//!
//! Each store owns exactly one WAL file at a fixed path — there is no
//! segment rotation. A store compacts by writing a full-state snapshot
//! elsewhere and calling [`Wal::truncate`], which clears the log back to
//! just its header.
//!
//! # Frame format
//!
//! ```text
//! [header: magic(4) version(4) max_record_size(4) header_crc(4)]
//! [len(4) record_bytes(len) record_crc(4)]
//! [len(4) record_bytes(len) record_crc(4)]
//! ...
//! ```
//!
//! `record_crc` is a CRC32 over `len || record_bytes`. Both the header
//! and every record frame are checksummed independently, so a single
//! corrupted frame never invalidates frames written before it.
//!
//! Readers and writers share the file through one `Arc<Mutex<File>>`.
//! [`WalIter`] keeps its own logical read cursor and seeks to it before
//! every frame, so replay is safe to run concurrently with further
//! appends (it will simply not observe records appended after the
//! cursor passed them).

#[cfg(test)]
mod tests;

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};

const LEN_PREFIX_SIZE: usize = std::mem::size_of::<u32>();
const CRC_SIZE: usize = std::mem::size_of::<u32>();

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// The underlying file could not be read, written, or synced.
    #[error("wal io failure: {0}")]
    Io(#[from] io::Error),

    /// A record failed to serialize or deserialize.
    #[error("wal codec failure: {0}")]
    Encoding(#[from] EncodingError),

    /// A frame's stored checksum did not match its recomputed one.
    #[error("wal checksum verification failed")]
    ChecksumMismatch,

    /// A record was larger than the WAL's configured limit.
    #[error("record of {0} bytes exceeds the configured wal limit")]
    RecordTooLarge(usize),

    /// The file ended in the middle of a frame.
    #[error("wal record stream ended mid-frame")]
    UnexpectedEof,

    /// The file's header failed validation on open.
    #[error("wal header rejected: {0}")]
    InvalidHeader(String),

    /// The WAL's internal lock was poisoned by a panicking holder.
    #[error("wal internal error: {0}")]
    Internal(String),
}

/// Fixed-size metadata written once at the start of a WAL file.
#[derive(Debug)]
pub struct WalHeader {
    magic: [u8; 4],
    version: u32,
    max_record_size: u32,
}

impl WalHeader {
    /// 4-byte magic identifying a corpusforge WAL file.
    pub const MAGIC: [u8; 4] = *b"CFWL";

    /// Current on-disk format version.
    pub const VERSION: u32 = 1;

    /// Default per-record size ceiling (8 MiB) — generous enough for a
    /// batch of manifest entries or a dedup record without bounding
    /// sample payloads, which never pass through the WAL.
    pub const DEFAULT_MAX_RECORD_SIZE: u32 = 8 * 1024 * 1024;

    /// Encoded header size, excluding its trailing checksum.
    pub const ENCODED_SIZE: usize = 4 + 4 + 4;

    /// Total on-disk header size, including its trailing checksum.
    pub const HEADER_DISK_SIZE: usize = Self::ENCODED_SIZE + CRC_SIZE;

    fn new(max_record_size: u32) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            max_record_size,
        }
    }

    /// Serializes the header followed by its CRC32 in one buffer.
    fn to_disk_bytes(&self) -> Result<Vec<u8>, WalError> {
        let mut buf = encoding::encode_to_vec(self)?;
        let crc = checksum(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Parses and validates a header read together with its trailing
    /// checksum. Checks the checksum before the magic so a corrupted
    /// buffer is never misreported as a format mismatch.
    fn from_disk_bytes(bytes: &[u8]) -> Result<Self, WalError> {
        let (header_bytes, crc_bytes) = bytes.split_at(Self::ENCODED_SIZE);
        let stored = u32::from_le_bytes(crc_bytes.try_into().expect("fixed-size slice"));
        if checksum(header_bytes) != stored {
            return Err(WalError::InvalidHeader("header checksum mismatch".into()));
        }

        let (header, _) = encoding::decode_from_slice::<WalHeader>(header_bytes)?;
        if header.magic != Self::MAGIC {
            return Err(WalError::InvalidHeader("bad magic".into()));
        }
        if header.version != Self::VERSION {
            return Err(WalError::InvalidHeader(format!(
                "unsupported version {}",
                header.version
            )));
        }
        Ok(header)
    }
}

impl Encode for WalHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.magic.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.max_record_size.encode_to(buf)
    }
}

impl Decode for WalHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (magic, n) = <[u8; 4]>::decode_from(&buf[offset..])?;
        offset += n;
        let (version, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (max_record_size, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                magic,
                version,
                max_record_size,
            },
            offset,
        ))
    }
}

/// Marker trait for record types a [`Wal`] can store: encodable,
/// decodable, printable, and safe to move across the worker threads
/// that append to and replay a shared log.
pub trait WalData: Encode + Decode + std::fmt::Debug + Send + Sync {}
impl<T> WalData for T where T: Encode + Decode + std::fmt::Debug + Send + Sync {}

/// A single-segment, thread-safe write-ahead log for records of type `T`.
#[derive(Debug)]
pub struct Wal<T: WalData> {
    file: Arc<Mutex<File>>,
    path: PathBuf,
    header: WalHeader,
    _marker: PhantomData<T>,
}

impl<T: WalData> Wal<T> {
    /// Opens the WAL file at `path`, creating it (with a fresh header)
    /// if it does not already exist. `max_record_size` only takes effect
    /// on creation — an existing file keeps the limit it was created
    /// with.
    pub fn open<P: AsRef<Path>>(path: P, max_record_size: Option<u32>) -> Result<Self, WalError> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let header = if file.metadata()?.len() == 0 {
            Self::write_fresh_header(&mut file, max_record_size, path)?
        } else {
            Self::recover_header(&mut file, path)?
        };

        info!(path = %path.display(), max_record_size = header.max_record_size, "wal opened");

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            path: path.to_path_buf(),
            header,
            _marker: PhantomData,
        })
    }

    fn write_fresh_header(
        file: &mut File,
        max_record_size: Option<u32>,
        path: &Path,
    ) -> Result<WalHeader, WalError> {
        let header = WalHeader::new(max_record_size.unwrap_or(WalHeader::DEFAULT_MAX_RECORD_SIZE));
        file.write_all(&header.to_disk_bytes()?)?;
        file.sync_all()?;
        info!(path = %path.display(), "wal header written");
        Ok(header)
    }

    fn recover_header(file: &mut File, path: &Path) -> Result<WalHeader, WalError> {
        file.seek(SeekFrom::Start(0))?;
        let mut disk_bytes = vec![0u8; WalHeader::HEADER_DISK_SIZE];
        file.read_exact(&mut disk_bytes)?;
        let header = WalHeader::from_disk_bytes(&disk_bytes)?;
        debug!(path = %path.display(), "wal header recovered");
        Ok(header)
    }

    /// Appends one record. The frame is serialized into a single buffer
    /// and written with one `write_all` + `sync_all`, so a concurrent
    /// reader never observes a partially-written frame.
    pub fn append(&self, record: &T) -> Result<(), WalError> {
        let payload = encoding::encode_to_vec(record)?;
        let len = u32::try_from(payload.len()).map_err(|_| WalError::RecordTooLarge(payload.len()))?;
        if len > self.header.max_record_size {
            return Err(WalError::RecordTooLarge(len as usize));
        }

        let mut frame = Vec::with_capacity(LEN_PREFIX_SIZE + payload.len() + CRC_SIZE);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        let crc = checksum(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());

        let mut file = self.lock_file()?;
        file.write_all(&frame)?;
        file.sync_all()?;

        trace!(len, crc = format_args!("{crc:08x}"), "wal record appended");
        Ok(())
    }

    /// Returns an iterator replaying every valid record from just past
    /// the header onward.
    pub fn replay_iter(&self) -> Result<WalIter<T>, WalError> {
        debug!(path = %self.path.display(), "wal replay starting");
        Ok(WalIter {
            file: Arc::clone(&self.file),
            cursor: WalHeader::HEADER_DISK_SIZE as u64,
            max_record_size: self.header.max_record_size as usize,
            _marker: PhantomData,
        })
    }

    /// Clears every record, leaving only the header behind. Callers use
    /// this after a full-state snapshot has been persisted elsewhere.
    pub fn truncate(&mut self) -> Result<(), WalError> {
        let header_bytes = self.header.to_disk_bytes()?;
        let mut file = self.lock_file()?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header_bytes)?;
        file.sync_all()?;
        info!(path = %self.path.display(), "wal truncated");
        Ok(())
    }

    fn lock_file(&self) -> Result<MutexGuard<'_, File>, WalError> {
        self.file
            .lock()
            .map_err(|_| WalError::Internal("wal mutex poisoned".into()))
    }
}

impl<T: WalData> Drop for Wal<T> {
    /// Best-effort flush on drop — `append`/`truncate` already sync
    /// after every call, so this only guards against a file handle
    /// that was mutated some other way before being dropped.
    fn drop(&mut self) {
        let synced = match self.file.lock() {
            Ok(file) => file.sync_all(),
            Err(poisoned) => poisoned.into_inner().sync_all(),
        };
        if let Err(e) = synced {
            error!(path = %self.path.display(), error = %e, "wal sync on drop failed");
        }
    }
}

/// Sequential reader over a WAL's records, produced by [`Wal::replay_iter`].
///
/// Holds its own `Arc` on the file, so it may safely outlive the [`Wal`]
/// that produced it.
pub struct WalIter<T: WalData> {
    file: Arc<Mutex<File>>,
    cursor: u64,
    max_record_size: usize,
    _marker: PhantomData<T>,
}

impl<T: WalData> std::fmt::Debug for WalIter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalIter")
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl<T: WalData> WalIter<T> {
    /// Reads and verifies the frame at the current cursor, returning its
    /// record bytes and advancing the cursor past it. `Ok(None)` means a
    /// clean end of file with no partial frame left behind.
    fn read_verified_frame(&mut self) -> Result<Option<Vec<u8>>, WalError> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| WalError::Internal("wal mutex poisoned".into()))?;
        file.seek(SeekFrom::Start(self.cursor))?;

        let mut len_bytes = [0u8; LEN_PREFIX_SIZE];
        match file.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(WalError::Io(e)),
        }

        let record_len = u32::from_le_bytes(len_bytes) as usize;
        if record_len > self.max_record_size {
            return Err(WalError::RecordTooLarge(record_len));
        }

        // Record bytes and trailing checksum read as one frame tail.
        let mut tail = vec![0u8; record_len + CRC_SIZE];
        if let Err(e) = file.read_exact(&mut tail) {
            warn!(cursor = self.cursor, len = record_len, "wal frame truncated");
            return Err(if e.kind() == io::ErrorKind::UnexpectedEof {
                WalError::UnexpectedEof
            } else {
                WalError::Io(e)
            });
        }
        self.cursor = file.stream_position()?;
        drop(file);

        let (record_bytes, crc_bytes) = tail.split_at(record_len);
        let stored_crc = u32::from_le_bytes(crc_bytes.try_into().expect("fixed-size slice"));

        let mut checked = Vec::with_capacity(len_bytes.len() + record_len);
        checked.extend_from_slice(&len_bytes);
        checked.extend_from_slice(record_bytes);
        if checksum(&checked) != stored_crc {
            warn!(cursor = self.cursor, len = record_len, "wal frame checksum mismatch");
            return Err(WalError::ChecksumMismatch);
        }

        Ok(Some(record_bytes.to_vec()))
    }
}

impl<T: WalData> Iterator for WalIter<T> {
    type Item = Result<T, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_verified_frame() {
            Ok(None) => {
                trace!(cursor = self.cursor, "wal replay reached end of file");
                None
            }
            Ok(Some(record_bytes)) => Some(
                encoding::decode_from_slice::<T>(&record_bytes)
                    .map(|(record, _)| record)
                    .map_err(WalError::Encoding),
            ),
            Err(e) => Some(Err(e)),
        }
    }
}

/// CRC32 over a single contiguous buffer.
fn checksum(bytes: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(bytes);
    hasher.finalize()
}
