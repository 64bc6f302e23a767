use crate::encoding::{self, EncodingError};
use crate::wal::{Wal, WalData, WalError};
use tracing_subscriber::EnvFilter;

/// WAL header CRC32 size in bytes.
pub const WAL_CRC32_SIZE: usize = std::mem::size_of::<u32>();

/// WAL header size in bytes (everything before records start), including
/// the header's own trailing CRC32.
pub const WAL_HDR_DISK_SIZE: usize = 16;

/// Dummy record used to verify WAL round-trips of a record type with
/// `Option` and `bool` fields.
#[derive(Debug, PartialEq)]
pub struct EventRecord {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub sequence: u64,
    pub tombstone: bool,
}

impl encoding::Encode for EventRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::Encode::encode_to(&self.key, buf)?;
        encoding::Encode::encode_to(&self.value, buf)?;
        encoding::Encode::encode_to(&self.sequence, buf)?;
        encoding::Encode::encode_to(&self.tombstone, buf)?;
        Ok(())
    }
}

impl encoding::Decode for EventRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (key, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (value, n) = <Option<Vec<u8>>>::decode_from(&buf[offset..])?;
        offset += n;
        let (sequence, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (tombstone, n) = bool::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                key,
                value,
                sequence,
                tombstone,
            },
            offset,
        ))
    }
}

/// Dummy record used to verify WAL round-trips of a structurally
/// different record type (string field, no optionals).
#[derive(Debug, PartialEq)]
pub struct IndexRecord {
    pub id: u64,
    pub name: String,
    pub created_at: u64,
}

impl encoding::Encode for IndexRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::Encode::encode_to(&self.id, buf)?;
        encoding::Encode::encode_to(&self.name, buf)?;
        encoding::Encode::encode_to(&self.created_at, buf)?;
        Ok(())
    }
}

impl encoding::Decode for IndexRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (id, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (name, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (created_at, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                id,
                name,
                created_at,
            },
            offset,
        ))
    }
}

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Replay every record from the WAL into a `Vec`.
pub fn collect_iter<T: WalData>(wal: &Wal<T>) -> Result<Vec<T>, WalError> {
    wal.replay_iter()?.collect()
}
