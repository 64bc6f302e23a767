//! Hand-rolled binary codec used for every durable record in the crate:
//! manifest entries, checkpoint progress, dedup ledger rows, and the
//! sample metadata envelope. No `serde` or external codec sits on this
//! path — corpusforge owns the wire format outright, so a dependency
//! bump can never silently change what is already sitting on disk.
//!
//! # Layout
//!
//! ```text
//! u8            1 byte
//! u32 / u64     little-endian, 4 / 8 bytes
//! i64 / f64     little-endian, 8 bytes
//! bool          0x00 or 0x01
//! [u8; N]       N raw bytes, no length prefix
//! Vec<u8>       u32 len, then that many bytes
//! String        u32 len, then that many UTF-8 bytes
//! Option<T>     0x00, or 0x01 followed by T
//! Vec<T>        u32 count, then T repeated (see encode_vec/decode_vec)
//! enum          u32 discriminant, then the variant's fields
//! ```
//!
//! Every multi-byte field is little-endian; every length or count is a
//! `u32`. Enum framing is written by hand at each call site rather than
//! derived — see `ManifestEvent`, `CheckpointEvent`, `DedupEvent` for the
//! pattern.
//!
//! Decoders reject lengths and counts above [`MAX_BYTE_LEN`] /
//! [`MAX_VEC_ELEMENTS`] before allocating, so a truncated or adversarial
//! file can't be used to force an oversized allocation. Nothing in this
//! module panics; every failure mode comes back through [`EncodingError`].

#[cfg(test)]
mod tests;

use thiserror::Error;

/// Ceiling on a single `Vec<u8>`/`String` payload read from disk (256 MiB).
pub const MAX_BYTE_LEN: u32 = 256 * 1024 * 1024;

/// Ceiling on the element count of a decoded `Vec<T>` (16 M elements).
pub const MAX_VEC_ELEMENTS: u32 = 16 * 1024 * 1024;

/// Something went wrong turning bytes into a value, or a value into bytes.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// Ran off the end of the buffer before a field was fully read.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof {
        /// How many more bytes the field needed.
        needed: usize,
        /// How many bytes were actually left.
        available: usize,
    },

    /// An enum discriminant didn't match any known variant.
    #[error("invalid tag {tag} for {type_name}")]
    InvalidTag {
        /// The discriminant value as read off the wire.
        tag: u32,
        /// Name of the enum being decoded, for diagnostics.
        type_name: &'static str,
    },

    /// A `bool` byte was neither `0x00` nor `0x01`.
    #[error("invalid bool byte: 0x{0:02X} (expected 0x00 or 0x01)")]
    InvalidBool(u8),

    /// A `String` field's bytes weren't valid UTF-8.
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A decoded length or count exceeded its safety ceiling.
    #[error("length overflow: {0}")]
    LengthOverflow(String),

    /// Catch-all for codec failures raised above this module.
    #[error("{0}")]
    Custom(String),
}

/// Appends a deterministic byte representation of `self` to `buf`.
///
/// The same value must always produce the same bytes — callers rely on
/// this for checksumming and replay.
pub trait Encode {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// Reconstructs a value from the front of a byte slice.
///
/// Returns how many bytes were consumed alongside the value, so a caller
/// decoding several fields back-to-back can just keep slicing forward.
pub trait Decode: Sized {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError>;
}

/// Shorthand for `Encode`-then-collect into an owned buffer.
pub fn encode_to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    value.encode_to(&mut buf)?;
    Ok(buf)
}

/// Shorthand for decoding a single value starting at `buf[0]`.
pub fn decode_from_slice<T: Decode>(buf: &[u8]) -> Result<(T, usize), EncodingError> {
    T::decode_from(buf)
}

/// Read-only cursor over a decode buffer.
///
/// Exists so multi-field `Decode` impls (tuples, enums, structs) don't
/// have to thread a running `offset` by hand through a chain of
/// `buf[offset..]` slices — each `take`/`take_u32`/etc. call advances
/// the cursor itself and reports the bounds error consistently.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Consumes and returns the next `n` bytes, or an `UnexpectedEof`.
    fn take(&mut self, n: usize) -> Result<&'a [u8], EncodingError> {
        let rest = self.remaining();
        if rest.len() < n {
            return Err(EncodingError::UnexpectedEof {
                needed: n,
                available: rest.len(),
            });
        }
        let (head, _) = rest.split_at(n);
        self.pos += n;
        Ok(head)
    }

    /// Decodes one `T` from the cursor's current position.
    fn decode<T: Decode>(&mut self) -> Result<T, EncodingError> {
        let (value, consumed) = T::decode_from(self.remaining())?;
        self.pos += consumed;
        Ok(value)
    }
}

/// Casts a `usize` length down to the `u32` the wire format stores,
/// rejecting values that would silently truncate.
#[inline]
fn fit_u32(len: usize) -> Result<u32, EncodingError> {
    u32::try_from(len)
        .map_err(|_| EncodingError::LengthOverflow(format!("length {len} exceeds u32::MAX")))
}

impl Encode for u8 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(*self);
        Ok(())
    }
}

impl Decode for u8 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut cur = Cursor::new(buf);
        let byte = cur.take(1)?[0];
        Ok((byte, cur.pos))
    }
}

impl Encode for u32 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for u32 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut cur = Cursor::new(buf);
        let bytes = cur.take(4)?;
        let array: [u8; 4] = bytes.try_into().map_err(|_| {
            EncodingError::Custom("internal: 4-byte slice did not fit [u8; 4]".into())
        })?;
        Ok((u32::from_le_bytes(array), cur.pos))
    }
}

impl Encode for u64 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for u64 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut cur = Cursor::new(buf);
        let bytes = cur.take(8)?;
        let array: [u8; 8] = bytes.try_into().map_err(|_| {
            EncodingError::Custom("internal: 8-byte slice did not fit [u8; 8]".into())
        })?;
        Ok((u64::from_le_bytes(array), cur.pos))
    }
}

impl Encode for i64 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for i64 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut cur = Cursor::new(buf);
        let bytes = cur.take(8)?;
        let array: [u8; 8] = bytes.try_into().map_err(|_| {
            EncodingError::Custom("internal: 8-byte slice did not fit [u8; 8]".into())
        })?;
        Ok((i64::from_le_bytes(array), cur.pos))
    }
}

impl Encode for f64 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for f64 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut cur = Cursor::new(buf);
        let bytes = cur.take(8)?;
        let array: [u8; 8] = bytes.try_into().map_err(|_| {
            EncodingError::Custom("internal: 8-byte slice did not fit [u8; 8]".into())
        })?;
        Ok((f64::from_le_bytes(array), cur.pos))
    }
}

impl Encode for bool {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(u8::from(*self));
        Ok(())
    }
}

impl Decode for bool {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut cur = Cursor::new(buf);
        match cur.take(1)?[0] {
            0 => Ok((false, cur.pos)),
            1 => Ok((true, cur.pos)),
            other => Err(EncodingError::InvalidBool(other)),
        }
    }
}

impl<const N: usize> Encode for [u8; N] {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl<const N: usize> Decode for [u8; N] {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut cur = Cursor::new(buf);
        let bytes = cur.take(N)?;
        let mut array = [0u8; N];
        array.copy_from_slice(bytes);
        Ok((array, cur.pos))
    }
}

impl Encode for Vec<u8> {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        fit_u32(self.len())?.encode_to(buf)?;
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl Decode for Vec<u8> {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut cur = Cursor::new(buf);
        let len = cur.decode::<u32>()?;
        if len > MAX_BYTE_LEN {
            return Err(EncodingError::LengthOverflow(format!(
                "byte vector length {len} exceeds MAX_BYTE_LEN ({MAX_BYTE_LEN})"
            )));
        }
        let bytes = cur.take(len as usize)?.to_vec();
        Ok((bytes, cur.pos))
    }
}

impl Encode for String {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        fit_u32(self.len())?.encode_to(buf)?;
        buf.extend_from_slice(self.as_bytes());
        Ok(())
    }
}

impl Decode for String {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (raw, consumed) = Vec::<u8>::decode_from(buf)?;
        Ok((String::from_utf8(raw)?, consumed))
    }
}

impl<T: Encode> Encode for Option<T> {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            None => buf.push(0),
            Some(val) => {
                buf.push(1);
                val.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl<T: Decode> Decode for Option<T> {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut cur = Cursor::new(buf);
        match cur.take(1)?[0] {
            0 => Ok((None, cur.pos)),
            1 => {
                let val = cur.decode::<T>()?;
                Ok((Some(val), cur.pos))
            }
            other => Err(EncodingError::InvalidTag {
                tag: other as u32,
                type_name: "Option<T>",
            }),
        }
    }
}

/// Writes `items` as `u32` count followed by each element's own encoding.
///
/// `Vec<u8>` skips this in favor of its raw-bytes impl above; coherence
/// rules block a blanket `Vec<T>` impl that would overlap it, so callers
/// with `Vec<Struct>` fields call this free function directly instead.
pub fn encode_vec<T: Encode>(items: &[T], buf: &mut Vec<u8>) -> Result<(), EncodingError> {
    fit_u32(items.len())?.encode_to(buf)?;
    for item in items {
        item.encode_to(buf)?;
    }
    Ok(())
}

/// Inverse of [`encode_vec`]; rejects counts above [`MAX_VEC_ELEMENTS`]
/// before allocating the result vector.
pub fn decode_vec<T: Decode>(buf: &[u8]) -> Result<(Vec<T>, usize), EncodingError> {
    let mut cur = Cursor::new(buf);
    let count = cur.decode::<u32>()?;
    if count > MAX_VEC_ELEMENTS {
        return Err(EncodingError::LengthOverflow(format!(
            "vector element count {count} exceeds MAX_VEC_ELEMENTS ({MAX_VEC_ELEMENTS})"
        )));
    }
    let mut items = Vec::with_capacity((count as usize).min(4096));
    for _ in 0..count {
        items.push(cur.decode::<T>()?);
    }
    Ok((items, cur.pos))
}
