//! Sample model & codec (C1).
//!
//! A [`Sample`] is a tagged-variant record — `Text`, `Image`, or
//! `ImageText` — carrying metadata plus the payload for its variant.
//! [`encode`]/[`decode`] provide a self-describing wire format used only
//! when a sample crosses the worker boundary (see [`crate::pool`]);
//! single-process callers pass samples by reference.
//!
//! The format is stable across a single deployment version only — no
//! on-disk storage relies on it. Archives use the human-readable layout
//! documented on [`crate::shard`].

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;

use thiserror::Error;

use crate::encoding::{self, Decode, Encode, EncodingError};

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Errors raised while encoding or decoding a [`Sample`].
#[derive(Debug, Error)]
pub enum CodecError {
    /// The payload's variant tag was unrecognised or its fields could not
    /// be parsed.
    #[error("corrupt sample payload: {0}")]
    CorruptSample(String),

    /// An image payload declared a format tag outside the supported set.
    #[error("unsupported image format tag: {0}")]
    UnsupportedFormat(u32),
}

impl From<EncodingError> for CodecError {
    fn from(e: EncodingError) -> Self {
        CodecError::CorruptSample(e.to_string())
    }
}

// ------------------------------------------------------------------------------------------------
// AttrValue — minimal closed value type standing in for `any`
// ------------------------------------------------------------------------------------------------

/// A single metadata attribute value.
///
/// A small closed enum stands in for the spec's `any` type. It is
/// convertible to JSON at the archive-writing boundary ([`crate::shard`])
/// without the binary codec depending on `serde_json`.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// Absence of a value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A floating-point number.
    Float(f64),
    /// A UTF-8 string.
    Text(String),
}

impl Encode for AttrValue {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            AttrValue::Null => 0u32.encode_to(buf)?,
            AttrValue::Bool(b) => {
                1u32.encode_to(buf)?;
                b.encode_to(buf)?;
            }
            AttrValue::Int(i) => {
                2u32.encode_to(buf)?;
                i.encode_to(buf)?;
            }
            AttrValue::Float(f) => {
                3u32.encode_to(buf)?;
                f.encode_to(buf)?;
            }
            AttrValue::Text(s) => {
                4u32.encode_to(buf)?;
                s.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl Decode for AttrValue {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u32::decode_from(buf)?;
        let value = match tag {
            0 => AttrValue::Null,
            1 => {
                let (b, n) = bool::decode_from(&buf[offset..])?;
                offset += n;
                AttrValue::Bool(b)
            }
            2 => {
                let (i, n) = i64::decode_from(&buf[offset..])?;
                offset += n;
                AttrValue::Int(i)
            }
            3 => {
                let (f, n) = f64::decode_from(&buf[offset..])?;
                offset += n;
                AttrValue::Float(f)
            }
            4 => {
                let (s, n) = String::decode_from(&buf[offset..])?;
                offset += n;
                AttrValue::Text(s)
            }
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: other,
                    type_name: "AttrValue",
                });
            }
        };
        Ok((value, offset))
    }
}

// ------------------------------------------------------------------------------------------------
// SampleMeta
// ------------------------------------------------------------------------------------------------

/// Metadata shared by every sample variant.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleMeta {
    /// Adapter-chosen stable identifier for the dataset this sample came from.
    pub dataset_id: String,
    /// Unique identifier within `dataset_id`.
    pub sample_id: String,
    /// Arbitrary key/value attributes attached to the sample.
    pub attrs: BTreeMap<String, AttrValue>,
}

impl SampleMeta {
    /// Construct metadata with an empty attribute map.
    pub fn new(dataset_id: impl Into<String>, sample_id: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            sample_id: sample_id.into(),
            attrs: BTreeMap::new(),
        }
    }
}

impl Encode for SampleMeta {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.dataset_id.encode_to(buf)?;
        self.sample_id.encode_to(buf)?;
        let entries: Vec<(String, AttrValue)> = self
            .attrs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        encoding::encode_vec(&entries, buf)?;
        Ok(())
    }
}

impl Encode for (String, AttrValue) {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.0.encode_to(buf)?;
        self.1.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for (String, AttrValue) {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (k, n1) = String::decode_from(buf)?;
        let (v, n2) = AttrValue::decode_from(&buf[n1..])?;
        Ok(((k, v), n1 + n2))
    }
}

impl Decode for SampleMeta {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (dataset_id, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (sample_id, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (entries, n) = encoding::decode_vec::<(String, AttrValue)>(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                dataset_id,
                sample_id,
                attrs: entries.into_iter().collect(),
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Image payload
// ------------------------------------------------------------------------------------------------

/// Target/source encoding of an image payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// Portable Network Graphics.
    Png,
    /// JPEG.
    Jpeg,
}

impl ImageFormat {
    /// The lowercase file extension used in archive entries.
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
        }
    }

    /// Identify the format of an encoded image from its leading magic
    /// bytes.
    ///
    /// Adapters (`crate::adapter`) call this on raw bytes pulled from a
    /// source dataset; a format outside the supported set is surfaced as
    /// [`CodecError::UnsupportedFormat`] so the caller can reject the one
    /// sample rather than aborting the whole stream.
    pub fn sniff(bytes: &[u8]) -> Result<Self, CodecError> {
        const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        const JPEG_MAGIC: [u8; 3] = [0xFF, 0xD8, 0xFF];

        if bytes.len() >= PNG_MAGIC.len() && bytes[..PNG_MAGIC.len()] == PNG_MAGIC {
            Ok(ImageFormat::Png)
        } else if bytes.len() >= JPEG_MAGIC.len() && bytes[..JPEG_MAGIC.len()] == JPEG_MAGIC {
            Ok(ImageFormat::Jpeg)
        } else {
            let tag = bytes.first().copied().unwrap_or(0) as u32;
            Err(CodecError::UnsupportedFormat(tag))
        }
    }
}

impl Encode for ImageFormat {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let tag: u32 = match self {
            ImageFormat::Png => 0,
            ImageFormat::Jpeg => 1,
        };
        tag.encode_to(buf)
    }
}

impl Decode for ImageFormat {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, n) = u32::decode_from(buf)?;
        let fmt = match tag {
            0 => ImageFormat::Png,
            1 => ImageFormat::Jpeg,
            other => return Err(EncodingError::InvalidTag { tag: other, type_name: "ImageFormat" }),
        };
        Ok((fmt, n))
    }
}

/// Raw image bytes together with their format tag.
///
/// `bytes` holds the encoded image file content (e.g. a PNG byte
/// stream), not raw pixel data — [`crate::shard`] decodes it on write if
/// a re-encode to a different target format is required.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePayload {
    /// Encoded image bytes.
    pub bytes: Vec<u8>,
    /// Format the bytes are encoded in.
    pub format: ImageFormat,
}

impl Encode for ImagePayload {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.bytes.encode_to(buf)?;
        self.format.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for ImagePayload {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (bytes, n1) = Vec::<u8>::decode_from(buf)?;
        let (format, n2) = ImageFormat::decode_from(&buf[n1..])?;
        Ok((Self { bytes, format }, n1 + n2))
    }
}

// ------------------------------------------------------------------------------------------------
// Sample — tagged union over the three variants
// ------------------------------------------------------------------------------------------------

/// A single ingested sample.
///
/// Every sample carries exactly one variant tag. `meta.sample_id` and
/// `meta.dataset_id` must be non-empty — adapters are responsible for
/// this invariant; the codec does not enforce it beyond preserving
/// whatever was encoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    /// Plain text sample.
    Text {
        /// Sample metadata.
        meta: SampleMeta,
        /// UTF-8 text payload.
        text: String,
    },
    /// Image-only sample.
    Image {
        /// Sample metadata.
        meta: SampleMeta,
        /// Image payload.
        image: ImagePayload,
    },
    /// Paired image and text sample.
    ImageText {
        /// Sample metadata.
        meta: SampleMeta,
        /// Image payload.
        image: ImagePayload,
        /// UTF-8 text payload.
        text: String,
    },
}

impl Sample {
    /// Borrow this sample's metadata regardless of variant.
    pub fn meta(&self) -> &SampleMeta {
        match self {
            Sample::Text { meta, .. } => meta,
            Sample::Image { meta, .. } => meta,
            Sample::ImageText { meta, .. } => meta,
        }
    }

    /// The dataset identifier of this sample.
    pub fn dataset_id(&self) -> &str {
        &self.meta().dataset_id
    }

    /// The sample identifier, unique within its dataset.
    pub fn sample_id(&self) -> &str {
        &self.meta().sample_id
    }

    /// The image payload of this sample, if it carries one.
    pub fn image(&self) -> Option<&ImagePayload> {
        match self {
            Sample::Text { .. } => None,
            Sample::Image { image, .. } => Some(image),
            Sample::ImageText { image, .. } => Some(image),
        }
    }

    /// The text payload of this sample, if it carries one.
    pub fn text(&self) -> Option<&str> {
        match self {
            Sample::Text { text, .. } => Some(text),
            Sample::Image { .. } => None,
            Sample::ImageText { text, .. } => Some(text),
        }
    }
}

const TAG_TEXT: u32 = 0;
const TAG_IMAGE: u32 = 1;
const TAG_IMAGE_TEXT: u32 = 2;

/// Encode a sample into its self-describing wire representation.
///
/// `[u32 tag][SampleMeta][variant fields…]`.
pub fn encode(sample: &Sample) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    match sample {
        Sample::Text { meta, text } => {
            TAG_TEXT.encode_to(&mut buf)?;
            meta.encode_to(&mut buf)?;
            text.encode_to(&mut buf)?;
        }
        Sample::Image { meta, image } => {
            TAG_IMAGE.encode_to(&mut buf)?;
            meta.encode_to(&mut buf)?;
            image.encode_to(&mut buf)?;
        }
        Sample::ImageText { meta, image, text } => {
            TAG_IMAGE_TEXT.encode_to(&mut buf)?;
            meta.encode_to(&mut buf)?;
            image.encode_to(&mut buf)?;
            text.encode_to(&mut buf)?;
        }
    }
    Ok(buf)
}

/// Decode a sample from its wire representation.
///
/// Exact inverse of [`encode`]: `decode(encode(s)) == s` for every valid
/// `s`. Fails with [`CodecError::CorruptSample`] when the tag is unknown
/// or a field cannot be parsed.
pub fn decode(bytes: &[u8]) -> Result<Sample, CodecError> {
    let (tag, mut offset) = u32::decode_from(bytes)?;
    let (meta, n) = SampleMeta::decode_from(&bytes[offset..])?;
    offset += n;

    let sample = match tag {
        TAG_TEXT => {
            let (text, _) = String::decode_from(&bytes[offset..])?;
            Sample::Text { meta, text }
        }
        TAG_IMAGE => {
            let (image, _) = ImagePayload::decode_from(&bytes[offset..])?;
            Sample::Image { meta, image }
        }
        TAG_IMAGE_TEXT => {
            let (image, n) = ImagePayload::decode_from(&bytes[offset..])?;
            offset += n;
            let (text, _) = String::decode_from(&bytes[offset..])?;
            Sample::ImageText { meta, image, text }
        }
        other => return Err(CodecError::CorruptSample(format!("unknown variant tag {other}"))),
    };

    Ok(sample)
}
