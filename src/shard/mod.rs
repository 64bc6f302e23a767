//! Rolling sharded archive writer (C6).
//!
//! Writes accepted samples into a sequence of `NNNNNN.tar` archives
//! under a configured output directory, rolling over to the next shard
//! once either `samples_per_shard` or `target_shard_bytes` is reached.
//! Rollover is checked *after* writing a sample, so a shard may exceed
//! its byte target by at most one sample's worth of data. The next
//! shard file is only created lazily, on the first entry written to it,
//! so an exact-multiple sample count never leaves a trailing empty
//! shard on disk.


use std::fs::{self, File};
use std::io::{self, Cursor};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use image::DynamicImage;
use serde_json::{Map, Number, Value};
use tar::{Builder, Header};
use thiserror::Error;

use crate::sample::{AttrValue, ImageFormat, ImagePayload, Sample};

/// Errors raised while writing to a shard.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Failed to create the output directory, a shard file, or write to one.
    #[error("shard I/O error: {0}")]
    Io(#[from] io::Error),
    /// Failed to decode or re-encode a sample's image payload.
    #[error("failed to encode image payload: {0}")]
    ImageEncode(String),
    /// Failed to render a sample's attributes as JSON.
    #[error("failed to encode sample metadata: {0}")]
    Json(#[from] serde_json::Error),
    /// `write_batch` was called after `close`.
    #[error("shard writer is closed")]
    Closed,
}

/// Configuration for a [`ShardWriter`].
#[derive(Debug, Clone)]
pub struct ShardWriterConfig {
    /// Directory shard files are written into; created if absent.
    pub output_dir: PathBuf,
    /// Maximum samples per shard before rollover.
    pub samples_per_shard: usize,
    /// Target shard size in bytes; rollover is checked after each
    /// sample, so a shard may exceed this by at most one sample.
    pub target_shard_bytes: u64,
    /// Target encoding for image payloads written to the archive.
    pub image_format: ImageFormat,
}

/// Rolling `tar`-archive sink, numbered `000000.tar`, `000001.tar`, ...
pub struct ShardWriter {
    config: ShardWriterConfig,
    shard_index: u32,
    builder: Option<Builder<File>>,
    samples_in_shard: usize,
    bytes_in_shard: u64,
    fallback_key: u64,
}

impl ShardWriter {
    /// Create the output directory if absent and prepare shard index 0.
    /// The first shard file itself is created lazily on the first write.
    pub fn open(config: ShardWriterConfig) -> Result<Self, SinkError> {
        fs::create_dir_all(&config.output_dir)?;
        Ok(Self {
            config,
            shard_index: 0,
            builder: None,
            samples_in_shard: 0,
            bytes_in_shard: 0,
            fallback_key: 0,
        })
    }

    /// Append each sample to the current shard, rolling over to a new
    /// shard file whenever the configured sample or byte bound is hit.
    pub fn write_batch(&mut self, samples: &[Sample]) -> Result<(), SinkError> {
        for sample in samples {
            self.write_sample(sample)?;
        }
        Ok(())
    }

    /// Finish the current shard and flush counters. Consumes the writer.
    pub fn close(mut self) -> Result<(), SinkError> {
        self.finish_current_shard()
    }

    fn shard_path(&self) -> PathBuf {
        self.config
            .output_dir
            .join(format!("{:06}.tar", self.shard_index))
    }

    fn ensure_shard_open(&mut self) -> Result<&mut Builder<File>, SinkError> {
        if self.builder.is_none() {
            let file = File::create(self.shard_path())?;
            self.builder = Some(Builder::new(file));
            self.samples_in_shard = 0;
            self.bytes_in_shard = 0;
        }
        Ok(self.builder.as_mut().expect("just opened"))
    }

    fn write_sample(&mut self, sample: &Sample) -> Result<(), SinkError> {
        let key = shard_key(sample.sample_id(), &mut self.fallback_key);

        let json = attrs_json(sample)?;
        let mut written = self.append_entry(&format!("{key}.json"), &json)?;

        if let Some(image) = sample.image() {
            let encoded = reencode_image(image, self.config.image_format)?;
            let ext = self.config.image_format.extension();
            written += self.append_entry(&format!("{key}.{ext}"), &encoded)?;
        }
        if let Some(text) = sample.text() {
            written += self.append_entry(&format!("{key}.txt"), text.as_bytes())?;
        }

        self.samples_in_shard += 1;
        self.bytes_in_shard += written;

        if self.samples_in_shard >= self.config.samples_per_shard.max(1)
            || self.bytes_in_shard >= self.config.target_shard_bytes
        {
            self.roll_over()?;
        }

        Ok(())
    }

    fn append_entry(&mut self, name: &str, data: &[u8]) -> Result<u64, SinkError> {
        let builder = self.ensure_shard_open()?;
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(now_unix());
        header.set_cksum();
        builder.append_data(&mut header, name, Cursor::new(data))?;
        Ok(data.len() as u64)
    }

    fn roll_over(&mut self) -> Result<(), SinkError> {
        self.finish_current_shard()?;
        self.shard_index += 1;
        Ok(())
    }

    fn finish_current_shard(&mut self) -> Result<(), SinkError> {
        if let Some(mut builder) = self.builder.take() {
            builder.finish()?;
        }
        Ok(())
    }
}

impl Drop for ShardWriter {
    fn drop(&mut self) {
        let _ = self.finish_current_shard();
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Render the 9-digit zero-padded archive key for `sample_id`. Ids that
/// parse as a non-negative integer use that value directly (the
/// convention adapters are expected to follow); ids that don't fall
/// back to a monotonic counter local to this writer, so the archive
/// still gets stable, collision-free keys.
fn shard_key(sample_id: &str, fallback_key: &mut u64) -> String {
    match sample_id.parse::<u64>() {
        Ok(n) => format!("{n:09}"),
        Err(_) => {
            let key = *fallback_key;
            *fallback_key += 1;
            format!("{key:09}")
        }
    }
}

fn attrs_json(sample: &Sample) -> Result<Vec<u8>, SinkError> {
    let mut map = Map::new();
    for (key, value) in &sample.meta().attrs {
        map.insert(key.clone(), attr_to_json(value));
    }
    Ok(serde_json::to_vec(&Value::Object(map))?)
}

fn attr_to_json(value: &AttrValue) -> Value {
    match value {
        AttrValue::Null => Value::Null,
        AttrValue::Bool(b) => Value::Bool(*b),
        AttrValue::Int(i) => Value::Number(Number::from(*i)),
        AttrValue::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        AttrValue::Text(s) => Value::String(s.clone()),
    }
}

/// Decode a sample's image payload and re-encode it to `target`,
/// flattening any alpha channel before JPEG encoding (JPEG has no
/// alpha channel).
fn reencode_image(image: &ImagePayload, target: ImageFormat) -> Result<Vec<u8>, SinkError> {
    let source_format = to_image_format(image.format);
    let decoded = image::load_from_memory_with_format(&image.bytes, source_format)
        .map_err(|e| SinkError::ImageEncode(e.to_string()))?;

    let prepared = match target {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(decoded.to_rgb8()),
        ImageFormat::Png => decoded,
    };

    let mut buf = Vec::new();
    prepared
        .write_to(&mut Cursor::new(&mut buf), to_image_format(target))
        .map_err(|e| SinkError::ImageEncode(e.to_string()))?;
    Ok(buf)
}

fn to_image_format(format: ImageFormat) -> image::ImageFormat {
    match format {
        ImageFormat::Png => image::ImageFormat::Png,
        ImageFormat::Jpeg => image::ImageFormat::Jpeg,
    }
}
