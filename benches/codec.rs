//! Micro-benchmarks for the sample wire codec (`corpusforge::sample`).
//!
//! Uses Criterion for statistically rigorous measurement with regression
//! detection and HTML reports.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench codec
//! cargo bench --bench codec -- encode
//! ```

use std::collections::BTreeMap;
use std::io::Cursor;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use corpusforge::sample::{self, AttrValue, ImageFormat, ImagePayload, Sample, SampleMeta};

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::new(width, height);
    let mut buf = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}

fn text_sample(len: usize) -> Sample {
    Sample::Text {
        meta: SampleMeta::new("bench-ds", "0"),
        text: "x".repeat(len),
    }
}

fn image_text_sample(width: u32, height: u32) -> Sample {
    let mut attrs = BTreeMap::new();
    attrs.insert("caption_len".to_string(), AttrValue::Int(12));
    Sample::ImageText {
        meta: SampleMeta {
            dataset_id: "bench-ds".to_string(),
            sample_id: "0".to_string(),
            attrs,
        },
        image: ImagePayload {
            bytes: png_bytes(width, height),
            format: ImageFormat::Png,
        },
        text: "a small picture".to_string(),
    }
}

/// Benchmark group for `sample::encode`.
///
/// # Sub-benchmarks
///
/// ## `text/{64B,1K,16K}`
///
/// **Scenario:** Encodes a `Text` sample whose payload is the given size.
///
/// **What it measures:** The length-prefix + UTF-8 copy cost of the
/// hand-written `Encode` trait, with no image payload in the mix.
///
/// **Expected behaviour:** Near-linear in payload size — `encode_vec`
/// writes a length prefix then copies the bytes once.
///
/// ## `image_text/{64x64,512x512}`
///
/// **Scenario:** Encodes an `ImageText` sample carrying a PNG-encoded
/// image at the given pixel dimensions.
///
/// **What it measures:** The cost of encoding the larger `Vec<u8>` image
/// payload alongside metadata and text, dominated by the `Vec<u8>` copy
/// rather than any per-field overhead.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for &(label, len) in &[("64B", 64), ("1K", 1024), ("16K", 16 * 1024)] {
        let sample = text_sample(len);
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_function(BenchmarkId::new("text", label), |b| {
            b.iter(|| black_box(sample::encode(black_box(&sample)).unwrap()));
        });
    }

    for &(label, w, h) in &[("64x64", 64, 64), ("512x512", 512, 512)] {
        let sample = image_text_sample(w, h);
        group.bench_function(BenchmarkId::new("image_text", label), |b| {
            b.iter(|| black_box(sample::encode(black_box(&sample)).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark group for `sample::decode`.
///
/// # Sub-benchmarks
///
/// ## `text/{64B,1K,16K}` and `image_text/{64x64,512x512}`
///
/// **Scenario:** Decodes the wire bytes produced by the matching
/// `bench_encode` case.
///
/// **What it measures:** Round-trip parity with encode cost — decode
/// additionally validates the variant tag and allocates the owned
/// `String`/`Vec<u8>` fields, so it is expected to run slightly slower
/// than the corresponding encode.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for &(label, len) in &[("64B", 64), ("1K", 1024), ("16K", 16 * 1024)] {
        let bytes = sample::encode(&text_sample(len)).unwrap();
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_function(BenchmarkId::new("text", label), |b| {
            b.iter(|| black_box(sample::decode(black_box(&bytes)).unwrap()));
        });
    }

    for &(label, w, h) in &[("64x64", 64, 64), ("512x512", 512, 512)] {
        let bytes = sample::encode(&image_text_sample(w, h)).unwrap();
        group.bench_function(BenchmarkId::new("image_text", label), |b| {
            b.iter(|| black_box(sample::decode(black_box(&bytes)).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
