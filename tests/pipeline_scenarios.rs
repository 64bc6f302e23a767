//! Integration tests for the public pipeline API.
//!
//! These tests drive the full stack (`DatasetAdapter` -> `WorkerPool` ->
//! `ManifestStore`/`ShardWriter`/`CheckpointStore`, orchestrated by
//! `PipelineDriver`) through `corpusforge`'s public surface only. No
//! internal (non-`pub`) items are referenced.
//!
//! ## Coverage areas
//! - **S1** clean run: filter rejection, manifest/checkpoint/shard content
//! - **S2** resume: a killed run picks up where the checkpoint left off
//! - **S3** cross-batch dedup: identical content across batches, one survivor
//! - **S4** filter error isolation: one sample errors, its neighbors commit
//! - **S5** rollover: sample-count bound produces the expected shard sizes
//! - **S6** completion skip: a rerun of a completed dataset never touches the adapter

use std::io::Cursor;
use std::sync::Arc;

use tempfile::TempDir;

use corpusforge::adapter::{AdapterError, DatasetAdapter, VecAdapter};
use corpusforge::checkpoint::CheckpointStore;
use corpusforge::dedup::DedupStore;
use corpusforge::driver::{DatasetOutcome, PipelineConfig, PipelineDriver};
use corpusforge::filter::{ContentHashDedup, Filter, MinResolution};
use corpusforge::manifest::ManifestStore;
use corpusforge::pool::{FilterFactory, WorkerPool};
use corpusforge::sample::{ImageFormat, ImagePayload, Sample, SampleMeta};

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::new(width, height);
    let mut buf = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}

fn image_text_sample(sample_id: &str, width: u32, height: u32) -> Sample {
    Sample::ImageText {
        meta: SampleMeta::new("ds", sample_id),
        image: ImagePayload {
            bytes: png_bytes(width, height),
            format: ImageFormat::Png,
        },
        text: format!("caption {sample_id}"),
    }
}

fn text_sample(sample_id: &str) -> Sample {
    Sample::Text {
        meta: SampleMeta::new("ds", sample_id),
        text: format!("text {sample_id}"),
    }
}

struct MinResFactory {
    min_width: u32,
    min_height: u32,
}

impl FilterFactory for MinResFactory {
    fn build(&self) -> Result<Vec<Box<dyn Filter>>, String> {
        Ok(vec![Box::new(MinResolution::new(self.min_width, self.min_height))])
    }
}

struct DedupFactory {
    store: Arc<DedupStore>,
}

impl FilterFactory for DedupFactory {
    fn build(&self) -> Result<Vec<Box<dyn Filter>>, String> {
        Ok(vec![Box::new(ContentHashDedup::new(Arc::clone(&self.store)))])
    }
}

fn entry_names(shard_path: &std::path::Path) -> Vec<String> {
    use tar::Archive;
    let file = std::fs::File::open(shard_path).unwrap();
    let mut archive = Archive::new(file);
    let mut names: Vec<String> = archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn default_shard_config(dir: &std::path::Path) -> corpusforge::shard::ShardWriterConfig {
    corpusforge::shard::ShardWriterConfig {
        output_dir: dir.to_path_buf(),
        samples_per_shard: 100,
        target_shard_bytes: u64::MAX,
        image_format: ImageFormat::Jpeg,
    }
}

// ================================================================================================
// S1 — clean run
// ================================================================================================

/// # Scenario
/// One adapter emits three `ImageText` samples with resolutions
/// `(100,100),(50,50),(100,100)` through a `MinResolution(64,64)` filter.
///
/// # Expected
/// Manifest contains `(ds,"0")` and `(ds,"2")` only; checkpoint is
/// complete with `last_sample_id="2"`; the shard holds exactly the two
/// accepted samples' entries.
#[test]
fn s1_clean_run_rejects_the_undersized_sample() {
    let tmp = TempDir::new().unwrap();
    let samples = vec![
        image_text_sample("0", 100, 100),
        image_text_sample("1", 50, 50),
        image_text_sample("2", 100, 100),
    ];
    let adapter: Box<dyn DatasetAdapter> = Box::new(VecAdapter::new("ds", samples));

    let factory = MinResFactory {
        min_width: 64,
        min_height: 64,
    };
    let pool = WorkerPool::new(2, &factory);
    let manifest = ManifestStore::open(tmp.path().join("manifest")).unwrap();
    let checkpoint = CheckpointStore::open(tmp.path().join("checkpoint")).unwrap();
    let shard_dir = tmp.path().join("shards");
    let sink = corpusforge::shard::ShardWriter::open(default_shard_config(&shard_dir)).unwrap();

    let mut driver = PipelineDriver::new(
        vec![adapter],
        pool,
        manifest,
        checkpoint,
        Some(sink),
        PipelineConfig { batch_size: 10 },
    );

    let outcomes = driver.run().unwrap();
    assert_eq!(
        outcomes,
        vec![DatasetOutcome {
            dataset_id: "ds".to_string(),
            accepted: 2,
            rejected: 1,
            completed: true,
            skipped: false,
            stream_error: None,
        }]
    );
    drop(driver);

    let manifest = ManifestStore::open(tmp.path().join("manifest")).unwrap();
    assert_eq!(manifest.iter("ds").unwrap(), vec!["0", "2"]);

    let checkpoint = CheckpointStore::open(tmp.path().join("checkpoint")).unwrap();
    assert!(checkpoint.is_complete("ds").unwrap());
    assert_eq!(checkpoint.resume_point("ds").unwrap(), Some("2".to_string()));

    let shard = shard_dir.join("000000.tar");
    assert_eq!(
        entry_names(&shard),
        vec![
            "000000000.json".to_string(),
            "000000000.jpeg".to_string(),
            "000000000.txt".to_string(),
            "000000002.json".to_string(),
            "000000002.jpeg".to_string(),
            "000000002.txt".to_string(),
        ]
    );
}

// ================================================================================================
// S2 — resume
// ================================================================================================

/// # Scenario
/// As S1, but the driver is killed after the first batch of two samples
/// (`"0"`, `"1"`) is committed; the dataset is then rerun from scratch.
///
/// # Expected
/// The final manifest is identical to an uninterrupted run's; the rerun
/// only needs to re-evaluate sample `"2"` (samples `"0"`/`"1"` are
/// skipped by the adapter's resume offset).
#[test]
fn s2_resume_after_a_mid_run_kill_reaches_the_same_final_manifest() {
    let tmp = TempDir::new().unwrap();
    let manifest_path = tmp.path().join("manifest");
    let checkpoint_path = tmp.path().join("checkpoint");

    let factory = MinResFactory {
        min_width: 64,
        min_height: 64,
    };

    // First run: batch_size=2 so the first batch (samples "0","1") commits,
    // then we simulate a kill by simply stopping after that first run call
    // ends up blocked on nothing further to do — instead we model the kill
    // directly by truncating the adapter's view, matching what a resumed
    // process would see: everything up to the last committed batch is
    // already on disk, and the adapter starts delivering from there.
    {
        let samples = vec![image_text_sample("0", 100, 100), image_text_sample("1", 50, 50)];
        let adapter: Box<dyn DatasetAdapter> = Box::new(VecAdapter::new("ds", samples));
        let pool = WorkerPool::new(2, &factory);
        let manifest = ManifestStore::open(&manifest_path).unwrap();
        let checkpoint = CheckpointStore::open(&checkpoint_path).unwrap();

        let mut driver = PipelineDriver::new(
            vec![adapter],
            pool,
            manifest,
            checkpoint,
            None,
            PipelineConfig { batch_size: 2 },
        );
        let outcomes = driver.run().unwrap();
        // The dataset is NOT marked complete: this first call only ever sees
        // two of the three samples, mirroring a process killed right after
        // the first batch's checkpoint update but before the adapter handed
        // over sample "2".
        assert!(!outcomes[0].completed);
    }

    // Resumed run: the full three-sample stream, but the checkpoint now
    // causes the adapter to skip "0" and "1".
    {
        let samples = vec![
            image_text_sample("0", 100, 100),
            image_text_sample("1", 50, 50),
            image_text_sample("2", 100, 100),
        ];
        let adapter: Box<dyn DatasetAdapter> = Box::new(VecAdapter::new("ds", samples));
        let pool = WorkerPool::new(2, &factory);
        let manifest = ManifestStore::open(&manifest_path).unwrap();
        let checkpoint = CheckpointStore::open(&checkpoint_path).unwrap();

        let mut driver = PipelineDriver::new(
            vec![adapter],
            pool,
            manifest,
            checkpoint,
            None,
            PipelineConfig { batch_size: 10 },
        );
        let outcomes = driver.run().unwrap();
        assert!(outcomes[0].completed);
        // Only sample "2" was newly evaluated this run.
        assert_eq!(outcomes[0].accepted, 1);
        assert_eq!(outcomes[0].rejected, 0);
    }

    let manifest = ManifestStore::open(&manifest_path).unwrap();
    assert_eq!(manifest.iter("ds").unwrap(), vec!["0", "2"]);

    let checkpoint = CheckpointStore::open(&checkpoint_path).unwrap();
    assert!(checkpoint.is_complete("ds").unwrap());
    assert_eq!(checkpoint.resume_point("ds").unwrap(), Some("2".to_string()));
}

// ================================================================================================
// S3 — dedup across batches
// ================================================================================================

/// # Scenario
/// Two samples carrying identical image bytes land in different
/// batches (`batch_size=1`).
///
/// # Expected
/// The first is accepted, the second rejected as a duplicate; the dedup
/// store records exactly one hash.
#[test]
fn s3_dedup_rejects_the_second_occurrence_across_batches() {
    let tmp = TempDir::new().unwrap();
    let dedup = Arc::new(DedupStore::open(tmp.path().join("dedup")).unwrap());
    let factory = DedupFactory {
        store: Arc::clone(&dedup),
    };

    let bytes = png_bytes(32, 32);
    let samples = vec![
        Sample::Image {
            meta: SampleMeta::new("ds", "0"),
            image: ImagePayload {
                bytes: bytes.clone(),
                format: ImageFormat::Png,
            },
        },
        Sample::Image {
            meta: SampleMeta::new("ds", "1"),
            image: ImagePayload {
                bytes,
                format: ImageFormat::Png,
            },
        },
    ];
    let adapter: Box<dyn DatasetAdapter> = Box::new(VecAdapter::new("ds", samples));
    let pool = WorkerPool::new(1, &factory);
    let manifest = ManifestStore::open(tmp.path().join("manifest")).unwrap();
    let checkpoint = CheckpointStore::open(tmp.path().join("checkpoint")).unwrap();

    let mut driver = PipelineDriver::new(
        vec![adapter],
        pool,
        manifest,
        checkpoint,
        None,
        PipelineConfig { batch_size: 1 },
    );
    let outcomes = driver.run().unwrap();
    assert_eq!(outcomes[0].accepted, 1);
    assert_eq!(outcomes[0].rejected, 1);
    assert_eq!(dedup.len().unwrap(), 1);
}

// ================================================================================================
// S4 — filter error
// ================================================================================================

/// A filter that raises `FilterError` for exactly one configured sample id.
struct FailsOnId {
    bad_id: String,
}

impl Filter for FailsOnId {
    fn name(&self) -> &str {
        "fails_on_id"
    }

    fn apply(&self, sample: &Sample) -> Result<bool, corpusforge::filter::FilterError> {
        if sample.sample_id() == self.bad_id {
            Err(corpusforge::filter::FilterError::Failed {
                filter: self.name().to_string(),
                dataset_id: sample.dataset_id().to_string(),
                sample_id: sample.sample_id().to_string(),
                message: "synthetic failure".to_string(),
            })
        } else {
            Ok(true)
        }
    }
}

struct FailsOnIdFactory;

impl FilterFactory for FailsOnIdFactory {
    fn build(&self) -> Result<Vec<Box<dyn Filter>>, String> {
        Ok(vec![Box::new(FailsOnId {
            bad_id: "1".to_string(),
        })])
    }
}

/// # Scenario
/// A filter raises on sample `"1"` only, among three text samples.
///
/// # Expected
/// Samples `"0"` and `"2"` land in the manifest; `"1"` is absent; the
/// run itself completes successfully (a filter error rejects one
/// sample, it never aborts the dataset or the run).
#[test]
fn s4_a_filter_error_on_one_sample_rejects_only_that_sample() {
    let tmp = TempDir::new().unwrap();
    let samples = vec![text_sample("0"), text_sample("1"), text_sample("2")];
    let adapter: Box<dyn DatasetAdapter> = Box::new(VecAdapter::new("ds", samples));
    let pool = WorkerPool::new(1, &FailsOnIdFactory);
    let manifest = ManifestStore::open(tmp.path().join("manifest")).unwrap();
    let checkpoint = CheckpointStore::open(tmp.path().join("checkpoint")).unwrap();

    let mut driver = PipelineDriver::new(
        vec![adapter],
        pool,
        manifest,
        checkpoint,
        None,
        PipelineConfig { batch_size: 10 },
    );
    let outcomes = driver.run().unwrap();
    assert_eq!(outcomes[0].accepted, 2);
    assert_eq!(outcomes[0].rejected, 1);
    assert!(outcomes[0].completed);

    let manifest = ManifestStore::open(tmp.path().join("manifest")).unwrap();
    assert_eq!(manifest.iter("ds").unwrap(), vec!["0", "2"]);
}

// ================================================================================================
// S5 — rollover
// ================================================================================================

/// # Scenario
/// 2500 samples, `samples_per_shard=1000`, all pass every filter.
///
/// # Expected
/// Three shards are produced, sized 1000/1000/500.
#[test]
fn s5_rollover_produces_three_shards_sized_1000_1000_500() {
    let tmp = TempDir::new().unwrap();
    let samples: Vec<Sample> = (0..2500).map(|i| text_sample(&format!("{i:09}"))).collect();
    let adapter: Box<dyn DatasetAdapter> = Box::new(VecAdapter::new("ds", samples));
    let pool = WorkerPool::new(4, &PassAllFactory);
    let manifest = ManifestStore::open(tmp.path().join("manifest")).unwrap();
    let checkpoint = CheckpointStore::open(tmp.path().join("checkpoint")).unwrap();
    let shard_dir = tmp.path().join("shards");
    let sink = corpusforge::shard::ShardWriter::open(corpusforge::shard::ShardWriterConfig {
        output_dir: shard_dir.clone(),
        samples_per_shard: 1000,
        target_shard_bytes: u64::MAX,
        image_format: ImageFormat::Png,
    })
    .unwrap();

    let mut driver = PipelineDriver::new(
        vec![adapter],
        pool,
        manifest,
        checkpoint,
        Some(sink),
        PipelineConfig { batch_size: 500 },
    );
    let outcomes = driver.run().unwrap();
    assert_eq!(outcomes[0].accepted, 2500);

    let mut shard_files: Vec<_> = std::fs::read_dir(&shard_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    shard_files.sort();
    assert_eq!(shard_files.len(), 3);

    let sample_count = |path: &std::path::Path| entry_names(path).len() / 2; // .json + .txt per sample
    assert_eq!(sample_count(&shard_files[0]), 1000);
    assert_eq!(sample_count(&shard_files[1]), 1000);
    assert_eq!(sample_count(&shard_files[2]), 500);
}

struct PassAllFactory;

impl FilterFactory for PassAllFactory {
    fn build(&self) -> Result<Vec<Box<dyn Filter>>, String> {
        Ok(Vec::new())
    }
}

// ================================================================================================
// S6 — completion skip
// ================================================================================================

/// # Scenario
/// S1 is run to completion, then rerun with the same configuration.
///
/// # Expected
/// The rerun never touches the adapter (checkpoint already marks the
/// dataset complete) and the manifest is unchanged.
#[test]
fn s6_rerunning_a_completed_dataset_never_touches_the_adapter() {
    let tmp = TempDir::new().unwrap();
    let manifest_path = tmp.path().join("manifest");
    let checkpoint_path = tmp.path().join("checkpoint");
    let factory = MinResFactory {
        min_width: 64,
        min_height: 64,
    };

    {
        let samples = vec![
            image_text_sample("0", 100, 100),
            image_text_sample("1", 50, 50),
            image_text_sample("2", 100, 100),
        ];
        let adapter: Box<dyn DatasetAdapter> = Box::new(VecAdapter::new("ds", samples));
        let pool = WorkerPool::new(2, &factory);
        let manifest = ManifestStore::open(&manifest_path).unwrap();
        let checkpoint = CheckpointStore::open(&checkpoint_path).unwrap();
        let mut driver = PipelineDriver::new(
            vec![adapter],
            pool,
            manifest,
            checkpoint,
            None,
            PipelineConfig { batch_size: 10 },
        );
        driver.run().unwrap();
    }

    // An adapter that would panic if the driver ever polled its stream.
    struct PanicsIfPolled;
    impl DatasetAdapter for PanicsIfPolled {
        fn id(&self) -> &str {
            "ds"
        }
        fn stream(
            &self,
            _skip_count: Option<usize>,
        ) -> Box<dyn Iterator<Item = Result<Sample, AdapterError>> + Send + '_> {
            Box::new(std::iter::from_fn(
                || -> Option<Result<Sample, AdapterError>> {
                    panic!("completed dataset should never be streamed again")
                },
            ))
        }
    }

    let pool = WorkerPool::new(2, &factory);
    let manifest = ManifestStore::open(&manifest_path).unwrap();
    let checkpoint = CheckpointStore::open(&checkpoint_path).unwrap();
    let mut driver = PipelineDriver::new(
        vec![Box::new(PanicsIfPolled)],
        pool,
        manifest,
        checkpoint,
        None,
        PipelineConfig { batch_size: 10 },
    );
    let outcomes = driver.run().unwrap();
    assert!(outcomes[0].skipped);
    assert!(outcomes[0].completed);

    let manifest = ManifestStore::open(&manifest_path).unwrap();
    assert_eq!(manifest.iter("ds").unwrap(), vec!["0", "2"]);
}
