//! # corpusforge
//!
//! A resumable ingestion pipeline that streams multimodal samples from
//! pluggable dataset adapters, filters them in parallel across a worker
//! pool, and commits accepted samples to a durable manifest and a rolling
//! sharded archive.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        PipelineDriver                        │
//! │                                                                │
//! │  adapter.stream()        WorkerPool                           │
//! │  ┌──────────────┐   ┌──────────────────────────┐             │
//! │  │ DatasetAdapter├──►│ W workers, private filter │             │
//! │  │   (C7)        │   │ chains built from         │             │
//! │  └──────────────┘   │ FilterFactory (C5/C8)      │             │
//! │                      └──────────┬────────────────┘             │
//! │                                 │ verdicts (input order)        │
//! │                                 ▼                               │
//! │        manifest.add_batch  →  sink.write_batch  →  checkpoint  │
//! │        (ManifestStore, C2)    (ShardWriter, C6)   (CheckpointStore, C3)│
//! └──────────────────────────────────────────────────────────────┘
//!            ▲                                          ▲
//!            │ WAL + snapshot                            │ WAL + snapshot
//!            └──────────────── DedupStore (C4) ───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`sample`] | Tagged-variant sample model and cross-worker codec |
//! | [`manifest`] | Durable set of accepted `(dataset_id, sample_id)` pairs |
//! | [`checkpoint`] | Durable per-dataset resume pointer and completion flag |
//! | [`dedup`] | Content-hash dedup store shared across workers |
//! | [`filter`] | Per-sample predicate contract and reference filters |
//! | [`pool`] | Parallel filter evaluation over batches |
//! | [`shard`] | Rolling tar archive writer |
//! | [`adapter`] | Resumable dataset source contract |
//! | [`driver`] | Orchestrates adapters, the worker pool, and the durable stores |
//! | [`wal`] | Generic, CRC-protected write-ahead log for crash recovery |
//! | [`encoding`] | Hand-written binary `Encode`/`Decode` traits |
//!
//! ## Key properties
//!
//! - **Crash-resumable.** The manifest, checkpoint, and dedup stores are
//!   each WAL-backed; a resumed run never skips a sample absent from the
//!   manifest (checkpoint commits strictly after manifest commits).
//! - **Order-preserving.** Filter evaluation is parallel, but verdicts are
//!   returned in the batch's original order and committed in that order.
//! - **Isolated filter state.** Each worker builds its own filter chain
//!   from a [`pool::FilterFactory`]; stateful cross-worker concerns (like
//!   deduplication) go through the explicit, thread-safe [`dedup::DedupStore`].
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use corpusforge::checkpoint::CheckpointStore;
//! use corpusforge::dedup::DedupStore;
//! use corpusforge::manifest::ManifestStore;
//!
//! let manifest = ManifestStore::open("/tmp/corpusforge-demo/manifest").unwrap();
//! let checkpoint = CheckpointStore::open("/tmp/corpusforge-demo/checkpoint").unwrap();
//! let dedup = DedupStore::open("/tmp/corpusforge-demo/dedup").unwrap();
//!
//! manifest.add_batch(&[("demo".to_string(), "0".to_string())]).unwrap();
//! assert!(manifest.exists("demo", "0").unwrap());
//!
//! checkpoint.update("demo", "0").unwrap();
//! checkpoint.mark_complete("demo").unwrap();
//! assert!(checkpoint.is_complete("demo").unwrap());
//!
//! assert!(dedup.check_and_insert("deadbeef", "demo", "0").unwrap());
//! assert!(!dedup.check_and_insert("deadbeef", "demo", "1").unwrap());
//! ```

#![allow(dead_code)]

pub mod adapter;
pub mod checkpoint;
pub mod dedup;
pub mod driver;
pub mod encoding;
pub mod filter;
pub mod manifest;
pub mod pool;
pub mod sample;
pub mod shard;
pub mod wal;
