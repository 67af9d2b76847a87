//! # ironfeed
//!
//! A **parallel Avro ingestion pipeline** that turns Object Container Files into
//! fixed-size batches of typed training features.
//!
//! ## Key Features
//!
//! - **Declarative features** - dense, sparse (coordinate list) and variable-length
//!   columns addressed by paths into the record schema
//! - **Parallel reading** - files are interleaved across reader threads, records are
//!   decoded by a pool of parser workers
//! - **Deterministic by default** - a fixed configuration and seed always yields the
//!   same batches in the same order
//! - **Bounded memory** - every stage hands off through a bounded queue, so a slow
//!   consumer applies backpressure all the way to file reads
//! - **Precise errors** - record-level failures name the file, block, record and
//!   feature they came from
//! - **Pluggable codecs** - `null`, `deflate`, `snappy`, `zstd`, `bzip2` and `xz`
//!   (each behind a cargo feature), plus a registry for custom ones
//!
//! ## Quick Start
//!
//! ```no_run
//! use ironfeed::*;
//!
//! # fn main() -> anyhow::Result<()> {
//! let features: FeatureMap = [
//!     ("age".to_string(), FeatureSpec::dense(DType::Int32, []).with_default(0)),
//!     ("tokens".to_string(), FeatureSpec::var_len(DType::String, 1)),
//! ]
//! .into();
//!
//! let config = PipelineConfig {
//!     file_pattern: "data/train-*.avro".into(),
//!     reader_schema: std::fs::read_to_string("data/schema.avsc")?,
//!     features,
//!     batch_size: 128,
//!     ..PipelineConfig::default()
//! };
//!
//! let dataset = RecordDataset::new(config)?.shuffle(10_000, Some(42));
//! for batch in dataset.iter()? {
//!     let batch = batch?;
//!     let ages = batch.dense("age").and_then(|t| t.as_slice::<i32>());
//!     let tokens = batch.var_len("tokens");
//!     println!("{} records, ages={ages:?}, tokens={:?}", batch.size(), tokens.map(|t| &t.row_splits));
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Features
//!
//! A [`FeatureMap`] names each output column and declares it with a
//! [`FeatureSpec`]. At build time the map is compiled against the reader schema
//! into a [`plan::FeaturePlan`]; any path that does not resolve, or resolves to
//! an incompatible type, is reported as [`Error::Config`] before a file is read.
//!
//! ### Pipeline
//!
//! [`RecordDataset`] holds a validated configuration. Each call to
//! [`RecordDataset::iter`] returns a [`BatchIterator`] with its own threads:
//!
//! 1. a file iterator hands out this worker's shard, once per epoch
//! 2. a record stream interleaves blocks from `cycle_length` open files
//! 3. parser workers decode only the fields the plan needs
//! 4. an optional shuffle buffer permutes records
//! 5. the batch assembler stacks records into tensors
//! 6. a prefetcher keeps finished batches ready for the consumer
//!
//! Dropping the iterator cancels and joins every stage.
//!
//! ### Errors
//!
//! Every failure is an [`Error`]; [`Error::kind`] gives a plain [`ErrorKind`]
//! for matching. With [`ErrorMode::LogAndContinue`] or [`ErrorMode::SkipInvalid`]
//! records that fail to parse are dropped instead of ending the pipeline.
//!
//! ### Testing
//!
//! The [`testing`] module writes real container files and provides fixture
//! datasets, so pipelines can be tested end to end against temporary
//! directories.

pub mod batch;
pub mod config;
pub mod error;
pub mod features;
pub mod io;
pub mod metrics;
pub mod parser;
pub mod pipeline;
pub mod plan;
pub mod prefetch;
pub mod queue;
pub mod schema;
pub mod shuffle;
pub mod testing;
pub mod values;

// General re-exports
pub use batch::{Batch, BatchAssembler, DenseTensor, FeatureTensor, RaggedTensor, SparseTensor};
pub use config::{ErrorMode, FilePattern, Parallelism, PipelineConfig};
pub use error::{Error, ErrorKind, RecordOrigin, Result};
pub use features::{DType, FeatureMap, FeatureSpec};
pub use metrics::MetricsSnapshot;
pub use pipeline::{BatchIterator, CancelHandle, PipelineStatus, RecordDataset};
pub use schema::Schema;
pub use shuffle::ShuffleBuffer;
pub use values::{FeatureColumn, ParsedRecord, Values};
