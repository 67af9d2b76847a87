//! Testing utilities for ironfeed pipelines.
//!
//! - **Writer**: [`AvroFileWriter`] produces real Object Container Files with
//!   any registered block codec, so tests exercise the same framing and
//!   decompression paths as production data.
//! - **Fixtures**: generators for the standard end-to-end scenarios (dense
//!   scalars, sparse id/price lists, variable-length token lists) plus helpers
//!   for damaging files on disk.
//!
//! # Quick Start
//!
//! ```no_run
//! use ironfeed::testing::*;
//! use ironfeed::{PipelineConfig, RecordDataset};
//!
//! # fn main() -> anyhow::Result<()> {
//! let dir = tempfile::tempdir()?;
//! write_dense_files(dir.path(), 4, 2048)?;
//! let config = PipelineConfig {
//!     file_pattern: dir.path().join("*.avro").display().to_string().into(),
//!     reader_schema: DENSE_SCHEMA.to_string(),
//!     features: dense_features(),
//!     batch_size: 512,
//!     ..PipelineConfig::default()
//! };
//! let batches = RecordDataset::new(config)?.iter()?.collect::<ironfeed::Result<Vec<_>>>()?;
//! assert_eq!(batches.len(), 4);
//! # Ok(())
//! # }
//! ```

pub mod fixtures;
pub mod writer;

pub use fixtures::*;
pub use writer::{AvroFileWriter, WrittenFile};
