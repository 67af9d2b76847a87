//! Pipeline configuration.
//!
//! [`PipelineConfig`] can be built in code or loaded from JSON. Every field
//! except `file_pattern`, `reader_schema`, `features`, and `batch_size` has a
//! default, so a minimal file looks like:
//!
//! ```json
//! {
//!   "file_pattern": "data/*.avro",
//!   "reader_schema": "{\"type\":\"record\",\"name\":\"R\",\"fields\":[{\"name\":\"x\",\"type\":\"long\"}]}",
//!   "features": {"x": {"kind": "dense", "dtype": "int64", "shape": []}},
//!   "batch_size": 128
//! }
//! ```
//!
//! Concurrency knobs accept either a positive integer or the string
//! `"autotune"`; see [`Parallelism`].

use crate::error::{Error, Result};
use crate::features::FeatureMap;
use crate::io::container::DEFAULT_MAX_BLOCK_SIZE;
use crate::io::glob::ShardPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Shuffle buffer size used when shuffling is on but no size was given.
pub const DEFAULT_SHUFFLE_BUFFER_SIZE: usize = 10_000;
/// Read-ahead per open file.
pub const DEFAULT_READER_BUFFER_SIZE: usize = 1 << 20;
/// Autotune never opens more files at once than this.
pub const MAX_AUTOTUNE_READS: usize = 16;

/// One glob pattern or a list of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilePattern {
    One(String),
    Many(Vec<String>),
}

impl FilePattern {
    #[must_use]
    pub fn patterns(&self) -> Vec<String> {
        match self {
            Self::One(p) => vec![p.clone()],
            Self::Many(ps) => ps.clone(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Self::One(p) => p.is_empty(),
            Self::Many(ps) => ps.iter().all(String::is_empty),
        }
    }
}

impl Default for FilePattern {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl From<&str> for FilePattern {
    fn from(pattern: &str) -> Self {
        Self::One(pattern.to_string())
    }
}

impl From<String> for FilePattern {
    fn from(pattern: String) -> Self {
        Self::One(pattern)
    }
}

impl From<Vec<String>> for FilePattern {
    fn from(patterns: Vec<String>) -> Self {
        Self::Many(patterns)
    }
}

/// A concurrency knob: a fixed count, or left to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "ParallelismRepr", into = "ParallelismRepr")]
pub enum Parallelism {
    #[default]
    Autotune,
    Fixed(usize),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ParallelismRepr {
    Count(usize),
    Marker(String),
}

impl TryFrom<ParallelismRepr> for Parallelism {
    type Error = String;

    fn try_from(repr: ParallelismRepr) -> std::result::Result<Self, String> {
        match repr {
            ParallelismRepr::Count(n) => Ok(Self::Fixed(n)),
            ParallelismRepr::Marker(m) if m.eq_ignore_ascii_case("autotune") => Ok(Self::Autotune),
            ParallelismRepr::Marker(m) => Err(format!("expected a count or \"autotune\", found \"{m}\"")),
        }
    }
}

impl From<Parallelism> for ParallelismRepr {
    fn from(p: Parallelism) -> Self {
        match p {
            Parallelism::Autotune => Self::Marker("autotune".to_string()),
            Parallelism::Fixed(n) => Self::Count(n),
        }
    }
}

impl fmt::Display for Parallelism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Autotune => f.write_str("autotune"),
            Self::Fixed(n) => write!(f, "{n}"),
        }
    }
}

impl Parallelism {
    /// The fixed value, or `auto` for [`Parallelism::Autotune`].
    #[must_use]
    pub fn resolve(self, auto: usize) -> usize {
        match self {
            Self::Autotune => auto.max(1),
            Self::Fixed(n) => n,
        }
    }
}

/// What to do with a record that fails to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMode {
    /// Stop the pipeline on the first bad record.
    #[default]
    FailFast,
    /// Log a warning and drop the record.
    LogAndContinue,
    /// Drop the record silently; it is still counted in the metrics.
    SkipInvalid,
}

/// Everything needed to build a [`RecordDataset`](crate::RecordDataset).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub file_pattern: FilePattern,
    /// Reader schema as Avro JSON.
    pub reader_schema: String,
    pub features: FeatureMap,
    pub batch_size: usize,
    pub drop_remainder: bool,
    /// `None` repeats forever.
    pub num_epochs: Option<u64>,
    pub shuffle: bool,
    pub shuffle_buffer_size: Option<usize>,
    pub shuffle_seed: Option<u64>,
    pub num_parallel_reads: Parallelism,
    pub num_parallel_calls: Parallelism,
    pub cycle_length: Parallelism,
    pub block_length: Parallelism,
    pub reader_buffer_size: usize,
    /// Largest block payload accepted, stored or decompressed, in bytes.
    pub max_block_size: usize,
    /// Ready batches kept ahead of the consumer.
    pub prefetch_buffer_size: usize,
    pub deterministic: bool,
    pub error_mode: ErrorMode,
    pub worker_index: usize,
    pub worker_count: usize,
    pub shard_policy: ShardPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            file_pattern: FilePattern::default(),
            reader_schema: String::new(),
            features: FeatureMap::new(),
            batch_size: 0,
            drop_remainder: false,
            num_epochs: Some(1),
            shuffle: false,
            shuffle_buffer_size: None,
            shuffle_seed: None,
            num_parallel_reads: Parallelism::Autotune,
            num_parallel_calls: Parallelism::Autotune,
            cycle_length: Parallelism::Autotune,
            block_length: Parallelism::Autotune,
            reader_buffer_size: DEFAULT_READER_BUFFER_SIZE,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            prefetch_buffer_size: 2,
            deterministic: true,
            error_mode: ErrorMode::FailFast,
            worker_index: 0,
            worker_count: 1,
            shard_policy: ShardPolicy::RoundRobin,
        }
    }
}

impl PipelineConfig {
    /// Parse a JSON configuration.
    ///
    /// # Errors
    /// `Config` if the JSON is malformed or has fields of the wrong type.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::config(format!("invalid pipeline config: {e}")))
    }

    /// Read a JSON configuration file.
    ///
    /// # Errors
    /// `Io` if the file cannot be read, otherwise as [`PipelineConfig::from_json_str`].
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_json_str(&text)
    }

    /// Check option values that do not depend on the file system.
    ///
    /// # Errors
    /// `Config` describing the first invalid option.
    pub fn validate(&self) -> Result<()> {
        if self.file_pattern.is_empty() {
            return Err(Error::config("file_pattern must name at least one pattern"));
        }
        if self.reader_schema.trim().is_empty() {
            return Err(Error::config("reader_schema is required"));
        }
        if self.features.is_empty() {
            return Err(Error::config("features must declare at least one feature"));
        }
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be at least 1"));
        }
        if self.num_epochs == Some(0) {
            return Err(Error::config("num_epochs must be at least 1 (or null for unbounded)"));
        }
        for (name, knob) in [
            ("num_parallel_reads", self.num_parallel_reads),
            ("num_parallel_calls", self.num_parallel_calls),
            ("cycle_length", self.cycle_length),
            ("block_length", self.block_length),
        ] {
            if knob == Parallelism::Fixed(0) {
                return Err(Error::config(format!("{name} must be at least 1 or \"autotune\"")));
            }
        }
        if self.reader_buffer_size == 0 {
            return Err(Error::config("reader_buffer_size must be greater than 0"));
        }
        if self.max_block_size == 0 {
            return Err(Error::config("max_block_size must be greater than 0"));
        }
        if self.worker_count == 0 {
            return Err(Error::config("worker_count must be at least 1"));
        }
        if self.worker_index >= self.worker_count {
            return Err(Error::config(format!(
                "worker_index {} must be below worker_count {}",
                self.worker_index, self.worker_count
            )));
        }
        Ok(())
    }

    /// Shuffle buffer capacity in records; 0 when shuffling is off.
    #[must_use]
    pub fn effective_shuffle_buffer_size(&self) -> usize {
        if self.shuffle {
            self.shuffle_buffer_size.unwrap_or(DEFAULT_SHUFFLE_BUFFER_SIZE)
        } else {
            0
        }
    }

    /// Resolve the concurrency knobs for a shard of `files` files.
    ///
    /// Every file in the cycle has its own reader thread, so a fixed
    /// `num_parallel_reads` caps `cycle_length`. The resolved `parallel_reads`
    /// is the number of readers actually kept open.
    #[must_use]
    pub fn resolve_parallelism(&self, files: usize) -> ResolvedParallelism {
        let cpus = num_cpus::get().max(1);
        let reads = self
            .num_parallel_reads
            .resolve(cpus.min(files).min(MAX_AUTOTUNE_READS));
        let mut cycle_length = self.cycle_length.resolve(reads);
        if let Parallelism::Fixed(limit) = self.num_parallel_reads {
            cycle_length = cycle_length.min(limit);
        }
        ResolvedParallelism {
            parallel_reads: cycle_length,
            parallel_calls: self.num_parallel_calls.resolve(cpus),
            cycle_length,
            block_length: self.block_length.resolve(1),
        }
    }
}

/// Concurrency knobs after autotune.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedParallelism {
    pub parallel_reads: usize,
    pub parallel_calls: usize,
    pub cycle_length: usize,
    pub block_length: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{DType, FeatureSpec};

    fn minimal() -> PipelineConfig {
        PipelineConfig {
            file_pattern: "data/*.avro".into(),
            reader_schema: r#"{"type":"record","name":"R","fields":[{"name":"x","type":"long"}]}"#.into(),
            features: [("x".to_string(), FeatureSpec::dense(DType::Int64, []))].into(),
            batch_size: 4,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn loads_json_with_defaults() {
        let config = PipelineConfig::from_json_str(
            r#"{
                "file_pattern": ["a/*.avro", "b/*.avro"],
                "reader_schema": "{}",
                "features": {"x": {"kind": "dense", "dtype": "int64", "shape": []}},
                "batch_size": 32,
                "num_parallel_calls": 4,
                "cycle_length": "autotune",
                "num_epochs": null,
                "error_mode": "log_and_continue"
            }"#,
        )
        .unwrap();
        assert_eq!(config.file_pattern.patterns(), vec!["a/*.avro", "b/*.avro"]);
        assert_eq!(config.num_parallel_calls, Parallelism::Fixed(4));
        assert_eq!(config.cycle_length, Parallelism::Autotune);
        assert_eq!(config.num_epochs, None);
        assert_eq!(config.error_mode, ErrorMode::LogAndContinue);
        assert_eq!(config.prefetch_buffer_size, 2);
        assert_eq!(config.reader_buffer_size, DEFAULT_READER_BUFFER_SIZE);
        assert!(config.deterministic);
    }

    #[test]
    fn rejects_bad_parallelism_marker() {
        let err = PipelineConfig::from_json_str(r#"{"num_parallel_reads": "lots"}"#).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Config);
    }

    #[test]
    fn validate_catches_each_bad_option() {
        assert!(minimal().validate().is_ok());
        let cases: Vec<Box<dyn Fn(&mut PipelineConfig)>> = vec![
            Box::new(|c: &mut PipelineConfig| c.batch_size = 0),
            Box::new(|c: &mut PipelineConfig| c.file_pattern = FilePattern::Many(vec![])),
            Box::new(|c: &mut PipelineConfig| c.reader_schema.clear()),
            Box::new(|c: &mut PipelineConfig| c.features.clear()),
            Box::new(|c: &mut PipelineConfig| c.num_epochs = Some(0)),
            Box::new(|c: &mut PipelineConfig| c.cycle_length = Parallelism::Fixed(0)),
            Box::new(|c: &mut PipelineConfig| c.max_block_size = 0),
            Box::new(|c: &mut PipelineConfig| c.worker_index = 1),
        ];
        for mutate in cases {
            let mut config = minimal();
            mutate(&mut config);
            assert_eq!(config.validate().unwrap_err().kind(), crate::ErrorKind::Config);
        }
    }

    #[test]
    fn autotune_resolution() {
        let mut config = minimal();
        let resolved = config.resolve_parallelism(1);
        assert_eq!(resolved.parallel_reads, 1);
        assert_eq!(resolved.cycle_length, 1);
        assert_eq!(resolved.block_length, 1);
        assert_eq!(resolved.parallel_calls, num_cpus::get().max(1));

        config.num_parallel_reads = Parallelism::Fixed(3);
        config.block_length = Parallelism::Fixed(8);
        let resolved = config.resolve_parallelism(100);
        assert_eq!((resolved.parallel_reads, resolved.cycle_length, resolved.block_length), (3, 3, 8));
    }

    #[test]
    fn fixed_reads_cap_the_cycle() {
        let mut config = minimal();
        config.num_parallel_reads = Parallelism::Fixed(1);
        config.cycle_length = Parallelism::Fixed(4);
        let resolved = config.resolve_parallelism(10);
        assert_eq!((resolved.parallel_reads, resolved.cycle_length), (1, 1));

        // Autotuned reads follow an explicit cycle.
        config.num_parallel_reads = Parallelism::Autotune;
        let resolved = config.resolve_parallelism(10);
        assert_eq!((resolved.parallel_reads, resolved.cycle_length), (4, 4));
    }

    #[test]
    fn shuffle_buffer_defaults_only_when_enabled() {
        let mut config = minimal();
        assert_eq!(config.effective_shuffle_buffer_size(), 0);
        config.shuffle = true;
        assert_eq!(config.effective_shuffle_buffer_size(), DEFAULT_SHUFFLE_BUFFER_SIZE);
        config.shuffle_buffer_size = Some(0);
        assert_eq!(config.effective_shuffle_buffer_size(), 0);
    }
}
