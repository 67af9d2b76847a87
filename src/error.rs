//! Error types surfaced by the ingestion pipeline.
//!
//! Every failure the pipeline can report maps to one [`ErrorKind`]. File-level
//! failures carry the offending path; record-level failures carry a
//! [`RecordOrigin`] and the name of the feature being extracted.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Where a record came from: file, block, and position inside the block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOrigin {
    pub path: Arc<Path>,
    pub block_index: u64,
    pub record_index: u64,
    /// Byte offset of the record inside the decompressed block.
    pub record_offset: usize,
}

impl fmt::Display for RecordOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} block {} record {} (offset {})",
            self.path.display(),
            self.block_index,
            self.record_index,
            self.record_offset
        )
    }
}

/// Plain discriminant of [`Error`], convenient for matching in callers and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Io,
    CorruptBlock,
    UnsupportedCodec,
    SchemaMismatch,
    Parse,
    Type,
    Shape,
    Range,
    Cancelled,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt block in '{path}': {message}")]
    CorruptBlock { path: PathBuf, message: String },

    #[error("Unsupported codec '{codec}' in '{path}'")]
    UnsupportedCodec { path: PathBuf, codec: String },

    #[error("Schema mismatch in '{path}': {message}")]
    SchemaMismatch { path: PathBuf, message: String },

    #[error("Parse error in feature '{feature}' at {origin}: {message}")]
    Parse {
        origin: RecordOrigin,
        feature: String,
        message: String,
    },

    #[error("Type error in feature '{feature}' at {origin}: {message}")]
    Type {
        origin: RecordOrigin,
        feature: String,
        message: String,
    },

    #[error("Shape error in feature '{feature}' at {origin}: {message}")]
    Shape {
        origin: RecordOrigin,
        feature: String,
        message: String,
    },

    #[error("Range error in feature '{feature}' at {origin}: {message}")]
    Range {
        origin: RecordOrigin,
        feature: String,
        message: String,
    },

    #[error("Pipeline was cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

// Convenience constructors
impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::CorruptBlock {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn unsupported_codec(path: impl Into<PathBuf>, codec: impl Into<String>) -> Self {
        Self::UnsupportedCodec {
            path: path.into(),
            codec: codec.into(),
        }
    }

    pub fn schema_mismatch(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn parse(origin: &RecordOrigin, feature: &str, message: impl Into<String>) -> Self {
        Self::Parse {
            origin: origin.clone(),
            feature: feature.to_string(),
            message: message.into(),
        }
    }

    pub fn type_error(origin: &RecordOrigin, feature: &str, message: impl Into<String>) -> Self {
        Self::Type {
            origin: origin.clone(),
            feature: feature.to_string(),
            message: message.into(),
        }
    }

    pub fn shape(origin: &RecordOrigin, feature: &str, message: impl Into<String>) -> Self {
        Self::Shape {
            origin: origin.clone(),
            feature: feature.to_string(),
            message: message.into(),
        }
    }

    pub fn range(origin: &RecordOrigin, feature: &str, message: impl Into<String>) -> Self {
        Self::Range {
            origin: origin.clone(),
            feature: feature.to_string(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config { .. } => ErrorKind::Config,
            Self::Io { .. } => ErrorKind::Io,
            Self::CorruptBlock { .. } => ErrorKind::CorruptBlock,
            Self::UnsupportedCodec { .. } => ErrorKind::UnsupportedCodec,
            Self::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            Self::Parse { .. } => ErrorKind::Parse,
            Self::Type { .. } => ErrorKind::Type,
            Self::Shape { .. } => ErrorKind::Shape,
            Self::Range { .. } => ErrorKind::Range,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// The file this error is attributed to, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Io { path, .. }
            | Self::CorruptBlock { path, .. }
            | Self::UnsupportedCodec { path, .. }
            | Self::SchemaMismatch { path, .. } => Some(path.as_path()),
            Self::Parse { origin, .. }
            | Self::Type { origin, .. }
            | Self::Shape { origin, .. }
            | Self::Range { origin, .. } => Some(&*origin.path),
            Self::Config { .. } | Self::Cancelled => None,
        }
    }

    /// The record this error is attributed to, if it is a record-level error.
    #[must_use]
    pub fn origin(&self) -> Option<&RecordOrigin> {
        match self {
            Self::Parse { origin, .. }
            | Self::Type { origin, .. }
            | Self::Shape { origin, .. }
            | Self::Range { origin, .. } => Some(origin),
            _ => None,
        }
    }

    /// The feature being extracted when a record-level error occurred.
    #[must_use]
    pub fn feature(&self) -> Option<&str> {
        match self {
            Self::Parse { feature, .. }
            | Self::Type { feature, .. }
            | Self::Shape { feature, .. }
            | Self::Range { feature, .. } => Some(feature),
            _ => None,
        }
    }

    /// Record-level errors raised while parsing; these may be skipped by
    /// [`ErrorMode`](crate::config::ErrorMode).
    #[must_use]
    pub fn is_record_level(&self) -> bool {
        self.origin().is_some()
    }
}
