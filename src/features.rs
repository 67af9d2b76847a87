//! Feature declarations: what each output column is and where it comes from.
//!
//! A feature map is a `BTreeMap<String, FeatureSpec>`; the key is the output
//! name. By default a feature reads the reader-schema field with the same
//! name; [`FeatureSpec::at`] points it at any path (see [`crate::plan`] for
//! the path grammar).
//!
//! ```
//! use ironfeed::{DType, FeatureMap, FeatureSpec};
//!
//! let mut features = FeatureMap::new();
//! features.insert("age".into(), FeatureSpec::dense(DType::Int32, []).with_default(-1));
//! features.insert("tokens".into(), FeatureSpec::var_len(DType::String, 1));
//! features.insert(
//!     "clicks".into(),
//!     FeatureSpec::sparse(DType::Float32, ["item_ids"], "weights", [4000]),
//! );
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt;

/// Element type of an output column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bool => "bool",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::String => "string",
        })
    }
}

/// Output feature name to its declaration.
pub type FeatureMap = BTreeMap<String, FeatureSpec>;

/// Declaration of one output column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureSpec {
    /// Fixed shape per record. An empty shape is a scalar.
    Dense {
        dtype: DType,
        shape: Vec<usize>,
        /// Scalar (broadcast) or one value per element, used when the record
        /// has no value for this feature.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_value: Option<Json>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    /// Coordinate-list feature addressed by one or more integer index paths.
    Sparse {
        dtype: DType,
        index_paths: Vec<String>,
        value_path: String,
        dense_size: Vec<usize>,
    },
    /// Variable-length tensor whose outer dimension varies per record.
    VarLen {
        dtype: DType,
        rank: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
}

impl FeatureSpec {
    pub fn dense(dtype: DType, shape: impl IntoIterator<Item = usize>) -> Self {
        Self::Dense {
            dtype,
            shape: shape.into_iter().collect(),
            default_value: None,
            path: None,
        }
    }

    pub fn var_len(dtype: DType, rank: usize) -> Self {
        Self::VarLen {
            dtype,
            rank,
            path: None,
        }
    }

    pub fn sparse<I, S>(
        dtype: DType,
        index_paths: I,
        value_path: impl Into<String>,
        dense_size: impl IntoIterator<Item = usize>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Sparse {
            dtype,
            index_paths: index_paths.into_iter().map(Into::into).collect(),
            value_path: value_path.into(),
            dense_size: dense_size.into_iter().collect(),
        }
    }

    /// Set the default for a dense feature. Ignored for other kinds.
    #[must_use]
    pub fn with_default(mut self, value: impl Into<Json>) -> Self {
        if let Self::Dense { default_value, .. } = &mut self {
            *default_value = Some(value.into());
        }
        self
    }

    /// Read this feature from `path` instead of the field named like the feature.
    /// Ignored for sparse features, which name their paths explicitly.
    #[must_use]
    pub fn at(mut self, new_path: impl Into<String>) -> Self {
        match &mut self {
            Self::Dense { path, .. } | Self::VarLen { path, .. } => *path = Some(new_path.into()),
            Self::Sparse { .. } => {}
        }
        self
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Dense { dtype, .. } | Self::Sparse { dtype, .. } | Self::VarLen { dtype, .. } => {
                *dtype
            }
        }
    }

    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Dense { .. } => "dense",
            Self::Sparse { .. } => "sparse",
            Self::VarLen { .. } => "var_len",
        }
    }
}
