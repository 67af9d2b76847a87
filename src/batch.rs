//! Batched output tensors and the assembler that builds them.
//!
//! A [`Batch`] holds one [`FeatureTensor`] per declared feature, all with the
//! same outer (batch) dimension:
//!
//! - dense features become a `[B, ...shape]` row-major buffer
//! - var-len features become flat values plus `B + 1` row splits and a padded
//!   `dense_shape` of `[B, max_len, ...trailing]`
//! - sparse features become a coordinate list with the batch index prepended
//!   to every coordinate
//!
//! Features are assembled independently, in parallel on the rayon pool.

use crate::error::{Error, Result};
use crate::plan::{CompiledFeature, FeatureKind, FeaturePlan};
use crate::values::{DTypeMismatch, Element, FeatureColumn, ParsedRecord, Values};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Rectangular `[B, ...shape]` tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseTensor {
    pub shape: Vec<usize>,
    pub values: Values,
}

impl DenseTensor {
    #[must_use]
    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        self.values.as_slice()
    }
}

/// Coordinate-list sparse tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseTensor {
    /// Row-major `[nnz, rank]` coordinates; column 0 is the batch index.
    pub indices: Vec<i64>,
    pub values: Values,
    /// `[B, ...dense_size]`.
    pub dense_shape: Vec<usize>,
}

impl SparseTensor {
    /// Coordinates per entry (`K + 1`).
    #[must_use]
    pub fn rank(&self) -> usize {
        self.dense_shape.len()
    }

    #[must_use]
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Coordinates of entry `i`.
    #[must_use]
    pub fn index_row(&self, i: usize) -> Option<&[i64]> {
        let rank = self.rank();
        self.indices.get(i * rank..(i + 1) * rank)
    }

    pub fn index_rows(&self) -> impl Iterator<Item = &[i64]> {
        self.indices.chunks_exact(self.rank().max(1))
    }
}

/// Variable-length tensor stored as flat values plus row splits.
#[derive(Debug, Clone, PartialEq)]
pub struct RaggedTensor {
    pub values: Values,
    /// Prefix sums of the per-record outer lengths; `B + 1` entries.
    pub row_splits: Vec<usize>,
    /// `[B, max_len, ...trailing]`.
    pub dense_shape: Vec<usize>,
}

impl RaggedTensor {
    pub fn row_lengths(&self) -> impl Iterator<Item = usize> + '_ {
        self.row_splits.windows(2).map(|w| w[1].saturating_sub(w[0]))
    }

    /// Flat values of record `row`, or `None` if `row` is out of range or the
    /// splits do not fit the values.
    #[must_use]
    pub fn row(&self, row: usize) -> Option<Values> {
        let start = *self.row_splits.get(row)?;
        let end = *self.row_splits.get(row + 1)?;
        let inner: usize = self.dense_shape.iter().skip(2).product();
        slice_values(&self.values, start.checked_mul(inner)?, end.checked_mul(inner)?)
    }
}

fn slice_values(values: &Values, start: usize, end: usize) -> Option<Values> {
    Some(match values {
        Values::Bool(v) => Values::Bool(v.get(start..end)?.to_vec()),
        Values::Int32(v) => Values::Int32(v.get(start..end)?.to_vec()),
        Values::Int64(v) => Values::Int64(v.get(start..end)?.to_vec()),
        Values::Float32(v) => Values::Float32(v.get(start..end)?.to_vec()),
        Values::Float64(v) => Values::Float64(v.get(start..end)?.to_vec()),
        Values::String(v) => Values::String(v.get(start..end)?.to_vec()),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeatureTensor {
    Dense(DenseTensor),
    Sparse(SparseTensor),
    VarLen(RaggedTensor),
}

impl FeatureTensor {
    /// Outer dimension of the tensor.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        match self {
            Self::Dense(t) => t.shape.first().copied().unwrap_or(0),
            Self::Sparse(t) => t.dense_shape.first().copied().unwrap_or(0),
            Self::VarLen(t) => t.row_splits.len().saturating_sub(1),
        }
    }

    #[must_use]
    pub fn values(&self) -> &Values {
        match self {
            Self::Dense(t) => &t.values,
            Self::Sparse(t) => &t.values,
            Self::VarLen(t) => &t.values,
        }
    }
}

/// One assembled mini-batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    size: usize,
    features: BTreeMap<String, FeatureTensor>,
}

impl Batch {
    /// Number of records in this batch.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FeatureTensor> {
        self.features.get(name)
    }

    #[must_use]
    pub fn dense(&self, name: &str) -> Option<&DenseTensor> {
        match self.features.get(name)? {
            FeatureTensor::Dense(t) => Some(t),
            _ => None,
        }
    }

    #[must_use]
    pub fn sparse(&self, name: &str) -> Option<&SparseTensor> {
        match self.features.get(name)? {
            FeatureTensor::Sparse(t) => Some(t),
            _ => None,
        }
    }

    #[must_use]
    pub fn var_len(&self, name: &str) -> Option<&RaggedTensor> {
        match self.features.get(name)? {
            FeatureTensor::VarLen(t) => Some(t),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FeatureTensor)> {
        self.features.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn feature_names(&self) -> impl Iterator<Item = &str> {
        self.features.keys().map(String::as_str)
    }
}

/// Packs parsed records into a [`Batch`].
#[derive(Debug, Clone)]
pub struct BatchAssembler {
    plan: Arc<FeaturePlan>,
}

impl BatchAssembler {
    #[must_use]
    pub fn new(plan: Arc<FeaturePlan>) -> Self {
        Self { plan }
    }

    /// Assemble `records`, in order, into one batch.
    ///
    /// # Errors
    /// - `Shape` if var-len records disagree on their trailing dimensions
    /// - `Range` if a sparse coordinate falls outside `dense_size`
    /// - `Parse` if a record lacks a dense value and the feature has no default
    pub fn assemble(&self, records: &[ParsedRecord]) -> Result<Batch> {
        let tensors = self
            .plan
            .features()
            .par_iter()
            .enumerate()
            .map(|(i, feature)| {
                assemble_feature(i, feature, records).map(|t| (feature.name.clone(), t))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Batch {
            size: records.len(),
            features: tensors,
        })
    }
}

fn column_of<'r>(record: &'r ParsedRecord, index: usize, name: &str) -> Result<&'r FeatureColumn> {
    record
        .columns
        .get(index)
        .ok_or_else(|| Error::parse(&record.origin, name, "record has no column for feature"))
}

fn assemble_feature(
    index: usize,
    feature: &CompiledFeature,
    records: &[ParsedRecord],
) -> Result<FeatureTensor> {
    let name = feature.name.as_str();
    let batch = records.len();
    let mismatch = |record: &ParsedRecord| {
        Error::parse(&record.origin, name, "record column does not match feature kind")
    };
    let wrong_dtype =
        |record: &ParsedRecord, e: DTypeMismatch| Error::type_error(&record.origin, name, e.to_string());

    match &feature.kind {
        FeatureKind::Dense { shape, default, .. } => {
            let row_len: usize = shape.iter().product();
            let mut values = Values::with_capacity(feature.dtype, batch * row_len);
            for record in records {
                let appended = match column_of(record, index, name)? {
                    FeatureColumn::Dense(row) => values.append(row.clone()),
                    FeatureColumn::DenseDefault => match default {
                        Some(d) if d.len() == row_len => values.extend_repeated(d, 1),
                        Some(d) => values.extend_repeated(d, row_len),
                        None => {
                            return Err(Error::parse(
                                &record.origin,
                                name,
                                "value is missing and the feature has no default",
                            ));
                        }
                    },
                    _ => return Err(mismatch(record)),
                };
                appended.map_err(|e| wrong_dtype(record, e))?;
            }
            let mut full_shape = Vec::with_capacity(shape.len() + 1);
            full_shape.push(batch);
            full_shape.extend_from_slice(shape);
            Ok(FeatureTensor::Dense(DenseTensor {
                shape: full_shape,
                values,
            }))
        }
        FeatureKind::VarLen { rank, .. } => {
            let mut values = Values::empty(feature.dtype);
            let mut row_splits = Vec::with_capacity(batch + 1);
            row_splits.push(0);
            let mut max_len = 0;
            let mut trailing: Option<&[usize]> = None;
            for record in records {
                let FeatureColumn::VarLen { values: row, shape } = column_of(record, index, name)? else {
                    return Err(mismatch(record));
                };
                let outer = shape.first().copied().unwrap_or(0);
                if outer > 0 {
                    let inner = &shape[1..];
                    match trailing {
                        None => trailing = Some(inner),
                        Some(seen) if seen != inner => {
                            return Err(Error::shape(
                                &record.origin,
                                name,
                                format!("trailing dimensions {inner:?} differ from {seen:?} earlier in the batch"),
                            ));
                        }
                        Some(_) => {}
                    }
                }
                max_len = max_len.max(outer);
                row_splits.push(row_splits[row_splits.len() - 1] + outer);
                values.append(row.clone()).map_err(|e| wrong_dtype(record, e))?;
            }
            let mut dense_shape = Vec::with_capacity(rank + 1);
            dense_shape.push(batch);
            dense_shape.push(max_len);
            match trailing {
                Some(inner) => dense_shape.extend_from_slice(inner),
                None => dense_shape.resize(rank + 1, 0),
            }
            Ok(FeatureTensor::VarLen(RaggedTensor {
                values,
                row_splits,
                dense_shape,
            }))
        }
        FeatureKind::Sparse { dense_size, .. } => {
            let rank = dense_size.len() + 1;
            let mut indices = Vec::new();
            let mut values = Values::empty(feature.dtype);
            for (row, record) in records.iter().enumerate() {
                let FeatureColumn::Sparse {
                    indices: index_vectors,
                    values: row_values,
                } = column_of(record, index, name)?
                else {
                    return Err(mismatch(record));
                };
                let nnz = row_values.len();
                indices.reserve(nnz * rank);
                for j in 0..nnz {
                    indices.push(row as i64);
                    for (k, (vector, &limit)) in index_vectors.iter().zip(dense_size).enumerate() {
                        let idx = vector.get(j).copied().ok_or_else(|| {
                            Error::shape(&record.origin, name, format!("index path {k} is shorter than the values"))
                        })?;
                        if idx < 0 || idx as u64 >= limit as u64 {
                            return Err(Error::range(
                                &record.origin,
                                name,
                                format!("index {idx} in dimension {k} is outside [0, {limit})"),
                            ));
                        }
                        indices.push(idx);
                    }
                }
                values.append(row_values.clone()).map_err(|e| wrong_dtype(record, e))?;
            }
            let mut shape = Vec::with_capacity(rank);
            shape.push(batch);
            shape.extend_from_slice(dense_size);
            Ok(FeatureTensor::Sparse(SparseTensor {
                indices,
                values,
                dense_shape: shape,
            }))
        }
    }
}
