//! Typed value buffers shared by parsed records and assembled tensors.

use crate::error::RecordOrigin;
use crate::features::DType;
use serde_json::Value as Json;
use thiserror::Error;

/// Two buffers of different dtypes were combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot append {found} values to a {expected} buffer")]
pub struct DTypeMismatch {
    pub expected: DType,
    pub found: DType,
}

/// One record's extracted features, aligned with the plan's feature order.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    pub origin: RecordOrigin,
    pub columns: Vec<FeatureColumn>,
}

/// One feature's values for a single record.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureColumn {
    /// Exactly `product(shape)` values.
    Dense(Values),
    /// No value in the record; the assembler writes the configured default.
    DenseDefault,
    /// Depth-first values plus this record's shape (outer length first).
    VarLen { values: Values, shape: Vec<usize> },
    /// One index vector per index path, each as long as `values`.
    Sparse {
        indices: Vec<Vec<i64>>,
        values: Values,
    },
}

/// A flat, homogeneously typed column of values.
#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    Bool(Vec<bool>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    String(Vec<String>),
}

macro_rules! dispatch {
    ($values:expr, $v:ident => $body:expr) => {
        match $values {
            Values::Bool($v) => $body,
            Values::Int32($v) => $body,
            Values::Int64($v) => $body,
            Values::Float32($v) => $body,
            Values::Float64($v) => $body,
            Values::String($v) => $body,
        }
    };
}

impl Values {
    #[must_use]
    pub fn with_capacity(dtype: DType, capacity: usize) -> Self {
        match dtype {
            DType::Bool => Self::Bool(Vec::with_capacity(capacity)),
            DType::Int32 => Self::Int32(Vec::with_capacity(capacity)),
            DType::Int64 => Self::Int64(Vec::with_capacity(capacity)),
            DType::Float32 => Self::Float32(Vec::with_capacity(capacity)),
            DType::Float64 => Self::Float64(Vec::with_capacity(capacity)),
            DType::String => Self::String(Vec::with_capacity(capacity)),
        }
    }

    #[must_use]
    pub fn empty(dtype: DType) -> Self {
        Self::with_capacity(dtype, 0)
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Bool(_) => DType::Bool,
            Self::Int32(_) => DType::Int32,
            Self::Int64(_) => DType::Int64,
            Self::Float32(_) => DType::Float32,
            Self::Float64(_) => DType::Float64,
            Self::String(_) => DType::String,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        dispatch!(self, v => v.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `other`, which must have the same dtype.
    ///
    /// # Errors
    /// [`DTypeMismatch`] if the dtypes differ; `self` is left unchanged.
    pub fn append(&mut self, other: Values) -> Result<(), DTypeMismatch> {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.extend(b),
            (Self::Int32(a), Self::Int32(b)) => a.extend(b),
            (Self::Int64(a), Self::Int64(b)) => a.extend(b),
            (Self::Float32(a), Self::Float32(b)) => a.extend(b),
            (Self::Float64(a), Self::Float64(b)) => a.extend(b),
            (Self::String(a), Self::String(b)) => a.extend(b),
            (a, b) => {
                return Err(DTypeMismatch {
                    expected: a.dtype(),
                    found: b.dtype(),
                });
            }
        }
        Ok(())
    }

    /// Append `other` `times` times (used for default rows).
    ///
    /// # Errors
    /// [`DTypeMismatch`] if the dtypes differ.
    pub fn extend_repeated(&mut self, other: &Values, times: usize) -> Result<(), DTypeMismatch> {
        fn repeat<T: Clone>(dst: &mut Vec<T>, src: &[T], times: usize) {
            dst.reserve(src.len() * times);
            for _ in 0..times {
                dst.extend_from_slice(src);
            }
        }
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => repeat(a, b, times),
            (Self::Int32(a), Self::Int32(b)) => repeat(a, b, times),
            (Self::Int64(a), Self::Int64(b)) => repeat(a, b, times),
            (Self::Float32(a), Self::Float32(b)) => repeat(a, b, times),
            (Self::Float64(a), Self::Float64(b)) => repeat(a, b, times),
            (Self::String(a), Self::String(b)) => repeat(a, b, times),
            (a, b) => {
                return Err(DTypeMismatch {
                    expected: a.dtype(),
                    found: b.dtype(),
                });
            }
        }
        Ok(())
    }

    /// Typed view of the buffer.
    #[must_use]
    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        T::slice(self)
    }

    /// Build a buffer of `dtype` from a JSON scalar or (nested) array,
    /// flattened in row-major order.
    ///
    /// # Errors
    /// Returns a message if an element does not fit `dtype`.
    pub fn from_json(dtype: DType, json: &Json) -> Result<Self, String> {
        let mut out = Self::empty(dtype);
        out.push_json(json)?;
        Ok(out)
    }

    fn push_json(&mut self, json: &Json) -> Result<(), String> {
        if let Json::Array(items) = json {
            for item in items {
                self.push_json(item)?;
            }
            return Ok(());
        }
        let dtype = self.dtype();
        let bad = || format!("default value {json} is not a valid {dtype:?}");
        match self {
            Self::Bool(v) => v.push(json.as_bool().ok_or_else(bad)?),
            Self::Int32(v) => v.push(
                json.as_i64()
                    .and_then(|n| i32::try_from(n).ok())
                    .ok_or_else(bad)?,
            ),
            Self::Int64(v) => v.push(json.as_i64().ok_or_else(bad)?),
            Self::Float32(v) => v.push(json.as_f64().ok_or_else(bad)? as f32),
            Self::Float64(v) => v.push(json.as_f64().ok_or_else(bad)?),
            Self::String(v) => v.push(json.as_str().ok_or_else(bad)?.to_string()),
        }
        Ok(())
    }
}

/// Rust element types that can live in a [`Values`] buffer.
pub trait Element: Clone + Send + Sync + 'static {
    const DTYPE: DType;

    fn slice(values: &Values) -> Option<&[Self]>;

    fn into_values(items: Vec<Self>) -> Values;
}

macro_rules! element {
    ($ty:ty, $variant:ident) => {
        impl Element for $ty {
            const DTYPE: DType = DType::$variant;

            fn slice(values: &Values) -> Option<&[Self]> {
                match values {
                    Values::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn into_values(items: Vec<Self>) -> Values {
                Values::$variant(items)
            }
        }

        impl From<Vec<$ty>> for Values {
            fn from(items: Vec<$ty>) -> Self {
                Values::$variant(items)
            }
        }
    };
}

element!(bool, Bool);
element!(i32, Int32);
element!(i64, Int64);
element!(f32, Float32);
element!(f64, Float64);
element!(String, String);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_defaults_flatten_row_major() {
        let v = Values::from_json(DType::Float32, &json!([[1.0, 2.0], [3.0, 4.5]])).unwrap();
        assert_eq!(v.as_slice::<f32>(), Some(&[1.0, 2.0, 3.0, 4.5][..]));
        assert!(Values::from_json(DType::Int32, &json!(1.5)).is_err());
        assert!(Values::from_json(DType::Int32, &json!(i64::MAX)).is_err());
        assert_eq!(
            Values::from_json(DType::String, &json!("n/a")).unwrap(),
            Values::String(vec!["n/a".into()])
        );
    }

    #[test]
    fn repeat_and_append() {
        let mut v = Values::empty(DType::Int64);
        v.extend_repeated(&Values::from(vec![7i64, 8]), 2).unwrap();
        v.append(Values::from(vec![9i64])).unwrap();
        assert_eq!(v.as_slice::<i64>(), Some(&[7, 8, 7, 8, 9][..]));
        assert!(v.as_slice::<i32>().is_none());
        assert_eq!(v.dtype(), i64::DTYPE);
    }

    #[test]
    fn mixing_dtypes_is_an_error_not_a_panic() {
        let mut v = Values::from(vec![1i64]);
        let err = v.append(Values::from(vec![2i32])).unwrap_err();
        assert_eq!(err, DTypeMismatch { expected: DType::Int64, found: DType::Int32 });
        let err = v.extend_repeated(&Values::String(vec!["x".into()]), 3).unwrap_err();
        assert_eq!(err.found, DType::String);
        assert_eq!(v.as_slice::<i64>(), Some(&[1][..]));
    }
}
