//! Pre-built schemas, feature maps and file generators for end-to-end tests.
//!
//! Every generator is deterministic: record `i` of a fixture always carries the
//! same values, so tests can recompute what a batch must contain.

use super::writer::{AvroFileWriter, WrittenFile};
use crate::features::{DType, FeatureMap, FeatureSpec};
use anyhow::{Context, Result};
use apache_avro::types::Value;
use std::fs;
use std::path::{Path, PathBuf};

// ============================================================================
// Dense scalars
// ============================================================================

pub const DENSE_SCHEMA: &str = r#"{
  "type": "record",
  "name": "Person",
  "fields": [
    {"name": "employed", "type": "boolean"},
    {"name": "age", "type": "int"},
    {"name": "id", "type": "long"},
    {"name": "salary", "type": "float"},
    {"name": "altitude", "type": "double"},
    {"name": "name", "type": "string"}
  ]
}"#;

/// Values of dense record `i`.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseRow {
    pub employed: bool,
    pub age: i32,
    pub id: i64,
    pub salary: f32,
    pub altitude: f64,
    pub name: String,
}

#[must_use]
pub fn dense_row(i: u64) -> DenseRow {
    let n = i64::try_from(i).unwrap_or(i64::MAX);
    DenseRow {
        employed: i % 2 == 0,
        age: i32::try_from(i % 90).unwrap_or_default() + 10,
        id: n,
        salary: (i % 1000) as f32 * 1.5,
        altitude: n as f64 * 0.25,
        name: format!("person-{i}"),
    }
}

impl DenseRow {
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Record(vec![
            ("employed".into(), Value::Boolean(self.employed)),
            ("age".into(), Value::Int(self.age)),
            ("id".into(), Value::Long(self.id)),
            ("salary".into(), Value::Float(self.salary)),
            ("altitude".into(), Value::Double(self.altitude)),
            ("name".into(), Value::String(self.name.clone())),
        ])
    }
}

/// One scalar dense feature per column of [`DENSE_SCHEMA`].
#[must_use]
pub fn dense_features() -> FeatureMap {
    [
        ("employed", DType::Bool),
        ("age", DType::Int32),
        ("id", DType::Int64),
        ("salary", DType::Float32),
        ("altitude", DType::Float64),
        ("name", DType::String),
    ]
    .into_iter()
    .map(|(name, dtype)| (name.to_string(), FeatureSpec::dense(dtype, [])))
    .collect()
}

/// Spread `total` dense records over `files` files named `dense-NN.avro`.
/// Record ids are assigned file by file, so file `k` holds a contiguous id range.
///
/// # Errors
/// Propagates write failures.
pub fn write_dense_files(dir: &Path, files: usize, total: u64) -> Result<Vec<WrittenFile>> {
    write_dense_files_with(dir, files, total, "null", 64)
}

/// [`write_dense_files`] with an explicit codec and block size.
///
/// # Errors
/// Propagates write failures.
pub fn write_dense_files_with(
    dir: &Path,
    files: usize,
    total: u64,
    codec: &str,
    block_records: usize,
) -> Result<Vec<WrittenFile>> {
    let files = files.max(1);
    let per_file = total.div_ceil(files as u64);
    let mut written = Vec::with_capacity(files);
    for k in 0..files {
        let start = k as u64 * per_file;
        let end = (start + per_file).min(total);
        let path = dir.join(format!("dense-{k:02}.avro"));
        let mut writer = AvroFileWriter::create(&path, DENSE_SCHEMA, codec)?.block_records(block_records);
        for i in start..end {
            writer.append(dense_row(i).to_value())?;
        }
        written.push(writer.finish()?);
    }
    Ok(written)
}

// ============================================================================
// Sparse id/price lists
// ============================================================================

pub const SPARSE_SCHEMA: &str = r#"{
  "type": "record",
  "name": "Basket",
  "fields": [
    {"name": "ids", "type": {"type": "array", "items": "long"}},
    {"name": "prices", "type": {"type": "array", "items": "float"}}
  ]
}"#;

pub const SPARSE_DENSE_SIZE: usize = 4000;

/// `(ids, prices)` of sparse record `i`: between 0 and 25 entries, ids below
/// [`SPARSE_DENSE_SIZE`].
#[must_use]
pub fn sparse_row(i: u64) -> (Vec<i64>, Vec<f32>) {
    let len = (i * 7 % 26) as usize;
    let ids = (0..len)
        .map(|j| ((i * 131 + j as u64 * 17) % SPARSE_DENSE_SIZE as u64) as i64)
        .collect();
    let prices = (0..len).map(|j| i as f32 + j as f32 / 100.0).collect();
    (ids, prices)
}

/// A single sparse feature `basket` indexed by `ids` with values `prices`.
#[must_use]
pub fn sparse_features() -> FeatureMap {
    [(
        "basket".to_string(),
        FeatureSpec::sparse(DType::Float32, ["ids"], "prices", [SPARSE_DENSE_SIZE]),
    )]
    .into()
}

/// # Errors
/// Propagates write failures.
pub fn write_sparse_file(path: &Path, records: u64) -> Result<WrittenFile> {
    let mut writer = AvroFileWriter::create(path, SPARSE_SCHEMA, "null")?.block_records(50);
    for i in 0..records {
        let (ids, prices) = sparse_row(i);
        writer.append(Value::Record(vec![
            ("ids".into(), Value::Array(ids.into_iter().map(Value::Long).collect())),
            ("prices".into(), Value::Array(prices.into_iter().map(Value::Float).collect())),
        ]))?;
    }
    writer.finish()
}

// ============================================================================
// Variable-length token lists
// ============================================================================

pub const TOKENS_SCHEMA: &str = r#"{
  "type": "record",
  "name": "Doc",
  "fields": [
    {"name": "tokens", "type": {"type": "array", "items": "string"}}
  ]
}"#;

/// Tokens of record `i`: between 0 and 32 of them.
#[must_use]
pub fn tokens_row(i: u64) -> Vec<String> {
    let len = (i * 5 % 33) as usize;
    (0..len).map(|j| format!("t{i}-{j}")).collect()
}

#[must_use]
pub fn tokens_features() -> FeatureMap {
    [("tokens".to_string(), FeatureSpec::var_len(DType::String, 1))].into()
}

/// # Errors
/// Propagates write failures.
pub fn write_tokens_file(path: &Path, records: u64) -> Result<WrittenFile> {
    let mut writer = AvroFileWriter::create(path, TOKENS_SCHEMA, "null")?.block_records(16);
    for i in 0..records {
        let tokens = tokens_row(i).into_iter().map(Value::String).collect();
        writer.append(Value::Record(vec![("tokens".into(), Value::Array(tokens))]))?;
    }
    writer.finish()
}

// ============================================================================
// Damage helpers
// ============================================================================

/// Insert `garbage` at the start of `path`, breaking its magic bytes.
///
/// # Errors
/// Propagates I/O failures.
pub fn prepend_garbage(path: &Path, garbage: &[u8]) -> Result<()> {
    let mut bytes = garbage.to_vec();
    bytes.extend(fs::read(path).with_context(|| format!("reading {}", path.display()))?);
    fs::write(path, bytes).with_context(|| format!("rewriting {}", path.display()))
}

/// Flip one bit of the sync marker that closes block `block` of `file`.
///
/// # Errors
/// Fails if the block does not exist or the file cannot be rewritten.
pub fn corrupt_block_sync(file: &WrittenFile, block: usize) -> Result<()> {
    let mut bytes = fs::read(&file.path)?;
    let end = file
        .block_offsets
        .get(block + 1)
        .map_or(bytes.len(), |&next| usize::try_from(next).unwrap_or(usize::MAX));
    let last = end.checked_sub(1).context("empty file")?;
    let byte = bytes.get_mut(last).context("block offset past end of file")?;
    *byte ^= 0x01;
    fs::write(&file.path, bytes)?;
    Ok(())
}

/// Sorted paths of `written`, for building file lists directly.
#[must_use]
pub fn paths(written: &[WrittenFile]) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = written.iter().map(|w| w.path.clone()).collect();
    paths.sort();
    paths
}
