//! Error reporting: localization of record errors, error modes, file-level
//! failures and build-time configuration errors.

use anyhow::Result;
use apache_avro::types::Value;
use ironfeed::io::binary::{encode_bytes, encode_long};
use ironfeed::io::container::{CODEC_KEY, MAGIC, SCHEMA_KEY};
use ironfeed::testing::*;
use ironfeed::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const NULLABLE_SCHEMA: &str = r#"{
  "type": "record",
  "name": "Visit",
  "fields": [
    {"name": "id", "type": "long"},
    {"name": "age", "type": ["null", "int"]}
  ]
}"#;

/// 100 records in blocks of 10; record 37 has a null age.
fn write_with_null_age(dir: &Path) -> Result<PathBuf> {
    let path = dir.join("visits.avro");
    let mut writer = AvroFileWriter::create(&path, NULLABLE_SCHEMA, "null")?.block_records(10);
    for i in 0..100i64 {
        let age = if i == 37 {
            Value::Union(0, Box::new(Value::Null))
        } else {
            Value::Union(1, Box::new(Value::Int(20)))
        };
        writer.append(Value::Record(vec![("id".into(), Value::Long(i)), ("age".into(), age)]))?;
    }
    writer.finish()?;
    Ok(path)
}

fn visits(dir: &Path, features: FeatureMap) -> PipelineConfig {
    PipelineConfig {
        file_pattern: dir.join("*.avro").display().to_string().into(),
        reader_schema: NULLABLE_SCHEMA.to_string(),
        features,
        batch_size: 10,
        ..PipelineConfig::default()
    }
}

fn visit_features() -> FeatureMap {
    [
        ("id".to_string(), FeatureSpec::dense(DType::Int64, [])),
        ("age".to_string(), FeatureSpec::dense(DType::Int32, [])),
    ]
    .into()
}

#[test]
fn missing_value_without_default_names_feature_and_record() -> Result<()> {
    let dir = TempDir::new()?;
    let path = write_with_null_age(dir.path())?;

    let results: Vec<_> = RecordDataset::new(visits(dir.path(), visit_features()))?.iter()?.collect();
    let err = results.last().and_then(|r| r.as_ref().err()).expect("pipeline fails");
    assert_eq!(err.kind(), ErrorKind::Parse);
    assert_eq!(err.feature(), Some("age"));
    let origin = err.origin().expect("record origin");
    assert_eq!(&*origin.path, path.as_path());
    assert_eq!((origin.block_index, origin.record_index), (3, 7));
    assert!(err.to_string().contains("visits.avro block 3 record 7"));

    let good: usize = results.iter().filter_map(|r| r.as_ref().ok()).map(Batch::size).sum();
    assert!(good <= 30);
    Ok(())
}

#[test]
fn default_fills_missing_value() -> Result<()> {
    let dir = TempDir::new()?;
    write_with_null_age(dir.path())?;
    let mut features = visit_features();
    features.insert("age".into(), FeatureSpec::dense(DType::Int32, []).with_default(-1));

    let batches = RecordDataset::new(visits(dir.path(), features))?
        .iter()?
        .collect::<ironfeed::Result<Vec<_>>>()?;
    let ages = batches[3].dense("age").and_then(|t| t.as_slice::<i32>()).expect("ages");
    assert_eq!(ages[7], -1);
    assert_eq!(ages[6], 20);
    Ok(())
}

#[test]
fn skip_invalid_drops_bad_records_and_counts_them() -> Result<()> {
    let dir = TempDir::new()?;
    write_with_null_age(dir.path())?;

    for mode in [ErrorMode::SkipInvalid, ErrorMode::LogAndContinue] {
        let dataset = RecordDataset::new(visits(dir.path(), visit_features()))?.error_mode(mode);
        let mut iter = dataset.iter()?;
        let mut ids = Vec::new();
        for batch in iter.by_ref() {
            let batch = batch?;
            ids.extend_from_slice(batch.dense("id").and_then(|t| t.as_slice::<i64>()).unwrap_or_default());
        }
        assert_eq!(ids.len(), 99, "{mode:?}");
        assert!(!ids.contains(&37));
        let metrics = iter.metrics();
        assert_eq!(metrics.records_skipped, 1);
        assert_eq!(metrics.records_parsed, 99);
        assert_eq!(metrics.records_read, 100);
        assert_eq!(iter.state(), PipelineStatus::Closed);
    }
    Ok(())
}

#[test]
fn incompatible_writer_schema_is_fatal_even_when_skipping() -> Result<()> {
    let dir = TempDir::new()?;
    let schema = r#"{"type":"record","name":"Visit","fields":[
        {"name":"id","type":"string"},
        {"name":"age","type":["null","int"]}]}"#;
    let path = dir.path().join("strings.avro");
    let mut writer = AvroFileWriter::create(&path, schema, "null")?;
    writer.append(Value::Record(vec![
        ("id".into(), Value::String("x".into())),
        ("age".into(), Value::Union(0, Box::new(Value::Null))),
    ]))?;
    writer.finish()?;

    let dataset = RecordDataset::new(visits(dir.path(), visit_features()))?.error_mode(ErrorMode::SkipInvalid);
    let err = dataset.iter()?.find_map(|r| r.err()).expect("schema mismatch");
    assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
    assert_eq!(err.path(), Some(path.as_path()));
    Ok(())
}

#[test]
fn broken_sync_marker_reports_corrupt_block() -> Result<()> {
    let dir = TempDir::new()?;
    let written = write_dense_files_with(dir.path(), 1, 200, "deflate", 50)?;
    corrupt_block_sync(&written[0], 1)?;

    let config = PipelineConfig {
        file_pattern: dir.path().join("*.avro").display().to_string().into(),
        reader_schema: DENSE_SCHEMA.to_string(),
        features: dense_features(),
        batch_size: 25,
        ..PipelineConfig::default()
    };
    let results: Vec<_> = RecordDataset::new(config)?.iter()?.collect();
    let err = results.last().and_then(|r| r.as_ref().err()).expect("corruption detected");
    assert_eq!(err.kind(), ErrorKind::CorruptBlock);
    assert_eq!(err.path(), Some(written[0].path.as_path()));
    assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
    Ok(())
}

#[test]
fn unknown_codec_is_reported_for_the_file() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("odd.avro");
    let mut bytes = MAGIC.to_vec();
    encode_long(&mut bytes, 2);
    encode_bytes(&mut bytes, SCHEMA_KEY.as_bytes());
    encode_bytes(&mut bytes, DENSE_SCHEMA.as_bytes());
    encode_bytes(&mut bytes, CODEC_KEY.as_bytes());
    encode_bytes(&mut bytes, b"lz4-unregistered");
    encode_long(&mut bytes, 0);
    bytes.extend_from_slice(&[7u8; 16]);
    std::fs::write(&path, bytes)?;

    let config = PipelineConfig {
        file_pattern: path.display().to_string().into(),
        reader_schema: DENSE_SCHEMA.to_string(),
        features: dense_features(),
        batch_size: 4,
        ..PipelineConfig::default()
    };
    let err = RecordDataset::new(config)?.iter()?.find_map(|r| r.err()).expect("codec error");
    assert_eq!(err.kind(), ErrorKind::UnsupportedCodec);
    assert_eq!(err.path(), Some(path.as_path()));
    Ok(())
}

#[test]
fn sparse_index_out_of_range_is_a_range_error() -> Result<()> {
    let dir = TempDir::new()?;
    write_sparse_file(&dir.path().join("basket.avro"), 50)?;
    let features: FeatureMap = [(
        "basket".to_string(),
        FeatureSpec::sparse(DType::Float32, ["ids"], "prices", [10]),
    )]
    .into();
    let config = PipelineConfig {
        file_pattern: dir.path().join("*.avro").display().to_string().into(),
        reader_schema: SPARSE_SCHEMA.to_string(),
        features,
        batch_size: 8,
        error_mode: ErrorMode::SkipInvalid,
        ..PipelineConfig::default()
    };
    let err = RecordDataset::new(config)?.iter()?.find_map(|r| r.err()).expect("range error");
    assert_eq!(err.kind(), ErrorKind::Range);
    assert_eq!(err.feature(), Some("basket"));
    Ok(())
}

#[test]
fn build_time_problems_are_config_errors() -> Result<()> {
    let dir = TempDir::new()?;
    write_dense_files(dir.path(), 1, 10)?;
    let base = PipelineConfig {
        file_pattern: dir.path().join("*.avro").display().to_string().into(),
        reader_schema: DENSE_SCHEMA.to_string(),
        features: dense_features(),
        batch_size: 4,
        ..PipelineConfig::default()
    };
    assert!(RecordDataset::new(base.clone()).is_ok());

    let mut no_files = base.clone();
    no_files.file_pattern = dir.path().join("*.parquet").display().to_string().into();

    let mut bad_schema = base.clone();
    bad_schema.reader_schema = "{not json".into();

    let mut unknown_field = base.clone();
    unknown_field
        .features
        .insert("height".into(), FeatureSpec::dense(DType::Float32, []));

    let mut wrong_type = base.clone();
    wrong_type.features.insert("name".into(), FeatureSpec::dense(DType::Int64, []));

    let mut zero_batch = base;
    zero_batch.batch_size = 0;

    for config in [no_files, bad_schema, unknown_field, wrong_type, zero_batch] {
        let err = RecordDataset::new(config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config, "{err}");
    }
    Ok(())
}

#[test]
fn builder_changes_are_validated_on_iter() -> Result<()> {
    let dir = TempDir::new()?;
    write_dense_files(dir.path(), 1, 10)?;
    let config = PipelineConfig {
        file_pattern: dir.path().join("*.avro").display().to_string().into(),
        reader_schema: DENSE_SCHEMA.to_string(),
        features: dense_features(),
        batch_size: 4,
        ..PipelineConfig::default()
    };
    let dataset = RecordDataset::new(config)?.batch_size(0);
    let err = dataset.iter().err().expect("invalid batch size");
    assert_eq!(err.kind(), ErrorKind::Config);
    Ok(())
}
