//! Loading pipelines from JSON configuration files and the builder API.

use anyhow::Result;
use ironfeed::testing::*;
use ironfeed::*;
use serde_json::json;
use std::fs;
use tempfile::TempDir;

#[test]
fn pipeline_from_json_file() -> Result<()> {
    let dir = TempDir::new()?;
    let train = dir.path().join("train");
    let extra = dir.path().join("extra");
    fs::create_dir_all(&train)?;
    fs::create_dir_all(&extra)?;
    write_dense_files(&train, 2, 40)?;
    write_dense_files_with(&extra, 1, 10, "deflate", 5)?;
    // Ignored: does not match the patterns.
    fs::write(train.join("README.txt"), "not data")?;

    let config_path = dir.path().join("pipeline.json");
    let config = json!({
        "file_pattern": [
            train.join("*.avro").display().to_string(),
            extra.join("dense-*.avro").display().to_string()
        ],
        "reader_schema": DENSE_SCHEMA,
        "features": {
            "id": {"kind": "dense", "dtype": "int64", "shape": []},
            "name": {"kind": "dense", "dtype": "string", "shape": []}
        },
        "batch_size": 16,
        "num_parallel_calls": 2,
        "cycle_length": "autotune",
        "prefetch_buffer_size": 0,
        "error_mode": "fail_fast"
    });
    fs::write(&config_path, serde_json::to_string_pretty(&config)?)?;

    let dataset = RecordDataset::from_json_file(&config_path)?;
    assert_eq!(dataset.files().len(), 3);
    assert!(dataset.files().windows(2).all(|w| w[0] < w[1]));
    assert_eq!(dataset.plan().features().len(), 2);

    let sizes: Vec<usize> = dataset
        .iter()?
        .map(|b| b.map(|b| b.size()))
        .collect::<ironfeed::Result<_>>()?;
    assert_eq!(sizes, vec![16, 16, 16, 2]);
    Ok(())
}

#[test]
fn malformed_json_is_a_config_error() {
    let err = PipelineConfig::from_json_str(r#"{"batch_size": "large"}"#).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);

    let err = RecordDataset::from_json_file("/definitely/not/here.json").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
}

#[test]
fn builder_overrides_reach_the_pipeline() -> Result<()> {
    let dir = TempDir::new()?;
    write_dense_files(dir.path(), 1, 30)?;
    let config = PipelineConfig {
        file_pattern: dir.path().join("*.avro").display().to_string().into(),
        reader_schema: DENSE_SCHEMA.to_string(),
        features: dense_features(),
        batch_size: 100,
        ..PipelineConfig::default()
    };
    let dataset = RecordDataset::new(config)?
        .batch_size(7)
        .num_epochs(Some(2))
        .drop_remainder(true)
        .num_parallel_reads(Parallelism::Fixed(1))
        .block_length(Parallelism::Fixed(3))
        .prefetch_buffer_size(1);
    assert_eq!(dataset.config().batch_size, 7);

    let batches = dataset.iter()?.collect::<ironfeed::Result<Vec<_>>>()?;
    assert_eq!(batches.len(), 60 / 7);
    assert!(batches.iter().all(|b| b.size() == 7));
    Ok(())
}
