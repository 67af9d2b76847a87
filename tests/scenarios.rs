//! End-to-end scenarios: dense, sparse and var-len features, epochs,
//! corrupt input and cancellation.

use anyhow::Result;
use ironfeed::testing::*;
use ironfeed::*;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn config(dir: &Path, schema: &str, features: FeatureMap, batch_size: usize) -> PipelineConfig {
    PipelineConfig {
        file_pattern: dir.join("*.avro").display().to_string().into(),
        reader_schema: schema.to_string(),
        features,
        batch_size,
        ..PipelineConfig::default()
    }
}

fn ids(batch: &Batch) -> Vec<i64> {
    batch
        .dense("id")
        .and_then(|t| t.as_slice::<i64>())
        .map(<[i64]>::to_vec)
        .unwrap_or_default()
}

#[test]
fn dense_trip_over_four_files() -> Result<()> {
    let dir = TempDir::new()?;
    write_dense_files(dir.path(), 4, 2048)?;

    let dataset = RecordDataset::new(config(dir.path(), DENSE_SCHEMA, dense_features(), 512))?;
    assert_eq!(dataset.files().len(), 4);
    let batches = dataset.iter()?.collect::<ironfeed::Result<Vec<_>>>()?;

    assert_eq!(batches.len(), 4);
    let mut seen = Vec::new();
    for batch in &batches {
        assert_eq!(batch.size(), 512);
        for name in ["employed", "age", "id", "salary", "altitude", "name"] {
            let tensor = batch.dense(name).expect(name);
            assert_eq!(tensor.shape, vec![512], "{name}");
            assert_eq!(tensor.values.len(), 512, "{name}");
        }
        seen.extend(ids(batch));
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..2048).collect::<Vec<i64>>());
    Ok(())
}

#[test]
fn dense_values_line_up_per_record() -> Result<()> {
    let dir = TempDir::new()?;
    write_dense_files(dir.path(), 2, 300)?;

    let dataset = RecordDataset::new(config(dir.path(), DENSE_SCHEMA, dense_features(), 64))?
        .cycle_length(Parallelism::Fixed(1))
        .num_parallel_calls(Parallelism::Fixed(3));
    let mut next_id = 0u64;
    for batch in dataset.iter()? {
        let batch = batch?;
        let names = batch.dense("name").and_then(|t| t.as_slice::<String>()).expect("names");
        let ages = batch.dense("age").and_then(|t| t.as_slice::<i32>()).expect("ages");
        let salaries = batch.dense("salary").and_then(|t| t.as_slice::<f32>()).expect("salaries");
        let employed = batch.dense("employed").and_then(|t| t.as_slice::<bool>()).expect("employed");
        for (row, id) in ids(&batch).into_iter().enumerate() {
            assert_eq!(id, i64::try_from(next_id)?);
            let expected = dense_row(next_id);
            assert_eq!(names[row], expected.name);
            assert_eq!(ages[row], expected.age);
            assert_eq!(salaries[row], expected.salary);
            assert_eq!(employed[row], expected.employed);
            next_id += 1;
        }
    }
    assert_eq!(next_id, 300);
    Ok(())
}

#[test]
fn sparse_coordinates_match_source_lists() -> Result<()> {
    let dir = TempDir::new()?;
    write_sparse_file(&dir.path().join("basket.avro"), 300)?;

    let dataset = RecordDataset::new(config(dir.path(), SPARSE_SCHEMA, sparse_features(), 64))?;
    let mut offset = 0u64;
    for batch in dataset.iter()? {
        let batch = batch?;
        let tensor = batch.sparse("basket").expect("basket");
        let b = batch.size();
        assert_eq!(tensor.dense_shape, vec![b, SPARSE_DENSE_SIZE]);

        let mut expected_indices = Vec::new();
        let mut expected_values = Vec::new();
        for row in 0..b {
            let (ids, prices) = sparse_row(offset + row as u64);
            for id in ids {
                expected_indices.extend([i64::try_from(row)?, id]);
            }
            expected_values.extend(prices);
        }
        assert_eq!(tensor.indices, expected_indices);
        assert_eq!(tensor.values.as_slice::<f32>(), Some(expected_values.as_slice()));
        for coords in tensor.index_rows() {
            assert!(usize::try_from(coords[0])? < b);
        }
        offset += b as u64;
    }
    assert_eq!(offset, 300);
    Ok(())
}

#[test]
fn var_len_tokens_report_row_splits() -> Result<()> {
    let dir = TempDir::new()?;
    write_tokens_file(&dir.path().join("docs.avro"), 100)?;

    let dataset = RecordDataset::new(config(dir.path(), TOKENS_SCHEMA, tokens_features(), 8))?.drop_remainder(true);
    let batches = dataset.iter()?.collect::<ironfeed::Result<Vec<_>>>()?;
    assert_eq!(batches.len(), 12);

    for (b, batch) in batches.iter().enumerate() {
        let tensor = batch.var_len("tokens").expect("tokens");
        let lengths: Vec<usize> = tensor.row_lengths().collect();
        assert_eq!(lengths.iter().sum::<usize>(), tensor.values.len());
        let max = lengths.iter().copied().max().unwrap_or(0);
        assert_eq!(tensor.dense_shape, vec![8, max]);
        for row in 0..8 {
            let expected = tokens_row((b * 8 + row) as u64);
            assert_eq!(tensor.row(row), Some(Values::String(expected)));
        }
    }
    Ok(())
}

#[test]
fn epochs_and_remainder_batch() -> Result<()> {
    let dir = TempDir::new()?;
    write_dense_files(dir.path(), 1, 100)?;

    let dataset = RecordDataset::new(config(dir.path(), DENSE_SCHEMA, dense_features(), 32))?
        .num_epochs(Some(3))
        .drop_remainder(false);
    let sizes: Vec<usize> = dataset
        .iter()?
        .map(|b| b.map(|b| b.size()))
        .collect::<ironfeed::Result<_>>()?;
    let mut expected = vec![32; 9];
    expected.push(12);
    assert_eq!(sizes, expected);

    let dropped = dataset.clone().drop_remainder(true).iter()?.count();
    assert_eq!(dropped, 9);
    Ok(())
}

#[test]
fn corrupt_file_fails_once_without_leaking() -> Result<()> {
    let dir = TempDir::new()?;
    let written = write_dense_files(dir.path(), 4, 2048)?;
    prepend_garbage(&written[2].path, b"not an avro file")?;

    let dataset = RecordDataset::new(config(dir.path(), DENSE_SCHEMA, dense_features(), 512))?;
    let mut iter = dataset.iter()?;
    let results: Vec<_> = iter.by_ref().collect();

    let errors: Vec<&Error> = results.iter().filter_map(|r| r.as_ref().err()).collect();
    assert_eq!(errors.len(), 1);
    assert!(results.last().is_some_and(|r| r.is_err()));
    assert_eq!(errors[0].kind(), ErrorKind::CorruptBlock);
    assert_eq!(errors[0].path(), Some(written[2].path.as_path()));

    assert!(iter.next().is_none());
    assert_eq!(iter.state(), PipelineStatus::Failed);
    let metrics = iter.metrics();
    assert_eq!(metrics.open_files, 0);
    assert_eq!(metrics.active_threads, 0);
    Ok(())
}

#[mark_flaky_tests::flaky]
#[test]
fn cancel_stops_an_endless_pipeline_promptly() -> Result<()> {
    let dir = TempDir::new()?;
    write_dense_files(dir.path(), 4, 2048)?;

    let dataset = RecordDataset::new(config(dir.path(), DENSE_SCHEMA, dense_features(), 64))?.num_epochs(None);
    let mut iter = dataset.iter()?;
    let first = iter.next().expect("first batch")?;
    assert_eq!(first.size(), 64);
    assert_eq!(iter.state(), PipelineStatus::Running);

    let started = Instant::now();
    iter.cancel_handle().cancel();
    let next = iter.next().expect("cancellation is reported");
    assert_eq!(next.err().map(|e| e.kind()), Some(ErrorKind::Cancelled));
    assert!(iter.next().is_none());
    assert!(started.elapsed() < Duration::from_secs(1));

    let metrics = iter.metrics();
    assert_eq!(metrics.open_files, 0);
    assert_eq!(metrics.active_threads, 0);
    assert!(metrics.batches_emitted >= 1);
    Ok(())
}
