//! Ordering guarantees: repeatability, seeded shuffling, non-deterministic
//! mode and worker sharding.

use anyhow::Result;
use ironfeed::testing::*;
use ironfeed::*;
use std::collections::BTreeSet;
use std::path::Path;
use tempfile::TempDir;

fn dataset(dir: &Path) -> Result<RecordDataset> {
    let config = PipelineConfig {
        file_pattern: dir.join("*.avro").display().to_string().into(),
        reader_schema: DENSE_SCHEMA.to_string(),
        features: dense_features(),
        batch_size: 50,
        num_parallel_calls: Parallelism::Fixed(4),
        cycle_length: Parallelism::Fixed(3),
        block_length: Parallelism::Fixed(2),
        ..PipelineConfig::default()
    };
    Ok(RecordDataset::new(config)?)
}

fn id_stream(dataset: &RecordDataset) -> Result<Vec<i64>> {
    let mut out = Vec::new();
    for batch in dataset.iter()? {
        let batch = batch?;
        let ids = batch.dense("id").and_then(|t| t.as_slice::<i64>()).unwrap_or_default();
        out.extend_from_slice(ids);
    }
    Ok(out)
}

#[test]
fn identical_configuration_yields_identical_batches() -> Result<()> {
    let dir = TempDir::new()?;
    write_dense_files_with(dir.path(), 5, 1000, "null", 7)?;
    let ds = dataset(dir.path())?;

    let first = ds.iter()?.collect::<ironfeed::Result<Vec<_>>>()?;
    let second = ds.iter()?.collect::<ironfeed::Result<Vec<_>>>()?;
    assert_eq!(first.len(), 20);
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn interleave_order_follows_cycle_and_block_length() -> Result<()> {
    let dir = TempDir::new()?;
    // Files hold ids 0..4, 4..8, 8..12, one record per block.
    write_dense_files_with(dir.path(), 3, 12, "null", 1)?;
    let ds = dataset(dir.path())?.batch_size(12);

    let ids = id_stream(&ds)?;
    assert_eq!(ids, vec![0, 1, 4, 5, 8, 9, 2, 3, 6, 7, 10, 11]);
    Ok(())
}

#[test]
fn seeded_shuffle_is_repeatable_and_complete() -> Result<()> {
    let dir = TempDir::new()?;
    write_dense_files(dir.path(), 4, 1000)?;
    let plain = id_stream(&dataset(dir.path())?)?;

    let shuffled = dataset(dir.path())?.shuffle(200, Some(7));
    let a = id_stream(&shuffled)?;
    let b = id_stream(&shuffled)?;
    assert_eq!(a, b);
    assert_ne!(a, plain);

    let mut sorted = a.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, (0..1000).collect::<Vec<i64>>());

    let other_seed = id_stream(&dataset(dir.path())?.shuffle(200, Some(8)))?;
    assert_ne!(a, other_seed);
    Ok(())
}

#[test]
fn shuffled_positions_are_uniform_over_seeds() -> Result<()> {
    const RECORDS: usize = 8;
    const SEEDS: u64 = 300;
    let dir = TempDir::new()?;
    write_dense_files(dir.path(), 1, RECORDS as u64)?;
    let base = dataset(dir.path())?
        .batch_size(RECORDS)
        .num_parallel_calls(Parallelism::Fixed(1));

    let mut counts = vec![vec![0u32; RECORDS]; RECORDS];
    for seed in 0..SEEDS {
        let ids = id_stream(&base.clone().shuffle(RECORDS, Some(seed)))?;
        assert_eq!(ids.len(), RECORDS);
        for (position, id) in ids.into_iter().enumerate() {
            counts[usize::try_from(id)?][position] += 1;
        }
    }

    let expected = SEEDS as f64 / RECORDS as f64;
    let statistic: f64 = counts
        .iter()
        .flatten()
        .map(|&c| (f64::from(c) - expected).powi(2) / expected)
        .sum();
    // 49 degrees of freedom.
    assert!(statistic < 100.0, "chi-square {statistic:.1}, counts {counts:?}");
    let midpoint = (RECORDS - 1) as f64 / 2.0;
    for (id, row) in counts.iter().enumerate() {
        let mean = row.iter().enumerate().map(|(p, &c)| p as f64 * f64::from(c)).sum::<f64>() / SEEDS as f64;
        assert!((mean - midpoint).abs() < 0.6, "record {id} mean position {mean:.2}");
    }
    Ok(())
}

#[test]
fn non_deterministic_mode_still_yields_every_record_once() -> Result<()> {
    let dir = TempDir::new()?;
    write_dense_files(dir.path(), 6, 1200)?;
    let ds = dataset(dir.path())?.deterministic(false);

    let mut ids = id_stream(&ds)?;
    assert_eq!(ids.len(), 1200);
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 1200);
    Ok(())
}

#[test]
fn workers_read_disjoint_shards_that_cover_all_files() -> Result<()> {
    let dir = TempDir::new()?;
    write_dense_files(dir.path(), 7, 700)?;

    let mut union = BTreeSet::new();
    let mut total = 0;
    for worker in 0..3 {
        let mut config = dataset(dir.path())?.config().clone();
        config.worker_index = worker;
        config.worker_count = 3;
        let ds = RecordDataset::new(config)?;
        assert_eq!(ds.files().len(), if worker == 0 { 3 } else { 2 });
        let ids = id_stream(&ds)?;
        total += ids.len();
        union.extend(ids);
    }
    assert_eq!(total, 700);
    assert_eq!(union.len(), 700);
    Ok(())
}

#[test]
fn worker_without_files_is_a_config_error() -> Result<()> {
    let dir = TempDir::new()?;
    write_dense_files(dir.path(), 2, 10)?;
    let mut config = dataset(dir.path())?.config().clone();
    config.worker_index = 2;
    config.worker_count = 3;
    let err = RecordDataset::new(config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    Ok(())
}
