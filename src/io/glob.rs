//! File discovery, sharding, and epoch repetition.
//!
//! Patterns are expanded with the `glob` crate into a sorted, de-duplicated
//! file list. The list is then restricted to one worker's shard and replayed
//! once per epoch by [`FileShardIterator`], optionally in a fresh random order
//! each epoch.
//!
//! # Examples
//!
//! ```no_run
//! use ironfeed::io::glob::{expand_patterns, FileShardIterator, ShardPolicy, WorkerShard};
//!
//! let files = expand_patterns(&["data/train-*.avro".to_string()])?;
//! let shard = WorkerShard::new(0, 4);
//! let iter = FileShardIterator::new(files, shard, ShardPolicy::RoundRobin, Some(2))?;
//! while let Some(path) = iter.next_file() {
//!     println!("{}", path.display());
//! }
//! # Ok::<(), ironfeed::Error>(())
//! ```

use crate::error::{Error, Result};
use glob::glob;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Expand a glob pattern into a sorted vector of matching file paths.
///
/// Directories are ignored.
///
/// # Errors
///
/// Returns a `Config` error if the pattern is invalid or a matched entry
/// cannot be read.
pub fn expand_glob(pattern: &str) -> Result<Vec<PathBuf>> {
    let paths =
        glob(pattern).map_err(|e| Error::config(format!("invalid glob pattern {pattern}: {e}")))?;

    let mut result = Vec::new();
    for entry in paths {
        let path = entry.map_err(|e| {
            Error::config(format!("error reading glob entry for pattern {pattern}: {e}"))
        })?;
        if path.is_file() {
            result.push(path);
        }
    }

    result.sort();
    Ok(result)
}

/// Expand several patterns into one sorted, de-duplicated list.
///
/// # Errors
///
/// Returns a `Config` error if any pattern is invalid or if no file matches
/// any of them.
pub fn expand_patterns(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for pattern in patterns {
        files.extend(expand_glob(pattern)?);
    }
    files.sort();
    files.dedup();
    if files.is_empty() {
        return Err(Error::config(format!(
            "no files found matching {}",
            patterns.join(", ")
        )));
    }
    debug!(files = files.len(), "expanded file patterns");
    Ok(files)
}

/// How files are split across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardPolicy {
    /// File `i` of the sorted list goes to worker `i % count`.
    #[default]
    RoundRobin,
    /// File `i` goes to worker `mix(i) % count`.
    Hash,
}

/// This worker's position among `count` workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerShard {
    pub index: usize,
    pub count: usize,
}

impl WorkerShard {
    #[must_use]
    pub fn new(index: usize, count: usize) -> Self {
        Self { index, count }
    }

    /// The single-worker shard that owns every file.
    #[must_use]
    pub fn whole() -> Self {
        Self { index: 0, count: 1 }
    }

    fn owns(self, position: usize, policy: ShardPolicy) -> bool {
        let slot = match policy {
            ShardPolicy::RoundRobin => position as u64,
            ShardPolicy::Hash => splitmix64(position as u64),
        };
        slot % self.count as u64 == self.index as u64
    }
}

impl Default for WorkerShard {
    fn default() -> Self {
        Self::whole()
    }
}

pub(crate) fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Keep the files `shard` owns under `policy`, preserving order.
#[must_use]
pub fn shard_files(files: &[PathBuf], shard: WorkerShard, policy: ShardPolicy) -> Vec<PathBuf> {
    files
        .iter()
        .enumerate()
        .filter(|(i, _)| shard.owns(*i, policy))
        .map(|(_, p)| p.clone())
        .collect()
}

struct EpochCursor {
    epoch: u64,
    position: usize,
    order: Vec<usize>,
    rng: Option<StdRng>,
}

/// Yields this worker's files, epoch after epoch.
///
/// The cursor is shared behind a mutex, so one iterator can feed several
/// reader slots.
pub struct FileShardIterator {
    files: Vec<PathBuf>,
    epochs: Option<u64>,
    cursor: Mutex<EpochCursor>,
}

impl FileShardIterator {
    /// Shard a sorted file list and prepare to replay it for `epochs` epochs
    /// (`None` repeats forever).
    ///
    /// # Errors
    ///
    /// Returns a `Config` error for an invalid shard or if the shard owns no files.
    pub fn new(
        files: Vec<PathBuf>,
        shard: WorkerShard,
        policy: ShardPolicy,
        epochs: Option<u64>,
    ) -> Result<Self> {
        if shard.count == 0 || shard.index >= shard.count {
            return Err(Error::config(format!(
                "worker index {} is not below worker count {}",
                shard.index, shard.count
            )));
        }
        let total = files.len();
        let files = shard_files(&files, shard, policy);
        if files.is_empty() {
            return Err(Error::config(format!(
                "worker {} of {} owns none of the {total} matched files",
                shard.index, shard.count
            )));
        }
        debug!(
            worker = shard.index,
            workers = shard.count,
            files = files.len(),
            "sharded input files"
        );
        let order = (0..files.len()).collect();
        Ok(Self {
            files,
            epochs,
            cursor: Mutex::new(EpochCursor {
                epoch: 0,
                position: 0,
                order,
                rng: None,
            }),
        })
    }

    /// Permute the file order at the start of every epoch. A `None` seed draws
    /// one from the operating system.
    #[must_use]
    pub fn with_shuffle(self, seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        {
            let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
            cursor.order.shuffle(&mut rng);
            cursor.rng = Some(rng);
        }
        self
    }

    /// The files owned by this shard, in sorted order.
    #[must_use]
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Next file to open, or `None` once every epoch has been served.
    pub fn next_file(&self) -> Option<PathBuf> {
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        if cursor.position == cursor.order.len() {
            cursor.epoch += 1;
            cursor.position = 0;
            let EpochCursor { order, rng, .. } = &mut *cursor;
            if let Some(rng) = rng {
                order.shuffle(rng);
            }
        }
        if self.epochs.is_some_and(|n| cursor.epoch >= n) {
            return None;
        }
        let file = &self.files[cursor.order[cursor.position]];
        cursor.position += 1;
        Some(file.clone())
    }

    /// Zero-based epoch of the file most recently handed out.
    pub fn epoch(&self) -> u64 {
        self.cursor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .epoch
    }
}

impl Iterator for &FileShardIterator {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        self.next_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(n: usize) -> Vec<PathBuf> {
        (0..n).map(|i| PathBuf::from(format!("f{i:02}"))).collect()
    }

    #[test]
    fn round_robin_shards_partition_the_list() {
        let files = paths(10);
        let mut seen = Vec::new();
        for w in 0..3 {
            let owned = shard_files(&files, WorkerShard::new(w, 3), ShardPolicy::RoundRobin);
            assert_eq!(owned[0], files[w]);
            seen.extend(owned);
        }
        seen.sort();
        assert_eq!(seen, files);
    }

    #[test]
    fn hash_shards_partition_the_list() {
        let files = paths(50);
        let mut seen: Vec<PathBuf> = (0..4)
            .flat_map(|w| shard_files(&files, WorkerShard::new(w, 4), ShardPolicy::Hash))
            .collect();
        seen.sort();
        assert_eq!(seen, files);
    }

    #[test]
    fn replays_for_each_epoch_then_stops() {
        let iter =
            FileShardIterator::new(paths(3), WorkerShard::whole(), ShardPolicy::RoundRobin, Some(2))
                .unwrap();
        let served: Vec<_> = (&iter).collect();
        assert_eq!(served.len(), 6);
        assert_eq!(served[..3], served[3..]);
        assert!(iter.next_file().is_none());
    }

    #[test]
    fn unbounded_epochs_keep_going() {
        let iter =
            FileShardIterator::new(paths(2), WorkerShard::whole(), ShardPolicy::RoundRobin, None)
                .unwrap();
        assert_eq!((&iter).take(101).count(), 101);
        assert_eq!(iter.epoch(), 50);
    }

    #[test]
    fn seeded_shuffle_is_reproducible_and_complete() {
        let make = || {
            FileShardIterator::new(paths(8), WorkerShard::whole(), ShardPolicy::RoundRobin, Some(3))
                .unwrap()
                .with_shuffle(Some(7))
        };
        let a: Vec<_> = (&make()).collect();
        let b: Vec<_> = (&make()).collect();
        assert_eq!(a, b);
        for epoch in a.chunks(8) {
            let mut sorted = epoch.to_vec();
            sorted.sort();
            assert_eq!(sorted, paths(8));
        }
    }

    #[test]
    fn empty_shard_is_a_config_error() {
        let err = FileShardIterator::new(
            paths(1),
            WorkerShard::new(1, 2),
            ShardPolicy::RoundRobin,
            Some(1),
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }
}
