//! Pipeline controller: wires the stages together and owns their threads.
//!
//! ```text
//! FileShardIterator -> RecordStream -> Parser x N -> reorder -> ShuffleBuffer
//!                   -> BatchAssembler -> Prefetcher -> BatchIterator
//! ```
//!
//! A [`RecordDataset`] is built once: it validates the configuration, expands
//! and shards the file list, and compiles the feature plan, so every
//! configuration error surfaces before any thread starts. Each call to
//! [`RecordDataset::iter`] creates an independent [`BatchIterator`] whose stage
//! threads start on the first pull.
//!
//! # Example
//!
//! ```no_run
//! use ironfeed::{DType, FeatureSpec, PipelineConfig, RecordDataset};
//!
//! # fn main() -> ironfeed::Result<()> {
//! let config = PipelineConfig {
//!     file_pattern: "data/train-*.avro".into(),
//!     reader_schema: std::fs::read_to_string("schema.avsc").unwrap_or_default(),
//!     features: [("age".to_string(), FeatureSpec::dense(DType::Int32, []).with_default(0))].into(),
//!     batch_size: 256,
//!     ..PipelineConfig::default()
//! };
//! let dataset = RecordDataset::new(config)?.shuffle(10_000, Some(7));
//! for batch in dataset.iter()? {
//!     let batch = batch?;
//!     println!("{} records", batch.size());
//! }
//! # Ok(())
//! # }
//! ```

use crate::batch::{Batch, BatchAssembler};
use crate::config::{ErrorMode, Parallelism, PipelineConfig, ResolvedParallelism};
use crate::error::{Error, Result};
use crate::io::glob::{FileShardIterator, ShardPolicy, WorkerShard, expand_patterns};
use crate::io::interleave::{FileContext, InterleavePolicy, RawRecord, RecordStream};
use crate::metrics::{Counter, MetricsSnapshot, PipelineMetrics};
use crate::parser::Parser;
use crate::plan::FeaturePlan;
use crate::prefetch::Prefetcher;
use crate::queue::{BoundedQueue, CancellationToken, ProducerGuard};
use crate::schema::Schema;
use crate::shuffle::ShuffleBuffer;
use crate::values::ParsedRecord;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

/// Raw records queued per parser worker.
const RECORDS_PER_WORKER: usize = 4;

/// Lifecycle of one [`BatchIterator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    /// Created; no thread has started.
    Built,
    Running,
    /// Input is exhausted; buffered records are being flushed.
    Draining,
    Closed,
    Failed,
}

/// A configured, validated dataset. Cheap to iterate many times.
#[derive(Debug, Clone)]
pub struct RecordDataset {
    config: PipelineConfig,
    files: Vec<PathBuf>,
    plan: Arc<FeaturePlan>,
}

impl RecordDataset {
    /// Validate `config`, expand and shard its file patterns, and compile the
    /// feature plan.
    ///
    /// # Errors
    /// `Config` for invalid options, a malformed reader schema, an unresolvable
    /// feature, or a pattern set that matches no file for this worker.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let reader_schema = Schema::parse_str(&config.reader_schema)
            .map_err(|e| Error::config(format!("reader_schema: {e}")))?;
        let plan = Arc::new(FeaturePlan::compile(Arc::new(reader_schema), &config.features)?);

        let matched = expand_patterns(&config.file_pattern.patterns())?;
        let shard = WorkerShard::new(config.worker_index, config.worker_count);
        let files = FileShardIterator::new(matched, shard, config.shard_policy, Some(1))?
            .files()
            .to_vec();

        Ok(Self {
            config,
            files,
            plan,
        })
    }

    /// Load a JSON configuration file and build the dataset from it.
    ///
    /// # Errors
    /// As [`PipelineConfig::from_json_file`] and [`RecordDataset::new`].
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::new(PipelineConfig::from_json_file(path)?)
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// This worker's files, in sorted order.
    #[must_use]
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    #[must_use]
    pub fn plan(&self) -> &Arc<FeaturePlan> {
        &self.plan
    }

    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn drop_remainder(mut self, drop_remainder: bool) -> Self {
        self.config.drop_remainder = drop_remainder;
        self
    }

    /// `None` repeats the files forever.
    #[must_use]
    pub fn num_epochs(mut self, epochs: Option<u64>) -> Self {
        self.config.num_epochs = epochs;
        self
    }

    /// Enable shuffling through a buffer of `buffer_size` records.
    #[must_use]
    pub fn shuffle(mut self, buffer_size: usize, seed: Option<u64>) -> Self {
        self.config.shuffle = true;
        self.config.shuffle_buffer_size = Some(buffer_size);
        self.config.shuffle_seed = seed;
        self
    }

    #[must_use]
    pub fn deterministic(mut self, deterministic: bool) -> Self {
        self.config.deterministic = deterministic;
        self
    }

    #[must_use]
    pub fn num_parallel_reads(mut self, reads: Parallelism) -> Self {
        self.config.num_parallel_reads = reads;
        self
    }

    #[must_use]
    pub fn num_parallel_calls(mut self, calls: Parallelism) -> Self {
        self.config.num_parallel_calls = calls;
        self
    }

    #[must_use]
    pub fn cycle_length(mut self, cycle_length: Parallelism) -> Self {
        self.config.cycle_length = cycle_length;
        self
    }

    #[must_use]
    pub fn block_length(mut self, block_length: Parallelism) -> Self {
        self.config.block_length = block_length;
        self
    }

    #[must_use]
    pub fn prefetch_buffer_size(mut self, batches: usize) -> Self {
        self.config.prefetch_buffer_size = batches;
        self
    }

    #[must_use]
    pub fn max_block_size(mut self, bytes: usize) -> Self {
        self.config.max_block_size = bytes;
        self
    }

    #[must_use]
    pub fn error_mode(mut self, mode: ErrorMode) -> Self {
        self.config.error_mode = mode;
        self
    }

    /// Create a fresh pipeline over this dataset. Threads start on the first
    /// call to [`Iterator::next`].
    ///
    /// # Errors
    /// `Config` if options changed through the builder methods are invalid.
    pub fn iter(&self) -> Result<BatchIterator> {
        self.config.validate()?;
        Ok(BatchIterator::new(Setup {
            config: self.config.clone(),
            files: self.files.clone(),
            plan: Arc::clone(&self.plan),
        }))
    }
}

struct Setup {
    config: PipelineConfig,
    files: Vec<PathBuf>,
    plan: Arc<FeaturePlan>,
}

/// State shared between the consumer and every stage thread.
struct Shared {
    token: CancellationToken,
    status: Mutex<PipelineStatus>,
    failure: Mutex<Option<Error>>,
    cancelled_by_consumer: AtomicBool,
    metrics: Arc<PipelineMetrics>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn status(&self) -> PipelineStatus {
        *lock(&self.status)
    }

    /// Move from `from` to `to`; ignored if the pipeline is elsewhere.
    fn transition(&self, from: PipelineStatus, to: PipelineStatus) -> bool {
        let mut status = lock(&self.status);
        if *status == from {
            *status = to;
            true
        } else {
            false
        }
    }

    /// Record a stage failure and stop every stage. Only the first failure is
    /// kept, and nothing is recorded once the pipeline was cancelled.
    fn fail(&self, err: Error) {
        {
            let mut failure = lock(&self.failure);
            if failure.is_none() && !self.token.is_cancelled() {
                error!(error = %err, "pipeline stage failed");
                *failure = Some(err);
                let mut status = lock(&self.status);
                if !matches!(*status, PipelineStatus::Closed) {
                    *status = PipelineStatus::Failed;
                }
            }
        }
        self.token.cancel();
    }

    fn take_failure(&self) -> Option<Error> {
        lock(&self.failure).take()
    }

    fn cancel(&self) {
        self.cancelled_by_consumer.store(true, Ordering::SeqCst);
        self.token.cancel();
    }
}

/// Cancels a running pipeline from any thread.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.token.is_cancelled()
    }
}

/// Iterator over the batches of one pipeline run.
///
/// Yields `Ok(batch)` until the input is exhausted. A stage failure is yielded
/// once as `Err` and ends the iteration; so is [`Error::Cancelled`] after
/// [`BatchIterator::cancel`]. Dropping the iterator cancels and joins every
/// stage thread.
pub struct BatchIterator {
    shared: Arc<Shared>,
    setup: Option<Setup>,
    prefetcher: Option<Prefetcher<Batch>>,
    workers: Vec<JoinHandle<()>>,
    finished: bool,
}

impl BatchIterator {
    fn new(setup: Setup) -> Self {
        Self {
            shared: Arc::new(Shared {
                token: CancellationToken::new(),
                status: Mutex::new(PipelineStatus::Built),
                failure: Mutex::new(None),
                cancelled_by_consumer: AtomicBool::new(false),
                metrics: Arc::new(PipelineMetrics::new()),
            }),
            setup: Some(setup),
            prefetcher: None,
            workers: Vec::new(),
            finished: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> PipelineStatus {
        self.shared.status()
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Request cancellation. The next pull returns [`Error::Cancelled`].
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Cancel every stage and wait for all threads to exit.
    pub fn shutdown(&mut self) {
        self.shared.token.cancel();
        self.join_all();
    }

    fn join_all(&mut self) {
        if let Some(mut prefetcher) = self.prefetcher.take() {
            prefetcher.join();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        if self.setup.is_none() {
            self.shared.metrics.record_end();
        }
    }

    fn start(&mut self) -> Result<()> {
        let Some(Setup { config, files, plan }) = self.setup.take() else {
            return Ok(());
        };
        let shared = Arc::clone(&self.shared);
        let token = shared.token.clone();
        let metrics = Arc::clone(&shared.metrics);
        shared.transition(PipelineStatus::Built, PipelineStatus::Running);
        metrics.record_start();

        let parallelism = config.resolve_parallelism(files.len());
        info!(
            files = files.len(),
            batch_size = config.batch_size,
            parallel_reads = parallelism.parallel_reads,
            parallel_calls = parallelism.parallel_calls,
            cycle_length = parallelism.cycle_length,
            block_length = parallelism.block_length,
            shuffle_buffer = config.effective_shuffle_buffer_size(),
            deterministic = config.deterministic,
            "starting pipeline"
        );

        let mut source = FileShardIterator::new(files, WorkerShard::whole(), ShardPolicy::RoundRobin, config.num_epochs)?;
        if config.shuffle {
            source = source.with_shuffle(config.shuffle_seed);
        }
        let stream = RecordStream::new(
            Arc::new(source),
            FileContext::opener(Arc::clone(&plan), config.reader_buffer_size, config.max_block_size),
            interleave_policy(&config, parallelism),
            &token,
            Arc::clone(&metrics),
        );

        let capacity = parallelism.parallel_calls * RECORDS_PER_WORKER;
        let raw = Arc::new(BoundedQueue::new(capacity, 1, token.clone()));
        let parsed = Arc::new(BoundedQueue::new(capacity, parallelism.parallel_calls, token.clone()));

        self.workers.push(spawn("ironfeed-interleave", {
            let shared = Arc::clone(&shared);
            let raw = Arc::clone(&raw);
            move || run_interleave(stream, &raw, &shared)
        })?);

        let parser = Parser::new(Arc::clone(&plan));
        for i in 0..parallelism.parallel_calls {
            let shared = Arc::clone(&shared);
            let raw = Arc::clone(&raw);
            let parsed_out = Arc::clone(&parsed);
            let parser = parser.clone();
            let mode = config.error_mode;
            let handle = spawn(&format!("ironfeed-parser-{i}"), move || {
                run_parser(&parser, &raw, &parsed_out, mode, &shared);
            });
            match handle {
                Ok(handle) => self.workers.push(handle),
                Err(e) => {
                    // Let the assembler see the end of input once the spawned workers exit.
                    for _ in i..parallelism.parallel_calls {
                        parsed.close();
                    }
                    return Err(e);
                }
            }
        }

        let assembly = Assembly {
            assembler: BatchAssembler::new(plan),
            batch_size: config.batch_size,
            drop_remainder: config.drop_remainder,
            reorder: config.deterministic,
            shuffle: ShuffleBuffer::new(config.effective_shuffle_buffer_size(), config.shuffle_seed),
        };
        let prefetcher = Prefetcher::spawn("ironfeed-assembler", config.prefetch_buffer_size, &token, {
            let shared = Arc::clone(&shared);
            move |out: &BoundedQueue<Batch>| assembly.run(&parsed, out, &shared)
        })?;
        self.prefetcher = Some(prefetcher);
        Ok(())
    }

    fn finish(&mut self, status: PipelineStatus) {
        self.finished = true;
        self.shutdown();
        match status {
            PipelineStatus::Closed => {
                if self.shared.transition(PipelineStatus::Draining, PipelineStatus::Closed)
                    || self.shared.transition(PipelineStatus::Running, PipelineStatus::Closed)
                {
                    info!(metrics = %self.metrics().to_json(), "pipeline closed");
                }
            }
            _ => {
                let mut current = lock(&self.shared.status);
                if *current != PipelineStatus::Closed {
                    *current = status;
                }
                drop(current);
                info!(status = ?status, metrics = %self.metrics().to_json(), "pipeline stopped");
            }
        }
    }
}

impl Iterator for BatchIterator {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Result<Batch>> {
        if self.finished {
            return None;
        }
        if self.shared.cancelled_by_consumer.load(Ordering::SeqCst) {
            self.finish(PipelineStatus::Closed);
            return Some(Err(Error::Cancelled));
        }
        if self.setup.is_some() {
            if let Err(e) = self.start() {
                self.shared.fail(e);
            }
        }
        if let Some(e) = self.shared.take_failure() {
            self.finish(PipelineStatus::Failed);
            return Some(Err(e));
        }

        let batch = self.prefetcher.as_ref().and_then(Prefetcher::next);
        if let Some(batch) = batch {
            self.shared.metrics.increment(Counter::BatchesEmitted, 1);
            return Some(Ok(batch));
        }

        if let Some(e) = self.shared.take_failure() {
            self.finish(PipelineStatus::Failed);
            return Some(Err(e));
        }
        if self.shared.cancelled_by_consumer.load(Ordering::SeqCst) {
            self.finish(PipelineStatus::Closed);
            return Some(Err(Error::Cancelled));
        }
        self.finish(PipelineStatus::Closed);
        None
    }
}

impl Drop for BatchIterator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn<F>(name: &str, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|e| Error::io(name, e))
}

fn interleave_policy(config: &PipelineConfig, parallelism: ResolvedParallelism) -> InterleavePolicy {
    InterleavePolicy {
        cycle_length: parallelism.cycle_length,
        block_length: parallelism.block_length,
        deterministic: config.deterministic,
    }
}

fn run_interleave(stream: RecordStream, out: &BoundedQueue<(u64, RawRecord)>, shared: &Shared) {
    let _thread = shared.metrics.thread_started();
    let _producer = ProducerGuard::new(out);
    for (seq, record) in (0u64..).zip(stream) {
        match record {
            Ok(record) => {
                if out.push((seq, record)).is_err() {
                    return;
                }
            }
            Err(e) => {
                shared.fail(e);
                return;
            }
        }
    }
}

fn run_parser(
    parser: &Parser,
    input: &BoundedQueue<(u64, RawRecord)>,
    out: &BoundedQueue<(u64, Option<ParsedRecord>)>,
    mode: ErrorMode,
    shared: &Shared,
) {
    let _thread = shared.metrics.thread_started();
    let _producer = ProducerGuard::new(out);
    while let Some((seq, raw)) = input.pop() {
        let parsed = match parser.parse(&raw) {
            Ok(record) => {
                shared.metrics.increment(Counter::RecordsParsed, 1);
                Some(record)
            }
            Err(e) if mode != ErrorMode::FailFast && e.is_record_level() => {
                shared.metrics.increment(Counter::RecordsSkipped, 1);
                if mode == ErrorMode::LogAndContinue {
                    warn!(error = %e, "skipping record");
                }
                None
            }
            Err(e) => {
                shared.fail(e);
                return;
            }
        };
        drop(raw);
        if out.push((seq, parsed)).is_err() {
            return;
        }
    }
}

/// Reorder, shuffle, and batch parsed records on the prefetch thread.
struct Assembly {
    assembler: BatchAssembler,
    batch_size: usize,
    drop_remainder: bool,
    reorder: bool,
    shuffle: ShuffleBuffer<ParsedRecord>,
}

impl Assembly {
    fn run(mut self, input: &BoundedQueue<(u64, Option<ParsedRecord>)>, out: &BoundedQueue<Batch>, shared: &Shared) {
        let _thread = shared.metrics.thread_started();
        let mut pending: BTreeMap<u64, Option<ParsedRecord>> = BTreeMap::new();
        let mut next_seq = 0u64;
        let mut batch = Vec::with_capacity(self.batch_size);

        while let Some((seq, record)) = input.pop() {
            if !self.reorder {
                if !self.accept(record, &mut batch, out, shared) {
                    return;
                }
                continue;
            }
            pending.insert(seq, record);
            while let Some(record) = pending.remove(&next_seq) {
                next_seq += 1;
                if !self.accept(record, &mut batch, out, shared) {
                    return;
                }
            }
        }
        if shared.token.is_cancelled() {
            return;
        }
        shared.transition(PipelineStatus::Running, PipelineStatus::Draining);

        let mut rest: Vec<ParsedRecord> = self.shuffle.drain().collect();
        for record in rest.drain(..) {
            batch.push(record);
            if batch.len() == self.batch_size && !self.emit(&mut batch, out, shared) {
                return;
            }
        }
        if !batch.is_empty() && !self.drop_remainder {
            self.emit(&mut batch, out, shared);
        }
    }

    /// Feed one in-order record (or skipped slot) through the shuffle buffer
    /// into the current batch. Returns `false` once the pipeline is stopping.
    fn accept(
        &mut self,
        record: Option<ParsedRecord>,
        batch: &mut Vec<ParsedRecord>,
        out: &BoundedQueue<Batch>,
        shared: &Shared,
    ) -> bool {
        let Some(record) = record else { return true };
        let Some(record) = self.shuffle.offer(record) else {
            return true;
        };
        batch.push(record);
        if batch.len() < self.batch_size {
            return true;
        }
        self.emit(batch, out, shared)
    }

    fn emit(&self, batch: &mut Vec<ParsedRecord>, out: &BoundedQueue<Batch>, shared: &Shared) -> bool {
        let records = std::mem::replace(batch, Vec::with_capacity(self.batch_size));
        match self.assembler.assemble(&records) {
            Ok(assembled) => out.push(assembled).is_ok(),
            Err(e) => {
                shared.fail(e);
                false
            }
        }
    }
}
