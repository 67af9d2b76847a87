//! Interleaved record stream over many container files.
//!
//! A [`RecordStream`] keeps up to `cycle_length` files open at once. Each open
//! file is read by its own thread into a small block queue, so file I/O and
//! decompression overlap. The stream then takes `block_length` records from
//! one file before moving to the next file in the cycle. An exhausted file is
//! replaced in place by the next file from the [`FileShardIterator`].
//!
//! With `deterministic = true` the cycle is strictly round-robin. Otherwise a
//! file whose next block is already decoded is preferred over one still
//! waiting on I/O.

use crate::error::{Error, RecordOrigin, Result};
use crate::io::container::{Block, BlockReader};
use crate::io::glob::FileShardIterator;
use crate::metrics::{Counter, PipelineMetrics};
use crate::plan::{BoundPlan, FeaturePlan};
use crate::queue::{BoundedQueue, CancellationToken, ProducerGuard};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Blocks buffered ahead per open file.
const BLOCKS_AHEAD: usize = 2;

/// Per-file state shared by every record read from that file.
#[derive(Debug)]
pub struct FileContext {
    path: Arc<Path>,
    bound: BoundPlan,
}

impl FileContext {
    #[must_use]
    pub fn new(path: Arc<Path>, bound: BoundPlan) -> Self {
        Self { path, bound }
    }

    #[must_use]
    pub fn path(&self) -> &Arc<Path> {
        &self.path
    }

    #[must_use]
    pub fn bound(&self) -> &BoundPlan {
        &self.bound
    }

    /// An opener that reads files with `buffer_size` bytes of read-ahead,
    /// rejects blocks over `max_block_size` bytes, and binds `plan` to each
    /// file's writer schema.
    #[must_use]
    pub fn opener(plan: Arc<FeaturePlan>, buffer_size: usize, max_block_size: usize) -> FileOpener {
        Arc::new(move |path: &Path| {
            let reader = BlockReader::open(path, buffer_size)?.with_max_block_size(max_block_size);
            let bound = plan.bind(Arc::clone(reader.writer_schema()), path)?;
            let context = Arc::new(FileContext::new(Arc::clone(reader.path()), bound));
            Ok((reader, context))
        })
    }
}

/// Opens a file and prepares its [`FileContext`].
pub type FileOpener = Arc<dyn Fn(&Path) -> Result<(BlockReader, Arc<FileContext>)> + Send + Sync>;

/// One encoded record, kept alive by a shared handle on its block.
#[derive(Debug, Clone)]
pub struct RawRecord {
    file: Arc<FileContext>,
    block: Arc<Block>,
    index: usize,
}

impl RawRecord {
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        self.block.record(self.index).unwrap_or_default()
    }

    #[must_use]
    pub fn bound(&self) -> &BoundPlan {
        &self.file.bound
    }

    #[must_use]
    pub fn path(&self) -> &Arc<Path> {
        &self.file.path
    }

    #[must_use]
    pub fn origin(&self) -> RecordOrigin {
        RecordOrigin {
            path: Arc::clone(&self.file.path),
            block_index: self.block.index(),
            record_index: self.index as u64,
            record_offset: self.block.record_offset(self.index).unwrap_or_default(),
        }
    }
}

/// Interleave knobs, already resolved to concrete values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterleavePolicy {
    pub cycle_length: usize,
    pub block_length: usize,
    pub deterministic: bool,
}

impl Default for InterleavePolicy {
    fn default() -> Self {
        Self {
            cycle_length: 1,
            block_length: 1,
            deterministic: true,
        }
    }
}

type Fetched = Result<(Arc<FileContext>, Arc<Block>)>;

struct Slot {
    queue: Arc<BoundedQueue<Fetched>>,
    handle: Option<JoinHandle<()>>,
    current: Option<(Arc<FileContext>, Arc<Block>, usize)>,
}

enum Poll {
    Record(RawRecord),
    Exhausted,
    Failed(Error),
}

impl Slot {
    fn spawn(
        path: &Path,
        opener: &FileOpener,
        token: &CancellationToken,
        metrics: &Arc<PipelineMetrics>,
    ) -> Self {
        let queue = Arc::new(BoundedQueue::new(BLOCKS_AHEAD, 1, token.clone()));
        let handle = {
            let queue = Arc::clone(&queue);
            let opener = Arc::clone(opener);
            let metrics = Arc::clone(metrics);
            let path = path.to_path_buf();
            thread::Builder::new()
                .name("ironfeed-reader".into())
                .spawn(move || read_file(&path, &opener, &queue, &metrics))
        };
        match handle {
            Ok(handle) => Self {
                queue,
                handle: Some(handle),
                current: None,
            },
            Err(e) => {
                let _ = queue.try_push(Err(Error::io(path, e)));
                queue.close();
                Self {
                    queue,
                    handle: None,
                    current: None,
                }
            }
        }
    }

    /// Next record of this file, blocking on its reader thread if needed.
    fn poll(&mut self) -> Poll {
        loop {
            if let Some((file, block, index)) = &mut self.current {
                if *index < block.len() {
                    let record = RawRecord {
                        file: Arc::clone(file),
                        block: Arc::clone(block),
                        index: *index,
                    };
                    *index += 1;
                    return Poll::Record(record);
                }
                self.current = None;
            }
            match self.queue.pop() {
                Some(Ok((file, block))) => self.current = Some((file, block, 0)),
                Some(Err(e)) => return Poll::Failed(e),
                None => return Poll::Exhausted,
            }
        }
    }

    /// Whether [`Slot::poll`] would return without blocking.
    fn is_ready(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|(_, block, index)| *index < block.len())
            || !self.queue.is_empty()
            || self.queue.is_finished()
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn read_file(
    path: &Path,
    opener: &FileOpener,
    queue: &BoundedQueue<Fetched>,
    metrics: &Arc<PipelineMetrics>,
) {
    let _thread = metrics.thread_started();
    let _producer = ProducerGuard::new(queue);
    let (reader, context) = match opener(path) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = queue.push(Err(e));
            return;
        }
    };
    let _open = metrics.open_file();
    debug!(path = %path.display(), codec = reader.codec_name(), "opened file");
    let mut blocks = 0u64;
    for block in reader {
        match block {
            Ok(block) => {
                blocks += 1;
                metrics.increment(Counter::BlocksRead, 1);
                if queue.push(Ok((Arc::clone(&context), Arc::new(block)))).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = queue.push(Err(e));
                break;
            }
        }
    }
    debug!(path = %path.display(), blocks, "closed file");
}

/// Flattens many files into one stream of [`RawRecord`]s.
pub struct RecordStream {
    files: Arc<FileShardIterator>,
    opener: FileOpener,
    policy: InterleavePolicy,
    token: CancellationToken,
    metrics: Arc<PipelineMetrics>,
    slots: Vec<Option<Slot>>,
    cursor: usize,
    taken: usize,
    started: bool,
    done: bool,
}

impl RecordStream {
    /// A stream over `files`. Reader threads start on the first pull and stop
    /// when `token` (or the stream's own child token) is cancelled.
    #[must_use]
    pub fn new(
        files: Arc<FileShardIterator>,
        opener: FileOpener,
        policy: InterleavePolicy,
        token: &CancellationToken,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let policy = InterleavePolicy {
            cycle_length: policy.cycle_length.max(1),
            block_length: policy.block_length.max(1),
            deterministic: policy.deterministic,
        };
        Self {
            files,
            opener,
            policy,
            token: token.child(),
            metrics,
            slots: Vec::new(),
            cursor: 0,
            taken: 0,
            started: false,
            done: false,
        }
    }

    #[must_use]
    pub fn policy(&self) -> InterleavePolicy {
        self.policy
    }

    fn open_next(&self) -> Option<Slot> {
        let path = self.files.next_file()?;
        Some(Slot::spawn(&path, &self.opener, &self.token, &self.metrics))
    }

    fn start(&mut self) {
        self.started = true;
        for _ in 0..self.policy.cycle_length {
            let Some(slot) = self.open_next() else { break };
            self.slots.push(Some(slot));
        }
    }

    fn advance(&mut self) {
        self.taken = 0;
        if !self.slots.is_empty() {
            self.cursor = (self.cursor + 1) % self.slots.len();
        }
    }

    /// Next active slot at or after the cursor.
    fn seek_active(&mut self) -> bool {
        for _ in 0..self.slots.len() {
            if self.slots[self.cursor].is_some() {
                return true;
            }
            self.advance();
        }
        false
    }

    /// In non-deterministic mode, jump to a slot that can deliver immediately.
    fn prefer_ready(&mut self) {
        let current_ready = self.slots[self.cursor].as_ref().is_some_and(Slot::is_ready);
        if current_ready {
            return;
        }
        let n = self.slots.len();
        for step in 1..n {
            let i = (self.cursor + step) % n;
            if self.slots[i].as_ref().is_some_and(Slot::is_ready) {
                self.cursor = i;
                self.taken = 0;
                return;
            }
        }
    }

    fn shutdown(&mut self) {
        self.token.cancel();
        for slot in self.slots.iter_mut().flatten() {
            slot.join();
        }
        self.slots.clear();
    }
}

impl Iterator for RecordStream {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.start();
        }
        loop {
            if self.done || self.token.is_cancelled() {
                return None;
            }
            if !self.seek_active() {
                self.done = true;
                return None;
            }
            if !self.policy.deterministic {
                self.prefer_ready();
            }
            let cursor = self.cursor;
            let Some(slot) = self.slots[cursor].as_mut() else {
                continue;
            };
            match slot.poll() {
                Poll::Record(record) => {
                    self.metrics.increment(Counter::RecordsRead, 1);
                    self.taken += 1;
                    if self.taken >= self.policy.block_length {
                        self.advance();
                    }
                    return Some(Ok(record));
                }
                Poll::Failed(e) => {
                    self.done = true;
                    self.shutdown();
                    return Some(Err(e));
                }
                Poll::Exhausted => {
                    slot.join();
                    if self.token.is_cancelled() {
                        return None;
                    }
                    self.slots[cursor] = self.open_next();
                    self.advance();
                }
            }
        }
    }
}

impl Drop for RecordStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}
