//! Counters and gauges for one pipeline run.
//!
//! Every stage holds an `Arc<PipelineMetrics>` and bumps lock-free counters as
//! it works. Consumers take a [`MetricsSnapshot`] at any time and can print it
//! or save it as JSON.
//!
//! # Example
//!
//! ```no_run
//! # fn demo(iter: &ironfeed::BatchIterator) -> anyhow::Result<()> {
//! let snapshot = iter.metrics();
//! snapshot.print();
//! snapshot.save_to_file("metrics.json")?;
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use serde::Serialize;
use serde_json::{Value, json};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic counters tracked by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    FilesOpened,
    BlocksRead,
    RecordsRead,
    RecordsParsed,
    RecordsSkipped,
    BatchesEmitted,
}

/// Thread-safe counters shared by all stages of one pipeline.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    files_opened: AtomicU64,
    blocks_read: AtomicU64,
    records_read: AtomicU64,
    records_parsed: AtomicU64,
    records_skipped: AtomicU64,
    batches_emitted: AtomicU64,
    open_files: AtomicU64,
    active_threads: AtomicU64,
    started: Mutex<Option<Instant>>,
    finished: Mutex<Option<Instant>>,
}

impl PipelineMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::FilesOpened => &self.files_opened,
            Counter::BlocksRead => &self.blocks_read,
            Counter::RecordsRead => &self.records_read,
            Counter::RecordsParsed => &self.records_parsed,
            Counter::RecordsSkipped => &self.records_skipped,
            Counter::BatchesEmitted => &self.batches_emitted,
        }
    }

    pub fn increment(&self, counter: Counter, by: u64) {
        self.counter(counter).fetch_add(by, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self, counter: Counter) -> u64 {
        self.counter(counter).load(Ordering::Relaxed)
    }

    pub fn record_start(&self) {
        if let Ok(mut started) = self.started.lock() {
            started.get_or_insert_with(Instant::now);
        }
    }

    pub fn record_end(&self) {
        if let Ok(mut finished) = self.finished.lock() {
            finished.get_or_insert_with(Instant::now);
        }
    }

    /// Wall time between the first pull and the end of the stream.
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        let started = *self.started.lock().ok()?;
        let finished = *self.finished.lock().ok()?;
        Some(finished?.duration_since(started?))
    }

    /// Track one open file until the guard is dropped.
    #[must_use]
    pub fn open_file(self: &Arc<Self>) -> GaugeGuard {
        self.increment(Counter::FilesOpened, 1);
        GaugeGuard::new(Arc::clone(self), Gauge::OpenFiles)
    }

    /// Track one running stage thread until the guard is dropped.
    #[must_use]
    pub fn thread_started(self: &Arc<Self>) -> GaugeGuard {
        GaugeGuard::new(Arc::clone(self), Gauge::ActiveThreads)
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            files_opened: self.get(Counter::FilesOpened),
            blocks_read: self.get(Counter::BlocksRead),
            records_read: self.get(Counter::RecordsRead),
            records_parsed: self.get(Counter::RecordsParsed),
            records_skipped: self.get(Counter::RecordsSkipped),
            batches_emitted: self.get(Counter::BatchesEmitted),
            open_files: self.open_files.load(Ordering::SeqCst),
            active_threads: self.active_threads.load(Ordering::SeqCst),
            elapsed_ms: self.elapsed().map(|d| d.as_millis() as u64),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Gauge {
    OpenFiles,
    ActiveThreads,
}

/// Decrements its gauge on drop.
#[derive(Debug)]
pub struct GaugeGuard {
    metrics: Arc<PipelineMetrics>,
    gauge: Gauge,
}

impl GaugeGuard {
    fn new(metrics: Arc<PipelineMetrics>, gauge: Gauge) -> Self {
        metrics.gauge(gauge).fetch_add(1, Ordering::SeqCst);
        Self { metrics, gauge }
    }
}

impl PipelineMetrics {
    fn gauge(&self, gauge: Gauge) -> &AtomicU64 {
        match gauge {
            Gauge::OpenFiles => &self.open_files,
            Gauge::ActiveThreads => &self.active_threads,
        }
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.metrics
            .gauge(self.gauge)
            .fetch_sub(1, Ordering::SeqCst);
    }
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub files_opened: u64,
    pub blocks_read: u64,
    pub records_read: u64,
    pub records_parsed: u64,
    pub records_skipped: u64,
    pub batches_emitted: u64,
    pub open_files: u64,
    pub active_threads: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

impl MetricsSnapshot {
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!(self)
    }

    /// Print all metrics to stdout in a human-readable format.
    pub fn print(&self) {
        println!("\n========== Pipeline Metrics ==========");
        if let Some(ms) = self.elapsed_ms {
            println!("Execution Time: {:.3}s ({ms} ms)", ms as f64 / 1000.0);
            println!("--------------------------------------");
        }
        if let Value::Object(fields) = self.to_json() {
            for (name, value) in fields {
                if name != "elapsed_ms" {
                    println!("{name}: {value}");
                }
            }
        }
        println!("======================================\n");
    }

    /// Save the snapshot as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written to.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        let formatted = serde_json::to_string_pretty(&self.to_json())?;
        file.write_all(formatted.as_bytes())?;
        Ok(())
    }
}
