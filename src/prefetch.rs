//! Background producer feeding a bounded queue of ready items.
//!
//! The pipeline's last stage runs on a [`Prefetcher`] thread so the consumer
//! only ever waits for a batch that is not yet assembled. The producer
//! blocks once `capacity` items are waiting; the consumer blocks until an item
//! arrives, the producer finishes, or the pipeline is cancelled.

use crate::error::{Error, Result};
use crate::queue::{BoundedQueue, CancellationToken, ProducerGuard};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub struct Prefetcher<T: Send + 'static> {
    queue: Arc<BoundedQueue<T>>,
    handle: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Prefetcher<T> {
    /// Run `producer` on a named thread, handing it the queue to fill.
    /// A capacity of 0 is treated as 1, a single-item hand-off.
    ///
    /// # Errors
    /// `Io` if the thread cannot be spawned.
    pub fn spawn<F>(name: &str, capacity: usize, token: &CancellationToken, producer: F) -> Result<Self>
    where
        F: FnOnce(&BoundedQueue<T>) + Send + 'static,
    {
        let queue = Arc::new(BoundedQueue::new(capacity.max(1), 1, token.clone()));
        let handle = {
            let queue = Arc::clone(&queue);
            thread::Builder::new()
                .name(name.to_string())
                .spawn(move || {
                    let _producer = ProducerGuard::new(&*queue);
                    producer(&queue);
                })
                .map_err(|e| Error::io(name, e))?
        };
        Ok(Self {
            queue,
            handle: Some(handle),
        })
    }

    /// Block until the next item is ready. `None` once the producer is done or
    /// the pipeline is cancelled.
    pub fn next(&self) -> Option<T> {
        self.queue.pop()
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Wait for the producer thread to exit.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl<T: Send + 'static> Drop for Prefetcher<T> {
    fn drop(&mut self) {
        self.queue.token().cancel();
        self.join();
    }
}
