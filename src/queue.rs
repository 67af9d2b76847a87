//! Bounded hand-off queues and cooperative cancellation between stages.
//!
//! Every stage thread of a pipeline talks to its neighbours through a
//! [`BoundedQueue`]. Producers block while the queue is full, consumers block
//! while it is empty, and both wake up promptly when the shared
//! [`CancellationToken`] fires.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Upper bound on how long a blocked stage waits before re-checking cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Shared cancellation flag. A child token is cancelled when it or any
/// ancestor is.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    parent: Option<Box<CancellationToken>>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that can be cancelled on its own without affecting `self`.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Box::new(self.clone())),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }
}

#[derive(Debug)]
struct State<T> {
    items: VecDeque<T>,
    producers: usize,
}

/// Multi-producer, multi-consumer FIFO with a fixed capacity.
///
/// The queue closes once every registered producer has called
/// [`close`](Self::close); consumers then drain what is left and see `None`.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    token: CancellationToken,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items (at least one) fed by
    /// `producers` producers.
    #[must_use]
    pub fn new(capacity: usize, producers: usize, token: CancellationToken) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity.max(1)),
                producers,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
            token,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Block until there is room, then enqueue `item`.
    ///
    /// # Errors
    /// Hands `item` back if the queue was cancelled or every producer has closed.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.lock();
        loop {
            if self.token.is_cancelled() || state.producers == 0 {
                return Err(item);
            }
            if state.items.len() < self.capacity {
                state.items.push_back(item);
                drop(state);
                self.not_empty.notify_one();
                return Ok(());
            }
            state = self
                .not_full
                .wait_timeout(state, POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Enqueue without waiting.
    ///
    /// # Errors
    /// Hands `item` back if the queue is full, cancelled, or closed.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut state = self.lock();
        if self.token.is_cancelled() || state.producers == 0 || state.items.len() >= self.capacity {
            return Err(item);
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Block until an item is available.
    ///
    /// Returns `None` once the queue is closed and drained, or as soon as it is
    /// cancelled.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if self.token.is_cancelled() {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.producers == 0 {
                return None;
            }
            state = self
                .not_empty
                .wait_timeout(state, POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Dequeue without waiting.
    pub fn try_pop(&self) -> Option<T> {
        if self.token.is_cancelled() {
            return None;
        }
        let item = self.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Whether every producer has closed and nothing is left to pop.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        let state = self.lock();
        state.producers == 0 && state.items.is_empty()
    }

    /// Deregister one producer. The last close wakes every waiter.
    pub fn close(&self) {
        let mut state = self.lock();
        state.producers = state.producers.saturating_sub(1);
        let closed = state.producers == 0;
        drop(state);
        if closed {
            self.not_empty.notify_all();
            self.not_full.notify_all();
        }
    }
}

/// Closes its queue on drop, so a producer that returns early or panics
/// still lets consumers finish.
pub struct ProducerGuard<'a, T> {
    queue: &'a BoundedQueue<T>,
}

impl<'a, T> ProducerGuard<'a, T> {
    pub fn new(queue: &'a BoundedQueue<T>) -> Self {
        Self { queue }
    }
}

impl<T> Drop for ProducerGuard<'_, T> {
    fn drop(&mut self) {
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn fifo_with_backpressure() {
        let queue = Arc::new(BoundedQueue::new(2, 1, CancellationToken::new()));
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let _guard = ProducerGuard::new(&*queue);
                for i in 0..100 {
                    queue.push(i).unwrap();
                    assert!(queue.len() <= 2);
                }
            })
        };
        let received: Vec<i32> = std::iter::from_fn(|| queue.pop()).collect();
        producer.join().unwrap();
        assert_eq!(received, (0..100).collect::<Vec<_>>());
        assert!(queue.is_finished());
    }

    #[test]
    fn closes_after_last_producer() {
        let queue = BoundedQueue::new(4, 2, CancellationToken::new());
        queue.push(1).unwrap();
        queue.close();
        queue.push(2).unwrap();
        queue.close();
        assert_eq!(queue.push(3), Err(3));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn cancellation_unblocks_waiters() {
        let root = CancellationToken::new();
        let token = root.child();
        let queue = Arc::new(BoundedQueue::<u8>::new(1, 1, token));
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(30));
        let start = Instant::now();
        root.cancel();
        assert_eq!(waiter.join().unwrap(), None);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(queue.token().is_cancelled());
        assert_eq!(queue.push(1), Err(1));
    }

    #[test]
    fn child_cancel_does_not_reach_parent() {
        let root = CancellationToken::new();
        let child = root.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
    }
}
