//! Fixed-capacity shuffle buffer.
//!
//! Items enter a buffer of `capacity` slots; once it is full, each new item
//! evicts a uniformly chosen resident, which is emitted. At end of input the
//! remaining residents are emitted in random order. With a seed the output
//! order is a pure function of the input order.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Reservoir-style shuffler over items of type `T`.
#[derive(Debug)]
pub struct ShuffleBuffer<T> {
    slots: Vec<T>,
    capacity: usize,
    rng: StdRng,
}

impl<T> ShuffleBuffer<T> {
    /// A buffer of `capacity` slots. Capacity 0 disables shuffling.
    #[must_use]
    pub fn new(capacity: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            slots: Vec::with_capacity(capacity.min(1 << 16)),
            capacity,
            rng,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Add `item`; returns the item to emit, if any.
    pub fn offer(&mut self, item: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(item);
        }
        if self.slots.len() < self.capacity {
            self.slots.push(item);
            return None;
        }
        let i = self.rng.random_range(0..self.slots.len());
        Some(std::mem::replace(&mut self.slots[i], item))
    }

    /// Emit one buffered item chosen at random.
    pub fn pop(&mut self) -> Option<T> {
        if self.slots.is_empty() {
            return None;
        }
        let i = self.rng.random_range(0..self.slots.len());
        Some(self.slots.swap_remove(i))
    }

    /// Emit every buffered item in random order.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        std::iter::from_fn(move || self.pop())
    }
}

/// Iterator adapter that shuffles `inner` through a [`ShuffleBuffer`].
#[derive(Debug)]
pub struct Shuffle<I: Iterator> {
    inner: I,
    buffer: ShuffleBuffer<I::Item>,
    exhausted: bool,
}

impl<I: Iterator> Shuffle<I> {
    pub fn new(inner: I, capacity: usize, seed: Option<u64>) -> Self {
        Self {
            inner,
            buffer: ShuffleBuffer::new(capacity, seed),
            exhausted: false,
        }
    }
}

impl<I: Iterator> Iterator for Shuffle<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.exhausted {
            match self.inner.next() {
                Some(item) => {
                    if let Some(out) = self.buffer.offer(item) {
                        return Some(out);
                    }
                }
                None => self.exhausted = true,
            }
        }
        self.buffer.pop()
    }
}
