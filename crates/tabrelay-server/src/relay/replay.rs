//! Bounded chunk buffer for replay to late-joining clients.
//!
//! Stores the last K upstream output chunks so that a newly attached client
//! can be brought up to date without the server keeping unbounded history.

use std::collections::VecDeque;

/// Default number of chunks retained per tab.
pub const DEFAULT_REPLAY_CAPACITY: usize = 1000;

/// A fixed-capacity FIFO of output chunks. Oldest chunks are evicted first.
#[derive(Debug)]
pub struct ReplayBuffer {
    chunks: VecDeque<Vec<u8>>,
    capacity: usize,
}

impl ReplayBuffer {
    /// Create a new replay buffer holding at most `capacity` chunks.
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::with_capacity(capacity.min(DEFAULT_REPLAY_CAPACITY)),
            capacity,
        }
    }

    /// Append a chunk, evicting the oldest one if full.
    pub fn append(&mut self, chunk: Vec<u8>) {
        if self.capacity == 0 {
            return;
        }
        if self.chunks.len() == self.capacity {
            self.chunks.pop_front();
        }
        self.chunks.push_back(chunk);
    }

    /// Copy of all retained chunks, oldest first.
    ///
    /// The copy is detached from the buffer, so later appends never show up in
    /// (or reorder) a snapshot already taken.
    pub fn snapshot(&self) -> Vec<Vec<u8>> {
        self.chunks.iter().cloned().collect()
    }

    /// Number of chunks currently retained.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_CAPACITY)
    }
}
