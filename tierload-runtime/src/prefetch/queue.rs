//! Bounded FIFO of regions waiting for a speculative load.

use std::collections::VecDeque;

/// Region ids in the order they were marked for prefetch.
///
/// Lives inside the scheduler state, so it needs no lock of its own.
#[derive(Debug)]
pub struct PrefetchQueue {
    entries: VecDeque<String>,
    max_size: usize,
}

impl PrefetchQueue {
    /// Create a new prefetch queue
    pub fn new(max_size: usize) -> Self {
        Self { entries: VecDeque::with_capacity(max_size.min(64)), max_size }
    }

    /// Add a region at the back.
    ///
    /// Returns false if the queue is full or the region is already queued.
    pub fn push(&mut self, region_id: &str) -> bool {
        if self.entries.len() >= self.max_size || self.contains(region_id) {
            return false;
        }
        self.entries.push_back(region_id.to_string());
        true
    }

    /// Take the oldest entry
    pub fn pop(&mut self) -> Option<String> {
        self.entries.pop_front()
    }

    /// Drop a region, e.g. when it is unregistered
    pub fn remove(&mut self, region_id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|id| id != region_id);
        before != self.entries.len()
    }

    pub fn contains(&self, region_id: &str) -> bool {
        self.entries.iter().any(|id| id == region_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
