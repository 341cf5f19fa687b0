//! Dedup window for fact delivery

use std::collections::{HashSet, VecDeque};

use tabsync_core::Topic;

/// Remembers the most recent `capacity` (topic, signature) pairs.
/// The oldest pair is forgotten first.
#[derive(Clone, Debug)]
pub struct DedupWindow {
    capacity: usize,
    order: VecDeque<(Topic, u64)>,
    seen: HashSet<(Topic, u64)>,
}

impl DedupWindow {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        DedupWindow {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// True if the pair has not been seen within the window
    pub fn check(&self, topic: &Topic, signature: u64) -> bool {
        !self.seen.contains(&(topic.clone(), signature))
    }

    /// Record the pair. Returns false for a duplicate.
    pub fn accept(&mut self, topic: &Topic, signature: u64) -> bool {
        let entry = (topic.clone(), signature);
        if self.seen.contains(&entry) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(entry.clone());
        self.seen.insert(entry);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
