//! Bounded FIFO log of accepted readings for the trend timeline.

use crate::types::HistoryEntry;
use std::collections::VecDeque;

/// Default timeline length shown by the demo panel.
pub const DEFAULT_HISTORY_CAPACITY: usize = 10;

#[derive(Debug, Clone)]
pub struct History {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl History {
    /// A capacity of zero is bumped to one so the latest reading always fits.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append, evicting the oldest entry when full. Returns the evicted entry.
    pub fn push(&mut self, entry: HistoryEntry) -> Option<HistoryEntry> {
        let evicted = if self.entries.len() == self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }
}

impl Default for History {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }
}
