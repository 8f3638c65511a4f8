//! Bounded most-recent-first value cache.

use super::value::ItemValue;
use std::collections::VecDeque;

/// Most recent values of one DCI, newest first.
///
/// Capacity is the DCI's required depth. Positions that could not be
/// backfilled from history hold placeholder values, which are never counted
/// as samples.
#[derive(Debug, Clone, Default)]
pub struct ValueCache {
    values: VecDeque<ItemValue>,
    capacity: usize,
}

impl ValueCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of stored entries, placeholders included.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Newest real sample, if any.
    pub fn head(&self) -> Option<&ItemValue> {
        self.values.front().filter(|v| !v.is_placeholder())
    }

    pub fn get(&self, index: usize) -> Option<&ItemValue> {
        self.values.get(index)
    }

    /// Real samples, newest first, stopping at the first placeholder.
    pub fn samples(&self) -> impl Iterator<Item = &ItemValue> {
        self.values.iter().take_while(|v| !v.is_placeholder())
    }

    pub fn sample_count(&self) -> usize {
        self.samples().count()
    }

    /// Insert a value at the head, evicting the oldest entry when full.
    pub fn push(&mut self, value: ItemValue) {
        if self.capacity == 0 {
            return;
        }
        if self.values.len() >= self.capacity {
            self.values.pop_back();
        }
        self.values.push_front(value);
    }

    /// Shrink to `capacity`, dropping the oldest entries.
    pub fn shrink_to(&mut self, capacity: usize) {
        self.values.truncate(capacity);
        self.capacity = capacity;
    }

    /// Replace the content with `history` (newest first), padding up to
    /// `capacity` with placeholders.
    pub fn refill(&mut self, capacity: usize, history: Vec<ItemValue>) {
        self.values = history.into_iter().take(capacity).collect();
        self.pad_to(capacity);
    }

    /// Grow to `capacity` keeping current entries, padding the tail with
    /// placeholders.
    pub fn pad_to(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.values.truncate(capacity);
        while self.values.len() < capacity {
            self.values.push_back(ItemValue::placeholder());
        }
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}
