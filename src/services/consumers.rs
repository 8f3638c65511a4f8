//! Registry of objects outside a DCI that read its value cache.

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

/// Cache depth consumers need for a given DCI.
///
/// # Lock ordering
///
/// A DCI calls [`required_depth`](CacheConsumerRegistry::required_depth)
/// while holding its own lock, so implementations may take only their own
/// read lock there. An implementation must never lock a DCI while holding
/// its write lock: mutations return the affected item ids and the caller
/// resizes those items after the write lock is released.
pub trait CacheConsumerRegistry: Send + Sync {
    fn required_depth(&self, item_id: u32) -> usize;
}

/// One consumer's demand on one DCI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheRequirement {
    pub item_id: u32,
    pub depth: usize,
}

/// Consumers (correlation conditions and similar) keyed by consumer id.
#[derive(Debug, Default)]
pub struct ConsumerIndex {
    consumers: RwLock<HashMap<u32, Vec<CacheRequirement>>>,
}

impl ConsumerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a consumer's requirements. Returns the ids of
    /// every DCI whose required depth may have changed.
    pub fn register(&self, consumer_id: u32, requirements: Vec<CacheRequirement>) -> Vec<u32> {
        let mut affected: BTreeSet<u32> = requirements.iter().map(|r| r.item_id).collect();
        let mut consumers = self.consumers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = consumers.insert(consumer_id, requirements) {
            affected.extend(old.iter().map(|r| r.item_id));
        }
        affected.into_iter().collect()
    }

    /// Remove a consumer. Returns the ids of the DCIs it referenced.
    pub fn unregister(&self, consumer_id: u32) -> Vec<u32> {
        let mut consumers = self.consumers.write().unwrap_or_else(PoisonError::into_inner);
        let removed = consumers.remove(&consumer_id).unwrap_or_default();
        let affected: BTreeSet<u32> = removed.iter().map(|r| r.item_id).collect();
        affected.into_iter().collect()
    }
}

impl CacheConsumerRegistry for ConsumerIndex {
    fn required_depth(&self, item_id: u32) -> usize {
        self.consumers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .flatten()
            .filter(|r| r.item_id == item_id)
            .map(|r| r.depth)
            .max()
            .unwrap_or(0)
    }
}
