//! Retention manager for deleting expired history.

use super::registry::ItemRegistry;
use crate::db::Store;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

const SECONDS_PER_DAY: i64 = 86_400;

/// Periodically deletes history rows older than each item's retention time.
pub struct RetentionManager {
    registry: Arc<ItemRegistry>,
    store: Arc<Store>,
    interval: Duration,
    stop: broadcast::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RetentionManager {
    pub fn new(registry: Arc<ItemRegistry>, store: Arc<Store>, interval: Duration) -> Self {
        let (stop, _) = broadcast::channel(1);
        Self {
            registry,
            store,
            interval,
            stop,
            handle: Mutex::new(None),
        }
    }

    /// Start the background task.
    pub async fn start(&self) {
        let registry = self.registry.clone();
        let store = self.store.clone();
        let mut rx = self.stop.subscribe();
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        let deleted = process_retention(&registry, &store, Utc::now().timestamp());
                        if deleted > 0 {
                            tracing::info!("RetentionManager: Deleted {} expired history rows", deleted);
                        }
                    }
                }
            }
        });
        *self.handle.lock().await = Some(handle);
    }

    /// Stop the background task and wait for it.
    pub async fn stop(&self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

/// Delete expired history for every item. Items with a retention time of
/// zero keep their history forever. Returns the number of rows deleted.
pub fn process_retention(registry: &ItemRegistry, store: &Store, now: i64) -> usize {
    let mut total = 0;
    for item in registry.items() {
        let days = item.config().retention_days;
        if days == 0 {
            continue;
        }
        let cutoff = now - i64::from(days) * SECONDS_PER_DAY;
        match store.delete_history_before(item.id(), cutoff) {
            Ok(n) => total += n,
            Err(e) => {
                tracing::error!("RetentionManager: Failed to delete history for item {}: {}", item.id(), e);
            }
        }
    }
    total
}
