//! Persistence gateway used by the collection core.
//!
//! Writes issued while a DCI lock is held are fire-and-forget: failures are
//! logged by the gateway and never reach the caller. Reads return errors so
//! callers can fall back (a cache backfill pads with placeholders).

use super::models::WriteRequest;
use super::store::{DbError, Store};
use crate::dci::{ItemStatus, ItemValue, ThresholdRule};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub trait PersistenceGateway: Send + Sync {
    fn upsert_current_raw_value(&self, item_id: u32, raw: &str, timestamp: i64);
    fn append_history_row(&self, item_id: u32, timestamp: i64, value: &str);
    fn update_threshold_state(&self, threshold_id: u32, reached: bool, last_event_timestamp: i64);
    fn update_item_status(&self, item_id: u32, status: ItemStatus);
    /// Drop everything stored for an item.
    fn delete_item_data(&self, item_id: u32);

    /// Up to `n` most recent history values, newest first.
    fn load_recent_history(&self, item_id: u32, n: usize) -> Result<Vec<ItemValue>, DbError>;
    fn load_current_raw_value(&self, item_id: u32) -> Result<Option<ItemValue>, DbError>;
    fn load_schedule_patterns(&self, item_id: u32) -> Result<Vec<String>, DbError>;
    fn save_schedule_patterns(&self, item_id: u32, patterns: &[String]) -> Result<(), DbError>;
    /// Threshold rules in evaluation order.
    fn load_threshold_rules(&self, item_id: u32) -> Result<Vec<ThresholdRule>, DbError>;
    fn save_threshold_rules(&self, item_id: u32, rules: &[ThresholdRule]) -> Result<(), DbError>;
}

fn log_write_error(what: &str, item_id: u32, result: Result<(), DbError>) {
    if let Err(e) = result {
        tracing::error!("Failed to write {} for item {}: {}", what, item_id, e);
    }
}

/// Synchronous gateway writing straight to SQLite.
impl PersistenceGateway for Store {
    fn upsert_current_raw_value(&self, item_id: u32, raw: &str, timestamp: i64) {
        log_write_error("raw value", item_id, self.upsert_raw_value(item_id, raw, timestamp));
    }

    fn append_history_row(&self, item_id: u32, timestamp: i64, value: &str) {
        log_write_error("history", item_id, self.add_history(item_id, timestamp, value));
    }

    fn update_threshold_state(&self, threshold_id: u32, reached: bool, last_event_timestamp: i64) {
        if let Err(e) = Store::update_threshold_state(self, threshold_id, reached, last_event_timestamp) {
            tracing::error!("Failed to write state of threshold {}: {}", threshold_id, e);
        }
    }

    fn update_item_status(&self, item_id: u32, status: ItemStatus) {
        log_write_error("status", item_id, Store::update_item_status(self, item_id, status.code()));
    }

    fn delete_item_data(&self, item_id: u32) {
        log_write_error("deletion", item_id, self.delete_item(item_id));
    }

    fn load_recent_history(&self, item_id: u32, n: usize) -> Result<Vec<ItemValue>, DbError> {
        self.get_recent_history(item_id, n)
    }

    fn load_current_raw_value(&self, item_id: u32) -> Result<Option<ItemValue>, DbError> {
        self.get_raw_value(item_id)
    }

    fn load_schedule_patterns(&self, item_id: u32) -> Result<Vec<String>, DbError> {
        self.get_schedules(item_id)
    }

    fn save_schedule_patterns(&self, item_id: u32, patterns: &[String]) -> Result<(), DbError> {
        self.save_schedules(item_id, patterns)
    }

    fn load_threshold_rules(&self, item_id: u32) -> Result<Vec<ThresholdRule>, DbError> {
        self.get_thresholds(item_id)
    }

    fn save_threshold_rules(&self, item_id: u32, rules: &[ThresholdRule]) -> Result<(), DbError> {
        self.save_thresholds(item_id, rules)
    }
}

/// Write-behind gateway: writes are queued and flushed in batches by a
/// background task, reads go to the store directly.
///
/// When the queue is full a write is applied synchronously instead of being
/// dropped.
pub struct QueuedGateway {
    store: Arc<Store>,
    tx: mpsc::Sender<WriteRequest>,
}

impl QueuedGateway {
    /// Create the gateway and spawn its batch writer. Must be called from
    /// within a tokio runtime. The writer exits after its final flush once
    /// every clone of the gateway is dropped.
    pub fn new(store: Arc<Store>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity);
        let writer = tokio::spawn(run_batch_writer(rx, store.clone()));
        (Self { store, tx }, writer)
    }

    fn enqueue(&self, request: WriteRequest) {
        match self.tx.try_send(request) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(request)) | Err(mpsc::error::TrySendError::Closed(request)) => {
                tracing::debug!("Write queue unavailable, writing through");
                if let Err(e) = self.store.apply_writes(std::slice::from_ref(&request)) {
                    tracing::error!("Failed to write {:?}: {}", request, e);
                }
            }
        }
    }
}

impl PersistenceGateway for QueuedGateway {
    fn upsert_current_raw_value(&self, item_id: u32, raw: &str, timestamp: i64) {
        self.enqueue(WriteRequest::RawValue {
            item_id,
            raw: raw.to_string(),
            timestamp,
        });
    }

    fn append_history_row(&self, item_id: u32, timestamp: i64, value: &str) {
        self.enqueue(WriteRequest::History {
            item_id,
            timestamp,
            value: value.to_string(),
        });
    }

    fn update_threshold_state(&self, threshold_id: u32, reached: bool, last_event_timestamp: i64) {
        self.enqueue(WriteRequest::ThresholdState {
            threshold_id,
            reached,
            last_event_timestamp,
        });
    }

    fn update_item_status(&self, item_id: u32, status: ItemStatus) {
        self.enqueue(WriteRequest::ItemStatus {
            item_id,
            status: status.code(),
        });
    }

    fn delete_item_data(&self, item_id: u32) {
        self.enqueue(WriteRequest::DeleteItem { item_id });
    }

    fn load_recent_history(&self, item_id: u32, n: usize) -> Result<Vec<ItemValue>, DbError> {
        self.store.get_recent_history(item_id, n)
    }

    fn load_current_raw_value(&self, item_id: u32) -> Result<Option<ItemValue>, DbError> {
        self.store.get_raw_value(item_id)
    }

    fn load_schedule_patterns(&self, item_id: u32) -> Result<Vec<String>, DbError> {
        self.store.get_schedules(item_id)
    }

    fn save_schedule_patterns(&self, item_id: u32, patterns: &[String]) -> Result<(), DbError> {
        self.store.save_schedules(item_id, patterns)
    }

    fn load_threshold_rules(&self, item_id: u32) -> Result<Vec<ThresholdRule>, DbError> {
        self.store.get_thresholds(item_id)
    }

    fn save_threshold_rules(&self, item_id: u32, rules: &[ThresholdRule]) -> Result<(), DbError> {
        self.store.save_thresholds(item_id, rules)
    }
}

/// Accumulate queued writes and flush them every 2 seconds or every 500
/// requests.
async fn run_batch_writer(mut rx: mpsc::Receiver<WriteRequest>, store: Arc<Store>) {
    let mut buffer: Vec<WriteRequest> = Vec::with_capacity(500);
    let mut interval = tokio::time::interval(Duration::from_secs(2));

    loop {
        tokio::select! {
            request = rx.recv() => {
                match request {
                    Some(r) => {
                        buffer.push(r);
                        if buffer.len() >= 500 {
                            flush_buffer(&store, &mut buffer);
                        }
                    }
                    None => {
                        flush_buffer(&store, &mut buffer);
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(&store, &mut buffer);
            }
        }
    }
}

fn flush_buffer(store: &Store, buffer: &mut Vec<WriteRequest>) {
    if buffer.is_empty() {
        return;
    }

    if let Err(e) = store.apply_writes(buffer) {
        tracing::error!("Failed to flush {} queued writes: {}", buffer.len(), e);
    }

    buffer.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_queued_writes_flush_on_close() {
        let file = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(file.path()).unwrap());
        let (tx, rx) = mpsc::channel(16);
        let writer = tokio::spawn(run_batch_writer(rx, store.clone()));
        let gateway = QueuedGateway { store: store.clone(), tx };

        gateway.upsert_current_raw_value(4, "17", 100);
        gateway.append_history_row(4, 100, "17");
        drop(gateway);
        writer.await.unwrap();

        assert_eq!(store.get_raw_value(4).unwrap(), Some(ItemValue::new("17", 100)));
        assert_eq!(store.get_recent_history(4, 5).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_writer_handle_flushes_after_drop() {
        let file = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(file.path()).unwrap());
        let (gateway, writer) = QueuedGateway::new(store.clone(), 16);

        gateway.append_history_row(2, 50, "x");
        drop(gateway);
        tokio::time::timeout(Duration::from_secs(1), writer).await.unwrap().unwrap();

        assert_eq!(store.get_recent_history(2, 5).unwrap(), vec![ItemValue::new("x", 50)]);
    }

    #[tokio::test]
    async fn test_full_queue_writes_through() {
        let file = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(file.path()).unwrap());
        // Receiver kept but never drained
        let (tx, _rx) = mpsc::channel(1);
        let gateway = QueuedGateway { store: store.clone(), tx };

        gateway.append_history_row(9, 1, "a");
        gateway.append_history_row(9, 2, "b");
        let stored = store.get_recent_history(9, 5).unwrap();
        assert_eq!(stored, vec![ItemValue::new("b", 2)]);
    }

    #[test]
    fn test_store_gateway_reads() {
        let file = NamedTempFile::new().unwrap();
        let store = Store::new(file.path()).unwrap();
        let gateway: &dyn PersistenceGateway = &store;
        gateway.append_history_row(1, 5, "x");
        gateway.save_schedule_patterns(1, &["* * * * *".to_string()]).unwrap();
        assert_eq!(gateway.load_recent_history(1, 3).unwrap().len(), 1);
        assert_eq!(gateway.load_schedule_patterns(1).unwrap().len(), 1);
        assert_eq!(gateway.load_current_raw_value(1).unwrap(), None);
    }
}
