//! Event delivery.
//!
//! Events are fire-and-forget: producers hand them to an [`EventSink`] and
//! never wait for processing. The daemon uses a [`ChannelEventSink`] whose
//! receiving end is drained by [`run_event_logger`].

use crate::db::Store;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const EVENT_THRESHOLD_REACHED: u32 = 17;
pub const EVENT_THRESHOLD_REARMED: u32 = 18;
pub const EVENT_SCRIPT_ERROR: u32 = 19;
pub const EVENT_DCI_UNSUPPORTED: u32 = 30;
pub const EVENT_DCI_DISABLED: u32 = 31;
pub const EVENT_DCI_ACTIVE: u32 = 32;

/// Named event argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventParam {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub code: u32,
    /// Object the event is raised on.
    pub source_id: u32,
    pub timestamp: i64,
    pub params: Vec<EventParam>,
}

impl Event {
    pub fn new(code: u32, source_id: u32, timestamp: i64) -> Self {
        Self {
            code,
            source_id,
            timestamp,
            params: Vec::new(),
        }
    }

    /// Append a named argument.
    pub fn with(mut self, name: &str, value: impl ToString) -> Self {
        self.params.push(EventParam {
            name: name.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.iter().find(|p| p.name == name).map(|p| p.value.as_str())
    }
}

pub trait EventSink: Send + Sync {
    fn post_event(&self, event: Event);
}

/// Sink backed by a bounded channel. Events are dropped, with a warning,
/// when the channel is full.
#[derive(Clone)]
pub struct ChannelEventSink {
    tx: mpsc::Sender<Event>,
}

impl ChannelEventSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn post_event(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!("Event queue full, dropping event {} from {}", event.code, event.source_id);
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                tracing::error!("Event queue closed, lost event {} from {}", event.code, event.source_id);
            }
        }
    }
}

/// Log every event and persist it to the event log in batches.
pub async fn run_event_logger(mut rx: mpsc::Receiver<Event>, store: Arc<Store>) {
    let mut buffer: Vec<Event> = Vec::with_capacity(100);
    let mut interval = tokio::time::interval(Duration::from_secs(2));

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        tracing::info!(
                            "Event {} on object {}: {}",
                            event.code,
                            event.source_id,
                            event
                                .params
                                .iter()
                                .map(|p| format!("{}={}", p.name, p.value))
                                .collect::<Vec<_>>()
                                .join(", ")
                        );
                        buffer.push(event);
                        if buffer.len() >= 100 {
                            flush_events(&store, &mut buffer);
                        }
                    }
                    None => {
                        flush_events(&store, &mut buffer);
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_events(&store, &mut buffer);
            }
        }
    }
}

fn flush_events(store: &Store, buffer: &mut Vec<Event>) {
    if buffer.is_empty() {
        return;
    }
    if let Err(e) = store.add_events(buffer) {
        tracing::error!("Failed to persist {} events: {}", buffer.len(), e);
    }
    buffer.clear();
}
