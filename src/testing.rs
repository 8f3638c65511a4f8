//! In-memory collaborators for unit tests.

use crate::db::{DbError, PersistenceGateway};
use crate::dci::{CollectionContext, CollectionSettings, ItemStatus, ItemValue, ThresholdRule};
use crate::node::{Node, NodeContextView};
use crate::services::{ConsumerIndex, Event, EventSink, ScriptError, ScriptHost, StaticClusterResources, TransformScript};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct MemoryGateway {
    pub raw: Mutex<HashMap<u32, ItemValue>>,
    /// (item, timestamp, value) in write order.
    pub history: Mutex<Vec<(u32, i64, String)>>,
    pub threshold_states: Mutex<Vec<(u32, bool, i64)>>,
    pub statuses: Mutex<Vec<(u32, ItemStatus)>>,
    pub deleted: Mutex<Vec<u32>>,
    pub schedules: Mutex<HashMap<u32, Vec<String>>>,
    pub rules: Mutex<HashMap<u32, Vec<ThresholdRule>>>,
    pub fail_reads: AtomicBool,
}

impl MemoryGateway {
    pub fn history_values(&self, item_id: u32) -> Vec<String> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| *id == item_id)
            .map(|(_, _, v)| v.clone())
            .collect()
    }

    fn check_reads(&self) -> Result<(), DbError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            Err(DbError::Migration("reads disabled".to_string()))
        } else {
            Ok(())
        }
    }
}

impl PersistenceGateway for MemoryGateway {
    fn upsert_current_raw_value(&self, item_id: u32, raw: &str, timestamp: i64) {
        self.raw.lock().unwrap().insert(item_id, ItemValue::new(raw, timestamp));
    }

    fn append_history_row(&self, item_id: u32, timestamp: i64, value: &str) {
        self.history.lock().unwrap().push((item_id, timestamp, value.to_string()));
    }

    fn update_threshold_state(&self, threshold_id: u32, reached: bool, last_event_timestamp: i64) {
        self.threshold_states
            .lock()
            .unwrap()
            .push((threshold_id, reached, last_event_timestamp));
    }

    fn update_item_status(&self, item_id: u32, status: ItemStatus) {
        self.statuses.lock().unwrap().push((item_id, status));
    }

    fn delete_item_data(&self, item_id: u32) {
        self.deleted.lock().unwrap().push(item_id);
    }

    fn load_recent_history(&self, item_id: u32, n: usize) -> Result<Vec<ItemValue>, DbError> {
        self.check_reads()?;
        let mut rows: Vec<ItemValue> = self
            .history
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| *id == item_id)
            .map(|(_, ts, v)| ItemValue::new(v.clone(), *ts))
            .collect();
        rows.reverse();
        rows.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));
        rows.truncate(n);
        Ok(rows)
    }

    fn load_current_raw_value(&self, item_id: u32) -> Result<Option<ItemValue>, DbError> {
        self.check_reads()?;
        Ok(self.raw.lock().unwrap().get(&item_id).cloned())
    }

    fn load_schedule_patterns(&self, item_id: u32) -> Result<Vec<String>, DbError> {
        self.check_reads()?;
        Ok(self.schedules.lock().unwrap().get(&item_id).cloned().unwrap_or_default())
    }

    fn save_schedule_patterns(&self, item_id: u32, patterns: &[String]) -> Result<(), DbError> {
        self.schedules.lock().unwrap().insert(item_id, patterns.to_vec());
        Ok(())
    }

    fn load_threshold_rules(&self, item_id: u32) -> Result<Vec<ThresholdRule>, DbError> {
        self.check_reads()?;
        Ok(self.rules.lock().unwrap().get(&item_id).cloned().unwrap_or_default())
    }

    fn save_threshold_rules(&self, item_id: u32, rules: &[ThresholdRule]) -> Result<(), DbError> {
        self.rules.lock().unwrap().insert(item_id, rules.to_vec());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<Event>>,
}

impl RecordingEvents {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn codes(&self) -> Vec<u32> {
        self.events.lock().unwrap().iter().map(|e| e.code).collect()
    }
}

impl EventSink for RecordingEvents {
    fn post_event(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

/// Script host returning a fixed result and recording the node it saw.
pub struct FixedScripts {
    result: Result<Option<String>, ScriptError>,
    pub seen_nodes: Mutex<Vec<u32>>,
}

impl FixedScripts {
    pub fn new(result: Result<Option<String>, ScriptError>) -> Self {
        Self {
            result,
            seen_nodes: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptHost for FixedScripts {
    fn transform(
        &self,
        _script: &TransformScript,
        node: &dyn NodeContextView,
        _value: &ItemValue,
    ) -> Result<Option<String>, ScriptError> {
        self.seen_nodes.lock().unwrap().push(node.node_id());
        self.result.clone()
    }
}

pub struct Harness {
    pub ctx: CollectionContext,
    pub gateway: Arc<MemoryGateway>,
    pub events: Arc<RecordingEvents>,
    pub cluster: Arc<StaticClusterResources>,
    pub consumers: Arc<ConsumerIndex>,
}

pub fn harness() -> Harness {
    harness_with_scripts(Arc::new(FixedScripts::new(Ok(None))))
}

pub fn harness_with_scripts(scripts: Arc<dyn ScriptHost>) -> Harness {
    let gateway = Arc::new(MemoryGateway::default());
    let events = Arc::new(RecordingEvents::default());
    let cluster = Arc::new(StaticClusterResources::new());
    let consumers = Arc::new(ConsumerIndex::new());
    let ctx = CollectionContext {
        persistence: gateway.clone(),
        scripts,
        events: events.clone(),
        cluster: cluster.clone(),
        consumers: consumers.clone(),
        settings: CollectionSettings::default(),
    };
    Harness {
        ctx,
        gateway,
        events,
        cluster,
        consumers,
    }
}

pub fn node(id: u32, name: &str) -> Arc<Node> {
    let mut node = Node::new(id, name);
    node.primary_ip = "10.0.0.1".parse().ok();
    Arc::new(node)
}
