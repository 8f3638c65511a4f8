//! Database row types.

use serde::{Deserialize, Serialize};

/// A row of the `items` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: u32,
    /// Owning node, 0 when the item belongs to a template.
    pub node_id: u32,
    pub template_id: u32,
    pub name: String,
    pub description: String,
    pub instance: String,
    pub data_type: i32,
    pub source: i32,
    pub polling_interval: i64,
    pub retention_days: u32,
    pub delta_mode: i32,
    pub status: i32,
    pub advanced_schedule: bool,
    pub resource_id: u32,
    pub proxy_node_id: u32,
    pub process_all_thresholds: bool,
    pub transformation_script: String,
}

impl Default for ItemRecord {
    fn default() -> Self {
        Self {
            id: 0,
            node_id: 0,
            template_id: 0,
            name: String::new(),
            description: String::new(),
            instance: String::new(),
            data_type: 0,
            source: 1,
            polling_interval: 60,
            retention_days: 30,
            delta_mode: 0,
            status: 0,
            advanced_schedule: false,
            resource_id: 0,
            proxy_node_id: 0,
            process_all_thresholds: false,
            transformation_script: String::new(),
        }
    }
}

/// A deferred write queued by the write-behind gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteRequest {
    RawValue {
        item_id: u32,
        raw: String,
        timestamp: i64,
    },
    History {
        item_id: u32,
        timestamp: i64,
        value: String,
    },
    ThresholdState {
        threshold_id: u32,
        reached: bool,
        last_event_timestamp: i64,
    },
    ItemStatus {
        item_id: u32,
        status: i32,
    },
    DeleteItem {
        item_id: u32,
    },
}
