//! Serializable export of a DCI's full state.
//!
//! Field order is stable; outer protocol layers serialize these records
//! as they see fit.

use super::item::{DataSource, DeltaMode, ItemStatus};
use super::threshold::{CheckFunction, Operation, ThresholdRule};
use super::value::DataType;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdSnapshot {
    pub id: u32,
    pub function: CheckFunction,
    pub operation: Operation,
    pub fire_value: String,
    pub rearm_value: Option<String>,
    pub sample_count: u32,
    pub event_code: u32,
    pub rearm_event_code: u32,
    pub repeat_interval: i32,
    pub reached: bool,
    pub last_event_timestamp: i64,
}

impl From<&ThresholdRule> for ThresholdSnapshot {
    fn from(rule: &ThresholdRule) -> Self {
        Self {
            id: rule.id,
            function: rule.function,
            operation: rule.operation,
            fire_value: rule.fire_value.clone(),
            rearm_value: rule.rearm_value.clone(),
            sample_count: rule.sample_count,
            event_code: rule.event_code,
            rearm_event_code: rule.rearm_event_code,
            repeat_interval: rule.repeat_interval,
            reached: rule.is_reached(),
            last_event_timestamp: rule.last_event_timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DciSnapshot {
    pub id: u32,
    /// Owning node, 0 when not node-bound.
    pub owner_id: u32,
    pub template_id: u32,
    pub name: String,
    pub description: String,
    pub instance: String,
    pub data_type: DataType,
    pub source: DataSource,
    pub status: ItemStatus,
    pub polling_interval: i64,
    pub retention_days: u32,
    pub delta_mode: DeltaMode,
    pub advanced_schedule: bool,
    pub schedules: Vec<String>,
    pub resource_id: u32,
    pub proxy_node_id: u32,
    pub process_all_thresholds: bool,
    pub transformation_script: Option<String>,
    pub error_count: u32,
    pub last_poll_timestamp: i64,
    pub last_value: Option<String>,
    pub last_value_timestamp: Option<i64>,
    pub thresholds: Vec<ThresholdSnapshot>,
}
