//! SQLite database store implementation.

use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use super::models::*;
use crate::dci::{CheckFunction, ItemValue, Operation, ThresholdRule, ThresholdState};
use crate::node::{Node, NodeCapabilities};
use crate::services::Event;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Not found")]
    NotFound,
}

const CAP_AGENT: i64 = 0x01;
const CAP_SNMP: i64 = 0x02;
const CAP_BRIDGE: i64 = 0x04;
const CAP_ROUTER: i64 = 0x08;

const ITEM_COLUMNS: &str = "id, node_id, template_id, name, description, instance, data_type, source, \
     polling_interval, retention_days, delta_mode, status, advanced_schedule, resource_id, \
     proxy_node_id, process_all_thresholds, transformation_script";

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Nodes ---

    /// Insert or replace a node.
    pub fn add_node(&self, node: &Node) -> Result<(), DbError> {
        let caps = node.capabilities;
        let mut flags = 0;
        for (set, bit) in [
            (caps.agent, CAP_AGENT),
            (caps.snmp, CAP_SNMP),
            (caps.bridge, CAP_BRIDGE),
            (caps.router, CAP_ROUTER),
        ] {
            if set {
                flags |= bit;
            }
        }
        self.conn().execute(
            "INSERT OR REPLACE INTO nodes (id, name, primary_ip, platform, agent_version, snmp_object_id, capabilities)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                node.id,
                node.name,
                node.primary_ip.map(|ip| ip.to_string()),
                node.platform,
                node.agent_version,
                node.snmp_object_id,
                flags,
            ],
        )?;
        Ok(())
    }

    /// Get all nodes.
    pub fn get_nodes(&self) -> Result<Vec<Node>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, primary_ip, platform, agent_version, snmp_object_id, capabilities FROM nodes ORDER BY id",
        )?;
        let nodes = stmt
            .query_map([], |row| {
                let ip: Option<String> = row.get(2)?;
                let flags: i64 = row.get(6)?;
                Ok(Node {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    primary_ip: ip.and_then(|s| s.parse::<IpAddr>().ok()),
                    platform: row.get(3)?,
                    agent_version: row.get(4)?,
                    snmp_object_id: row.get(5)?,
                    capabilities: NodeCapabilities {
                        agent: flags & CAP_AGENT != 0,
                        snmp: flags & CAP_SNMP != 0,
                        bridge: flags & CAP_BRIDGE != 0,
                        router: flags & CAP_ROUTER != 0,
                    },
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(nodes)
    }

    // --- Items ---

    /// Add a new item and return its ID. An id of 0 is assigned by the
    /// database.
    pub fn add_item(&self, item: &mut ItemRecord) -> Result<u32, DbError> {
        if item.polling_interval <= 0 {
            item.polling_interval = 60;
        }
        let conn = self.conn();
        conn.execute(
            &format!(
                "INSERT INTO items ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                ITEM_COLUMNS
            ),
            params![
                if item.id == 0 { None } else { Some(item.id) },
                item.node_id,
                item.template_id,
                item.name,
                item.description,
                item.instance,
                item.data_type,
                item.source,
                item.polling_interval,
                item.retention_days,
                item.delta_mode,
                item.status,
                item.advanced_schedule,
                item.resource_id,
                item.proxy_node_id,
                item.process_all_thresholds,
                item.transformation_script,
            ],
        )?;
        let id = u32::try_from(conn.last_insert_rowid()).map_err(|_| DbError::NotFound)?;
        item.id = id;
        Ok(id)
    }

    /// Update an existing item's status.
    pub fn update_item_status(&self, id: u32, status: i32) -> Result<(), DbError> {
        if write_item_status(&self.conn(), id, status)? == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Get all items.
    pub fn get_items(&self) -> Result<Vec<ItemRecord>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM items ORDER BY id", ITEM_COLUMNS))?;
        let items = stmt.query_map([], item_from_row)?.collect::<SqlResult<Vec<_>>>()?;
        Ok(items)
    }

    /// Delete an item with its thresholds, schedules and collected data.
    pub fn delete_item(&self, id: u32) -> Result<(), DbError> {
        delete_item_rows(&self.conn(), id)?;
        Ok(())
    }

    // --- Collected values ---

    pub fn upsert_raw_value(&self, item_id: u32, raw: &str, timestamp: i64) -> Result<(), DbError> {
        write_raw_value(&self.conn(), item_id, raw, timestamp)?;
        Ok(())
    }

    /// Last raw value stored for an item.
    pub fn get_raw_value(&self, item_id: u32) -> Result<Option<ItemValue>, DbError> {
        let value = self
            .conn()
            .query_row(
                "SELECT raw_value, timestamp FROM raw_values WHERE item_id = ?1",
                params![item_id],
                |row| Ok(ItemValue::new(row.get::<_, String>(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(value)
    }

    pub fn add_history(&self, item_id: u32, timestamp: i64, value: &str) -> Result<(), DbError> {
        write_history(&self.conn(), item_id, timestamp, value)?;
        Ok(())
    }

    /// Most recent history rows, newest first.
    pub fn get_recent_history(&self, item_id: u32, limit: usize) -> Result<Vec<ItemValue>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT value, timestamp FROM item_history WHERE item_id = ?1
             ORDER BY timestamp DESC, rowid DESC LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let values = stmt
            .query_map(params![item_id, limit], |row| {
                Ok(ItemValue::new(row.get::<_, String>(0)?, row.get(1)?))
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(values)
    }

    /// Delete history rows older than `cutoff` (unix seconds). Returns the
    /// number of rows removed.
    pub fn delete_history_before(&self, item_id: u32, cutoff: i64) -> Result<usize, DbError> {
        let removed = self.conn().execute(
            "DELETE FROM item_history WHERE item_id = ?1 AND timestamp < ?2",
            params![item_id, cutoff],
        )?;
        Ok(removed)
    }

    // --- Thresholds ---

    /// Threshold rules of an item in evaluation order.
    pub fn get_thresholds(&self, item_id: u32) -> Result<Vec<ThresholdRule>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, fire_value, rearm_value, check_function, check_operation, sample_count,
                    event_code, rearm_event_code, repeat_interval, current_state, last_event_timestamp,
                    match_count
             FROM thresholds WHERE item_id = ?1 ORDER BY sequence",
        )?;
        let rules = stmt
            .query_map(params![item_id], |row| {
                let mut rule = ThresholdRule::new(
                    row.get(0)?,
                    CheckFunction::from_code(row.get(3)?),
                    Operation::from_code(row.get(4)?),
                    row.get::<_, String>(1)?,
                );
                rule.rearm_value = row.get(2)?;
                rule.sample_count = row.get(5)?;
                rule.event_code = row.get(6)?;
                rule.rearm_event_code = row.get(7)?;
                rule.repeat_interval = row.get(8)?;
                rule.state = if row.get::<_, i64>(9)? != 0 {
                    ThresholdState::Reached
                } else {
                    ThresholdState::NotReached
                };
                rule.last_event_timestamp = row.get(10)?;
                rule.restore_match_count(row.get(11)?);
                Ok(rule)
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rules)
    }

    /// Replace the threshold list of an item.
    pub fn save_thresholds(&self, item_id: u32, rules: &[ThresholdRule]) -> Result<(), DbError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM thresholds WHERE item_id = ?1", params![item_id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO thresholds (id, item_id, sequence, fire_value, rearm_value, check_function,
                    check_operation, sample_count, event_code, rearm_event_code, repeat_interval,
                    current_state, last_event_timestamp, match_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            )?;
            for (sequence, rule) in rules.iter().enumerate() {
                stmt.execute(params![
                    rule.id,
                    item_id,
                    sequence as i64,
                    rule.fire_value,
                    rule.rearm_value,
                    rule.function.code(),
                    rule.operation.code(),
                    rule.sample_count,
                    rule.event_code,
                    rule.rearm_event_code,
                    rule.repeat_interval,
                    rule.is_reached(),
                    rule.last_event_timestamp,
                    rule.match_count(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn update_threshold_state(&self, threshold_id: u32, reached: bool, last_event_timestamp: i64) -> Result<(), DbError> {
        write_threshold_state(&self.conn(), threshold_id, reached, last_event_timestamp)?;
        Ok(())
    }

    /// Highest threshold id in use, 0 when there are none.
    pub fn max_threshold_id(&self) -> Result<u32, DbError> {
        let id: Option<u32> = self
            .conn()
            .query_row("SELECT MAX(id) FROM thresholds", [], |row| row.get(0))?;
        Ok(id.unwrap_or(0))
    }

    // --- Schedules ---

    pub fn get_schedules(&self, item_id: u32) -> Result<Vec<String>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT pattern FROM item_schedules WHERE item_id = ?1 ORDER BY sequence")?;
        let patterns = stmt
            .query_map(params![item_id], |row| row.get(0))?
            .collect::<SqlResult<Vec<String>>>()?;
        Ok(patterns)
    }

    /// Replace the schedule list of an item.
    pub fn save_schedules(&self, item_id: u32, patterns: &[String]) -> Result<(), DbError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM item_schedules WHERE item_id = ?1", params![item_id])?;
        {
            let mut stmt = tx.prepare("INSERT INTO item_schedules (item_id, sequence, pattern) VALUES (?1, ?2, ?3)")?;
            for (sequence, pattern) in patterns.iter().enumerate() {
                stmt.execute(params![item_id, sequence as i64, pattern])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // --- Batched writes ---

    /// Apply queued writes in one transaction.
    pub fn apply_writes(&self, writes: &[WriteRequest]) -> Result<(), DbError> {
        if writes.is_empty() {
            return Ok(());
        }

        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        for write in writes {
            match write {
                WriteRequest::RawValue { item_id, raw, timestamp } => {
                    write_raw_value(&tx, *item_id, raw, *timestamp)?;
                }
                WriteRequest::History { item_id, timestamp, value } => {
                    write_history(&tx, *item_id, *timestamp, value)?;
                }
                WriteRequest::ThresholdState {
                    threshold_id,
                    reached,
                    last_event_timestamp,
                } => {
                    write_threshold_state(&tx, *threshold_id, *reached, *last_event_timestamp)?;
                }
                WriteRequest::ItemStatus { item_id, status } => {
                    write_item_status(&tx, *item_id, *status)?;
                }
                WriteRequest::DeleteItem { item_id } => {
                    delete_item_rows(&tx, *item_id)?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    // --- Event log ---

    /// Persist events in batch.
    pub fn add_events(&self, events: &[Event]) -> Result<(), DbError> {
        if events.is_empty() {
            return Ok(());
        }

        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO event_log (code, source_id, timestamp, params) VALUES (?1, ?2, ?3, ?4)")?;
            for event in events {
                stmt.execute(params![
                    event.code,
                    event.source_id,
                    event.timestamp,
                    serde_json::to_string(&event.params)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Most recent events, newest first.
    #[cfg(test)]
    pub fn get_recent_events(&self, limit: usize) -> Result<Vec<Event>, DbError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT code, source_id, timestamp, params FROM event_log ORDER BY id DESC LIMIT ?1")?;
        let rows = stmt
            .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        let mut events = Vec::with_capacity(rows.len());
        for (code, source_id, timestamp, params) in rows {
            let mut event = Event::new(code, source_id, timestamp);
            event.params = serde_json::from_str::<Vec<crate::services::EventParam>>(&params)?;
            events.push(event);
        }
        Ok(events)
    }
}

fn item_from_row(row: &Row<'_>) -> SqlResult<ItemRecord> {
    Ok(ItemRecord {
        id: row.get(0)?,
        node_id: row.get(1)?,
        template_id: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        instance: row.get(5)?,
        data_type: row.get(6)?,
        source: row.get(7)?,
        polling_interval: row.get(8)?,
        retention_days: row.get(9)?,
        delta_mode: row.get(10)?,
        status: row.get(11)?,
        advanced_schedule: row.get(12)?,
        resource_id: row.get(13)?,
        proxy_node_id: row.get(14)?,
        process_all_thresholds: row.get(15)?,
        transformation_script: row.get(16)?,
    })
}

fn write_raw_value(conn: &Connection, item_id: u32, raw: &str, timestamp: i64) -> SqlResult<()> {
    conn.execute(
        "INSERT INTO raw_values (item_id, raw_value, timestamp) VALUES (?1, ?2, ?3)
         ON CONFLICT(item_id) DO UPDATE SET raw_value=excluded.raw_value, timestamp=excluded.timestamp",
        params![item_id, raw, timestamp],
    )?;
    Ok(())
}

fn write_history(conn: &Connection, item_id: u32, timestamp: i64, value: &str) -> SqlResult<()> {
    conn.execute(
        "INSERT INTO item_history (item_id, timestamp, value) VALUES (?1, ?2, ?3)",
        params![item_id, timestamp, value],
    )?;
    Ok(())
}

fn write_item_status(conn: &Connection, item_id: u32, status: i32) -> SqlResult<usize> {
    conn.execute("UPDATE items SET status = ?1 WHERE id = ?2", params![status, item_id])
}

fn write_threshold_state(conn: &Connection, threshold_id: u32, reached: bool, last_event_timestamp: i64) -> SqlResult<()> {
    conn.execute(
        "UPDATE thresholds SET current_state = ?1, last_event_timestamp = ?2 WHERE id = ?3",
        params![reached, last_event_timestamp, threshold_id],
    )?;
    Ok(())
}

fn delete_item_rows(conn: &Connection, item_id: u32) -> SqlResult<()> {
    conn.execute("DELETE FROM item_history WHERE item_id = ?1", params![item_id])?;
    conn.execute("DELETE FROM raw_values WHERE item_id = ?1", params![item_id])?;
    conn.execute("DELETE FROM thresholds WHERE item_id = ?1", params![item_id])?;
    conn.execute("DELETE FROM item_schedules WHERE item_id = ?1", params![item_id])?;
    conn.execute("DELETE FROM items WHERE id = ?1", params![item_id])?;
    Ok(())
}
