//! Data collection items.
//!
//! A [`DataItem`] owns its policy, threshold rules and value cache behind a
//! single mutex. The lock covers in-memory transitions only: claiming a poll,
//! ingesting a value or an error, and releasing the claim. Fetching happens
//! unlocked between [`DataItem::try_begin_poll`] and
//! [`DataItem::new_value`] / [`DataItem::new_error`].

use super::cache::ValueCache;
use super::context::CollectionContext;
use super::macros::expand_macros;
use super::schedule::{self, ScheduleError};
use super::snapshot::{DciSnapshot, ThresholdSnapshot};
use super::threshold::{CheckFunction, CheckResult, ThresholdRule};
use super::value::{self, DataType, ItemValue};
use crate::db::ItemRecord;
use crate::node::{Node, NodeContextView};
use crate::services::{
    ClusterResources, Event, TransformScript, EVENT_DCI_ACTIVE, EVENT_DCI_DISABLED, EVENT_DCI_UNSUPPORTED,
    EVENT_SCRIPT_ERROR,
};

use chrono::{Local, NaiveDateTime, TimeZone};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;

/// Where values come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DataSource {
    Internal,
    Agent,
    Snmp,
    /// Values are pushed from outside; never polled.
    Push,
}

impl DataSource {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Internal),
            1 => Some(Self::Agent),
            2 => Some(Self::Snmp),
            4 => Some(Self::Push),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Internal => 0,
            Self::Agent => 1,
            Self::Snmp => 2,
            Self::Push => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::Agent => "agent",
            Self::Snmp => "snmp",
            Self::Push => "push",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeltaMode {
    None,
    Simple,
    AveragePerSecond,
    AveragePerMinute,
}

impl DeltaMode {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Simple),
            2 => Some(Self::AveragePerSecond),
            3 => Some(Self::AveragePerMinute),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::None => 0,
            Self::Simple => 1,
            Self::AveragePerSecond => 2,
            Self::AveragePerMinute => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ItemStatus {
    Active,
    Disabled,
    NotSupported,
}

impl ItemStatus {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Active),
            1 => Some(Self::Disabled),
            2 => Some(Self::NotSupported),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Active => 0,
            Self::Disabled => 1,
            Self::NotSupported => 2,
        }
    }
}

/// When an item is polled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollSchedule {
    /// Every `polling_interval` seconds.
    Interval,
    /// Whenever one of the cron-like patterns matches.
    Custom(Vec<String>),
}

/// Collection policy of an item.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemConfig {
    pub name: String,
    pub description: String,
    pub instance: String,
    pub data_type: DataType,
    pub source: DataSource,
    /// Seconds.
    pub polling_interval: i64,
    pub retention_days: u32,
    pub delta_mode: DeltaMode,
    pub status: ItemStatus,
    pub schedule: PollSchedule,
    pub resource_id: u32,
    pub proxy_node_id: u32,
    pub process_all_thresholds: bool,
    pub transformation: Option<TransformScript>,
}

impl ItemConfig {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            instance: String::new(),
            data_type,
            source: DataSource::Agent,
            polling_interval: 60,
            retention_days: 30,
            delta_mode: DeltaMode::None,
            status: ItemStatus::Active,
            schedule: PollSchedule::Interval,
            resource_id: 0,
            proxy_node_id: 0,
            process_all_thresholds: false,
            transformation: None,
        }
    }

    /// Build the policy from a stored row. Unknown codes fall back to
    /// defaults with a warning.
    pub fn from_record(record: &ItemRecord, schedules: Vec<String>) -> Self {
        let data_type = DataType::from_code(record.data_type).unwrap_or_else(|| {
            tracing::warn!("Item {}: unknown data type {}, using INT32", record.id, record.data_type);
            DataType::Int32
        });
        let source = DataSource::from_code(record.source).unwrap_or_else(|| {
            tracing::warn!("Item {}: unknown source {}, using agent", record.id, record.source);
            DataSource::Agent
        });
        let delta_mode = DeltaMode::from_code(record.delta_mode).unwrap_or_else(|| {
            tracing::warn!("Item {}: unknown delta mode {}, disabling delta", record.id, record.delta_mode);
            DeltaMode::None
        });
        let status = ItemStatus::from_code(record.status).unwrap_or_else(|| {
            tracing::warn!("Item {}: unknown status {}, disabling", record.id, record.status);
            ItemStatus::Disabled
        });

        Self {
            name: record.name.clone(),
            description: record.description.clone(),
            instance: record.instance.clone(),
            data_type,
            source,
            polling_interval: record.polling_interval,
            retention_days: record.retention_days,
            delta_mode,
            status,
            schedule: if record.advanced_schedule {
                PollSchedule::Custom(schedules)
            } else {
                PollSchedule::Interval
            },
            resource_id: record.resource_id,
            proxy_node_id: record.proxy_node_id,
            process_all_thresholds: record.process_all_thresholds,
            transformation: TransformScript::new(record.transformation_script.clone()),
        }
    }
}

/// What an item belongs to. Node references are weak; the node registry
/// owns nodes.
#[derive(Debug, Clone)]
pub enum Owner {
    Node(Weak<Node>),
    Template(u32),
    Unbound,
}

impl Owner {
    pub fn node(&self) -> Option<Arc<Node>> {
        match self {
            Owner::Node(node) => node.upgrade(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Lifecycle {
    Active,
    /// Disabled and waiting for an in-flight poll to finish.
    Draining,
    Deleted,
}

/// Thread-safe allocator for threshold ids.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU32,
}

impl IdAllocator {
    pub fn new(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first.max(1)),
        }
    }

    pub fn next_id(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new(1)
    }
}

#[derive(Debug)]
struct ItemState {
    config: ItemConfig,
    owner: Owner,
    thresholds: Vec<ThresholdRule>,
    cache: ValueCache,
    cache_loaded: bool,
    prev_raw: Option<ItemValue>,
    error_count: u32,
    last_poll: i64,
    last_schedule_check: Option<i64>,
    busy: bool,
    lifecycle: Lifecycle,
}

/// One data collection item.
#[derive(Debug)]
pub struct DataItem {
    id: u32,
    state: Mutex<ItemState>,
    busy: watch::Sender<bool>,
}

/// Claim on an item's poll slot. Dropping it releases the item.
#[derive(Debug)]
pub struct PollGuard {
    item: Arc<DataItem>,
}

impl PollGuard {
    pub fn item(&self) -> &Arc<DataItem> {
        &self.item
    }
}

impl Drop for PollGuard {
    fn drop(&mut self) {
        self.item.finish_poll();
    }
}

fn local_time(timestamp: i64) -> Option<NaiveDateTime> {
    Local.timestamp_opt(timestamp, 0).earliest().map(|t| t.naive_local())
}

impl DataItem {
    pub fn new(id: u32, config: ItemConfig, owner: Owner) -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            id,
            state: Mutex::new(ItemState {
                config,
                owner,
                thresholds: Vec::new(),
                cache: ValueCache::new(0),
                cache_loaded: false,
                prev_raw: None,
                error_count: 0,
                last_poll: 0,
                last_schedule_check: None,
                busy: false,
                lifecycle: Lifecycle::Active,
            }),
            busy,
        }
    }

    /// Rebuild an item from its stored row.
    pub fn from_record(record: &ItemRecord, owner: Owner, thresholds: Vec<ThresholdRule>, schedules: Vec<String>) -> Self {
        let item = Self::new(record.id, ItemConfig::from_record(record, schedules), owner);
        item.lock().thresholds = thresholds;
        item
    }

    fn lock(&self) -> MutexGuard<'_, ItemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> String {
        self.lock().config.name.clone()
    }

    pub fn config(&self) -> ItemConfig {
        self.lock().config.clone()
    }

    pub fn status(&self) -> ItemStatus {
        self.lock().config.status
    }

    pub fn owner_node(&self) -> Option<Arc<Node>> {
        self.lock().owner.node()
    }

    pub fn thresholds(&self) -> Vec<ThresholdRule> {
        self.lock().thresholds.clone()
    }

    pub fn error_count(&self) -> u32 {
        self.lock().error_count
    }

    pub fn last_value(&self) -> Option<ItemValue> {
        self.lock().cache.head().cloned()
    }

    pub fn cache_depth(&self) -> usize {
        self.lock().cache.capacity()
    }

    pub fn is_cache_loaded(&self) -> bool {
        self.lock().cache_loaded
    }

    pub fn is_busy(&self) -> bool {
        self.lock().busy
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lock().lifecycle
    }

    pub fn last_poll_timestamp(&self) -> i64 {
        self.lock().last_poll
    }

    /// Replace the threshold list. Call [`update_required_depth`](Self::update_required_depth)
    /// afterwards.
    pub fn set_thresholds(&self, thresholds: Vec<ThresholdRule>) {
        self.lock().thresholds = thresholds;
    }

    /// Switch to advanced scheduling and persist the patterns. Every pattern
    /// is validated first; on error the current schedule is kept.
    pub fn set_schedules(&self, patterns: Vec<String>, ctx: &CollectionContext) -> Result<(), ScheduleError> {
        for pattern in &patterns {
            schedule::validate(pattern)?;
        }
        {
            let mut state = self.lock();
            state.config.schedule = PollSchedule::Custom(patterns.clone());
            state.last_schedule_check = None;
        }
        if let Err(e) = ctx.persistence.save_schedule_patterns(self.id, &patterns) {
            tracing::error!("Item {}: failed to save schedules: {}", self.id, e);
        }
        Ok(())
    }

    fn save_thresholds(&self, ctx: &CollectionContext) {
        let rules = self.lock().thresholds.clone();
        if let Err(e) = ctx.persistence.save_threshold_rules(self.id, &rules) {
            tracing::error!("Item {}: failed to save thresholds: {}", self.id, e);
        }
    }

    /// Switch back to fixed-interval polling.
    pub fn set_polling_interval(&self, seconds: i64) {
        let mut state = self.lock();
        state.config.polling_interval = seconds.max(1);
        state.config.schedule = PollSchedule::Interval;
    }

    /// Reload the previous raw value so deltas continue across restarts.
    pub fn restore_previous_raw(&self, ctx: &CollectionContext) {
        match ctx.persistence.load_current_raw_value(self.id) {
            Ok(prev) => self.lock().prev_raw = prev,
            Err(e) => tracing::warn!("Item {}: cannot load last raw value: {}", self.id, e),
        }
    }

    /// Whether the item should be polled at `now` (unix seconds). Does not
    /// consume the current schedule minute; only a claim does.
    pub fn is_ready_for_polling(&self, now: i64, cluster: &dyn ClusterResources) -> bool {
        let mut state = self.lock();
        Self::ready(&mut state, now, cluster, false)
    }

    fn ready(state: &mut ItemState, now: i64, cluster: &dyn ClusterResources, claim: bool) -> bool {
        if state.config.status == ItemStatus::Disabled
            || state.busy
            || !state.cache_loaded
            || state.config.source == DataSource::Push
            || state.lifecycle != Lifecycle::Active
        {
            return false;
        }
        let node_id = match state.owner.node() {
            Some(node) => node.id,
            None => return false,
        };
        if state.config.resource_id != 0 && !cluster.is_resource_owned_by_node(state.config.resource_id, node_id) {
            return false;
        }

        match &state.config.schedule {
            PollSchedule::Custom(patterns) => {
                let due = match local_time(now) {
                    Some(local) => {
                        let last = state.last_schedule_check.and_then(local_time);
                        schedule::schedules_due(patterns, &local, last.as_ref())
                    }
                    None => false,
                };
                if claim {
                    state.last_schedule_check = Some(now);
                }
                due
            }
            PollSchedule::Interval => {
                let interval = if state.config.status == ItemStatus::NotSupported {
                    state.config.polling_interval.saturating_mul(10)
                } else {
                    state.config.polling_interval
                };
                now >= state.last_poll.saturating_add(interval)
            }
        }
    }

    /// Check readiness and, if ready, mark the item busy in the same
    /// critical section.
    pub fn try_begin_poll(self: &Arc<Self>, now: i64, cluster: &dyn ClusterResources) -> Option<PollGuard> {
        let mut state = self.lock();
        if !Self::ready(&mut state, now, cluster, true) {
            return None;
        }
        state.busy = true;
        state.last_poll = now;
        drop(state);
        self.busy.send_replace(true);
        Some(PollGuard { item: Arc::clone(self) })
    }

    fn finish_poll(&self) {
        self.lock().busy = false;
        self.busy.send_replace(false);
    }

    /// Ingest a collected value.
    pub fn new_value(&self, timestamp: i64, raw: &str, ctx: &CollectionContext) {
        let mut state = self.lock();
        let node = match state.owner.node() {
            Some(node) => node,
            None => {
                tracing::debug!("Item {}: value ignored, no owning node", self.id);
                return;
            }
        };

        state.error_count = 0;
        let original = ItemValue::new(raw, timestamp);
        let prev = state.prev_raw.clone().unwrap_or_else(|| original.clone());
        let in_order = timestamp >= prev.timestamp();
        if state.prev_raw.is_none() || timestamp > prev.timestamp() {
            ctx.persistence.upsert_current_raw_value(self.id, raw, timestamp);
            state.prev_raw = Some(original.clone());
        }

        let elapsed = (timestamp - prev.timestamp()).max(0);
        let mut value = Self::apply_delta(state.config.delta_mode, state.config.data_type, &original, &prev, elapsed);

        if let Some(script) = &state.config.transformation {
            match ctx.scripts.transform(script, &*node, &value) {
                Ok(Some(text)) => value = ItemValue::new(text, timestamp).normalized(state.config.data_type),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Item {}: transformation script failed: {}", self.id, e);
                    ctx.events.post_event(
                        Event::new(EVENT_SCRIPT_ERROR, ctx.settings.management_node_id, timestamp)
                            .with("scriptName", format!("DCI::{}::{}::TransformationScript", node.name, self.id))
                            .with("error", e)
                            .with("dciId", self.id),
                    );
                }
            }
        }

        ctx.persistence.append_history_row(self.id, timestamp, value.as_str());

        if !in_order {
            tracing::debug!("Item {}: out-of-order value at {} stored without evaluation", self.id, timestamp);
            return;
        }
        if state.cache_loaded {
            self.check_thresholds(&mut state, &value, node.id, timestamp, ctx);
        }
        state.cache.push(value);
    }

    fn apply_delta(mode: DeltaMode, data_type: DataType, current: &ItemValue, prev: &ItemValue, elapsed: i64) -> ItemValue {
        let ts = current.timestamp();
        match mode {
            DeltaMode::None => current.clone(),
            DeltaMode::Simple => ItemValue::from_typed(value::diff(data_type, current, prev), ts),
            DeltaMode::AveragePerSecond | DeltaMode::AveragePerMinute => {
                let delta = value::diff(data_type, current, prev);
                if data_type == DataType::String {
                    return ItemValue::from_typed(delta, ts);
                }
                let seconds = if mode == DeltaMode::AveragePerMinute { elapsed / 60 } else { elapsed };
                ItemValue::from_typed(value::divide(delta, seconds.max(1)), ts)
            }
        }
    }

    fn check_thresholds(&self, state: &mut ItemState, value: &ItemValue, node_id: u32, now: i64, ctx: &CollectionContext) {
        let ItemState {
            config,
            thresholds,
            cache,
            ..
        } = state;
        for rule in thresholds.iter_mut() {
            let eval = rule.check(config.data_type, value, cache);
            let current = eval.value.map(|v| v.to_string()).unwrap_or_default();
            if !self.dispatch(config, rule, eval.result, &current, node_id, now, ctx) {
                break;
            }
        }
    }

    /// Ingest a collection failure. Only error rules are evaluated.
    pub fn new_error(&self, now: i64, ctx: &CollectionContext) {
        let mut state = self.lock();
        let node_id = match state.owner.node() {
            Some(node) => node.id,
            None => return,
        };

        state.error_count = state.error_count.saturating_add(1);
        let error_count = state.error_count;
        let ItemState { config, thresholds, .. } = &mut *state;
        for rule in thresholds.iter_mut().filter(|r| r.function == CheckFunction::Error) {
            let result = rule.check_error(error_count).result;
            if !self.dispatch(config, rule, result, &error_count.to_string(), node_id, now, ctx) {
                break;
            }
        }
    }

    /// Emit events and persist state for one outcome. Returns whether
    /// evaluation continues with the next rule.
    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        config: &ItemConfig,
        rule: &mut ThresholdRule,
        result: CheckResult,
        current: &str,
        node_id: u32,
        now: i64,
        ctx: &CollectionContext,
    ) -> bool {
        match result {
            CheckResult::Activated => {
                ctx.events.post_event(self.reached_event(config, rule, current, node_id, now, false));
                rule.mark_last_event(now);
                ctx.persistence.update_threshold_state(rule.id, true, now);
                config.process_all_thresholds
            }
            CheckResult::Deactivated => {
                ctx.events.post_event(
                    Event::new(rule.rearm_event_code, node_id, now)
                        .with("dciName", &config.name)
                        .with("dciDescription", &config.description)
                        .with("dciId", self.id)
                        .with("instance", &config.instance)
                        .with("thresholdValue", &rule.fire_value)
                        .with("currentValue", current),
                );
                ctx.persistence.update_threshold_state(rule.id, false, rule.last_event_timestamp);
                true
            }
            CheckResult::AlreadyActive => {
                if rule.repeat_due(now, ctx.settings.threshold_repeat_interval) {
                    ctx.events.post_event(self.reached_event(config, rule, current, node_id, now, true));
                    rule.mark_last_event(now);
                    ctx.persistence.update_threshold_state(rule.id, true, now);
                }
                config.process_all_thresholds
            }
            CheckResult::AlreadyInactive => true,
        }
    }

    fn reached_event(&self, config: &ItemConfig, rule: &ThresholdRule, current: &str, node_id: u32, now: i64, repeated: bool) -> Event {
        Event::new(rule.event_code, node_id, now)
            .with("dciName", &config.name)
            .with("dciDescription", &config.description)
            .with("thresholdValue", &rule.fire_value)
            .with("currentValue", current)
            .with("dciId", self.id)
            .with("instance", &config.instance)
            .with("isRepeatedEvent", i32::from(repeated))
    }

    /// Recompute the cache depth and resize the cache, backfilling from
    /// history when it grows.
    ///
    /// Takes the item lock, then the consumer registry's read lock.
    pub fn update_required_depth(&self, ctx: &CollectionContext) {
        let mut state = self.lock();
        let depth = if state.owner.node().is_some() {
            let for_rules = state
                .thresholds
                .iter()
                .map(ThresholdRule::required_cache_depth)
                .max()
                .unwrap_or(0);
            1.max(for_rules).max(ctx.consumers.required_depth(self.id))
        } else {
            0
        };

        let current = state.cache.capacity();
        if depth < current || (depth == current && state.cache_loaded) {
            state.cache.shrink_to(depth);
            state.cache_loaded = true;
            return;
        }

        match ctx.persistence.load_recent_history(self.id, depth) {
            Ok(history) => {
                let mut merged: Vec<ItemValue> = state.cache.samples().cloned().collect();
                let oldest = merged.last().map(ItemValue::timestamp);
                merged.extend(history.into_iter().filter(|v| oldest.map_or(true, |o| v.timestamp() < o)));
                state.cache.refill(depth, merged);
            }
            Err(e) => {
                tracing::warn!("Item {}: cannot load history for cache: {}", self.id, e);
                state.cache.pad_to(depth);
            }
        }
        state.cache_loaded = true;
        tracing::debug!("Item {}: cache depth set to {}", self.id, depth);
    }

    /// Change status, optionally raising the matching status event.
    pub fn set_status(&self, status: ItemStatus, generate_event: bool, now: i64, ctx: &CollectionContext) {
        let mut state = self.lock();
        self.apply_status(&mut state, status, generate_event, now, ctx);
    }

    fn apply_status(&self, state: &mut ItemState, status: ItemStatus, generate_event: bool, now: i64, ctx: &CollectionContext) {
        if state.config.status == status {
            return;
        }
        if generate_event {
            if let Some(node) = state.owner.node() {
                let code = match status {
                    ItemStatus::Active => EVENT_DCI_ACTIVE,
                    ItemStatus::Disabled => EVENT_DCI_DISABLED,
                    ItemStatus::NotSupported => EVENT_DCI_UNSUPPORTED,
                };
                ctx.events.post_event(
                    Event::new(code, node.id, now)
                        .with("dciId", self.id)
                        .with("dciName", &state.config.name)
                        .with("dciDescription", &state.config.description)
                        .with("dciOrigin", state.config.source.code())
                        .with("dciOriginName", state.config.source.name()),
                );
            }
        }
        tracing::info!("Item {} ({}): status {:?} -> {:?}", self.id, state.config.name, state.config.status, status);
        state.config.status = status;
        ctx.persistence.update_item_status(self.id, status);
    }

    /// Disable the item and wait for an in-flight poll to finish, then drop
    /// its cache and stored data.
    pub async fn delete(&self, ctx: &CollectionContext) {
        let must_wait = {
            let mut state = self.lock();
            state.config.status = ItemStatus::Disabled;
            state.lifecycle = Lifecycle::Draining;
            state.busy
        };
        if must_wait {
            tracing::debug!("Item {}: waiting for in-flight poll before deletion", self.id);
            let mut rx = self.busy.subscribe();
            let _ = rx.wait_for(|busy| !*busy).await;
        }

        {
            let mut state = self.lock();
            state.lifecycle = Lifecycle::Deleted;
            state.cache.clear();
            state.cache_loaded = false;
        }
        ctx.persistence.delete_item_data(self.id);
        tracing::info!("Item {} deleted", self.id);
    }

    /// Bind to a node, expanding macros in the text fields and reloading
    /// the cache.
    pub fn bind_to_node(&self, node: &Arc<Node>, ctx: &CollectionContext) {
        {
            let mut state = self.lock();
            let view: &dyn NodeContextView = &**node;
            state.config.name = expand_macros(&state.config.name, Some(view));
            state.config.description = expand_macros(&state.config.description, Some(view));
            state.config.instance = expand_macros(&state.config.instance, Some(view));
            state.owner = Owner::Node(Arc::downgrade(node));
            state.cache = ValueCache::new(0);
            state.cache_loaded = false;
        }
        self.update_required_depth(ctx);
    }

    /// Create a node-bound copy of a template item under `new_id`, with
    /// fresh threshold ids.
    pub fn instantiate(template: &DataItem, new_id: u32, node: &Arc<Node>, ids: &IdAllocator, ctx: &CollectionContext) -> Self {
        let (config, rules) = {
            let src = template.lock();
            (src.config.clone(), src.thresholds.clone())
        };
        let item = Self::new(new_id, config, Owner::Unbound);
        item.set_thresholds(rules.iter().map(|r| r.duplicate(ids.next_id())).collect());
        item.save_thresholds(ctx);
        item.bind_to_node(node, ctx);
        item
    }

    /// Apply a template's current definition. Thresholds matching the
    /// template's rules position by position keep their state; the rest are
    /// replaced with fresh copies.
    pub fn update_from_template(&self, template: &DataItem, ids: &IdAllocator, now: i64, ctx: &CollectionContext) {
        let (src, src_rules) = {
            let t = template.lock();
            (t.config.clone(), t.thresholds.clone())
        };

        {
            let mut state = self.lock();
            let node = state.owner.node();
            let view = node.as_deref().map(|n| n as &dyn NodeContextView);

            state.config.name = expand_macros(&src.name, view);
            state.config.description = expand_macros(&src.description, view);
            state.config.instance = expand_macros(&src.instance, view);
            state.config.data_type = src.data_type;
            state.config.source = src.source;
            state.config.polling_interval = src.polling_interval;
            state.config.retention_days = src.retention_days;
            state.config.delta_mode = src.delta_mode;
            state.config.resource_id = src.resource_id;
            state.config.proxy_node_id = src.proxy_node_id;
            state.config.process_all_thresholds = src.process_all_thresholds;
            state.config.transformation = src.transformation.clone();
            if state.config.schedule != src.schedule {
                state.config.schedule = src.schedule.clone();
                state.last_schedule_check = None;
            }
            self.apply_status(&mut state, src.status, true, now, ctx);

            let data_type = state.config.data_type;
            let keep = state
                .thresholds
                .iter()
                .zip(&src_rules)
                .take_while(|(mine, theirs)| mine.same_definition(theirs, data_type))
                .count();
            state.thresholds.truncate(keep);
            state
                .thresholds
                .extend(src_rules[keep..].iter().map(|r| r.duplicate(ids.next_id())));
        }

        self.save_thresholds(ctx);
        self.update_required_depth(ctx);
    }

    /// Value of `function` over the cache, for consumers reading this item.
    pub fn value_for(&self, function: CheckFunction, sample_count: u32) -> Option<String> {
        let state = self.lock();
        let data_type = state.config.data_type;
        let n = sample_count.max(1) as usize;
        match function {
            CheckFunction::Last => state.cache.head().map(|v| v.to_string()),
            CheckFunction::Diff => {
                let mut samples = state.cache.samples();
                let current = samples.next()?;
                let prev = samples.next()?;
                Some(value::diff(data_type, current, prev).to_string())
            }
            CheckFunction::Average | CheckFunction::Deviation | CheckFunction::Sum => {
                let samples: Vec<&ItemValue> = state.cache.samples().take(n).collect();
                let result = match function {
                    CheckFunction::Average => value::average(data_type, &samples),
                    CheckFunction::Deviation => value::mean_deviation(data_type, &samples),
                    _ => value::sum(data_type, &samples),
                };
                result.map(|v| v.to_string())
            }
            CheckFunction::Error => Some(i32::from(state.error_count >= sample_count.max(1)).to_string()),
            CheckFunction::Unknown(_) => None,
        }
    }

    /// Full record of the item's identity, policy, cache head and
    /// thresholds.
    pub fn snapshot(&self) -> DciSnapshot {
        let state = self.lock();
        let (owner_id, template_id) = match &state.owner {
            Owner::Node(node) => (node.upgrade().map(|n| n.id).unwrap_or(0), 0),
            Owner::Template(id) => (0, *id),
            Owner::Unbound => (0, 0),
        };
        let (advanced_schedule, schedules) = match &state.config.schedule {
            PollSchedule::Interval => (false, Vec::new()),
            PollSchedule::Custom(patterns) => (true, patterns.clone()),
        };
        let head = state.cache.head();

        DciSnapshot {
            id: self.id,
            owner_id,
            template_id,
            name: state.config.name.clone(),
            description: state.config.description.clone(),
            instance: state.config.instance.clone(),
            data_type: state.config.data_type,
            source: state.config.source,
            status: state.config.status,
            polling_interval: state.config.polling_interval,
            retention_days: state.config.retention_days,
            delta_mode: state.config.delta_mode,
            advanced_schedule,
            schedules,
            resource_id: state.config.resource_id,
            proxy_node_id: state.config.proxy_node_id,
            process_all_thresholds: state.config.process_all_thresholds,
            transformation_script: state.config.transformation.as_ref().map(|s| s.source().to_string()),
            error_count: state.error_count,
            last_poll_timestamp: state.last_poll,
            last_value: head.map(|v| v.to_string()),
            last_value_timestamp: head.map(ItemValue::timestamp),
            thresholds: state.thresholds.iter().map(ThresholdSnapshot::from).collect(),
        }
    }

    /// Row for the `items` table.
    pub fn to_record(&self) -> ItemRecord {
        let state = self.lock();
        let (node_id, template_id) = match &state.owner {
            Owner::Node(node) => (node.upgrade().map(|n| n.id).unwrap_or(0), 0),
            Owner::Template(id) => (0, *id),
            Owner::Unbound => (0, 0),
        };
        ItemRecord {
            id: self.id,
            node_id,
            template_id,
            name: state.config.name.clone(),
            description: state.config.description.clone(),
            instance: state.config.instance.clone(),
            data_type: state.config.data_type.code(),
            source: state.config.source.code(),
            polling_interval: state.config.polling_interval,
            retention_days: state.config.retention_days,
            delta_mode: state.config.delta_mode.code(),
            status: state.config.status.code(),
            advanced_schedule: matches!(state.config.schedule, PollSchedule::Custom(_)),
            resource_id: state.config.resource_id,
            proxy_node_id: state.config.proxy_node_id,
            process_all_thresholds: state.config.process_all_thresholds,
            transformation_script: state
                .config
                .transformation
                .as_ref()
                .map(|s| s.source().to_string())
                .unwrap_or_default(),
        }
    }

    /// Schedule patterns, empty for interval polling.
    pub fn schedules(&self) -> Vec<String> {
        match &self.lock().config.schedule {
            PollSchedule::Custom(patterns) => patterns.clone(),
            PollSchedule::Interval => Vec::new(),
        }
    }

    /// Cached real samples, newest first.
    pub fn cached_values(&self) -> Vec<ItemValue> {
        self.lock().cache.samples().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::PersistenceGateway;
    use crate::dci::Operation;
    use crate::services::{CacheRequirement, ScriptError, EVENT_THRESHOLD_REACHED, EVENT_THRESHOLD_REARMED};
    use crate::testing::{harness, harness_with_scripts, node, FixedScripts, Harness};
    use std::time::Duration;

    fn bound_item(h: &Harness, node: &Arc<Node>, config: ItemConfig) -> Arc<DataItem> {
        let item = Arc::new(DataItem::new(100, config, Owner::Node(Arc::downgrade(node))));
        item.update_required_depth(&h.ctx);
        item
    }

    fn with_rule(h: &Harness, item: &DataItem, rule: ThresholdRule) {
        item.set_thresholds(vec![rule]);
        item.update_required_depth(&h.ctx);
    }

    #[test]
    fn test_simple_delta_per_type() {
        let cases = [
            (DataType::Int32, "5", "12", "7"),
            (DataType::Int32, "10", "4", "-6"),
            (DataType::UInt32, "100", "250", "150"),
            (DataType::Int64, "-5000000000", "5000000000", "10000000000"),
            (DataType::UInt64, "18446744073709551000", "18446744073709551615", "615"),
            (DataType::Float, "1.5", "4", "2.5"),
        ];
        for (data_type, v1, v2, expected) in cases {
            let h = harness();
            let n = node(1, "srv");
            let mut config = ItemConfig::new("counter", data_type);
            config.delta_mode = DeltaMode::Simple;
            let item = bound_item(&h, &n, config);

            item.new_value(10, v1, &h.ctx);
            assert_eq!(item.last_value().map(|v| v.to_string()).as_deref(), Some("0"), "{:?}", data_type);
            item.new_value(20, v2, &h.ctx);
            assert_eq!(item.last_value().map(|v| v.to_string()).as_deref(), Some(expected), "{:?}", data_type);
        }
    }

    #[test]
    fn test_uint32_counter_drop_wraps() {
        let h = harness();
        let n = node(1, "srv");
        let mut config = ItemConfig::new("ifInOctets", DataType::UInt32);
        config.delta_mode = DeltaMode::Simple;
        let item = bound_item(&h, &n, config);

        item.new_value(0, "100", &h.ctx);
        item.new_value(60, "80", &h.ctx);
        assert_eq!(item.last_value(), Some(ItemValue::new("4294967276", 60)));
    }

    #[test]
    fn test_average_delta_same_timestamp() {
        for mode in [DeltaMode::AveragePerSecond, DeltaMode::AveragePerMinute] {
            let h = harness();
            let n = node(1, "srv");
            let mut config = ItemConfig::new("rate", DataType::Int64);
            config.delta_mode = mode;
            let item = bound_item(&h, &n, config);

            item.new_value(100, "10", &h.ctx);
            item.new_value(100, "70", &h.ctx);
            assert_eq!(item.last_value().map(|v| v.to_string()).as_deref(), Some("60"));
        }
    }

    #[test]
    fn test_average_per_second_and_minute() {
        let h = harness();
        let n = node(1, "srv");
        let mut config = ItemConfig::new("rate", DataType::Float);
        config.delta_mode = DeltaMode::AveragePerSecond;
        let item = bound_item(&h, &n, config.clone());
        item.new_value(100, "0", &h.ctx);
        item.new_value(110, "50", &h.ctx);
        assert_eq!(item.last_value().map(|v| v.to_string()).as_deref(), Some("5"));

        config.delta_mode = DeltaMode::AveragePerMinute;
        let item = bound_item(&h, &n, config);
        item.new_value(0, "0", &h.ctx);
        item.new_value(120, "50", &h.ctx);
        assert_eq!(item.last_value().map(|v| v.to_string()).as_deref(), Some("25"));
    }

    #[test]
    fn test_value_without_node_is_ignored() {
        let h = harness();
        let item = DataItem::new(5, ItemConfig::new("tpl", DataType::Int32), Owner::Template(9));
        item.update_required_depth(&h.ctx);
        item.new_value(10, "1", &h.ctx);
        item.new_error(10, &h.ctx);
        assert_eq!(item.cache_depth(), 0);
        assert_eq!(item.error_count(), 0);
        assert!(h.gateway.history_values(5).is_empty());

        let n = node(1, "srv");
        let orphan = DataItem::new(6, ItemConfig::new("x", DataType::Int32), Owner::Node(Arc::downgrade(&n)));
        drop(n);
        orphan.new_value(10, "1", &h.ctx);
        assert!(h.gateway.history_values(6).is_empty());
    }

    #[test]
    fn test_value_persisted_and_error_count_reset() {
        let h = harness();
        let n = node(1, "srv");
        let item = bound_item(&h, &n, ItemConfig::new("cpu", DataType::Int32));
        item.new_error(5, &h.ctx);
        item.new_error(6, &h.ctx);
        assert_eq!(item.error_count(), 2);

        item.new_value(10, "42", &h.ctx);
        assert_eq!(item.error_count(), 0);
        assert_eq!(h.gateway.raw.lock().unwrap().get(&100), Some(&ItemValue::new("42", 10)));
        assert_eq!(h.gateway.history_values(100), vec!["42".to_string()]);
    }

    #[test]
    fn test_out_of_order_value_only_stored() {
        let h = harness();
        let n = node(1, "srv");
        let item = bound_item(&h, &n, ItemConfig::new("cpu", DataType::Int32));
        with_rule(&h, &item, ThresholdRule::new(1, CheckFunction::Last, Operation::Greater, "50"));

        item.new_value(100, "10", &h.ctx);
        item.new_value(90, "99", &h.ctx);
        assert_eq!(item.last_value(), Some(ItemValue::new("10", 100)));
        assert_eq!(h.gateway.history_values(100), vec!["10".to_string(), "99".to_string()]);
        assert!(h.events.codes().is_empty());
        assert_eq!(h.gateway.raw.lock().unwrap().get(&100), Some(&ItemValue::new("10", 100)));
    }

    #[test]
    fn test_out_of_order_value_is_transformed() {
        let scripts = Arc::new(FixedScripts::new(Ok(Some("12".to_string()))));
        let h = harness_with_scripts(scripts.clone());
        let n = node(1, "srv");
        let mut config = ItemConfig::new("mem", DataType::Int32);
        config.transformation = TransformScript::new("return $1 / 1024;");
        let item = bound_item(&h, &n, config);

        item.new_value(100, "13210", &h.ctx);
        item.new_value(90, "13300", &h.ctx);
        assert_eq!(h.gateway.history_values(100), vec!["12".to_string(), "12".to_string()]);
        assert_eq!(scripts.seen_nodes.lock().unwrap().len(), 2);
        assert_eq!(item.cached_values(), vec![ItemValue::new("12", 100)]);
    }

    #[test]
    fn test_out_of_order_delta_uses_previous_raw() {
        let h = harness();
        let n = node(1, "srv");
        let mut config = ItemConfig::new("counter", DataType::Int32);
        config.delta_mode = DeltaMode::Simple;
        let item = bound_item(&h, &n, config);

        item.new_value(100, "50", &h.ctx);
        item.new_value(200, "80", &h.ctx);
        item.new_value(150, "70", &h.ctx);
        assert_eq!(h.gateway.history_values(100), vec!["0".to_string(), "30".to_string(), "-10".to_string()]);
        assert_eq!(item.last_value(), Some(ItemValue::new("30", 200)));
        assert_eq!(h.gateway.raw.lock().unwrap().get(&100), Some(&ItemValue::new("80", 200)));
    }

    #[test]
    fn test_threshold_fires_once_without_repeat() {
        let h = harness();
        let n = node(1, "srv");
        let item = bound_item(&h, &n, ItemConfig::new("cpu", DataType::Int32));
        let mut rule = ThresholdRule::new(1, CheckFunction::Last, Operation::Greater, "90");
        rule.repeat_interval = 0;
        with_rule(&h, &item, rule);

        for (i, v) in ["95", "96", "97", "98"].iter().enumerate() {
            item.new_value(100 + i as i64 * 1000, v, &h.ctx);
        }
        assert_eq!(h.events.codes(), vec![EVENT_THRESHOLD_REACHED]);

        let event = &h.events.events()[0];
        assert_eq!(event.source_id, 1);
        assert_eq!(event.param("dciName"), Some("cpu"));
        assert_eq!(event.param("thresholdValue"), Some("90"));
        assert_eq!(event.param("currentValue"), Some("95"));
        assert_eq!(event.param("dciId"), Some("100"));
        assert_eq!(event.param("isRepeatedEvent"), Some("0"));
        assert_eq!(*h.gateway.threshold_states.lock().unwrap(), vec![(1, true, 100)]);
    }

    #[test]
    fn test_threshold_repeats_after_interval() {
        let h = harness();
        let n = node(1, "srv");
        let item = bound_item(&h, &n, ItemConfig::new("cpu", DataType::Int32));
        let mut rule = ThresholdRule::new(1, CheckFunction::Last, Operation::Greater, "90");
        rule.repeat_interval = 60;
        with_rule(&h, &item, rule);

        item.new_value(100, "95", &h.ctx);
        item.new_value(130, "95", &h.ctx);
        item.new_value(160, "95", &h.ctx);
        item.new_value(190, "95", &h.ctx);
        item.new_value(220, "95", &h.ctx);
        let events = h.events.events();
        let repeats: Vec<&str> = events.iter().filter_map(|e| e.param("isRepeatedEvent")).collect();
        assert_eq!(repeats, vec!["0", "1", "1"]);
        assert_eq!(events[1].timestamp, 160);
        assert_eq!(events[2].timestamp, 220);
    }

    #[test]
    fn test_default_repeat_interval_applies() {
        let mut h = harness();
        h.ctx.settings.threshold_repeat_interval = 10;
        let n = node(1, "srv");
        let item = bound_item(&h, &n, ItemConfig::new("cpu", DataType::Int32));
        with_rule(&h, &item, ThresholdRule::new(1, CheckFunction::Last, Operation::Greater, "90"));

        item.new_value(100, "95", &h.ctx);
        item.new_value(105, "95", &h.ctx);
        item.new_value(110, "95", &h.ctx);
        assert_eq!(h.events.codes().len(), 2);
    }

    #[test]
    fn test_rearm_event() {
        let h = harness();
        let n = node(1, "srv");
        let item = bound_item(&h, &n, ItemConfig::new("cpu", DataType::Int32));
        let mut rule = ThresholdRule::new(1, CheckFunction::Last, Operation::Greater, "90");
        rule.rearm_value = Some("70".to_string());
        with_rule(&h, &item, rule);

        item.new_value(100, "95", &h.ctx);
        item.new_value(110, "80", &h.ctx);
        item.new_value(120, "60", &h.ctx);
        assert_eq!(h.events.codes(), vec![EVENT_THRESHOLD_REACHED, EVENT_THRESHOLD_REARMED]);
        let rearm = &h.events.events()[1];
        assert_eq!(rearm.param("instance"), Some(""));
        assert_eq!(rearm.param("currentValue"), Some("60"));
        assert!(!item.thresholds()[0].is_reached());
    }

    #[test]
    fn test_process_all_thresholds_flag() {
        for (process_all, expected) in [(false, 1), (true, 2)] {
            let h = harness();
            let n = node(1, "srv");
            let mut config = ItemConfig::new("cpu", DataType::Int32);
            config.process_all_thresholds = process_all;
            let item = bound_item(&h, &n, config);
            item.set_thresholds(vec![
                ThresholdRule::new(1, CheckFunction::Last, Operation::Greater, "90"),
                ThresholdRule::new(2, CheckFunction::Last, Operation::Greater, "80"),
            ]);
            item.update_required_depth(&h.ctx);

            item.new_value(100, "95", &h.ctx);
            assert_eq!(h.events.codes().len(), expected);
        }
    }

    #[test]
    fn test_inactive_rule_does_not_stop_evaluation() {
        let h = harness();
        let n = node(1, "srv");
        let item = bound_item(&h, &n, ItemConfig::new("cpu", DataType::Int32));
        item.set_thresholds(vec![
            ThresholdRule::new(1, CheckFunction::Last, Operation::Greater, "90"),
            ThresholdRule::new(2, CheckFunction::Last, Operation::Greater, "50"),
        ]);
        item.update_required_depth(&h.ctx);
        item.new_value(100, "60", &h.ctx);
        assert_eq!(h.events.events()[0].param("thresholdValue"), Some("50"));
    }

    #[test]
    fn test_average_over_available_samples() {
        let h = harness();
        let n = node(1, "srv");
        let item = bound_item(&h, &n, ItemConfig::new("load", DataType::Int32));
        let mut rule = ThresholdRule::new(1, CheckFunction::Average, Operation::Equal, "30");
        rule.sample_count = 5;
        with_rule(&h, &item, rule);
        assert_eq!(item.cache_depth(), 5);

        item.new_value(10, "10", &h.ctx);
        item.new_value(20, "20", &h.ctx);
        assert!(h.events.codes().is_empty());
        item.new_value(30, "60", &h.ctx);
        assert_eq!(h.events.codes(), vec![EVENT_THRESHOLD_REACHED]);
        assert_eq!(h.events.events()[0].param("currentValue"), Some("30"));
    }

    #[test]
    fn test_error_thresholds() {
        let h = harness();
        let n = node(1, "srv");
        let item = bound_item(&h, &n, ItemConfig::new("cpu", DataType::Int32));
        let mut error_rule = ThresholdRule::new(1, CheckFunction::Error, Operation::Equal, "0");
        error_rule.sample_count = 2;
        let value_rule = ThresholdRule::new(2, CheckFunction::Last, Operation::Greater, "0");
        item.set_thresholds(vec![error_rule, value_rule]);
        item.update_required_depth(&h.ctx);
        item.new_value(5, "0", &h.ctx);

        item.new_error(10, &h.ctx);
        assert!(h.events.codes().is_empty());
        item.new_error(20, &h.ctx);
        assert_eq!(h.events.codes(), vec![EVENT_THRESHOLD_REACHED]);
        assert_eq!(h.events.events()[0].param("currentValue"), Some("2"));
        assert_eq!(item.last_value(), Some(ItemValue::new("0", 5)));

        item.new_value(30, "0", &h.ctx);
        assert_eq!(h.events.codes(), vec![EVENT_THRESHOLD_REACHED, EVENT_THRESHOLD_REARMED]);
    }

    #[test]
    fn test_script_replaces_value() {
        let scripts = Arc::new(FixedScripts::new(Ok(Some("12.9".to_string()))));
        let h = harness_with_scripts(scripts.clone());
        let n = node(7, "srv");
        let mut config = ItemConfig::new("mem", DataType::Int32);
        config.transformation = TransformScript::new("return $1 / 1024;");
        let item = bound_item(&h, &n, config);

        item.new_value(10, "13210", &h.ctx);
        assert_eq!(item.last_value(), Some(ItemValue::new("12", 10)));
        assert_eq!(*scripts.seen_nodes.lock().unwrap(), vec![7]);
        assert_eq!(h.gateway.raw.lock().unwrap().get(&100).map(|v| v.to_string()).as_deref(), Some("13210"));
    }

    #[test]
    fn test_script_error_keeps_value_and_emits_event() {
        let scripts = Arc::new(FixedScripts::new(Err(ScriptError::Runtime("division by zero".to_string()))));
        let h = harness_with_scripts(scripts);
        let n = node(7, "srv");
        let mut config = ItemConfig::new("mem", DataType::Int32);
        config.transformation = TransformScript::new("return 1/0;");
        let item = bound_item(&h, &n, config);

        item.new_value(10, "5", &h.ctx);
        item.new_value(20, "6", &h.ctx);
        assert_eq!(item.last_value(), Some(ItemValue::new("6", 20)));

        let events = h.events.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].code, EVENT_SCRIPT_ERROR);
        assert_eq!(events[0].source_id, 1);
        assert_eq!(events[0].param("scriptName"), Some("DCI::srv::100::TransformationScript"));
    }

    #[test]
    fn test_readiness_rules() {
        let h = harness();
        let n = node(1, "srv");
        let item = Arc::new(DataItem::new(100, ItemConfig::new("cpu", DataType::Int32), Owner::Node(Arc::downgrade(&n))));
        assert!(!item.is_ready_for_polling(1000, &*h.cluster), "cache not loaded");
        item.update_required_depth(&h.ctx);
        assert!(item.is_ready_for_polling(1000, &*h.cluster));

        let guard = item.try_begin_poll(1000, &*h.cluster);
        assert!(guard.is_some());
        assert!(item.is_busy());
        assert!(item.try_begin_poll(2000, &*h.cluster).is_none());
        drop(guard);
        assert!(!item.is_busy());

        assert!(!item.is_ready_for_polling(1059, &*h.cluster));
        assert!(item.is_ready_for_polling(1060, &*h.cluster));

        item.set_status(ItemStatus::NotSupported, false, 0, &h.ctx);
        assert!(!item.is_ready_for_polling(1060, &*h.cluster));
        assert!(item.is_ready_for_polling(1600, &*h.cluster));

        item.set_status(ItemStatus::Disabled, false, 0, &h.ctx);
        assert!(!item.is_ready_for_polling(100_000, &*h.cluster));
    }

    #[test]
    fn test_push_items_never_ready() {
        let h = harness();
        let n = node(1, "srv");
        let mut config = ItemConfig::new("pushed", DataType::Int32);
        config.source = DataSource::Push;
        let item = bound_item(&h, &n, config);
        assert!(!item.is_ready_for_polling(100_000, &*h.cluster));
    }

    #[test]
    fn test_cluster_resource_ownership() {
        let h = harness();
        let n = node(1, "srv");
        let mut config = ItemConfig::new("vip", DataType::Int32);
        config.resource_id = 3;
        let item = bound_item(&h, &n, config);

        assert!(!item.is_ready_for_polling(100_000, &*h.cluster));
        h.cluster.set_owner(3, 2);
        assert!(!item.is_ready_for_polling(100_000, &*h.cluster));
        h.cluster.set_owner(3, 1);
        assert!(item.is_ready_for_polling(100_000, &*h.cluster));
    }

    #[test]
    fn test_advanced_schedule_once_per_minute() {
        let h = harness();
        let n = node(1, "srv");
        let item = bound_item(&h, &n, ItemConfig::new("cpu", DataType::Int32));
        item.set_schedules(vec!["* * * * *".to_string()], &h.ctx).unwrap();

        // Aligned to a minute boundary in every time zone offset
        let minute = 1_700_000_040;
        assert!(item.is_ready_for_polling(minute, &*h.cluster));
        assert!(item.is_ready_for_polling(minute + 5, &*h.cluster), "queries leave the minute unused");
        drop(item.try_begin_poll(minute + 5, &*h.cluster).unwrap());
        assert!(!item.is_ready_for_polling(minute + 10, &*h.cluster));
        assert!(item.try_begin_poll(minute + 10, &*h.cluster).is_none());
        assert!(item.is_ready_for_polling(minute + 60, &*h.cluster));
        assert_eq!(h.gateway.schedules.lock().unwrap().get(&100), Some(&vec!["* * * * *".to_string()]));
    }

    #[test]
    fn test_set_schedules_rejects_malformed() {
        let h = harness();
        let n = node(1, "srv");
        let item = bound_item(&h, &n, ItemConfig::new("cpu", DataType::Int32));
        let err = item.set_schedules(vec!["*/5 * * * *".to_string(), "1-2-3 * * * *".to_string()], &h.ctx);
        assert!(err.is_err());
        assert!(item.schedules().is_empty());
        assert_eq!(item.config().schedule, PollSchedule::Interval);
    }

    #[test]
    fn test_cache_depth_tracks_requirements() {
        let h = harness();
        let n = node(1, "srv");
        let item = bound_item(&h, &n, ItemConfig::new("cpu", DataType::Int32));
        assert_eq!(item.cache_depth(), 1);

        let mut rule = ThresholdRule::new(1, CheckFunction::Deviation, Operation::Greater, "5");
        rule.sample_count = 4;
        with_rule(&h, &item, rule);
        assert_eq!(item.cache_depth(), 4);

        h.consumers.register(9, vec![CacheRequirement { item_id: 100, depth: 6 }]);
        item.update_required_depth(&h.ctx);
        assert_eq!(item.cache_depth(), 6);

        h.consumers.unregister(9);
        item.set_thresholds(Vec::new());
        item.update_required_depth(&h.ctx);
        assert_eq!(item.cache_depth(), 1);
    }

    #[test]
    fn test_cache_growth_backfills_from_history() {
        let h = harness();
        let n = node(1, "srv");
        for (ts, v) in [(10, "1"), (20, "2"), (30, "3")] {
            h.gateway.append_history_row(100, ts, v);
        }
        let item = bound_item(&h, &n, ItemConfig::new("cpu", DataType::Int32));
        assert_eq!(item.cached_values(), vec![ItemValue::new("3", 30)]);

        item.new_value(40, "4", &h.ctx);
        let mut rule = ThresholdRule::new(1, CheckFunction::Sum, Operation::Greater, "100");
        rule.sample_count = 5;
        with_rule(&h, &item, rule);

        let stamps: Vec<i64> = item.cached_values().iter().map(ItemValue::timestamp).collect();
        assert_eq!(stamps, vec![40, 30, 20, 10]);
        assert_eq!(item.cache_depth(), 5);
    }

    #[test]
    fn test_cache_growth_survives_history_failure() {
        let h = harness();
        let n = node(1, "srv");
        let item = bound_item(&h, &n, ItemConfig::new("cpu", DataType::Int32));
        item.new_value(10, "7", &h.ctx);

        h.gateway.fail_reads.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut rule = ThresholdRule::new(1, CheckFunction::Average, Operation::Greater, "100");
        rule.sample_count = 3;
        with_rule(&h, &item, rule);
        assert_eq!(item.cache_depth(), 3);
        assert_eq!(item.cached_values(), vec![ItemValue::new("7", 10)]);
        assert!(item.is_cache_loaded());
    }

    #[test]
    fn test_status_events() {
        let h = harness();
        let n = node(4, "srv");
        let item = bound_item(&h, &n, ItemConfig::new("cpu", DataType::Int32));
        item.set_status(ItemStatus::NotSupported, true, 10, &h.ctx);
        item.set_status(ItemStatus::NotSupported, true, 11, &h.ctx);
        item.set_status(ItemStatus::Active, true, 12, &h.ctx);
        item.set_status(ItemStatus::Disabled, false, 13, &h.ctx);
        assert_eq!(h.events.codes(), vec![EVENT_DCI_UNSUPPORTED, EVENT_DCI_ACTIVE]);
        assert_eq!(h.events.events()[0].param("dciOriginName"), Some("agent"));
        assert_eq!(h.events.events()[0].source_id, 4);
        assert_eq!(
            *h.gateway.statuses.lock().unwrap(),
            vec![(100, ItemStatus::NotSupported), (100, ItemStatus::Active), (100, ItemStatus::Disabled)]
        );
    }

    #[test]
    fn test_value_for_consumers() {
        let h = harness();
        let n = node(1, "srv");
        let item = bound_item(&h, &n, ItemConfig::new("cpu", DataType::Int32));
        let mut rule = ThresholdRule::new(1, CheckFunction::Sum, Operation::Greater, "1000");
        rule.sample_count = 3;
        with_rule(&h, &item, rule);
        assert_eq!(item.value_for(CheckFunction::Last, 1), None);

        for (ts, v) in [(10, "2"), (20, "4"), (30, "9")] {
            item.new_value(ts, v, &h.ctx);
        }
        assert_eq!(item.value_for(CheckFunction::Last, 1).as_deref(), Some("9"));
        assert_eq!(item.value_for(CheckFunction::Diff, 1).as_deref(), Some("5"));
        assert_eq!(item.value_for(CheckFunction::Average, 3).as_deref(), Some("5"));
        assert_eq!(item.value_for(CheckFunction::Sum, 2).as_deref(), Some("13"));
        assert_eq!(item.value_for(CheckFunction::Error, 1).as_deref(), Some("0"));
    }

    #[test]
    fn test_restore_previous_raw() {
        let h = harness();
        let n = node(1, "srv");
        h.gateway.upsert_current_raw_value(100, "1000", 50);
        let mut config = ItemConfig::new("octets", DataType::UInt64);
        config.delta_mode = DeltaMode::Simple;
        let item = bound_item(&h, &n, config);
        item.restore_previous_raw(&h.ctx);
        item.new_value(110, "1600", &h.ctx);
        assert_eq!(item.last_value().map(|v| v.to_string()).as_deref(), Some("600"));
    }

    #[test]
    fn test_template_instantiation_and_update() {
        let h = harness();
        let ids = IdAllocator::new(500);
        let n = node(3, "web01");
        let mut tpl_config = ItemConfig::new("Disk %{node_name}", DataType::Float);
        tpl_config.instance = "%{node_id}:/".to_string();
        let template = DataItem::new(10, tpl_config, Owner::Template(77));
        template.set_thresholds(vec![
            ThresholdRule::new(1, CheckFunction::Last, Operation::Greater, "90"),
            ThresholdRule::new(2, CheckFunction::Last, Operation::Greater, "95"),
        ]);

        let item = DataItem::instantiate(&template, 200, &n, &ids, &h.ctx);
        assert_eq!(item.name(), "Disk web01");
        assert_eq!(item.config().instance, "3:/");
        let ids_before: Vec<u32> = item.thresholds().iter().map(|r| r.id).collect();
        assert_eq!(ids_before, vec![500, 501]);
        assert_eq!(item.cache_depth(), 1);

        // Second rule changes; first keeps its id and state
        let mut changed = ThresholdRule::new(2, CheckFunction::Last, Operation::Greater, "99");
        changed.repeat_interval = 0;
        template.set_thresholds(vec![ThresholdRule::new(1, CheckFunction::Last, Operation::Greater, "90.0"), changed]);
        item.update_from_template(&template, &ids, 1000, &h.ctx);
        let rules = item.thresholds();
        assert_eq!(rules.iter().map(|r| r.id).collect::<Vec<_>>(), vec![500, 502]);
        assert_eq!(rules[1].fire_value, "99");
        let saved: Vec<u32> = h.gateway.rules.lock().unwrap()[&200].iter().map(|r| r.id).collect();
        assert_eq!(saved, vec![500, 502]);
    }

    #[test]
    fn test_snapshot_and_record() {
        let h = harness();
        let n = node(1, "srv");
        let mut config = ItemConfig::new("cpu", DataType::Int32);
        config.description = "CPU usage".to_string();
        let item = bound_item(&h, &n, config);
        with_rule(&h, &item, ThresholdRule::new(1, CheckFunction::Last, Operation::Greater, "90"));
        item.new_value(10, "42", &h.ctx);

        let snap = item.snapshot();
        assert_eq!(snap.owner_id, 1);
        assert_eq!(snap.last_value.as_deref(), Some("42"));
        assert_eq!(snap.thresholds.len(), 1);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["data_type"], "Int32");

        let record = item.to_record();
        assert_eq!(record.node_id, 1);
        assert_eq!(ItemConfig::from_record(&record, Vec::new()), item.config());
    }

    #[tokio::test]
    async fn test_delete_waits_for_in_flight_poll() {
        let h = harness();
        let n = node(1, "srv");
        let item = bound_item(&h, &n, ItemConfig::new("cpu", DataType::Int32));
        let guard = item.try_begin_poll(1000, &*h.cluster).unwrap();

        let deleting = {
            let item = item.clone();
            let ctx = h.ctx.clone();
            tokio::spawn(async move { item.delete(&ctx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(item.lifecycle(), Lifecycle::Draining);
        assert_eq!(item.status(), ItemStatus::Disabled);
        assert!(h.gateway.deleted.lock().unwrap().is_empty());

        guard.item().new_value(1000, "5", &h.ctx);
        drop(guard);
        deleting.await.unwrap();
        assert_eq!(item.lifecycle(), Lifecycle::Deleted);
        assert_eq!(*h.gateway.deleted.lock().unwrap(), vec![100]);
    }
}
