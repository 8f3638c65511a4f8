//! Live nodes and data collection items.

use crate::db::{DbError, ItemRecord, Store};
use crate::dci::{CollectionContext, DataItem, IdAllocator, Owner};
use crate::node::Node;
use crate::services::{CacheRequirement, ConsumerIndex};

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Owns nodes and items. Items refer back to their node weakly.
#[derive(Default)]
pub struct ItemRegistry {
    nodes: RwLock<HashMap<u32, Arc<Node>>>,
    items: RwLock<HashMap<u32, Arc<DataItem>>>,
    threshold_ids: IdAllocator,
}

impl ItemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every node and item from the store, restore each item's delta
    /// base and size its cache.
    pub fn load(store: &Store, ctx: &CollectionContext) -> Result<Self, DbError> {
        let mut registry = Self::new();
        registry.threshold_ids = IdAllocator::new(store.max_threshold_id()?.saturating_add(1));
        for node in store.get_nodes()? {
            registry.add_node(node);
        }

        for record in store.get_items()? {
            let thresholds = ctx.persistence.load_threshold_rules(record.id)?;
            let schedules = if record.advanced_schedule {
                ctx.persistence.load_schedule_patterns(record.id)?
            } else {
                Vec::new()
            };
            let item = DataItem::from_record(&record, registry.owner_for(&record), thresholds, schedules);
            item.restore_previous_raw(ctx);
            item.update_required_depth(ctx);
            registry.add_item(Arc::new(item));
        }

        Ok(registry)
    }

    fn owner_for(&self, record: &ItemRecord) -> Owner {
        if record.node_id != 0 {
            match self.node(record.node_id) {
                Some(node) => Owner::Node(Arc::downgrade(&node)),
                None => {
                    tracing::warn!("Item {} refers to missing node {}", record.id, record.node_id);
                    Owner::Unbound
                }
            }
        } else if record.template_id != 0 {
            Owner::Template(record.template_id)
        } else {
            Owner::Unbound
        }
    }

    pub fn add_node(&self, node: Node) -> Arc<Node> {
        let node = Arc::new(node);
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node.id, node.clone());
        node
    }

    pub fn node(&self, id: u32) -> Option<Arc<Node>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn add_item(&self, item: Arc<DataItem>) {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(item.id(), item);
    }

    pub fn item(&self, id: u32) -> Option<Arc<DataItem>> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Snapshot of all items. The registry lock is released on return.
    pub fn items(&self) -> Vec<Arc<DataItem>> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn item_count(&self) -> usize {
        self.items.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Bind a copy of template item `template_item_id` to a node under
    /// `new_id`. Threshold ids continue after the highest stored one.
    pub fn instantiate_template(
        &self,
        template_item_id: u32,
        node_id: u32,
        new_id: u32,
        ctx: &CollectionContext,
    ) -> Option<Arc<DataItem>> {
        let template = self.item(template_item_id)?;
        let node = self.node(node_id)?;
        let item = Arc::new(DataItem::instantiate(&template, new_id, &node, &self.threshold_ids, ctx));
        tracing::info!("Item {} instantiated from template item {} on node {}", new_id, template_item_id, node.name);
        self.add_item(item.clone());
        Some(item)
    }

    /// Remove an item from polling and delete it once any in-flight poll
    /// has finished.
    pub async fn delete_item(&self, id: u32, ctx: &CollectionContext) -> bool {
        let item = self.items.write().unwrap_or_else(PoisonError::into_inner).remove(&id);
        match item {
            Some(item) => {
                item.delete(ctx).await;
                true
            }
            None => false,
        }
    }

    /// Register a cache consumer and resize the items it touches. The
    /// index's write lock is released before any item is locked.
    pub fn register_consumer(
        &self,
        index: &ConsumerIndex,
        consumer_id: u32,
        requirements: Vec<CacheRequirement>,
        ctx: &CollectionContext,
    ) {
        let affected = index.register(consumer_id, requirements);
        self.resize(&affected, ctx);
    }

    pub fn unregister_consumer(&self, index: &ConsumerIndex, consumer_id: u32, ctx: &CollectionContext) {
        let affected = index.unregister(consumer_id);
        self.resize(&affected, ctx);
    }

    fn resize(&self, ids: &[u32], ctx: &CollectionContext) {
        for id in ids {
            if let Some(item) = self.item(*id) {
                item.update_required_depth(ctx);
            }
        }
    }
}
