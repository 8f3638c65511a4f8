//! Collaborators a DCI works with while collecting.

use crate::db::PersistenceGateway;
use crate::services::{CacheConsumerRegistry, ClusterResources, EventSink, ScriptHost};

use std::sync::Arc;

/// Server-wide collection settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionSettings {
    /// Repeat interval, in seconds, for thresholds configured with -1.
    pub threshold_repeat_interval: u32,
    /// Object that server-level events (script errors) are raised on.
    pub management_node_id: u32,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            threshold_repeat_interval: 0,
            management_node_id: 1,
        }
    }
}

#[derive(Clone)]
pub struct CollectionContext {
    pub persistence: Arc<dyn PersistenceGateway>,
    pub scripts: Arc<dyn ScriptHost>,
    pub events: Arc<dyn EventSink>,
    pub cluster: Arc<dyn ClusterResources>,
    pub consumers: Arc<dyn CacheConsumerRegistry>,
    pub settings: CollectionSettings,
}
