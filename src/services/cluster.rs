//! Cluster resource ownership.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Answers which cluster node currently owns a high-availability resource.
pub trait ClusterResources: Send + Sync {
    fn is_resource_owned_by_node(&self, resource_id: u32, node_id: u32) -> bool;
}

/// Ownership table filled from configuration and updated on failover.
#[derive(Debug, Default)]
pub struct StaticClusterResources {
    owners: RwLock<HashMap<u32, u32>>,
}

impl StaticClusterResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `resource:node` pairs separated by commas. Malformed pairs are
    /// skipped with a warning.
    pub fn parse(pairs: &str) -> Self {
        let mut owners = HashMap::new();
        for pair in pairs.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let parsed = pair
                .split_once(':')
                .and_then(|(r, n)| Some((r.trim().parse::<u32>().ok()?, n.trim().parse::<u32>().ok()?)));
            match parsed {
                Some((resource, node)) => {
                    owners.insert(resource, node);
                }
                None => tracing::warn!("Ignoring malformed cluster resource entry '{}'", pair),
            }
        }
        Self {
            owners: RwLock::new(owners),
        }
    }

    /// Record a new owner for `resource_id`.
    pub fn set_owner(&self, resource_id: u32, node_id: u32) {
        let mut owners = self.owners.write().unwrap_or_else(PoisonError::into_inner);
        if owners.insert(resource_id, node_id) != Some(node_id) {
            tracing::info!("Cluster resource {} moved to node {}", resource_id, node_id);
        }
    }

    pub fn owner(&self, resource_id: u32) -> Option<u32> {
        self.owners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&resource_id)
            .copied()
    }
}

impl ClusterResources for StaticClusterResources {
    fn is_resource_owned_by_node(&self, resource_id: u32, node_id: u32) -> bool {
        self.owner(resource_id) == Some(node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pairs() {
        let cluster = StaticClusterResources::parse("1:10, 2:20,bad,3:x");
        assert!(cluster.is_resource_owned_by_node(1, 10));
        assert!(cluster.is_resource_owned_by_node(2, 20));
        assert!(!cluster.is_resource_owned_by_node(1, 20));
        assert_eq!(cluster.owner(3), None);
    }

    #[test]
    fn test_failover() {
        let cluster = StaticClusterResources::new();
        assert!(!cluster.is_resource_owned_by_node(5, 1));
        cluster.set_owner(5, 1);
        assert!(cluster.is_resource_owned_by_node(5, 1));
        cluster.set_owner(5, 2);
        assert!(!cluster.is_resource_owned_by_node(5, 1));
    }
}
