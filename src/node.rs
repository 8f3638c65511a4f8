//! Monitored nodes and the read-only view handed to scripts.

use std::net::IpAddr;

/// Capability flags discovered on a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCapabilities {
    pub agent: bool,
    pub snmp: bool,
    pub bridge: bool,
    pub router: bool,
}

/// Read-only accessors for a node's identity and metadata.
pub trait NodeContextView: Send + Sync {
    fn node_id(&self) -> u32;
    fn name(&self) -> &str;
    fn primary_ip(&self) -> Option<IpAddr>;
    fn capabilities(&self) -> NodeCapabilities;
    fn platform(&self) -> &str;
    fn agent_version(&self) -> Option<&str>;
    fn snmp_object_id(&self) -> Option<&str>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: u32,
    pub name: String,
    pub primary_ip: Option<IpAddr>,
    pub capabilities: NodeCapabilities,
    pub platform: String,
    pub agent_version: Option<String>,
    pub snmp_object_id: Option<String>,
}

impl Node {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            primary_ip: None,
            capabilities: NodeCapabilities::default(),
            platform: String::new(),
            agent_version: None,
            snmp_object_id: None,
        }
    }
}

impl NodeContextView for Node {
    fn node_id(&self) -> u32 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn primary_ip(&self) -> Option<IpAddr> {
        self.primary_ip
    }

    fn capabilities(&self) -> NodeCapabilities {
        self.capabilities
    }

    fn platform(&self) -> &str {
        &self.platform
    }

    fn agent_version(&self) -> Option<&str> {
        self.agent_version.as_deref()
    }

    fn snmp_object_id(&self) -> Option<&str> {
        self.snmp_object_id.as_deref()
    }
}
