//! Configuration module for dcollect.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path to the SQLite database file (default: "dcollect.db")
    pub db_path: String,
    /// Number of poller workers (default: 4)
    pub poller_workers: usize,
    /// Worker scan period (default: 1s)
    pub poll_tick: Duration,
    /// Per-fetch timeout (default: 5s)
    pub fetch_timeout: Duration,
    /// HTTP agent port (default: 4700)
    pub agent_port: u16,
    /// Default threshold repeat interval in seconds, 0 disables repeats
    pub threshold_repeat_interval: u32,
    /// Source object for server-level events (default: 1)
    pub management_node_id: u32,
    /// Cluster resource ownership as `resource:node` pairs
    pub cluster_resources: String,
    /// How often expired history is deleted (default: 1h)
    pub retention_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: "dcollect.db".to_string(),
            poller_workers: 4,
            poll_tick: Duration::from_millis(1000),
            fetch_timeout: Duration::from_secs(5),
            agent_port: 4700,
            threshold_repeat_interval: 0,
            management_node_id: 1,
            cluster_resources: String::new(),
            retention_interval: Duration::from_secs(3600),
        }
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let value = env::var(name).ok()?;
    match value.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring invalid value {:?} for {}", value, name);
            None
        }
    }
}

impl ServerConfig {
    /// Load configuration from `DCOLLECT_*` environment variables.
    /// Unparsable values keep their defaults.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(db_path) = env::var("DCOLLECT_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Some(workers) = parse_var("DCOLLECT_POLLER_WORKERS") {
            cfg.poller_workers = workers;
        }
        if let Some(ms) = parse_var("DCOLLECT_POLL_TICK_MS") {
            cfg.poll_tick = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var("DCOLLECT_FETCH_TIMEOUT") {
            cfg.fetch_timeout = Duration::from_secs(secs);
        }
        if let Some(port) = parse_var("DCOLLECT_AGENT_PORT") {
            cfg.agent_port = port;
        }
        if let Some(secs) = parse_var("DCOLLECT_THRESHOLD_REPEAT_INTERVAL") {
            cfg.threshold_repeat_interval = secs;
        }
        if let Some(id) = parse_var("DCOLLECT_MANAGEMENT_NODE_ID") {
            cfg.management_node_id = id;
        }
        if let Ok(resources) = env::var("DCOLLECT_CLUSTER_RESOURCES") {
            cfg.cluster_resources = resources;
        }
        if let Some(secs) = parse_var("DCOLLECT_RETENTION_INTERVAL") {
            cfg.retention_interval = Duration::from_secs(secs);
        }

        cfg
    }
}
