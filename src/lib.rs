//! dcollect - data collection core of a network monitoring server.
//!
//! Items (DCIs) are polled from their nodes, transformed, checked against
//! threshold rules and cached for consumers.

pub mod config;
pub mod db;
pub mod dci;
pub mod node;
pub mod poller;
pub mod services;

#[cfg(test)]
mod testing;
