//! Database module for the collector.
//!
//! Provides SQLite storage and the persistence gateway the collection core
//! writes through.

mod gateway;
mod models;
mod store;

pub use gateway::*;
pub use models::*;
pub use store::*;
