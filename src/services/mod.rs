//! Collaborator contracts consumed by the collection core, with the
//! in-process implementations the daemon runs with.

mod cluster;
mod consumers;
mod events;
mod script;

pub use cluster::*;
pub use consumers::*;
pub use events::*;
pub use script::*;
