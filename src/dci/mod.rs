//! Data collection items and the machinery they run on: typed values,
//! schedules, the value cache and threshold rules.

mod cache;
mod context;
mod item;
mod macros;
mod schedule;
mod snapshot;
mod threshold;
mod value;

pub use cache::*;
pub use context::*;
pub use item::*;
pub use macros::*;
pub use schedule::*;
pub use snapshot::*;
pub use threshold::*;
pub use value::*;
