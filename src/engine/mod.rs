//! Engine role: client-facing appends, replication progress, tag reads

mod core;
mod tag_index;

pub use self::core::{EngineCore, EngineEvent};
pub use tag_index::TagIndex;
