//! Storage role: record persistence and the seqnum read path

pub mod db;
pub mod flusher;
mod log_storage;
mod node;

pub use db::{MemoryDb, PersistenceAdapter};
pub use log_storage::{LogStorage, ReadRequest, ReadResponse, ReadResult};
pub use node::{StorageNode, StorageOutcome};
