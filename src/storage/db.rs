//! Persistence adapter contract and the in-memory implementation
//!
//! The adapter owns durability: `put` must be fsync-equivalent before it
//! returns. Entries are encoded with a crc32 over metadata and body,
//! verified when loaded back, so a corrupt store surfaces as a typed error
//! instead of bad payload bytes.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SharedLogError};
use crate::types::{LogEntry, LogMetaData, SeqNum};

/// Backing database for records evicted from the live cache
pub trait PersistenceAdapter: Send + Sync {
    /// Durably store an entry under its seqnum
    fn put(&self, seqnum: SeqNum, entry: &LogEntry) -> Result<()>;

    /// Load an entry by seqnum, `None` if absent
    fn get(&self, seqnum: SeqNum) -> Result<Option<LogEntry>>;
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    local_id: u64,
    tag: u64,
    crc: u32,
    data: Vec<u8>,
}

fn checksum(metadata: &LogMetaData, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&metadata.local_id.to_le_bytes());
    hasher.update(&metadata.seqnum.to_le_bytes());
    hasher.update(&metadata.tag.to_le_bytes());
    hasher.update(data);
    hasher.finalize()
}

/// Encode an entry for the adapter
pub fn encode_entry(entry: &LogEntry) -> Result<Bytes> {
    let stored = StoredEntry {
        local_id: entry.metadata.local_id,
        tag: entry.metadata.tag,
        crc: checksum(&entry.metadata, &entry.data),
        data: entry.data.to_vec(),
    };
    Ok(Bytes::from(serde_json::to_vec(&stored)?))
}

/// Decode and checksum-verify an entry loaded from the adapter
pub fn decode_entry(seqnum: SeqNum, raw: &[u8]) -> Result<LogEntry> {
    let stored: StoredEntry = serde_json::from_slice(raw)?;
    let entry = LogEntry {
        metadata: LogMetaData {
            local_id: stored.local_id,
            seqnum,
            tag: stored.tag,
        },
        data: Bytes::from(stored.data),
    };
    if checksum(&entry.metadata, &entry.data) != stored.crc {
        return Err(SharedLogError::storage(format!(
            "checksum mismatch for seqnum {seqnum:#018x}"
        )));
    }
    Ok(entry)
}

/// In-memory adapter for tests and embedded deployments
#[derive(Debug, Default)]
pub struct MemoryDb {
    entries: Mutex<HashMap<SeqNum, Bytes>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl PersistenceAdapter for MemoryDb {
    fn put(&self, seqnum: SeqNum, entry: &LogEntry) -> Result<()> {
        let encoded = encode_entry(entry)?;
        self.entries.lock().insert(seqnum, encoded);
        Ok(())
    }

    fn get(&self, seqnum: SeqNum) -> Result<Option<LogEntry>> {
        let raw = self.entries.lock().get(&seqnum).cloned();
        match raw {
            Some(raw) => Ok(Some(decode_entry(seqnum, &raw)?)),
            None => Ok(None),
        }
    }
}
