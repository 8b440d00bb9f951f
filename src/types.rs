//! Core identifier types and the record model
//!
//! Identifier layouts:
//!
//! - `logspace_id = (view_id:16 | sequencer_node_id:16)` — the unit of
//!   replication and ordering.
//! - `local_id   = (view_id:16 | node_id:16 | counter:32)` — names a record
//!   before a seqnum is assigned.
//! - `seqnum` is a dense 64-bit global sequence number; each view's range
//!   starts at the sealed boundary of its predecessor, so higher view ids
//!   always produce higher seqnums.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::util::bits;

/// Identifier of a participating node (engine, storage, or sequencer)
pub type NodeId = u16;

/// Monotonically increasing view identifier
pub type ViewId = u16;

/// Packed `(view_id, sequencer_id)` identifier of a logspace
pub type LogSpaceId = u32;

/// Packed `(view_id, node_id, counter)` pre-commit record identifier
pub type LocalId = u64;

/// Global sequence number assigned by the sequencer's metalog
pub type SeqNum = u64;

/// Selective-read key attached to each record
pub type Tag = u64;

/// The empty/default tag
pub const EMPTY_TAG: Tag = 0;

/// Build a logspace id from a view id and the owning sequencer node
#[inline]
pub const fn build_logspace_id(view_id: ViewId, sequencer_id: NodeId) -> LogSpaceId {
    bits::join_two16(view_id, sequencer_id)
}

/// View id half of a logspace id
#[inline]
pub const fn logspace_id_to_view_id(logspace_id: LogSpaceId) -> ViewId {
    bits::high_half32(logspace_id)
}

/// Sequencer node half of a logspace id
#[inline]
pub const fn logspace_id_to_sequencer_id(logspace_id: LogSpaceId) -> NodeId {
    bits::low_half32(logspace_id)
}

/// Build a local id from its `(view_id, node_id, counter)` parts
#[inline]
pub const fn build_local_id(view_id: ViewId, node_id: NodeId, counter: u32) -> LocalId {
    bits::join_two32(bits::join_two16(view_id, node_id), counter)
}

/// View id of a local id
#[inline]
pub const fn local_id_to_view_id(local_id: LocalId) -> ViewId {
    bits::high_half32(bits::high_half64(local_id))
}

/// Originating engine node of a local id
#[inline]
pub const fn local_id_to_node_id(local_id: LocalId) -> NodeId {
    bits::low_half32(bits::high_half64(local_id))
}

/// Per-view counter of a local id
#[inline]
pub const fn local_id_to_counter(local_id: LocalId) -> u32 {
    bits::low_half64(local_id)
}

/// Metadata of a log record, separate from its payload so progress tracking
/// and wire headers can carry it without the body
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMetaData {
    /// Pre-commit identifier
    pub local_id: LocalId,
    /// Assigned seqnum; 0 until the metalog cut lands
    pub seqnum: SeqNum,
    /// Selective-read tag
    pub tag: Tag,
}

/// A log record: metadata plus payload bytes
///
/// Bodies are `Bytes` so the storage live cache, the persistence pipeline,
/// and read responses can share one allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogEntry {
    pub metadata: LogMetaData,
    pub data: Bytes,
}

impl LogEntry {
    /// Create a record in the pre-commit state (seqnum 0)
    pub fn new(local_id: LocalId, tag: Tag, data: Bytes) -> Self {
        Self {
            metadata: LogMetaData {
                local_id,
                seqnum: 0,
                tag,
            },
            data,
        }
    }

    /// Reset a recycled entry before reuse
    pub fn reset(&mut self, local_id: LocalId, tag: Tag, data: Bytes) {
        self.metadata = LogMetaData {
            local_id,
            seqnum: 0,
            tag,
        };
        self.data = data;
    }
}
