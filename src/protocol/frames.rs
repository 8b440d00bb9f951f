//! Structured payload frames
//!
//! Metalog batches, local cuts, FSM records, and view markers are
//! serde-encoded and framed as length-prefixed JSON:
//!
//! ```text
//! [4 bytes: frame length (big-endian)] [frame JSON bytes]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::types::{LocalId, LogSpaceId, NodeId, SeqNum, ViewId};
use crate::view::ViewDescriptor;

/// Body of a metalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaLogKind {
    /// Assign `[start_seqnum, start_seqnum + Σdelta)` to the engines'
    /// shards, in engine-id order
    NewLogs {
        start_seqnum: SeqNum,
        shard_starts: Vec<u32>,
        shard_deltas: Vec<u32>,
    },
    /// Reserved
    Trim,
}

/// One entry of a logspace's metalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaLogRecord {
    pub logspace_id: LogSpaceId,
    /// Dense position of this entry within its logspace
    pub metalog_seqnum: u32,
    pub kind: MetaLogKind,
}

impl MetaLogRecord {
    /// Total number of seqnums this entry assigns
    pub fn total_delta(&self) -> u64 {
        match &self.kind {
            MetaLogKind::NewLogs { shard_deltas, .. } => {
                shard_deltas.iter().map(|d| u64::from(*d)).sum()
            }
            MetaLogKind::Trim => 0,
        }
    }

    /// First seqnum assigned by this entry, if it assigns any
    pub fn start_seqnum(&self) -> Option<SeqNum> {
        match &self.kind {
            MetaLogKind::NewLogs { start_seqnum, .. } => Some(*start_seqnum),
            MetaLogKind::Trim => None,
        }
    }

    /// One past the last seqnum assigned by this entry
    pub fn end_seqnum(&self) -> Option<SeqNum> {
        self.start_seqnum().map(|s| s + self.total_delta())
    }
}

/// A run of metalog entries replicated from the primary in one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaLogsBatch {
    pub logspace_id: LogSpaceId,
    pub records: Vec<MetaLogRecord>,
}

/// Periodic per-engine progress report
///
/// `localid_cuts[0]` is the reporting engine's own tail (`next_localid`);
/// the remaining entries are the replication progress this engine holds for
/// each primary in its neighborhood, in the view's iteration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalCutRecord {
    pub view_id: ViewId,
    pub node_id: NodeId,
    pub localid_cuts: Vec<u32>,
}

/// A record on the linearized FSM channel every participant consumes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsmRecord {
    /// A new view has been installed
    NewView(ViewDescriptor),
    /// A shard run `[start_seqnum, start_seqnum + delta)` maps to local ids
    /// `[start_local_id, start_local_id + delta)`
    LogReplicated {
        start_local_id: LocalId,
        start_seqnum: SeqNum,
        delta: u32,
    },
    /// A committed cut assigned `[start_seqnum, end_seqnum)`
    GlobalCut {
        start_seqnum: SeqNum,
        end_seqnum: SeqNum,
    },
}

/// A run of FSM records delivered in one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsmRecordsBatch {
    pub records: Vec<FsmRecord>,
}

/// Encode a value as a length-prefixed JSON frame
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Bytes> {
    let body = serde_json::to_vec(value)?;
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Decode a length-prefixed JSON frame
pub fn decode_frame<T: DeserializeOwned>(mut payload: Bytes) -> Result<T> {
    if payload.len() < 4 {
        return Err(ProtocolError::Truncated {
            needed: 4,
            available: payload.len(),
        }
        .into());
    }
    let len = payload.get_u32() as usize;
    if payload.len() < len {
        return Err(ProtocolError::Truncated {
            needed: len,
            available: payload.len(),
        }
        .into());
    }
    let value = serde_json::from_slice(&payload[..len])?;
    Ok(value)
}
