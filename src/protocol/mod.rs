//! Wire protocol for shared log traffic
//!
//! Every message starts with the fixed-size [`SharedLogMessage`] header,
//! encoded big-endian. The payload follows inline; a negative
//! `payload_size` signals that the body travels through a shared-memory
//! region instead (the magnitude is the region size).
//!
//! Structured payloads (metalog batches, local cuts, FSM records) are
//! length-prefixed JSON frames defined in [`frames`].

pub mod frames;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::types::{LocalId, LogSpaceId, NodeId, SeqNum, Tag, ViewId};

/// Operation carried by a [`SharedLogMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SharedLogOpType {
    /// Client append at the tag's primary engine
    Append = 0,
    /// Record body replication between nodes
    Replicate = 1,
    /// Read the record at an exact seqnum
    ReadAt = 2,
    /// Read the closest record at or before a seqnum for a tag
    ReadPrev = 3,
    /// Read the closest record at or after a seqnum for a tag
    ReadNext = 4,
    /// Backup sequencer acknowledging its metalog position
    MetaProg = 5,
    /// Storage node reporting per-source-engine replication progress
    ShardProg = 6,
    /// Primary sequencer replicating metalog entries to backups
    MetaLogs = 7,
    /// Engine reporting its periodic local cut
    LocalCut = 8,
    /// Reserved: trim the log below a seqnum
    Trim = 9,
    /// Response to any of the request ops
    Response = 10,
}

impl SharedLogOpType {
    /// Decode from the wire representation
    pub fn from_u16(value: u16) -> Result<Self> {
        let op = match value {
            0 => SharedLogOpType::Append,
            1 => SharedLogOpType::Replicate,
            2 => SharedLogOpType::ReadAt,
            3 => SharedLogOpType::ReadPrev,
            4 => SharedLogOpType::ReadNext,
            5 => SharedLogOpType::MetaProg,
            6 => SharedLogOpType::ShardProg,
            7 => SharedLogOpType::MetaLogs,
            8 => SharedLogOpType::LocalCut,
            9 => SharedLogOpType::Trim,
            10 => SharedLogOpType::Response,
            other => return Err(ProtocolError::UnknownOpType(other).into()),
        };
        Ok(op)
    }
}

/// Size in bytes of the encoded fixed header
pub const HEADER_SIZE: usize = 46;

/// Fixed-size header of every shared log message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedLogMessage {
    pub op_type: SharedLogOpType,
    pub view_id: ViewId,
    pub logspace_id: LogSpaceId,
    /// Sequencer owning the logspace this message belongs to
    pub sequencer_id: NodeId,
    /// Node that produced the message
    pub origin_node_id: NodeId,
    /// Forwarding hops taken so far
    pub hop_times: u16,
    pub metalog_position: u32,
    pub seqnum: SeqNum,
    pub localid: LocalId,
    pub user_tag: Tag,
    /// Inline payload length; negative means shared-memory indirection
    pub payload_size: i32,
}

impl SharedLogMessage {
    fn empty(op_type: SharedLogOpType) -> Self {
        Self {
            op_type,
            view_id: 0,
            logspace_id: 0,
            sequencer_id: 0,
            origin_node_id: 0,
            hop_times: 0,
            metalog_position: 0,
            seqnum: 0,
            localid: 0,
            user_tag: 0,
            payload_size: 0,
        }
    }

    /// Build a REPLICATE message carrying a record body to a backup
    pub fn new_replicate(
        view_id: ViewId,
        origin_node_id: NodeId,
        localid: LocalId,
        user_tag: Tag,
        payload_size: i32,
    ) -> Self {
        Self {
            view_id,
            origin_node_id,
            localid,
            user_tag,
            payload_size,
            ..Self::empty(SharedLogOpType::Replicate)
        }
    }

    /// Build a READ_AT request
    pub fn new_read_at(logspace_id: LogSpaceId, origin_node_id: NodeId, seqnum: SeqNum) -> Self {
        Self {
            view_id: crate::types::logspace_id_to_view_id(logspace_id),
            logspace_id,
            origin_node_id,
            seqnum,
            ..Self::empty(SharedLogOpType::ReadAt)
        }
    }

    /// Build a META_PROG acknowledgment from a backup sequencer
    pub fn new_metalog_progress(
        logspace_id: LogSpaceId,
        origin_node_id: NodeId,
        metalog_position: u32,
    ) -> Self {
        Self {
            view_id: crate::types::logspace_id_to_view_id(logspace_id),
            logspace_id,
            sequencer_id: crate::types::logspace_id_to_sequencer_id(logspace_id),
            origin_node_id,
            metalog_position,
            ..Self::empty(SharedLogOpType::MetaProg)
        }
    }

    /// Build a SHARD_PROG report from a storage node
    pub fn new_shard_progress(
        logspace_id: LogSpaceId,
        origin_node_id: NodeId,
        payload_size: i32,
    ) -> Self {
        Self {
            view_id: crate::types::logspace_id_to_view_id(logspace_id),
            logspace_id,
            sequencer_id: crate::types::logspace_id_to_sequencer_id(logspace_id),
            origin_node_id,
            payload_size,
            ..Self::empty(SharedLogOpType::ShardProg)
        }
    }

    /// Build a METALOGS replication message from the primary sequencer
    pub fn new_metalogs(
        logspace_id: LogSpaceId,
        origin_node_id: NodeId,
        metalog_position: u32,
        payload_size: i32,
    ) -> Self {
        Self {
            view_id: crate::types::logspace_id_to_view_id(logspace_id),
            logspace_id,
            sequencer_id: crate::types::logspace_id_to_sequencer_id(logspace_id),
            origin_node_id,
            metalog_position,
            payload_size,
            ..Self::empty(SharedLogOpType::MetaLogs)
        }
    }

    /// Build a LOCAL_CUT report from an engine
    pub fn new_local_cut(view_id: ViewId, origin_node_id: NodeId, payload_size: i32) -> Self {
        Self {
            view_id,
            origin_node_id,
            payload_size,
            ..Self::empty(SharedLogOpType::LocalCut)
        }
    }

    /// True if the payload travels through shared memory rather than inline
    pub fn uses_shared_memory(&self) -> bool {
        self.payload_size < 0
    }

    /// Encode the header into `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_SIZE);
        buf.put_u16(self.op_type as u16);
        buf.put_u16(self.view_id);
        buf.put_u32(self.logspace_id);
        buf.put_u16(self.sequencer_id);
        buf.put_u16(self.origin_node_id);
        buf.put_u16(self.hop_times);
        buf.put_u32(self.metalog_position);
        buf.put_u64(self.seqnum);
        buf.put_u64(self.localid);
        buf.put_u64(self.user_tag);
        buf.put_i32(self.payload_size);
    }

    /// Encode the header into a fresh buffer
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a header from `buf`, consuming exactly [`HEADER_SIZE`] bytes
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                needed: HEADER_SIZE,
                available: buf.remaining(),
            }
            .into());
        }
        let op_type = SharedLogOpType::from_u16(buf.get_u16())?;
        Ok(Self {
            op_type,
            view_id: buf.get_u16(),
            logspace_id: buf.get_u32(),
            sequencer_id: buf.get_u16(),
            origin_node_id: buf.get_u16(),
            hop_times: buf.get_u16(),
            metalog_position: buf.get_u32(),
            seqnum: buf.get_u64(),
            localid: buf.get_u64(),
            user_tag: buf.get_u64(),
            payload_size: buf.get_i32(),
        })
    }
}

/// Encode a `u32` progress vector as a packed big-endian payload
pub fn encode_progress_vec(progress: &[u32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(progress.len() * 4);
    for value in progress {
        buf.put_u32(*value);
    }
    buf.freeze()
}

/// Decode a packed big-endian `u32` progress vector
pub fn decode_progress_vec(mut payload: Bytes) -> Result<Vec<u32>> {
    if payload.len() % 4 != 0 {
        return Err(ProtocolError::operation(
            "decode_progress_vec",
            format!("payload length {} is not a multiple of 4", payload.len()),
        )
        .into());
    }
    let mut progress = Vec::with_capacity(payload.len() / 4);
    while payload.has_remaining() {
        progress.push(payload.get_u32());
    }
    Ok(progress)
}
