//! Metalog bookkeeping shared by the primary and backup sequencer roles
//!
//! A logspace's metalog is dense: entry `n` must be applied before entry
//! `n + 1`. Entries arriving ahead of the position are buffered, never
//! skipped; entries behind it are duplicates and ignored with a warning.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use crate::error::{Result, SharedLogError};
use crate::logspace::LogSpaceState;
use crate::protocol::frames::{MetaLogKind, MetaLogRecord};
use crate::types::{build_logspace_id, LogSpaceId, NodeId, SeqNum};
use crate::view::View;

/// Ordered store of one logspace's metalog entries
#[derive(Debug)]
pub struct MetaLogStore {
    view: Arc<View>,
    sequencer_id: NodeId,
    logspace_id: LogSpaceId,
    state: LogSpaceState,
    metalog_position: u32,
    seqnum_position: SeqNum,
    applied: Vec<MetaLogRecord>,
    buffered: BTreeMap<u32, MetaLogRecord>,
}

impl MetaLogStore {
    pub fn new(view: Arc<View>, sequencer_id: NodeId) -> Self {
        let logspace_id = build_logspace_id(view.id(), sequencer_id);
        let seqnum_position = view.base_seqnum();
        Self {
            view,
            sequencer_id,
            logspace_id,
            state: LogSpaceState::Normal,
            metalog_position: 0,
            seqnum_position,
            applied: Vec::new(),
            buffered: BTreeMap::new(),
        }
    }

    pub fn view(&self) -> &Arc<View> {
        &self.view
    }

    pub fn sequencer_id(&self) -> NodeId {
        self.sequencer_id
    }

    pub fn logspace_id(&self) -> LogSpaceId {
        self.logspace_id
    }

    pub fn state(&self) -> LogSpaceState {
        self.state
    }

    pub fn frozen(&self) -> bool {
        self.state == LogSpaceState::Frozen
    }

    pub fn finalized(&self) -> bool {
        self.state == LogSpaceState::Finalized
    }

    /// Next metalog index to assign/apply
    pub fn metalog_position(&self) -> u32 {
        self.metalog_position
    }

    /// Next unassigned seqnum of this logspace
    pub fn seqnum_position(&self) -> SeqNum {
        self.seqnum_position
    }

    /// Offer one metalog entry. Returns `true` if the position advanced
    /// (the entry, and possibly buffered successors, were applied).
    pub fn provide(&mut self, record: MetaLogRecord) -> Result<bool> {
        if record.logspace_id != self.logspace_id {
            return Err(SharedLogError::violation(format!(
                "metalog entry for logspace {:#010x} offered to logspace {:#010x}",
                record.logspace_id, self.logspace_id
            )));
        }
        if self.finalized() {
            warn!(
                logspace_id = format_args!("{:#010x}", self.logspace_id),
                "metalog entry offered to finalized logspace"
            );
            return Ok(false);
        }
        if record.metalog_seqnum < self.metalog_position {
            warn!(
                metalog_seqnum = record.metalog_seqnum,
                position = self.metalog_position,
                "duplicate metalog entry ignored"
            );
            return Ok(false);
        }
        if record.metalog_seqnum > self.metalog_position {
            self.buffered.insert(record.metalog_seqnum, record);
            return Ok(false);
        }
        self.apply(record)?;
        while let Some(next) = self.buffered.remove(&self.metalog_position) {
            self.apply(next)?;
        }
        Ok(true)
    }

    fn apply(&mut self, record: MetaLogRecord) -> Result<()> {
        if let MetaLogKind::NewLogs {
            start_seqnum,
            shard_starts,
            shard_deltas,
        } = &record.kind
        {
            if *start_seqnum != self.seqnum_position {
                return Err(SharedLogError::violation(format!(
                    "metalog {} assigns from {:#x}, logspace is at {:#x}",
                    record.metalog_seqnum, start_seqnum, self.seqnum_position
                )));
            }
            let engines = self.view.engine_nodes().len();
            if shard_starts.len() != engines || shard_deltas.len() != engines {
                return Err(SharedLogError::violation(format!(
                    "metalog {} shard vectors sized {}/{} for {} engines",
                    record.metalog_seqnum,
                    shard_starts.len(),
                    shard_deltas.len(),
                    engines
                )));
            }
            self.seqnum_position = start_seqnum + record.total_delta();
        }
        self.metalog_position = record.metalog_seqnum + 1;
        self.applied.push(record);
        Ok(())
    }

    /// Applied entries in positions `[from, to)`
    pub fn get_metalogs(&self, from: u32, to: u32) -> Result<Vec<MetaLogRecord>> {
        if from > to || to > self.metalog_position {
            return Err(SharedLogError::violation(format!(
                "metalog range [{from}, {to}) outside applied prefix {}",
                self.metalog_position
            )));
        }
        Ok(self.applied[from as usize..to as usize].to_vec())
    }

    /// Stop accepting new entries; reads stay available
    pub fn freeze(&mut self) {
        if self.state == LogSpaceState::Normal {
            self.state = LogSpaceState::Frozen;
        }
    }

    /// Seal the logspace at `final_position`, replaying `tail` entries this
    /// participant has not applied yet
    pub fn finalize(&mut self, final_position: u32, tail: &[MetaLogRecord]) -> Result<()> {
        for record in tail {
            if record.metalog_seqnum < self.metalog_position {
                continue;
            }
            if record.metalog_seqnum != self.metalog_position {
                return Err(SharedLogError::violation(format!(
                    "finalization tail leaves a gap at metalog position {}",
                    self.metalog_position
                )));
            }
            self.apply(record.clone())?;
        }
        if self.metalog_position != final_position {
            return Err(SharedLogError::violation(format!(
                "logspace {:#010x} finalized at {} but reached {}",
                self.logspace_id, final_position, self.metalog_position
            )));
        }
        if !self.buffered.is_empty() {
            warn!(
                count = self.buffered.len(),
                "buffered metalog entries beyond finalization discarded"
            );
            self.buffered.clear();
        }
        self.state = LogSpaceState::Finalized;
        Ok(())
    }
}
