//! Backup sequencer logspace
//!
//! A backup replays the primary's metalog in order and reports its applied
//! position back via `META_PROG`. Entries for other logspaces are
//! rejected; out-of-order entries buffer in the underlying store until the
//! gap fills.

use std::sync::Arc;

use crate::error::{Result, SharedLogError};
use crate::protocol::frames::{MetaLogRecord, MetaLogsBatch};
use crate::sequencer::metalog::MetaLogStore;
use crate::types::{LogSpaceId, NodeId};
use crate::view::View;

/// State of a replicated logspace at a backup sequencer
#[derive(Debug)]
pub struct MetaLogBackup {
    store: MetaLogStore,
}

impl MetaLogBackup {
    /// `sequencer_id` is the primary owning the logspace, not this node
    pub fn new(view: Arc<View>, sequencer_id: NodeId) -> Self {
        Self {
            store: MetaLogStore::new(view, sequencer_id),
        }
    }

    pub fn logspace_id(&self) -> LogSpaceId {
        self.store.logspace_id()
    }

    pub fn metalog_position(&self) -> u32 {
        self.store.metalog_position()
    }

    pub fn frozen(&self) -> bool {
        self.store.frozen()
    }

    /// Replay a batch from the primary. Returns `true` if the applied
    /// position advanced (and a `META_PROG` reply is due).
    pub fn provide_metalogs(&mut self, batch: &MetaLogsBatch) -> Result<bool> {
        if batch.logspace_id != self.store.logspace_id() {
            return Err(SharedLogError::violation(format!(
                "metalog batch for logspace {:#010x} delivered to logspace {:#010x}",
                batch.logspace_id,
                self.store.logspace_id()
            )));
        }
        let before = self.store.metalog_position();
        for record in &batch.records {
            self.store.provide(record.clone())?;
        }
        Ok(self.store.metalog_position() > before)
    }

    pub fn freeze(&mut self) {
        self.store.freeze();
    }

    pub fn finalize(&mut self, final_position: u32, tail: &[MetaLogRecord]) -> Result<()> {
        self.store.finalize(final_position, tail)
    }
}
