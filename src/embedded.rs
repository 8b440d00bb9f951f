//! Embedded single-process shared log
//!
//! Wires one sequencer, one engine, and one storage node together with
//! direct in-process delivery in place of the transport layer. Useful for
//! tests, local development, and library consumers that want shared log
//! semantics without running a cluster.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::SharedLogConfig;
use crate::engine::{EngineCore, EngineEvent};
use crate::error::{Result, SharedLogError};
use crate::fsm::records_from_metalog;
use crate::protocol::frames::{encode_frame, FsmRecord};
use crate::protocol::{encode_progress_vec, SharedLogMessage};
use crate::sequencer::{Outbound, SequencerNode};
use crate::storage::flusher::flush_once;
use crate::storage::db::PersistenceAdapter;
use crate::storage::{MemoryDb, StorageNode};
use crate::types::{LocalId, LogEntry, NodeId, SeqNum, Tag};
use crate::view::{View, ViewDescriptor};

const SEQUENCER_ID: NodeId = 100;
const ENGINE_ID: NodeId = 1;
const STORAGE_ID: NodeId = 10;

/// A complete shared log in one process
pub struct EmbeddedSharedLog {
    view: Arc<View>,
    sequencer: SequencerNode,
    engine: Mutex<EngineCore>,
    storage: StorageNode,
    db: MemoryDb,
}

impl EmbeddedSharedLog {
    /// Create an instance with default configuration
    pub fn single_node() -> Result<Self> {
        Self::with_config(&SharedLogConfig::default())
    }

    pub fn with_config(config: &SharedLogConfig) -> Result<Self> {
        config.validate()?;
        let descriptor = ViewDescriptor::single_node(1, 0, SEQUENCER_ID, ENGINE_ID, STORAGE_ID);
        let view = Arc::new(View::new(descriptor.clone())?);

        let sequencer = SequencerNode::new(SEQUENCER_ID);
        sequencer.on_view_created(Arc::clone(&view))?;

        let storage = StorageNode::new(STORAGE_ID, config.storage_max_live_entries);
        storage.on_view_created(Arc::clone(&view))?;

        let mut engine = EngineCore::new(ENGINE_ID, config);
        engine.on_fsm_records(&[FsmRecord::NewView(descriptor)])?;

        Ok(Self {
            view,
            sequencer,
            engine: Mutex::new(engine),
            storage,
            db: MemoryDb::new(),
        })
    }

    /// Append a record; the returned local id names it until the next tick
    /// assigns a seqnum
    pub fn append(&self, tag: Tag, data: Bytes) -> Result<LocalId> {
        let local_id = self
            .engine
            .lock()
            .store_log_as_primary(tag, data.clone())?;
        let message = SharedLogMessage::new_replicate(
            self.view.id(),
            ENGINE_ID,
            local_id,
            tag,
            data.len() as i32,
        );
        self.storage.on_replicate(message, data)?;
        Ok(local_id)
    }

    /// One delivery round: progress reports flow to the sequencer, the
    /// sequencer marks a cut if it can, and committed cuts land at the
    /// engine and storage
    pub fn tick(&self) -> Result<()> {
        if let Some((logspace_id, progress)) = self.storage.grab_shard_progress()? {
            let message = SharedLogMessage::new_shard_progress(
                logspace_id,
                STORAGE_ID,
                (progress.len() * 4) as i32,
            );
            self.sequencer
                .on_shard_progress(message, encode_progress_vec(&progress))?;
        }
        if let Some(cut) = self.engine.lock().build_local_cut() {
            let payload = encode_frame(&cut)?;
            let message =
                SharedLogMessage::new_local_cut(cut.view_id, cut.node_id, payload.len() as i32);
            self.sequencer.on_local_cut(message, payload)?;
        }
        let outbound = self.sequencer.mark_next_cut_if_doable()?;
        self.deliver(outbound)
    }

    /// Read the record at `seqnum`, falling through to the backing DB for
    /// entries evicted from the live cache
    pub fn read_at(&self, seqnum: SeqNum) -> Result<LogEntry> {
        let message =
            SharedLogMessage::new_read_at(self.view.primary_logspace_id(), ENGINE_ID, seqnum);
        self.storage.on_read_at(message)?;
        let results = self.storage.poll_read_results()?;
        let response = results
            .into_iter()
            .find(|r| r.request.seqnum == seqnum)
            .ok_or(SharedLogError::RecordNotFound(seqnum))?;
        match response.result {
            crate::storage::ReadResult::Ok(entry) => Ok((*entry).clone()),
            crate::storage::ReadResult::LookupDb => self
                .db
                .get(seqnum)?
                .ok_or(SharedLogError::RecordNotFound(seqnum)),
            crate::storage::ReadResult::Failed => Err(SharedLogError::RecordNotFound(seqnum)),
        }
    }

    /// Largest seqnum `≤ upper` carrying `tag`
    pub fn prev(&self, tag: Tag, upper: SeqNum) -> Option<SeqNum> {
        self.engine.lock().tag_index().prev(tag, upper)
    }

    /// Drain engine events accumulated since the last poll
    pub fn poll_engine_events(&self) -> Vec<EngineEvent> {
        self.engine.lock().poll_events()
    }

    /// Persist the live tail into the backing DB, evicting past the cap
    pub fn flush(&self) -> Result<usize> {
        let handle = self.storage.current_logspace()?;
        flush_once(&handle, &self.db)
    }

    fn deliver(&self, outbound: Vec<Outbound>) -> Result<()> {
        for action in outbound {
            match action {
                Outbound::PropagateMetaLogs { records, .. } => {
                    self.storage.on_metalogs(&records)?;
                    let mut engine = self.engine.lock();
                    for record in &records {
                        let fsm_records = records_from_metalog(&self.view, record)?;
                        engine.on_fsm_records(&fsm_records)?;
                    }
                }
                // Single-node views have no replica sequencers.
                other => debug!(?other, "no peers for outbound action"),
            }
        }
        Ok(())
    }
}
