//! Engine core: append paths, pending-record bookkeeping, and FSM reaction
//!
//! The engine is client-facing. Appends at the tag's primary allocate a
//! local id and wait for the metalog to assign a seqnum; bodies received
//! from peer primaries are held as backup copies and advance the peer's
//! replication progress. The core is single-writer: one task owns it and
//! drains [`EngineEvent`]s after each operation.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::config::SharedLogConfig;
use crate::engine::tag_index::TagIndex;
use crate::error::{Result, SharedLogError};
use crate::fsm::{Fsm, FsmEvent};
use crate::protocol::frames::{FsmRecord, LocalCutRecord};
use crate::types::{
    build_local_id, local_id_to_node_id, local_id_to_view_id, LocalId, LogEntry, NodeId, SeqNum,
    Tag, ViewId, EMPTY_TAG,
};
use crate::util::ObjectPool;
use crate::view::View;

/// Notification produced by the engine core for its embedding layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A local record was assigned a seqnum and is replicated
    Persisted { local_id: LocalId, seqnum: SeqNum },
    /// A pending record was superseded by a view change
    Discarded { local_id: LocalId },
    /// Tags of a locally originated run, to be sent to peer engines
    SendTagVec {
        view_id: ViewId,
        start_seqnum: SeqNum,
        tags: Vec<Tag>,
    },
}

/// Per-engine shared log state
#[derive(Debug)]
pub struct EngineCore {
    node_id: NodeId,
    fsm: Fsm,
    /// Per-view append counter, reset on view change
    next_localid: u32,
    /// Records awaiting metalog assignment, keyed by local id (old views
    /// sort first, so view-change discards pop a prefix)
    pending_entries: BTreeMap<LocalId, LogEntry>,
    /// Assigned records still cached for tag-vec assembly and local reads
    persisted_entries: BTreeMap<SeqNum, LogEntry>,
    /// Contiguous prefix of each backed peer's local ids held here
    log_progress: HashMap<NodeId, u32>,
    log_progress_dirty: bool,
    tag_index: TagIndex,
    entry_pool: ObjectPool<LogEntry>,
    max_pending_entries: usize,
    events: Vec<EngineEvent>,
    /// Application-supplied post-hoc annotations, cached by seqnum
    aux_data: HashMap<SeqNum, Bytes>,
}

impl EngineCore {
    pub fn new(node_id: NodeId, config: &SharedLogConfig) -> Self {
        Self {
            node_id,
            fsm: Fsm::new(),
            next_localid: 0,
            pending_entries: BTreeMap::new(),
            persisted_entries: BTreeMap::new(),
            log_progress: HashMap::new(),
            log_progress_dirty: false,
            tag_index: TagIndex::new(),
            entry_pool: ObjectPool::new(),
            max_pending_entries: config.engine_max_pending_entries,
            events: Vec::new(),
            aux_data: HashMap::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn current_view(&self) -> Option<&std::sync::Arc<View>> {
        self.fsm.current_view()
    }

    /// FSM records consumed
    pub fn fsm_progress(&self) -> u32 {
        self.fsm.progress()
    }

    /// FSM records fully reflected in the tag index
    pub fn index_progress(&self) -> u32 {
        self.tag_index.fsm_progress()
    }

    pub fn tag_index(&self) -> &TagIndex {
        &self.tag_index
    }

    pub fn next_localid(&self) -> u32 {
        self.next_localid
    }

    pub fn pending_entries_len(&self) -> usize {
        self.pending_entries.len()
    }

    pub fn log_progress(&self, peer: NodeId) -> Option<u32> {
        self.log_progress.get(&peer).copied()
    }

    /// A persisted record by its assigned seqnum
    pub fn persisted_entry(&self, seqnum: SeqNum) -> Option<&LogEntry> {
        self.persisted_entries.get(&seqnum)
    }

    /// Cache an application-supplied annotation for a committed record
    pub fn set_aux_data(&mut self, seqnum: SeqNum, data: Bytes) {
        self.aux_data.insert(seqnum, data);
    }

    /// A previously cached annotation
    pub fn aux_data(&self, seqnum: SeqNum) -> Option<&Bytes> {
        self.aux_data.get(&seqnum)
    }

    /// Drain events produced since the last poll
    pub fn poll_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }

    /// Resolve the primary engine for a tag in the current view. Empty
    /// tags route to this node when it participates, otherwise to a random
    /// engine.
    pub fn log_tag_to_primary_node(&self, tag: Tag) -> Result<NodeId> {
        let view = self.fsm.current_view().ok_or(SharedLogError::NoCurrentView)?;
        if tag == EMPTY_TAG {
            if view.contains_engine_node(self.node_id) {
                Ok(self.node_id)
            } else {
                warn!("current view does not contain this node; picking a random engine");
                Ok(view.pick_one_engine())
            }
        } else {
            Ok(view.log_tag_to_primary_node(tag))
        }
    }

    /// Primary append path: allocate a local id and hold the record until
    /// the metalog assigns its seqnum. The caller replicates the body to
    /// the engine's storage set and backup peers.
    pub fn store_log_as_primary(&mut self, tag: Tag, data: Bytes) -> Result<LocalId> {
        let view = self
            .fsm
            .current_view()
            .cloned()
            .ok_or(SharedLogError::NoCurrentView)?;
        if !view.contains_engine_node(self.node_id) {
            return Err(SharedLogError::NotInView {
                view_id: view.id(),
                node_id: self.node_id,
            });
        }
        if tag != EMPTY_TAG && view.log_tag_to_primary_node(tag) != self.node_id {
            return Err(SharedLogError::NotPrimary {
                view_id: view.id(),
                node_id: self.node_id,
                tag,
            });
        }
        if self.pending_entries.len() >= self.max_pending_entries {
            return Err(SharedLogError::PendingCapacityExceeded {
                limit: self.max_pending_entries,
            });
        }
        let local_id = build_local_id(view.id(), self.node_id, self.next_localid);
        self.next_localid += 1;
        debug!(tag, local_id = format_args!("{local_id:#018x}"), "new local log");
        let mut entry = self.entry_pool.take();
        entry.reset(local_id, tag, data);
        self.pending_entries.insert(local_id, entry);
        self.log_progress_dirty = true;
        Ok(local_id)
    }

    /// Backup append path: hold a body received from a peer primary.
    /// Returns `false` when the record belongs to a superseded view and
    /// was discarded.
    pub fn store_log_as_backup(&mut self, tag: Tag, data: Bytes, local_id: LocalId) -> Result<bool> {
        let view_id = local_id_to_view_id(local_id);
        let primary_node_id = local_id_to_node_id(local_id);
        if primary_node_id == self.node_id {
            return Err(SharedLogError::violation(
                "backup store for a locally originated record",
            ));
        }
        if let Some(view) = self.fsm.current_view() {
            if view.id() > view_id {
                warn!(view_id, "outdated backup record discarded");
                return Ok(false);
            }
        }
        if self.pending_entries.len() >= self.max_pending_entries {
            return Err(SharedLogError::PendingCapacityExceeded {
                limit: self.max_pending_entries,
            });
        }
        let mut entry = self.entry_pool.take();
        entry.reset(local_id, tag, data);
        self.pending_entries.insert(local_id, entry);
        if let Some(view) = self.fsm.current_view().cloned() {
            if view.id() == view_id {
                self.advance_log_progress(&view, primary_node_id);
            }
        }
        Ok(true)
    }

    /// Register a locally originated record whose body is replicated
    /// elsewhere (used when re-driving replication after a reconnect)
    pub fn add_wait_for_replication(&mut self, tag: Tag, local_id: LocalId) {
        let mut entry = self.entry_pool.take();
        entry.reset(local_id, tag, Bytes::new());
        self.pending_entries.insert(local_id, entry);
    }

    /// Apply a batch of FSM records in delivery order
    pub fn on_fsm_records(&mut self, records: &[FsmRecord]) -> Result<()> {
        for record in records {
            let events = self.fsm.apply(record.clone())?;
            for event in events {
                match event {
                    FsmEvent::NewView { record_seqnum, view } => {
                        self.on_fsm_new_view(record_seqnum, &view)
                    }
                    FsmEvent::LogReplicated {
                        start_local_id,
                        start_seqnum,
                        delta,
                    } => self.on_fsm_log_replicated(start_local_id, start_seqnum, delta)?,
                    FsmEvent::GlobalCut {
                        record_seqnum,
                        start_seqnum,
                        end_seqnum,
                    } => self
                        .tag_index
                        .on_new_global_cut(record_seqnum, start_seqnum, end_seqnum),
                }
            }
        }
        Ok(())
    }

    /// Accept a tag run from a peer primary. Callers filter stale views.
    pub fn on_recv_tag_data(&mut self, primary_node: NodeId, start_seqnum: SeqNum, tags: &[Tag]) {
        self.tag_index.recv_tag_data(primary_node, start_seqnum, tags);
    }

    /// Build the periodic local-cut report, clearing the dirty flag. `None`
    /// when nothing advanced since the last cut.
    pub fn build_local_cut(&mut self) -> Option<LocalCutRecord> {
        if !self.log_progress_dirty {
            return None;
        }
        let view = self.fsm.current_view().cloned()?;
        self.log_progress_dirty = false;
        let mut localid_cuts = Vec::with_capacity(1 + self.log_progress.len());
        localid_cuts.push(self.next_localid);
        for peer in view.primary_nodes_of(self.node_id) {
            localid_cuts.push(self.log_progress.get(&peer).copied().unwrap_or(0));
        }
        Some(LocalCutRecord {
            view_id: view.id(),
            node_id: self.node_id,
            localid_cuts,
        })
    }

    fn on_fsm_new_view(&mut self, record_seqnum: u32, view: &std::sync::Arc<View>) {
        // Pending entries of older views sort below the new view's id
        // prefix; each discarded record is reported to the caller.
        let cutoff = build_local_id(view.id(), 0, 0);
        let stale: Vec<LocalId> = self
            .pending_entries
            .range(..cutoff)
            .map(|(local_id, _)| *local_id)
            .collect();
        for local_id in stale {
            let entry = self
                .pending_entries
                .remove(&local_id)
                .expect("key collected above");
            self.events.push(EngineEvent::Discarded { local_id });
            self.entry_pool.put(entry);
        }
        self.next_localid = 0;
        self.log_progress.clear();
        if view.contains_engine_node(self.node_id) {
            for peer in view.primary_nodes_of(self.node_id) {
                self.log_progress.insert(peer, 0);
                self.advance_log_progress(view, peer);
            }
        }
        self.tag_index.on_new_view(record_seqnum, view.id());
    }

    fn on_fsm_log_replicated(
        &mut self,
        start_local_id: LocalId,
        start_seqnum: SeqNum,
        delta: u32,
    ) -> Result<()> {
        for i in 0..u64::from(delta) {
            let local_id = start_local_id + i;
            let Some(mut entry) = self.pending_entries.remove(&local_id) else {
                continue;
            };
            let seqnum = start_seqnum + i;
            debug!(
                local_id = format_args!("{local_id:#018x}"),
                seqnum = format_args!("{seqnum:#018x}"),
                "log replicated"
            );
            entry.metadata.seqnum = seqnum;
            self.events.push(EngineEvent::Persisted { local_id, seqnum });
            self.persisted_entries.insert(seqnum, entry);
        }
        if local_id_to_node_id(start_local_id) == self.node_id {
            let mut tags = Vec::with_capacity(delta as usize);
            for i in 0..u64::from(delta) {
                let seqnum = start_seqnum + i;
                let entry = self.persisted_entries.get(&seqnum).ok_or_else(|| {
                    SharedLogError::violation(format!(
                        "locally originated record missing at seqnum {seqnum:#018x}"
                    ))
                })?;
                tags.push(entry.metadata.tag);
            }
            self.tag_index
                .recv_tag_data(self.node_id, start_seqnum, &tags);
            let view_id = self
                .fsm
                .current_view()
                .map(|v| v.id())
                .unwrap_or(local_id_to_view_id(start_local_id));
            self.events.push(EngineEvent::SendTagVec {
                view_id,
                start_seqnum,
                tags,
            });
        }
        Ok(())
    }

    fn advance_log_progress(&mut self, view: &View, node_id: NodeId) {
        let Some(&counter) = self.log_progress.get(&node_id) else {
            warn!(node_id, view_id = view.id(), "not a backup of this node");
            return;
        };
        let mut current = counter;
        while self
            .pending_entries
            .contains_key(&build_local_id(view.id(), node_id, current))
        {
            current += 1;
        }
        if current > counter {
            self.log_progress.insert(node_id, current);
            self.log_progress_dirty = true;
        }
    }
}
