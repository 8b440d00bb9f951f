//! Primary sequencer logspace
//!
//! The primary turns storage progress reports into metalog cuts. Per-shard
//! watermarks are keyed `(engine, storage)` and only advance; a shard's
//! replicated position is the minimum over the engine's storage replica
//! set. A cut is marked only when every previous metalog entry is
//! replicated to a majority of replica sequencers (lower median of the
//! acknowledged positions).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Result, SharedLogError};
use crate::protocol::frames::{LocalCutRecord, MetaLogKind, MetaLogRecord};
use crate::sequencer::metalog::MetaLogStore;
use crate::types::{LogSpaceId, NodeId, SeqNum};
use crate::view::View;

/// State of the active logspace at its primary sequencer
#[derive(Debug)]
pub struct MetaLogPrimary {
    store: MetaLogStore,
    /// Largest metalog position on a majority of replica sequencers
    replicated_metalog_position: u32,
    /// `(engine, storage) → counter`: prefix of the engine's local-id space
    /// persisted at that storage
    shard_progress: BTreeMap<(NodeId, NodeId), u32>,
    /// Last published local-id watermark per engine
    last_cut: BTreeMap<NodeId, u32>,
    /// Engines whose replicated position exceeds their last cut
    dirty_shards: BTreeSet<NodeId>,
    /// Acknowledged metalog position per replica sequencer
    metalog_progresses: BTreeMap<NodeId, u32>,
    /// `(engine, backup engine) → counter` from local-cut reports; tracks
    /// the engine-side replication path, not the cut quorum
    peer_progress: BTreeMap<(NodeId, NodeId), u32>,
    /// Each engine's own announced tail (`next_localid`)
    shard_tails: BTreeMap<NodeId, u32>,
}

impl MetaLogPrimary {
    pub fn new(view: Arc<View>, sequencer_id: NodeId) -> Self {
        let mut shard_progress = BTreeMap::new();
        let mut last_cut = BTreeMap::new();
        let mut peer_progress = BTreeMap::new();
        let mut shard_tails = BTreeMap::new();
        for &engine_id in view.engine_nodes() {
            let engine = view.engine_node(engine_id).expect("engine in view");
            for &storage_id in &engine.storage_replicas {
                shard_progress.insert((engine_id, storage_id), 0);
            }
            for &peer_id in &engine.backup_peers {
                peer_progress.insert((engine_id, peer_id), 0);
            }
            last_cut.insert(engine_id, 0);
            shard_tails.insert(engine_id, 0);
        }
        let mut metalog_progresses = BTreeMap::new();
        if let Some(sequencer) = view.sequencer_node(sequencer_id) {
            for &replica_id in &sequencer.replica_sequencers {
                metalog_progresses.insert(replica_id, 0);
            }
        }
        if metalog_progresses.is_empty() {
            warn!(
                view_id = view.id(),
                sequencer_id, "no metalog replication; positions self-acknowledge"
            );
        }
        Self {
            store: MetaLogStore::new(view, sequencer_id),
            replicated_metalog_position: 0,
            shard_progress,
            last_cut,
            dirty_shards: BTreeSet::new(),
            metalog_progresses,
            peer_progress,
            shard_tails,
        }
    }

    pub fn view(&self) -> &Arc<View> {
        self.store.view()
    }

    pub fn logspace_id(&self) -> LogSpaceId {
        self.store.logspace_id()
    }

    pub fn frozen(&self) -> bool {
        self.store.frozen()
    }

    pub fn metalog_position(&self) -> u32 {
        self.store.metalog_position()
    }

    pub fn seqnum_position(&self) -> SeqNum {
        self.store.seqnum_position()
    }

    pub fn replicated_metalog_position(&self) -> u32 {
        self.replicated_metalog_position
    }

    pub fn all_metalog_replicated(&self) -> bool {
        self.replicated_metalog_position == self.store.metalog_position()
    }

    pub fn last_cut(&self, engine_id: NodeId) -> Option<u32> {
        self.last_cut.get(&engine_id).copied()
    }

    pub fn shard_progress(&self, engine_id: NodeId, storage_id: NodeId) -> Option<u32> {
        self.shard_progress.get(&(engine_id, storage_id)).copied()
    }

    pub fn peer_progress(&self, engine_id: NodeId, peer_id: NodeId) -> Option<u32> {
        self.peer_progress.get(&(engine_id, peer_id)).copied()
    }

    pub fn shard_tail(&self, engine_id: NodeId) -> Option<u32> {
        self.shard_tails.get(&engine_id).copied()
    }

    pub fn has_dirty_shards(&self) -> bool {
        !self.dirty_shards.is_empty()
    }

    /// Apply a SHARD_PROG report from `storage_id`, one counter per source
    /// engine in the storage's source order
    pub fn update_storage_progress(&mut self, storage_id: NodeId, progress: &[u32]) -> Result<()> {
        let view = Arc::clone(self.store.view());
        let storage = view.storage_node(storage_id).ok_or_else(|| {
            SharedLogError::violation(format!(
                "view {} does not have storage node {}",
                view.id(),
                storage_id
            ))
        })?;
        if progress.len() != storage.source_engines.len() {
            return Err(SharedLogError::violation(format!(
                "shard progress sized {} for {} source engines",
                progress.len(),
                storage.source_engines.len()
            )));
        }
        for (index, &engine_id) in storage.source_engines.iter().enumerate() {
            let key = (engine_id, storage_id);
            let current = self.shard_progress[&key];
            if progress[index] > current {
                self.shard_progress.insert(key, progress[index]);
                let replicated = self.shard_replicated_position(&view, engine_id);
                if replicated > self.last_cut[&engine_id] {
                    self.dirty_shards.insert(engine_id);
                }
            }
        }
        Ok(())
    }

    /// Apply a META_PROG acknowledgment from a replica sequencer
    pub fn update_replica_progress(&mut self, sequencer_id: NodeId, position: u32) -> Result<()> {
        let view = self.store.view();
        if !view.is_replica_sequencer(self.store.sequencer_id(), sequencer_id) {
            return Err(SharedLogError::violation(format!(
                "META_PROG from sequencer {} outside the replica set",
                sequencer_id
            )));
        }
        if position > self.store.metalog_position() {
            return Err(SharedLogError::violation(format!(
                "future metalog position: received {}, at {}",
                position,
                self.store.metalog_position()
            )));
        }
        let progress = self
            .metalog_progresses
            .get_mut(&sequencer_id)
            .expect("replica checked against view");
        if position > *progress {
            *progress = position;
            self.update_metalog_replicated_position();
        }
        Ok(())
    }

    /// Apply a LOCAL_CUT report: the engine's own tail followed by its
    /// progress for each primary in its neighborhood
    pub fn update_local_cut(&mut self, cut: &LocalCutRecord) -> Result<()> {
        let view = Arc::clone(self.store.view());
        if view.engine_node(cut.node_id).is_none() {
            return Err(SharedLogError::violation(format!(
                "LOCAL_CUT from node {} outside view {}",
                cut.node_id,
                view.id()
            )));
        }
        let primaries = view.primary_nodes_of(cut.node_id);
        if cut.localid_cuts.len() != primaries.len() + 1 {
            return Err(SharedLogError::violation(format!(
                "LOCAL_CUT from node {} sized {} for {} primaries",
                cut.node_id,
                cut.localid_cuts.len(),
                primaries.len()
            )));
        }
        let tail = self.shard_tails.get_mut(&cut.node_id).expect("engine in view");
        if cut.localid_cuts[0] < *tail {
            debug!(node_id = cut.node_id, "stale local-cut tail ignored");
        } else {
            *tail = cut.localid_cuts[0];
        }
        for (index, &primary_id) in primaries.iter().enumerate() {
            let entry = self
                .peer_progress
                .get_mut(&(primary_id, cut.node_id))
                .expect("neighborhood derived from view");
            let counter = cut.localid_cuts[index + 1];
            if counter > *entry {
                *entry = counter;
            }
        }
        Ok(())
    }

    /// Build the next `NEW_LOGS` cut, if any shard advanced past its last
    /// cut. The entry is applied to the local metalog before it is
    /// returned for replication.
    pub fn mark_next_cut(&mut self) -> Result<Option<MetaLogRecord>> {
        if self.dirty_shards.is_empty() {
            return Ok(None);
        }
        let view = Arc::clone(self.store.view());
        let mut shard_starts = Vec::with_capacity(view.engine_nodes().len());
        let mut shard_deltas = Vec::with_capacity(view.engine_nodes().len());
        for &engine_id in view.engine_nodes() {
            let last = self.last_cut[&engine_id];
            shard_starts.push(last);
            let delta = if self.dirty_shards.contains(&engine_id) {
                let replicated = self.shard_replicated_position(&view, engine_id);
                self.last_cut.insert(engine_id, replicated);
                replicated - last
            } else {
                0
            };
            shard_deltas.push(delta);
        }
        self.dirty_shards.clear();
        let record = MetaLogRecord {
            logspace_id: self.store.logspace_id(),
            metalog_seqnum: self.store.metalog_position(),
            kind: MetaLogKind::NewLogs {
                start_seqnum: self.store.seqnum_position(),
                shard_starts,
                shard_deltas,
            },
        };
        if !self.store.provide(record.clone())? {
            return Err(SharedLogError::violation(
                "failed to advance metalog position",
            ));
        }
        self.update_metalog_replicated_position();
        Ok(Some(record))
    }

    /// Applied entries in positions `[from, to)`
    pub fn get_metalogs(&self, from: u32, to: u32) -> Result<Vec<MetaLogRecord>> {
        self.store.get_metalogs(from, to)
    }

    /// Freeze the logspace: stop accepting progress; uncut dirty shards
    /// are dropped and will be replayed or discarded in the next view
    pub fn freeze(&mut self) {
        self.store.freeze();
        self.dirty_shards.clear();
    }

    pub fn finalize(&mut self, final_position: u32, tail: &[MetaLogRecord]) -> Result<()> {
        self.store.finalize(final_position, tail)?;
        self.update_metalog_replicated_position();
        Ok(())
    }

    fn shard_replicated_position(&self, view: &View, engine_id: NodeId) -> u32 {
        let engine = view.engine_node(engine_id).expect("engine in view");
        engine
            .storage_replicas
            .iter()
            .map(|&storage_id| self.shard_progress[&(engine_id, storage_id)])
            .min()
            .expect("replica set is non-empty")
    }

    fn update_metalog_replicated_position(&mut self) {
        if self.replicated_metalog_position == self.store.metalog_position() {
            return;
        }
        if self.metalog_progresses.is_empty() {
            // Single-sequencer deployment: positions self-acknowledge.
            self.replicated_metalog_position = self.store.metalog_position();
            return;
        }
        let mut progress: Vec<u32> = self.metalog_progresses.values().copied().collect();
        progress.sort_unstable();
        let median = progress[progress.len() / 2];
        debug_assert!(median >= self.replicated_metalog_position);
        debug_assert!(median <= self.store.metalog_position());
        self.replicated_metalog_position = median;
    }
}
