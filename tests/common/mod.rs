//! Shared test fixtures: an in-process cluster harness
//!
//! Wires a primary sequencer, backup sequencers, engines, and storages
//! together with direct in-process delivery standing in for the transport
//! layer. Outbound actions are delivered synchronously and to completion,
//! so a `tick()` drives one full progress → cut → commit → propagate
//! round.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use sharedlog::engine::{EngineCore, EngineEvent};
use sharedlog::fsm::records_from_metalog;
use sharedlog::protocol::frames::{encode_frame, FsmRecord, MetaLogRecord};
use sharedlog::protocol::{encode_progress_vec, SharedLogMessage};
use sharedlog::sequencer::{HandlerOutcome, Outbound, SequencerNode};
use sharedlog::storage::{ReadResponse, StorageNode};
use sharedlog::types::{LocalId, NodeId, SeqNum, Tag};
use sharedlog::view::{View, ViewDescriptor};
use sharedlog::{Result, SharedLogConfig};

/// An in-process cluster with direct message delivery
pub struct TestCluster {
    pub config: SharedLogConfig,
    pub view: Arc<View>,
    pub primary: SequencerNode,
    pub backups: HashMap<NodeId, SequencerNode>,
    pub engines: BTreeMap<NodeId, Mutex<EngineCore>>,
    pub storages: BTreeMap<NodeId, StorageNode>,
    /// Every metalog record committed and propagated so far
    pub committed_metalogs: Mutex<Vec<MetaLogRecord>>,
    /// Engine events drained during delivery, by engine id
    pub engine_events: Mutex<Vec<(NodeId, EngineEvent)>>,
}

impl TestCluster {
    pub fn new(descriptor: ViewDescriptor) -> Self {
        Self::with_config(descriptor, SharedLogConfig::default())
    }

    pub fn with_config(descriptor: ViewDescriptor, config: SharedLogConfig) -> Self {
        let view = Arc::new(View::new(descriptor.clone()).unwrap());

        let primary = SequencerNode::new(view.primary_sequencer());
        primary.on_view_created(Arc::clone(&view)).unwrap();

        let mut backups = HashMap::new();
        for &sequencer_id in view.sequencer_nodes() {
            if sequencer_id == view.primary_sequencer() {
                continue;
            }
            let node = SequencerNode::new(sequencer_id);
            node.on_view_created(Arc::clone(&view)).unwrap();
            backups.insert(sequencer_id, node);
        }

        let mut engines = BTreeMap::new();
        for &engine_id in view.engine_nodes() {
            let mut core = EngineCore::new(engine_id, &config);
            core.on_fsm_records(&[FsmRecord::NewView(descriptor.clone())])
                .unwrap();
            engines.insert(engine_id, Mutex::new(core));
        }

        let mut storages = BTreeMap::new();
        for &storage_id in view.storage_nodes() {
            let node = StorageNode::new(storage_id, config.storage_max_live_entries);
            node.on_view_created(Arc::clone(&view)).unwrap();
            storages.insert(storage_id, node);
        }

        Self {
            config,
            view,
            primary,
            backups,
            engines,
            storages,
            committed_metalogs: Mutex::new(Vec::new()),
            engine_events: Mutex::new(Vec::new()),
        }
    }

    /// Append at an engine's primary path and replicate the body to its
    /// storage replicas and backup peers
    pub fn append(&self, engine_id: NodeId, tag: Tag, data: Bytes) -> Result<LocalId> {
        let local_id = self.engines[&engine_id]
            .lock()
            .store_log_as_primary(tag, data.clone())?;
        let engine_info = self.view.engine_node(engine_id).unwrap();
        for &storage_id in &engine_info.storage_replicas {
            let message = SharedLogMessage::new_replicate(
                self.view.id(),
                engine_id,
                local_id,
                tag,
                data.len() as i32,
            );
            self.storages[&storage_id].on_replicate(message, data.clone())?;
        }
        for &peer_id in &engine_info.backup_peers {
            self.engines[&peer_id]
                .lock()
                .store_log_as_backup(tag, data.clone(), local_id)?;
        }
        Ok(local_id)
    }

    /// One full delivery round
    pub fn tick(&self) -> Result<()> {
        for (&storage_id, storage) in &self.storages {
            if let Some((logspace_id, progress)) = storage.grab_shard_progress()? {
                let message = SharedLogMessage::new_shard_progress(
                    logspace_id,
                    storage_id,
                    (progress.len() * 4) as i32,
                );
                if let HandlerOutcome::Handled(actions) = self
                    .primary
                    .on_shard_progress(message, encode_progress_vec(&progress))?
                {
                    self.deliver(actions)?;
                }
            }
        }
        for engine in self.engines.values() {
            let cut = engine.lock().build_local_cut();
            if let Some(cut) = cut {
                let payload = encode_frame(&cut)?;
                let message = SharedLogMessage::new_local_cut(
                    cut.view_id,
                    cut.node_id,
                    payload.len() as i32,
                );
                if let HandlerOutcome::Handled(actions) =
                    self.primary.on_local_cut(message, payload)?
                {
                    self.deliver(actions)?;
                }
            }
        }
        let outbound = self.primary.mark_next_cut_if_doable()?;
        self.deliver(outbound)
    }

    /// Read at a specific storage, resolving exactly one response
    pub fn read_at(&self, storage_id: NodeId, seqnum: SeqNum) -> Result<Vec<ReadResponse>> {
        let message = SharedLogMessage::new_read_at(self.view.primary_logspace_id(), 0, seqnum);
        self.storages[&storage_id].on_read_at(message)?;
        self.storages[&storage_id].poll_read_results()
    }

    /// Engine events recorded so far for one engine
    pub fn events_for(&self, engine_id: NodeId) -> Vec<EngineEvent> {
        self.engine_events
            .lock()
            .iter()
            .filter(|(id, _)| *id == engine_id)
            .map(|(_, event)| event.clone())
            .collect()
    }

    fn deliver(&self, outbound: Vec<Outbound>) -> Result<()> {
        for action in outbound {
            match action {
                Outbound::ReplicateMetaLogs { targets, batch } => {
                    for target in targets {
                        let message = SharedLogMessage::new_metalogs(
                            batch.logspace_id,
                            self.primary.node_id(),
                            0,
                            0,
                        );
                        let outcome = self.backups[&target]
                            .on_new_metalogs(message, encode_frame(&batch)?)?;
                        if let HandlerOutcome::Handled(actions) = outcome {
                            for action in actions {
                                match action {
                                    Outbound::MetaLogProgress {
                                        logspace_id,
                                        position,
                                        ..
                                    } => {
                                        let ack = SharedLogMessage::new_metalog_progress(
                                            logspace_id,
                                            target,
                                            position,
                                        );
                                        if let HandlerOutcome::Handled(actions) =
                                            self.primary.on_metalog_progress(&ack)?
                                        {
                                            self.deliver(actions)?;
                                        }
                                    }
                                    other => panic!("unexpected backup action: {other:?}"),
                                }
                            }
                        }
                    }
                }
                Outbound::PropagateMetaLogs { records, .. } => {
                    self.committed_metalogs.lock().extend(records.clone());
                    for storage in self.storages.values() {
                        storage.on_metalogs(&records)?;
                    }
                    // Engines consume the FSM stream, then tag vecs flow to
                    // the peers that did not originate them.
                    let mut tag_vecs: Vec<(NodeId, SeqNum, Vec<Tag>)> = Vec::new();
                    for (&engine_id, engine) in &self.engines {
                        let mut core = engine.lock();
                        for record in &records {
                            let fsm_records = records_from_metalog(&self.view, record)?;
                            core.on_fsm_records(&fsm_records)?;
                        }
                        for event in core.poll_events() {
                            if let EngineEvent::SendTagVec {
                                start_seqnum, tags, ..
                            } = &event
                            {
                                tag_vecs.push((engine_id, *start_seqnum, tags.clone()));
                            }
                            self.engine_events.lock().push((engine_id, event));
                        }
                    }
                    for (origin, start_seqnum, tags) in tag_vecs {
                        for (&engine_id, engine) in &self.engines {
                            if engine_id != origin {
                                engine
                                    .lock()
                                    .on_recv_tag_data(origin, start_seqnum, &tags);
                            }
                        }
                    }
                }
                Outbound::MetaLogProgress { .. } => {
                    panic!("primary never emits META_PROG")
                }
            }
        }
        Ok(())
    }
}

/// Descriptor for the S1 single-node deployment: engine 1, storage 10,
/// sequencer 100
pub fn single_node_descriptor() -> ViewDescriptor {
    ViewDescriptor::single_node(1, 0, 100, 1, 10)
}

/// Descriptor with three metalog replicas: sequencers {100..103}, engine
/// 1, storage 10
pub fn replicated_metalog_descriptor() -> ViewDescriptor {
    ViewDescriptor {
        id: 1,
        base_seqnum: 0,
        sequencer_nodes: vec![100, 101, 102, 103],
        primary_sequencer: 100,
        engine_nodes: vec![1],
        storage_nodes: vec![10],
        engine_storage_replicas: BTreeMap::from([(1, vec![10])]),
        sequencer_replicas: BTreeMap::from([(100, vec![101, 102, 103])]),
        engine_replica_factor: 0,
    }
}

/// Two engines sharing one storage, backing each other
pub fn two_engine_descriptor(view_id: u16, base_seqnum: SeqNum) -> ViewDescriptor {
    ViewDescriptor {
        id: view_id,
        base_seqnum,
        sequencer_nodes: vec![100],
        primary_sequencer: 100,
        engine_nodes: vec![1, 2],
        storage_nodes: vec![10],
        engine_storage_replicas: BTreeMap::from([(1, vec![10]), (2, vec![10])]),
        sequencer_replicas: BTreeMap::new(),
        engine_replica_factor: 1,
    }
}

/// Find a tag whose primary is `engine_id` under `view`
pub fn tag_routed_to(view: &View, engine_id: NodeId) -> Tag {
    (1..10_000u64)
        .find(|&tag| view.log_tag_to_primary_node(tag) == engine_id)
        .expect("some tag routes to the engine")
}
