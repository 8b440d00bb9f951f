//! View descriptors and the immutable view
//!
//! A view is a configuration of nodes and their roles, published by the
//! view manager and immutable once installed. Participants share views by
//! `Arc` handle and refer to node sets through id lookups, never through
//! back-pointers.

pub mod manager;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SharedLogError};
use crate::protocol::frames::MetaLogRecord;
use crate::types::{build_logspace_id, LogSpaceId, NodeId, SeqNum, Tag, ViewId, EMPTY_TAG};
use crate::util::bits;

/// Serialized form of a view, as published through the metadata service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDescriptor {
    pub id: ViewId,

    /// First seqnum this view's logspace may assign; equals the sealed
    /// boundary of the finalized predecessor (0 for the first view)
    pub base_seqnum: SeqNum,

    pub sequencer_nodes: Vec<NodeId>,

    /// The sequencer whose logspace is active in this view; the others are
    /// metalog replicas
    pub primary_sequencer: NodeId,

    pub engine_nodes: Vec<NodeId>,

    pub storage_nodes: Vec<NodeId>,

    /// For each engine, its ordered storage replica set (size R)
    pub engine_storage_replicas: BTreeMap<NodeId, Vec<NodeId>>,

    /// For each sequencer, its replica-sequencer set for metalog replication
    pub sequencer_replicas: BTreeMap<NodeId, Vec<NodeId>>,

    /// Size of each engine's backup neighborhood (ring successors in
    /// ascending engine-id order)
    pub engine_replica_factor: usize,
}

impl ViewDescriptor {
    /// Descriptor for a single-node-per-role deployment, used by the
    /// embedded runtime and tests
    pub fn single_node(
        id: ViewId,
        base_seqnum: SeqNum,
        sequencer_id: NodeId,
        engine_id: NodeId,
        storage_id: NodeId,
    ) -> Self {
        Self {
            id,
            base_seqnum,
            sequencer_nodes: vec![sequencer_id],
            primary_sequencer: sequencer_id,
            engine_nodes: vec![engine_id],
            storage_nodes: vec![storage_id],
            engine_storage_replicas: BTreeMap::from([(engine_id, vec![storage_id])]),
            sequencer_replicas: BTreeMap::from([(sequencer_id, Vec::new())]),
            engine_replica_factor: 0,
        }
    }
}

/// Per-engine placement within a view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInfo {
    pub node_id: NodeId,
    /// Ordered storage replica set for this engine's record bodies
    pub storage_replicas: Vec<NodeId>,
    /// Peer engines that hold this engine's pending bodies as backups
    pub backup_peers: Vec<NodeId>,
}

/// Per-storage placement within a view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageInfo {
    pub node_id: NodeId,
    /// Engines whose shards this storage persists, ascending
    pub source_engines: Vec<NodeId>,
}

/// Per-sequencer placement within a view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencerInfo {
    pub node_id: NodeId,
    /// Sequencers replicating this sequencer's metalog
    pub replica_sequencers: Vec<NodeId>,
}

/// An installed, immutable view
#[derive(Debug)]
pub struct View {
    id: ViewId,
    base_seqnum: SeqNum,
    primary_sequencer: NodeId,
    sequencer_nodes: Vec<NodeId>,
    engine_nodes: Vec<NodeId>,
    storage_nodes: Vec<NodeId>,
    engines: BTreeMap<NodeId, EngineInfo>,
    storages: BTreeMap<NodeId, StorageInfo>,
    sequencers: BTreeMap<NodeId, SequencerInfo>,
}

impl View {
    /// Validate a descriptor and build the installed view
    pub fn new(descriptor: ViewDescriptor) -> Result<Self> {
        let mut sequencer_nodes = descriptor.sequencer_nodes;
        let mut engine_nodes = descriptor.engine_nodes;
        let mut storage_nodes = descriptor.storage_nodes;
        sequencer_nodes.sort_unstable();
        engine_nodes.sort_unstable();
        storage_nodes.sort_unstable();
        for (name, nodes) in [
            ("sequencer_nodes", &sequencer_nodes),
            ("engine_nodes", &engine_nodes),
            ("storage_nodes", &storage_nodes),
        ] {
            if nodes.is_empty() {
                return Err(SharedLogError::view(format!(
                    "view {}: {} is empty",
                    descriptor.id, name
                )));
            }
            if nodes.windows(2).any(|w| w[0] == w[1]) {
                return Err(SharedLogError::view(format!(
                    "view {}: duplicate id in {}",
                    descriptor.id, name
                )));
            }
        }
        if !sequencer_nodes.contains(&descriptor.primary_sequencer) {
            return Err(SharedLogError::view(format!(
                "view {}: primary sequencer {} is not a sequencer node",
                descriptor.id, descriptor.primary_sequencer
            )));
        }

        let storage_set: BTreeSet<NodeId> = storage_nodes.iter().copied().collect();
        let mut engines = BTreeMap::new();
        for (index, &engine_id) in engine_nodes.iter().enumerate() {
            let storage_replicas = descriptor
                .engine_storage_replicas
                .get(&engine_id)
                .cloned()
                .ok_or_else(|| {
                    SharedLogError::view(format!(
                        "view {}: engine {} has no storage replica set",
                        descriptor.id, engine_id
                    ))
                })?;
            if storage_replicas.is_empty() {
                return Err(SharedLogError::view(format!(
                    "view {}: engine {} has an empty storage replica set",
                    descriptor.id, engine_id
                )));
            }
            if let Some(unknown) = storage_replicas.iter().find(|t| !storage_set.contains(t)) {
                return Err(SharedLogError::view(format!(
                    "view {}: engine {} replicates to unknown storage {}",
                    descriptor.id, engine_id, unknown
                )));
            }
            // Ring successors in ascending engine-id order; the factor is
            // clamped so an engine never backs itself.
            let peer_count = descriptor
                .engine_replica_factor
                .min(engine_nodes.len().saturating_sub(1));
            let backup_peers = (1..=peer_count)
                .map(|step| engine_nodes[(index + step) % engine_nodes.len()])
                .collect();
            engines.insert(
                engine_id,
                EngineInfo {
                    node_id: engine_id,
                    storage_replicas,
                    backup_peers,
                },
            );
        }

        let mut storages = BTreeMap::new();
        for &storage_id in &storage_nodes {
            let source_engines = engine_nodes
                .iter()
                .copied()
                .filter(|e| engines[e].storage_replicas.contains(&storage_id))
                .collect();
            storages.insert(
                storage_id,
                StorageInfo {
                    node_id: storage_id,
                    source_engines,
                },
            );
        }

        let mut sequencers = BTreeMap::new();
        for &sequencer_id in &sequencer_nodes {
            let replica_sequencers = descriptor
                .sequencer_replicas
                .get(&sequencer_id)
                .cloned()
                .unwrap_or_default();
            if replica_sequencers.contains(&sequencer_id) {
                return Err(SharedLogError::view(format!(
                    "view {}: sequencer {} replicates to itself",
                    descriptor.id, sequencer_id
                )));
            }
            if let Some(unknown) = replica_sequencers
                .iter()
                .find(|s| !sequencer_nodes.contains(s))
            {
                return Err(SharedLogError::view(format!(
                    "view {}: sequencer {} replicates to unknown sequencer {}",
                    descriptor.id, sequencer_id, unknown
                )));
            }
            sequencers.insert(
                sequencer_id,
                SequencerInfo {
                    node_id: sequencer_id,
                    replica_sequencers,
                },
            );
        }

        Ok(Self {
            id: descriptor.id,
            base_seqnum: descriptor.base_seqnum,
            primary_sequencer: descriptor.primary_sequencer,
            sequencer_nodes,
            engine_nodes,
            storage_nodes,
            engines,
            storages,
            sequencers,
        })
    }

    pub fn id(&self) -> ViewId {
        self.id
    }

    pub fn base_seqnum(&self) -> SeqNum {
        self.base_seqnum
    }

    pub fn primary_sequencer(&self) -> NodeId {
        self.primary_sequencer
    }

    /// Logspace active in this view: `(view_id, primary_sequencer)`
    pub fn primary_logspace_id(&self) -> LogSpaceId {
        build_logspace_id(self.id, self.primary_sequencer)
    }

    pub fn sequencer_nodes(&self) -> &[NodeId] {
        &self.sequencer_nodes
    }

    pub fn engine_nodes(&self) -> &[NodeId] {
        &self.engine_nodes
    }

    pub fn storage_nodes(&self) -> &[NodeId] {
        &self.storage_nodes
    }

    pub fn contains_sequencer_node(&self, node_id: NodeId) -> bool {
        self.sequencers.contains_key(&node_id)
    }

    pub fn contains_engine_node(&self, node_id: NodeId) -> bool {
        self.engines.contains_key(&node_id)
    }

    pub fn contains_storage_node(&self, node_id: NodeId) -> bool {
        self.storages.contains_key(&node_id)
    }

    pub fn engine_node(&self, node_id: NodeId) -> Option<&EngineInfo> {
        self.engines.get(&node_id)
    }

    pub fn storage_node(&self, node_id: NodeId) -> Option<&StorageInfo> {
        self.storages.get(&node_id)
    }

    pub fn sequencer_node(&self, node_id: NodeId) -> Option<&SequencerInfo> {
        self.sequencers.get(&node_id)
    }

    /// True if `candidate` replicates `sequencer_id`'s metalog
    pub fn is_replica_sequencer(&self, sequencer_id: NodeId, candidate: NodeId) -> bool {
        self.sequencers
            .get(&sequencer_id)
            .is_some_and(|s| s.replica_sequencers.contains(&candidate))
    }

    /// Engines whose backup neighborhood contains `node_id`, ascending.
    /// This is the deterministic iteration order local cuts are built in.
    pub fn primary_nodes_of(&self, node_id: NodeId) -> Vec<NodeId> {
        self.engine_nodes
            .iter()
            .copied()
            .filter(|e| self.engines[e].backup_peers.contains(&node_id))
            .collect()
    }

    /// Deterministic tag routing. The empty tag is handled by the caller
    /// (it routes to the appending node itself).
    pub fn log_tag_to_primary_node(&self, tag: Tag) -> NodeId {
        debug_assert_ne!(tag, EMPTY_TAG);
        let index = (bits::mix64(tag) % self.engine_nodes.len() as u64) as usize;
        self.engine_nodes[index]
    }

    /// Pick a random engine, used for empty-tag appends from nodes outside
    /// the view
    pub fn pick_one_engine(&self) -> NodeId {
        let index = rand::thread_rng().gen_range(0..self.engine_nodes.len());
        self.engine_nodes[index]
    }
}

/// The authoritative record ending a view: per-logspace final metalog
/// positions plus the tail entries a lagging participant must replay
#[derive(Debug, Clone)]
pub struct FinalizedView {
    view: Arc<View>,
    final_metalog_positions: HashMap<LogSpaceId, u32>,
    tail_metalogs: HashMap<LogSpaceId, Vec<MetaLogRecord>>,
}

impl FinalizedView {
    pub fn new(
        view: Arc<View>,
        final_metalog_positions: HashMap<LogSpaceId, u32>,
        tail_metalogs: HashMap<LogSpaceId, Vec<MetaLogRecord>>,
    ) -> Self {
        Self {
            view,
            final_metalog_positions,
            tail_metalogs,
        }
    }

    pub fn view(&self) -> &Arc<View> {
        &self.view
    }

    pub fn final_metalog_position(&self, logspace_id: LogSpaceId) -> Option<u32> {
        self.final_metalog_positions.get(&logspace_id).copied()
    }

    pub fn tail_metalogs(&self, logspace_id: LogSpaceId) -> &[MetaLogRecord] {
        self.tail_metalogs
            .get(&logspace_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
