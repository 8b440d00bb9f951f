//! Sequencer node driver
//!
//! Routes shared log messages to the primary/backup logspaces this node
//! hosts and applies view transitions. Handlers follow one discipline:
//! traffic for a future view goes on hold (or is fatal for control
//! messages that cannot legitimately arrive early), traffic for a past
//! view is ignored with a warning, and frozen logspaces drop progress.
//!
//! Transport is out of scope: handlers return typed [`Outbound`] actions
//! for the embedding process to deliver.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::{Result, SharedLogError};
use crate::logspace::{FutureRequests, LogSpaceCollection, LogSpaceHandle, SharedLogRequest};
use crate::protocol::frames::{decode_frame, LocalCutRecord, MetaLogRecord, MetaLogsBatch};
use crate::protocol::{decode_progress_vec, SharedLogMessage, SharedLogOpType};
use crate::sequencer::{MetaLogBackup, MetaLogPrimary};
use crate::types::{LogSpaceId, NodeId, ViewId};
use crate::view::{FinalizedView, View};

/// An action for the embedding transport to carry out
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Send a `METALOGS` batch to each replica sequencer
    ReplicateMetaLogs {
        targets: Vec<NodeId>,
        batch: MetaLogsBatch,
    },
    /// Deliver newly committed metalog entries to all engines and storages
    /// of the view
    PropagateMetaLogs {
        engines: Vec<NodeId>,
        storages: Vec<NodeId>,
        records: Vec<MetaLogRecord>,
    },
    /// Acknowledge an applied metalog position to the primary
    MetaLogProgress {
        target: NodeId,
        logspace_id: LogSpaceId,
        position: u32,
    },
}

/// Disposition of one incoming message
#[derive(Debug)]
pub enum HandlerOutcome {
    /// Processed; carry out the returned actions
    Handled(Vec<Outbound>),
    /// Held for a future view; replayed when that view installs
    Held,
    /// Stale or frozen; dropped with a warning
    Ignored,
}

/// A sequencer participant: hosts the primary logspace when this node is
/// the view's primary, and backup logspaces when it replicates another
/// sequencer's metalog
#[derive(Debug)]
pub struct SequencerNode {
    node_id: NodeId,
    current_view: RwLock<Option<Arc<View>>>,
    current_primary: RwLock<Option<LogSpaceHandle<MetaLogPrimary>>>,
    primary_collection: LogSpaceCollection<MetaLogPrimary>,
    backup_collection: LogSpaceCollection<MetaLogBackup>,
    future_requests: Mutex<FutureRequests>,
}

impl SequencerNode {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            current_view: RwLock::new(None),
            current_primary: RwLock::new(None),
            primary_collection: LogSpaceCollection::new(),
            backup_collection: LogSpaceCollection::new(),
            future_requests: Mutex::new(FutureRequests::new()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn current_view(&self) -> Option<Arc<View>> {
        self.current_view.read().clone()
    }

    /// Install a view. Returns requests that were on hold for it; the
    /// caller re-dispatches them through [`Self::dispatch`].
    pub fn on_view_created(&self, view: Arc<View>) -> Result<Vec<SharedLogRequest>> {
        let contains_myself = view.contains_sequencer_node(self.node_id);
        let mut ready = Vec::new();
        if contains_myself {
            if view.primary_sequencer() == self.node_id {
                let primary = MetaLogPrimary::new(Arc::clone(&view), self.node_id);
                let handle = self
                    .primary_collection
                    .install(view.primary_logspace_id(), primary);
                *self.current_primary.write() = Some(handle);
            } else {
                *self.current_primary.write() = None;
                if view.is_replica_sequencer(view.primary_sequencer(), self.node_id) {
                    let backup = MetaLogBackup::new(Arc::clone(&view), view.primary_sequencer());
                    self.backup_collection
                        .install(view.primary_logspace_id(), backup);
                }
            }
        } else {
            *self.current_primary.write() = None;
        }
        self.future_requests
            .lock()
            .on_new_view(view.id(), contains_myself.then_some(&mut ready))?;
        info!(view_id = view.id(), node_id = self.node_id, "sequencer view installed");
        *self.current_view.write() = Some(view);
        Ok(ready)
    }

    /// Freeze every logspace of the view
    pub fn on_view_frozen(&self, view_id: ViewId) -> Result<()> {
        let current = self.current_view();
        let Some(view) = current else {
            return Err(SharedLogError::view("freeze before any view installed"));
        };
        if view.id() != view_id {
            return Err(SharedLogError::view(format!(
                "freeze for view {} while view {} is current",
                view_id,
                view.id()
            )));
        }
        if let Some(handle) = self.current_primary.read().clone() {
            handle.write().freeze();
        }
        for (_, handle) in self.backup_collection.for_view(view_id) {
            handle.write().freeze();
        }
        Ok(())
    }

    /// Seal every logspace of the view at its authoritative boundary
    pub fn on_view_finalized(&self, finalized: &FinalizedView) -> Result<()> {
        let view_id = finalized.view().id();
        for (logspace_id, handle) in self.primary_collection.for_view(view_id) {
            if let Some(final_position) = finalized.final_metalog_position(logspace_id) {
                handle
                    .write()
                    .finalize(final_position, finalized.tail_metalogs(logspace_id))?;
            }
        }
        for (logspace_id, handle) in self.backup_collection.for_view(view_id) {
            if let Some(final_position) = finalized.final_metalog_position(logspace_id) {
                handle
                    .write()
                    .finalize(final_position, finalized.tail_metalogs(logspace_id))?;
            }
        }
        Ok(())
    }

    /// Route one message by op type
    pub fn dispatch(&self, request: SharedLogRequest) -> Result<HandlerOutcome> {
        match request.message.op_type {
            SharedLogOpType::MetaProg => self.on_metalog_progress(&request.message),
            SharedLogOpType::ShardProg => self.on_shard_progress(request.message, request.payload),
            SharedLogOpType::LocalCut => self.on_local_cut(request.message, request.payload),
            SharedLogOpType::MetaLogs => self.on_new_metalogs(request.message, request.payload),
            other => Err(SharedLogError::protocol(
                "sequencer dispatch",
                format!("unexpected op type {other:?}"),
            )),
        }
    }

    /// `META_PROG` from a replica sequencer. A future view here is fatal:
    /// replicas only ever respond to metalogs this primary sent.
    pub fn on_metalog_progress(&self, message: &SharedLogMessage) -> Result<HandlerOutcome> {
        let view = match self.current_view() {
            None => {
                return Err(SharedLogError::violation(
                    "META_PROG before any view installed",
                ))
            }
            Some(view) if message.view_id > view.id() => {
                return Err(SharedLogError::violation(format!(
                    "META_PROG from future view {}",
                    message.view_id
                )))
            }
            Some(view) => view,
        };
        if message.view_id < view.id() {
            warn!(view_id = message.view_id, "outdated META_PROG ignored");
            return Ok(HandlerOutcome::Ignored);
        }
        let handle = self.primary_collection.get_checked(message.logspace_id)?;
        let mut outbound = Vec::new();
        {
            let mut primary = handle.write();
            if primary.frozen() {
                warn!(
                    logspace_id = format_args!("{:#010x}", message.logspace_id),
                    "logspace is frozen"
                );
                return Ok(HandlerOutcome::Ignored);
            }
            let old_position = primary.replicated_metalog_position();
            primary.update_replica_progress(message.origin_node_id, message.metalog_position)?;
            let new_position = primary.replicated_metalog_position();
            if new_position > old_position {
                let records = primary.get_metalogs(old_position, new_position)?;
                outbound.push(Outbound::PropagateMetaLogs {
                    engines: view.engine_nodes().to_vec(),
                    storages: view.storage_nodes().to_vec(),
                    records,
                });
            }
        }
        Ok(HandlerOutcome::Handled(outbound))
    }

    /// `SHARD_PROG` from a storage node
    pub fn on_shard_progress(
        &self,
        message: SharedLogMessage,
        payload: Bytes,
    ) -> Result<HandlerOutcome> {
        match self.admit(&message, payload.clone()) {
            Admission::Process => {}
            Admission::Held => return Ok(HandlerOutcome::Held),
            Admission::Ignored => return Ok(HandlerOutcome::Ignored),
        }
        let handle = self.primary_collection.get_checked(message.logspace_id)?;
        let mut primary = handle.write();
        if primary.frozen() {
            warn!(
                logspace_id = format_args!("{:#010x}", message.logspace_id),
                "logspace is frozen"
            );
            return Ok(HandlerOutcome::Ignored);
        }
        let progress = decode_progress_vec(payload)?;
        primary.update_storage_progress(message.origin_node_id, &progress)?;
        Ok(HandlerOutcome::Handled(Vec::new()))
    }

    /// `LOCAL_CUT` from an engine
    pub fn on_local_cut(&self, message: SharedLogMessage, payload: Bytes) -> Result<HandlerOutcome> {
        match self.admit(&message, payload.clone()) {
            Admission::Process => {}
            Admission::Held => return Ok(HandlerOutcome::Held),
            Admission::Ignored => return Ok(HandlerOutcome::Ignored),
        }
        let Some(handle) = self.current_primary.read().clone() else {
            warn!("LOCAL_CUT at a sequencer that is not the primary");
            return Ok(HandlerOutcome::Ignored);
        };
        let cut: LocalCutRecord = decode_frame(payload)?;
        let mut primary = handle.write();
        if primary.frozen() {
            return Ok(HandlerOutcome::Ignored);
        }
        primary.update_local_cut(&cut)?;
        Ok(HandlerOutcome::Handled(Vec::new()))
    }

    /// `METALOGS` replicated from the primary
    pub fn on_new_metalogs(
        &self,
        message: SharedLogMessage,
        payload: Bytes,
    ) -> Result<HandlerOutcome> {
        match self.admit(&message, payload.clone()) {
            Admission::Process => {}
            Admission::Held => return Ok(HandlerOutcome::Held),
            Admission::Ignored => return Ok(HandlerOutcome::Ignored),
        }
        let batch: MetaLogsBatch = decode_frame(payload)?;
        let handle = self.backup_collection.get_checked(message.logspace_id)?;
        let mut outbound = Vec::new();
        {
            let mut backup = handle.write();
            if backup.frozen() {
                warn!(
                    logspace_id = format_args!("{:#010x}", message.logspace_id),
                    "logspace is frozen"
                );
                return Ok(HandlerOutcome::Ignored);
            }
            if backup.provide_metalogs(&batch)? {
                outbound.push(Outbound::MetaLogProgress {
                    target: message.sequencer_id,
                    logspace_id: message.logspace_id,
                    position: backup.metalog_position(),
                });
            }
        }
        Ok(HandlerOutcome::Handled(outbound))
    }

    /// Periodic tick: mark the next cut when shards advanced and the whole
    /// metalog is replicated
    pub fn mark_next_cut_if_doable(&self) -> Result<Vec<Outbound>> {
        let (Some(handle), Some(view)) =
            (self.current_primary.read().clone(), self.current_view())
        else {
            return Ok(Vec::new());
        };
        let mut outbound = Vec::new();
        {
            let mut primary = handle.write();
            if primary.frozen() {
                return Ok(Vec::new());
            }
            if !primary.all_metalog_replicated() {
                info!("not all metalog replicated, will not mark new cut");
                return Ok(Vec::new());
            }
            if let Some(record) = primary.mark_next_cut()? {
                let replicas = view
                    .sequencer_node(self.node_id)
                    .map(|s| s.replica_sequencers.clone())
                    .unwrap_or_default();
                if replicas.is_empty() {
                    // Self-acknowledged: the cut commits immediately.
                    outbound.push(Outbound::PropagateMetaLogs {
                        engines: view.engine_nodes().to_vec(),
                        storages: view.storage_nodes().to_vec(),
                        records: vec![record],
                    });
                } else {
                    outbound.push(Outbound::ReplicateMetaLogs {
                        targets: replicas,
                        batch: MetaLogsBatch {
                            logspace_id: primary.logspace_id(),
                            records: vec![record],
                        },
                    });
                }
            }
        }
        Ok(outbound)
    }

    fn admit(&self, message: &SharedLogMessage, payload: Bytes) -> Admission {
        let current = self.current_view();
        match current {
            None => {
                self.future_requests
                    .lock()
                    .on_hold_request(SharedLogRequest::new(*message, payload));
                Admission::Held
            }
            Some(view) if message.view_id > view.id() => {
                self.future_requests
                    .lock()
                    .on_hold_request(SharedLogRequest::new(*message, payload));
                Admission::Held
            }
            Some(view) if message.view_id < view.id() => {
                warn!(
                    view_id = message.view_id,
                    current = view.id(),
                    "outdated message ignored"
                );
                Admission::Ignored
            }
            Some(_) => Admission::Process,
        }
    }
}

enum Admission {
    Process,
    Held,
    Ignored,
}

/// Drive the primary's cut marking on the configured local-cut interval
/// until `shutdown` flips to `true`. Outbound actions flow into `outbox`
/// for the embedding transport to deliver. Fatal errors end the task; the
/// embedding process must treat a closed outbox followed by an error log
/// as a broken invariant.
pub async fn run_cut_timer(
    node: std::sync::Arc<SequencerNode>,
    interval: std::time::Duration,
    outbox: tokio::sync::mpsc::UnboundedSender<Outbound>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match node.mark_next_cut_if_doable() {
                    Ok(outbound) => {
                        for action in outbound {
                            if outbox.send(action).is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        tracing::error!(%err, "cut marking failed");
                        if err.is_fatal() {
                            return;
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_progress_vec;
    use crate::protocol::frames::encode_frame;
    use crate::view::ViewDescriptor;

    fn install_single_node(node: &SequencerNode) -> Arc<View> {
        let view = Arc::new(View::new(ViewDescriptor::single_node(1, 0, 100, 1, 10)).unwrap());
        node.on_view_created(Arc::clone(&view)).unwrap();
        view
    }

    #[test]
    fn test_single_node_cut_propagates_immediately() {
        let node = SequencerNode::new(100);
        let view = install_single_node(&node);
        let message =
            SharedLogMessage::new_shard_progress(view.primary_logspace_id(), 10, 4);
        let outcome = node
            .on_shard_progress(message, encode_progress_vec(&[1]))
            .unwrap();
        assert!(matches!(outcome, HandlerOutcome::Handled(_)));

        let outbound = node.mark_next_cut_if_doable().unwrap();
        assert_eq!(outbound.len(), 1);
        match &outbound[0] {
            Outbound::PropagateMetaLogs {
                engines,
                storages,
                records,
            } => {
                assert_eq!(engines, &vec![1]);
                assert_eq!(storages, &vec![10]);
                assert_eq!(records.len(), 1);
            }
            other => panic!("unexpected outbound: {other:?}"),
        }
        // Nothing more to cut.
        assert!(node.mark_next_cut_if_doable().unwrap().is_empty());
    }

    #[test]
    fn test_shard_progress_for_future_view_is_held() {
        let node = SequencerNode::new(100);
        let view = install_single_node(&node);
        let mut message =
            SharedLogMessage::new_shard_progress(view.primary_logspace_id(), 10, 4);
        message.view_id = 2;
        let outcome = node
            .on_shard_progress(message, encode_progress_vec(&[1]))
            .unwrap();
        assert!(matches!(outcome, HandlerOutcome::Held));
    }

    #[test]
    fn test_stale_shard_progress_is_ignored() {
        let node = SequencerNode::new(100);
        install_single_node(&node);
        let mut message = SharedLogMessage::new_shard_progress(0x0000_0064, 10, 4);
        message.view_id = 0;
        let outcome = node
            .on_shard_progress(message, encode_progress_vec(&[1]))
            .unwrap();
        assert!(matches!(outcome, HandlerOutcome::Ignored));
    }

    #[test]
    fn test_meta_prog_from_future_view_is_fatal() {
        let node = SequencerNode::new(100);
        let view = install_single_node(&node);
        let mut message =
            SharedLogMessage::new_metalog_progress(view.primary_logspace_id(), 101, 0);
        message.view_id = 9;
        assert!(node.on_metalog_progress(&message).unwrap_err().is_fatal());
    }

    #[test]
    fn test_backup_replays_and_acks() {
        let descriptor = ViewDescriptor {
            id: 1,
            base_seqnum: 0,
            sequencer_nodes: vec![100, 101],
            primary_sequencer: 100,
            engine_nodes: vec![1],
            storage_nodes: vec![10],
            engine_storage_replicas: std::collections::BTreeMap::from([(1, vec![10])]),
            sequencer_replicas: std::collections::BTreeMap::from([(100, vec![101])]),
            engine_replica_factor: 0,
        };
        let view = Arc::new(View::new(descriptor).unwrap());

        let primary_node = SequencerNode::new(100);
        primary_node.on_view_created(Arc::clone(&view)).unwrap();
        let backup_node = SequencerNode::new(101);
        backup_node.on_view_created(Arc::clone(&view)).unwrap();

        // Storage progress lets the primary cut; with one replica the cut
        // must replicate before it commits.
        let message = SharedLogMessage::new_shard_progress(view.primary_logspace_id(), 10, 4);
        primary_node
            .on_shard_progress(message, encode_progress_vec(&[2]))
            .unwrap();
        let outbound = primary_node.mark_next_cut_if_doable().unwrap();
        let batch = match &outbound[0] {
            Outbound::ReplicateMetaLogs { targets, batch } => {
                assert_eq!(targets, &vec![101]);
                batch.clone()
            }
            other => panic!("unexpected outbound: {other:?}"),
        };

        // Backup applies the batch and acknowledges.
        let message = SharedLogMessage::new_metalogs(view.primary_logspace_id(), 100, 1, 0);
        let outcome = backup_node
            .on_new_metalogs(message, encode_frame(&batch).unwrap())
            .unwrap();
        let (target, position) = match outcome {
            HandlerOutcome::Handled(actions) => match &actions[0] {
                Outbound::MetaLogProgress {
                    target, position, ..
                } => (*target, *position),
                other => panic!("unexpected outbound: {other:?}"),
            },
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(target, 100);
        assert_eq!(position, 1);

        // The ack commits the cut at the primary and triggers propagation.
        let ack =
            SharedLogMessage::new_metalog_progress(view.primary_logspace_id(), 101, position);
        let outcome = primary_node.on_metalog_progress(&ack).unwrap();
        match outcome {
            HandlerOutcome::Handled(actions) => {
                assert!(matches!(actions[0], Outbound::PropagateMetaLogs { .. }));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cut_timer_emits_outbound() {
        let node = Arc::new(SequencerNode::new(100));
        let view = install_single_node(&node);
        let message = SharedLogMessage::new_shard_progress(view.primary_logspace_id(), 10, 4);
        node.on_shard_progress(message, encode_progress_vec(&[1]))
            .unwrap();

        let (outbox, mut actions) = tokio::sync::mpsc::unbounded_channel();
        let (stop, shutdown) = tokio::sync::watch::channel(false);
        let task = tokio::spawn(super::run_cut_timer(
            Arc::clone(&node),
            std::time::Duration::from_millis(1),
            outbox,
            shutdown,
        ));
        let action = actions.recv().await.unwrap();
        assert!(matches!(action, Outbound::PropagateMetaLogs { .. }));
        stop.send(true).unwrap();
        task.await.unwrap();
    }

    #[test]
    fn test_freeze_stops_cuts() {
        let node = SequencerNode::new(100);
        let view = install_single_node(&node);
        let message = SharedLogMessage::new_shard_progress(view.primary_logspace_id(), 10, 4);
        node.on_shard_progress(message, encode_progress_vec(&[1]))
            .unwrap();
        node.on_view_frozen(1).unwrap();
        assert!(node.mark_next_cut_if_doable().unwrap().is_empty());
    }
}
