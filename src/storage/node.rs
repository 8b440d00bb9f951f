//! Storage node driver
//!
//! Hosts the per-view storage logspace, admits replicated bodies and read
//! requests with the standard view discipline (hold future, ignore past),
//! applies propagated metalog entries, and emits `SHARD_PROG` reports when
//! progress advanced.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::{Result, SharedLogError};
use crate::fsm::records_from_metalog;
use crate::logspace::{FutureRequests, LogSpaceCollection, LogSpaceHandle, SharedLogRequest};
use crate::protocol::frames::{FsmRecord, MetaLogRecord};
use crate::protocol::{SharedLogMessage, SharedLogOpType};
use crate::storage::log_storage::{LogStorage, ReadRequest, ReadResponse};
use crate::types::{LogMetaData, LogSpaceId, NodeId, ViewId};
use crate::view::{FinalizedView, View};

/// Disposition of one incoming message at a storage node
#[derive(Debug)]
pub enum StorageOutcome {
    /// Processed; resolved reads surface through `poll_read_results`
    Handled,
    /// Held for a future view
    Held,
    /// Stale; dropped with a warning
    Ignored,
}

/// A storage participant hosting one logspace per installed view
#[derive(Debug)]
pub struct StorageNode {
    node_id: NodeId,
    max_live_entries: usize,
    current_view: RwLock<Option<Arc<View>>>,
    collection: LogSpaceCollection<LogStorage>,
    future_requests: Mutex<FutureRequests>,
}

impl StorageNode {
    pub fn new(node_id: NodeId, max_live_entries: usize) -> Self {
        Self {
            node_id,
            max_live_entries,
            current_view: RwLock::new(None),
            collection: LogSpaceCollection::new(),
            future_requests: Mutex::new(FutureRequests::new()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn current_view(&self) -> Option<Arc<View>> {
        self.current_view.read().clone()
    }

    /// Handle of the active view's logspace, for the flusher and embedded
    /// runtimes
    pub fn current_logspace(&self) -> Result<LogSpaceHandle<LogStorage>> {
        let view = self
            .current_view()
            .ok_or(SharedLogError::NoCurrentView)?;
        self.collection.get_checked(view.primary_logspace_id())
    }

    /// Install a view. Returns requests held for it; the caller
    /// re-dispatches them through [`Self::dispatch`].
    pub fn on_view_created(&self, view: Arc<View>) -> Result<Vec<SharedLogRequest>> {
        let contains_myself = view.contains_storage_node(self.node_id);
        let mut ready = Vec::new();
        if contains_myself {
            let storage =
                LogStorage::new(self.node_id, Arc::clone(&view), self.max_live_entries)?;
            self.collection.install(view.primary_logspace_id(), storage);
        }
        self.future_requests
            .lock()
            .on_new_view(view.id(), contains_myself.then_some(&mut ready))?;
        info!(view_id = view.id(), node_id = self.node_id, "storage view installed");
        *self.current_view.write() = Some(view);
        Ok(ready)
    }

    pub fn on_view_frozen(&self, view_id: ViewId) -> Result<()> {
        for (_, handle) in self.collection.for_view(view_id) {
            handle.write().freeze();
        }
        Ok(())
    }

    pub fn on_view_finalized(&self, finalized: &FinalizedView) -> Result<()> {
        for (_, handle) in self.collection.for_view(finalized.view().id()) {
            handle.write().on_finalized();
        }
        Ok(())
    }

    /// Route one message by op type
    pub fn dispatch(&self, request: SharedLogRequest) -> Result<StorageOutcome> {
        match request.message.op_type {
            SharedLogOpType::Replicate => self.on_replicate(request.message, request.payload),
            SharedLogOpType::ReadAt => self.on_read_at(request.message),
            other => Err(SharedLogError::protocol(
                "storage dispatch",
                format!("unexpected op type {other:?}"),
            )),
        }
    }

    /// `REPLICATE`: a record body from a source engine
    pub fn on_replicate(
        &self,
        message: SharedLogMessage,
        payload: Bytes,
    ) -> Result<StorageOutcome> {
        match self.admit(&message, payload.clone()) {
            Admission::Process => {}
            Admission::Held => return Ok(StorageOutcome::Held),
            Admission::Ignored => return Ok(StorageOutcome::Ignored),
        }
        let handle = self.current_logspace()?;
        let metadata = LogMetaData {
            local_id: message.localid,
            seqnum: 0,
            tag: message.user_tag,
        };
        handle.write().store(metadata, payload)?;
        Ok(StorageOutcome::Handled)
    }

    /// `READ_AT`: serve or queue a read for an exact seqnum
    pub fn on_read_at(&self, message: SharedLogMessage) -> Result<StorageOutcome> {
        match self.admit(&message, Bytes::new()) {
            Admission::Process => {}
            Admission::Held => return Ok(StorageOutcome::Held),
            Admission::Ignored => return Ok(StorageOutcome::Ignored),
        }
        let handle = self.current_logspace()?;
        handle.write().read_at(ReadRequest {
            origin_node_id: message.origin_node_id,
            seqnum: message.seqnum,
        });
        Ok(StorageOutcome::Handled)
    }

    /// Apply committed metalog entries propagated by the sequencer
    pub fn on_metalogs(&self, records: &[MetaLogRecord]) -> Result<()> {
        let view = self
            .current_view()
            .ok_or(SharedLogError::NoCurrentView)?;
        let handle = self.collection.get_checked(view.primary_logspace_id())?;
        for record in records {
            if record.logspace_id != view.primary_logspace_id() {
                warn!(
                    logspace_id = format_args!("{:#010x}", record.logspace_id),
                    "metalog entry for another logspace ignored"
                );
                continue;
            }
            let flattened = records_from_metalog(&view, record)?;
            let mut storage = handle.write();
            for fsm_record in flattened {
                match fsm_record {
                    FsmRecord::LogReplicated {
                        start_local_id,
                        start_seqnum,
                        delta,
                    } => storage.on_new_logs(start_seqnum, start_local_id, delta)?,
                    FsmRecord::GlobalCut {
                        start_seqnum,
                        end_seqnum,
                    } => storage.on_global_cut(start_seqnum, end_seqnum),
                    FsmRecord::NewView(_) => unreachable!("metalogs never carry views"),
                }
            }
        }
        Ok(())
    }

    /// Resolved reads accumulated since the last poll
    pub fn poll_read_results(&self) -> Result<Vec<ReadResponse>> {
        let handle = self.current_logspace()?;
        let results = handle.write().poll_read_results();
        Ok(results)
    }

    /// The `SHARD_PROG` report to send, if progress advanced
    pub fn grab_shard_progress(&self) -> Result<Option<(LogSpaceId, Vec<u32>)>> {
        let view = self
            .current_view()
            .ok_or(SharedLogError::NoCurrentView)?;
        let handle = self.collection.get_checked(view.primary_logspace_id())?;
        let progress = handle.write().grab_shard_progress_for_sending();
        Ok(progress.map(|p| (view.primary_logspace_id(), p)))
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
