//! The per-participant view/cut state machine
//!
//! Every engine and storage consumes one linear stream of [`FsmRecord`]s,
//! delivered by the consensus layer (single-writer on this channel). The
//! FSM validates the stream, installs views, and turns committed metalog
//! cuts into [`FsmEvent`]s the caller matches exhaustively. Events take the
//! place of registered callbacks; a record is applied atomically and its
//! events are returned in firing order (`LogReplicated`s for a cut precede
//! the cut's `GlobalCut`; `NewView` fires exactly once per view id, in
//! ascending order).

use std::sync::Arc;

use tracing::info;

use crate::error::{Result, SharedLogError};
use crate::protocol::frames::{FsmRecord, MetaLogKind, MetaLogRecord};
use crate::types::{build_local_id, LocalId, SeqNum, ViewId};
use crate::view::{View, ViewDescriptor};

/// Notification produced by applying one FSM record
#[derive(Debug, Clone)]
pub enum FsmEvent {
    /// A new view is installed; fired once per view id, ascending
    NewView {
        record_seqnum: u32,
        view: Arc<View>,
    },
    /// A shard run of a committed cut, in metalog order, no gaps
    LogReplicated {
        start_local_id: LocalId,
        start_seqnum: SeqNum,
        delta: u32,
    },
    /// A committed cut; fired after its `LogReplicated` events
    GlobalCut {
        record_seqnum: u32,
        start_seqnum: SeqNum,
        end_seqnum: SeqNum,
    },
}

/// The view/cut state machine
#[derive(Debug, Default)]
pub struct Fsm {
    views: Vec<Arc<View>>,
    progress: u32,
    next_seqnum: SeqNum,
}

impl Fsm {
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently installed view, if any
    pub fn current_view(&self) -> Option<&Arc<View>> {
        self.views.last()
    }

    /// A previously installed view by id
    pub fn view_with_id(&self, view_id: ViewId) -> Option<&Arc<View>> {
        self.views.iter().find(|v| v.id() == view_id)
    }

    /// Number of FSM records consumed
    pub fn progress(&self) -> u32 {
        self.progress
    }

    /// Next unassigned global seqnum
    pub fn next_seqnum(&self) -> SeqNum {
        self.next_seqnum
    }

    /// Apply one record in delivery order. Returns the events it fires, or
    /// a fatal error if the stream violates the protocol (the FSM never
    /// skips records).
    pub fn apply(&mut self, record: FsmRecord) -> Result<Vec<FsmEvent>> {
        let record_seqnum = self.progress;
        let events = match record {
            FsmRecord::NewView(descriptor) => self.apply_new_view(record_seqnum, descriptor)?,
            FsmRecord::LogReplicated {
                start_local_id,
                start_seqnum,
                delta,
            } => self.apply_log_replicated(start_local_id, start_seqnum, delta)?,
            FsmRecord::GlobalCut {
                start_seqnum,
                end_seqnum,
            } => self.apply_global_cut(record_seqnum, start_seqnum, end_seqnum)?,
        };
        self.progress = record_seqnum + 1;
        Ok(events)
    }

    fn apply_new_view(
        &mut self,
        record_seqnum: u32,
        descriptor: ViewDescriptor,
    ) -> Result<Vec<FsmEvent>> {
        if let Some(current) = self.current_view() {
            if descriptor.id <= current.id() {
                return Err(SharedLogError::violation(format!(
                    "view id {} does not advance current view {}",
                    descriptor.id,
                    current.id()
                )));
            }
        }
        if descriptor.base_seqnum < self.next_seqnum {
            return Err(SharedLogError::violation(format!(
                "view {} base seqnum {:#x} overlaps assigned range ending at {:#x}",
                descriptor.id, descriptor.base_seqnum, self.next_seqnum
            )));
        }
        self.next_seqnum = descriptor.base_seqnum;
        let view = Arc::new(View::new(descriptor)?);
        info!(view_id = view.id(), record_seqnum, "installing view");
        self.views.push(Arc::clone(&view));
        Ok(vec![FsmEvent::NewView {
            record_seqnum,
            view,
        }])
    }

    fn apply_log_replicated(
        &mut self,
        start_local_id: LocalId,
        start_seqnum: SeqNum,
        delta: u32,
    ) -> Result<Vec<FsmEvent>> {
        if self.views.is_empty() {
            return Err(SharedLogError::violation(
                "log replicated before any view installed",
            ));
        }
        if start_seqnum != self.next_seqnum {
            return Err(SharedLogError::violation(format!(
                "log replicated at {:#x} leaves a gap (expected {:#x})",
                start_seqnum, self.next_seqnum
            )));
        }
        self.next_seqnum = start_seqnum + u64::from(delta);
        Ok(vec![FsmEvent::LogReplicated {
            start_local_id,
            start_seqnum,
            delta,
        }])
    }

    fn apply_global_cut(
        &mut self,
        record_seqnum: u32,
        start_seqnum: SeqNum,
        end_seqnum: SeqNum,
    ) -> Result<Vec<FsmEvent>> {
        if start_seqnum > end_seqnum || end_seqnum != self.next_seqnum {
            return Err(SharedLogError::violation(format!(
                "global cut [{:#x}, {:#x}) does not match assigned range ending at {:#x}",
                start_seqnum, end_seqnum, self.next_seqnum
            )));
        }
        Ok(vec![FsmEvent::GlobalCut {
            record_seqnum,
            start_seqnum,
            end_seqnum,
        }])
    }
}

/// Flatten a committed `NEW_LOGS` metalog entry into the FSM records every
/// participant consumes: one `LogReplicated` per nonempty shard in
/// engine-id order, then the cut's `GlobalCut`.
pub fn records_from_metalog(view: &View, metalog: &MetaLogRecord) -> Result<Vec<FsmRecord>> {
    match &metalog.kind {
        MetaLogKind::NewLogs {
            start_seqnum,
            shard_starts,
            shard_deltas,
        } => {
            let engines = view.engine_nodes();
            if shard_starts.len() != engines.len() || shard_deltas.len() != engines.len() {
                return Err(SharedLogError::violation(format!(
                    "metalog {} shard vectors sized {}/{} for {} engines",
                    metalog.metalog_seqnum,
                    shard_starts.len(),
                    shard_deltas.len(),
                    engines.len()
                )));
            }
            let mut records = Vec::with_capacity(engines.len() + 1);
            let mut seqnum = *start_seqnum;
            for (index, &engine_id) in engines.iter().enumerate() {
                let delta = shard_deltas[index];
                if delta == 0 {
                    continue;
                }
                records.push(FsmRecord::LogReplicated {
                    start_local_id: build_local_id(view.id(), engine_id, shard_starts[index]),
                    start_seqnum: seqnum,
                    delta,
                });
                seqnum += u64::from(delta);
            }
            records.push(FsmRecord::GlobalCut {
                start_seqnum: *start_seqnum,
                end_seqnum: seqnum,
            });
            Ok(records)
        }
        MetaLogKind::Trim => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::local_id_to_node_id;

    fn new_view_record(id: ViewId, base_seqnum: SeqNum) -> FsmRecord {
        FsmRecord::NewView(ViewDescriptor::single_node(id, base_seqnum, 100, 1, 10))
    }

    #[test]
    fn test_new_view_installs_once_ascending() {
        let mut fsm = Fsm::new();
        let events = fsm.apply(new_view_record(1, 0)).unwrap();
        assert!(matches!(
            events.as_slice(),
            [FsmEvent::NewView { record_seqnum: 0, view }] if view.id() == 1
        ));
        assert_eq!(fsm.progress(), 1);
        // Equal or lower view ids are a protocol violation.
        let err = fsm.apply(new_view_record(1, 0)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_cut_stream_is_dense() {
        let mut fsm = Fsm::new();
        fsm.apply(new_view_record(1, 0)).unwrap();
        fsm.apply(FsmRecord::LogReplicated {
            start_local_id: build_local_id(1, 1, 0),
            start_seqnum: 0,
            delta: 3,
        })
        .unwrap();
        fsm.apply(FsmRecord::GlobalCut {
            start_seqnum: 0,
            end_seqnum: 3,
        })
        .unwrap();
        assert_eq!(fsm.next_seqnum(), 3);
        // A gap in the assigned range is fatal.
        let err = fsm
            .apply(FsmRecord::LogReplicated {
                start_local_id: build_local_id(1, 1, 5),
                start_seqnum: 5,
                delta: 1,
            })
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_global_cut_must_close_assigned_range() {
        let mut fsm = Fsm::new();
        fsm.apply(new_view_record(1, 0)).unwrap();
        fsm.apply(FsmRecord::LogReplicated {
            start_local_id: build_local_id(1, 1, 0),
            start_seqnum: 0,
            delta: 2,
        })
        .unwrap();
        let err = fsm
            .apply(FsmRecord::GlobalCut {
                start_seqnum: 0,
                end_seqnum: 3,
            })
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_view_base_continues_seqnum_space() {
        let mut fsm = Fsm::new();
        fsm.apply(new_view_record(1, 0)).unwrap();
        fsm.apply(FsmRecord::LogReplicated {
            start_local_id: build_local_id(1, 1, 0),
            start_seqnum: 0,
            delta: 4,
        })
        .unwrap();
        fsm.apply(FsmRecord::GlobalCut {
            start_seqnum: 0,
            end_seqnum: 4,
        })
        .unwrap();
        // Next view must not reuse the assigned range.
        let err = fsm.apply(new_view_record(2, 3)).unwrap_err();
        assert!(err.is_fatal());

        let mut fsm = Fsm::new();
        fsm.apply(new_view_record(1, 0)).unwrap();
        fsm.apply(new_view_record(2, 0)).unwrap();
        assert_eq!(fsm.current_view().unwrap().id(), 2);
        assert!(fsm.view_with_id(1).is_some());
    }

    #[test]
    fn test_records_from_metalog_flattening() {
        let view = View::new(ViewDescriptor {
            id: 1,
            base_seqnum: 0,
            sequencer_nodes: vec![100],
            primary_sequencer: 100,
            engine_nodes: vec![1, 2],
            storage_nodes: vec![10],
            engine_storage_replicas: std::collections::BTreeMap::from([
                (1, vec![10]),
                (2, vec![10]),
            ]),
            sequencer_replicas: std::collections::BTreeMap::new(),
            engine_replica_factor: 0,
        })
        .unwrap();
        let metalog = MetaLogRecord {
            logspace_id: view.primary_logspace_id(),
            metalog_seqnum: 0,
            kind: MetaLogKind::NewLogs {
                start_seqnum: 0,
                shard_starts: vec![0, 0],
                shard_deltas: vec![2, 0],
            },
        };
        let records = records_from_metalog(&view, &metalog).unwrap();
        assert_eq!(records.len(), 2);
        match &records[0] {
            FsmRecord::LogReplicated {
                start_local_id,
                start_seqnum,
                delta,
            } => {
                assert_eq!(local_id_to_node_id(*start_local_id), 1);
                assert_eq!(*start_seqnum, 0);
                assert_eq!(*delta, 2);
            }
            other => panic!("unexpected record: {other:?}"),
        }
        assert!(matches!(
            records[1],
            FsmRecord::GlobalCut {
                start_seqnum: 0,
                end_seqnum: 2
            }
        ));
    }

    #[test]
    fn test_records_from_metalog_rejects_bad_shape() {
        let view = View::new(ViewDescriptor::single_node(1, 0, 100, 1, 10)).unwrap();
        let metalog = MetaLogRecord {
            logspace_id: view.primary_logspace_id(),
            metalog_seqnum: 0,
            kind: MetaLogKind::NewLogs {
                start_seqnum: 0,
                shard_starts: vec![0, 0],
                shard_deltas: vec![1, 1],
            },
        };
        assert!(records_from_metalog(&view, &metalog).is_err());
    }
}
