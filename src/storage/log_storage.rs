//! Storage-side logspace: pending bodies, live cache, and the read path
//!
//! Bodies arrive from source engines ahead of the metalog; a committed cut
//! moves them from the pending map into the live cache under their
//! assigned seqnum. Reads for unassigned seqnums queue until the covering
//! cut lands. A flusher periodically drains the live tail into the backing
//! database and advances the persisted watermark, after which the live set
//! shrinks back under its cap.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::{Result, SharedLogError};
use crate::logspace::LogSpaceState;
use crate::types::{
    build_local_id, local_id_to_node_id, LogEntry, LogMetaData, LogSpaceId, NodeId, SeqNum,
};
use crate::view::View;

/// Typed outcome of a read
#[derive(Debug, Clone)]
pub enum ReadResult {
    /// The entry is live at this storage
    Ok(Arc<LogEntry>),
    /// The entry is below the persisted watermark; look it up in the
    /// backing database
    LookupDb,
    /// The seqnum is not (or no longer) served by this storage
    Failed,
}

/// A read request as admitted to the storage logspace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub origin_node_id: NodeId,
    pub seqnum: SeqNum,
}

/// A resolved read, paired with its original request
#[derive(Debug, Clone)]
pub struct ReadResponse {
    pub request: ReadRequest,
    pub result: ReadResult,
}

/// Per-storage state of one logspace
#[derive(Debug)]
pub struct LogStorage {
    storage_id: NodeId,
    view: Arc<View>,
    logspace_id: LogSpaceId,
    state: LogSpaceState,
    source_engines: Vec<NodeId>,
    /// Bodies awaiting metalog assignment, keyed by local id
    pending_entries: HashMap<u64, LogEntry>,
    /// Assigned records still cached in memory
    live_entries: HashMap<SeqNum, Arc<LogEntry>>,
    /// Sorted seqnums matching `live_entries`
    live_seqnums: VecDeque<SeqNum>,
    /// Contiguous replicated prefix per source engine
    shard_progress: BTreeMap<NodeId, u32>,
    shard_progress_dirty: bool,
    /// Next unassigned seqnum (end of the last applied cut)
    seqnum_position: SeqNum,
    /// Watermark below which entries are durably in the backing DB
    persisted_seqnum_position: SeqNum,
    pending_reads: BTreeMap<SeqNum, Vec<ReadRequest>>,
    read_results: Vec<ReadResponse>,
    max_live_entries: usize,
}

impl LogStorage {
    pub fn new(storage_id: NodeId, view: Arc<View>, max_live_entries: usize) -> Result<Self> {
        let storage = view
            .storage_node(storage_id)
            .ok_or_else(|| {
                SharedLogError::view(format!(
                    "view {} does not contain storage node {}",
                    view.id(),
                    storage_id
                ))
            })?;
        let source_engines = storage.source_engines.clone();
        let shard_progress = source_engines.iter().map(|&e| (e, 0)).collect();
        let logspace_id = view.primary_logspace_id();
        let seqnum_position = view.base_seqnum();
        Ok(Self {
            storage_id,
            view,
            logspace_id,
            state: LogSpaceState::Normal,
            source_engines,
            pending_entries: HashMap::new(),
            live_entries: HashMap::new(),
            live_seqnums: VecDeque::new(),
            shard_progress,
            shard_progress_dirty: false,
            seqnum_position,
            persisted_seqnum_position: seqnum_position,
            pending_reads: BTreeMap::new(),
            read_results: Vec::new(),
            max_live_entries,
        })
    }

    pub fn storage_id(&self) -> NodeId {
        self.storage_id
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

    pub fn seqnum_position(&self) -> SeqNum {
        self.seqnum_position
    }

    pub fn persisted_seqnum_position(&self) -> SeqNum {
        self.persisted_seqnum_position
    }

    pub fn live_entries_len(&self) -> usize {
        self.live_seqnums.len()
    }

    pub fn shard_progress(&self, engine_id: NodeId) -> Option<u32> {
        self.shard_progress.get(&engine_id).copied()
    }

    /// Hold a replicated body until its metalog cut lands. Rejects bodies
    /// from engines this storage does not serve.
    pub fn store(&mut self, metadata: LogMetaData, data: Bytes) -> Result<()> {
        let engine_id = local_id_to_node_id(metadata.local_id);
        if !self.source_engines.contains(&engine_id) {
            return Err(SharedLogError::NotSourceEngine {
                storage_id: self.storage_id,
                engine_id,
            });
        }
        self.pending_entries.insert(
            metadata.local_id,
            LogEntry {
                metadata,
                data,
            },
        );
        self.advance_shard_progress(engine_id);
        Ok(())
    }

    /// Serve (or queue) a read for an exact seqnum
    pub fn read_at(&mut self, request: ReadRequest) {
        if request.seqnum >= self.seqnum_position {
            self.pending_reads
                .entry(request.seqnum)
                .or_default()
                .push(request);
            return;
        }
        let result = self.lookup(request.seqnum);
        self.read_results.push(ReadResponse { request, result });
    }

    /// Drain resolved reads
    pub fn poll_read_results(&mut self) -> Vec<ReadResponse> {
        std::mem::take(&mut self.read_results)
    }

    /// Apply one shard run of a committed cut. Bodies must already be
    /// present: at the source engine, bodies precede cuts by construction,
    /// so a miss here is a broken invariant.
    pub fn on_new_logs(
        &mut self,
        start_seqnum: SeqNum,
        start_local_id: u64,
        delta: u32,
    ) -> Result<()> {
        // Reads queued below the cut can never be served by this logspace.
        self.fail_pending_reads_below(start_seqnum);
        let engine_id = local_id_to_node_id(start_local_id);
        if !self.source_engines.contains(&engine_id) {
            return Ok(());
        }
        for i in 0..u64::from(delta) {
            let seqnum = start_seqnum + i;
            let local_id = start_local_id + i;
            let Some(mut entry) = self.pending_entries.remove(&local_id) else {
                return Err(SharedLogError::violation(format!(
                    "no pending entry for local id {local_id:#018x}"
                )));
            };
            entry.metadata.seqnum = seqnum;
            let entry = Arc::new(entry);
            debug_assert!(self.live_seqnums.back().map_or(true, |&last| seqnum > last));
            self.live_seqnums.push_back(seqnum);
            self.live_entries.insert(seqnum, Arc::clone(&entry));
            self.shrink_live_entries_if_needed();
            if let Some(requests) = self.pending_reads.remove(&seqnum) {
                for request in requests {
                    self.read_results.push(ReadResponse {
                        request,
                        result: ReadResult::Ok(Arc::clone(&entry)),
                    });
                }
            }
        }
        Ok(())
    }

    /// A committed cut fully applied: advance the assigned-seqnum position
    /// and resolve every read the cut decided
    pub fn on_global_cut(&mut self, start_seqnum: SeqNum, end_seqnum: SeqNum) {
        debug_assert!(start_seqnum <= end_seqnum);
        if end_seqnum > self.seqnum_position {
            self.seqnum_position = end_seqnum;
        }
        // Reads inside the cut that were not resolved by a shard run point
        // at records stored elsewhere.
        let undecided: Vec<SeqNum> = self
            .pending_reads
            .range(..self.seqnum_position)
            .map(|(&seqnum, _)| seqnum)
            .collect();
        for seqnum in undecided {
            let requests = self
                .pending_reads
                .remove(&seqnum)
                .expect("key collected above");
            for request in requests {
                let result = self.lookup(seqnum);
                self.read_results.push(ReadResponse { request, result });
            }
        }
    }

    /// The live tail not yet persisted, with the position to report back
    /// through [`Self::log_entries_persisted`]. Adapter I/O happens
    /// without the logspace lock.
    pub fn grab_for_persistence(&self) -> Option<(Vec<Arc<LogEntry>>, SeqNum)> {
        let start = self
            .live_seqnums
            .partition_point(|&s| s < self.persisted_seqnum_position);
        if start >= self.live_seqnums.len() {
            return None;
        }
        let entries = self
            .live_seqnums
            .iter()
            .skip(start)
            .map(|seqnum| Arc::clone(&self.live_entries[seqnum]))
            .collect();
        let new_position = self.live_seqnums.back().copied().expect("tail checked") + 1;
        Some((entries, new_position))
    }

    /// The flusher persisted everything below `new_position`
    pub fn log_entries_persisted(&mut self, new_position: SeqNum) {
        if new_position > self.persisted_seqnum_position {
            self.persisted_seqnum_position = new_position;
        }
        self.shrink_live_entries_if_needed();
    }

    /// The progress vector to report, in source-engine order, if any
    /// counter advanced since the last report
    pub fn grab_shard_progress_for_sending(&mut self) -> Option<Vec<u32>> {
        if !self.shard_progress_dirty {
            return None;
        }
        self.shard_progress_dirty = false;
        Some(
            self.source_engines
                .iter()
                .map(|engine_id| self.shard_progress[engine_id])
                .collect(),
        )
    }

    pub fn freeze(&mut self) {
        if self.state == LogSpaceState::Normal {
            self.state = LogSpaceState::Frozen;
        }
    }

    /// Seal the logspace; bodies whose cut never committed are discarded
    pub fn on_finalized(&mut self) {
        if !self.pending_entries.is_empty() {
            warn!(
                count = self.pending_entries.len(),
                logspace_id = format_args!("{:#010x}", self.logspace_id),
                "pending log entries discarded"
            );
            self.pending_entries.clear();
        }
        for (_, requests) in std::mem::take(&mut self.pending_reads) {
            for request in requests {
                self.read_results.push(ReadResponse {
                    request,
                    result: ReadResult::Failed,
                });
            }
        }
        self.state = LogSpaceState::Finalized;
    }

    fn lookup(&self, seqnum: SeqNum) -> ReadResult {
        if let Some(entry) = self.live_entries.get(&seqnum) {
            ReadResult::Ok(Arc::clone(entry))
        } else if seqnum < self.persisted_seqnum_position {
            ReadResult::LookupDb
        } else {
            ReadResult::Failed
        }
    }

    fn fail_pending_reads_below(&mut self, seqnum: SeqNum) {
        let stale: Vec<SeqNum> = self
            .pending_reads
            .range(..seqnum)
            .map(|(&s, _)| s)
            .collect();
        for s in stale {
            let requests = self.pending_reads.remove(&s).expect("key collected above");
            for request in requests {
                self.read_results.push(ReadResponse {
                    request,
                    result: ReadResult::Failed,
                });
            }
        }
    }

    fn advance_shard_progress(&mut self, engine_id: NodeId) {
        let current = self.shard_progress[&engine_id];
        let mut counter = current;
        while self
            .pending_entries
            .contains_key(&build_local_id(self.view.id(), engine_id, counter))
        {
            counter += 1;
        }
        if counter > current {
            debug!(engine_id, counter, "shard progress advanced");
            self.shard_progress.insert(engine_id, counter);
            self.shard_progress_dirty = true;
        }
    }

    fn shrink_live_entries_if_needed(&mut self) {
        while self.live_seqnums.len() > self.max_live_entries
            && self
                .live_seqnums
                .front()
                .is_some_and(|&s| s < self.persisted_seqnum_position)
        {
            let seqnum = self.live_seqnums.pop_front().expect("front checked");
            self.live_entries.remove(&seqnum);
            debug_assert_eq!(self.live_seqnums.len(), self.live_entries.len());
        }
    }
}
