//! Tag index: per-tag ordered seqnum lists
//!
//! Tag runs arrive from primaries over the network and may race the FSM
//! stream, so a run is held until the global cut covering its seqnums has
//! landed. Publication is contiguous: runs are admitted in seqnum order
//! within each cut, and a cut's FSM record seqnum becomes visible through
//! `fsm_progress()` only once every run inside it has been published.

use std::collections::{BTreeMap, HashMap, VecDeque};

use tracing::{debug, warn};

use crate::types::{NodeId, SeqNum, Tag, ViewId};

#[derive(Debug)]
struct PendingRun {
    primary_node: NodeId,
    tags: Vec<Tag>,
}

#[derive(Debug, Clone, Copy)]
struct PendingCut {
    record_seqnum: u32,
    start_seqnum: SeqNum,
    end_seqnum: SeqNum,
}

/// Mapping `tag → sorted seqnums`, advanced monotonically in seqnum
#[derive(Debug, Default)]
pub struct TagIndex {
    index: HashMap<Tag, Vec<SeqNum>>,
    /// Received-but-unpublished runs keyed by their start seqnum
    pending: BTreeMap<SeqNum, PendingRun>,
    /// Cuts whose runs have not all been published yet, in FSM order
    cuts: VecDeque<PendingCut>,
    /// Contiguous publication watermark
    indexed_position: SeqNum,
    /// Largest FSM record seqnum fully reflected in the index
    fsm_progress: u32,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Largest FSM record seqnum fully reflected
    pub fn fsm_progress(&self) -> u32 {
        self.fsm_progress
    }

    /// Number of seqnums indexed for a tag
    pub fn tag_count(&self, tag: Tag) -> usize {
        self.index.get(&tag).map(Vec::len).unwrap_or(0)
    }

    /// Accept a run of tags for seqnums `[start_seqnum, start_seqnum +
    /// tags.len())` from `primary_node`. The run stays pending until the
    /// covering global cut lands. Callers filter stale views before
    /// delivery.
    pub fn recv_tag_data(&mut self, primary_node: NodeId, start_seqnum: SeqNum, tags: &[Tag]) {
        if tags.is_empty() {
            return;
        }
        let end_seqnum = start_seqnum + tags.len() as u64;
        if end_seqnum <= self.indexed_position {
            debug!(primary_node, start_seqnum, "stale tag run ignored");
            return;
        }
        self.pending.entry(start_seqnum).or_insert(PendingRun {
            primary_node,
            tags: tags.to_vec(),
        });
        self.try_publish();
    }

    /// A committed cut landed; promote pending runs inside it
    pub fn on_new_global_cut(&mut self, record_seqnum: u32, start_seqnum: SeqNum, end_seqnum: SeqNum) {
        self.cuts.push_back(PendingCut {
            record_seqnum,
            start_seqnum,
            end_seqnum,
        });
        self.try_publish();
    }

    /// A new view installed: runs whose cut never committed belong to a
    /// superseded assignment and are dropped
    pub fn on_new_view(&mut self, record_seqnum: u32, view_id: ViewId) {
        if !self.pending.is_empty() {
            warn!(
                count = self.pending.len(),
                view_id, "unpublished tag runs dropped at view change"
            );
            self.pending.clear();
        }
        if !self.cuts.is_empty() {
            warn!(
                count = self.cuts.len(),
                view_id, "incomplete cuts dropped at view change"
            );
            self.cuts.clear();
        }
        self.fsm_progress = record_seqnum;
    }

    /// Largest indexed seqnum `≤ upper` carrying `tag`
    pub fn prev(&self, tag: Tag, upper: SeqNum) -> Option<SeqNum> {
        let seqnums = self.index.get(&tag)?;
        let idx = seqnums.partition_point(|&s| s <= upper);
        if idx == 0 {
            None
        } else {
            Some(seqnums[idx - 1])
        }
    }

    fn try_publish(&mut self) {
        while let Some(cut) = self.cuts.front().copied() {
            if self.indexed_position < cut.start_seqnum {
                // Seqnums below the cut were published by earlier cuts or
                // predate this node's membership.
                self.indexed_position = cut.start_seqnum;
            }
            loop {
                let run_fits = match self.pending.get(&self.indexed_position) {
                    Some(run) => {
                        self.indexed_position + run.tags.len() as u64 <= cut.end_seqnum
                    }
                    None => false,
                };
                if !run_fits {
                    break;
                }
                let run = self
                    .pending
                    .remove(&self.indexed_position)
                    .expect("run presence checked");
                debug!(
                    primary_node = run.primary_node,
                    start_seqnum = self.indexed_position,
                    len = run.tags.len(),
                    "publishing tag run"
                );
                for (offset, &tag) in run.tags.iter().enumerate() {
                    self.index
                        .entry(tag)
                        .or_default()
                        .push(self.indexed_position + offset as u64);
                }
                self.indexed_position += run.tags.len() as u64;
            }
            if self.indexed_position == cut.end_seqnum {
                self.fsm_progress = cut.record_seqnum;
                self.cuts.pop_front();
            } else {
                break;
            }
        }
    }
}
