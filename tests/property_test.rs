//! Property-based tests for the ordering core
//!
//! Uses proptest to generate random inputs and verify the protocol
//! invariants hold across a wide range of schedules that the scenario
//! tests cannot enumerate.

mod common;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use common::*;
use proptest::prelude::*;
use sharedlog::protocol::{SharedLogMessage, SharedLogOpType, HEADER_SIZE};
use sharedlog::sequencer::MetaLogPrimary;
use sharedlog::storage::ReadResult;
use sharedlog::types::Tag;
use sharedlog::view::{View, ViewDescriptor};

fn arbitrary_op_type() -> impl Strategy<Value = SharedLogOpType> {
    prop_oneof![
        Just(SharedLogOpType::Append),
        Just(SharedLogOpType::Replicate),
        Just(SharedLogOpType::ReadAt),
        Just(SharedLogOpType::ReadPrev),
        Just(SharedLogOpType::ReadNext),
        Just(SharedLogOpType::MetaProg),
        Just(SharedLogOpType::ShardProg),
        Just(SharedLogOpType::MetaLogs),
        Just(SharedLogOpType::LocalCut),
        Just(SharedLogOpType::Trim),
        Just(SharedLogOpType::Response),
    ]
}

fn quorum_descriptor(replica_count: u16) -> ViewDescriptor {
    let replicas: Vec<u16> = (101..101 + replica_count).collect();
    let mut sequencer_nodes = replicas.clone();
    sequencer_nodes.push(100);
    ViewDescriptor {
        id: 1,
        base_seqnum: 0,
        sequencer_nodes,
        primary_sequencer: 100,
        engine_nodes: vec![1],
        storage_nodes: vec![10, 11],
        engine_storage_replicas: BTreeMap::from([(1, vec![10, 11])]),
        sequencer_replicas: BTreeMap::from([(100, replicas)]),
        engine_replica_factor: 0,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: the fixed header round-trips for arbitrary field values,
    /// including shared-memory payload sizes.
    #[test]
    fn header_roundtrip(
        op_type in arbitrary_op_type(),
        view_id in any::<u16>(),
        logspace_id in any::<u32>(),
        sequencer_id in any::<u16>(),
        origin_node_id in any::<u16>(),
        hop_times in any::<u16>(),
        metalog_position in any::<u32>(),
        seqnum in any::<u64>(),
        localid in any::<u64>(),
        user_tag in any::<u64>(),
        payload_size in any::<i32>(),
    ) {
        let message = SharedLogMessage {
            op_type,
            view_id,
            logspace_id,
            sequencer_id,
            origin_node_id,
            hop_times,
            metalog_position,
            seqnum,
            localid,
            user_tag,
            payload_size,
        };
        let mut buf = BytesMut::new();
        message.encode(&mut buf);
        prop_assert_eq!(buf.len(), HEADER_SIZE);
        let mut encoded = buf.freeze();
        let decoded = SharedLogMessage::decode(&mut encoded)?;
        prop_assert_eq!(decoded, message);
    }

    /// Property: after any sequence of META_PROG updates, the replicated
    /// position equals the lower median of the clamped progress vector and
    /// never decreases.
    #[test]
    fn replicated_position_is_lower_median(
        replica_count in 1u16..6,
        updates in prop::collection::vec((0u16..6, 0u32..10), 1..64),
    ) {
        let view = Arc::new(View::new(quorum_descriptor(replica_count)).unwrap());
        let mut primary = MetaLogPrimary::new(Arc::clone(&view), 100);

        // Occupy ten metalog positions so any position in 0..10 is legal.
        for i in 0..10u32 {
            primary.update_storage_progress(10, &[i + 1]).unwrap();
            primary.update_storage_progress(11, &[i + 1]).unwrap();
            primary.mark_next_cut().unwrap().unwrap();
        }

        let mut model: HashMap<u16, u32> =
            (101..101 + replica_count).map(|r| (r, 0)).collect();
        let mut last_replicated = 0;
        for (replica_index, position) in updates {
            let replica = 101 + replica_index % replica_count;
            primary.update_replica_progress(replica, position).unwrap();
            let entry = model.get_mut(&replica).unwrap();
            *entry = (*entry).max(position);

            let mut sorted: Vec<u32> = model.values().copied().collect();
            sorted.sort_unstable();
            let expected = sorted[sorted.len() / 2];
            prop_assert_eq!(primary.replicated_metalog_position(), expected);
            prop_assert!(primary.replicated_metalog_position() >= last_replicated);
            prop_assert!(
                primary.replicated_metalog_position() <= primary.metalog_position()
            );
            last_replicated = primary.replicated_metalog_position();
        }
    }

    /// Property: shard-cut safety. After any interleaving of storage
    /// progress reports and cut attempts, `last_cut[e]` never decreases
    /// and never exceeds the minimum shard progress over the replica set.
    #[test]
    fn shard_cut_safety(
        reports in prop::collection::vec((prop::bool::ANY, 0u32..1000), 1..64),
    ) {
        let view = Arc::new(View::new(quorum_descriptor(0)).unwrap());
        let mut primary = MetaLogPrimary::new(Arc::clone(&view), 100);
        let mut last_cut_seen = 0;
        for (use_first_storage, progress) in reports {
            let storage = if use_first_storage { 10 } else { 11 };
            primary.update_storage_progress(storage, &[progress]).unwrap();
            primary.mark_next_cut().unwrap();

            let last_cut = primary.last_cut(1).unwrap();
            let min_progress = primary
                .shard_progress(1, 10)
                .unwrap()
                .min(primary.shard_progress(1, 11).unwrap());
            prop_assert!(last_cut >= last_cut_seen);
            prop_assert!(last_cut <= min_progress);
            last_cut_seen = last_cut;
        }
    }

    /// Property: end-to-end uniqueness and round-trip. Every append gets
    /// exactly one seqnum; reading it back returns byte-identical data and
    /// the matching tag; the tag index answers prev() at the record's own
    /// seqnum (tag-index completeness).
    #[test]
    fn append_read_roundtrip(
        records in prop::collection::vec((1u64..8, prop::collection::vec(any::<u8>(), 0..64)), 1..40),
        ticks_between in 1usize..4,
    ) {
        let cluster = TestCluster::new(single_node_descriptor());
        let mut appended: Vec<(Tag, Vec<u8>)> = Vec::new();
        for (i, (tag, payload)) in records.iter().enumerate() {
            cluster.append(1, *tag, Bytes::from(payload.clone())).unwrap();
            appended.push((*tag, payload.clone()));
            if i % ticks_between == 0 {
                cluster.tick().unwrap();
            }
        }
        cluster.tick().unwrap();

        let mut seen_local_ids = HashSet::new();
        for (seqnum, (tag, payload)) in appended.iter().enumerate() {
            let results = cluster.read_at(10, seqnum as u64).unwrap();
            prop_assert_eq!(results.len(), 1);
            match &results[0].result {
                ReadResult::Ok(entry) => {
                    prop_assert_eq!(entry.metadata.seqnum, seqnum as u64);
                    prop_assert_eq!(entry.metadata.tag, *tag);
                    prop_assert_eq!(entry.data.as_ref(), payload.as_slice());
                    // Exactly one local id is bound to each seqnum.
                    prop_assert!(seen_local_ids.insert(entry.metadata.local_id));
                }
                other => prop_assert!(false, "read at {} returned {:?}", seqnum, other),
            }
            let engine = cluster.engines[&1].lock();
            prop_assert_eq!(engine.tag_index().prev(*tag, seqnum as u64), Some(seqnum as u64));
        }
    }

    /// Property: storage monotonicity under random flush points. The
    /// persisted watermark only advances, and the live set shrinks under
    /// its cap only for persisted entries.
    #[test]
    fn storage_watermark_monotonic(
        batch_sizes in prop::collection::vec(1u32..8, 1..12),
        cap in 1usize..8,
    ) {
        let mut config = sharedlog::SharedLogConfig::default();
        config.storage_max_live_entries = cap;
        let cluster = TestCluster::with_config(single_node_descriptor(), config);
        let storage = &cluster.storages[&10];

        let mut last_watermark = 0;
        for (round, batch) in batch_sizes.iter().enumerate() {
            for i in 0..*batch {
                cluster
                    .append(1, 1 + u64::from(i % 3), Bytes::from_static(b"x"))
                    .unwrap();
            }
            cluster.tick().unwrap();
            if round % 2 == 0 {
                let handle = storage.current_logspace().unwrap();
                let db = sharedlog::storage::MemoryDb::new();
                sharedlog::storage::flusher::flush_once(&handle, &db).unwrap();
            }
            let handle = storage.current_logspace().unwrap();
            let guard = handle.read();
            prop_assert!(guard.persisted_seqnum_position() >= last_watermark);
            prop_assert!(
                guard.live_entries_len() <= cap.max(
                    (guard.seqnum_position() - guard.persisted_seqnum_position()) as usize
                )
            );
            last_watermark = guard.persisted_seqnum_position();
        }
    }
}
