//! Metalog replication across backup sequencers

mod common;

use bytes::Bytes;
use common::*;
use sharedlog::storage::ReadResult;

#[test]
fn test_cut_commits_through_replica_quorum() {
    // Three backup sequencers replicate the metalog; the synchronous
    // harness acks all of them, so the cut commits within the tick.
    let cluster = TestCluster::new(replicated_metalog_descriptor());
    cluster.append(1, 5, Bytes::from_static(b"payload")).unwrap();
    cluster.tick().unwrap();

    let results = cluster.read_at(10, 0).unwrap();
    match &results[0].result {
        ReadResult::Ok(entry) => assert_eq!(entry.data.as_ref(), b"payload"),
        other => panic!("unexpected read result: {other:?}"),
    }

    // Every backup reached the committed position.
    for backup in cluster.backups.values() {
        assert!(backup.current_view().is_some());
    }
    assert_eq!(cluster.committed_metalogs.lock().len(), 1);
}

#[test]
fn test_two_engine_shards_cut_in_engine_order() {
    let descriptor = two_engine_descriptor(1, 0);
    let cluster = TestCluster::new(descriptor);
    let tag1 = tag_routed_to(&cluster.view, 1);
    let tag2 = tag_routed_to(&cluster.view, 2);

    cluster.append(2, tag2, Bytes::from_static(b"b0")).unwrap();
    cluster.append(1, tag1, Bytes::from_static(b"a0")).unwrap();
    cluster.append(2, tag2, Bytes::from_static(b"b1")).unwrap();
    cluster.tick().unwrap();

    // Engine-id order: engine 1's single record takes seqnum 0, engine 2's
    // two records take 1 and 2.
    let read = |seqnum| match &cluster.read_at(10, seqnum).unwrap()[0].result {
        ReadResult::Ok(entry) => (entry.metadata.tag, entry.data.clone()),
        other => panic!("unexpected read result: {other:?}"),
    };
    assert_eq!(read(0), (tag1, Bytes::from_static(b"a0")));
    assert_eq!(read(1), (tag2, Bytes::from_static(b"b0")));
    assert_eq!(read(2), (tag2, Bytes::from_static(b"b1")));

    // Tag vecs flowed across engines: engine 1 can answer queries for
    // engine 2's tag.
    assert_eq!(cluster.engines[&1].lock().tag_index().prev(tag2, 2), Some(2));
    assert_eq!(cluster.engines[&2].lock().tag_index().prev(tag1, 2), Some(0));
}

#[test]
fn test_backup_engines_hold_peer_bodies() {
    let cluster = TestCluster::new(two_engine_descriptor(1, 0));
    let tag1 = tag_routed_to(&cluster.view, 1);

    cluster.append(1, tag1, Bytes::from_static(b"x")).unwrap();
    // Engine 2 backs engine 1 and holds the pending body.
    assert_eq!(cluster.engines[&2].lock().log_progress(1), Some(1));

    cluster.tick().unwrap();
    // After the cut, the backup's copy is persisted under the seqnum too.
    assert!(cluster.engines[&2].lock().persisted_entry(0).is_some());
}
