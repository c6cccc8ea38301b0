use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::*;
use crate::bft::collections;
use crate::bft::communication::channel::{self, ChannelRx};
use crate::bft::communication::message::{
    BatchRequest, BatchResponse, MessageKind, QueryData, QueryResponse, ReplicaStateData,
    Request, WireMessage,
};
use crate::bft::communication::serialize;
use crate::bft::communication::{LoopbackNetwork, NodeId};
use crate::bft::crypto::hash::Digest;
use crate::bft::crypto::signature::KeyPair;
use crate::bft::error::*;
use crate::bft::executable::TransactionExecutor;
use crate::bft::log::{MemoryLog, TxnStore};
use crate::bft::ordering::{Orderable, SeqNo};
use crate::bft::response::ClientReplier;

const TICK: Duration = Duration::from_millis(1);

struct EchoExecutor {
    executed: Mutex<Vec<u64>>,
}

impl EchoExecutor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            executed: Mutex::new(Vec::new()),
        })
    }
}

impl TransactionExecutor for EchoExecutor {
    fn execute_batch(&self, batch: BatchRequest) -> Result<Option<BatchResponse>> {
        self.executed.lock().push(u64::from(batch.seq));
        let responses = batch
            .client_requests
            .iter()
            .map(|entry| entry.data.clone())
            .collect();
        Ok(Some(BatchResponse {
            responses,
            ..Default::default()
        }))
    }
}

struct RecordingReplier {
    delivered: Mutex<Vec<(NodeId, u64, BatchResponse)>>,
}

impl RecordingReplier {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            delivered: Mutex::new(Vec::new()),
        })
    }
}

impl ClientReplier for RecordingReplier {
    fn reply(&self, proxy_id: NodeId, local_id: u64, response: BatchResponse) -> Result<()> {
        self.delivered.lock().push((proxy_id, local_id, response));
        Ok(())
    }
}

fn keypair(id: u32) -> KeyPair {
    KeyPair::from_bytes(&[id as u8; 32][..]).unwrap()
}

struct TestCluster {
    replicas: Vec<Arc<Replica>>,
    inboxes: Vec<ChannelRx<Vec<u8>>>,
    executors: Vec<Arc<EchoExecutor>>,
    repliers: Vec<Arc<RecordingReplier>>,
    stores: Vec<Arc<MemoryLog>>,
}

impl TestCluster {
    fn replica(&self, id: u32) -> &Arc<Replica> {
        &self.replicas[id as usize - 1]
    }

    // Moves every queued frame and every queued unit of internal
    // work one step forward. Reports whether anything happened.
    fn pump(&self, skip: &[u32]) -> bool {
        let mut progress = false;
        for (i, replica) in self.replicas.iter().enumerate() {
            let id = i as u32 + 1;
            if skip.contains(&id) {
                continue;
            }
            while let Some(frame) = self.inboxes[i].try_recv() {
                replica.on_frame(&frame[..]).unwrap();
                progress = true;
            }
            while replica.checkpoint().pending_commits() > 0 {
                replica.checkpoint().process_commits_once(TICK).unwrap();
                progress = true;
            }
            while replica.pipeline().execute_once(TICK).unwrap() {
                progress = true;
            }
            if replica.checkpoint().promote_once(TICK).unwrap().is_some() {
                progress = true;
            }
        }
        progress
    }

    fn settle(&self, skip: &[u32]) {
        for _ in 0..300 {
            if !self.pump(skip) {
                return;
            }
        }
        panic!("cluster failed to settle");
    }
}

fn build_cluster<F>(signed: bool, tweak: F) -> TestCluster
where
    F: Fn(u32, &mut ReplicaConfig),
{
    let mut peer_txs = collections::hash_map();
    let mut inboxes = Vec::new();
    for id in 1..=4u32 {
        let (tx, rx) = channel::new_bounded(8192);
        peer_txs.insert(NodeId::from(id), tx);
        inboxes.push(rx);
    }
    let network = Arc::new(LoopbackNetwork::new(peer_txs));

    let mut initial_keys = collections::hash_map();
    for id in 1..=4u32 {
        initial_keys.insert(NodeId::from(id), keypair(id).public_key());
    }

    let members: Vec<ReplicaInfo> = (1..=4u32)
        .map(|id| ReplicaInfo {
            id: NodeId::from(id),
            ip: "127.0.0.1".into(),
            port: 20000 + id as u16,
        })
        .collect();

    let mut replicas = Vec::new();
    let mut executors = Vec::new();
    let mut repliers = Vec::new();
    let mut stores = Vec::new();
    for id in 1..=4u32 {
        let mut config = ReplicaConfig {
            self_info: members[id as usize - 1].clone(),
            replicas: members.clone(),
            // tests drive the consensus inline
            worker_num: 0,
            batch_transaction_num: 1,
            batch_flush_timeout_ms: 60_000,
            signature_verifier_enabled: signed,
            heart_beat_enabled: false,
            is_test_mode: true,
            ..Default::default()
        };
        tweak(id, &mut config);

        let executor = EchoExecutor::new();
        let replier = RecordingReplier::new();
        let store = Arc::new(MemoryLog::new());
        let replica = Replica::new(
            config,
            executor.clone(),
            store.clone(),
            network.clone(),
            replier.clone(),
            if signed { Some(keypair(id)) } else { None },
            initial_keys.clone(),
        )
        .unwrap();
        replicas.push(replica);
        executors.push(executor);
        repliers.push(replier);
        stores.push(store);
    }

    TestCluster {
        replicas,
        inboxes,
        executors,
        repliers,
        stores,
    }
}

fn client_request(data: &[u8]) -> Vec<u8> {
    let mut request = Request::new(MessageKind::ClientRequest, NodeId::from(101u32));
    request.data = data.to_vec();
    request.hash = Digest::of(data);
    WireMessage::unsigned(&request).unwrap().to_bytes().unwrap()
}

#[test]
fn test_happy_path_commit_across_the_cluster() {
    let cluster = build_cluster(true, |_, _| {});

    // a client submits "test" through replica 2
    cluster
        .replica(2)
        .on_frame(&client_request(b"test")[..])
        .unwrap();
    cluster.settle(&[]);

    // every replica executed the batch at sequence 1
    for replica in &cluster.replicas {
        assert_eq!(u64::from(replica.pipeline().max_pending_executed_seq()), 1);
    }
    for executor in &cluster.executors {
        assert_eq!(&executor.executed.lock()[..], &[1]);
    }

    // the proxy replied to its client after f + 1 matching responses
    let delivered = cluster.repliers[1].delivered.lock();
    assert_eq!(delivered.len(), 1);
    let (proxy, _, response) = &delivered[0];
    assert_eq!(*proxy, NodeId::from(2u32));
    assert_eq!(&response.responses[..], &[b"test".to_vec()]);
    for (i, replier) in cluster.repliers.iter().enumerate() {
        if i != 1 {
            assert!(replier.delivered.lock().is_empty());
        }
    }
}

#[test]
fn test_gate_drops_frames_with_invalid_signatures() {
    let cluster = build_cluster(true, |_, _| {});
    let replica = cluster.replica(1);

    let mut forged = Request::new(MessageKind::Prepare, NodeId::from(3u32));
    forged.view = SeqNo::ONE;
    forged.seq = SeqNo::ONE;
    forged.hash = Digest::of(b"anything");
    // signed with a key that is not replica 3's
    let wm = WireMessage::signed(&forged, NodeId::from(3u32), &keypair(9)).unwrap();
    replica.on_frame(&wm.to_bytes().unwrap()[..]).unwrap();

    assert_eq!(replica.metrics().bad_signatures(), 1);
    assert!(replica.commitment().collector_state(SeqNo::ONE).is_none());
}

#[test]
fn test_gate_drops_unsigned_replica_traffic() {
    let cluster = build_cluster(true, |_, _| {});
    let replica = cluster.replica(1);

    let mut vote = Request::new(MessageKind::Prepare, NodeId::from(3u32));
    vote.view = SeqNo::ONE;
    vote.seq = SeqNo::ONE;
    vote.hash = Digest::of(b"anything");
    let wm = WireMessage::unsigned(&vote).unwrap();
    replica.on_frame(&wm.to_bytes().unwrap()[..]).unwrap();

    assert_eq!(replica.metrics().bad_signatures(), 1);
}

#[test]
fn test_gate_deduplicates_identical_frames() {
    let cluster = build_cluster(true, |_, _| {});
    let replica = cluster.replica(1);

    let mut vote = Request::new(MessageKind::Prepare, NodeId::from(3u32));
    vote.view = SeqNo::ONE;
    vote.seq = SeqNo::ONE;
    vote.hash = Digest::of(b"something");
    let frame = WireMessage::signed(&vote, NodeId::from(3u32), &keypair(3))
        .unwrap()
        .to_bytes()
        .unwrap();

    replica.on_frame(&frame[..]).unwrap();
    replica.on_frame(&frame[..]).unwrap();
    assert_eq!(replica.metrics().duplicates_dropped(), 1);
}

#[test]
fn test_gate_drops_garbage_frames() {
    let cluster = build_cluster(true, |_, _| {});
    let replica = cluster.replica(1);
    replica.on_frame(b"definitely not a frame").unwrap();
    assert_eq!(replica.metrics().bad_framing(), 1);
}

#[test]
fn test_checkpoint_stabilizes_and_collects_garbage() {
    let cluster = build_cluster(true, |_, config| {
        config.checkpoint_water_mark = 2;
    });

    for payload in [&b"a"[..], b"b", b"c", b"d"] {
        cluster
            .replica(1)
            .on_frame(&client_request(payload)[..])
            .unwrap();
        cluster.settle(&[]);
    }

    for replica in &cluster.replicas {
        assert_eq!(u64::from(replica.pipeline().max_pending_executed_seq()), 4);
        assert_eq!(u64::from(replica.checkpoint().stable_checkpoint()), 4);
        // collectors at or below the stable checkpoint are destroyed
        for seq in 1..=4u64 {
            assert!(replica
                .commitment()
                .collector_state(SeqNo::from(seq))
                .is_none());
        }
    }
    for store in &cluster.stores {
        assert_eq!(u64::from(store.max_seq()), 4);
    }
}

#[test]
fn test_primary_silence_elects_the_next_primary() {
    let cluster = build_cluster(false, |_, config| {
        config.enable_viewchange = true;
        // any quiet poll counts as a full silence deadline
        config.viewchange_commit_timeout_ms = 0;
    });

    // two batches commit under the first primary
    cluster
        .replica(3)
        .on_frame(&client_request(b"one")[..])
        .unwrap();
    cluster.settle(&[]);
    cluster
        .replica(3)
        .on_frame(&client_request(b"two")[..])
        .unwrap();
    cluster.settle(&[]);

    // the primary goes dark; every follower's silence deadline fires
    for id in [2u32, 3, 4] {
        cluster
            .replica(id)
            .checkpoint()
            .process_commits_once(TICK)
            .unwrap();
    }
    cluster.settle(&[1]);

    for id in [2u32, 3, 4] {
        let replica = cluster.replica(id);
        assert_eq!(u64::from(replica.system_info().view()), 2);
        assert_eq!(replica.system_info().primary(), NodeId::from(2u32));
    }

    // the cluster keeps ordering without the old primary
    cluster
        .replica(3)
        .on_frame(&client_request(b"three")[..])
        .unwrap();
    cluster.settle(&[1]);

    for id in [2u32, 3, 4] {
        let replica = cluster.replica(id);
        assert_eq!(u64::from(replica.pipeline().max_pending_executed_seq()), 3);
        // nothing executed twice with a different payload
        assert_eq!(
            &cluster.executors[id as usize - 1].executed.lock()[..],
            &[1, 2, 3]
        );
    }
}

#[test]
fn test_read_only_queries_are_answered_over_the_wire() {
    let cluster = build_cluster(true, |_, _| {});

    // commit one batch so the log has something to look up
    cluster
        .replica(2)
        .on_frame(&client_request(b"lookup me")[..])
        .unwrap();
    cluster.settle(&[]);

    // replica 3 asks replica 1 for the committed requests
    let mut query = Request::new(MessageKind::Query, NodeId::from(3u32));
    query.data = serialize::serialize(&QueryData {
        min_seq: SeqNo::ZERO,
        max_seq: SeqNo::from(10),
    })
    .unwrap();
    query.hash = Digest::of(query.data());
    let frame = WireMessage::signed(&query, NodeId::from(3u32), &keypair(3))
        .unwrap()
        .to_bytes()
        .unwrap();
    cluster.replica(1).on_frame(&frame[..]).unwrap();

    let reply_frame = cluster.inboxes[2]
        .try_recv()
        .expect("the reply must reach the caller");
    let wire = WireMessage::from_bytes(&reply_frame[..]).unwrap();
    let reply = serialize::deserialize_request(wire.payload()).unwrap();
    assert_eq!(reply.kind(), MessageKind::Query);
    assert_eq!(reply.sender_id(), NodeId::from(1u32));
    let response: QueryResponse = serialize::deserialize(reply.data()).unwrap();
    assert_eq!(response.requests.len(), 1);
    assert_eq!(u64::from(response.requests[0].sequence_number()), 1);

    // and for a snapshot of its protocol state
    let state_query = Request::new(MessageKind::ReplicaState, NodeId::from(3u32));
    let frame = WireMessage::signed(&state_query, NodeId::from(3u32), &keypair(3))
        .unwrap()
        .to_bytes()
        .unwrap();
    cluster.replica(1).on_frame(&frame[..]).unwrap();

    let reply_frame = cluster.inboxes[2]
        .try_recv()
        .expect("the state reply must reach the caller");
    let wire = WireMessage::from_bytes(&reply_frame[..]).unwrap();
    let reply = serialize::deserialize_request(wire.payload()).unwrap();
    assert_eq!(reply.kind(), MessageKind::ReplicaState);
    let state: ReplicaStateData = serialize::deserialize(reply.data()).unwrap();
    assert_eq!(u64::from(state.view), 1);
    assert_eq!(state.primary, NodeId::from(1u32));
    assert_eq!(u64::from(state.max_seq), 1);
    assert_eq!(u64::from(state.stable_seq), 0);
}

#[test]
fn test_crash_recovery_replays_the_wal() {
    let wal_dir = tempfile::tempdir().unwrap();
    let wal_path = wal_dir.path().join("log");

    let cluster = build_cluster(false, |id, config| {
        if id == 1 {
            config.recovery_enabled = true;
            config.recovery_path = wal_path.clone();
        }
    });

    cluster
        .replica(1)
        .on_frame(&client_request(b"alpha")[..])
        .unwrap();
    cluster.settle(&[]);
    cluster
        .replica(1)
        .on_frame(&client_request(b"beta")[..])
        .unwrap();
    cluster.settle(&[]);
    assert_eq!(
        u64::from(cluster.replica(1).pipeline().max_pending_executed_seq()),
        2
    );
    let committed_before: Vec<Digest> = (1..=2u64)
        .map(|seq| *cluster.stores[0].get(SeqNo::from(seq)).unwrap().hash())
        .collect();

    // the replica crashes and comes back with empty volatile state
    let mut config = ReplicaConfig {
        self_info: ReplicaInfo {
            id: NodeId::from(1u32),
            ip: "127.0.0.1".into(),
            port: 20001,
        },
        replicas: (1..=4u32)
            .map(|id| ReplicaInfo {
                id: NodeId::from(id),
                ip: "127.0.0.1".into(),
                port: 20000 + id as u16,
            })
            .collect(),
        worker_num: 0,
        signature_verifier_enabled: false,
        recovery_enabled: true,
        recovery_path: wal_path,
        ..Default::default()
    };
    config.is_test_mode = true;

    let executor = EchoExecutor::new();
    let store = Arc::new(MemoryLog::new());
    let reborn = Replica::new(
        config,
        executor.clone(),
        store.clone(),
        Arc::new(LoopbackNetwork::new(collections::hash_map())),
        RecordingReplier::new(),
        None,
        collections::hash_map(),
    )
    .unwrap();

    reborn.recover().unwrap();
    assert_eq!(u64::from(reborn.pipeline().max_pending_executed_seq()), 2);
    assert_eq!(&executor.executed.lock()[..], &[1, 2]);

    // drain the recovered pipeline into the committed store
    while reborn.checkpoint().pending_commits() > 0 {
        reborn.checkpoint().process_commits_once(TICK).unwrap();
    }
    let committed_after: Vec<Digest> = (1..=2u64)
        .map(|seq| *store.get(SeqNo::from(seq)).unwrap().hash())
        .collect();
    assert_eq!(committed_before, committed_after);
}
