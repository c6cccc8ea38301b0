use std::sync::Arc;

use parking_lot::Mutex;

use super::*;
use crate::bft::communication::message::{BatchRequest, MessageKind, Request, WireMessage};
use crate::bft::communication::serialize;
use crate::bft::communication::{NetworkNode, NodeId};
use crate::bft::core::server::{SystemInfo, SystemParams};
use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;
use crate::bft::executable::{TransactionExecutor, TransactionPipeline};
use crate::bft::metrics::Metrics;
use crate::bft::ordering::{Orderable, SeqNo};

struct CaptureNetwork {
    sent: Mutex<Vec<(Option<NodeId>, Request)>>,
}

impl CaptureNetwork {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
        })
    }

    fn broadcasts_of(&self, kind: MessageKind) -> Vec<Request> {
        self.sent
            .lock()
            .iter()
            .filter(|(target, req)| target.is_none() && req.kind() == kind)
            .map(|(_, req)| req.clone())
            .collect()
    }

    fn sends_to(&self, node: NodeId) -> Vec<Request> {
        self.sent
            .lock()
            .iter()
            .filter(|(target, _)| *target == Some(node))
            .map(|(_, req)| req.clone())
            .collect()
    }
}

impl NetworkNode for CaptureNetwork {
    fn send(&self, message: WireMessage, target: NodeId) -> Result<()> {
        let request = serialize::deserialize_request(message.payload())?;
        self.sent.lock().push((Some(target), request));
        Ok(())
    }

    fn broadcast(&self, message: WireMessage, _targets: &[NodeId]) -> Result<()> {
        let request = serialize::deserialize_request(message.payload())?;
        self.sent.lock().push((None, request));
        Ok(())
    }
}

struct NullExecutor;

impl TransactionExecutor for NullExecutor {
    fn execute_batch(
        &self,
        _batch: BatchRequest,
    ) -> Result<Option<crate::bft::communication::message::BatchResponse>> {
        Ok(None)
    }
}

fn params() -> SystemParams {
    SystemParams::from_n(4).unwrap()
}

fn commitment(id: u32, net: Arc<CaptureNetwork>) -> (Commitment, Arc<TransactionPipeline>) {
    let metrics = Arc::new(Metrics::new());
    let pipeline = Arc::new(TransactionPipeline::new(Arc::new(NullExecutor), metrics.clone()));
    let system_info = Arc::new(SystemInfo::new(SeqNo::ONE, NodeId::from(1u32)));
    let commitment = Commitment::new(
        params(),
        NodeId::from(id),
        system_info,
        None,
        net,
        pipeline.clone(),
        metrics,
        true,
    );
    (commitment, pipeline)
}

fn proposal(seq: u64, view: u64, data: &[u8]) -> Request {
    let mut req = Request::new(MessageKind::PrePrepare, NodeId::from(((view - 1) % 4 + 1) as u32));
    req.view = SeqNo::from(view);
    req.seq = SeqNo::from(seq);
    req.data = data.to_vec();
    req.hash = Digest::of(data);
    req
}

fn vote(kind: MessageKind, seq: u64, sender: u32, hash: Digest) -> Request {
    let mut req = Request::new(kind, NodeId::from(sender));
    req.view = SeqNo::ONE;
    req.seq = SeqNo::from(seq);
    req.hash = hash;
    req
}

fn info(request: Request) -> RequestInfo {
    RequestInfo {
        request,
        signature: None,
    }
}

#[test]
fn test_collector_walks_the_full_state_machine() {
    let collector = TransactionCollector::new(SeqNo::ONE, true);
    assert_eq!(collector.state(), TransactionState::None);

    let outcome = collector.add_main(info(proposal(1, 1, b"batch")), 3).unwrap();
    assert!(outcome.accepted_main.is_some());
    assert_eq!(collector.state(), TransactionState::ReadyPrepare);

    let hash = Digest::of(b"batch");
    for sender in 1..=2u32 {
        let outcome = collector
            .add_prepare_vote(info(vote(MessageKind::Prepare, 1, sender, hash)), 3)
            .unwrap();
        assert!(outcome.prepared_hash.is_none());
    }
    let outcome = collector
        .add_prepare_vote(info(vote(MessageKind::Prepare, 1, 3, hash)), 3)
        .unwrap();
    assert_eq!(outcome.prepared_hash, Some(hash));
    assert_eq!(collector.state(), TransactionState::ReadyCommit);
    assert!(collector.is_prepared());

    for sender in 1..=2u32 {
        collector
            .add_commit_vote(info(vote(MessageKind::Commit, 1, sender, hash)), 3)
            .unwrap();
    }
    let outcome = collector
        .add_commit_vote(info(vote(MessageKind::Commit, 1, 3, hash)), 3)
        .unwrap();
    let executed = outcome.executed.expect("commit quorum must execute");
    assert_eq!(executed.data(), b"batch");
    assert_eq!(collector.state(), TransactionState::Executed);
}

#[test]
fn test_collector_counts_equivocating_sender_once() {
    let collector = TransactionCollector::new(SeqNo::ONE, false);
    let hash = Digest::of(b"x");
    collector
        .add_prepare_vote(info(vote(MessageKind::Prepare, 1, 2, hash)), 3)
        .unwrap();
    let dup = collector.add_prepare_vote(info(vote(MessageKind::Prepare, 1, 2, hash)), 3);
    assert_eq!(dup.unwrap_err().kind(), ErrorKind::DuplicateVote);
}

#[test]
fn test_equivocating_proposals_never_reach_quorum() {
    // a primary sending two different proposals at (v=1, s=1) splits
    // the vote two against two: no hash gathers 2f + 1
    let collector = TransactionCollector::new(SeqNo::ONE, true);
    let a = Digest::of(b"batch-a");
    let b = Digest::of(b"batch-b");

    collector.add_main(info(proposal(1, 1, b"batch-a")), 3).unwrap();
    let second = collector.add_main(info(proposal(1, 1, b"batch-b")), 3).unwrap();
    assert!(second.accepted_main.is_none());

    for sender in [1u32, 2] {
        collector
            .add_prepare_vote(info(vote(MessageKind::Prepare, 1, sender, a)), 3)
            .unwrap();
    }
    for sender in [3u32, 4] {
        collector
            .add_prepare_vote(info(vote(MessageKind::Prepare, 1, sender, b)), 3)
            .unwrap();
    }
    assert_eq!(collector.state(), TransactionState::ReadyPrepare);
    assert!(!collector.is_prepared());
}

#[test]
fn test_higher_view_replaces_unprepared_main() {
    let collector = TransactionCollector::new(SeqNo::ONE, true);
    collector.add_main(info(proposal(1, 1, b"old")), 3).unwrap();

    // the view change primary re-proposes with a fresh view
    let outcome = collector.add_main(info(proposal(1, 2, b"new")), 3).unwrap();
    let accepted = outcome.accepted_main.expect("higher view must replace the main");
    assert_eq!(accepted.data(), b"new");

    let hash = Digest::of(b"new");
    for sender in 1..=3u32 {
        collector
            .add_prepare_vote(info(vote(MessageKind::Prepare, 1, sender, hash)), 3)
            .unwrap();
    }
    assert!(collector.is_prepared());
}

#[test]
fn test_votes_buffered_before_the_proposal_arrives() {
    let collector = TransactionCollector::new(SeqNo::ONE, false);
    let hash = Digest::of(b"late");

    for sender in 1..=3u32 {
        collector
            .add_prepare_vote(info(vote(MessageKind::Prepare, 1, sender, hash)), 3)
            .unwrap();
    }
    for sender in 1..=3u32 {
        collector
            .add_commit_vote(info(vote(MessageKind::Commit, 1, sender, hash)), 3)
            .unwrap();
    }
    // both quorums formed without the proposal
    assert_eq!(collector.state(), TransactionState::ReadyExecute);

    let outcome = collector.add_main(info(proposal(1, 1, b"late")), 3).unwrap();
    let executed = outcome.executed.expect("late main completes the commit");
    assert_eq!(executed.data(), b"late");
    assert_eq!(collector.state(), TransactionState::Executed);
}

#[test]
fn test_executed_collector_drops_everything() {
    let collector = TransactionCollector::new(SeqNo::ONE, false);
    let hash = Digest::of(b"done");
    collector.add_main(info(proposal(1, 1, b"done")), 3).unwrap();
    for sender in 1..=3u32 {
        collector
            .add_prepare_vote(info(vote(MessageKind::Prepare, 1, sender, hash)), 3)
            .unwrap();
        collector
            .add_commit_vote(info(vote(MessageKind::Commit, 1, sender, hash)), 3)
            .unwrap();
    }
    assert_eq!(collector.state(), TransactionState::Executed);

    let err = collector.add_main(info(proposal(1, 1, b"done")), 3).map(|_| ());
    assert!(err.is_err());
}

#[test]
fn test_prepared_certificate_filters_to_the_quorum_hash() {
    let collector = TransactionCollector::new(SeqNo::ONE, true);
    let good = Digest::of(b"good");
    let bad = Digest::of(b"bad");
    collector.add_main(info(proposal(1, 1, b"good")), 3).unwrap();
    collector
        .add_prepare_vote(info(vote(MessageKind::Prepare, 1, 4, bad)), 3)
        .unwrap();
    for sender in 1..=3u32 {
        collector
            .add_prepare_vote(info(vote(MessageKind::Prepare, 1, sender, good)), 3)
            .unwrap();
    }
    let cert = collector.prepared_certificate().unwrap();
    assert!(cert.proofs.len() >= 3);
    assert!(cert.proofs.iter().all(|p| *p.request.hash() == good));
}

#[test]
fn test_commitment_votes_and_hands_off() {
    let net = CaptureNetwork::new();
    let (commitment, pipeline) = commitment(2, net.clone());

    commitment
        .process_propose(proposal(1, 1, b"payload"), None)
        .unwrap();
    let prepares = net.broadcasts_of(MessageKind::Prepare);
    assert_eq!(prepares.len(), 1);
    assert_eq!(prepares[0].data(), b"payload");

    let hash = Digest::of(b"payload");
    for sender in 1..=3u32 {
        commitment
            .process_prepare(vote(MessageKind::Prepare, 1, sender, hash), None)
            .unwrap();
    }
    assert_eq!(net.broadcasts_of(MessageKind::Commit).len(), 1);

    for sender in 1..=3u32 {
        commitment
            .process_commit(vote(MessageKind::Commit, 1, sender, hash), None)
            .unwrap();
    }
    assert_eq!(u64::from(pipeline.max_pending_executed_seq()), 1);
}

#[test]
fn test_commitment_rejects_proposals_not_from_the_primary() {
    let net = CaptureNetwork::new();
    let (commitment, _) = commitment(2, net.clone());

    let mut bogus = proposal(1, 1, b"payload");
    bogus.sender_id = NodeId::from(3u32);
    assert!(commitment.process_propose(bogus, None).is_err());
    assert!(net.broadcasts_of(MessageKind::Prepare).is_empty());
}

#[test]
fn test_new_txns_forwarded_to_the_primary() {
    let net = CaptureNetwork::new();
    // replica 2 is not the primary of view 1
    let (commitment, _) = commitment(2, net.clone());

    let mut batch = Request::new(MessageKind::NewTxns, NodeId::from(2u32));
    batch.data = b"batch".to_vec();
    batch.hash = Digest::of(b"batch");
    commitment.process_new_txns(batch).unwrap();

    let forwarded = net.sends_to(NodeId::from(1u32));
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].kind(), MessageKind::NewTxns);
}

#[test]
fn test_primary_assigns_increasing_sequences() {
    let net = CaptureNetwork::new();
    let (commitment, _) = commitment(1, net.clone());

    for _ in 0..2 {
        let mut batch = Request::new(MessageKind::NewTxns, NodeId::from(1u32));
        batch.data = b"batch".to_vec();
        batch.hash = Digest::of(b"batch");
        commitment.process_new_txns(batch).unwrap();
    }
    let proposals = net.broadcasts_of(MessageKind::PrePrepare);
    let seqs: Vec<u64> = proposals
        .iter()
        .map(|p| u64::from(p.sequence_number()))
        .collect();
    assert_eq!(seqs, vec![1, 2]);
}

#[test]
fn test_eviction_below_the_stable_checkpoint() {
    let net = CaptureNetwork::new();
    let (commitment, _) = commitment(2, net);

    commitment.process_propose(proposal(1, 1, b"a"), None).unwrap();
    assert!(commitment.collector_state(SeqNo::ONE).is_some());

    commitment.evict_below(SeqNo::from(5));
    assert!(commitment.collector_state(SeqNo::ONE).is_none());

    let err = commitment
        .process_prepare(vote(MessageKind::Prepare, 1, 2, Digest::of(b"a")), None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StaleMessage);
}
