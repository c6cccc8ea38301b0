//! The three phase commit driving a batch of requests from its
//! proposal to its execution.
//!
//! Each in-flight sequence number is tracked by one
//! [`TransactionCollector`], which counts `PREPARE` and `COMMIT`
//! votes by hash in sender bitmaps and advances a monotonic state
//! machine; [`Commitment`] owns the collector registry and turns
//! quorum transitions into the next protocol step.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use intmap::IntMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::debug;

use crate::bft::collections::{self, HashMap, SenderBitmap};
use crate::bft::communication::message::{
    MessageKind, PreparedCertificate, Request, RequestProof, SignatureInfo,
};
use crate::bft::communication::{self, NetworkNode, NodeId};
use crate::bft::core::server::{SystemInfo, SystemParams};
use crate::bft::crypto::hash::Digest;
use crate::bft::crypto::signature::KeyPair;
use crate::bft::error::*;
use crate::bft::executable::TransactionPipeline;
use crate::bft::metrics::Metrics;
use crate::bft::ordering::SeqNo;

/// The lifecycle of a [`TransactionCollector`].
///
/// The state only moves forward, and `Executed` is terminal.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
#[repr(u8)]
pub enum TransactionState {
    None = 0,
    ReadyPrepare = 1,
    ReadyCommit = 2,
    ReadyExecute = 3,
    Executed = 4,
}

impl TransactionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TransactionState::None,
            1 => TransactionState::ReadyPrepare,
            2 => TransactionState::ReadyCommit,
            3 => TransactionState::ReadyExecute,
            _ => TransactionState::Executed,
        }
    }
}

/// A protocol message paired with the envelope signature its sender
/// produced over it, kept as proof material.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub request: Request,
    pub signature: Option<SignatureInfo>,
}

/// What a collector learned from one incoming message.
///
/// More than one field may be set at a time: a late proposal can
/// complete a quorum that was already waiting for it.
#[derive(Default, Debug)]
pub struct CollectorOutcome {
    /// The proposal was accepted into the main slot; the replica
    /// should vote `PREPARE` for it.
    pub accepted_main: Option<Box<Request>>,
    /// A prepare quorum formed on this hash; the replica should vote
    /// `COMMIT` for it.
    pub prepared_hash: Option<Digest>,
    /// A commit quorum formed and the main proposal matches it; the
    /// request is ready to be handed to the execution pipeline.
    pub executed: Option<Box<Request>>,
}

/// Tracks the votes and the proposal of a single sequence number.
pub struct TransactionCollector {
    seq: SeqNo,
    enable_viewchange: bool,
    state: AtomicU8,
    is_prepared: AtomicBool,
    is_committed: AtomicBool,
    inner: Mutex<CollectorInner>,
}

struct CollectorInner {
    // view of the proposal occupying the main slot
    view: SeqNo,
    main: Option<RequestInfo>,
    // alternate proposals seen for this sequence, kept only while a
    // view change may still pick one of them
    other_mains: Vec<RequestInfo>,
    prepare_senders: HashMap<Digest, SenderBitmap>,
    commit_senders: HashMap<Digest, SenderBitmap>,
    prepared_proof: Vec<RequestInfo>,
    commit_certs: Vec<SignatureInfo>,
    committed_hash: Option<Digest>,
}

impl TransactionCollector {
    /// Creates a collector for sequence number `seq`.
    pub fn new(seq: SeqNo, enable_viewchange: bool) -> Self {
        Self {
            seq,
            enable_viewchange,
            state: AtomicU8::new(TransactionState::None as u8),
            is_prepared: AtomicBool::new(false),
            is_committed: AtomicBool::new(false),
            inner: Mutex::new(CollectorInner {
                view: SeqNo::ZERO,
                main: None,
                other_mains: Vec::new(),
                prepare_senders: collections::hash_map(),
                commit_senders: collections::hash_map(),
                prepared_proof: Vec::new(),
                commit_certs: Vec::new(),
                committed_hash: None,
            }),
        }
    }

    /// The sequence number this collector tracks.
    pub fn seq(&self) -> SeqNo {
        self.seq
    }

    /// The current state of the collector's lifecycle.
    pub fn state(&self) -> TransactionState {
        TransactionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether a prepare quorum has formed on the main hash.
    pub fn is_prepared(&self) -> bool {
        self.is_prepared.load(Ordering::Acquire)
    }

    fn cas_state(&self, from: TransactionState, to: TransactionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Offers a proposal for the main slot.
    ///
    /// At most one proposal may occupy the slot; a later proposal
    /// with a strictly higher view replaces an unprepared main, which
    /// is how a view change primary re-proposes in-flight sequences.
    pub fn add_main(&self, info: RequestInfo, quorum: usize) -> Result<CollectorOutcome> {
        if self.is_committed.load(Ordering::Acquire)
            || self.state() == TransactionState::Executed
        {
            return Err(Error::simple(ErrorKind::StateViolation));
        }
        if info.request.seq != self.seq {
            return Err("Proposal sequence mismatch").wrapped(ErrorKind::Consensus);
        }

        let mut inner = self.inner.lock();
        if let Some(committed) = inner.committed_hash {
            if info.request.hash != committed {
                return Err("Proposal hash mismatches the committed certificates")
                    .wrapped(ErrorKind::QuorumFailure);
            }
        }

        let force = inner.main.is_some()
            && inner.view < info.request.view
            && !self.is_prepared();
        if force {
            let old = inner.main.take();
            inner.other_mains.extend(old);
        }
        if inner.main.is_some() {
            // an equivocating proposal; remember it for a possible
            // view change, but never let it vote twice
            inner.other_mains.push(info);
            return Ok(CollectorOutcome::default());
        }

        inner.view = info.request.view;
        let accepted = Box::new(info.request.clone());
        inner.main = Some(info);
        if force {
            self.state
                .store(TransactionState::ReadyPrepare as u8, Ordering::Release);
        } else {
            self.cas_state(TransactionState::None, TransactionState::ReadyPrepare);
        }

        let mut outcome = self.advance(&mut inner, quorum);
        outcome.accepted_main = Some(accepted);
        Ok(outcome)
    }

    /// Counts a `PREPARE` vote.
    pub fn add_prepare_vote(&self, info: RequestInfo, quorum: usize) -> Result<CollectorOutcome> {
        if self.is_committed.load(Ordering::Acquire)
            || self.state() == TransactionState::Executed
        {
            return Err(Error::simple(ErrorKind::StateViolation));
        }

        let mut inner = self.inner.lock();
        if self.enable_viewchange
            && !self.is_prepared()
            && self.state() <= TransactionState::ReadyPrepare
        {
            inner.prepared_proof.push(info.clone());
        }
        let hash = info.request.hash;
        let sender = info.request.sender_id;
        let entry = inner
            .prepare_senders
            .entry(hash)
            .or_insert_with(SenderBitmap::new);
        if !entry.set(sender) {
            return Err(Error::simple(ErrorKind::DuplicateVote));
        }

        Ok(self.advance(&mut inner, quorum))
    }

    /// Counts a `COMMIT` vote, accumulating its QC share if one was
    /// attached.
    pub fn add_commit_vote(&self, info: RequestInfo, quorum: usize) -> Result<CollectorOutcome> {
        if self.is_committed.load(Ordering::Acquire)
            || self.state() == TransactionState::Executed
        {
            return Err(Error::simple(ErrorKind::StateViolation));
        }

        let mut inner = self.inner.lock();
        if let Some(share) = info.request.data_signature {
            inner.commit_certs.push(share);
        }
        let hash = info.request.hash;
        let sender = info.request.sender_id;
        let entry = inner
            .commit_senders
            .entry(hash)
            .or_insert_with(SenderBitmap::new);
        if !entry.set(sender) {
            return Err(Error::simple(ErrorKind::DuplicateVote));
        }

        Ok(self.advance(&mut inner, quorum))
    }

    // Attempts every state transition the accumulated votes allow.
    //
    // A single incoming message can unlock more than one transition,
    // e.g. a late proposal arriving after both quorums formed.
    fn advance(&self, inner: &mut CollectorInner, quorum: usize) -> CollectorOutcome {
        let mut outcome = CollectorOutcome::default();
        loop {
            match self.state() {
                TransactionState::ReadyPrepare => {
                    let quorum_hash = inner
                        .prepare_senders
                        .iter()
                        .find(|(_, votes)| votes.count() >= quorum)
                        .map(|(hash, _)| *hash);
                    let hash = match quorum_hash {
                        Some(h) => h,
                        None => break,
                    };
                    if !self.cas_state(
                        TransactionState::ReadyPrepare,
                        TransactionState::ReadyCommit,
                    ) {
                        break;
                    }
                    self.is_prepared.store(true, Ordering::Release);
                    self.adopt_main_for(inner, hash);
                    inner.prepared_proof.retain(|p| p.request.hash == hash);
                    outcome.prepared_hash = Some(hash);
                }
                TransactionState::ReadyCommit => {
                    let quorum_hash = inner
                        .commit_senders
                        .iter()
                        .find(|(_, votes)| votes.count() >= quorum)
                        .map(|(hash, _)| *hash);
                    let hash = match quorum_hash {
                        Some(h) => h,
                        None => break,
                    };
                    if !self.cas_state(
                        TransactionState::ReadyCommit,
                        TransactionState::ReadyExecute,
                    ) {
                        break;
                    }
                    inner.committed_hash = Some(hash);
                }
                TransactionState::ReadyExecute => {
                    match self.try_commit(inner) {
                        Some(request) => outcome.executed = Some(request),
                        None => break,
                    }
                }
                _ => break,
            }
        }
        outcome
    }

    // Swaps the main slot to the proposal matching `hash`, dropping
    // any equivocating alternates.
    fn adopt_main_for(&self, inner: &mut CollectorInner, hash: Digest) {
        let main_matches = inner
            .main
            .as_ref()
            .map(|m| m.request.hash == hash)
            .unwrap_or(false);
        if main_matches {
            inner.other_mains.clear();
            return;
        }
        if inner.main.take().is_some() || !inner.other_mains.is_empty() {
            if let Some(pos) = inner
                .other_mains
                .iter()
                .position(|info| info.request.hash == hash)
            {
                inner.main = Some(inner.other_mains.swap_remove(pos));
            }
            inner.other_mains.clear();
        }
    }

    // Final transition: `ReadyExecute -> Executed`, possible only
    // when the main proposal matches the committed hash. Attaches the
    // accumulated commit certificates to the outgoing request.
    fn try_commit(&self, inner: &mut CollectorInner) -> Option<Box<Request>> {
        let committed = inner.committed_hash?;
        let matches = inner
            .main
            .as_ref()
            .map(|m| m.request.hash == committed)
            .unwrap_or(false);
        if !matches {
            return None;
        }
        if !self.cas_state(TransactionState::ReadyExecute, TransactionState::Executed) {
            return None;
        }
        self.is_committed.store(true, Ordering::Release);
        let main = inner.main.as_ref()?;
        let mut request = main.request.clone();
        request.committed_certs = inner.commit_certs.clone();
        Some(Box::new(request))
    }

    /// The `2f + 1` prepare proofs gathered for this sequence, once
    /// it prepared.
    pub fn prepared_certificate(&self) -> Option<PreparedCertificate> {
        if !self.is_prepared() {
            return None;
        }
        let inner = self.inner.lock();
        Some(PreparedCertificate {
            seq: self.seq,
            proofs: inner
                .prepared_proof
                .iter()
                .map(|info| RequestProof {
                    request: info.request.clone(),
                    signature: info.signature,
                })
                .collect(),
        })
    }
}

/// Drives the `PRE-PREPARE -> PREPARE -> COMMIT` exchange and owns
/// every in-flight [`TransactionCollector`].
pub struct Commitment {
    params: SystemParams,
    id: NodeId,
    system_info: Arc<SystemInfo>,
    keypair: Option<Arc<KeyPair>>,
    network: Arc<dyn NetworkNode>,
    pipeline: Arc<TransactionPipeline>,
    metrics: Arc<Metrics>,
    enable_viewchange: bool,
    need_commit_qc: AtomicBool,
    // the next sequence number this replica assigns when primary
    next_seq: AtomicU64,
    stable_seq: AtomicU64,
    collectors: Mutex<IntMap<Arc<TransactionCollector>>>,
}

impl Commitment {
    pub fn new(
        params: SystemParams,
        id: NodeId,
        system_info: Arc<SystemInfo>,
        keypair: Option<Arc<KeyPair>>,
        network: Arc<dyn NetworkNode>,
        pipeline: Arc<TransactionPipeline>,
        metrics: Arc<Metrics>,
        enable_viewchange: bool,
    ) -> Self {
        Self {
            params,
            id,
            system_info,
            keypair,
            network,
            pipeline,
            metrics,
            enable_viewchange,
            need_commit_qc: AtomicBool::new(false),
            next_seq: AtomicU64::new(1),
            stable_seq: AtomicU64::new(0),
            collectors: Mutex::new(IntMap::new()),
        }
    }

    /// Requests that `COMMIT` votes carry a signature share over the
    /// batch hash, accumulated into a commit certificate.
    pub fn set_need_commit_qc(&self, need_qc: bool) {
        self.need_commit_qc.store(need_qc, Ordering::Release);
    }

    /// Overrides the next sequence number assigned by the primary,
    /// used when a new view is installed.
    pub fn set_next_seq(&self, seq: SeqNo) {
        self.next_seq.store(u64::from(seq), Ordering::Release);
    }

    /// The state of the collector at `seq`, if one exists.
    pub fn collector_state(&self, seq: SeqNo) -> Option<TransactionState> {
        self.collectors
            .lock()
            .get(u64::from(seq))
            .map(|c| c.state())
    }

    /// The prepare proofs of the collector at `seq`, if it prepared.
    pub fn prepared_certificate(&self, seq: SeqNo) -> Option<PreparedCertificate> {
        let collector = self.collectors.lock().get(u64::from(seq)).cloned()?;
        collector.prepared_certificate()
    }

    /// Destroys every collector at or below the new stable
    /// checkpoint; votes for them can never matter again.
    pub fn evict_below(&self, stable: SeqNo) {
        let stable = u64::from(stable);
        let old = self.stable_seq.swap(stable, Ordering::AcqRel);
        let mut collectors = self.collectors.lock();
        for seq in old.saturating_add(1)..=stable {
            collectors.remove(seq);
        }
    }

    fn collector(&self, seq: SeqNo) -> Result<Arc<TransactionCollector>> {
        if u64::from(seq) <= self.stable_seq.load(Ordering::Acquire) {
            return Err(Error::simple(ErrorKind::StaleMessage));
        }
        let mut collectors = self.collectors.lock();
        if let Some(c) = collectors.get(u64::from(seq)) {
            return Ok(c.clone());
        }
        let c = Arc::new(TransactionCollector::new(seq, self.enable_viewchange));
        collectors.insert(u64::from(seq), c.clone());
        Ok(c)
    }

    fn replicas(&self) -> SmallVec<[NodeId; 8]> {
        self.params.replica_ids().collect()
    }

    fn broadcast(&self, request: &Request) -> Result<()> {
        let wm = communication::wire_message(request, self.id, self.keypair.as_deref())?;
        self.network.broadcast(wm, &self.replicas()[..])
    }

    /// Handles a batch of client requests forwarded by a proxy.
    ///
    /// Only the primary originates a proposal from it; any other
    /// replica forwards the batch along.
    pub fn process_new_txns(&self, request: Request) -> Result<()> {
        let view = self.system_info.view();
        let primary = self.params.leader(view);
        if self.id != primary {
            let wm = communication::wire_message(&request, self.id, self.keypair.as_deref())?;
            if let Err(err) = self.network.send(wm, primary) {
                self.metrics.inc_peers_unreachable();
                debug!(?primary, "failed to forward batch to primary: {}", err);
            }
            return Ok(());
        }

        let seq = SeqNo::from(self.next_seq.fetch_add(1, Ordering::AcqRel));
        let mut proposal = Request::new(MessageKind::PrePrepare, self.id);
        proposal.view = view;
        proposal.seq = seq;
        proposal.hash = request.hash;
        proposal.data = request.data;
        self.broadcast(&proposal)
    }

    /// Handles a `PRE-PREPARE`: fills the collector's main slot and
    /// votes `PREPARE` on the proposal.
    pub fn process_propose(
        &self,
        request: Request,
        signature: Option<SignatureInfo>,
    ) -> Result<()> {
        let view = self.system_info.view();
        if request.view < view {
            return Err(Error::simple(ErrorKind::StaleMessage));
        }
        if request.sender_id != self.params.leader(request.view) {
            return Err("Proposal not originated by the view's primary")
                .wrapped(ErrorKind::Consensus);
        }

        let collector = self.collector(request.seq)?;
        let outcome = collector.add_main(
            RequestInfo {
                request,
                signature,
            },
            self.params.quorum(),
        )?;
        self.apply(collector.seq(), outcome)
    }

    /// Handles a `PREPARE` vote.
    pub fn process_prepare(
        &self,
        request: Request,
        signature: Option<SignatureInfo>,
    ) -> Result<()> {
        let collector = self.collector(request.seq)?;
        let outcome = collector.add_prepare_vote(
            RequestInfo {
                request,
                signature,
            },
            self.params.quorum(),
        )?;
        self.metrics.inc_votes_counted();
        self.apply(collector.seq(), outcome)
    }

    /// Handles a `COMMIT` vote.
    pub fn process_commit(
        &self,
        request: Request,
        signature: Option<SignatureInfo>,
    ) -> Result<()> {
        let collector = self.collector(request.seq)?;
        let outcome = collector.add_commit_vote(
            RequestInfo {
                request,
                signature,
            },
            self.params.quorum(),
        )?;
        self.metrics.inc_votes_counted();
        self.apply(collector.seq(), outcome)
    }

    // Turns a collector transition into the next protocol step.
    fn apply(&self, seq: SeqNo, outcome: CollectorOutcome) -> Result<()> {
        if let Some(main) = outcome.accepted_main {
            self.metrics.inc_proposals_accepted();
            let main = *main;
            let mut prepare = Request::new(MessageKind::Prepare, self.id);
            prepare.view = main.view;
            prepare.seq = main.seq;
            prepare.hash = main.hash;
            prepare.data = main.data;
            self.broadcast(&prepare)?;
        }
        if let Some(hash) = outcome.prepared_hash {
            debug!(seq = u64::from(seq), "prepared");
            let mut commit = Request::new(MessageKind::Commit, self.id);
            commit.view = self.system_info.view();
            commit.seq = seq;
            commit.hash = hash;
            if self.need_commit_qc.load(Ordering::Acquire) {
                if let Some(keypair) = &self.keypair {
                    let share = keypair.sign(hash.as_ref())?;
                    commit.data_signature = Some(SignatureInfo::ed25519(self.id, share));
                }
            }
            self.broadcast(&commit)?;
        }
        if let Some(request) = outcome.executed {
            debug!(seq = u64::from(seq), "committed, handing off to execution");
            // a failed handoff is fatal: the replica must restart and
            // recover from its write-ahead log
            self.pipeline
                .commit(*request)
                .map_err(|e| e.swap_kind(ErrorKind::DurabilityFailure))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
