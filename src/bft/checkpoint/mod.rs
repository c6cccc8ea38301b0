//! Stable checkpoints and log garbage collection.
//!
//! The keeper folds every committed request hash into a running
//! chain, broadcasts a signed `CHECKPOINT` at each water mark, and
//! promotes a `(seq, hash)` pair to the new stable checkpoint once
//! `2f + 1` distinct replicas vouch for it. Its commit-data queue
//! doubles as the silence detector arming the view change.
//!
//! The recovery data exchange also lives here: a replica that fell
//! behind the stable checkpoint asks its peers for the committed
//! requests it is missing, with their commit certificates as proof.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::bft::collections::SenderBitmap;
use crate::bft::communication::channel::{self, ChannelRx, ChannelTx};
use crate::bft::communication::message::{
    CheckpointData, MessageKind, RecoveryMessage, Request, RequestWithProof, SignatureInfo,
    StableCheckpoint,
};
use crate::bft::communication::serialize;
use crate::bft::communication::{self, KeyTable, NetworkNode, NodeId};
use crate::bft::core::server::SystemParams;
use crate::bft::crypto::hash::Digest;
use crate::bft::crypto::signature::KeyPair;
use crate::bft::error::*;
use crate::bft::log::TxnStore;
use crate::bft::metrics::Metrics;
use crate::bft::ordering::SeqNo;

/// Sequence step between two checkpoints.
pub const DEFAULT_WATER_MARK: u64 = 10_000;

// room for ordered requests waiting on the checkpoint thread
const COMMIT_QUEUE_BOUND: usize = 8192;

/// What the gate should do with a processed recovery message.
pub enum RecoveryAction {
    /// Nothing; the message was ours or carried nothing usable.
    Nil,
    /// Answer the querying replica with this message.
    Reply(Request),
    /// Commit these validated requests locally, in order.
    Commit(Vec<Request>),
}

struct ChainState {
    // last sequence folded into the chain; the input is gapless
    last_seq: u64,
    last_ckpt_seq: u64,
    hash: Digest,
}

#[derive(Default)]
struct CkptVotes {
    senders: SenderBitmap,
    signatures: Vec<SignatureInfo>,
}

struct VoteTable {
    table: BTreeMap<(u64, Digest), CkptVotes>,
    new_data: bool,
}

/// Produces, collects and promotes checkpoints.
pub struct CheckpointKeeper {
    params: SystemParams,
    id: NodeId,
    keypair: Option<Arc<KeyPair>>,
    key_table: Arc<KeyTable>,
    network: Arc<dyn NetworkNode>,
    metrics: Arc<Metrics>,
    store: Arc<dyn TxnStore>,
    water_mark: u64,
    // silence tolerated on the commit-data queue before the view
    // change trigger fires
    silence_timeout: Duration,
    quiet: Mutex<Duration>,
    verify_signatures: bool,
    enabled: bool,
    commit_tx: ChannelTx<Request>,
    commit_rx: ChannelRx<Request>,
    chain: Mutex<ChainState>,
    votes: Mutex<VoteTable>,
    votes_cv: Condvar,
    stable: Mutex<StableCheckpoint>,
    stable_seq: AtomicU64,
    // executed seq observed by the last health check probe
    last_probe: AtomicU64,
    timeout_handler: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    stable_listeners: Mutex<Vec<Box<dyn Fn(SeqNo) + Send + Sync>>>,
}

impl CheckpointKeeper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: SystemParams,
        id: NodeId,
        keypair: Option<Arc<KeyPair>>,
        key_table: Arc<KeyTable>,
        network: Arc<dyn NetworkNode>,
        metrics: Arc<Metrics>,
        store: Arc<dyn TxnStore>,
        water_mark: u64,
        silence_timeout: Duration,
        verify_signatures: bool,
        enabled: bool,
    ) -> Self {
        let (commit_tx, commit_rx) = channel::new_bounded(COMMIT_QUEUE_BOUND);
        let genesis = Digest::of(&[]);
        Self {
            params,
            id,
            keypair,
            key_table,
            network,
            metrics,
            store,
            water_mark,
            silence_timeout,
            quiet: Mutex::new(Duration::ZERO),
            verify_signatures,
            enabled,
            commit_tx,
            commit_rx,
            chain: Mutex::new(ChainState {
                last_seq: 0,
                last_ckpt_seq: 0,
                hash: genesis,
            }),
            votes: Mutex::new(VoteTable {
                table: BTreeMap::new(),
                new_data: false,
            }),
            votes_cv: Condvar::new(),
            stable: Mutex::new(StableCheckpoint {
                seq: SeqNo::ZERO,
                hash: genesis,
                signatures: Vec::new(),
            }),
            stable_seq: AtomicU64::new(0),
            last_probe: AtomicU64::new(0),
            timeout_handler: Mutex::new(None),
            stable_listeners: Mutex::new(Vec::new()),
        }
    }

    /// The queue the execution pipeline feeds ordered requests into.
    pub fn commit_sender(&self) -> ChannelTx<Request> {
        self.commit_tx.clone()
    }

    /// The number of ordered requests waiting on the checkpoint
    /// thread.
    pub fn pending_commits(&self) -> usize {
        self.commit_rx.len()
    }

    /// The most recent stable checkpoint sequence, the cluster's low
    /// water mark.
    pub fn stable_checkpoint(&self) -> SeqNo {
        SeqNo::from(self.stable_seq.load(Ordering::Acquire))
    }

    /// The most recent stable checkpoint together with its
    /// `2f + 1` signature proof.
    pub fn stable_checkpoint_with_votes(&self) -> StableCheckpoint {
        self.stable.lock().clone()
    }

    /// The largest committed sequence number.
    pub fn max_txn_seq(&self) -> SeqNo {
        self.store.max_seq()
    }

    /// The last sequence folded into the running hash chain.
    pub fn last_ordered_seq(&self) -> SeqNo {
        SeqNo::from(self.chain.lock().last_seq)
    }

    /// Registers the handler fired when the commit-data queue stays
    /// silent for a whole deadline. The view change arms itself here.
    pub fn set_timeout_handler(&self, handler: Box<dyn Fn() + Send + Sync>) {
        *self.timeout_handler.lock() = Some(handler);
    }

    /// Registers a callback fired with every newly promoted stable
    /// checkpoint sequence.
    pub fn add_stable_listener(&self, listener: Box<dyn Fn(SeqNo) + Send + Sync>) {
        self.stable_listeners.lock().push(listener);
    }

    /// Accepts one committed request.
    ///
    /// With checkpoints disabled the request goes straight to the
    /// committed store.
    pub fn add_commit_data(&self, request: Request) -> Result<()> {
        if !self.enabled {
            self.store.put(request);
            return Ok(());
        }
        self.commit_tx
            .send(request)
            .map_err(|e| e.swap_kind(ErrorKind::Checkpoint))
    }

    /// Drains one request off the commit-data queue, folding it into
    /// the hash chain. Quiet polls accumulate; once the accumulated
    /// silence reaches the configured tolerance, the view change
    /// trigger fires.
    ///
    /// The replica's checkpoint thread loops on this with a short
    /// poll deadline, so shutdown stays prompt.
    pub fn process_commits_once(&self, poll: Duration) -> Result<bool> {
        let request = match self.commit_rx.recv_timeout(poll) {
            Some(r) => r,
            None => {
                let mut quiet = self.quiet.lock();
                *quiet += poll;
                if *quiet >= self.silence_timeout {
                    *quiet = Duration::ZERO;
                    drop(quiet);
                    if let Some(handler) = self.timeout_handler.lock().as_ref() {
                        handler();
                    }
                }
                return Ok(false);
            }
        };
        *self.quiet.lock() = Duration::ZERO;

        let (ckpt, hash) = {
            let mut chain = self.chain.lock();
            let seq = u64::from(request.seq);
            if seq != chain.last_seq + 1 {
                // replays after recovery land here; the chain only
                // moves on the next fresh sequence
                debug!(
                    seq,
                    expected = chain.last_seq + 1,
                    "skipping out-of-chain commit data"
                );
                return Ok(true);
            }
            chain.hash = chain.hash.chain(&request.hash);
            chain.last_seq = seq;
            self.store.put(request);
            if seq == chain.last_ckpt_seq + self.water_mark {
                chain.last_ckpt_seq = seq;
                (seq, Some(chain.hash))
            } else {
                (seq, None)
            }
        };

        if let Some(hash) = hash {
            self.broadcast_checkpoint(SeqNo::from(ckpt), hash)?;
        }
        Ok(true)
    }

    fn broadcast_checkpoint(&self, seq: SeqNo, hash: Digest) -> Result<()> {
        let hash_signature = match &self.keypair {
            Some(kp) => Some(SignatureInfo::ed25519(self.id, kp.sign(hash.as_ref())?)),
            None => None,
        };
        let data = CheckpointData {
            seq,
            hash,
            hash_signature,
        };

        let mut request = Request::new(MessageKind::Checkpoint, self.id);
        request.seq = seq;
        request.hash = hash;
        request.data = serialize::serialize(&data)?;

        debug!(seq = u64::from(seq), "broadcasting checkpoint");
        let targets: SmallVec<[NodeId; 8]> = self.params.replica_ids().collect();
        let wm = communication::wire_message(&request, self.id, self.keypair.as_deref())?;
        self.network.broadcast(wm, &targets[..])
    }

    /// Handles a peer's `CHECKPOINT` message.
    pub fn process_checkpoint(&self, request: &Request) -> Result<()> {
        let data: CheckpointData =
            serialize::deserialize(request.data())?;
        let seq = u64::from(data.seq);
        if seq % self.water_mark != 0 {
            return Err("Checkpoint sequence not at a water mark")
                .wrapped(ErrorKind::Checkpoint);
        }

        if self.verify_signatures {
            let signature = data
                .hash_signature
                .as_ref()
                .ok_or_else(|| Error::simple(ErrorKind::BadSignature))?;
            let key = self
                .key_table
                .get(signature.node_id)
                .ok_or_else(|| Error::simple(ErrorKind::BadSignature))?;
            key.verify(data.hash.as_ref(), &signature.signature)?;
        }

        let mut votes = self.votes.lock();
        let entry = votes.table.entry((seq, data.hash)).or_default();
        if entry.senders.set(request.sender_id) {
            if let Some(signature) = data.hash_signature {
                entry.signatures.push(signature);
            }
            votes.new_data = true;
            self.votes_cv.notify_all();
        }
        Ok(())
    }

    /// Promotes the highest `(seq, hash)` pair holding `2f + 1`
    /// distinct votes to the new stable checkpoint, waiting up to
    /// `timeout` for fresh votes first.
    ///
    /// Returns the newly stable sequence, if it advanced.
    pub fn promote_once(&self, timeout: Duration) -> Result<Option<SeqNo>> {
        let quorum = self.params.quorum();
        let (stable_seq, stable_hash, proof) = {
            let mut votes = self.votes.lock();
            if !votes.new_data {
                self.votes_cv.wait_for(&mut votes, timeout);
            }
            if !votes.new_data {
                return Ok(None);
            }
            votes.new_data = false;

            let mut winner = None;
            for ((seq, hash), v) in votes.table.iter() {
                if v.senders.count() >= quorum {
                    winner = Some((*seq, *hash));
                }
            }
            let (seq, hash) = match winner {
                Some(w) => w,
                None => return Ok(None),
            };
            if seq <= self.stable_seq.load(Ordering::Acquire) {
                return Ok(None);
            }

            let proof = votes
                .table
                .get(&(seq, hash))
                .map(|v| v.signatures.clone())
                .unwrap_or_default();
            // everything at or below the new stable checkpoint is
            // garbage now
            votes.table.retain(|(s, _), _| *s > seq);
            (seq, hash, proof)
        };

        {
            let mut stable = self.stable.lock();
            stable.seq = SeqNo::from(stable_seq);
            stable.hash = stable_hash;
            stable.signatures = proof;
        }
        self.stable_seq.store(stable_seq, Ordering::Release);
        self.metrics.inc_checkpoints_promoted();
        info!(stable_seq, "stable checkpoint advanced");

        for listener in self.stable_listeners.lock().iter() {
            listener(SeqNo::from(stable_seq));
        }
        Ok(Some(SeqNo::from(stable_seq)))
    }

    /// Checks whether `ckpt` really carries `2f + 1` valid
    /// signatures over its hash. The genesis checkpoint passes with
    /// an empty proof.
    pub fn is_valid_proof(&self, ckpt: &StableCheckpoint) -> bool {
        if u64::from(ckpt.seq) == 0 && ckpt.signatures.is_empty() {
            return true;
        }
        let mut senders = SenderBitmap::new();
        for signature in &ckpt.signatures {
            if self.verify_signatures {
                let key = match self.key_table.get(signature.node_id) {
                    Some(k) => k,
                    None => return false,
                };
                if key.verify(ckpt.hash.as_ref(), &signature.signature).is_err() {
                    return false;
                }
            }
            senders.set(signature.node_id);
        }
        senders.count() >= self.params.quorum()
    }

    /// Decides whether this replica needs to catch up, comparing the
    /// executed sequence against the stable checkpoint and against
    /// the progress made since the previous probe.
    ///
    /// Returns the recovery query to broadcast, when catch up is
    /// warranted. The replica's health check thread calls this
    /// periodically.
    pub fn maybe_recovery_query(&self, executed: SeqNo) -> Result<Option<Request>> {
        let executed = u64::from(executed);
        let last = self.last_probe.swap(executed, Ordering::AcqRel);
        let stalled = last != 0 && last == executed;
        let behind = self.stable_seq.load(Ordering::Acquire) > executed;
        if !stalled && !behind {
            return Ok(None);
        }

        warn!(executed, "replica lagging, requesting recovery data");
        let query = RecoveryMessage::Query {
            min_seq: SeqNo::from(executed),
            max_seq: SeqNo::from(executed + self.water_mark),
        };
        let mut request = Request::new(MessageKind::CustomConsensus, self.id);
        request.data = serialize::serialize(&query)?;
        Ok(Some(request))
    }

    /// Handles a `CustomConsensus` recovery message.
    pub fn process_recovery_message(&self, request: &Request) -> Result<RecoveryAction> {
        let message: RecoveryMessage =
            serialize::deserialize(request.data())?;
        match message {
            RecoveryMessage::Query { min_seq, max_seq } => {
                if request.sender_id == self.id {
                    return Ok(RecoveryAction::Nil);
                }
                let requests = self
                    .store
                    .range(min_seq, max_seq)
                    .into_iter()
                    .map(|r| RequestWithProof {
                        seq: r.seq,
                        proofs: r.committed_certs.clone(),
                        request: r,
                    })
                    .collect();
                let data = RecoveryMessage::Data { requests };
                let mut reply = Request::new(MessageKind::CustomConsensus, self.id);
                reply.data = serialize::serialize(&data)?;
                Ok(RecoveryAction::Reply(reply))
            }
            RecoveryMessage::Data { requests } => {
                let mut validated = Vec::new();
                for bundle in requests {
                    if self.validate_recovery_bundle(&bundle) {
                        validated.push(bundle.request);
                    } else {
                        warn!(
                            seq = u64::from(bundle.seq),
                            "discarding recovery bundle with invalid proof"
                        );
                    }
                }
                Ok(RecoveryAction::Commit(validated))
            }
        }
    }

    // A recovery bundle is believable when 2f + 1 distinct replicas
    // signed the request's hash.
    fn validate_recovery_bundle(&self, bundle: &RequestWithProof) -> bool {
        if bundle.request.seq != bundle.seq {
            return false;
        }
        if bundle.proofs.len() < self.params.quorum() {
            return false;
        }
        let mut senders = SenderBitmap::new();
        for proof in &bundle.proofs {
            if !senders.set(proof.node_id) {
                return false;
            }
            if self.verify_signatures {
                let key = match self.key_table.get(proof.node_id) {
                    Some(k) => k,
                    None => return false,
                };
                if key
                    .verify(bundle.request.hash.as_ref(), &proof.signature)
                    .is_err()
                {
                    return false;
                }
            }
        }
        senders.count() >= self.params.quorum()
    }
}
