//! The view change sub-protocol.
//!
//! When the checkpoint keeper's silence timer fires, the replica
//! votes to depose the current primary: it broadcasts a signed
//! `VIEW-CHANGE` carrying its stable checkpoint proof and the
//! prepared certificates of every in-flight sequence. The next
//! primary collects `2f + 1` of those, synthesizes a `NEW-VIEW`
//! re-proposing every prepared request (and signed no-ops for the
//! holes), and every replica re-derives that list before installing
//! the new view.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::bft::checkpoint::CheckpointKeeper;
use crate::bft::collections::{self, HashMap, SenderBitmap};
use crate::bft::communication::message::{
    MessageKind, NewViewData, Request, SignatureInfo, ViewChangeData,
};
use crate::bft::communication::serialize;
use crate::bft::communication::{self, KeyTable, NetworkNode, NodeId};
use crate::bft::consensus::Commitment;
use crate::bft::core::server::{SystemInfo, SystemParams};
use crate::bft::crypto::hash::Digest;
use crate::bft::crypto::signature::KeyPair;
use crate::bft::error::*;
use crate::bft::metrics::Metrics;
use crate::bft::ordering::{Orderable, SeqNo};

/// Where the local replica stands in the view change.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ViewChangeStatus {
    None,
    ReadyViewChange,
    ReadyNewView,
}

/// A snapshot of the view change progress, shared with the message
/// gate so it knows when to buffer consensus traffic.
///
/// The commitment layer reads this; the synchronizer never calls
/// back into it.
#[derive(Default)]
pub struct ViewState {
    in_progress: AtomicBool,
}

impl ViewState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a view change is currently in progress.
    pub fn in_view_change(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    fn set(&self, v: bool) {
        self.in_progress.store(v, Ordering::Release);
    }
}

/// The event published when a `NEW-VIEW` is accepted.
///
/// The replica applies it: bumping the primary's sequence counter,
/// replaying the re-proposed requests through the commitment layer,
/// and draining the pending queue.
#[derive(Debug)]
pub struct NewViewInstalled {
    pub view: SeqNo,
    pub primary: NodeId,
    pub next_seq: SeqNo,
    pub requests: Vec<Request>,
}

/// Runs the view change for the local replica.
pub struct Synchronizer {
    params: SystemParams,
    id: NodeId,
    system_info: Arc<SystemInfo>,
    keypair: Option<Arc<KeyPair>>,
    key_table: Arc<KeyTable>,
    network: Arc<dyn NetworkNode>,
    metrics: Arc<Metrics>,
    checkpoint: Arc<CheckpointKeeper>,
    commitment: Arc<Commitment>,
    view_state: Arc<ViewState>,
    verify_signatures: bool,
    started: AtomicBool,
    // debounces repeated silence timeouts: each timeout in
    // READY_NEW_VIEW escalates to the next candidate primary
    counter: AtomicU64,
    status: Mutex<ViewChangeStatus>,
    // the view we already answered with a NEW-VIEW, if any
    new_view_sent: Mutex<Option<u64>>,
    received: Mutex<HashMap<u64, HashMap<u32, ViewChangeData>>>,
}

impl Synchronizer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: SystemParams,
        id: NodeId,
        system_info: Arc<SystemInfo>,
        keypair: Option<Arc<KeyPair>>,
        key_table: Arc<KeyTable>,
        network: Arc<dyn NetworkNode>,
        metrics: Arc<Metrics>,
        checkpoint: Arc<CheckpointKeeper>,
        commitment: Arc<Commitment>,
        view_state: Arc<ViewState>,
        verify_signatures: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            params,
            id,
            system_info,
            keypair,
            key_table,
            network,
            metrics,
            checkpoint,
            commitment,
            view_state,
            verify_signatures,
            started: AtomicBool::new(false),
            counter: AtomicU64::new(1),
            status: Mutex::new(ViewChangeStatus::None),
            new_view_sent: Mutex::new(None),
            received: Mutex::new(collections::hash_map()),
        })
    }

    /// The local view change status.
    pub fn status(&self) -> ViewChangeStatus {
        *self.status.lock()
    }

    /// Arms the view change: from here on, a silent primary makes the
    /// checkpoint keeper call back into [`Synchronizer::on_silence`].
    pub fn arm(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak: Weak<Synchronizer> = Arc::downgrade(self);
        self.checkpoint.set_timeout_handler(Box::new(move || {
            if let Some(sync) = weak.upgrade() {
                if let Err(err) = sync.on_silence() {
                    warn!("view change trigger failed: {}", err);
                }
            }
        }));
    }

    /// Fired when no request committed for a whole timeout: votes to
    /// move to the next view.
    pub fn on_silence(&self) -> Result<()> {
        {
            let mut status = self.status.lock();
            match *status {
                ViewChangeStatus::None => {
                    self.counter.store(1, Ordering::Release);
                    *status = ViewChangeStatus::ReadyViewChange;
                    self.metrics.inc_view_changes_started();
                }
                // still waiting on the quorum; retransmit the same vote
                ViewChangeStatus::ReadyViewChange => {}
                // the elected primary went silent too: escalate to
                // the candidate after it
                ViewChangeStatus::ReadyNewView => {
                    self.counter.fetch_add(1, Ordering::AcqRel);
                    *status = ViewChangeStatus::ReadyViewChange;
                }
            }
        }
        self.view_state.set(true);
        self.send_view_change()
    }

    fn next_view(&self) -> SeqNo {
        let view = u64::from(self.system_info.view());
        SeqNo::from(view + self.counter.load(Ordering::Acquire))
    }

    // VIEW-CHANGE(v + x, stable ckpt with proof, prepared certs)
    fn build_view_change(&self) -> ViewChangeData {
        let stable_ckpt = self.checkpoint.stable_checkpoint_with_votes();
        let stable = u64::from(stable_ckpt.seq);
        let max_seq = u64::from(self.checkpoint.max_txn_seq());

        let mut prepared = Vec::new();
        for seq in stable + 1..=max_seq {
            if let Some(cert) = self.commitment.prepared_certificate(SeqNo::from(seq)) {
                prepared.push(cert);
            }
        }

        ViewChangeData {
            view: self.next_view(),
            stable_ckpt,
            prepared,
        }
    }

    fn send_view_change(&self) -> Result<()> {
        let data = self.build_view_change();
        let view = data.view;
        info!(view = u64::from(view), "broadcasting view change");

        let mut request = Request::new(MessageKind::ViewChange, self.id);
        request.view = view;
        request.data = serialize::serialize(&data)?;

        let targets: Vec<NodeId> = self.params.replica_ids().collect();
        let wm = communication::wire_message(&request, self.id, self.keypair.as_deref())?;
        self.network.broadcast(wm, &targets[..])
    }

    /// Validates an inbound `VIEW-CHANGE` message.
    pub fn is_valid_view_change(&self, data: &ViewChangeData) -> Result<()> {
        if data.view <= self.system_info.view() {
            return Err(Error::simple(ErrorKind::StaleMessage));
        }
        if !self.checkpoint.is_valid_proof(&data.stable_ckpt) {
            return Err("Stable checkpoint proof does not hold")
                .wrapped(ErrorKind::QuorumFailure);
        }

        let stable = data.stable_ckpt.seq;
        for cert in &data.prepared {
            if cert.seq <= stable {
                continue;
            }
            if cert.proofs.len() < self.params.quorum() {
                return Err("Not enough prepare proofs").wrapped(ErrorKind::QuorumFailure);
            }
            let mut senders = SenderBitmap::new();
            for proof in &cert.proofs {
                if proof.request.sequence_number() != cert.seq {
                    return Err("Prepare proof sequence mismatch")
                        .wrapped(ErrorKind::QuorumFailure);
                }
                if self.verify_signatures {
                    let signature = proof
                        .signature
                        .as_ref()
                        .ok_or_else(|| Error::simple(ErrorKind::BadSignature))?;
                    let key = self
                        .key_table
                        .get(signature.node_id)
                        .ok_or_else(|| Error::simple(ErrorKind::BadSignature))?;
                    let raw = proof.request.canonical_bytes()?;
                    key.verify(&raw[..], &signature.signature)?;
                    senders.set(signature.node_id);
                } else {
                    senders.set(proof.request.sender_id());
                }
            }
            if senders.count() < self.params.quorum() {
                return Err("Prepare proofs not from distinct replicas")
                    .wrapped(ErrorKind::QuorumFailure);
            }
        }
        Ok(())
    }

    /// Handles an inbound `VIEW-CHANGE`, possibly answering with a
    /// `NEW-VIEW` when this replica is the elected primary.
    pub fn process_view_change(&self, request: &Request) -> Result<()> {
        let data: ViewChangeData = serialize::deserialize(request.data())?;
        self.is_valid_view_change(&data)?;

        let view = u64::from(data.view);
        let count = {
            let mut received = self.received.lock();
            let entry = received.entry(view).or_insert_with(collections::hash_map);
            entry.insert(u32::from(request.sender_id()), data);
            entry.len()
        };

        if count >= self.params.quorum() {
            if self.params.leader(SeqNo::from(view)) == self.id {
                self.send_new_view(SeqNo::from(view))?;
            }
            *self.status.lock() = ViewChangeStatus::ReadyNewView;
            self.view_state.set(true);
        }
        Ok(())
    }

    fn send_new_view(&self, view: SeqNo) -> Result<()> {
        {
            let mut sent = self.new_view_sent.lock();
            if *sent == Some(u64::from(view)) {
                return Ok(());
            }
            *sent = Some(u64::from(view));
        }

        let view_changes: Vec<ViewChangeData> = {
            let received = self.received.lock();
            match received.get(&u64::from(view)) {
                Some(entry) => entry.values().cloned().collect(),
                None => return Err(Error::simple(ErrorKind::Sync)),
            }
        };

        let mut requests = self.derive_requests(&view_changes, view);
        // only the elected primary holds the key that vouches for
        // the synthesized no-ops
        if let Some(keypair) = &self.keypair {
            for request in &mut requests {
                if request.data().is_empty() {
                    let share = keypair.sign(request.data())?;
                    request.data_signature = Some(SignatureInfo::ed25519(self.id, share));
                }
            }
        }

        let data = NewViewData {
            view,
            view_changes,
            requests,
        };
        info!(view = u64::from(view), "broadcasting new view");

        let mut request = Request::new(MessageKind::NewView, self.id);
        request.view = view;
        request.data = serialize::serialize(&data)?;

        let targets: Vec<NodeId> = self.params.replica_ids().collect();
        let wm = communication::wire_message(&request, self.id, self.keypair.as_deref())?;
        self.network.broadcast(wm, &targets[..])
    }

    // Re-derives the re-proposal list from a set of view changes:
    // for each sequence in (min_s, max_s], either the prepared
    // request re-proposed under the new view, or an empty no-op.
    //
    // Deterministic, so every replica arrives at the same list and
    // can reject a primary that lies.
    fn derive_requests(&self, view_changes: &[ViewChangeData], view: SeqNo) -> Vec<Request> {
        use std::collections::BTreeMap;

        let leader = self.params.leader(view);
        let mut prepared: BTreeMap<u64, &Request> = BTreeMap::new();
        for vc in view_changes {
            for cert in &vc.prepared {
                if let Some(proof) = cert.proofs.first() {
                    prepared.entry(u64::from(cert.seq)).or_insert(&proof.request);
                }
            }
        }

        let min_s = view_changes
            .iter()
            .map(|vc| u64::from(vc.stable_ckpt.seq))
            .min()
            .unwrap_or(0);
        let max_s = prepared.keys().next_back().copied().unwrap_or(min_s);

        let mut requests = Vec::new();
        for seq in min_s + 1..=max_s {
            let mut request = Request::new(MessageKind::PrePrepare, leader);
            request.view = view;
            request.seq = SeqNo::from(seq);
            match prepared.get(&seq) {
                Some(base) => {
                    request.hash = base.hash;
                    request.data = base.data.clone();
                }
                None => {
                    // a hole: fill with a no-op the primary signs
                    request.hash = Digest::of(&[]);
                }
            }
            requests.push(request);
        }
        requests
    }

    /// Handles an inbound `NEW-VIEW`, validating every embedded view
    /// change and re-deriving the re-proposal list before accepting.
    pub fn process_new_view(&self, request: &Request) -> Result<NewViewInstalled> {
        let data: NewViewData = serialize::deserialize(request.data())?;
        let view = data.view;
        if view <= self.system_info.view() {
            return Err(Error::simple(ErrorKind::StaleMessage));
        }
        let primary = self.params.leader(view);
        if request.sender_id() != primary {
            return Err("New view not sent by the elected primary").wrapped(ErrorKind::Sync);
        }
        if data.view_changes.len() < self.params.quorum() {
            return Err("Not enough view changes").wrapped(ErrorKind::QuorumFailure);
        }
        for vc in &data.view_changes {
            self.is_valid_view_change(vc)?;
        }

        // the primary must have derived exactly what we derive
        let derived = self.derive_requests(&data.view_changes, view);
        if derived.len() != data.requests.len() {
            return Err("Re-proposed request list length mismatch")
                .wrapped(ErrorKind::QuorumFailure);
        }
        for (ours, theirs) in derived.iter().zip(data.requests.iter()) {
            if ours.seq != theirs.seq
                || ours.hash != theirs.hash
                || ours.data != theirs.data
            {
                return Err("Re-proposed request list content mismatch")
                    .wrapped(ErrorKind::QuorumFailure);
            }
        }

        let next_seq = derived
            .last()
            .map(|r| r.sequence_number().next())
            .unwrap_or_else(|| {
                let min_s = data
                    .view_changes
                    .iter()
                    .map(|vc| u64::from(vc.stable_ckpt.seq))
                    .min()
                    .unwrap_or(0);
                SeqNo::from(min_s + 1)
            });

        self.system_info.install(view, primary);
        *self.status.lock() = ViewChangeStatus::None;
        *self.new_view_sent.lock() = None;
        self.received.lock().remove(&u64::from(view));
        self.view_state.set(false);
        info!(
            view = u64::from(view),
            primary = u32::from(primary),
            "installed new view"
        );

        Ok(NewViewInstalled {
            view,
            primary,
            next_seq,
            requests: data.requests,
        })
    }
}
