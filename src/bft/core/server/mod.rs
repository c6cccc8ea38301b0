//! The replica: the message gate authenticating, deduplicating and
//! routing every inbound frame, plus the threads and queues gluing
//! the sub-protocols together.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::bft::checkpoint::{CheckpointKeeper, RecoveryAction, DEFAULT_WATER_MARK};
use crate::bft::collections::{self, HashMap, OrderedMap};
use crate::bft::communication::channel::{self, ChannelRx, ChannelTx};
use crate::bft::communication::message::{
    BatchResponse, HeartBeatData, MessageKind, Request, SignatureInfo, SystemInfoData,
    WireMessage,
};
use crate::bft::communication::serialize;
use crate::bft::communication::{self, KeyTable, NetworkNode, NodeId};
use crate::bft::consensus::Commitment;
use crate::bft::crypto::hash::Digest;
use crate::bft::crypto::signature::{KeyPair, PublicKey};
use crate::bft::error::*;
use crate::bft::executable::{TransactionExecutor, TransactionPipeline};
use crate::bft::log::TxnStore;
use crate::bft::metrics::Metrics;
use crate::bft::ordering::{Orderable, SeqNo};
use crate::bft::proposer::{Proposer, DEFAULT_BATCH_NUM};
use crate::bft::query::Query;
use crate::bft::response::{ClientReplier, ResponseManager};
use crate::bft::sync::{NewViewInstalled, Synchronizer, ViewState};
use crate::bft::threadpool;
use crate::bft::wal::{Wal, WalConfig};

// bound of the inbound frame queue and the consensus shard queues
const INPUT_QUEUE_BOUND: usize = 16384;
// duplicate suppression window of the gate
const DEDUP_CAP: usize = 16384;
// deadline used by every worker dequeue
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The static parameters of a cluster of `n = 3f + 1` replicas.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SystemParams {
    n: usize,
    f: usize,
}

impl SystemParams {
    /// Derives the parameters from the replica count.
    pub fn from_n(n: usize) -> Result<Self> {
        if n < 4 || (n - 1) % 3 != 0 {
            return Err("Replica count must be 3f + 1").wrapped(ErrorKind::CoreServer);
        }
        Ok(Self { n, f: (n - 1) / 3 })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn f(&self) -> usize {
        self.f
    }

    /// The smallest set guaranteed to overlap any other such set in
    /// at least one correct replica.
    pub fn quorum(&self) -> usize {
        2 * self.f + 1
    }

    /// The primary of `view`: `(view - 1) mod n + 1`.
    pub fn leader(&self, view: SeqNo) -> NodeId {
        let view = u64::from(view).max(1);
        NodeId::from(((view - 1) % self.n as u64 + 1) as u32)
    }

    /// Every replica id in the cluster, `1..=n`.
    pub fn replica_ids(&self) -> impl Iterator<Item = NodeId> {
        NodeId::targets(1..=self.n as u32)
    }
}

/// The replica's current view and primary, shared read-mostly state.
pub struct SystemInfo {
    view: AtomicU64,
    primary: AtomicU32,
}

impl SystemInfo {
    pub fn new(view: SeqNo, primary: NodeId) -> Self {
        Self {
            view: AtomicU64::new(u64::from(view)),
            primary: AtomicU32::new(u32::from(primary)),
        }
    }

    pub fn view(&self) -> SeqNo {
        SeqNo::from(self.view.load(Ordering::Acquire))
    }

    pub fn primary(&self) -> NodeId {
        NodeId::from(self.primary.load(Ordering::Acquire))
    }

    /// Installs a new view and primary; the view never moves back.
    pub fn install(&self, view: SeqNo, primary: NodeId) {
        let view = u64::from(view);
        if view > self.view.load(Ordering::Acquire) {
            self.view.store(view, Ordering::Release);
            self.primary.store(u32::from(primary), Ordering::Release);
        }
    }
}

/// Identity and address of one cluster member.
#[derive(Debug, Clone)]
pub struct ReplicaInfo {
    pub id: NodeId,
    pub ip: String,
    pub port: u16,
}

/// The recognized configuration knobs.
///
/// `output_worker_num`, `tcp_batch_num` and `performance_running`
/// belong to the external transport and benchmark harness; they are
/// parsed for compatibility and ignored by the core.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub self_info: ReplicaInfo,
    pub replicas: Vec<ReplicaInfo>,
    pub region_id: u32,
    pub checkpoint_enabled: bool,
    pub checkpoint_water_mark: u64,
    pub enable_viewchange: bool,
    pub viewchange_commit_timeout_ms: u64,
    pub worker_num: usize,
    pub input_worker_num: usize,
    pub output_worker_num: usize,
    pub tcp_batch_num: usize,
    pub batch_transaction_num: usize,
    pub batch_flush_timeout_ms: u64,
    pub signature_verifier_enabled: bool,
    pub not_need_signature: bool,
    pub recovery_enabled: bool,
    pub recovery_path: PathBuf,
    pub recovery_buffer_size: usize,
    pub recovery_ckpt_time_s: u64,
    pub heart_beat_enabled: bool,
    pub is_test_mode: bool,
    pub performance_running: bool,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            self_info: ReplicaInfo {
                id: NodeId::from(1u32),
                ip: "127.0.0.1".into(),
                port: 0,
            },
            replicas: Vec::new(),
            region_id: 0,
            checkpoint_enabled: true,
            checkpoint_water_mark: DEFAULT_WATER_MARK,
            enable_viewchange: false,
            viewchange_commit_timeout_ms: 60_000,
            worker_num: 4,
            input_worker_num: 4,
            output_worker_num: 4,
            tcp_batch_num: 100,
            batch_transaction_num: DEFAULT_BATCH_NUM,
            batch_flush_timeout_ms: 100,
            signature_verifier_enabled: true,
            not_need_signature: false,
            recovery_enabled: false,
            recovery_path: PathBuf::from("./wal_log/log"),
            recovery_buffer_size: 1024,
            recovery_ckpt_time_s: 60,
            heart_beat_enabled: false,
            is_test_mode: false,
            performance_running: false,
        }
    }
}

#[derive(Hash, Eq, PartialEq)]
struct DedupKey {
    kind: MessageKind,
    sender: NodeId,
    view: u64,
    seq: u64,
    hash: Digest,
}

/// One replica of the BFT cluster.
///
/// The external transport feeds inbound frames through
/// [`Replica::queue_frame`] (or calls [`Replica::on_frame`]
/// directly); everything else is internal plumbing. Call
/// [`Replica::recover`] before [`Replica::start`] so a restarted
/// replica replays its write-ahead log first.
pub struct Replica {
    params: SystemParams,
    id: NodeId,
    config: ReplicaConfig,
    metrics: Arc<Metrics>,
    keypair: Option<Arc<KeyPair>>,
    key_table: Arc<KeyTable>,
    network: Arc<dyn NetworkNode>,
    system_info: Arc<SystemInfo>,
    pipeline: Arc<TransactionPipeline>,
    checkpoint: Arc<CheckpointKeeper>,
    commitment: Arc<Commitment>,
    synchronizer: Arc<Synchronizer>,
    view_state: Arc<ViewState>,
    proposer: Arc<Proposer>,
    responses: Arc<ResponseManager>,
    query: Query,
    wal: Arc<Wal>,
    input_tx: ChannelTx<Vec<u8>>,
    input_rx: ChannelRx<Vec<u8>>,
    shards: Vec<(ChannelTx<(Request, Option<SignatureInfo>)>, ChannelRx<(Request, Option<SignatureInfo>)>)>,
    pending: Mutex<VecDeque<(Request, Option<SignatureInfo>)>>,
    seen: Mutex<OrderedMap<DedupKey, ()>>,
    primary_advisory: Mutex<Option<Box<dyn Fn(NodeId, SeqNo) + Send + Sync>>>,
    stop: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    gate_pool: Mutex<Option<threadpool::ThreadPool>>,
}

impl Replica {
    /// Wires a replica together.
    ///
    /// `keypair` is this replica's signing key; `initial_keys` seeds
    /// the peer key table (heartbeats extend it later).
    pub fn new(
        config: ReplicaConfig,
        executor: Arc<dyn TransactionExecutor>,
        store: Arc<dyn TxnStore>,
        network: Arc<dyn NetworkNode>,
        replier: Arc<dyn ClientReplier>,
        keypair: Option<KeyPair>,
        initial_keys: HashMap<NodeId, PublicKey>,
    ) -> Result<Arc<Self>> {
        let params = SystemParams::from_n(config.replicas.len())?;
        let id = config.self_info.id;
        let metrics = Arc::new(Metrics::new());
        let keypair = match keypair {
            Some(kp) if !config.not_need_signature => Some(Arc::new(kp)),
            _ => None,
        };
        let verify = config.signature_verifier_enabled;
        let key_table = Arc::new(KeyTable::new(initial_keys));
        let system_info = Arc::new(SystemInfo::new(SeqNo::ONE, params.leader(SeqNo::ONE)));

        let pipeline = Arc::new(TransactionPipeline::new(executor, metrics.clone()));
        let checkpoint = Arc::new(CheckpointKeeper::new(
            params,
            id,
            keypair.clone(),
            key_table.clone(),
            network.clone(),
            metrics.clone(),
            store.clone(),
            config.checkpoint_water_mark,
            Duration::from_millis(config.viewchange_commit_timeout_ms),
            verify,
            config.checkpoint_enabled,
        ));
        pipeline.set_commit_sink(checkpoint.commit_sender());

        let commitment = Arc::new(Commitment::new(
            params,
            id,
            system_info.clone(),
            keypair.clone(),
            network.clone(),
            pipeline.clone(),
            metrics.clone(),
            config.enable_viewchange,
        ));
        {
            // collectors die once the stable checkpoint passes them
            let commitment = commitment.clone();
            checkpoint.add_stable_listener(Box::new(move |stable| {
                commitment.evict_below(stable);
            }));
        }

        let view_state = Arc::new(ViewState::new());
        let synchronizer = Synchronizer::new(
            params,
            id,
            system_info.clone(),
            keypair.clone(),
            key_table.clone(),
            network.clone(),
            metrics.clone(),
            checkpoint.clone(),
            commitment.clone(),
            view_state.clone(),
            verify,
        );
        if config.enable_viewchange {
            synchronizer.arm();
        }

        let proposer = Arc::new(Proposer::new(
            id,
            config.batch_transaction_num,
            Duration::from_millis(config.batch_flush_timeout_ms),
        ));
        let responses = Arc::new(ResponseManager::new(params.f(), replier, metrics.clone()));
        let query = Query::new(id, store.clone(), system_info.clone(), checkpoint.clone());

        let wal = Arc::new(Wal::open(
            &WalConfig {
                enabled: config.recovery_enabled,
                path: config.recovery_path.clone(),
                buffer_size: config.recovery_buffer_size,
            },
            &SystemInfoData {
                view: system_info.view(),
                primary_id: system_info.primary(),
            },
        )?);

        let (input_tx, input_rx) = channel::new_bounded(INPUT_QUEUE_BOUND);
        let shards = (0..config.worker_num)
            .map(|_| channel::new_bounded(INPUT_QUEUE_BOUND))
            .collect();

        let replica = Arc::new(Self {
            params,
            id,
            config,
            metrics,
            keypair,
            key_table,
            network,
            system_info,
            pipeline,
            checkpoint,
            commitment,
            synchronizer,
            view_state,
            proposer,
            responses,
            query,
            wal,
            input_tx,
            input_rx,
            shards,
            pending: Mutex::new(VecDeque::new()),
            seen: Mutex::new(collections::ordered_map()),
            primary_advisory: Mutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
            gate_pool: Mutex::new(None),
        });

        // replies to executed batches travel back to the proxy that
        // pooled the client requests
        {
            let weak = Arc::downgrade(&replica);
            replica.pipeline.set_post_execute(Box::new(move |request, response| {
                if let Some(replica) = weak.upgrade() {
                    if let Err(err) = replica.send_response(request, response) {
                        debug!("failed to route batch response: {}", err);
                    }
                }
            }));
        }

        Ok(replica)
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn params(&self) -> SystemParams {
        self.params
    }

    pub fn system_info(&self) -> &SystemInfo {
        &self.system_info
    }

    pub fn pipeline(&self) -> &Arc<TransactionPipeline> {
        &self.pipeline
    }

    pub fn checkpoint(&self) -> &Arc<CheckpointKeeper> {
        &self.checkpoint
    }

    pub fn commitment(&self) -> &Arc<Commitment> {
        &self.commitment
    }

    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.synchronizer
    }

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    /// Registers the hook observing primary advisories carried by
    /// heartbeats, used by client facing front ends.
    pub fn set_primary_advisory(&self, hook: Box<dyn Fn(NodeId, SeqNo) + Send + Sync>) {
        *self.primary_advisory.lock() = Some(hook);
    }

    /// Replays the write-ahead log after a crash.
    ///
    /// Must run before [`Replica::start`]: the durable records flow
    /// through the same routing as live traffic, minus signature
    /// verification and re-logging.
    pub fn recover(&self) -> Result<()> {
        let (info, records) = self.wal.replay()?;
        if let Some(info) = info {
            self.system_info.install(info.view, info.primary_id);
        }
        let count = records.len();
        for record in records {
            if let Err(err) = self.route(record.request, record.signature, false) {
                match err.kind() {
                    ErrorKind::DurabilityFailure | ErrorKind::Executable => return Err(err),
                    _ => debug!("skipping unreplayable wal record: {}", err),
                }
            }
        }
        if count > 0 {
            info!(records = count, "replayed write-ahead log");
        }
        Ok(())
    }

    /// Queues one inbound wire frame for the gate workers.
    pub fn queue_frame(&self, frame: Vec<u8>) -> Result<()> {
        self.input_tx
            .send(frame)
            .map_err(|e| e.swap_kind(ErrorKind::CoreServer))
    }

    /// The message gate: authenticate, deduplicate, route.
    ///
    /// Malformed, unauthenticated and duplicated frames are dropped
    /// with a metric and never produce an error; an `Err` out of
    /// here is a durability or execution handoff failure, and the
    /// replica must crash-restart.
    pub fn on_frame(&self, frame: &[u8]) -> Result<()> {
        self.metrics.inc_frames_received();

        let wire = match WireMessage::from_bytes(frame) {
            Ok(w) => w,
            Err(err) => {
                self.metrics.inc_bad_framing();
                debug!("dropping malformed frame: {}", err);
                return Ok(());
            }
        };
        let request = match serialize::deserialize_request(wire.payload()) {
            Ok(r) => r,
            Err(err) => {
                self.metrics.inc_bad_framing();
                debug!("dropping undecodable payload: {}", err);
                return Ok(());
            }
        };

        if self.config.signature_verifier_enabled {
            // client traffic is authenticated by the external client
            // channel; everything else must carry a valid envelope
            // signature from its sender
            if request.kind() != MessageKind::ClientRequest {
                let valid = wire.signature().map(|signature| {
                    signature.node_id == request.sender_id()
                        && self
                            .key_table
                            .get(signature.node_id)
                            .map(|key| {
                                key.verify(wire.payload(), &signature.signature).is_ok()
                            })
                            .unwrap_or(false)
                });
                if valid != Some(true) {
                    self.metrics.inc_bad_signatures();
                    warn!(
                        sender = u32::from(request.sender_id()),
                        kind = ?request.kind(),
                        "dropping frame with missing or invalid signature"
                    );
                    return Ok(());
                }
            }
        }

        // drop duplicates of an already seen message
        {
            let key = DedupKey {
                kind: request.kind(),
                sender: request.sender_id(),
                view: u64::from(request.view()),
                seq: u64::from(request.sequence_number()),
                hash: *request.hash(),
            };
            let mut seen = self.seen.lock();
            if seen.insert(key, ()).is_some() {
                self.metrics.inc_duplicates_dropped();
                return Ok(());
            }
            while seen.len() > DEDUP_CAP {
                seen.pop_front();
            }
        }

        // drop consensus traffic outside the log window: below the
        // stable checkpoint, or so far above it that only a faulty
        // peer could have produced it
        if request.kind().is_consensus() || request.kind() == MessageKind::Checkpoint {
            let seq = request.sequence_number();
            let stable = self.checkpoint.stable_checkpoint();
            if seq > SeqNo::ZERO {
                if seq <= stable || seq.index(stable).is_left() {
                    self.metrics.inc_stale_dropped();
                    return Ok(());
                }
            }
        }

        let signature = wire.signature().copied();
        match self.dispatch(request, signature) {
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::DurabilityFailure | ErrorKind::Executable
                ) =>
            {
                Err(err)
            }
            other => self.swallow(other),
        }
    }

    // Buffers consensus traffic while a view change is running, then
    // hands the message to the right component.
    fn dispatch(&self, request: Request, signature: Option<SignatureInfo>) -> Result<()> {
        if self.config.enable_viewchange
            && self.view_state.in_view_change()
            && request.kind().is_consensus()
        {
            self.pending.lock().push_back((request, signature));
            return Ok(());
        }
        self.route(request, signature, true)
    }

    // The routing table. `durable` is false when replaying the WAL.
    fn route(
        &self,
        request: Request,
        signature: Option<SignatureInfo>,
        durable: bool,
    ) -> Result<()> {
        if durable && request.kind().is_durable() {
            self.wal.append(
                &request,
                signature.as_ref(),
                self.checkpoint.last_ordered_seq(),
            )?;
            self.metrics.inc_wal_appends();
        }

        match request.kind() {
            MessageKind::ClientRequest => {
                if let Some(batch) = self.proposer.accept(&request)? {
                    self.commitment.process_new_txns(batch)?;
                }
                Ok(())
            }
            MessageKind::Response => self.swallow(self.responses.process_response(&request)),
            MessageKind::NewTxns
            | MessageKind::PrePrepare
            | MessageKind::Prepare
            | MessageKind::Commit => self.dispatch_consensus(request, signature),
            MessageKind::Checkpoint => self.swallow(self.checkpoint.process_checkpoint(&request)),
            MessageKind::ViewChange => {
                self.swallow(self.synchronizer.process_view_change(&request))
            }
            MessageKind::NewView => match self.synchronizer.process_new_view(&request) {
                Ok(installed) => self.apply_new_view(installed),
                Err(err) => self.swallow(Err(err)),
            },
            MessageKind::HeartBeat => self.swallow(self.process_heart_beat(&request)),
            MessageKind::Query => {
                let reply = self.query.process_query(&request)?;
                self.send_to(reply, request.sender_id())
            }
            MessageKind::ReplicaState => {
                let reply = self.query.process_replica_state()?;
                self.send_to(reply, request.sender_id())
            }
            MessageKind::CustomConsensus => self.process_recovery(&request),
        }
    }

    // Recoverable protocol errors surface as metrics and logs only.
    fn swallow(&self, result: Result<()>) -> Result<()> {
        if let Err(err) = result {
            match err.kind() {
                ErrorKind::BadSignature => self.metrics.inc_bad_signatures(),
                ErrorKind::StaleMessage => self.metrics.inc_stale_dropped(),
                ErrorKind::DuplicateVote => self.metrics.inc_duplicates_dropped(),
                _ => {}
            }
            debug!("dropping message: {}", err);
        }
        Ok(())
    }

    // Consensus messages are sharded by sequence so one collector is
    // only ever touched by one worker at a time.
    fn dispatch_consensus(
        &self,
        request: Request,
        signature: Option<SignatureInfo>,
    ) -> Result<()> {
        if self.shards.is_empty() {
            return self.route_consensus(request, signature);
        }
        let shard = u64::from(request.sequence_number()) as usize % self.shards.len();
        self.shards[shard]
            .0
            .send((request, signature))
            .map_err(|e| e.swap_kind(ErrorKind::CoreServer))
    }

    fn route_consensus(
        &self,
        request: Request,
        signature: Option<SignatureInfo>,
    ) -> Result<()> {
        let result = match request.kind() {
            MessageKind::NewTxns => self.commitment.process_new_txns(request),
            MessageKind::PrePrepare => self.commitment.process_propose(request, signature),
            MessageKind::Prepare => self.commitment.process_prepare(request, signature),
            MessageKind::Commit => self.commitment.process_commit(request, signature),
            _ => Ok(()),
        };
        match result {
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::DurabilityFailure | ErrorKind::Executable
                ) =>
            {
                error!("fatal consensus handoff failure: {}", err);
                self.stop.store(true, Ordering::Release);
                Err(err)
            }
            other => self.swallow(other),
        }
    }

    // One worker iteration over a consensus shard queue.
    fn consensus_worker_once(&self, shard: usize, timeout: Duration) -> Result<bool> {
        let (request, signature) = match self.shards[shard].1.recv_timeout(timeout) {
            Some(m) => m,
            None => return Ok(false),
        };
        self.route_consensus(request, signature)?;
        Ok(true)
    }

    // Applies an accepted NEW-VIEW: bump the primary's sequence
    // counter, replay the re-proposed requests, then drain the
    // buffered traffic exactly once, in FIFO order.
    fn apply_new_view(&self, installed: NewViewInstalled) -> Result<()> {
        self.commitment.set_next_seq(installed.next_seq);
        for request in installed.requests {
            self.swallow(self.commitment.process_propose(request, None))?;
        }
        let drained = std::mem::take(&mut *self.pending.lock());
        for (request, signature) in drained {
            self.route(request, signature, true)?;
        }
        Ok(())
    }

    fn process_heart_beat(&self, request: &Request) -> Result<()> {
        let data: HeartBeatData = serialize::deserialize(request.data())?;
        for (id, raw) in &data.public_keys {
            match PublicKey::from_bytes(&raw[..]) {
                Ok(key) => {
                    self.key_table.insert(*id, key);
                }
                Err(_) => {
                    self.metrics.inc_bad_signatures();
                }
            }
        }
        if request.region_id() == self.config.region_id {
            if let Some(hook) = self.primary_advisory.lock().as_ref() {
                hook(data.primary, data.view);
            }
        }
        Ok(())
    }

    fn process_recovery(&self, request: &Request) -> Result<()> {
        match self.checkpoint.process_recovery_message(request)? {
            RecoveryAction::Nil => Ok(()),
            RecoveryAction::Reply(reply) => self.send_to(reply, request.sender_id()),
            RecoveryAction::Commit(mut requests) => {
                requests.sort_by_key(|r| u64::from(r.sequence_number()));
                for request in requests {
                    self.wal.append(
                        &request,
                        None,
                        self.checkpoint.last_ordered_seq(),
                    )?;
                    self.pipeline
                        .commit(request)
                        .map_err(|e| e.swap_kind(ErrorKind::DurabilityFailure))?;
                }
                Ok(())
            }
        }
    }

    fn send_to(&self, mut request: Request, target: NodeId) -> Result<()> {
        if request.hash == Digest::default() && !request.data.is_empty() {
            request.hash = Digest::of(request.data());
        }
        let wm = communication::wire_message(&request, self.id, self.keypair.as_deref())?;
        if let Err(err) = self.network.send(wm, target) {
            self.metrics.inc_peers_unreachable();
            debug!(target = u32::from(target), "send failed: {}", err);
        }
        Ok(())
    }

    // Routes the executed batch's reply to the proxy replica that
    // pooled the client requests.
    fn send_response(&self, committed: &Request, response: BatchResponse) -> Result<()> {
        let proxy = response.proxy_id;
        let mut request = Request::new(MessageKind::Response, self.id);
        request.seq = committed.sequence_number();
        request.data = serialize::serialize(&response)?;
        request.hash = Digest::of(request.data());
        let wm = communication::wire_message(&request, self.id, self.keypair.as_deref())?;
        if let Err(err) = self.network.send(wm, proxy) {
            self.metrics.inc_peers_unreachable();
            debug!(proxy = u32::from(proxy), "response send failed: {}", err);
        }
        Ok(())
    }

    /// One heartbeat: broadcast the key table plus the primary
    /// advisory to the whole cluster.
    pub fn heartbeat_once(&self) -> Result<()> {
        let keys = self
            .key_table
            .snapshot()
            .iter()
            .map(|(id, key)| (*id, key.as_ref().to_vec()))
            .collect();
        let data = HeartBeatData {
            public_keys: keys,
            primary: self.system_info.primary(),
            view: self.system_info.view(),
        };

        let mut request = Request::new(MessageKind::HeartBeat, self.id);
        request.region_id = self.config.region_id;
        request.data = serialize::serialize(&data)?;
        request.hash = Digest::of(request.data());

        let targets: Vec<NodeId> = self.params.replica_ids().collect();
        let wm = communication::wire_message(&request, self.id, self.keypair.as_deref())?;
        self.network.broadcast(wm, &targets[..])
    }

    // One iteration of the health check: lagging replicas broadcast
    // a recovery query.
    fn health_check_once(&self) -> Result<()> {
        let executed = self.pipeline.max_pending_executed_seq();
        if let Some(query) = self.checkpoint.maybe_recovery_query(executed)? {
            let targets: Vec<NodeId> = self.params.replica_ids().collect();
            let mut query = query;
            query.hash = Digest::of(query.data());
            let wm = communication::wire_message(&query, self.id, self.keypair.as_deref())?;
            self.network.broadcast(wm, &targets[..])?;
        }
        Ok(())
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    // Sleeps in short slices so shutdown stays prompt.
    fn sleep_unless_stopped(&self, total: Duration) {
        let slice = Duration::from_millis(100);
        let mut remaining = total;
        while !self.stopped() && remaining > Duration::ZERO {
            let nap = remaining.min(slice);
            std::thread::sleep(nap);
            remaining = remaining.saturating_sub(nap);
        }
    }

    /// Spawns every worker thread of the replica.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut threads = self.threads.lock();

        // gate workers drain the inbound frame queue
        let gate_pool = threadpool::Builder::new()
            .num_threads(self.config.input_worker_num.max(1))
            .build();
        for _ in 0..self.config.input_worker_num.max(1) {
            let replica = self.clone();
            gate_pool.execute(move || {
                while !replica.stopped() {
                    if let Some(frame) = replica.input_rx.recv_timeout(POLL_INTERVAL) {
                        if let Err(err) = replica.on_frame(&frame[..]) {
                            error!("gate failure, stopping replica: {}", err);
                            replica.stop.store(true, Ordering::Release);
                        }
                    }
                }
            });
        }
        *self.gate_pool.lock() = Some(gate_pool);

        // consensus shard workers
        for shard in 0..self.shards.len() {
            let replica = self.clone();
            threads.push(threadpool::spawn_named(
                &format!("consensus-{}", shard),
                move || {
                    while !replica.stopped() {
                        if let Err(err) = replica.consensus_worker_once(shard, POLL_INTERVAL) {
                            error!("consensus worker stopping: {}", err);
                            break;
                        }
                    }
                },
            )?);
        }

        // ordered execution
        {
            let replica = self.clone();
            threads.push(threadpool::spawn_named("execute", move || {
                while !replica.stopped() {
                    if let Err(err) = replica.pipeline.execute_once(POLL_INTERVAL) {
                        error!("execute thread stopping: {}", err);
                        break;
                    }
                }
            })?);
        }
        if self.pipeline.out_of_order() {
            let replica = self.clone();
            threads.push(threadpool::spawn_named("execute-ooo", move || {
                while !replica.stopped() {
                    if let Err(err) = replica.pipeline.execute_out_of_order_once(POLL_INTERVAL)
                    {
                        error!("out-of-order execute thread stopping: {}", err);
                        break;
                    }
                }
            })?);
        }

        // checkpoint chain and stable promotion
        {
            let replica = self.clone();
            threads.push(threadpool::spawn_named("checkpoint", move || {
                while !replica.stopped() {
                    if let Err(err) = replica.checkpoint.process_commits_once(POLL_INTERVAL) {
                        error!("checkpoint thread stopping: {}", err);
                        break;
                    }
                }
            })?);
        }
        {
            let replica = self.clone();
            threads.push(threadpool::spawn_named("stable-ckpt", move || {
                while !replica.stopped() {
                    if let Err(err) = replica.checkpoint.promote_once(POLL_INTERVAL) {
                        error!("stable checkpoint thread stopping: {}", err);
                        break;
                    }
                }
            })?);
        }

        // batch flushing on the proxy
        {
            let replica = self.clone();
            let period = Duration::from_millis(self.config.batch_flush_timeout_ms.max(10) / 2);
            threads.push(threadpool::spawn_named("proposer", move || {
                while !replica.stopped() {
                    match replica.proposer.poll_flush() {
                        Ok(Some(batch)) => {
                            if let Err(err) = replica.commitment.process_new_txns(batch) {
                                warn!("batch proposal failed: {}", err);
                            }
                        }
                        Ok(None) => {}
                        Err(err) => warn!("batch flush failed: {}", err),
                    }
                    replica.sleep_unless_stopped(period);
                }
            })?);
        }

        // wal rotation follows the stable checkpoint
        if self.config.recovery_enabled {
            let replica = self.clone();
            let period = Duration::from_secs(self.config.recovery_ckpt_time_s.max(1));
            threads.push(threadpool::spawn_named("wal-ckpt", move || {
                while !replica.stopped() {
                    let stable = replica.checkpoint.stable_checkpoint();
                    let info = SystemInfoData {
                        view: replica.system_info.view(),
                        primary_id: replica.system_info.primary(),
                    };
                    if let Err(err) = replica.wal.rotate(stable, &info) {
                        error!("wal rotation failed, stopping replica: {}", err);
                        replica.stop.store(true, Ordering::Release);
                        break;
                    }
                    replica.sleep_unless_stopped(period);
                }
            })?);
        }

        // lag detection
        if self.config.checkpoint_enabled {
            let replica = self.clone();
            let period = if self.config.is_test_mode {
                Duration::from_secs(1)
            } else {
                Duration::from_secs(10)
            };
            threads.push(threadpool::spawn_named("health", move || {
                replica.sleep_unless_stopped(period);
                while !replica.stopped() {
                    if let Err(err) = replica.health_check_once() {
                        warn!("health check failed: {}", err);
                    }
                    replica.sleep_unless_stopped(period);
                }
            })?);
        }

        // heartbeats spread the key table and the primary advisory
        if self.config.heart_beat_enabled {
            let replica = self.clone();
            let period = if self.config.is_test_mode {
                Duration::from_secs(1)
            } else {
                Duration::from_secs(60)
            };
            threads.push(threadpool::spawn_named("heartbeat", move || {
                while !replica.stopped() {
                    if let Err(err) = replica.heartbeat_once() {
                        warn!("heartbeat failed: {}", err);
                    }
                    replica.sleep_unless_stopped(period);
                }
            })?);
        }

        Ok(())
    }

    /// Stops every worker thread and waits for them to drain.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let _ = handle.join();
        }
        if let Some(pool) = self.gate_pool.lock().take() {
            pool.join();
        }
    }
}

#[cfg(test)]
mod tests;
