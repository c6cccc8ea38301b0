//! User application execution business logic.
//!
//! Committed requests arrive here tagged with their sequence number;
//! the pipeline reorders them, feeds them to the application defined
//! executor in strictly increasing order with no gaps, and delivers
//! one reply per batch.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::bft::communication::channel::{self, ChannelRx, ChannelTx};
use crate::bft::communication::message::{BatchRequest, BatchResponse, Request};
use crate::bft::communication::serialize;
use crate::bft::error::*;
use crate::bft::metrics::Metrics;
use crate::bft::ordering::SeqNo;

// room for committed batches waiting on the execute thread
const EXECUTE_QUEUE_BOUND: usize = 8192;

/// The application state machine.
///
/// Exactly one `execute_batch` call is made per committed sequence
/// number, in strictly increasing order, unless the executor opts
/// into out-of-order execution.
pub trait TransactionExecutor: Send + Sync {
    /// Executes a batch of client requests, returning one reply per
    /// constituent request, or `None` when no reply is warranted.
    ///
    /// The provided implementation maps [`Self::execute_data`] over
    /// the batch, for applications that treat each payload as one
    /// opaque operation.
    fn execute_batch(&self, batch: BatchRequest) -> Result<Option<BatchResponse>> {
        let mut responses = Vec::with_capacity(batch.client_requests.len());
        for entry in &batch.client_requests {
            responses.push(self.execute_data(&entry.data[..])?.unwrap_or_default());
        }
        Ok(Some(BatchResponse {
            responses,
            ..Default::default()
        }))
    }

    /// Per-request alternative to `execute_batch`.
    fn execute_data(&self, _data: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Whether the framework should send replies back to clients.
    fn needs_response(&self) -> bool {
        true
    }

    /// Opting in dispatches every batch to an unordered execute
    /// queue as soon as it commits, while replies still flow to the
    /// client in sequence order.
    fn is_out_of_order(&self) -> bool {
        false
    }
}

/// The callbacks a replica hangs off the pipeline.
#[derive(Default)]
pub struct PipelineHooks {
    /// Invoked exactly once per sequence, on the thread that drains
    /// the priority map, before the batch is queued for execution.
    pub pre_execute: Option<Box<dyn Fn(&Request) + Send + Sync>>,
    /// Invoked after execution with the reply to route to the proxy.
    pub post_execute: Option<Box<dyn Fn(&Request, BatchResponse) + Send + Sync>>,
    /// Invoked after every advance of the next sequence to execute.
    pub seq_update: Option<Box<dyn Fn(SeqNo) + Send + Sync>>,
}

/// Applies committed batches to the executor in sequence order.
pub struct TransactionPipeline {
    executor: Arc<dyn TransactionExecutor>,
    hooks: RwLock<PipelineHooks>,
    metrics: Arc<Metrics>,
    // committed batches waiting for their predecessors
    candidates: Mutex<BTreeMap<u64, Request>>,
    // the sequence number the executor sees next; starts at 1
    next_execute_seq: AtomicU64,
    execute_tx: ChannelTx<Request>,
    execute_rx: ChannelRx<Request>,
    ooo_tx: ChannelTx<Request>,
    ooo_rx: ChannelRx<Request>,
    // cloned copies of ordered requests, feeding the checkpoint chain
    commit_sink: Mutex<Option<ChannelTx<Request>>>,
}

impl TransactionPipeline {
    pub fn new(executor: Arc<dyn TransactionExecutor>, metrics: Arc<Metrics>) -> Self {
        let (execute_tx, execute_rx) = channel::new_bounded(EXECUTE_QUEUE_BOUND);
        let (ooo_tx, ooo_rx) = channel::new_bounded(EXECUTE_QUEUE_BOUND);
        Self {
            executor,
            hooks: RwLock::new(PipelineHooks::default()),
            metrics,
            candidates: Mutex::new(BTreeMap::new()),
            next_execute_seq: AtomicU64::new(1),
            execute_tx,
            execute_rx,
            ooo_tx,
            ooo_rx,
            commit_sink: Mutex::new(None),
        }
    }

    /// Wires the queue that receives every ordered request, used by
    /// the checkpoint keeper to fold hashes in sequence order.
    pub fn set_commit_sink(&self, sink: ChannelTx<Request>) {
        *self.commit_sink.lock() = Some(sink);
    }

    pub fn set_pre_execute(&self, f: Box<dyn Fn(&Request) + Send + Sync>) {
        self.hooks.write().pre_execute = Some(f);
    }

    pub fn set_post_execute(&self, f: Box<dyn Fn(&Request, BatchResponse) + Send + Sync>) {
        self.hooks.write().post_execute = Some(f);
    }

    pub fn set_seq_update(&self, f: Box<dyn Fn(SeqNo) + Send + Sync>) {
        self.hooks.write().seq_update = Some(f);
    }

    /// The last sequence `S` such that `1..=S` have all been queued
    /// for execution.
    pub fn max_pending_executed_seq(&self) -> SeqNo {
        SeqNo::from(self.next_execute_seq.load(Ordering::Acquire) - 1)
    }

    /// Accepts a committed request, draining every prefix-contiguous
    /// batch into the execute queue.
    pub fn commit(&self, request: Request) -> Result<()> {
        if self.executor.is_out_of_order() {
            self.ooo_tx
                .send(request.clone())
                .map_err(|e| e.swap_kind(ErrorKind::Executable))?;
        }

        let mut candidates = self.candidates.lock();
        let seq = u64::from(request.seq);
        if seq < self.next_execute_seq.load(Ordering::Acquire) {
            debug!(seq, "request has already been executed");
            return Ok(());
        }
        candidates.insert(seq, request);

        loop {
            let next = self.next_execute_seq.load(Ordering::Acquire);
            let request = match candidates.remove(&next) {
                Some(r) => r,
                None => break,
            };
            {
                let hooks = self.hooks.read();
                if let Some(pre) = &hooks.pre_execute {
                    pre(&request);
                }
            }
            if let Some(sink) = self.commit_sink.lock().as_ref() {
                sink.send(request.clone())
                    .map_err(|e| e.swap_kind(ErrorKind::Executable))?;
            }
            self.execute_tx
                .send(request)
                .map_err(|e| e.swap_kind(ErrorKind::Executable))?;
            let next = next + 1;
            self.next_execute_seq.store(next, Ordering::Release);
            let hooks = self.hooks.read();
            if let Some(notify) = &hooks.seq_update {
                notify(SeqNo::from(next));
            }
        }
        Ok(())
    }

    /// Pops one batch off the execute queue and applies it.
    ///
    /// Reports whether any work was done; the replica's execute
    /// thread calls this in a loop, and tests call it directly.
    pub fn execute_once(&self, timeout: Duration) -> Result<bool> {
        let request = match self.execute_rx.recv_timeout(timeout) {
            Some(r) => r,
            None => return Ok(false),
        };

        // a no-op synthesized to fill a view change hole; nothing to
        // execute and nobody to answer
        if request.data.is_empty() {
            self.metrics.inc_batches_executed();
            return Ok(true);
        }

        let mut batch: BatchRequest = match serialize::deserialize(request.data()) {
            Ok(b) => b,
            Err(err) => {
                warn!(
                    seq = u64::from(request.seq),
                    "dropping undecodable committed batch: {}", err
                );
                return Ok(true);
            }
        };
        batch.seq = request.seq;
        batch.hash = request.hash;
        let (createtime, local_id, proxy_id) =
            (batch.createtime, batch.local_id, batch.proxy_id);

        let need_execute = !self.executor.is_out_of_order();
        let response = if need_execute {
            match self.executor.execute_batch(batch) {
                Ok(r) => r,
                Err(err) => {
                    warn!(seq = u64::from(request.seq), "executor failed: {}", err);
                    None
                }
            }
        } else {
            None
        };

        if self.executor.needs_response() {
            let mut response = response.unwrap_or_default();
            response.createtime = createtime;
            response.local_id = local_id;
            response.proxy_id = proxy_id;
            response.seq = request.seq;
            let hooks = self.hooks.read();
            if let Some(post) = &hooks.post_execute {
                post(&request, response);
            }
        }

        self.metrics.inc_batches_executed();
        Ok(true)
    }

    /// Pops one batch off the out-of-order queue and applies it,
    /// without producing a reply.
    pub fn execute_out_of_order_once(&self, timeout: Duration) -> Result<bool> {
        let request = match self.ooo_rx.recv_timeout(timeout) {
            Some(r) => r,
            None => return Ok(false),
        };
        if request.data.is_empty() {
            return Ok(true);
        }
        let mut batch: BatchRequest = match serialize::deserialize(request.data()) {
            Ok(b) => b,
            Err(_) => return Ok(true),
        };
        batch.seq = request.seq;
        batch.hash = request.hash;
        if let Err(err) = self.executor.execute_batch(batch) {
            warn!(
                seq = u64::from(request.seq),
                "out-of-order executor failed: {}", err
            );
        }
        Ok(true)
    }

    /// Whether the executor asked for the out-of-order queue.
    pub fn out_of_order(&self) -> bool {
        self.executor.is_out_of_order()
    }
}

#[cfg(test)]
mod tests;
