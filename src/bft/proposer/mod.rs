//! Batches accepted client requests into proposals.
//!
//! Each replica acts as a proxy for its own clients: requests pool
//! up here and are cut into a `NEW_TXNS` batch, keyed by the batch's
//! hash, once the batching factor is reached or the flush deadline
//! passes. The batch travels to the primary, which proposes it.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::debug;

use crate::bft::communication::message::{
    BatchRequest, ClientRequestEntry, MessageKind, Request,
};
use crate::bft::communication::serialize;
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;

/// Default number of client requests folded into one batch.
pub const DEFAULT_BATCH_NUM: usize = 100;

struct Pool {
    pending: Vec<ClientRequestEntry>,
    oldest: Option<Instant>,
    local_id: u64,
}

/// Pools client requests and cuts proposals on this proxy replica.
pub struct Proposer {
    id: NodeId,
    batch_num: usize,
    flush_timeout: Duration,
    pool: Mutex<Pool>,
}

fn createtime_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Proposer {
    pub fn new(id: NodeId, batch_num: usize, flush_timeout: Duration) -> Self {
        Self {
            id,
            batch_num: batch_num.max(1),
            flush_timeout,
            pool: Mutex::new(Pool {
                pending: Vec::new(),
                oldest: None,
                local_id: 0,
            }),
        }
    }

    /// Accepts one client request, returning a `NEW_TXNS` batch if
    /// the batching factor was reached.
    pub fn accept(&self, request: &Request) -> Result<Option<Request>> {
        let mut pool = self.pool.lock();
        pool.pending.push(ClientRequestEntry {
            sender_id: request.sender_id(),
            data: request.data().to_vec(),
        });
        if pool.oldest.is_none() {
            pool.oldest = Some(Instant::now());
        }
        if pool.pending.len() >= self.batch_num {
            return Ok(Some(self.cut(&mut pool)?));
        }
        Ok(None)
    }

    /// Cuts a batch out of an aged, partially filled pool.
    ///
    /// The replica's proposer thread polls this on a short period.
    pub fn poll_flush(&self) -> Result<Option<Request>> {
        let mut pool = self.pool.lock();
        let expired = pool
            .oldest
            .map(|t| t.elapsed() >= self.flush_timeout)
            .unwrap_or(false);
        if !expired || pool.pending.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.cut(&mut pool)?))
    }

    /// The number of requests currently pooled.
    pub fn pending(&self) -> usize {
        self.pool.lock().pending.len()
    }

    fn cut(&self, pool: &mut Pool) -> Result<Request> {
        let client_requests = std::mem::take(&mut pool.pending);
        pool.oldest = None;
        pool.local_id += 1;

        let batch = BatchRequest {
            createtime: createtime_ms(),
            local_id: pool.local_id,
            proxy_id: self.id,
            seq: Default::default(),
            hash: Default::default(),
            client_requests,
        };
        debug!(
            local_id = batch.local_id,
            len = batch.client_requests.len(),
            "cutting batch"
        );

        let data = serialize::serialize(&batch)?;
        let mut request = Request::new(MessageKind::NewTxns, self.id);
        request.hash = Digest::of(&data[..]);
        request.data = data;
        Ok(request)
    }
}
