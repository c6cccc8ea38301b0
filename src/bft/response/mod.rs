//! Correlates executed batch replies back to waiting clients.
//!
//! Each replica replies to the clients it proxies. A reply only goes
//! out once `f + 1` byte-identical responses from distinct replicas
//! arrived for the same `(proxy_id, local_id)` pair, so a lone
//! faulty replica can never speak for the cluster.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::bft::collections::{self, HashMap, OrderedMap, SenderBitmap};
use crate::bft::communication::message::{BatchResponse, Request};
use crate::bft::communication::serialize;
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;
use crate::bft::metrics::Metrics;

/// The seam to the client facing channel: the transport implements
/// this to push a matched reply back down the client's socket.
pub trait ClientReplier: Send + Sync {
    /// Delivers the agreed reply for `(proxy_id, local_id)`.
    fn reply(&self, proxy_id: NodeId, local_id: u64, response: BatchResponse) -> Result<()>;
}

/// A `ClientReplier` that drops every reply, for replicas without
/// attached clients.
pub struct NullReplier;

impl ClientReplier for NullReplier {
    fn reply(&self, _proxy_id: NodeId, _local_id: u64, _response: BatchResponse) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct ResponseEntry {
    // votes per response content hash
    votes: HashMap<Digest, SenderBitmap>,
    done: bool,
}

// answered and in-flight correlations kept before the oldest are
// forgotten
const TABLE_CAP: usize = 4096;

/// Counts `RESPONSE` messages until `f + 1` replicas agree.
pub struct ResponseManager {
    f: usize,
    replier: Arc<dyn ClientReplier>,
    metrics: Arc<Metrics>,
    table: Mutex<OrderedMap<(u32, u64), ResponseEntry>>,
}

impl ResponseManager {
    pub fn new(f: usize, replier: Arc<dyn ClientReplier>, metrics: Arc<Metrics>) -> Self {
        Self {
            f,
            replier,
            metrics,
            table: Mutex::new(collections::ordered_map()),
        }
    }

    /// Handles one `RESPONSE` message from a peer replica.
    ///
    /// Duplicate votes from the same sender are idempotent; content
    /// is compared by the digest of the serialized reply.
    pub fn process_response(&self, request: &Request) -> Result<()> {
        let response: BatchResponse = serialize::deserialize(request.data())?;
        let key = (u32::from(response.proxy_id), response.local_id);
        let content = Digest::of(request.data());

        let matched = {
            let mut table = self.table.lock();
            if !table.contains_key(&key) {
                table.insert(key, ResponseEntry::default());
                while table.len() > TABLE_CAP {
                    table.pop_front();
                }
            }
            let entry = match table.get_mut(&key) {
                Some(entry) => entry,
                None => return Ok(()),
            };
            if entry.done {
                // stragglers after the reply went out; the tombstone
                // keeps them from answering the client twice
                return Ok(());
            }
            let votes = entry.votes.entry(content).or_insert_with(SenderBitmap::new);
            if !votes.set(request.sender_id()) {
                return Err(Error::simple(ErrorKind::DuplicateVote));
            }
            if votes.count() >= self.f + 1 {
                entry.done = true;
                entry.votes.clear();
                true
            } else {
                false
            }
        };

        if matched {
            debug!(
                proxy = key.0,
                local_id = key.1,
                "reply matched by f + 1 replicas"
            );
            self.metrics.inc_responses_matched();
            self.replier
                .reply(response.proxy_id, response.local_id, response)?;
        }
        Ok(())
    }
}
