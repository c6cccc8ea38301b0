//! The log of committed requests, indexed by sequence number.
//!
//! The store sits behind a trait so a persistent backend can replace
//! the in-memory one without touching the consensus layer.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::bft::communication::message::Request;
use crate::bft::ordering::{Orderable, SeqNo};

/// Storage for committed requests.
///
/// Writers are the execution pipeline and the recovery exchange;
/// readers are the checkpoint keeper, the view change sub-protocol
/// and the read-only query path.
pub trait TxnStore: Send + Sync {
    /// Stores a committed request under its sequence number.
    fn put(&self, request: Request);

    /// Fetches the committed request at `seq`, if present.
    fn get(&self, seq: SeqNo) -> Option<Request>;

    /// Fetches every committed request with `min < seq <= max`.
    fn range(&self, min: SeqNo, max: SeqNo) -> Vec<Request>;

    /// The largest committed sequence number seen so far.
    fn max_seq(&self) -> SeqNo;
}

/// An in-memory `TxnStore`.
pub struct MemoryLog {
    inner: Mutex<BTreeMap<u64, Request>>,
    max_seq: AtomicU64,
}

impl MemoryLog {
    /// Creates an empty in-memory log.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
            max_seq: AtomicU64::new(0),
        }
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnStore for MemoryLog {
    fn put(&self, request: Request) {
        let seq = u64::from(request.sequence_number());
        self.max_seq.fetch_max(seq, Ordering::AcqRel);
        self.inner.lock().insert(seq, request);
    }

    fn get(&self, seq: SeqNo) -> Option<Request> {
        self.inner.lock().get(&u64::from(seq)).cloned()
    }

    fn range(&self, min: SeqNo, max: SeqNo) -> Vec<Request> {
        let (min, max) = (u64::from(min), u64::from(max));
        self.inner
            .lock()
            .range(min.saturating_add(1)..=max)
            .map(|(_, req)| req.clone())
            .collect()
    }

    fn max_seq(&self) -> SeqNo {
        SeqNo::from(self.max_seq.load(Ordering::Acquire))
    }
}
