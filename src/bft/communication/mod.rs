//! Communication primitives for `abraxas`, such as wire message
//! formats, the replica key table, and the seam to the external
//! network transport.

pub mod channel;
pub mod message;
pub mod serialize;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use std::sync::Arc;

use parking_lot::RwLock;

use crate::bft::collections::{self, HashMap};
use crate::bft::communication::channel::ChannelTx;
use crate::bft::communication::message::{Request, WireMessage};
use crate::bft::crypto::signature::{KeyPair, PublicKey};
use crate::bft::error::*;

/// Wraps a [`Request`] for the wire, signing its canonical bytes
/// when a key pair is available.
pub fn wire_message(
    request: &Request,
    node_id: NodeId,
    keypair: Option<&KeyPair>,
) -> Result<WireMessage> {
    match keypair {
        Some(kp) => WireMessage::signed(request, node_id, kp),
        None => WireMessage::unsigned(request),
    }
}

/// A `NodeId` represents the id of a process in the BFT system.
///
/// Replicas use ids in `1..=n`, with `n = 3f + 1`.
#[derive(Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct NodeId(u32);

impl NodeId {
    pub fn targets<I>(into_iterator: I) -> impl Iterator<Item = Self>
    where
        I: IntoIterator<Item = u32>,
    {
        into_iterator.into_iter().map(Self)
    }
}

impl From<u32> for NodeId {
    #[inline]
    fn from(id: u32) -> NodeId {
        NodeId(id)
    }
}

impl From<NodeId> for usize {
    #[inline]
    fn from(id: NodeId) -> usize {
        id.0 as usize
    }
}

impl From<NodeId> for u32 {
    #[inline]
    fn from(id: NodeId) -> u32 {
        id.0
    }
}

/// The table of peer public keys, learned from the static cluster
/// configuration and extended through heartbeats.
///
/// Keys are permanent for the epoch: a key already present is never
/// replaced. The table is copy-on-write under a reader/writer lock,
/// so readers never block each other.
pub struct KeyTable {
    inner: RwLock<Arc<HashMap<NodeId, PublicKey>>>,
}

impl KeyTable {
    /// Creates a key table holding the given initial keys.
    pub fn new(initial: HashMap<NodeId, PublicKey>) -> Self {
        Self {
            inner: RwLock::new(Arc::new(initial)),
        }
    }

    /// Looks up the public key of `id`.
    pub fn get(&self, id: NodeId) -> Option<PublicKey> {
        self.inner.read().get(&id).copied()
    }

    /// Adds a newly discovered public key, reporting whether the
    /// table changed. An existing key for `id` is left untouched.
    pub fn insert(&self, id: NodeId, key: PublicKey) -> bool {
        let mut guard = self.inner.write();
        if guard.contains_key(&id) {
            return false;
        }
        let mut next = collections::hash_map_capacity(guard.len() + 1);
        next.extend(guard.iter().map(|(k, v)| (*k, *v)));
        next.insert(id, key);
        *guard = Arc::new(next);
        true
    }

    /// Returns a snapshot of the whole table.
    pub fn snapshot(&self) -> Arc<HashMap<NodeId, PublicKey>> {
        self.inner.read().clone()
    }
}

/// The seam to the external network transport.
///
/// The transport owns the sockets and their accept loops; the core
/// only hands it frames to put on the wire. Send failures towards a
/// specific peer are tolerated by every caller, since the protocol
/// only needs `n - f` reachable peers.
pub trait NetworkNode: Send + Sync {
    /// Sends a message to a single peer.
    fn send(&self, message: WireMessage, target: NodeId) -> Result<()>;

    /// Sends a message to every peer in `targets`.
    fn broadcast(&self, message: WireMessage, targets: &[NodeId]) -> Result<()> {
        for &target in targets {
            // tolerate unreachable peers
            let _ = self.send(message.clone(), target);
        }
        Ok(())
    }
}

/// An in-process transport delivering frames over bounded channels.
///
/// Ships with the crate for tests and local experiments; a real
/// deployment plugs a TCP transport into [`NetworkNode`] instead.
pub struct LoopbackNetwork {
    peers: HashMap<NodeId, ChannelTx<Vec<u8>>>,
}

impl LoopbackNetwork {
    /// Creates a loopback transport delivering to the given per-peer
    /// input queues.
    pub fn new(peers: HashMap<NodeId, ChannelTx<Vec<u8>>>) -> Self {
        Self { peers }
    }
}

impl NetworkNode for LoopbackNetwork {
    fn send(&self, message: WireMessage, target: NodeId) -> Result<()> {
        let tx = self
            .peers
            .get(&target)
            .ok_or_else(|| Error::simple(ErrorKind::PeerUnreachable))?;
        let frame = message.to_bytes()?;
        tx.send(frame)
            .map_err(|e| e.swap_kind(ErrorKind::PeerUnreachable))
    }
}
