//! This module contains types associated with messages traded
//! between the system processes.

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::bft::communication::serialize;
use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::crypto::signature::{KeyPair, Signature};
use crate::bft::error::*;
use crate::bft::ordering::{Orderable, SeqNo};

/// The kind tag of a protocol message.
///
/// Every unit on the wire is a [`Request`] carrying one of these tags;
/// the message gate routes on it.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MessageKind {
    /// An opaque operation submitted by a client.
    ClientRequest,
    /// An executed batch's reply, routed back to the proxy replica.
    Response,
    /// A batch of client requests, forwarded to the primary.
    NewTxns,
    /// The primary's proposal of a batch at a sequence number.
    PrePrepare,
    /// A replica's vote on a proposal.
    Prepare,
    /// A replica's vote to execute a prepared proposal.
    Commit,
    /// A replica's running hash at a checkpoint water mark.
    Checkpoint,
    /// A vote to depose the current primary.
    ViewChange,
    /// The new primary's installation message.
    NewView,
    /// Periodic key table and primary advisory broadcast.
    HeartBeat,
    /// Read-only lookup of committed requests.
    Query,
    /// Read-only lookup of the replica's protocol state.
    ReplicaState,
    /// Generic envelope for auxiliary consensus traffic, such as the
    /// recovery data exchange.
    CustomConsensus,
}

impl MessageKind {
    /// Consensus messages are buffered while a view change is in
    /// progress, and replayed once the new view is installed.
    pub fn is_consensus(self) -> bool {
        matches!(
            self,
            MessageKind::NewTxns
                | MessageKind::PrePrepare
                | MessageKind::Prepare
                | MessageKind::Commit
        )
    }

    /// Messages of these kinds are appended to the write-ahead log
    /// before their state transition becomes observable.
    pub fn is_durable(self) -> bool {
        matches!(
            self,
            MessageKind::PrePrepare
                | MessageKind::Prepare
                | MessageKind::Commit
                | MessageKind::Checkpoint
                | MessageKind::NewView
        )
    }
}

/// The signature scheme of a [`SignatureInfo`].
///
/// Only `Ed25519` is produced by this crate; the remaining tags are
/// accepted on the wire for cross version compatibility.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SignatureScheme {
    Rsa,
    Ed25519,
    CmacAes,
}

/// A detached signature, tagged with the replica that produced it
/// and the scheme it used.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SignatureInfo {
    pub node_id: NodeId,
    pub signature: Signature,
    pub scheme: SignatureScheme,
}

impl SignatureInfo {
    /// Tags `signature` as an Ed25519 signature by `node_id`.
    pub fn ed25519(node_id: NodeId, signature: Signature) -> Self {
        Self {
            node_id,
            signature,
            scheme: SignatureScheme::Ed25519,
        }
    }
}

/// The universal protocol envelope.
///
/// Every sub-protocol message is carried in one of these, with the
/// payload serialized into `data` and summarized by `hash`.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Request {
    pub(crate) kind: MessageKind,
    pub(crate) sender_id: NodeId,
    pub(crate) view: SeqNo,
    pub(crate) seq: SeqNo,
    pub(crate) hash: Digest,
    #[cfg_attr(feature = "serialize_serde", serde(with = "serde_bytes"))]
    pub(crate) data: Vec<u8>,
    pub(crate) region_id: u32,
    pub(crate) committed_certs: Vec<SignatureInfo>,
    pub(crate) data_signature: Option<SignatureInfo>,
}

impl Request {
    /// Creates an empty `Request` of the given kind.
    pub fn new(kind: MessageKind, sender_id: NodeId) -> Self {
        Self {
            kind,
            sender_id,
            view: SeqNo::ZERO,
            seq: SeqNo::ZERO,
            hash: Digest::default(),
            data: Vec::new(),
            region_id: 0,
            committed_certs: Vec::new(),
            data_signature: None,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn sender_id(&self) -> NodeId {
        self.sender_id
    }

    pub fn view(&self) -> SeqNo {
        self.view
    }

    pub fn hash(&self) -> &Digest {
        &self.hash
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn region_id(&self) -> u32 {
        self.region_id
    }

    pub fn committed_certs(&self) -> &[SignatureInfo] {
        &self.committed_certs
    }

    pub fn data_signature(&self) -> Option<&SignatureInfo> {
        self.data_signature.as_ref()
    }

    /// The canonical byte representation of this `Request`.
    ///
    /// The same bytes are used to sign and to verify, so the hashed
    /// input is identical on both sides by construction.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        serialize::serialize_request(self)
    }
}

impl Orderable for Request {
    fn sequence_number(&self) -> SeqNo {
        self.seq
    }
}

/// A message to be sent over the wire: one serialized [`Request`]
/// plus an optional signature block over those exact bytes.
///
/// The transport frames a `WireMessage` with an 8 byte little endian
/// length prefix.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone)]
pub struct WireMessage {
    #[cfg_attr(feature = "serialize_serde", serde(with = "serde_bytes"))]
    pub(crate) payload: Vec<u8>,
    pub(crate) signature: Option<SignatureInfo>,
}

impl WireMessage {
    /// The size of the length prefix preceding a `WireMessage`.
    pub const PREFIX_LENGTH: usize = 8;

    /// Constructs a new message to be sent over the wire, signing the
    /// serialized request with `keypair`.
    pub fn signed(request: &Request, node_id: NodeId, keypair: &KeyPair) -> Result<Self> {
        let payload = request.canonical_bytes()?;
        let signature = keypair.sign(&payload[..])?;
        Ok(Self {
            payload,
            signature: Some(SignatureInfo::ed25519(node_id, signature)),
        })
    }

    /// Constructs a new unsigned message to be sent over the wire.
    ///
    /// Only valid when signature verification is disabled cluster wide.
    pub fn unsigned(request: &Request) -> Result<Self> {
        let payload = request.canonical_bytes()?;
        Ok(Self {
            payload,
            signature: None,
        })
    }

    /// Returns a reference to the payload bytes of the `WireMessage`.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns a reference to the signature block, if present.
    pub fn signature(&self) -> Option<&SignatureInfo> {
        self.signature.as_ref()
    }

    /// Serializes this message into a length prefixed frame.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let body = serialize::serialize_wire(self)?;
        let mut buf = Vec::with_capacity(Self::PREFIX_LENGTH + body.len());
        buf.extend_from_slice(&(body.len() as u64).to_le_bytes());
        buf.extend_from_slice(&body[..]);
        Ok(buf)
    }

    /// Deserializes a length prefixed frame into a `WireMessage`.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::PREFIX_LENGTH {
            return Err("Frame shorter than its length prefix").wrapped(ErrorKind::BadFraming);
        }
        let mut prefix = [0; Self::PREFIX_LENGTH];
        prefix.copy_from_slice(&buf[..Self::PREFIX_LENGTH]);
        let len = u64::from_le_bytes(prefix) as usize;
        let body = &buf[Self::PREFIX_LENGTH..];
        if body.len() < len {
            return Err("Frame truncated").wrapped(ErrorKind::BadFraming);
        }
        serialize::deserialize_wire(&body[..len])
    }
}

/// One client operation inside a [`BatchRequest`].
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ClientRequestEntry {
    pub sender_id: NodeId,
    #[cfg_attr(feature = "serialize_serde", serde(with = "serde_bytes"))]
    pub data: Vec<u8>,
}

/// A batch of client requests, cut by a proxy replica and proposed
/// by the primary as one consensus unit.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct BatchRequest {
    pub createtime: u64,
    pub local_id: u64,
    pub proxy_id: NodeId,
    pub seq: SeqNo,
    pub hash: Digest,
    pub client_requests: Vec<ClientRequestEntry>,
}

/// The executor's replies for one [`BatchRequest`], one entry per
/// constituent client request.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct BatchResponse {
    pub createtime: u64,
    pub local_id: u64,
    pub proxy_id: NodeId,
    pub seq: SeqNo,
    pub responses: Vec<Vec<u8>>,
}

/// The payload of a `Checkpoint` message: the sender's running hash
/// at a water mark, signed.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CheckpointData {
    pub seq: SeqNo,
    pub hash: Digest,
    pub hash_signature: Option<SignatureInfo>,
}

/// A checkpoint certified by `2f + 1` signatures over its hash.
///
/// The genesis checkpoint (`seq == 0`) carries no signatures.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct StableCheckpoint {
    pub seq: SeqNo,
    pub hash: Digest,
    pub signatures: Vec<SignatureInfo>,
}

/// One proof that a request prepared: the vote message itself, plus
/// the envelope signature its sender produced over it.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RequestProof {
    pub request: Request,
    pub signature: Option<SignatureInfo>,
}

/// The `2f + 1` proofs that a sequence number prepared locally.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PreparedCertificate {
    pub seq: SeqNo,
    pub proofs: Vec<RequestProof>,
}

/// The payload of a `ViewChange` message.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ViewChangeData {
    pub view: SeqNo,
    pub stable_ckpt: StableCheckpoint,
    pub prepared: Vec<PreparedCertificate>,
}

/// The payload of a `NewView` message: the view changes that elected
/// the new primary, plus the requests it re-proposes.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NewViewData {
    pub view: SeqNo,
    pub view_changes: Vec<ViewChangeData>,
    pub requests: Vec<Request>,
}

/// The payload of a `HeartBeat` message: the sender's key table and
/// its primary advisory.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HeartBeatData {
    pub public_keys: Vec<(NodeId, Vec<u8>)>,
    pub primary: NodeId,
    pub view: SeqNo,
}

/// The header of a write-ahead log segment.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SystemInfoData {
    pub view: SeqNo,
    pub primary_id: NodeId,
}

/// A committed request bundled with the commit certificates proving
/// `2f + 1` replicas voted for it, used by the recovery exchange.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RequestWithProof {
    pub seq: SeqNo,
    pub request: Request,
    pub proofs: Vec<SignatureInfo>,
}

/// Auxiliary consensus traffic, carried in `CustomConsensus`
/// envelopes.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RecoveryMessage {
    /// A lagging replica asks for the committed requests in
    /// `(min_seq, max_seq]`.
    Query { min_seq: SeqNo, max_seq: SeqNo },
    /// A peer's answer, with proofs.
    Data { requests: Vec<RequestWithProof> },
}

/// The payload of a read-only `Query` message.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct QueryData {
    pub min_seq: SeqNo,
    pub max_seq: SeqNo,
}

/// The answer to a read-only `Query`.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct QueryResponse {
    pub requests: Vec<Request>,
}

/// A snapshot of the replica's protocol state, answering a
/// `ReplicaState` message.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ReplicaStateData {
    pub view: SeqNo,
    pub primary: NodeId,
    pub stable_seq: SeqNo,
    pub max_seq: SeqNo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::communication::NodeId;
    use crate::bft::crypto::hash::Digest;
    use crate::bft::crypto::signature::KeyPair;
    use crate::bft::ordering::SeqNo;

    fn sample_request() -> Request {
        let mut req = Request::new(MessageKind::PrePrepare, NodeId::from(1u32));
        req.view = SeqNo::from(1);
        req.seq = SeqNo::from(7);
        req.data = b"a batch of requests".to_vec();
        req.hash = Digest::of(&req.data[..]);
        req
    }

    #[test]
    fn test_wire_round_trip() {
        let req = sample_request();
        let kp = KeyPair::from_bytes(&[3; 32][..]).unwrap();
        let wm = WireMessage::signed(&req, NodeId::from(1u32), &kp).unwrap();
        let bytes = wm.to_bytes().unwrap();
        let parsed = WireMessage::from_bytes(&bytes[..]).unwrap();
        assert_eq!(parsed.payload(), wm.payload());
        let orig_sig = wm.signature().unwrap();
        let new_sig = parsed.signature().unwrap();
        assert_eq!(orig_sig.node_id, new_sig.node_id);
        assert_eq!(orig_sig.signature, new_sig.signature);
        // round trip yields byte identical frames
        assert_eq!(parsed.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_wire_rejects_truncated_frames() {
        let req = sample_request();
        let wm = WireMessage::unsigned(&req).unwrap();
        let bytes = wm.to_bytes().unwrap();
        assert!(WireMessage::from_bytes(&bytes[..4]).is_err());
        assert!(WireMessage::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_envelope_signature_covers_payload() {
        let req = sample_request();
        let kp = KeyPair::from_bytes(&[3; 32][..]).unwrap();
        let wm = WireMessage::signed(&req, NodeId::from(1u32), &kp).unwrap();
        let sig = wm.signature().unwrap();
        kp.public_key()
            .verify(wm.payload(), &sig.signature)
            .expect("signature must cover the canonical request bytes");
    }

    #[test]
    fn test_canonical_bytes_are_deterministic() {
        let req = sample_request();
        assert_eq!(
            req.canonical_bytes().unwrap(),
            req.canonical_bytes().unwrap()
        );
    }
}
