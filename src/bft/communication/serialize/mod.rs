//! Serialization of protocol messages and write-ahead log records.
//!
//! All encoding goes through this module, so the bytes fed to the
//! signing and hashing routines are produced by exactly one code
//! path on both the sending and the receiving side.

#[cfg(feature = "serialize_serde")]
use serde::{de::DeserializeOwned, Serialize};

use crate::bft::communication::message::{Request, WireMessage};
use crate::bft::error::*;

/// Serializes any protocol payload into its canonical bytes.
#[cfg(feature = "serialize_serde")]
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).wrapped(ErrorKind::CommunicationSerialize)
}

/// Deserializes a protocol payload from its canonical bytes.
#[cfg(feature = "serialize_serde")]
pub fn deserialize<T: DeserializeOwned>(raw: &[u8]) -> Result<T> {
    bincode::deserialize(raw).wrapped(ErrorKind::CommunicationSerialize)
}

/// Serializes a [`Request`] into the exact bytes signatures are
/// produced over.
pub fn serialize_request(request: &Request) -> Result<Vec<u8>> {
    serialize(request)
}

/// Deserializes a [`Request`] from a wire payload.
///
/// Failures are reported as [`ErrorKind::BadFraming`], since they can
/// only be caused by a malformed frame.
pub fn deserialize_request(raw: &[u8]) -> Result<Request> {
    bincode::deserialize(raw).wrapped(ErrorKind::BadFraming)
}

/// Serializes the body of a [`WireMessage`].
pub fn serialize_wire(message: &WireMessage) -> Result<Vec<u8>> {
    serialize(message)
}

/// Deserializes the body of a [`WireMessage`].
pub fn deserialize_wire(raw: &[u8]) -> Result<WireMessage> {
    bincode::deserialize(raw).wrapped(ErrorKind::BadFraming)
}
