//! Abstractions over different signature schemes.

#[cfg(feature = "crypto_signature_ring_ed25519")]
mod ring_ed25519;

#[cfg(feature = "crypto_signature_ring_ed25519")]
pub use ring_ed25519::{KeyPair, PublicKey, Signature};
