//! Abstractions over different crypto hash digest algorithms.

#[cfg(feature = "crypto_hash_ring_sha2")]
mod ring_sha2;

#[cfg(feature = "crypto_hash_ring_sha2")]
pub use ring_sha2::{Context, Digest};
