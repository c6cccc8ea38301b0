use std::fmt;

use ring::digest::{self, SHA256, SHA256_OUTPUT_LEN};

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::bft::error::*;

/// An incremental hashing context.
pub struct Context {
    inner: digest::Context,
}

/// The result of applying a hash function to a slice of bytes.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct Digest([u8; Digest::LENGTH]);

impl Context {
    /// Creates a new hashing context.
    pub fn new() -> Self {
        let inner = digest::Context::new(&SHA256);
        Context { inner }
    }

    /// Feeds more data into the hashing context.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Consumes the context, returning the digest of all the
    /// data fed into it.
    pub fn finish(self) -> Digest {
        let h = self.inner.finish();
        Digest::from_bytes_unchecked(h.as_ref())
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new()
    }
}

impl Digest {
    /// The size of the memory representation of a `Digest` in bytes.
    pub const LENGTH: usize = SHA256_OUTPUT_LEN;

    /// Hashes a slice of bytes in one go.
    pub fn of(data: &[u8]) -> Self {
        let mut ctx = Context::new();
        ctx.update(data);
        ctx.finish()
    }

    /// Constructs a `Digest` from a byte buffer of appropriate size.
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() < Self::LENGTH {
            return Err("Digest has an invalid length").wrapped(ErrorKind::CryptoHash);
        }
        Ok(Self::from_bytes_unchecked(raw_bytes))
    }

    fn from_bytes_unchecked(raw_bytes: &[u8]) -> Self {
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(&raw_bytes[..Self::LENGTH]);
        Self(inner)
    }

    /// Folds another digest into this one, yielding the digest of
    /// the concatenation of the two.
    ///
    /// This is the step function of the running hash chain kept over
    /// executed request hashes between two checkpoints.
    pub fn chain(&self, next: &Digest) -> Digest {
        let mut ctx = Context::new();
        ctx.update(&self.0[..]);
        ctx.update(&next.0[..]);
        ctx.finish()
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}
