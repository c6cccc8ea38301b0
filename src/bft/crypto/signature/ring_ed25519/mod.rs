use std::fmt;

use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{
    self,
    KeyPair as _,
    Ed25519KeyPair,
    UnparsedPublicKey,
    ED25519,
};

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

#[cfg(feature = "serialize_serde")]
use serde_big_array::big_array;

use crate::bft::error::*;

#[cfg(feature = "serialize_serde")]
big_array! { BigArray; }

/// An asymmetric key pair, used to sign protocol messages.
pub struct KeyPair {
    inner: Ed25519KeyPair,
    public: PublicKey,
}

/// The public component of a `KeyPair`, used to verify signatures
/// produced by the matching secret key.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct PublicKey {
    bytes: [u8; PublicKey::LENGTH],
}

/// A detached signature over a slice of bytes.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(transparent)]
pub struct Signature(
    #[cfg_attr(feature = "serialize_serde", serde(with = "BigArray"))] [u8; Signature::LENGTH],
);

impl KeyPair {
    /// The size of the seed material of a `KeyPair` in bytes.
    pub const SEED_LENGTH: usize = 32;

    /// Constructs a `KeyPair` from raw seed material.
    ///
    /// Only the first `KeyPair::SEED_LENGTH` bytes of `raw_bytes`
    /// are consumed.
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() < Self::SEED_LENGTH {
            return Err("Seed material has an invalid length")
                .wrapped(ErrorKind::CryptoSignature);
        }
        let inner = Ed25519KeyPair::from_seed_unchecked(&raw_bytes[..Self::SEED_LENGTH])
            .simple_msg(ErrorKind::CryptoSignature, "Invalid key seed")?;
        let public = PublicKey::from_bytes(inner.public_key().as_ref())?;
        Ok(KeyPair { inner, public })
    }

    /// Generates a fresh `KeyPair` from the system's random source.
    pub fn generate() -> Result<Self> {
        let mut seed = [0; Self::SEED_LENGTH];
        SystemRandom::new()
            .fill(&mut seed[..])
            .simple_msg(ErrorKind::CryptoSignature, "Failed to generate key seed")?;
        Self::from_bytes(&seed[..])
    }

    /// Returns a copy of the public component of this `KeyPair`.
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Performs a cryptographic signature of `message`.
    pub fn sign(&self, message: &[u8]) -> Result<Signature> {
        let sig = self.inner.sign(message);
        Signature::from_bytes(sig.as_ref())
    }
}

impl PublicKey {
    /// The size of the memory representation of a `PublicKey` in bytes.
    pub const LENGTH: usize = 32;

    /// Constructs a `PublicKey` from a byte buffer of appropriate size.
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() < Self::LENGTH {
            return Err("Public key has an invalid length")
                .wrapped(ErrorKind::CryptoSignature);
        }
        let mut bytes = [0; Self::LENGTH];
        bytes.copy_from_slice(&raw_bytes[..Self::LENGTH]);
        Ok(PublicKey { bytes })
    }

    /// Verifies a `signature` over `message` against this key.
    pub fn verify(&self, message: &[u8], sig: &Signature) -> Result<()> {
        UnparsedPublicKey::new(&ED25519, &self.bytes[..])
            .verify(message, &sig.0[..])
            .simple_msg(ErrorKind::BadSignature, "Invalid signature")
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey(")?;
        for b in &self.bytes {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

impl Signature {
    /// The size of the memory representation of a `Signature` in bytes.
    pub const LENGTH: usize = signature::ED25519_PUBLIC_KEY_LEN * 2;

    /// Constructs a `Signature` from a byte buffer of appropriate size.
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() < Self::LENGTH {
            return Err("Signature has an invalid length")
                .wrapped(ErrorKind::CryptoSignature);
        }
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(&raw_bytes[..Self::LENGTH]);
        Ok(Signature(inner))
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::KeyPair;

    #[test]
    fn test_sign_verify_round_trip() {
        let kp = KeyPair::from_bytes(&[7; 32][..]).expect("key gen failed");
        let sig = kp.sign(b"the batch hash").expect("sign failed");
        kp.public_key()
            .verify(b"the batch hash", &sig)
            .expect("verify failed");
        assert!(kp.public_key().verify(b"another message", &sig).is_err());
    }

    #[test]
    fn test_deterministic_from_seed() {
        let a = KeyPair::from_bytes(&[1; 32][..]).unwrap();
        let b = KeyPair::from_bytes(&[1; 32][..]).unwrap();
        assert_eq!(a.public_key(), b.public_key());
    }
}
