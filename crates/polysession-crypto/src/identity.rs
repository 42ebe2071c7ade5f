//! Identity key and registration id material.
//!
//! Each installation has one long-term Curve25519 identity key pair and one
//! registration id, both generated once and persisted in the key store.

use libsignal_protocol::{IdentityKey, IdentityKeyPair, KeyPair};
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::StoreError;

/// Largest registration id the engine hands out (14 bits, zero excluded).
pub const MAX_REGISTRATION_ID: u32 = 16380;

/// Persisted form of the local identity key pair.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SerializableIdentityKeyPair {
    /// 33-byte serialized Curve25519 public key (type byte + point).
    pub public_key: Vec<u8>,
    /// 32-byte Curve25519 private key.
    pub private_key: Vec<u8>,
}

impl SerializableIdentityKeyPair {
    pub fn to_identity_key_pair(&self) -> Result<IdentityKeyPair, StoreError> {
        let key_pair = KeyPair::from_public_and_private(&self.public_key, &self.private_key)
            .map_err(|e| StoreError::CorruptRecord {
                key: "local/identity".into(),
                reason: e.to_string(),
            })?;
        Ok(IdentityKeyPair::new(
            IdentityKey::new(key_pair.public_key),
            key_pair.private_key,
        ))
    }

    pub fn from_identity_key_pair(pair: &IdentityKeyPair) -> Self {
        Self {
            public_key: pair.public_key().serialize().to_vec(),
            private_key: pair.private_key().serialize().to_vec(),
        }
    }
}

pub fn generate_identity_key_pair() -> IdentityKeyPair {
    IdentityKeyPair::generate(&mut OsRng)
}

/// Draw a registration id in `1..=MAX_REGISTRATION_ID`.
///
/// Uniqueness across installations of the same account is best effort; a
/// collision confuses addressing but does not break the ratchet.
pub fn generate_registration_id() -> u32 {
    OsRng.gen_range(1..=MAX_REGISTRATION_ID)
}

/// Hex SHA-256 of the serialized public identity key, for out-of-band
/// comparison.
pub fn fingerprint(key: &IdentityKey) -> String {
    Sha256::digest(key.serialize())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
