//! Polysession cryptographic layer: multi-device Signal Protocol sessions.
//!
//! This crate provides:
//! - Identity, registration id and prekey lifecycle (Curve25519 via libsignal)
//! - Pairwise session establishment per remote device (X3DH + Double Ratchet)
//! - Fan-out encryption to all of a user's devices and fan-in trial
//!   decryption of candidate ciphertexts
//! - Sealed payloads: one AES-128-GCM body, key wrapped per device
//! - Key material storage over pluggable backends, including an encrypted
//!   file backend

pub mod address;
pub mod backend;
pub mod cipher;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod persistence;
pub mod prekey;
pub mod registry;
pub mod sealed;
pub mod session;
pub mod stores;

#[cfg(test)]
mod test_support;

// Re-export key types for convenience
pub use address::DeviceAddress;
pub use backend::{MemoryBackend, StorageBackend};
pub use cipher::MultiDeviceCipher;
pub use envelope::{CandidateCiphertext, DeviceOutcomes, EncryptedEnvelope, Envelope, EnvelopeKind};
pub use error::{ErrorKind, SessionError, StoreError};
pub use identity::{fingerprint, generate_identity_key_pair, SerializableIdentityKeyPair};
pub use persistence::{EncryptedFileBackend, DEFAULT_KDF_ITERATIONS};
pub use prekey::{KeyLifecycleManager, INITIAL_PREKEY_COUNT, PREKEY_REPLENISH_THRESHOLD};
pub use registry::SessionRegistry;
pub use sealed::SealedMessage;
pub use session::{KeyBundle, PublicPreKey, SessionBuilder};
pub use stores::KeyMaterialStore;
