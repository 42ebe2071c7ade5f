//! Key lifecycle: identity, registration id, one-time and signed prekeys.
//!
//! Pre-keys are one-time-use Curve25519 key pairs used in the X3DH
//! key agreement protocol. Signed pre-keys are medium-term keys
//! signed by the identity key and rotated periodically; the previous one
//! is kept for a while so in-flight session setups still complete.

use libsignal_protocol::{
    GenericSignedPreKey, IdentityKeyPair, KeyPair, PreKeyId, PreKeyRecord, SignedPreKeyId,
    SignedPreKeyRecord, Timestamp,
};
use rand::rngs::OsRng;
use tracing::{info, warn};

use crate::error::{SessionError, StoreError};
use crate::identity::{generate_identity_key_pair, generate_registration_id};
use crate::session::{KeyBundle, PublicPreKey};
use crate::stores::KeyMaterialStore;

/// Number of one-time pre-keys to generate initially.
pub const INITIAL_PREKEY_COUNT: u32 = 100;

/// Threshold below which we should replenish pre-keys.
pub const PREKEY_REPLENISH_THRESHOLD: u32 = 10;

fn key_generation(context: &str, err: impl std::fmt::Display) -> SessionError {
    SessionError::KeyGeneration(format!("{context}: {err}"))
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub struct KeyLifecycleManager {
    store: KeyMaterialStore,
}

impl KeyLifecycleManager {
    pub fn new(store: KeyMaterialStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &KeyMaterialStore {
        &self.store
    }

    /// Generate and persist a fresh identity key pair.
    ///
    /// Overwrites any existing identity. Every session peers hold with this
    /// installation becomes unverifiable afterwards, so callers must guard
    /// against accidental regeneration.
    pub fn generate_identity(&self) -> Result<IdentityKeyPair, SessionError> {
        if self.store.identity_key_pair()?.is_some() {
            warn!("overwriting existing identity key pair");
        }
        let pair = generate_identity_key_pair();
        self.store.set_identity_key_pair(&pair)?;
        info!("identity key pair generated");
        Ok(pair)
    }

    pub fn generate_registration_id(&self) -> Result<u32, SessionError> {
        let id = generate_registration_id();
        self.store.set_registration_id(id)?;
        info!(registration_id = id, "registration id generated");
        Ok(id)
    }

    /// Generate `count` prekeys with ids `start_id..start_id + count`.
    ///
    /// Ids already present in the store are overwritten without notice.
    pub fn generate_pre_keys(
        &self,
        start_id: u32,
        count: u32,
    ) -> Result<Vec<PreKeyRecord>, SessionError> {
        if count > 0 && start_id.checked_add(count - 1).is_none() {
            return Err(SessionError::KeyGeneration(format!(
                "prekey ids {start_id}+{count} overflow the id space"
            )));
        }

        let mut records = Vec::with_capacity(count as usize);
        for id in (0..count).map(|i| start_id + i) {
            let key_pair = KeyPair::generate(&mut OsRng);
            let record = PreKeyRecord::new(PreKeyId::from(id), &key_pair);
            self.store.store_pre_key(id, &record)?;
            records.push(record);
        }

        info!(start_id, count, "one-time prekeys generated");
        Ok(records)
    }

    /// Generate a signed prekey under `id`, signed by `identity`, and make it
    /// the current one.
    pub fn generate_signed_pre_key(
        &self,
        identity: &IdentityKeyPair,
        id: u32,
    ) -> Result<SignedPreKeyRecord, SessionError> {
        let key_pair = KeyPair::generate(&mut OsRng);
        let signature = identity
            .private_key()
            .calculate_signature(&key_pair.public_key.serialize(), &mut OsRng)
            .map_err(|e| key_generation("signing prekey", e))?;

        let record = SignedPreKeyRecord::new(
            SignedPreKeyId::from(id),
            Timestamp::from_epoch_millis(now_millis()),
            &key_pair,
            &signature,
        );
        self.store.store_signed_pre_key(id, &record)?;
        self.store.set_current_signed_pre_key_id(id)?;

        info!(signed_prekey_id = id, "signed prekey generated");
        Ok(record)
    }

    /// Unconsumed one-time prekeys, ascending by id.
    pub fn list_available_pre_keys(&self) -> Result<Vec<PreKeyRecord>, SessionError> {
        Ok(self.store.pre_keys()?)
    }

    /// First id never handed out before, consumed ids included.
    pub fn next_pre_key_id(&self) -> Result<u32, SessionError> {
        Ok(self.store.next_pre_key_id()?)
    }

    /// Top up the prekey pool once it drops below `threshold`.
    ///
    /// Returns the newly generated records for publishing, or an empty list
    /// if the pool is still large enough.
    pub fn replenish_pre_keys(
        &self,
        threshold: u32,
        batch: u32,
    ) -> Result<Vec<PreKeyRecord>, SessionError> {
        let available = self.store.pre_keys()?.len();
        if available >= threshold as usize {
            return Ok(Vec::new());
        }
        let start_id = self.next_pre_key_id()?;
        info!(available, start_id, batch, "replenishing one-time prekeys");
        self.generate_pre_keys(start_id, batch)
    }

    /// Generate the successor of the current signed prekey using the
    /// stored identity.
    pub fn rotate_signed_pre_key(&self) -> Result<SignedPreKeyRecord, SessionError> {
        let identity = self
            .store
            .identity_key_pair()?
            .ok_or(StoreError::MissingLocalKey("identity key pair"))?;
        let next_id = match self.store.current_signed_pre_key_id()? {
            Some(current) => current
                .checked_add(1)
                .ok_or_else(|| SessionError::KeyGeneration("signed prekey ids exhausted".into()))?,
            None => 1,
        };
        self.generate_signed_pre_key(&identity, next_id)
    }

    /// Keep the newest `keep` signed prekeys (and always the current one).
    /// Returns the ids removed.
    pub fn prune_signed_pre_keys(&self, keep: usize) -> Result<Vec<u32>, SessionError> {
        let current = self.store.current_signed_pre_key_id()?;
        let ids = self.store.signed_pre_key_ids()?;
        let cutoff = ids.len().saturating_sub(keep);

        let mut removed = Vec::new();
        for id in ids.into_iter().take(cutoff) {
            if Some(id) == current {
                continue;
            }
            if self.store.remove_signed_pre_key(id)? {
                removed.push(id);
            }
        }
        if !removed.is_empty() {
            info!(?removed, "pruned signed prekeys");
        }
        Ok(removed)
    }

    /// The publishable bundle for this installation: identity, current
    /// signed prekey and the lowest available one-time prekey.
    pub fn local_bundle(&self) -> Result<KeyBundle, SessionError> {
        let identity = self
            .store
            .identity_key_pair()?
            .ok_or(StoreError::MissingLocalKey("identity key pair"))?;
        let registration_id = self
            .store
            .registration_id()?
            .ok_or(StoreError::MissingLocalKey("registration id"))?;
        let signed_id = self
            .store
            .current_signed_pre_key_id()?
            .ok_or(StoreError::MissingLocalKey("signed prekey"))?;
        let signed = self
            .store
            .load_signed_pre_key(signed_id)?
            .ok_or(StoreError::MissingLocalKey("signed prekey"))?;

        let pre_key = match self.store.pre_keys()?.first() {
            Some(record) => Some(PublicPreKey::from_record(record)?),
            None => None,
        };

        Ok(KeyBundle {
            registration_id,
            identity_key: identity.identity_key().serialize().to_vec(),
            signed_pre_key_id: signed_id,
            signed_pre_key: signed
                .public_key()
                .map_err(|e| key_generation("signed prekey public key", e))?
                .serialize()
                .to_vec(),
            signed_pre_key_signature: signed
                .signature()
                .map_err(|e| key_generation("signed prekey signature", e))?,
            pre_key,
        })
    }
}
