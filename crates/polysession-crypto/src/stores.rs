//! Persistent key material and the Signal store traits over it.
//!
//! [`KeyMaterialStore`] is a cheap cloneable handle onto a
//! [`StorageBackend`]. It owns every piece of persisted state: the local
//! identity, registration id, one-time and signed prekeys, remote
//! identities (trust) and ratchet sessions. Clones share the same backend,
//! which is how the engine's `&mut` store parameters are satisfied without
//! a global lock.
//!
//! Backend key layout:
//!
//! | key                          | value                        |
//! |------------------------------|------------------------------|
//! | `local/identity`             | postcard identity key pair   |
//! | `local/registration-id`      | postcard `u32`               |
//! | `meta/prekey-next-id`        | postcard `u32`               |
//! | `meta/signed-prekey-current` | postcard `u32`               |
//! | `prekey/<id:010>`            | serialized `PreKeyRecord`    |
//! | `prekey-consumed/<id:010>`   | consuming handshake base key |
//! | `signed-prekey/<id:010>`     | serialized `SignedPreKeyRecord` |
//! | `identity/<user>.<device>`   | serialized remote identity   |
//! | `session/<user>.<device>`    | serialized `SessionRecord`   |

use std::sync::Arc;

use libsignal_protocol::{
    Direction, IdentityKey, IdentityKeyPair, IdentityKeyStore, KyberPreKeyId, KyberPreKeyRecord,
    KyberPreKeyStore, PreKeyId, PreKeyRecord, PreKeyStore, ProtocolAddress, SessionRecord,
    SessionStore, SignalProtocolError, SignedPreKeyId, SignedPreKeyRecord, SignedPreKeyStore,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::address::DeviceAddress;
use crate::backend::{MemoryBackend, StorageBackend};
use crate::error::{storage_to_protocol, StoreError};
use crate::identity::SerializableIdentityKeyPair;

const LOCAL_IDENTITY: &str = "local/identity";
const LOCAL_REGISTRATION_ID: &str = "local/registration-id";
const PREKEY_NEXT_ID: &str = "meta/prekey-next-id";
const SIGNED_PREKEY_CURRENT: &str = "meta/signed-prekey-current";
const PREKEY_PREFIX: &str = "prekey/";
const PREKEY_CONSUMED_PREFIX: &str = "prekey-consumed/";
const SIGNED_PREKEY_PREFIX: &str = "signed-prekey/";
const IDENTITY_PREFIX: &str = "identity/";
const SESSION_PREFIX: &str = "session/";

fn id_key(prefix: &str, id: u32) -> String {
    format!("{prefix}{id:010}")
}

fn address_key(prefix: &str, address: &DeviceAddress) -> String {
    format!("{prefix}{}", address.storage_key())
}

fn corrupt(key: &str, reason: impl ToString) -> StoreError {
    StoreError::CorruptRecord {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

#[derive(Clone)]
pub struct KeyMaterialStore {
    backend: Arc<dyn StorageBackend>,
}

impl KeyMaterialStore {
    /// Wrap an opened backend. The caller keeps the lifecycle: call
    /// [`flush`](Self::flush) or [`close`](Self::close) before shutdown.
    pub fn open(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::open(Arc::new(MemoryBackend::new()))
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.backend.flush()
    }

    pub fn close(self) -> Result<(), StoreError> {
        self.backend.flush()
    }

    fn get_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.backend.get(key)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
        }
    }

    fn put_value<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.backend.put(key, postcard::to_allocvec(value)?)
    }

    // ── Local identity ──────────────────────────────────────────────────

    pub fn identity_key_pair(&self) -> Result<Option<IdentityKeyPair>, StoreError> {
        let stored: Option<SerializableIdentityKeyPair> = self.get_value(LOCAL_IDENTITY)?;
        stored.map(|s| s.to_identity_key_pair()).transpose()
    }

    pub fn set_identity_key_pair(&self, pair: &IdentityKeyPair) -> Result<(), StoreError> {
        self.put_value(
            LOCAL_IDENTITY,
            &SerializableIdentityKeyPair::from_identity_key_pair(pair),
        )
    }

    pub fn registration_id(&self) -> Result<Option<u32>, StoreError> {
        self.get_value(LOCAL_REGISTRATION_ID)
    }

    pub fn set_registration_id(&self, id: u32) -> Result<(), StoreError> {
        self.put_value(LOCAL_REGISTRATION_ID, &id)
    }

    // ── One-time prekeys ────────────────────────────────────────────────

    pub fn store_pre_key(&self, id: u32, record: &PreKeyRecord) -> Result<(), StoreError> {
        let key = id_key(PREKEY_PREFIX, id);
        let bytes = record.serialize().map_err(|e| corrupt(&key, e))?;
        self.backend.put(&key, bytes)?;
        self.backend.take(&id_key(PREKEY_CONSUMED_PREFIX, id))?;

        let next = self.next_pre_key_id()?;
        if id >= next {
            self.put_value(PREKEY_NEXT_ID, &id.saturating_add(1))?;
        }
        Ok(())
    }

    pub fn load_pre_key(&self, id: u32) -> Result<Option<PreKeyRecord>, StoreError> {
        let key = id_key(PREKEY_PREFIX, id);
        match self.backend.get(&key)? {
            None => Ok(None),
            Some(bytes) => PreKeyRecord::deserialize(&bytes)
                .map(Some)
                .map_err(|e| corrupt(&key, e)),
        }
    }

    /// Atomically remove prekey `id` and leave a tombstone.
    ///
    /// Returns `false` if the prekey was already gone, i.e. another caller
    /// consumed it first.
    pub fn consume_pre_key(&self, id: u32) -> Result<bool, StoreError> {
        match self.backend.take(&id_key(PREKEY_PREFIX, id))? {
            Some(_) => {
                self.backend
                    .put(&id_key(PREKEY_CONSUMED_PREFIX, id), Vec::new())?;
                debug!(prekey_id = id, "one-time prekey consumed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn is_pre_key_consumed(&self, id: u32) -> Result<bool, StoreError> {
        Ok(self
            .backend
            .get(&id_key(PREKEY_CONSUMED_PREFIX, id))?
            .is_some())
    }

    /// Record the handshake base key that consumed prekey `id`, so a later
    /// message can be told apart as a replay of that handshake.
    pub fn record_pre_key_consumer(&self, id: u32, base_key: &[u8]) -> Result<(), StoreError> {
        self.backend
            .put(&id_key(PREKEY_CONSUMED_PREFIX, id), base_key.to_vec())
    }

    /// Whether prekey `id` was consumed by the handshake with `base_key`.
    pub fn pre_key_consumed_by(&self, id: u32, base_key: &[u8]) -> Result<bool, StoreError> {
        Ok(self
            .backend
            .get(&id_key(PREKEY_CONSUMED_PREFIX, id))?
            .is_some_and(|consumer| !consumer.is_empty() && consumer == base_key))
    }

    /// All unconsumed prekeys, ascending by id.
    pub fn pre_keys(&self) -> Result<Vec<PreKeyRecord>, StoreError> {
        let mut records = Vec::new();
        for key in self.backend.keys(PREKEY_PREFIX)? {
            // A concurrent consume may remove the key between listing and loading.
            if let Some(bytes) = self.backend.get(&key)? {
                records.push(PreKeyRecord::deserialize(&bytes).map_err(|e| corrupt(&key, e))?);
            }
        }
        Ok(records)
    }

    /// One past the highest prekey id ever stored.
    pub fn next_pre_key_id(&self) -> Result<u32, StoreError> {
        Ok(self.get_value(PREKEY_NEXT_ID)?.unwrap_or(1))
    }

    // ── Signed prekeys ──────────────────────────────────────────────────

    pub fn store_signed_pre_key(
        &self,
        id: u32,
        record: &SignedPreKeyRecord,
    ) -> Result<(), StoreError> {
        let key = id_key(SIGNED_PREKEY_PREFIX, id);
        let bytes = record.serialize().map_err(|e| corrupt(&key, e))?;
        self.backend.put(&key, bytes)
    }

    pub fn load_signed_pre_key(&self, id: u32) -> Result<Option<SignedPreKeyRecord>, StoreError> {
        let key = id_key(SIGNED_PREKEY_PREFIX, id);
        match self.backend.get(&key)? {
            None => Ok(None),
            Some(bytes) => SignedPreKeyRecord::deserialize(&bytes)
                .map(Some)
                .map_err(|e| corrupt(&key, e)),
        }
    }

    pub fn remove_signed_pre_key(&self, id: u32) -> Result<bool, StoreError> {
        Ok(self
            .backend
            .take(&id_key(SIGNED_PREKEY_PREFIX, id))?
            .is_some())
    }

    /// Ids of all stored signed prekeys, ascending.
    pub fn signed_pre_key_ids(&self) -> Result<Vec<u32>, StoreError> {
        self.backend
            .keys(SIGNED_PREKEY_PREFIX)?
            .iter()
            .map(|key| {
                key[SIGNED_PREKEY_PREFIX.len()..]
                    .parse()
                    .map_err(|e| corrupt(key, e))
            })
            .collect()
    }

    pub fn current_signed_pre_key_id(&self) -> Result<Option<u32>, StoreError> {
        self.get_value(SIGNED_PREKEY_CURRENT)
    }

    pub fn set_current_signed_pre_key_id(&self, id: u32) -> Result<(), StoreError> {
        self.put_value(SIGNED_PREKEY_CURRENT, &id)
    }

    // ── Remote identities ───────────────────────────────────────────────

    pub fn remote_identity(&self, address: &DeviceAddress) -> Result<Option<IdentityKey>, StoreError> {
        let key = address_key(IDENTITY_PREFIX, address);
        match self.backend.get(&key)? {
            None => Ok(None),
            Some(bytes) => IdentityKey::decode(&bytes)
                .map(Some)
                .map_err(|e| corrupt(&key, e)),
        }
    }

    /// Record `identity` for `address`. Returns true if a different key was
    /// replaced.
    pub fn save_remote_identity(
        &self,
        address: &DeviceAddress,
        identity: &IdentityKey,
    ) -> Result<bool, StoreError> {
        let key = address_key(IDENTITY_PREFIX, address);
        let serialized = identity.serialize().to_vec();
        let previous = self.backend.get(&key)?;
        self.backend.put(&key, serialized.clone())?;
        let changed = previous.is_some_and(|old| old != serialized);
        if changed {
            warn!(%address, "remote identity key replaced");
        }
        Ok(changed)
    }

    /// Forget the stored identity so the next bundle is trusted on first use.
    pub fn clear_remote_identity(&self, address: &DeviceAddress) -> Result<bool, StoreError> {
        Ok(self
            .backend
            .take(&address_key(IDENTITY_PREFIX, address))?
            .is_some())
    }

    // ── Sessions ────────────────────────────────────────────────────────

    pub fn load_session_record(
        &self,
        address: &DeviceAddress,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let key = address_key(SESSION_PREFIX, address);
        match self.backend.get(&key)? {
            None => Ok(None),
            Some(bytes) => SessionRecord::deserialize(&bytes)
                .map(Some)
                .map_err(|e| corrupt(&key, e)),
        }
    }

    pub fn store_session_record(
        &self,
        address: &DeviceAddress,
        record: &SessionRecord,
    ) -> Result<(), StoreError> {
        let key = address_key(SESSION_PREFIX, address);
        let bytes = record.serialize().map_err(|e| corrupt(&key, e))?;
        self.backend.put(&key, bytes)
    }

    pub fn remove_session(&self, address: &DeviceAddress) -> Result<bool, StoreError> {
        Ok(self
            .backend
            .take(&address_key(SESSION_PREFIX, address))?
            .is_some())
    }

    pub fn has_session(&self, address: &DeviceAddress) -> Result<bool, StoreError> {
        Ok(self
            .backend
            .get(&address_key(SESSION_PREFIX, address))?
            .is_some())
    }

    /// Device ids of `user_id` with a stored session, ascending.
    pub fn session_devices(&self, user_id: &str) -> Result<Vec<u32>, StoreError> {
        let prefix = format!("{SESSION_PREFIX}{user_id}.");
        let mut devices: Vec<u32> = self
            .backend
            .keys(&prefix)?
            .iter()
            .filter_map(|key| {
                let (user, device) = key[SESSION_PREFIX.len()..].rsplit_once('.')?;
                if user != user_id {
                    return None;
                }
                device.parse().ok()
            })
            .collect();
        devices.sort_unstable();
        Ok(devices)
    }
}

// ── Engine store traits ─────────────────────────────────────────────────

#[async_trait::async_trait(?Send)]
impl IdentityKeyStore for KeyMaterialStore {
    async fn get_identity_key_pair(&self) -> Result<IdentityKeyPair, SignalProtocolError> {
        self.identity_key_pair()
            .map_err(storage_to_protocol)?
            .ok_or_else(|| storage_to_protocol(StoreError::MissingLocalKey("identity key pair")))
    }

    async fn get_local_registration_id(&self) -> Result<u32, SignalProtocolError> {
        self.registration_id()
            .map_err(storage_to_protocol)?
            .ok_or_else(|| storage_to_protocol(StoreError::MissingLocalKey("registration id")))
    }

    async fn save_identity(
        &mut self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
    ) -> Result<bool, SignalProtocolError> {
        self.save_remote_identity(&DeviceAddress::from(address), identity)
            .map_err(storage_to_protocol)
    }

    async fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity: &IdentityKey,
        _direction: Direction,
    ) -> Result<bool, SignalProtocolError> {
        let address = DeviceAddress::from(address);
        match self.remote_identity(&address).map_err(storage_to_protocol)? {
            None => Ok(true), // Trust on first use
            Some(stored) => {
                let trusted = &stored == identity;
                if !trusted {
                    warn!(%address, "identity key differs from the trusted one");
                }
                Ok(trusted)
            }
        }
    }

    async fn get_identity(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<IdentityKey>, SignalProtocolError> {
        self.remote_identity(&DeviceAddress::from(address))
            .map_err(storage_to_protocol)
    }
}

#[async_trait::async_trait(?Send)]
impl PreKeyStore for KeyMaterialStore {
    async fn get_pre_key(&self, id: PreKeyId) -> Result<PreKeyRecord, SignalProtocolError> {
        self.load_pre_key(id.into())
            .map_err(storage_to_protocol)?
            .ok_or(SignalProtocolError::InvalidPreKeyId)
    }

    async fn save_pre_key(
        &mut self,
        id: PreKeyId,
        record: &PreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        self.store_pre_key(id.into(), record)
            .map_err(storage_to_protocol)
    }

    async fn remove_pre_key(&mut self, id: PreKeyId) -> Result<(), SignalProtocolError> {
        if self.consume_pre_key(id.into()).map_err(storage_to_protocol)? {
            Ok(())
        } else {
            // Lost a race with another consumer of the same prekey.
            Err(SignalProtocolError::InvalidPreKeyId)
        }
    }
}

#[async_trait::async_trait(?Send)]
impl SignedPreKeyStore for KeyMaterialStore {
    async fn get_signed_pre_key(
        &self,
        id: SignedPreKeyId,
    ) -> Result<SignedPreKeyRecord, SignalProtocolError> {
        self.load_signed_pre_key(id.into())
            .map_err(storage_to_protocol)?
            .ok_or(SignalProtocolError::InvalidSignedPreKeyId)
    }

    async fn save_signed_pre_key(
        &mut self,
        id: SignedPreKeyId,
        record: &SignedPreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        self.store_signed_pre_key(id.into(), record)
            .map_err(storage_to_protocol)
    }
}

#[async_trait::async_trait(?Send)]
impl SessionStore for KeyMaterialStore {
    async fn load_session(
        &self,
        address: &ProtocolAddress,
    ) -> Result<Option<SessionRecord>, SignalProtocolError> {
        self.load_session_record(&DeviceAddress::from(address))
            .map_err(storage_to_protocol)
    }

    async fn store_session(
        &mut self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<(), SignalProtocolError> {
        self.store_session_record(&DeviceAddress::from(address), record)
            .map_err(storage_to_protocol)
    }
}

// Post-quantum (Kyber) prekeys are not published by this layer, but the
// engine's prekey decrypt path requires the store.
#[async_trait::async_trait(?Send)]
impl KyberPreKeyStore for KeyMaterialStore {
    async fn get_kyber_pre_key(
        &self,
        _kyber_prekey_id: KyberPreKeyId,
    ) -> Result<KyberPreKeyRecord, SignalProtocolError> {
        Err(SignalProtocolError::InvalidKyberPreKeyId)
    }

    async fn save_kyber_pre_key(
        &mut self,
        _kyber_prekey_id: KyberPreKeyId,
        _record: &KyberPreKeyRecord,
    ) -> Result<(), SignalProtocolError> {
        Ok(())
    }

    async fn mark_kyber_pre_key_used(
        &mut self,
        _kyber_prekey_id: KyberPreKeyId,
    ) -> Result<(), SignalProtocolError> {
        Ok(())
    }
}
