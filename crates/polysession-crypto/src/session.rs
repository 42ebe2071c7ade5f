//! Session establishment from remote key bundles.
//!
//! Uses X3DH key agreement to establish one session per remote device; the
//! Double Ratchet then takes over for every message on that session.

use std::sync::Arc;

use libsignal_protocol::{
    IdentityKey, PreKeyBundle, PreKeyId, PreKeyRecord, PublicKey, SignedPreKeyId,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::address::DeviceAddress;
use crate::envelope::DeviceOutcomes;
use crate::error::SessionError;
use crate::registry::SessionRegistry;
use crate::stores::KeyMaterialStore;

/// A one-time prekey's public portion for protocol transmission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicPreKey {
    pub id: u32,
    pub public_key: Vec<u8>,
}

impl PublicPreKey {
    pub fn from_record(record: &PreKeyRecord) -> Result<Self, SessionError> {
        let id = record
            .id()
            .map_err(|e| SessionError::KeyGeneration(format!("prekey id: {e}")))?;
        let public_key = record
            .public_key()
            .map_err(|e| SessionError::KeyGeneration(format!("prekey public key: {e}")))?;
        Ok(Self {
            id: id.into(),
            public_key: public_key.serialize().to_vec(),
        })
    }
}

/// Public key material a remote device publishes so others can open a
/// session with it. Byte fields are the engine's serialized forms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundle {
    pub registration_id: u32,
    pub identity_key: Vec<u8>,
    pub signed_pre_key_id: u32,
    pub signed_pre_key: Vec<u8>,
    pub signed_pre_key_signature: Vec<u8>,
    pub pre_key: Option<PublicPreKey>,
}

impl KeyBundle {
    /// Decode into the engine's bundle for `address`.
    pub fn to_prekey_bundle(&self, address: &DeviceAddress) -> Result<PreKeyBundle, SessionError> {
        let invalid = |field: &str, err: libsignal_protocol::SignalProtocolError| {
            SessionError::InvalidKey {
                address: address.clone(),
                reason: format!("{field}: {err}"),
            }
        };

        let identity_key =
            IdentityKey::decode(&self.identity_key).map_err(|e| invalid("identity key", e))?;
        let signed_pre_key = PublicKey::deserialize(&self.signed_pre_key)
            .map_err(|e| invalid("signed prekey", e))?;
        let pre_key = match &self.pre_key {
            Some(pk) => Some((
                PreKeyId::from(pk.id),
                PublicKey::deserialize(&pk.public_key).map_err(|e| invalid("one-time prekey", e))?,
            )),
            None => None,
        };

        PreKeyBundle::new(
            self.registration_id,
            address.device_id.into(),
            pre_key,
            SignedPreKeyId::from(self.signed_pre_key_id),
            signed_pre_key,
            self.signed_pre_key_signature.clone(),
            identity_key,
        )
        .map_err(|e| invalid("bundle", e))
    }
}

/// Turns a remote user's per-device bundles into established sessions.
pub struct SessionBuilder {
    store: KeyMaterialStore,
    registry: Arc<SessionRegistry>,
}

impl SessionBuilder {
    pub fn new(store: KeyMaterialStore, registry: Arc<SessionRegistry>) -> Self {
        Self { store, registry }
    }

    /// Establish one session per `(device_id, bundle)`.
    ///
    /// Each device succeeds or fails on its own: a malformed bundle yields
    /// `InvalidKey`, a changed identity `UntrustedIdentity`, and the
    /// remaining devices are still attempted. Only storage failures abort
    /// the call. An existing session for a device is replaced.
    pub async fn build_sessions(
        &self,
        user_id: &str,
        bundles: &[(u32, KeyBundle)],
    ) -> Result<DeviceOutcomes<()>, SessionError> {
        let mut outcomes = DeviceOutcomes::default();

        for (device_id, bundle) in bundles {
            let address = DeviceAddress::new(user_id, *device_id);
            match self.build_one(&address, bundle).await {
                Ok(()) => {
                    info!(%address, "session established");
                    outcomes.record(address, Ok(()));
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(%address, kind = %e.kind(), error = %e, "session build failed");
                    outcomes.record(address, Err(e));
                }
            }
        }

        Ok(outcomes)
    }

    async fn build_one(
        &self,
        address: &DeviceAddress,
        bundle: &KeyBundle,
    ) -> Result<(), SessionError> {
        let prekey_bundle = bundle.to_prekey_bundle(address)?;
        let handle = self.registry.handle(address);
        let session = handle.lock().await;
        session.process_bundle(&self.store, &prekey_bundle).await
    }

    pub fn has_session(&self, address: &DeviceAddress) -> Result<bool, SessionError> {
        Ok(self.store.has_session(address)?)
    }

    /// Device ids of `user_id` we currently hold sessions with.
    pub fn known_devices(&self, user_id: &str) -> Result<Vec<u32>, SessionError> {
        Ok(self.store.session_devices(user_id)?)
    }

    /// Explicit distrust: forget the pinned identity of `address` so a bundle
    /// with a new identity key can be accepted.
    pub async fn forget_identity(&self, address: &DeviceAddress) -> Result<bool, SessionError> {
        let handle = self.registry.handle(address);
        let _session = handle.lock().await;
        let cleared = self.store.clear_remote_identity(address)?;
        if cleared {
            warn!(%address, "trusted identity cleared");
        }
        Ok(cleared)
    }

    /// Delete the session with `address` and release its registry handle
    /// once no other task holds it.
    pub async fn remove_session(&self, address: &DeviceAddress) -> Result<bool, SessionError> {
        let removed = {
            let handle = self.registry.handle(address);
            let _session = handle.lock().await;
            self.store.remove_session(address)?
        };
        self.registry.forget(address);
        if removed {
            info!(%address, "session removed");
        }
        Ok(removed)
    }
}
