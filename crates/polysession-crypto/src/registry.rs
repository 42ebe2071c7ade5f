//! Per-device session handles and their mutual exclusion.
//!
//! Ratchet state lives in the [`KeyMaterialStore`]; a [`SessionHandle`] only
//! carries the address and the lock that serialises every
//! {load session, advance ratchet, store session} sequence on that address.
//! Handles for different addresses never contend.

use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use libsignal_protocol::{
    message_decrypt, message_decrypt_prekey, message_encrypt, process_prekey_bundle,
    CiphertextMessage, PreKeyBundle, PreKeySignalMessage, ProtocolAddress, SignalMessage,
    SignalProtocolError,
};
use rand::rngs::OsRng;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::address::DeviceAddress;
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::SessionError;
use crate::stores::KeyMaterialStore;

/// In-memory map from address to session handle.
///
/// Handles are created on first use and hold no ratchet state, so dropping
/// the registry loses nothing; it is rebuilt lazily from the store.
pub struct SessionRegistry {
    handles: DashMap<DeviceAddress, Arc<SessionHandle>>,
    // Held across every prekey decrypt so a one-time prekey cannot be used
    // by two decrypts at once. Always taken after an address lock.
    prekey_guard: Arc<Mutex<()>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            prekey_guard: Arc::new(Mutex::new(())),
        }
    }

    pub fn handle(&self, address: &DeviceAddress) -> Arc<SessionHandle> {
        self.handles
            .entry(address.clone())
            .or_insert_with(|| {
                Arc::new(SessionHandle {
                    address: address.clone(),
                    protocol_address: address.to_protocol_address(),
                    lock: Mutex::new(()),
                    prekey_guard: Arc::clone(&self.prekey_guard),
                })
            })
            .clone()
    }

    /// Drop the handle for `address` if nobody else holds it.
    ///
    /// A handle that is cloned out (locked or waiting to lock) stays, so a
    /// later [`handle`](Self::handle) call still returns the same lock.
    /// Returns whether the handle was removed.
    pub fn forget(&self, address: &DeviceAddress) -> bool {
        self.handles
            .remove_if(address, |_, handle| Arc::strong_count(handle) == 1)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

pub struct SessionHandle {
    address: DeviceAddress,
    protocol_address: ProtocolAddress,
    lock: Mutex<()>,
    prekey_guard: Arc<Mutex<()>>,
}

impl SessionHandle {
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Wait for exclusive access to this address's ratchet.
    pub async fn lock(&self) -> LockedSession<'_> {
        LockedSession {
            handle: self,
            _guard: self.lock.lock().await,
        }
    }
}

/// Exclusive access to one address. Ratchet operations are only reachable
/// through this guard.
pub struct LockedSession<'a> {
    handle: &'a SessionHandle,
    _guard: MutexGuard<'a, ()>,
}

impl LockedSession<'_> {
    pub fn address(&self) -> &DeviceAddress {
        &self.handle.address
    }

    fn protocol_error(&self, err: SignalProtocolError) -> SessionError {
        SessionError::from_protocol(&self.handle.address, err)
    }

    /// Run the X3DH handshake against `bundle`, replacing any existing
    /// session. The engine verifies the signed prekey signature and the
    /// stored identity before touching the session.
    pub async fn process_bundle(
        &self,
        store: &KeyMaterialStore,
        bundle: &PreKeyBundle,
    ) -> Result<(), SessionError> {
        let replacing = store.has_session(&self.handle.address)?;
        let mut sessions = store.clone();
        let mut identities = store.clone();

        process_prekey_bundle(
            &self.handle.protocol_address,
            &mut sessions,
            &mut identities,
            bundle,
            SystemTime::now(),
            &mut OsRng,
        )
        .await
        .map_err(|e| self.protocol_error(e))?;

        if replacing {
            info!(address = %self.handle.address, "session replaced, previous ratchet state discarded");
        }
        Ok(())
    }

    pub async fn encrypt(
        &self,
        store: &KeyMaterialStore,
        plaintext: &[u8],
    ) -> Result<Envelope, SessionError> {
        if !store.has_session(&self.handle.address)? {
            return Err(SessionError::NoSession(self.handle.address.clone()));
        }
        let mut sessions = store.clone();
        let mut identities = store.clone();

        let ciphertext = message_encrypt(
            plaintext,
            &self.handle.protocol_address,
            &mut sessions,
            &mut identities,
            SystemTime::now(),
        )
        .await
        .map_err(|e| self.protocol_error(e))?;

        let kind = EnvelopeKind::from_message_type(ciphertext.message_type()).ok_or_else(|| {
            SessionError::CryptoFailed {
                address: self.handle.address.clone(),
                attempts: 1,
            }
        })?;

        Ok(Envelope::new(
            self.handle.address.device_id,
            kind,
            ciphertext.serialize().to_vec(),
        ))
    }

    /// Decrypt one envelope, dispatching on its kind.
    pub async fn decrypt(
        &self,
        store: &KeyMaterialStore,
        envelope: &Envelope,
    ) -> Result<Vec<u8>, SessionError> {
        match envelope.kind {
            EnvelopeKind::PreKey => self.decrypt_prekey(store, &envelope.ciphertext).await,
            EnvelopeKind::Standard => self.decrypt_standard(store, &envelope.ciphertext).await,
        }
    }

    async fn decrypt_prekey(
        &self,
        store: &KeyMaterialStore,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        let message =
            PreKeySignalMessage::try_from(ciphertext).map_err(|e| self.protocol_error(e))?;
        let pre_key_id = message.pre_key_id().map(u32::from);
        let base_key = message.base_key().serialize();

        let _prekeys = self.handle.prekey_guard.lock().await;
        let mut sessions = store.clone();
        let mut identities = store.clone();
        let mut prekeys = store.clone();
        let mut signed_prekeys = store.clone();
        let mut kyber_prekeys = store.clone();

        let result = message_decrypt_prekey(
            &message,
            &self.handle.protocol_address,
            &mut sessions,
            &mut identities,
            &mut prekeys,
            &mut signed_prekeys,
            &mut kyber_prekeys,
            &mut OsRng,
        )
        .await;

        match result {
            Ok(plaintext) => {
                // Still under the prekey guard: the tombstone names its
                // consumer before any other prekey decrypt can read it.
                if let Some(id) = pre_key_id {
                    if store.is_pre_key_consumed(id)?
                        && !store.pre_key_consumed_by(id, &base_key)?
                    {
                        store.record_pre_key_consumer(id, &base_key)?;
                    }
                }
                debug!(address = %self.handle.address, ?pre_key_id, "prekey message decrypted");
                Ok(plaintext)
            }
            // The referenced prekey is gone and no existing session matched.
            // Only the handshake that consumed it makes this a replay; any
            // other sender raced for the same prekey and must re-key.
            Err(SignalProtocolError::InvalidPreKeyId) => match pre_key_id {
                Some(id) if store.pre_key_consumed_by(id, &base_key)? => {
                    Err(SessionError::DuplicateMessage(self.handle.address.clone()))
                }
                _ => Err(self.protocol_error(SignalProtocolError::InvalidPreKeyId)),
            },
            Err(e) => Err(self.protocol_error(e)),
        }
    }

    async fn decrypt_standard(
        &self,
        store: &KeyMaterialStore,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        let message = SignalMessage::try_from(ciphertext).map_err(|e| self.protocol_error(e))?;
        let message = CiphertextMessage::SignalMessage(message);
        let mut sessions = store.clone();
        let mut identities = store.clone();
        let mut prekeys = store.clone();
        let mut signed_prekeys = store.clone();
        let mut kyber_prekeys = store.clone();

        message_decrypt(
            &message,
            &self.handle.protocol_address,
            &mut sessions,
            &mut identities,
            &mut prekeys,
            &mut signed_prekeys,
            &mut kyber_prekeys,
            &mut OsRng,
        )
        .await
        .map_err(|e| self.protocol_error(e))
    }
}
