//! Payload sealing for multi-device delivery.
//!
//! The message body is encrypted once under a fresh AES-128-GCM key. Only
//! the 32-byte key material (`key || tag`) is fanned out through the
//! per-device ratchet sessions, so the body size does not multiply with the
//! recipient's device count.

use ring::aead::{Aad, LessSafeKey, Nonce, Tag, UnboundKey, AES_128_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::address::DeviceAddress;
use crate::envelope::Envelope;
use crate::error::SessionError;

pub const PAYLOAD_KEY_LEN: usize = 16;
pub const PAYLOAD_IV_LEN: usize = 12;
pub const GCM_TAG_SIZE: usize = 16;

/// Bytes fanned out per device: payload key followed by the GCM tag.
pub const KEY_MATERIAL_LEN: usize = PAYLOAD_KEY_LEN + GCM_TAG_SIZE;

/// A message body sealed once plus its key wrapped for every device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedMessage {
    pub sender_device_id: u32,
    pub iv: Vec<u8>,
    /// Ciphertext without the GCM tag.
    pub payload: Vec<u8>,
    /// Key material envelopes, one per receiving device.
    pub keys: Vec<Envelope>,
}

/// Payload ciphertext and the key material that opens it.
pub(crate) struct SealedPayload {
    pub key_material: Zeroizing<Vec<u8>>,
    pub iv: Vec<u8>,
    pub payload: Vec<u8>,
}

fn aead_key(key: &[u8]) -> Option<LessSafeKey> {
    UnboundKey::new(&AES_128_GCM, key).ok().map(LessSafeKey::new)
}

pub(crate) fn seal_payload(plaintext: &[u8]) -> Result<SealedPayload, SessionError> {
    let rng = SystemRandom::new();
    let mut key = Zeroizing::new([0u8; PAYLOAD_KEY_LEN]);
    rng.fill(key.as_mut())
        .map_err(|_| SessionError::KeyGeneration("RNG failed".into()))?;
    let mut iv = [0u8; PAYLOAD_IV_LEN];
    rng.fill(&mut iv)
        .map_err(|_| SessionError::KeyGeneration("RNG failed".into()))?;

    let aead = aead_key(key.as_ref())
        .ok_or_else(|| SessionError::KeyGeneration("invalid payload key".into()))?;
    let mut payload = plaintext.to_vec();
    let tag: Tag = aead
        .seal_in_place_separate_tag(
            Nonce::assume_unique_for_key(iv),
            Aad::empty(),
            &mut payload,
        )
        .map_err(|_| SessionError::KeyGeneration("payload encryption failed".into()))?;

    let mut key_material = Zeroizing::new(Vec::with_capacity(KEY_MATERIAL_LEN));
    key_material.extend_from_slice(key.as_ref());
    key_material.extend_from_slice(tag.as_ref());

    Ok(SealedPayload {
        key_material,
        iv: iv.to_vec(),
        payload,
    })
}

/// Open a payload with key material recovered from a ratchet envelope.
/// `sender` only labels the error.
pub(crate) fn open_payload(
    sender: &DeviceAddress,
    key_material: &[u8],
    iv: &[u8],
    payload: &[u8],
) -> Result<Vec<u8>, SessionError> {
    let failed = || SessionError::CryptoFailed {
        address: sender.clone(),
        attempts: 1,
    };

    if key_material.len() != KEY_MATERIAL_LEN {
        return Err(failed());
    }
    let (key, tag) = key_material.split_at(PAYLOAD_KEY_LEN);
    let nonce = Nonce::try_assume_unique_for_key(iv).map_err(|_| failed())?;
    let aead = aead_key(key).ok_or_else(failed)?;

    let mut in_out = Zeroizing::new(Vec::with_capacity(payload.len() + GCM_TAG_SIZE));
    in_out.extend_from_slice(payload);
    in_out.extend_from_slice(tag);

    let plaintext = aead
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| failed())?;
    Ok(plaintext.to_vec())
}
