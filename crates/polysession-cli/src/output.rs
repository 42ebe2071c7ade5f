//! JSON views of public key material, byte fields in standard base64.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Serialize;

use polysession_crypto::{KeyBundle, PublicPreKey};

#[derive(Debug, Serialize)]
pub struct PreKeyView {
    pub id: u32,
    pub public_key: String,
}

impl From<&PublicPreKey> for PreKeyView {
    fn from(pre_key: &PublicPreKey) -> Self {
        Self {
            id: pre_key.id,
            public_key: STANDARD.encode(&pre_key.public_key),
        }
    }
}

/// What a device publishes so peers can build a session with it.
#[derive(Debug, Serialize)]
pub struct BundleView {
    pub device_id: u32,
    pub registration_id: u32,
    pub identity_key: String,
    pub signed_pre_key_id: u32,
    pub signed_pre_key: String,
    pub signed_pre_key_signature: String,
    pub pre_key: Option<PreKeyView>,
}

impl BundleView {
    pub fn new(device_id: u32, bundle: &KeyBundle) -> Self {
        Self {
            device_id,
            registration_id: bundle.registration_id,
            identity_key: STANDARD.encode(&bundle.identity_key),
            signed_pre_key_id: bundle.signed_pre_key_id,
            signed_pre_key: STANDARD.encode(&bundle.signed_pre_key),
            signed_pre_key_signature: STANDARD.encode(&bundle.signed_pre_key_signature),
            pre_key: bundle.pre_key.as_ref().map(PreKeyView::from),
        }
    }
}
