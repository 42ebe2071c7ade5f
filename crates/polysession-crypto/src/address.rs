//! Addressing of ratchet endpoints.
//!
//! A logical peer may own many physical devices; every device is a separate
//! ratchet endpoint identified by `(user id, device id)`.

use std::fmt;

use libsignal_protocol::ProtocolAddress;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub user_id: String,
    pub device_id: u32,
}

impl DeviceAddress {
    pub fn new(user_id: impl Into<String>, device_id: u32) -> Self {
        Self {
            user_id: user_id.into(),
            device_id,
        }
    }

    /// The engine's address type for this endpoint.
    pub fn to_protocol_address(&self) -> ProtocolAddress {
        ProtocolAddress::new(self.user_id.clone(), self.device_id.into())
    }

    /// "user.device", the suffix used for per-device records in the store.
    pub fn storage_key(&self) -> String {
        format!("{}.{}", self.user_id, self.device_id)
    }
}

impl From<&ProtocolAddress> for DeviceAddress {
    fn from(addr: &ProtocolAddress) -> Self {
        Self::new(addr.name(), u32::from(addr.device_id()))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.user_id, self.device_id)
    }
}
