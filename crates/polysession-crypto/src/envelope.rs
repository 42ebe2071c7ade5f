//! Per-device ciphertext envelopes and batch results.

use std::collections::BTreeMap;

use libsignal_protocol::CiphertextMessageType;
use serde::{Deserialize, Serialize};

use crate::address::DeviceAddress;
use crate::error::SessionError;

/// Which decode path an envelope needs on the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// First messages of a session; carries the X3DH setup and may consume
    /// a one-time prekey on the receiver.
    PreKey,
    /// Ordinary Double Ratchet message on an established session.
    Standard,
}

impl EnvelopeKind {
    pub fn is_prekey(self) -> bool {
        self == EnvelopeKind::PreKey
    }

    /// Numeric tag for transports that carry the kind as a byte.
    pub fn wire_tag(self) -> u8 {
        match self {
            EnvelopeKind::PreKey => 1,
            EnvelopeKind::Standard => 2,
        }
    }

    pub fn from_wire_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(EnvelopeKind::PreKey),
            2 => Some(EnvelopeKind::Standard),
            _ => None,
        }
    }

    pub(crate) fn from_message_type(message_type: CiphertextMessageType) -> Option<Self> {
        match message_type {
            CiphertextMessageType::PreKey => Some(EnvelopeKind::PreKey),
            CiphertextMessageType::Whisper => Some(EnvelopeKind::Standard),
            _ => None,
        }
    }
}

/// One encrypted unit addressed to a single device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Device the ciphertext was encrypted for.
    pub device_id: u32,
    pub kind: EnvelopeKind,
    pub ciphertext: Vec<u8>,
}

/// Produced by fan-out encryption.
pub type EncryptedEnvelope = Envelope;

/// One of possibly several envelopes offered for a single incoming message.
pub type CandidateCiphertext = Envelope;

impl Envelope {
    pub fn new(device_id: u32, kind: EnvelopeKind, ciphertext: Vec<u8>) -> Self {
        Self {
            device_id,
            kind,
            ciphertext,
        }
    }

    pub fn is_prekey(&self) -> bool {
        self.kind.is_prekey()
    }
}

/// Result of a batch operation, one entry per device, ordered by address.
///
/// A failure recorded here is scoped to its device; siblings are unaffected.
#[derive(Debug)]
pub struct DeviceOutcomes<T> {
    outcomes: BTreeMap<DeviceAddress, Result<T, SessionError>>,
}

impl<T> Default for DeviceOutcomes<T> {
    fn default() -> Self {
        Self {
            outcomes: BTreeMap::new(),
        }
    }
}

impl<T> DeviceOutcomes<T> {
    pub(crate) fn record(&mut self, address: DeviceAddress, outcome: Result<T, SessionError>) {
        self.outcomes.insert(address, outcome);
    }

    pub fn get(&self, address: &DeviceAddress) -> Option<&Result<T, SessionError>> {
        self.outcomes.get(address)
    }

    /// Lookup by device id alone, returning the first match in address
    /// order. Only unambiguous for single-user batches such as
    /// `encrypt_to_all`; outcomes that span users (a sealed message also
    /// covers our own devices) should be read with [`get`](Self::get).
    pub fn device(&self, device_id: u32) -> Option<&Result<T, SessionError>> {
        self.outcomes
            .iter()
            .find(|(address, _)| address.device_id == device_id)
            .map(|(_, outcome)| outcome)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DeviceAddress, &Result<T, SessionError>)> {
        self.outcomes.iter()
    }

    pub fn successes(&self) -> impl Iterator<Item = (&DeviceAddress, &T)> {
        self.outcomes
            .iter()
            .filter_map(|(address, outcome)| outcome.as_ref().ok().map(|value| (address, value)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&DeviceAddress, &SessionError)> {
        self.outcomes
            .iter()
            .filter_map(|(address, outcome)| outcome.as_ref().err().map(|err| (address, err)))
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.values().all(Result::is_ok)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Collapse to a single result: all values, or the first failure in
    /// address order.
    pub fn into_result(self) -> Result<BTreeMap<DeviceAddress, T>, SessionError> {
        self.outcomes
            .into_iter()
            .map(|(address, outcome)| outcome.map(|value| (address, value)))
            .collect()
    }
}

impl<T> IntoIterator for DeviceOutcomes<T> {
    type Item = (DeviceAddress, Result<T, SessionError>);
    type IntoIter = std::collections::btree_map::IntoIter<DeviceAddress, Result<T, SessionError>>;

    fn into_iter(self) -> Self::IntoIter {
        self.outcomes.into_iter()
    }
}
