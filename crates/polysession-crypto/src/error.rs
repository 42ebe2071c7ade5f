use libsignal_protocol::SignalProtocolError;
use thiserror::Error;

use crate::address::DeviceAddress;

/// Failures of the key-value backend behind a [`KeyMaterialStore`](crate::stores::KeyMaterialStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("corrupt record under {key}: {reason}")]
    CorruptRecord { key: String, reason: String },

    #[error("invalid store file: {0}")]
    InvalidFormat(&'static str),

    #[error("incorrect password or corrupted store file")]
    Decryption,

    #[error("store encryption failed")]
    Encryption,

    #[error("store is closed")]
    Closed,

    #[error("local {0} has not been generated")]
    MissingLocalKey(&'static str),
}

/// Stable error kinds surfaced to callers, one per failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    KeyGeneration,
    InvalidKey,
    UntrustedIdentity,
    NoSession,
    DuplicateMessage,
    CryptoFailed,
    Storage,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::KeyGeneration => "KEY_GENERATION",
            ErrorKind::InvalidKey => "INVALID_KEY",
            ErrorKind::UntrustedIdentity => "UNTRUSTED_IDENTITY",
            ErrorKind::NoSession => "NO_SESSION",
            ErrorKind::DuplicateMessage => "DUPLICATE_MESSAGE",
            ErrorKind::CryptoFailed => "CRYPTO_FAILED",
            ErrorKind::Storage => "STORAGE",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("invalid key material for {address}: {reason}")]
    InvalidKey {
        address: DeviceAddress,
        reason: String,
    },

    #[error("untrusted identity key for {0}")]
    UntrustedIdentity(DeviceAddress),

    #[error("no session established with {0}")]
    NoSession(DeviceAddress),

    #[error("duplicate message from {0}")]
    DuplicateMessage(DeviceAddress),

    #[error("decryption failed for {address} after {attempts} candidate(s)")]
    CryptoFailed {
        address: DeviceAddress,
        attempts: usize,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::KeyGeneration(_) => ErrorKind::KeyGeneration,
            SessionError::InvalidKey { .. } => ErrorKind::InvalidKey,
            SessionError::UntrustedIdentity(_) => ErrorKind::UntrustedIdentity,
            SessionError::NoSession(_) => ErrorKind::NoSession,
            SessionError::DuplicateMessage(_) => ErrorKind::DuplicateMessage,
            SessionError::CryptoFailed { .. } => ErrorKind::CryptoFailed,
            SessionError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Whole-operation failures. Batch operations abort on these instead of
    /// recording them against a single device.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Storage(_))
    }

    /// Classify an engine error raised while operating on `address`.
    pub(crate) fn from_protocol(address: &DeviceAddress, err: SignalProtocolError) -> Self {
        match err {
            SignalProtocolError::UntrustedIdentity(_) => {
                SessionError::UntrustedIdentity(address.clone())
            }
            SignalProtocolError::SessionNotFound(_) => SessionError::NoSession(address.clone()),
            SignalProtocolError::DuplicatedMessage(..) => {
                SessionError::DuplicateMessage(address.clone())
            }
            SignalProtocolError::InvalidState("storage", reason) => {
                SessionError::Storage(StoreError::CorruptRecord {
                    key: address.storage_key(),
                    reason,
                })
            }
            SignalProtocolError::NoKeyTypeIdentifier
            | SignalProtocolError::BadKeyType(_)
            | SignalProtocolError::BadKeyLength(..)
            | SignalProtocolError::SignatureValidationFailed
            | SignalProtocolError::InvalidArgument(_) => SessionError::InvalidKey {
                address: address.clone(),
                reason: err.to_string(),
            },
            other => SessionError::CryptoFailed {
                address: address.clone(),
                attempts: 1,
            }
            .with_detail(other),
        }
    }

    fn with_detail(self, detail: SignalProtocolError) -> Self {
        tracing::debug!(error = %detail, "engine error classified as {}", self.kind());
        self
    }
}

/// Wrap a backend failure for the engine's store traits.
pub(crate) fn storage_to_protocol(err: StoreError) -> SignalProtocolError {
    SignalProtocolError::InvalidState("storage", err.to_string())
}
