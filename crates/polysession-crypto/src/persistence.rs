//! Encrypted single-file persistence for key material.
//!
//! The store lives in memory and is written out as one PBKDF2 +
//! AES-256-GCM sealed snapshot on every [`flush`](StorageBackend::flush).
//!
//! File format:
//! `[PSKS magic(4)] [version(1)] [iterations(4)] [salt(32)] [nonce(12)] [length(4)] [ciphertext + tag(16)]`
//!
//! The whole header is bound as AAD, so tampering with the iteration count
//! or length fails authentication rather than silently changing the KDF.

use std::collections::BTreeMap;
use std::fs;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::backend::{MemoryBackend, StorageBackend};
use crate::error::StoreError;

const MAGIC: &[u8; 4] = b"PSKS"; // "PolySession Key Store"
const VERSION: u8 = 0x01;
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = 4 + 1 + 4 + SALT_LEN + NONCE_LEN + 4; // 57 bytes

/// PBKDF2-HMAC-SHA256 rounds for newly written files.
pub const DEFAULT_KDF_ITERATIONS: u32 = 600_000;

fn derive_key(
    password: &str,
    salt: &[u8; SALT_LEN],
    iterations: u32,
) -> Result<LessSafeKey, StoreError> {
    let iterations =
        NonZeroU32::new(iterations).ok_or(StoreError::InvalidFormat("zero KDF iterations"))?;
    let mut key_bytes = Zeroizing::new([0u8; 32]);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        password.as_bytes(),
        key_bytes.as_mut(),
    );
    let unbound = UnboundKey::new(&AES_256_GCM, key_bytes.as_ref())
        .map_err(|_| StoreError::Encryption)?;
    Ok(LessSafeKey::new(unbound))
}

fn build_header(
    iterations: u32,
    salt: &[u8; SALT_LEN],
    nonce: &[u8; NONCE_LEN],
    payload_len: u32,
) -> Vec<u8> {
    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(MAGIC);
    header.push(VERSION);
    header.extend_from_slice(&iterations.to_be_bytes());
    header.extend_from_slice(salt);
    header.extend_from_slice(nonce);
    header.extend_from_slice(&payload_len.to_be_bytes());
    header
}

/// Seal a key-value snapshot into the on-disk format.
pub fn encrypt_snapshot(
    entries: &BTreeMap<String, Vec<u8>>,
    password: &str,
    iterations: u32,
) -> Result<Vec<u8>, StoreError> {
    let rng = SystemRandom::new();

    let mut in_out = postcard::to_allocvec(entries)?;

    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt).map_err(|_| StoreError::Encryption)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes)
        .map_err(|_| StoreError::Encryption)?;

    let key = derive_key(password, &salt, iterations)?;
    let sealed_len = u32::try_from(in_out.len() + key.algorithm().tag_len())
        .map_err(|_| StoreError::InvalidFormat("snapshot too large"))?;
    let header = build_header(iterations, &salt, &nonce_bytes, sealed_len);

    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::from(&header),
        &mut in_out,
    )
    .map_err(|_| StoreError::Encryption)?;

    let mut file_data = header;
    file_data.extend_from_slice(&in_out);
    Ok(file_data)
}

/// Open a sealed snapshot produced by [`encrypt_snapshot`].
pub fn decrypt_snapshot(
    file_data: &[u8],
    password: &str,
) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
    if file_data.len() < HEADER_LEN {
        return Err(StoreError::InvalidFormat("file too short"));
    }
    if !has_valid_header(file_data) {
        return Err(StoreError::InvalidFormat("expected PSKS header"));
    }

    let mut iter_bytes = [0u8; 4];
    iter_bytes.copy_from_slice(&file_data[5..9]);
    let iterations = u32::from_be_bytes(iter_bytes);

    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&file_data[9..9 + SALT_LEN]);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(&file_data[41..41 + NONCE_LEN]);

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&file_data[53..HEADER_LEN]);
    let payload_len = u32::from_be_bytes(len_bytes) as usize;

    if file_data.len() < HEADER_LEN + payload_len {
        return Err(StoreError::InvalidFormat("file truncated"));
    }

    let key = derive_key(password, &salt, iterations)?;
    let mut ciphertext = file_data[HEADER_LEN..HEADER_LEN + payload_len].to_vec();
    let plaintext = key
        .open_in_place(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(&file_data[..HEADER_LEN]),
            &mut ciphertext,
        )
        .map_err(|_| StoreError::Decryption)?;

    let entries = postcard::from_bytes(plaintext)?;
    ciphertext.iter_mut().for_each(|b| *b = 0);
    Ok(entries)
}

/// Check if file data starts with a known PSKS header.
pub fn has_valid_header(file_data: &[u8]) -> bool {
    file_data.len() >= HEADER_LEN && &file_data[0..4] == MAGIC && file_data[4] == VERSION
}

/// [`StorageBackend`] persisted as one encrypted file.
pub struct EncryptedFileBackend {
    path: PathBuf,
    password: Zeroizing<String>,
    iterations: u32,
    memory: MemoryBackend,
    write_lock: Mutex<()>,
}

impl EncryptedFileBackend {
    /// Load `path` if it exists, otherwise start empty. Nothing is written
    /// until the first flush.
    pub fn open(
        path: impl Into<PathBuf>,
        password: &str,
        iterations: u32,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        let memory = if path.exists() {
            let file_data = fs::read(&path)?;
            let entries = decrypt_snapshot(&file_data, password)?;
            info!(path = %path.display(), records = entries.len(), "key store loaded");
            MemoryBackend::from_entries(entries)
        } else {
            info!(path = %path.display(), "creating new key store");
            MemoryBackend::new()
        };

        Ok(Self {
            path,
            password: Zeroizing::new(password.to_string()),
            iterations,
            memory,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for EncryptedFileBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.memory.get(key)
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.memory.put(key, value)
    }

    fn take(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.memory.take(key)
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.memory.keys(prefix)
    }

    fn flush(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Closed)?;
        let snapshot = self.memory.snapshot();
        let file_data = encrypt_snapshot(&snapshot, &self.password, self.iterations)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &file_data)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), records = snapshot.len(), "key store flushed");
        Ok(())
    }
}
