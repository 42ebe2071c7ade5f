//! Generic key-value persistence behind the key store.

use std::collections::BTreeMap;

use dashmap::DashMap;

use crate::error::StoreError;

/// Byte-oriented key-value store.
///
/// Every method must be safe to call concurrently. `take` is the only
/// read-modify-write primitive the key store relies on and must be atomic:
/// of two concurrent `take`s of one key, at most one observes the value.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Remove `key`, returning the value it held.
    fn take(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// All keys starting with `prefix`, in ascending order.
    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Make all previous writes durable.
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Process-lifetime backend. Also the in-memory half of
/// [`EncryptedFileBackend`](crate::persistence::EncryptedFileBackend).
#[derive(Default)]
pub struct MemoryBackend {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: BTreeMap<String, Vec<u8>>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Point-in-time copy, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn take(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.remove(key).map(|(_, v)| v))
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn last_write_wins() {
        let backend = MemoryBackend::new();
        backend.put("a", vec![1]).unwrap();
        backend.put("a", vec![2]).unwrap();
        assert_eq!(backend.get("a").unwrap(), Some(vec![2]));
    }

    #[test]
    fn take_reports_absence_afterwards() {
        let backend = MemoryBackend::new();
        backend.put("prekey/1", vec![9]).unwrap();
        assert_eq!(backend.take("prekey/1").unwrap(), Some(vec![9]));
        assert_eq!(backend.take("prekey/1").unwrap(), None);
        assert_eq!(backend.get("prekey/1").unwrap(), None);
    }

    #[test]
    fn keys_filters_and_sorts() {
        let backend = MemoryBackend::new();
        backend.put("session/b.1", vec![]).unwrap();
        backend.put("prekey/2", vec![]).unwrap();
        backend.put("session/a.1", vec![]).unwrap();
        assert_eq!(
            backend.keys("session/").unwrap(),
            vec!["session/a.1".to_string(), "session/b.1".to_string()]
        );
    }

    #[test]
    fn concurrent_take_has_one_winner() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put("prekey/5", vec![5]).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let backend = Arc::clone(&backend);
                std::thread::spawn(move || backend.take("prekey/5").unwrap().is_some())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
