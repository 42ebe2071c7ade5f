//! Fully provisioned in-memory devices for session tests.

use std::sync::Arc;

use crate::address::DeviceAddress;
use crate::cipher::MultiDeviceCipher;
use crate::prekey::KeyLifecycleManager;
use crate::registry::SessionRegistry;
use crate::session::{KeyBundle, SessionBuilder};
use crate::stores::KeyMaterialStore;

pub(crate) const TEST_PREKEY_COUNT: u32 = 10;

pub(crate) struct Party {
    pub address: DeviceAddress,
    pub store: KeyMaterialStore,
    pub registry: Arc<SessionRegistry>,
}

impl Party {
    /// Identity, registration id, prekeys `1..=10` and signed prekey 1.
    pub fn new(user_id: &str, device_id: u32) -> Self {
        let store = KeyMaterialStore::in_memory();
        let keys = KeyLifecycleManager::new(store.clone());
        let identity = keys.generate_identity().unwrap();
        keys.generate_registration_id().unwrap();
        keys.generate_pre_keys(1, TEST_PREKEY_COUNT).unwrap();
        keys.generate_signed_pre_key(&identity, 1).unwrap();

        Self {
            address: DeviceAddress::new(user_id, device_id),
            store,
            registry: Arc::new(SessionRegistry::new()),
        }
    }

    pub fn keys(&self) -> KeyLifecycleManager {
        KeyLifecycleManager::new(self.store.clone())
    }

    pub fn bundle(&self) -> KeyBundle {
        self.keys().local_bundle().unwrap()
    }

    pub fn builder(&self) -> SessionBuilder {
        SessionBuilder::new(self.store.clone(), Arc::clone(&self.registry))
    }

    pub fn cipher(&self) -> MultiDeviceCipher {
        MultiDeviceCipher::new(
            self.address.clone(),
            self.store.clone(),
            Arc::clone(&self.registry),
        )
    }

    /// Establish sessions from `self` to each of `others`.
    pub async fn connect(&self, others: &[&Party]) {
        for other in others {
            let outcomes = self
                .builder()
                .build_sessions(
                    &other.address.user_id,
                    &[(other.address.device_id, other.bundle())],
                )
                .await
                .unwrap();
            assert!(outcomes.all_succeeded(), "session to {} failed", other.address);
        }
    }
}
