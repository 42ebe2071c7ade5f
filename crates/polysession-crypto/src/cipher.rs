//! Fan-out encryption to every device of a user and fan-in decryption of
//! candidate ciphertexts.
//!
//! A message for a user with several devices is encrypted once per device
//! over that device's own session. On the receiving side a transport may
//! hand over every envelope it saw for the message; the one meant for this
//! device is found by trial decryption.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::address::DeviceAddress;
use crate::envelope::{CandidateCiphertext, DeviceOutcomes, Envelope};
use crate::error::{ErrorKind, SessionError};
use crate::registry::SessionRegistry;
use crate::sealed::{open_payload, seal_payload, SealedMessage};
use crate::stores::KeyMaterialStore;

pub struct MultiDeviceCipher {
    local: DeviceAddress,
    store: KeyMaterialStore,
    registry: Arc<SessionRegistry>,
}

impl MultiDeviceCipher {
    pub fn new(local: DeviceAddress, store: KeyMaterialStore, registry: Arc<SessionRegistry>) -> Self {
        Self {
            local,
            store,
            registry,
        }
    }

    /// The device this cipher encrypts from and decrypts for.
    pub fn local_address(&self) -> &DeviceAddress {
        &self.local
    }

    /// Encrypt for a single device over its established session.
    pub async fn encrypt(
        &self,
        recipient: &DeviceAddress,
        plaintext: &[u8],
    ) -> Result<Envelope, SessionError> {
        let handle = self.registry.handle(recipient);
        let session = handle.lock().await;
        session.encrypt(&self.store, plaintext).await
    }

    /// Decrypt one envelope from `sender`, whatever its kind.
    pub async fn decrypt(
        &self,
        sender: &DeviceAddress,
        envelope: &Envelope,
    ) -> Result<Vec<u8>, SessionError> {
        let handle = self.registry.handle(sender);
        let session = handle.lock().await;
        session.decrypt(&self.store, envelope).await
    }

    /// Encrypt `plaintext` independently for each listed device of
    /// `recipient_user_id`.
    ///
    /// Devices without a session, or whose encryption fails, get an error
    /// entry and do not affect the others. Repeated device ids are encrypted
    /// once.
    pub async fn encrypt_to_all(
        &self,
        recipient_user_id: &str,
        device_ids: &[u32],
        plaintext: &[u8],
    ) -> Result<DeviceOutcomes<Envelope>, SessionError> {
        let recipients: BTreeSet<DeviceAddress> = device_ids
            .iter()
            .map(|&device_id| DeviceAddress::new(recipient_user_id, device_id))
            .collect();
        self.fan_out(recipients, plaintext).await
    }

    async fn fan_out(
        &self,
        recipients: BTreeSet<DeviceAddress>,
        plaintext: &[u8],
    ) -> Result<DeviceOutcomes<Envelope>, SessionError> {
        let mut outcomes = DeviceOutcomes::default();

        for address in recipients {
            match self.encrypt(&address, plaintext).await {
                Ok(envelope) => {
                    debug!(%address, kind = ?envelope.kind, "encrypted for device");
                    outcomes.record(address, Ok(envelope));
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(%address, kind = %e.kind(), error = %e, "device skipped");
                    outcomes.record(address, Err(e));
                }
            }
        }

        Ok(outcomes)
    }

    /// Recover the plaintext of one incoming message from the envelopes
    /// offered for it.
    ///
    /// Envelopes addressed to another device id are skipped; the rest are
    /// tried in order under the sender's session lock and the first that
    /// decrypts wins. When none does, the result is `DuplicateMessage` if any
    /// attempt was a replay and `CryptoFailed` otherwise. Storage failures
    /// abort immediately.
    pub async fn decrypt_from_candidates(
        &self,
        sender_user_id: &str,
        sender_device_id: u32,
        candidates: &[CandidateCiphertext],
    ) -> Result<Vec<u8>, SessionError> {
        let sender = DeviceAddress::new(sender_user_id, sender_device_id);
        let result = self.try_candidates(&sender, candidates).await;

        // Unknown senders whose candidates all failed leave no handle behind.
        if result.is_err() && !self.store.has_session(&sender)? {
            self.registry.forget(&sender);
        }
        result
    }

    async fn try_candidates(
        &self,
        sender: &DeviceAddress,
        candidates: &[CandidateCiphertext],
    ) -> Result<Vec<u8>, SessionError> {
        let handle = self.registry.handle(sender);
        let session = handle.lock().await;

        let mut attempts = 0;
        let mut replayed = false;

        for (index, candidate) in candidates.iter().enumerate() {
            if candidate.device_id != self.local.device_id {
                continue;
            }
            attempts += 1;

            match session.decrypt(&self.store, candidate).await {
                Ok(plaintext) => {
                    debug!(%sender, index, kind = ?candidate.kind, "candidate decrypted");
                    return Ok(plaintext);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    replayed |= e.kind() == ErrorKind::DuplicateMessage;
                    debug!(%sender, index, kind = %e.kind(), "candidate rejected");
                }
            }
        }

        if replayed {
            warn!(%sender, "replayed message rejected");
            Err(SessionError::DuplicateMessage(sender.clone()))
        } else {
            warn!(%sender, attempts, candidates = candidates.len(), "no candidate decrypted");
            Err(SessionError::CryptoFailed {
                address: sender.clone(),
                attempts,
            })
        }
    }

    /// Seal `plaintext` once and fan its key out to the listed devices of
    /// `recipient_user_id` and to every other device of our own user we
    /// hold a session with.
    ///
    /// Per-device failures are reported in the returned outcomes; the sealed
    /// message carries keys only for the devices that succeeded.
    pub async fn seal(
        &self,
        recipient_user_id: &str,
        device_ids: &[u32],
        plaintext: &[u8],
    ) -> Result<(SealedMessage, DeviceOutcomes<Envelope>), SessionError> {
        let sealed = seal_payload(plaintext)?;

        let mut recipients: BTreeSet<DeviceAddress> = device_ids
            .iter()
            .map(|&device_id| DeviceAddress::new(recipient_user_id, device_id))
            .collect();
        recipients.extend(
            self.store
                .session_devices(&self.local.user_id)?
                .into_iter()
                .filter(|&device_id| device_id != self.local.device_id)
                .map(|device_id| DeviceAddress::new(self.local.user_id.clone(), device_id)),
        );

        let outcomes = self.fan_out(recipients, &sealed.key_material).await?;
        let keys: Vec<Envelope> = outcomes
            .successes()
            .map(|(_, envelope)| envelope.clone())
            .collect();

        info!(
            recipient = recipient_user_id,
            devices = keys.len(),
            failed = outcomes.failures().count(),
            "message sealed"
        );

        Ok((
            SealedMessage {
                sender_device_id: self.local.device_id,
                iv: sealed.iv,
                payload: sealed.payload,
                keys,
            },
            outcomes,
        ))
    }

    /// Open a sealed message from `sender_user_id`: recover our key material
    /// from its key envelopes, then decrypt the payload.
    pub async fn open(
        &self,
        sender_user_id: &str,
        message: &SealedMessage,
    ) -> Result<Vec<u8>, SessionError> {
        let sender = DeviceAddress::new(sender_user_id, message.sender_device_id);
        let key_material = Zeroizing::new(
            self.decrypt_from_candidates(sender_user_id, message.sender_device_id, &message.keys)
                .await?,
        );
        open_payload(&sender, &key_material, &message.iv, &message.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeKind;
    use crate::test_support::{Party, TEST_PREKEY_COUNT};

    fn envelope_for(outcomes: &DeviceOutcomes<Envelope>, device_id: u32) -> Envelope {
        outcomes.device(device_id).unwrap().as_ref().unwrap().clone()
    }

    fn available_ids(party: &Party) -> Vec<u32> {
        party
            .keys()
            .list_available_pre_keys()
            .unwrap()
            .iter()
            .map(|record| u32::from(record.id().unwrap()))
            .collect()
    }

    #[tokio::test]
    async fn roundtrip_then_reply_switches_to_standard() {
        let alice = Party::new("alice", 1);
        let bob = Party::new("bob", 1);
        alice.connect(&[&bob]).await;

        let sent = alice.cipher().encrypt_to_all("bob", &[1], b"hi bob").await.unwrap();
        let first = envelope_for(&sent, 1);
        assert_eq!(first.kind, EnvelopeKind::PreKey);
        assert_eq!(
            bob.cipher().decrypt_from_candidates("alice", 1, &[first]).await.unwrap(),
            b"hi bob"
        );

        let reply = bob
            .cipher()
            .encrypt(&alice.address, b"hi alice")
            .await
            .unwrap();
        assert_eq!(reply.kind, EnvelopeKind::Standard);
        assert_eq!(
            alice.cipher().decrypt(&bob.address, &reply).await.unwrap(),
            b"hi alice"
        );

        let second = alice.cipher().encrypt(&bob.address, b"again").await.unwrap();
        assert_eq!(second.kind, EnvelopeKind::Standard);
        assert_eq!(
            bob.cipher().decrypt(&alice.address, &second).await.unwrap(),
            b"again"
        );
    }

    #[tokio::test]
    async fn fan_out_envelopes_are_device_specific() {
        let alice = Party::new("alice", 1);
        let bob_phone = Party::new("bob", 21);
        let bob_laptop = Party::new("bob", 22);
        alice.connect(&[&bob_phone, &bob_laptop]).await;

        let sent = alice
            .cipher()
            .encrypt_to_all("bob", &[21, 22], b"to both")
            .await
            .unwrap();
        assert!(sent.all_succeeded());
        let for_phone = envelope_for(&sent, 21);
        let for_laptop = envelope_for(&sent, 22);
        assert_ne!(for_phone.ciphertext, for_laptop.ciphertext);

        // Not addressed to the laptop: skipped without an attempt.
        let err = bob_laptop
            .cipher()
            .decrypt_from_candidates("alice", 1, &[for_phone.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::CryptoFailed { attempts: 0, .. }));

        // Relabelled for the laptop: attempted and rejected.
        let relabelled = Envelope::new(22, for_phone.kind, for_phone.ciphertext.clone());
        let err = bob_laptop
            .cipher()
            .decrypt_from_candidates("alice", 1, &[relabelled])
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::CryptoFailed { attempts: 1, .. }));

        // Each device still reads its own copy.
        assert_eq!(
            bob_laptop
                .cipher()
                .decrypt_from_candidates("alice", 1, &[for_phone.clone(), for_laptop])
                .await
                .unwrap(),
            b"to both"
        );
        assert_eq!(
            bob_phone
                .cipher()
                .decrypt_from_candidates("alice", 1, &[for_phone])
                .await
                .unwrap(),
            b"to both"
        );
    }

    #[tokio::test]
    async fn missing_session_fails_only_that_device() {
        let alice = Party::new("alice", 1);
        let bob = Party::new("bob", 1);
        alice.connect(&[&bob]).await;

        let sent = alice
            .cipher()
            .encrypt_to_all("bob", &[1, 2, 1], b"partial")
            .await
            .unwrap();
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent.device(1), Some(Ok(_))));
        assert_eq!(
            sent.device(2).unwrap().as_ref().unwrap_err().kind(),
            ErrorKind::NoSession
        );
    }

    #[tokio::test]
    async fn prekey_is_consumed_and_replay_rejected() {
        let alice = Party::new("alice", 1);
        let bob = Party::new("bob", 1);
        let used = bob.bundle().pre_key.unwrap().id;
        alice.connect(&[&bob]).await;

        let envelope = alice.cipher().encrypt(&bob.address, b"once").await.unwrap();
        assert!(available_ids(&bob).contains(&used));

        bob.cipher()
            .decrypt_from_candidates("alice", 1, &[envelope.clone()])
            .await
            .unwrap();
        let remaining = available_ids(&bob);
        assert!(!remaining.contains(&used));
        assert_eq!(remaining.len(), TEST_PREKEY_COUNT as usize - 1);

        let err = bob
            .cipher()
            .decrypt_from_candidates("alice", 1, &[envelope.clone()])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateMessage);

        // Without the session, the spent prekey still identifies the replay.
        assert!(bob.builder().remove_session(&alice.address).await.unwrap());
        let err = bob
            .cipher()
            .decrypt_from_candidates("alice", 1, &[envelope])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateMessage);
    }

    #[tokio::test]
    async fn other_sender_on_a_spent_prekey_is_not_a_replay() {
        let alice = Party::new("alice", 1);
        let carol = Party::new("carol", 1);
        let bob = Party::new("bob", 1);
        // Both fetched the same bundle, so both handshakes name prekey 1.
        alice.connect(&[&bob]).await;
        carol.connect(&[&bob]).await;

        let from_alice = alice.cipher().encrypt(&bob.address, b"first").await.unwrap();
        let from_carol = carol.cipher().encrypt(&bob.address, b"second").await.unwrap();

        let cipher = bob.cipher();
        cipher
            .decrypt_from_candidates("alice", 1, &[from_alice.clone()])
            .await
            .unwrap();
        let err = cipher
            .decrypt_from_candidates("carol", 1, &[from_carol])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CryptoFailed);

        // Alice's own handshake replayed without a session is still a replay.
        bob.builder().remove_session(&alice.address).await.unwrap();
        let err = cipher
            .decrypt_from_candidates("alice", 1, &[from_alice])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateMessage);
    }

    #[tokio::test]
    async fn concurrent_decrypts_of_one_prekey_message_succeed_once() {
        let alice = Party::new("alice", 1);
        let bob = Party::new("bob", 1);
        alice.connect(&[&bob]).await;
        let envelope = alice.cipher().encrypt(&bob.address, b"once").await.unwrap();

        let cipher = bob.cipher();
        let candidates = [envelope];
        let (a, b) = tokio::join!(
            cipher.decrypt_from_candidates("alice", 1, &candidates),
            cipher.decrypt_from_candidates("alice", 1, &candidates),
        );

        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let err = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert_eq!(err.kind(), ErrorKind::DuplicateMessage);
    }

    #[tokio::test]
    async fn concurrent_senders_racing_for_one_prekey() {
        let alice = Party::new("alice", 1);
        let carol = Party::new("carol", 1);
        let bob = Party::new("bob", 1);
        let contested = bob.bundle().pre_key.unwrap().id;
        alice.connect(&[&bob]).await;
        carol.connect(&[&bob]).await;

        let from_alice = [alice.cipher().encrypt(&bob.address, b"a").await.unwrap()];
        let from_carol = [carol.cipher().encrypt(&bob.address, b"c").await.unwrap()];

        let cipher = bob.cipher();
        let (a, c) = tokio::join!(
            cipher.decrypt_from_candidates("alice", 1, &from_alice),
            cipher.decrypt_from_candidates("carol", 1, &from_carol),
        );

        let results = [a, c];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let err = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert_eq!(err.kind(), ErrorKind::CryptoFailed);
        assert!(!available_ids(&bob).contains(&contested));
    }

    #[tokio::test]
    async fn failed_unknown_sender_leaves_no_handle() {
        let bob = Party::new("bob", 1);
        let junk = [Envelope::new(1, EnvelopeKind::PreKey, vec![0x33; 96])];
        bob.cipher()
            .decrypt_from_candidates("mallory", 9, &junk)
            .await
            .unwrap_err();
        assert!(bob.registry.is_empty());
    }

    #[tokio::test]
    async fn prekey_messages_before_reply_decrypt_out_of_order() {
        let alice = Party::new("alice", 1);
        let bob = Party::new("bob", 1);
        alice.connect(&[&bob]).await;

        let first = alice.cipher().encrypt(&bob.address, b"one").await.unwrap();
        let second = alice.cipher().encrypt(&bob.address, b"two").await.unwrap();
        assert!(first.is_prekey() && second.is_prekey());

        let cipher = bob.cipher();
        assert_eq!(cipher.decrypt(&alice.address, &second).await.unwrap(), b"two");
        assert_eq!(cipher.decrypt(&alice.address, &first).await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn bad_candidate_before_good_one() {
        let alice = Party::new("alice", 1);
        let bob = Party::new("bob", 1);
        alice.connect(&[&bob]).await;

        let good = alice.cipher().encrypt(&bob.address, b"the real one").await.unwrap();
        let bad_prekey = Envelope::new(1, EnvelopeKind::PreKey, vec![0x33; 96]);
        let bad_standard = Envelope::new(1, EnvelopeKind::Standard, vec![0x08; 64]);

        let plaintext = bob
            .cipher()
            .decrypt_from_candidates("alice", 1, &[bad_prekey, bad_standard, good])
            .await
            .unwrap();
        assert_eq!(plaintext, b"the real one");
    }

    #[tokio::test]
    async fn all_bad_candidates_is_crypto_failed() {
        let bob = Party::new("bob", 1);
        let candidates = [
            Envelope::new(1, EnvelopeKind::PreKey, vec![0x33; 96]),
            Envelope::new(1, EnvelopeKind::Standard, vec![0x08; 64]),
        ];
        let err = bob
            .cipher()
            .decrypt_from_candidates("alice", 1, &candidates)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::CryptoFailed { ref address, attempts: 2 } if address.user_id == "alice"
        ));
    }

    #[tokio::test]
    async fn standard_message_without_session_is_no_session() {
        let alice = Party::new("alice", 1);
        let bob = Party::new("bob", 1);
        alice.connect(&[&bob]).await;
        let first = alice.cipher().encrypt(&bob.address, b"hello").await.unwrap();
        bob.cipher().decrypt(&alice.address, &first).await.unwrap();
        let reply = bob.cipher().encrypt(&alice.address, b"reply").await.unwrap();

        // Same address, fresh install with no session state.
        let reinstalled = Party::new("alice", 1);
        let err = reinstalled
            .cipher()
            .decrypt(&bob.address, &reply)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSession);
    }

    #[tokio::test]
    async fn concurrent_encrypts_to_one_device_stay_decryptable() {
        let alice = Party::new("alice", 1);
        let bob = Party::new("bob", 1);
        alice.connect(&[&bob]).await;

        let cipher = alice.cipher();
        let (a, b) = tokio::join!(
            cipher.encrypt_to_all("bob", &[1], b"left"),
            cipher.encrypt_to_all("bob", &[1], b"right"),
        );
        let a = envelope_for(&a.unwrap(), 1);
        let b = envelope_for(&b.unwrap(), 1);
        assert_ne!(a.ciphertext, b.ciphertext);

        let receiver = bob.cipher();
        let mut got = vec![
            receiver.decrypt(&alice.address, &a).await.unwrap(),
            receiver.decrypt(&alice.address, &b).await.unwrap(),
        ];
        got.sort();
        assert_eq!(got, vec![b"left".to_vec(), b"right".to_vec()]);
    }

    #[tokio::test]
    async fn sealed_message_reaches_recipients_and_own_devices() {
        let alice = Party::new("alice", 11);
        let alice_tablet = Party::new("alice", 12);
        let bob_phone = Party::new("bob", 21);
        let bob_laptop = Party::new("bob", 22);
        alice
            .connect(&[&alice_tablet, &bob_phone, &bob_laptop])
            .await;

        let (sealed, outcomes) = alice
            .cipher()
            .seal("bob", &[21, 22, 23], b"dinner at eight")
            .await
            .unwrap();
        assert_eq!(sealed.sender_device_id, 11);
        assert_eq!(sealed.keys.len(), 3);
        assert_eq!(outcomes.len(), 4);
        assert!(matches!(outcomes.get(&alice_tablet.address), Some(Ok(_))));
        assert_eq!(
            outcomes
                .get(&DeviceAddress::new("bob", 23))
                .unwrap()
                .as_ref()
                .unwrap_err()
                .kind(),
            ErrorKind::NoSession
        );

        for receiver in [&bob_phone, &bob_laptop, &alice_tablet] {
            assert_eq!(
                receiver.cipher().open("alice", &sealed).await.unwrap(),
                b"dinner at eight"
            );
        }
    }

    #[tokio::test]
    async fn tampered_sealed_payload_is_rejected() {
        let alice = Party::new("alice", 11);
        let bob = Party::new("bob", 21);
        alice.connect(&[&bob]).await;

        let (mut sealed, _) = alice.cipher().seal("bob", &[21], b"secret").await.unwrap();
        sealed.payload[0] ^= 0x80;
        let err = bob.cipher().open("alice", &sealed).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CryptoFailed);
    }
}
