//! Secure channel: sequencing, AEAD and the rekey schedule for one session.
//!
//! Each direction has its own key and counter. A frame's nonce is the
//! direction prefix followed by its sequence number, so a nonce is never
//! reused under one key. Version, type and sequence are bound as associated
//! data. The receiver accepts only sequence numbers strictly above the last
//! accepted one.

use std::time::{Duration, Instant};

use aes_gcm::aead::{Aead, KeyInit, Payload as AeadPayload};
use aes_gcm::{Aes256Gcm, Nonce};

use crate::chat::config::ChatConfig;
use crate::chat::error::{ChatError, CryptoError};
use crate::chat::protocol::{
    associated_data, frame_nonce, Established, FrameType, MessageFrame, Payload, SessionKeys,
    TAG_SIZE,
};
use crate::crypto::Fingerprint;
use crate::trust::TrustEntry;

/// Capability to seal and open frames.
pub trait FrameCodec {
    fn encrypt(
        &mut self,
        frame_type: FrameType,
        plaintext: &[u8],
    ) -> Result<MessageFrame, CryptoError>;

    fn decrypt(&mut self, frame: &MessageFrame) -> Result<Vec<u8>, CryptoError>;

    /// Encode and encrypt a payload under its own frame type.
    fn seal(&mut self, payload: &Payload) -> Result<MessageFrame, ChatError> {
        let plaintext = payload.encode()?;
        Ok(self.encrypt(payload.frame_type(), &plaintext)?)
    }

    /// Decrypt a frame and decode its payload.
    fn open(&mut self, frame: &MessageFrame) -> Result<Payload, CryptoError> {
        let plaintext = self.decrypt(frame)?;
        Payload::decode(frame.frame_type, &plaintext)
    }
}

/// When a session's keys must be replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RekeyPolicy {
    pub after_messages: u64,
    pub after: Duration,
}

impl RekeyPolicy {
    pub fn from_config(config: &ChatConfig) -> Self {
        Self {
            after_messages: config.rekey_after_messages,
            after: config.rekey_after(),
        }
    }
}

/// Keys and counters produced by one handshake.
#[derive(Debug)]
pub struct Session {
    keys: SessionKeys,
    send_counter: u64,
    last_received: Option<u64>,
    established_at: Instant,
    /// Frames sent plus frames accepted under these keys.
    message_count: u64,
}

impl Session {
    fn new(keys: SessionKeys) -> Self {
        Self {
            keys,
            send_counter: 0,
            last_received: None,
            established_at: Instant::now(),
            message_count: 0,
        }
    }
}

/// An established, authenticated channel to one peer.
#[derive(Debug)]
pub struct SecureChannel {
    session: Session,
    peer: TrustEntry,
    policy: RekeyPolicy,
    rekey_signalled: bool,
    generation: u32,
    total_sent: u64,
    total_received: u64,
}

impl SecureChannel {
    pub fn new(established: Established, policy: RekeyPolicy) -> Self {
        let Established { keys, peer, .. } = established;
        Self {
            session: Session::new(keys),
            peer,
            policy,
            rekey_signalled: false,
            generation: 0,
            total_sent: 0,
            total_received: 0,
        }
    }

    pub fn peer(&self) -> &TrustEntry {
        &self.peer
    }

    pub fn peer_fingerprint(&self) -> Fingerprint {
        self.peer.fingerprint
    }

    pub fn message_count(&self) -> u64 {
        self.session.message_count
    }

    pub fn established_at(&self) -> Instant {
        self.session.established_at
    }

    /// Number of completed rekeys.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn total_sent(&self) -> u64 {
        self.total_sent
    }

    pub fn total_received(&self) -> u64 {
        self.total_received
    }

    /// Instant at which the time-based rekey trigger fires.
    pub fn rekey_deadline(&self) -> Instant {
        self.session.established_at + self.policy.after
    }

    /// True exactly once per key lifetime, when a threshold is first reached.
    pub fn rekey_due(&mut self) -> bool {
        self.rekey_due_at(Instant::now())
    }

    pub fn rekey_due_at(&mut self, now: Instant) -> bool {
        if self.rekey_signalled {
            return false;
        }
        let by_count = self.session.message_count >= self.policy.after_messages;
        let by_time = now.saturating_duration_since(self.session.established_at) >= self.policy.after;
        if by_count || by_time {
            self.rekey_signalled = true;
            return true;
        }
        false
    }

    /// Replace the session with freshly negotiated keys.
    ///
    /// The old keys are zeroized when the old session drops here.
    pub fn install(&mut self, established: Established) -> Result<(), CryptoError> {
        if established.peer.fingerprint != self.peer.fingerprint {
            return Err(CryptoError::RekeyIdentityChanged);
        }
        let Established { keys, peer, .. } = established;
        self.session = Session::new(keys);
        self.peer = peer;
        self.rekey_signalled = false;
        self.generation += 1;
        Ok(())
    }

    fn cipher(key: &[u8; 32]) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::EncryptionFailed)
    }
}

impl FrameCodec for SecureChannel {
    fn encrypt(
        &mut self,
        frame_type: FrameType,
        plaintext: &[u8],
    ) -> Result<MessageFrame, CryptoError> {
        let sequence = self.session.send_counter;
        if sequence == u64::MAX {
            return Err(CryptoError::CounterExhausted);
        }

        let nonce = frame_nonce(self.session.keys.send_prefix, sequence);
        let aad = associated_data(frame_type, sequence);
        let cipher = Self::cipher(&self.session.keys.send_key)?;

        let mut sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                AeadPayload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let tag_start = sealed
            .len()
            .checked_sub(TAG_SIZE)
            .ok_or(CryptoError::EncryptionFailed)?;
        let tag: [u8; TAG_SIZE] = sealed[tag_start..]
            .try_into()
            .map_err(|_| CryptoError::EncryptionFailed)?;
        sealed.truncate(tag_start);

        self.session.send_counter += 1;
        self.session.message_count += 1;
        self.total_sent += 1;

        Ok(MessageFrame {
            frame_type,
            sequence,
            nonce,
            ciphertext: sealed,
            tag,
        })
    }

    fn decrypt(&mut self, frame: &MessageFrame) -> Result<Vec<u8>, CryptoError> {
        let last = self.session.last_received;
        if last.is_some_and(|last| frame.sequence <= last) {
            return Err(CryptoError::ReplayOrReorder {
                got: frame.sequence,
                last,
            });
        }

        if frame.nonce != frame_nonce(self.session.keys.receive_prefix, frame.sequence) {
            return Err(CryptoError::AuthenticationFailed);
        }

        let aad = associated_data(frame.frame_type, frame.sequence);
        let mut sealed = Vec::with_capacity(frame.ciphertext.len() + TAG_SIZE);
        sealed.extend_from_slice(&frame.ciphertext);
        sealed.extend_from_slice(&frame.tag);

        let cipher = Self::cipher(&self.session.keys.receive_key)?;
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&frame.nonce),
                AeadPayload {
                    msg: &sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        self.session.last_received = Some(frame.sequence);
        self.session.message_count += 1;
        self.total_received += 1;
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::protocol::{Handshaker, KeyExchange};
    use crate::crypto::Identity;
    use crate::trust::TrustStore;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn established_pair() -> (Established, Established) {
        let (alice, bob) = (Arc::new(Identity::generate()), Arc::new(Identity::generate()));
        let alice_trust = Arc::new(TrustStore::in_memory());
        let bob_trust = Arc::new(TrustStore::in_memory());
        alice_trust
            .add(bob.fingerprint(), "127.0.0.1:34567", Some("bob"))
            .unwrap();
        bob_trust
            .add(alice.fingerprint(), "127.0.0.1:34567", Some("alice"))
            .unwrap();

        let mut a = KeyExchange::new(alice, alice_trust, None);
        let mut b = KeyExchange::new(bob, bob_trust, None);
        let offer_a = a.offer().unwrap();
        let offer_b = b.offer().unwrap();
        (a.receive(&offer_b).unwrap(), b.receive(&offer_a).unwrap())
    }

    fn channel_pair(policy: RekeyPolicy) -> (SecureChannel, SecureChannel) {
        let (a, b) = established_pair();
        (SecureChannel::new(a, policy), SecureChannel::new(b, policy))
    }

    fn default_policy() -> RekeyPolicy {
        RekeyPolicy {
            after_messages: 10,
            after: Duration::from_secs(120),
        }
    }

    fn generous_policy() -> RekeyPolicy {
        RekeyPolicy {
            after_messages: u64::MAX,
            after: Duration::from_secs(3600),
        }
    }

    #[test]
    fn test_encrypt_decrypt_both_directions() {
        let (mut alice, mut bob) = channel_pair(default_policy());

        let frame = alice.encrypt(FrameType::Chat, b"hi bob").unwrap();
        assert_eq!(bob.decrypt(&frame).unwrap(), b"hi bob");

        let reply = bob.encrypt(FrameType::Chat, b"hi alice").unwrap();
        assert_eq!(alice.decrypt(&reply).unwrap(), b"hi alice");
        assert_eq!(alice.message_count(), 2);
        assert_eq!(bob.message_count(), 2);
    }

    #[test]
    fn test_replay_rejected() {
        let (mut alice, mut bob) = channel_pair(default_policy());
        let frame = alice.encrypt(FrameType::Chat, b"once").unwrap();
        bob.decrypt(&frame).unwrap();

        assert_eq!(
            bob.decrypt(&frame),
            Err(CryptoError::ReplayOrReorder {
                got: 0,
                last: Some(0)
            })
        );
    }

    #[test]
    fn test_reorder_rejected() {
        let (mut alice, mut bob) = channel_pair(generous_policy());
        let first = alice.encrypt(FrameType::Chat, b"1").unwrap();
        let second = alice.encrypt(FrameType::Chat, b"2").unwrap();

        bob.decrypt(&second).unwrap();
        assert!(matches!(
            bob.decrypt(&first),
            Err(CryptoError::ReplayOrReorder { got: 0, .. })
        ));
    }

    #[test]
    fn test_gap_is_accepted_when_strictly_greater() {
        let (mut alice, mut bob) = channel_pair(generous_policy());
        let _dropped = alice.encrypt(FrameType::Chat, b"lost").unwrap();
        let later = alice.encrypt(FrameType::Chat, b"kept").unwrap();
        assert_eq!(bob.decrypt(&later).unwrap(), b"kept");
    }

    #[test]
    fn test_nonces_unique_over_10k_frames() {
        let (mut alice, _bob) = channel_pair(generous_policy());
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let frame = alice.encrypt(FrameType::Ping, b"").unwrap();
            assert!(seen.insert(frame.nonce), "nonce reused");
        }
        assert_eq!(seen.len(), 10_000);
    }

    #[test]
    fn test_tampered_ciphertext_fails_authentication() {
        let (mut alice, mut bob) = channel_pair(default_policy());
        let mut frame = alice.encrypt(FrameType::Chat, b"attack at dawn").unwrap();
        frame.ciphertext[0] ^= 0x01;
        assert_eq!(bob.decrypt(&frame), Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn test_substituted_type_fails_authentication() {
        let (mut alice, mut bob) = channel_pair(default_policy());
        let mut frame = alice.encrypt(FrameType::Chat, b"text").unwrap();
        frame.frame_type = FrameType::Disconnect;
        assert_eq!(bob.decrypt(&frame), Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn test_relabelled_sequence_fails_authentication() {
        let (mut alice, mut bob) = channel_pair(default_policy());
        let mut frame = alice.encrypt(FrameType::Chat, b"text").unwrap();
        frame.sequence = 5;
        frame.nonce = frame_nonce(alice.session.keys.send_prefix, 5);
        assert_eq!(bob.decrypt(&frame), Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn test_own_frame_does_not_decrypt_locally() {
        let (mut alice, _bob) = channel_pair(default_policy());
        let frame = alice.encrypt(FrameType::Chat, b"echo").unwrap();
        assert_eq!(alice.decrypt(&frame), Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn test_rekey_due_at_message_count() {
        let (mut alice, mut bob) = channel_pair(default_policy());
        let now = alice.established_at();

        for i in 0..9 {
            let frame = alice.encrypt(FrameType::Chat, b"m").unwrap();
            bob.decrypt(&frame).unwrap();
            assert!(!alice.rekey_due_at(now), "early rekey after {} frames", i + 1);
        }
        alice.encrypt(FrameType::Chat, b"tenth").unwrap();
        assert_eq!(alice.message_count(), 10);
        assert!(alice.rekey_due_at(now));
        // signalled once only
        assert!(!alice.rekey_due_at(now));
        alice.encrypt(FrameType::Chat, b"eleventh").unwrap();
        assert!(!alice.rekey_due_at(now));
    }

    #[test]
    fn test_rekey_due_at_elapsed_time() {
        let (mut alice, _bob) = channel_pair(default_policy());
        let start = alice.established_at();

        assert!(!alice.rekey_due_at(start + Duration::from_secs(119)));
        assert!(alice.rekey_due_at(start + Duration::from_secs(120)));
        assert!(!alice.rekey_due_at(start + Duration::from_secs(500)));
        assert_eq!(alice.message_count(), 0);
    }

    #[test]
    fn test_install_rejects_other_identity() {
        let (mut alice, _bob) = channel_pair(default_policy());
        let (_, stranger) = established_pair();

        assert_eq!(
            alice.install(stranger),
            Err(CryptoError::RekeyIdentityChanged)
        );
        assert_eq!(alice.generation(), 0);
    }

    #[test]
    fn test_rekeyed_channels_keep_talking() {
        let (alice_id, bob_id) = (Arc::new(Identity::generate()), Arc::new(Identity::generate()));
        let alice_trust = Arc::new(TrustStore::in_memory());
        let bob_trust = Arc::new(TrustStore::in_memory());
        alice_trust.add(bob_id.fingerprint(), "h:1", None).unwrap();
        bob_trust.add(alice_id.fingerprint(), "h:2", None).unwrap();

        let handshake = || {
            let mut a = KeyExchange::new(alice_id.clone(), alice_trust.clone(), None);
            let mut b = KeyExchange::new(bob_id.clone(), bob_trust.clone(), None);
            let offer_a = a.offer().unwrap();
            let offer_b = b.offer().unwrap();
            (a.receive(&offer_b).unwrap(), b.receive(&offer_a).unwrap())
        };

        let (a0, b0) = handshake();
        let mut alice = SecureChannel::new(a0, default_policy());
        let mut bob = SecureChannel::new(b0, default_policy());
        let before = alice.encrypt(FrameType::Chat, b"before").unwrap();
        bob.decrypt(&before).unwrap();

        let (a1, b1) = handshake();
        alice.install(a1).unwrap();
        bob.install(b1).unwrap();
        assert_eq!(alice.message_count(), 0);
        assert_eq!(alice.generation(), 1);

        // a frame from the retired keys no longer opens
        assert_eq!(bob.decrypt(&before), Err(CryptoError::AuthenticationFailed));

        let after = alice.encrypt(FrameType::Chat, b"after").unwrap();
        assert_eq!(after.sequence, 0);
        assert_eq!(bob.decrypt(&after).unwrap(), b"after");
        assert_eq!(alice.total_sent(), 2);
    }
}
