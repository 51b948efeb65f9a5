//! Authenticated ephemeral key exchange.
//!
//! Both peers run the same steps, for the initial session and for every
//! in-channel rekey:
//!
//! 1. Generate an X25519 ephemeral key and send a [`HandshakeMessage`] signed
//!    with the long-term Ed25519 identity.
//! 2. On receipt verify the version, the signature, and that the sender's
//!    fingerprint is in the trust store (and matches the expected peer, if one
//!    was named). Nothing is derived for a peer that fails any check.
//! 3. Compute the shared secret and derive the directional keys.
//!
//! States: `Init -> KeySent -> KeyReceived -> Verifying -> Established | Failed`.

use std::fmt;
use std::sync::Arc;

use ed25519_dalek::{Signature, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::chat::config::CHAT_PROTOCOL_VERSION;
use crate::chat::error::HandshakeError;
use crate::chat::protocol::kdf::{derive_session_keys, SessionKeys};
use crate::crypto::{Fingerprint, Identity};
use crate::trust::{TrustEntry, TrustStore};

/// Domain separation for handshake signatures.
const SIGNATURE_LABEL: &[u8] = b"whisperlink/v1/handshake";

/// One side's key offer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub version: u8,
    /// Fresh X25519 public key for this session.
    pub ephemeral_public: [u8; 32],
    /// Long-term Ed25519 public key of the sender.
    pub identity_public: [u8; 32],
    /// Random value making every signed offer unique.
    pub nonce: [u8; 32],
    /// Ed25519 signature over [`signed_data`](Self::signed_data).
    pub signature: Vec<u8>,
}

impl HandshakeMessage {
    /// label || version || ephemeral_public || nonce
    pub fn signed_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(SIGNATURE_LABEL.len() + 1 + 64);
        data.extend_from_slice(SIGNATURE_LABEL);
        data.push(self.version);
        data.extend_from_slice(&self.ephemeral_public);
        data.extend_from_slice(&self.nonce);
        data
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.identity_public)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    KeySent,
    KeyReceived,
    Verifying,
    Established,
    Failed,
}

/// Result of a completed handshake.
#[derive(Debug)]
pub struct Established {
    pub keys: SessionKeys,
    /// The authenticated peer as recorded in the trust store.
    pub peer: TrustEntry,
    pub local_ephemeral: [u8; 32],
    pub peer_ephemeral: [u8; 32],
}

/// Capability to run one key exchange.
pub trait Handshaker {
    fn state(&self) -> HandshakeState;

    /// Produce the local offer. Valid once, in `Init`.
    fn offer(&mut self) -> Result<HandshakeMessage, HandshakeError>;

    /// Process the peer's offer. Valid once, after [`offer`](Self::offer).
    fn receive(&mut self, message: &HandshakeMessage) -> Result<Established, HandshakeError>;
}

/// Signed X25519 exchange checked against a [`TrustStore`].
pub struct KeyExchange {
    identity: Arc<Identity>,
    trust: Arc<TrustStore>,
    expected: Option<Fingerprint>,
    state: HandshakeState,
    secret: Option<EphemeralSecret>,
    ephemeral_public: [u8; 32],
    keys_derived: bool,
}

impl KeyExchange {
    /// Start an exchange with a fresh ephemeral key.
    ///
    /// With `expected` set, only that fingerprint is accepted.
    pub fn new(
        identity: Arc<Identity>,
        trust: Arc<TrustStore>,
        expected: Option<Fingerprint>,
    ) -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&secret).to_bytes();
        Self {
            identity,
            trust,
            expected,
            state: HandshakeState::Init,
            secret: Some(secret),
            ephemeral_public,
            keys_derived: false,
        }
    }

    pub fn ephemeral_public(&self) -> [u8; 32] {
        self.ephemeral_public
    }

    /// Whether session keys were ever derived by this exchange.
    pub fn keys_derived(&self) -> bool {
        self.keys_derived
    }

    fn verify_and_derive(
        &mut self,
        message: &HandshakeMessage,
    ) -> Result<Established, HandshakeError> {
        if message.version != CHAT_PROTOCOL_VERSION {
            return Err(HandshakeError::VersionMismatch {
                expected: CHAT_PROTOCOL_VERSION,
                got: message.version,
            });
        }

        self.state = HandshakeState::Verifying;

        let verifying_key = VerifyingKey::from_bytes(&message.identity_public)
            .map_err(|_| HandshakeError::InvalidIdentityKey)?;
        let signature =
            Signature::from_slice(&message.signature).map_err(|_| HandshakeError::BadSignature)?;
        verifying_key
            .verify_strict(&message.signed_data(), &signature)
            .map_err(|_| HandshakeError::BadSignature)?;

        let fingerprint = message.fingerprint();
        let peer = self
            .trust
            .lookup(&fingerprint)
            .ok_or(HandshakeError::UnknownFingerprint(fingerprint))?;

        if let Some(expected) = self.expected {
            if expected != fingerprint {
                return Err(HandshakeError::FingerprintMismatch {
                    expected,
                    got: fingerprint,
                });
            }
        }

        if message.ephemeral_public == self.ephemeral_public {
            return Err(HandshakeError::WeakKeyExchange);
        }

        let secret = self
            .secret
            .take()
            .ok_or(HandshakeError::UnexpectedMessage(self.state))?;
        let shared = secret.diffie_hellman(&PublicKey::from(message.ephemeral_public));
        if !shared.was_contributory() {
            return Err(HandshakeError::WeakKeyExchange);
        }

        let keys = derive_session_keys(
            shared.as_bytes(),
            &self.ephemeral_public,
            &message.ephemeral_public,
        );
        self.keys_derived = true;

        Ok(Established {
            keys,
            peer,
            local_ephemeral: self.ephemeral_public,
            peer_ephemeral: message.ephemeral_public,
        })
    }
}

impl Handshaker for KeyExchange {
    fn state(&self) -> HandshakeState {
        self.state
    }

    fn offer(&mut self) -> Result<HandshakeMessage, HandshakeError> {
        if self.state != HandshakeState::Init {
            return Err(HandshakeError::UnexpectedMessage(self.state));
        }

        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);

        let mut message = HandshakeMessage {
            version: CHAT_PROTOCOL_VERSION,
            ephemeral_public: self.ephemeral_public,
            identity_public: self.identity.public_key_bytes(),
            nonce,
            signature: Vec::new(),
        };
        message.signature = self.identity.sign(&message.signed_data());

        self.state = HandshakeState::KeySent;
        Ok(message)
    }

    fn receive(&mut self, message: &HandshakeMessage) -> Result<Established, HandshakeError> {
        if self.state != HandshakeState::KeySent {
            return Err(HandshakeError::UnexpectedMessage(self.state));
        }
        self.state = HandshakeState::KeyReceived;

        match self.verify_and_derive(message) {
            Ok(established) => {
                self.state = HandshakeState::Established;
                debug!(peer = %established.peer.fingerprint.short(), "handshake established");
                Ok(established)
            }
            Err(e) => {
                self.state = HandshakeState::Failed;
                self.secret = None;
                warn!(error = %e, "handshake failed");
                Err(e)
            }
        }
    }
}

impl fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyExchange")
            .field("state", &self.state)
            .field("expected", &self.expected)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Peer {
        identity: Arc<Identity>,
        trust: Arc<TrustStore>,
    }

    fn peer() -> Peer {
        Peer {
            identity: Arc::new(Identity::generate()),
            trust: Arc::new(TrustStore::in_memory()),
        }
    }

    fn trust_each_other(a: &Peer, b: &Peer) {
        a.trust
            .add(b.identity.fingerprint(), "127.0.0.1:34567", Some("b"))
            .unwrap();
        b.trust
            .add(a.identity.fingerprint(), "127.0.0.1:34568", Some("a"))
            .unwrap();
    }

    fn exchange(p: &Peer, expected: Option<Fingerprint>) -> KeyExchange {
        KeyExchange::new(p.identity.clone(), p.trust.clone(), expected)
    }

    #[test]
    fn test_both_sides_derive_swapped_keys() {
        let (alice, bob) = (peer(), peer());
        trust_each_other(&alice, &bob);

        let mut a = exchange(&alice, Some(bob.identity.fingerprint()));
        let mut b = exchange(&bob, None);
        let offer_a = a.offer().unwrap();
        let offer_b = b.offer().unwrap();
        assert_eq!(a.state(), HandshakeState::KeySent);

        let est_a = a.receive(&offer_b).unwrap();
        let est_b = b.receive(&offer_a).unwrap();

        assert_eq!(a.state(), HandshakeState::Established);
        assert_eq!(b.state(), HandshakeState::Established);
        assert_eq!(est_a.keys.send_key, est_b.keys.receive_key);
        assert_eq!(est_a.keys.receive_key, est_b.keys.send_key);
        assert_eq!(est_a.peer.fingerprint, bob.identity.fingerprint());
        assert_eq!(est_b.peer.label(), "a");
    }

    #[test]
    fn test_unknown_fingerprint_derives_nothing() {
        let (alice, mallory) = (peer(), peer());
        // mallory trusts alice, alice does not know mallory
        mallory
            .trust
            .add(alice.identity.fingerprint(), "127.0.0.1:1", None)
            .unwrap();

        let mut a = exchange(&alice, None);
        let mut m = exchange(&mallory, None);
        a.offer().unwrap();
        let offer_m = m.offer().unwrap();

        let result = a.receive(&offer_m);
        assert!(matches!(
            result,
            Err(HandshakeError::UnknownFingerprint(fp)) if fp == mallory.identity.fingerprint()
        ));
        assert_eq!(a.state(), HandshakeState::Failed);
        assert!(!a.keys_derived());
    }

    #[test]
    fn test_bad_signature_rejected() {
        let (alice, bob) = (peer(), peer());
        trust_each_other(&alice, &bob);

        let mut a = exchange(&alice, None);
        let mut b = exchange(&bob, None);
        a.offer().unwrap();
        let mut offer_b = b.offer().unwrap();
        offer_b.ephemeral_public[0] ^= 0xff;

        assert!(matches!(
            a.receive(&offer_b),
            Err(HandshakeError::BadSignature)
        ));
        assert!(!a.keys_derived());
    }

    #[test]
    fn test_impersonation_with_foreign_identity_key_rejected() {
        let (alice, bob, mallory) = (peer(), peer(), peer());
        trust_each_other(&alice, &bob);

        let mut a = exchange(&alice, None);
        let mut m = exchange(&mallory, None);
        a.offer().unwrap();
        // claim bob's identity key over mallory's signature
        let mut forged = m.offer().unwrap();
        forged.identity_public = bob.identity.public_key_bytes();

        assert!(matches!(a.receive(&forged), Err(HandshakeError::BadSignature)));
    }

    #[test]
    fn test_version_mismatch() {
        let (alice, bob) = (peer(), peer());
        trust_each_other(&alice, &bob);

        let mut a = exchange(&alice, None);
        let mut b = exchange(&bob, None);
        a.offer().unwrap();
        let mut offer_b = b.offer().unwrap();
        offer_b.version = CHAT_PROTOCOL_VERSION + 1;

        assert!(matches!(
            a.receive(&offer_b),
            Err(HandshakeError::VersionMismatch { got, .. }) if got == CHAT_PROTOCOL_VERSION + 1
        ));
    }

    #[test]
    fn test_expected_fingerprint_enforced() {
        let (alice, bob, carol) = (peer(), peer(), peer());
        trust_each_other(&alice, &bob);
        alice
            .trust
            .add(carol.identity.fingerprint(), "127.0.0.1:2", None)
            .unwrap();

        let mut a = exchange(&alice, Some(bob.identity.fingerprint()));
        let mut c = exchange(&carol, None);
        a.offer().unwrap();
        let offer_c = c.offer().unwrap();

        assert!(matches!(
            a.receive(&offer_c),
            Err(HandshakeError::FingerprintMismatch { .. })
        ));
    }

    #[test]
    fn test_reflected_offer_rejected() {
        let alice = peer();
        alice
            .trust
            .add(alice.identity.fingerprint(), "127.0.0.1:3", None)
            .unwrap();

        let mut a = exchange(&alice, None);
        let own = a.offer().unwrap();
        assert!(matches!(
            a.receive(&own),
            Err(HandshakeError::WeakKeyExchange)
        ));
    }

    #[test]
    fn test_out_of_order_calls() {
        let (alice, bob) = (peer(), peer());
        trust_each_other(&alice, &bob);

        let mut a = exchange(&alice, None);
        let mut b = exchange(&bob, None);
        let offer_b = b.offer().unwrap();

        assert!(matches!(
            a.receive(&offer_b),
            Err(HandshakeError::UnexpectedMessage(HandshakeState::Init))
        ));
        a.offer().unwrap();
        assert!(a.offer().is_err());
    }

    #[test]
    fn test_message_bytes_roundtrip() {
        let alice = peer();
        let mut a = exchange(&alice, None);
        let offer = a.offer().unwrap();
        let decoded = HandshakeMessage::from_bytes(&offer.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, offer);
        assert_eq!(decoded.fingerprint(), alice.identity.fingerprint());
    }
}
