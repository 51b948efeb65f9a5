//! Session key derivation.
//!
//! Both directional keys come from one HKDF-SHA256 instance keyed by the
//! X25519 shared secret. The expansion info binds a direction label and both
//! ephemeral public keys in canonical (byte-wise ascending) order, so the two
//! peers compute the same pair without agreeing on roles first. The peer owning
//! the lower ephemeral key sends on the low-to-high key.

use std::fmt;

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

const KDF_SALT: &[u8] = b"whisperlink/v1/session";
const LABEL_LOW_TO_HIGH: &[u8] = b"whisperlink/v1/key/low->high";
const LABEL_HIGH_TO_LOW: &[u8] = b"whisperlink/v1/key/high->low";

/// Nonce prefixes, one per direction, so the two directions never share a
/// nonce even if their keys collided.
const PREFIX_LOW_TO_HIGH: [u8; 4] = *b"wl>h";
const PREFIX_HIGH_TO_LOW: [u8; 4] = *b"wl<h";

/// Directional keys for one session.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub send_key: [u8; 32],
    pub receive_key: [u8; 32],
    #[zeroize(skip)]
    pub send_prefix: [u8; 4],
    #[zeroize(skip)]
    pub receive_prefix: [u8; 4],
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKeys { .. }")
    }
}

/// Derive this side's send/receive keys.
///
/// Callers must reject equal ephemeral keys before calling.
pub fn derive_session_keys(
    shared_secret: &[u8; 32],
    local_ephemeral: &[u8; 32],
    peer_ephemeral: &[u8; 32],
) -> SessionKeys {
    let local_is_low = local_ephemeral < peer_ephemeral;
    let (low, high) = if local_is_low {
        (local_ephemeral, peer_ephemeral)
    } else {
        (peer_ephemeral, local_ephemeral)
    };

    let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), shared_secret);

    let mut low_to_high = [0u8; 32];
    let mut high_to_low = [0u8; 32];
    hk.expand_multi_info(&[LABEL_LOW_TO_HIGH, low.as_slice(), high.as_slice()], &mut low_to_high)
        .expect("32 bytes is valid output length");
    hk.expand_multi_info(&[LABEL_HIGH_TO_LOW, low.as_slice(), high.as_slice()], &mut high_to_low)
        .expect("32 bytes is valid output length");

    let keys = if local_is_low {
        SessionKeys {
            send_key: low_to_high,
            receive_key: high_to_low,
            send_prefix: PREFIX_LOW_TO_HIGH,
            receive_prefix: PREFIX_HIGH_TO_LOW,
        }
    } else {
        SessionKeys {
            send_key: high_to_low,
            receive_key: low_to_high,
            send_prefix: PREFIX_HIGH_TO_LOW,
            receive_prefix: PREFIX_LOW_TO_HIGH,
        }
    };

    low_to_high.zeroize();
    high_to_low.zeroize();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_swapped_between_peers() {
        let shared = [7u8; 32];
        let a = [1u8; 32];
        let b = [2u8; 32];

        let alice = derive_session_keys(&shared, &a, &b);
        let bob = derive_session_keys(&shared, &b, &a);

        assert_eq!(alice.send_key, bob.receive_key);
        assert_eq!(alice.receive_key, bob.send_key);
        assert_eq!(alice.send_prefix, bob.receive_prefix);
        assert_ne!(alice.send_key, alice.receive_key);
        assert_ne!(alice.send_prefix, alice.receive_prefix);
    }

    #[test]
    fn test_ephemeral_keys_are_bound() {
        let shared = [7u8; 32];
        let first = derive_session_keys(&shared, &[1u8; 32], &[2u8; 32]);
        let second = derive_session_keys(&shared, &[1u8; 32], &[3u8; 32]);
        assert_ne!(first.send_key, second.send_key);
    }

    #[test]
    fn test_deterministic() {
        let shared = [9u8; 32];
        let one = derive_session_keys(&shared, &[4u8; 32], &[5u8; 32]);
        let two = derive_session_keys(&shared, &[4u8; 32], &[5u8; 32]);
        assert_eq!(one.send_key, two.send_key);
        assert_eq!(one.receive_key, two.receive_key);
    }
}
