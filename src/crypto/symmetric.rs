//! Passphrase sealing for key material at rest.
//!
//! - Argon2id derives a 256-bit key from the passphrase and a random salt
//! - ChaCha20-Poly1305 encrypts and authenticates the payload
//!
//! Sealed layout: salt (16 bytes) || nonce (12 bytes) || ciphertext (includes tag)

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

/// Argon2id cost: 19 MiB of memory, two passes, one lane.
const KDF_MEMORY_KIB: u32 = 19 * 1024;
const KDF_PASSES: u32 = 2;
const KDF_LANES: u32 = 1;
const KEY_SIZE: usize = 32;

const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

/// Errors that can occur while sealing or opening data.
#[derive(Error, Debug)]
pub enum SymmetricError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Wrong passphrase or corrupted data. The two are indistinguishable.
    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Invalid sealed data: too short")]
    CiphertextTooShort,

    #[error("Key derivation failed")]
    KeyDerivationFailed,
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>, SymmetricError> {
    let params = Params::new(KDF_MEMORY_KIB, KDF_PASSES, KDF_LANES, Some(KEY_SIZE))
        .map_err(|_| SymmetricError::KeyDerivationFailed)?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, key.as_mut())
        .map_err(|_| SymmetricError::KeyDerivationFailed)?;
    Ok(key)
}

/// Seal `plaintext` under a passphrase with a fresh salt and nonce.
pub fn seal_with_passphrase(plaintext: &[u8], passphrase: &str) -> Result<Vec<u8>, SymmetricError> {
    let mut salt = [0u8; SALT_SIZE];
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce_bytes);

    let key = derive_key(passphrase, &salt)?;
    let cipher = ChaCha20Poly1305::new_from_slice(key.as_ref())
        .map_err(|e| SymmetricError::EncryptionFailed(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| SymmetricError::EncryptionFailed(e.to_string()))?;

    let mut sealed = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&salt);
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open data produced by [`seal_with_passphrase`].
pub fn open_with_passphrase(
    sealed: &[u8],
    passphrase: &str,
) -> Result<Zeroizing<Vec<u8>>, SymmetricError> {
    if sealed.len() < SALT_SIZE + NONCE_SIZE + TAG_SIZE {
        return Err(SymmetricError::CiphertextTooShort);
    }

    let (salt, rest) = sealed.split_at(SALT_SIZE);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_SIZE);

    let key = derive_key(passphrase, salt)?;
    let cipher = ChaCha20Poly1305::new_from_slice(key.as_ref())
        .map_err(|_| SymmetricError::DecryptionFailed)?;

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| SymmetricError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let sealed = seal_with_passphrase(b"identity seed", "correct horse").unwrap();
        let opened = open_with_passphrase(&sealed, "correct horse").unwrap();
        assert_eq!(opened.as_slice(), b"identity seed");
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let sealed = seal_with_passphrase(b"identity seed", "correct").unwrap();
        let result = open_with_passphrase(&sealed, "wrong");
        assert!(matches!(result, Err(SymmetricError::DecryptionFailed)));
    }

    #[test]
    fn test_salt_makes_output_unique() {
        let a = seal_with_passphrase(b"same", "pass").unwrap();
        let b = seal_with_passphrase(b"same", "pass").unwrap();
        assert_ne!(a[..SALT_SIZE], b[..SALT_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_derived_key_depends_on_salt_and_passphrase() {
        let key = derive_key("pass", &[1u8; SALT_SIZE]).unwrap();
        assert_eq!(*key, *derive_key("pass", &[1u8; SALT_SIZE]).unwrap());
        assert_ne!(*key, *derive_key("pass", &[2u8; SALT_SIZE]).unwrap());
        assert_ne!(*key, *derive_key("Pass", &[1u8; SALT_SIZE]).unwrap());
    }

    #[test]
    fn test_sealed_data_too_short() {
        let result = open_with_passphrase(&[0u8; 20], "pass");
        assert!(matches!(result, Err(SymmetricError::CiphertextTooShort)));
    }

    #[test]
    fn test_tampered_sealed_data_fails() {
        let mut sealed = seal_with_passphrase(b"payload", "pass").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(open_with_passphrase(&sealed, "pass").is_err());
    }
}
