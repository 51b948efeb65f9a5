//! Long-term Ed25519 identity and its fingerprint.
//!
//! The identity key signs every handshake offer. Peers recognise each other by
//! the fingerprint, the SHA-256 digest of the 32-byte public key.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;
use zeroize::Zeroizing;

use super::symmetric::{open_with_passphrase, seal_with_passphrase, SymmetricError};

const IDENTITY_KEY_HEADER: &str = "-----BEGIN WHISPERLINK IDENTITY KEY-----";
const IDENTITY_KEY_FOOTER: &str = "-----END WHISPERLINK IDENTITY KEY-----";

const SEALED_KEY_HEADER: &str = "-----BEGIN WHISPERLINK SEALED IDENTITY KEY-----";
const SEALED_KEY_FOOTER: &str = "-----END WHISPERLINK SEALED IDENTITY KEY-----";

/// Length of a fingerprint rendered as hex.
pub const FINGERPRINT_HEX_LEN: usize = 64;

/// Errors that can occur while loading or storing an identity.
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid key file: {0}")]
    InvalidKeyFile(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Identity key is passphrase protected; a passphrase is required")]
    PassphraseRequired,

    #[error("Wrong passphrase or corrupted identity key")]
    WrongPassphrase,

    #[error("Invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("Failed to seal identity key: {0}")]
    SealFailed(String),

    #[error("Base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// SHA-256 digest of an Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint of a raw public key.
    pub fn of(public_key: &[u8; 32]) -> Self {
        Self(Sha256::digest(public_key).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering, 64 characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 hex characters, used as a fallback peer label.
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(8);
        hex
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl FromStr for Fingerprint {
    type Err = IdentityError;

    /// Parses 64 hex characters in either case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.len() != FINGERPRINT_HEX_LEN {
            return Err(IdentityError::InvalidFingerprint(format!(
                "expected {} hex characters, got {}",
                FINGERPRINT_HEX_LEN,
                trimmed.len()
            )));
        }
        let bytes = hex::decode(trimmed.to_ascii_lowercase())
            .map_err(|e| IdentityError::InvalidFingerprint(e.to_string()))?;
        let digest: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidFingerprint(trimmed.to_string()))?;
        Ok(Self(digest))
    }
}

/// The local long-term identity.
pub struct Identity {
    signing_key: SigningKey,
    fingerprint: Fingerprint,
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Rebuild an identity from its 32-byte secret seed.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(bytes))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let fingerprint = Fingerprint::of(signing_key.verifying_key().as_bytes());
        Self {
            signing_key,
            fingerprint,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign `message`, returning the 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    /// Write the key to `path`, sealed when a passphrase is given.
    ///
    /// The file is created owner-readable only on Unix.
    pub fn save(&self, path: &Path, passphrase: Option<&str>) -> Result<(), IdentityError> {
        let seed = Zeroizing::new(self.signing_key.to_bytes());
        let armored = match passphrase {
            Some(passphrase) => {
                let sealed = seal_with_passphrase(seed.as_ref(), passphrase)
                    .map_err(|e| IdentityError::SealFailed(e.to_string()))?;
                encode_armor(SEALED_KEY_HEADER, &sealed, SEALED_KEY_FOOTER)
            }
            None => encode_armor(IDENTITY_KEY_HEADER, seed.as_ref(), IDENTITY_KEY_FOOTER),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_private_file(path, armored.as_bytes())
    }

    /// Load the key stored at `path`.
    pub fn load(path: &Path, passphrase: Option<&str>) -> Result<Self, IdentityError> {
        let content = Zeroizing::new(fs::read_to_string(path)?);

        if content.contains(SEALED_KEY_HEADER) {
            let passphrase = passphrase.ok_or(IdentityError::PassphraseRequired)?;
            let sealed = decode_armor(&content, SEALED_KEY_HEADER, SEALED_KEY_FOOTER)?;
            let seed = open_with_passphrase(&sealed, passphrase).map_err(|e| match e {
                SymmetricError::DecryptionFailed | SymmetricError::CiphertextTooShort => {
                    IdentityError::WrongPassphrase
                }
                other => IdentityError::InvalidKeyFile(other.to_string()),
            })?;
            return Self::from_seed_slice(&seed);
        }

        let seed = Zeroizing::new(decode_armor(
            &content,
            IDENTITY_KEY_HEADER,
            IDENTITY_KEY_FOOTER,
        )?);
        Self::from_seed_slice(&seed)
    }

    /// Load the identity at `path`, generating and saving one if absent.
    pub fn load_or_create(path: &Path, passphrase: Option<&str>) -> Result<Self, IdentityError> {
        if path.exists() {
            return Self::load(path, passphrase);
        }
        let identity = Self::generate();
        identity.save(path, passphrase)?;
        info!(fingerprint = %identity.fingerprint, "generated new identity");
        Ok(identity)
    }

    /// Replace the stored identity with a freshly generated one.
    pub fn reset(path: &Path, passphrase: Option<&str>) -> Result<Self, IdentityError> {
        let identity = Self::generate();
        identity.save(path, passphrase)?;
        info!(fingerprint = %identity.fingerprint, "identity reset");
        Ok(identity)
    }

    /// Whether the key file at `path` needs a passphrase to open.
    pub fn is_sealed(path: &Path) -> Result<bool, IdentityError> {
        let content = fs::read_to_string(path)?;
        Ok(content.contains(SEALED_KEY_HEADER))
    }

    fn from_seed_slice(seed: &[u8]) -> Result<Self, IdentityError> {
        let bytes: Zeroizing<[u8; 32]> =
            Zeroizing::new(seed.try_into().map_err(|_| IdentityError::InvalidKeyLength {
                expected: 32,
                got: seed.len(),
            })?);
        Ok(Self::from_secret_bytes(&bytes))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

fn encode_armor(header: &str, bytes: &[u8], footer: &str) -> String {
    format!("{}\n{}\n{}\n", header, BASE64.encode(bytes), footer)
}

fn decode_armor(content: &str, header: &str, footer: &str) -> Result<Vec<u8>, IdentityError> {
    let content = content.trim();
    if !content.starts_with(header) || !content.ends_with(footer) {
        return Err(IdentityError::InvalidKeyFile(
            "missing identity key header or footer".to_string(),
        ));
    }

    let body: String = content[header.len()..content.len() - footer.len()]
        .lines()
        .map(str::trim)
        .collect();
    Ok(BASE64.decode(body)?)
}

fn write_private_file(path: &Path, contents: &[u8]) -> Result<(), IdentityError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()?;

    // An existing file keeps its old mode when truncated.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Signature;
    use tempfile::tempdir;

    #[test]
    fn test_fingerprint_is_sha256_of_public_key() {
        let identity = Identity::generate();
        let expected = hex::encode(Sha256::digest(identity.public_key_bytes()));
        assert_eq!(identity.fingerprint().to_hex(), expected);
        assert_eq!(identity.fingerprint().to_hex().len(), FINGERPRINT_HEX_LEN);
    }

    #[test]
    fn test_fingerprint_parse_accepts_uppercase() {
        let identity = Identity::generate();
        let upper = identity.fingerprint().to_hex().to_uppercase();
        let parsed: Fingerprint = upper.parse().unwrap();
        assert_eq!(parsed, identity.fingerprint());
        assert_eq!(parsed.to_string(), identity.fingerprint().to_hex());
    }

    #[test]
    fn test_fingerprint_parse_rejects_bad_input() {
        assert!("abc".parse::<Fingerprint>().is_err());
        assert!("zz".repeat(32).parse::<Fingerprint>().is_err());
    }

    #[test]
    fn test_sign_verifies_with_public_key() {
        let identity = Identity::generate();
        let signature = identity.sign(b"hello");
        let signature = Signature::from_slice(&signature).unwrap();
        assert!(identity
            .verifying_key()
            .verify_strict(b"hello", &signature)
            .is_ok());
    }

    #[test]
    fn test_save_load_plain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys").join("identity.key");

        let identity = Identity::generate();
        identity.save(&path, None).unwrap();

        let loaded = Identity::load(&path, None).unwrap();
        assert_eq!(loaded.fingerprint(), identity.fingerprint());
        assert!(!Identity::is_sealed(&path).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.key");
        Identity::generate().save(&path, None).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_sealed_identity_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.key");

        let identity = Identity::generate();
        identity.save(&path, Some("hunter2")).unwrap();
        assert!(Identity::is_sealed(&path).unwrap());

        let loaded = Identity::load(&path, Some("hunter2")).unwrap();
        assert_eq!(loaded.fingerprint(), identity.fingerprint());
    }

    #[test]
    fn test_sealed_identity_wrong_passphrase() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.key");
        Identity::generate().save(&path, Some("right")).unwrap();

        let result = Identity::load(&path, Some("wrong"));
        assert!(matches!(result, Err(IdentityError::WrongPassphrase)));
    }

    #[test]
    fn test_sealed_identity_without_passphrase() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.key");
        Identity::generate().save(&path, Some("right")).unwrap();

        let result = Identity::load(&path, None);
        assert!(matches!(result, Err(IdentityError::PassphraseRequired)));
    }

    #[test]
    fn test_load_or_create_is_stable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.key");

        let first = Identity::load_or_create(&path, None).unwrap();
        let second = Identity::load_or_create(&path, None).unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn test_reset_replaces_identity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.key");

        let original = Identity::load_or_create(&path, None).unwrap();
        let replaced = Identity::reset(&path, None).unwrap();
        assert_ne!(original.fingerprint(), replaced.fingerprint());

        let loaded = Identity::load(&path, None).unwrap();
        assert_eq!(loaded.fingerprint(), replaced.fingerprint());
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.key");
        fs::write(&path, "not a key").unwrap();

        assert!(matches!(
            Identity::load(&path, None),
            Err(IdentityError::InvalidKeyFile(_))
        ));
    }
}
