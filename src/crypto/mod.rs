//! Cryptographic building blocks outside the session protocol.
//!
//! - [`identity`]: the long-term Ed25519 identity and its fingerprint
//! - [`symmetric`]: passphrase sealing for the identity key at rest

pub mod identity;
pub mod symmetric;

pub use identity::{Fingerprint, Identity, IdentityError, FINGERPRINT_HEX_LEN};
pub use symmetric::{open_with_passphrase, seal_with_passphrase, SymmetricError};
