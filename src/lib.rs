//! # WhisperLink - authenticated peer-to-peer chat
//!
//! Two endpoints that already know each other's identity fingerprints open a
//! mutually authenticated, forward-secret channel over any duplex byte stream
//! (plain TCP or a Tor circuit), exchange messages and files, and rotate
//! session keys in place.
//!
//! ## Overview
//!
//! - Each side holds a long-term Ed25519 identity; its fingerprint is the
//!   SHA-256 of the public key
//! - Fingerprints are exchanged out of band and recorded in the trust store
//! - Every session starts with a signed X25519 exchange; unknown or forged
//!   identities never reach an established session
//! - Frames are AES-256-GCM with per-direction keys from HKDF-SHA256
//! - Keys are replaced after 10 frames or 120 seconds
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use whisperlink::chat::{ChatConfig, ChatEvent, Connection};
//! use whisperlink::crypto::Identity;
//! use whisperlink::trust::TrustStore;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let identity = Arc::new(Identity::generate());
//! let trust = Arc::new(TrustStore::open_default()?);
//! let (connection, mut events) = Connection::new(identity, trust.clone(), ChatConfig::default())?;
//!
//! let peer = trust.find_by_name("bob").ok_or("bob is not trusted")?;
//! connection.connect(&peer.endpoint, peer.fingerprint, None).await?;
//! connection.send_chat_message("hello").await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let ChatEvent::Message { from, text } = event {
//!         println!("{}: {}", from, text);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`crypto`]: identities, fingerprints and passphrase-sealed key files
//! - [`trust`]: the trust store and its legacy migration
//! - [`chat`]: handshake, secure channel, file transfer and connection lifecycle

pub mod chat;
pub mod crypto;
pub mod trust;

pub use chat::{ChatConfig, ChatError, ChatEvent, Connection, ConnectionInfo, ConnectionState};
pub use crypto::{Fingerprint, Identity};
pub use trust::{TrustEntry, TrustStore, TrustStoreError};
