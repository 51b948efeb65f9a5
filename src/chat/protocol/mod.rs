//! Chat protocol types and operations.
//!
//! - **Handshake**: signed X25519 exchange checked against the trust store
//! - **KDF**: HKDF-SHA256 directional session keys
//! - **Frames**: AES-256-GCM frames with sequence-bound nonces and AAD
//! - **Payloads**: typed plaintexts carried inside frames

mod frame;
mod handshake;
mod kdf;
mod payload;

pub use frame::{
    associated_data, frame_nonce, FrameType, MessageFrame, WireMessage, NONCE_SIZE, TAG_SIZE,
};
pub use handshake::{Established, HandshakeMessage, HandshakeState, Handshaker, KeyExchange};
pub use kdf::{derive_session_keys, SessionKeys};
pub use payload::{FileChunk, FileId, FileMeta, Payload};
