//! # WhisperLink Chat Module
//!
//! Peer-to-peer encrypted chat and file transfer over any ordered byte stream.
//!
//! ## Security Model
//!
//! - **Ed25519 identities** checked against the trust store before any key exists
//! - **X25519 ephemeral keys** per session and per rekey, so keys never repeat
//! - **AES-256-GCM frames** with sequence-bound nonces and associated data
//! - **Strictly increasing sequence numbers**; replays and reordering tear the
//!   connection down
//! - **All keys zeroized** on drop and on rekey

pub mod channel;
pub mod config;
mod connection;
pub mod error;
pub mod events;
pub mod protocol;
pub mod transfer;
pub mod transport;
mod worker;

pub use channel::{FrameCodec, RekeyPolicy, SecureChannel};
pub use config::ChatConfig;
pub use connection::Connection;
pub use error::{ChatError, CryptoError, FileTransferError, HandshakeError};
pub use events::{ChatEvent, ConnectionInfo, ConnectionState, Direction, DisconnectReason};
pub use protocol::{FileId, HandshakeMessage, MessageFrame, Payload, WireMessage};
pub use transport::{resolve_address, Dialer, TcpDialer, TcpListener};
