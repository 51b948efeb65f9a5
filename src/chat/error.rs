//! Chat error types.
//!
//! Errors are grouped by what they abort:
//!
//! - [`HandshakeError`]: the connection attempt, before any keys exist
//! - [`CryptoError`]: the whole connection; treated as a security event
//! - [`FileTransferError`]: a single transfer; the connection stays up
//! - [`ChatError`]: everything surfaced to callers of the connection API

use std::path::PathBuf;

use thiserror::Error;

use crate::chat::protocol::{FileId, FrameType, HandshakeState};
use crate::crypto::{Fingerprint, IdentityError};
use crate::trust::TrustStoreError;

/// Failures while authenticating a peer and agreeing on keys.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("Invalid identity public key")]
    InvalidIdentityKey,

    #[error("Handshake signature verification failed")]
    BadSignature,

    #[error("Peer fingerprint {0} is not in the trust store")]
    UnknownFingerprint(Fingerprint),

    #[error("Peer fingerprint {got} does not match expected {expected}")]
    FingerprintMismatch {
        expected: Fingerprint,
        got: Fingerprint,
    },

    /// Reflected ephemeral key or a non-contributory shared secret.
    #[error("Degenerate key exchange")]
    WeakKeyExchange,

    /// The peer closed the stream instead of confirming keys.
    #[error("Peer rejected the handshake")]
    RejectedByPeer,

    #[error("Key confirmation failed")]
    KeyConfirmationFailed,

    #[error("Unexpected handshake message in state {0:?}")]
    UnexpectedMessage(HandshakeState),

    #[error("Handshake timed out")]
    Timeout,
}

/// Failures on an established channel. Any of these tears the connection down.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Frame authentication failed")]
    AuthenticationFailed,

    #[error("Replayed or reordered frame: sequence {got}, last accepted {last:?}")]
    ReplayOrReorder { got: u64, last: Option<u64> },

    #[error("Send counter exhausted; rekey required")]
    CounterExhausted,

    #[error("Malformed payload in {0:?} frame")]
    MalformedPayload(FrameType),

    #[error("Raw handshake received on an established channel")]
    UnexpectedHandshake,

    #[error("Rekey acknowledgement without a pending rekey")]
    UnexpectedRekeyAck,

    #[error("Rekey changed the peer identity")]
    RekeyIdentityChanged,

    #[error("Encryption failed")]
    EncryptionFailed,
}

/// Failures that abort one file transfer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FileTransferError {
    #[error("Transfer {file_id:016x} incomplete: {received}/{total} chunks")]
    IncompleteTransfer {
        file_id: FileId,
        received: u32,
        total: u32,
    },

    #[error("Transfer {file_id:016x} failed integrity check")]
    IntegrityFailure { file_id: FileId },

    #[error("Transfer {file_id:016x} timed out")]
    TransferTimeout { file_id: FileId },

    #[error("Unknown transfer {0:016x}")]
    UnknownTransfer(FileId),

    #[error("Transfer {0:016x} already in progress")]
    DuplicateTransfer(FileId),

    #[error("Chunk {index} out of range for transfer {file_id:016x} ({total} chunks)")]
    ChunkOutOfRange {
        file_id: FileId,
        index: u32,
        total: u32,
    },

    #[error("Transfer {file_id:016x} announced {total_chunks} chunks for {total_size} bytes")]
    InvalidAnnouncement {
        file_id: FileId,
        total_size: u64,
        total_chunks: u32,
    },

    #[error("Transfer {file_id:016x} announced {size} bytes, limit is {limit}")]
    FileTooLarge { file_id: FileId, size: u64, limit: u64 },

    #[error("Chunk sizes disagree with announced size for transfer {file_id:016x}")]
    SizeMismatch { file_id: FileId },

    #[error("Transfer {file_id:016x} aborted: connection closed")]
    Aborted { file_id: FileId },

    #[error("Cannot read {}: {reason}", path.display())]
    Unreadable { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(String),
}

impl FileTransferError {
    /// The transfer this error belongs to, when known.
    pub fn file_id(&self) -> Option<FileId> {
        match self {
            Self::IncompleteTransfer { file_id, .. }
            | Self::IntegrityFailure { file_id }
            | Self::TransferTimeout { file_id }
            | Self::ChunkOutOfRange { file_id, .. }
            | Self::InvalidAnnouncement { file_id, .. }
            | Self::FileTooLarge { file_id, .. }
            | Self::SizeMismatch { file_id }
            | Self::Aborted { file_id } => Some(*file_id),
            Self::UnknownTransfer(file_id) | Self::DuplicateTransfer(file_id) => Some(*file_id),
            Self::Unreadable { .. } | Self::Io(_) => None,
        }
    }
}

impl From<std::io::Error> for FileTransferError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Errors that can occur during chat operations.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Security violation: {0}")]
    Crypto(#[from] CryptoError),

    #[error("File transfer failed: {0}")]
    FileTransfer(#[from] FileTransferError),

    #[error("Trust store error: {0}")]
    TrustStore(#[from] TrustStoreError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Peer did not answer within the ping timeout")]
    PeerUnresponsive,

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Tor error: {0}")]
    TorError(String),
}

impl ChatError {
    /// Whether this error means the peer broke the protocol or its crypto.
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            ChatError::Crypto(_) | ChatError::Handshake(_) | ChatError::SerializationFailed(_)
        )
    }
}
