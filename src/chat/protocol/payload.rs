//! Typed frame plaintexts.

use serde::{Deserialize, Serialize};

use crate::chat::error::{ChatError, CryptoError};
use crate::chat::protocol::frame::FrameType;
use crate::chat::protocol::handshake::HandshakeMessage;

/// Sender-chosen identifier of a file transfer.
pub type FileId = u64;

/// Announces an incoming file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMeta {
    pub file_id: FileId,
    pub file_name: String,
    pub total_size: u64,
    pub total_chunks: u32,
    /// SHA-256 of the whole file.
    pub digest: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileChunk {
    pub file_id: FileId,
    pub index: u32,
    pub bytes: Vec<u8>,
}

/// Decrypted content of a frame. Each variant maps to one [`FrameType`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Payload {
    Chat { text: String },
    Ping { id: u64 },
    Pong { id: u64 },
    FileMeta(FileMeta),
    FileChunk(FileChunk),
    FileComplete { file_id: FileId },
    RekeyInit(HandshakeMessage),
    RekeyAck(HandshakeMessage),
    Disconnect { reason: String },
}

impl Payload {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Payload::Chat { .. } => FrameType::Chat,
            Payload::Ping { .. } => FrameType::Ping,
            Payload::Pong { .. } => FrameType::Pong,
            Payload::FileMeta(_) => FrameType::FileMeta,
            Payload::FileChunk(_) => FrameType::FileChunk,
            Payload::FileComplete { .. } => FrameType::FileComplete,
            Payload::RekeyInit(_) => FrameType::RekeyInit,
            Payload::RekeyAck(_) => FrameType::RekeyAck,
            Payload::Disconnect { .. } => FrameType::Disconnect,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ChatError> {
        bincode::serialize(self).map_err(|e| ChatError::SerializationFailed(e.to_string()))
    }

    /// Decode a plaintext and check it matches the authenticated frame type.
    pub fn decode(frame_type: FrameType, plaintext: &[u8]) -> Result<Self, CryptoError> {
        let payload: Payload = bincode::deserialize(plaintext)
            .map_err(|_| CryptoError::MalformedPayload(frame_type))?;
        if payload.frame_type() != frame_type {
            return Err(CryptoError::MalformedPayload(frame_type));
        }
        Ok(payload)
    }
}
