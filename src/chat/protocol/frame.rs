//! Wire units and encrypted frame layout.

use serde::{Deserialize, Serialize};

use crate::chat::config::CHAT_PROTOCOL_VERSION;
use crate::chat::protocol::handshake::HandshakeMessage;

/// AES-GCM nonce size.
pub const NONCE_SIZE: usize = 12;

/// AES-GCM tag size.
pub const TAG_SIZE: usize = 16;

/// Frame types. The discriminant is bound into the associated data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    Chat = 1,
    Ping = 2,
    Pong = 3,
    FileMeta = 4,
    FileChunk = 5,
    FileComplete = 6,
    RekeyInit = 7,
    RekeyAck = 8,
    Disconnect = 9,
}

impl FrameType {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// An authenticated, encrypted frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageFrame {
    pub frame_type: FrameType,
    pub sequence: u64,
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_SIZE],
}

/// Everything that travels over the transport.
///
/// `Handshake` is only legal before a session exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WireMessage {
    Handshake(HandshakeMessage),
    Frame(MessageFrame),
}

impl WireMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// version || type || sequence (big-endian)
pub fn associated_data(frame_type: FrameType, sequence: u64) -> [u8; 10] {
    let mut aad = [0u8; 10];
    aad[0] = CHAT_PROTOCOL_VERSION;
    aad[1] = frame_type.as_byte();
    aad[2..].copy_from_slice(&sequence.to_be_bytes());
    aad
}

/// direction prefix || sequence (big-endian)
pub fn frame_nonce(prefix: [u8; 4], sequence: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..4].copy_from_slice(&prefix);
    nonce[4..].copy_from_slice(&sequence.to_be_bytes());
    nonce
}
