//! Events and status reported by a connection.

use std::path::PathBuf;
use std::time::Instant;

use crate::chat::error::FileTransferError;
use crate::chat::protocol::FileId;
use crate::crypto::Fingerprint;

/// Lifecycle of a [`Connection`](crate::chat::Connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Handshaking,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Which side opened the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// We called `disconnect`.
    Local,
    /// The peer sent `DISCONNECT`.
    PeerClosed { reason: String },
    /// No `PONG` within the ping timeout, or no answer to a rekey.
    PeerUnresponsive,
    /// The stream broke without a `DISCONNECT`.
    TransportFailure(String),
    /// Authentication, replay or protocol violation. The connection is never resynchronized.
    SecurityViolation(String),
}

impl DisconnectReason {
    /// Whether the close was intentional on either side.
    pub fn is_graceful(&self) -> bool {
        matches!(
            self,
            DisconnectReason::Local | DisconnectReason::PeerClosed { .. }
        )
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::Local => write!(f, "disconnected"),
            DisconnectReason::PeerClosed { reason } if reason.is_empty() => {
                write!(f, "peer closed the connection")
            }
            DisconnectReason::PeerClosed { reason } => {
                write!(f, "peer closed the connection: {}", reason)
            }
            DisconnectReason::PeerUnresponsive => write!(f, "peer unresponsive"),
            DisconnectReason::TransportFailure(e) => write!(f, "connection lost: {}", e),
            DisconnectReason::SecurityViolation(e) => write!(f, "security violation: {}", e),
        }
    }
}

/// Something that happened on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Connected {
        peer: Fingerprint,
        label: String,
        endpoint: String,
    },
    Message {
        from: String,
        text: String,
    },
    FileOffered {
        file_id: FileId,
        file_name: String,
        size: u64,
    },
    /// Emitted at every further 10% of received chunks.
    FileProgress {
        file_id: FileId,
        received: u32,
        total: u32,
    },
    FileReceived {
        file_id: FileId,
        path: PathBuf,
        size: u64,
    },
    FileSent {
        file_id: FileId,
    },
    FileFailed {
        file_id: FileId,
        error: FileTransferError,
    },
    Rekeyed {
        generation: u32,
    },
    Disconnected {
        reason: DisconnectReason,
    },
}

/// Snapshot returned by `Connection::status`.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    pub peer_fingerprint: Option<Fingerprint>,
    pub peer_label: Option<String>,
    pub endpoint: Option<String>,
    pub direction: Option<Direction>,
    pub established_at: Option<Instant>,
    pub rekeys: u32,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub disconnected_at: Option<Instant>,
}

impl ConnectionInfo {
    pub fn idle() -> Self {
        Self::with_state(ConnectionState::Idle)
    }

    pub fn with_state(state: ConnectionState) -> Self {
        Self {
            state,
            peer_fingerprint: None,
            peer_label: None,
            endpoint: None,
            direction: None,
            established_at: None,
            rekeys: 0,
            messages_sent: 0,
            messages_received: 0,
            disconnected_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graceful_reasons() {
        assert!(DisconnectReason::Local.is_graceful());
        assert!(DisconnectReason::PeerClosed {
            reason: String::new()
        }
        .is_graceful());
        assert!(!DisconnectReason::PeerUnresponsive.is_graceful());
        assert!(!DisconnectReason::TransportFailure("eof".into()).is_graceful());
    }

    #[test]
    fn test_reason_display() {
        let reason = DisconnectReason::PeerClosed {
            reason: "bye".into(),
        };
        assert_eq!(reason.to_string(), "peer closed the connection: bye");
    }
}
