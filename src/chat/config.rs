//! Chat configuration and on-disk locations.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chat::error::ChatError;

/// Protocol version carried in every handshake and bound into frame AAD.
pub const CHAT_PROTOCOL_VERSION: u8 = 1;

/// Default port for listening and dialing.
pub const DEFAULT_PORT: u16 = 34567;

/// Rekey after this many frames (both directions) under one key.
pub const DEFAULT_REKEY_AFTER_MESSAGES: u64 = 10;

/// Rekey after a key has been in use this long.
pub const DEFAULT_REKEY_AFTER_SECS: u64 = 120;

/// File chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Largest transport unit accepted from a peer.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Largest incoming file accepted. Received files are buffered in memory.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// Room for the frame header, AEAD tag and payload encoding around a chunk.
const FRAME_OVERHEAD: usize = 1024;

pub const DEFAULT_PING_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_TRANSFER_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_DISCONNECT_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_RECONNECT_GRACE_MS: u64 = 2_000;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Environment variable that overrides the base directory.
pub const HOME_ENV: &str = "WHISPERLINK_HOME";

const CONFIG_FILE: &str = "config.toml";
const TRUST_STORE_FILE: &str = "known_hosts.toml";
const LEGACY_TRUST_STORE_FILE: &str = "known_hosts.json";
const IDENTITY_FILE: &str = "identity.key";

/// Tunables for a chat connection.
///
/// Every field has a default, so a partial `config.toml` is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChatConfig {
    /// Port used by `--listen` and when an endpoint has no port.
    pub listen_port: u16,

    pub rekey_after_messages: u64,
    pub rekey_after_secs: u64,

    pub chunk_size: usize,
    pub max_frame_len: usize,
    /// Refuse incoming files announced larger than this many bytes.
    pub max_file_size: u64,

    pub ping_timeout_ms: u64,
    /// Abort an incoming transfer after this long without a chunk.
    pub transfer_timeout_ms: u64,
    /// Bound on the best-effort DISCONNECT send.
    pub disconnect_timeout_ms: u64,
    /// Wait this long after a disconnect before accepting inbound streams.
    pub reconnect_grace_ms: u64,
    pub handshake_timeout_ms: u64,
    pub connect_timeout_ms: u64,

    /// Where verified incoming files are written.
    pub download_dir: PathBuf,

    /// Route `.onion` endpoints through the embedded Tor client.
    pub tor_enabled: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_PORT,
            rekey_after_messages: DEFAULT_REKEY_AFTER_MESSAGES,
            rekey_after_secs: DEFAULT_REKEY_AFTER_SECS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            ping_timeout_ms: DEFAULT_PING_TIMEOUT_MS,
            transfer_timeout_ms: DEFAULT_TRANSFER_TIMEOUT_MS,
            disconnect_timeout_ms: DEFAULT_DISCONNECT_TIMEOUT_MS,
            reconnect_grace_ms: DEFAULT_RECONNECT_GRACE_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            download_dir: PathBuf::from("received_files"),
            tor_enabled: false,
        }
    }
}

impl ChatConfig {
    /// Load from the default location, falling back to defaults.
    pub fn load() -> Result<Self, ChatError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ChatError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let config: ChatConfig =
            toml::from_str(&content).map_err(|e| ChatError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ChatError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| ChatError::Config(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Reject values that would make the protocol unusable.
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.chunk_size == 0 {
            return Err(ChatError::Config("chunk_size must be positive".into()));
        }
        // A chunk plus its framing must fit into one transport unit.
        let framed = self.chunk_size.checked_add(FRAME_OVERHEAD);
        if framed.map_or(true, |len| len > self.max_frame_len) {
            return Err(ChatError::Config(format!(
                "chunk_size {} does not fit max_frame_len {}",
                self.chunk_size, self.max_frame_len
            )));
        }
        if self.rekey_after_messages == 0 {
            return Err(ChatError::Config(
                "rekey_after_messages must be positive".into(),
            ));
        }
        if self.rekey_after_secs == 0 {
            return Err(ChatError::Config("rekey_after_secs must be positive".into()));
        }
        if self.max_file_size == 0 {
            return Err(ChatError::Config("max_file_size must be positive".into()));
        }
        if self.listen_port == 0 {
            return Err(ChatError::Config("listen_port must be 1-65535".into()));
        }

        let timeouts = [
            ("ping_timeout_ms", self.ping_timeout_ms),
            ("transfer_timeout_ms", self.transfer_timeout_ms),
            ("disconnect_timeout_ms", self.disconnect_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(ChatError::Config(format!("{} must be positive", name)));
        }
        Ok(())
    }

    pub fn rekey_after(&self) -> Duration {
        Duration::from_secs(self.rekey_after_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_millis(self.reconnect_grace_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Base directory for identity, trust store and config.
///
/// `WHISPERLINK_HOME` wins; otherwise the platform config dir
/// (`~/.config/whisperlink` on Linux), falling back to `~/.whisperlink`.
pub fn base_dir() -> Option<PathBuf> {
    if let Some(home) = std::env::var_os(HOME_ENV) {
        if !home.is_empty() {
            return Some(PathBuf::from(home));
        }
    }
    dirs::config_dir()
        .map(|dir| dir.join("whisperlink"))
        .or_else(|| dirs::home_dir().map(|home| home.join(".whisperlink")))
}

pub fn config_path() -> Option<PathBuf> {
    base_dir().map(|dir| dir.join(CONFIG_FILE))
}

pub fn trust_store_path() -> Option<PathBuf> {
    base_dir().map(|dir| dir.join(TRUST_STORE_FILE))
}

/// Location of the JSON trust store written by older releases.
pub fn legacy_trust_store_path() -> Option<PathBuf> {
    base_dir().map(|dir| dir.join(LEGACY_TRUST_STORE_FILE))
}

pub fn identity_path() -> Option<PathBuf> {
    base_dir().map(|dir| dir.join("keys").join(IDENTITY_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = ChatConfig::default();
        assert_eq!(config.listen_port, 34567);
        assert_eq!(config.rekey_after_messages, 10);
        assert_eq!(config.rekey_after(), Duration::from_secs(120));
        assert_eq!(config.chunk_size, 8192);
        assert_eq!(config.ping_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "listen_port = 40000\ntor_enabled = true\n").unwrap();

        let config = ChatConfig::load_from(&path).unwrap();
        assert_eq!(config.listen_port, 40000);
        assert!(config.tor_enabled);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempdir().unwrap();
        let config = ChatConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, ChatConfig::default());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = ChatConfig {
            ping_timeout_ms: 250,
            ..Default::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(ChatConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "chunk_size = 0\n").unwrap();
        assert!(matches!(
            ChatConfig::load_from(&path),
            Err(ChatError::Config(_))
        ));
    }

    #[test]
    fn test_huge_chunk_size_rejected() {
        let config = ChatConfig {
            chunk_size: usize::MAX,
            max_frame_len: usize::MAX,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ChatError::Config(_))));
    }

    #[test]
    fn test_zero_durations_rejected() {
        let zeroed = [
            ChatConfig {
                rekey_after_secs: 0,
                ..Default::default()
            },
            ChatConfig {
                ping_timeout_ms: 0,
                ..Default::default()
            },
            ChatConfig {
                transfer_timeout_ms: 0,
                ..Default::default()
            },
            ChatConfig {
                disconnect_timeout_ms: 0,
                ..Default::default()
            },
            ChatConfig {
                handshake_timeout_ms: 0,
                ..Default::default()
            },
            ChatConfig {
                connect_timeout_ms: 0,
                ..Default::default()
            },
            ChatConfig {
                max_file_size: 0,
                ..Default::default()
            },
        ];
        for config in zeroed {
            assert!(matches!(config.validate(), Err(ChatError::Config(_))));
        }

        let no_grace = ChatConfig {
            reconnect_grace_ms: 0,
            ..Default::default()
        };
        assert!(no_grace.validate().is_ok());
    }
}
