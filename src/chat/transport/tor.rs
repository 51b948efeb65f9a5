//! Tor transport for `.onion` endpoints.
//!
//! Outbound only: inbound connections arrive on the local TCP listener that an
//! externally managed onion service forwards to.

use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use arti_client::config::TorClientConfigBuilder;
use arti_client::TorClient;
use tor_rtcompat::PreferredRuntime;

use crate::chat::error::ChatError;
use crate::chat::transport::{BoxedStream, Dialer};

/// Dials onion addresses through an embedded Arti client.
pub struct TorDialer {
    client: TorClient<PreferredRuntime>,
}

impl TorDialer {
    /// Create and bootstrap a Tor client keeping its state under `base_dir/tor`.
    ///
    /// The first bootstrap downloads the consensus and may take 30-60 seconds.
    pub async fn bootstrap(base_dir: &Path) -> Result<Self, ChatError> {
        let state_dir = base_dir.join("tor").join("state");
        let cache_dir = base_dir.join("tor").join("cache");

        for dir in [&state_dir, &cache_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                ChatError::TorError(format!("Failed to create {}: {}", dir.display(), e))
            })?;

            // Arti refuses directories readable by others
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).map_err(
                    |e| ChatError::TorError(format!("Failed to set permissions: {}", e)),
                )?;
            }
        }

        let config = TorClientConfigBuilder::from_directories(state_dir, cache_dir)
            .build()
            .map_err(|e| ChatError::TorError(format!("Failed to build config: {}", e)))?;

        info!("bootstrapping tor client");
        let client = TorClient::create_bootstrapped(config)
            .await
            .map_err(|e| ChatError::TorError(format!("Failed to bootstrap Tor client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Dialer for TorDialer {
    async fn dial(&self, address: &str) -> Result<BoxedStream, ChatError> {
        let stream = self
            .client
            .connect(address)
            .await
            .map_err(|e| ChatError::TorError(format!("Failed to connect to {}: {}", address, e)))?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires network and takes time to bootstrap Tor"]
    async fn test_tor_client_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let dialer = TorDialer::bootstrap(dir.path()).await;
        assert!(dialer.is_ok(), "Failed to bootstrap: {:?}", dialer.err());
    }
}
