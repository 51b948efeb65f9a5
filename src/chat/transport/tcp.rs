//! TCP transport for chat connections.
//!
//! Used for direct connections and localhost testing.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener as TokioTcpListener, TcpStream, ToSocketAddrs};
use tracing::debug;

use crate::chat::config::ChatConfig;
use crate::chat::error::ChatError;
use crate::chat::transport::{BoxedStream, Dialer};

/// Dials plain TCP endpoints with a connect timeout.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn from_config(config: &ChatConfig) -> Self {
        Self::new(config.connect_timeout())
    }

    /// Connect and return the raw stream.
    pub async fn connect(&self, addr: &str) -> Result<TcpStream, ChatError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ChatError::TransportError(format!("Timed out connecting to {}", addr)))?
            .map_err(|e| ChatError::TransportError(format!("Failed to connect: {}", e)))?;
        stream.set_nodelay(true)?;
        debug!(%addr, "tcp connected");
        Ok(stream)
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::from_config(&ChatConfig::default())
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, address: &str) -> Result<BoxedStream, ChatError> {
        Ok(Box::new(self.connect(address).await?))
    }
}

/// TCP listener for accepting chat connections.
pub struct TcpListener {
    listener: TokioTcpListener,
}

impl TcpListener {
    /// Bind to an address and start listening.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, ChatError> {
        let listener = TokioTcpListener::bind(addr)
            .await
            .map_err(|e| ChatError::TransportError(format!("Failed to bind: {}", e)))?;
        Ok(Self { listener })
    }

    /// Accept a new connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ChatError> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| ChatError::TransportError(format!("Failed to accept: {}", e)))?;
        stream.set_nodelay(true)?;
        Ok((stream, addr))
    }

    /// Get the local address.
    pub fn local_addr(&self) -> Result<SocketAddr, ChatError> {
        self.listener
            .local_addr()
            .map_err(|e| ChatError::TransportError(format!("Failed to get local addr: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::protocol::{FrameType, MessageFrame, WireMessage, NONCE_SIZE, TAG_SIZE};
    use crate::chat::transport::{FramedStream, MessageTransport};

    fn frame(sequence: u64) -> WireMessage {
        WireMessage::Frame(MessageFrame {
            frame_type: FrameType::Ping,
            sequence,
            nonce: [sequence as u8; NONCE_SIZE],
            ciphertext: vec![1, 2, 3],
            tag: [0; TAG_SIZE],
        })
    }

    #[tokio::test]
    async fn test_tcp_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client_task = tokio::spawn(async move {
            let stream = TcpDialer::default().dial(&addr.to_string()).await.unwrap();
            let mut conn = FramedStream::new(stream, addr.to_string(), 1024);

            conn.send(&frame(1)).await.unwrap();
            let response = conn.receive().await.unwrap();
            assert_eq!(response, frame(2));

            conn.close().await.unwrap();
        });

        let (stream, peer) = listener.accept().await.unwrap();
        let mut server_conn = FramedStream::new(stream, peer.to_string(), 1024);

        assert_eq!(server_conn.receive().await.unwrap(), frame(1));
        server_conn.send(&frame(2)).await.unwrap();
        server_conn.close().await.unwrap();

        client_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_multiple_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client_task = tokio::spawn(async move {
            let stream = TcpDialer::default().connect(&addr.to_string()).await.unwrap();
            let mut conn = FramedStream::new(stream, addr.to_string(), 1024);
            for i in 0..10 {
                conn.send(&frame(i)).await.unwrap();
            }
            conn.close().await.unwrap();
        });

        let (stream, peer) = listener.accept().await.unwrap();
        let mut server_conn = FramedStream::new(stream, peer.to_string(), 1024);
        for i in 0..10 {
            assert_eq!(server_conn.receive().await.unwrap(), frame(i));
        }

        client_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = TcpDialer::default().dial(&addr.to_string()).await;
        assert!(matches!(result, Err(ChatError::TransportError(_))));
    }
}
