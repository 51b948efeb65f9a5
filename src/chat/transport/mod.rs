//! Transport layer for chat connections.
//!
//! The chat core only needs an ordered duplex byte stream. This module frames
//! [`WireMessage`]s on any such stream and provides dialers that produce one
//! from an endpoint string: [`TcpDialer`] for `host:port` and, with the `tor`
//! feature, [`TorDialer`] for `.onion` endpoints.

mod tcp;
#[cfg(feature = "tor")]
mod tor;

pub use tcp::{TcpDialer, TcpListener};
#[cfg(feature = "tor")]
pub use tor::TorDialer;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf,
};

use crate::chat::config::DEFAULT_PORT;
use crate::chat::error::ChatError;
use crate::chat::protocol::WireMessage;

/// Any ordered duplex byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Trait for bidirectional async message transport.
#[async_trait]
pub trait MessageTransport: Send {
    /// Send a wire message.
    async fn send(&mut self, message: &WireMessage) -> Result<(), ChatError>;

    /// Receive a wire message.
    async fn receive(&mut self) -> Result<WireMessage, ChatError>;

    /// Flush and shut down the write side.
    async fn close(&mut self) -> Result<(), ChatError>;

    /// Get the peer address as a string.
    fn peer_addr(&self) -> &str;
}

/// Opens streams to endpoints.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `address` (`host:port` or `name.onion:port`).
    async fn dial(&self, address: &str) -> Result<BoxedStream, ChatError>;
}

/// Reading half of a framed stream.
pub struct WireReader {
    reader: BufReader<ReadHalf<BoxedStream>>,
    max_len: usize,
}

impl WireReader {
    pub async fn receive(&mut self) -> Result<WireMessage, ChatError> {
        let data = read_length_prefixed(&mut self.reader, self.max_len).await?;
        WireMessage::from_bytes(&data).map_err(|e| ChatError::SerializationFailed(e.to_string()))
    }
}

/// Writing half of a framed stream.
pub struct WireWriter {
    writer: BufWriter<WriteHalf<BoxedStream>>,
}

impl WireWriter {
    pub async fn send(&mut self, message: &WireMessage) -> Result<(), ChatError> {
        let data = message
            .to_bytes()
            .map_err(|e| ChatError::SerializationFailed(e.to_string()))?;
        write_length_prefixed(&mut self.writer, &data).await
    }

    pub async fn close(&mut self) -> Result<(), ChatError> {
        self.writer.flush().await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// A stream carrying length-prefixed [`WireMessage`]s.
pub struct FramedStream {
    reader: WireReader,
    writer: WireWriter,
    peer_addr: String,
}

impl FramedStream {
    pub fn new<S>(stream: S, peer_addr: impl Into<String>, max_len: usize) -> Self
    where
        S: AsyncStream + 'static,
    {
        let boxed: BoxedStream = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(boxed);
        Self {
            reader: WireReader {
                reader: BufReader::new(read_half),
                max_len,
            },
            writer: WireWriter {
                writer: BufWriter::new(write_half),
            },
            peer_addr: peer_addr.into(),
        }
    }

    /// Separate the halves so reading and writing can run in different tasks.
    pub fn into_split(self) -> (WireReader, WireWriter) {
        (self.reader, self.writer)
    }
}

#[async_trait]
impl MessageTransport for FramedStream {
    async fn send(&mut self, message: &WireMessage) -> Result<(), ChatError> {
        self.writer.send(message).await
    }

    async fn receive(&mut self) -> Result<WireMessage, ChatError> {
        self.reader.receive().await
    }

    async fn close(&mut self) -> Result<(), ChatError> {
        self.writer.close().await
    }

    fn peer_addr(&self) -> &str {
        &self.peer_addr
    }
}

/// Picks TCP or Tor by endpoint.
pub struct DefaultDialer {
    tcp: TcpDialer,
    #[cfg(feature = "tor")]
    tor: Option<Arc<TorDialer>>,
}

impl DefaultDialer {
    pub fn new(tcp: TcpDialer) -> Self {
        Self {
            tcp,
            #[cfg(feature = "tor")]
            tor: None,
        }
    }

    #[cfg(feature = "tor")]
    pub fn with_tor(mut self, tor: Arc<TorDialer>) -> Self {
        self.tor = Some(tor);
        self
    }

    pub fn into_shared(self) -> Arc<dyn Dialer> {
        Arc::new(self)
    }
}

#[async_trait]
impl Dialer for DefaultDialer {
    async fn dial(&self, address: &str) -> Result<BoxedStream, ChatError> {
        if !is_onion(address) {
            return self.tcp.dial(address).await;
        }

        #[cfg(feature = "tor")]
        if let Some(tor) = &self.tor {
            return tor.dial(address).await;
        }

        Err(ChatError::TorError(format!(
            "cannot reach {}: Tor is not enabled",
            address
        )))
    }
}

/// Whether the host part of `endpoint` is an onion address.
pub fn is_onion(endpoint: &str) -> bool {
    let host = match endpoint.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => endpoint,
    };
    host.to_ascii_lowercase().ends_with(".onion")
}

/// Combine an endpoint with an optional explicit port.
///
/// An explicit port replaces any port in the endpoint; an endpoint without a
/// port gets the default.
pub fn resolve_address(endpoint: &str, port: Option<u16>) -> String {
    let endpoint = endpoint.trim();
    let host = match endpoint.rsplit_once(':') {
        Some((host, p))
            if !p.is_empty()
                && p.chars().all(|c| c.is_ascii_digit())
                && (!host.contains(':') || host.ends_with(']')) =>
        {
            if port.is_none() {
                return endpoint.to_string();
            }
            host
        }
        _ => endpoint,
    };
    format!("{}:{}", host, port.unwrap_or(DEFAULT_PORT))
}

/// Helper to write a length-prefixed message asynchronously.
pub async fn write_length_prefixed<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), ChatError> {
    let len = u32::try_from(data.len())
        .map_err(|_| ChatError::TransportError(format!("Message too large: {} bytes", data.len())))?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Helper to read a length-prefixed message asynchronously.
///
/// Lengths above `max_len` are rejected before allocating.
pub async fn read_length_prefixed<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> Result<Vec<u8>, ChatError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > max_len {
        return Err(ChatError::TransportError(format!(
            "Message too large: {} bytes",
            len
        )));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(data)
}
