//! Connection lifecycle.
//!
//! A [`Connection`] holds at most one session. It acquires a stream (dialed,
//! accepted or handed in), runs the handshake and key confirmation on it, then
//! hands the channel to a worker task and talks to it through commands.
//!
//! States: `Idle -> Handshaking -> Connected -> Disconnecting -> Disconnected`.
//! A new attempt is allowed from `Idle` or `Disconnected`.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::chat::channel::{FrameCodec, RekeyPolicy, SecureChannel};
use crate::chat::config::ChatConfig;
use crate::chat::error::{ChatError, CryptoError, HandshakeError};
use crate::chat::events::{ChatEvent, ConnectionInfo, ConnectionState, Direction};
use crate::chat::protocol::{FileId, Handshaker, KeyExchange, Payload, WireMessage};
use crate::chat::transfer::OutgoingTransfer;
use crate::chat::transport::{
    resolve_address, AsyncStream, DefaultDialer, Dialer, FramedStream, MessageTransport,
    TcpDialer, TcpListener,
};
use crate::chat::worker::{self, Command, Reply, WorkerContext, WorkerHandle, CONFIRMATION_PING_ID};
use crate::crypto::{Fingerprint, Identity};
use crate::trust::{parse_fingerprint, TrustEntry, TrustStore};

/// Handle to the single peer session of this process.
///
/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    identity: Arc<Identity>,
    trust: Arc<TrustStore>,
    config: Arc<ChatConfig>,
    dialer: Arc<dyn Dialer>,
    events: mpsc::UnboundedSender<ChatEvent>,
    slot: Mutex<Slot>,
}

enum Slot {
    Idle { last_disconnect: Option<Instant> },
    Handshaking,
    Active(WorkerHandle),
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resets the slot to `Idle` unless the handshake completed.
struct HandshakeGuard {
    inner: Arc<Inner>,
    last_disconnect: Option<Instant>,
    armed: bool,
}

impl HandshakeGuard {
    fn activate(mut self, handle: WorkerHandle) {
        *self.inner.slot() = Slot::Active(handle);
        self.armed = false;
    }
}

impl Drop for HandshakeGuard {
    fn drop(&mut self) {
        if self.armed {
            *self.inner.slot() = Slot::Idle {
                last_disconnect: self.last_disconnect,
            };
        }
    }
}

impl Connection {
    /// Create a connection that dials over TCP.
    ///
    /// Returns the handle and the stream of [`ChatEvent`]s, or
    /// [`ChatError::Config`] when `config` does not validate.
    pub fn new(
        identity: Arc<Identity>,
        trust: Arc<TrustStore>,
        config: ChatConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChatEvent>), ChatError> {
        let dialer = DefaultDialer::new(TcpDialer::from_config(&config)).into_shared();
        Self::with_dialer(identity, trust, config, dialer)
    }

    pub fn with_dialer(
        identity: Arc<Identity>,
        trust: Arc<TrustStore>,
        config: ChatConfig,
        dialer: Arc<dyn Dialer>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChatEvent>), ChatError> {
        config.validate()?;
        let (events, receiver) = mpsc::unbounded_channel();
        let inner = Inner {
            identity,
            trust,
            config: Arc::new(config),
            dialer,
            events,
            slot: Mutex::new(Slot::Idle {
                last_disconnect: None,
            }),
        };
        Ok((
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        ))
    }

    pub fn config(&self) -> &ChatConfig {
        &self.inner.config
    }

    pub fn trust_store(&self) -> &Arc<TrustStore> {
        &self.inner.trust
    }

    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    pub fn status(&self) -> ConnectionInfo {
        match &*self.inner.slot() {
            Slot::Idle { last_disconnect } => {
                let mut info = ConnectionInfo::idle();
                info.disconnected_at = *last_disconnect;
                info
            }
            Slot::Handshaking => ConnectionInfo::with_state(ConnectionState::Handshaking),
            Slot::Active(handle) => handle.info.borrow().clone(),
        }
    }

    /// Dial `endpoint` and establish a session with `expected`.
    ///
    /// `expected` must already be in the trust store; otherwise nothing is dialed.
    pub async fn connect(
        &self,
        endpoint: &str,
        expected: Fingerprint,
        port: Option<u16>,
    ) -> Result<(), ChatError> {
        if !self.inner.trust.contains(&expected) {
            warn!(fingerprint = %expected.short(), "refusing to connect to an untrusted fingerprint");
            return Err(HandshakeError::UnknownFingerprint(expected).into());
        }

        let guard = self.begin_handshake()?;
        let address = resolve_address(endpoint, port);
        info!(%address, "connecting");
        let stream = self.inner.dialer.dial(&address).await?;
        let transport = FramedStream::new(stream, address, self.inner.config.max_frame_len);
        self.establish(guard, transport, Direction::Outbound, Some(expected))
            .await
    }

    /// Establish a session over an already connected stream.
    pub async fn attach<S>(
        &self,
        stream: S,
        endpoint: &str,
        direction: Direction,
        expected: Option<Fingerprint>,
    ) -> Result<(), ChatError>
    where
        S: AsyncStream + 'static,
    {
        let guard = self.begin_handshake()?;
        let transport = FramedStream::new(stream, endpoint, self.inner.config.max_frame_len);
        self.establish(guard, transport, direction, expected).await
    }

    /// Take an inbound stream.
    ///
    /// Waits out the grace period after the last disconnect, then fails with
    /// `AlreadyConnected` (dropping the stream) if a session is active.
    pub async fn accept<S>(&self, stream: S, endpoint: &str) -> Result<(), ChatError>
    where
        S: AsyncStream + 'static,
    {
        if let Some(wait) = self.grace_remaining() {
            debug!(wait_ms = wait.as_millis() as u64, "inbound connection waits for grace period");
            tokio::time::sleep(wait).await;
        }
        self.attach(stream, endpoint, Direction::Inbound, None).await
    }

    /// Accept inbound connections until the listener fails.
    ///
    /// Each stream is handled on its own task, so a failed or rejected
    /// handshake never blocks the listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ChatError> {
        info!(addr = %listener.local_addr()?, "listening");
        loop {
            let (stream, addr) = listener.accept().await?;
            let connection = self.clone();
            tokio::spawn(async move {
                if let Err(e) = connection.accept(stream, &addr.to_string()).await {
                    warn!(peer = %addr, error = %e, "inbound connection rejected");
                }
            });
        }
    }

    /// Close the session, sending `DISCONNECT` when possible.
    pub async fn disconnect(&self) -> Result<(), ChatError> {
        let commands = match &*self.inner.slot() {
            Slot::Active(handle)
                if matches!(
                    handle.state(),
                    ConnectionState::Connected | ConnectionState::Disconnecting
                ) =>
            {
                handle.commands.clone()
            }
            _ => return Err(ChatError::NotConnected),
        };

        let (reply, done) = oneshot::channel();
        if commands.send(Command::Disconnect { reply }).await.is_ok() {
            let _ = done.await;
        }
        Ok(())
    }

    pub async fn send_chat_message(&self, text: &str) -> Result<(), ChatError> {
        let text = text.to_string();
        self.request(|reply| Command::SendChat { text, reply }).await
    }

    /// Send a file; resolves once its last frame is written.
    pub async fn send_file(&self, path: &Path) -> Result<FileId, ChatError> {
        self.commands()?;
        let transfer = OutgoingTransfer::open(path, self.inner.config.chunk_size).await?;
        info!(
            file = %path.display(),
            size = transfer.meta().total_size,
            "sending file"
        );
        self.request(|reply| Command::SendFile {
            transfer: Box::new(transfer),
            reply,
        })
        .await
    }

    /// Round-trip time of a `PING`.
    ///
    /// Without a `PONG` within the ping timeout the connection is closed and
    /// `PeerUnresponsive` returned.
    pub async fn ping(&self) -> Result<Duration, ChatError> {
        self.request(|reply| Command::Ping { reply }).await
    }

    /// Our own fingerprint as hex.
    pub fn fingerprint(&self) -> String {
        self.inner.identity.fingerprint().to_hex()
    }

    pub fn add_host(&self, endpoint: &str, fingerprint: &str) -> Result<TrustEntry, ChatError> {
        Ok(self.inner.trust.add_host(endpoint, fingerprint)?)
    }

    pub fn remove_host(&self, endpoint: &str) -> Result<TrustEntry, ChatError> {
        Ok(self.inner.trust.remove_by_endpoint(endpoint)?)
    }

    pub fn rename_host(&self, fingerprint: &str, name: &str) -> Result<(), ChatError> {
        let fingerprint = parse_fingerprint(fingerprint)?;
        Ok(self.inner.trust.rename(&fingerprint, name)?)
    }

    pub fn list_hosts(&self) -> Vec<TrustEntry> {
        self.inner.trust.list()
    }

    fn begin_handshake(&self) -> Result<HandshakeGuard, ChatError> {
        let mut slot = self.inner.slot();
        let last_disconnect = match &*slot {
            Slot::Idle { last_disconnect } => *last_disconnect,
            Slot::Active(handle)
                if handle.state() == ConnectionState::Disconnected || handle.task.is_finished() =>
            {
                handle.info.borrow().disconnected_at
            }
            _ => return Err(ChatError::AlreadyConnected),
        };
        *slot = Slot::Handshaking;
        Ok(HandshakeGuard {
            inner: self.inner.clone(),
            last_disconnect,
            armed: true,
        })
    }

    fn grace_remaining(&self) -> Option<Duration> {
        let last = match &*self.inner.slot() {
            Slot::Idle { last_disconnect } => *last_disconnect,
            Slot::Active(handle) => handle.info.borrow().disconnected_at,
            Slot::Handshaking => None,
        }?;
        let wait = self
            .inner
            .config
            .reconnect_grace()
            .saturating_sub(last.elapsed());
        (!wait.is_zero()).then_some(wait)
    }

    async fn establish(
        &self,
        guard: HandshakeGuard,
        mut transport: FramedStream,
        direction: Direction,
        expected: Option<Fingerprint>,
    ) -> Result<(), ChatError> {
        let inner = &self.inner;
        let endpoint = transport.peer_addr().to_string();
        debug!(%endpoint, ?direction, "handshaking");

        let handshake = perform_handshake(
            &mut transport,
            inner.identity.clone(),
            inner.trust.clone(),
            expected,
            RekeyPolicy::from_config(&inner.config),
        );
        let result = match tokio::time::timeout(inner.config.handshake_timeout(), handshake).await
        {
            Ok(result) => result,
            Err(_) => Err(HandshakeError::Timeout.into()),
        };

        let channel = match result {
            Ok(channel) => channel,
            Err(e) => {
                warn!(%endpoint, error = %e, "handshake failed");
                let _ =
                    tokio::time::timeout(inner.config.disconnect_timeout(), transport.close()).await;
                return Err(e);
            }
        };

        let handle = worker::spawn(
            channel,
            transport,
            direction,
            WorkerContext {
                identity: inner.identity.clone(),
                trust: inner.trust.clone(),
                config: inner.config.clone(),
                events: inner.events.clone(),
            },
        );
        guard.activate(handle);
        Ok(())
    }

    fn commands(&self) -> Result<mpsc::Sender<Command>, ChatError> {
        match &*self.inner.slot() {
            Slot::Active(handle) if handle.state() == ConnectionState::Connected => {
                Ok(handle.commands.clone())
            }
            _ => Err(ChatError::NotConnected),
        }
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, ChatError> {
        let commands = self.commands()?;
        let (reply, response) = oneshot::channel();
        commands
            .send(make(reply))
            .await
            .map_err(|_| ChatError::NotConnected)?;
        response.await.map_err(|_| ChatError::NotConnected)?
    }
}

/// Run the key exchange and key confirmation on a fresh transport.
///
/// Both sides send their offer first, so neither waits on the other. Each side
/// then sends an encrypted `PING` and requires the peer's first frame to open
/// as one, so a session is reported only once both sides hold the same keys.
async fn perform_handshake<T: MessageTransport>(
    transport: &mut T,
    identity: Arc<Identity>,
    trust: Arc<TrustStore>,
    expected: Option<Fingerprint>,
    policy: RekeyPolicy,
) -> Result<SecureChannel, ChatError> {
    let mut exchange = KeyExchange::new(identity, trust, expected);
    let offer = exchange.offer()?;
    transport.send(&WireMessage::Handshake(offer)).await?;

    let peer_offer = match transport.receive().await? {
        WireMessage::Handshake(message) => message,
        WireMessage::Frame(_) => {
            return Err(HandshakeError::UnexpectedMessage(exchange.state()).into())
        }
    };
    let established = exchange.receive(&peer_offer)?;
    let mut channel = SecureChannel::new(established, policy);

    confirm_keys(transport, &mut channel).await?;
    Ok(channel)
}

async fn confirm_keys<T: MessageTransport>(
    transport: &mut T,
    channel: &mut SecureChannel,
) -> Result<(), ChatError> {
    let ping = channel.seal(&Payload::Ping {
        id: CONFIRMATION_PING_ID,
    })?;
    transport
        .send(&WireMessage::Frame(ping))
        .await
        .map_err(|_| HandshakeError::RejectedByPeer)?;

    let frame = match transport.receive().await {
        Ok(WireMessage::Frame(frame)) => frame,
        Ok(WireMessage::Handshake(_)) => return Err(CryptoError::UnexpectedHandshake.into()),
        Err(_) => return Err(HandshakeError::RejectedByPeer.into()),
    };
    match channel.open(&frame) {
        Ok(Payload::Ping { .. }) => Ok(()),
        _ => Err(HandshakeError::KeyConfirmationFailed.into()),
    }
}
