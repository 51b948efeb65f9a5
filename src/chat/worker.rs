//! Per-connection worker task.
//!
//! The worker owns the [`SecureChannel`] and the write half of the transport.
//! A separate reader task decodes wire units and forwards them over a
//! bounded queue, so a `select!` in the worker never drops a half-read frame.
//! When the queue is full the reader stops reading and TCP flow control
//! slows the peer down.
//!
//! Rekeying: the side that hits a threshold sends `REKEY_INIT` under the old
//! keys and holds every outgoing frame until `REKEY_ACK` arrives. The
//! responder answers under the old keys and switches immediately. When both
//! sides start at once the lower `(fingerprint, ephemeral key)` keeps its
//! exchange and the other side answers it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chat::channel::{FrameCodec, SecureChannel};
use crate::chat::config::ChatConfig;
use crate::chat::error::{ChatError, CryptoError, FileTransferError, HandshakeError};
use crate::chat::events::{
    ChatEvent, ConnectionInfo, ConnectionState, Direction, DisconnectReason,
};
use crate::chat::protocol::{
    Established, FileChunk, FileId, FileMeta, HandshakeMessage, Handshaker, KeyExchange, Payload,
    WireMessage,
};
use crate::chat::transfer::{persist_verified, OutgoingTransfer, TransferRegistry};
use crate::chat::transport::{FramedStream, MessageTransport, WireReader, WireWriter};
use crate::crypto::{Fingerprint, Identity};
use crate::trust::TrustStore;

/// Ping id used for key confirmation right after the handshake.
pub(crate) const CONFIRMATION_PING_ID: u64 = 0;

const COMMAND_QUEUE: usize = 32;
const READ_QUEUE: usize = 64;
const CLOSE_REASON: &str = "user disconnected";
const IDLE_WAKE: Duration = Duration::from_secs(3600);

pub(crate) type Reply<T> = oneshot::Sender<Result<T, ChatError>>;

/// Requests from a `Connection` handle to its worker.
pub(crate) enum Command {
    SendChat {
        text: String,
        reply: Reply<()>,
    },
    /// Answered once `FILE_COMPLETE` is written.
    SendFile {
        transfer: Box<OutgoingTransfer>,
        reply: Reply<FileId>,
    },
    Ping {
        reply: Reply<Duration>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

impl Command {
    fn reject(self) {
        match self {
            Command::SendChat { reply, .. } => {
                let _ = reply.send(Err(ChatError::NotConnected));
            }
            Command::SendFile { reply, .. } => {
                let _ = reply.send(Err(ChatError::NotConnected));
            }
            Command::Ping { reply } => {
                let _ = reply.send(Err(ChatError::NotConnected));
            }
            Command::Disconnect { reply } => {
                let _ = reply.send(());
            }
        }
    }
}

/// Collaborators shared with every worker.
pub(crate) struct WorkerContext {
    pub identity: Arc<Identity>,
    pub trust: Arc<TrustStore>,
    pub config: Arc<ChatConfig>,
    pub events: mpsc::UnboundedSender<ChatEvent>,
}

/// What a connection keeps of a running worker.
pub(crate) struct WorkerHandle {
    pub commands: mpsc::Sender<Command>,
    pub info: watch::Receiver<ConnectionInfo>,
    pub task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn state(&self) -> ConnectionState {
        self.info.borrow().state
    }
}

/// Start a worker for an established channel.
pub(crate) fn spawn(
    channel: SecureChannel,
    transport: FramedStream,
    direction: Direction,
    ctx: WorkerContext,
) -> WorkerHandle {
    let endpoint = transport.peer_addr().to_string();
    let (reader, writer) = transport.into_split();
    let (frames_in, reader_task) = spawn_reader(reader);
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let (info_tx, info_rx) = watch::channel(ConnectionInfo::with_state(ConnectionState::Connected));

    let worker = Worker {
        incoming: TransferRegistry::new(ctx.config.transfer_timeout(), ctx.config.max_file_size),
        local_fingerprint: ctx.identity.fingerprint(),
        channel,
        writer,
        frames_in,
        reader_task,
        commands: command_rx,
        info: info_tx,
        ctx,
        endpoint,
        direction,
        connected_at: Instant::now(),
        outbox: VecDeque::new(),
        files_out: VecDeque::new(),
        aborted: HashMap::new(),
        progress: HashMap::new(),
        pings: HashMap::new(),
        next_ping_id: CONFIRMATION_PING_ID + 1,
        rekey: None,
        closing: None,
    };
    worker.publish();

    WorkerHandle {
        commands: command_tx,
        info: info_rx,
        task: tokio::spawn(worker.run()),
    }
}

type Inbound = mpsc::Receiver<Result<WireMessage, ChatError>>;

fn spawn_reader(mut reader: WireReader) -> (Inbound, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(READ_QUEUE);
    let task = tokio::spawn(async move {
        loop {
            let result = reader.receive().await;
            let failed = result.is_err();
            if tx.send(result).await.is_err() || failed {
                break;
            }
        }
    });
    (rx, task)
}

/// Why the event loop stopped.
enum Stop {
    /// Local close; `notify` sends `DISCONNECT` first.
    Local { notify: bool },
    /// The peer sent `DISCONNECT`.
    Peer(String),
    Failed(ChatError),
}

impl From<ChatError> for Stop {
    fn from(e: ChatError) -> Self {
        Stop::Failed(e)
    }
}

impl From<CryptoError> for Stop {
    fn from(e: CryptoError) -> Self {
        Stop::Failed(e.into())
    }
}

impl From<HandshakeError> for Stop {
    fn from(e: HandshakeError) -> Self {
        Stop::Failed(e.into())
    }
}

struct Queued {
    payload: Payload,
    on_sent: OnSent,
}

enum OnSent {
    Nothing,
    Chat(Reply<()>),
    Ping(u64),
}

struct OutgoingFile {
    transfer: Box<OutgoingTransfer>,
    reply: Option<Reply<FileId>>,
}

struct PendingPing {
    sent: Instant,
    reply: Reply<Duration>,
}

/// A rekey we initiated and that awaits `REKEY_ACK`.
struct PendingRekey {
    exchange: KeyExchange,
    started: Instant,
}

struct Closing {
    reply: Option<oneshot::Sender<()>>,
    deadline: Instant,
}

struct Worker {
    channel: SecureChannel,
    writer: WireWriter,
    frames_in: Inbound,
    reader_task: JoinHandle<()>,
    commands: mpsc::Receiver<Command>,
    info: watch::Sender<ConnectionInfo>,
    ctx: WorkerContext,
    local_fingerprint: Fingerprint,
    endpoint: String,
    direction: Direction,
    connected_at: Instant,
    outbox: VecDeque<Queued>,
    files_out: VecDeque<OutgoingFile>,
    incoming: TransferRegistry,
    /// Failed incoming transfers whose remaining frames are dropped, with
    /// the instant after which the id is forgotten.
    aborted: HashMap<FileId, Instant>,
    /// Last reported tenth of each incoming transfer.
    progress: HashMap<FileId, u32>,
    pings: HashMap<u64, PendingPing>,
    next_ping_id: u64,
    rekey: Option<PendingRekey>,
    closing: Option<Closing>,
}

impl Worker {
    async fn run(mut self) {
        let peer = self.channel.peer().clone();
        info!(
            peer = %peer.label(),
            endpoint = %self.endpoint,
            direction = ?self.direction,
            "connected"
        );
        self.emit(ChatEvent::Connected {
            peer: peer.fingerprint,
            label: peer.label(),
            endpoint: self.endpoint.clone(),
        });

        let stop = loop {
            if let Err(stop) = self.step().await {
                break stop;
            }
        };
        self.shutdown(stop).await;
    }

    async fn step(&mut self) -> Result<(), Stop> {
        let wake = self
            .next_deadline()
            .map(tokio::time::Instant::from_std)
            .unwrap_or_else(|| tokio::time::Instant::now() + IDLE_WAKE);

        tokio::select! {
            biased;

            incoming = self.frames_in.recv() => match incoming {
                Some(Ok(message)) => self.on_wire(message).await?,
                Some(Err(e)) => return Err(Stop::Failed(e)),
                None => {
                    return Err(Stop::Failed(ChatError::TransportError(
                        "reader stopped".to_string(),
                    )))
                }
            },
            command = self.commands.recv() => match command {
                Some(command) => self.on_command(command)?,
                None => return Err(Stop::Local { notify: true }),
            },
            _ = tokio::time::sleep_until(wake) => self.on_timer(Instant::now())?,
            _ = std::future::ready(()), if self.can_flush() => self.flush_one().await?,
        }

        self.check_rekey().await?;
        self.publish();
        Ok(())
    }

    async fn on_wire(&mut self, message: WireMessage) -> Result<(), Stop> {
        let frame = match message {
            WireMessage::Frame(frame) => frame,
            WireMessage::Handshake(_) => return Err(CryptoError::UnexpectedHandshake.into()),
        };
        let payload = self.channel.open(&frame)?;
        debug!(frame_type = ?frame.frame_type, sequence = frame.sequence, "frame received");

        match payload {
            Payload::Chat { text } => self.emit(ChatEvent::Message {
                from: self.channel.peer().label(),
                text,
            }),
            Payload::Ping { id } => self.queue(Payload::Pong { id }, OnSent::Nothing),
            Payload::Pong { id } => self.on_pong(id),
            Payload::FileMeta(meta) => self.on_file_meta(meta),
            Payload::FileChunk(chunk) => self.on_file_chunk(chunk),
            Payload::FileComplete { file_id } => self.on_file_complete(file_id).await,
            Payload::RekeyInit(offer) => self.on_rekey_init(offer).await?,
            Payload::RekeyAck(answer) => self.on_rekey_ack(answer)?,
            Payload::Disconnect { reason } => return Err(Stop::Peer(reason)),
        }
        Ok(())
    }

    fn on_command(&mut self, command: Command) -> Result<(), Stop> {
        if self.closing.is_some() {
            command.reject();
            return Ok(());
        }

        match command {
            Command::SendChat { text, reply } => {
                self.queue(Payload::Chat { text }, OnSent::Chat(reply))
            }
            Command::SendFile { transfer, reply } => {
                debug!(
                    file_id = transfer.file_id(),
                    chunks = transfer.meta().total_chunks,
                    "file queued"
                );
                self.files_out.push_back(OutgoingFile {
                    transfer,
                    reply: Some(reply),
                });
            }
            Command::Ping { reply } => {
                let id = self.next_ping_id;
                self.next_ping_id += 1;
                self.pings.insert(
                    id,
                    PendingPing {
                        sent: Instant::now(),
                        reply,
                    },
                );
                self.queue(Payload::Ping { id }, OnSent::Ping(id));
            }
            Command::Disconnect { reply } => {
                self.closing = Some(Closing {
                    reply: Some(reply),
                    deadline: Instant::now() + self.ctx.config.disconnect_timeout(),
                });
                if self.rekey.is_none() {
                    return Err(Stop::Local { notify: true });
                }
                debug!("disconnect deferred until the rekey settles");
            }
        }
        Ok(())
    }

    fn on_timer(&mut self, now: Instant) -> Result<(), Stop> {
        let ping_timeout = self.ctx.config.ping_timeout();
        let expired: Vec<u64> = self
            .pings
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.sent) >= ping_timeout)
            .map(|(id, _)| *id)
            .collect();
        if !expired.is_empty() {
            for id in expired {
                if let Some(ping) = self.pings.remove(&id) {
                    let _ = ping.reply.send(Err(ChatError::PeerUnresponsive));
                }
            }
            warn!(peer = %self.channel.peer().label(), "no pong within the ping timeout");
            return Err(ChatError::PeerUnresponsive.into());
        }

        if let Some(pending) = &self.rekey {
            if now.saturating_duration_since(pending.started) >= self.ctx.config.handshake_timeout()
            {
                warn!(peer = %self.channel.peer().label(), "rekey not acknowledged in time");
                return Err(ChatError::PeerUnresponsive.into());
            }
        }

        if self.closing.as_ref().is_some_and(|c| now >= c.deadline) {
            debug!("rekey did not settle before the disconnect timeout");
            return Err(Stop::Local { notify: false });
        }

        for error in self.incoming.expire(now) {
            if let Some(file_id) = error.file_id() {
                self.fail_incoming(file_id, error, true);
            }
        }
        self.aborted.retain(|_, forget_at| now < *forget_at);
        Ok(())
    }

    fn next_deadline(&self) -> Option<Instant> {
        let config = &self.ctx.config;
        let pings = self.pings.values().map(|p| p.sent + config.ping_timeout());
        let rekey = match &self.rekey {
            Some(pending) => Some(pending.started + config.handshake_timeout()),
            None if self.closing.is_none() => Some(self.channel.rekey_deadline()),
            None => None,
        };
        let closing = self.closing.as_ref().map(|c| c.deadline);

        pings
            .chain(rekey)
            .chain(closing)
            .chain(self.incoming.next_deadline())
            .chain(self.aborted.values().copied())
            .min()
    }

    // ---- sending ----

    async fn send(&mut self, payload: Payload) -> Result<(), ChatError> {
        let frame = self.channel.seal(&payload)?;
        debug!(frame_type = ?frame.frame_type, sequence = frame.sequence, "frame sent");
        self.writer.send(&WireMessage::Frame(frame)).await
    }

    fn queue(&mut self, payload: Payload, on_sent: OnSent) {
        self.outbox.push_back(Queued { payload, on_sent });
    }

    /// Outgoing frames wait while a rekey we started is unacknowledged.
    fn can_flush(&self) -> bool {
        self.rekey.is_none()
            && self.closing.is_none()
            && (!self.outbox.is_empty() || !self.files_out.is_empty())
    }

    /// Send one queued frame. Chat and control frames go before file chunks.
    async fn flush_one(&mut self) -> Result<(), Stop> {
        if let Some(Queued { payload, on_sent }) = self.outbox.pop_front() {
            if let OnSent::Ping(id) = &on_sent {
                if let Some(ping) = self.pings.get_mut(id) {
                    ping.sent = Instant::now();
                }
            }
            let result = self.send(payload).await;
            if let OnSent::Chat(reply) = on_sent {
                let _ = reply.send(match &result {
                    Ok(()) => Ok(()),
                    Err(_) => Err(ChatError::NotConnected),
                });
            }
            return Ok(result?);
        }

        let payload = match self
            .files_out
            .front_mut()
            .and_then(|file| file.transfer.next_payload())
        {
            Some(payload) => payload,
            None => {
                self.files_out.pop_front();
                return Ok(());
            }
        };
        self.send(payload).await?;

        if self
            .files_out
            .front()
            .is_some_and(|file| file.transfer.is_finished())
        {
            if let Some(mut file) = self.files_out.pop_front() {
                let file_id = file.transfer.file_id();
                info!(file_id, size = file.transfer.meta().total_size, "file sent");
                if let Some(reply) = file.reply.take() {
                    let _ = reply.send(Ok(file_id));
                }
                self.emit(ChatEvent::FileSent { file_id });
            }
        }
        Ok(())
    }

    // ---- rekey ----

    fn key_exchange(&self) -> KeyExchange {
        KeyExchange::new(
            self.ctx.identity.clone(),
            self.ctx.trust.clone(),
            Some(self.channel.peer_fingerprint()),
        )
    }

    async fn check_rekey(&mut self) -> Result<(), Stop> {
        if self.rekey.is_some() || self.closing.is_some() || !self.channel.rekey_due() {
            return Ok(());
        }

        let mut exchange = self.key_exchange();
        let offer = exchange.offer()?;
        self.send(Payload::RekeyInit(offer)).await?;
        debug!(generation = self.channel.generation(), "rekey started");
        self.rekey = Some(PendingRekey {
            exchange,
            started: Instant::now(),
        });
        Ok(())
    }

    async fn on_rekey_init(&mut self, offer: HandshakeMessage) -> Result<(), Stop> {
        if let Some(pending) = &self.rekey {
            let ours = (self.local_fingerprint, pending.exchange.ephemeral_public());
            let theirs = (offer.fingerprint(), offer.ephemeral_public);
            if ours < theirs {
                debug!("simultaneous rekey, keeping ours");
                return Ok(());
            }
            debug!("simultaneous rekey, answering the peer's");
            self.rekey = None;
        }

        let mut exchange = self.key_exchange();
        let answer = exchange.offer()?;
        let established = exchange.receive(&offer)?;
        self.send(Payload::RekeyAck(answer)).await?;
        self.install(established)
    }

    fn on_rekey_ack(&mut self, answer: HandshakeMessage) -> Result<(), Stop> {
        let mut pending = self.rekey.take().ok_or(CryptoError::UnexpectedRekeyAck)?;
        let established = pending.exchange.receive(&answer)?;
        self.install(established)
    }

    fn install(&mut self, established: Established) -> Result<(), Stop> {
        self.channel.install(established)?;
        let generation = self.channel.generation();
        info!(peer = %self.channel.peer().label(), generation, "session rekeyed");
        self.emit(ChatEvent::Rekeyed { generation });

        if self.closing.is_some() {
            return Err(Stop::Local { notify: true });
        }
        Ok(())
    }

    // ---- ping ----

    fn on_pong(&mut self, id: u64) {
        match self.pings.remove(&id) {
            Some(ping) => {
                let rtt = ping.sent.elapsed();
                debug!(id, rtt_ms = rtt.as_millis() as u64, "pong received");
                let _ = ping.reply.send(Ok(rtt));
            }
            None => debug!(id, "unsolicited pong"),
        }
    }

    // ---- incoming files ----

    fn on_file_meta(&mut self, meta: FileMeta) {
        let file_id = meta.file_id;
        if let Err(error) = self.incoming.on_meta(meta, Instant::now()) {
            // a duplicate id still belongs to the transfer already running
            let drop_rest = !matches!(error, FileTransferError::DuplicateTransfer(_));
            self.fail_incoming(file_id, error, drop_rest);
            return;
        }
        if let Some(state) = self.incoming.get(file_id) {
            info!(file_id, name = %state.file_name, size = state.total_size, "incoming file");
            let event = ChatEvent::FileOffered {
                file_id,
                file_name: state.file_name.clone(),
                size: state.total_size,
            };
            self.emit(event);
        }
        self.progress.insert(file_id, 0);
    }

    fn on_file_chunk(&mut self, chunk: FileChunk) {
        let file_id = chunk.file_id;
        if self.aborted.contains_key(&file_id) {
            return;
        }
        match self.incoming.on_chunk(chunk, Instant::now()) {
            Ok(progress) => self.report_progress(file_id, progress.received, progress.total),
            Err(FileTransferError::UnknownTransfer(_)) => {
                warn!(file_id, "chunk for an unknown transfer dropped")
            }
            Err(error) => self.fail_incoming(file_id, error, true),
        }
    }

    async fn on_file_complete(&mut self, file_id: FileId) {
        if self.aborted.remove(&file_id).is_some() {
            return;
        }
        self.progress.remove(&file_id);

        let verified = match self.incoming.on_complete(file_id) {
            Ok(verified) => verified,
            Err(error) => return self.fail_incoming(file_id, error, false),
        };
        match persist_verified(&self.ctx.config.download_dir, &verified).await {
            Ok(path) => self.emit(ChatEvent::FileReceived {
                file_id,
                path,
                size: verified.bytes.len() as u64,
            }),
            Err(error) => self.fail_incoming(file_id, error, false),
        }
    }

    fn report_progress(&mut self, file_id: FileId, received: u32, total: u32) {
        let tenth = (u64::from(received) * 10 / u64::from(total.max(1))) as u32;
        let last = self.progress.entry(file_id).or_insert(0);
        if tenth > *last {
            *last = tenth;
            let _ = self.ctx.events.send(ChatEvent::FileProgress {
                file_id,
                received,
                total,
            });
        }
    }

    /// Report a failed incoming transfer. With `drop_rest` its later frames are ignored.
    fn fail_incoming(&mut self, file_id: FileId, error: FileTransferError, drop_rest: bool) {
        warn!(file_id, %error, "incoming transfer failed");
        if drop_rest {
            let forget_at = Instant::now() + self.ctx.config.transfer_timeout();
            self.aborted.insert(file_id, forget_at);
        }
        self.progress.remove(&file_id);
        self.emit(ChatEvent::FileFailed { file_id, error });
    }

    // ---- status ----

    fn emit(&self, event: ChatEvent) {
        let _ = self.ctx.events.send(event);
    }

    fn publish(&self) {
        let peer = self.channel.peer();
        let state = if self.closing.is_some() {
            ConnectionState::Disconnecting
        } else {
            ConnectionState::Connected
        };
        self.info.send_replace(ConnectionInfo {
            state,
            peer_fingerprint: Some(peer.fingerprint),
            peer_label: Some(peer.label()),
            endpoint: Some(self.endpoint.clone()),
            direction: Some(self.direction),
            established_at: Some(self.connected_at),
            rekeys: self.channel.generation(),
            messages_sent: self.channel.total_sent(),
            messages_received: self.channel.total_received(),
            disconnected_at: None,
        });
    }

    // ---- teardown ----

    async fn shutdown(mut self, stop: Stop) {
        self.info
            .send_modify(|info| info.state = ConnectionState::Disconnecting);
        let bound = self.ctx.config.disconnect_timeout();

        let reason = match stop {
            Stop::Local { notify } => {
                if notify {
                    let goodbye = self.send(Payload::Disconnect {
                        reason: CLOSE_REASON.to_string(),
                    });
                    match tokio::time::timeout(bound, goodbye).await {
                        Ok(Ok(())) => debug!("disconnect sent"),
                        Ok(Err(e)) => debug!(error = %e, "disconnect not delivered"),
                        Err(_) => debug!("disconnect send timed out"),
                    }
                }
                DisconnectReason::Local
            }
            Stop::Peer(reason) => DisconnectReason::PeerClosed { reason },
            Stop::Failed(error) => classify(error),
        };

        let _ = tokio::time::timeout(bound, self.writer.close()).await;
        self.reader_task.abort();

        for queued in self.outbox.drain(..) {
            if let OnSent::Chat(reply) = queued.on_sent {
                let _ = reply.send(Err(ChatError::NotConnected));
            }
        }
        for mut file in self.files_out.drain(..) {
            if let Some(reply) = file.reply.take() {
                let _ = reply.send(Err(ChatError::NotConnected));
            }
        }
        for (_, ping) in self.pings.drain() {
            let _ = ping.reply.send(Err(ChatError::NotConnected));
        }
        for file_id in self.incoming.clear() {
            let _ = self.ctx.events.send(ChatEvent::FileFailed {
                file_id,
                error: FileTransferError::Aborted { file_id },
            });
        }
        self.rekey = None;

        let peer = self.channel.peer().label();
        match &reason {
            DisconnectReason::SecurityViolation(e) => {
                warn!(%peer, error = %e, "connection torn down")
            }
            other => info!(%peer, reason = %other, "connection closed"),
        }

        self.info.send_modify(|info| {
            info.state = ConnectionState::Disconnected;
            info.disconnected_at = Some(Instant::now());
        });
        self.emit(ChatEvent::Disconnected { reason });

        if let Some(reply) = self.closing.take().and_then(|c| c.reply) {
            let _ = reply.send(());
        }
    }
}

fn classify(error: ChatError) -> DisconnectReason {
    match error {
        ChatError::PeerUnresponsive => DisconnectReason::PeerUnresponsive,
        e if e.is_security_event() => DisconnectReason::SecurityViolation(e.to_string()),
        e => DisconnectReason::TransportFailure(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(ChatError::PeerUnresponsive),
            DisconnectReason::PeerUnresponsive
        );
        assert!(matches!(
            classify(CryptoError::AuthenticationFailed.into()),
            DisconnectReason::SecurityViolation(_)
        ));
        assert!(matches!(
            classify(ChatError::SerializationFailed("bad tag".into())),
            DisconnectReason::SecurityViolation(_)
        ));
        assert!(matches!(
            classify(ChatError::TransportError("eof".into())),
            DisconnectReason::TransportFailure(_)
        ));
    }
}
