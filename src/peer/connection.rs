//! Peer connection module
//!
//! One peer-wire session per task. The connection owns its socket, reports
//! everything it learns to the engine as [`PeerEvent`]s and acts on
//! [`PeerCommand`]s. It ends with exactly one `Disconnected` event.
//!
//! Requests from the remote side are queued while we unchoke it and served
//! straight from the piece store, one block per loop turn.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::error::{ErrorKind, TorrentError};
use crate::peer::state::{Bitfield, DisconnectReason, PeerKey, PeerState};
use crate::protocol::{BitTorrentWire, Handshake, Message, WireProtocol};
use crate::storage::{BlockRef, PieceStore};
use crate::torrent::TorrentInfo;

/// Commands queued per peer before the engine starts dropping them
const COMMAND_QUEUE: usize = 256;

/// Largest block a peer may ask us for
const MAX_REQUEST_LENGTH: u32 = 128 * 1024;

/// Remote requests held before further ones are ignored
const MAX_QUEUED_UPLOADS: usize = 256;

/// Instructions from the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    Request(BlockRef),
    Cancel(BlockRef),
    SetInterested(bool),
    /// Choke or unchoke the remote side
    SetChoking(bool),
    /// Announce a newly verified piece
    Have(u32),
    Shutdown,
}

/// What a connection reports
#[derive(Debug, Clone)]
pub enum PeerEventKind {
    /// Handshake completed
    Connected { peer_id: [u8; 20], extensions: bool },
    Bitfield(Bitfield),
    Have(u32),
    Choked,
    Unchoked,
    /// A block we asked this peer for
    Block { block: BlockRef, data: Bytes },
    /// A request the engine issued could not be sent in the current state
    RequestDropped(BlockRef),
    /// The peer became interested or lost interest in our pieces
    Interest(bool),
    /// A block was served to the peer
    Uploaded(BlockRef),
    Disconnected(DisconnectReason),
}

#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub key: PeerKey,
    pub addr: SocketAddr,
    pub kind: PeerEventKind,
}

/// Connection timing
#[derive(Debug, Clone, Copy)]
pub struct PeerTimeouts {
    pub connect: Duration,
    pub handshake: Duration,
    /// Send a keep-alive after this long without writing
    pub keepalive: Duration,
    /// Drop the peer after this long without reading
    pub idle: Duration,
}

impl Default for PeerTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            handshake: Duration::from_secs(10),
            keepalive: Duration::from_secs(60),
            idle: Duration::from_secs(120),
        }
    }
}

/// Everything a connection needs to know about the torrent and ourselves
#[derive(Debug, Clone)]
pub struct PeerContext {
    pub info: Arc<TorrentInfo>,
    pub peer_id: [u8; 20],
    pub timeouts: PeerTimeouts,
    /// Source of uploaded blocks; `None` never serves
    pub store: Option<Arc<PieceStore>>,
}

/// One peer-wire session
pub struct PeerConnection {
    key: PeerKey,
    addr: SocketAddr,
    ctx: PeerContext,
    state: PeerState,
    am_interested: bool,
    am_choking: bool,
    peer_interested: bool,
    /// Blocks requested from this peer and not yet answered
    requested: HashSet<BlockRef>,
    /// Blocks the peer asked us for, oldest first
    uploads: VecDeque<BlockRef>,
    events: mpsc::Sender<PeerEvent>,
    commands: mpsc::Receiver<PeerCommand>,
}

impl PeerConnection {
    pub fn new(
        key: PeerKey,
        addr: SocketAddr,
        ctx: PeerContext,
        events: mpsc::Sender<PeerEvent>,
        commands: mpsc::Receiver<PeerCommand>,
    ) -> Self {
        Self {
            key,
            addr,
            ctx,
            state: PeerState::Connecting,
            am_interested: false,
            am_choking: true,
            peer_interested: false,
            requested: HashSet::new(),
            uploads: VecDeque::new(),
            events,
            commands,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Run the session over an established stream until it ends
    pub async fn run<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let reason = self.drive(stream).await;
        self.finish(reason).await;
    }

    /// Report a connection that never got a stream
    pub async fn fail(mut self, reason: DisconnectReason) {
        self.finish(reason).await;
    }

    async fn finish(&mut self, reason: DisconnectReason) {
        self.state = PeerState::Disconnected;
        match &reason {
            DisconnectReason::Shutdown => debug!("Peer {} shut down", self.addr),
            DisconnectReason::HandshakeMismatch | DisconnectReason::ProtocolViolation(_) => {
                warn!("Dropping peer {}: {}", self.addr, reason)
            }
            _ => debug!("Peer {} disconnected: {}", self.addr, reason),
        }
        self.emit(PeerEventKind::Disconnected(reason)).await;
    }

    async fn emit(&self, kind: PeerEventKind) -> bool {
        self.events
            .send(PeerEvent {
                key: self.key,
                addr: self.addr,
                kind,
            })
            .await
            .is_ok()
    }

    async fn drive<S>(&mut self, stream: S) -> DisconnectReason
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut wire = BitTorrentWire;
        let info_hash = self.ctx.info.info_hash;

        self.state = PeerState::Handshaking;
        let ours = Handshake::new(info_hash, self.ctx.peer_id);
        if let Err(e) = wire.write_handshake(&mut writer, &ours).await {
            return DisconnectReason::ConnectionLost(e.to_string());
        }
        let theirs = match timeout(self.ctx.timeouts.handshake, wire.read_handshake(&mut reader)).await {
            Err(_) => return DisconnectReason::ConnectionLost("handshake timed out".to_string()),
            Ok(Err(e)) => return classify(e),
            Ok(Ok(handshake)) => handshake,
        };
        if theirs.info_hash != info_hash {
            let err = TorrentError::handshake_mismatch(self.addr.to_string(), &info_hash, &theirs.info_hash);
            debug!("{}", err);
            return DisconnectReason::HandshakeMismatch;
        }
        if !theirs.validate(&info_hash) {
            return DisconnectReason::ProtocolViolation("invalid handshake".to_string());
        }

        self.state = PeerState::Connected;
        info!("Connected to peer {}", self.addr);
        let connected = PeerEventKind::Connected {
            peer_id: theirs.peer_id,
            extensions: theirs.supports_extensions(),
        };
        if !self.emit(connected).await {
            return DisconnectReason::Shutdown;
        }
        if let Some(bitfield) = self.ctx.store.as_ref().filter(|s| s.verified_count() > 0).map(|s| s.bitfield()) {
            if let Err(e) = wire.write_message(&mut writer, &Message::Bitfield { bitfield }).await {
                return DisconnectReason::ConnectionLost(e.to_string());
            }
        }
        if let Err(e) = self.set_interested(true, &mut wire, &mut writer).await {
            return DisconnectReason::ConnectionLost(e.to_string());
        }

        // The reader runs apart so a slow socket never blocks commands
        let (inbound_tx, mut inbound) = mpsc::channel::<Result<Message>>(64);
        let reader_task = tokio::spawn(async move {
            let mut wire = BitTorrentWire;
            loop {
                let message = wire.read_message(&mut reader).await;
                let failed = message.is_err();
                if inbound_tx.send(message).await.is_err() || failed {
                    break;
                }
            }
        });

        let timeouts = self.ctx.timeouts;
        let mut keepalive = tokio::time::interval(timeouts.keepalive);
        keepalive.tick().await;
        let mut last_received = Instant::now();
        let mut last_sent = Instant::now();

        let reason = loop {
            let idle_deadline = last_received + timeouts.idle;
            tokio::select! {
                command = self.commands.recv() => {
                    let command = match command {
                        None | Some(PeerCommand::Shutdown) => break DisconnectReason::Shutdown,
                        Some(command) => command,
                    };
                    match self.handle_command(command, &mut wire, &mut writer).await {
                        Ok(true) => last_sent = Instant::now(),
                        Ok(false) => {}
                        Err(e) => break DisconnectReason::ConnectionLost(e.to_string()),
                    }
                }
                message = inbound.recv() => {
                    match message {
                        None => break DisconnectReason::ConnectionLost("reader stopped".to_string()),
                        Some(Err(e)) => break classify(e),
                        Some(Ok(message)) => {
                            last_received = Instant::now();
                            if let Some(reason) = self.handle_message(message).await {
                                break reason;
                            }
                        }
                    }
                }
                _ = std::future::ready(()), if !self.uploads.is_empty() => {
                    match self.serve_next(&mut wire, &mut writer).await {
                        Ok(true) => last_sent = Instant::now(),
                        Ok(false) => {}
                        Err(e) => break DisconnectReason::ConnectionLost(e.to_string()),
                    }
                }
                _ = keepalive.tick() => {
                    if last_sent.elapsed() >= timeouts.keepalive {
                        trace!("Sending KeepAlive to peer: {}", self.addr);
                        if let Err(e) = wire.write_message(&mut writer, &Message::KeepAlive).await {
                            break DisconnectReason::ConnectionLost(e.to_string());
                        }
                        last_sent = Instant::now();
                    }
                }
                _ = tokio::time::sleep_until(idle_deadline) => break DisconnectReason::IdleTimeout,
            }
        };

        reader_task.abort();
        reason
    }

    /// Returns whether anything was written
    async fn handle_command<W>(&mut self, command: PeerCommand, wire: &mut BitTorrentWire, writer: &mut WriteHalf<W>) -> Result<bool>
    where
        W: AsyncRead + AsyncWrite,
    {
        match command {
            PeerCommand::Request(block) => {
                if !self.state.can_request() {
                    trace!("Not requesting {:?} from {} in state {:?}", block, self.addr, self.state);
                    self.emit(PeerEventKind::RequestDropped(block)).await;
                    return Ok(false);
                }
                if !self.requested.insert(block) {
                    return Ok(false);
                }
                trace!("Requesting piece {} block {} from peer: {}", block.piece, block.offset, self.addr);
                let request = Message::Request {
                    index: block.piece,
                    begin: block.offset,
                    length: block.length,
                };
                wire.write_message(writer, &request).await?;
                Ok(true)
            }
            PeerCommand::Cancel(block) => {
                if !self.requested.remove(&block) {
                    return Ok(false);
                }
                let cancel = Message::Cancel {
                    index: block.piece,
                    begin: block.offset,
                    length: block.length,
                };
                wire.write_message(writer, &cancel).await?;
                Ok(true)
            }
            PeerCommand::SetInterested(interested) => self.set_interested(interested, wire, writer).await,
            PeerCommand::SetChoking(choking) => {
                if self.am_choking == choking {
                    return Ok(false);
                }
                let message = if choking { Message::Choke } else { Message::Unchoke };
                debug!("Sending {:?} to peer: {}", message, self.addr);
                wire.write_message(writer, &message).await?;
                self.am_choking = choking;
                if choking {
                    self.uploads.clear();
                }
                Ok(true)
            }
            PeerCommand::Have(piece) => {
                wire.write_message(writer, &Message::Have { piece_index: piece }).await?;
                Ok(true)
            }
            PeerCommand::Shutdown => Ok(false),
        }
    }

    /// Answer the oldest queued request; returns whether anything was written
    async fn serve_next<W>(&mut self, wire: &mut BitTorrentWire, writer: &mut WriteHalf<W>) -> Result<bool>
    where
        W: AsyncRead + AsyncWrite,
    {
        let Some(block) = self.uploads.pop_front() else {
            return Ok(false);
        };
        let Some(store) = self.ctx.store.clone() else {
            return Ok(false);
        };
        if self.am_choking || !store.has(block.piece) {
            trace!("Not serving {:?} to {}", block, self.addr);
            return Ok(false);
        }
        let data = match store.read(block.piece, block.offset, block.length).await {
            Ok(data) => data,
            Err(e) => {
                debug!("Cannot serve {:?} to {}: {}", block, self.addr, e);
                return Ok(false);
            }
        };
        trace!("Serving piece {} block {} to peer: {}", block.piece, block.offset, self.addr);
        let piece = Message::Piece {
            index: block.piece,
            begin: block.offset,
            block: data,
        };
        wire.write_message(writer, &piece).await?;
        self.emit(PeerEventKind::Uploaded(block)).await;
        Ok(true)
    }

    /// Validate a remote request against the torrent layout
    fn requested_block(&self, index: u32, begin: u32, length: u32) -> std::result::Result<BlockRef, DisconnectReason> {
        let piece_count = self.ctx.info.piece_count();
        if index as usize >= piece_count
            || length == 0
            || length > MAX_REQUEST_LENGTH
            || begin as u64 + length as u64 > self.ctx.info.piece_len(index) as u64
        {
            return Err(DisconnectReason::ProtocolViolation(format!(
                "request {}+{} outside piece {}",
                begin, length, index
            )));
        }
        Ok(BlockRef::new(index, begin, length))
    }

    async fn set_interested<W>(&mut self, interested: bool, wire: &mut BitTorrentWire, writer: &mut WriteHalf<W>) -> Result<bool>
    where
        W: AsyncRead + AsyncWrite,
    {
        if self.am_interested == interested {
            return Ok(false);
        }
        let message = if interested { Message::Interested } else { Message::NotInterested };
        debug!("Sending {:?} to peer: {}", message, self.addr);
        wire.write_message(writer, &message).await?;
        self.am_interested = interested;
        Ok(true)
    }

    /// Returns a reason when the connection must end
    async fn handle_message(&mut self, message: Message) -> Option<DisconnectReason> {
        let piece_count = self.ctx.info.piece_count();
        let kind = match message {
            Message::KeepAlive => return None,
            Message::Choke => {
                // a choking peer discards our pending requests
                self.requested.clear();
                self.state = PeerState::Choked;
                PeerEventKind::Choked
            }
            Message::Unchoke => {
                self.state = PeerState::Unchoked;
                PeerEventKind::Unchoked
            }
            Message::Have { piece_index } => {
                if piece_index as usize >= piece_count {
                    return Some(DisconnectReason::ProtocolViolation(format!(
                        "have {} beyond {} pieces",
                        piece_index, piece_count
                    )));
                }
                PeerEventKind::Have(piece_index)
            }
            Message::Bitfield { bitfield } => match Bitfield::from_bytes(&bitfield, piece_count) {
                Ok(bitfield) => PeerEventKind::Bitfield(bitfield),
                Err(e) => return Some(DisconnectReason::ProtocolViolation(e.to_string())),
            },
            Message::Piece { index, begin, block } => {
                let piece_len = self.ctx.info.piece_len(index);
                if index as usize >= piece_count || begin as u64 + block.len() as u64 > piece_len as u64 {
                    return Some(DisconnectReason::ProtocolViolation(format!(
                        "block {}+{} outside piece {}",
                        begin,
                        block.len(),
                        index
                    )));
                }
                let block_ref = BlockRef::new(index, begin, block.len() as u32);
                if !self.requested.remove(&block_ref) {
                    trace!("Dropping unrequested block {:?} from {}", block_ref, self.addr);
                    return None;
                }
                PeerEventKind::Block { block: block_ref, data: block }
            }
            Message::Interested | Message::NotInterested => {
                let interested = message == Message::Interested;
                if self.peer_interested == interested {
                    return None;
                }
                self.peer_interested = interested;
                PeerEventKind::Interest(interested)
            }
            Message::Request { index, begin, length } => {
                let block = match self.requested_block(index, begin, length) {
                    Ok(block) => block,
                    Err(reason) => return Some(reason),
                };
                if self.am_choking {
                    trace!("Ignoring request {:?} from choked peer {}", block, self.addr);
                } else if self.uploads.len() >= MAX_QUEUED_UPLOADS {
                    debug!("Upload queue full for {}, ignoring {:?}", self.addr, block);
                } else if !self.uploads.contains(&block) {
                    self.uploads.push_back(block);
                }
                return None;
            }
            Message::Cancel { index, begin, length } => {
                let block = BlockRef::new(index, begin, length);
                self.uploads.retain(|queued| *queued != block);
                return None;
            }
            Message::Port { .. } | Message::Extended { .. } => {
                trace!("Ignoring {:?} from {}", message.message_id(), self.addr);
                return None;
            }
        };
        if self.emit(kind).await {
            None
        } else {
            Some(DisconnectReason::Shutdown)
        }
    }
}

fn classify(err: anyhow::Error) -> DisconnectReason {
    match TorrentError::kind_of(&err) {
        Some(ErrorKind::Protocol) => DisconnectReason::ProtocolViolation(err.to_string()),
        _ => DisconnectReason::ConnectionLost(err.to_string()),
    }
}

/// Engine-side handle of a running connection task
#[derive(Debug)]
pub struct PeerHandle {
    pub key: PeerKey,
    pub addr: SocketAddr,
    commands: mpsc::Sender<PeerCommand>,
    task: JoinHandle<()>,
}

impl PeerHandle {
    /// Queue a command without waiting; false when the queue is full or the task ended
    pub fn send(&self, command: PeerCommand) -> bool {
        match self.commands.try_send(command) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(command)) => {
                warn!("Command queue full for peer {}, dropping {:?}", self.addr, command);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn into_task(self) -> JoinHandle<()> {
        self.task
    }
}

/// Dial `addr` and run a session on success
pub fn spawn_outgoing(ctx: PeerContext, key: PeerKey, addr: SocketAddr, events: mpsc::Sender<PeerEvent>) -> PeerHandle {
    let (commands, rx) = mpsc::channel(COMMAND_QUEUE);
    let task = tokio::spawn(async move {
        let connect_timeout = ctx.timeouts.connect;
        let connection = PeerConnection::new(key, addr, ctx, events, rx);
        debug!("Connecting to peer: {}", addr);
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => connection.run(stream).await,
            Ok(Err(e)) => connection.fail(DisconnectReason::ConnectFailed(e.to_string())).await,
            Err(_) => connection.fail(DisconnectReason::ConnectFailed("timed out".to_string())).await,
        }
    });
    PeerHandle {
        key,
        addr,
        commands,
        task,
    }
}

/// Run a session over an accepted socket
pub fn spawn_incoming(ctx: PeerContext, key: PeerKey, stream: TcpStream, addr: SocketAddr, events: mpsc::Sender<PeerEvent>) -> PeerHandle {
    let (commands, rx) = mpsc::channel(COMMAND_QUEUE);
    let task = tokio::spawn(async move {
        PeerConnection::new(key, addr, ctx, events, rx).run(stream).await;
    });
    PeerHandle {
        key,
        addr,
        commands,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryBackend, PutOutcome};
    use crate::torrent::fixtures;
    use tokio::io::DuplexStream;

    struct Harness {
        remote: DuplexStream,
        commands: mpsc::Sender<PeerCommand>,
        events: mpsc::Receiver<PeerEvent>,
        info: Arc<TorrentInfo>,
        task: JoinHandle<()>,
    }

    fn start(timeouts: PeerTimeouts) -> Harness {
        let fixture = fixtures::single_file("two.bin", &fixtures::payload(2 * 16384), 16384);
        launch(Arc::new(fixture.info), None, timeouts)
    }

    fn launch(info: Arc<TorrentInfo>, store: Option<Arc<PieceStore>>, timeouts: PeerTimeouts) -> Harness {
        let (local, remote) = tokio::io::duplex(1 << 20);
        let (events_tx, events) = mpsc::channel(64);
        let (commands, commands_rx) = mpsc::channel(64);
        let ctx = PeerContext {
            info: info.clone(),
            peer_id: [1u8; 20],
            timeouts,
            store,
        };
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let connection = PeerConnection::new(7, addr, ctx, events_tx, commands_rx);
        let task = tokio::spawn(connection.run(local));
        Harness {
            remote,
            commands,
            events,
            info,
            task,
        }
    }

    async fn remote_handshake(h: &mut Harness, info_hash: [u8; 20]) {
        let mut wire = BitTorrentWire;
        let ours = wire.read_handshake(&mut h.remote).await.unwrap();
        assert!(ours.supports_extensions());
        wire.write_handshake(&mut h.remote, &Handshake::new(info_hash, [2u8; 20])).await.unwrap();
    }

    async fn next_kind(h: &mut Harness) -> PeerEventKind {
        let event = h.events.recv().await.unwrap();
        assert_eq!(event.key, 7);
        event.kind
    }

    #[tokio::test]
    async fn test_handshake_mismatch_disconnects() {
        let mut h = start(PeerTimeouts::default());
        remote_handshake(&mut h, [0xee; 20]).await;
        match next_kind(&mut h).await {
            PeerEventKind::Disconnected(DisconnectReason::HandshakeMismatch) => {}
            other => panic!("unexpected event {:?}", other),
        }
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_and_receive_block() {
        let mut h = start(PeerTimeouts::default());
        let info_hash = h.info.info_hash;
        remote_handshake(&mut h, info_hash).await;
        assert!(matches!(next_kind(&mut h).await, PeerEventKind::Connected { extensions: true, .. }));

        let mut wire = BitTorrentWire;
        assert_eq!(wire.read_message(&mut h.remote).await.unwrap(), Message::Interested);
        wire.write_message(&mut h.remote, &Message::Bitfield { bitfield: vec![0b1100_0000] })
            .await
            .unwrap();
        wire.write_message(&mut h.remote, &Message::Unchoke).await.unwrap();
        match next_kind(&mut h).await {
            PeerEventKind::Bitfield(bitfield) => assert!(bitfield.is_seed()),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(next_kind(&mut h).await, PeerEventKind::Unchoked));

        let block = BlockRef::new(1, 0, 16384);
        h.commands.send(PeerCommand::Request(block)).await.unwrap();
        assert_eq!(
            wire.read_message(&mut h.remote).await.unwrap(),
            Message::Request { index: 1, begin: 0, length: 16384 }
        );

        // unrequested block is dropped silently, the requested one comes through
        let data = Bytes::from(vec![5u8; 16384]);
        wire.write_message(&mut h.remote, &Message::Piece { index: 0, begin: 0, block: data.clone() })
            .await
            .unwrap();
        wire.write_message(&mut h.remote, &Message::Piece { index: 1, begin: 0, block: data.clone() })
            .await
            .unwrap();
        match next_kind(&mut h).await {
            PeerEventKind::Block { block: got, data: bytes } => {
                assert_eq!(got, block);
                assert_eq!(bytes, data);
            }
            other => panic!("unexpected event {:?}", other),
        }

        h.commands.send(PeerCommand::Shutdown).await.unwrap();
        assert!(matches!(
            next_kind(&mut h).await,
            PeerEventKind::Disconnected(DisconnectReason::Shutdown)
        ));
        h.task.await.unwrap();
        assert!(h.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_have_out_of_range_is_violation() {
        let mut h = start(PeerTimeouts::default());
        let info_hash = h.info.info_hash;
        remote_handshake(&mut h, info_hash).await;
        assert!(matches!(next_kind(&mut h).await, PeerEventKind::Connected { .. }));
        BitTorrentWire
            .write_message(&mut h.remote, &Message::Have { piece_index: 2 })
            .await
            .unwrap();
        assert!(matches!(
            next_kind(&mut h).await,
            PeerEventKind::Disconnected(DisconnectReason::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_request_ignored_while_choked() {
        let mut h = start(PeerTimeouts::default());
        let info_hash = h.info.info_hash;
        remote_handshake(&mut h, info_hash).await;
        assert!(matches!(next_kind(&mut h).await, PeerEventKind::Connected { .. }));
        let mut wire = BitTorrentWire;
        assert_eq!(wire.read_message(&mut h.remote).await.unwrap(), Message::Interested);

        let block = BlockRef::new(0, 0, 16384);
        h.commands.send(PeerCommand::Request(block)).await.unwrap();
        match next_kind(&mut h).await {
            PeerEventKind::RequestDropped(dropped) => assert_eq!(dropped, block),
            other => panic!("unexpected event {:?}", other),
        }
        h.commands.send(PeerCommand::SetInterested(false)).await.unwrap();
        // the request was never written; the next message is NotInterested
        assert_eq!(wire.read_message(&mut h.remote).await.unwrap(), Message::NotInterested);
    }

    #[tokio::test]
    async fn test_serves_verified_blocks_once_unchoked() {
        let fixture = fixtures::single_file("two.bin", &fixtures::payload(2 * 16384), 16384);
        let info = Arc::new(fixture.info);
        let store = Arc::new(PieceStore::open(info.clone(), Arc::new(MemoryBackend::new())).await.unwrap());
        let first = Bytes::copy_from_slice(&fixture.content[..16384]);
        assert_eq!(store.put(0, 0, first).await.unwrap(), PutOutcome::Verified);

        let mut h = launch(info.clone(), Some(store), PeerTimeouts::default());
        remote_handshake(&mut h, info.info_hash).await;
        assert!(matches!(next_kind(&mut h).await, PeerEventKind::Connected { .. }));
        let mut wire = BitTorrentWire;
        assert_eq!(
            wire.read_message(&mut h.remote).await.unwrap(),
            Message::Bitfield { bitfield: vec![0b1000_0000] }
        );
        assert_eq!(wire.read_message(&mut h.remote).await.unwrap(), Message::Interested);

        // a request while choked is dropped; the Have after it marks it as handled
        wire.write_message(&mut h.remote, &Message::Interested).await.unwrap();
        wire.write_message(&mut h.remote, &Message::Request { index: 0, begin: 0, length: 8192 })
            .await
            .unwrap();
        wire.write_message(&mut h.remote, &Message::Have { piece_index: 1 }).await.unwrap();
        assert!(matches!(next_kind(&mut h).await, PeerEventKind::Interest(true)));
        assert!(matches!(next_kind(&mut h).await, PeerEventKind::Have(1)));

        h.commands.send(PeerCommand::SetChoking(false)).await.unwrap();
        assert_eq!(wire.read_message(&mut h.remote).await.unwrap(), Message::Unchoke);

        // piece 1 is not verified locally, so only the piece 0 block comes back
        wire.write_message(&mut h.remote, &Message::Request { index: 1, begin: 0, length: 8192 })
            .await
            .unwrap();
        wire.write_message(&mut h.remote, &Message::Request { index: 0, begin: 8192, length: 8192 })
            .await
            .unwrap();
        assert_eq!(
            wire.read_message(&mut h.remote).await.unwrap(),
            Message::Piece {
                index: 0,
                begin: 8192,
                block: Bytes::copy_from_slice(&fixture.content[8192..16384]),
            }
        );
        match next_kind(&mut h).await {
            PeerEventKind::Uploaded(block) => assert_eq!(block, BlockRef::new(0, 8192, 8192)),
            other => panic!("unexpected event {:?}", other),
        }

        h.commands.send(PeerCommand::Have(1)).await.unwrap();
        assert_eq!(wire.read_message(&mut h.remote).await.unwrap(), Message::Have { piece_index: 1 });
        h.commands.send(PeerCommand::Shutdown).await.unwrap();
        assert!(matches!(
            next_kind(&mut h).await,
            PeerEventKind::Disconnected(DisconnectReason::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_request_outside_piece_is_violation() {
        let mut h = start(PeerTimeouts::default());
        let info_hash = h.info.info_hash;
        remote_handshake(&mut h, info_hash).await;
        assert!(matches!(next_kind(&mut h).await, PeerEventKind::Connected { .. }));
        BitTorrentWire
            .write_message(&mut h.remote, &Message::Request { index: 0, begin: 16000, length: 1000 })
            .await
            .unwrap();
        assert!(matches!(
            next_kind(&mut h).await,
            PeerEventKind::Disconnected(DisconnectReason::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_idle_peer_times_out() {
        let timeouts = PeerTimeouts {
            idle: Duration::from_millis(50),
            keepalive: Duration::from_millis(20),
            ..PeerTimeouts::default()
        };
        let mut h = start(timeouts);
        let info_hash = h.info.info_hash;
        remote_handshake(&mut h, info_hash).await;
        assert!(matches!(next_kind(&mut h).await, PeerEventKind::Connected { .. }));
        assert!(matches!(
            next_kind(&mut h).await,
            PeerEventKind::Disconnected(DisconnectReason::IdleTimeout)
        ));
    }
}
