//! Session engine
//!
//! One task per session owning the swarm and the piece selector. Every peer
//! event, stream demand update, timer and command passes through this loop,
//! so selector bookkeeping and peer teardown always happen in the same step.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::SessionConfig;
use crate::error::{ErrorKind, TorrentError};
use crate::peer::{
    PeerCommand, PeerContext, PeerEvent, PeerEventKind, PeerInfo, PeerKey, PeerSource, PeerTimeouts, SwarmConfig,
    SwarmManager, SwarmUpdate,
};
use crate::selector::{PieceSelector, SelectorConfig};
use crate::session::events::{SessionEvent, SessionStats};
use crate::storage::{BlockRef, PieceStore, PutOutcome};
use crate::stream::DemandUpdate;
use crate::tracker::{self, AnnounceRequest, TrackerEvent, MIN_ANNOUNCE_INTERVAL};

/// Peer events buffered before connection tasks wait on the engine
const EVENT_QUEUE: usize = 1024;

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub(crate) enum EngineCommand {
    AddPeers(Vec<SocketAddr>),
    /// Disconnect every peer, then acknowledge
    Shutdown(oneshot::Sender<()>),
}

/// Everything the engine is started with
pub(crate) struct EngineSetup {
    pub store: Arc<PieceStore>,
    pub config: SessionConfig,
    pub peer_id: [u8; 20],
    pub trackers: Vec<String>,
    pub peers: Vec<PeerInfo>,
    pub listener: Option<TcpListener>,
    pub events: broadcast::Sender<SessionEvent>,
}

/// Session-side handle of the engine task
pub(crate) struct EngineHandle {
    pub commands: mpsc::Sender<EngineCommand>,
    pub demand: mpsc::UnboundedSender<DemandUpdate>,
    pub stats: watch::Receiver<SessionStats>,
    pub task: JoinHandle<()>,
}

struct Engine {
    store: Arc<PieceStore>,
    swarm: SwarmManager,
    selector: PieceSelector,
    peer_events: mpsc::Receiver<PeerEvent>,
    demand: mpsc::UnboundedReceiver<DemandUpdate>,
    commands: mpsc::Receiver<EngineCommand>,
    events: broadcast::Sender<SessionEvent>,
    stats: watch::Sender<SessionStats>,
    trackers: Vec<String>,
    peer_id: [u8; 20],
    listen_port: u16,
    announce: bool,
    stop_grace: Duration,
    listener: Option<TcpListener>,
    completed_files: Vec<bool>,
    announced_started: bool,
    announced_completed: bool,
    last_sample: (Instant, u64),
    uploaded: u64,
}

pub(crate) fn spawn(setup: EngineSetup) -> EngineHandle {
    let (events_tx, peer_events) = mpsc::channel(EVENT_QUEUE);
    let (commands, commands_rx) = mpsc::channel(16);
    let (demand, demand_rx) = mpsc::unbounded_channel();
    let (stats_tx, stats) = watch::channel(SessionStats::default());

    let config = setup.config;
    let info = setup.store.info().clone();
    let ctx = PeerContext {
        info: info.clone(),
        peer_id: setup.peer_id,
        timeouts: PeerTimeouts {
            connect: config.connect_timeout,
            handshake: config.connect_timeout,
            ..PeerTimeouts::default()
        },
        store: Some(setup.store.clone()),
    };
    let swarm = SwarmManager::new(
        ctx,
        SwarmConfig {
            max_connections: config.max_connections,
            max_hash_failures: config.max_hash_failures,
            upload_slots: config.upload_slots,
        },
        events_tx,
    );
    let selector = PieceSelector::new(
        &info,
        SelectorConfig {
            duplicate_cap: config.duplicate_request_cap,
            endgame_threshold: config.endgame_threshold,
            max_inflight_per_peer: config.max_inflight_per_peer,
            request_timeout: config.request_timeout,
        },
    );

    let mut engine = Engine {
        store: setup.store,
        swarm,
        selector,
        peer_events,
        demand: demand_rx,
        commands: commands_rx,
        events: setup.events,
        stats: stats_tx,
        trackers: setup.trackers,
        peer_id: setup.peer_id,
        listen_port: config.listen_port,
        announce: config.announce,
        stop_grace: config.stop_grace,
        listener: setup.listener,
        completed_files: info.files.iter().map(|f| f.length == 0).collect(),
        announced_started: false,
        announced_completed: false,
        last_sample: (Instant::now(), 0),
        uploaded: 0,
    };
    for source in [PeerSource::Manual, PeerSource::Magnet, PeerSource::Tracker] {
        let addrs: Vec<SocketAddr> = setup.peers.iter().filter(|p| p.source == source).map(|p| p.addr).collect();
        engine.swarm.add_candidates(addrs, source);
    }

    let task = tokio::spawn(engine.run());
    EngineHandle {
        commands,
        demand,
        stats,
        task,
    }
}

async fn accept_next(listener: &Option<TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

impl Engine {
    async fn run(mut self) {
        info!(
            "Engine started for {} ({} pieces, {} trackers)",
            self.store.info().name,
            self.store.piece_count(),
            self.trackers.len()
        );
        let mut ticker = interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut announces: JoinSet<(Vec<SocketAddr>, Duration)> = JoinSet::new();
        let mut next_announce = Instant::now();
        let can_announce = self.announce && !self.trackers.is_empty();

        self.swarm.fill_connections();
        loop {
            tokio::select! {
                Some(event) = self.peer_events.recv() => {
                    if let Err(e) = self.on_peer_event(event).await {
                        self.fail(e).await;
                        break;
                    }
                }
                Some(update) = self.demand.recv() => self.on_demand(update),
                command = self.commands.recv() => match command {
                    Some(EngineCommand::AddPeers(addrs)) => {
                        self.swarm.add_candidates(addrs, PeerSource::Manual);
                    }
                    Some(EngineCommand::Shutdown(reply)) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.expire_requests();
                    self.publish_stats();
                }
                _ = sleep_until(next_announce), if can_announce && announces.is_empty() => {
                    self.spawn_announce(&mut announces);
                }
                Some(joined) = announces.join_next() => {
                    let wait = match joined {
                        Ok((peers, wait)) => {
                            self.swarm.add_candidates(peers, PeerSource::Tracker);
                            wait
                        }
                        Err(e) => {
                            warn!("Announce task failed: {}", e);
                            MIN_ANNOUNCE_INTERVAL
                        }
                    };
                    debug!("Next announce in {:?}", wait);
                    next_announce = Instant::now() + wait;
                }
                accepted = accept_next(&self.listener) => match accepted {
                    Ok((stream, addr)) => {
                        if !self.swarm.accept(stream, addr) {
                            trace!("Incoming peer {} refused", addr);
                        }
                    }
                    Err(e) => warn!("Failed to accept peer connection: {}", e),
                },
            }
            self.swarm.fill_connections();
            self.schedule();
        }
        announces.abort_all();
        info!("Engine stopped for {}", self.store.info().name);
    }

    async fn on_peer_event(&mut self, event: PeerEvent) -> Result<()> {
        match self.swarm.handle_event(&event) {
            SwarmUpdate::Stale => {
                trace!("Ignoring event from stale peer {} ({})", event.addr, event.key);
            }
            SwarmUpdate::Removed => {
                let released = self.selector.release_peer(event.key);
                if !released.is_empty() {
                    debug!("Peer {} left with {} requests in flight", event.addr, released.len());
                }
                self.return_to_pool(&released);
                self.swarm.rebalance_uploads();
            }
            SwarmUpdate::Updated => match event.kind {
                PeerEventKind::Choked => {
                    let released = self.selector.release_peer(event.key);
                    self.return_to_pool(&released);
                }
                PeerEventKind::Block { block, data } => self.on_block(event.key, event.addr, block, data).await?,
                PeerEventKind::RequestDropped(block) => {
                    self.selector.cancel_request(event.key, block);
                    self.return_to_pool(&[block]);
                }
                PeerEventKind::Connected { .. } | PeerEventKind::Interest(_) => {
                    self.swarm.rebalance_uploads();
                }
                PeerEventKind::Uploaded(block) => self.uploaded += block.length as u64,
                _ => {}
            },
        }
        Ok(())
    }

    async fn on_block(&mut self, key: PeerKey, addr: SocketAddr, block: BlockRef, data: Bytes) -> Result<()> {
        if !self.selector.is_valid_block(&block) || data.len() != block.length as usize {
            warn!("Peer {} sent a malformed block {:?}, disconnecting", addr, block);
            self.swarm.send(key, PeerCommand::Shutdown);
            return Ok(());
        }
        let Some(others) = self.selector.on_block_received(key, block) else {
            trace!("Dropping unwanted block {:?} from {}", block, addr);
            return Ok(());
        };
        for other in others {
            self.swarm.send(other, PeerCommand::Cancel(block));
        }

        match self.store.put(block.piece, block.offset, data).await {
            Ok(PutOutcome::Stored) | Ok(PutOutcome::Duplicate) => {}
            Ok(PutOutcome::Verified) => self.on_piece_verified(block.piece),
            Ok(PutOutcome::HashMismatch) => {
                let contributors = self.selector.on_piece_failed(block.piece);
                warn!(
                    "{} from peers {:?}, retrying",
                    TorrentError::piece_hash_mismatch(block.piece),
                    contributors
                );
                for banned in self.swarm.record_hash_failure(&contributors) {
                    let released = self.selector.release_peer(banned);
                    self.return_to_pool(&released);
                }
            }
            Err(e) => match TorrentError::kind_of(&e) {
                Some(ErrorKind::StoreIoFailure) => return Err(e),
                Some(ErrorKind::Cancelled) => trace!("Store closed, dropping block {:?}", block),
                _ => {
                    warn!("Store refused block {:?} from {}: {}", block, addr, e);
                    self.selector.on_block_rejected(block);
                }
            },
        }
        Ok(())
    }

    fn on_piece_verified(&mut self, piece: u32) {
        for (peer, block) in self.selector.on_piece_verified(piece) {
            self.swarm.send(peer, PeerCommand::Cancel(block));
        }
        self.swarm.broadcast(PeerCommand::Have(piece));

        let info = self.store.info().clone();
        let piece_start = piece as u64 * info.piece_length;
        let piece_end = piece_start + info.piece_len(piece) as u64;
        let mut changed = false;
        for (index, file) in info.files.iter().enumerate() {
            if self.completed_files[index] || file.end() <= piece_start || file.offset >= piece_end {
                continue;
            }
            if info.pieces_for_range(file.offset, file.length).all(|p| self.store.has(p)) {
                info!("File {} complete", file.path_string());
                self.completed_files[index] = true;
                changed = true;
            }
        }
        if changed {
            let _ = self.events.send(SessionEvent::FilesChanged {
                files: info.file_entries(),
            });
        }

        if self.store.is_complete() {
            info!("Download of {} complete", info.name);
            self.swarm.broadcast(PeerCommand::SetInterested(false));
            self.publish_stats();
        }
    }

    /// Pieces left with nothing in flight go back to Missing
    fn return_to_pool(&mut self, blocks: &[BlockRef]) {
        let pieces: BTreeSet<u32> = blocks.iter().map(|b| b.piece).collect();
        for piece in pieces {
            if self.selector.is_piece_idle(piece) {
                self.store.mark_missing(piece);
            }
        }
    }

    fn on_demand(&mut self, update: DemandUpdate) {
        match update {
            DemandUpdate::Set { stream, pieces } => self.selector.set_demand(stream, pieces),
            DemandUpdate::Clear { stream } => self.selector.clear_demand(stream),
        }
    }

    fn schedule(&mut self) {
        if self.store.is_complete() {
            return;
        }
        let peers = self.swarm.requestable();
        let issued = self.selector.schedule(&peers, self.swarm.availability(), Instant::now());
        for (key, block) in issued {
            if self.swarm.send(key, PeerCommand::Request(block)) {
                self.store.mark_requested(block.piece);
            } else {
                self.selector.cancel_request(key, block);
            }
        }
    }

    fn expire_requests(&mut self) {
        let expired = self.selector.expire(Instant::now());
        if expired.is_empty() {
            return;
        }
        for (key, block) in &expired {
            let addr = self.swarm.addr_of(*key).map(|a| a.to_string());
            debug!("{}", TorrentError::request_timeout(block.piece, block.offset, addr));
            self.swarm.send(*key, PeerCommand::Cancel(*block));
        }
        let blocks: Vec<BlockRef> = expired.into_iter().map(|(_, b)| b).collect();
        self.return_to_pool(&blocks);
    }

    fn publish_stats(&mut self) {
        let now = Instant::now();
        let downloaded = self.store.downloaded_bytes();
        let (at, bytes) = self.last_sample;
        let elapsed = now.duration_since(at).as_secs_f64();
        let rate = if elapsed > 0.0 {
            downloaded.saturating_sub(bytes) as f64 / elapsed
        } else {
            0.0
        };
        self.last_sample = (now, downloaded);

        let stats = SessionStats {
            peers: self.swarm.connected_count(),
            connections: self.swarm.peer_count(),
            candidates: self.swarm.candidate_count(),
            verified_pieces: self.store.verified_count(),
            total_pieces: self.store.piece_count(),
            progress: self.store.progress(),
            downloaded_bytes: downloaded,
            total_bytes: self.store.info().total_size(),
            download_rate: rate,
            uploaded_bytes: self.uploaded,
            open_streams: self.selector.demand_count(),
        };
        let changed = {
            let previous = self.stats.borrow();
            previous.downloaded_bytes != stats.downloaded_bytes
                || previous.peers != stats.peers
                || previous.uploaded_bytes != stats.uploaded_bytes
                || previous.download_rate != stats.download_rate
        };
        self.stats.send_replace(stats.clone());
        if changed {
            let _ = self.events.send(SessionEvent::Progress { stats });
        }
    }

    fn spawn_announce(&mut self, tasks: &mut JoinSet<(Vec<SocketAddr>, Duration)>) {
        let downloaded = self.store.downloaded_bytes();
        let event = if !self.announced_started {
            self.announced_started = true;
            TrackerEvent::Started
        } else if self.store.is_complete() && !self.announced_completed {
            self.announced_completed = true;
            TrackerEvent::Completed
        } else {
            TrackerEvent::None
        };
        let request = AnnounceRequest {
            info_hash: self.store.info().info_hash,
            peer_id: self.peer_id,
            port: self.listen_port,
            uploaded: self.uploaded,
            downloaded,
            left: self.store.info().total_size().saturating_sub(downloaded),
            event,
        };
        let urls = self.trackers.clone();
        debug!("Announcing to {} trackers ({:?})", urls.len(), event);
        tasks.spawn(async move { tracker::announce_all(&urls, &request).await });
    }

    /// Disconnect every peer within the grace period
    async fn teardown(&mut self) {
        self.listener = None;
        self.swarm.shutdown(self.stop_grace).await;
        self.publish_stats();
    }

    /// Store failure: tell observers, then tear everything down
    async fn fail(&mut self, err: anyhow::Error) {
        error!("Session for {} failed: {:#}", self.store.info().name, err);
        let _ = self.events.send(SessionEvent::error(&err));
        self.store.close();
        self.teardown().await;
        if let Err(e) = self.store.discard().await {
            warn!("Failed to discard piece data: {}", e);
        }
    }
}
