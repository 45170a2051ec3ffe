//! Swarm manager
//!
//! Owns every connection task of one torrent, the queue of candidate
//! addresses, the blacklist and the per-piece availability counts. It is
//! driven by the engine, which forwards each [`PeerEvent`] here first.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::peer::connection::{spawn_incoming, spawn_outgoing, PeerCommand, PeerContext, PeerEvent, PeerEventKind, PeerHandle};
use crate::peer::state::{Bitfield, DisconnectReason, PeerInfo, PeerKey, PeerSource, PeerState};

/// Connection attempts per address before it is dropped for good
pub const RETRY_CAP: u32 = 3;

/// Removed peers remembered for hash failure accounting
const DEPARTED_CAP: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct SwarmConfig {
    pub max_connections: usize,
    pub max_hash_failures: u32,
    /// Interested peers unchoked at once
    pub upload_slots: usize,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_connections: 200,
            max_hash_failures: 3,
            upload_slots: 10,
        }
    }
}

#[derive(Debug)]
struct PeerEntry {
    handle: PeerHandle,
    source: PeerSource,
    state: PeerState,
    bitfield: Bitfield,
    peer_interested: bool,
    am_choking: bool,
}

/// What the engine learns from one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmUpdate {
    /// Event for a connection that is already gone
    Stale,
    /// Bookkeeping updated
    Updated,
    /// The peer was removed; its in-flight requests must be released
    Removed,
}

/// Snapshot of one connection for status output
#[derive(Debug, Clone)]
pub struct PeerView {
    pub key: PeerKey,
    pub addr: SocketAddr,
    pub source: PeerSource,
    pub state: PeerState,
    pub pieces: usize,
    /// Holds one of our upload slots
    pub uploading: bool,
}

pub struct SwarmManager {
    ctx: PeerContext,
    config: SwarmConfig,
    events: mpsc::Sender<PeerEvent>,
    next_key: PeerKey,
    candidates: VecDeque<PeerInfo>,
    /// Addresses queued or connected
    known: HashSet<SocketAddr>,
    attempts: HashMap<SocketAddr, u32>,
    hash_failures: HashMap<SocketAddr, u32>,
    blacklist: HashSet<SocketAddr>,
    peers: HashMap<PeerKey, PeerEntry>,
    /// Addresses of removed peers, so late hash failures still reach them
    departed: BTreeMap<PeerKey, SocketAddr>,
    availability: Vec<u32>,
}

impl SwarmManager {
    pub fn new(ctx: PeerContext, config: SwarmConfig, events: mpsc::Sender<PeerEvent>) -> Self {
        let piece_count = ctx.info.piece_count();
        Self {
            ctx,
            config,
            events,
            next_key: 1,
            candidates: VecDeque::new(),
            known: HashSet::new(),
            attempts: HashMap::new(),
            hash_failures: HashMap::new(),
            blacklist: HashSet::new(),
            peers: HashMap::new(),
            departed: BTreeMap::new(),
            availability: vec![0; piece_count],
        }
    }

    /// Queue newly discovered addresses; returns how many were new
    pub fn add_candidates(&mut self, addrs: impl IntoIterator<Item = SocketAddr>, source: PeerSource) -> usize {
        let mut fresh: Vec<SocketAddr> = addrs
            .into_iter()
            .filter(|addr| !self.blacklist.contains(addr) && !self.known.contains(addr))
            .collect();
        fresh.sort();
        fresh.dedup();
        fresh.shuffle(&mut rand::thread_rng());
        for addr in &fresh {
            self.known.insert(*addr);
            self.candidates.push_back(PeerInfo::new(*addr, source));
        }
        if !fresh.is_empty() {
            debug!("Added {} {:?} peers ({} queued)", fresh.len(), source, self.candidates.len());
        }
        fresh.len()
    }

    fn alloc_key(&mut self) -> PeerKey {
        let key = self.next_key;
        self.next_key += 1;
        key
    }

    /// Dial queued candidates up to the connection limit
    pub fn fill_connections(&mut self) -> usize {
        let mut started = 0;
        while self.peers.len() < self.config.max_connections {
            let Some(candidate) = self.candidates.pop_front() else {
                break;
            };
            if self.blacklist.contains(&candidate.addr) {
                self.known.remove(&candidate.addr);
                continue;
            }
            *self.attempts.entry(candidate.addr).or_insert(0) += 1;
            let key = self.alloc_key();
            trace!("Dialing {} as peer {}", candidate.addr, key);
            let handle = spawn_outgoing(self.ctx.clone(), key, candidate.addr, self.events.clone());
            self.insert(handle, candidate.source);
            started += 1;
        }
        started
    }

    /// Take over an accepted socket; false when refused
    pub fn accept(&mut self, stream: TcpStream, addr: SocketAddr) -> bool {
        if self.blacklist.contains(&addr) || self.peers.len() >= self.config.max_connections {
            debug!("Refusing incoming peer {}", addr);
            return false;
        }
        if self.peers.values().any(|p| p.handle.addr == addr) {
            return false;
        }
        self.known.insert(addr);
        let key = self.alloc_key();
        let handle = spawn_incoming(self.ctx.clone(), key, stream, addr, self.events.clone());
        self.insert(handle, PeerSource::Incoming);
        true
    }

    fn insert(&mut self, handle: PeerHandle, source: PeerSource) {
        let entry = PeerEntry {
            handle,
            source,
            state: PeerState::Connecting,
            bitfield: Bitfield::new(self.availability.len()),
            peer_interested: false,
            am_choking: true,
        };
        self.peers.insert(entry.handle.key, entry);
    }

    /// Apply one connection event to the swarm's bookkeeping
    pub fn handle_event(&mut self, event: &PeerEvent) -> SwarmUpdate {
        let Some(entry) = self.peers.get_mut(&event.key) else {
            return SwarmUpdate::Stale;
        };
        match &event.kind {
            PeerEventKind::Connected { .. } => entry.state = PeerState::Connected,
            PeerEventKind::Bitfield(bitfield) => {
                for piece in entry.bitfield.iter() {
                    self.availability[piece as usize] -= 1;
                }
                for piece in bitfield.iter() {
                    self.availability[piece as usize] += 1;
                }
                entry.bitfield = bitfield.clone();
            }
            PeerEventKind::Have(piece) => {
                if !entry.bitfield.has(*piece) && entry.bitfield.set(*piece) {
                    self.availability[*piece as usize] += 1;
                }
            }
            PeerEventKind::Choked => entry.state = PeerState::Choked,
            PeerEventKind::Unchoked => entry.state = PeerState::Unchoked,
            PeerEventKind::Interest(interested) => entry.peer_interested = *interested,
            PeerEventKind::Block { .. } | PeerEventKind::RequestDropped(_) | PeerEventKind::Uploaded(_) => {}
            PeerEventKind::Disconnected(reason) => {
                self.remove(event.key, reason);
                return SwarmUpdate::Removed;
            }
        }
        SwarmUpdate::Updated
    }

    fn remove(&mut self, key: PeerKey, reason: &DisconnectReason) {
        let Some(entry) = self.peers.remove(&key) else {
            return;
        };
        for piece in entry.bitfield.iter() {
            self.availability[piece as usize] -= 1;
        }
        let addr = entry.handle.addr;
        self.departed.insert(key, addr);
        if self.departed.len() > DEPARTED_CAP {
            self.departed.pop_first();
        }
        self.known.remove(&addr);
        if matches!(reason, DisconnectReason::HandshakeMismatch | DisconnectReason::ProtocolViolation(_)) {
            self.blacklist.insert(addr);
        }
        let attempts = self.attempts.get(&addr).copied().unwrap_or(0);
        if entry.source != PeerSource::Incoming
            && reason.is_retryable()
            && attempts < RETRY_CAP
            && !self.blacklist.contains(&addr)
        {
            trace!("Re-queueing {} after {} attempts", addr, attempts);
            self.known.insert(addr);
            self.candidates.push_back(PeerInfo::new(addr, entry.source));
        }
        debug!("Peer {} removed ({}), {} connections left", addr, reason, self.peers.len());
    }

    /// Count a failed piece against the address of each contributing peer,
    /// connected or not. Returns the connected peers blacklisted as a result.
    pub fn record_hash_failure(&mut self, contributors: &[PeerKey]) -> Vec<PeerKey> {
        let mut banned = Vec::new();
        let mut seen = HashSet::new();
        for key in contributors {
            let connected = self.peers.get(key);
            let Some(addr) = connected.map(|p| p.handle.addr).or_else(|| self.departed.get(key).copied()) else {
                continue;
            };
            if !seen.insert(addr) {
                continue;
            }
            let failures = self.hash_failures.entry(addr).or_insert(0);
            *failures += 1;
            if *failures < self.config.max_hash_failures {
                continue;
            }
            warn!("Blacklisting peer {} after {} hash failures", addr, failures);
            self.blacklist.insert(addr);
            if let Some(entry) = connected {
                entry.handle.send(PeerCommand::Shutdown);
                banned.push(*key);
            }
        }
        banned
    }

    /// Unchoke interested peers up to the slot count, in key order, and choke
    /// those that lost interest. Returns how many slots are in use.
    pub fn rebalance_uploads(&mut self) -> usize {
        let mut keys: Vec<PeerKey> = self.peers.keys().copied().collect();
        keys.sort_unstable();
        let mut used = self
            .peers
            .values()
            .filter(|p| !p.am_choking && p.peer_interested && p.state.is_connected())
            .count();
        for key in keys {
            let Some(entry) = self.peers.get_mut(&key) else {
                continue;
            };
            if !entry.state.is_connected() {
                continue;
            }
            if !entry.am_choking && !entry.peer_interested {
                trace!("Choking uninterested peer {}", entry.handle.addr);
                entry.am_choking = true;
                entry.handle.send(PeerCommand::SetChoking(true));
            } else if entry.am_choking && entry.peer_interested && used < self.config.upload_slots {
                debug!("Unchoking peer {}", entry.handle.addr);
                entry.am_choking = false;
                entry.handle.send(PeerCommand::SetChoking(false));
                used += 1;
            }
        }
        used
    }

    /// Queue the same command for every connected peer
    pub fn broadcast(&self, command: PeerCommand) {
        for entry in self.peers.values().filter(|p| p.state.is_connected()) {
            entry.handle.send(command.clone());
        }
    }

    pub fn is_blacklisted(&self, addr: &SocketAddr) -> bool {
        self.blacklist.contains(addr)
    }

    /// Queue a command for one peer
    pub fn send(&self, key: PeerKey, command: PeerCommand) -> bool {
        self.peers.get(&key).map(|p| p.handle.send(command)).unwrap_or(false)
    }

    /// Peers that accept requests, with their bitfields, in key order
    pub fn requestable(&self) -> Vec<(PeerKey, &Bitfield)> {
        let mut peers: Vec<_> = self
            .peers
            .iter()
            .filter(|(_, p)| p.state.can_request())
            .map(|(k, p)| (*k, &p.bitfield))
            .collect();
        peers.sort_by_key(|(k, _)| *k);
        peers
    }

    pub fn availability(&self) -> &[u32] {
        &self.availability
    }

    pub fn addr_of(&self, key: PeerKey) -> Option<SocketAddr> {
        self.peers.get(&key).map(|p| p.handle.addr)
    }

    /// Connection tasks, including those still dialing
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Peers past the handshake
    pub fn connected_count(&self) -> usize {
        self.peers.values().filter(|p| p.state.is_connected()).count()
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    pub fn peer_views(&self) -> Vec<PeerView> {
        let mut views: Vec<_> = self
            .peers
            .iter()
            .map(|(key, p)| PeerView {
                key: *key,
                addr: p.handle.addr,
                source: p.source,
                state: p.state,
                pieces: p.bitfield.count(),
                uploading: !p.am_choking,
            })
            .collect();
        views.sort_by_key(|v| v.key);
        views
    }

    /// Stop every connection task: ask nicely, wait up to `grace`, then abort
    pub async fn shutdown(&mut self, grace: Duration) {
        self.candidates.clear();
        self.known.clear();
        self.departed.clear();
        let entries: Vec<PeerEntry> = self.peers.drain().map(|(_, e)| e).collect();
        self.availability.iter_mut().for_each(|a| *a = 0);
        if entries.is_empty() {
            return;
        }
        info!("Disconnecting {} peers", entries.len());

        let mut tasks = Vec::with_capacity(entries.len());
        for entry in entries {
            entry.handle.send(PeerCommand::Shutdown);
            tasks.push(entry.handle.into_task());
        }
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let joined = tokio::time::timeout(grace, async {
            for task in tasks {
                let _ = task.await;
            }
        })
        .await;
        if joined.is_err() {
            warn!("Peer tasks did not stop within {:?}, aborting", grace);
            for abort in aborts {
                abort.abort();
            }
        }
    }
}
