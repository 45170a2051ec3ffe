//! Torrent session
//!
//! A [`TorrentSession`] owns one torrent from metadata resolution until
//! `stop()`: the piece store, the engine task driving the swarm, and the
//! file/stream interface handed to consumers through [`SessionHandle`].

pub mod engine;
pub mod events;
pub mod manager;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{SessionConfig, StorageMode};
use crate::error::{ErrorKind, TorrentError};
use crate::peer::metadata::fetch_from_peers;
use crate::peer::{PeerInfo, PeerSource};
use crate::protocol::Handshake;
use crate::storage::{DiskBackend, MemoryBackend, PieceStore, StorageBackend};
use crate::stream::{DemandUpdate, FileStream};
use crate::torrent::{FileEntry, MagnetInfo, ParsedSource, TorrentFile, TorrentInfo, TorrentParser, TorrentSource};
use crate::tracker::{self, AnnounceRequest, TrackerEvent};

use engine::{EngineCommand, EngineSetup};
pub use events::{SessionEvent, SessionStats, TorrentMeta, TorrentSummary};
pub use manager::SessionManager;

/// Pause between metadata attempts while the swarm is still empty
const METADATA_RETRY: Duration = Duration::from_secs(5);

struct SessionInner {
    info: Arc<TorrentInfo>,
    url: Option<String>,
    store: Arc<PieceStore>,
    commands: mpsc::Sender<EngineCommand>,
    demand: mpsc::UnboundedSender<DemandUpdate>,
    stats: watch::Receiver<SessionStats>,
    next_stream: AtomicU64,
    readahead: usize,
}

/// Cheap, cloneable access to a running session
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("torrent", &self.inner.info.name)
            .field("info_hash", &self.inner.info.info_hash_hex())
            .finish()
    }
}

impl SessionHandle {
    pub fn info(&self) -> &Arc<TorrentInfo> {
        &self.inner.info
    }

    pub fn info_hash_hex(&self) -> String {
        self.inner.info.info_hash_hex()
    }

    pub fn list_files(&self) -> Vec<FileEntry> {
        self.inner.info.file_entries()
    }

    pub fn torrent_info(&self) -> TorrentMeta {
        TorrentMeta::from(self.inner.info.as_ref())
    }

    pub fn summary(&self) -> TorrentSummary {
        TorrentSummary::new(&self.inner.info, self.inner.url.clone())
    }

    /// File by its last path component; the last match wins when names repeat
    pub fn find_file(&self, name: &str) -> Option<TorrentFile> {
        self.inner.info.file_by_name(name).cloned()
    }

    pub fn stats(&self) -> SessionStats {
        self.inner.stats.borrow().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.store.is_closed()
    }

    /// Stream `length` bytes (rest of the file when `None`) of the file at
    /// `path`, starting at `offset`
    pub fn open_file_stream(&self, path: &str, offset: u64, length: Option<u64>) -> Result<FileStream> {
        if self.inner.store.is_closed() {
            return Err(TorrentError::cancelled("Session stopped").into());
        }
        let file = self
            .inner
            .info
            .file_by_path(path)
            .ok_or_else(|| TorrentError::file_not_found(path))?;
        let id = self.inner.next_stream.fetch_add(1, Ordering::Relaxed);
        FileStream::open(
            id,
            self.inner.store.clone(),
            self.inner.demand.clone(),
            file,
            offset,
            length,
            self.inner.readahead,
        )
    }

    /// Queue manually supplied peers
    pub async fn add_peers(&self, addrs: Vec<SocketAddr>) -> Result<()> {
        self.inner
            .commands
            .send(EngineCommand::AddPeers(addrs))
            .await
            .map_err(|_| TorrentError::cancelled("Session stopped").into())
    }
}

/// One active torrent
pub struct TorrentSession {
    handle: SessionHandle,
    task: Option<JoinHandle<()>>,
    grace: Duration,
}

/// Metadata plus the discovery state gathered while resolving it
struct Resolved {
    info: TorrentInfo,
    url: Option<String>,
    trackers: Vec<String>,
    peers: Vec<PeerInfo>,
}

impl TorrentSession {
    /// Resolve `source`, open storage and start the engine.
    ///
    /// Emits `ready` and `filesChanged` on success. Fails with `InvalidSource`
    /// for malformed input and `MetadataTimeout` when a magnet link cannot be
    /// resolved in time.
    pub async fn start(source: TorrentSource, config: SessionConfig, events: broadcast::Sender<SessionEvent>) -> Result<Self> {
        config.validate()?;
        info!("Starting session from {}", source.describe());
        let peer_id = Handshake::generate_peer_id();
        let resolved = resolve(&source, &config, peer_id).await?;
        let info = Arc::new(resolved.info);

        let backend: Arc<dyn StorageBackend> = match config.storage {
            StorageMode::Disk => Arc::new(DiskBackend::new(&config.download_dir, info.clone())),
            StorageMode::Memory => Arc::new(MemoryBackend::new()),
        };
        let store = Arc::new(PieceStore::open(info.clone(), backend).await?);

        let listener = if config.accept_incoming {
            match TcpListener::bind(("0.0.0.0", config.listen_port)).await {
                Ok(listener) => Some(listener),
                Err(e) => {
                    warn!("Cannot listen on port {}: {}", config.listen_port, e);
                    None
                }
            }
        } else {
            None
        };

        let readahead = config.readahead_pieces;
        let grace = config.stop_grace;
        let engine = engine::spawn(EngineSetup {
            store: store.clone(),
            config,
            peer_id,
            trackers: resolved.trackers,
            peers: resolved.peers,
            listener,
            events: events.clone(),
        });

        let handle = SessionHandle {
            inner: Arc::new(SessionInner {
                info: info.clone(),
                url: resolved.url,
                store,
                commands: engine.commands,
                demand: engine.demand,
                stats: engine.stats,
                next_stream: AtomicU64::new(1),
                readahead,
            }),
        };
        info!(
            "Torrent ready: {} ({} files, {} bytes, info hash {})",
            info.name,
            info.files.len(),
            info.total_size(),
            info.info_hash_hex()
        );
        let _ = events.send(SessionEvent::Ready {
            torrent: handle.summary(),
        });
        let _ = events.send(SessionEvent::FilesChanged {
            files: handle.list_files(),
        });
        Ok(Self {
            handle,
            task: Some(engine.task),
            grace,
        })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Engine still running
    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Cancel pending reads, disconnect every peer, then discard piece data
    pub async fn stop(mut self) -> Result<()> {
        let inner = self.handle.inner.clone();
        info!("Stopping session for {}", inner.info.name);
        inner.store.close();

        let (reply, done) = oneshot::channel();
        if inner.commands.send(EngineCommand::Shutdown(reply)).await.is_ok() {
            if timeout(self.grace + Duration::from_secs(1), done).await.is_err() {
                warn!("Engine did not acknowledge shutdown within {:?}", self.grace);
            }
        }
        if let Some(task) = self.task.take() {
            let abort = task.abort_handle();
            if timeout(self.grace, task).await.is_err() {
                warn!("Aborting engine task for {}", inner.info.name);
                abort.abort();
            }
        }

        inner.store.discard().await?;
        debug!("Session for {} stopped", inner.info.name);
        Ok(())
    }
}

impl std::fmt::Debug for TorrentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentSession")
            .field("handle", &self.handle)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for TorrentSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            self.handle.inner.store.close();
            task.abort();
        }
    }
}

/// Malformed metainfo is the caller's fault, whatever layer noticed it
fn as_invalid_source(err: anyhow::Error) -> anyhow::Error {
    match TorrentError::kind_of(&err) {
        Some(ErrorKind::Parse) | Some(ErrorKind::Validation) => {
            TorrentError::invalid_source_with_source("Malformed metainfo", format!("{:#}", err)).into()
        }
        _ => err,
    }
}

async fn resolve(source: &TorrentSource, config: &SessionConfig, peer_id: [u8; 20]) -> Result<Resolved> {
    let manual = config.initial_peers.iter().map(|a| PeerInfo::new(*a, PeerSource::Manual));
    match source.parse(&config.fetch).await.map_err(as_invalid_source)? {
        ParsedSource::Metadata { info, url } => Ok(Resolved {
            trackers: info.announce_list.clone(),
            peers: manual.collect(),
            info,
            url,
        }),
        ParsedSource::Magnet { magnet, url } => {
            let limit = config.metadata_timeout;
            let (info, discovered) = timeout(limit, resolve_magnet(&magnet, config, peer_id))
                .await
                .map_err(|_| TorrentError::metadata_timeout(&magnet.info_hash, limit))??;

            let mut trackers = info.announce_list.clone();
            for tracker in &magnet.trackers {
                if !trackers.contains(tracker) {
                    trackers.push(tracker.clone());
                }
            }
            let mut peers: Vec<PeerInfo> = manual.collect();
            peers.extend(magnet.peers.iter().map(|a| PeerInfo::new(*a, PeerSource::Magnet)));
            peers.extend(discovered.into_iter().map(|a| PeerInfo::new(a, PeerSource::Tracker)));
            Ok(Resolved {
                info,
                url: Some(url),
                trackers,
                peers,
            })
        }
    }
}

/// Fetch the info dictionary from the swarm; runs until it succeeds
async fn resolve_magnet(magnet: &MagnetInfo, config: &SessionConfig, peer_id: [u8; 20]) -> Result<(TorrentInfo, Vec<std::net::SocketAddr>)> {
    info!("Resolving metadata for {}", hex::encode(magnet.info_hash));
    let mut candidates: Vec<SocketAddr> = config.initial_peers.clone();
    candidates.extend(magnet.peers.iter().copied());
    let mut discovered = Vec::new();
    let announce = config.announce && !magnet.trackers.is_empty();

    loop {
        if announce {
            let request = AnnounceRequest {
                info_hash: magnet.info_hash,
                peer_id,
                port: config.listen_port,
                uploaded: 0,
                downloaded: 0,
                left: magnet.total_size.unwrap_or(1),
                event: TrackerEvent::Started,
            };
            let (peers, _) = tracker::announce_all(&magnet.trackers, &request).await;
            for peer in peers {
                if !candidates.contains(&peer) {
                    candidates.push(peer);
                    discovered.push(peer);
                }
            }
        }

        match fetch_from_peers(&candidates, magnet.info_hash, peer_id, config.connect_timeout).await {
            Ok(bytes) => {
                let mut info = TorrentParser::parse_info_dict(&bytes, &magnet.info_hash).map_err(as_invalid_source)?;
                if info.announce_list.is_empty() {
                    info.announce_list = magnet.trackers.clone();
                }
                return Ok((info, discovered));
            }
            Err(e) => {
                debug!("Metadata not available yet: {}", e);
                tokio::time::sleep(METADATA_RETRY).await;
            }
        }
    }
}
