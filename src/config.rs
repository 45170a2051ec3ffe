//! Session configuration
//!
//! Tunables for one torrent session, with defaults matching a browser-facing
//! streaming server (large swarm, small readahead).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::error::TorrentError;

/// Where verified pieces are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Sparse files under `download_dir/<info hash>/`
    Disk,
    /// Pieces held in memory, dropped on stop
    Memory,
}

/// Bounds for fetching a `.torrent` over HTTP(S)
#[derive(Debug, Clone)]
pub struct FetchLimits {
    /// Largest accepted metainfo body
    pub max_metainfo_bytes: u64,
    /// Redirects followed before giving up
    pub max_redirects: usize,
    /// Whole-request timeout
    pub fetch_timeout: Duration,
}

impl Default for FetchLimits {
    fn default() -> Self {
        Self {
            max_metainfo_bytes: 10 * 1024 * 1024,
            max_redirects: 5,
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration for a torrent session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Root directory for disk storage
    pub download_dir: PathBuf,
    /// Port for incoming peer connections and tracker announces
    pub listen_port: u16,
    /// Accept incoming peer connections on `listen_port`
    pub accept_incoming: bool,
    /// Target number of peer connections
    pub max_connections: usize,
    /// Outstanding block requests per peer
    pub max_inflight_per_peer: usize,
    /// Interested peers unchoked at once; 0 disables uploads
    pub upload_slots: usize,
    /// Peers a piece may be requested from concurrently outside endgame
    pub duplicate_request_cap: usize,
    /// Endgame starts when fewer than this many pieces are missing
    pub endgame_threshold: usize,
    /// Pieces past the current read position registered as stream demand
    pub readahead_pieces: usize,
    /// Unanswered block requests are reassigned after this
    pub request_timeout: Duration,
    /// TCP connect plus handshake bound
    pub connect_timeout: Duration,
    /// Bound on magnet metadata resolution
    pub metadata_timeout: Duration,
    /// Hash failures before a peer is blacklisted
    pub max_hash_failures: u32,
    /// Grace period for peer tasks during stop()
    pub stop_grace: Duration,
    /// Storage backend
    pub storage: StorageMode,
    /// HTTP metainfo fetch bounds
    pub fetch: FetchLimits,
    /// Announce to trackers
    pub announce: bool,
    /// Peers to connect to in addition to tracker results
    pub initial_peers: Vec<SocketAddr>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            download_dir: std::env::temp_dir().join("torrent-web"),
            listen_port: 6881,
            accept_incoming: false,
            max_connections: 200,
            max_inflight_per_peer: 16,
            upload_slots: 10,
            duplicate_request_cap: 3,
            endgame_threshold: 4,
            readahead_pieces: 4,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            metadata_timeout: Duration::from_secs(60),
            max_hash_failures: 3,
            stop_grace: Duration::from_secs(5),
            storage: StorageMode::Disk,
            fetch: FetchLimits::default(),
            announce: true,
            initial_peers: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// In-memory configuration without tracker traffic, used by tests and embedders
    pub fn in_memory() -> Self {
        Self {
            storage: StorageMode::Memory,
            announce: false,
            ..Self::default()
        }
    }

    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    pub fn with_storage(mut self, storage: StorageMode) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_upload_slots(mut self, slots: usize) -> Self {
        self.upload_slots = slots;
        self
    }

    pub fn with_metadata_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_timeout = timeout;
        self
    }

    pub fn with_initial_peers(mut self, peers: Vec<SocketAddr>) -> Self {
        self.initial_peers = peers;
        self
    }

    pub fn with_announce(mut self, announce: bool) -> Self {
        self.announce = announce;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.listen_port == 0 && self.accept_incoming {
            return Err(TorrentError::config_error_with_field("Port cannot be 0 when accepting connections", "listen_port").into());
        }

        if self.max_connections == 0 {
            return Err(TorrentError::config_error_with_field("max_connections must be at least 1", "max_connections").into());
        }

        if self.max_inflight_per_peer == 0 {
            return Err(TorrentError::config_error_with_field("max_inflight_per_peer must be at least 1", "max_inflight_per_peer").into());
        }

        if self.upload_slots > self.max_connections {
            return Err(TorrentError::config_error_with_field("upload_slots cannot exceed max_connections", "upload_slots").into());
        }

        if self.duplicate_request_cap == 0 {
            return Err(TorrentError::config_error_with_field("duplicate_request_cap must be at least 1", "duplicate_request_cap").into());
        }

        if self.request_timeout.is_zero() || self.connect_timeout.is_zero() || self.metadata_timeout.is_zero() {
            return Err(TorrentError::config_error_with_field("timeouts must be non-zero", "timeouts").into());
        }

        if self.max_hash_failures == 0 {
            return Err(TorrentError::config_error_with_field("max_hash_failures must be at least 1", "max_hash_failures").into());
        }

        if self.storage == StorageMode::Disk && self.download_dir.as_os_str().is_empty() {
            return Err(TorrentError::config_error_with_field("download_dir cannot be empty", "download_dir").into());
        }

        if self.fetch.max_metainfo_bytes == 0 {
            return Err(TorrentError::config_error_with_field("max_metainfo_bytes must be positive", "fetch.max_metainfo_bytes").into());
        }

        Ok(())
    }
}
