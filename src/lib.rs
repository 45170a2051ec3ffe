//! torrent-web
//!
//! A single-torrent streaming engine: resolves a magnet link or metainfo URL,
//! downloads with sequential priority around active readers, and serves the
//! torrent's files as seekable byte streams.

pub mod cli;
pub mod config;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod selector;
pub mod session;
pub mod storage;
pub mod stream;
pub mod torrent;
pub mod tracker;

pub use error::{ErrorKind, TorrentError};

pub use cli::{CliArgs, ProgressDisplay};
pub use config::{FetchLimits, SessionConfig, StorageMode};
pub use peer::{PeerConnection, PeerInfo, PeerState, SwarmManager};
pub use protocol::{Handshake, Message, MessageId};
pub use selector::{PieceSelector, SelectorConfig};
pub use session::{SessionEvent, SessionHandle, SessionManager, SessionStats, TorrentSession, TorrentSummary};
pub use storage::{PieceStore, StorageBackend};
pub use stream::{FileStream, FileStreamReader, StreamCancelHandle};
pub use torrent::{FileEntry, TorrentFile, TorrentInfo, TorrentParser, TorrentSource};
