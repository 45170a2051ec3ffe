//! Error types for the streaming engine
//!
//! One error enum covers every component. Session-level code works with
//! `anyhow::Result` and recovers the category through [`TorrentError::kind_of`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse error category, carried on `error(kind, detail)` session events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    InvalidSource,
    MetadataTimeout,
    HandshakeMismatch,
    PieceHashMismatch,
    RequestTimeout,
    ReadTimeout,
    NotReady,
    StoreIoFailure,
    Parse,
    Protocol,
    Peer,
    Network,
    Tracker,
    Config,
    Validation,
    Cancelled,
    NoSession,
    FileNotFound,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidSource => "InvalidSource",
            ErrorKind::MetadataTimeout => "MetadataTimeout",
            ErrorKind::HandshakeMismatch => "HandshakeMismatch",
            ErrorKind::PieceHashMismatch => "PieceHashMismatch",
            ErrorKind::RequestTimeout => "RequestTimeout",
            ErrorKind::ReadTimeout => "ReadTimeout",
            ErrorKind::NotReady => "NotReady",
            ErrorKind::StoreIoFailure => "StoreIOFailure",
            ErrorKind::Parse => "Parse",
            ErrorKind::Protocol => "Protocol",
            ErrorKind::Peer => "Peer",
            ErrorKind::Network => "Network",
            ErrorKind::Tracker => "Tracker",
            ErrorKind::Config => "Config",
            ErrorKind::Validation => "Validation",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::NoSession => "NoSession",
            ErrorKind::FileNotFound => "FileNotFound",
        };
        f.write_str(name)
    }
}

/// Comprehensive error type for torrent operations
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Malformed magnet link, URL or metainfo. Fatal to `start()`.
    InvalidSource {
        message: String,
        source: Option<String>,
    },

    /// Metadata could not be resolved within the configured bound
    MetadataTimeout {
        info_hash: String,
        waited_secs: u64,
    },

    /// Remote handshake carried a different info hash
    HandshakeMismatch {
        peer: String,
        expected: String,
        received: String,
    },

    /// Assembled piece did not match its expected SHA-1
    PieceHashMismatch {
        piece: u32,
    },

    /// A block request went unanswered
    RequestTimeout {
        piece: u32,
        offset: u32,
        peer: Option<String>,
    },

    /// A stream read waited longer than its timeout
    ReadTimeout {
        piece: u32,
        waited_ms: u64,
    },

    /// Piece is not verified yet
    NotReady {
        piece: u32,
    },

    /// Backend read or write failure. Fatal to the session.
    StoreIoFailure {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// Bencode or metainfo parsing errors
    ParseError {
        message: String,
        source: Option<String>,
    },

    /// Peer wire protocol violations
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// Peer connection errors
    PeerError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// Network errors
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Tracker announce errors
    TrackerError {
        message: String,
        tracker: Option<String>,
        source: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// Validation errors
    ValidationError {
        message: String,
        field: Option<String>,
    },

    /// Operation aborted by cancel() or session teardown
    Cancelled {
        message: String,
    },

    /// No torrent is active
    NoSession,

    /// Requested file is not part of the torrent
    FileNotFound {
        path: String,
    },
}

impl TorrentError {
    /// Create a new InvalidSource error
    pub fn invalid_source(message: impl Into<String>) -> Self {
        TorrentError::InvalidSource {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new InvalidSource error with source
    pub fn invalid_source_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::InvalidSource {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new MetadataTimeout error
    pub fn metadata_timeout(info_hash: &[u8; 20], waited: std::time::Duration) -> Self {
        TorrentError::MetadataTimeout {
            info_hash: hex::encode(info_hash),
            waited_secs: waited.as_secs(),
        }
    }

    /// Create a new HandshakeMismatch error
    pub fn handshake_mismatch(peer: impl Into<String>, expected: &[u8; 20], received: &[u8; 20]) -> Self {
        TorrentError::HandshakeMismatch {
            peer: peer.into(),
            expected: hex::encode(expected),
            received: hex::encode(received),
        }
    }

    /// Create a new NotReady error
    pub fn not_ready(piece: u32) -> Self {
        TorrentError::NotReady { piece }
    }

    pub fn piece_hash_mismatch(piece: u32) -> Self {
        TorrentError::PieceHashMismatch { piece }
    }

    /// Create a new RequestTimeout error
    pub fn request_timeout(piece: u32, offset: u32, peer: Option<String>) -> Self {
        TorrentError::RequestTimeout { piece, offset, peer }
    }

    /// Create a new ReadTimeout error
    pub fn read_timeout(piece: u32, waited: std::time::Duration) -> Self {
        TorrentError::ReadTimeout {
            piece,
            waited_ms: waited.as_millis() as u64,
        }
    }

    /// Create a new StoreIoFailure
    pub fn storage_error(message: impl Into<String>) -> Self {
        TorrentError::StoreIoFailure {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new StoreIoFailure with path and source
    pub fn storage_error_full(message: impl Into<String>, path: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::StoreIoFailure {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ParseError
    pub fn parse_error(message: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ParseError with source
    pub fn parse_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new ProtocolError
    pub fn protocol_error(message: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ProtocolError with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new PeerError with peer address
    pub fn peer_error_with_peer(message: impl Into<String>, peer: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    /// Create a new PeerError with peer and source
    pub fn peer_error_full(message: impl Into<String>, peer: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new NetworkError
    pub fn network_error(message: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: None,
            source: None,
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new TrackerError
    pub fn tracker_error(message: impl Into<String>, tracker: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            tracker: Some(tracker.into()),
            source: None,
        }
    }

    /// Create a new TrackerError with source
    pub fn tracker_error_full(message: impl Into<String>, tracker: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            tracker: Some(tracker.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new ValidationError
    pub fn validation_error(message: impl Into<String>) -> Self {
        TorrentError::ValidationError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ValidationError with field
    pub fn validation_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new Cancelled error
    pub fn cancelled(message: impl Into<String>) -> Self {
        TorrentError::Cancelled {
            message: message.into(),
        }
    }

    /// Create a new FileNotFound error
    pub fn file_not_found(path: impl Into<String>) -> Self {
        TorrentError::FileNotFound { path: path.into() }
    }

    /// The category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            TorrentError::InvalidSource { .. } => ErrorKind::InvalidSource,
            TorrentError::MetadataTimeout { .. } => ErrorKind::MetadataTimeout,
            TorrentError::HandshakeMismatch { .. } => ErrorKind::HandshakeMismatch,
            TorrentError::PieceHashMismatch { .. } => ErrorKind::PieceHashMismatch,
            TorrentError::RequestTimeout { .. } => ErrorKind::RequestTimeout,
            TorrentError::ReadTimeout { .. } => ErrorKind::ReadTimeout,
            TorrentError::NotReady { .. } => ErrorKind::NotReady,
            TorrentError::StoreIoFailure { .. } => ErrorKind::StoreIoFailure,
            TorrentError::ParseError { .. } => ErrorKind::Parse,
            TorrentError::ProtocolError { .. } => ErrorKind::Protocol,
            TorrentError::PeerError { .. } => ErrorKind::Peer,
            TorrentError::NetworkError { .. } => ErrorKind::Network,
            TorrentError::TrackerError { .. } => ErrorKind::Tracker,
            TorrentError::ConfigError { .. } => ErrorKind::Config,
            TorrentError::ValidationError { .. } => ErrorKind::Validation,
            TorrentError::Cancelled { .. } => ErrorKind::Cancelled,
            TorrentError::NoSession => ErrorKind::NoSession,
            TorrentError::FileNotFound { .. } => ErrorKind::FileNotFound,
        }
    }

    /// Recover the category of an `anyhow::Error`, looking through its context chain
    pub fn kind_of(err: &anyhow::Error) -> Option<ErrorKind> {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<TorrentError>())
            .map(TorrentError::kind)
    }

    /// Whether `err` carries a TorrentError of the given kind
    pub fn is_kind(err: &anyhow::Error, kind: ErrorKind) -> bool {
        Self::kind_of(err) == Some(kind)
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        let append = |source: &mut Option<String>| {
            *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
        };
        match &mut self {
            TorrentError::InvalidSource { source, .. }
            | TorrentError::StoreIoFailure { source, .. }
            | TorrentError::ParseError { source, .. }
            | TorrentError::ProtocolError { source, .. }
            | TorrentError::PeerError { source, .. }
            | TorrentError::NetworkError { source, .. }
            | TorrentError::TrackerError { source, .. } => append(source),
            _ => {}
        }
        self
    }
}

fn write_with(f: &mut fmt::Formatter<'_>, label: &str, message: &str, extras: &[(&str, &Option<String>)]) -> fmt::Result {
    write!(f, "{}: {}", label, message)?;
    let present: Vec<String> = extras
        .iter()
        .filter_map(|(name, value)| value.as_ref().map(|v| format!("{}: {}", name, v)))
        .collect();
    if !present.is_empty() {
        write!(f, " ({})", present.join(", "))?;
    }
    Ok(())
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::InvalidSource { message, source } => {
                write_with(f, "Invalid source", message, &[("source", source)])
            }
            TorrentError::MetadataTimeout { info_hash, waited_secs } => {
                write!(f, "Metadata timeout: {} not resolved after {}s", info_hash, waited_secs)
            }
            TorrentError::HandshakeMismatch { peer, expected, received } => {
                write!(f, "Handshake mismatch with {}: expected {}, got {}", peer, expected, received)
            }
            TorrentError::PieceHashMismatch { piece } => {
                write!(f, "Piece hash mismatch: piece {}", piece)
            }
            TorrentError::RequestTimeout { piece, offset, peer } => match peer {
                Some(p) => write!(f, "Request timeout: piece {} offset {} (peer: {})", piece, offset, p),
                None => write!(f, "Request timeout: piece {} offset {}", piece, offset),
            },
            TorrentError::ReadTimeout { piece, waited_ms } => {
                write!(f, "Read timeout: piece {} not available after {}ms", piece, waited_ms)
            }
            TorrentError::NotReady { piece } => write!(f, "Piece {} not ready", piece),
            TorrentError::StoreIoFailure { message, path, source } => {
                write_with(f, "Storage error", message, &[("path", path), ("source", source)])
            }
            TorrentError::ParseError { message, source } => {
                write_with(f, "Parse error", message, &[("source", source)])
            }
            TorrentError::ProtocolError { message, source } => {
                write_with(f, "Protocol error", message, &[("source", source)])
            }
            TorrentError::PeerError { message, peer, source } => {
                write_with(f, "Peer error", message, &[("peer", peer), ("source", source)])
            }
            TorrentError::NetworkError { message, address, source } => {
                write_with(f, "Network error", message, &[("address", address), ("source", source)])
            }
            TorrentError::TrackerError { message, tracker, source } => {
                write_with(f, "Tracker error", message, &[("tracker", tracker), ("source", source)])
            }
            TorrentError::ConfigError { message, field } => {
                write_with(f, "Config error", message, &[("field", field)])
            }
            TorrentError::ValidationError { message, field } => {
                write_with(f, "Validation error", message, &[("field", field)])
            }
            TorrentError::Cancelled { message } => write!(f, "Cancelled: {}", message),
            TorrentError::NoSession => write!(f, "No active torrent"),
            TorrentError::FileNotFound { path } => write!(f, "File not found: {}", path),
        }
    }
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::storage_error_full(err.to_string(), "unknown".to_string(), err.kind().to_string())
    }
}

impl From<serde_bencode::Error> for TorrentError {
    fn from(err: serde_bencode::Error) -> Self {
        TorrentError::parse_error_with_source("Failed to encode bencode data", err.to_string())
    }
}

impl From<serde_json::Error> for TorrentError {
    fn from(err: serde_json::Error) -> Self {
        TorrentError::parse_error_with_source("Failed to encode JSON data", err.to_string())
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::network_error_full("Failed to parse address", "unknown".to_string(), err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        TorrentError::network_error("Operation timed out")
    }
}

impl From<reqwest::Error> for TorrentError {
    fn from(err: reqwest::Error) -> Self {
        let address = err.url().map(|u| u.to_string()).unwrap_or_else(|| "unknown".to_string());
        TorrentError::network_error_full("HTTP request failed", address, err.to_string())
    }
}

impl From<url::ParseError> for TorrentError {
    fn from(err: url::ParseError) -> Self {
        TorrentError::invalid_source_with_source("Malformed URL", err.to_string())
    }
}
