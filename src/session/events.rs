//! Session events and the serializable views they carry

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, TorrentError};
use crate::torrent::{FileEntry, TorrentInfo};

/// The torrent as pushed to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TorrentSummary {
    /// Magnet link or metainfo URL the session was started from
    pub url: Option<String>,
    pub name: String,
    pub comment: Option<String>,
    pub info_hash: String,
    pub files: Vec<FileEntry>,
}

impl TorrentSummary {
    pub fn new(info: &TorrentInfo, url: Option<String>) -> Self {
        Self {
            url,
            name: info.name.clone(),
            comment: info.comment.clone(),
            info_hash: info.info_hash_hex(),
            files: info.file_entries(),
        }
    }
}

/// `torrent_info()` result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TorrentMeta {
    pub name: String,
    pub comment: Option<String>,
    pub info_hash: String,
}

impl From<&TorrentInfo> for TorrentMeta {
    fn from(info: &TorrentInfo) -> Self {
        Self {
            name: info.name.clone(),
            comment: info.comment.clone(),
            info_hash: info.info_hash_hex(),
        }
    }
}

/// Point-in-time download statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    /// Peers past the handshake
    pub peers: usize,
    /// Connection tasks, including those still dialing
    pub connections: usize,
    pub candidates: usize,
    pub verified_pieces: usize,
    pub total_pieces: usize,
    /// 0.0 ..= 1.0
    pub progress: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    /// Bytes per second over the last progress interval
    pub download_rate: f64,
    /// Bytes served to peers
    pub uploaded_bytes: u64,
    pub open_streams: usize,
}

/// Everything observers of the session are told
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SessionEvent {
    /// Metadata resolved and storage ready
    Ready { torrent: TorrentSummary },
    FilesChanged { files: Vec<FileEntry> },
    Progress { stats: SessionStats },
    /// Session-fatal failure; the session is torn down after this
    Error { kind: ErrorKind, detail: String },
    NoTorrent,
    #[serde(rename_all = "camelCase")]
    TorrentRemoved { info_hash: String },
    /// `start()` failed before a session existed
    BadTorrent { kind: ErrorKind, detail: String },
}

impl SessionEvent {
    /// Error event for an `anyhow::Error`, keeping its category
    pub fn error(err: &anyhow::Error) -> Self {
        SessionEvent::Error {
            kind: TorrentError::kind_of(err).unwrap_or(ErrorKind::StoreIoFailure),
            detail: err.to_string(),
        }
    }

    pub fn bad_torrent(err: &anyhow::Error) -> Self {
        SessionEvent::BadTorrent {
            kind: TorrentError::kind_of(err).unwrap_or(ErrorKind::InvalidSource),
            detail: format!("{:#}", err),
        }
    }

    /// Wire name, as used in the `event` field
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Ready { .. } => "ready",
            SessionEvent::FilesChanged { .. } => "filesChanged",
            SessionEvent::Progress { .. } => "progress",
            SessionEvent::Error { .. } => "error",
            SessionEvent::NoTorrent => "noTorrent",
            SessionEvent::TorrentRemoved { .. } => "torrentRemoved",
            SessionEvent::BadTorrent { .. } => "badTorrent",
        }
    }

    /// One JSON line
    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string(self).map_err(|e| TorrentError::from(e).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::fixtures;
    use serde_json::Value;

    #[test]
    fn test_ready_event_shape() {
        let fixture = fixtures::multi_file("show", &[("s01/e01.mkv", b"abc"), ("s01/e02.mkv", b"defg")], 16384);
        let summary = TorrentSummary::new(&fixture.info, Some("magnet:?xt=urn:btih:x".to_string()));
        let event = SessionEvent::Ready { torrent: summary };
        let json: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();

        assert_eq!(json["event"], "ready");
        assert_eq!(json["torrent"]["name"], "show");
        assert_eq!(json["torrent"]["comment"], "fixture comment");
        assert_eq!(json["torrent"]["infoHash"], fixture.info.info_hash_hex());
        assert_eq!(json["torrent"]["files"][1]["name"], "e02.mkv");
        assert_eq!(json["torrent"]["files"][1]["path"], "show/s01/e02.mkv");
        assert_eq!(json["torrent"]["files"][1]["length"], 4);
    }

    #[test]
    fn test_simple_events() {
        assert_eq!(SessionEvent::NoTorrent.to_json().unwrap(), r#"{"event":"noTorrent"}"#);
        let removed = SessionEvent::TorrentRemoved {
            info_hash: "ab".to_string(),
        };
        assert_eq!(removed.to_json().unwrap(), r#"{"event":"torrentRemoved","infoHash":"ab"}"#);
        assert_eq!(removed.name(), "torrentRemoved");
    }

    #[test]
    fn test_error_event_keeps_kind() {
        let err: anyhow::Error = TorrentError::storage_error("disk full").into();
        let json: Value = serde_json::from_str(&SessionEvent::error(&err).to_json().unwrap()).unwrap();
        assert_eq!(json["event"], "error");
        assert_eq!(json["kind"], "storeIoFailure");

        let err: anyhow::Error = TorrentError::metadata_timeout(&[1; 20], std::time::Duration::from_secs(60)).into();
        match SessionEvent::bad_torrent(&err) {
            SessionEvent::BadTorrent { kind, .. } => assert_eq!(kind, ErrorKind::MetadataTimeout),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stats_camel_case() {
        let stats = SessionStats {
            verified_pieces: 3,
            download_rate: 1.5,
            ..SessionStats::default()
        };
        let json: Value = serde_json::to_value(SessionEvent::Progress { stats }).unwrap();
        assert_eq!(json["stats"]["verifiedPieces"], 3);
        assert_eq!(json["stats"]["downloadRate"], 1.5);
    }
}
