//! HTTP tracker announces

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use reqwest::Client;
use tracing::{debug, warn};

use super::{parse_compact_peers, parse_compact_peers6, AnnounceRequest, AnnounceResponse};
use crate::error::TorrentError;
use crate::torrent::bencode;

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Largest tracker response we read
const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024;

/// Full announce URL with query parameters appended
pub fn announce_url(base: &str, request: &AnnounceRequest) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    let mut url = format!(
        "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        base,
        separator,
        urlencoding::encode_binary(&request.info_hash),
        urlencoding::encode_binary(&request.peer_id),
        request.port,
        request.uploaded,
        request.downloaded,
        request.left
    );
    let event = request.event.as_str();
    if !event.is_empty() {
        url.push_str("&event=");
        url.push_str(event);
    }
    url
}

pub async fn announce(base: &str, request: &AnnounceRequest) -> Result<AnnounceResponse> {
    let url = announce_url(base, request);
    debug!("HTTP announce: {}", url);

    let client = Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| TorrentError::tracker_error_full("Failed to build HTTP client", base, e.to_string()))?;
    let response = client
        .get(&url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| TorrentError::tracker_error_full("Announce request failed", base, e.to_string()))?;
    let body = response
        .bytes()
        .await
        .map_err(|e| TorrentError::tracker_error_full("Failed to read announce response", base, e.to_string()))?;
    if body.len() > MAX_RESPONSE_BYTES {
        return Err(TorrentError::tracker_error("Announce response too large", base).into());
    }

    parse_announce_response(&body).map_err(|e| {
        warn!("Bad announce response from {}: {}", base, e);
        e
    })
}

/// Decode a bencoded announce response
pub fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse> {
    let value = bencode::decode(body)
        .map_err(|e| TorrentError::tracker_error_full("Announce response is not bencode", "http", e.to_string()))?;
    if value.as_dict().is_none() {
        return Err(TorrentError::tracker_error("Announce response must be a dictionary", "http").into());
    }

    if let Some(reason) = value.get(b"failure reason").and_then(|v| v.as_string()) {
        return Err(TorrentError::tracker_error_full("Tracker refused announce", "http", reason).into());
    }
    if let Some(warning) = value.get(b"warning message").and_then(|v| v.as_string()) {
        warn!("Tracker warning: {}", warning);
    }

    let int = |key: &[u8]| value.get(key).and_then(|v| v.as_int()).filter(|&v| v >= 0);
    let mut response = AnnounceResponse {
        interval: int(b"interval").unwrap_or(0).min(u32::MAX as i64) as u32,
        seeders: int(b"complete").map(|v| v as u32),
        leechers: int(b"incomplete").map(|v| v as u32),
        peers: Vec::new(),
    };

    match value.get(b"peers") {
        Some(peers) if peers.as_bytes().is_some() => {
            response.peers = peers.as_bytes().map(parse_compact_peers).unwrap_or_default();
        }
        Some(peers) => {
            // non-compact form: list of {ip, port} dictionaries
            for peer in peers.as_list().unwrap_or_default() {
                let ip = peer
                    .get(b"ip")
                    .and_then(|v| v.as_string())
                    .and_then(|s| s.parse::<IpAddr>().ok());
                let port = peer
                    .get(b"port")
                    .and_then(|v| v.as_int())
                    .filter(|&p| p > 0 && p <= u16::MAX as i64);
                if let (Some(ip), Some(port)) = (ip, port) {
                    response.peers.push(SocketAddr::new(ip, port as u16));
                }
            }
        }
        None => {}
    }
    if let Some(peers6) = value.get(b"peers6").and_then(|v| v.as_bytes()) {
        response.peers.extend(parse_compact_peers6(peers6));
    }

    Ok(response)
}
