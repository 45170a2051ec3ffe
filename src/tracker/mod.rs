//! Tracker announces
//!
//! Peer discovery through HTTP(S) and UDP trackers. Failures are logged and
//! never fatal to a session.

pub mod http;
pub mod udp;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::TorrentError;

/// Floor and ceiling for tracker-provided re-announce intervals
pub const MIN_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);
pub const MAX_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    None,
    Started,
    Stopped,
    Completed,
}

impl TrackerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::None => "",
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
        }
    }

    pub fn as_udp_id(&self) -> u32 {
        match self {
            TrackerEvent::None => 0,
            TrackerEvent::Completed => 1,
            TrackerEvent::Started => 2,
            TrackerEvent::Stopped => 3,
        }
    }
}

/// Parameters shared by both tracker transports
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: TrackerEvent,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// Seconds the tracker asks us to wait before re-announcing
    pub interval: u32,
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
    pub peers: Vec<SocketAddr>,
}

impl AnnounceResponse {
    /// Re-announce delay, clamped to sane bounds
    pub fn next_announce(&self) -> Duration {
        Duration::from_secs(self.interval as u64).clamp(MIN_ANNOUNCE_INTERVAL, MAX_ANNOUNCE_INTERVAL)
    }
}

/// Compact IPv4 peers: 4-byte address plus 2-byte port
pub fn parse_compact_peers(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            SocketAddr::new(IpAddr::V4(ip), u16::from_be_bytes([c[4], c[5]]))
        })
        .filter(|addr| addr.port() != 0)
        .collect()
}

/// Compact IPv6 peers: 16-byte address plus 2-byte port
pub fn parse_compact_peers6(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(18)
        .map(|c| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&c[..16]);
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), u16::from_be_bytes([c[16], c[17]]))
        })
        .filter(|addr| addr.port() != 0)
        .collect()
}

/// Announce to one tracker, picking the transport from the URL scheme
pub async fn announce(url: &str, request: &AnnounceRequest) -> Result<AnnounceResponse> {
    let scheme = url.split("://").next().unwrap_or_default().to_ascii_lowercase();
    match scheme.as_str() {
        "http" | "https" => http::announce(url, request).await,
        "udp" => udp::announce(url, request).await,
        _ => Err(TorrentError::tracker_error("Unsupported tracker scheme", url).into()),
    }
}

/// Announce to every tracker concurrently and merge the peer lists.
///
/// Returns the merged peers and the shortest clamped re-announce interval.
pub async fn announce_all(urls: &[String], request: &AnnounceRequest) -> (Vec<SocketAddr>, Duration) {
    let mut tasks = JoinSet::new();
    for url in urls {
        let url = url.clone();
        let request = request.clone();
        tasks.spawn(async move {
            let result = announce(&url, &request).await;
            (url, result)
        });
    }

    let mut peers = Vec::new();
    let mut next = MAX_ANNOUNCE_INTERVAL;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((url, Ok(response))) => {
                info!("Tracker {} returned {} peers", url, response.peers.len());
                next = next.min(response.next_announce());
                for peer in response.peers {
                    if !peers.contains(&peer) {
                        peers.push(peer);
                    }
                }
            }
            Ok((url, Err(e))) => warn!("Announce to {} failed: {}", url, e),
            Err(e) => debug!("Announce task ended abnormally: {}", e),
        }
    }
    (peers, next)
}
