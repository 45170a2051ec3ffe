//! UDP tracker announces (BEP 15)

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::{parse_compact_peers, AnnounceRequest, AnnounceResponse};
use crate::error::TorrentError;

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;
const MAX_RETRIES: u32 = 3;

/// First retransmission timeout; doubled on every retry
const BASE_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn announce(url: &str, request: &AnnounceRequest) -> Result<AnnounceResponse> {
    let addr = resolve(url).await?;
    announce_to(addr, url, request, BASE_TIMEOUT).await
}

async fn resolve(url: &str) -> Result<SocketAddr> {
    let parsed = url::Url::parse(url).map_err(|e| TorrentError::tracker_error_full("Invalid UDP tracker URL", url, e.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| TorrentError::tracker_error("UDP tracker URL has no host", url))?;
    let port = parsed
        .port()
        .ok_or_else(|| TorrentError::tracker_error("UDP tracker URL has no port", url))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');

    let first = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| TorrentError::tracker_error_full("Failed to resolve tracker", url, e.to_string()))?
        .next();
    let addr = first.ok_or_else(|| TorrentError::tracker_error("Tracker host resolved to no addresses", url))?;
    Ok(addr)
}

/// Connect and announce exchange against a resolved tracker address
async fn announce_to(addr: SocketAddr, url: &str, request: &AnnounceRequest, base_timeout: Duration) -> Result<AnnounceResponse> {
    let bind: SocketAddr = if addr.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|e| TorrentError::tracker_error_full("Failed to bind UDP socket", url, e.to_string()))?;
    socket
        .connect(addr)
        .await
        .map_err(|e| TorrentError::tracker_error_full("Failed to connect UDP socket", url, e.to_string()))?;

    let transaction_id: u32 = rand::random();
    let mut connect = Vec::with_capacity(16);
    connect.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
    connect.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
    connect.extend_from_slice(&transaction_id.to_be_bytes());

    let reply = exchange(&socket, &connect, 16, url, base_timeout).await?;
    check_header(&reply, ACTION_CONNECT, transaction_id, url)?;
    let connection_id = read_u64(&reply[8..16]);
    trace!("UDP tracker {} connection id {:x}", url, connection_id);

    let transaction_id: u32 = rand::random();
    let key: u32 = rand::random();
    let mut packet = Vec::with_capacity(98);
    packet.extend_from_slice(&connection_id.to_be_bytes());
    packet.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    packet.extend_from_slice(&transaction_id.to_be_bytes());
    packet.extend_from_slice(&request.info_hash);
    packet.extend_from_slice(&request.peer_id);
    packet.extend_from_slice(&request.downloaded.to_be_bytes());
    packet.extend_from_slice(&request.left.to_be_bytes());
    packet.extend_from_slice(&request.uploaded.to_be_bytes());
    packet.extend_from_slice(&request.event.as_udp_id().to_be_bytes());
    packet.extend_from_slice(&0u32.to_be_bytes()); // ip: default
    packet.extend_from_slice(&key.to_be_bytes());
    packet.extend_from_slice(&(-1i32).to_be_bytes()); // num_want: default
    packet.extend_from_slice(&request.port.to_be_bytes());

    let reply = exchange(&socket, &packet, 20, url, base_timeout).await?;
    check_header(&reply, ACTION_ANNOUNCE, transaction_id, url)?;

    let response = AnnounceResponse {
        interval: read_u32(&reply[8..12]),
        leechers: Some(read_u32(&reply[12..16])),
        seeders: Some(read_u32(&reply[16..20])),
        peers: parse_compact_peers(&reply[20..]),
    };
    debug!("UDP tracker {} returned {} peers", url, response.peers.len());
    Ok(response)
}

/// Send `packet`, retrying with a doubling timeout until a reply arrives.
///
/// Error replies (action 3) may be shorter than `min_len`.
async fn exchange(socket: &UdpSocket, packet: &[u8], min_len: usize, url: &str, base_timeout: Duration) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; 4096];
    for attempt in 0..MAX_RETRIES {
        socket
            .send(packet)
            .await
            .map_err(|e| TorrentError::tracker_error_full("UDP send failed", url, e.to_string()))?;

        match timeout(base_timeout * (1 << attempt), socket.recv(&mut buf)).await {
            Ok(Ok(n)) if n >= min_len || (n >= 8 && read_u32(&buf[..4]) == ACTION_ERROR) => {
                return Ok(buf[..n].to_vec());
            }
            Ok(Ok(n)) => {
                return Err(TorrentError::tracker_error_full("UDP tracker reply too short", url, format!("{} bytes", n)).into());
            }
            Ok(Err(e)) => {
                return Err(TorrentError::tracker_error_full("UDP receive failed", url, e.to_string()).into());
            }
            Err(_) => debug!("UDP tracker {} timed out (attempt {})", url, attempt + 1),
        }
    }
    Err(TorrentError::tracker_error("UDP tracker did not respond", url).into())
}

fn check_header(reply: &[u8], action: u32, transaction_id: u32, url: &str) -> Result<()> {
    let got_action = read_u32(&reply[0..4]);
    let got_tid = read_u32(&reply[4..8]);
    if got_action == ACTION_ERROR {
        let message = String::from_utf8_lossy(&reply[8..]).to_string();
        return Err(TorrentError::tracker_error_full("Tracker refused announce", url, message).into());
    }
    if got_action != action || got_tid != transaction_id {
        return Err(TorrentError::tracker_error("UDP tracker reply does not match request", url).into());
    }
    Ok(())
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TrackerEvent;

    fn request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: [0x11; 20],
            peer_id: [0x22; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1000,
            event: TrackerEvent::Started,
        }
    }

    /// Minimal tracker answering one connect and one announce
    async fn spawn_tracker(refuse: bool) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let (n, from) = socket.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, 16);
            assert_eq!(read_u64(&buf[..8]), PROTOCOL_ID);
            let mut reply = Vec::new();
            reply.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
            reply.extend_from_slice(&buf[12..16]);
            reply.extend_from_slice(&0xdead_beef_u64.to_be_bytes());
            socket.send_to(&reply, from).await.unwrap();

            let (n, from) = socket.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, 98);
            assert_eq!(read_u64(&buf[..8]), 0xdead_beef);
            assert_eq!(&buf[16..36], &[0x11; 20]);
            let mut reply = Vec::new();
            if refuse {
                reply.extend_from_slice(&ACTION_ERROR.to_be_bytes());
                reply.extend_from_slice(&buf[12..16]);
                reply.extend_from_slice(b"torrent not registered");
            } else {
                reply.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
                reply.extend_from_slice(&buf[12..16]);
                reply.extend_from_slice(&1800u32.to_be_bytes());
                reply.extend_from_slice(&3u32.to_be_bytes());
                reply.extend_from_slice(&7u32.to_be_bytes());
                reply.extend_from_slice(&[192, 168, 1, 9, 0x1a, 0xe1]);
            }
            socket.send_to(&reply, from).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_connect_and_announce() {
        let addr = spawn_tracker(false).await;
        let response = announce_to(addr, "udp://local", &request(), Duration::from_secs(2)).await.unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.leechers, Some(3));
        assert_eq!(response.seeders, Some(7));
        assert_eq!(response.peers, vec!["192.168.1.9:6881".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_error_action_reported() {
        let addr = spawn_tracker(true).await;
        let err = announce_to(addr, "udp://local", &request(), Duration::from_secs(2)).await.unwrap_err();
        assert!(err.to_string().contains("torrent not registered"));
    }

    #[tokio::test]
    async fn test_silent_tracker_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();
        let err = announce_to(addr, "udp://silent", &request(), Duration::from_millis(20)).await.unwrap_err();
        assert!(err.to_string().contains("did not respond"));
        drop(silent);
    }

    #[tokio::test]
    async fn test_resolve_requires_port() {
        assert!(resolve("udp://127.0.0.1/announce").await.is_err());
        assert_eq!(resolve("udp://127.0.0.1:6969/announce").await.unwrap(), "127.0.0.1:6969".parse().unwrap());
    }
}
