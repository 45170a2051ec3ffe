//! Metadata download for magnet links
//!
//! Connects to peers that advertise the extension protocol and assembles the
//! info dictionary from `ut_metadata` pieces, checking it against the info hash.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, trace};

use crate::error::TorrentError;
use crate::protocol::extension::{
    metadata_piece_count, EXTENSION_HANDSHAKE_ID, MAX_METADATA_SIZE, METADATA_PIECE_SIZE, UT_METADATA_LOCAL_ID,
};
use crate::protocol::{BitTorrentWire, ExtensionHandshake, Handshake, Message, MetadataMessage, WireProtocol};

/// Longest wait for any single message during the exchange
const STEP_TIMEOUT: Duration = Duration::from_secs(15);

/// Peers asked concurrently
const PARALLEL_FETCHES: usize = 8;

/// Fetch the info dictionary from one peer
pub async fn fetch_metadata(addr: SocketAddr, info_hash: [u8; 20], peer_id: [u8; 20], connect_timeout: Duration) -> Result<Vec<u8>> {
    let stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|e| TorrentError::network_error_full("Connection timeout", addr.to_string(), e.to_string()))?
        .map_err(|e| TorrentError::network_error_full("Failed to connect", addr.to_string(), e.to_string()))?;
    exchange_metadata(stream, addr, info_hash, peer_id).await
}

/// Ask peers in parallel; the first verified info dictionary wins
pub async fn fetch_from_peers(peers: &[SocketAddr], info_hash: [u8; 20], peer_id: [u8; 20], connect_timeout: Duration) -> Result<Vec<u8>> {
    if peers.is_empty() {
        return Err(TorrentError::peer_error_with_peer("No peers to fetch metadata from", "none").into());
    }
    let mut pending = peers.iter().copied();
    let mut tasks = JoinSet::new();
    let mut last_error = None;

    loop {
        while tasks.len() < PARALLEL_FETCHES {
            match pending.next() {
                Some(addr) => {
                    tasks.spawn(async move { (addr, fetch_metadata(addr, info_hash, peer_id, connect_timeout).await) });
                }
                None => break,
            }
        }
        let Some(joined) = tasks.join_next().await else {
            break;
        };
        match joined {
            Ok((addr, Ok(metadata))) => {
                info!("Fetched {} bytes of metadata from {}", metadata.len(), addr);
                tasks.abort_all();
                return Ok(metadata);
            }
            Ok((addr, Err(e))) => {
                debug!("Metadata fetch from {} failed: {}", addr, e);
                last_error = Some(e);
            }
            Err(e) => debug!("Metadata task failed: {}", e),
        }
    }

    Err(last_error.unwrap_or_else(|| TorrentError::peer_error_with_peer("No peer supplied metadata", "swarm").into()))
}

async fn step<T>(addr: SocketAddr, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    timeout(STEP_TIMEOUT, fut)
        .await
        .map_err(|_| TorrentError::peer_error_with_peer("Metadata exchange timed out", addr.to_string()))?
}

/// BEP 9 exchange over an arbitrary stream
pub async fn exchange_metadata<S>(mut stream: S, addr: SocketAddr, info_hash: [u8; 20], peer_id: [u8; 20]) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut wire = BitTorrentWire;
    wire.write_handshake(&mut stream, &Handshake::new(info_hash, peer_id)).await?;
    let theirs = step(addr, wire.read_handshake(&mut stream)).await?;
    if theirs.info_hash != info_hash {
        return Err(TorrentError::handshake_mismatch(addr.to_string(), &info_hash, &theirs.info_hash).into());
    }
    if !theirs.supports_extensions() {
        return Err(TorrentError::peer_error_with_peer("Peer does not support the extension protocol", addr.to_string()).into());
    }

    let payload = ExtensionHandshake::encode_local(None)?;
    wire.write_message(&mut stream, &Message::Extended { id: EXTENSION_HANDSHAKE_ID, payload })
        .await?;

    // their extension handshake may follow a bitfield or have messages
    let handshake = loop {
        match step(addr, wire.read_message(&mut stream)).await? {
            Message::Extended { id: EXTENSION_HANDSHAKE_ID, payload } => break ExtensionHandshake::decode(&payload)?,
            other => trace!("Skipping {:?} from {} before extension handshake", other.message_id(), addr),
        }
    };
    let remote_id = handshake
        .ut_metadata_id()
        .ok_or_else(|| TorrentError::peer_error_with_peer("Peer does not offer ut_metadata", addr.to_string()))?;
    let size = handshake
        .metadata_size
        .ok_or_else(|| TorrentError::peer_error_with_peer("Peer did not announce metadata_size", addr.to_string()))?;
    if size > MAX_METADATA_SIZE {
        return Err(TorrentError::peer_error_full("Metadata too large", addr.to_string(), format!("{} bytes", size)).into());
    }

    let count = metadata_piece_count(size);
    debug!("Requesting {} metadata pieces ({} bytes) from {}", count, size, addr);
    for piece in 0..count as u32 {
        let payload = MetadataMessage::Request { piece }.encode();
        wire.write_message(&mut stream, &Message::Extended { id: remote_id, payload })
            .await?;
    }

    let mut metadata = vec![0u8; size];
    let mut received = vec![false; count];
    let mut remaining = count;
    while remaining > 0 {
        let payload = match step(addr, wire.read_message(&mut stream)).await? {
            Message::Extended { id: UT_METADATA_LOCAL_ID, payload } => payload,
            _ => continue,
        };
        match MetadataMessage::decode(&payload)? {
            MetadataMessage::Data { piece, total_size, data } => {
                let index = piece as usize;
                let start = index * METADATA_PIECE_SIZE;
                let expected = METADATA_PIECE_SIZE.min(size.saturating_sub(start));
                if total_size != size || index >= count || data.len() != expected {
                    return Err(TorrentError::protocol_error_with_source(
                        "Bad ut_metadata piece",
                        format!("piece {} with {} bytes from {}", piece, data.len(), addr),
                    )
                    .into());
                }
                if !received[index] {
                    metadata[start..start + expected].copy_from_slice(&data);
                    received[index] = true;
                    remaining -= 1;
                }
            }
            MetadataMessage::Reject { piece } => {
                return Err(TorrentError::peer_error_full("Peer rejected metadata request", addr.to_string(), format!("piece {}", piece)).into());
            }
            MetadataMessage::Request { .. } => {}
        }
    }

    let digest: [u8; 20] = Sha1::digest(&metadata).into();
    if digest != info_hash {
        return Err(TorrentError::peer_error_with_peer("Metadata does not match info hash", addr.to_string()).into());
    }
    Ok(metadata)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::torrent::fixtures;
    use std::collections::BTreeMap;
    use tokio::net::TcpListener;

    /// Serve `info_bytes` over ut_metadata to every connection
    pub(crate) async fn spawn_metadata_peer(info_bytes: Vec<u8>, info_hash: [u8; 20]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let info_bytes = info_bytes.clone();
                tokio::spawn(async move {
                    let mut wire = BitTorrentWire;
                    wire.read_handshake(&mut socket).await.unwrap();
                    wire.write_handshake(&mut socket, &Handshake::new(info_hash, [3u8; 20])).await.unwrap();
                    wire.write_message(&mut socket, &Message::Bitfield { bitfield: vec![0] }).await.unwrap();

                    let mut m = BTreeMap::new();
                    m.insert(b"ut_metadata".to_vec(), crate::torrent::bencode::BencodeValue::Int(3));
                    let mut dict = BTreeMap::new();
                    dict.insert(b"m".to_vec(), crate::torrent::bencode::BencodeValue::Dict(m));
                    dict.insert(
                        b"metadata_size".to_vec(),
                        crate::torrent::bencode::BencodeValue::Int(info_bytes.len() as i64),
                    );
                    let payload = crate::torrent::bencode::BencodeValue::Dict(dict).encode();
                    wire.write_message(&mut socket, &Message::Extended { id: 0, payload }).await.unwrap();

                    while let Ok(message) = wire.read_message(&mut socket).await {
                        if let Message::Extended { id: 3, payload } = message {
                            if let Ok(MetadataMessage::Request { piece }) = MetadataMessage::decode(&payload) {
                                let start = piece as usize * METADATA_PIECE_SIZE;
                                let end = (start + METADATA_PIECE_SIZE).min(info_bytes.len());
                                let reply = MetadataMessage::Data {
                                    piece,
                                    total_size: info_bytes.len(),
                                    data: info_bytes[start..end].to_vec(),
                                };
                                let message = Message::Extended {
                                    id: UT_METADATA_LOCAL_ID,
                                    payload: reply.encode(),
                                };
                                if wire.write_message(&mut socket, &message).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_fetch_metadata_from_peer() {
        // enough files to push the info dictionary past one metadata piece
        let names: Vec<String> = (0..700).map(|i| format!("dir/file-{:04}.bin", i)).collect();
        let data = vec![1u8; 10];
        let files: Vec<(&str, &[u8])> = names.iter().map(|n| (n.as_str(), data.as_slice())).collect();
        let fixture = fixtures::multi_file("many", &files, 16384);
        assert!(fixture.info_bytes.len() > METADATA_PIECE_SIZE);

        let addr = spawn_metadata_peer(fixture.info_bytes.clone(), fixture.info.info_hash).await;
        let metadata = fetch_metadata(addr, fixture.info.info_hash, [9u8; 20], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(metadata, fixture.info_bytes);
    }

    #[tokio::test]
    async fn test_fetch_rejects_wrong_metadata() {
        let fixture = fixtures::single_file("a.bin", &fixtures::payload(100), 16384);
        let other = fixtures::single_file("b.bin", &fixtures::payload(100), 16384);
        // peer claims the right hash but serves another torrent's info dictionary
        let addr = spawn_metadata_peer(other.info_bytes.clone(), fixture.info.info_hash).await;
        let err = fetch_metadata(addr, fixture.info.info_hash, [9u8; 20], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not match info hash"));
    }

    #[tokio::test]
    async fn test_fetch_from_peers_skips_dead_peer() {
        let fixture = fixtures::single_file("a.bin", &fixtures::payload(100), 16384);
        let dead = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let good = spawn_metadata_peer(fixture.info_bytes.clone(), fixture.info.info_hash).await;
        let metadata = fetch_from_peers(&[dead, good], fixture.info.info_hash, [9u8; 20], Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(metadata, fixture.info_bytes);
        assert!(fetch_from_peers(&[], fixture.info.info_hash, [9u8; 20], Duration::from_secs(1)).await.is_err());
    }
}
