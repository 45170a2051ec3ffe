//! BitTorrent handshake protocol
//!
//! The fixed 68-byte exchange that opens every peer connection.

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Total handshake size on the wire
pub const HANDSHAKE_LEN: usize = 68;

/// Reserved byte and bit advertising the extension protocol (BEP 10)
const EXTENSION_BYTE: usize = 5;
const EXTENSION_BIT: u8 = 0x10;

/// Client prefix for generated peer ids
const PEER_ID_PREFIX: &[u8; 8] = b"-TW0001-";

/// BitTorrent handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Protocol identifier (19 bytes)
    pub protocol_id: [u8; 19],
    /// Reserved capability bits
    pub reserved: [u8; 8],
    /// Torrent info hash
    pub info_hash: [u8; 20],
    /// Sender's peer ID
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Handshake advertising extension protocol support
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        debug!("Creating new handshake for info_hash: {}", hex::encode(info_hash));
        let mut reserved = [0u8; 8];
        reserved[EXTENSION_BYTE] |= EXTENSION_BIT;
        Self {
            protocol_id: *PROTOCOL_STRING,
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Whether the sender supports the extension protocol
    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
    }

    /// Generate a random peer ID with the client prefix
    pub fn generate_peer_id() -> [u8; 20] {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
        peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        info!("Generated new peer ID: {}", String::from_utf8_lossy(&peer_id[..8]));
        peer_id
    }

    /// Serialize the handshake to bytes
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(&self.protocol_id);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        trace!("Handshake serialized: {} bytes", buf.len());
        buf.to_vec()
    }

    /// Deserialize a handshake from bytes
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < HANDSHAKE_LEN {
            error!("Handshake data too short: expected {} bytes, got {}", HANDSHAKE_LEN, data.len());
            return Err(TorrentError::protocol_error_with_source(
                "Handshake data too short",
                format!("expected {} bytes, got {}", HANDSHAKE_LEN, data.len()),
            )
            .into());
        }

        if data[0] != PROTOCOL_LENGTH {
            return Err(TorrentError::protocol_error_with_source(
                "Invalid protocol length",
                format!("expected {}, got {}", PROTOCOL_LENGTH, data[0]),
            )
            .into());
        }

        let mut protocol_id = [0u8; 19];
        protocol_id.copy_from_slice(&data[1..20]);
        if &protocol_id != PROTOCOL_STRING {
            error!("Invalid protocol string");
            return Err(TorrentError::protocol_error("Invalid protocol string").into());
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        debug!(
            "Handshake received: info_hash={} reserved={}",
            hex::encode(info_hash),
            hex::encode(reserved)
        );
        Ok(Self {
            protocol_id,
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Validate the handshake protocol and info_hash
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> bool {
        if &self.protocol_id != PROTOCOL_STRING {
            warn!("Handshake validation failed: invalid protocol identifier");
            return false;
        }

        if self.info_hash != *expected_info_hash {
            warn!(
                "Handshake validation failed: expected {}, got {}",
                hex::encode(expected_info_hash),
                hex::encode(self.info_hash)
            );
            return false;
        }

        true
    }
}
