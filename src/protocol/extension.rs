//! Extension protocol messages
//!
//! BEP 10 extension handshake and BEP 9 `ut_metadata` messages, used to
//! fetch the info dictionary when only a magnet link is known.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;
use tracing::trace;

use crate::error::TorrentError;
use crate::torrent::bencode::{self, BencodeValue};

/// Extended message id of the extension handshake
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// Id we assign to `ut_metadata` in our handshake
pub const UT_METADATA_LOCAL_ID: u8 = 1;

/// Size of one metadata piece
pub const METADATA_PIECE_SIZE: usize = 16384;

/// Largest info dictionary we are willing to assemble
pub const MAX_METADATA_SIZE: usize = 8 * 1024 * 1024;

const UT_METADATA: &str = "ut_metadata";

#[derive(Serialize)]
struct OutboundHandshake<'a> {
    m: BTreeMap<&'a str, i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata_size: Option<i64>,
    reqq: i64,
    v: &'a str,
}

/// Extension handshake as received from a peer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionHandshake {
    /// Extension name to the id the peer wants us to use
    pub extensions: BTreeMap<String, u8>,
    /// Size of the info dictionary, when the peer has it
    pub metadata_size: Option<usize>,
    /// Client name
    pub client: Option<String>,
}

impl ExtensionHandshake {
    /// Our handshake payload, advertising `ut_metadata`
    pub fn encode_local(metadata_size: Option<usize>) -> Result<Vec<u8>> {
        let mut m = BTreeMap::new();
        m.insert(UT_METADATA, UT_METADATA_LOCAL_ID as i64);
        let handshake = OutboundHandshake {
            m,
            metadata_size: metadata_size.map(|s| s as i64),
            reqq: 250,
            v: concat!("torrent-web ", env!("CARGO_PKG_VERSION")),
        };
        Ok(serde_bencode::to_bytes(&handshake).map_err(TorrentError::from)?)
    }

    /// Parse a peer's handshake payload
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let value = bencode::decode(payload)
            .map_err(|e| TorrentError::protocol_error_with_source("Invalid extension handshake", e.to_string()))?;
        if value.as_dict().is_none() {
            return Err(TorrentError::protocol_error("Extension handshake must be a dictionary").into());
        }

        let mut handshake = Self::default();
        if let Some(m) = value.get(b"m").and_then(|v| v.as_dict()) {
            for (name, id) in m {
                // id 0 means the peer disabled the extension
                if let (Ok(name), Some(id)) = (std::str::from_utf8(name), id.as_int()) {
                    if (1..=255).contains(&id) {
                        handshake.extensions.insert(name.to_string(), id as u8);
                    }
                }
            }
        }
        handshake.metadata_size = value
            .get(b"metadata_size")
            .and_then(|v| v.as_int())
            .filter(|&s| s > 0)
            .map(|s| s as usize);
        handshake.client = value.get(b"v").and_then(|v| v.as_string());
        trace!("Extension handshake: {:?}", handshake);
        Ok(handshake)
    }

    /// Id to use when sending `ut_metadata` messages to this peer
    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.extensions.get(UT_METADATA).copied()
    }
}

/// A `ut_metadata` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: usize, data: Vec<u8> },
    Reject { piece: u32 },
}

impl MetadataMessage {
    /// Bencoded header, followed by raw piece bytes for `Data`
    pub fn encode(&self) -> Vec<u8> {
        let (msg_type, piece) = match self {
            MetadataMessage::Request { piece } => (0, *piece),
            MetadataMessage::Data { piece, .. } => (1, *piece),
            MetadataMessage::Reject { piece } => (2, *piece),
        };
        let mut dict = BTreeMap::new();
        dict.insert(b"msg_type".to_vec(), BencodeValue::Int(msg_type));
        dict.insert(b"piece".to_vec(), BencodeValue::Int(piece as i64));
        if let MetadataMessage::Data { total_size, .. } = self {
            dict.insert(b"total_size".to_vec(), BencodeValue::Int(*total_size as i64));
        }
        let mut out = BencodeValue::Dict(dict).encode();
        if let MetadataMessage::Data { data, .. } = self {
            out.extend_from_slice(data);
        }
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (header, used) = bencode::decode_prefix(payload)
            .map_err(|e| TorrentError::protocol_error_with_source("Invalid ut_metadata message", e.to_string()))?;
        let int = |key: &[u8]| header.get(key).and_then(|v| v.as_int());

        let piece = int(b"piece")
            .filter(|&p| p >= 0 && p <= u32::MAX as i64)
            .ok_or_else(|| TorrentError::protocol_error("ut_metadata message missing piece"))? as u32;

        match int(b"msg_type") {
            Some(0) => Ok(MetadataMessage::Request { piece }),
            Some(1) => {
                let total_size = int(b"total_size")
                    .filter(|&s| s > 0)
                    .ok_or_else(|| TorrentError::protocol_error("ut_metadata data missing total_size"))?
                    as usize;
                Ok(MetadataMessage::Data {
                    piece,
                    total_size,
                    data: payload[used..].to_vec(),
                })
            }
            Some(2) => Ok(MetadataMessage::Reject { piece }),
            other => Err(TorrentError::protocol_error_with_source("Unknown ut_metadata msg_type", format!("{:?}", other)).into()),
        }
    }
}

/// Number of metadata pieces for an info dictionary of `size` bytes
pub fn metadata_piece_count(size: usize) -> usize {
    (size + METADATA_PIECE_SIZE - 1) / METADATA_PIECE_SIZE
}
