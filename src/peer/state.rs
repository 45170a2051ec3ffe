//! Peer state module
//!
//! Connection states, where a peer came from, and the piece bitfield it advertises.

use std::fmt;
use std::net::SocketAddr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::TorrentError;

/// Engine-assigned identifier of one connection attempt.
///
/// A reconnect to the same address gets a fresh key, so stale events from a
/// torn-down connection can never be mistaken for the new one.
pub type PeerKey = u64;

/// Represents the state of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PeerState {
    /// TCP connect in progress
    #[default]
    Connecting,
    /// Handshake sent, waiting for the peer's
    Handshaking,
    /// Handshake done; the peer has not unchoked us yet
    Connected,
    /// The peer choked us after having unchoked
    Choked,
    /// The peer is serving our requests
    Unchoked,
    /// Terminal
    Disconnected,
}

impl PeerState {
    /// Past the handshake and not gone
    pub fn is_connected(&self) -> bool {
        matches!(self, PeerState::Connected | PeerState::Choked | PeerState::Unchoked)
    }

    /// Whether block requests may be sent
    pub fn can_request(&self) -> bool {
        matches!(self, PeerState::Unchoked)
    }
}

/// Where the peer was discovered from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PeerSource {
    Tracker,
    /// `x.pe` parameter of a magnet link
    Magnet,
    Manual,
    /// Connected to us; never re-dialed
    Incoming,
}

/// A candidate peer address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub source: PeerSource,
}

impl PeerInfo {
    pub fn new(addr: SocketAddr, source: PeerSource) -> Self {
        Self { addr, source }
    }
}

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// TCP connect failed or timed out
    ConnectFailed(String),
    /// Peer announced a different info hash
    HandshakeMismatch,
    /// Malformed or out-of-range message
    ProtocolViolation(String),
    /// Socket closed or errored
    ConnectionLost(String),
    /// Nothing received for too long
    IdleTimeout,
    /// Shutdown command from the engine
    Shutdown,
}

impl DisconnectReason {
    /// Whether the address may be tried again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DisconnectReason::ConnectFailed(_) | DisconnectReason::ConnectionLost(_) | DisconnectReason::IdleTimeout
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ConnectFailed(e) => write!(f, "connect failed: {}", e),
            DisconnectReason::HandshakeMismatch => write!(f, "handshake info hash mismatch"),
            DisconnectReason::ProtocolViolation(e) => write!(f, "protocol violation: {}", e),
            DisconnectReason::ConnectionLost(e) => write!(f, "connection lost: {}", e),
            DisconnectReason::IdleTimeout => write!(f, "idle timeout"),
            DisconnectReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Pieces a peer has, high bit of byte 0 is piece 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Empty bitfield
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0u8; (piece_count + 7) / 8],
            piece_count,
        }
    }

    /// Validate a wire bitfield: exact byte length and no spare bits set
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Result<Self> {
        let expected = (piece_count + 7) / 8;
        if bytes.len() != expected {
            return Err(TorrentError::protocol_error_with_source(
                "Bitfield has wrong length",
                format!("{} bytes for {} pieces", bytes.len(), piece_count),
            )
            .into());
        }
        let spare = expected * 8 - piece_count;
        if spare > 0 {
            let mask = (1u8 << spare) - 1;
            if bytes[expected - 1] & mask != 0 {
                return Err(TorrentError::protocol_error("Bitfield has spare bits set").into());
            }
        }
        Ok(Self {
            bits: bytes.to_vec(),
            piece_count,
        })
    }

    /// Whether the peer has the piece
    pub fn has(&self, piece: u32) -> bool {
        let piece = piece as usize;
        piece < self.piece_count && self.bits[piece / 8] & (0x80 >> (piece % 8)) != 0
    }

    /// Mark a piece; returns false when out of range
    pub fn set(&mut self, piece: u32) -> bool {
        let piece = piece as usize;
        if piece >= self.piece_count {
            return false;
        }
        self.bits[piece / 8] |= 0x80 >> (piece % 8);
        true
    }

    /// Number of pieces set
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_seed(&self) -> bool {
        self.count() == self.piece_count
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    /// Indices of set pieces
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.piece_count as u32).filter(move |&p| self.has(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_state_predicates() {
        assert_eq!(PeerState::default(), PeerState::Connecting);
        assert!(!PeerState::Handshaking.is_connected());
        assert!(PeerState::Choked.is_connected());
        assert!(PeerState::Unchoked.can_request());
        assert!(!PeerState::Connected.can_request());
        assert!(!PeerState::Disconnected.is_connected());
    }

    #[test]
    fn test_bitfield_has_and_set() {
        let mut bitfield = Bitfield::from_bytes(&[0b1100_0000, 0b1000_0000], 9).unwrap();
        assert!(bitfield.has(0));
        assert!(bitfield.has(1));
        assert!(!bitfield.has(2));
        assert!(bitfield.has(8));
        assert!(!bitfield.has(9));
        assert_eq!(bitfield.count(), 3);

        assert!(bitfield.set(4));
        assert!(!bitfield.set(9));
        assert_eq!(bitfield.iter().collect::<Vec<_>>(), vec![0, 1, 4, 8]);
        assert!(!bitfield.is_seed());
    }

    #[test]
    fn test_bitfield_rejects_bad_input() {
        assert!(Bitfield::from_bytes(&[0xff], 9).is_err());
        assert!(Bitfield::from_bytes(&[0xff, 0xc0], 9).is_err());
        assert!(Bitfield::from_bytes(&[0xff, 0x80], 9).unwrap().is_seed());
        assert!(Bitfield::from_bytes(&[0xff], 8).unwrap().is_seed());
    }

    #[test]
    fn test_disconnect_reason_retry() {
        assert!(DisconnectReason::IdleTimeout.is_retryable());
        assert!(!DisconnectReason::HandshakeMismatch.is_retryable());
        assert!(!DisconnectReason::ProtocolViolation("x".into()).is_retryable());
        assert_eq!(DisconnectReason::Shutdown.to_string(), "shutdown");
    }
}
