//! Peer management module
//!
//! Connection tasks, the swarm that owns them, and magnet metadata download.

pub mod connection;
pub mod metadata;
pub mod state;
pub mod swarm;

// Re-export main types
pub use connection::{PeerCommand, PeerConnection, PeerContext, PeerEvent, PeerEventKind, PeerHandle, PeerTimeouts};
pub use state::{Bitfield, DisconnectReason, PeerInfo, PeerKey, PeerSource, PeerState};
pub use swarm::{PeerView, SwarmConfig, SwarmManager, SwarmUpdate};
