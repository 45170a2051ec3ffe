//! BitTorrent protocol module
//!
//! Peer wire protocol framing plus the metadata extension.

pub mod extension;
pub mod handshake;
pub mod message;
pub mod wire;

pub use extension::{ExtensionHandshake, MetadataMessage};
pub use handshake::{Handshake, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{Message, MessageId};
pub use wire::{BitTorrentWire, WireProtocol};
