//! Torrent file handling module
//!
//! Metainfo parsing, magnet links, and resolving a user-supplied source.

pub mod bencode;
pub mod info;
pub mod magnet;
pub mod parser;
pub mod source;

pub use info::{FileEntry, TorrentFile, TorrentInfo};
pub use magnet::{MagnetInfo, MagnetParser};
pub use parser::TorrentParser;
pub use source::{ParsedSource, TorrentSource};
