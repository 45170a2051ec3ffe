//! Torrent information structures
//!
//! Immutable metadata for one torrent: piece geometry and the file layout.

use std::ops::Range;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::TorrentError;

/// A file within the torrent's contiguous byte space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// File path components (e.g., ["folder", "subfolder", "file.txt"])
    pub path: Vec<String>,
    /// File size in bytes
    pub length: u64,
    /// Byte offset of the file within the torrent
    pub offset: u64,
}

impl TorrentFile {
    /// Last path component
    pub fn name(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or("")
    }

    /// Relative path joined with '/'
    pub fn path_string(&self) -> String {
        self.path.join("/")
    }

    /// Offset one past the file's last byte
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Entry returned by `list_files()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub length: u64,
}

impl From<&TorrentFile> for FileEntry {
    fn from(file: &TorrentFile) -> Self {
        Self {
            name: file.name().to_string(),
            path: file.path_string(),
            length: file.length,
        }
    }
}

/// High-level torrent information
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    /// All tracker announce URLs, primary first, deduplicated
    pub announce_list: Vec<String>,
    /// SHA1 hash of the bencoded info dictionary
    pub info_hash: [u8; 20],
    /// Size of each piece in bytes (last piece may be shorter)
    pub piece_length: u64,
    /// List of piece hashes (each is a 20-byte SHA1 hash)
    pub pieces: Vec<[u8; 20]>,
    /// Torrent name
    pub name: String,
    /// Optional free-form comment from the metainfo
    pub comment: Option<String>,
    /// Files in torrent order; single-file torrents have one entry
    pub files: Vec<TorrentFile>,
    /// Whether the info dictionary used the multi-file layout
    pub multi_file: bool,
}

impl TorrentInfo {
    /// Calculate total size of all files in torrent
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    /// Get number of pieces in torrent
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Check if this is a multi-file torrent
    pub fn is_multi_file(&self) -> bool {
        self.multi_file
    }

    /// Get info hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Generate info hash from info dictionary bytes
    pub fn generate_info_hash(info_dict_bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(info_dict_bytes);
        hasher.finalize().into()
    }

    /// Parse piece hashes from concatenated bytes in torrent file
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(TorrentError::invalid_source_with_source(
                "Pieces field length must be a multiple of 20",
                format!("got {}", pieces_bytes.len()),
            )
            .into());
        }

        Ok(pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }

    /// Get piece hash for a specific piece index
    pub fn piece_hash(&self, index: usize) -> Option<[u8; 20]> {
        self.pieces.get(index).copied()
    }

    /// Get byte range `[start, end)` for a specific piece
    pub fn piece_range(&self, index: usize) -> Option<(u64, u64)> {
        if index >= self.pieces.len() {
            return None;
        }

        let start = (index as u64) * self.piece_length;
        let end = std::cmp::min(start + self.piece_length, self.total_size());
        Some((start, end))
    }

    /// Length of piece `index`, 0 when out of range
    pub fn piece_len(&self, index: u32) -> u32 {
        self.piece_range(index as usize)
            .map(|(start, end)| (end - start) as u32)
            .unwrap_or(0)
    }

    /// Piece containing the absolute torrent offset
    pub fn piece_at(&self, offset: u64) -> u32 {
        (offset / self.piece_length) as u32
    }

    /// Pieces overlapping `[offset, offset + length)`
    pub fn pieces_for_range(&self, offset: u64, length: u64) -> Range<u32> {
        if length == 0 || self.piece_length == 0 {
            return 0..0;
        }
        let first = self.piece_at(offset);
        let last = self.piece_at(offset + length - 1);
        first..last.saturating_add(1).min(self.pieces.len() as u32)
    }

    /// Look a file up by its relative path
    pub fn file_by_path(&self, path: &str) -> Option<&TorrentFile> {
        let wanted = path.trim_start_matches('/');
        self.files.iter().find(|f| f.path_string() == wanted)
    }

    /// Look a file up by its last path component; the last match wins when names repeat
    pub fn file_by_name(&self, name: &str) -> Option<&TorrentFile> {
        self.files.iter().rev().find(|f| f.name() == name)
    }

    /// Files as `{name, path, length}` entries
    pub fn file_entries(&self) -> Vec<FileEntry> {
        self.files.iter().map(FileEntry::from).collect()
    }

    /// Check the piece table covers the file layout exactly
    pub fn validate(&self) -> Result<()> {
        if self.piece_length == 0 {
            return Err(TorrentError::invalid_source("Piece length must be positive").into());
        }
        if self.piece_length > u32::MAX as u64 {
            return Err(TorrentError::invalid_source("Piece length too large").into());
        }
        let total = self.total_size();
        let expected = (total + self.piece_length - 1) / self.piece_length;
        if expected != self.pieces.len() as u64 {
            return Err(TorrentError::invalid_source_with_source(
                "Piece count does not match total length",
                format!("expected {} pieces for {} bytes, found {}", expected, total, self.pieces.len()),
            )
            .into());
        }
        Ok(())
    }
}

/// Lay files out contiguously, assigning offsets
pub fn layout_files(entries: Vec<(Vec<String>, u64)>) -> Vec<TorrentFile> {
    let mut offset = 0u64;
    entries
        .into_iter()
        .map(|(path, length)| {
            let file = TorrentFile { path, length, offset };
            offset += length;
            file
        })
        .collect()
}
