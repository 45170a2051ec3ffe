//! Torrent file parser
//!
//! Turns metainfo bytes (or a bare info dictionary received over ut_metadata)
//! into a validated [`TorrentInfo`].

use anyhow::Result;
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;
use crate::torrent::bencode::{self, BencodeValue};
use crate::torrent::info::{layout_files, TorrentInfo};

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentInfo> {
        info!("Parsing torrent file from {} bytes", data.len());
        trace!("Torrent data (first 100 bytes): {:?}", &data[..data.len().min(100)]);

        let root = bencode::decode(data).map_err(|e| {
            warn!("Metainfo is not valid bencode: {}", e);
            TorrentError::invalid_source_with_source("Metainfo is not valid bencode", e.to_string())
        })?;
        if root.as_dict().is_none() {
            return Err(TorrentError::invalid_source("Metainfo root must be a dictionary").into());
        }

        let (start, end) = bencode::dict_value_span(data, b"info")?
            .ok_or_else(|| TorrentError::invalid_source("Missing info dictionary"))?;
        let info_hash = TorrentInfo::generate_info_hash(&data[start..end]);
        debug!("Info hash: {}", hex::encode(info_hash));

        let info_value = root
            .get(b"info")
            .ok_or_else(|| TorrentError::invalid_source("Missing info dictionary"))?;
        let mut torrent = Self::convert_info(info_value, info_hash)?;

        let mut announce_list = Vec::new();
        if let Some(announce) = root.get(b"announce").and_then(|v| v.as_string()) {
            announce_list.push(announce);
        }
        if let Some(tiers) = root.get(b"announce-list").and_then(|v| v.as_list()) {
            for url in tiers.iter().filter_map(|t| t.as_list()).flatten().filter_map(|u| u.as_string()) {
                if !announce_list.contains(&url) {
                    announce_list.push(url);
                }
            }
        }
        torrent.announce_list = announce_list;
        torrent.comment = root.get(b"comment").and_then(|v| v.as_string());

        info!(
            "Successfully parsed torrent: {} ({} files, {} pieces)",
            torrent.name,
            torrent.files.len(),
            torrent.piece_count()
        );
        Ok(torrent)
    }

    /// Parse a bare info dictionary, as assembled from ut_metadata pieces.
    ///
    /// The bytes must hash to `expected_hash`.
    pub fn parse_info_dict(data: &[u8], expected_hash: &[u8; 20]) -> Result<TorrentInfo> {
        let info_hash = TorrentInfo::generate_info_hash(data);
        if &info_hash != expected_hash {
            error!(
                "Metadata hash mismatch: expected {}, got {}",
                hex::encode(expected_hash),
                hex::encode(info_hash)
            );
            return Err(TorrentError::invalid_source_with_source(
                "Metadata does not match info hash",
                hex::encode(info_hash),
            )
            .into());
        }
        let value = bencode::decode(data)
            .map_err(|e| TorrentError::invalid_source_with_source("Metadata is not valid bencode", e.to_string()))?;
        Self::convert_info(&value, info_hash)
    }

    fn convert_info(info_value: &BencodeValue, info_hash: [u8; 20]) -> Result<TorrentInfo> {
        if info_value.as_dict().is_none() {
            return Err(TorrentError::invalid_source("Info must be a dictionary").into());
        }

        let name = info_value
            .get(b"name.utf-8")
            .or_else(|| info_value.get(b"name"))
            .and_then(|v| v.as_string())
            .ok_or_else(|| TorrentError::invalid_source("Missing name field"))?;
        check_component(&name)?;

        let piece_length = info_value
            .get(b"piece length")
            .and_then(|v| v.as_int())
            .filter(|&l| l > 0)
            .ok_or_else(|| TorrentError::invalid_source("Missing or invalid piece length"))? as u64;

        let pieces_bytes = info_value
            .get(b"pieces")
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| TorrentError::invalid_source("Missing pieces field"))?;
        let pieces = TorrentInfo::parse_piece_hashes(pieces_bytes)?;

        let (entries, multi_file) = if let Some(length) = info_value.get(b"length") {
            let len = length
                .as_int()
                .filter(|&l| l >= 0)
                .ok_or_else(|| TorrentError::invalid_source("Invalid length field"))? as u64;
            (vec![(vec![name.clone()], len)], false)
        } else if let Some(file_list) = info_value.get(b"files").and_then(|v| v.as_list()) {
            let mut entries = Vec::with_capacity(file_list.len());
            for file_entry in file_list {
                let file_len = file_entry
                    .get(b"length")
                    .and_then(|v| v.as_int())
                    .filter(|&l| l >= 0)
                    .ok_or_else(|| TorrentError::invalid_source("Missing file length"))? as u64;

                let path_list = file_entry
                    .get(b"path.utf-8")
                    .or_else(|| file_entry.get(b"path"))
                    .and_then(|v| v.as_list())
                    .ok_or_else(|| TorrentError::invalid_source("Missing file path"))?;

                let mut path = vec![name.clone()];
                for component in path_list {
                    let component = component
                        .as_string()
                        .ok_or_else(|| TorrentError::invalid_source("File path component must be a string"))?;
                    check_component(&component)?;
                    path.push(component);
                }
                if path.len() == 1 {
                    return Err(TorrentError::invalid_source("Empty file path").into());
                }
                entries.push((path, file_len));
            }
            if entries.is_empty() {
                return Err(TorrentError::invalid_source("Empty file list").into());
            }
            (entries, true)
        } else {
            return Err(TorrentError::invalid_source("Neither length nor files found in info dict").into());
        };

        let torrent = TorrentInfo {
            announce_list: Vec::new(),
            info_hash,
            piece_length,
            pieces,
            name,
            comment: None,
            files: layout_files(entries),
            multi_file,
        };
        torrent.validate()?;
        Ok(torrent)
    }
}

/// Reject path components that could escape the download directory
fn check_component(component: &str) -> Result<()> {
    if component.is_empty() || component == "." || component == ".." || component.contains('/') || component.contains('\\') {
        warn!("Rejecting unsafe path component: {:?}", component);
        return Err(TorrentError::invalid_source_with_source("Unsafe path component", component.to_string()).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::torrent::fixtures;
    use std::collections::BTreeMap;

    fn bytes(s: &str) -> BencodeValue {
        BencodeValue::Bytes(s.as_bytes().to_vec())
    }

    #[test]
    fn test_parse_single_file_with_comment() {
        let content = vec![7u8; 40_000];
        let fixture = fixtures::single_file("movie.mp4", &content, 16 * 1024);
        let info = TorrentParser::parse_bytes(&fixture.metainfo).unwrap();

        assert_eq!(info.name, "movie.mp4");
        assert_eq!(info.total_size(), 40_000);
        assert_eq!(info.piece_count(), 3);
        assert_eq!(info.comment.as_deref(), Some("fixture comment"));
        assert_eq!(info.announce_list, vec!["http://127.0.0.1:1/announce".to_string()]);
        assert_eq!(info.files[0].path, vec!["movie.mp4".to_string()]);
        assert_eq!(info.info_hash, fixture.info.info_hash);
    }

    #[test]
    fn test_info_hash_covers_only_info_dict() {
        let fixture = fixtures::single_file("a.bin", &[1u8; 100], 16 * 1024);
        let info = TorrentParser::parse_bytes(&fixture.metainfo).unwrap();
        assert_eq!(info.info_hash, TorrentInfo::generate_info_hash(&fixture.info_bytes));
        assert_ne!(info.info_hash, TorrentInfo::generate_info_hash(&fixture.metainfo));
    }

    #[test]
    fn test_parse_multi_file_prefixes_name() {
        let mut files = Vec::new();
        for (name, len) in [("a.txt", 10i64), ("b.txt", 20)] {
            let mut f = BTreeMap::new();
            f.insert(b"length".to_vec(), BencodeValue::Int(len));
            f.insert(b"path".to_vec(), BencodeValue::List(vec![bytes("sub"), bytes(name)]));
            files.push(BencodeValue::Dict(f));
        }
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), bytes("pack"));
        info.insert(b"piece length".to_vec(), BencodeValue::Int(16384));
        info.insert(b"pieces".to_vec(), BencodeValue::Bytes(vec![0u8; 20]));
        info.insert(b"files".to_vec(), BencodeValue::List(files));
        let mut root = BTreeMap::new();
        root.insert(b"info".to_vec(), BencodeValue::Dict(info));

        let parsed = TorrentParser::parse_bytes(&BencodeValue::Dict(root).encode()).unwrap();
        assert!(parsed.is_multi_file());
        assert_eq!(parsed.files[1].path_string(), "pack/sub/b.txt");
        assert_eq!(parsed.files[1].offset, 10);
        assert!(parsed.announce_list.is_empty());
    }

    #[test]
    fn test_rejects_path_traversal() {
        let mut f = BTreeMap::new();
        f.insert(b"length".to_vec(), BencodeValue::Int(1));
        f.insert(b"path".to_vec(), BencodeValue::List(vec![bytes(".."), bytes("etc")]));
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), bytes("x"));
        info.insert(b"piece length".to_vec(), BencodeValue::Int(16384));
        info.insert(b"pieces".to_vec(), BencodeValue::Bytes(vec![0u8; 20]));
        info.insert(b"files".to_vec(), BencodeValue::List(vec![BencodeValue::Dict(f)]));
        let mut root = BTreeMap::new();
        root.insert(b"info".to_vec(), BencodeValue::Dict(info));

        let err = TorrentParser::parse_bytes(&BencodeValue::Dict(root).encode()).unwrap_err();
        assert_eq!(TorrentError::kind_of(&err), Some(ErrorKind::InvalidSource));
    }

    #[test]
    fn test_garbage_is_invalid_source() {
        let err = TorrentParser::parse_bytes(b"<html>not a torrent</html>").unwrap_err();
        assert_eq!(TorrentError::kind_of(&err), Some(ErrorKind::InvalidSource));
    }

    #[test]
    fn test_parse_info_dict_checks_hash() {
        let fixture = fixtures::single_file("a.bin", &[3u8; 5000], 16 * 1024);
        let parsed = TorrentParser::parse_info_dict(&fixture.info_bytes, &fixture.info.info_hash).unwrap();
        assert_eq!(parsed.name, "a.bin");
        assert!(TorrentParser::parse_info_dict(&fixture.info_bytes, &[0u8; 20]).is_err());
    }
}
