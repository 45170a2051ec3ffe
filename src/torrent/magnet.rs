//! Magnet link parser
//!
//! Handles parsing of magnet: URIs to extract the info hash and discovery hints.

use std::net::SocketAddr;

use anyhow::Result;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::TorrentError;

/// Parsed magnet link information
#[derive(Debug, Clone)]
pub struct MagnetInfo {
    /// SHA1 info hash from the magnet link
    pub info_hash: [u8; 20],
    /// Display name (dn parameter)
    pub display_name: Option<String>,
    /// Tracker URLs (tr parameters)
    pub trackers: Vec<String>,
    /// Peer addresses (x.pe parameters)
    pub peers: Vec<SocketAddr>,
    /// Total file size in bytes (xl parameter)
    pub total_size: Option<u64>,
}

/// Parser for magnet links
pub struct MagnetParser;

impl MagnetParser {
    /// Parse a magnet link string
    ///
    /// # Example
    /// ```ignore
    /// let magnet = "magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c&dn=Big+Buck+Bunny";
    /// let info = MagnetParser::parse(magnet)?;
    /// ```
    pub fn parse(magnet_uri: &str) -> Result<MagnetInfo> {
        info!("Parsing magnet link: {}", magnet_uri);

        let url = Url::parse(magnet_uri.trim()).map_err(|e| {
            warn!("Invalid magnet URL format: {}", e);
            TorrentError::invalid_source_with_source("Invalid magnet URL format", e.to_string())
        })?;

        if url.scheme() != "magnet" {
            warn!("URL is not a magnet link: scheme is '{}'", url.scheme());
            return Err(TorrentError::invalid_source_with_source("URL is not a magnet link", url.scheme().to_string()).into());
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        let mut peers = Vec::new();
        let mut total_size = None;

        for (key, value) in url.query_pairs().into_owned() {
            debug!("Processing parameter: {} = {}", key, value);

            match key.as_str() {
                "xt" => {
                    if let Some(hash) = Self::extract_info_hash(&value)? {
                        debug!("Extracted info hash: {}", hex::encode(hash));
                        info_hash = Some(hash);
                    }
                }
                "dn" => display_name = Some(value),
                "tr" => {
                    if !trackers.contains(&value) {
                        trackers.push(value);
                    }
                }
                "x.pe" => match value.parse::<SocketAddr>() {
                    Ok(addr) => peers.push(addr),
                    Err(_) => warn!("Ignoring unparseable x.pe peer: {}", value),
                },
                "xl" => match value.parse::<u64>() {
                    Ok(size) => total_size = Some(size),
                    Err(_) => warn!("Invalid xl parameter value: {}", value),
                },
                _ => debug!("Ignoring parameter: {}", key),
            }
        }

        let info_hash = info_hash.ok_or_else(|| {
            warn!("Magnet link missing required info hash (xt parameter)");
            TorrentError::invalid_source("Magnet link must contain an info hash (xt=urn:btih:<hash>)")
        })?;

        info!(
            "Parsed magnet link: info_hash={}, name={}, trackers={}",
            hex::encode(info_hash),
            display_name.as_deref().unwrap_or("(none)"),
            trackers.len()
        );

        Ok(MagnetInfo {
            info_hash,
            display_name,
            trackers,
            peers,
            total_size,
        })
    }

    /// Extract info hash from an xt parameter value
    ///
    /// The xt parameter has the format: urn:btih:<hash>
    /// where <hash> is either 40 hex characters or 32 base32 characters
    fn extract_info_hash(xt_value: &str) -> Result<Option<[u8; 20]>> {
        let Some(hash_str) = xt_value.strip_prefix("urn:btih:") else {
            debug!("xt parameter is not a BitTorrent info hash: {}", xt_value);
            return Ok(None);
        };

        let bytes = match hash_str.len() {
            40 => hex::decode(hash_str)
                .map_err(|e| TorrentError::invalid_source_with_source("Invalid hex info hash", e.to_string()))?,
            32 => base32_decode(hash_str)
                .ok_or_else(|| TorrentError::invalid_source_with_source("Invalid base32 info hash", hash_str.to_string()))?,
            other => {
                warn!("Info hash has invalid length: {} (expected 40 hex or 32 base32)", other);
                return Err(TorrentError::invalid_source_with_source(
                    "Info hash has invalid length",
                    format!("{} characters", other),
                )
                .into());
            }
        };

        let hash: [u8; 20] = bytes
            .try_into()
            .map_err(|_| TorrentError::invalid_source("Info hash must decode to 20 bytes"))?;
        Ok(Some(hash))
    }

    /// Check if a string looks like a magnet link
    pub fn is_magnet_link(input: &str) -> bool {
        input.trim().starts_with("magnet:")
    }
}

/// RFC 4648 base32 without padding, case-insensitive
fn base32_decode(input: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    let mut output = Vec::with_capacity(input.len() * 5 / 8);
    let mut buffer: u64 = 0;
    let mut bits = 0;

    for c in input.trim_end_matches('=').bytes() {
        let value = ALPHABET.iter().position(|&x| x == c.to_ascii_uppercase())? as u64;
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            output.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }

    Some(output)
}
