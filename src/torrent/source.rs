//! Torrent sources
//!
//! What `start()` accepts: a magnet URI, an HTTP(S) URL pointing at a
//! `.torrent`, or raw metainfo bytes.

use std::time::Duration;

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use reqwest::redirect::Policy;
use tracing::{debug, info, warn};

use crate::config::FetchLimits;
use crate::error::TorrentError;
use crate::torrent::magnet::{MagnetInfo, MagnetParser};
use crate::torrent::{TorrentInfo, TorrentParser};

/// Input to a session
#[derive(Debug, Clone)]
pub enum TorrentSource {
    /// `magnet:?xt=urn:btih:...`
    Magnet(String),
    /// HTTP(S) URL of a `.torrent` file
    Url(String),
    /// Metainfo bytes supplied directly
    Metainfo(Bytes),
}

/// A source after parsing, before peer-assisted metadata resolution
#[derive(Debug, Clone)]
pub enum ParsedSource {
    /// Full metadata is known
    Metadata {
        info: TorrentInfo,
        url: Option<String>,
    },
    /// Only the info hash is known
    Magnet {
        magnet: MagnetInfo,
        url: String,
    },
}

impl TorrentSource {
    /// Classify a user-supplied string
    pub fn from_input(input: &str) -> Result<Self> {
        let input = input.trim();
        if MagnetParser::is_magnet_link(input) {
            return Ok(TorrentSource::Magnet(input.to_string()));
        }
        let lower = input.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            url::Url::parse(input).map_err(TorrentError::from)?;
            return Ok(TorrentSource::Url(input.to_string()));
        }
        Err(TorrentError::invalid_source_with_source("Expected a magnet link or an http(s) URL", input.to_string()).into())
    }

    /// Short description for logs and events
    pub fn describe(&self) -> String {
        match self {
            TorrentSource::Magnet(uri) => uri.clone(),
            TorrentSource::Url(url) => url.clone(),
            TorrentSource::Metainfo(bytes) => format!("<{} metainfo bytes>", bytes.len()),
        }
    }

    /// Parse, fetching over HTTP when needed
    pub async fn parse(&self, limits: &FetchLimits) -> Result<ParsedSource> {
        match self {
            TorrentSource::Magnet(uri) => Ok(ParsedSource::Magnet {
                magnet: MagnetParser::parse(uri)?,
                url: uri.clone(),
            }),
            TorrentSource::Url(url) => {
                let body = fetch_metainfo(url, limits).await?;
                Ok(ParsedSource::Metadata {
                    info: TorrentParser::parse_bytes(&body)?,
                    url: Some(url.clone()),
                })
            }
            TorrentSource::Metainfo(bytes) => Ok(ParsedSource::Metadata {
                info: TorrentParser::parse_bytes(bytes)?,
                url: None,
            }),
        }
    }
}

/// Download a `.torrent` body, enforcing redirect, time and size bounds.
///
/// Any failure is reported as `InvalidSource`; the session is never created.
pub async fn fetch_metainfo(url: &str, limits: &FetchLimits) -> Result<Bytes> {
    info!("Fetching metainfo from {}", url);
    let invalid = |message: &str, source: String| TorrentError::invalid_source_with_source(message.to_string(), source);

    let client = reqwest::Client::builder()
        .redirect(Policy::limited(limits.max_redirects))
        .timeout(limits.fetch_timeout)
        .connect_timeout(limits.fetch_timeout.min(Duration::from_secs(10)))
        .build()
        .map_err(|e| invalid("Failed to build HTTP client", e.to_string()))?;

    let mut response = client
        .get(url)
        .send()
        .await
        .map_err(|e| invalid("Failed to fetch metainfo", e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        warn!("Metainfo fetch from {} returned {}", url, status);
        return Err(invalid("Metainfo fetch returned an error status", status.to_string()).into());
    }

    if let Some(declared) = response.content_length() {
        if declared > limits.max_metainfo_bytes {
            return Err(invalid(
                "Metainfo body too large",
                format!("{} bytes declared, limit {}", declared, limits.max_metainfo_bytes),
            )
            .into());
        }
    }

    let mut body = BytesMut::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| invalid("Failed to read metainfo body", e.to_string()))?
    {
        if (body.len() + chunk.len()) as u64 > limits.max_metainfo_bytes {
            return Err(invalid(
                "Metainfo body too large",
                format!("exceeded limit of {} bytes", limits.max_metainfo_bytes),
            )
            .into());
        }
        body.extend_from_slice(&chunk);
    }

    debug!("Fetched {} metainfo bytes from {}", body.len(), url);
    Ok(body.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::torrent::fixtures;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve canned HTTP responses, one per accepted connection
    async fn serve(responses: Vec<Vec<u8>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{}", addr)
    }

    fn ok_response(body: &[u8]) -> Vec<u8> {
        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/x-bittorrent\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(body);
        response
    }

    #[test]
    fn test_from_input_classifies() {
        assert!(matches!(
            TorrentSource::from_input("magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c").unwrap(),
            TorrentSource::Magnet(_)
        ));
        assert!(matches!(
            TorrentSource::from_input(" https://example.com/a.torrent ").unwrap(),
            TorrentSource::Url(_)
        ));
        let err = TorrentSource::from_input("ftp://example.com/a.torrent").unwrap_err();
        assert_eq!(TorrentError::kind_of(&err), Some(ErrorKind::InvalidSource));
    }

    #[tokio::test]
    async fn test_fetch_and_parse_url_source() {
        let fixture = fixtures::single_file("clip.webm", &[9u8; 20_000], 16 * 1024);
        let base = serve(vec![ok_response(&fixture.metainfo)]).await;
        let source = TorrentSource::Url(format!("{}/clip.torrent", base));

        match source.parse(&FetchLimits::default()).await.unwrap() {
            ParsedSource::Metadata { info, url } => {
                assert_eq!(info.info_hash, fixture.info.info_hash);
                assert!(url.unwrap().ends_with("/clip.torrent"));
            }
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_rejects_oversized_body() {
        let base = serve(vec![ok_response(&vec![b'x'; 2048])]).await;
        let limits = FetchLimits {
            max_metainfo_bytes: 1024,
            ..FetchLimits::default()
        };
        let err = fetch_metainfo(&base, &limits).await.unwrap_err();
        assert_eq!(TorrentError::kind_of(&err), Some(ErrorKind::InvalidSource));
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn test_fetch_rejects_error_status() {
        let response = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec();
        let base = serve(vec![response]).await;
        let err = fetch_metainfo(&base, &FetchLimits::default()).await.unwrap_err();
        assert_eq!(TorrentError::kind_of(&err), Some(ErrorKind::InvalidSource));
    }

    #[tokio::test]
    async fn test_fetch_stops_after_redirect_limit() {
        let redirect = |to: &str| {
            format!("HTTP/1.1 302 Found\r\nLocation: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", to).into_bytes()
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let loop_target = format!("{}/again", base);
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                let mut buf = vec![0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(&redirect(&loop_target)).await;
                let _ = socket.shutdown().await;
            }
        });

        let limits = FetchLimits {
            max_redirects: 2,
            ..FetchLimits::default()
        };
        let err = fetch_metainfo(&base, &limits).await.unwrap_err();
        assert_eq!(TorrentError::kind_of(&err), Some(ErrorKind::InvalidSource));
    }

    #[tokio::test]
    async fn test_metainfo_bytes_source() {
        let fixture = fixtures::single_file("a.bin", &[1u8; 10], 16 * 1024);
        let source = TorrentSource::Metainfo(Bytes::from(fixture.metainfo.clone()));
        assert!(source.describe().contains("metainfo bytes"));
        let parsed = source.parse(&FetchLimits::default()).await.unwrap();
        assert!(matches!(parsed, ParsedSource::Metadata { url: None, .. }));

        let garbage = TorrentSource::Metainfo(Bytes::from_static(b"garbage"));
        let err = garbage.parse(&FetchLimits::default()).await.unwrap_err();
        assert_eq!(TorrentError::kind_of(&err), Some(ErrorKind::InvalidSource));
    }
}
