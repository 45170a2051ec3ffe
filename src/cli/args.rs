//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{SessionConfig, StorageMode};

/// CLI arguments for the streaming engine
#[derive(Debug, Parser)]
#[command(name = "torrent-web")]
#[command(about = "Stream a torrent's files while it downloads", long_about = None)]
pub struct CliArgs {
    /// Magnet link, metainfo URL, or path to a .torrent file
    #[arg(value_name = "SOURCE")]
    pub source: String,

    /// Listening port announced to trackers
    #[arg(short, long, default_value_t = 6881)]
    pub port: u16,

    /// Download directory
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Maximum number of peer connections
    #[arg(short, long, default_value_t = 200)]
    pub max_connections: usize,

    /// Interested peers served at once (0 disables uploads)
    #[arg(long, default_value_t = 10)]
    pub upload_slots: usize,

    /// Accept incoming peer connections on the listening port
    #[arg(long)]
    pub listen: bool,

    /// Seconds to wait for magnet metadata
    #[arg(long, default_value_t = 60)]
    pub metadata_timeout: u64,

    /// Keep pieces in memory instead of on disk
    #[arg(long)]
    pub memory: bool,

    /// Extra peer to connect to (repeatable)
    #[arg(long = "peer", value_name = "ADDR")]
    pub peers: Vec<SocketAddr>,

    /// Do not contact trackers
    #[arg(long)]
    pub no_announce: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }

    /// Session configuration for these arguments
    pub fn to_config(&self) -> SessionConfig {
        let mut config = SessionConfig::default()
            .with_max_connections(self.max_connections)
            .with_upload_slots(self.upload_slots)
            .with_metadata_timeout(Duration::from_secs(self.metadata_timeout))
            .with_initial_peers(self.peers.clone())
            .with_announce(!self.no_announce);
        config.listen_port = self.port;
        config.accept_incoming = self.listen;
        if let Some(dir) = &self.output_dir {
            config = config.with_download_dir(dir.clone());
        }
        if self.memory {
            config = config.with_storage(StorageMode::Memory);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let args = CliArgs::try_parse_from(["torrent-web", "magnet:?xt=urn:btih:abc"]).unwrap();
        assert_eq!(args.port, 6881);
        assert_eq!(args.max_connections, 200);
        assert!(args.peers.is_empty());
        assert_eq!(args.log_level(), tracing::Level::INFO);

        let config = args.to_config();
        assert_eq!(config.storage, StorageMode::Disk);
        assert!(config.announce);
        assert_eq!(config.metadata_timeout, Duration::from_secs(60));
        assert_eq!(config.upload_slots, 10);
        assert!(!config.accept_incoming);
    }

    #[test]
    fn test_to_config() {
        let args = CliArgs::try_parse_from([
            "torrent-web",
            "https://example.com/a.torrent",
            "-p",
            "7000",
            "-o",
            "/srv/torrents",
            "--memory",
            "--peer",
            "127.0.0.1:6881",
            "--peer",
            "10.0.0.2:51413",
            "--no-announce",
            "--metadata-timeout",
            "5",
            "-q",
        ])
        .unwrap();

        let config = args.to_config();
        assert_eq!(config.listen_port, 7000);
        assert_eq!(config.download_dir, PathBuf::from("/srv/torrents"));
        assert_eq!(config.storage, StorageMode::Memory);
        assert_eq!(config.initial_peers.len(), 2);
        assert!(!config.announce);
        assert_eq!(config.metadata_timeout, Duration::from_secs(5));
        assert_eq!(args.log_level(), tracing::Level::ERROR);
    }

    #[test]
    fn test_rejects_bad_peer() {
        assert!(CliArgs::try_parse_from(["torrent-web", "x", "--peer", "not-an-address"]).is_err());
    }
}
