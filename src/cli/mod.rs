//! CLI module
//!
//! Argument parsing and terminal output for the `torrent-web` binary.

pub mod args;
pub mod progress;

pub use args::CliArgs;
pub use progress::ProgressDisplay;
