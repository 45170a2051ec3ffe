//! Progress display module
//!
//! Renders session statistics as a single updating status line.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use crate::session::{SessionStats, TorrentSummary};

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Time left at the current rate, if it is moving at all
pub fn eta(stats: &SessionStats) -> Option<Duration> {
    if stats.download_rate <= 0.0 || stats.downloaded_bytes >= stats.total_bytes {
        return None;
    }
    let remaining = stats.total_bytes.saturating_sub(stats.downloaded_bytes) as f64;
    Some(Duration::from_secs_f64(remaining / stats.download_rate))
}

/// One status line for `stats`
pub fn status_line(stats: &SessionStats) -> String {
    let percent = stats.progress * 100.0;
    let bar_width: usize = 40;
    let filled = ((stats.progress * bar_width as f64) as usize).min(bar_width);
    let bar = "=".repeat(filled) + &" ".repeat(bar_width - filled);
    let eta = eta(stats).map(format_duration).unwrap_or_else(|| "∞".to_string());

    format!(
        "[{}] {:.1}% | {} / {} | ↓ {} | ↑ {} | Peers: {}/{} | Streams: {} | ETA: {}",
        bar,
        percent,
        format_bytes(stats.downloaded_bytes),
        format_bytes(stats.total_bytes),
        format_speed(stats.download_rate),
        format_bytes(stats.uploaded_bytes),
        stats.peers,
        stats.connections,
        stats.open_streams,
        eta,
    )
}

/// Progress display for CLI
pub struct ProgressDisplay {
    start_time: Instant,
    last_update: Option<Instant>,
    update_interval: Duration,
    quiet: bool,
}

impl ProgressDisplay {
    pub fn new(quiet: bool) -> Self {
        Self::with_interval(quiet, Duration::from_millis(500))
    }

    pub fn with_interval(quiet: bool, interval: Duration) -> Self {
        Self {
            start_time: Instant::now(),
            last_update: None,
            update_interval: interval,
            quiet,
        }
    }

    /// Redraw the status line, rate limited to the update interval
    pub fn update(&mut self, stats: &SessionStats) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        if let Some(last) = self.last_update {
            if last.elapsed() < self.update_interval {
                return Ok(());
            }
        }
        self.last_update = Some(Instant::now());

        let mut out = io::stderr().lock();
        write!(out, "\r\x1b[2K{}", status_line(stats))?;
        out.flush()
    }

    pub fn print_torrent(&self, torrent: &TorrentSummary) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        let mut out = io::stderr().lock();
        writeln!(out, "\r\x1b[2KTorrent: {}", torrent.name)?;
        writeln!(out, "  Info hash: {}", torrent.info_hash)?;
        if let Some(comment) = &torrent.comment {
            writeln!(out, "  Comment: {}", comment)?;
        }
        for file in &torrent.files {
            writeln!(out, "  {} ({})", file.path, format_bytes(file.length))?;
        }
        Ok(())
    }

    pub fn print_complete(&self, stats: &SessionStats) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        let mut out = io::stderr().lock();
        writeln!(out, "\r\x1b[2KDownload complete")?;
        writeln!(out, "  Downloaded: {}", format_bytes(stats.downloaded_bytes))?;
        writeln!(out, "  Elapsed Time: {}", format_duration(self.elapsed()))
    }

    pub fn print_status(&self, message: &str) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        eprintln!("\r\x1b[2K{}", message);
        Ok(())
    }

    /// Errors are shown even in quiet mode
    pub fn print_error(&self, message: &str) -> io::Result<()> {
        eprintln!("\r\x1b[2KError: {}", message);
        Ok(())
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
        assert_eq!(format_speed(1536.0), "1.50 KB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m 1s");
    }

    #[test]
    fn test_eta() {
        let mut stats = SessionStats {
            downloaded_bytes: 50,
            total_bytes: 100,
            download_rate: 10.0,
            ..SessionStats::default()
        };
        assert_eq!(eta(&stats), Some(Duration::from_secs(5)));

        stats.download_rate = 0.0;
        assert_eq!(eta(&stats), None);

        stats.download_rate = 10.0;
        stats.downloaded_bytes = 100;
        assert_eq!(eta(&stats), None);
    }

    #[test]
    fn test_status_line() {
        let stats = SessionStats {
            peers: 3,
            connections: 5,
            progress: 0.5,
            downloaded_bytes: 512,
            total_bytes: 1024,
            open_streams: 1,
            uploaded_bytes: 2048,
            ..SessionStats::default()
        };
        let line = status_line(&stats);
        assert!(line.contains("↑ 2.00 KB"));
        assert!(line.starts_with(&format!("[{}{}]", "=".repeat(20), " ".repeat(20))));
        assert!(line.contains("50.0%"));
        assert!(line.contains("Peers: 3/5"));
        assert!(line.contains("ETA: ∞"));
    }

    #[test]
    fn test_quiet_display_is_silent() {
        let mut display = ProgressDisplay::new(true);
        assert!(display.is_quiet());
        assert!(display.update(&SessionStats::default()).is_ok());
        assert!(display.last_update.is_none());
    }
}
