//! torrent-web - Main entry point
//!
//! Starts one torrent session, writes its events to stdout as JSON lines and
//! keeps it running until Ctrl-C.

use anyhow::{Context, Result};
use std::path::Path;
use tokio::sync::broadcast::error::RecvError;
use torrent_web::{CliArgs, ProgressDisplay, SessionEvent, SessionManager, TorrentError, TorrentSource};
use tracing::{debug, error, info, warn};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at an unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    info!("torrent-web starting");
    debug!("CLI arguments: {:?}", args);

    let config = args.to_config();
    config.validate().context("Invalid configuration")?;

    let manager = SessionManager::new(config);
    let mut events = manager.subscribe();
    let mut progress = ProgressDisplay::new(args.is_quiet());

    let source = load_source(&args.source).context("Failed to read torrent source")?;
    progress.print_status(&format!("Resolving {}", args.source))?;
    let handle = match source {
        Some(source) => manager.start(source).await,
        None => manager.start_input(&args.source).await,
    };
    // badTorrent has already been published; show it before bailing out
    drain_events(&mut events);
    let handle = handle.context("Failed to start torrent")?;
    progress.print_torrent(&handle.summary())?;

    let mut completed = false;
    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping session");
                break Ok(());
            }
            event = events.recv() => match event {
                Ok(event) => {
                    print_event(&event);
                    match event {
                        SessionEvent::Progress { stats } => {
                            progress.update(&stats)?;
                            if !completed && stats.total_pieces > 0 && stats.verified_pieces == stats.total_pieces {
                                completed = true;
                                progress.print_complete(&stats)?;
                            }
                        }
                        SessionEvent::Error { kind, detail } => {
                            progress.print_error(&detail)?;
                            break Err(anyhow::anyhow!("Session failed ({:?}): {}", kind, detail));
                        }
                        _ => {}
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!("Dropped {} session events", skipped),
                Err(RecvError::Closed) => break Ok(()),
            }
        }
    };

    if let Err(e) = manager.remove().await {
        if !TorrentError::is_kind(&e, torrent_web::ErrorKind::NoSession) {
            warn!("Failed to stop session: {:#}", e);
        }
    }
    drain_events(&mut events);

    info!("torrent-web finished");
    outcome
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
    debug!("Logging initialized at {:?}", args.log_level());
}

/// A local `.torrent` file as metainfo bytes; `None` for links and URLs
fn load_source(input: &str) -> Result<Option<TorrentSource>> {
    let path = Path::new(input);
    if !path.is_file() {
        return Ok(None);
    }
    info!("Loading torrent file: {}", path.display());
    let data = std::fs::read(path).with_context(|| format!("Failed to read torrent file {}", path.display()))?;
    debug!("Torrent file size: {} bytes", data.len());
    Ok(Some(TorrentSource::Metainfo(data.into())))
}

fn print_event(event: &SessionEvent) {
    match event.to_json() {
        Ok(line) => println!("{}", line),
        Err(e) => warn!("Failed to serialize {} event: {}", event.name(), e),
    }
}

fn drain_events(events: &mut tokio::sync::broadcast::Receiver<SessionEvent>) {
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
}
