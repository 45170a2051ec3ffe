//! The single active session
//!
//! [`SessionManager`] holds at most one [`TorrentSession`]. Starting a new
//! torrent stops the current one first; the same lock serializes start and
//! stop so two sessions never overlap. A session that dies on its own is
//! cleared from the slot as soon as it reports its fatal error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::TorrentError;
use crate::session::{SessionEvent, SessionHandle, TorrentSession};
use crate::torrent::TorrentSource;

/// Events kept for slow subscribers before they start lagging
const EVENT_CAPACITY: usize = 256;

/// The occupied slot
struct Active {
    id: u64,
    session: TorrentSession,
    /// Clears the slot on a fatal session error
    watcher: JoinHandle<()>,
}

type Slot = Arc<Mutex<Option<Active>>>;

pub struct SessionManager {
    config: SessionConfig,
    current: Slot,
    events: broadcast::Sender<SessionEvent>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            current: Arc::new(Mutex::new(None)),
            events,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Receive every event from now on; drop the receiver to unsubscribe
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Replace the active torrent with `source`
    pub async fn start(&self, source: TorrentSource) -> Result<SessionHandle> {
        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            previous.watcher.abort();
            teardown(&self.events, previous.session).await;
        }

        // subscribed first so an early failure is not missed
        let failures = self.events.subscribe();
        match TorrentSession::start(source, self.config.clone(), self.events.clone()).await {
            Ok(session) => {
                let handle = session.handle();
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let watcher = tokio::spawn(reap_on_failure(
                    id,
                    handle.clone(),
                    failures,
                    self.current.clone(),
                    self.events.clone(),
                ));
                *current = Some(Active { id, session, watcher });
                Ok(handle)
            }
            Err(e) => {
                warn!("Failed to start torrent: {:#}", e);
                let _ = self.events.send(SessionEvent::bad_torrent(&e));
                Err(e)
            }
        }
    }

    /// Classify a user-supplied magnet link or URL, then start it.
    /// Unrecognized input leaves the current torrent running.
    pub async fn start_input(&self, input: &str) -> Result<SessionHandle> {
        let source = match TorrentSource::from_input(input) {
            Ok(source) => source,
            Err(e) => {
                let _ = self.events.send(SessionEvent::bad_torrent(&e));
                return Err(e);
            }
        };
        self.start(source).await
    }

    /// Stop the active torrent without replacing it
    pub async fn remove(&self) -> Result<()> {
        let mut current = self.current.lock().await;
        let active = current.take().ok_or(TorrentError::NoSession)?;
        active.watcher.abort();
        teardown(&self.events, active.session).await;
        let _ = self.events.send(SessionEvent::NoTorrent);
        Ok(())
    }

    pub async fn current(&self) -> Option<SessionHandle> {
        self.current.lock().await.as_ref().map(|active| active.session.handle())
    }

    /// The active session, or `NoSession`
    pub async fn require(&self) -> Result<SessionHandle> {
        self.current().await.ok_or_else(|| TorrentError::NoSession.into())
    }

    /// What a newly connected client is told: the torrent, or that there is none
    pub async fn snapshot(&self) -> SessionEvent {
        match self.current().await {
            Some(handle) => SessionEvent::Ready {
                torrent: handle.summary(),
            },
            None => SessionEvent::NoTorrent,
        }
    }

    /// Stop whatever is running; used on process shutdown
    pub async fn shutdown(&self) {
        let mut current = self.current.lock().await;
        if let Some(active) = current.take() {
            active.watcher.abort();
            teardown(&self.events, active.session).await;
        }
    }
}

async fn teardown(events: &broadcast::Sender<SessionEvent>, session: TorrentSession) {
    let info_hash = session.handle().info_hash_hex();
    info!("Removing torrent {}", info_hash);
    if let Err(e) = session.stop().await {
        warn!("Error while stopping torrent {}: {}", info_hash, e);
    }
    let _ = events.send(SessionEvent::TorrentRemoved { info_hash });
}

/// Wait for session `id` to fail, then empty the slot if it still holds it
async fn reap_on_failure(
    id: u64,
    handle: SessionHandle,
    mut failures: broadcast::Receiver<SessionEvent>,
    current: Slot,
    events: broadcast::Sender<SessionEvent>,
) {
    loop {
        match failures.recv().await {
            Ok(SessionEvent::Error { .. }) => break,
            Ok(_) => {}
            // the error may be among the skipped events
            Err(RecvError::Lagged(_)) if handle.is_stopped() => break,
            Err(RecvError::Lagged(skipped)) => debug!("Failure watcher skipped {} events", skipped),
            Err(RecvError::Closed) => return,
        }
    }
    drop(failures);

    let mut slot = current.lock().await;
    if slot.as_ref().map(|active| active.id) != Some(id) {
        return;
    }
    if let Some(active) = slot.take() {
        warn!("Session for {} failed, removing it", handle.info().name);
        teardown(&events, active.session).await;
        let _ = events.send(SessionEvent::NoTorrent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::session::seeder::spawn_seeder;
    use crate::torrent::fixtures;
    use bytes::Bytes;
    use std::time::Duration;

    fn next_named(rx: &mut broadcast::Receiver<SessionEvent>, name: &str) -> SessionEvent {
        loop {
            match rx.try_recv() {
                Ok(event) if event.name() == name => return event,
                Ok(_) => continue,
                Err(e) => panic!("no {} event: {:?}", name, e),
            }
        }
    }

    #[tokio::test]
    async fn test_start_replaces_previous_session() {
        let first = fixtures::single_file("first.bin", &fixtures::payload(50_000), 16384);
        let second = fixtures::single_file("second.bin", &fixtures::payload(20_000), 16384);
        let (addr1, _) = spawn_seeder(&first, None).await;
        let (addr2, _) = spawn_seeder(&second, None).await;

        let manager = SessionManager::new(SessionConfig::in_memory().with_initial_peers(vec![addr1, addr2]));
        let mut rx = manager.subscribe();
        assert_eq!(manager.snapshot().await, SessionEvent::NoTorrent);

        let handle1 = manager
            .start(TorrentSource::Metainfo(Bytes::from(first.metainfo.clone())))
            .await
            .unwrap();
        let mut stream = handle1.open_file_stream("first.bin", 0, None).unwrap();
        let data = tokio::time::timeout(Duration::from_secs(20), stream.read_to_end())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&data[..], &first.content[..]);

        // a reader parked on the first session must be released by the switch
        let mut parked = handle1.open_file_stream("first.bin", 0, None).unwrap();
        drop(stream);

        let handle2 = manager
            .start(TorrentSource::Metainfo(Bytes::from(second.metainfo.clone())))
            .await
            .unwrap();
        assert!(handle1.is_stopped());
        assert!(parked.next_chunk().await.is_err());
        assert_eq!(manager.current().await.unwrap().info_hash_hex(), handle2.info_hash_hex());

        match next_named(&mut rx, "torrentRemoved") {
            SessionEvent::TorrentRemoved { info_hash } => assert_eq!(info_hash, first.info.info_hash_hex()),
            other => panic!("unexpected {:?}", other),
        }
        match next_named(&mut rx, "ready") {
            SessionEvent::Ready { torrent } => assert_eq!(torrent.name, "second.bin"),
            other => panic!("unexpected {:?}", other),
        }
        match manager.snapshot().await {
            SessionEvent::Ready { torrent } => assert_eq!(torrent.info_hash, second.info.info_hash_hex()),
            other => panic!("unexpected {:?}", other),
        }

        manager.remove().await.unwrap();
        next_named(&mut rx, "noTorrent");
        assert!(manager.current().await.is_none());
        let err = manager.remove().await.unwrap_err();
        assert!(TorrentError::is_kind(&err, ErrorKind::NoSession));
    }

    async fn wait_named(rx: &mut broadcast::Receiver<SessionEvent>, name: &str) -> SessionEvent {
        let wanted = async {
            loop {
                match rx.recv().await {
                    Ok(event) if event.name() == name => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(e) => panic!("no {} event: {:?}", name, e),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(20), wanted).await.unwrap()
    }

    #[tokio::test]
    async fn test_store_failure_clears_slot() {
        let fixture = fixtures::single_file("fail.bin", &fixtures::payload(50_000), 16384);
        let (addr, _) = spawn_seeder(&fixture, None).await;
        let dir = std::env::temp_dir().join(format!("torrent-web-manager-{}", rand::random::<u32>()));
        let manager = SessionManager::new(SessionConfig::default().with_download_dir(&dir).with_announce(false));
        let mut rx = manager.subscribe();

        let handle = manager
            .start(TorrentSource::Metainfo(Bytes::from(fixture.metainfo.clone())))
            .await
            .unwrap();
        // pieces can no longer be written once the session directory is gone
        std::fs::remove_dir_all(dir.join(fixture.info.info_hash_hex())).unwrap();
        handle.add_peers(vec![addr]).await.unwrap();

        match wait_named(&mut rx, "error").await {
            SessionEvent::Error { kind, .. } => assert_eq!(kind, ErrorKind::StoreIoFailure),
            other => panic!("unexpected {:?}", other),
        }
        match wait_named(&mut rx, "torrentRemoved").await {
            SessionEvent::TorrentRemoved { info_hash } => assert_eq!(info_hash, fixture.info.info_hash_hex()),
            other => panic!("unexpected {:?}", other),
        }
        wait_named(&mut rx, "noTorrent").await;

        assert!(handle.is_stopped());
        assert!(manager.current().await.is_none());
        assert_eq!(manager.snapshot().await, SessionEvent::NoTorrent);
        let err = manager.require().await.unwrap_err();
        assert!(TorrentError::is_kind(&err, ErrorKind::NoSession));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_bad_input_reports_bad_torrent() {
        let manager = SessionManager::new(SessionConfig::in_memory());
        let mut rx = manager.subscribe();

        let err = manager.start_input("ftp://example.com/x.torrent").await.unwrap_err();
        assert!(TorrentError::is_kind(&err, ErrorKind::InvalidSource));
        match rx.try_recv().unwrap() {
            SessionEvent::BadTorrent { kind, .. } => assert_eq!(kind, ErrorKind::InvalidSource),
            other => panic!("unexpected {:?}", other),
        }

        let err = manager
            .start(TorrentSource::Metainfo(Bytes::from_static(b"not bencode")))
            .await
            .unwrap_err();
        assert!(TorrentError::is_kind(&err, ErrorKind::InvalidSource));
        assert!(manager.require().await.is_err());
    }
}
