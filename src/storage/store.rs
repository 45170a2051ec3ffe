//! Piece store
//!
//! Owns the state of every piece of one torrent. Blocks are buffered per piece
//! until the piece completes, then hashed once and written through the backend.
//! Readers wait on a generation counter that is bumped on every verification.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::TorrentError;
use crate::storage::backend::StorageBackend;
use crate::storage::piece::{verify_hash, PieceBuffer, PieceState};
use crate::torrent::TorrentInfo;

/// Result of storing one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Block buffered; piece still incomplete
    Stored,
    /// Block completed the piece and the hash matched
    Verified,
    /// Block completed the piece but the hash did not match; piece reverted to Missing
    HashMismatch,
    /// Block already present, or the piece is verifying or verified
    Duplicate,
}

#[derive(Debug, Default)]
struct Slot {
    state: PieceState,
    buffer: Option<PieceBuffer>,
}

pub struct PieceStore {
    info: Arc<TorrentInfo>,
    backend: Arc<dyn StorageBackend>,
    slots: Vec<Mutex<Slot>>,
    verified: AtomicUsize,
    verified_bytes: AtomicU64,
    generation: watch::Sender<u64>,
    closed: AtomicBool,
}

impl std::fmt::Debug for PieceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceStore")
            .field("torrent", &self.info.name)
            .field("backend", &self.backend.storage_type())
            .field("verified", &self.verified_count())
            .field("pieces", &self.slots.len())
            .finish()
    }
}

impl PieceStore {
    /// Prepare the backend and start with every piece Missing
    pub async fn open(info: Arc<TorrentInfo>, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        backend.initialize().await?;
        let slots = (0..info.piece_count()).map(|_| Mutex::new(Slot::default())).collect();
        let (generation, _) = watch::channel(0u64);
        debug!(
            "Piece store opened for {} ({} pieces, {:?} backend)",
            info.name,
            info.piece_count(),
            backend.storage_type()
        );
        Ok(Self {
            info,
            backend,
            slots,
            verified: AtomicUsize::new(0),
            verified_bytes: AtomicU64::new(0),
            generation,
            closed: AtomicBool::new(false),
        })
    }

    pub fn info(&self) -> &Arc<TorrentInfo> {
        &self.info
    }

    pub fn piece_count(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, piece: u32) -> Result<MutexGuard<'_, Slot>> {
        let slot = self.slots.get(piece as usize).ok_or_else(|| {
            TorrentError::validation_error_with_field(
                format!("Piece {} out of range ({} pieces)", piece, self.slots.len()),
                "piece",
            )
        })?;
        slot.lock()
            .map_err(|_| TorrentError::storage_error(format!("Piece {} lock poisoned", piece)).into())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TorrentError::cancelled("Piece store closed").into());
        }
        Ok(())
    }

    /// Store one block; verifies and persists the piece once all blocks are in
    pub async fn put(&self, piece: u32, offset: u32, data: Bytes) -> Result<PutOutcome> {
        self.ensure_open()?;
        let completed = {
            let mut slot = self.slot(piece)?;
            match slot.state {
                PieceState::Verified | PieceState::Verifying => return Ok(PutOutcome::Duplicate),
                PieceState::Missing => slot.state = PieceState::Requested,
                PieceState::Requested => {}
            }
            let piece_len = self.info.piece_len(piece);
            let buffer = slot.buffer.get_or_insert_with(|| PieceBuffer::new(piece_len));
            if !buffer.add_block(offset, data)? {
                return Ok(PutOutcome::Duplicate);
            }
            if !buffer.is_complete() {
                return Ok(PutOutcome::Stored);
            }
            let data = buffer.take();
            slot.buffer = None;
            slot.state = PieceState::Verifying;
            data
        };

        let expected = self.info.pieces[piece as usize];
        if !verify_hash(&completed, &expected) {
            warn!("Piece {} failed hash check", piece);
            self.slot(piece)?.state = PieceState::Missing;
            return Ok(PutOutcome::HashMismatch);
        }

        if let Err(e) = self.backend.write_piece(piece, completed.clone()).await {
            error!("Failed to persist piece {}: {}", piece, e);
            self.slot(piece)?.state = PieceState::Missing;
            return Err(e);
        }

        self.slot(piece)?.state = PieceState::Verified;
        let count = self.verified.fetch_add(1, Ordering::AcqRel) + 1;
        self.verified_bytes.fetch_add(completed.len() as u64, Ordering::AcqRel);
        self.generation.send_modify(|g| *g += 1);
        debug!("Piece {} verified ({}/{})", piece, count, self.slots.len());
        if count == self.slots.len() {
            info!("All {} pieces of {} verified", count, self.info.name);
        }
        Ok(PutOutcome::Verified)
    }

    /// Read from a verified piece; `NotReady` otherwise
    pub async fn read(&self, piece: u32, offset: u32, length: u32) -> Result<Bytes> {
        self.ensure_open()?;
        if !self.has(piece) {
            return Err(TorrentError::not_ready(piece).into());
        }
        let piece_len = self.info.piece_len(piece);
        if offset as u64 + length as u64 > piece_len as u64 {
            return Err(TorrentError::validation_error_with_field(
                format!("Read {}+{} beyond piece {} of {} bytes", offset, length, piece, piece_len),
                "length",
            )
            .into());
        }
        self.backend.read_piece(piece, offset, length).await
    }

    /// Non-blocking check for a verified piece
    pub fn has(&self, piece: u32) -> bool {
        self.state(piece) == Some(PieceState::Verified)
    }

    pub fn state(&self, piece: u32) -> Option<PieceState> {
        self.slot(piece).ok().map(|slot| slot.state)
    }

    /// Missing -> Requested
    pub fn mark_requested(&self, piece: u32) {
        if let Ok(mut slot) = self.slot(piece) {
            if slot.state == PieceState::Missing {
                slot.state = PieceState::Requested;
            }
        }
    }

    /// Requested -> Missing once nothing is in flight for the piece.
    /// Blocks already buffered are kept.
    pub fn mark_missing(&self, piece: u32) {
        if let Ok(mut slot) = self.slot(piece) {
            if slot.state == PieceState::Requested {
                slot.state = PieceState::Missing;
            }
        }
    }

    /// Suspend until `piece` is verified. Fails with `Cancelled` once the store closes.
    pub async fn wait_for(&self, piece: u32) -> Result<()> {
        if piece as usize >= self.slots.len() {
            return Err(TorrentError::validation_error_with_field(format!("Piece {} out of range", piece), "piece").into());
        }
        let mut rx = self.generation.subscribe();
        loop {
            if self.has(piece) {
                return Ok(());
            }
            self.ensure_open()?;
            rx.changed()
                .await
                .map_err(|_| TorrentError::cancelled("Piece store dropped"))?;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reject further writes and wake every waiter
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.generation.send_modify(|g| *g += 1);
        }
    }

    /// Close, drop buffered blocks and release backend storage
    pub async fn discard(&self) -> Result<()> {
        self.close();
        for slot in &self.slots {
            if let Ok(mut slot) = slot.lock() {
                slot.buffer = None;
            }
        }
        self.backend.discard().await?;
        debug!("Piece store for {} discarded", self.info.name);
        Ok(())
    }

    /// Verified pieces as a wire bitfield (high bit first)
    pub fn bitfield(&self) -> Vec<u8> {
        let mut bits = vec![0u8; (self.slots.len() + 7) / 8];
        for piece in 0..self.slots.len() {
            if self.has(piece as u32) {
                bits[piece / 8] |= 0x80 >> (piece % 8);
            }
        }
        bits
    }

    pub fn verified_count(&self) -> usize {
        self.verified.load(Ordering::Acquire)
    }

    pub fn missing_count(&self) -> usize {
        self.slots.len() - self.verified_count()
    }

    pub fn is_complete(&self) -> bool {
        self.verified_count() == self.slots.len()
    }

    /// Verified bytes
    pub fn downloaded_bytes(&self) -> u64 {
        self.verified_bytes.load(Ordering::Acquire)
    }

    /// Fraction of pieces verified, 0.0 ..= 1.0
    pub fn progress(&self) -> f64 {
        if self.slots.is_empty() {
            return 1.0;
        }
        self.verified_count() as f64 / self.slots.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::storage::backend::{MemoryBackend, StorageType};
    use crate::storage::piece::BLOCK_SIZE;
    use crate::torrent::fixtures;
    use async_trait::async_trait;
    use std::time::Duration;

    async fn four_pieces() -> (Arc<PieceStore>, Vec<u8>) {
        let fixture = fixtures::single_file("four.bin", &fixtures::payload(4 * 16384), 16384);
        let store = PieceStore::open(Arc::new(fixture.info), Arc::new(MemoryBackend::new()))
            .await
            .unwrap();
        (Arc::new(store), fixture.content)
    }

    fn piece_bytes(content: &[u8], piece: usize) -> Bytes {
        Bytes::copy_from_slice(&content[piece * 16384..(piece + 1) * 16384])
    }

    #[tokio::test]
    async fn test_corrupted_piece_reverts_to_missing() {
        let (store, content) = four_pieces().await;
        for piece in [0u32, 2, 3] {
            let outcome = store.put(piece, 0, piece_bytes(&content, piece as usize)).await.unwrap();
            assert_eq!(outcome, PutOutcome::Verified);
        }
        let mut corrupted = content[16384..32768].to_vec();
        corrupted[100] ^= 0xff;
        assert_eq!(store.put(1, 0, Bytes::from(corrupted)).await.unwrap(), PutOutcome::HashMismatch);

        assert_eq!(store.state(1), Some(PieceState::Missing));
        assert!(store.has(0) && store.has(2) && store.has(3));
        assert_eq!(store.verified_count(), 3);
        assert_eq!(store.bitfield(), vec![0b1011_0000]);

        let err = store.read(1, 0, 10).await.unwrap_err();
        assert_eq!(TorrentError::kind_of(&err), Some(ErrorKind::NotReady));

        // waiter stays suspended until the good copy arrives
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_for(1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        assert_eq!(store.put(1, 0, piece_bytes(&content, 1)).await.unwrap(), PutOutcome::Verified);
        waiter.await.unwrap().unwrap();
        assert_eq!(&store.read(1, 10, 5).await.unwrap()[..], &content[16394..16399]);
        assert!(store.is_complete());
    }

    #[tokio::test]
    async fn test_multi_block_piece_and_duplicates() {
        let content = fixtures::payload(40_000);
        let fixture = fixtures::single_file("one.bin", &content, 65536);
        let store = PieceStore::open(Arc::new(fixture.info), Arc::new(MemoryBackend::new()))
            .await
            .unwrap();

        let block = |i: usize| {
            let start = i * BLOCK_SIZE as usize;
            let end = (start + BLOCK_SIZE as usize).min(content.len());
            Bytes::copy_from_slice(&content[start..end])
        };
        assert_eq!(store.put(0, 0, block(0)).await.unwrap(), PutOutcome::Stored);
        assert_eq!(store.state(0), Some(PieceState::Requested));
        assert_eq!(store.put(0, 0, block(0)).await.unwrap(), PutOutcome::Duplicate);
        assert_eq!(store.put(0, 2 * BLOCK_SIZE, block(2)).await.unwrap(), PutOutcome::Stored);
        assert_eq!(store.put(0, BLOCK_SIZE, block(1)).await.unwrap(), PutOutcome::Verified);
        assert_eq!(store.put(0, BLOCK_SIZE, block(1)).await.unwrap(), PutOutcome::Duplicate);
        assert_eq!(store.downloaded_bytes(), 40_000);
        assert_eq!(store.progress(), 1.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_puts_verify_once() {
        let content = fixtures::payload(16 * BLOCK_SIZE as usize);
        let fixture = fixtures::single_file("race.bin", &content, 16 * BLOCK_SIZE as usize);
        let info = Arc::new(fixture.info);
        for round in 0..50 {
            let store = Arc::new(PieceStore::open(info.clone(), Arc::new(MemoryBackend::new())).await.unwrap());
            let puts: Vec<_> = (0..16u32)
                .map(|i| {
                    let store = store.clone();
                    let start = (i * BLOCK_SIZE) as usize;
                    let block = Bytes::copy_from_slice(&content[start..start + BLOCK_SIZE as usize]);
                    tokio::spawn(async move { store.put(0, i * BLOCK_SIZE, block).await })
                })
                .collect();
            let mut verified = 0;
            for put in puts {
                match put.await.unwrap().unwrap() {
                    PutOutcome::Verified => verified += 1,
                    PutOutcome::Stored => {}
                    other => panic!("round {}: unexpected {:?}", round, other),
                }
            }
            assert_eq!(verified, 1, "round {}", round);
            assert_eq!(store.verified_count(), 1);
            assert_eq!(&store.read(0, 0, 16 * BLOCK_SIZE).await.unwrap()[..], &content[..]);
        }
    }

    #[tokio::test]
    async fn test_invalid_block_is_validation_error() {
        let (store, _) = four_pieces().await;
        let err = store.put(0, 7, Bytes::from(vec![0u8; 16384])).await.unwrap_err();
        assert_eq!(TorrentError::kind_of(&err), Some(ErrorKind::Validation));
        let err = store.put(9, 0, Bytes::from(vec![0u8; 16384])).await.unwrap_err();
        assert_eq!(TorrentError::kind_of(&err), Some(ErrorKind::Validation));
    }

    #[tokio::test]
    async fn test_close_cancels_waiters() {
        let (store, content) = four_pieces().await;
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_for(2).await })
        };
        tokio::task::yield_now().await;
        store.close();
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(TorrentError::kind_of(&err), Some(ErrorKind::Cancelled));
        assert!(store.put(0, 0, piece_bytes(&content, 0)).await.is_err());
    }

    #[tokio::test]
    async fn test_mark_requested_and_missing() {
        let (store, _) = four_pieces().await;
        store.mark_requested(2);
        assert_eq!(store.state(2), Some(PieceState::Requested));
        store.mark_missing(2);
        assert_eq!(store.state(2), Some(PieceState::Missing));
        assert_eq!(store.state(99), None);
    }

    struct FailingBackend;

    #[async_trait]
    impl StorageBackend for FailingBackend {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }
        async fn write_piece(&self, _: u32, _: Bytes) -> Result<()> {
            Err(TorrentError::storage_error_full("Failed to write to file", "/dev/full", "disk full").into())
        }
        async fn read_piece(&self, _: u32, _: u32, _: u32) -> Result<Bytes> {
            Err(TorrentError::storage_error("unreadable").into())
        }
        async fn discard(&self) -> Result<()> {
            Ok(())
        }
        fn storage_type(&self) -> StorageType {
            StorageType::File
        }
    }

    #[tokio::test]
    async fn test_backend_failure_is_store_io_failure() {
        let fixture = fixtures::single_file("f.bin", &fixtures::payload(16384), 16384);
        let store = PieceStore::open(Arc::new(fixture.info), Arc::new(FailingBackend)).await.unwrap();
        let err = store.put(0, 0, Bytes::from(fixture.content)).await.unwrap_err();
        assert_eq!(TorrentError::kind_of(&err), Some(ErrorKind::StoreIoFailure));
        assert_eq!(store.state(0), Some(PieceState::Missing));
        assert_eq!(store.verified_count(), 0);
    }
}
