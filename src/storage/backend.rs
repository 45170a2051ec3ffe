//! Storage backend abstraction
//!
//! Verified pieces are handed to a backend; reads go back through it. The
//! piece store does all bookkeeping, so backends only move bytes.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::TorrentError;

/// Abstract storage backend for verified piece data
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Prepare storage before the first write (directories, sparse files)
    async fn initialize(&self) -> Result<()>;

    /// Persist a verified piece
    async fn write_piece(&self, piece_index: u32, data: Bytes) -> Result<()>;

    /// Read `length` bytes at `offset` within a previously written piece
    async fn read_piece(&self, piece_index: u32, offset: u32, length: u32) -> Result<Bytes>;

    /// Release everything this backend holds
    async fn discard(&self) -> Result<()>;

    /// Get storage type identifier
    fn storage_type(&self) -> StorageType;
}

/// Storage type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    /// Local filesystem storage
    File,
    /// Process memory
    Memory,
}

/// Pieces held in a map; nothing touches the filesystem
#[derive(Debug, Default)]
pub struct MemoryBackend {
    pieces: Mutex<HashMap<u32, Bytes>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<u32, Bytes>>> {
        self.pieces
            .lock()
            .map_err(|_| TorrentError::storage_error("Memory backend lock poisoned").into())
    }

    /// Number of pieces currently held
    pub fn len(&self) -> usize {
        self.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn write_piece(&self, piece_index: u32, data: Bytes) -> Result<()> {
        trace!("Storing piece {} in memory ({} bytes)", piece_index, data.len());
        self.lock()?.insert(piece_index, data);
        Ok(())
    }

    async fn read_piece(&self, piece_index: u32, offset: u32, length: u32) -> Result<Bytes> {
        let pieces = self.lock()?;
        let piece = pieces.get(&piece_index).ok_or_else(|| {
            TorrentError::storage_error_full("Piece not in memory", format!("piece {}", piece_index), "missing")
        })?;
        let start = offset as usize;
        let end = start + length as usize;
        if end > piece.len() {
            return Err(TorrentError::storage_error_full(
                "Read past end of piece",
                format!("piece {}", piece_index),
                format!("{}..{} of {}", start, end, piece.len()),
            )
            .into());
        }
        Ok(piece.slice(start..end))
    }

    async fn discard(&self) -> Result<()> {
        let mut pieces = self.lock()?;
        debug!("Discarding {} in-memory pieces", pieces.len());
        pieces.clear();
        pieces.shrink_to_fit();
        Ok(())
    }

    fn storage_type(&self) -> StorageType {
        StorageType::Memory
    }
}
