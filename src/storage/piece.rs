//! Piece storage module
//!
//! Block geometry and the in-progress buffer for one piece.

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::TorrentError;

/// Wire-level request unit
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Lifecycle of a piece inside the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PieceState {
    /// Nothing requested
    #[default]
    Missing,
    /// At least one block is in flight
    Requested,
    /// All blocks present, hash check running
    Verifying,
    /// Hash matched; readable
    Verified,
}

/// A block within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRef {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl BlockRef {
    pub fn new(piece: u32, offset: u32, length: u32) -> Self {
        Self { piece, offset, length }
    }

    /// Index of this block within its piece
    pub fn index(&self) -> usize {
        (self.offset / BLOCK_SIZE) as usize
    }
}

/// Number of blocks in a piece of `piece_len` bytes
pub fn block_count(piece_len: u32) -> usize {
    ((piece_len as u64 + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64) as usize
}

/// Length of block `index` in a piece of `piece_len` bytes
pub fn block_len(piece_len: u32, index: usize) -> u32 {
    let start = index as u32 * BLOCK_SIZE;
    piece_len.saturating_sub(start).min(BLOCK_SIZE)
}

/// All blocks of a piece, in offset order
pub fn blocks_of(piece: u32, piece_len: u32) -> impl Iterator<Item = BlockRef> {
    (0..block_count(piece_len)).map(move |i| BlockRef::new(piece, i as u32 * BLOCK_SIZE, block_len(piece_len, i)))
}

/// Blocks received so far for one piece
#[derive(Debug)]
pub struct PieceBuffer {
    /// Expected piece length
    length: u32,
    /// Received blocks; `None` while missing
    blocks: Vec<Option<Bytes>>,
    received: usize,
}

impl PieceBuffer {
    pub fn new(length: u32) -> Self {
        Self {
            length,
            blocks: vec![None; block_count(length)],
            received: 0,
        }
    }

    /// Store a block. Returns false when the block was already present.
    pub fn add_block(&mut self, offset: u32, data: Bytes) -> Result<bool> {
        if offset % BLOCK_SIZE != 0 {
            return Err(TorrentError::validation_error_with_field(
                format!("Block offset {} is not block-aligned", offset),
                "offset",
            )
            .into());
        }
        let index = (offset / BLOCK_SIZE) as usize;
        if index >= self.blocks.len() {
            return Err(TorrentError::validation_error_with_field(
                format!("Block offset {} beyond piece length {}", offset, self.length),
                "offset",
            )
            .into());
        }
        let expected = block_len(self.length, index);
        if data.len() as u32 != expected {
            return Err(TorrentError::validation_error_with_field(
                format!("Block at {} has {} bytes, expected {}", offset, data.len(), expected),
                "length",
            )
            .into());
        }

        if self.blocks[index].is_some() {
            return Ok(false);
        }
        self.blocks[index] = Some(data);
        self.received += 1;
        Ok(true)
    }

    /// Check if all blocks are downloaded
    pub fn is_complete(&self) -> bool {
        self.received == self.blocks.len()
    }

    /// Concatenate the blocks, leaving the buffer empty
    pub fn take(&mut self) -> Bytes {
        let mut data = BytesMut::with_capacity(self.length as usize);
        for block in self.blocks.iter_mut() {
            if let Some(block) = block.take() {
                data.extend_from_slice(&block);
            }
        }
        self.received = 0;
        data.freeze()
    }
}

/// SHA-1 of `data` compared against `expected`
pub fn verify_hash(data: &[u8], expected: &[u8; 20]) -> bool {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().as_slice() == expected
}
