//! Storage module
//!
//! Piece bookkeeping, hash verification and the backends verified data lands in.

pub mod backend;
pub mod file;
pub mod piece;
pub mod store;

pub use backend::{MemoryBackend, StorageBackend, StorageType};
pub use file::DiskBackend;
pub use piece::{BlockRef, PieceBuffer, PieceState, BLOCK_SIZE};
pub use store::{PieceStore, PutOutcome};
