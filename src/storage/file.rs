//! File storage module
//!
//! Verified pieces written into the torrent's file layout on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, info, trace};

use crate::error::TorrentError;
use crate::storage::backend::{StorageBackend, StorageType};
use crate::torrent::TorrentInfo;

/// Disk storage for one torrent under `<download_dir>/<info hash>`
#[derive(Debug)]
pub struct DiskBackend {
    /// Session directory; removed by `discard`
    base_path: PathBuf,
    torrent_info: Arc<TorrentInfo>,
}

fn io_failure(message: &str, path: &Path, e: std::io::Error) -> TorrentError {
    error!("{} '{}': {}", message, path.display(), e);
    TorrentError::storage_error_full(message, path.display().to_string(), e.to_string())
}

impl DiskBackend {
    pub fn new(download_dir: &Path, torrent_info: Arc<TorrentInfo>) -> Self {
        let base_path = download_dir.join(torrent_info.info_hash_hex());
        Self {
            base_path,
            torrent_info,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// On-disk path of a torrent file
    pub fn file_path(&self, relative: &[String]) -> PathBuf {
        relative.iter().fold(self.base_path.clone(), |p, c| p.join(c))
    }

    /// Create every file at its final length (sparse where the filesystem allows)
    async fn create_files(&self) -> Result<()> {
        info!("Creating file structure for torrent: {}", self.torrent_info.name);
        fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| io_failure("Failed to create base directory", &self.base_path, e))?;

        for file in &self.torrent_info.files {
            let file_path = self.file_path(&file.path);
            if let Some(parent) = file_path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_failure("Failed to create directory", parent, e))?;
            }
            debug!("Creating file: {} ({} bytes)", file_path.display(), file.length);
            let f = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&file_path)
                .await
                .map_err(|e| io_failure("Failed to create file", &file_path, e))?;
            f.set_len(file.length)
                .await
                .map_err(|e| io_failure("Failed to set file length", &file_path, e))?;
        }
        Ok(())
    }

    /// Write `data` at an absolute torrent offset, spanning file boundaries
    async fn write_data(&self, offset: u64, data: &[u8]) -> Result<()> {
        trace!("Writing data at offset {} ({} bytes)", offset, data.len());
        let mut remaining = data;
        let mut current = offset;

        for file in &self.torrent_info.files {
            if remaining.is_empty() {
                break;
            }
            if file.end() <= current || file.length == 0 {
                continue;
            }
            let within = current - file.offset;
            let len = remaining.len().min((file.length - within) as usize);
            let file_path = self.file_path(&file.path);

            let mut handle = fs::OpenOptions::new()
                .write(true)
                .open(&file_path)
                .await
                .map_err(|e| io_failure("Failed to open file for writing", &file_path, e))?;
            handle
                .seek(std::io::SeekFrom::Start(within))
                .await
                .map_err(|e| io_failure("Failed to seek in file", &file_path, e))?;
            handle
                .write_all(&remaining[..len])
                .await
                .map_err(|e| io_failure("Failed to write to file", &file_path, e))?;
            handle
                .flush()
                .await
                .map_err(|e| io_failure("Failed to flush file", &file_path, e))?;

            remaining = &remaining[len..];
            current += len as u64;
        }

        if !remaining.is_empty() {
            return Err(TorrentError::storage_error_full(
                "Write past end of torrent",
                self.base_path.display().to_string(),
                format!("{} bytes left at offset {}", remaining.len(), current),
            )
            .into());
        }
        Ok(())
    }

    /// Read `length` bytes at an absolute torrent offset
    async fn read_data(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        trace!("Reading data at offset {} ({} bytes)", offset, length);
        let mut buffer = Vec::with_capacity(length);
        let mut current = offset;

        for file in &self.torrent_info.files {
            let wanted = length - buffer.len();
            if wanted == 0 {
                break;
            }
            if file.end() <= current || file.length == 0 {
                continue;
            }
            let within = current - file.offset;
            let len = wanted.min((file.length - within) as usize);
            let file_path = self.file_path(&file.path);

            let mut handle = fs::File::open(&file_path)
                .await
                .map_err(|e| io_failure("Failed to open file for reading", &file_path, e))?;
            handle
                .seek(std::io::SeekFrom::Start(within))
                .await
                .map_err(|e| io_failure("Failed to seek in file", &file_path, e))?;
            let start = buffer.len();
            buffer.resize(start + len, 0);
            handle
                .read_exact(&mut buffer[start..])
                .await
                .map_err(|e| io_failure("Failed to read from file", &file_path, e))?;
            current += len as u64;
        }

        if buffer.len() != length {
            return Err(TorrentError::storage_error_full(
                "Read past end of torrent",
                self.base_path.display().to_string(),
                format!("got {} of {} bytes", buffer.len(), length),
            )
            .into());
        }
        Ok(buffer)
    }
}

#[async_trait]
impl StorageBackend for DiskBackend {
    async fn initialize(&self) -> Result<()> {
        self.create_files().await
    }

    async fn write_piece(&self, piece_index: u32, data: Bytes) -> Result<()> {
        debug!("Writing piece {} to disk ({} bytes)", piece_index, data.len());
        let offset = piece_index as u64 * self.torrent_info.piece_length;
        self.write_data(offset, &data).await
    }

    async fn read_piece(&self, piece_index: u32, offset: u32, length: u32) -> Result<Bytes> {
        let start = piece_index as u64 * self.torrent_info.piece_length + offset as u64;
        let data = self.read_data(start, length as usize).await?;
        Ok(Bytes::from(data))
    }

    async fn discard(&self) -> Result<()> {
        match fs::remove_dir_all(&self.base_path).await {
            Ok(()) => {
                info!("Removed piece data at {}", self.base_path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_failure("Failed to remove download directory", &self.base_path, e).into()),
        }
    }

    fn storage_type(&self) -> StorageType {
        StorageType::File
    }
}
