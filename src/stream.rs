//! File streams
//!
//! A [`FileStream`] maps a byte range of one torrent file onto pieces and
//! yields it in order. Each read suspends until the covering piece is
//! verified. While open, the stream keeps a window of pieces registered as
//! demand with the engine so the selector fetches them first.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::error::{ErrorKind, TorrentError};
use crate::selector::StreamId;
use crate::storage::PieceStore;
use crate::torrent::TorrentFile;

/// Upper bound on what `read_to_end` reserves before the first chunk
const READ_TO_END_PREALLOC: u64 = 4 * 1024 * 1024;

/// Read demand sent from streams to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemandUpdate {
    /// Pieces the stream needs next, most urgent first
    Set { stream: StreamId, pieces: Vec<u32> },
    Clear { stream: StreamId },
}

/// Cancels a stream from another task, e.g. when an HTTP client goes away.
/// The stream's read demand is withdrawn immediately, whether or not its
/// owner is still reading.
#[derive(Debug, Clone)]
pub struct StreamCancelHandle {
    stream: StreamId,
    flag: Arc<watch::Sender<bool>>,
    demand: mpsc::UnboundedSender<DemandUpdate>,
}

impl StreamCancelHandle {
    fn new(stream: StreamId, demand: mpsc::UnboundedSender<DemandUpdate>) -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            stream,
            flag: Arc::new(flag),
            demand,
        }
    }

    pub fn cancel(&self) {
        if !self.flag.send_replace(true) {
            trace!("Stream {} cancelled", self.stream);
            let _ = self.demand.send(DemandUpdate::Clear { stream: self.stream });
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow()
    }

    async fn cancelled(&self) {
        let mut rx = self.flag.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

pub struct FileStream {
    id: StreamId,
    store: Arc<PieceStore>,
    demand: mpsc::UnboundedSender<DemandUpdate>,
    file: TorrentFile,
    /// Absolute torrent offsets
    position: u64,
    end: u64,
    readahead: usize,
    window_head: Option<u32>,
    cancel: StreamCancelHandle,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for FileStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStream")
            .field("id", &self.id)
            .field("file", &self.file.path_string())
            .field("position", &self.position)
            .field("end", &self.end)
            .finish()
    }
}

impl FileStream {
    /// Open `file` at `offset` for `length` bytes (rest of the file when `None`).
    ///
    /// An offset past the end of the file is rejected; a length running past
    /// it is clamped.
    pub fn open(
        id: StreamId,
        store: Arc<PieceStore>,
        demand: mpsc::UnboundedSender<DemandUpdate>,
        file: &TorrentFile,
        offset: u64,
        length: Option<u64>,
        readahead: usize,
    ) -> Result<Self> {
        if offset > file.length {
            return Err(TorrentError::validation_error_with_field(
                format!("Offset {} beyond end of {} ({} bytes)", offset, file.path_string(), file.length),
                "offset",
            )
            .into());
        }
        let available = file.length - offset;
        let length = length.map_or(available, |l| l.min(available));
        let start = file.offset + offset;
        let cancel = StreamCancelHandle::new(id, demand.clone());
        let mut stream = Self {
            id,
            store,
            demand,
            file: file.clone(),
            position: start,
            end: start + length,
            readahead,
            window_head: None,
            cancel,
            timeout: None,
        };
        debug!(
            "Stream {} opened on {} at {} for {} bytes",
            id,
            stream.file.path_string(),
            offset,
            length
        );
        stream.register();
        Ok(stream)
    }

    /// Fail reads that wait longer than `timeout` for a piece
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn file(&self) -> &TorrentFile {
        &self.file
    }

    /// Bytes not yet returned
    pub fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.position)
    }

    /// Position within the file
    pub fn position(&self) -> u64 {
        self.position - self.file.offset
    }

    pub fn cancel_handle(&self) -> StreamCancelHandle {
        self.cancel.clone()
    }

    /// Stop the stream; pending and future reads fail with `Cancelled`
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.deregister();
    }

    fn last_piece(&self) -> u32 {
        self.store.info().piece_at(self.end.saturating_sub(1))
    }

    /// Announce the window starting at the current piece, once per piece
    fn register(&mut self) {
        if self.remaining() == 0 || self.cancel.is_cancelled() {
            return;
        }
        let head = self.store.info().piece_at(self.position);
        if self.window_head == Some(head) {
            return;
        }
        self.window_head = Some(head);
        let last = self.last_piece().min(head.saturating_add(self.readahead as u32));
        let pieces: Vec<u32> = (head..=last).collect();
        trace!("Stream {} window {:?}", self.id, pieces);
        let _ = self.demand.send(DemandUpdate::Set { stream: self.id, pieces });
        // a handle may have cancelled between the check above and the send
        if self.cancel.is_cancelled() {
            let _ = self.demand.send(DemandUpdate::Clear { stream: self.id });
        }
    }

    /// Withdraw demand; a cancelled handle has already done so
    fn deregister(&mut self) {
        if self.window_head.take().is_some() && !self.cancel.is_cancelled() {
            let _ = self.demand.send(DemandUpdate::Clear { stream: self.id });
        }
    }

    async fn wait_piece(&self, piece: u32) -> Result<()> {
        let wait = self.store.wait_for(piece);
        let deadline = async {
            match self.timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            result = wait => result,
            _ = self.cancel.cancelled() => Err(TorrentError::cancelled("Stream cancelled").into()),
            _ = deadline => {
                let waited = self.timeout.unwrap_or_default();
                Err(TorrentError::read_timeout(piece, waited).into())
            }
        }
    }

    /// Next run of bytes, at most up to the end of the current piece.
    /// `None` once the range is exhausted.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.cancel.is_cancelled() {
            self.deregister();
            return Err(TorrentError::cancelled("Stream cancelled").into());
        }
        if self.remaining() == 0 {
            self.deregister();
            return Ok(None);
        }
        self.register();

        let info = self.store.info().clone();
        let piece = info.piece_at(self.position);
        let piece_start = piece as u64 * info.piece_length;
        let offset = (self.position - piece_start) as u32;
        let length = (info.piece_len(piece) as u64 - offset as u64).min(self.remaining()) as u32;

        let data = loop {
            if !self.store.has(piece) {
                trace!("Stream {} waiting for piece {}", self.id, piece);
                if let Err(e) = self.wait_piece(piece).await {
                    if self.cancel.is_cancelled() {
                        self.deregister();
                    }
                    return Err(e);
                }
            }
            match self.store.read(piece, offset, length).await {
                Ok(data) => break data,
                Err(e) if TorrentError::is_kind(&e, ErrorKind::NotReady) => continue,
                Err(e) => return Err(e),
            }
        };

        self.position += data.len() as u64;
        if self.remaining() == 0 {
            debug!("Stream {} finished", self.id);
            self.deregister();
        }
        Ok(Some(data))
    }

    /// Collect the rest of the range
    pub async fn read_to_end(&mut self) -> Result<Bytes> {
        // grow as pieces arrive; the range may be far larger than memory
        let mut out = BytesMut::with_capacity(self.remaining().min(READ_TO_END_PREALLOC) as usize);
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Adapt to [`AsyncRead`] for consumers such as HTTP bodies or zip writers
    pub fn into_reader(self) -> FileStreamReader {
        FileStreamReader {
            stream: Some(self),
            pending: None,
            buffer: Bytes::new(),
        }
    }
}

impl Drop for FileStream {
    fn drop(&mut self) {
        self.deregister();
    }
}

type ChunkFuture = Pin<Box<dyn Future<Output = (FileStream, Result<Option<Bytes>>)> + Send>>;

/// [`AsyncRead`] over a [`FileStream`]
pub struct FileStreamReader {
    stream: Option<FileStream>,
    pending: Option<ChunkFuture>,
    buffer: Bytes,
}

impl FileStreamReader {
    pub fn cancel_handle(&self) -> Option<StreamCancelHandle> {
        self.stream.as_ref().map(FileStream::cancel_handle)
    }
}

fn to_io_error(err: anyhow::Error) -> io::Error {
    let kind = match TorrentError::kind_of(&err) {
        Some(ErrorKind::ReadTimeout) => io::ErrorKind::TimedOut,
        Some(ErrorKind::Cancelled) => io::ErrorKind::Interrupted,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, err)
}

impl AsyncRead for FileStreamReader {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.buffer.is_empty() {
                let n = buf.remaining().min(this.buffer.len());
                buf.put_slice(&this.buffer.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.pending.is_none() {
                let Some(mut stream) = this.stream.take() else {
                    return Poll::Ready(Ok(()));
                };
                this.pending = Some(Box::pin(async move {
                    let result = stream.next_chunk().await;
                    (stream, result)
                }));
            }
            let Some(pending) = this.pending.as_mut() else {
                continue;
            };
            let (stream, result) = ready!(pending.as_mut().poll(cx));
            this.pending = None;
            match result {
                Ok(Some(chunk)) => {
                    this.stream = Some(stream);
                    this.buffer = chunk;
                }
                Ok(None) => return Poll::Ready(Ok(())),
                Err(e) => {
                    this.stream = Some(stream);
                    return Poll::Ready(Err(to_io_error(e)));
                }
            }
        }
    }
}
