//! Wire protocol utilities
//!
//! Framed reads and writes of handshakes and messages over any async stream.

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::warn;

use super::handshake::HANDSHAKE_LEN;
use super::{Handshake, Message};
use crate::error::TorrentError;

/// Largest accepted message body: a 1 MiB block plus the piece header
pub const MAX_MESSAGE_LEN: usize = (1 << 20) + 13;

/// WireProtocol trait for protocol utilities
pub trait WireProtocol {
    /// Read a complete message from the stream
    async fn read_message<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Message>;

    /// Write a message to the stream
    async fn write_message<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()>;

    /// Read a handshake from the stream
    async fn read_handshake<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Handshake>;

    /// Write a handshake to the stream
    async fn write_handshake<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()>;
}

/// Default implementation of WireProtocol
pub struct BitTorrentWire;

impl WireProtocol for BitTorrentWire {
    async fn read_message<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Message> {
        let mut length_buf = [0u8; 4];
        reader.read_exact(&mut length_buf).await.map_err(closed)?;
        let length = u32::from_be_bytes(length_buf) as usize;

        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if length > MAX_MESSAGE_LEN {
            warn!("Refusing oversized message of {} bytes", length);
            return Err(TorrentError::protocol_error_with_source(
                "Message exceeds maximum length",
                format!("{} > {}", length, MAX_MESSAGE_LEN),
            )
            .into());
        }

        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await.map_err(closed)?;
        Message::parse_body(&body)
    }

    async fn write_message<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, message: &Message) -> Result<()> {
        writer.write_all(&message.serialize()).await.map_err(closed)?;
        writer.flush().await.map_err(closed)?;
        Ok(())
    }

    async fn read_handshake<R: AsyncReadExt + Unpin>(&mut self, reader: &mut R) -> Result<Handshake> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        reader.read_exact(&mut buf).await.map_err(closed)?;
        Handshake::deserialize(&buf)
    }

    async fn write_handshake<W: AsyncWriteExt + Unpin>(&mut self, writer: &mut W, handshake: &Handshake) -> Result<()> {
        writer.write_all(&handshake.serialize()).await.map_err(closed)?;
        writer.flush().await.map_err(closed)?;
        Ok(())
    }
}

/// Socket errors are network failures, not storage failures
fn closed(err: std::io::Error) -> TorrentError {
    TorrentError::network_error_full("Peer connection failed", "peer", err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_message_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1 << 16);
        let mut wire = BitTorrentWire;
        let sent = Message::Piece {
            index: 3,
            begin: 16384,
            block: Bytes::from(vec![7u8; 100]),
        };
        wire.write_message(&mut a, &sent).await.unwrap();
        wire.write_message(&mut a, &Message::KeepAlive).await.unwrap();

        assert_eq!(wire.read_message(&mut b).await.unwrap(), sent);
        assert_eq!(wire.read_message(&mut b).await.unwrap(), Message::KeepAlive);
    }

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let mut wire = BitTorrentWire;
        let handshake = Handshake::new([9u8; 20], [8u8; 20]);
        wire.write_handshake(&mut a, &handshake).await.unwrap();
        assert_eq!(wire.read_handshake(&mut b).await.unwrap(), handshake);
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        use tokio::io::AsyncWriteExt;
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&(MAX_MESSAGE_LEN as u32 + 1).to_be_bytes()).await.unwrap();
        let err = BitTorrentWire.read_message(&mut b).await.unwrap_err();
        assert_eq!(TorrentError::kind_of(&err), Some(ErrorKind::Protocol));
    }

    #[tokio::test]
    async fn test_eof_is_network_error() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let err = BitTorrentWire.read_message(&mut b).await.unwrap_err();
        assert_eq!(TorrentError::kind_of(&err), Some(ErrorKind::Network));
    }
}
