//! BitTorrent protocol messages
//!
//! Length-prefixed peer messages, including the extension protocol envelope.

use anyhow::Result;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{error, trace};

use crate::error::TorrentError;

/// BitTorrent message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            20 => Ok(MessageId::Extended),
            _ => {
                error!("Invalid message ID: {}", value);
                Err(TorrentError::protocol_error_with_source("Invalid message ID", format!("value: {}", value)).into())
            }
        }
    }
}

/// BitTorrent protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { listen_port: u16 },
    /// BEP 10 envelope; `id` 0 is the extension handshake
    Extended { id: u8, payload: Vec<u8> },
}

impl Message {
    /// Get the message ID (returns None for KeepAlive)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::Port { .. } => Some(MessageId::Port),
            Message::Extended { .. } => Some(MessageId::Extended),
            Message::KeepAlive => None,
        }
    }

    /// Get the message length (excluding the length prefix)
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Port { .. } => 3,
            Message::Extended { payload, .. } => 2 + payload.len() as u32,
        }
    }

    /// Serialize the message to bytes (including length prefix)
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);
        buf.put_u32(self.length());
        if let Some(id) = self.message_id() {
            buf.put_u8(id as u8);
        }

        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have { piece_index } => buf.put_u32(*piece_index),
            Message::Bitfield { bitfield } => buf.put_slice(bitfield),
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Port { listen_port } => buf.put_u16(*listen_port),
            Message::Extended { id, payload } => {
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }

        trace!("Message serialized: {} bytes", buf.len());
        buf.to_vec()
    }

    /// Deserialize a message from bytes (including length prefix)
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(TorrentError::protocol_error("Message shorter than length prefix").into());
        }
        let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() - 4 != length {
            return Err(TorrentError::protocol_error_with_source(
                "Length prefix does not match message size",
                format!("prefix {}, body {}", length, data.len() - 4),
            )
            .into());
        }
        Self::parse_body(&data[4..])
    }

    /// Parse a message body (the bytes after the length prefix).
    ///
    /// Fixed-size messages must have exactly their wire size.
    pub fn parse_body(body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let message_id = MessageId::try_from(body[0])?;
        let mut buf = &body[1..];
        let expect = |wanted: usize| -> Result<()> {
            if body.len() - 1 != wanted {
                return Err(TorrentError::protocol_error_with_source(
                    format!("Malformed {:?} message", message_id),
                    format!("expected {} payload bytes, got {}", wanted, body.len() - 1),
                )
                .into());
            }
            Ok(())
        };

        let message = match message_id {
            MessageId::Choke => {
                expect(0)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                expect(0)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                expect(0)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                expect(0)?;
                Message::NotInterested
            }
            MessageId::Have => {
                expect(4)?;
                Message::Have { piece_index: buf.get_u32() }
            }
            MessageId::Bitfield => Message::Bitfield { bitfield: buf.to_vec() },
            MessageId::Request | MessageId::Cancel => {
                expect(12)?;
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let length = buf.get_u32();
                if message_id == MessageId::Request {
                    Message::Request { index, begin, length }
                } else {
                    Message::Cancel { index, begin, length }
                }
            }
            MessageId::Piece => {
                if buf.len() < 8 {
                    return Err(TorrentError::protocol_error_with_source(
                        "Piece message too short",
                        format!("expected at least 8 bytes, got {}", buf.len()),
                    )
                    .into());
                }
                let index = buf.get_u32();
                let begin = buf.get_u32();
                Message::Piece {
                    index,
                    begin,
                    block: Bytes::copy_from_slice(buf),
                }
            }
            MessageId::Port => {
                expect(2)?;
                Message::Port { listen_port: buf.get_u16() }
            }
            MessageId::Extended => {
                if buf.is_empty() {
                    return Err(TorrentError::protocol_error("Extended message missing extension id").into());
                }
                Message::Extended {
                    id: buf[0],
                    payload: buf[1..].to_vec(),
                }
            }
        };
        trace!("Parsed message: {:?}", message_id);
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_is_bare_length() {
        let serialized = Message::KeepAlive.serialize();
        assert_eq!(serialized, vec![0, 0, 0, 0]);
        assert_eq!(Message::deserialize(&serialized).unwrap(), Message::KeepAlive);
    }

    #[test]
    fn test_request_wire_layout() {
        let message = Message::Request { index: 1, begin: 16384, length: 16384 };
        let bytes = message.serialize();
        assert_eq!(&bytes[..5], &[0, 0, 0, 13, 6]);
        assert_eq!(Message::deserialize(&bytes).unwrap(), message);
    }

    #[test]
    fn test_piece_carries_block() {
        let message = Message::Piece {
            index: 10,
            begin: 0,
            block: Bytes::from_static(&[1, 2, 3, 4, 5]),
        };
        assert_eq!(message.length(), 14);
        match Message::deserialize(&message.serialize()).unwrap() {
            Message::Piece { index, block, .. } => {
                assert_eq!(index, 10);
                assert_eq!(&block[..], &[1, 2, 3, 4, 5]);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_extended_envelope() {
        let message = Message::Extended { id: 0, payload: b"d1:md11:ut_metadatai1eee".to_vec() };
        let bytes = message.serialize();
        assert_eq!(bytes[4], 20);
        assert_eq!(bytes[5], 0);
        assert_eq!(Message::deserialize(&bytes).unwrap(), message);
    }

    #[test]
    fn test_fixed_size_messages_reject_wrong_length() {
        // Have with a 3-byte payload
        assert!(Message::parse_body(&[4, 0, 0, 1]).is_err());
        // Choke with a trailing byte
        assert!(Message::parse_body(&[0, 9]).is_err());
        // Request one byte short
        assert!(Message::parse_body(&[6, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
        assert!(Message::parse_body(&[20]).is_err());
    }

    #[test]
    fn test_message_id_from_u8() {
        assert_eq!(MessageId::try_from(9).unwrap(), MessageId::Port);
        assert_eq!(MessageId::try_from(20).unwrap(), MessageId::Extended);
        assert!(MessageId::try_from(10).is_err());
    }

    #[test]
    fn test_deserialize_rejects_prefix_mismatch() {
        assert!(Message::deserialize(&[0, 0, 0, 5, 4, 0]).is_err());
        assert!(Message::deserialize(&[0, 0]).is_err());
    }
}
