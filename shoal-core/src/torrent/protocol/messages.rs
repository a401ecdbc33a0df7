//! BitTorrent wire protocol message serialization and deserialization

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::types::{BlockRequest, MessageKind, WireMessage};
use crate::torrent::{PeerError, PieceIndex};

/// Size of the big-endian length prefix on every message
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Index + begin header in front of a Piece block
const PIECE_HEADER_LEN: usize = 8;

/// Message serialization utilities for BitTorrent wire protocol.
pub struct MessageCodec;

impl MessageCodec {
    /// Serializes a message as `[u32 length][u8 id][payload]`.
    ///
    /// Keep-alive is the bare zero length prefix.
    pub fn serialize_message(message: &WireMessage) -> Bytes {
        let Some(id) = message.kind.id() else {
            return Bytes::from_static(&[0, 0, 0, 0]);
        };

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + 1 + message.payload.len());
        buf.put_u32(1 + message.payload.len() as u32);
        buf.put_u8(id);
        buf.extend_from_slice(&message.payload);
        buf.freeze()
    }

    /// Parses one framed message from the front of `data`.
    ///
    /// # Errors
    /// - `PeerError::ProtocolViolation` - Fewer than 4 bytes, or fewer than
    ///   `4 + length` bytes for a non-zero declared length
    pub fn deserialize_message(data: &[u8]) -> Result<WireMessage, PeerError> {
        if data.len() < LENGTH_PREFIX_LEN {
            return Err(PeerError::violation(format!(
                "message shorter than length prefix: {} bytes",
                data.len()
            )));
        }

        let mut buf = data;
        let length = buf.get_u32() as usize;

        if length == 0 {
            return Ok(WireMessage::keep_alive());
        }

        if data.len() < LENGTH_PREFIX_LEN + length {
            return Err(PeerError::violation(format!(
                "incomplete message: declared {length} bytes, have {}",
                data.len() - LENGTH_PREFIX_LEN
            )));
        }

        let kind = MessageKind::from_id(buf.get_u8());
        let payload = Bytes::copy_from_slice(&buf[..length - 1]);
        Ok(WireMessage { kind, payload })
    }
}

impl WireMessage {
    /// Decodes the piece index of a Have message.
    ///
    /// # Errors
    /// - `PeerError::ProtocolViolation` - Not a Have, or payload is not 4 bytes
    pub fn parse_have(&self) -> Result<PieceIndex, PeerError> {
        self.expect_kind(MessageKind::Have)?;
        if self.payload.len() != 4 {
            return Err(PeerError::violation(format!(
                "Have payload must be 4 bytes, got {}",
                self.payload.len()
            )));
        }
        let mut payload = &self.payload[..];
        Ok(PieceIndex::new(payload.get_u32()))
    }

    /// Decodes a Request or Cancel payload.
    ///
    /// # Errors
    /// - `PeerError::ProtocolViolation` - Wrong kind, or payload is not 12 bytes
    pub fn parse_request(&self) -> Result<BlockRequest, PeerError> {
        if !matches!(self.kind, MessageKind::Request | MessageKind::Cancel) {
            return Err(PeerError::violation(format!(
                "expected Request or Cancel, got {:?}",
                self.kind
            )));
        }
        if self.payload.len() != 12 {
            return Err(PeerError::violation(format!(
                "{:?} payload must be 12 bytes, got {}",
                self.kind,
                self.payload.len()
            )));
        }
        let mut payload = &self.payload[..];
        Ok(BlockRequest {
            piece_index: PieceIndex::new(payload.get_u32()),
            begin: payload.get_u32(),
            length: payload.get_u32(),
        })
    }

    /// Copies a Piece block into `dest` at its `begin` offset.
    ///
    /// Returns the number of block bytes copied.
    ///
    /// # Errors
    /// - `PeerError::ProtocolViolation` - Payload under 8 bytes, index differs
    ///   from `expected_index`, or the block overruns `dest`
    pub fn parse_piece(&self, expected_index: PieceIndex, dest: &mut [u8]) -> Result<usize, PeerError> {
        self.expect_kind(MessageKind::Piece)?;
        if self.payload.len() < PIECE_HEADER_LEN {
            return Err(PeerError::violation(format!(
                "Piece payload too short: {} bytes",
                self.payload.len()
            )));
        }

        let mut header = &self.payload[..PIECE_HEADER_LEN];
        let index = PieceIndex::new(header.get_u32());
        let begin = header.get_u32() as usize;

        if index != expected_index {
            return Err(PeerError::violation(format!(
                "expected block of piece {expected_index}, got piece {index}"
            )));
        }

        let block = &self.payload[PIECE_HEADER_LEN..];
        let end = begin
            .checked_add(block.len())
            .filter(|&end| end <= dest.len())
            .ok_or_else(|| {
                PeerError::violation(format!(
                    "block at {begin}+{} overruns piece of {} bytes",
                    block.len(),
                    dest.len()
                ))
            })?;

        dest[begin..end].copy_from_slice(block);
        Ok(block.len())
    }

    fn expect_kind(&self, kind: MessageKind) -> Result<(), PeerError> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(PeerError::violation(format!(
                "expected {kind:?}, got {:?}",
                self.kind
            )))
        }
    }
}
