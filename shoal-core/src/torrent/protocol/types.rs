//! Core types and enumerations for BitTorrent wire protocol

use bytes::Bytes;

use crate::torrent::{InfoHash, PieceIndex};

/// Client identifier prefix used when no other is configured.
pub const DEFAULT_CLIENT_PREFIX: &[u8; 8] = b"-SH0001-";

/// BitTorrent peer identifier.
///
/// 20-byte identifier for peers in the BitTorrent network.
/// Used in handshakes and tracker communication to identify clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generate random peer ID for this client.
    pub fn generate() -> Self {
        Self::generate_with_prefix(DEFAULT_CLIENT_PREFIX)
    }

    /// Generate random peer ID carrying a client prefix (at most 20 bytes used).
    pub fn generate_with_prefix(prefix: &[u8]) -> Self {
        let mut id = [0u8; 20];
        let prefix_len = prefix.len().min(20);
        id[..prefix_len].copy_from_slice(&prefix[..prefix_len]);
        for byte in &mut id[prefix_len..] {
            *byte = rand::random();
        }
        Self(id)
    }
}

/// Type tag of a wire message.
///
/// Ids the engine has no use for (BEP 5 `port`, extension messages) decode
/// as `Other` so a peer speaking extensions is not dropped for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have,
    Bitfield,
    Request,
    Piece,
    Cancel,
    Other(u8),
}

impl MessageKind {
    /// Wire id, `None` for keep-alive which carries no type byte.
    pub fn id(self) -> Option<u8> {
        match self {
            MessageKind::KeepAlive => None,
            MessageKind::Choke => Some(0),
            MessageKind::Unchoke => Some(1),
            MessageKind::Interested => Some(2),
            MessageKind::NotInterested => Some(3),
            MessageKind::Have => Some(4),
            MessageKind::Bitfield => Some(5),
            MessageKind::Request => Some(6),
            MessageKind::Piece => Some(7),
            MessageKind::Cancel => Some(8),
            MessageKind::Other(id) => Some(id),
        }
    }

    pub fn from_id(id: u8) -> Self {
        match id {
            0 => MessageKind::Choke,
            1 => MessageKind::Unchoke,
            2 => MessageKind::Interested,
            3 => MessageKind::NotInterested,
            4 => MessageKind::Have,
            5 => MessageKind::Bitfield,
            6 => MessageKind::Request,
            7 => MessageKind::Piece,
            8 => MessageKind::Cancel,
            other => MessageKind::Other(other),
        }
    }
}

/// One framed peer message: a type tag plus its raw payload.
///
/// Payloads are decoded lazily by the `parse_*` helpers in the codec, so a
/// Piece block can be copied straight into the piece buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub kind: MessageKind,
    pub payload: Bytes,
}

impl WireMessage {
    pub fn new(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn keep_alive() -> Self {
        Self::new(MessageKind::KeepAlive, Bytes::new())
    }

    pub fn choke() -> Self {
        Self::new(MessageKind::Choke, Bytes::new())
    }

    pub fn unchoke() -> Self {
        Self::new(MessageKind::Unchoke, Bytes::new())
    }

    pub fn interested() -> Self {
        Self::new(MessageKind::Interested, Bytes::new())
    }

    pub fn not_interested() -> Self {
        Self::new(MessageKind::NotInterested, Bytes::new())
    }

    pub fn have(piece_index: PieceIndex) -> Self {
        Self::new(
            MessageKind::Have,
            piece_index.as_u32().to_be_bytes().to_vec(),
        )
    }

    pub fn bitfield(bits: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Bitfield, bits)
    }

    pub fn request(piece_index: PieceIndex, begin: u32, length: u32) -> Self {
        Self::new(
            MessageKind::Request,
            block_triple(piece_index, begin, length),
        )
    }

    pub fn cancel(piece_index: PieceIndex, begin: u32, length: u32) -> Self {
        Self::new(MessageKind::Cancel, block_triple(piece_index, begin, length))
    }

    pub fn piece(piece_index: PieceIndex, begin: u32, block: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(8 + block.len());
        payload.extend_from_slice(&piece_index.as_u32().to_be_bytes());
        payload.extend_from_slice(&begin.to_be_bytes());
        payload.extend_from_slice(block);
        Self::new(MessageKind::Piece, payload)
    }
}

fn block_triple(piece_index: PieceIndex, begin: u32, length: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(12);
    payload.extend_from_slice(&piece_index.as_u32().to_be_bytes());
    payload.extend_from_slice(&begin.to_be_bytes());
    payload.extend_from_slice(&length.to_be_bytes());
    payload
}

/// A decoded Request or Cancel payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub piece_index: PieceIndex,
    pub begin: u32,
    pub length: u32,
}

/// Peer handshake information.
///
/// Initial exchange between peers to establish protocol compatibility
/// and verify info hash matching for torrent verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHandshake {
    /// Reserved bytes for protocol extensions, always zero when we send
    pub reserved: [u8; 8],
    /// Info hash of the torrent being shared
    pub info_hash: InfoHash,
    /// Unique identifier for the peer
    pub peer_id: PeerId,
}

impl PeerHandshake {
    /// Create handshake for BitTorrent protocol.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }
}
