//! BitTorrent peer-to-peer piece exchange

pub mod bitfield;
pub mod descriptor;
pub mod downloader;
pub mod peer_connection;
pub mod peers;
pub mod protocol;
pub mod swarm;
#[cfg(test)]
pub mod test_data;
pub mod work_queue;

use std::fmt;

pub use bitfield::Bitfield;
pub use descriptor::{FileSpan, PieceDescriptor, TorrentDescriptor};
pub use downloader::{BLOCK_SIZE, PieceProgress, PieceState};
pub use peer_connection::PeerConnection;
pub use peers::{PeerRecord, PeerSet, ThroughputEstimator, backlog_for_rate};
pub use protocol::{HandshakeCodec, MessageCodec, MessageKind, PeerHandshake, PeerId, WireMessage};
pub use swarm::{SwarmManager, SwarmStats, download_torrent};
pub use work_queue::{Claim, ClaimedPiece, PieceWork, WorkQueue};

use crate::storage::StorageError;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
/// Exchanged in the handshake to confirm both sides share the same torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the index as a buffer position.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session stage a deadline was attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStage {
    Connect,
    Handshake,
    Bitfield,
    Message,
    Piece,
}

impl fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            TimeoutStage::Connect => "connect",
            TimeoutStage::Handshake => "handshake",
            TimeoutStage::Bitfield => "initial bitfield",
            TimeoutStage::Message => "message read",
            TimeoutStage::Piece => "piece download",
        };
        f.write_str(stage)
    }
}

/// Reasons a received handshake is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeFailure {
    #[error("wrong protocol")]
    WrongProtocol,

    #[error("info hash mismatch")]
    InfoHashMismatch,

    #[error("expected 68 bytes, received {received}")]
    InvalidLength { received: usize },
}

/// Failures attributable to a single remote peer.
///
/// Recoverable: the peer's task ends, any piece it held goes back on the
/// queue, and the rest of the swarm carries on.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("Protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    #[error("Handshake rejected: {0}")]
    Handshake(#[from] HandshakeFailure),

    #[error("Timed out during {stage}")]
    Timeout { stage: TimeoutStage },

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Peer I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PeerError {
    pub(crate) fn violation(reason: impl Into<String>) -> Self {
        PeerError::ProtocolViolation {
            reason: reason.into(),
        }
    }
}

/// Errors that end a whole download.
///
/// Per-peer problems never surface here; they are absorbed by the swarm.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Invalid torrent descriptor: {reason}")]
    InvalidDescriptor { reason: String },

    #[error("No peers available for torrent")]
    NoPeersAvailable,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}
