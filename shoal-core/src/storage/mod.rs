//! Storage layer for torrent data.
//!
//! Places verified pieces into the torrent's files and keeps the resume
//! bitmap that lets an interrupted download pick up where it stopped.

pub mod disk_manager;

use async_trait::async_trait;
pub use disk_manager::DiskManager;

use crate::torrent::{Bitfield, PieceIndex};

/// Piece persistence as seen by the swarm.
///
/// Writes are fatal on failure; reads answer `None` whenever the data is not
/// there, so serving a peer's request never fails the download.
#[async_trait]
pub trait PieceStorage: Send + Sync {
    /// Number of pieces this store was sized for
    fn piece_count(&self) -> usize;

    /// Whether the resume bitmap marks the piece as written
    fn has_piece(&self, index: PieceIndex) -> bool;

    /// Snapshot of the resume bitmap
    fn completed_pieces(&self) -> Bitfield;

    /// Persists a verified piece and marks it complete.
    ///
    /// # Errors
    ///
    /// - `StorageError::PieceOutOfRange` - Index beyond the torrent
    /// - `StorageError::FilesystemError` - Data length does not match the piece
    /// - `StorageError::Io` - Write or resume-file update failed
    async fn write_piece(&self, index: PieceIndex, data: &[u8]) -> Result<(), StorageError>;

    /// Reads part of a completed piece, `None` if unavailable.
    async fn read_block(&self, index: PieceIndex, begin: u32, length: u32) -> Option<Vec<u8>>;

    /// Flushes and syncs everything written so far.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - Sync failed
    async fn close(&self) -> Result<(), StorageError>;
}

/// Errors that occur during storage operations.
///
/// Any of these while persisting a piece ends the whole download.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Piece index does not exist in this torrent
    #[error("Piece {index} is out of range")]
    PieceOutOfRange {
        /// Index that was asked for
        index: PieceIndex,
    },

    /// File system specific error occurred
    #[error("File system error: {message}")]
    FilesystemError {
        /// Description of the file system error
        message: String,
    },

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
