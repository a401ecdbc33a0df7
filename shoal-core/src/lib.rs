//! Shoal Core - peer-to-peer download engine
//!
//! This crate exchanges the pieces of a torrent with many remote peers at
//! once: wire protocol codec and handshake, per-peer sessions, block
//! pipelining with a throughput-adaptive window, a multi-peer work queue,
//! and crash-resumable placement of verified pieces across a file set.

pub mod config;
pub mod storage;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::ShoalConfig;
pub use storage::{DiskManager, PieceStorage, StorageError};
pub use torrent::{TorrentDescriptor, TorrentError, download_torrent};

/// Core errors that can bubble up from any Shoal subsystem.
///
/// High-level error types representing failures in core functionality.
#[derive(Debug, thiserror::Error)]
pub enum ShoalError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShoalError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            ShoalError::Torrent(e) => match e {
                TorrentError::InvalidDescriptor { reason } => {
                    format!("Invalid torrent descriptor: {reason}")
                }
                TorrentError::NoPeersAvailable => "No peers available for download".to_string(),
                TorrentError::Storage(_) => "Disk error, download aborted".to_string(),
            },
            ShoalError::Configuration { reason } => format!("Configuration error: {reason}"),
            ShoalError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ShoalError::Configuration { .. }
                | ShoalError::Torrent(TorrentError::InvalidDescriptor { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, ShoalError>;
