//! Pipelined download of one piece from one peer
//!
//! Requests are issued block by block while the peer has us unchoked and the
//! number of outstanding requests is below the peer's throughput-derived
//! window. Every received block widens or narrows that window. Requests the
//! peer sends us meanwhile are served from storage.

use tokio::io::{AsyncRead, AsyncWrite};

use super::descriptor::PieceDescriptor;
use super::protocol::{MessageKind, WireMessage};
use super::{Bitfield, PeerConnection, PeerError};
use crate::storage::PieceStorage;

/// Largest block requested in a single Request message
pub const BLOCK_SIZE: u32 = 16_384;

/// Largest block we will serve to a peer
const MAX_SERVED_BLOCK: u32 = 128 * 1024;

/// Where a piece attempt currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    /// May issue more block requests
    Requesting,
    /// Blocked on the next message from the peer
    Awaiting,
    /// Every byte of the piece has arrived
    Done,
}

/// One attempt at downloading one piece from one peer.
#[derive(Debug)]
pub struct PieceProgress {
    piece: PieceDescriptor,
    buffer: Vec<u8>,
    block_size: u32,
    requested: u32,
    downloaded: u32,
    backlog: u32,
    state: PieceState,
}

impl PieceProgress {
    pub fn new(piece: PieceDescriptor) -> Self {
        Self::with_block_size(piece, BLOCK_SIZE)
    }

    pub fn with_block_size(piece: PieceDescriptor, block_size: u32) -> Self {
        Self {
            piece,
            buffer: vec![0u8; piece.length as usize],
            block_size: block_size.max(1),
            requested: 0,
            downloaded: 0,
            backlog: 0,
            state: PieceState::Requesting,
        }
    }

    pub fn state(&self) -> PieceState {
        self.state
    }

    pub fn downloaded(&self) -> u32 {
        self.downloaded
    }

    /// Outstanding requests
    pub fn backlog(&self) -> u32 {
        self.backlog
    }

    pub fn is_done(&self) -> bool {
        self.downloaded >= self.piece.length
    }

    /// Drives the attempt until the whole piece is buffered.
    ///
    /// Has no deadline of its own; the caller bounds the attempt.
    ///
    /// # Errors
    /// - `PeerError` - Any session or protocol failure from the peer
    pub async fn download<S>(
        mut self,
        connection: &mut PeerConnection<S>,
        storage: &dyn PieceStorage,
    ) -> Result<Vec<u8>, PeerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        while !self.is_done() {
            self.request_blocks(connection).await?;
            self.state = PieceState::Awaiting;
            let message = connection.read_message().await?;
            self.handle_message(message, connection, storage).await?;
        }

        self.state = PieceState::Done;
        Ok(self.buffer)
    }

    async fn request_blocks<S>(&mut self, connection: &mut PeerConnection<S>) -> Result<(), PeerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.state = PieceState::Requesting;
        while !connection.is_choked()
            && self.requested < self.piece.length
            && self.backlog < connection.backlog_limit()
        {
            let length = self.block_size.min(self.piece.length - self.requested);
            connection
                .send_message(&WireMessage::request(self.piece.index, self.requested, length))
                .await?;
            self.backlog += 1;
            self.requested += length;
        }
        Ok(())
    }

    /// Applies one message received while this piece is in progress.
    ///
    /// # Errors
    /// - `PeerError::ProtocolViolation` - Malformed Have, Request or Piece
    /// - `PeerError::Io` - Replying to a Request failed
    pub async fn handle_message<S>(
        &mut self,
        message: WireMessage,
        connection: &mut PeerConnection<S>,
        storage: &dyn PieceStorage,
    ) -> Result<(), PeerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tracing::trace!(
            peer = %connection.address(),
            kind = ?message.kind,
            len = message.payload.len(),
            "Received message"
        );
        match message.kind {
            MessageKind::Choke => connection.set_choked(true),
            MessageKind::Unchoke => connection.set_choked(false),
            MessageKind::Have => connection.mark_have(message.parse_have()?),
            MessageKind::Bitfield => {
                connection.replace_peer_pieces(Bitfield::from_bytes(message.payload.to_vec()));
            }
            MessageKind::Piece => {
                let received = message.parse_piece(self.piece.index, &mut self.buffer)?;
                self.backlog = self.backlog.saturating_sub(1);
                self.downloaded += received as u32;
                connection.record_block(received);
            }
            MessageKind::Request => {
                let request = message.parse_request()?;
                if request.length > MAX_SERVED_BLOCK {
                    tracing::debug!(
                        peer = %connection.address(),
                        length = request.length,
                        "Ignoring oversized block request"
                    );
                    return Ok(());
                }
                if let Some(block) = storage
                    .read_block(request.piece_index, request.begin, request.length)
                    .await
                {
                    connection
                        .send_message(&WireMessage::piece(request.piece_index, request.begin, &block))
                        .await?;
                }
            }
            MessageKind::KeepAlive
            | MessageKind::Interested
            | MessageKind::NotInterested
            | MessageKind::Cancel
            | MessageKind::Other(_) => {}
        }
        Ok(())
    }
}
