//! One TCP session with a remote peer

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout, timeout_at};

use super::peers::ThroughputEstimator;
use super::protocol::messages::LENGTH_PREFIX_LEN;
use super::protocol::{MessageCodec, MessageKind, PeerHandshake, PeerId, WireMessage, exchange_handshake};
use super::{Bitfield, InfoHash, PeerError, PieceIndex, TimeoutStage};
use crate::config::NetworkConfig;

/// Established session with a peer plus everything negotiated on it.
///
/// The stream type is generic so sessions can run over in-memory pipes in
/// tests; production sessions use `TcpStream`.
pub struct PeerConnection<S = TcpStream> {
    address: SocketAddr,
    stream: S,
    remote_id: PeerId,
    choked: bool,
    interest_sent: bool,
    peer_pieces: Bitfield,
    throughput: ThroughputEstimator,
    max_message_length: u32,
}

impl PeerConnection<TcpStream> {
    /// Connects, handshakes and waits for the peer's initial bitfield.
    ///
    /// Each stage runs under its own deadline from `config`.
    ///
    /// # Errors
    /// - `PeerError::Timeout` - Connect, handshake or bitfield stage overran
    /// - `PeerError::Handshake` - Peer answered with a bad handshake
    /// - `PeerError::ProtocolViolation` - First message was not a bitfield
    /// - `PeerError::Io` - TCP connect or socket failure
    pub async fn establish(
        address: SocketAddr,
        info_hash: InfoHash,
        local_id: PeerId,
        config: &NetworkConfig,
    ) -> Result<Self, PeerError> {
        let stream = timeout(config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| PeerError::Timeout {
                stage: TimeoutStage::Connect,
            })??;
        stream.set_nodelay(true)?;

        Self::establish_over(stream, address, info_hash, local_id, config).await
    }
}

impl<S> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Runs handshake and bitfield exchange over an already open stream.
    ///
    /// # Errors
    /// Same as [`PeerConnection::establish`] minus the connect stage.
    pub async fn establish_over(
        mut stream: S,
        address: SocketAddr,
        info_hash: InfoHash,
        local_id: PeerId,
        config: &NetworkConfig,
    ) -> Result<Self, PeerError> {
        let ours = PeerHandshake::new(info_hash, local_id);
        let remote = timeout(config.handshake_timeout, exchange_handshake(&mut stream, &ours))
            .await
            .map_err(|_| PeerError::Timeout {
                stage: TimeoutStage::Handshake,
            })??;

        let mut connection = Self {
            address,
            stream,
            remote_id: remote.peer_id,
            choked: true,
            interest_sent: false,
            peer_pieces: Bitfield::from_bytes(Vec::new()),
            throughput: ThroughputEstimator::new(),
            max_message_length: config.max_message_length,
        };

        let deadline = Instant::now() + config.bitfield_timeout;
        timeout_at(deadline, connection.await_bitfield())
            .await
            .map_err(|_| PeerError::Timeout {
                stage: TimeoutStage::Bitfield,
            })??;

        tracing::debug!(
            peer = %address,
            remote_id = %String::from_utf8_lossy(&connection.remote_id.as_bytes()[..8]),
            "Session established"
        );
        Ok(connection)
    }

    async fn await_bitfield(&mut self) -> Result<(), PeerError> {
        loop {
            let message = self.read_message().await?;
            match message.kind {
                MessageKind::KeepAlive => continue,
                MessageKind::Bitfield => {
                    self.peer_pieces = Bitfield::from_bytes(message.payload.to_vec());
                    return Ok(());
                }
                other => {
                    return Err(PeerError::violation(format!(
                        "expected Bitfield as first message, got {other:?}"
                    )));
                }
            }
        }
    }

    /// Reads one framed message, reassembling partial reads.
    ///
    /// # Errors
    /// - `PeerError::ConnectionClosed` - Stream ended before the frame did
    /// - `PeerError::ProtocolViolation` - Declared length above the configured limit
    /// - `PeerError::Io` - Socket failure
    pub async fn read_message(&mut self) -> Result<WireMessage, PeerError> {
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        read_full(&mut self.stream, &mut prefix).await?;

        let length = u32::from_be_bytes(prefix);
        if length == 0 {
            return Ok(WireMessage::keep_alive());
        }
        if length > self.max_message_length {
            return Err(PeerError::violation(format!(
                "message length {length} exceeds limit {}",
                self.max_message_length
            )));
        }

        let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_LEN + length as usize);
        frame.put_slice(&prefix);
        frame.resize(LENGTH_PREFIX_LEN + length as usize, 0);
        read_full(&mut self.stream, &mut frame[LENGTH_PREFIX_LEN..]).await?;

        MessageCodec::deserialize_message(&frame)
    }

    /// Reads one message or fails with `Timeout { stage: Message }`.
    pub async fn read_message_with_deadline(&mut self, limit: Duration) -> Result<WireMessage, PeerError> {
        timeout(limit, self.read_message())
            .await
            .map_err(|_| PeerError::Timeout {
                stage: TimeoutStage::Message,
            })?
    }

    /// Writes one framed message.
    ///
    /// # Errors
    /// - `PeerError::Io` - Socket failure
    pub async fn send_message(&mut self, message: &WireMessage) -> Result<(), PeerError> {
        let frame = MessageCodec::serialize_message(message);
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Sends Unchoke and Interested the first time it is called.
    pub async fn announce_interest(&mut self) -> Result<(), PeerError> {
        if self.interest_sent {
            return Ok(());
        }
        self.send_message(&WireMessage::unchoke()).await?;
        self.send_message(&WireMessage::interested()).await?;
        self.interest_sent = true;
        Ok(())
    }

    /// Closes the write half; errors are irrelevant once we are leaving.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

impl<S> PeerConnection<S> {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn remote_id(&self) -> PeerId {
        self.remote_id
    }

    pub fn is_choked(&self) -> bool {
        self.choked
    }

    pub fn set_choked(&mut self, choked: bool) {
        self.choked = choked;
    }

    /// Pieces the peer has advertised so far
    pub fn peer_pieces(&self) -> &Bitfield {
        &self.peer_pieces
    }

    pub fn has_piece(&self, piece_index: PieceIndex) -> bool {
        self.peer_pieces.has_piece(piece_index)
    }

    /// Applies a Have announcement.
    ///
    /// A bitfield that was shorter than the announced index is grown so the
    /// announcement is not lost.
    pub fn mark_have(&mut self, piece_index: PieceIndex) {
        let needed = super::bitfield::byte_len(piece_index.as_usize() + 1);
        if self.peer_pieces.as_bytes().len() < needed {
            let mut bits = self.peer_pieces.as_bytes().to_vec();
            bits.resize(needed, 0);
            self.peer_pieces = Bitfield::from_bytes(bits);
        }
        self.peer_pieces.set_piece(piece_index);
    }

    pub fn replace_peer_pieces(&mut self, pieces: Bitfield) {
        self.peer_pieces = pieces;
    }

    /// Current request window
    pub fn backlog_limit(&self) -> u32 {
        self.throughput.backlog()
    }

    /// Feeds a received block into the throughput sample.
    pub fn record_block(&mut self, bytes: usize) -> u32 {
        self.throughput.record(bytes as u64)
    }

    pub fn throughput(&self) -> &ThroughputEstimator {
        &self.throughput
    }
}

async fn read_full<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut [u8]) -> Result<(), PeerError> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = stream.read(&mut buf[filled..]).await?;
        if read == 0 {
            return Err(PeerError::ConnectionClosed);
        }
        filled += read;
    }
    Ok(())
}
