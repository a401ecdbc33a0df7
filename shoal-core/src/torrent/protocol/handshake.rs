//! BitTorrent handshake serialization, exchange and validation

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::types::{PeerHandshake, PeerId};
use crate::torrent::{HandshakeFailure, InfoHash, PeerError};

/// Protocol string carried in every handshake
pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// pstrlen + pstr + reserved + info hash + peer id
pub const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

const RESERVED_START: usize = 20;
const INFO_HASH_START: usize = 28;
const PEER_ID_START: usize = 48;

/// Handshake serialization utilities for BitTorrent wire protocol.
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// Serializes handshake message following BEP 3
    pub fn serialize_handshake(handshake: &PeerHandshake) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL.len() as u8;
        buf[1..RESERVED_START].copy_from_slice(PROTOCOL);
        buf[RESERVED_START..INFO_HASH_START].copy_from_slice(&handshake.reserved);
        buf[INFO_HASH_START..PEER_ID_START].copy_from_slice(handshake.info_hash.as_bytes());
        buf[PEER_ID_START..].copy_from_slice(handshake.peer_id.as_bytes());
        buf
    }

    /// Deserializes a received handshake.
    ///
    /// # Errors
    /// - `HandshakeFailure::InvalidLength` - Not exactly 68 bytes
    /// - `HandshakeFailure::WrongProtocol` - Length byte or protocol string differs
    pub fn deserialize_handshake(data: &[u8]) -> Result<PeerHandshake, HandshakeFailure> {
        if data.len() != HANDSHAKE_LEN {
            return Err(HandshakeFailure::InvalidLength {
                received: data.len(),
            });
        }

        if data[0] as usize != PROTOCOL.len() || &data[1..RESERVED_START] != PROTOCOL {
            return Err(HandshakeFailure::WrongProtocol);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[RESERVED_START..INFO_HASH_START]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[INFO_HASH_START..PEER_ID_START]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[PEER_ID_START..]);

        Ok(PeerHandshake {
            reserved,
            info_hash: InfoHash::new(info_hash),
            peer_id: PeerId::new(peer_id),
        })
    }

    /// Checks a received handshake against the one we sent.
    ///
    /// Compares protocol field and info hash by content. The peer id is not
    /// checked; any id is accepted.
    ///
    /// # Errors
    /// - `HandshakeFailure` - Any of the deserialize failures, or `InfoHashMismatch`
    pub fn validate(sent: &PeerHandshake, received: &[u8]) -> Result<PeerHandshake, HandshakeFailure> {
        let remote = Self::deserialize_handshake(received)?;
        if remote.info_hash.as_bytes() != sent.info_hash.as_bytes() {
            return Err(HandshakeFailure::InfoHashMismatch);
        }
        Ok(remote)
    }
}

/// Sends our handshake and reads back exactly one handshake from the peer.
///
/// Has no deadline of its own; the caller bounds it.
///
/// # Errors
/// - `PeerError::ConnectionClosed` - Stream closed before any reply byte
/// - `PeerError::Handshake` - Short reply, wrong protocol or info hash mismatch
/// - `PeerError::Io` - Socket failure
pub async fn exchange_handshake<S>(stream: &mut S, ours: &PeerHandshake) -> Result<PeerHandshake, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&HandshakeCodec::serialize_handshake(ours))
        .await?;
    stream.flush().await?;

    let mut received = [0u8; HANDSHAKE_LEN];
    let mut filled = 0;
    while filled < HANDSHAKE_LEN {
        let read = stream.read(&mut received[filled..]).await?;
        if read == 0 {
            if filled == 0 {
                return Err(PeerError::ConnectionClosed);
            }
            return Err(HandshakeFailure::InvalidLength { received: filled }.into());
        }
        filled += read;
    }

    Ok(HandshakeCodec::validate(ours, &received)?)
}
