//! Test data creation for torrent testing.
//!
//! Deterministic torrent content with matching descriptors, and a loopback
//! seeder that serves it over the real wire protocol.

use std::net::SocketAddr;

use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::protocol::{HandshakeCodec, MessageCodec, MessageKind, PeerHandshake, PeerId, WireMessage};
use super::{Bitfield, FileSpan, InfoHash, PeerError, PieceIndex, TorrentDescriptor};

/// Torrent content together with the descriptor that verifies it.
#[derive(Debug, Clone)]
pub struct TestTorrent {
    pub descriptor: TorrentDescriptor,
    pub content: Vec<u8>,
}

impl TestTorrent {
    /// One file named `payload.bin`
    pub fn single_file(length: usize, piece_length: u64) -> Self {
        Self::with_files(&[("payload.bin", length)], piece_length)
    }

    /// Content is a repeating byte pattern so misplaced bytes show up.
    pub fn with_files(files: &[(&str, usize)], piece_length: u64) -> Self {
        let total: usize = files.iter().map(|(_, length)| length).sum();
        let content: Vec<u8> = (0..total).map(|i| (i * 7 % 251) as u8).collect();

        let piece_hashes: Vec<[u8; 20]> = content
            .chunks(piece_length as usize)
            .map(|piece| Sha1::digest(piece).into())
            .collect();
        let info_hash: [u8; 20] = Sha1::digest(piece_hashes.concat()).into();

        let spans = files
            .iter()
            .map(|(path, length)| FileSpan::new(*path, *length as u64))
            .collect();

        Self {
            descriptor: TorrentDescriptor::new(InfoHash::new(info_hash), piece_length, piece_hashes, spans),
            content,
        }
    }

    pub fn piece(&self, index: u32) -> &[u8] {
        let piece_length = self.descriptor.piece_length as usize;
        let start = index as usize * piece_length;
        let end = (start + piece_length).min(self.content.len());
        &self.content[start..end]
    }
}

/// Loopback peer holding the complete torrent.
pub struct Seeder {
    address: SocketAddr,
    task: JoinHandle<()>,
}

impl Seeder {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }
}

impl Drop for Seeder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Starts a seeder accepting any number of sessions.
pub async fn spawn_seeder(torrent: TestTorrent) -> Seeder {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    let task = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let torrent = torrent.clone();
            tokio::spawn(async move {
                let _ = serve(stream, torrent).await;
            });
        }
    });

    Seeder { address, task }
}

async fn serve(mut stream: TcpStream, torrent: TestTorrent) -> Result<(), PeerError> {
    let ours = PeerHandshake::new(torrent.descriptor.info_hash, PeerId::generate());
    let mut theirs = [0u8; 68];
    stream.read_exact(&mut theirs).await?;
    HandshakeCodec::validate(&ours, &theirs)?;
    stream
        .write_all(&HandshakeCodec::serialize_handshake(&ours))
        .await?;

    let piece_count = torrent.descriptor.piece_count();
    let mut pieces = Bitfield::new(piece_count);
    for index in 0..piece_count as u32 {
        pieces.set_piece(PieceIndex::new(index));
    }
    write_message(&mut stream, &WireMessage::bitfield(pieces.to_bytes())).await?;

    loop {
        let message = read_message(&mut stream).await?;
        match message.kind {
            MessageKind::Interested => write_message(&mut stream, &WireMessage::unchoke()).await?,
            MessageKind::Request => {
                let request = message.parse_request()?;
                let piece = torrent.piece(request.piece_index.as_u32());
                let start = request.begin as usize;
                let end = start + request.length as usize;
                write_message(
                    &mut stream,
                    &WireMessage::piece(request.piece_index, request.begin, &piece[start..end]),
                )
                .await?;
            }
            _ => {}
        }
    }
}

async fn write_message(stream: &mut TcpStream, message: &WireMessage) -> Result<(), PeerError> {
    stream
        .write_all(&MessageCodec::serialize_message(message))
        .await?;
    Ok(())
}

async fn read_message(stream: &mut TcpStream) -> Result<WireMessage, PeerError> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await?;
    let mut frame = prefix.to_vec();
    frame.resize(4 + u32::from_be_bytes(prefix) as usize, 0);
    stream.read_exact(&mut frame[4..]).await?;
    MessageCodec::deserialize_message(&frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_descriptor_is_valid() {
        let torrent = TestTorrent::with_files(&[("a.bin", 700), ("b/c.bin", 300)], 300);

        assert!(torrent.descriptor.validate().is_ok());
        assert_eq!(torrent.descriptor.piece_count(), 4);
        assert_eq!(torrent.piece(3).len(), 100);

        let last = torrent.descriptor.piece_descriptor(PieceIndex::new(3)).unwrap();
        assert!(last.verify(torrent.piece(3)));
    }
}
