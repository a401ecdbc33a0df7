//! Integration tests for swarm downloads.
//!
//! Each test runs real loopback seeders speaking the wire protocol through
//! the crate's own codecs, then drives `download_torrent` against them.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use shoal_core::config::ShoalConfig;
use shoal_core::storage::DiskManager;
use shoal_core::torrent::{
    Bitfield, FileSpan, HandshakeCodec, InfoHash, MessageCodec, MessageKind, PeerHandshake, PeerId,
    PeerRecord, PieceIndex, TorrentDescriptor, TorrentError, WireMessage, download_torrent,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// How a test seeder answers block requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behaviour {
    Honest,
    /// Piece replies with a payload too short to hold the header
    MalformedPiece,
    /// Correct framing, flipped content
    CorruptData,
    /// Unchokes, then never answers a request
    Stall,
}

struct TestTorrent {
    descriptor: TorrentDescriptor,
    content: Vec<u8>,
}

impl TestTorrent {
    fn new(files: &[(&str, usize)], piece_length: u64) -> Self {
        let total: usize = files.iter().map(|(_, length)| length).sum();
        let content: Vec<u8> = (0..total).map(|i| (i * 13 % 241) as u8).collect();
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

    fn piece(&self, index: u32) -> &[u8] {
        let piece_length = self.descriptor.piece_length as usize;
        let start = index as usize * piece_length;
        let end = (start + piece_length).min(self.content.len());
        &self.content[start..end]
    }

    fn piece_count(&self) -> u32 {
        self.descriptor.piece_count() as u32
    }

    fn file_content(&self, index: usize) -> &[u8] {
        let start: u64 = self.descriptor.files[..index].iter().map(|file| file.length).sum();
        let end = start + self.descriptor.files[index].length;
        &self.content[start as usize..end as usize]
    }
}

struct Seeder {
    address: SocketAddr,
    requested: Arc<Mutex<Vec<u32>>>,
    task: JoinHandle<()>,
}

impl Seeder {
    fn record(&self) -> PeerRecord {
        PeerRecord::new(self.address)
    }

    fn requested_pieces(&self) -> Vec<u32> {
        let mut pieces = self.requested.lock().clone();
        pieces.sort_unstable();
        pieces.dedup();
        pieces
    }
}

impl Drop for Seeder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn spawn_seeder(torrent: Arc<TestTorrent>, pieces: Vec<u32>, behaviour: Behaviour) -> Seeder {
    spawn_late_seeder(torrent, pieces, behaviour, Duration::ZERO).await
}

/// Seeder that holds back its bitfield for `delay` after the handshake.
async fn spawn_late_seeder(
    torrent: Arc<TestTorrent>,
    pieces: Vec<u32>,
    behaviour: Behaviour,
    delay: Duration,
) -> Seeder {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let requested = Arc::new(Mutex::new(Vec::new()));

    let log = Arc::clone(&requested);
    let task = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let torrent = Arc::clone(&torrent);
            let pieces = pieces.clone();
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                let _ = serve(stream, &torrent, &pieces, behaviour, delay, &log).await;
            });
        }
    });

    Seeder {
        address,
        requested,
        task,
    }
}

async fn full_seeder(torrent: &Arc<TestTorrent>, behaviour: Behaviour) -> Seeder {
    spawn_seeder(Arc::clone(torrent), (0..torrent.piece_count()).collect(), behaviour).await
}

async fn serve(
    mut stream: TcpStream,
    torrent: &TestTorrent,
    pieces: &[u32],
    behaviour: Behaviour,
    delay: Duration,
    requested: &Mutex<Vec<u32>>,
) -> std::io::Result<()> {
    let ours = PeerHandshake::new(torrent.descriptor.info_hash, PeerId::generate());
    let mut theirs = [0u8; 68];
    stream.read_exact(&mut theirs).await?;
    if HandshakeCodec::validate(&ours, &theirs).is_err() {
        return Ok(());
    }
    stream
        .write_all(&HandshakeCodec::serialize_handshake(&ours))
        .await?;

    tokio::time::sleep(delay).await;
    let mut bitfield = Bitfield::new(torrent.descriptor.piece_count());
    for &index in pieces {
        bitfield.set_piece(PieceIndex::new(index));
    }
    write_message(&mut stream, &WireMessage::bitfield(bitfield.to_bytes())).await?;

    loop {
        let message = read_message(&mut stream).await?;
        match message.kind {
            MessageKind::Interested => write_message(&mut stream, &WireMessage::unchoke()).await?,
            MessageKind::Request => {
                let Ok(request) = message.parse_request() else {
                    return Ok(());
                };
                let index = request.piece_index.as_u32();
                requested.lock().push(index);
                if !pieces.contains(&index) || behaviour == Behaviour::Stall {
                    continue;
                }

                let start = request.begin as usize;
                let end = start + request.length as usize;
                let mut block = torrent.piece(index)[start..end].to_vec();
                let reply = match behaviour {
                    Behaviour::Honest | Behaviour::Stall => WireMessage::piece(request.piece_index, request.begin, &block),
                    Behaviour::MalformedPiece => WireMessage::new(MessageKind::Piece, vec![0, 0, 0]),
                    Behaviour::CorruptData => {
                        for byte in &mut block {
                            *byte ^= 0xff;
                        }
                        WireMessage::piece(request.piece_index, request.begin, &block)
                    }
                };
                write_message(&mut stream, &reply).await?;
            }
            _ => {}
        }
    }
}

async fn write_message(stream: &mut TcpStream, message: &WireMessage) -> std::io::Result<()> {
    stream.write_all(&MessageCodec::serialize_message(message)).await
}

async fn read_message(stream: &mut TcpStream) -> std::io::Result<WireMessage> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await?;
    let mut frame = prefix.to_vec();
    frame.resize(4 + u32::from_be_bytes(prefix) as usize, 0);
    stream.read_exact(&mut frame[4..]).await?;
    MessageCodec::deserialize_message(&frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}

fn assert_files_match(torrent: &TestTorrent, dir: &Path) {
    for (index, file) in torrent.descriptor.files.iter().enumerate() {
        let written = std::fs::read(dir.join(&file.path)).unwrap();
        assert_eq!(
            written,
            torrent.file_content(index),
            "content of {}",
            file.path.display()
        );
    }
}

/// Short piece timeout so stalled attempts give up quickly.
fn impatient_config() -> ShoalConfig {
    let mut config = ShoalConfig::for_testing();
    config.torrent.piece_timeout = Duration::from_secs(1);
    config
}

fn three_file_torrent() -> Arc<TestTorrent> {
    // Pieces straddle both file boundaries
    Arc::new(TestTorrent::new(
        &[("album/01.flac", 50_000), ("album/02.flac", 70_001), ("cover.jpg", 9_999)],
        32_768,
    ))
}

#[tokio::test]
async fn test_multi_file_download_from_two_seeders() {
    let torrent = three_file_torrent();
    let first = full_seeder(&torrent, Behaviour::Honest).await;
    let second = full_seeder(&torrent, Behaviour::Honest).await;
    let dir = TempDir::new().unwrap();

    let complete = download_torrent(
        [first.record(), second.record()],
        &torrent.descriptor,
        dir.path(),
        &ShoalConfig::for_testing(),
    )
    .await
    .unwrap();

    assert!(complete);
    assert_files_match(&torrent, dir.path());

    let resume = std::fs::read(dir.path().join(".shoal-resume")).unwrap();
    let bitmap = Bitfield::from_bytes(resume);
    assert_eq!(bitmap.count_set(torrent.descriptor.piece_count()), 4);
}

#[tokio::test]
async fn test_malformed_peer_does_not_stop_download() {
    let torrent = three_file_torrent();
    let malformed = full_seeder(&torrent, Behaviour::MalformedPiece).await;
    let honest = full_seeder(&torrent, Behaviour::Honest).await;
    let dir = TempDir::new().unwrap();

    let complete = download_torrent(
        [malformed.record(), honest.record()],
        &torrent.descriptor,
        dir.path(),
        &ShoalConfig::for_testing(),
    )
    .await
    .unwrap();

    assert!(complete);
    assert_files_match(&torrent, dir.path());
    assert_eq!(honest.requested_pieces().len(), 4);
}

#[tokio::test]
async fn test_corrupt_peer_fails_hash_check_and_is_replaced() {
    let torrent = three_file_torrent();
    let corrupt = full_seeder(&torrent, Behaviour::CorruptData).await;
    let honest = full_seeder(&torrent, Behaviour::Honest).await;
    let dir = TempDir::new().unwrap();

    let complete = download_torrent(
        [corrupt.record(), honest.record()],
        &torrent.descriptor,
        dir.path(),
        &ShoalConfig::for_testing(),
    )
    .await
    .unwrap();

    assert!(complete);
    assert_files_match(&torrent, dir.path());
}

#[tokio::test]
async fn test_only_bad_peers_reports_incomplete() {
    let torrent = three_file_torrent();
    let malformed = full_seeder(&torrent, Behaviour::MalformedPiece).await;
    let dir = TempDir::new().unwrap();

    let complete = download_torrent(
        [malformed.record()],
        &torrent.descriptor,
        dir.path(),
        &ShoalConfig::for_testing(),
    )
    .await
    .unwrap();

    assert!(!complete);
}

#[tokio::test]
async fn test_stalled_piece_times_out_and_moves_to_another_peer() {
    let torrent = three_file_torrent();
    let stalled = full_seeder(&torrent, Behaviour::Stall).await;
    // The honest peer shows up after the stalled one has claimed piece 0
    let honest = spawn_late_seeder(
        Arc::clone(&torrent),
        (0..torrent.piece_count()).collect(),
        Behaviour::Honest,
        Duration::from_millis(200),
    )
    .await;
    let dir = TempDir::new().unwrap();

    let complete = download_torrent(
        [stalled.record(), honest.record()],
        &torrent.descriptor,
        dir.path(),
        &impatient_config(),
    )
    .await
    .unwrap();

    assert!(complete);
    assert_files_match(&torrent, dir.path());
    assert_eq!(stalled.requested_pieces(), vec![0]);
    assert_eq!(honest.requested_pieces(), vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_partial_peer_stays_for_piece_requeued_by_stalled_peer() {
    let torrent = Arc::new(TestTorrent::new(&[("payload.bin", 3000)], 1000));
    let stalled = full_seeder(&torrent, Behaviour::Stall).await;
    let first_half = spawn_late_seeder(
        Arc::clone(&torrent),
        vec![0, 1],
        Behaviour::Honest,
        Duration::from_millis(200),
    )
    .await;
    let last_piece = spawn_late_seeder(
        Arc::clone(&torrent),
        vec![2],
        Behaviour::Honest,
        Duration::from_millis(400),
    )
    .await;
    let dir = TempDir::new().unwrap();

    let complete = download_torrent(
        [stalled.record(), first_half.record(), last_piece.record()],
        &torrent.descriptor,
        dir.path(),
        &impatient_config(),
    )
    .await
    .unwrap();

    // Piece 0 only comes back after the stall times out, by which point the
    // first-half peer has nothing else it can serve
    assert!(complete);
    assert_files_match(&torrent, dir.path());
    assert_eq!(first_half.requested_pieces(), vec![0, 1]);
    assert_eq!(last_piece.requested_pieces(), vec![2]);
}

#[tokio::test]
async fn test_disk_failure_aborts_download() {
    let torrent = three_file_torrent();
    let first = full_seeder(&torrent, Behaviour::Honest).await;
    let second = full_seeder(&torrent, Behaviour::Honest).await;
    let dir = TempDir::new().unwrap();
    // A directory where the first data file belongs cannot be written
    std::fs::create_dir_all(dir.path().join("album/01.flac")).unwrap();

    let result = download_torrent(
        [first.record(), second.record()],
        &torrent.descriptor,
        dir.path(),
        &ShoalConfig::for_testing(),
    )
    .await;

    assert!(matches!(result, Err(TorrentError::Storage(_))), "got {result:?}");

    let storage = DiskManager::open(dir.path(), &torrent.descriptor, &ShoalConfig::for_testing().storage)
        .await
        .unwrap();
    assert!(!storage.has_piece(PieceIndex::new(0)));
}

#[tokio::test]
async fn test_restart_resumes_from_persisted_pieces() {
    let torrent = three_file_torrent();
    let dir = TempDir::new().unwrap();
    let config = ShoalConfig::for_testing();

    // First run: the only peer holds pieces 0 and 2
    let partial = spawn_seeder(Arc::clone(&torrent), vec![0, 2], Behaviour::Honest).await;
    let complete = download_torrent([partial.record()], &torrent.descriptor, dir.path(), &config)
        .await
        .unwrap();
    assert!(!complete);
    drop(partial);

    let storage = DiskManager::open(dir.path(), &torrent.descriptor, &config.storage)
        .await
        .unwrap();
    assert!(storage.has_piece(PieceIndex::new(0)));
    assert!(!storage.has_piece(PieceIndex::new(1)));
    assert!(storage.has_piece(PieceIndex::new(2)));
    assert!(!storage.has_piece(PieceIndex::new(3)));
    drop(storage);

    // Second run only fetches what is missing
    let full = full_seeder(&torrent, Behaviour::Honest).await;
    let complete = download_torrent([full.record()], &torrent.descriptor, dir.path(), &config)
        .await
        .unwrap();

    assert!(complete);
    assert_eq!(full.requested_pieces(), vec![1, 3]);
    assert_files_match(&torrent, dir.path());
}

#[tokio::test]
async fn test_duplicate_and_mapped_endpoints_are_merged() {
    let torrent = three_file_torrent();
    let seeder = full_seeder(&torrent, Behaviour::Honest).await;
    let dir = TempDir::new().unwrap();
    let mapped: PeerRecord = format!("[::ffff:127.0.0.1]:{}", seeder.address.port())
        .parse()
        .unwrap();

    let complete = download_torrent(
        [seeder.record(), mapped, seeder.record()],
        &torrent.descriptor,
        dir.path(),
        &ShoalConfig::for_testing(),
    )
    .await
    .unwrap();

    assert!(complete);
    assert_eq!(mapped.address, seeder.address);
}

#[tokio::test]
async fn test_download_requires_peers() {
    let torrent = three_file_torrent();
    let dir = TempDir::new().unwrap();

    let result = download_torrent(
        Vec::<PeerRecord>::new(),
        &torrent.descriptor,
        dir.path(),
        &ShoalConfig::for_testing(),
    )
    .await;

    assert!(matches!(result, Err(TorrentError::NoPeersAvailable)));
}

#[tokio::test]
async fn test_invalid_descriptor_is_rejected_before_io() {
    let torrent = three_file_torrent();
    let mut descriptor = torrent.descriptor.clone();
    descriptor.piece_hashes.pop();
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("never-created");

    let result = download_torrent(Vec::<PeerRecord>::new(), &descriptor, &target, &ShoalConfig::for_testing()).await;

    assert!(matches!(result, Err(TorrentError::InvalidDescriptor { .. })));
    assert!(!target.exists());
}
