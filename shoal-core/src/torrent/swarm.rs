//! Multi-peer download coordination
//!
//! One task per peer pulls pieces from a shared [`WorkQueue`], downloads and
//! verifies them, and hands them to storage. Peer failures stay inside the
//! failing task: its piece is requeued, the peer leaves the set, everyone
//! else carries on. A storage failure aborts every task.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, timeout_at};

use super::downloader::PieceProgress;
use super::peers::{PeerRecord, PeerSet};
use super::protocol::{PeerId, WireMessage};
use super::work_queue::{Claim, PieceWork, WorkQueue};
use super::{PeerConnection, PeerError, PieceIndex, TimeoutStage, TorrentDescriptor, TorrentError};
use crate::config::ShoalConfig;
use crate::storage::{DiskManager, PieceStorage, StorageError};

/// Point-in-time view of a running download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwarmStats {
    pub completed_pieces: usize,
    pub total_pieces: usize,
    pub active_peers: usize,
    pub queued_pieces: usize,
}

/// Why a peer session stopped.
#[derive(Debug, thiserror::Error)]
enum SessionError {
    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// How a peer left without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Departure {
    Drained,
    NothingToOffer,
}

struct Shared {
    descriptor: TorrentDescriptor,
    storage: Arc<dyn PieceStorage>,
    peers: PeerSet,
    queue: WorkQueue,
    completed: AtomicUsize,
    local_id: PeerId,
    config: ShoalConfig,
}

/// Owns the work queue and peer set for one torrent.
///
/// Cloning shares the same download state, so a clone can report
/// [`stats`](Self::stats) while another drives [`download`](Self::download).
#[derive(Clone)]
pub struct SwarmManager {
    shared: Arc<Shared>,
}

impl SwarmManager {
    /// Seeds the queue with every piece the storage does not have yet.
    pub fn new(
        descriptor: TorrentDescriptor,
        storage: Arc<dyn PieceStorage>,
        peers: PeerSet,
        config: ShoalConfig,
    ) -> Self {
        let completed = storage.completed_pieces();
        let work = (0..descriptor.piece_count() as u32)
            .map(PieceIndex::new)
            .filter(|&index| !completed.has_piece(index))
            .filter_map(|index| descriptor.piece_descriptor(index))
            .map(|piece| PieceWork { piece });
        let queue = WorkQueue::new(work);
        let already_done = descriptor.piece_count() - queue.len();
        let local_id = PeerId::generate_with_prefix(config.torrent.client_id.as_bytes());

        Self {
            shared: Arc::new(Shared {
                descriptor,
                storage,
                peers,
                queue,
                completed: AtomicUsize::new(already_done),
                local_id,
                config,
            }),
        }
    }

    pub fn stats(&self) -> SwarmStats {
        SwarmStats {
            completed_pieces: self.shared.completed.load(Ordering::SeqCst),
            total_pieces: self.shared.descriptor.piece_count(),
            active_peers: self.shared.peers.len(),
            queued_pieces: self.shared.queue.len(),
        }
    }

    pub fn peers(&self) -> &PeerSet {
        &self.shared.peers
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.shared.local_id
    }

    /// Runs one task per peer until the queue drains or every peer is gone.
    ///
    /// Returns whether every piece is now complete.
    ///
    /// # Errors
    /// - `TorrentError::NoPeersAvailable` - Pieces are missing and the peer set is empty
    /// - `TorrentError::Storage` - A piece could not be persisted
    pub async fn download(&self) -> Result<bool, TorrentError> {
        let shared = &self.shared;
        let total = shared.descriptor.piece_count();

        if shared.queue.is_drained() {
            tracing::info!(total, "All pieces already on disk");
            shared.storage.close().await?;
            return Ok(true);
        }
        if shared.peers.is_empty() {
            return Err(TorrentError::NoPeersAvailable);
        }

        tracing::info!(
            info_hash = %shared.descriptor.info_hash,
            peers = shared.peers.len(),
            missing = shared.queue.len(),
            total,
            "Starting swarm download"
        );

        let mut tasks = JoinSet::new();
        for record in shared.peers.snapshot() {
            tasks.spawn(run_peer(Arc::clone(shared), record));
        }

        let mut fatal = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::error!(error = %error, "Storage failure, aborting download");
                    if fatal.is_none() {
                        fatal = Some(error);
                    }
                    tasks.abort_all();
                }
                Err(join_error) if join_error.is_cancelled() => {}
                Err(join_error) => {
                    tracing::warn!(error = %join_error, "Peer task panicked");
                }
            }
        }

        let closed = shared.storage.close().await;
        if let Some(error) = fatal {
            return Err(error.into());
        }
        closed?;

        let completed = shared.completed.load(Ordering::SeqCst);
        tracing::info!(completed, total, "Swarm download finished");
        Ok(completed == total)
    }
}

async fn run_peer(shared: Arc<Shared>, record: PeerRecord) -> Result<(), StorageError> {
    let address = record.address;
    let mut connection = match PeerConnection::establish(
        address,
        shared.descriptor.info_hash,
        shared.local_id,
        &shared.config.network,
    )
    .await
    {
        Ok(connection) => connection,
        Err(error) => {
            tracing::debug!(peer = %address, error = %error, "Could not establish session");
            shared.peers.remove(&address);
            return Ok(());
        }
    };

    let outcome = exchange_pieces(&shared, &mut connection).await;
    connection.shutdown().await;

    match outcome {
        Ok(Departure::Drained) => {
            tracing::debug!(peer = %address, "Queue drained, peer done");
            Ok(())
        }
        Ok(Departure::NothingToOffer) => {
            tracing::debug!(peer = %address, "Peer has none of the remaining pieces");
            shared.peers.remove(&address);
            Ok(())
        }
        Err(SessionError::Peer(error)) => {
            drop_peer(&shared, address, &error);
            Ok(())
        }
        Err(SessionError::Storage(error)) => Err(error),
    }
}

fn drop_peer(shared: &Shared, address: SocketAddr, error: &PeerError) {
    tracing::warn!(peer = %address, error = %error, "Dropping peer");
    shared.peers.remove(&address);
}

async fn exchange_pieces<S>(
    shared: &Shared,
    connection: &mut PeerConnection<S>,
) -> Result<Departure, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let total = shared.descriptor.piece_count();
    let piece_timeout = shared.config.torrent.piece_timeout;
    let block_size = shared.config.torrent.block_size;

    loop {
        let claimed = match shared
            .queue
            .claim_matching(|piece| connection.has_piece(piece.index))
        {
            Claim::Piece(claimed) => claimed,
            Claim::Wait => {
                sleep(shared.config.network.queue_retry_backoff).await;
                continue;
            }
            Claim::NoMatch => return Ok(Departure::NothingToOffer),
            Claim::Drained => return Ok(Departure::Drained),
        };
        let piece = *claimed.piece();

        connection.announce_interest().await?;

        let deadline = Instant::now() + piece_timeout;
        let attempt = PieceProgress::with_block_size(piece, block_size)
            .download(connection, shared.storage.as_ref());
        let data = timeout_at(deadline, attempt)
            .await
            .map_err(|_| PeerError::Timeout {
                stage: TimeoutStage::Piece,
            })??;

        if !piece.verify(&data) {
            return Err(PeerError::violation(format!("piece {} failed hash check", piece.index)).into());
        }

        shared.storage.write_piece(piece.index, &data).await?;
        claimed.complete();
        let completed = shared.completed.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            peer = %connection.address(),
            piece = %piece.index,
            "Piece verified ({completed}/{total})"
        );

        connection.send_message(&WireMessage::have(piece.index)).await?;
    }
}

/// Downloads every missing piece of `descriptor` into `download_dir`.
///
/// `peers` are deduplicated and capped at the configured connection limit.
/// Returns `Ok(false)` when the swarm ran dry before every piece arrived;
/// calling again resumes from the persisted bitmap.
///
/// # Errors
/// - `TorrentError::InvalidDescriptor` - Descriptor metadata is inconsistent
/// - `TorrentError::NoPeersAvailable` - Pieces are missing and no peers were given
/// - `TorrentError::Storage` - Files could not be opened or written
pub async fn download_torrent(
    peers: impl IntoIterator<Item = PeerRecord>,
    descriptor: &TorrentDescriptor,
    download_dir: &Path,
    config: &ShoalConfig,
) -> Result<bool, TorrentError> {
    descriptor.validate()?;

    let peer_set = PeerSet::from_records(peers, config.network.max_peer_connections);
    let storage = DiskManager::open(download_dir, descriptor, &config.storage).await?;
    let swarm = SwarmManager::new(descriptor.clone(), Arc::new(storage), peer_set, config.clone());

    swarm.download().await
}
