//! Shared FIFO of pieces still to download
//!
//! Peer tasks claim pieces from the front. A claim owns its piece until it is
//! completed; dropping it for any reason (peer error, timeout, task abort)
//! puts the piece at the back of the queue for another peer.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::PieceIndex;
use super::descriptor::PieceDescriptor;

/// A piece waiting in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceWork {
    pub piece: PieceDescriptor,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<PieceWork>,
    in_flight: usize,
}

/// Multi-producer, multi-consumer piece queue.
///
/// Cloning shares the queue.
#[derive(Debug, Clone, Default)]
pub struct WorkQueue {
    state: Arc<Mutex<QueueState>>,
}

/// Result of asking the queue for work.
#[derive(Debug)]
pub enum Claim {
    /// A piece the caller now owns
    Piece(ClaimedPiece),
    /// Queued pieces exist, none passed the caller's filter, and nothing is
    /// in flight that could come back
    NoMatch,
    /// Nothing claimable right now, yet pieces are in flight and may come back
    Wait,
    /// Nothing queued and nothing in flight
    Drained,
}

impl WorkQueue {
    pub fn new(items: impl IntoIterator<Item = PieceWork>) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                pending: items.into_iter().collect(),
                in_flight: 0,
            })),
        }
    }

    /// Claims the first queued piece accepted by `wanted`.
    ///
    /// The scan and removal happen under one lock, so two callers never
    /// receive the same piece. While any piece is in flight an unmatched
    /// caller gets [`Claim::Wait`], never [`Claim::NoMatch`].
    pub fn claim_matching(&self, mut wanted: impl FnMut(&PieceDescriptor) -> bool) -> Claim {
        let mut state = self.state.lock();

        let idle = if state.in_flight == 0 {
            if state.pending.is_empty() {
                Claim::Drained
            } else {
                Claim::NoMatch
            }
        } else {
            Claim::Wait
        };

        let Some(position) = state.pending.iter().position(|work| wanted(&work.piece)) else {
            return idle;
        };
        let Some(work) = state.pending.remove(position) else {
            return idle;
        };
        state.in_flight += 1;

        Claim::Piece(ClaimedPiece {
            work,
            queue: self.clone(),
            settled: false,
        })
    }

    /// Claims the front piece whatever it is.
    pub fn claim(&self) -> Claim {
        self.claim_matching(|_| true)
    }

    /// Pieces waiting to be claimed
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    /// Pieces currently owned by a claim
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_empty() && state.in_flight == 0
    }

    /// Queued piece indices, front first
    pub fn pending_indices(&self) -> Vec<PieceIndex> {
        self.state
            .lock()
            .pending
            .iter()
            .map(|work| work.piece.index)
            .collect()
    }

    fn finish(&self, requeue: Option<PieceWork>) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if let Some(work) = requeue {
            state.pending.push_back(work);
        }
    }
}

/// Exclusive ownership of one piece taken from a [`WorkQueue`].
#[derive(Debug)]
pub struct ClaimedPiece {
    work: PieceWork,
    queue: WorkQueue,
    settled: bool,
}

impl ClaimedPiece {
    pub fn piece(&self) -> &PieceDescriptor {
        &self.work.piece
    }

    /// Marks the piece done; it will not be requeued.
    pub fn complete(mut self) {
        self.settled = true;
        self.queue.finish(None);
    }
}

impl Drop for ClaimedPiece {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(piece = %self.work.piece.index, "Requeueing unfinished piece");
            self.queue.finish(Some(self.work));
        }
    }
}
