//! Peer identity, the shared peer set, and per-session throughput tracking.
//!
//! A `PeerRecord` is an immutable endpoint keyed by socket address. Anything
//! that changes during a session (choke state, advertised pieces, byte rate)
//! lives on the `PeerConnection` that owns the socket, so the set itself only
//! ever sees inserts and removals.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::PeerId;

/// Window every peer starts with, and the floor the formula never drops below
pub const DEFAULT_BACKLOG: u32 = 5;

/// Samples shorter than this accumulate and hold the current window
pub const MIN_SAMPLE_WINDOW: Duration = Duration::from_millis(500);

/// Candidate peer endpoint as handed over by peer discovery.
#[derive(Debug, Clone, Copy)]
pub struct PeerRecord {
    pub address: SocketAddr,
    pub peer_id: Option<PeerId>,
}

impl PeerRecord {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            peer_id: None,
        }
    }

    pub fn with_peer_id(address: SocketAddr, peer_id: PeerId) -> Self {
        Self {
            address,
            peer_id: Some(peer_id),
        }
    }

    /// Same endpoint with IPv4-mapped IPv6 addresses folded to plain IPv4.
    pub fn normalized(self) -> Self {
        let address = match self.address.ip() {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => SocketAddr::new(IpAddr::V4(v4), self.address.port()),
                None => self.address,
            },
            IpAddr::V4(_) => self.address,
        };
        Self { address, ..self }
    }
}

impl PartialEq for PeerRecord {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for PeerRecord {}

impl Hash for PeerRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

impl FromStr for PeerRecord {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s.parse()?).normalized())
    }
}

/// Concurrently shared set of peers participating in one download.
///
/// Cloning shares the underlying set. Peer tasks remove themselves on failure
/// while the swarm reads its size for statistics.
#[derive(Debug, Clone, Default)]
pub struct PeerSet {
    peers: Arc<Mutex<HashMap<SocketAddr, PeerRecord>>>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from candidates, keeping at most `max` distinct endpoints.
    pub fn from_records(records: impl IntoIterator<Item = PeerRecord>, max: usize) -> Self {
        let set = Self::new();
        set.merge(records, max);
        set
    }

    /// Adds candidates until the set holds `max` peers.
    ///
    /// Endpoints are normalized first and duplicates skipped. Returns how many
    /// peers were added.
    pub fn merge(&self, records: impl IntoIterator<Item = PeerRecord>, max: usize) -> usize {
        let mut peers = self.peers.lock();
        let mut added = 0;
        for record in records {
            if peers.len() >= max {
                break;
            }
            let record = record.normalized();
            if !peers.contains_key(&record.address) {
                peers.insert(record.address, record);
                added += 1;
            }
        }
        added
    }

    /// Returns false if the address was already present.
    pub fn insert(&self, record: PeerRecord) -> bool {
        let record = record.normalized();
        let mut peers = self.peers.lock();
        if peers.contains_key(&record.address) {
            return false;
        }
        peers.insert(record.address, record);
        true
    }

    pub fn remove(&self, address: &SocketAddr) -> Option<PeerRecord> {
        self.peers.lock().remove(address)
    }

    pub fn contains(&self, address: &SocketAddr) -> bool {
        self.peers.lock().contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Point-in-time copy of the members
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.lock().values().copied().collect()
    }
}

/// Request window for an observed download rate in KiB/s.
///
/// Slow peers get `rate + 2` outstanding blocks, faster ones `rate / 5 + 18`,
/// never fewer than [`DEFAULT_BACKLOG`].
pub fn backlog_for_rate(rate_kbps: u64) -> u32 {
    let backlog = if rate_kbps < 20 {
        rate_kbps + 2
    } else {
        rate_kbps / 5 + 18
    };
    backlog.clamp(DEFAULT_BACKLOG as u64, u32::MAX as u64) as u32
}

/// Rolling byte-rate sample for one session and the window derived from it.
#[derive(Debug, Clone)]
pub struct ThroughputEstimator {
    sample_start: Instant,
    sample_bytes: u64,
    total_bytes: u64,
    rate_kbps: u64,
    backlog: u32,
}

impl ThroughputEstimator {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(now: Instant) -> Self {
        Self {
            sample_start: now,
            sample_bytes: 0,
            total_bytes: 0,
            rate_kbps: 0,
            backlog: DEFAULT_BACKLOG,
        }
    }

    /// Feeds received block bytes and returns the current window.
    pub fn record(&mut self, bytes: u64) -> u32 {
        self.record_at(bytes, Instant::now())
    }

    /// As [`record`](Self::record) with an explicit clock reading.
    ///
    /// Until the open sample spans [`MIN_SAMPLE_WINDOW`] no rate is derived
    /// and the window is held at its last value ([`DEFAULT_BACKLOG`] before
    /// the first full sample).
    pub fn record_at(&mut self, bytes: u64, now: Instant) -> u32 {
        self.total_bytes += bytes;
        self.sample_bytes += bytes;

        let elapsed = now.saturating_duration_since(self.sample_start);
        if elapsed < MIN_SAMPLE_WINDOW {
            return self.backlog;
        }

        self.rate_kbps = (self.sample_bytes as f64 / 1024.0 / elapsed.as_secs_f64()) as u64;
        self.backlog = backlog_for_rate(self.rate_kbps);
        self.sample_start = now;
        self.sample_bytes = 0;
        self.backlog
    }

    pub fn backlog(&self) -> u32 {
        self.backlog
    }

    pub fn rate_kbps(&self) -> u64 {
        self.rate_kbps
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

impl Default for ThroughputEstimator {
    fn default() -> Self {
        Self::new()
    }
}
