//! Centralized configuration for Shoal.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::time::Duration;

/// Central configuration for all Shoal components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct ShoalConfig {
    pub torrent: TorrentConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
}

/// Piece exchange configuration.
///
/// Controls block sizing and how long a single piece attempt may take.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// BitTorrent client identifier
    pub client_id: &'static str,
    /// Largest block requested in one Request message
    pub block_size: u32,
    /// Deadline for downloading one whole piece from one peer
    pub piece_timeout: Duration,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            client_id: "-SH0001-",
            block_size: 16_384,
            piece_timeout: Duration::from_secs(30),
        }
    }
}

/// Peer connection configuration.
///
/// Controls connection limits and the deadline applied to every stage of
/// session establishment.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Handshake send + receive timeout
    pub handshake_timeout: Duration,
    /// Timeout for the peer's initial bitfield
    pub bitfield_timeout: Duration,
    /// Maximum concurrent peer connections
    pub max_peer_connections: usize,
    /// Pause before polling an empty work queue again
    pub queue_retry_backoff: Duration,
    /// Largest accepted length prefix on the wire
    pub max_message_length: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(5),
            bitfield_timeout: Duration::from_secs(6),
            max_peer_connections: 120,
            queue_retry_backoff: Duration::from_millis(100),
            max_message_length: 2 * 1024 * 1024 + 13, // 2 MiB block + piece header
        }
    }
}

/// Resume state configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Name of the resume bitmap inside the download directory
    pub resume_file_name: &'static str,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            resume_file_name: ".shoal-resume",
        }
    }
}

impl ShoalConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(count) = env_parse::<usize>("SHOAL_MAX_PEERS") {
            config.network.max_peer_connections = count;
        }

        if let Some(seconds) = env_parse::<u64>("SHOAL_PIECE_TIMEOUT") {
            config.torrent.piece_timeout = Duration::from_secs(seconds);
        }

        if let Some(seconds) = env_parse::<u64>("SHOAL_CONNECT_TIMEOUT") {
            config.network.connect_timeout = Duration::from_secs(seconds);
        }

        if let Some(seconds) = env_parse::<u64>("SHOAL_HANDSHAKE_TIMEOUT") {
            config.network.handshake_timeout = Duration::from_secs(seconds);
        }

        config
    }

    /// Creates a configuration optimized for loopback testing.
    pub fn for_testing() -> Self {
        Self {
            torrent: TorrentConfig {
                piece_timeout: Duration::from_secs(5),
                ..TorrentConfig::default()
            },
            network: NetworkConfig {
                connect_timeout: Duration::from_secs(1),
                handshake_timeout: Duration::from_secs(1),
                bitfield_timeout: Duration::from_secs(1),
                queue_retry_backoff: Duration::from_millis(10),
                ..NetworkConfig::default()
            },
            storage: StorageConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}
