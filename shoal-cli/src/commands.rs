//! CLI command implementations

use std::path::{Path, PathBuf};

use clap::Subcommand;
use shoal_core::config::ShoalConfig;
use shoal_core::torrent::bitfield::byte_len;
use shoal_core::torrent::{Bitfield, PeerRecord, TorrentDescriptor, download_torrent};
use shoal_core::{Result, ShoalError};
use tokio::fs;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Download every missing piece of a torrent from the given peers
    Download {
        /// Path to the torrent descriptor (JSON, hex-encoded hashes)
        descriptor: PathBuf,
        /// Directory the torrent's files are written to
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
        /// Peer endpoint as addr:port, may be repeated
        #[arg(short, long = "peer")]
        peers: Vec<String>,
        /// File with one addr:port per line
        #[arg(long)]
        peers_file: Option<PathBuf>,
        /// Whole-download attempts before giving up
        #[arg(long, default_value_t = 2)]
        attempts: u32,
    },
    /// Show how many pieces are already on disk
    Status {
        /// Path to the torrent descriptor
        descriptor: PathBuf,
        /// Download directory holding the resume file
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
}

/// Handle the CLI command
///
/// Returns whether the command fully succeeded.
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> Result<bool> {
    match command {
        Commands::Download {
            descriptor,
            output,
            peers,
            peers_file,
            attempts,
        } => download(&descriptor, &output, &peers, peers_file.as_deref(), attempts).await,
        Commands::Status { descriptor, output } => show_status(&descriptor, &output).await,
    }
}

/// Download a torrent, retrying the whole download when it comes up short.
///
/// Every retry resumes from the pieces already persisted.
///
/// # Errors
/// - `ShoalError::Configuration` - Unparseable peer endpoint
/// - `ShoalError::Torrent` - Invalid descriptor, no peers, or disk failure
/// - `ShoalError::Io` - Descriptor or peers file unreadable
pub async fn download(
    descriptor_path: &Path,
    output: &Path,
    peer_args: &[String],
    peers_file: Option<&Path>,
    attempts: u32,
) -> Result<bool> {
    let config = ShoalConfig::from_env();
    let descriptor = load_descriptor(descriptor_path).await?;
    let peers = collect_peers(peer_args, peers_file).await?;

    println!("Downloading torrent {}", descriptor.info_hash);
    println!("  Pieces: {}", descriptor.piece_count());
    println!("  Peers: {}", peers.len());
    println!("  Output: {}", output.display());

    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        if download_torrent(peers.iter().copied(), &descriptor, output, &config).await? {
            println!("Download complete");
            return Ok(true);
        }
        tracing::warn!(attempt, attempts, "Download incomplete");
    }

    println!("Download incomplete after {attempts} attempt(s); run again to resume");
    Ok(false)
}

/// Show completed pieces according to the resume file.
///
/// # Errors
/// - `ShoalError::Torrent` - Invalid descriptor
/// - `ShoalError::Io` - Descriptor unreadable
pub async fn show_status(descriptor_path: &Path, output: &Path) -> Result<bool> {
    let config = ShoalConfig::default();
    let descriptor = load_descriptor(descriptor_path).await?;
    let total = descriptor.piece_count();

    let resume_path = output.join(config.storage.resume_file_name);
    let completed = match fs::read(&resume_path).await {
        Ok(bytes) if bytes.len() >= byte_len(total) => Bitfield::from_bytes(bytes).count_set(total),
        Ok(_) => 0,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e.into()),
    };

    println!("Torrent {}", descriptor.info_hash);
    println!(
        "  Completed: {completed}/{total} pieces ({:.1}%)",
        completed as f64 * 100.0 / total as f64
    );

    Ok(completed == total)
}

async fn load_descriptor(path: &Path) -> Result<TorrentDescriptor> {
    let json = fs::read_to_string(path).await?;
    Ok(TorrentDescriptor::from_json(&json)?)
}

async fn collect_peers(peer_args: &[String], peers_file: Option<&Path>) -> Result<Vec<PeerRecord>> {
    let mut entries: Vec<String> = peer_args.to_vec();
    if let Some(path) = peers_file {
        let listing = fs::read_to_string(path).await?;
        entries.extend(
            listing
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        );
    }

    entries
        .iter()
        .map(|entry| {
            entry
                .parse::<PeerRecord>()
                .map_err(|e| ShoalError::Configuration {
                    reason: format!("invalid peer endpoint '{entry}': {e}"),
                })
        })
        .collect()
}
