//! Typed torrent metadata handed over by the descriptor parser
//!
//! The engine never parses bencode. It receives lengths, piece hashes and
//! the file layout already decoded, either constructed in code or loaded
//! from JSON with hex-encoded hashes.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use super::{InfoHash, PieceIndex, TorrentError};

/// One file of the torrent, relative to the download directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpan {
    pub path: PathBuf,
    pub length: u64,
}

impl FileSpan {
    pub fn new(path: impl Into<PathBuf>, length: u64) -> Self {
        Self {
            path: path.into(),
            length,
        }
    }
}

/// Everything needed to fetch and verify a single piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceDescriptor {
    pub index: PieceIndex,
    pub hash: [u8; 20],
    pub length: u32,
}

impl PieceDescriptor {
    /// Whether `data` hashes to this piece's expected SHA-1
    pub fn verify(&self, data: &[u8]) -> bool {
        data.len() == self.length as usize && Sha1::digest(data).as_slice() == self.hash
    }
}

/// Torrent metadata consumed by the download engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentDescriptor {
    #[serde(with = "hex_info_hash")]
    pub info_hash: InfoHash,
    pub total_length: u64,
    pub piece_length: u64,
    #[serde(with = "hex_hashes")]
    pub piece_hashes: Vec<[u8; 20]>,
    pub files: Vec<FileSpan>,
}

impl TorrentDescriptor {
    /// Builds a descriptor whose total length is the sum of `files`.
    pub fn new(info_hash: InfoHash, piece_length: u64, piece_hashes: Vec<[u8; 20]>, files: Vec<FileSpan>) -> Self {
        let total_length = files.iter().map(|file| file.length).sum();
        Self {
            info_hash,
            total_length,
            piece_length,
            piece_hashes,
            files,
        }
    }

    /// Parses JSON and validates the result.
    ///
    /// # Errors
    /// - `TorrentError::InvalidDescriptor` - Malformed JSON or inconsistent metadata
    pub fn from_json(json: &str) -> Result<Self, TorrentError> {
        let descriptor: Self = serde_json::from_str(json).map_err(|e| TorrentError::InvalidDescriptor {
            reason: e.to_string(),
        })?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of piece `index`; only the last piece may be short.
    ///
    /// Returns `None` for indices past the end.
    pub fn piece_len(&self, index: PieceIndex) -> Option<u32> {
        let start = (index.as_u32() as u64).checked_mul(self.piece_length)?;
        if index.as_usize() >= self.piece_count() || start >= self.total_length {
            return None;
        }
        let length = self.piece_length.min(self.total_length - start);
        u32::try_from(length).ok()
    }

    pub fn piece_descriptor(&self, index: PieceIndex) -> Option<PieceDescriptor> {
        Some(PieceDescriptor {
            index,
            hash: *self.piece_hashes.get(index.as_usize())?,
            length: self.piece_len(index)?,
        })
    }

    /// Checks the metadata is self-consistent.
    ///
    /// # Errors
    /// - `TorrentError::InvalidDescriptor` - Zero or oversized piece length,
    ///   hash count not matching the length, file lengths not summing to the
    ///   total, or a file path escaping the download directory
    pub fn validate(&self) -> Result<(), TorrentError> {
        let invalid = |reason: String| Err(TorrentError::InvalidDescriptor { reason });

        if self.piece_length == 0 {
            return invalid("piece length is zero".to_string());
        }
        if self.piece_length > u32::MAX as u64 {
            return invalid(format!("piece length {} is too large", self.piece_length));
        }
        if self.total_length == 0 {
            return invalid("torrent has no content".to_string());
        }

        let expected_pieces = self.total_length.div_ceil(self.piece_length);
        if self.piece_count() as u64 != expected_pieces {
            return invalid(format!(
                "{} piece hashes for {} pieces",
                self.piece_count(),
                expected_pieces
            ));
        }

        if self.files.is_empty() {
            return invalid("torrent lists no files".to_string());
        }
        let file_total: u64 = self.files.iter().map(|file| file.length).sum();
        if file_total != self.total_length {
            return invalid(format!(
                "files sum to {file_total} bytes, total length is {}",
                self.total_length
            ));
        }

        if let Some(file) = self.files.iter().find(|file| !is_contained(&file.path)) {
            return invalid(format!("file path {} leaves the download directory", file.path.display()));
        }

        Ok(())
    }
}

fn is_contained(path: &Path) -> bool {
    path.components().next().is_some()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

fn decode_hash<E: serde::de::Error>(text: &str) -> Result<[u8; 20], E> {
    let mut hash = [0u8; 20];
    hex::decode_to_slice(text, &mut hash).map_err(E::custom)?;
    Ok(hash)
}

mod hex_info_hash {
    use super::*;

    pub fn serialize<S: Serializer>(hash: &InfoHash, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(hash.as_bytes()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<InfoHash, D::Error> {
        let text = String::deserialize(deserializer)?;
        decode_hash(&text).map(InfoHash::new)
    }
}

mod hex_hashes {
    use super::*;

    pub fn serialize<S: Serializer>(hashes: &[[u8; 20]], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(hashes.iter().map(hex::encode))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<[u8; 20]>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|text| decode_hash(text))
            .collect()
    }
}
