//! Piece placement across the torrent's files plus the resume bitmap
//!
//! The ordered file list forms one contiguous byte space; byte `b` of piece
//! `p` lives at `p * piece_length + b` in that space. A piece may straddle
//! several files. After every successful piece write the piece's bit is set
//! and the whole bitmap is rewritten to the resume file.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::future::try_join_all;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{PieceStorage, StorageError};
use crate::config::StorageConfig;
use crate::torrent::bitfield::byte_len;
use crate::torrent::{Bitfield, PieceIndex, TorrentDescriptor};

/// A contiguous run of bytes inside one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Segment {
    pub file: usize,
    pub offset: u64,
    pub length: u64,
}

struct FileSlot {
    path: PathBuf,
    length: u64,
    // Per-file lock; the handle is opened on first use
    handle: Mutex<Option<File>>,
}

/// File-backed piece store for one torrent.
pub struct DiskManager {
    root: PathBuf,
    piece_length: u64,
    total_length: u64,
    piece_count: usize,
    files: Vec<FileSlot>,
    resume_path: PathBuf,
    resume_file: Mutex<File>,
    completed: parking_lot::Mutex<Bitfield>,
}

impl DiskManager {
    /// Opens the store rooted at `root`, loading any existing resume bitmap.
    ///
    /// A resume file shorter than `ceil(piece_count / 8)` bytes is ignored and
    /// the download starts from scratch.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - Directory or resume file could not be created or read
    pub async fn open(
        root: impl Into<PathBuf>,
        descriptor: &TorrentDescriptor,
        config: &StorageConfig,
    ) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let resume_path = root.join(config.resume_file_name);
        let mut resume_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&resume_path)
            .await?;

        let piece_count = descriptor.piece_count();
        let bitmap_len = byte_len(piece_count);
        let mut existing = Vec::new();
        resume_file.read_to_end(&mut existing).await?;

        let completed = if existing.len() >= bitmap_len {
            existing.truncate(bitmap_len);
            Bitfield::from_bytes(existing)
        } else {
            if !existing.is_empty() {
                tracing::warn!(
                    path = %resume_path.display(),
                    found = existing.len(),
                    expected = bitmap_len,
                    "Ignoring short resume file"
                );
            }
            Bitfield::new(piece_count)
        };

        tracing::debug!(
            root = %root.display(),
            completed = completed.count_set(piece_count),
            total = piece_count,
            "Opened piece store"
        );

        let files = descriptor
            .files
            .iter()
            .map(|span| FileSlot {
                path: root.join(&span.path),
                length: span.length,
                handle: Mutex::new(None),
            })
            .collect();

        Ok(Self {
            root,
            piece_length: descriptor.piece_length,
            total_length: descriptor.total_length,
            piece_count,
            files,
            resume_path,
            resume_file: Mutex::new(resume_file),
            completed: parking_lot::Mutex::new(completed),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resume_path(&self) -> &Path {
        &self.resume_path
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    pub fn has_piece(&self, index: PieceIndex) -> bool {
        self.completed.lock().has_piece(index)
    }

    pub fn completed_pieces(&self) -> Bitfield {
        self.completed.lock().clone()
    }

    fn piece_len(&self, index: PieceIndex) -> Option<u64> {
        if index.as_usize() >= self.piece_count {
            return None;
        }
        let start = index.as_u32() as u64 * self.piece_length;
        (start < self.total_length).then(|| self.piece_length.min(self.total_length - start))
    }

    /// Maps a byte range of the torrent space onto file segments.
    ///
    /// Returns `None` if the range runs past the last file.
    pub(crate) fn segments(&self, offset: u64, length: u64) -> Option<Vec<Segment>> {
        let mut offset = offset;
        let mut remaining = length;
        let mut segments = Vec::new();

        for (file, slot) in self.files.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            if offset >= slot.length {
                offset -= slot.length;
                continue;
            }
            let length = (slot.length - offset).min(remaining);
            segments.push(Segment {
                file,
                offset,
                length,
            });
            remaining -= length;
            offset = 0;
        }

        (remaining == 0).then_some(segments)
    }

    async fn open_slot(slot: &FileSlot) -> Result<File, std::io::Error> {
        if let Some(parent) = slot.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&slot.path)
            .await
    }

    /// Writes a verified piece, then records it in the resume file.
    ///
    /// # Errors
    ///
    /// - `StorageError::PieceOutOfRange` - Index beyond the torrent
    /// - `StorageError::FilesystemError` - Data length does not match the piece
    /// - `StorageError::Io` - File or resume write failed
    pub async fn write_piece(&self, index: PieceIndex, data: &[u8]) -> Result<(), StorageError> {
        let piece_len = self
            .piece_len(index)
            .ok_or(StorageError::PieceOutOfRange { index })?;
        if data.len() as u64 != piece_len {
            return Err(StorageError::FilesystemError {
                message: format!("piece {index} is {} bytes, expected {piece_len}", data.len()),
            });
        }

        let start = index.as_u32() as u64 * self.piece_length;
        let segments = self
            .segments(start, piece_len)
            .ok_or(StorageError::PieceOutOfRange { index })?;

        let mut written = 0usize;
        for segment in segments {
            let slot = &self.files[segment.file];
            let end = written + segment.length as usize;

            let mut handle = slot.handle.lock().await;
            if handle.is_none() {
                *handle = Some(Self::open_slot(slot).await?);
            }
            if let Some(file) = handle.as_mut() {
                file.seek(SeekFrom::Start(segment.offset)).await?;
                file.write_all(&data[written..end]).await?;
                file.flush().await?;
            }
            written = end;
        }

        self.mark_complete(index).await
    }

    async fn mark_complete(&self, index: PieceIndex) -> Result<(), StorageError> {
        let mut resume_file = self.resume_file.lock().await;
        let bitmap = {
            let mut completed = self.completed.lock();
            completed.set_piece(index);
            completed.as_bytes().to_vec()
        };

        resume_file.seek(SeekFrom::Start(0)).await?;
        resume_file.write_all(&bitmap).await?;
        resume_file.set_len(bitmap.len() as u64).await?;
        resume_file.flush().await?;
        Ok(())
    }

    /// Reads `length` bytes at `begin` within a completed piece.
    ///
    /// `None` when the piece is not marked complete, the range falls outside
    /// it, or any file comes up short.
    pub async fn read_block(&self, index: PieceIndex, begin: u32, length: u32) -> Option<Vec<u8>> {
        if !self.has_piece(index) {
            return None;
        }
        let piece_len = self.piece_len(index)?;
        let end = begin as u64 + length as u64;
        if length == 0 || end > piece_len {
            return None;
        }

        let start = index.as_u32() as u64 * self.piece_length + begin as u64;
        let segments = self.segments(start, length as u64)?;

        let mut block = vec![0u8; length as usize];
        let mut filled = 0usize;
        for segment in segments {
            let slot = &self.files[segment.file];
            let end = filled + segment.length as usize;

            let mut handle = slot.handle.lock().await;
            if handle.is_none() {
                *handle = Some(Self::open_slot(slot).await.ok()?);
            }
            let file = handle.as_mut()?;
            if let Err(e) = read_segment(file, segment.offset, &mut block[filled..end]).await {
                tracing::debug!(
                    path = %slot.path.display(),
                    piece = %index,
                    error = %e,
                    "Short read while serving block"
                );
                return None;
            }
            filled = end;
        }

        Some(block)
    }

    /// Reads a whole completed piece.
    pub async fn read_piece(&self, index: PieceIndex) -> Option<Vec<u8>> {
        let length = u32::try_from(self.piece_len(index)?).ok()?;
        self.read_block(index, 0, length).await
    }

    /// Syncs and closes every open file handle and the resume file.
    ///
    /// Later writes reopen files on demand.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - Sync failed
    pub async fn close(&self) -> Result<(), StorageError> {
        let syncs = self.files.iter().map(|slot| async move {
            if let Some(file) = slot.handle.lock().await.take() {
                file.sync_all().await?;
            }
            Ok::<_, StorageError>(())
        });
        try_join_all(syncs).await?;

        self.resume_file.lock().await.sync_all().await?;
        tracing::debug!(root = %self.root.display(), "Closed piece store");
        Ok(())
    }
}

async fn read_segment(file: &mut File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset)).await?;
    file.read_exact(buf).await?;
    Ok(())
}

#[async_trait]
impl PieceStorage for DiskManager {
    fn piece_count(&self) -> usize {
        self.piece_count
    }

    fn has_piece(&self, index: PieceIndex) -> bool {
        DiskManager::has_piece(self, index)
    }

    fn completed_pieces(&self) -> Bitfield {
        DiskManager::completed_pieces(self)
    }

    async fn write_piece(&self, index: PieceIndex, data: &[u8]) -> Result<(), StorageError> {
        DiskManager::write_piece(self, index, data).await
    }

    async fn read_block(&self, index: PieceIndex, begin: u32, length: u32) -> Option<Vec<u8>> {
        DiskManager::read_block(self, index, begin, length).await
    }

    async fn close(&self) -> Result<(), StorageError> {
        DiskManager::close(self).await
    }
}
