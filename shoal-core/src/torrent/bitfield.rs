//! Piece-presence bitmap shared by the wire protocol and the resume file
//!
//! Bit `i` lives in byte `i / 8` at position `7 - i % 8` (MSB first).

use bytes::Bytes;

use super::PieceIndex;

/// Returns whether bit `index` is set. Panics if `buf` is too short.
pub fn has(buf: &[u8], index: usize) -> bool {
    (buf[index / 8] >> (7 - index % 8)) & 1 == 1
}

/// Sets bit `index`. Panics if `buf` is too short.
pub fn set(buf: &mut [u8], index: usize) {
    buf[index / 8] |= 1 << (7 - index % 8);
}

/// Number of bytes needed to hold `piece_count` bits.
pub fn byte_len(piece_count: usize) -> usize {
    piece_count.div_ceil(8)
}

/// Owned bitfield for a known number of pieces.
///
/// Out-of-range queries answer `false` and out-of-range sets are ignored,
/// which keeps a peer's oversized or undersized bitfield from panicking us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
}

impl Bitfield {
    /// Create empty bitfield sized for `piece_count` pieces
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0u8; byte_len(piece_count)],
        }
    }

    /// Wrap raw bytes as received from a peer or read from disk
    pub fn from_bytes(bits: impl Into<Vec<u8>>) -> Self {
        Self { bits: bits.into() }
    }

    pub fn has_piece(&self, piece_index: PieceIndex) -> bool {
        let index = piece_index.as_usize();
        index / 8 < self.bits.len() && has(&self.bits, index)
    }

    pub fn set_piece(&mut self, piece_index: PieceIndex) {
        let index = piece_index.as_usize();
        if index / 8 < self.bits.len() {
            set(&mut self.bits, index);
        }
    }

    /// Count of set bits among the first `piece_count` positions
    pub fn count_set(&self, piece_count: usize) -> usize {
        (0..piece_count)
            .filter(|&i| self.has_piece(PieceIndex::new(i as u32)))
            .count()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }
}
