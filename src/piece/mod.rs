mod manager;
mod picker;

pub use manager::{PieceManager, Received};
pub use picker::PiecePicker;

use crate::torrent::PieceHash;
use bitvec::order::Msb0;
use bitvec::vec::BitVec;
use sha1::{Digest, Sha1};

/// Piece availability as sent in a `bitfield` message: bit `i` is piece `i`,
/// high bit of the first byte first.
pub type Bitfield = BitVec<u8, Msb0>;

/// Whether `have` advertises piece `index`; bits beyond its length read as absent
pub fn has_piece(have: &Bitfield, index: usize) -> bool {
    have.get(index).map_or(false, |bit| *bit)
}

/// State of a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    /// No block requested yet
    Missing,
    /// At least one block requested, not all received
    InProgress,
    /// Every block received, hash check pending
    Verifying,
    /// Hash matched and the piece was handed to storage
    Complete,
}

/// A block within a piece, the unit of transfer on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block {
    pub piece_index: u32,
    /// Byte offset within the piece
    pub offset: u32,
    pub length: u32,
}

impl Block {
    pub fn new(piece_index: u32, offset: u32, length: u32) -> Self {
        Self {
            piece_index,
            offset,
            length,
        }
    }
}

/// Number of blocks a piece of `piece_length` bytes splits into
pub fn blocks_in_piece(piece_length: u32, block_size: u32) -> usize {
    piece_length.div_ceil(block_size) as usize
}

/// Length of block `block_index`; the final block carries the remainder
pub fn block_len(piece_length: u32, block_size: u32, block_index: usize) -> u32 {
    let offset = block_index as u32 * block_size;
    block_size.min(piece_length - offset)
}

/// Compare the SHA1 of an assembled piece against its expected digest
pub fn verify(data: &[u8], expected: &PieceHash) -> bool {
    let digest = Sha1::digest(data);
    digest.as_slice() == expected.as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_len() {
        assert_eq!(block_len(32_768, 16_384, 0), 16_384);
        assert_eq!(block_len(32_768, 16_384, 1), 16_384);
        assert_eq!(block_len(24_930, 16_384, 1), 8_546);
    }

    #[test]
    fn test_blocks_in_piece() {
        assert_eq!(blocks_in_piece(16_384, 16_384), 1);
        assert_eq!(blocks_in_piece(16_385, 16_384), 2);
        assert_eq!(blocks_in_piece(100, 16_384), 1);
    }

    #[test]
    fn test_has_piece_out_of_range() {
        let mut have = Bitfield::repeat(false, 8);
        have.set(3, true);
        assert!(has_piece(&have, 3));
        assert!(!has_piece(&have, 2));
        assert!(!has_piece(&have, 200));
    }

    #[test]
    fn test_verify() {
        let data = b"hello piece";
        let hash = PieceHash::new(Sha1::digest(data).into());
        assert!(verify(data, &hash));
        assert!(!verify(b"tampered", &hash));
    }
}
