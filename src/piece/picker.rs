use super::{has_piece, Bitfield};

/// Tracks how many connected peers advertise each piece (for rarest-first)
#[derive(Debug)]
pub struct PiecePicker {
    piece_availability: Vec<u32>,
}

impl PiecePicker {
    pub fn new(total_pieces: usize) -> Self {
        Self {
            piece_availability: vec![0; total_pieces],
        }
    }

    /// Count every piece in a newly connected peer's bitfield
    pub fn add_bitfield(&mut self, bitfield: &Bitfield) {
        for (index, count) in self.piece_availability.iter_mut().enumerate() {
            if has_piece(bitfield, index) {
                *count += 1;
            }
        }
    }

    /// Uncount a departing peer's pieces
    pub fn remove_bitfield(&mut self, bitfield: &Bitfield) {
        for (index, count) in self.piece_availability.iter_mut().enumerate() {
            if has_piece(bitfield, index) {
                *count = count.saturating_sub(1);
            }
        }
    }

    pub fn add_have(&mut self, piece_index: usize) {
        if let Some(count) = self.piece_availability.get_mut(piece_index) {
            *count += 1;
        }
    }

    pub fn availability(&self, piece_index: usize) -> u32 {
        self.piece_availability
            .get(piece_index)
            .copied()
            .unwrap_or(0)
    }

    /// Rarest piece accepted by `eligible`; ties go to the lowest index
    pub fn pick(&self, mut eligible: impl FnMut(usize) -> bool) -> Option<usize> {
        let mut best_piece = None;
        let mut lowest_availability = u32::MAX;

        for (piece_index, &availability) in self.piece_availability.iter().enumerate() {
            if availability >= lowest_availability {
                continue;
            }
            if eligible(piece_index) {
                lowest_availability = availability;
                best_piece = Some(piece_index);
            }
        }

        best_piece
    }
}
