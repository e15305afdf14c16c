use super::{block_len, blocks_in_piece, has_piece, Bitfield, Block, PiecePicker, PieceState};
use crate::torrent::{PieceHash, TorrentInfo};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of handing a received block to the manager
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    /// Not wanted: unknown, malformed, late duplicate or piece not in progress
    Ignored,
    /// Stored; `cancel` holds the other peers that had requested the same block
    Stored { cancel: Vec<SocketAddr> },
    /// Last missing block of the piece; it is now Verifying and `data` is the
    /// assembled piece
    PieceReady {
        index: usize,
        data: Vec<u8>,
        cancel: Vec<SocketAddr>,
    },
}

#[derive(Debug, Clone, Copy)]
struct Request {
    peer: SocketAddr,
    sent_at: Instant,
}

#[derive(Debug)]
struct Piece {
    hash: PieceHash,
    length: u32,
    state: PieceState,
    /// Blocks whose bytes are in `buffer`
    received: Bitfield,
    /// Blocks with at least one ledger entry
    requested: Bitfield,
    buffer: Option<Vec<u8>>,
    /// Peers that supplied bytes to the current attempt
    contributors: HashSet<SocketAddr>,
    failures: u32,
}

impl Piece {
    fn reset(&mut self) {
        self.state = PieceState::Missing;
        self.received.fill(false);
        self.requested.fill(false);
        self.buffer = None;
    }

    fn free_block(&self) -> Option<usize> {
        (0..self.received.len()).find(|&j| !self.received[j] && !self.requested[j])
    }
}

/// Single authority over piece and block state.
///
/// Pieces live in an index-addressed arena; every in-flight request is in the
/// ledger keyed by block. The manager is not synchronized itself: callers
/// share it behind one mutex so each method runs as an atomic unit.
#[derive(Debug)]
pub struct PieceManager {
    info: Arc<TorrentInfo>,
    block_size: u32,
    max_duplicates: usize,
    pieces: Vec<Piece>,
    picker: PiecePicker,
    ledger: HashMap<Block, Vec<Request>>,
    missing_count: usize,
    complete_count: usize,
    bytes_complete: u64,
}

impl PieceManager {
    pub fn new(info: Arc<TorrentInfo>, block_size: u32, max_duplicates: usize) -> Self {
        let pieces = info
            .pieces
            .iter()
            .enumerate()
            .map(|(index, hash)| {
                let length = info.piece_len(index) as u32;
                let blocks = blocks_in_piece(length, block_size);
                Piece {
                    hash: *hash,
                    length,
                    state: PieceState::Missing,
                    received: Bitfield::repeat(false, blocks),
                    requested: Bitfield::repeat(false, blocks),
                    buffer: None,
                    contributors: HashSet::new(),
                    failures: 0,
                }
            })
            .collect::<Vec<_>>();

        Self {
            block_size,
            max_duplicates: max_duplicates.max(1),
            picker: PiecePicker::new(pieces.len()),
            missing_count: pieces.len(),
            pieces,
            info,
            ledger: HashMap::new(),
            complete_count: 0,
            bytes_complete: 0,
        }
    }

    /// A peer announced its full bitfield
    pub fn add_peer_bitfield(&mut self, have: &Bitfield) {
        self.picker.add_bitfield(have);
    }

    /// A peer announced one more piece
    pub fn add_peer_have(&mut self, piece_index: usize) {
        self.picker.add_have(piece_index);
    }

    /// Forget a disconnected peer: uncount its pieces and release its requests
    pub fn remove_peer(&mut self, peer: SocketAddr, have: &Bitfield) -> Vec<Block> {
        self.picker.remove_bitfield(have);

        let held: Vec<Block> = self
            .ledger
            .iter()
            .filter(|(_, holders)| holders.iter().any(|r| r.peer == peer))
            .map(|(block, _)| *block)
            .collect();
        self.release(peer, &held);

        if !held.is_empty() {
            debug!("Released {} blocks held by {}", held.len(), peer);
        }
        held
    }

    /// Assign up to `max` blocks to `peer`, recording each in the ledger.
    ///
    /// Rarest piece first among the pieces `have` advertises; once no piece
    /// is Missing, blocks already in flight elsewhere may be handed out again.
    pub fn assign(&mut self, peer: SocketAddr, have: &Bitfield, max: usize, now: Instant) -> Vec<Block> {
        let mut assigned = Vec::new();

        while assigned.len() < max {
            let block = match self.next_free_block(have) {
                Some(block) => block,
                None if self.in_endgame() => match self.next_endgame_block(peer, have) {
                    Some(block) => block,
                    None => break,
                },
                None => break,
            };

            self.record(peer, block, now);
            assigned.push(block);
        }

        assigned
    }

    fn next_free_block(&self, have: &Bitfield) -> Option<Block> {
        let pieces = &self.pieces;
        let index = self.picker.pick(|i| {
            has_piece(have, i)
                && matches!(pieces[i].state, PieceState::Missing | PieceState::InProgress)
                && pieces[i].free_block().is_some()
        })?;

        let block_index = self.pieces[index].free_block()?;
        Some(self.block_at(index, block_index))
    }

    fn next_endgame_block(&self, peer: SocketAddr, have: &Bitfield) -> Option<Block> {
        self.ledger
            .iter()
            .filter(|(block, holders)| {
                let index = block.piece_index as usize;
                has_piece(have, index)
                    && self.pieces[index].state == PieceState::InProgress
                    && holders.len() < self.max_duplicates
                    && holders.iter().all(|r| r.peer != peer)
            })
            .min_by_key(|(block, holders)| (holders.len(), **block))
            .map(|(block, _)| *block)
    }

    fn in_endgame(&self) -> bool {
        self.missing_count == 0
    }

    fn block_at(&self, piece_index: usize, block_index: usize) -> Block {
        let length = self.pieces[piece_index].length;
        Block::new(
            piece_index as u32,
            block_index as u32 * self.block_size,
            block_len(length, self.block_size, block_index),
        )
    }

    fn record(&mut self, peer: SocketAddr, block: Block, now: Instant) {
        let index = block.piece_index as usize;
        let block_index = (block.offset / self.block_size) as usize;
        let piece = &mut self.pieces[index];

        if piece.state == PieceState::Missing {
            piece.state = PieceState::InProgress;
            piece.buffer = Some(vec![0u8; piece.length as usize]);
            self.missing_count -= 1;
            debug!("Started piece {}", index);
        }
        piece.requested.set(block_index, true);

        self.ledger
            .entry(block)
            .or_default()
            .push(Request { peer, sent_at: now });
    }

    /// Store a block sent by `peer`
    pub fn receive(&mut self, peer: SocketAddr, block: Block, data: &[u8]) -> Received {
        let index = block.piece_index as usize;
        let Some(piece) = self.pieces.get(index) else {
            return Received::Ignored;
        };

        let block_index = (block.offset / self.block_size) as usize;
        let well_formed = block.offset % self.block_size == 0
            && block_index < piece.received.len()
            && block.length as usize == data.len()
            && block_len(piece.length, self.block_size, block_index) == block.length;

        if !well_formed {
            warn!("Malformed block {:?} from {}", block, peer);
            self.release(peer, &[block]);
            return Received::Ignored;
        }
        if piece.state != PieceState::InProgress || piece.received[block_index] {
            self.release(peer, &[block]);
            return Received::Ignored;
        }

        let cancel: Vec<SocketAddr> = self
            .ledger
            .remove(&block)
            .unwrap_or_default()
            .into_iter()
            .map(|r| r.peer)
            .filter(|&p| p != peer)
            .collect();

        let piece = &mut self.pieces[index];
        piece.requested.set(block_index, false);
        piece.received.set(block_index, true);
        piece.contributors.insert(peer);

        let offset = block.offset as usize;
        if let Some(buffer) = piece.buffer.as_mut() {
            buffer[offset..offset + data.len()].copy_from_slice(data);
        }

        if piece.received.all() {
            piece.state = PieceState::Verifying;
            let data = piece.buffer.take().unwrap_or_default();
            debug!("Piece {} assembled, verifying", index);
            return Received::PieceReady {
                index,
                data,
                cancel,
            };
        }

        Received::Stored { cancel }
    }

    /// Drop `peer`'s ledger entries for `blocks`; blocks nobody else holds
    /// become assignable again
    pub fn release(&mut self, peer: SocketAddr, blocks: &[Block]) {
        for block in blocks {
            let Some(holders) = self.ledger.get_mut(block) else {
                continue;
            };
            holders.retain(|r| r.peer != peer);
            if holders.is_empty() {
                self.ledger.remove(block);
                self.clear_requested(block);
            }
        }
    }

    /// Drop every request older than `timeout`, regardless of its peer
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<(SocketAddr, Block)> {
        let mut expired = Vec::new();
        let mut emptied = Vec::new();

        self.ledger.retain(|block, holders| {
            holders.retain(|r| {
                let stale = now.saturating_duration_since(r.sent_at) >= timeout;
                if stale {
                    expired.push((r.peer, *block));
                }
                !stale
            });
            if holders.is_empty() {
                emptied.push(*block);
                false
            } else {
                true
            }
        });

        for block in &emptied {
            self.clear_requested(block);
        }
        if !expired.is_empty() {
            debug!("{} requests timed out", expired.len());
        }
        expired
    }

    fn clear_requested(&mut self, block: &Block) {
        let block_index = (block.offset / self.block_size) as usize;
        if let Some(piece) = self.pieces.get_mut(block.piece_index as usize) {
            if block_index < piece.requested.len() {
                piece.requested.set(block_index, false);
            }
        }
    }

    /// Verifying -> Complete after a matching hash and a successful write
    pub fn complete(&mut self, index: usize) -> bool {
        let Some(piece) = self.pieces.get_mut(index) else {
            return false;
        };
        if piece.state != PieceState::Verifying {
            return false;
        }

        piece.state = PieceState::Complete;
        piece.contributors.clear();
        self.complete_count += 1;
        self.bytes_complete += piece.length as u64;

        info!(
            "Piece {} complete ({}/{})",
            index,
            self.complete_count,
            self.pieces.len()
        );
        true
    }

    /// Verifying -> Missing after a hash mismatch; returns the peers whose
    /// blocks went into the bad piece
    pub fn reject(&mut self, index: usize) -> Vec<SocketAddr> {
        let Some(piece) = self.pieces.get_mut(index) else {
            return Vec::new();
        };
        if piece.state != PieceState::Verifying {
            return Vec::new();
        }

        piece.reset();
        piece.failures += 1;
        self.missing_count += 1;
        warn!("Piece {} failed verification ({} failures)", index, piece.failures);

        piece.contributors.drain().collect()
    }

    /// Verifying -> Missing without counting a failure
    pub fn abandon(&mut self, index: usize) {
        if let Some(piece) = self.pieces.get_mut(index) {
            if piece.state == PieceState::Verifying {
                piece.reset();
                piece.contributors.clear();
                self.missing_count += 1;
            }
        }
    }

    /// Missing -> Complete for a piece already present in storage
    pub fn mark_complete(&mut self, index: usize) -> bool {
        let Some(piece) = self.pieces.get_mut(index) else {
            return false;
        };
        if piece.state != PieceState::Missing {
            return false;
        }

        piece.state = PieceState::Complete;
        self.missing_count -= 1;
        self.complete_count += 1;
        self.bytes_complete += piece.length as u64;
        true
    }

    /// Whether `have` advertises any piece we still lack
    pub fn is_interesting(&self, have: &Bitfield) -> bool {
        self.pieces
            .iter()
            .enumerate()
            .any(|(i, piece)| piece.state != PieceState::Complete && has_piece(have, i))
    }

    pub fn state(&self, index: usize) -> Option<PieceState> {
        self.pieces.get(index).map(|p| p.state)
    }

    pub fn expected_hash(&self, index: usize) -> Option<PieceHash> {
        self.pieces.get(index).map(|p| p.hash)
    }

    /// Connected peers advertising piece `index`
    pub fn availability(&self, index: usize) -> u32 {
        self.picker.availability(index)
    }

    pub fn failures(&self, index: usize) -> u32 {
        self.pieces.get(index).map_or(0, |p| p.failures)
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn complete_count(&self) -> usize {
        self.complete_count
    }

    pub fn bytes_complete(&self) -> u64 {
        self.bytes_complete
    }

    pub fn bytes_left(&self) -> u64 {
        self.info.total_length - self.bytes_complete
    }

    pub fn is_complete(&self) -> bool {
        self.complete_count == self.pieces.len()
    }

    pub fn info(&self) -> &Arc<TorrentInfo> {
        &self.info
    }
}
