//! A single piece's in-progress block buffer, verification, and reset.

use sha1::{Digest, Sha1};

use crate::{block_count, block_len, Bitfield, Sha1Hash, BLOCK_LEN};

/// An explicit bit-array abstraction over a piece's block arrival map.
///
/// Kept distinct from a `Vec<bool>` so that `all()` and `count()` are O(words)
/// rather than O(bits), and so the arrival map reads the same way the peer's
/// piece-availability bitfield does.
#[derive(Debug, Clone)]
pub(crate) struct BlockBitmap(Bitfield);

impl BlockBitmap {
    fn new(len: usize) -> Self {
        Self(Bitfield::repeat(false, len))
    }

    pub(crate) fn get(&self, index: usize) -> bool {
        self.0[index]
    }

    pub(crate) fn set(&mut self, index: usize, value: bool) {
        self.0.set(index, value);
    }

    pub(crate) fn all(&self) -> bool {
        self.0.all()
    }

    pub(crate) fn count(&self) -> usize {
        self.0.count_ones()
    }

    fn clear(&mut self) {
        self.0.fill(false);
    }
}

/// Why a delivered block could not be recorded.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DeliverError {
    /// `begin` does not fall on a block boundary, or is past the piece.
    InvalidBegin,
    /// The payload's length doesn't match the declared length of the block
    /// at `begin`.
    InvalidLength,
}

/// A piece's write buffer: the blocks received so far, and the bitmap
/// tracking which of the piece's blocks have arrived.
///
/// A piece is *complete* once every block bit is set; it is *verified* once
/// its concatenated payload's SHA-1 digest matches the metainfo's expected
/// hash for this piece (checked by the caller via [`Piece::verify`]).
#[derive(Debug)]
pub(crate) struct Piece {
    len: u32,
    blocks: Vec<Vec<u8>>,
    arrived: BlockBitmap,
    /// Tracks which blocks have already been handed out by
    /// [`Piece::next_block_to_request`], so that two peers racing on the
    /// same piece don't request the same block twice.
    requested: BlockBitmap,
}

impl Piece {
    pub(crate) fn new(len: u32) -> Self {
        let block_count = block_count(len);
        Self {
            len,
            blocks: vec![Vec::new(); block_count],
            arrived: BlockBitmap::new(block_count),
            requested: BlockBitmap::new(block_count),
        }
    }

    pub(crate) fn len(&self) -> u32 {
        self.len
    }

    /// Returns the `(begin, length)` of the block at `block_index`.
    pub(crate) fn block_at(&self, block_index: usize) -> Option<(u32, u32)> {
        if block_index >= self.blocks.len() {
            return None;
        }
        let begin = block_index as u32 * BLOCK_LEN;
        Some((begin, block_len(self.len, block_index)))
    }

    pub(crate) fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Finds the first block that hasn't been requested yet and marks it as
    /// requested, by a simple linear scan. Returns `(begin, length)`.
    pub(crate) fn next_block_to_request(&mut self) -> Option<(u32, u32)> {
        let block_index = (0..self.blocks.len()).find(|&i| !self.requested.get(i))?;
        self.requested.set(block_index, true);
        self.block_at(block_index)
    }

    /// Whether every block of this piece has been handed out at least once.
    pub(crate) fn all_requested(&self) -> bool {
        self.requested.all()
    }

    /// Records a delivered block. Returns `Ok(true)` if this was the last
    /// missing block (the piece is now complete and ready for
    /// [`Piece::verify`]).
    pub(crate) fn deliver_block(
        &mut self,
        begin: u32,
        data: Vec<u8>,
    ) -> Result<bool, DeliverError> {
        if !begin.is_multiple_of(BLOCK_LEN) {
            return Err(DeliverError::InvalidBegin);
        }
        let block_index = (begin / BLOCK_LEN) as usize;
        let expected_len = self
            .block_at(block_index)
            .ok_or(DeliverError::InvalidBegin)?
            .1;
        if data.len() as u32 != expected_len {
            return Err(DeliverError::InvalidLength);
        }
        // a duplicate delivery (block bit already set) is accepted and
        // silently overwrites: honest peers send identical bytes, and a
        // dishonest one is still caught by the piece hash check
        self.blocks[block_index] = data;
        self.arrived.set(block_index, true);
        log::trace!(
            "block {block_index} arrived ({}/{} blocks of this piece so far)",
            self.arrived.count(),
            self.blocks.len()
        );
        Ok(self.arrived.all())
    }

    /// The piece's payload so far, as the concatenation of its blocks in
    /// `begin` order. Only meaningful once [`Piece::deliver_block`] has
    /// returned `Ok(true)`.
    pub(crate) fn payload(&self) -> Vec<u8> {
        self.blocks.concat()
    }

    /// Returns whether the piece's current payload matches `expected_hash`.
    pub(crate) fn verify(&self, expected_hash: &Sha1Hash) -> bool {
        let digest: Sha1Hash = Sha1::digest(self.payload()).into();
        &digest == expected_hash
    }

    /// Clears every block's payload, arrival bit, and requested bit, making
    /// the piece eligible for re-selection after a failed verification.
    pub(crate) fn reset(&mut self) {
        for block in &mut self.blocks {
            block.clear();
        }
        self.arrived.clear();
        self.requested.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_and_verifies_a_single_block_piece() {
        let mut piece = Piece::new(16384);
        let data = vec![0u8; 16384];
        let expected: Sha1Hash = Sha1::digest(&data).into();

        assert_eq!(piece.deliver_block(0, data.clone()), Ok(true));
        assert_eq!(piece.payload(), data);
        assert!(piece.verify(&expected));
    }

    #[test]
    fn multi_block_piece_is_incomplete_until_every_block_arrives() {
        let mut piece = Piece::new(2 * 16384);
        assert_eq!(piece.deliver_block(0, vec![1u8; 16384]), Ok(false));
        assert_eq!(piece.deliver_block(16384, vec![2u8; 16384]), Ok(true));
        let mut expected_payload = vec![1u8; 16384];
        expected_payload.extend(vec![2u8; 16384]);
        assert_eq!(piece.payload(), expected_payload);
    }

    #[test]
    fn rejects_wrong_length_block() {
        let mut piece = Piece::new(16384);
        assert_eq!(
            piece.deliver_block(0, vec![0u8; 10]),
            Err(DeliverError::InvalidLength)
        );
    }

    #[test]
    fn rejects_misaligned_begin() {
        let mut piece = Piece::new(16384);
        assert_eq!(
            piece.deliver_block(5, vec![0u8; 16384]),
            Err(DeliverError::InvalidBegin)
        );
    }

    #[test]
    fn reset_clears_blocks_and_arrival_bits() {
        let mut piece = Piece::new(16384);
        piece.deliver_block(0, vec![0xFFu8; 16384]).unwrap();
        piece.reset();
        assert!(piece.payload().is_empty());
        assert_eq!(piece.deliver_block(0, vec![]), Err(DeliverError::InvalidLength));
    }

    #[test]
    fn next_block_to_request_hands_out_each_block_once() {
        let mut piece = Piece::new(2 * 16384);
        assert_eq!(piece.next_block_to_request(), Some((0, 16384)));
        assert_eq!(piece.next_block_to_request(), Some((16384, 16384)));
        assert_eq!(piece.next_block_to_request(), None);
        assert!(piece.all_requested());
    }

    #[test]
    fn reset_makes_blocks_requestable_again() {
        let mut piece = Piece::new(16384);
        piece.next_block_to_request();
        assert!(piece.all_requested());
        piece.reset();
        assert!(!piece.all_requested());
        assert_eq!(piece.next_block_to_request(), Some((0, 16384)));
    }

    #[test]
    fn last_block_of_uneven_piece_is_shorter() {
        let piece_len = 2 * 16384 + 100;
        let mut piece = Piece::new(piece_len);
        assert_eq!(piece.block_count(), 3);
        assert_eq!(piece.block_at(2), Some((2 * 16384, 100)));
        piece.deliver_block(0, vec![0u8; 16384]).unwrap();
        piece.deliver_block(16384, vec![0u8; 16384]).unwrap();
        assert_eq!(piece.deliver_block(2 * 16384, vec![0u8; 100]), Ok(true));
    }
}
