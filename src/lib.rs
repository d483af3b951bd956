//! A small BitTorrent leech engine: given a parsed metainfo file, find peers
//! via the tracker, download the content piece-by-piece in parallel over the
//! BitTorrent peer wire protocol, verify each piece's SHA-1 hash, and write
//! the verified bytes to a single output file at their correct offsets.
//!
//! This engine only leeches: it never seeds, never serves blocks to other
//! peers, and never participates in DHT/PEX/magnet-link discovery.

pub mod conf;
pub mod engine;
pub mod error;
pub mod metainfo;
mod peer;
mod piece;
mod session;
mod tracker;
mod writer;

use bitvec::prelude::{BitVec, Msb0};

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in the
/// source code we use `usize` to be consistent with other index types in Rust.
pub type PieceIndex = usize;

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector from most significant bit to least significant
/// bit, that is, where the first highest bit represents the first piece, the
/// second highest element the second piece, and so on (e.g. `0b1100_0001`
/// would mean that the peer has pieces 0, 1, and 7). A truthy boolean value of
/// a piece's position in this vector means the peer has the piece.
pub type Bitfield = BitVec<u8, Msb0>;

/// This is the only block length we're dealing with (except for possibly the
/// last block of the last piece). It is the widely used and accepted 16 KiB.
pub(crate) const BLOCK_LEN: u32 = 0x4000;

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of the torrent. Downloading happens at this block level
/// granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub begin: u32,
    /// The block's length in bytes. Always 16 KiB (0x4000 bytes) except
    /// possibly for the last block of the last piece.
    pub len: u32,
}

/// Returns the length of the block at `index` within a piece of length
/// `piece_len`.
///
/// If the piece length isn't a multiple of [`BLOCK_LEN`], the returned value
/// for the last block index is smaller.
///
/// # Panics
///
/// Panics if `index`'s nominal byte offset would be at or past `piece_len`.
pub(crate) fn block_len(piece_len: u32, index: usize) -> u32 {
    let index = index as u32;
    let block_offset = index * BLOCK_LEN;
    assert!(piece_len > block_offset, "block index out of range for piece");
    std::cmp::min(piece_len - block_offset, BLOCK_LEN)
}

/// Returns the number of blocks in a piece of the given length.
pub(crate) fn block_count(piece_len: u32) -> usize {
    // all blocks but possibly the last one are BLOCK_LEN long; round up so the
    // shorter last block still counts as one block
    (piece_len as usize).div_ceil(BLOCK_LEN as usize)
}

/// Returns the number of pieces for a torrent of total size `total_len` with
/// the given nominal `piece_len`.
///
/// This is a ceiling division: the last piece may be shorter than
/// `piece_len`.
pub(crate) fn piece_count(total_len: u64, piece_len: u32) -> usize {
    total_len.div_ceil(piece_len as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    // An arbitrary piece length that is an exact multiple of the canonical
    // block length (16 KiB).
    const BLOCK_LEN_MULTIPLE_PIECE_LEN: u32 = 2 * BLOCK_LEN;

    // An arbitrary piece length that is _not_ a multiple of the canonical
    // block length, and the amount with which it overlaps the nearest exact
    // multiple value.
    const OVERLAP: u32 = 234;
    const UNEVEN_PIECE_LEN: u32 = 2 * BLOCK_LEN + OVERLAP;

    #[test]
    fn test_block_len() {
        assert_eq!(block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 0), BLOCK_LEN);
        assert_eq!(block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 1), BLOCK_LEN);

        assert_eq!(block_len(UNEVEN_PIECE_LEN, 0), BLOCK_LEN);
        assert_eq!(block_len(UNEVEN_PIECE_LEN, 1), BLOCK_LEN);
        assert_eq!(block_len(UNEVEN_PIECE_LEN, 2), OVERLAP);
    }

    #[test]
    #[should_panic]
    fn test_block_len_invalid_index_panic() {
        block_len(BLOCK_LEN_MULTIPLE_PIECE_LEN, 2);
    }

    #[test]
    fn test_block_count() {
        assert_eq!(block_count(BLOCK_LEN_MULTIPLE_PIECE_LEN), 2);
        assert_eq!(block_count(UNEVEN_PIECE_LEN), 3);
    }

    #[test]
    fn test_piece_count_is_ceiling_division() {
        // exact multiple: no short last piece
        assert_eq!(piece_count(2 * 1024, 1024), 2);
        // one byte over an exact multiple still needs one more piece
        assert_eq!(piece_count(2 * 1024 + 1, 1024), 3);
        // smaller than one piece still counts as one piece
        assert_eq!(piece_count(1, 1024), 1);
    }
}
