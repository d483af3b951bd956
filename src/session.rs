//! The download session: tracks per-piece progress across all peers and
//! decides what to request next.
//!
//! A single [`Session`] is shared (behind a `tokio::sync::Mutex`) by every
//! peer worker task for the torrent. Peers never touch each other's sockets
//! or state directly; they only ever go through the session to pick a block
//! to request or to hand in one they've received.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{metainfo::Metainfo, piece::Piece, Bitfield, BlockInfo, PieceIndex};

/// Why a delivered block couldn't be recorded against the session: either
/// the piece index is out of range, or the block itself was malformed (wrong
/// `begin`/length for the piece it claims to belong to).
#[derive(Debug)]
pub(crate) struct InvalidDelivery;

/// A verified piece, ready to be written to the output file at its offset.
#[derive(Debug)]
pub(crate) struct WriteJob {
    pub(crate) offset: u64,
    pub(crate) data: Vec<u8>,
}

pub(crate) struct Session {
    metainfo: Arc<Metainfo>,
    pieces: Vec<Piece>,
    /// Pieces claimed by a peer but not yet verified. A piece leaves this set
    /// (back to neither in-progress nor received) if its hash check fails, so
    /// it can be picked again.
    in_progress: Bitfield,
    /// Pieces whose hash has been verified and handed off to the writer.
    received: Bitfield,
    output_tx: mpsc::UnboundedSender<WriteJob>,
}

impl Session {
    pub(crate) fn new(metainfo: Arc<Metainfo>, output_tx: mpsc::UnboundedSender<WriteJob>) -> Self {
        let piece_count = metainfo.piece_count();
        let pieces = (0..piece_count)
            .map(|i| Piece::new(metainfo.piece_len(i)))
            .collect();
        Self {
            metainfo,
            pieces,
            in_progress: Bitfield::repeat(false, piece_count),
            received: Bitfield::repeat(false, piece_count),
            output_tx,
        }
    }

    /// Picks the next block to request from a peer that has announced
    /// `have`, by a linear scan over pieces for the first one the peer has
    /// that isn't fully received yet and still has an unrequested block.
    ///
    /// This is deliberately the simplest possible piece-selection policy
    /// (no rarest-first, no endgame mode): it favors correctness and
    /// predictability over transfer efficiency, which is in scope for a
    /// leech-only client of this size.
    pub(crate) fn next_request(&mut self, have: &Bitfield) -> Option<BlockInfo> {
        for piece_index in 0..self.pieces.len() {
            if !have.get(piece_index).map(|b| *b).unwrap_or(false) {
                continue;
            }
            if self.received[piece_index] {
                continue;
            }
            let piece = &mut self.pieces[piece_index];
            if piece.all_requested() {
                log::trace!("piece {piece_index} has no unrequested blocks left, skipping");
                continue;
            }
            if let Some((begin, len)) = piece.next_block_to_request() {
                self.in_progress.set(piece_index, true);
                log::trace!(
                    "requesting piece {piece_index} ({} bytes, {} blocks) block at {begin}",
                    piece.len(),
                    piece.block_count(),
                );
                return Some(BlockInfo { piece_index, begin, len });
            }
        }
        None
    }

    /// Records a block delivered by a peer. Returns whether the piece it
    /// belongs to is now complete and passed verification.
    ///
    /// On a hash mismatch the piece is reset (all its blocks become
    /// requestable again) rather than the caller being handed an error: a
    /// single bad block doesn't invalidate the whole download, only the one
    /// piece.
    pub(crate) fn deliver_block(
        &mut self,
        piece_index: PieceIndex,
        begin: u32,
        data: Vec<u8>,
    ) -> Result<bool, InvalidDelivery> {
        let piece = self.pieces.get_mut(piece_index).ok_or(InvalidDelivery)?;

        let is_complete = piece
            .deliver_block(begin, data)
            .map_err(|_| InvalidDelivery)?;

        if !is_complete {
            return Ok(false);
        }

        let expected_hash = self.metainfo.piece_hash(piece_index);
        if piece.verify(&expected_hash) {
            let offset = piece_index as u64 * self.metainfo.piece_length as u64;
            let _ = self.output_tx.send(WriteJob {
                offset,
                data: piece.payload(),
            });
            self.received.set(piece_index, true);
            self.in_progress.set(piece_index, false);
            Ok(true)
        } else {
            log::warn!(
                "piece {piece_index} failed hash verification; resetting for re-download"
            );
            piece.reset();
            self.in_progress.set(piece_index, false);
            Ok(false)
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.received.all()
    }

    pub(crate) fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub(crate) fn received_count(&self) -> usize {
        self.received.count_ones()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::Metainfo;
    use sha1::{Digest, Sha1};

    fn metainfo_with_pieces(piece_length: u32, piece_payloads: &[Vec<u8>]) -> Metainfo {
        let mut buf = Vec::new();
        buf.extend(b"d8:announce4:http4:infod6:lengthi");
        let total: u64 = piece_payloads.iter().map(|p| p.len() as u64).sum();
        buf.extend(total.to_string().as_bytes());
        buf.extend(b"e4:name4:test12:piece lengthi");
        buf.extend(piece_length.to_string().as_bytes());
        buf.extend(b"e6:pieces");
        let hashes: Vec<u8> = piece_payloads
            .iter()
            .flat_map(|p| Sha1::digest(p).to_vec())
            .collect();
        buf.extend(hashes.len().to_string().as_bytes());
        buf.push(b':');
        buf.extend(&hashes);
        buf.extend(b"ee");
        Metainfo::from_bytes(&buf).unwrap()
    }

    fn seed_bitfield(len: usize) -> Bitfield {
        Bitfield::repeat(true, len)
    }

    #[test]
    fn single_piece_happy_path_writes_once_verified() {
        let payload = vec![0xABu8; 16384];
        let metainfo = Arc::new(metainfo_with_pieces(16384, std::slice::from_ref(&payload)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new(metainfo, tx);

        let have = seed_bitfield(1);
        let block = session.next_request(&have).unwrap();
        assert_eq!(block.piece_index, 0);
        assert_eq!(block.begin, 0);

        let complete = session
            .deliver_block(block.piece_index, block.begin, payload.clone())
            .unwrap();
        assert!(complete);
        assert!(session.is_complete());

        let job = rx.try_recv().unwrap();
        assert_eq!(job.offset, 0);
        assert_eq!(job.data, payload);
    }

    #[test]
    fn hash_mismatch_resets_piece_for_retry() {
        let payload = vec![0x11u8; 16384];
        let metainfo = Arc::new(metainfo_with_pieces(16384, std::slice::from_ref(&payload)));
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = Session::new(metainfo, tx);

        let have = seed_bitfield(1);
        let block = session.next_request(&have).unwrap();
        let wrong_payload = vec![0x22u8; 16384];
        let complete = session
            .deliver_block(block.piece_index, block.begin, wrong_payload)
            .unwrap();
        assert!(!complete);
        assert!(!session.is_complete());

        // the piece is requestable again after the failed verification
        let retry = session.next_request(&have).unwrap();
        assert_eq!(retry, block);
        let complete = session
            .deliver_block(retry.piece_index, retry.begin, payload)
            .unwrap();
        assert!(complete);
    }

    #[test]
    fn two_peers_racing_never_receive_the_same_block_twice() {
        let a = vec![0x01u8; 16384];
        let b = vec![0x02u8; 16384];
        let metainfo = Arc::new(metainfo_with_pieces(16384, &[a.clone(), b.clone()]));
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = Session::new(metainfo, tx);

        let have = seed_bitfield(2);
        let first = session.next_request(&have).unwrap();
        let second = session.next_request(&have).unwrap();
        assert_ne!(first, second);

        session
            .deliver_block(first.piece_index, first.begin, if first.piece_index == 0 { a.clone() } else { b.clone() })
            .unwrap();
        session
            .deliver_block(second.piece_index, second.begin, if second.piece_index == 0 { a } else { b })
            .unwrap();
        assert!(session.is_complete());
    }

    #[test]
    fn next_request_skips_pieces_the_peer_does_not_have() {
        let a = vec![0x01u8; 16384];
        let b = vec![0x02u8; 16384];
        let metainfo = Arc::new(metainfo_with_pieces(16384, &[a, b]));
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = Session::new(metainfo, tx);

        let mut have = Bitfield::repeat(false, 2);
        have.set(1, true);
        let block = session.next_request(&have).unwrap();
        assert_eq!(block.piece_index, 1);
    }
}
