//! Wrapper types around Bitvec.
//!
//! [`LocalBitfield`] is the source of truth for what the local client has,
//! with one [`PieceStatus`] per piece and the completed blocks of each piece.
//! [`PeerBitfield`] is what a remote peer advertised, peers never reveal
//! partial pieces so a piece is either complete or not.
use std::sync::atomic::{AtomicU8, Ordering};

use bitvec::prelude::*;
use parking_lot::Mutex;

use crate::{error::Error, metainfo::Info};

/// Bitfield where index = piece.
pub type Bitfield = BitVec<u8, Msb0>;

pub trait VczBitfield {
    fn from_piece(piece: usize) -> Bitfield {
        bitvec![u8, Msb0; 0; piece]
    }

    /// Decode a bitfield as sent on the wire, `bytes` must have exactly
    /// `ceil(len / 8)` bytes and the spare bits at the end must be zero.
    fn try_from_bytes(bytes: &[u8], len: usize) -> Result<Bitfield, Error> {
        let expected = len.div_ceil(8);
        if bytes.len() != expected {
            return Err(Error::BitfieldLength {
                expected,
                received: bytes.len(),
            });
        }
        let mut s = Bitfield::from_slice(bytes);
        if s[len..].any() {
            return Err(Error::BitfieldSpareBits);
        }
        s.truncate(len);
        Ok(s)
    }
}

impl VczBitfield for Bitfield {}

/// Status of a piece on the local side, ordered from nothing to verified.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PieceStatus {
    #[default]
    Empty = 0,
    /// At least one block but not all of them.
    Incomplete = 1,
    /// All blocks are written, waiting for verification.
    Complete = 2,
    CompleteVerified = 3,
}

impl From<u8> for PieceStatus {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Incomplete,
            2 => Self::Complete,
            3 => Self::CompleteVerified,
            _ => Self::Empty,
        }
    }
}

#[derive(Debug)]
struct PieceSlot {
    status: AtomicU8,
    /// Completed blocks, where index = block of the piece.
    blocks: Mutex<Bitfield>,
}

impl PieceSlot {
    fn new(blocks: usize, verified: bool) -> Self {
        let status = if verified {
            PieceStatus::CompleteVerified
        } else {
            PieceStatus::Empty
        };
        Self {
            status: AtomicU8::new(status as u8),
            blocks: Mutex::new(bitvec![u8, Msb0; verified as u8; blocks]),
        }
    }

    fn status(&self) -> PieceStatus {
        self.status.load(Ordering::Acquire).into()
    }

    fn set_status(&self, status: PieceStatus) {
        self.status.store(status as u8, Ordering::Release);
    }
}

/// The local client's view of the torrent, one status per piece plus the
/// completed blocks of each piece.
///
/// Each piece has its own lock, so peers writing different pieces never wait
/// on each other.
#[derive(Debug)]
pub struct LocalBitfield {
    pieces: Vec<PieceSlot>,
}

impl LocalBitfield {
    /// All pieces start [`PieceStatus::Empty`].
    pub fn new(info: &Info, block_len: usize) -> Result<Self, Error> {
        let verified = Bitfield::from_piece(info.pieces());
        Self::from_verified(info, block_len, &verified)
    }

    /// Pieces set in `verified` start as [`PieceStatus::CompleteVerified`],
    /// used when the content is already on disk.
    pub fn from_verified(
        info: &Info,
        block_len: usize,
        verified: &Bitfield,
    ) -> Result<Self, Error> {
        if verified.len() != info.pieces() {
            return Err(Error::BitfieldLength {
                expected: info.pieces().div_ceil(8),
                received: verified.len().div_ceil(8),
            });
        }

        let pieces = (0..info.pieces())
            .map(|piece| {
                let blocks = info.blocks_of_piece(piece, block_len)?;
                Ok(PieceSlot::new(blocks, verified[piece]))
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(Self { pieces })
    }

    /// Same as [`Self::from_verified`] but from the raw wire representation.
    pub fn from_bytes(
        info: &Info,
        block_len: usize,
        bytes: &[u8],
    ) -> Result<Self, Error> {
        let verified = Bitfield::try_from_bytes(bytes, info.pieces())?;
        Self::from_verified(info, block_len, &verified)
    }

    pub fn pieces(&self) -> usize {
        self.pieces.len()
    }

    fn slot(&self, piece: usize) -> Result<&PieceSlot, Error> {
        self.pieces.get(piece).ok_or(Error::PieceIndexInvalid(piece))
    }

    pub fn get_piece_status(&self, piece: usize) -> Result<PieceStatus, Error> {
        Ok(self.slot(piece)?.status())
    }

    /// Returns false for pieces that do not exist.
    pub fn is_verified(&self, piece: usize) -> bool {
        self.pieces
            .get(piece)
            .is_some_and(|p| p.status() == PieceStatus::CompleteVerified)
    }

    pub fn blocks_of_piece(&self, piece: usize) -> Result<usize, Error> {
        Ok(self.slot(piece)?.blocks.lock().len())
    }

    pub fn is_block_complete(
        &self,
        piece: usize,
        block: usize,
    ) -> Result<bool, Error> {
        let blocks = self.slot(piece)?.blocks.lock();
        blocks
            .get(block)
            .map(|b| *b)
            .ok_or(Error::BlockIndexInvalid { piece, block })
    }

    /// Blocks of the piece that were not written yet.
    pub fn missing_blocks(&self, piece: usize) -> Result<Vec<usize>, Error> {
        Ok(self.slot(piece)?.blocks.lock().iter_zeros().collect())
    }

    /// Mark one block as complete.
    ///
    /// Returns true only for the call that completed the last block, which
    /// moves the piece to [`PieceStatus::Complete`]; the caller must then
    /// verify it. Blocks of a piece that is already complete are ignored.
    pub fn mark_block_complete(
        &self,
        piece: usize,
        block: usize,
    ) -> Result<bool, Error> {
        let slot = self.slot(piece)?;
        let mut blocks = slot.blocks.lock();

        if block >= blocks.len() {
            return Err(Error::BlockIndexInvalid { piece, block });
        }
        if slot.status() >= PieceStatus::Complete {
            return Ok(false);
        }

        blocks.set(block, true);

        if blocks.all() {
            slot.set_status(PieceStatus::Complete);
            Ok(true)
        } else {
            slot.set_status(PieceStatus::Incomplete);
            Ok(false)
        }
    }

    /// Finalize a piece after a successful verification.
    pub fn mark_verified(&self, piece: usize) -> Result<(), Error> {
        let slot = self.slot(piece)?;
        let mut blocks = slot.blocks.lock();
        blocks.fill(true);
        slot.set_status(PieceStatus::CompleteVerified);
        Ok(())
    }

    /// Roll back a piece after a failed verification, all of its blocks must
    /// be downloaded again.
    pub fn mark_empty(&self, piece: usize) -> Result<(), Error> {
        let slot = self.slot(piece)?;
        let mut blocks = slot.blocks.lock();
        blocks.fill(false);
        slot.set_status(PieceStatus::Empty);
        Ok(())
    }

    pub fn verified_count(&self) -> usize {
        self.pieces
            .iter()
            .filter(|p| p.status() == PieceStatus::CompleteVerified)
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.verified_count() == self.pieces()
    }

    /// Bitfield of verified pieces, what the local peer advertises.
    pub fn verified_bitfield(&self) -> Bitfield {
        self.pieces
            .iter()
            .map(|p| p.status() == PieceStatus::CompleteVerified)
            .collect()
    }
}

/// Pieces advertised by a remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerBitfield(Bitfield);

impl PeerBitfield {
    /// A peer that has nothing, the state before its bitfield arrives.
    pub fn new(pieces: usize) -> Self {
        Self(Bitfield::from_piece(pieces))
    }

    /// Decode a bitfield message, it must match the local piece count.
    pub fn from_bytes(bytes: &[u8], pieces: usize) -> Result<Self, Error> {
        Ok(Self(Bitfield::try_from_bytes(bytes, pieces)?))
    }

    /// Set the piece as complete, returns true if the peer did not have it.
    pub fn mark_complete(&mut self, piece: usize) -> Result<bool, Error> {
        let mut bit =
            self.0.get_mut(piece).ok_or(Error::PieceIndexInvalid(piece))?;
        let was_set = *bit;
        *bit = true;
        Ok(!was_set)
    }

    pub fn has(&self, piece: usize) -> bool {
        self.0.get(piece).is_some_and(|b| *b)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn count(&self) -> usize {
        self.0.count_ones()
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter_ones()
    }
}

impl From<Bitfield> for PeerBitfield {
    fn from(value: Bitfield) -> Self {
        Self(value)
    }
}

impl AsRef<Bitfield> for PeerBitfield {
    fn as_ref(&self) -> &Bitfield {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::HASH_LEN;

    // 3 pieces of 2 blocks, the last piece has 1 block.
    fn info() -> Info {
        Info {
            file_length: Some(50),
            name: "foo.txt".to_owned(),
            piece_length: 20,
            pieces: vec![0; 3 * HASH_LEN],
            files: None,
        }
    }

    #[test]
    fn from_piece() {
        let bitfield = Bitfield::from_piece(1407);
        assert_eq!(bitfield.len(), 1407);
    }

    #[test]
    fn try_from_bytes() {
        let bitfield = Bitfield::try_from_bytes(&[0b1010_0000], 3).unwrap();
        assert_eq!(bitfield.len(), 3);
        assert!(bitfield[0]);
        assert!(!bitfield[1]);
        assert!(bitfield[2]);

        assert!(matches!(
            Bitfield::try_from_bytes(&[0, 0], 3),
            Err(Error::BitfieldLength { expected: 1, received: 2 })
        ));
        assert!(matches!(
            Bitfield::try_from_bytes(&[0b0001_0000], 3),
            Err(Error::BitfieldSpareBits)
        ));
        assert_eq!(Bitfield::try_from_bytes(&[0xff], 8).unwrap().len(), 8);
    }

    #[test]
    fn piece_transitions() {
        let bitfield = LocalBitfield::new(&info(), 10).unwrap();
        assert_eq!(bitfield.pieces(), 3);
        assert_eq!(bitfield.blocks_of_piece(0).unwrap(), 2);
        assert_eq!(bitfield.blocks_of_piece(2).unwrap(), 1);
        assert_eq!(bitfield.get_piece_status(0).unwrap(), PieceStatus::Empty);

        assert!(!bitfield.mark_block_complete(0, 1).unwrap());
        assert_eq!(
            bitfield.get_piece_status(0).unwrap(),
            PieceStatus::Incomplete
        );
        assert_eq!(bitfield.missing_blocks(0).unwrap(), vec![0]);

        assert!(bitfield.mark_block_complete(0, 0).unwrap());
        assert_eq!(bitfield.get_piece_status(0).unwrap(), PieceStatus::Complete);

        // a duplicate block does not complete the piece twice
        assert!(!bitfield.mark_block_complete(0, 0).unwrap());

        bitfield.mark_verified(0).unwrap();
        assert!(bitfield.is_verified(0));
        assert_eq!(bitfield.verified_count(), 1);

        // verified pieces never go back by a block write
        assert!(!bitfield.mark_block_complete(0, 0).unwrap());
        assert!(bitfield.is_verified(0));
    }

    #[test]
    fn mark_empty_clears_blocks() {
        let bitfield = LocalBitfield::new(&info(), 10).unwrap();
        bitfield.mark_block_complete(1, 0).unwrap();
        bitfield.mark_block_complete(1, 1).unwrap();
        bitfield.mark_empty(1).unwrap();
        assert_eq!(bitfield.get_piece_status(1).unwrap(), PieceStatus::Empty);
        assert!(!bitfield.is_block_complete(1, 0).unwrap());
        assert!(!bitfield.is_block_complete(1, 1).unwrap());
    }

    #[test]
    fn invalid_indices() {
        let bitfield = LocalBitfield::new(&info(), 10).unwrap();
        assert!(matches!(
            bitfield.get_piece_status(3),
            Err(Error::PieceIndexInvalid(3))
        ));
        assert!(matches!(
            bitfield.mark_block_complete(2, 1),
            Err(Error::BlockIndexInvalid { piece: 2, block: 1 })
        ));
        assert!(!bitfield.is_verified(99));
    }

    #[test]
    fn from_bytes() {
        let bitfield =
            LocalBitfield::from_bytes(&info(), 10, &[0b0100_0000]).unwrap();
        assert!(!bitfield.is_verified(0));
        assert!(bitfield.is_verified(1));
        assert!(bitfield.is_block_complete(1, 1).unwrap());
        assert_eq!(bitfield.verified_bitfield(), bitvec![u8, Msb0; 0, 1, 0]);

        assert!(matches!(
            LocalBitfield::from_bytes(&info(), 10, &[0, 0]),
            Err(Error::BitfieldLength { .. })
        ));
    }

    #[test]
    fn peer_bitfield() {
        let mut peer = PeerBitfield::from_bytes(&[0b1000_0000], 3).unwrap();
        assert!(peer.has(0));
        assert!(!peer.has(1));
        assert!(!peer.has(10));

        assert!(peer.mark_complete(1).unwrap());
        assert!(!peer.mark_complete(1).unwrap());
        assert_eq!(peer.count(), 2);
        assert_eq!(peer.iter_ones().collect::<Vec<_>>(), vec![0, 1]);
        assert!(matches!(
            peer.mark_complete(3),
            Err(Error::PieceIndexInvalid(3))
        ));

        assert!(matches!(
            PeerBitfield::from_bytes(&[0, 0], 3),
            Err(Error::BitfieldLength { .. })
        ));
    }
}
