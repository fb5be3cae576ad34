//! How many of the connected peers have each piece.
use parking_lot::RwLock;
use tracing::error;

use crate::{bitfield::PeerBitfield, error::Error};

#[derive(Debug, Default, Clone)]
struct Inner {
    counts: Vec<u32>,
    /// Value of `clock` when the piece reached its current count.
    stamps: Vec<u64>,
    /// Incremented once per update.
    clock: u64,
}

impl Inner {
    fn check_len(&self, bitfield: &PeerBitfield) -> Result<(), Error> {
        if bitfield.len() != self.counts.len() {
            return Err(Error::BitfieldLength {
                expected: self.counts.len().div_ceil(8),
                received: bitfield.len().div_ceil(8),
            });
        }
        Ok(())
    }

    /// Fail without mutating if any piece of `bitfield` would go below 0.
    fn check_underflow(&self, bitfield: &PeerBitfield) -> Result<(), Error> {
        if let Some(piece) = bitfield.iter_ones().find(|&p| self.counts[p] == 0)
        {
            error!("availability of piece {piece} would underflow");
            return Err(Error::AvailabilityUnderflow(piece));
        }
        Ok(())
    }

    fn add(&mut self, bitfield: &PeerBitfield) {
        self.clock += 1;
        for piece in bitfield.iter_ones() {
            self.counts[piece] += 1;
            self.stamps[piece] = self.clock;
        }
    }

    fn remove(&mut self, bitfield: &PeerBitfield) {
        self.clock += 1;
        for piece in bitfield.iter_ones() {
            self.counts[piece] -= 1;
            self.stamps[piece] = self.clock;
        }
    }
}

/// Availability of every piece among the connected peers.
///
/// A peer's bitfield is added when it is learned and removed as a whole when
/// the peer disconnects, each of those is applied under one write lock so
/// readers never observe half of a bitfield.
#[derive(Debug, Default)]
pub struct PieceStatistics {
    inner: RwLock<Inner>,
}

/// A consistent copy of the statistics, what the selectors work on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Availability {
    pub counts: Vec<u32>,
    /// Order in which the pieces reached their current count, pieces that
    /// reached it in the same update share a stamp.
    pub stamps: Vec<u64>,
}

impl Availability {
    pub fn pieces(&self) -> usize {
        self.counts.len()
    }
}

impl PieceStatistics {
    pub fn new(pieces: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                counts: vec![0; pieces],
                stamps: vec![0; pieces],
                clock: 0,
            }),
        }
    }

    /// Statistics with the given counts, as if they were all learned at the
    /// same time.
    pub fn from_counts(counts: &[u32]) -> Self {
        Self {
            inner: RwLock::new(Inner {
                counts: counts.to_vec(),
                stamps: vec![0; counts.len()],
                clock: 0,
            }),
        }
    }

    pub fn pieces(&self) -> usize {
        self.inner.read().counts.len()
    }

    pub fn add_bitfield(&self, bitfield: &PeerBitfield) -> Result<(), Error> {
        let mut inner = self.inner.write();
        inner.check_len(bitfield)?;
        inner.add(bitfield);
        Ok(())
    }

    /// Subtract a bitfield that was added before.
    ///
    /// # Errors
    ///
    /// [`Error::AvailabilityUnderflow`] if a piece would go below zero, which
    /// means that the bitfield was never added. Nothing is changed in that
    /// case.
    pub fn remove_bitfield(&self, bitfield: &PeerBitfield) -> Result<(), Error> {
        let mut inner = self.inner.write();
        inner.check_len(bitfield)?;
        inner.check_underflow(bitfield)?;
        inner.remove(bitfield);
        Ok(())
    }

    /// Swap the contribution of `old` for `new` in one update, used when a
    /// peer sends a second bitfield.
    pub fn replace_bitfield(
        &self,
        old: &PeerBitfield,
        new: &PeerBitfield,
    ) -> Result<(), Error> {
        let mut inner = self.inner.write();
        inner.check_len(old)?;
        inner.check_len(new)?;
        inner.check_underflow(old)?;
        inner.remove(old);
        inner.add(new);
        Ok(())
    }

    /// One more peer has the piece, after a `have` message.
    pub fn add_piece(&self, piece: usize) -> Result<(), Error> {
        let mut inner = self.inner.write();
        if piece >= inner.counts.len() {
            return Err(Error::PieceIndexInvalid(piece));
        }
        inner.clock += 1;
        let clock = inner.clock;
        inner.counts[piece] += 1;
        inner.stamps[piece] = clock;
        Ok(())
    }

    /// How many peers have the piece, 0 for pieces that do not exist.
    pub fn get_count(&self, piece: usize) -> u32 {
        self.inner.read().counts.get(piece).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> Availability {
        let inner = self.inner.read();
        Availability {
            counts: inner.counts.clone(),
            stamps: inner.stamps.clone(),
        }
    }
}
