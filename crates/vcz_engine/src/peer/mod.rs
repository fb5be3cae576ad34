//! Remote peers as seen by the scheduler.
//!
//! Peers live in a [`PeerArena`] and every other structure refers to them by
//! [`PeerKey`], never by a shared mutable reference. The wire layer owns the
//! connection, the arena only keeps what the scheduler needs: the advertised
//! bitfield and the current assignment.
mod types;

pub use types::*;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::{bitfield::PeerBitfield, error::Error};

/// What a peer advertised, and whether it was removed.
#[derive(Debug)]
pub struct PeerBits {
    pub bitfield: PeerBitfield,
    /// Set under the write lock when the peer is removed, after that its
    /// bitfield no longer counts in the statistics.
    pub gone: bool,
}

/// State of one remote peer.
#[derive(Debug)]
pub struct PeerState {
    bits: RwLock<PeerBits>,
    /// 0 = no assignment, otherwise piece + 1.
    assignment: AtomicUsize,
}

impl PeerState {
    /// A peer that has no pieces yet.
    pub fn new(pieces: usize) -> Self {
        Self {
            bits: RwLock::new(PeerBits {
                bitfield: PeerBitfield::new(pieces),
                gone: false,
            }),
            assignment: AtomicUsize::new(0),
        }
    }

    pub fn bits(&self) -> RwLockReadGuard<'_, PeerBits> {
        self.bits.read()
    }

    pub(crate) fn bits_mut(&self) -> RwLockWriteGuard<'_, PeerBits> {
        self.bits.write()
    }

    pub fn has(&self, piece: usize) -> bool {
        self.bits.read().bitfield.has(piece)
    }

    pub fn bitfield(&self) -> PeerBitfield {
        self.bits.read().bitfield.clone()
    }

    /// The piece this peer is responsible for.
    pub fn assignment(&self) -> Option<usize> {
        match self.assignment.load(Ordering::Acquire) {
            0 => None,
            p => Some(p - 1),
        }
    }

    /// Assign the piece if the peer has no assignment, otherwise return the
    /// one it has.
    pub(crate) fn try_set_assignment(&self, piece: usize) -> Result<(), usize> {
        self.assignment
            .compare_exchange(0, piece + 1, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|p| p - 1)
    }

    /// Clear the assignment if it is `piece`, returns true if it was.
    pub(crate) fn clear_assignment(&self, piece: usize) -> bool {
        self.assignment
            .compare_exchange(piece + 1, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clear any assignment and return it.
    pub(crate) fn take_assignment(&self) -> Option<usize> {
        match self.assignment.swap(0, Ordering::AcqRel) {
            0 => None,
            p => Some(p - 1),
        }
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    peer: Option<Arc<PeerState>>,
}

#[derive(Debug, Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

/// Slots of peers indexed by [`PeerKey`].
///
/// Removing a peer bumps the generation of its slot, lookups with an old key
/// fail with [`Error::PeerNotFound`].
#[derive(Debug, Default)]
pub struct PeerArena {
    inner: RwLock<Slots>,
}

impl PeerArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, peer: PeerState) -> PeerKey {
        let peer = Arc::new(peer);
        let mut inner = self.inner.write();

        if let Some(index) = inner.free.pop() {
            let slot = &mut inner.slots[index as usize];
            slot.peer = Some(peer);
            return PeerKey::new(index, slot.generation);
        }

        let index = inner.slots.len() as u32;
        inner.slots.push(Slot { generation: 1, peer: Some(peer) });
        PeerKey::new(index, 1)
    }

    pub fn get(&self, key: PeerKey) -> Result<Arc<PeerState>, Error> {
        let inner = self.inner.read();
        inner
            .slots
            .get(key.index as usize)
            .filter(|s| s.generation == key.generation)
            .and_then(|s| s.peer.clone())
            .ok_or(Error::PeerNotFound(key))
    }

    pub fn is_live(&self, key: PeerKey) -> bool {
        self.get(key).is_ok()
    }

    /// Remove the peer and invalidate its key.
    pub fn remove(&self, key: PeerKey) -> Result<Arc<PeerState>, Error> {
        let mut inner = self.inner.write();

        let slot = inner
            .slots
            .get_mut(key.index as usize)
            .filter(|s| s.generation == key.generation)
            .ok_or(Error::PeerNotFound(key))?;

        let peer = slot.peer.take().ok_or(Error::PeerNotFound(key))?;

        // generation 0 is reserved for "no peer"
        slot.generation = slot.generation.wrapping_add(1).max(1);
        inner.free.push(key.index);

        debug!("removed peer {key}");
        Ok(peer)
    }

    /// Number of live peers.
    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        inner.slots.len() - inner.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of every live peer.
    pub fn keys(&self) -> Vec<PeerKey> {
        let inner = self.inner.read();
        inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.peer.is_some())
            .map(|(i, s)| PeerKey::new(i as u32, s.generation))
            .collect()
    }
}
