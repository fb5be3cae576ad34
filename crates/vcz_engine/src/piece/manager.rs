//! Decides which piece each peer downloads.
//!
//! A piece is assigned to at most one peer at a time. The owner of each piece
//! is an atomic that is claimed with a compare-and-swap, so two peers racing
//! for the same piece never both win, while peers going for different pieces
//! never wait on each other.
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::{
    bitfield::{LocalBitfield, PeerBitfield, PieceStatus},
    config::PieceStrategy,
    error::Error,
    peer::{PeerArena, PeerKey, PeerState},
    piece::{
        selector::{self, PieceSelector, Validating},
        stats::PieceStatistics,
    },
};

type SharedSelector = Arc<dyn PieceSelector + Send + Sync>;

#[derive(Debug)]
pub struct PieceManager {
    /// Replaced as a whole, readers keep using the snapshot they took.
    selector: RwLock<SharedSelector>,
    stats: PieceStatistics,
    /// Packed [`PeerKey`] of the peer assigned to each piece, 0 = none.
    owners: Vec<AtomicU64>,
    peers: PeerArena,
    local: Arc<LocalBitfield>,
}

impl PieceManager {
    pub fn new(local: Arc<LocalBitfield>, strategy: PieceStrategy) -> Self {
        Self::with_selector(local, selector::from_strategy(strategy))
    }

    pub fn with_selector(
        local: Arc<LocalBitfield>,
        selector: SharedSelector,
    ) -> Self {
        let pieces = local.pieces();
        Self {
            selector: RwLock::new(selector),
            stats: PieceStatistics::new(pieces),
            owners: (0..pieces).map(|_| AtomicU64::new(0)).collect(),
            peers: PeerArena::new(),
            local,
        }
    }

    pub fn pieces(&self) -> usize {
        self.owners.len()
    }

    pub fn stats(&self) -> &PieceStatistics {
        &self.stats
    }

    pub fn peers(&self) -> &PeerArena {
        &self.peers
    }

    pub fn local(&self) -> &Arc<LocalBitfield> {
        &self.local
    }

    pub fn set_strategy(&self, strategy: PieceStrategy) {
        info!("piece strategy is now {strategy:?}");
        self.set_selector(selector::from_strategy(strategy));
    }

    pub fn set_selector(&self, selector: SharedSelector) {
        *self.selector.write() = selector;
    }

    pub fn selector(&self) -> SharedSelector {
        self.selector.read().clone()
    }

    /// Register a new peer that has nothing yet.
    pub fn add_peer(&self) -> PeerKey {
        let key = self.peers.insert(PeerState::new(self.pieces()));
        debug!("added peer {key}");
        key
    }

    /// Set the full bitfield of a peer, replacing what it announced before.
    pub fn peer_bitfield(
        &self,
        key: PeerKey,
        bitfield: PeerBitfield,
    ) -> Result<(), Error> {
        let peer = self.peers.get(key)?;
        let mut bits = peer.bits_mut();

        if bits.gone {
            return Err(Error::PeerNotFound(key));
        }

        self.stats.replace_bitfield(&bits.bitfield, &bitfield)?;
        debug!("peer {key} has {} pieces", bitfield.count());
        bits.bitfield = bitfield;

        Ok(())
    }

    /// A peer announced a new piece, returns false if it was already known.
    pub fn peer_have(&self, key: PeerKey, piece: usize) -> Result<bool, Error> {
        let peer = self.peers.get(key)?;
        let mut bits = peer.bits_mut();

        if bits.gone {
            return Err(Error::PeerNotFound(key));
        }
        if !bits.bitfield.mark_complete(piece)? {
            return Ok(false);
        }

        self.stats.add_piece(piece)?;
        Ok(true)
    }

    /// Remove a peer, its pieces no longer count and its assignment is
    /// released.
    pub fn remove_peer(&self, key: PeerKey) -> Result<(), Error> {
        let peer = self.peers.remove(key)?;

        let removed = {
            let mut bits = peer.bits_mut();
            bits.gone = true;
            self.stats.remove_bitfield(&bits.bitfield)
        };

        if let Some(piece) = peer.take_assignment() {
            self.release_owner(piece, key);
        }

        debug!("removed peer {key}");
        removed
    }

    /// True if the owner is a live peer.
    fn is_owned(&self, owner: u64) -> bool {
        PeerKey::from_u64(owner).is_some_and(|k| self.peers.is_live(k))
    }

    /// Some blocks of the piece are still missing.
    fn is_needed(&self, piece: usize) -> bool {
        matches!(
            self.local.get_piece_status(piece),
            Ok(PieceStatus::Empty | PieceStatus::Incomplete)
        )
    }

    /// The local peer needs the piece and nobody is downloading it.
    fn is_candidate(&self, peer: &PeerState, piece: usize) -> bool {
        let Some(owner) = self.owners.get(piece) else { return false };

        peer.has(piece)
            && self.is_needed(piece)
            && !self.is_owned(owner.load(Ordering::Acquire))
    }

    /// Take ownership of a free piece, a piece owned by a peer that is gone
    /// counts as free.
    fn claim(&self, piece: usize, me: u64) -> bool {
        let owner = &self.owners[piece];
        let mut current = owner.load(Ordering::Acquire);

        loop {
            if self.is_owned(current) {
                return false;
            }
            match owner.compare_exchange(
                current,
                me,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn release_owner(&self, piece: usize, key: PeerKey) -> bool {
        self.owners.get(piece).is_some_and(|owner| {
            owner
                .compare_exchange(
                    key.to_u64(),
                    0,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        })
    }

    /// Choose the next piece to download from the peer and assign it.
    ///
    /// A peer that already has an assignment gets it back. `None` means that
    /// the peer has nothing we need right now.
    pub fn select_piece_for_peer(
        &self,
        key: PeerKey,
    ) -> Result<Option<usize>, Error> {
        let peer = self.peers.get(key)?;

        if let Some(piece) = peer.assignment() {
            if self.is_needed(piece) {
                return Ok(Some(piece));
            }
            // every block is in, verification releases the owner
            peer.clear_assignment(piece);
        }

        let selector = self.selector();
        let availability = self.stats.snapshot();
        let candidates =
            Validating::new(selector, |p| self.is_candidate(&peer, p));
        let me = key.to_u64();

        for piece in candidates.select(&availability) {
            if !self.claim(piece, me) {
                continue;
            }

            // another call for the same peer won the race
            if let Err(existing) = peer.try_set_assignment(piece) {
                self.release_owner(piece, key);
                return Ok(Some(existing));
            }

            // the peer was removed while we were claiming
            if !self.peers.is_live(key) {
                peer.clear_assignment(piece);
                self.release_owner(piece, key);
                return Err(Error::PeerNotFound(key));
            }

            debug!("assigned piece {piece} to peer {key}");
            return Ok(Some(piece));
        }

        Ok(None)
    }

    /// Release the assignment of `piece` to the peer, if there is one.
    ///
    /// Calling it twice, with a stale key, or with a piece that is not
    /// assigned to the peer does nothing.
    pub fn unselect_piece_for_peer(&self, key: PeerKey, piece: usize) -> bool {
        if let Ok(peer) = self.peers.get(key) {
            peer.clear_assignment(piece);
        }
        let released = self.release_owner(piece, key);
        if released {
            debug!("unassigned piece {piece} from peer {key}");
        }
        released
    }

    /// Release whoever owns the piece, after it was verified or failed
    /// verification. Returns the previous owner.
    pub fn release_piece(&self, piece: usize) -> Option<PeerKey> {
        let owner = self.owners.get(piece)?.swap(0, Ordering::AcqRel);
        let key = PeerKey::from_u64(owner)?;

        if let Ok(peer) = self.peers.get(key) {
            peer.clear_assignment(piece);
        }
        Some(key)
    }

    /// The live peer assigned to the piece.
    pub fn assigned_peer(&self, piece: usize) -> Option<PeerKey> {
        let owner = self.owners.get(piece)?.load(Ordering::Acquire);
        PeerKey::from_u64(owner).filter(|k| self.peers.is_live(*k))
    }

    pub fn assignment(&self, key: PeerKey) -> Result<Option<usize>, Error> {
        Ok(self.peers.get(key)?.assignment())
    }

    pub fn check_piece_verified(&self, piece: usize) -> bool {
        self.local.is_verified(piece)
    }

    /// Whether [`Self::select_piece_for_peer`] could give the peer a piece
    /// right now, without assigning anything.
    pub fn might_select_piece_for_peer(&self, key: PeerKey) -> bool {
        let Ok(peer) = self.peers.get(key) else { return false };

        if peer.assignment().is_some_and(|p| self.is_needed(p)) {
            return true;
        }

        let ones: Vec<usize> = peer.bits().bitfield.iter_ones().collect();
        ones.into_iter().any(|p| self.is_candidate(&peer, p))
    }

    /// The peer has at least one piece that we do not have verified,
    /// regardless of assignments.
    pub fn is_interested(&self, key: PeerKey) -> bool {
        let Ok(peer) = self.peers.get(key) else { return false };
        let bits = peer.bits();
        let interested =
            bits.bitfield.iter_ones().any(|p| !self.local.is_verified(p));
        interested
    }
}
