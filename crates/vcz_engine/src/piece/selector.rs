//! Algorithms that decide in which order pieces are downloaded.
//!
//! A selector only orders pieces, it does not know what the local peer has
//! or which pieces are taken, that is filtered by [`Validating`].
use std::{fmt, sync::Arc};

use rand::seq::SliceRandom;

use crate::{config::PieceStrategy, piece::stats::Availability};

pub trait PieceSelector: fmt::Debug {
    /// Candidate pieces in the order they should be downloaded, each piece
    /// at most once.
    fn select<'a>(
        &'a self,
        stats: &Availability,
    ) -> Box<dyn Iterator<Item = usize> + 'a>;
}

impl<T: PieceSelector + ?Sized> PieceSelector for &T {
    fn select<'a>(
        &'a self,
        stats: &Availability,
    ) -> Box<dyn Iterator<Item = usize> + 'a> {
        (**self).select(stats)
    }
}

impl<T: PieceSelector + ?Sized> PieceSelector for Arc<T> {
    fn select<'a>(
        &'a self,
        stats: &Availability,
    ) -> Box<dyn Iterator<Item = usize> + 'a> {
        (**self).select(stats)
    }
}

/// Build the selector of a strategy.
pub fn from_strategy(
    strategy: PieceStrategy,
) -> Arc<dyn PieceSelector + Send + Sync> {
    match strategy {
        PieceStrategy::Sequential => Arc::new(Sequential),
        PieceStrategy::RarestFirst => Arc::new(RarestFirst::new(false)),
        PieceStrategy::RandomRarestFirst => Arc::new(RarestFirst::new(true)),
    }
}

/// Ascending index order, useful for streaming.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sequential;

impl PieceSelector for Sequential {
    fn select<'a>(
        &'a self,
        stats: &Availability,
    ) -> Box<dyn Iterator<Item = usize> + 'a> {
        let counts = stats.counts.clone();
        Box::new((0..counts.len()).filter(move |&p| counts[p] > 0))
    }
}

/// Pieces held by fewer peers first, pieces nobody has are left out.
///
/// Within a group of equal availability the deterministic variant keeps the
/// order in which the pieces reached that availability, then the index. The
/// randomized variant shuffles each group.
#[derive(Debug, Clone, Copy, Default)]
pub struct RarestFirst {
    randomized: bool,
}

impl RarestFirst {
    pub fn new(randomized: bool) -> Self {
        Self { randomized }
    }

    pub fn is_randomized(&self) -> bool {
        self.randomized
    }
}

impl PieceSelector for RarestFirst {
    fn select<'a>(
        &'a self,
        stats: &Availability,
    ) -> Box<dyn Iterator<Item = usize> + 'a> {
        let Availability { counts, stamps } = stats;

        let mut pieces: Vec<usize> =
            (0..counts.len()).filter(|&p| counts[p] > 0).collect();

        if !self.randomized {
            pieces.sort_unstable_by_key(|&p| (counts[p], stamps[p], p));
            return Box::new(pieces.into_iter());
        }

        pieces.sort_unstable_by_key(|&p| (counts[p], p));

        let mut rng = rand::thread_rng();
        let mut start = 0;
        while start < pieces.len() {
            let count = counts[pieces[start]];
            let len = pieces[start..]
                .iter()
                .take_while(|&&p| counts[p] == count)
                .count();
            pieces[start..start + len].shuffle(&mut rng);
            start += len;
        }

        Box::new(pieces.into_iter())
    }
}

/// Wraps a selector and only yields the pieces accepted by `predicate`,
/// without changing their order.
pub struct Validating<S, F> {
    inner: S,
    predicate: F,
}

impl<S, F> Validating<S, F>
where
    S: PieceSelector,
    F: Fn(usize) -> bool,
{
    pub fn new(inner: S, predicate: F) -> Self {
        Self { inner, predicate }
    }
}

impl<S: fmt::Debug, F> fmt::Debug for Validating<S, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validating")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl<S, F> PieceSelector for Validating<S, F>
where
    S: PieceSelector,
    F: Fn(usize) -> bool,
{
    fn select<'a>(
        &'a self,
        stats: &Availability,
    ) -> Box<dyn Iterator<Item = usize> + 'a> {
        Box::new(self.inner.select(stats).filter(|&p| (self.predicate)(p)))
    }
}
