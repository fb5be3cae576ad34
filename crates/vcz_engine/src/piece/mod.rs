//! Piece scheduling: availability among peers, selection order, and the
//! assignment of pieces to peers.
pub mod manager;
pub mod selector;
pub mod stats;

pub use manager::PieceManager;
pub use selector::{PieceSelector, RarestFirst, Sequential, Validating};
pub use stats::{Availability, PieceStatistics};
