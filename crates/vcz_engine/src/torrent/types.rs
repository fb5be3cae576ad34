use std::net::SocketAddr;

use tokio::sync::oneshot;

use crate::{
    bitfield::Bitfield,
    block::{Block, BlockInfo},
    error::Error,
};

/// Messages sent by the wire layer to a [`super::Torrent`].
///
/// Peers are identified by their address, the torrent maps them to the keys
/// of the engine.
#[derive(Debug)]
pub enum TorrentMsg {
    /// A peer finished the handshake.
    PeerConnected(SocketAddr),

    /// The raw payload of a bitfield message, the result tells the wire layer
    /// if the peer must be dropped.
    PeerBitfield(SocketAddr, Vec<u8>, oneshot::Sender<Result<(), Error>>),

    /// A have message.
    PeerHave(SocketAddr, usize),

    /// The connection was closed, the peer's pieces no longer count and its
    /// assignment is released.
    PeerDisconnected(SocketAddr),

    /// Assign a piece to the peer and get the blocks to request from it,
    /// `None` if the peer has nothing we need.
    RequestPiece(SocketAddr, oneshot::Sender<Option<Vec<BlockInfo>>>),

    /// The peer stopped answering, give its piece to someone else.
    UnselectPiece(SocketAddr, usize),

    /// Whether the wire layer should be interested in the peer.
    IsInterested(SocketAddr, oneshot::Sender<bool>),

    /// A block downloaded from a peer.
    BlockReceived(Block),

    /// The verified pieces, sent to peers in a bitfield message.
    ReadBitfield(oneshot::Sender<Bitfield>),

    GetTorrentState(oneshot::Sender<TorrentState>),

    /// When torrent is being gracefully shutdown
    Quit,
}

/// Broadcasted when a piece was checked, so that the wire layer can send
/// have messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PieceEvent {
    Verified(usize),
    /// The piece did not match its hash and will be downloaded again.
    Failed(usize),
    /// Every piece is verified.
    DownloadComplete,
}

/// What happened to a received block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockOutcome {
    /// Written, the piece still misses blocks.
    Stored,
    /// The piece is complete or verified already, the block was dropped.
    Ignored,
    PieceVerified(usize),
    PieceFailed(usize),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TorrentStatus {
    #[default]
    Downloading,
    Seeding,
}

/// Snapshot of a torrent, used to present data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TorrentState {
    pub name: String,
    pub status: TorrentStatus,
    pub size: u64,
    pub pieces: usize,
    pub verified_pieces: usize,
    pub connected_peers: usize,
    /// Bytes written, including the ones of pieces that failed.
    pub written: u64,
    pub verified: u64,
    pub wasted: u64,
    pub write_rate: u64,
}
