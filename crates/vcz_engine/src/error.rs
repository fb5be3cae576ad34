use std::{io, net::SocketAddr};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::{peer::PeerKey, torrent::TorrentMsg};

impl From<mpsc::error::SendError<TorrentMsg>> for Error {
    fn from(_value: mpsc::error::SendError<TorrentMsg>) -> Self {
        Self::SendErrorTorrent
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(
        "Range out of bounds on piece {piece}: offset {offset} with length \
         {len} exceeds the piece size {size}"
    )]
    OutOfRange { piece: usize, offset: u64, len: u64, size: u64 },

    #[error("The storage does not have enough bytes to satisfy the request")]
    InsufficientData,

    #[error("A chunk must be backed by at least one file segment")]
    NoSegments,

    #[error(
        "The block length `{block_len}` is larger than the piece size \
         `{piece_len}`"
    )]
    BlockLenExceedsPiece { block_len: u64, piece_len: u64 },

    #[error("Integer overflow while computing offsets")]
    Overflow,

    #[error("The piece index `{0}` does not exist in this torrent")]
    PieceIndexInvalid(usize),

    #[error("The block index `{block}` does not exist in piece `{piece}`")]
    BlockIndexInvalid { piece: usize, block: usize },

    #[error(
        "The bitfield has `{received}` bytes but `{expected}` bytes were \
         expected"
    )]
    BitfieldLength { expected: usize, received: usize },

    #[error("The bitfield has bits set past the last piece")]
    BitfieldSpareBits,

    #[error("The peer `{0}` is not connected")]
    PeerNotFound(PeerKey),

    #[error("No peer is connected from `{0}`")]
    PeerAddrUnknown(SocketAddr),

    #[error(
        "Availability of piece `{0}` would go below zero, a bitfield was \
         removed without being added"
    )]
    AvailabilityUnderflow(usize),

    #[error("The torrent info is invalid: {0}")]
    InfoInvalid(String),

    #[error("Configuration error: {0}")]
    ConfigInvalid(String),

    #[error("Error while trying to decode the configuration file")]
    ConfigDeserializeError(#[from] toml::de::Error),

    #[error(
        "Could not open the file `{0}`. Please make sure the program has \
         permission to access it"
    )]
    FileOpenError(String),

    #[error("IO error")]
    IO(#[from] io::Error),

    #[error("Could not send message to Torrent")]
    SendErrorTorrent,

    #[error("Could not receive message from oneshot")]
    ReceiveErrorOneshot(#[from] oneshot::error::RecvError),
}
