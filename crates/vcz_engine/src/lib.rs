//! The download engine of Vincenzo, a BitTorrent client.
//!
//! This crate is the part of a client that sits between the wire and the
//! disk. It knows where every piece lives on disk, which blocks were
//! written, which pieces were verified, how many peers have each piece, and
//! which peer should download what. Connections, trackers and the bencode
//! decoding of .torrent files live elsewhere.
//!
//! The main building blocks are:
//!
//! * [`disk::ChunkStore`] reads and writes blocks across file boundaries and
//!   verifies pieces against their hash.
//! * [`bitfield::LocalBitfield`] tracks the status of every local piece.
//! * [`piece::PieceManager`] keeps the availability of each piece in the
//!   swarm and assigns each piece to at most one peer.
//!
//! # Example
//!
//! The wire layer talks to a [`torrent::Torrent`] with messages, every peer is
//! identified by its address.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use tokio::{spawn, sync::oneshot};
//! # use vcz_engine::{config::Config, disk::FileStorage, metainfo::Info};
//! # use vcz_engine::torrent::{Torrent, TorrentCtx, TorrentMsg};
//! # async fn f(info: Info) -> Result<(), vcz_engine::error::Error> {
//!    let storages = FileStorage::open_all("/tmp/downloads", &info)?;
//!    let ctx = TorrentCtx::new(info, storages, Config::default())?;
//!    let mut torrent = Torrent::new(Arc::new(ctx));
//!    let tx = torrent.tx.clone();
//!
//!    spawn(async move {
//!        torrent.run().await.unwrap();
//!    });
//!
//!    let addr = "127.0.0.1:6881".parse().unwrap();
//!    tx.send(TorrentMsg::PeerConnected(addr)).await?;
//!
//!    let (otx, orx) = oneshot::channel();
//!    tx.send(TorrentMsg::RequestPiece(addr, otx)).await?;
//!
//!    // the blocks to request from this peer, if any.
//!    let blocks = orx.await?;
//! # Ok(())
//! # }
//! ```

pub mod bitfield;
pub mod block;
pub mod config;
pub mod counter;
pub mod disk;
pub mod error;
pub mod metainfo;
pub mod peer;
pub mod piece;
pub mod torrent;
