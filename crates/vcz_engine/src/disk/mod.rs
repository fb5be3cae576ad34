//! Disk is responsible for the block I/O and the verification of the pieces
//! of a torrent.
//!
//! The files of a torrent are concatenated into one address space that is
//! cut into pieces, a piece may start in the middle of a file and end in the
//! middle of another one. [`ChunkStore`] computes that layout once and keeps
//! one [`ChunkDescriptor`] per piece.
pub mod chunk;
pub mod digest;
pub mod storage;

use std::{ops::Range, sync::Arc};

use bytes::Bytes;
use rayon::prelude::*;
use tracing::{debug, info, warn};

pub use chunk::{ChunkDescriptor, Segment};
pub use digest::{Digest, Hasher, Sha1Digest};
pub use storage::{FileStorage, MemoryStorage, Storage};

use crate::{
    bitfield::Bitfield, config::Config, error::Error, metainfo::Info,
};

#[derive(Debug)]
pub struct ChunkStore {
    chunks: Vec<ChunkDescriptor>,
    digest: Arc<dyn Digest>,
    verify_step: usize,
}

impl ChunkStore {
    /// Lay the pieces of `info` over `storages`, one storage per file in the
    /// order of [`Info::files`], verified with SHA-1.
    pub fn new(
        info: &Info,
        storages: Vec<Arc<dyn Storage>>,
        config: &Config,
    ) -> Result<Self, Error> {
        Self::with_digest(info, storages, config, Arc::new(Sha1Digest))
    }

    pub fn with_digest(
        info: &Info,
        storages: Vec<Arc<dyn Storage>>,
        config: &Config,
        digest: Arc<dyn Digest>,
    ) -> Result<Self, Error> {
        info.validate()?;
        let files = info.files();

        if files.len() != storages.len() {
            return Err(Error::InfoInvalid(format!(
                "{} files but {} storages",
                files.len(),
                storages.len()
            )));
        }

        // where each file starts and ends in the torrent
        let mut starts = Vec::with_capacity(files.len());
        let mut ends = Vec::with_capacity(files.len());
        let mut acc = 0_u64;

        for file in &files {
            starts.push(acc);
            acc = acc.checked_add(file.length).ok_or(Error::Overflow)?;
            ends.push(acc);
        }

        let mut chunks = Vec::with_capacity(info.pieces());

        for piece in 0..info.pieces() {
            let start = (piece as u64)
                .checked_mul(info.piece_length)
                .ok_or(Error::Overflow)?;
            let end = start + info.piece_size(piece)?;

            let mut segments = Vec::new();
            let mut i = ends.partition_point(|&e| e <= start);

            while i < files.len() && starts[i] < end {
                let b = start.max(starts[i]);
                let e = end.min(ends[i]);
                if e > b {
                    segments.push(Segment::new(
                        storages[i].clone(),
                        b - starts[i],
                        e - b,
                    ));
                }
                i += 1;
            }

            // the last piece may be smaller than a block
            let block_len = (config.block_len as u64).min(end - start);
            let hash = info
                .piece_hash(piece)
                .ok_or(Error::PieceIndexInvalid(piece))?
                .to_vec();

            chunks.push(ChunkDescriptor::new(piece, segments, block_len, hash)?);
        }

        debug!("laid {} pieces over {} files", chunks.len(), files.len());

        Ok(Self { chunks, digest, verify_step: config.verify_step })
    }

    pub fn pieces(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk(&self, piece: usize) -> Result<&ChunkDescriptor, Error> {
        self.chunks.get(piece).ok_or(Error::PieceIndexInvalid(piece))
    }

    pub fn read_block(
        &self,
        piece: usize,
        offset: u64,
        len: u64,
    ) -> Result<Bytes, Error> {
        self.chunk(piece)?.read_block(offset, len)
    }

    /// Write a block, returns the blocks of the piece that it covered.
    pub fn write_block(
        &self,
        piece: usize,
        offset: u64,
        bytes: &[u8],
    ) -> Result<Range<usize>, Error> {
        self.chunk(piece)?.write_block(offset, bytes)
    }

    /// Hash the piece and compare it with the reference hash.
    ///
    /// This blocks for the duration of a full piece read, do not call it while
    /// holding locks that other peers need.
    pub fn verify(&self, piece: usize) -> Result<bool, Error> {
        self.chunk(piece)?.verify(self.digest.as_ref(), self.verify_step)
    }

    /// Forget the verification of a piece that failed the hash check.
    pub fn reset(&self, piece: usize) -> Result<(), Error> {
        self.chunk(piece)?.reset();
        Ok(())
    }

    /// Verify every piece in parallel and return the ones that are valid, used
    /// at startup to rebuild the state from the files.
    ///
    /// Pieces that cannot be read are counted as missing.
    #[tracing::instrument(skip_all)]
    pub fn recheck(&self) -> Bitfield {
        let verified: Bitfield = self
            .chunks
            .par_iter()
            .map(|chunk| {
                match chunk.verify(self.digest.as_ref(), self.verify_step) {
                    Ok(valid) => valid,
                    Err(e) => {
                        warn!("could not read piece {}: {e}", chunk.piece());
                        false
                    }
                }
            })
            .collect::<Vec<bool>>()
            .into_iter()
            .collect();

        info!(
            "recheck found {} of {} pieces",
            verified.count_ones(),
            verified.len()
        );

        verified
    }
}
