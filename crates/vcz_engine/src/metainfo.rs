//! The part of a torrent's Info dictionary that the engine consumes.
//!
//! Decoding the bencoded .torrent file happens elsewhere, by the time an
//! [`Info`] reaches this crate it only carries the storage layout and the
//! reference hashes of the pieces.
use crate::{block::BlockInfo, error::Error};

/// Length of a SHA-1 digest, one per piece inside [`Info::pieces`].
pub const HASH_LEN: usize = 20;

/// File related information.
/// In a multi file format, `name` is name of the directory,
/// `file_length` is specific to the single file format
/// and in a multi file format it is replaced by `files`.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Info {
    /// If the torrent has only 1 file, this value is some, and files is none
    pub file_length: Option<u64>,

    /// If the torrent has many files, this is some, and file_length is none.
    pub files: Option<Vec<File>>,

    /// name of the file
    pub name: String,

    /// length in bytes of each piece, the last piece may have a smaller length
    pub piece_length: u64,

    /// A (byte) string consisting of the concatenation of all 20-byte SHA1
    /// hash values, one per piece.
    pub pieces: Vec<u8>,
}

/// A file of a multi file torrent.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct File {
    /// Length of the file in bytes
    pub length: u64,

    /// A list of UTF-8 encoded strings corresponding to subdirectory names,
    /// the last of which is the actual file name
    pub path: Vec<String>,
}

impl Info {
    /// Calculate how many pieces there are.
    #[inline]
    pub fn pieces(&self) -> usize {
        self.pieces.len().div_ceil(HASH_LEN)
    }

    /// Size of the whole torrent in bytes, the sum of all files.
    pub fn get_torrent_size(&self) -> u64 {
        match &self.files {
            Some(files) => files.iter().map(|f| f.length).sum(),
            None => self.file_length.unwrap_or(0),
        }
    }

    /// Files of the torrent in order, a single file torrent is a list with one
    /// file named after the torrent.
    pub fn files(&self) -> Vec<File> {
        match &self.files {
            Some(files) => files.clone(),
            None => vec![File {
                length: self.file_length.unwrap_or(0),
                path: vec![self.name.clone()],
            }],
        }
    }

    /// Get the correct piece size, the last piece of a torrent
    /// might be smaller than the other pieces.
    pub fn piece_size(&self, piece: usize) -> Result<u64, Error> {
        if piece >= self.pieces() {
            return Err(Error::PieceIndexInvalid(piece));
        }
        let start = (piece as u64)
            .checked_mul(self.piece_length)
            .ok_or(Error::Overflow)?;
        let end = start
            .checked_add(self.piece_length)
            .ok_or(Error::Overflow)?
            .min(self.get_torrent_size());
        Ok(end.saturating_sub(start))
    }

    /// The reference hash of the piece.
    pub fn piece_hash(&self, piece: usize) -> Option<&[u8]> {
        let b = piece.checked_mul(HASH_LEN)?;
        self.pieces.get(b..b + HASH_LEN)
    }

    /// How many blocks of `block_len` bytes the piece is split into.
    pub fn blocks_of_piece(
        &self,
        piece: usize,
        block_len: usize,
    ) -> Result<usize, Error> {
        let size = self.piece_size(piece)?;
        Ok(size.div_ceil(block_len as u64) as usize)
    }

    /// Get all block infos of a piece, the last block may be smaller than
    /// `block_len`.
    pub fn get_block_infos_of_piece(
        &self,
        piece: usize,
        block_len: usize,
    ) -> Result<Vec<BlockInfo>, Error> {
        let piece_size = self.piece_size(piece)? as usize;

        // calculate all blocks for this piece in one go
        let num_blocks = piece_size.div_ceil(block_len);
        let mut blocks = Vec::with_capacity(num_blocks);

        for block_index in 0..num_blocks {
            let begin = block_index * block_len;
            let len = if block_index == num_blocks - 1 {
                piece_size - begin
            } else {
                block_len
            };

            blocks.push(BlockInfo { index: piece, begin, len });
        }

        Ok(blocks)
    }

    /// Check that the layout is usable: a piece length, one hash per piece,
    /// and at least one byte of content.
    pub fn validate(&self) -> Result<(), Error> {
        if self.piece_length == 0 {
            return Err(Error::InfoInvalid("piece length is zero".into()));
        }
        if self.pieces.len() % HASH_LEN != 0 {
            return Err(Error::InfoInvalid(format!(
                "pieces has {} bytes, not a multiple of {HASH_LEN}",
                self.pieces.len()
            )));
        }
        if self.files.is_some() == self.file_length.is_some() {
            return Err(Error::InfoInvalid(
                "exactly one of `files` and `length` must be present".into(),
            ));
        }

        let total = self
            .files()
            .iter()
            .try_fold(0_u64, |acc, f| acc.checked_add(f.length))
            .ok_or(Error::Overflow)?;

        if total == 0 {
            return Err(Error::InfoInvalid("torrent has no content".into()));
        }

        let expected = total.div_ceil(self.piece_length);
        if expected != self.pieces() as u64 {
            return Err(Error::InfoInvalid(format!(
                "{} hashes for {expected} pieces",
                self.pieces()
            )));
        }

        Ok(())
    }
}
