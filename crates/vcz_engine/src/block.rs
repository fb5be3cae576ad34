//! Blocks are the unit of transfer and storage I/O, a piece is split into
//! blocks of [`BLOCK_LEN`] bytes, except for the last block of the last piece.
use bytes::Bytes;

/// The default block length used by virtually every client, 16 KiB.
pub const BLOCK_LEN: usize = 16384;

/// The largest block length that a [`crate::config::Config`] accepts.
pub const MAX_BLOCK_LEN: usize = 131072;

/// A block downloaded from a peer, ready to be written into a piece.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Block {
    /// The index of the piece of which this is a block.
    pub index: usize,

    /// The zero-based byte offset into the piece.
    pub begin: usize,

    /// The block's data.
    pub block: Bytes,
}

/// The representation of a [`Block`] that is requested from a peer.
///
/// This is almost identical to the [`Block`] struct,
/// the only difference is that instead of having a `block`,
/// we have a `len` representing the len of the block.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub index: usize,

    /// The zero-based byte offset into the piece.
    pub begin: usize,

    /// The block's length in bytes.
    pub len: usize,
}

impl Default for BlockInfo {
    fn default() -> Self {
        Self { index: 0, begin: 0, len: BLOCK_LEN }
    }
}

impl From<&Block> for BlockInfo {
    fn from(block: &Block) -> Self {
        BlockInfo {
            index: block.index,
            begin: block.begin,
            len: block.block.len(),
        }
    }
}

impl BlockInfo {
    pub fn new(index: usize, begin: usize, len: usize) -> Self {
        Self { index, begin, len }
    }

    /// Index of this block inside its piece, given the block length the
    /// piece was split with.
    pub fn block_index(&self, block_len: usize) -> usize {
        self.begin / block_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_info_from_block() {
        let block =
            Block { index: 3, begin: BLOCK_LEN, block: Bytes::from(vec![1; 10]) };
        let info = BlockInfo::from(&block);
        assert_eq!(info, BlockInfo::new(3, BLOCK_LEN, 10));
        assert_eq!(info.block_index(BLOCK_LEN), 1);
    }
}
