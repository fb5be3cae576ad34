//! Hash algorithms used to verify pieces.
use std::fmt;

use crate::metainfo::HASH_LEN;

/// A rolling hash, bytes are fed with `update` in any number of calls.
pub trait Hasher: Send {
    fn update(&mut self, bytes: &[u8]);
    fn finish(self: Box<Self>) -> Vec<u8>;
}

/// Factory of [`Hasher`]s, one per verification.
pub trait Digest: Send + Sync + fmt::Debug {
    fn hasher(&self) -> Box<dyn Hasher>;

    /// Length of the produced hash in bytes.
    fn len(&self) -> usize;

    /// Hash `bytes` in one go.
    fn digest(&self, bytes: &[u8]) -> Vec<u8> {
        let mut hasher = self.hasher();
        hasher.update(bytes);
        hasher.finish()
    }
}

/// SHA-1, the hash of the pieces of a v1 torrent.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha1Digest;

impl Hasher for sha1_smol::Sha1 {
    fn update(&mut self, bytes: &[u8]) {
        sha1_smol::Sha1::update(self, bytes);
    }

    fn finish(self: Box<Self>) -> Vec<u8> {
        self.digest().bytes().to_vec()
    }
}

impl Digest for Sha1Digest {
    fn hasher(&self) -> Box<dyn Hasher> {
        Box::new(sha1_smol::Sha1::new())
    }

    fn len(&self) -> usize {
        HASH_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_streamed_equals_whole() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let whole = Sha1Digest.digest(data);

        let mut hasher = Sha1Digest.hasher();
        for chunk in data.chunks(7) {
            hasher.update(chunk);
        }
        assert_eq!(hasher.finish(), whole);
        assert_eq!(whole.len(), Sha1Digest.len());
        assert_eq!(
            hex::encode(Sha1Digest.digest(b"abc")),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }
}
