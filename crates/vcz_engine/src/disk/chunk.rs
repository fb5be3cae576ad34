//! A piece mapped onto the files that hold it.
use std::{
    ops::Range,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use tracing::debug;

use crate::{
    disk::{digest::Digest, storage::Storage},
    error::Error,
};

/// A contiguous range of one storage that belongs to a piece.
#[derive(Debug, Clone)]
pub struct Segment {
    pub storage: Arc<dyn Storage>,
    /// Offset inside the storage.
    pub offset: u64,
    pub length: u64,
}

impl Segment {
    pub fn new(storage: Arc<dyn Storage>, offset: u64, length: u64) -> Self {
        Self { storage, offset, length }
    }
}

/// The virtual address space of one piece, `0..len()`, laid over one or more
/// segments of the files of the torrent.
///
/// Besides the I/O, it remembers whether the content matched the reference
/// hash the last time it was checked. Which blocks were received is tracked by
/// [`crate::bitfield::LocalBitfield`] only.
#[derive(Debug)]
pub struct ChunkDescriptor {
    piece: usize,
    segments: Vec<Segment>,
    /// Virtual offset where each segment ends, non decreasing.
    ends: Vec<u64>,
    length: u64,
    block_len: u64,
    hash: Vec<u8>,
    verified: AtomicBool,
}

impl ChunkDescriptor {
    pub fn new(
        piece: usize,
        segments: Vec<Segment>,
        block_len: u64,
        hash: Vec<u8>,
    ) -> Result<Self, Error> {
        if segments.is_empty() {
            return Err(Error::NoSegments);
        }

        let mut ends = Vec::with_capacity(segments.len());
        let mut length = 0_u64;

        for segment in &segments {
            let end = segment
                .offset
                .checked_add(segment.length)
                .ok_or(Error::Overflow)?;
            if end > segment.storage.size() {
                return Err(Error::InsufficientData);
            }
            length =
                length.checked_add(segment.length).ok_or(Error::Overflow)?;
            ends.push(length);
        }

        if block_len == 0 || block_len > length {
            return Err(Error::BlockLenExceedsPiece {
                block_len,
                piece_len: length,
            });
        }

        Ok(Self {
            piece,
            segments,
            ends,
            length,
            block_len,
            hash,
            verified: AtomicBool::new(false),
        })
    }

    pub fn piece(&self) -> usize {
        self.piece
    }

    /// Size of the piece in bytes.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn block_len(&self) -> u64 {
        self.block_len
    }

    pub fn hash(&self) -> &[u8] {
        &self.hash
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Number of blocks of the piece.
    pub fn blocks(&self) -> usize {
        self.length.div_ceil(self.block_len) as usize
    }

    pub fn is_verified(&self) -> bool {
        self.verified.load(Ordering::Acquire)
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<u64, Error> {
        let end = offset.checked_add(len).ok_or(Error::Overflow)?;
        if end > self.length {
            return Err(Error::OutOfRange {
                piece: self.piece,
                offset,
                len,
                size: self.length,
            });
        }
        Ok(end)
    }

    /// Call `f` for every segment that intersects `offset..end`, with the
    /// offset inside the storage and the range relative to `offset`.
    fn for_each_segment(
        &self,
        offset: u64,
        end: u64,
        mut f: impl FnMut(&Segment, u64, Range<usize>) -> Result<(), Error>,
    ) -> Result<(), Error> {
        // zero length segments end where the previous one ends, so they are
        // never the first segment with an end past `offset`.
        let mut i = self.ends.partition_point(|&e| e <= offset);
        let mut pos = offset;

        while pos < end {
            let Some(segment) = self.segments.get(i) else {
                return Err(Error::InsufficientData);
            };
            let seg_end = self.ends[i];
            let seg_start = seg_end - segment.length;
            let n = end.min(seg_end) - pos;

            if n > 0 {
                let local = segment.offset + (pos - seg_start);
                let b = (pos - offset) as usize;
                f(segment, local, b..b + n as usize)?;
                pos += n;
            }
            i += 1;
        }

        Ok(())
    }

    /// Read `len` bytes starting at `offset` of the piece.
    pub fn read_block(&self, offset: u64, len: u64) -> Result<Bytes, Error> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let end = self.check_range(offset, len)?;

        let mut buf = vec![0; len as usize];
        self.read_range(offset, end, &mut buf)?;

        Ok(buf.into())
    }

    fn read_range(
        &self,
        offset: u64,
        end: u64,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        self.for_each_segment(offset, end, |segment, local, range| {
            segment.storage.read_into(local, &mut buf[range])
        })
    }

    /// Write `bytes` at `offset` of the piece.
    ///
    /// Returns the blocks that this write covered entirely. Unaligned writes
    /// are stored but the blocks they only cover in part are not returned.
    pub fn write_block(
        &self,
        offset: u64,
        bytes: &[u8],
    ) -> Result<Range<usize>, Error> {
        if bytes.is_empty() {
            return Ok(0..0);
        }
        let end = self.check_range(offset, bytes.len() as u64)?;

        self.for_each_segment(offset, end, |segment, local, range| {
            segment.storage.write_block(local, &bytes[range])
        })?;

        let first = offset.div_ceil(self.block_len) as usize;
        let last = if end == self.length {
            self.length.div_ceil(self.block_len)
        } else {
            end / self.block_len
        } as usize;

        Ok(first..last.max(first))
    }

    /// Hash the content of the piece, reading at most `step` bytes at a time,
    /// and compare it with the reference hash.
    ///
    /// The verified flag is only updated once the comparison is done.
    #[tracing::instrument(skip_all, fields(piece = self.piece))]
    pub fn verify(
        &self,
        digest: &dyn Digest,
        step: usize,
    ) -> Result<bool, Error> {
        let step = (step.max(1) as u64).min(self.length);
        let mut buf = vec![0; step as usize];
        let mut hasher = digest.hasher();
        let mut offset = 0;

        while offset < self.length {
            let end = (offset + step).min(self.length);
            let buf = &mut buf[..(end - offset) as usize];
            self.read_range(offset, end, buf)?;
            hasher.update(buf);
            offset = end;
        }

        let hash = hasher.finish();
        let valid = hash == self.hash;

        if valid {
            debug!("piece is valid {}", hex::encode(&hash));
        } else {
            debug!(
                "piece is corrupted, expected {} got {}",
                hex::encode(&self.hash),
                hex::encode(&hash)
            );
        }

        self.verified.store(valid, Ordering::Release);
        Ok(valid)
    }

    /// Forget the verification, after the piece failed the hash check.
    pub fn reset(&self) {
        self.verified.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{digest::Sha1Digest, storage::MemoryStorage};

    fn mem(bytes: Vec<u8>) -> Arc<MemoryStorage> {
        Arc::new(MemoryStorage::from(bytes))
    }

    #[test]
    fn rejects_invalid_layouts() {
        assert!(matches!(
            ChunkDescriptor::new(0, vec![], 4, vec![]),
            Err(Error::NoSegments)
        ));

        let storage = mem(vec![0; 10]);
        assert!(matches!(
            ChunkDescriptor::new(
                0,
                vec![Segment::new(storage.clone(), 0, 10)],
                11,
                vec![]
            ),
            Err(Error::BlockLenExceedsPiece { block_len: 11, piece_len: 10 })
        ));
        assert!(matches!(
            ChunkDescriptor::new(
                0,
                vec![Segment::new(storage.clone(), 5, 6)],
                2,
                vec![]
            ),
            Err(Error::InsufficientData)
        ));
        assert!(matches!(
            ChunkDescriptor::new(
                0,
                vec![Segment::new(storage, u64::MAX, 2)],
                2,
                vec![]
            ),
            Err(Error::Overflow)
        ));
    }

    #[test]
    fn zero_length_segments_are_skipped() {
        let a = mem((0..10).collect());
        let b = mem(vec![]);
        let c = mem(vec![100]);

        let chunk = ChunkDescriptor::new(
            0,
            vec![
                Segment::new(a.clone(), 0, 10),
                Segment::new(b, 0, 0),
                Segment::new(c.clone(), 0, 1),
            ],
            4,
            vec![],
        )
        .unwrap();
        assert_eq!(chunk.len(), 11);
        assert_eq!(chunk.blocks(), 3);

        // entirely inside the first segment
        assert_eq!(
            chunk.read_block(3, 7).unwrap().as_ref(),
            &[3, 4, 5, 6, 7, 8, 9]
        );

        chunk.write_block(3, &[1; 7]).unwrap();
        assert_eq!(a.to_vec(), vec![0, 1, 2, 1, 1, 1, 1, 1, 1, 1]);
        assert_eq!(c.to_vec(), vec![100]);

        // across the empty segment into the last one
        assert_eq!(chunk.read_block(9, 2).unwrap().as_ref(), &[1, 100]);
    }

    #[test]
    fn partial_segments() {
        let a = mem((0..20).collect());
        let b = mem((20..40).collect());

        // the suffix of `a` and the prefix of `b`
        let chunk = ChunkDescriptor::new(
            1,
            vec![Segment::new(a, 15, 5), Segment::new(b, 0, 5)],
            5,
            vec![],
        )
        .unwrap();

        assert_eq!(
            chunk.read_block(0, 10).unwrap().as_ref(),
            &(15..25).collect::<Vec<u8>>()[..]
        );
        assert_eq!(chunk.read_block(4, 2).unwrap().as_ref(), &[19, 20]);
    }

    #[test]
    fn range_errors() {
        let chunk = ChunkDescriptor::new(
            2,
            vec![Segment::new(mem(vec![0; 8]), 0, 8)],
            4,
            vec![],
        )
        .unwrap();

        assert!(chunk.read_block(8, 0).unwrap().is_empty());
        assert!(chunk.read_block(100, 0).unwrap().is_empty());
        assert!(matches!(
            chunk.read_block(6, 3),
            Err(Error::OutOfRange { piece: 2, offset: 6, len: 3, size: 8 })
        ));
        assert!(matches!(
            chunk.read_block(u64::MAX, 1),
            Err(Error::Overflow)
        ));
        assert!(matches!(
            chunk.write_block(7, &[0, 0]),
            Err(Error::OutOfRange { .. })
        ));
        assert!(chunk.write_block(3, &[]).unwrap().is_empty());
    }

    #[test]
    fn block_completion() {
        // 3 blocks of 4, 4, 2
        let chunk = ChunkDescriptor::new(
            0,
            vec![Segment::new(mem(vec![0; 10]), 0, 10)],
            4,
            vec![],
        )
        .unwrap();

        assert_eq!(chunk.blocks(), 3);

        // covers only half of block 0
        assert!(chunk.write_block(2, &[1, 1]).unwrap().is_empty());
        assert!(chunk.write_block(2, &[1]).unwrap().is_empty());

        assert_eq!(chunk.write_block(0, &[1; 4]).unwrap(), 0..1);
        // the last block is shorter
        assert_eq!(chunk.write_block(8, &[1; 2]).unwrap(), 2..3);
        assert_eq!(chunk.write_block(2, &[1; 8]).unwrap(), 1..3);
        assert!(chunk.write_block(5, &[1; 2]).unwrap().is_empty());
    }

    #[test]
    fn verify_round_trip() {
        let content: Vec<u8> = (0..50).collect();
        let hash = Sha1Digest.digest(&content);

        let a = mem(vec![0; 30]);
        let b = mem(vec![0; 20]);
        let chunk = ChunkDescriptor::new(
            0,
            vec![Segment::new(a, 0, 30), Segment::new(b, 0, 20)],
            16,
            hash,
        )
        .unwrap();

        for (i, block) in content.chunks(16).enumerate() {
            chunk.write_block(i as u64 * 16, block).unwrap();
        }
        assert!(!chunk.is_verified());

        // a step that does not divide the piece
        assert!(chunk.verify(&Sha1Digest, 7).unwrap());
        assert!(chunk.is_verified());

        chunk.write_block(33, &[0xff]).unwrap();
        assert!(!chunk.verify(&Sha1Digest, 64).unwrap());
        assert!(!chunk.is_verified());

        chunk.write_block(33, &[33]).unwrap();
        assert!(chunk.verify(&Sha1Digest, 64).unwrap());
        chunk.reset();
        assert!(!chunk.is_verified());
    }
}
