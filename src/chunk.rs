use std::sync::Arc;

use crate::bloom::Bloom;
use crate::compression::{SampleCompressor, SampleDecompressor};
use crate::types::{Id, Sample, Time};

/// Outcome of `OpenChunk::append`. `Full` and `OutOfOrder` are control
/// flow, not errors: callers roll over to a fresh chunk and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendStatus {
    Appended,
    Full,
    OutOfOrder,
}

/// Descriptor shared by open chunks, sealed chunks and page index records.
#[derive(Debug, Clone, Copy)]
pub struct ChunkHeader {
    pub id: Id,
    pub first: Sample,
    pub count: u32,
    pub min_time: Time,
    pub max_time: Time,
    pub flag_bloom: Bloom,
    pub is_sealed: bool,
    pub capacity_bytes: u32,
    /// CRC of the body, stamped at seal time. 0 while open.
    pub crc: u32,
}

impl ChunkHeader {
    fn open(first: &Sample, capacity_bytes: u32) -> Self {
        let mut flag_bloom = Bloom::empty();
        flag_bloom.add(u64::from(first.flag));
        Self {
            id: first.id,
            first: *first,
            count: 1,
            min_time: first.time,
            max_time: first.time,
            flag_bloom,
            is_sealed: false,
            capacity_bytes,
            crc: 0,
        }
    }
}

/// A chunk still accepting appends. Owned by exactly one memory-tier slot;
/// the tier mutex is what makes header and body move together.
#[derive(Debug)]
pub struct OpenChunk {
    header: ChunkHeader,
    codec: SampleCompressor,
}

impl OpenChunk {
    /// `body` is a zero-filled slab of `capacity_bytes` from the allocator.
    #[must_use]
    pub fn new(body: Vec<u8>, first: &Sample) -> Self {
        let header = ChunkHeader::open(first, body.len() as u32);
        Self { header, codec: SampleCompressor::new(body, first) }
    }

    #[must_use]
    pub const fn header(&self) -> &ChunkHeader {
        &self.header
    }

    /// Append in id/time order. Equal `time` to the current `max_time` is
    /// accepted (same chunk); an earlier time is `OutOfOrder`.
    pub fn append(&mut self, s: &Sample) -> AppendStatus {
        debug_assert_eq!(s.id, self.header.id);
        if s.time < self.header.max_time {
            return AppendStatus::OutOfOrder;
        }
        if !self.codec.append(s) {
            return AppendStatus::Full;
        }
        self.header.max_time = s.time;
        self.header.count += 1;
        self.header.flag_bloom.add(u64::from(s.flag));
        AppendStatus::Appended
    }

    /// Decoded view of everything appended so far. The header's `count`
    /// bounds the cursor, so a reader taken between appends is consistent.
    #[must_use]
    pub fn reader(&self) -> SampleDecompressor<'_> {
        SampleDecompressor::new(self.codec.body(), self.header.first, self.header.count)
    }

    /// Freeze the body and stamp the CRC. The result is shareable with
    /// in-flight readers via `Arc`.
    #[must_use]
    pub fn seal(self) -> Chunk {
        let body = self.codec.into_body();
        let mut header = self.header;
        header.is_sealed = true;
        header.crc = crc_of(&body);
        Chunk { header, body }
    }
}

/// A sealed, immutable chunk. Lives in the memory tier until the dropper
/// hands it to the page tier; page readers rebuild the same shape from a
/// mapped slot via `from_region`.
#[derive(Debug)]
pub struct Chunk {
    header: ChunkHeader,
    body: Vec<u8>,
}

pub type ChunkRef = Arc<Chunk>;

impl Chunk {
    #[must_use]
    pub const fn header(&self) -> &ChunkHeader {
        &self.header
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Rebuild a read-only chunk from a page slot: the index record's
    /// header fields plus a copy of the slot bytes.
    #[must_use]
    pub fn from_region(header: ChunkHeader, body: Vec<u8>) -> Self {
        Self { header, body }
    }

    #[must_use]
    pub fn reader(&self) -> SampleDecompressor<'_> {
        SampleDecompressor::new(&self.body, self.header.first, self.header.count)
    }

    /// Body-level sanity check used by fsck: CRC match plus the anchoring
    /// first sample agreeing with the header.
    #[must_use]
    pub fn verify(&self) -> bool {
        if self.header.crc != crc_of(&self.body) {
            return false;
        }
        match self.reader().next() {
            Some(first) => first.id == self.header.id && first.time == self.header.first.time,
            None => false,
        }
    }
}

fn crc_of(body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    hasher.finalize()
}
