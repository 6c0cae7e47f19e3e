//! On-disk page layout: `[PageHeader][IndexRecord × chunk_per_page]
//! [chunk body region]`, packed little-endian at fixed offsets.
//!
//! Fields are encoded by hand rather than transmuted: the mapped region is
//! shared with concurrent readers and a stray padding byte or endianness
//! assumption would silently poison every page on disk.

use serde::{Deserialize, Serialize};

use crate::bloom::Bloom;
use crate::chunk::ChunkHeader;
use crate::types::{Id, SAMPLE_BYTES, Sample, Time};

pub const PAGE_MAGIC: u32 = 0x434c_5047; // "CLPG"
pub const PAGE_FORMAT: u32 = 1;

pub const PAGE_HEADER_BYTES: usize = 64;
pub const INDEX_RECORD_BYTES: usize = 96;

const FLAG_FULL: u8 = 1 << 0;
const FLAG_CLOSED: u8 = 1 << 1;

const REC_FLAG_INIT: u8 = 1 << 0;
const REC_FLAG_READONLY: u8 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub added_chunks: u32,
    pub removed_chunks: u32,
    pub file_size: u64,
    pub is_full: bool,
    pub is_closed: bool,
    pub min_time: Time,
    pub max_time: Time,
    pub max_chunk_id: u64,
    pub chunk_per_page: u32,
    pub chunk_size: u32,
}

impl PageHeader {
    #[must_use]
    pub fn new(chunk_per_page: u32, chunk_size: u32) -> Self {
        Self {
            added_chunks: 0,
            removed_chunks: 0,
            file_size: file_size(chunk_per_page, chunk_size),
            is_full: false,
            is_closed: false,
            min_time: Time::MAX,
            max_time: Time::MIN,
            max_chunk_id: 0,
            chunk_per_page,
            chunk_size,
        }
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= PAGE_HEADER_BYTES);
        buf[..PAGE_HEADER_BYTES].fill(0);
        buf[0..4].copy_from_slice(&PAGE_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&PAGE_FORMAT.to_le_bytes());
        buf[8..12].copy_from_slice(&self.added_chunks.to_le_bytes());
        buf[12..16].copy_from_slice(&self.removed_chunks.to_le_bytes());
        buf[16..24].copy_from_slice(&self.file_size.to_le_bytes());
        let mut flags = 0u8;
        if self.is_full {
            flags |= FLAG_FULL;
        }
        if self.is_closed {
            flags |= FLAG_CLOSED;
        }
        buf[24] = flags;
        buf[32..40].copy_from_slice(&self.min_time.to_le_bytes());
        buf[40..48].copy_from_slice(&self.max_time.to_le_bytes());
        buf[48..56].copy_from_slice(&self.max_chunk_id.to_le_bytes());
        buf[56..60].copy_from_slice(&self.chunk_per_page.to_le_bytes());
        buf[60..64].copy_from_slice(&self.chunk_size.to_le_bytes());
    }

    /// `None` when the magic or format does not match.
    #[must_use]
    pub fn read_from(buf: &[u8]) -> Option<Self> {
        if buf.len() < PAGE_HEADER_BYTES {
            return None;
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().ok()?);
        let format = u32::from_le_bytes(buf[4..8].try_into().ok()?);
        if magic != PAGE_MAGIC || format != PAGE_FORMAT {
            return None;
        }
        let flags = buf[24];
        Some(Self {
            added_chunks: u32::from_le_bytes(buf[8..12].try_into().ok()?),
            removed_chunks: u32::from_le_bytes(buf[12..16].try_into().ok()?),
            file_size: u64::from_le_bytes(buf[16..24].try_into().ok()?),
            is_full: flags & FLAG_FULL != 0,
            is_closed: flags & FLAG_CLOSED != 0,
            min_time: u64::from_le_bytes(buf[32..40].try_into().ok()?),
            max_time: u64::from_le_bytes(buf[40..48].try_into().ok()?),
            max_chunk_id: u64::from_le_bytes(buf[48..56].try_into().ok()?),
            chunk_per_page: u32::from_le_bytes(buf[56..60].try_into().ok()?),
            chunk_size: u32::from_le_bytes(buf[60..64].try_into().ok()?),
        })
    }
}

/// Total page file size for a given geometry.
#[must_use]
pub const fn file_size(chunk_per_page: u32, chunk_size: u32) -> u64 {
    PAGE_HEADER_BYTES as u64
        + chunk_per_page as u64 * INDEX_RECORD_BYTES as u64
        + chunk_per_page as u64 * chunk_size as u64
}

#[must_use]
pub const fn index_offset(slot: u32) -> usize {
    PAGE_HEADER_BYTES + slot as usize * INDEX_RECORD_BYTES
}

#[must_use]
pub const fn body_offset(chunk_per_page: u32, chunk_size: u32, slot: u32) -> u64 {
    PAGE_HEADER_BYTES as u64
        + chunk_per_page as u64 * INDEX_RECORD_BYTES as u64
        + slot as u64 * chunk_size as u64
}

/// One index slot. Serde derives serve the `.pagei` sidecar snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub is_init: bool,
    pub is_readonly: bool,
    pub count: u32,
    pub id: Id,
    pub id_bloom: Bloom,
    pub flag_bloom: Bloom,
    pub min_time: Time,
    pub max_time: Time,
    pub first: Sample,
    pub offset: u64,
    pub size: u32,
    pub crc: u32,
}

impl IndexRecord {
    #[must_use]
    pub fn from_chunk(header: &ChunkHeader, offset: u64) -> Self {
        let mut id_bloom = Bloom::empty();
        id_bloom.add(header.id);
        Self {
            is_init: true,
            is_readonly: true,
            count: header.count,
            id: header.id,
            id_bloom,
            flag_bloom: header.flag_bloom,
            min_time: header.min_time,
            max_time: header.max_time,
            first: header.first,
            offset,
            size: header.capacity_bytes,
            crc: header.crc,
        }
    }

    /// Header view for decoding the chunk body this record describes.
    #[must_use]
    pub fn chunk_header(&self) -> ChunkHeader {
        ChunkHeader {
            id: self.id,
            first: self.first,
            count: self.count,
            min_time: self.min_time,
            max_time: self.max_time,
            flag_bloom: self.flag_bloom,
            is_sealed: true,
            capacity_bytes: self.size,
            crc: self.crc,
        }
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= INDEX_RECORD_BYTES);
        buf[..INDEX_RECORD_BYTES].fill(0);
        let mut flags = 0u8;
        if self.is_init {
            flags |= REC_FLAG_INIT;
        }
        if self.is_readonly {
            flags |= REC_FLAG_READONLY;
        }
        buf[0] = flags;
        buf[4..8].copy_from_slice(&self.count.to_le_bytes());
        buf[8..16].copy_from_slice(&self.id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.id_bloom.0.to_le_bytes());
        buf[24..32].copy_from_slice(&self.flag_bloom.0.to_le_bytes());
        buf[32..40].copy_from_slice(&self.min_time.to_le_bytes());
        buf[40..48].copy_from_slice(&self.max_time.to_le_bytes());
        self.first.write_to(&mut buf[48..48 + SAMPLE_BYTES]);
        buf[76..84].copy_from_slice(&self.offset.to_le_bytes());
        buf[84..88].copy_from_slice(&self.size.to_le_bytes());
        buf[88..92].copy_from_slice(&self.crc.to_le_bytes());
    }

    #[must_use]
    pub fn read_from(buf: &[u8]) -> Self {
        let flags = buf[0];
        Self {
            is_init: flags & REC_FLAG_INIT != 0,
            is_readonly: flags & REC_FLAG_READONLY != 0,
            count: u32::from_le_bytes(buf[4..8].try_into().expect("4-byte slice")),
            id: u64::from_le_bytes(buf[8..16].try_into().expect("8-byte slice")),
            id_bloom: Bloom(u64::from_le_bytes(buf[16..24].try_into().expect("8-byte slice"))),
            flag_bloom: Bloom(u64::from_le_bytes(buf[24..32].try_into().expect("8-byte slice"))),
            min_time: u64::from_le_bytes(buf[32..40].try_into().expect("8-byte slice")),
            max_time: u64::from_le_bytes(buf[40..48].try_into().expect("8-byte slice")),
            first: Sample::read_from(&buf[48..48 + SAMPLE_BYTES]),
            offset: u64::from_le_bytes(buf[76..84].try_into().expect("8-byte slice")),
            size: u32::from_le_bytes(buf[84..88].try_into().expect("4-byte slice")),
            crc: u32::from_le_bytes(buf[88..92].try_into().expect("4-byte slice")),
        }
    }
}
