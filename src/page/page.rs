use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use parking_lot::RwLock;

use crate::bloom::Bloom;
use crate::chunk::{Chunk, ChunkHeader};
use crate::errors::{DbError, Result};
use crate::types::{Id, QueryInterval, Time};

use super::layout::{
    INDEX_RECORD_BYTES, IndexRecord, PAGE_HEADER_BYTES, PageHeader, body_offset, file_size,
    index_offset,
};

pub const PAGE_FILE_EXT: &str = ".page";
pub const PAGE_INDEX_EXT: &str = ".pagei";

#[must_use]
pub fn page_file_name(seq: u64) -> String {
    format!("{seq:08}{PAGE_FILE_EXT}")
}

/// One memory-mapped page file. Mutation (append, fsck, close) happens
/// under the write lock and only on the dropper/compaction path; queries
/// take the read lock and copy the slot bytes out before decoding, so the
/// lock is never held across decompression.
pub struct Page {
    path: PathBuf,
    name: String,
    mmap: RwLock<MmapMut>,
}

impl Page {
    /// Create an empty page with the given geometry. The header is
    /// persisted with `is_closed = false`: the page is live from birth.
    ///
    /// # Errors
    /// Propagates file creation and mapping failures.
    pub fn create(path: &Path, chunk_per_page: u32, chunk_size: u32) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(path)?;
        file.set_len(file_size(chunk_per_page, chunk_size))?;
        let mut mmap = map_file(&file)?;
        let header = PageHeader::new(chunk_per_page, chunk_size);
        header.write_to(&mut mmap[..PAGE_HEADER_BYTES]);
        mmap.flush()?;
        Ok(Self { path: path.to_path_buf(), name: file_name_of(path), mmap: RwLock::new(mmap) })
    }

    /// Map an existing page. A header that shows `is_closed = false` means
    /// the last engine died with the page live, so fsck walks the index
    /// before the page serves queries; the page then goes live again
    /// (`is_closed = false` until [`Page::close`]).
    ///
    /// # Errors
    /// `CorruptPage` when the header is unreadable.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mmap = map_file(&file)?;
        let Some(header) = PageHeader::read_from(&mmap) else {
            return Err(DbError::CorruptPage(file_name_of(path), "bad header".into()));
        };
        let page =
            Self { path: path.to_path_buf(), name: file_name_of(path), mmap: RwLock::new(mmap) };
        if !header.is_closed {
            log::warn!("page {} was not closed cleanly, running fsck", page.name);
            page.fsck()?;
        }
        {
            let mut mmap = page.mmap.write();
            let mut header = parse_header(&mmap);
            header.is_closed = false;
            header.write_to(&mut mmap[..PAGE_HEADER_BYTES]);
        }
        Ok(page)
    }

    /// Read just the header of a page file, without mapping the whole
    /// region — enough for inspection tools and open-time triage.
    ///
    /// # Errors
    /// `CorruptPage` when the header bytes do not parse.
    pub fn read_header(path: &Path) -> Result<PageHeader> {
        use std::io::Read;
        let mut buf = [0u8; PAGE_HEADER_BYTES];
        let mut file = std::fs::File::open(path)?;
        file.read_exact(&mut buf)?;
        PageHeader::read_from(&buf)
            .ok_or_else(|| DbError::CorruptPage(file_name_of(path), "bad header".into()))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn header(&self) -> PageHeader {
        parse_header(&self.mmap.read())
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.header().is_full
    }

    /// Copy a sealed chunk into the next free slot and commit its index
    /// record. Returns `Ok(false)` when the page has no room.
    ///
    /// Write order is body, then record, then header: a crash in between
    /// leaves either an unreferenced body (invisible) or a record whose
    /// CRC check fails at fsck.
    ///
    /// # Errors
    /// `CorruptChunk` when the body exceeds the page's slot size.
    pub fn append_chunk(&self, chunk: &Chunk, chunk_id: u64) -> Result<bool> {
        let mut mmap = self.mmap.write();
        let mut header = parse_header(&mmap);
        if header.is_full || header.added_chunks >= header.chunk_per_page {
            return Ok(false);
        }
        let body = chunk.body();
        if body.len() > header.chunk_size as usize {
            return Err(DbError::CorruptChunk(format!(
                "chunk body of {} bytes exceeds page slot size {}",
                body.len(),
                header.chunk_size
            )));
        }
        let slot = header.added_chunks;
        let offset = body_offset(header.chunk_per_page, header.chunk_size, slot);
        mmap[offset as usize..offset as usize + body.len()].copy_from_slice(body);

        let record = IndexRecord::from_chunk(chunk.header(), offset);
        let idx = index_offset(slot);
        record.write_to(&mut mmap[idx..idx + INDEX_RECORD_BYTES]);

        header.added_chunks += 1;
        header.min_time = header.min_time.min(record.min_time);
        header.max_time = header.max_time.max(record.max_time);
        header.max_chunk_id = header.max_chunk_id.max(chunk_id);
        if header.added_chunks >= header.chunk_per_page {
            header.is_full = true;
        }
        header.write_to(&mut mmap[..PAGE_HEADER_BYTES]);
        Ok(true)
    }

    /// All initialized records with their slot numbers.
    #[must_use]
    pub fn records(&self) -> Vec<(u32, IndexRecord)> {
        let mmap = self.mmap.read();
        let header = parse_header(&mmap);
        let mut out = Vec::new();
        for slot in 0..header.added_chunks.min(header.chunk_per_page) {
            let idx = index_offset(slot);
            let rec = IndexRecord::read_from(&mmap[idx..idx + INDEX_RECORD_BYTES]);
            if rec.is_init {
                out.push((slot, rec));
            }
        }
        out
    }

    /// Index-level admission for an interval query: id bloom, time
    /// overlap, flag bloom. No chunk body is touched.
    #[must_use]
    pub fn slots_by_interval(&self, q: &QueryInterval) -> Vec<(u32, Bloom)> {
        self.records()
            .into_iter()
            .filter(|(_, rec)| {
                rec.id_bloom.contains_any(&q.ids)
                    && q.intersects(rec.min_time, rec.max_time)
                    && rec.flag_bloom.passes_flag(q.flag)
            })
            .map(|(slot, rec)| (slot, rec.id_bloom))
            .collect()
    }

    /// Copy one slot out for decoding. `None` for cleared slots.
    #[must_use]
    pub fn read_slot(&self, slot: u32) -> Option<(ChunkHeader, Vec<u8>)> {
        let mmap = self.mmap.read();
        let header = parse_header(&mmap);
        if slot >= header.added_chunks {
            return None;
        }
        let idx = index_offset(slot);
        let rec = IndexRecord::read_from(&mmap[idx..idx + INDEX_RECORD_BYTES]);
        if !rec.is_init {
            return None;
        }
        let start = rec.offset as usize;
        let end = start.checked_add(rec.size as usize)?;
        if end > mmap.len() {
            log::error!("page {}: slot {slot} points outside the file", self.name);
            return None;
        }
        let body = mmap[start..end].to_vec();
        Some((rec.chunk_header(), body))
    }

    /// Candidate slots for a time-point lookup on `id`: every chunk that
    /// starts at or before the point, newest `max_time` first.
    #[must_use]
    pub fn slots_before_time_point(&self, id: Id, time_point: Time) -> Vec<(u32, Time)> {
        let mut slots: Vec<(u32, Time)> = self
            .records()
            .into_iter()
            .filter(|(_, rec)| rec.id == id && rec.min_time <= time_point)
            .map(|(slot, rec)| (slot, rec.max_time))
            .collect();
        slots.sort_by(|a, b| b.1.cmp(&a.1));
        slots
    }

    #[must_use]
    pub fn min_max_time(&self, id: Id) -> Option<(Time, Time)> {
        let mut range: Option<(Time, Time)> = None;
        for (_, rec) in self.records() {
            if rec.id == id {
                range = Some(match range {
                    Some((lo, hi)) => (lo.min(rec.min_time), hi.max(rec.max_time)),
                    None => (rec.min_time, rec.max_time),
                });
            }
        }
        range
    }

    /// Walk initialized records and drop every one whose body fails the
    /// sanity check (CRC plus first-sample id/time match), restoring from
    /// the `.pagei` sidecar where it still holds a matching good record.
    /// Ends with a recomputed header and `is_closed = true`.
    ///
    /// # Errors
    /// Propagates flush failures.
    pub fn fsck(&self) -> Result<()> {
        let sidecar = read_sidecar(&sidecar_path(&self.path)).unwrap_or_default();
        let mut mmap = self.mmap.write();
        let mut header = parse_header(&mmap);
        let mut removed = 0u32;
        let mut min_time = Time::MAX;
        let mut max_time = Time::MIN;
        for slot in 0..header.added_chunks.min(header.chunk_per_page) {
            let idx = index_offset(slot);
            let mut rec = IndexRecord::read_from(&mmap[idx..idx + INDEX_RECORD_BYTES]);
            if !rec.is_init {
                continue;
            }
            if !slot_is_sane(&mmap, &rec) {
                let restored = sidecar
                    .get(slot as usize)
                    .copied()
                    .filter(|side| side.is_init && slot_is_sane(&mmap, side));
                if let Some(side) = restored {
                    log::warn!("page {}: restored index record {slot} from sidecar", self.name);
                    rec = side;
                    rec.write_to(&mut mmap[idx..idx + INDEX_RECORD_BYTES]);
                } else {
                    log::error!("page {}: dropping corrupt chunk in slot {slot}", self.name);
                    rec.is_init = false;
                    rec.write_to(&mut mmap[idx..idx + INDEX_RECORD_BYTES]);
                    removed += 1;
                    continue;
                }
            }
            min_time = min_time.min(rec.min_time);
            max_time = max_time.max(rec.max_time);
        }
        header.removed_chunks += removed;
        header.min_time = min_time;
        header.max_time = max_time;
        header.is_closed = true;
        header.write_to(&mut mmap[..PAGE_HEADER_BYTES]);
        mmap.flush()?;
        Ok(())
    }

    /// Mark the page cleanly closed and flush the mapping.
    ///
    /// # Errors
    /// Propagates the flush failure.
    pub fn close(&self) -> Result<()> {
        let mut mmap = self.mmap.write();
        let mut header = parse_header(&mmap);
        header.is_closed = true;
        header.write_to(&mut mmap[..PAGE_HEADER_BYTES]);
        mmap.flush()?;
        Ok(())
    }

    /// # Errors
    /// Propagates the msync failure.
    pub fn flush(&self) -> Result<()> {
        self.mmap.read().flush()?;
        Ok(())
    }

    /// Snapshot the index records into the `.pagei` sidecar, one record
    /// per slot in slot order (cleared slots included, so positions map
    /// one-to-one at restore time).
    ///
    /// # Errors
    /// Propagates serialization and write failures.
    pub fn write_sidecar(&self) -> Result<()> {
        let records: Vec<IndexRecord> = {
            let mmap = self.mmap.read();
            let header = parse_header(&mmap);
            (0..header.added_chunks.min(header.chunk_per_page))
                .map(|slot| {
                    let idx = index_offset(slot);
                    IndexRecord::read_from(&mmap[idx..idx + INDEX_RECORD_BYTES])
                })
                .collect()
        };
        let bytes = bincode::serde::encode_to_vec(&records, bincode::config::standard())?;
        std::fs::write(sidecar_path(&self.path), bytes)?;
        Ok(())
    }

    /// Live chunks copied out for compaction.
    #[must_use]
    pub fn live_chunks(&self) -> Vec<Chunk> {
        self.records()
            .into_iter()
            .filter_map(|(slot, _)| self.read_slot(slot))
            .map(|(header, body)| Chunk::from_region(header, body))
            .collect()
    }
}

fn map_file(file: &std::fs::File) -> Result<MmapMut> {
    // mmap has no safe constructor; the map is private to this process's
    // page handles and the file stays owned by the engine.
    #[allow(unsafe_code)]
    let mmap = unsafe { MmapMut::map_mut(file) }?;
    Ok(mmap)
}

fn parse_header(mmap: &MmapMut) -> PageHeader {
    PageHeader::read_from(&mmap[..PAGE_HEADER_BYTES]).expect("header verified at open")
}

fn file_name_of(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
}

#[must_use]
pub fn sidecar_path(page_path: &Path) -> PathBuf {
    page_path.with_extension(&PAGE_INDEX_EXT[1..])
}

fn read_sidecar(path: &Path) -> Option<Vec<IndexRecord>> {
    let bytes = std::fs::read(path).ok()?;
    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
        .map(|(records, _)| records)
        .ok()
}

/// Body-level sanity check for one record: offsets inside the file, CRC
/// match, first sample agreeing with the index.
fn slot_is_sane(mmap: &MmapMut, rec: &IndexRecord) -> bool {
    let start = rec.offset as usize;
    let Some(end) = start.checked_add(rec.size as usize) else {
        return false;
    };
    if start < PAGE_HEADER_BYTES || end > mmap.len() {
        return false;
    }
    let chunk = Chunk::from_region(rec.chunk_header(), mmap[start..end].to_vec());
    chunk.verify()
}
