use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errors::Result;
use crate::types::{SAMPLE_BYTES, Sample};

pub const WAL_FILE_EXT: &str = ".wal";

/// Segment header: `{segment_id: u64, sample_count: u32}`, little-endian,
/// no padding. The count is only authoritative for cleanly closed
/// segments; an open segment's true count is derived from the file size,
/// which also makes a torn trailing record recoverable.
pub const SEGMENT_HEADER_BYTES: usize = 8 + 4;

#[must_use]
pub fn segment_file_name(id: u64) -> String {
    format!("{id:08}{WAL_FILE_EXT}")
}

/// One uncompressed append-only WAL file.
#[derive(Debug)]
pub struct WalSegment {
    path: PathBuf,
    file: File,
    id: u64,
    count: u32,
    capacity: u32,
}

impl WalSegment {
    /// Create a fresh segment with a zero-count header.
    ///
    /// # Errors
    /// Propagates file creation/write failures.
    pub fn create(dir: &Path, id: u64, capacity: u32) -> Result<Self> {
        let path = dir.join(segment_file_name(id));
        let mut file = OpenOptions::new().create_new(true).read(true).write(true).open(&path)?;
        let mut header = [0u8; SEGMENT_HEADER_BYTES];
        header[0..8].copy_from_slice(&id.to_le_bytes());
        file.write_all(&header)?;
        file.sync_data()?;
        Ok(Self { path, file, id, count: 0, capacity })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.count >= self.capacity
    }

    /// Append one record at the tail. Durability is the tier's concern —
    /// see the sync policy handling there.
    ///
    /// # Errors
    /// Propagates the write failure; the record is then not durable and
    /// the tier halts.
    pub fn append(&mut self, s: &Sample) -> Result<()> {
        let mut buf = [0u8; SAMPLE_BYTES];
        s.write_to(&mut buf);
        self.file.write_all(&buf)?;
        self.count += 1;
        Ok(())
    }

    /// # Errors
    /// Propagates the fsync failure.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Stamp the final count into the header and fsync. Called at rotation
    /// and at engine stop.
    ///
    /// # Errors
    /// Propagates seek/write/fsync failures.
    pub fn close(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(8))?;
        self.file.write_all(&self.count.to_le_bytes())?;
        self.file.seek(SeekFrom::End(0))?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Read every complete record of a segment file in append order. A
    /// truncated trailing record (torn write at crash) is discarded, not
    /// fatal.
    ///
    /// # Errors
    /// Propagates open/read failures; a short header means the segment
    /// never finished creation and yields no samples.
    pub fn scan(path: &Path) -> Result<Vec<Sample>> {
        let mut file = File::open(path)?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        if raw.len() < SEGMENT_HEADER_BYTES {
            log::warn!("wal segment {} has a short header, skipping", path.display());
            return Ok(Vec::new());
        }
        let body = &raw[SEGMENT_HEADER_BYTES..];
        let whole = body.len() / SAMPLE_BYTES;
        if body.len() % SAMPLE_BYTES != 0 {
            log::warn!(
                "wal segment {} has a truncated trailing record, dropping it",
                path.display()
            );
        }
        let mut out = Vec::with_capacity(whole);
        for i in 0..whole {
            out.push(Sample::read_from(&body[i * SAMPLE_BYTES..(i + 1) * SAMPLE_BYTES]));
        }
        Ok(out)
    }
}
