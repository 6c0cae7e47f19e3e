//! Immutable page tier: a manager over memory-mapped page files, answering
//! queries from index records and handing out `ChunkLink` handles that keep
//! their page mapped while a reader is in flight.

mod layout;
mod page;

pub use layout::{INDEX_RECORD_BYTES, IndexRecord, PAGE_HEADER_BYTES, PageHeader};
pub use page::{PAGE_FILE_EXT, PAGE_INDEX_EXT, Page, page_file_name, sidecar_path};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::bloom::Bloom;
use crate::chunk::{Chunk, ChunkRef};
use crate::errors::Result;
use crate::manifest::Manifest;
use crate::reader::ReaderCallback;
use crate::settings::Settings;
use crate::types::{Id, QueryInterval, QueryTimePoint, Sample, Time};

/// Handle to one admitted chunk: page, slot and the id bloom that admitted
/// it. Holding the link holds the `Arc<Page>`, which is what defers unmap
/// until every in-flight reader is done.
#[derive(Clone)]
pub struct ChunkLink {
    pub page: Arc<Page>,
    pub slot: u32,
    pub id_bloom: Bloom,
}

pub struct PageTier {
    dir: PathBuf,
    manifest: Arc<Manifest>,
    chunk_per_page: u32,
    chunk_size: u32,
    pages: RwLock<Vec<Arc<Page>>>,
    next_page_seq: AtomicU64,
    next_chunk_id: AtomicU64,
}

impl PageTier {
    /// Open every page the manifest lists. An unreadable page is logged
    /// and skipped (its manifest entry stays, so the data is not
    /// discarded); a missing file is dropped from the manifest.
    ///
    /// # Errors
    /// Propagates manifest update failures.
    pub fn open(dir: &Path, manifest: Arc<Manifest>, settings: &Settings) -> Result<Self> {
        let mut pages = Vec::new();
        let mut next_page_seq = 1u64;
        let mut next_chunk_id = 1u64;
        for name in manifest.pages() {
            let path = dir.join(&name);
            if !path.exists() {
                log::error!("page {name} listed in manifest but missing on disk");
                manifest.remove_page(&name)?;
                continue;
            }
            match Page::open(&path) {
                Ok(page) => {
                    let header = page.header();
                    next_chunk_id = next_chunk_id.max(header.max_chunk_id + 1);
                    if let Some(seq) = parse_page_seq(&name) {
                        next_page_seq = next_page_seq.max(seq + 1);
                    }
                    pages.push(Arc::new(page));
                }
                Err(e) => {
                    log::error!("cannot open page {name}: {e}");
                }
            }
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            manifest,
            chunk_per_page: settings.chunk_per_page.max(1),
            chunk_size: settings.chunk_size.max(64),
            pages: RwLock::new(pages),
            next_page_seq: AtomicU64::new(next_page_seq),
            next_chunk_id: AtomicU64::new(next_chunk_id),
        })
    }

    /// Append sealed chunks, opening a fresh page whenever the current one
    /// fills. Touched pages are flushed and their sidecars rewritten
    /// before the call returns.
    ///
    /// # Errors
    /// Propagates page creation, manifest and write failures; the caller
    /// (dropper) restores the chunks to the memory tier on failure.
    pub fn append_chunks(&self, chunks: &[ChunkRef]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let mut touched: Vec<Arc<Page>> = Vec::new();
        for chunk in chunks {
            loop {
                let target = {
                    let pages = self.pages.read();
                    pages.iter().rev().find(|p| !p.is_full()).cloned()
                };
                let target = match target {
                    Some(p) => p,
                    None => self.create_page()?,
                };
                if target.append_chunk(chunk, self.next_chunk_id.fetch_add(1, Ordering::Relaxed))? {
                    if !touched.iter().any(|p| Arc::ptr_eq(p, &target)) {
                        touched.push(target);
                    }
                    break;
                }
                // lost the race to the last slot; try again on a new page
            }
        }
        for page in touched {
            page.flush()?;
            page.write_sidecar()?;
        }
        Ok(())
    }

    fn create_page(&self) -> Result<Arc<Page>> {
        let seq = self.next_page_seq.fetch_add(1, Ordering::Relaxed);
        let name = page_file_name(seq);
        let page = Page::create(&self.dir.join(&name), self.chunk_per_page, self.chunk_size)?;
        self.manifest.add_page(&name)?;
        let page = Arc::new(page);
        self.pages.write().push(Arc::clone(&page));
        Ok(page)
    }

    /// Index-only admission pass over every page.
    #[must_use]
    pub fn chunks_by_interval(&self, q: &QueryInterval) -> Vec<ChunkLink> {
        let pages = self.pages.read().clone();
        let mut out = Vec::new();
        for page in pages {
            for (slot, id_bloom) in page.slots_by_interval(q) {
                out.push(ChunkLink { page: Arc::clone(&page), slot, id_bloom });
            }
        }
        out
    }

    /// Decode admitted links lazily and stream matching samples to the
    /// callback. Cancellation is honored at chunk boundaries; returns
    /// false when the read stopped early.
    pub fn read_links(
        &self,
        q: &QueryInterval,
        links: &[ChunkLink],
        clb: &dyn ReaderCallback,
    ) -> bool {
        for link in links {
            if clb.is_canceled() {
                return false;
            }
            let Some((header, body)) = link.page.read_slot(link.slot) else {
                continue;
            };
            let chunk = Chunk::from_region(header, body);
            for s in chunk.reader() {
                if q.matches(&s) {
                    clb.call(&s);
                }
            }
        }
        true
    }

    /// Decode one admitted link into a shareable chunk, for CACHE-strategy
    /// staging.
    #[must_use]
    pub fn load_link(&self, link: &ChunkLink) -> Option<ChunkRef> {
        let (header, body) = link.page.read_slot(link.slot)?;
        Some(Arc::new(Chunk::from_region(header, body)))
    }

    /// Per id: the latest sample at or before the time point. Candidate
    /// chunks are tried newest-first; overlapping chunks (late writes) are
    /// drained until no candidate can beat the best sample found.
    #[must_use]
    pub fn values_before_time_point(&self, q: &QueryTimePoint) -> HashMap<Id, Sample> {
        let pages = self.pages.read().clone();
        let mut out = HashMap::new();
        for &id in &q.ids {
            let mut candidates: Vec<(Arc<Page>, u32, Time)> = Vec::new();
            for page in &pages {
                for (slot, max_time) in page.slots_before_time_point(id, q.time_point) {
                    candidates.push((Arc::clone(page), slot, max_time));
                }
            }
            candidates.sort_by(|a, b| b.2.cmp(&a.2));
            let mut best: Option<Sample> = None;
            for (page, slot, max_time) in candidates {
                if let Some(found) = &best
                    && max_time <= found.time
                {
                    break;
                }
                let Some((header, body)) = page.read_slot(slot) else { continue };
                let chunk = Chunk::from_region(header, body);
                for s in chunk.reader() {
                    if s.time <= q.time_point
                        && s.matches_flag(q.flag)
                        && best.as_ref().is_none_or(|b| s.time >= b.time)
                    {
                        best = Some(s);
                    }
                }
            }
            if let Some(s) = best {
                out.insert(id, s);
            }
        }
        out
    }

    #[must_use]
    pub fn min_time(&self) -> Option<Time> {
        self.pages
            .read()
            .iter()
            .map(|p| p.header())
            .filter(|h| h.added_chunks > h.removed_chunks)
            .map(|h| h.min_time)
            .min()
    }

    #[must_use]
    pub fn max_time(&self) -> Option<Time> {
        self.pages
            .read()
            .iter()
            .map(|p| p.header())
            .filter(|h| h.added_chunks > h.removed_chunks)
            .map(|h| h.max_time)
            .max()
    }

    #[must_use]
    pub fn min_max_time(&self, id: Id) -> Option<(Time, Time)> {
        let pages = self.pages.read().clone();
        let mut range: Option<(Time, Time)> = None;
        for page in pages {
            if let Some((min, max)) = page.min_max_time(id) {
                range = Some(match range {
                    Some((lo, hi)) => (lo.min(min), hi.max(max)),
                    None => (min, max),
                });
            }
        }
        range
    }

    /// Per-id `[min, max]` over every record of every page. The max side
    /// seeds the memory tier's replay watermark at engine open.
    #[must_use]
    pub fn load_min_max(&self) -> HashMap<Id, (Time, Time)> {
        let pages = self.pages.read().clone();
        let mut out: HashMap<Id, (Time, Time)> = HashMap::new();
        for page in pages {
            for (_, rec) in page.records() {
                out.entry(rec.id)
                    .and_modify(|(lo, hi)| {
                        *lo = (*lo).min(rec.min_time);
                        *hi = (*hi).max(rec.max_time);
                    })
                    .or_insert((rec.min_time, rec.max_time));
            }
        }
        out
    }

    #[must_use]
    pub fn files_count(&self) -> usize {
        self.pages.read().len()
    }

    /// Merge every page into one. Returns the number of pages removed.
    ///
    /// # Errors
    /// Propagates page creation and manifest failures.
    pub fn compact_all(&self) -> Result<usize> {
        let victims = self.pages.read().clone();
        self.compact(victims)
    }

    /// Merge the pages whose whole time range falls inside `[from, to)`.
    ///
    /// # Errors
    /// Propagates page creation and manifest failures.
    pub fn compact_range(&self, from: Time, to: Time) -> Result<usize> {
        let victims: Vec<Arc<Page>> = self
            .pages
            .read()
            .iter()
            .filter(|p| {
                let h = p.header();
                h.added_chunks > h.removed_chunks && from <= h.min_time && h.max_time < to
            })
            .cloned()
            .collect();
        self.compact(victims)
    }

    fn compact(&self, victims: Vec<Arc<Page>>) -> Result<usize> {
        if victims.len() < 2 {
            return Ok(0);
        }
        let mut chunks: Vec<Chunk> = victims.iter().flat_map(|p| p.live_chunks()).collect();
        chunks.sort_by_key(|c| (c.header().id, c.header().min_time));

        let seq = self.next_page_seq.fetch_add(1, Ordering::Relaxed);
        let name = page_file_name(seq);
        let slots = u32::try_from(chunks.len()).unwrap_or(u32::MAX).max(1);
        let merged = Arc::new(Page::create(&self.dir.join(&name), slots, self.chunk_size)?);
        for chunk in &chunks {
            merged.append_chunk(chunk, self.next_chunk_id.fetch_add(1, Ordering::Relaxed))?;
        }
        merged.flush()?;
        merged.write_sidecar()?;
        self.manifest.add_page(&name)?;

        let removed = victims.len();
        {
            let mut pages = self.pages.write();
            pages.retain(|p| !victims.iter().any(|v| Arc::ptr_eq(p, v)));
            pages.push(merged);
        }
        for victim in victims {
            self.manifest.remove_page(victim.name())?;
            // in-flight readers keep the mapping alive through their Arc;
            // the unlink only drops the directory entry
            if let Err(e) = std::fs::remove_file(victim.path()) {
                log::error!("failed to delete compacted page {}: {e}", victim.name());
            }
            let _ = std::fs::remove_file(sidecar_path(victim.path()));
        }
        log::info!("compacted {removed} pages into {name}");
        Ok(removed)
    }

    /// # Errors
    /// Propagates msync failures.
    pub fn flush(&self) -> Result<()> {
        for page in self.pages.read().iter() {
            page.flush()?;
        }
        Ok(())
    }

    /// Mark every page cleanly closed; part of engine stop.
    ///
    /// # Errors
    /// Propagates flush failures.
    pub fn stop(&self) -> Result<()> {
        for page in self.pages.read().iter() {
            page.write_sidecar()?;
            page.close()?;
        }
        Ok(())
    }
}

fn parse_page_seq(name: &str) -> Option<u64> {
    name.strip_suffix(PAGE_FILE_EXT)?.parse().ok()
}

impl std::fmt::Debug for PageTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageTier")
            .field("dir", &self.dir)
            .field("pages", &self.files_count())
            .finish()
    }
}
