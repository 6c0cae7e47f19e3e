//! Column-oriented buffer of recent data: one open compressed chunk per
//! series plus the sealed chunks waiting for the dropper, all inside a
//! fixed allocator budget.
//!
//! Only the dropper appends here (user writes land in the WAL first), so
//! chunk bodies are naturally single-writer. Queries snapshot under the
//! tier mutex — open chunks decode inside the lock (bounded by one body),
//! sealed chunks are `Arc`-cloned and decoded outside it — so a reader
//! never observes a half-written sample.

mod allocator;

pub use allocator::SlabAllocator;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::chunk::{AppendStatus, ChunkRef, OpenChunk};
use crate::types::{Id, QueryInterval, QueryTimePoint, Sample, Time};

/// Outcome of a migration append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAppendStatus {
    Appended,
    /// Allocator budget spent; evict and retry once.
    Exhausted,
    /// Replay duplicate — the page tier already holds this sample.
    Deduped,
}

/// Identity of a staged page chunk under the CACHE strategy.
pub type StageKey = (String, u32);

#[derive(Debug, Default)]
struct Series {
    open: Option<OpenChunk>,
    sealed: Vec<ChunkRef>,
}

struct MemInner {
    series: HashMap<Id, Series>,
    alloc: SlabAllocator,
    /// Per-id max time confirmed durable in the page tier. Seeds replay
    /// dedup after restart and advances as drops commit.
    sync_map: HashMap<Id, Time>,
    /// CACHE-strategy staging: decoded page chunks served from memory.
    /// Eviction discards — the page already holds the truth.
    staged: LruCache<StageKey, ChunkRef>,
}

pub struct MemoryTier {
    inner: Mutex<MemInner>,
}

impl MemoryTier {
    #[must_use]
    pub fn new(memory_cap: u64, chunk_size: u32) -> Self {
        let alloc = SlabAllocator::new(memory_cap, chunk_size);
        let stage_cap = NonZeroUsize::new(alloc.capacity()).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(MemInner {
                series: HashMap::new(),
                alloc,
                sync_map: HashMap::new(),
                staged: LruCache::new(stage_cap),
            }),
        }
    }

    /// Seed the replay watermark from the page tier's per-id max times,
    /// called once at engine open before WAL replay.
    pub fn seed_sync_map(&self, watermarks: HashMap<Id, Time>) {
        let mut inner = self.inner.lock();
        inner.sync_map = watermarks;
    }

    /// Migration append. Rolls the open chunk over on `Full`/`OutOfOrder`
    /// (a late sample starts a fresh chunk — no splicing into sealed
    /// ones). With `dedup` set, samples at or below the page watermark are
    /// skipped; that is the restart-replay path.
    pub fn append(&self, s: &Sample, dedup: bool) -> MemAppendStatus {
        let mut inner = self.inner.lock();
        if dedup
            && let Some(&synced) = inner.sync_map.get(&s.id)
            && s.time <= synced
        {
            return MemAppendStatus::Deduped;
        }
        let slot = inner.series.entry(s.id).or_default();
        if let Some(open) = slot.open.as_mut() {
            match open.append(s) {
                AppendStatus::Appended => return MemAppendStatus::Appended,
                AppendStatus::Full | AppendStatus::OutOfOrder => {
                    let sealed = slot.open.take().expect("open chunk present").seal();
                    slot.sealed.push(Arc::new(sealed));
                }
            }
        }
        let Some(body) = inner.alloc.alloc() else {
            return MemAppendStatus::Exhausted;
        };
        let slot = inner.series.entry(s.id).or_default();
        slot.open = Some(OpenChunk::new(body, s));
        MemAppendStatus::Appended
    }

    /// Seal and hand over every chunk whose `max_time` predates
    /// `now - max_age`. Ownership moves to the caller (the dropper); the
    /// samples become invisible here, which is why the dropper holds the
    /// engine drop guard across the matching page write.
    #[must_use]
    pub fn drop_old(&self, now: Time, max_age: Time) -> Vec<ChunkRef> {
        let threshold = now.saturating_sub(max_age);
        self.take_if(|max_time| max_time < threshold)
    }

    /// Seal and hand over everything — the flush path.
    #[must_use]
    pub fn drain(&self) -> Vec<ChunkRef> {
        self.take_if(|_| true)
    }

    /// Hand over only the already-sealed chunks, leaving open ones to keep
    /// filling. The aggressive-seal strategies drop these every tick.
    #[must_use]
    pub fn take_sealed(&self) -> Vec<ChunkRef> {
        let mut inner = self.inner.lock();
        let mut out = Vec::new();
        for slot in inner.series.values_mut() {
            out.append(&mut slot.sealed);
        }
        inner.series.retain(|_, s| s.open.is_some() || !s.sealed.is_empty());
        out.sort_by_key(|c| (c.header().id, c.header().max_time));
        out
    }

    /// Seal and hand over the `n` chunks with the oldest `max_time` — the
    /// pressure-eviction path when the allocator budget runs out.
    #[must_use]
    pub fn take_oldest(&self, n: usize) -> Vec<ChunkRef> {
        if n == 0 {
            return Vec::new();
        }
        let mut ages: Vec<Time> = Vec::new();
        {
            let inner = self.inner.lock();
            for slot in inner.series.values() {
                if let Some(open) = slot.open.as_ref() {
                    ages.push(open.header().max_time);
                }
                for c in &slot.sealed {
                    ages.push(c.header().max_time);
                }
            }
        }
        if ages.is_empty() {
            return Vec::new();
        }
        ages.sort_unstable();
        let cutoff = ages[n.min(ages.len()) - 1];
        // take everything at or below the cutoff so the count is >= n
        self.take_if(|max_time| max_time <= cutoff)
    }

    fn take_if(&self, pred: impl Fn(Time) -> bool) -> Vec<ChunkRef> {
        let mut inner = self.inner.lock();
        let mut out = Vec::new();
        for slot in inner.series.values_mut() {
            if slot.open.as_ref().is_some_and(|c| pred(c.header().max_time)) {
                let sealed = slot.open.take().expect("checked above").seal();
                slot.sealed.push(Arc::new(sealed));
            }
            let (take, keep): (Vec<_>, Vec<_>) =
                slot.sealed.drain(..).partition(|c| pred(c.header().max_time));
            slot.sealed = keep;
            out.extend(take);
        }
        inner.series.retain(|_, s| s.open.is_some() || !s.sealed.is_empty());
        // oldest first so the destination sees max_time order per id
        out.sort_by_key(|c| (c.header().id, c.header().max_time));
        out
    }

    /// Confirm a page write: advance the watermark and give the slabs
    /// back to the allocator budget.
    pub fn mark_synced(&self, chunks: &[ChunkRef]) {
        let mut inner = self.inner.lock();
        for c in chunks {
            let h = c.header();
            let w = inner.sync_map.entry(h.id).or_insert(h.max_time);
            *w = (*w).max(h.max_time);
            inner.alloc.release();
        }
    }

    /// Put chunks back after a failed page write so the data stays
    /// queryable; the dropper retries later.
    pub fn restore(&self, chunks: Vec<ChunkRef>) {
        let mut inner = self.inner.lock();
        for c in chunks {
            inner.series.entry(c.header().id).or_default().sealed.push(c);
        }
    }

    #[must_use]
    pub fn allocator_usage(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.alloc.allocated(), inner.alloc.capacity())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().series.is_empty()
    }

    #[must_use]
    pub fn chunks_count(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .series
            .values()
            .map(|s| usize::from(s.open.is_some()) + s.sealed.len())
            .sum()
    }

    #[must_use]
    pub fn min_time(&self) -> Option<Time> {
        let inner = self.inner.lock();
        inner
            .series
            .values()
            .flat_map(|slot| {
                slot.open
                    .as_ref()
                    .map(|c| c.header().min_time)
                    .into_iter()
                    .chain(slot.sealed.iter().map(|c| c.header().min_time))
            })
            .min()
    }

    #[must_use]
    pub fn max_time(&self) -> Option<Time> {
        let inner = self.inner.lock();
        inner
            .series
            .values()
            .flat_map(|slot| {
                slot.open
                    .as_ref()
                    .map(|c| c.header().max_time)
                    .into_iter()
                    .chain(slot.sealed.iter().map(|c| c.header().max_time))
            })
            .max()
    }

    #[must_use]
    pub fn min_max_time(&self, id: Id) -> Option<(Time, Time)> {
        let inner = self.inner.lock();
        let slot = inner.series.get(&id)?;
        let mut range: Option<(Time, Time)> = None;
        let mut fold = |min: Time, max: Time| {
            range = Some(match range {
                Some((lo, hi)) => (lo.min(min), hi.max(max)),
                None => (min, max),
            });
        };
        if let Some(open) = slot.open.as_ref() {
            fold(open.header().min_time, open.header().max_time);
        }
        for c in &slot.sealed {
            fold(c.header().min_time, c.header().max_time);
        }
        range
    }

    /// Samples of live chunks matching the query, time-sorted per id.
    #[must_use]
    pub fn read_interval(&self, q: &QueryInterval) -> Vec<Sample> {
        let (mut out, sealed) = self.snapshot(&q.ids, |h_min, h_max| q.intersects(h_min, h_max));
        for c in sealed {
            out.extend(c.reader());
        }
        out.retain(|s| q.matches(s));
        // sealed chunks of one id can overlap after late writes
        if !out.is_sorted_by_key(|s: &Sample| (s.id, s.time)) {
            out.sort_by_key(|s| (s.id, s.time));
        }
        out
    }

    /// Latest live sample at or before the time point, per id present.
    #[must_use]
    pub fn read_time_point(&self, q: &QueryTimePoint) -> HashMap<Id, Sample> {
        let (open_samples, sealed) = self.snapshot(&q.ids, |h_min, _| h_min <= q.time_point);
        let mut out: HashMap<Id, Sample> = HashMap::new();
        let mut consider = |s: &Sample| {
            if s.time <= q.time_point && s.matches_flag(q.flag) {
                match out.get(&s.id) {
                    Some(prev) if prev.time > s.time => {}
                    _ => {
                        out.insert(s.id, *s);
                    }
                }
            }
        };
        for s in &open_samples {
            consider(s);
        }
        for c in sealed {
            for s in c.reader() {
                consider(&s);
            }
        }
        out
    }

    /// Decode open chunks under the lock (bounded work), clone sealed
    /// chunk refs for decoding outside it.
    fn snapshot(
        &self,
        ids: &[Id],
        admit: impl Fn(Time, Time) -> bool,
    ) -> (Vec<Sample>, Vec<ChunkRef>) {
        let inner = self.inner.lock();
        let mut open_samples = Vec::new();
        let mut sealed = Vec::new();
        for id in ids {
            let Some(slot) = inner.series.get(id) else { continue };
            if let Some(open) = slot.open.as_ref() {
                let h = open.header();
                if admit(h.min_time, h.max_time) {
                    open_samples.extend(open.reader());
                }
            }
            for c in &slot.sealed {
                let h = c.header();
                if admit(h.min_time, h.max_time) {
                    sealed.push(Arc::clone(c));
                }
            }
        }
        (open_samples, sealed)
    }

    // --- CACHE-strategy staging ---------------------------------------

    #[must_use]
    pub fn stage_get(&self, key: &StageKey) -> Option<ChunkRef> {
        self.inner.lock().staged.get(key).cloned()
    }

    pub fn stage_put(&self, key: StageKey, chunk: ChunkRef) {
        self.inner.lock().staged.put(key, chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier() -> MemoryTier {
        MemoryTier::new(64 * 1024, 256)
    }

    #[test]
    fn append_and_read_back() {
        let t = tier();
        for i in 0..100u64 {
            assert_eq!(t.append(&Sample::new(1, i, i as f64, 0), false), MemAppendStatus::Appended);
        }
        let q = QueryInterval::new(vec![1], 0, 10, 20);
        let got = t.read_interval(&q);
        assert_eq!(got.len(), 10);
        assert_eq!(got[0].time, 10);
        assert_eq!(got[9].time, 19);
    }

    #[test]
    fn one_open_chunk_per_id_and_rollover() {
        let t = MemoryTier::new(4096, 64);
        let mut i = 0u64;
        // force at least one Full rollover
        while t.chunks_count() < 2 {
            assert_eq!(
                t.append(&Sample::new(9, i, (i as f64) * 1.7, (i % 5) as u32), false),
                MemAppendStatus::Appended
            );
            i += 1;
        }
        let q = QueryInterval::new(vec![9], 0, 0, i);
        assert_eq!(t.read_interval(&q).len() as u64, i);
    }

    #[test]
    fn late_sample_starts_new_chunk() {
        let t = tier();
        t.append(&Sample::new(3, 100, 1.0, 0), false);
        t.append(&Sample::new(3, 200, 2.0, 0), false);
        // out of order: rolls over instead of splicing
        assert_eq!(t.append(&Sample::new(3, 50, 3.0, 0), false), MemAppendStatus::Appended);
        assert_eq!(t.chunks_count(), 2);
        let q = QueryInterval::new(vec![3], 0, 0, 300);
        let got = t.read_interval(&q);
        assert_eq!(got.iter().map(|s| s.time).collect::<Vec<_>>(), vec![50, 100, 200]);
    }

    #[test]
    fn exhaustion_reports_and_release_recovers() {
        let t = MemoryTier::new(256, 128); // budget: 2 slabs
        assert_eq!(t.append(&Sample::new(1, 1, 0.0, 0), false), MemAppendStatus::Appended);
        assert_eq!(t.append(&Sample::new(2, 1, 0.0, 0), false), MemAppendStatus::Appended);
        assert_eq!(t.append(&Sample::new(3, 1, 0.0, 0), false), MemAppendStatus::Exhausted);
        let dropped = t.drain();
        assert_eq!(dropped.len(), 2);
        t.mark_synced(&dropped);
        assert_eq!(t.append(&Sample::new(3, 1, 0.0, 0), false), MemAppendStatus::Appended);
    }

    #[test]
    fn drop_old_takes_only_aged_chunks() {
        let t = tier();
        t.append(&Sample::new(1, 100, 0.0, 0), false);
        t.append(&Sample::new(2, 900, 0.0, 0), false);
        let dropped = t.drop_old(1000, 500);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].header().id, 1);
        assert!(dropped[0].header().is_sealed);
        assert!(t.min_max_time(1).is_none());
        assert!(t.min_max_time(2).is_some());
    }

    #[test]
    fn replay_dedup_skips_paged_samples() {
        let t = tier();
        t.seed_sync_map(HashMap::from([(7, 500u64)]));
        assert_eq!(t.append(&Sample::new(7, 400, 0.0, 0), true), MemAppendStatus::Deduped);
        assert_eq!(t.append(&Sample::new(7, 500, 0.0, 0), true), MemAppendStatus::Deduped);
        assert_eq!(t.append(&Sample::new(7, 501, 0.0, 0), true), MemAppendStatus::Appended);
        // live path ignores the watermark
        assert_eq!(t.append(&Sample::new(7, 300, 0.0, 0), false), MemAppendStatus::Appended);
    }

    #[test]
    fn time_point_prefers_latest_at_or_before() {
        let t = tier();
        for time in [10u64, 20, 30] {
            t.append(&Sample::new(4, time, time as f64, 0), false);
        }
        let q = QueryTimePoint::new(vec![4], 0, 25);
        let got = t.read_time_point(&q);
        assert_eq!(got[&4].time, 20);
        let none = t.read_time_point(&QueryTimePoint::new(vec![4], 0, 5));
        assert!(none.is_empty());
    }
}
