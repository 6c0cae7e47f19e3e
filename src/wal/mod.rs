//! Durable landing zone for appends: uncompressed segment files rotated at
//! a fixed sample count.
//!
//! Segment visibility drives crash consistency. A segment is `open`
//! (receiving appends, mirrored in memory for queries), then `closed`
//! (rotated, queryable, pending migration), then `retired` (its samples
//! are served by the memory tier, the file stays on disk purely for
//! durability), and is finally deleted once the memory tier has drained to
//! pages. Queries never see retired segments, so tier results stay
//! duplicate-free while the data moves down.

mod segment;

pub use segment::{SEGMENT_HEADER_BYTES, WAL_FILE_EXT, WalSegment, segment_file_name};

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::errors::{DbError, Result};
use crate::manifest::Manifest;
use crate::settings::{Settings, SyncPolicy};
use crate::types::{Flag, Id, Sample, Time};

/// Appends between fsyncs under the `per_batch` policy.
const BATCH_SYNC_EVERY: u32 = 256;

#[derive(Debug)]
struct WalInner {
    open: Option<WalSegment>,
    /// Mirror of the open segment, so queries avoid re-reading a file that
    /// is still being appended to.
    open_mirror: Vec<Sample>,
    closed: VecDeque<PathBuf>,
    retired: Vec<PathBuf>,
    latest: HashMap<Id, Sample>,
    min_max: HashMap<Id, (Time, Time)>,
    next_segment_id: u64,
    appends_since_sync: u32,
    last_sync: Instant,
}

/// A segment recovered from the manifest at engine open. The engine feeds
/// the samples to the memory tier (with the page watermark applied) and
/// the tier keeps the file retired until a flush makes it deletable.
#[derive(Debug)]
pub struct RecoveredSegment {
    pub path: PathBuf,
    pub samples: Vec<Sample>,
}

#[derive(Debug)]
pub struct WalTier {
    dir: PathBuf,
    manifest: Arc<Manifest>,
    segment_size: u32,
    sync_policy: SyncPolicy,
    halted: AtomicBool,
    inner: Mutex<WalInner>,
}

impl WalTier {
    pub fn new(dir: &Path, manifest: Arc<Manifest>, settings: &Settings) -> Self {
        Self {
            dir: dir.to_path_buf(),
            manifest,
            segment_size: settings.wal_segment_size.max(1),
            sync_policy: settings.sync_writes,
            halted: AtomicBool::new(false),
            inner: Mutex::new(WalInner {
                open: None,
                open_mirror: Vec::new(),
                closed: VecDeque::new(),
                retired: Vec::new(),
                latest: HashMap::new(),
                min_max: HashMap::new(),
                next_segment_id: 1,
                appends_since_sync: 0,
                last_sync: Instant::now(),
            }),
        }
    }

    /// Scan every segment the manifest lists, in enrollment (FIFO) order.
    /// The segments move straight to `retired`: the engine replays their
    /// samples into the memory tier, after which the files exist only to
    /// survive a crash. Also rebuilds the latest-sample and min/max maps.
    ///
    /// # Errors
    /// Propagates scan I/O failures.
    pub fn recover(&self) -> Result<Vec<RecoveredSegment>> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let mut out = Vec::new();
        for name in self.manifest.wals() {
            let path = self.dir.join(&name);
            let samples = WalSegment::scan(&path)?;
            // keep the id counter ahead of every recovered segment
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && let Ok(id) = stem.parse::<u64>()
            {
                inner.next_segment_id = inner.next_segment_id.max(id + 1);
            }
            for s in &samples {
                track(&mut inner.latest, &mut inner.min_max, s);
            }
            inner.retired.push(path.clone());
            out.push(RecoveredSegment { path, samples });
        }
        Ok(out)
    }

    /// Append one sample: select or create the open segment, write the
    /// record, apply the sync policy, rotate when full. `on_commit` runs
    /// inside the segment lock right after the record lands, which is what
    /// gives subscribers commit order per segment.
    ///
    /// Returns `(result, rotated)`; a rotation is the engine's cue to wake
    /// the dropper.
    ///
    /// # Errors
    /// An I/O failure halts the tier: the record is not durable and later
    /// appends are rejected with `TierHalted` until `flush` succeeds.
    pub fn append(
        &self,
        s: &Sample,
        on_commit: impl FnOnce(&Sample),
    ) -> Result<(crate::types::AppendResult, bool)> {
        if self.halted.load(Ordering::Acquire) {
            return Err(DbError::TierHalted("wal".into()));
        }
        let mut inner = self.inner.lock();
        let r = self.append_locked(&mut inner, s, on_commit);
        if r.is_err() {
            self.halted.store(true, Ordering::Release);
        }
        r
    }

    fn append_locked(
        &self,
        inner: &mut WalInner,
        s: &Sample,
        on_commit: impl FnOnce(&Sample),
    ) -> Result<(crate::types::AppendResult, bool)> {
        if inner.open.is_none() {
            let id = inner.next_segment_id;
            let seg = WalSegment::create(&self.dir, id, self.segment_size)?;
            self.manifest.add_wal(&segment_file_name(id))?;
            inner.next_segment_id += 1;
            inner.open = Some(seg);
            inner.open_mirror.clear();
        }
        let seg = inner.open.as_mut().expect("open segment just ensured");
        seg.append(s)?;
        inner.open_mirror.push(*s);
        track(&mut inner.latest, &mut inner.min_max, s);
        on_commit(s);

        inner.appends_since_sync += 1;
        let due = match self.sync_policy {
            SyncPolicy::PerWrite => true,
            SyncPolicy::PerBatch => inner.appends_since_sync >= BATCH_SYNC_EVERY,
            SyncPolicy::Periodic(ms) => inner.last_sync.elapsed().as_millis() >= u128::from(ms),
        };
        if due {
            let seg = inner.open.as_mut().expect("open segment");
            seg.sync()?;
            inner.appends_since_sync = 0;
            inner.last_sync = Instant::now();
        }

        let mut rotated = false;
        if inner.open.as_ref().expect("open segment").is_full() {
            self.rotate_locked(inner)?;
            rotated = true;
        }
        Ok((crate::types::AppendResult { writed: 1, ignored: 0 }, rotated))
    }

    fn rotate_locked(&self, inner: &mut WalInner) -> Result<()> {
        if let Some(mut seg) = inner.open.take() {
            seg.close()?;
            inner.closed.push_back(seg.path().to_path_buf());
            inner.open_mirror.clear();
        }
        Ok(())
    }

    /// Force the open segment into the closed queue so a flush can drain
    /// everything. No-op when there is nothing open.
    ///
    /// # Errors
    /// Propagates the close failure.
    pub fn rotate_now(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.open.as_ref().is_some_and(|seg| seg.count() > 0) {
            self.rotate_locked(&mut inner)?;
        }
        Ok(())
    }

    /// Oldest closed segment pending migration, if any. The segment stays
    /// queryable until [`WalTier::retire`] commits the move.
    #[must_use]
    pub fn front_closed(&self) -> Option<PathBuf> {
        self.inner.lock().closed.front().cloned()
    }

    /// Commit a migration: the segment's samples are now served by the
    /// memory tier, so drop it from the queryable set. The file and its
    /// manifest entry stay for durability.
    pub fn retire(&self, path: &Path) {
        let mut inner = self.inner.lock();
        inner.closed.retain(|p| p != path);
        inner.retired.push(path.to_path_buf());
    }

    /// Delete retired segments; called once the memory tier has fully
    /// drained to pages, which makes their contents durable down-tier.
    ///
    /// # Errors
    /// Propagates manifest update failures; file deletions are logged and
    /// skipped on error.
    pub fn delete_retired(&self) -> Result<usize> {
        let paths: Vec<PathBuf> = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.retired)
        };
        let mut removed = 0usize;
        for path in paths {
            let name = path.file_name().map(|n| n.to_string_lossy().to_string());
            if let Some(name) = name {
                self.manifest.remove_wal(&name)?;
            }
            if let Err(e) = std::fs::remove_file(&path) {
                log::error!("failed to delete retired wal segment {}: {e}", path.display());
            } else {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Sync the open segment. A success clears the halted state.
    ///
    /// # Errors
    /// Propagates the fsync failure; the tier stays halted.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(seg) = inner.open.as_mut() {
            seg.sync()?;
        }
        inner.appends_since_sync = 0;
        inner.last_sync = Instant::now();
        self.halted.store(false, Ordering::Release);
        Ok(())
    }

    /// Stamp and sync the open segment at engine stop.
    ///
    /// # Errors
    /// Propagates the close failure.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(seg) = inner.open.as_mut() {
            seg.close()?;
        }
        Ok(())
    }

    #[must_use]
    pub fn files_count(&self) -> usize {
        let inner = self.inner.lock();
        usize::from(inner.open.is_some()) + inner.closed.len() + inner.retired.len()
    }

    #[must_use]
    pub fn min_max_time(&self, id: Id) -> Option<(Time, Time)> {
        self.inner.lock().min_max.get(&id).copied()
    }

    /// Oldest time seen across every id, cumulative over the tier's
    /// lifetime (retired data included — the lower tiers serve it).
    #[must_use]
    pub fn min_time(&self) -> Option<Time> {
        self.inner.lock().min_max.values().map(|&(min, _)| min).min()
    }

    /// Newest time seen; also the dropper's notion of "now" for age-based
    /// sealing, since the engine is agnostic to the time unit.
    #[must_use]
    pub fn max_time(&self) -> Option<Time> {
        self.inner.lock().min_max.values().map(|&(_, max)| max).max()
    }

    /// Linear scan over the queryable segments (open mirror + closed
    /// files), in ingestion order.
    ///
    /// # Errors
    /// Propagates closed-segment read failures.
    pub fn read_interval(&self, q: &crate::types::QueryInterval) -> Result<Vec<Sample>> {
        let (mirror, closed) = {
            let inner = self.inner.lock();
            (inner.open_mirror.clone(), inner.closed.clone())
        };
        let mut out = Vec::new();
        for path in &closed {
            for s in WalSegment::scan(path)? {
                if q.matches(&s) {
                    out.push(s);
                }
            }
        }
        for s in &mirror {
            if q.matches(s) {
                out.push(*s);
            }
        }
        Ok(out)
    }

    /// Latest queryable sample at or before the time point, per requested
    /// id. Ids with no match are simply absent — the engine synthesizes.
    ///
    /// # Errors
    /// Propagates closed-segment read failures.
    pub fn read_time_point(
        &self,
        q: &crate::types::QueryTimePoint,
    ) -> Result<HashMap<Id, Sample>> {
        let (mirror, closed) = {
            let inner = self.inner.lock();
            (inner.open_mirror.clone(), inner.closed.clone())
        };
        let mut out: HashMap<Id, Sample> = HashMap::new();
        let mut consider = |s: &Sample| {
            if q.ids.contains(&s.id) && s.time <= q.time_point && s.matches_flag(q.flag) {
                match out.get(&s.id) {
                    Some(prev) if prev.time > s.time => {}
                    _ => {
                        out.insert(s.id, *s);
                    }
                }
            }
        };
        for path in &closed {
            for s in WalSegment::scan(path)? {
                consider(&s);
            }
        }
        for s in &mirror {
            consider(s);
        }
        Ok(out)
    }

    /// Most recently appended sample per id, filtered by flag mask.
    #[must_use]
    pub fn current_value(&self, ids: &[Id], flag: Flag) -> HashMap<Id, Sample> {
        let inner = self.inner.lock();
        let mut out = HashMap::new();
        for id in ids {
            if let Some(s) = inner.latest.get(id)
                && s.matches_flag(flag)
            {
                out.insert(*id, *s);
            }
        }
        out
    }
}

fn track(
    latest: &mut HashMap<Id, Sample>,
    min_max: &mut HashMap<Id, (Time, Time)>,
    s: &Sample,
) {
    match latest.get(&s.id) {
        Some(prev) if prev.time > s.time => {}
        _ => {
            latest.insert(s.id, *s);
        }
    }
    min_max
        .entry(s.id)
        .and_modify(|(min, max)| {
            *min = (*min).min(s.time);
            *max = (*max).max(s.time);
        })
        .or_insert((s.time, s.time));
}
