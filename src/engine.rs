use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::dropper::Dropper;
use crate::errors::{DbError, Result};
use crate::manifest::Manifest;
use crate::memory::MemoryTier;
use crate::page::{ChunkLink, PageTier};
use crate::reader::ReaderCallback;
use crate::settings::{Settings, Strategy};
use crate::subscribe::SubscribeBus;
use crate::types::{
    AppendResult, Flag, Id, MAX_TIME, NO_DATA, QueryInterval, QueryTimePoint, Sample, Time,
};
use crate::union;
use crate::wal::WalTier;

/// Cancellation poll interval while streaming merged results — one chunk's
/// worth of samples, which keeps the bounded-cancellation promise.
const CANCEL_CHECK_EVERY: usize = 256;

/// Per-tier file/chunk counts for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSizes {
    pub wal_count: usize,
    pub memory_chunks: usize,
    pub pages_count: usize,
}

#[derive(Debug, Default)]
struct LoadResults {
    next_query_id: u64,
    results: HashMap<u64, Arc<Vec<Sample>>>,
}

/// The storage engine facade: owns every tier handle, serializes queries
/// against tier migration, and exposes the public operations.
pub struct Engine {
    storage_path: PathBuf,
    settings: Settings,
    manifest: Arc<Manifest>,
    wal: Arc<WalTier>,
    memory: Arc<MemoryTier>,
    pages: Arc<PageTier>,
    dropper: Dropper,
    bus: SubscribeBus,
    /// Readers hold this shared; the dropper holds it exclusive across
    /// every tier-to-tier visibility swap.
    drop_guard: Arc<RwLock<()>>,
    locker: Mutex<LoadResults>,
    stopped: AtomicBool,
}

impl Engine {
    /// Open (or create) a database at `storage_path` with the settings
    /// found in its `settings` file.
    ///
    /// # Errors
    /// `CorruptManifest` is fatal; everything recoverable is logged and
    /// repaired (orphan deletion, page fsck, WAL tail truncation).
    pub fn open(storage_path: &Path) -> Result<Self> {
        let settings = Settings::load(storage_path)?;
        Self::open_with_settings(storage_path, settings)
    }

    /// Open with explicit settings, persisting them if the storage
    /// directory has none yet.
    ///
    /// # Errors
    /// See [`Engine::open`].
    pub fn open_with_settings(storage_path: &Path, settings: Settings) -> Result<Self> {
        std::fs::create_dir_all(storage_path)?;
        // log4rs can only be installed once per process
        let _ = crate::logger::init_for_storage(storage_path);
        if !Settings::settings_path(storage_path).exists() {
            settings.save(storage_path)?;
        }

        let manifest = Arc::new(Manifest::open(storage_path)?);
        manifest.cleanup_orphans(storage_path)?;

        let pages = Arc::new(PageTier::open(storage_path, Arc::clone(&manifest), &settings)?);
        let memory = Arc::new(MemoryTier::new(settings.memory_cap, settings.chunk_size));
        memory.seed_sync_map(
            pages.load_min_max().into_iter().map(|(id, (_, max))| (id, max)).collect(),
        );

        let wal = Arc::new(WalTier::new(storage_path, Arc::clone(&manifest), &settings));
        let recovered = wal.recover()?;

        let drop_guard = Arc::new(RwLock::new(()));
        let dropper = Dropper::new(
            Arc::clone(&wal),
            Arc::clone(&memory),
            Arc::clone(&pages),
            settings.strategy,
            settings.old_chunk_age,
            Arc::clone(&drop_guard),
        );
        dropper.replay(&recovered);
        dropper.start();

        let bus = SubscribeBus::new();
        bus.start();

        log::info!(
            "engine open at {} (strategy={}, {} pages, {} wal segments)",
            storage_path.display(),
            settings.strategy,
            pages.files_count(),
            recovered.len()
        );
        Ok(Self {
            storage_path: storage_path.to_path_buf(),
            settings,
            manifest,
            wal,
            memory,
            pages,
            dropper,
            bus,
            drop_guard,
            locker: Mutex::new(LoadResults::default()),
            stopped: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    #[must_use]
    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    #[must_use]
    pub const fn strategy(&self) -> Strategy {
        self.settings.strategy
    }

    #[must_use]
    pub fn manifest_version(&self) -> u64 {
        self.manifest.version()
    }

    /// Append one sample. Never fails user-visibly: reserved flags and
    /// halted-tier failures are logged and counted as `ignored`, and an
    /// ignored sample was never acknowledged as durable.
    pub fn append(&self, s: &Sample) -> AppendResult {
        if self.stopped.load(Ordering::Acquire) {
            return AppendResult { writed: 0, ignored: 1 };
        }
        if s.flag == NO_DATA {
            log::warn!("rejecting append with reserved NO_DATA flag for id {}", s.id);
            return AppendResult { writed: 0, ignored: 1 };
        }
        match self.wal.append(s, |committed| self.bus.on_append(committed)) {
            Ok((result, rotated)) => {
                if rotated {
                    self.dropper.notify_wal_rotated();
                }
                result
            }
            Err(e) => {
                log::error!("append failed for id {}: {e}", s.id);
                AppendResult { writed: 0, ignored: 1 }
            }
        }
    }

    /// Stream every matching sample to `clb`, per id, time-sorted within
    /// each id, and finish with `clb.end()`. Cancellation (or engine
    /// stop) terminates the stream early — a normal termination, not an
    /// error.
    ///
    /// # Errors
    /// `WrongInterval` when `from > to`; `from == to` is the legal empty
    /// half-open interval.
    pub fn read_interval(&self, q: &QueryInterval, clb: &dyn ReaderCallback) -> Result<()> {
        if q.from > q.to {
            return Err(DbError::WrongInterval { from: q.from, to: q.to });
        }
        'ids: for &id in &q.ids {
            if self.query_canceled(clb) {
                break;
            }
            let local = q.with_id(id);
            // link selection and the three tier reads sit under one shared
            // guard acquisition: a migration between them could move a
            // chunk out of the memory view and into a page the stale link
            // set does not cover
            let (page_part, mem_part, wal_part) = {
                let _shared = self.drop_guard.read();
                let id_links: Vec<ChunkLink> = self.pages.chunks_by_interval(&local);
                let page_part = if self.settings.strategy == Strategy::Cache {
                    self.read_links_staged(&local, &id_links)
                } else {
                    let collector = TierCollector::new(clb);
                    self.pages.read_links(&local, &id_links, &collector);
                    collector.take()
                };
                let mem_part = self.memory.read_interval(&local);
                let wal_part = self.wal.read_interval(&local)?;
                (page_part, mem_part, wal_part)
            };
            let merged = union::merge(page_part, mem_part, wal_part);
            for (i, s) in merged.iter().enumerate() {
                if i % CANCEL_CHECK_EVERY == 0 && self.query_canceled(clb) {
                    break 'ids;
                }
                clb.call(s);
            }
        }
        clb.end();
        Ok(())
    }

    /// CACHE strategy: serve page chunks through the memory tier's
    /// staging area, decoding from the page only on a stage miss.
    fn read_links_staged(&self, q: &QueryInterval, links: &[ChunkLink]) -> Vec<Sample> {
        let mut out = Vec::new();
        for link in links {
            let key = (link.page.name().to_string(), link.slot);
            let chunk = match self.memory.stage_get(&key) {
                Some(chunk) => chunk,
                None => {
                    let Some(chunk) = self.pages.load_link(link) else { continue };
                    self.memory.stage_put(key, Arc::clone(&chunk));
                    chunk
                }
            };
            out.extend(chunk.reader().filter(|s| q.matches(s)));
        }
        out
    }

    /// Latest sample at or before the time point for every requested id;
    /// ids with no matching data get a synthesized `NO_DATA` sample. The
    /// result always has exactly `q.ids.len()` entries.
    ///
    /// # Errors
    /// Propagates WAL scan failures.
    pub fn read_time_point(&self, q: &QueryTimePoint) -> Result<HashMap<Id, Sample>> {
        let mut out = HashMap::with_capacity(q.ids.len());
        let _shared = self.drop_guard.read();
        for &id in &q.ids {
            let local = q.with_id(id);
            let mut best: Option<Sample> = None;
            let candidates = [
                self.memory.read_time_point(&local).remove(&id),
                self.wal.read_time_point(&local)?.remove(&id),
                self.pages.values_before_time_point(&local).remove(&id),
            ];
            for cand in candidates.into_iter().flatten() {
                if best.as_ref().is_none_or(|b| cand.time > b.time) {
                    best = Some(cand);
                }
            }
            out.insert(id, best.unwrap_or_else(|| Sample::no_data(id, q.time_point)));
        }
        Ok(out)
    }

    /// Most recently appended sample per id matching the flag mask;
    /// missing ids synthesize `NO_DATA`.
    #[must_use]
    pub fn current_value(&self, ids: &[Id], flag: Flag) -> HashMap<Id, Sample> {
        let _shared = self.drop_guard.read();
        let mut out = self.wal.current_value(ids, flag);
        let missing: Vec<Id> = ids.iter().copied().filter(|id| !out.contains_key(id)).collect();
        if !missing.is_empty() {
            // the WAL forgets ids whose segments were fully migrated;
            // fall back to the latest sample the lower tiers hold
            let q = QueryTimePoint::new(missing.clone(), flag, MAX_TIME);
            let mem = self.memory.read_time_point(&q);
            let paged = self.pages.values_before_time_point(&q);
            for id in missing {
                let best = match (mem.get(&id), paged.get(&id)) {
                    (Some(a), Some(b)) => Some(if a.time >= b.time { *a } else { *b }),
                    (Some(a), None) => Some(*a),
                    (None, Some(b)) => Some(*b),
                    (None, None) => None,
                };
                out.insert(id, best.unwrap_or_else(|| Sample::no_data(id, 0)));
            }
        }
        out
    }

    /// Register a subscriber for future matching appends. An empty id set
    /// matches every series.
    pub fn subscribe(&self, ids: Vec<Id>, flag: Flag, clb: Arc<dyn ReaderCallback>) {
        self.bus.add(ids, flag, clb);
    }

    #[must_use]
    pub fn min_time(&self) -> Option<Time> {
        [self.wal.min_time(), self.memory.min_time(), self.pages.min_time()]
            .into_iter()
            .flatten()
            .min()
    }

    #[must_use]
    pub fn max_time(&self) -> Option<Time> {
        [self.wal.max_time(), self.memory.max_time(), self.pages.max_time()]
            .into_iter()
            .flatten()
            .max()
    }

    /// Per-id time range across every tier; `None` for an unseen id.
    #[must_use]
    pub fn min_max_time(&self, id: Id) -> Option<(Time, Time)> {
        let ranges = [
            self.wal.min_max_time(id),
            self.memory.min_max_time(id),
            self.pages.min_max_time(id),
        ];
        ranges.into_iter().flatten().reduce(|(lo, hi), (min, max)| (lo.min(min), hi.max(max)))
    }

    /// Materialize an interval query and park the result under a query
    /// id — the two-step load/get API for callers that poll.
    ///
    /// # Errors
    /// Same as [`Engine::read_interval`].
    pub fn load(&self, q: &QueryInterval) -> Result<u64> {
        let collector = crate::reader::CollectCallback::new();
        self.read_interval(q, &collector)?;
        let mut locker = self.locker.lock();
        let query_id = locker.next_query_id;
        locker.next_query_id += 1;
        locker.results.insert(query_id, Arc::new(collector.take()));
        Ok(query_id)
    }

    #[must_use]
    pub fn get_result(&self, query_id: u64) -> Option<Arc<Vec<Sample>>> {
        self.locker.lock().results.remove(&query_id)
    }

    #[must_use]
    pub fn queue_sizes(&self) -> QueueSizes {
        QueueSizes {
            wal_count: self.wal.files_count(),
            memory_chunks: self.memory.chunks_count(),
            pages_count: self.pages.files_count(),
        }
    }

    /// Drain WAL → memory → page synchronously.
    ///
    /// # Errors
    /// Propagates tier flush failures.
    pub fn flush(&self) -> Result<()> {
        self.wal.flush()?;
        self.dropper.flush()
    }

    /// Merge every page into one. Exclusive against the dropper and
    /// in-flight queries, so nobody observes the old and new pages at
    /// once.
    ///
    /// # Errors
    /// Propagates compaction failures.
    pub fn compact_all(&self) -> Result<usize> {
        let _exclusive = self.drop_guard.write();
        self.pages.compact_all()
    }

    /// Merge the pages fully contained in `[from, to)`.
    ///
    /// # Errors
    /// `WrongInterval` when `from > to`; otherwise compaction failures.
    pub fn compact_range(&self, from: Time, to: Time) -> Result<usize> {
        if from > to {
            return Err(DbError::WrongInterval { from, to });
        }
        let _exclusive = self.drop_guard.write();
        self.pages.compact_range(from, to)
    }

    /// Flush, seal, close every file and stop the workers. Idempotent;
    /// also invoked on drop.
    ///
    /// # Errors
    /// Propagates the first tier shutdown failure (later steps still run
    /// on drop).
    pub fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        log::info!("engine stopping");
        self.flush()?;
        self.bus.stop();
        self.dropper.stop();
        self.wal.stop()?;
        self.pages.stop()?;
        Ok(())
    }

    fn query_canceled(&self, clb: &dyn ReaderCallback) -> bool {
        clb.is_canceled() || self.stopped.load(Ordering::Acquire)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("engine stop on drop failed: {e}");
        }
    }
}

/// Collects one tier's partial while delegating cancellation to the
/// user's callback, so a page scan stops when the outer query does.
struct TierCollector<'a> {
    out: Mutex<Vec<Sample>>,
    outer: &'a dyn ReaderCallback,
}

impl<'a> TierCollector<'a> {
    fn new(outer: &'a dyn ReaderCallback) -> Self {
        Self { out: Mutex::new(Vec::new()), outer }
    }

    fn take(&self) -> Vec<Sample> {
        std::mem::take(&mut self.out.lock())
    }
}

impl ReaderCallback for TierCollector<'_> {
    fn call(&self, s: &Sample) {
        self.out.lock().push(*s);
    }

    fn end(&self) {}

    fn wait(&self) {}

    fn cancel(&self) {
        self.outer.cancel();
    }

    fn is_canceled(&self) -> bool {
        self.outer.is_canceled()
    }
}
