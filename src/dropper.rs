//! Background tier migration: WAL → memory and memory → page.
//!
//! One worker thread drains a small priority queue (WAL moves first, so
//! segment FIFO order is preserved) and runs periodic age/pressure checks.
//! Every visibility swap — samples leaving one tier for another — happens
//! under the engine's drop guard write lock, so a concurrent reader sees
//! each sample in exactly one tier.

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::chunk::ChunkRef;
use crate::errors::Result;
use crate::memory::{MemAppendStatus, MemoryTier};
use crate::page::PageTier;
use crate::settings::Strategy;
use crate::types::Sample;
use crate::wal::{RecoveredSegment, WalSegment, WalTier};

/// Worker wake-up period for age and pressure checks.
const TICK: Duration = Duration::from_millis(200);

/// Slabs taken per pressure eviction.
const EVICT_BATCH: usize = 8;

/// Pending move kinds. Derived `Ord` makes `WalToMemory` the greater
/// variant, which is what the max-heap pops first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum DropTask {
    MemoryToPage,
    WalToMemory,
}

struct Shared {
    wal: Arc<WalTier>,
    memory: Arc<MemoryTier>,
    pages: Arc<PageTier>,
    strategy: Strategy,
    old_chunk_age: u64,
    drop_guard: Arc<RwLock<()>>,
    queue: Mutex<BinaryHeap<DropTask>>,
    cond: Condvar,
    stopped: AtomicBool,
}

pub struct Dropper {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dropper {
    #[must_use]
    pub fn new(
        wal: Arc<WalTier>,
        memory: Arc<MemoryTier>,
        pages: Arc<PageTier>,
        strategy: Strategy,
        old_chunk_age: u64,
        drop_guard: Arc<RwLock<()>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                wal,
                memory,
                pages,
                strategy,
                old_chunk_age,
                drop_guard,
                queue: Mutex::new(BinaryHeap::new()),
                cond: Condvar::new(),
                stopped: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("chronolite-dropper".into())
            .spawn(move || worker_loop(&shared))
            .expect("spawn dropper");
        *self.worker.lock() = Some(handle);
    }

    /// A WAL segment was just rotated; queue its migration.
    pub fn notify_wal_rotated(&self) {
        self.enqueue(DropTask::WalToMemory);
    }

    pub fn notify_memory_pressure(&self) {
        self.enqueue(DropTask::MemoryToPage);
    }

    fn enqueue(&self, task: DropTask) {
        let mut queue = self.shared.queue.lock();
        if !queue.iter().any(|t| *t == task) {
            queue.push(task);
        }
        self.shared.cond.notify_one();
    }

    /// Replay recovered WAL segments into the memory tier at engine open,
    /// with the page watermark filtering out samples that already made it
    /// down before the crash.
    pub fn replay(&self, segments: &[RecoveredSegment]) {
        let shared = &self.shared;
        let _guard = shared.drop_guard.write();
        for seg in segments {
            for s in &seg.samples {
                migrate(shared, s, true);
            }
        }
    }

    /// Drain everything synchronously: WAL → memory → pages. Under the
    /// MEMORY strategy the memory tier is the terminal store and keeps
    /// its chunks.
    ///
    /// # Errors
    /// Propagates rotation and page flush failures.
    pub fn flush(&self) -> Result<()> {
        let shared = &self.shared;
        shared.wal.rotate_now()?;
        drop_wal(shared);
        if shared.strategy != Strategy::Memory {
            drop_memory(shared, true);
            shared.pages.flush()?;
        }
        Ok(())
    }

    /// Stop the worker after a final queue drain.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.cond.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: &Arc<Shared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            if queue.is_empty() && !shared.stopped.load(Ordering::Acquire) {
                let _ = shared.cond.wait_for(&mut queue, TICK);
            }
            queue.pop()
        };
        match task {
            Some(DropTask::WalToMemory) => drop_wal(shared),
            Some(DropTask::MemoryToPage) => drop_memory(shared, false),
            None => {
                if shared.stopped.load(Ordering::Acquire) {
                    return;
                }
                periodic(shared);
            }
        }
        if shared.stopped.load(Ordering::Acquire) && shared.queue.lock().is_empty() {
            return;
        }
    }
}

fn periodic(shared: &Shared) {
    if shared.wal.front_closed().is_some() {
        drop_wal(shared);
    }
    let (allocated, capacity) = shared.memory.allocator_usage();
    let pressure = allocated * 10 >= capacity * 9;
    let aggressive =
        matches!(shared.strategy, Strategy::Compressed | Strategy::Cache);
    if pressure || aggressive || shared.old_chunk_age > 0 {
        drop_memory(shared, false);
    }
}

/// Migrate closed segments, oldest first. The whole per-segment move sits
/// inside one drop-guard section: after it, the segment is retired (off
/// the query path) and its samples answer from the memory tier.
fn drop_wal(shared: &Shared) {
    loop {
        let _guard = shared.drop_guard.write();
        let Some(path) = shared.wal.front_closed() else {
            return;
        };
        let samples = match WalSegment::scan(&path) {
            Ok(samples) => samples,
            Err(e) => {
                log::error!("dropper cannot read wal segment {}: {e}", path.display());
                return;
            }
        };
        for s in &samples {
            migrate(shared, s, false);
        }
        shared.wal.retire(&path);
        log::info!("migrated wal segment {} ({} samples)", path.display(), samples.len());
    }
}

/// One sample into the memory tier, evicting once on an exhausted
/// allocator. Caller holds the drop guard.
fn migrate(shared: &Shared, s: &Sample, dedup: bool) {
    match shared.memory.append(s, dedup) {
        MemAppendStatus::Appended | MemAppendStatus::Deduped => {}
        MemAppendStatus::Exhausted => {
            evict(shared);
            if shared.memory.append(s, dedup) == MemAppendStatus::Exhausted {
                // still durable in the retired segment; it will come back
                // on the next restart replay
                log::warn!("memory allocator exhausted twice, sample for id {} ignored", s.id);
            }
        }
    }
}

fn evict(shared: &Shared) {
    if shared.strategy == Strategy::Memory {
        log::warn!("memory strategy has no lower tier to evict to");
        return;
    }
    let chunks = shared.memory.take_oldest(EVICT_BATCH);
    sink(shared, chunks);
}

/// Move chunks into the page tier, advancing the watermark on success and
/// restoring them to the memory tier on failure so the data stays
/// queryable for a later retry.
fn sink(shared: &Shared, chunks: Vec<ChunkRef>) {
    if chunks.is_empty() {
        return;
    }
    let count = chunks.len();
    match shared.pages.append_chunks(&chunks) {
        Ok(()) => {
            shared.memory.mark_synced(&chunks);
            log::info!("dropped {count} chunks to pages");
        }
        Err(e) => {
            log::error!("page append failed, restoring {count} chunks to memory: {e}");
            shared.memory.restore(chunks);
        }
    }
}

fn drop_memory(shared: &Shared, drain: bool) {
    if shared.strategy == Strategy::Memory {
        return;
    }
    let _guard = shared.drop_guard.write();
    let chunks = if drain {
        shared.memory.drain()
    } else {
        let mut chunks = match shared.strategy {
            // write-through strategies push sealed chunks down every tick
            Strategy::Compressed | Strategy::Cache => shared.memory.take_sealed(),
            _ => Vec::new(),
        };
        if shared.old_chunk_age > 0
            && let Some(now) = shared.wal.max_time()
        {
            chunks.extend(shared.memory.drop_old(now, shared.old_chunk_age));
        }
        let (allocated, capacity) = shared.memory.allocator_usage();
        if chunks.is_empty() && allocated * 10 >= capacity * 9 {
            chunks = shared.memory.take_oldest(EVICT_BATCH);
        }
        chunks
    };
    sink(shared, chunks);
    if shared.memory.is_empty() {
        // everything that was replayed or migrated now lives in pages, so
        // the retired segments have served their durability purpose
        match shared.wal.delete_retired() {
            Ok(0) => {}
            Ok(n) => log::info!("deleted {n} retired wal segments"),
            Err(e) => log::error!("failed to delete retired wal segments: {e}"),
        }
    }
}
