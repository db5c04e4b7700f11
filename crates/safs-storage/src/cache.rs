//! NUMA-partitioned set-associative page cache.
//!
//! Capacity is split across partitions (one per NUMA node that has a
//! device, capped by `num_nodes` and by the number of frames) and each
//! partition into sets of at most `cache_assoc` frames. A page hashes to
//! exactly one set of the partition its serving device is attached to, so
//! lookup and replacement only ever touch one set.
//!
//! Frames move through `Free -> Loading -> Resident <-> WritingBack`. A
//! frame is only reused for another page once it is clean and unpinned; a
//! dirty victim stays findable under its old page until its write-back
//! completes. Pins are counted on the frame: they are taken under the set
//! lock and released lock-free when a [`PageGuard`] is dropped.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::config::SafsConfig;
use crate::error::{StorageError, StorageResult};
use crate::io_engine::BlockDevice;
use crate::io_scheduler::{IoRequest, IoScheduler, IoTicket};
use crate::page::{FileId, PageId};

/// Victim selection inside one set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplacementPolicy {
    /// Least recently used.
    Lru,
    /// First loaded, first evicted.
    Fifo,
}

impl FromStr for ReplacementPolicy {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LRU" => Ok(ReplacementPolicy::Lru),
            "FIFO" => Ok(ReplacementPolicy::Fifo),
            _ => Err(StorageError::config(format!("unknown cache_policy '{}'", s))),
        }
    }
}

impl fmt::Display for ReplacementPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplacementPolicy::Lru => write!(f, "LRU"),
            ReplacementPolicy::Fifo => write!(f, "FIFO"),
        }
    }
}

/// Configuration for the page cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageCacheConfig {
    /// Hard ceiling on frames across all partitions.
    pub total_frames: usize,
    /// Bytes per frame.
    pub page_size: u64,
    /// Frames per set.
    pub assoc: usize,
    /// Upper bound on the partition count (NUMA nodes).
    pub partitions: usize,
    /// Replacement policy.
    pub policy: ReplacementPolicy,
    /// How long a miss waits on a fully pinned set, in milliseconds.
    pub wait_ms: u64,
}

impl PageCacheConfig {
    /// Derives the cache layout from the engine configuration.
    pub fn from_safs(config: &SafsConfig) -> Self {
        Self {
            total_frames: config.total_frames(),
            page_size: config.page_size,
            assoc: config.cache_assoc,
            partitions: config.num_nodes,
            policy: config.cache_policy,
            wait_ms: config.cache_wait_ms,
        }
    }
}

/// Statistics tracking for the page cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups served from a resident frame.
    pub hits: u64,
    /// Lookups that had to load or install the page.
    pub misses: u64,
    /// Pages dropped to make room for another page.
    pub evictions: u64,
    /// Successful dirty-frame write-backs.
    pub writebacks: u64,
    /// Failed write-backs (the frame stayed dirty).
    pub failed_writebacks: u64,
    /// Frames currently holding a page.
    pub resident_frames: usize,
    /// Frame ceiling.
    pub capacity_frames: usize,
    /// Number of NUMA partitions.
    pub partitions: usize,
    /// Number of sets across all partitions.
    pub sets: usize,
}

impl CacheStats {
    /// Ratio of hits to lookups; 0.0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    writebacks: AtomicU64,
    failed_writebacks: AtomicU64,
}

/// Which dirty frames a flush covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushScope {
    /// Every dirty frame.
    All,
    /// Dirty frames of one logical file.
    File(FileId),
}

impl FlushScope {
    fn covers(&self, page: PageId) -> bool {
        match self {
            FlushScope::All => true,
            FlushScope::File(file) => page.file == *file,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Free,
    Loading,
    Resident,
    WritingBack,
}

struct Frame {
    refcount: AtomicUsize,
    dirty: AtomicBool,
    /// Bumped on every modification, under the data write lock.
    version: AtomicU64,
    data: RwLock<Vec<u8>>,
}

impl Frame {
    fn new() -> Self {
        Self {
            refcount: AtomicUsize::new(0),
            dirty: AtomicBool::new(false),
            version: AtomicU64::new(0),
            data: RwLock::new(Vec::new()),
        }
    }

    fn pinned(&self) -> bool {
        self.refcount.load(Ordering::Acquire) > 0
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

struct Slot {
    page: Option<PageId>,
    state: FrameState,
    frame: Arc<Frame>,
    last_access: u64,
    loaded_at: u64,
}

enum Victim {
    Clean(usize),
    Dirty(usize),
}

struct SetState {
    slots: Vec<Slot>,
    capacity: usize,
    clock: u64,
}

impl SetState {
    fn find(&self, page: PageId) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.page == Some(page) && s.state != FrameState::Free)
    }

    fn in_transition(&self) -> bool {
        self.slots
            .iter()
            .any(|s| matches!(s.state, FrameState::Loading | FrameState::WritingBack))
    }

    fn pick_victim(&mut self, policy: ReplacementPolicy) -> Option<Victim> {
        if let Some(i) = self
            .slots
            .iter()
            .position(|s| s.state == FrameState::Free && !s.frame.pinned())
        {
            return Some(Victim::Clean(i));
        }
        if self.slots.len() < self.capacity {
            self.slots.push(Slot {
                page: None,
                state: FrameState::Free,
                frame: Arc::new(Frame::new()),
                last_access: 0,
                loaded_at: 0,
            });
            return Some(Victim::Clean(self.slots.len() - 1));
        }
        let (i, slot) = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == FrameState::Resident && !s.frame.pinned())
            .min_by_key(|(_, s)| match policy {
                ReplacementPolicy::Lru => s.last_access,
                ReplacementPolicy::Fifo => s.loaded_at,
            })?;
        if slot.frame.is_dirty() {
            Some(Victim::Dirty(i))
        } else {
            Some(Victim::Clean(i))
        }
    }
}

struct CacheSet {
    partition: usize,
    index: usize,
    state: Mutex<SetState>,
    notify: Notify,
}

/// A pinned, resident page. The pin is released on drop.
pub struct PageGuard {
    page: PageId,
    frame: Arc<Frame>,
    set: Arc<CacheSet>,
}

impl std::fmt::Debug for PageGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageGuard")
            .field("page", &self.page)
            .finish_non_exhaustive()
    }
}

impl PageGuard {
    fn pin(set: &Arc<CacheSet>, slot: &Slot, page: PageId) -> Self {
        slot.frame.refcount.fetch_add(1, Ordering::AcqRel);
        Self {
            page,
            frame: Arc::clone(&slot.frame),
            set: Arc::clone(set),
        }
    }

    /// The cached page.
    pub fn page(&self) -> PageId {
        self.page
    }

    /// Shared view of the page bytes.
    pub fn bytes(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.frame.data.read()
    }

    /// Overwrites part of the page and marks the frame dirty.
    pub fn write(&self, offset: usize, bytes: &[u8]) -> StorageResult<()> {
        let mut data = self.frame.data.write();
        let end = offset + bytes.len();
        if end > data.len() {
            return Err(StorageError::OutOfRange {
                offset: offset as u64,
                len: bytes.len() as u64,
                size: data.len() as u64,
            });
        }
        data[offset..end].copy_from_slice(bytes);
        self.frame.version.fetch_add(1, Ordering::AcqRel);
        self.frame.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Whether the page has unwritten modifications.
    pub fn is_dirty(&self) -> bool {
        self.frame.is_dirty()
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if self.frame.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.set.notify.notify_waiters();
        }
    }
}

enum Step {
    Ready(PageGuard, bool),
    Load {
        guard: PageGuard,
        slot: usize,
        ticket: IoTicket,
    },
    Evict(Writeback),
    Wait {
        pinned: bool,
        frames: usize,
    },
}

struct Writeback {
    set: Arc<CacheSet>,
    slot: usize,
    page: PageId,
    version: u64,
    frame: Arc<Frame>,
    ticket: IoTicket,
}

struct CacheInner<D> {
    config: PageCacheConfig,
    scheduler: IoScheduler<D>,
    partitions: Vec<Vec<Arc<CacheSet>>>,
    /// Partition of each device, by device index.
    device_partition: Vec<usize>,
    /// Removed files. Their frames are never written back again.
    discarded: DashSet<FileId>,
    counters: Arc<CacheCounters>,
}

/// Set-associative page cache in front of the I/O scheduler.
pub struct PageCache<D> {
    inner: Arc<CacheInner<D>>,
}

impl<D> Clone for PageCache<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: BlockDevice> PageCache<D> {
    /// Lays out partitions and sets. Frames are allocated on first use.
    pub fn new(config: PageCacheConfig, scheduler: IoScheduler<D>) -> StorageResult<Self> {
        if config.total_frames == 0 {
            return Err(StorageError::config("cache must hold at least one page"));
        }
        if config.assoc == 0 {
            return Err(StorageError::config("cache_assoc must be at least 1"));
        }
        if config.page_size != scheduler.mapper().layout().page_size {
            return Err(StorageError::config(
                "cache page size differs from the RAID layout page size",
            ));
        }

        let total = config.total_frames;
        let nodes: BTreeSet<u16> = scheduler.devices().iter().map(|d| d.numa_node()).collect();
        let num_partitions = nodes.len().min(config.partitions).clamp(1, total);
        // Nodes are ranked so that every partition has at least one device.
        let device_partition = scheduler
            .devices()
            .iter()
            .map(|d| {
                let rank = nodes.iter().take_while(|&&n| n < d.numa_node()).count();
                rank % num_partitions
            })
            .collect();
        let mut partitions = Vec::with_capacity(num_partitions);
        for p in 0..num_partitions {
            let frames = total / num_partitions + usize::from(p < total % num_partitions);
            let num_sets = frames.div_ceil(config.assoc);
            let sets = (0..num_sets)
                .map(|s| {
                    let capacity = frames / num_sets + usize::from(s < frames % num_sets);
                    Arc::new(CacheSet {
                        partition: p,
                        index: s,
                        state: Mutex::new(SetState {
                            slots: Vec::with_capacity(capacity),
                            capacity,
                            clock: 0,
                        }),
                        notify: Notify::new(),
                    })
                })
                .collect();
            partitions.push(sets);
        }
        debug!(
            "Created page cache: frames={}, partitions={}, assoc={}, policy={}",
            total, num_partitions, config.assoc, config.policy
        );

        Ok(Self {
            inner: Arc::new(CacheInner {
                config,
                scheduler,
                partitions,
                device_partition,
                discarded: DashSet::new(),
                counters: Arc::new(CacheCounters::default()),
            }),
        })
    }

    /// Partition a page is cached in, chosen by the NUMA node of the
    /// device serving it. Mirrored pages spread over their replicas.
    pub fn partition_of(&self, page: PageId) -> usize {
        let locations = self.inner.scheduler.mapper().map(page.index);
        let device = match locations.len() {
            0 | 1 => self.inner.scheduler.mapper().primary(page.index).device,
            n => locations[(page.index % n as u64) as usize].device,
        };
        self.inner
            .device_partition
            .get(device as usize)
            .copied()
            .unwrap_or(0)
    }

    fn set_for(&self, page: PageId) -> &Arc<CacheSet> {
        let sets = &self.inner.partitions[self.partition_of(page)];
        let mut key = [0u8; 12];
        key[..4].copy_from_slice(&page.file.0.to_le_bytes());
        key[4..].copy_from_slice(&page.index.to_le_bytes());
        &sets[(xxh3_64(&key) % sets.len() as u64) as usize]
    }

    fn all_sets(&self) -> impl Iterator<Item = &Arc<CacheSet>> {
        self.inner.partitions.iter().flatten()
    }

    /// Returns the page if it is resident, without touching any device.
    pub fn get(&self, page: PageId) -> Option<PageGuard> {
        let set = self.set_for(page);
        let mut st = set.state.lock();
        st.clock += 1;
        let now = st.clock;
        let i = st.find(page)?;
        if st.slots[i].state == FrameState::Loading {
            return None;
        }
        st.slots[i].last_access = now;
        self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
        Some(PageGuard::pin(set, &st.slots[i], page))
    }

    /// Returns the page, loading it from its device on a miss.
    pub async fn fetch(&self, page: PageId) -> StorageResult<PageGuard> {
        self.acquire(page, None).await.map(|(guard, _)| guard)
    }

    /// Writes `bytes` at `offset` inside `page` and marks it dirty.
    ///
    /// A write covering the whole page does not read the device.
    pub async fn put_dirty(&self, page: PageId, offset: usize, bytes: &[u8]) -> StorageResult<()> {
        let whole = offset == 0 && bytes.len() as u64 == self.inner.config.page_size;
        let (guard, installed) = self.acquire(page, whole.then_some(bytes)).await?;
        if installed {
            return Ok(());
        }
        guard.write(offset, bytes)
    }

    /// Pins `page`. On a miss with `fill`, the frame is installed from
    /// `fill` instead of being read, and the flag is true.
    async fn acquire(
        &self,
        page: PageId,
        fill: Option<&[u8]>,
    ) -> StorageResult<(PageGuard, bool)> {
        let set = self.set_for(page);
        let deadline = tokio::time::Instant::now() + Duration::from_millis(self.inner.config.wait_ms);
        let mut missed = false;

        loop {
            // Registered before inspecting the set so no release is missed.
            let notified = set.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.step(set, page, fill, &mut missed)? {
                Step::Ready(guard, installed) => return Ok((guard, installed)),
                Step::Load {
                    guard,
                    slot,
                    ticket,
                } => {
                    let task = tokio::spawn(complete_load(
                        Arc::clone(set),
                        slot,
                        Arc::clone(&guard.frame),
                        ticket,
                    ));
                    join(task).await?;
                    return Ok((guard, false));
                }
                Step::Evict(wb) => {
                    let task = tokio::spawn(finish_writeback(Arc::clone(&self.inner.counters), wb));
                    join(task).await?;
                }
                Step::Wait { pinned: false, .. } => notified.await,
                Step::Wait {
                    pinned: true,
                    frames,
                } => {
                    debug!("All frames of set {}/{} pinned, waiting", set.partition, set.index);
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        warn!(
                            "Cache set {}/{} exhausted while fetching {}",
                            set.partition, set.index, page
                        );
                        return Err(StorageError::CacheExhausted {
                            partition: set.partition,
                            set: set.index,
                            frames,
                        });
                    }
                }
            }
        }
    }

    fn step(
        &self,
        set: &Arc<CacheSet>,
        page: PageId,
        fill: Option<&[u8]>,
        missed: &mut bool,
    ) -> StorageResult<Step> {
        let counters = &self.inner.counters;
        let mut st = set.state.lock();
        st.clock += 1;
        let now = st.clock;

        if let Some(i) = st.find(page) {
            if st.slots[i].state == FrameState::Loading {
                return Ok(Step::Wait {
                    pinned: false,
                    frames: st.capacity,
                });
            }
            st.slots[i].last_access = now;
            if !*missed {
                counters.hits.fetch_add(1, Ordering::Relaxed);
            }
            return Ok(Step::Ready(PageGuard::pin(set, &st.slots[i], page), false));
        }

        if !*missed {
            *missed = true;
            counters.misses.fetch_add(1, Ordering::Relaxed);
            debug!("Cache miss on {} (set {}/{})", page, set.partition, set.index);
        }

        let i = match st.pick_victim(self.inner.config.policy) {
            Some(Victim::Clean(i)) => i,
            Some(Victim::Dirty(i)) if self.is_discarded(&st.slots[i]) => {
                st.slots[i].frame.dirty.store(false, Ordering::Release);
                i
            }
            Some(Victim::Dirty(i)) => {
                return self.begin_writeback(set, &mut st, i).map(Step::Evict);
            }
            None => {
                return Ok(Step::Wait {
                    pinned: !st.in_transition(),
                    frames: st.capacity,
                })
            }
        };

        let slot = &mut st.slots[i];
        if let Some(old) = slot.page.take() {
            counters.evictions.fetch_add(1, Ordering::Relaxed);
            debug!("Evicting clean {} for {}", old, page);
        }
        slot.page = Some(page);
        slot.last_access = now;
        slot.loaded_at = now;
        slot.frame.dirty.store(false, Ordering::Release);

        if let Some(bytes) = fill {
            {
                let mut data = slot.frame.data.write();
                data.clear();
                data.extend_from_slice(bytes);
                slot.frame.version.fetch_add(1, Ordering::AcqRel);
                slot.frame.dirty.store(true, Ordering::Release);
            }
            slot.state = FrameState::Resident;
            return Ok(Step::Ready(PageGuard::pin(set, slot, page), true));
        }

        match self.inner.scheduler.submit(IoRequest::read(page)) {
            Ok(ticket) => {
                slot.state = FrameState::Loading;
                Ok(Step::Load {
                    guard: PageGuard::pin(set, slot, page),
                    slot: i,
                    ticket,
                })
            }
            Err(e) => {
                slot.page = None;
                slot.state = FrameState::Free;
                Err(e)
            }
        }
    }

    fn is_discarded(&self, slot: &Slot) -> bool {
        slot.page.is_some_and(|p| self.inner.discarded.contains(&p.file))
    }

    /// Snapshots a dirty resident frame and submits its write. Caller holds the set lock.
    fn begin_writeback(
        &self,
        set: &Arc<CacheSet>,
        st: &mut SetState,
        i: usize,
    ) -> StorageResult<Writeback> {
        let slot = &mut st.slots[i];
        let page = slot
            .page
            .ok_or_else(|| StorageError::config("write-back of a free frame"))?;
        let (data, version) = {
            let data = slot.frame.data.read();
            (data.clone(), slot.frame.version.load(Ordering::Acquire))
        };
        let ticket = self.inner.scheduler.submit(IoRequest::write(page, data))?;
        slot.state = FrameState::WritingBack;
        debug!("Writing back dirty {} (version {})", page, version);
        Ok(Writeback {
            set: Arc::clone(set),
            slot: i,
            page,
            version,
            frame: Arc::clone(&slot.frame),
            ticket,
        })
    }

    /// Writes back every dirty frame in `scope` and waits for all of them.
    ///
    /// Frames whose write fails stay dirty; the first failure is returned
    /// after every other write-back has completed.
    pub async fn flush(&self, scope: FlushScope) -> StorageResult<()> {
        let mut written: HashSet<PageId> = HashSet::new();
        let mut files: HashSet<FileId> = HashSet::new();
        let mut first_error = None;

        loop {
            let mut tasks: Vec<JoinHandle<StorageResult<()>>> = Vec::new();
            let mut busy = Vec::new();

            for set in self.all_sets() {
                let mut st = set.state.lock();
                let mut set_busy = false;
                for i in 0..st.slots.len() {
                    let slot = &st.slots[i];
                    let Some(page) = slot.page else { continue };
                    if !scope.covers(page) || !slot.frame.is_dirty() || written.contains(&page) {
                        continue;
                    }
                    let state = slot.state;
                    match state {
                        FrameState::Resident if self.inner.discarded.contains(&page.file) => {
                            slot.frame.dirty.store(false, Ordering::Release);
                        }
                        FrameState::Resident => {
                            written.insert(page);
                            files.insert(page.file);
                            match self.begin_writeback(set, &mut st, i) {
                                Ok(wb) => tasks.push(tokio::spawn(finish_writeback(
                                    Arc::clone(&self.inner.counters),
                                    wb,
                                ))),
                                Err(e) => {
                                    first_error.get_or_insert(e);
                                }
                            }
                        }
                        FrameState::WritingBack => set_busy = true,
                        FrameState::Free | FrameState::Loading => {}
                    }
                }
                if set_busy {
                    busy.push(Arc::clone(set));
                }
            }

            if tasks.is_empty() && busy.is_empty() {
                break;
            }
            for task in tasks {
                if let Err(e) = join(task).await {
                    first_error.get_or_insert(e);
                }
            }
            for set in busy {
                wait_for_foreign_writebacks(&set, scope, &written).await;
            }
        }

        for file in files {
            if let Err(e) = self.inner.scheduler.sync(file).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drops every idle frame of `file` without writing it back.
    ///
    /// Frames that are pinned or in transition are only marked clean, and
    /// later writes through a surviving guard are dropped on eviction.
    pub fn discard(&self, file: FileId) -> usize {
        self.inner.discarded.insert(file);
        let mut dropped = 0;
        for set in self.all_sets() {
            let mut st = set.state.lock();
            for slot in st.slots.iter_mut() {
                if slot.page.map(|p| p.file) != Some(file) {
                    continue;
                }
                slot.frame.dirty.store(false, Ordering::Release);
                if slot.state == FrameState::Resident && !slot.frame.pinned() {
                    slot.page = None;
                    slot.state = FrameState::Free;
                    dropped += 1;
                }
            }
            drop(st);
            set.notify.notify_waiters();
        }
        debug!("Discarded {} frames of {}", dropped, file);
        dropped
    }

    /// Pages currently held by a frame.
    pub fn resident_pages(&self) -> Vec<PageId> {
        self.all_sets()
            .flat_map(|set| {
                set.state
                    .lock()
                    .slots
                    .iter()
                    .filter(|s| s.state != FrameState::Free)
                    .filter_map(|s| s.page)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Number of dirty frames.
    pub fn dirty_count(&self) -> usize {
        self.all_sets()
            .map(|set| {
                set.state
                    .lock()
                    .slots
                    .iter()
                    .filter(|s| s.page.is_some() && s.frame.is_dirty())
                    .count()
            })
            .sum()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &PageCacheConfig {
        &self.inner.config
    }

    /// Snapshot of the cache statistics.
    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            writebacks: c.writebacks.load(Ordering::Relaxed),
            failed_writebacks: c.failed_writebacks.load(Ordering::Relaxed),
            resident_frames: self.resident_pages().len(),
            capacity_frames: self.inner.config.total_frames,
            partitions: self.inner.partitions.len(),
            sets: self.inner.partitions.iter().map(Vec::len).sum(),
        }
    }
}

async fn join(task: JoinHandle<StorageResult<()>>) -> StorageResult<()> {
    task.await.map_err(|e| StorageError::Io(std::io::Error::other(e)))?
}

async fn complete_load(
    set: Arc<CacheSet>,
    slot: usize,
    frame: Arc<Frame>,
    ticket: IoTicket,
) -> StorageResult<()> {
    let result = ticket.wait().await;
    if let Ok(done) = &result {
        let mut data = frame.data.write();
        data.clear();
        if let Some(bytes) = &done.data {
            data.extend_from_slice(bytes);
        }
    }
    {
        let mut st = set.state.lock();
        let slot = &mut st.slots[slot];
        match &result {
            Ok(_) => slot.state = FrameState::Resident,
            Err(e) => {
                warn!("Loading {:?} failed: {}", slot.page, e);
                slot.page = None;
                slot.state = FrameState::Free;
            }
        }
    }
    set.notify.notify_waiters();
    result.map(|_| ())
}

async fn finish_writeback(counters: Arc<CacheCounters>, wb: Writeback) -> StorageResult<()> {
    let result = wb.ticket.wait().await;
    {
        let mut st = wb.set.state.lock();
        st.slots[wb.slot].state = FrameState::Resident;
        match &result {
            Ok(_) => {
                // Held so a concurrent modification cannot slip between check and clear.
                let _data = wb.frame.data.read();
                if wb.frame.version.load(Ordering::Acquire) == wb.version {
                    wb.frame.dirty.store(false, Ordering::Release);
                }
                counters.writebacks.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed_writebacks.fetch_add(1, Ordering::Relaxed);
                warn!("Write-back of {} failed, keeping it dirty: {}", wb.page, e);
            }
        }
    }
    wb.set.notify.notify_waiters();
    result.map(|_| ())
}

async fn wait_for_foreign_writebacks(set: &CacheSet, scope: FlushScope, written: &HashSet<PageId>) {
    loop {
        let notified = set.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        let busy = set.state.lock().slots.iter().any(|s| {
            s.state == FrameState::WritingBack
                && s.page
                    .is_some_and(|p| scope.covers(p) && !written.contains(&p))
        });
        if !busy {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceSet;
    use crate::io_engine::{DeviceEventKind, MemDevice};
    use crate::io_scheduler::IoSchedulerConfig;
    use crate::raid::{RaidLayout, RaidMapper, RaidPolicy};

    const PAGE: usize = 4096;

    fn cache_with(
        devices: Vec<(MemDevice, u16)>,
        frames: usize,
        assoc: usize,
        nodes: usize,
        policy: ReplacementPolicy,
    ) -> PageCache<MemDevice> {
        let n = devices.len() as u16;
        let set = DeviceSet::new(devices).unwrap();
        let mapper = RaidMapper::new(RaidLayout {
            policy: RaidPolicy::Raid0,
            num_devices: n,
            page_size: PAGE as u64,
            stripe_pages: 1,
        })
        .unwrap();
        let scheduler = IoScheduler::new(
            IoSchedulerConfig {
                io_depth: 1,
                ..Default::default()
            },
            set,
            mapper,
        )
        .unwrap();
        PageCache::new(
            PageCacheConfig {
                total_frames: frames,
                page_size: PAGE as u64,
                assoc,
                partitions: nodes,
                policy,
                wait_ms: 100,
            },
            scheduler,
        )
        .unwrap()
    }

    fn cache(frames: usize, assoc: usize) -> PageCache<MemDevice> {
        cache_with(vec![(MemDevice::new(), 0)], frames, assoc, 1, ReplacementPolicy::Lru)
    }

    fn page(index: u64) -> PageId {
        PageId::new(FileId(1), index)
    }

    fn device(cache: &PageCache<MemDevice>, idx: u16) -> &MemDevice {
        cache.inner.scheduler.devices().device(idx).unwrap().backend()
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("lru".parse::<ReplacementPolicy>().unwrap(), ReplacementPolicy::Lru);
        assert_eq!("FIFO".parse::<ReplacementPolicy>().unwrap(), ReplacementPolicy::Fifo);
        assert!("ARC".parse::<ReplacementPolicy>().is_err());
    }

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }

    fn four_nodes() -> Vec<(MemDevice, u16)> {
        (0..4).map(|n| (MemDevice::new(), n)).collect()
    }

    #[tokio::test]
    async fn test_layout_respects_capacity() {
        let cache = cache_with(four_nodes(), 10, 4, 4, ReplacementPolicy::Lru);
        let stats = cache.stats();
        assert_eq!(stats.partitions, 4);
        assert_eq!(stats.capacity_frames, 10);
        let capacity: usize = cache
            .all_sets()
            .map(|s| s.state.lock().capacity)
            .sum();
        assert_eq!(capacity, 10);
    }

    #[tokio::test]
    async fn test_partitions_capped_by_frames() {
        let cache = cache_with(four_nodes(), 2, 8, 4, ReplacementPolicy::Lru);
        assert_eq!(cache.stats().partitions, 2);
        assert_eq!(cache.partition_of(page(0)), 0);
        assert_eq!(cache.partition_of(page(1)), 1);
        assert_eq!(cache.partition_of(page(2)), 0);
    }

    #[tokio::test]
    async fn test_partitions_only_for_nodes_with_devices() {
        let cache = cache_with(vec![(MemDevice::new(), 0)], 8, 8, 4, ReplacementPolicy::Lru);
        assert_eq!(cache.stats().partitions, 1);
        for p in 0..8 {
            cache.fetch(page(p)).await.unwrap();
        }
        assert_eq!(cache.resident_pages().len(), 8);
        for p in 0..8 {
            cache.fetch(page(p)).await.unwrap();
        }
        let stats = cache.stats();
        assert_eq!(stats.misses, 8);
        assert_eq!(stats.hits, 8);
    }

    #[tokio::test]
    async fn test_sparse_node_ids_fill_every_partition() {
        let cache = cache_with(
            vec![(MemDevice::new(), 2), (MemDevice::new(), 5)],
            4,
            2,
            4,
            ReplacementPolicy::Lru,
        );
        assert_eq!(cache.stats().partitions, 2);
        assert_eq!(cache.partition_of(page(0)), 0);
        assert_eq!(cache.partition_of(page(1)), 1);
    }

    #[tokio::test]
    async fn test_mirrored_pages_use_every_partition() {
        let set = DeviceSet::new(vec![(MemDevice::new(), 0), (MemDevice::new(), 1)]).unwrap();
        let mapper = RaidMapper::new(RaidLayout {
            policy: RaidPolicy::Mirror,
            num_devices: 2,
            page_size: PAGE as u64,
            stripe_pages: 1,
        })
        .unwrap();
        let scheduler = IoScheduler::new(IoSchedulerConfig::default(), set, mapper).unwrap();
        let cache = PageCache::new(
            PageCacheConfig {
                total_frames: 4,
                page_size: PAGE as u64,
                assoc: 4,
                partitions: 4,
                policy: ReplacementPolicy::Lru,
                wait_ms: 100,
            },
            scheduler,
        )
        .unwrap();
        assert_eq!(cache.stats().partitions, 2);
        assert_eq!(cache.partition_of(page(0)), 0);
        assert_eq!(cache.partition_of(page(1)), 1);
        for p in 0..4 {
            cache.fetch(page(p)).await.unwrap();
        }
        assert_eq!(cache.resident_pages().len(), 4);
    }

    #[tokio::test]
    async fn test_partition_follows_device_node() {
        let cache = cache_with(
            vec![(MemDevice::new(), 0), (MemDevice::new(), 1)],
            8,
            2,
            2,
            ReplacementPolicy::Lru,
        );
        // Single-page stripes alternate devices.
        assert_eq!(cache.partition_of(page(0)), 0);
        assert_eq!(cache.partition_of(page(1)), 1);
        assert_eq!(cache.partition_of(page(2)), 0);
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let cache = cache(4, 4);
        assert!(cache.get(page(0)).is_none());
        {
            let guard = cache.fetch(page(0)).await.unwrap();
            assert_eq!(guard.bytes().len(), PAGE);
        }
        assert!(cache.get(page(0)).is_some());
        cache.fetch(page(0)).await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.resident_frames, 1);
        assert_eq!(device(&cache, 0).reads_completed(), 1);
    }

    #[tokio::test]
    async fn test_capacity_never_exceeded() {
        let cache = cache(4, 2);
        for p in 0..64 {
            cache.fetch(page(p)).await.unwrap();
            assert!(cache.resident_pages().len() <= 4);
        }
        let resident = cache.resident_pages();
        let unique: HashSet<_> = resident.iter().collect();
        assert_eq!(unique.len(), resident.len());
    }

    #[tokio::test]
    async fn test_full_page_write_skips_read() {
        let cache = cache(2, 2);
        cache.put_dirty(page(3), 0, &[7u8; PAGE]).await.unwrap();
        assert_eq!(device(&cache, 0).reads_completed(), 0);
        assert_eq!(cache.dirty_count(), 1);

        cache.put_dirty(page(4), 10, &[1, 2, 3]).await.unwrap();
        assert_eq!(device(&cache, 0).reads_completed(), 1);
        let guard = cache.get(page(4)).unwrap();
        assert_eq!(&guard.bytes()[10..13], &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_dirty_eviction_writes_back_before_reuse() {
        let dev = MemDevice::new().with_latency(
            std::time::Duration::from_millis(5),
            std::time::Duration::from_millis(40),
        );
        let cache = cache_with(vec![(dev, 0)], 1, 1, 1, ReplacementPolicy::Lru);
        cache.put_dirty(page(0), 0, &[0xAA; PAGE]).await.unwrap();
        cache.fetch(page(1)).await.unwrap();

        let events = device(&cache, 0).events();
        let write_done = events
            .iter()
            .position(|e| e.kind == DeviceEventKind::WriteDone)
            .unwrap();
        let read_start = events
            .iter()
            .position(|e| e.kind == DeviceEventKind::ReadStart)
            .unwrap();
        assert!(write_done < read_start);
        assert_eq!(events[read_start].offset, PAGE as u64);

        let stats = cache.stats();
        assert_eq!(stats.writebacks, 1);
        assert_eq!(stats.evictions, 1);
        assert_eq!(&device(&cache, 0).part_bytes(FileId(1))[..PAGE], &[0xAA; PAGE][..]);
    }

    #[tokio::test]
    async fn test_failed_writeback_keeps_page_dirty() {
        let cache = cache(1, 1);
        cache.put_dirty(page(0), 0, &[5u8; PAGE]).await.unwrap();
        device(&cache, 0).set_fail_writes(true);

        let err = cache.fetch(page(1)).await.unwrap_err();
        assert!(matches!(err, StorageError::DeviceIo { .. }));
        assert_eq!(cache.dirty_count(), 1);
        assert_eq!(cache.resident_pages(), vec![page(0)]);
        assert_eq!(cache.stats().failed_writebacks, 1);

        device(&cache, 0).set_fail_writes(false);
        cache.flush(FlushScope::All).await.unwrap();
        assert_eq!(cache.dirty_count(), 0);
        assert_eq!(&device(&cache, 0).part_bytes(FileId(1))[..PAGE], &[5u8; PAGE][..]);
    }

    #[tokio::test]
    async fn test_pinned_set_exhausts_after_timeout() {
        let cache = cache(1, 1);
        let _held = cache.fetch(page(0)).await.unwrap();
        let err = cache.fetch(page(1)).await.unwrap_err();
        assert!(err.is_retryable());
        match err {
            StorageError::CacheExhausted { frames, .. } => assert_eq!(frames, 1),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_waiter_resumes_on_release() {
        let cache = cache(1, 1);
        let held = cache.fetch(page(0)).await.unwrap();
        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.fetch(page(1)).await.map(|g| g.page()) })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), page(1));
    }

    #[tokio::test]
    async fn test_fifo_ignores_recency() {
        let cache = cache_with(vec![(MemDevice::new(), 0)], 2, 2, 1, ReplacementPolicy::Fifo);
        cache.fetch(page(0)).await.unwrap();
        cache.fetch(page(1)).await.unwrap();
        cache.fetch(page(0)).await.unwrap();
        cache.fetch(page(2)).await.unwrap();
        let resident: HashSet<_> = cache.resident_pages().into_iter().collect();
        assert!(!resident.contains(&page(0)));
        assert!(resident.contains(&page(1)));
    }

    #[tokio::test]
    async fn test_lru_keeps_recent_page() {
        let cache = cache(2, 2);
        cache.fetch(page(0)).await.unwrap();
        cache.fetch(page(1)).await.unwrap();
        cache.fetch(page(0)).await.unwrap();
        cache.fetch(page(2)).await.unwrap();
        let resident: HashSet<_> = cache.resident_pages().into_iter().collect();
        assert!(resident.contains(&page(0)));
        assert!(!resident.contains(&page(1)));
    }

    #[tokio::test]
    async fn test_flush_scope_by_file() {
        let cache = cache(8, 8);
        let other = PageId::new(FileId(2), 0);
        cache.put_dirty(page(0), 0, &[1u8; PAGE]).await.unwrap();
        cache.put_dirty(other, 0, &[2u8; PAGE]).await.unwrap();

        cache.flush(FlushScope::File(FileId(1))).await.unwrap();
        assert_eq!(cache.dirty_count(), 1);
        assert!(device(&cache, 0).part_bytes(FileId(2)).is_empty());

        cache.flush(FlushScope::All).await.unwrap();
        assert_eq!(cache.dirty_count(), 0);
        assert_eq!(device(&cache, 0).part_bytes(FileId(2)), vec![2u8; PAGE]);
    }

    #[tokio::test]
    async fn test_discard_drops_without_writeback() {
        let cache = cache(4, 4);
        cache.put_dirty(page(0), 0, &[9u8; PAGE]).await.unwrap();
        assert_eq!(cache.discard(FileId(1)), 1);
        assert!(cache.resident_pages().is_empty());
        cache.flush(FlushScope::All).await.unwrap();
        assert_eq!(device(&cache, 0).writes_completed(), 0);
    }

    #[tokio::test]
    async fn test_removed_file_frame_evicted_without_writeback() {
        let cache = cache(1, 1);
        let guard = cache.fetch(page(0)).await.unwrap();
        cache.discard(FileId(1));
        guard.write(0, &[5u8; 16]).unwrap();
        drop(guard);

        device(&cache, 0).set_fail_writes(true);
        let other = PageId::new(FileId(2), 0);
        cache.fetch(other).await.unwrap();
        assert_eq!(cache.resident_pages(), vec![other]);
        assert_eq!(device(&cache, 0).writes_completed(), 0);
    }

    #[tokio::test]
    async fn test_flush_skips_removed_file() {
        let cache = cache(4, 4);
        let guard = cache.fetch(page(0)).await.unwrap();
        cache.discard(FileId(1));
        guard.write(0, &[5u8; 16]).unwrap();
        drop(guard);

        device(&cache, 0).set_fail_writes(true);
        cache.flush(FlushScope::All).await.unwrap();
        assert_eq!(cache.dirty_count(), 0);
    }

    #[tokio::test]
    async fn test_read_error_frees_frame() {
        let cache = cache(1, 1);
        device(&cache, 0).set_fail_reads(true);
        assert!(cache.fetch(page(0)).await.is_err());
        assert!(cache.resident_pages().is_empty());
        device(&cache, 0).set_fail_reads(false);
        assert!(cache.fetch(page(0)).await.is_ok());
    }
}
