//! Set-associative file layer.
//!
//! [`Safs`] owns the device set, scheduler, cache and catalog for one data
//! root. [`SafFile`] handles translate byte ranges into page operations on
//! the shared cache; every handle on the same logical file sees the same
//! pages, so there is no per-handle state beyond the file it names.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::{FlushScope, PageCache, PageCacheConfig};
use crate::catalog::{Catalog, CatalogEntry};
use crate::config::{SafsConfig, CATALOG_FILE_NAME};
use crate::device::DeviceSet;
use crate::error::{StorageError, StorageResult};
use crate::io_engine::{BlockDevice, FileDevice};
use crate::io_scheduler::{IoScheduler, IoSchedulerConfig};
use crate::metrics::SafsStats;
use crate::page::{page_spans, FileId, PageId};
use crate::raid::{RaidLayout, RaidMapper};

/// Runtime state of a logical file shared by all of its handles.
struct LogicalFile {
    name: String,
    id: FileId,
    size: AtomicU64,
    handles: AtomicUsize,
    modified: AtomicBool,
    removed: AtomicBool,
}

impl LogicalFile {
    fn new(entry: &CatalogEntry) -> Self {
        Self {
            name: entry.name.clone(),
            id: entry.id,
            size: AtomicU64::new(entry.size),
            handles: AtomicUsize::new(0),
            modified: AtomicBool::new(false),
            removed: AtomicBool::new(false),
        }
    }
}

struct SafsInner<D> {
    config: SafsConfig,
    layout: RaidLayout,
    scheduler: IoScheduler<D>,
    cache: PageCache<D>,
    catalog: Catalog,
    files: DashMap<String, Arc<LogicalFile>>,
}

/// A data root: devices, scheduler, cache and catalog.
pub struct Safs<D> {
    inner: Arc<SafsInner<D>>,
}

impl<D> Clone for Safs<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Safs<FileDevice> {
    /// Opens the data root described by `config.root_conf`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn from_config(config: SafsConfig) -> StorageResult<Self> {
        config.validate()?;
        let devices = DeviceSet::open(&config.device_configs()?)?;
        let catalog = Catalog::open(config.data_root().join(CATALOG_FILE_NAME))?;
        Self::with_devices(config, devices, catalog)
    }
}

impl<D: BlockDevice> Safs<D> {
    /// Assembles the layers over an existing device set.
    pub fn with_devices(
        config: SafsConfig,
        devices: DeviceSet<D>,
        catalog: Catalog,
    ) -> StorageResult<Self> {
        config.validate()?;
        let layout = RaidLayout {
            policy: config.raid_mapping,
            num_devices: u16::try_from(devices.len())
                .map_err(|_| StorageError::config("too many devices"))?,
            page_size: config.page_size,
            stripe_pages: config.raid_block_size,
        };
        let mapper = RaidMapper::new(layout)?;
        let scheduler = IoScheduler::new(
            IoSchedulerConfig {
                io_depth: config.io_depth,
                merge_reqs: config.merge_reqs,
                ..Default::default()
            },
            devices,
            mapper,
        )?;
        let cache = PageCache::new(PageCacheConfig::from_safs(&config), scheduler.clone())?;
        info!(
            "SAFS ready: {} devices, {}, cache {} pages of {} bytes, io_depth {}",
            layout.num_devices,
            layout.policy,
            config.total_frames(),
            config.page_size,
            config.io_depth
        );

        Ok(Self {
            inner: Arc::new(SafsInner {
                config,
                layout,
                scheduler,
                cache,
                catalog,
                files: DashMap::new(),
            }),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SafsConfig {
        &self.inner.config
    }

    /// Layout new files are written with.
    pub fn layout(&self) -> RaidLayout {
        self.inner.layout
    }

    /// The file registry.
    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    /// The page cache.
    pub fn cache(&self) -> &PageCache<D> {
        &self.inner.cache
    }

    /// The I/O scheduler.
    pub fn scheduler(&self) -> &IoScheduler<D> {
        &self.inner.scheduler
    }

    /// Whether `name` is registered.
    pub fn exists(&self, name: &str) -> bool {
        self.inner.catalog.contains(name)
    }

    /// Registered names in sorted order.
    pub fn list(&self) -> Vec<String> {
        self.inner.catalog.names()
    }

    /// Opens a registered logical file.
    pub async fn open(&self, name: &str) -> StorageResult<SafFile<D>> {
        let entry = self
            .inner
            .catalog
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound {
                name: name.to_string(),
            })?;
        if entry.layout != self.inner.layout {
            return Err(StorageError::config(format!(
                "'{}' was written with {:?} but the data root now uses {:?}; re-import it",
                name, entry.layout, self.inner.layout
            )));
        }

        let file = match self.inner.files.entry(name.to_string()) {
            Entry::Occupied(e) => Arc::clone(e.get()),
            Entry::Vacant(v) => Arc::clone(&v.insert(Arc::new(LogicalFile::new(&entry)))),
        };
        file.handles.fetch_add(1, Ordering::AcqRel);
        let handle = SafFile {
            safs: Arc::clone(&self.inner),
            file,
            released: false,
        };

        for dev in self.inner.scheduler.devices().iter() {
            dev.backend().open_part(entry.id, name).await?;
        }
        debug!("Opened {} ({})", name, entry.id);
        Ok(handle)
    }

    /// Registers an empty logical file and opens it.
    ///
    /// Fails with [`StorageError::DuplicateImport`] if the name is taken.
    pub async fn create(&self, name: &str) -> StorageResult<SafFile<D>> {
        self.inner.config.validate_file_name(name)?;
        let entry = self.inner.catalog.register(name, self.inner.layout)?;
        let opened = match self.inner.catalog.persist() {
            Ok(()) => self.open(name).await,
            Err(e) => Err(e),
        };
        match opened {
            Ok(file) => {
                info!("Created logical file {} ({})", name, entry.id);
                Ok(file)
            }
            Err(e) => {
                if let Err(cleanup) = self.remove(name).await {
                    warn!("Could not unregister {} after failed create: {}", name, cleanup);
                }
                Err(e)
            }
        }
    }

    /// Unregisters a logical file and deletes its parts.
    ///
    /// Cached pages are dropped without write-back. Handles still open on
    /// the file fail with [`StorageError::FileNotFound`] from then on.
    pub async fn remove(&self, name: &str) -> StorageResult<()> {
        let entry = self
            .inner
            .catalog
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound {
                name: name.to_string(),
            })?;
        if let Some((_, file)) = self.inner.files.remove(name) {
            file.removed.store(true, Ordering::Release);
        }
        self.inner.cache.discard(entry.id);
        self.inner.catalog.remove(name);
        self.inner.catalog.persist()?;
        for dev in self.inner.scheduler.devices().iter() {
            dev.backend().remove_part(entry.id, name).await?;
        }
        info!("Removed logical file {} ({})", name, entry.id);
        Ok(())
    }

    /// Writes back every dirty page and records every file size.
    pub async fn flush_all(&self) -> StorageResult<()> {
        let result = self.inner.cache.flush(FlushScope::All).await;
        let files: Vec<_> = self.inner.files.iter().map(|e| Arc::clone(e.value())).collect();
        for file in files {
            self.inner.record_size(&file)?;
        }
        self.inner.catalog.persist()?;
        result
    }

    /// Flushes everything and emits the statistics report.
    pub async fn shutdown(&self) -> StorageResult<()> {
        let result = self.flush_all().await;
        let stats = self.stats();
        if self.inner.config.print_io_stat {
            stats.log_summary();
        }
        if let Some(path) = self.inner.config.prof_path() {
            stats.write_profile(&path)?;
        }
        info!("SAFS shut down");
        result
    }

    /// Snapshot of all statistics.
    pub fn stats(&self) -> SafsStats {
        SafsStats {
            files: self.inner.catalog.len(),
            open_files: self
                .inner
                .files
                .iter()
                .filter(|e| e.value().handles.load(Ordering::Acquire) > 0)
                .count(),
            io: self.inner.scheduler.stats(),
            cache: self.inner.cache.stats(),
        }
    }
}

impl<D: BlockDevice> SafsInner<D> {
    fn record_size(&self, file: &LogicalFile) -> StorageResult<()> {
        if file.removed.load(Ordering::Acquire) {
            return Ok(());
        }
        let size = file.size.load(Ordering::Acquire);
        let modified = file.modified.load(Ordering::Acquire);
        self.catalog.update(&file.name, |entry| {
            entry.size = size;
            if modified {
                entry.checksum = None;
            }
        })?;
        Ok(())
    }
}

/// An open handle on a logical file.
pub struct SafFile<D> {
    safs: Arc<SafsInner<D>>,
    file: Arc<LogicalFile>,
    /// Set by `close`, which has already given up the handle count.
    released: bool,
}

impl<D: BlockDevice> SafFile<D> {
    /// Logical name.
    pub fn name(&self) -> &str {
        &self.file.name
    }

    /// File id.
    pub fn id(&self) -> FileId {
        self.file.id
    }

    /// Current logical size in bytes.
    pub fn size(&self) -> u64 {
        self.file.size.load(Ordering::Acquire)
    }

    fn check_live(&self) -> StorageResult<()> {
        if self.file.removed.load(Ordering::Acquire) {
            return Err(StorageError::FileNotFound {
                name: self.file.name.clone(),
            });
        }
        Ok(())
    }

    /// Reads `len` bytes at `offset`. The range must lie inside the file.
    ///
    /// Pages are fetched concurrently; misses go to the devices.
    pub async fn read(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.check_live()?;
        if len == 0 {
            return Ok(Vec::new());
        }
        let size = self.size();
        match offset.checked_add(len as u64) {
            Some(end) if end <= size => {}
            _ => {
                return Err(StorageError::OutOfRange {
                    offset,
                    len: len as u64,
                    size,
                })
            }
        }

        let mut out = vec![0u8; len];
        let mut tasks = JoinSet::new();
        let mut pos = 0;
        for (index, in_page, n) in page_spans(offset, len as u64, self.safs.layout.page_size) {
            let cache = self.safs.cache.clone();
            let page = PageId::new(self.file.id, index);
            let at = pos;
            pos += n;
            tasks.spawn(async move {
                let guard = cache.fetch(page).await?;
                let bytes = guard.bytes()[in_page..in_page + n].to_vec();
                Ok::<_, StorageError>((at, bytes))
            });
        }
        while let Some(joined) = tasks.join_next().await {
            let (at, bytes) = joined.map_err(|e| StorageError::Io(std::io::Error::other(e)))??;
            out[at..at + bytes.len()].copy_from_slice(&bytes);
        }
        Ok(out)
    }

    /// Writes `bytes` at `offset`, extending the file if needed.
    ///
    /// Returns once the pages are dirty in the cache; use [`SafFile::flush`]
    /// to wait for the devices.
    pub async fn write(&self, offset: u64, bytes: &[u8]) -> StorageResult<()> {
        self.check_live()?;
        if bytes.is_empty() {
            return Ok(());
        }
        let end = offset
            .checked_add(bytes.len() as u64)
            .ok_or(StorageError::OutOfRange {
                offset,
                len: bytes.len() as u64,
                size: self.size(),
            })?;

        let mut pos = 0;
        for (index, in_page, n) in page_spans(offset, bytes.len() as u64, self.safs.layout.page_size) {
            let page = PageId::new(self.file.id, index);
            self.safs
                .cache
                .put_dirty(page, in_page, &bytes[pos..pos + n])
                .await?;
            pos += n;
        }
        self.file.size.fetch_max(end, Ordering::AcqRel);
        self.file.modified.store(true, Ordering::Release);
        Ok(())
    }

    /// Writes back this file's dirty pages and records its size.
    pub async fn flush(&self) -> StorageResult<()> {
        self.check_live()?;
        let result = self.safs.cache.flush(FlushScope::File(self.file.id)).await;
        self.safs.record_size(&self.file)?;
        self.safs.catalog.persist()?;
        result
    }

    /// Records the checksum of freshly imported contents.
    ///
    /// Must follow a successful flush; later writes clear it again.
    pub(crate) fn seal_import(&self, checksum: u32) -> StorageResult<CatalogEntry> {
        self.check_live()?;
        self.file.modified.store(false, Ordering::Release);
        let size = self.size();
        let entry = self.safs.catalog.update(&self.file.name, |entry| {
            entry.size = size;
            entry.checksum = Some(checksum);
        })?;
        self.safs.catalog.persist()?;
        Ok(entry)
    }

    /// Closes the handle. The last handle on a file flushes it.
    pub async fn close(mut self) -> StorageResult<()> {
        self.released = true;
        let last = self.file.handles.fetch_sub(1, Ordering::AcqRel) == 1;
        if last && !self.file.removed.load(Ordering::Acquire) {
            self.flush().await?;
        }
        debug!("Closed handle on {}", self.file.name);
        Ok(())
    }
}

impl<D> Drop for SafFile<D> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.file.handles.fetch_sub(1, Ordering::AcqRel) == 1
            && self.file.modified.load(Ordering::Acquire)
            && !self.file.removed.load(Ordering::Acquire)
        {
            // Dirty pages stay in the cache; only the catalog size may lag.
            let size = self.file.size.load(Ordering::Acquire);
            if let Err(e) = self.safs.catalog.update(&self.file.name, |entry| {
                entry.size = entry.size.max(size);
                entry.checksum = None;
            }) {
                warn!("Dropped handle on {}: {}", self.file.name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_engine::MemDevice;
    use crate::raid::RaidPolicy;

    fn config(cache_pages: u64, policy: RaidPolicy) -> SafsConfig {
        SafsConfig {
            raid_mapping: policy,
            io_depth: 4,
            cache_size: cache_pages * 4096,
            num_nodes: 2,
            print_io_stat: false,
            merge_reqs: true,
            raid_block_size: 2,
            cache_wait_ms: 2_000,
            ..Default::default()
        }
    }

    fn safs(devices: usize, cache_pages: u64, policy: RaidPolicy) -> Safs<MemDevice> {
        let set = DeviceSet::new((0..devices).map(|i| (MemDevice::new(), i as u16)).collect()).unwrap();
        Safs::with_devices(config(cache_pages, policy), set, Catalog::in_memory()).unwrap()
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[tokio::test]
    async fn test_unaligned_roundtrip() {
        let safs = safs(3, 64, RaidPolicy::Raid0);
        let file = safs.create("graph").await.unwrap();
        let data = pattern(20_000, 7);
        file.write(1_000, &data).await.unwrap();
        assert_eq!(file.size(), 21_000);

        assert_eq!(file.read(1_000, 20_000).await.unwrap(), data);
        assert_eq!(file.read(5_000, 10).await.unwrap(), data[4_000..4_010].to_vec());
        // The hole before the first write reads as zeros.
        assert_eq!(file.read(0, 1_000).await.unwrap(), vec![0; 1_000]);
    }

    #[tokio::test]
    async fn test_roundtrip_through_eviction() {
        let safs = safs(2, 2, RaidPolicy::Raid5);
        let file = safs.create("big").await.unwrap();
        let data = pattern(16 * 4096 + 123, 3);
        file.write(0, &data).await.unwrap();
        file.flush().await.unwrap();
        assert_eq!(file.read(0, data.len()).await.unwrap(), data);
        assert!(safs.cache().stats().resident_frames <= 2);
    }

    #[tokio::test]
    async fn test_read_bounds() {
        let safs = safs(1, 8, RaidPolicy::Raid0);
        let file = safs.create("f").await.unwrap();
        file.write(0, &[1, 2, 3]).await.unwrap();
        assert!(file.read(100, 0).await.unwrap().is_empty());
        assert!(matches!(
            file.read(2, 2).await,
            Err(StorageError::OutOfRange { offset: 2, len: 2, size: 3 })
        ));
        assert!(matches!(
            file.read(u64::MAX, 1).await,
            Err(StorageError::OutOfRange { .. })
        ));
        file.write(10, &[]).await.unwrap();
        assert_eq!(file.size(), 3);
    }

    #[tokio::test]
    async fn test_handles_share_pages() {
        let safs = safs(2, 8, RaidPolicy::Raid0);
        let a = safs.create("shared").await.unwrap();
        let b = safs.open("shared").await.unwrap();
        a.write(4090, b"hello world").await.unwrap();
        assert_eq!(b.size(), 4101);
        assert_eq!(b.read(4090, 11).await.unwrap(), b"hello world".to_vec());
        assert_eq!(safs.stats().open_files, 1);
        drop(a);
        b.close().await.unwrap();
        assert_eq!(safs.stats().open_files, 0);
        assert_eq!(safs.catalog().get("shared").unwrap().size, 4101);
    }

    #[tokio::test]
    async fn test_last_close_flushes_after_earlier_close() {
        let safs = safs(1, 8, RaidPolicy::Raid0);
        let a = safs.create("pair").await.unwrap();
        let b = safs.open("pair").await.unwrap();
        a.write(0, &[3; 50]).await.unwrap();

        b.close().await.unwrap();
        assert!(safs.cache().dirty_count() > 0);
        a.close().await.unwrap();
        assert_eq!(safs.cache().dirty_count(), 0);
        assert_eq!(safs.catalog().get("pair").unwrap().size, 50);
        assert_eq!(safs.stats().open_files, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_closes_flush_once_all_closed() {
        let safs = safs(2, 8, RaidPolicy::Raid0);
        let a = safs.create("both").await.unwrap();
        let b = safs.open("both").await.unwrap();
        b.write(0, &pattern(5000, 4)).await.unwrap();

        let (ra, rb) = tokio::join!(a.close(), b.close());
        ra.unwrap();
        rb.unwrap();
        assert_eq!(safs.cache().dirty_count(), 0);
        assert_eq!(safs.catalog().get("both").unwrap().size, 5000);
    }

    #[tokio::test]
    async fn test_open_missing_and_duplicate_create() {
        let safs = safs(1, 8, RaidPolicy::Raid0);
        assert!(matches!(
            safs.open("nope").await,
            Err(StorageError::FileNotFound { .. })
        ));
        safs.create("x").await.unwrap();
        assert!(matches!(
            safs.create("x").await,
            Err(StorageError::DuplicateImport { .. })
        ));
        assert!(matches!(
            safs.create("a/b").await,
            Err(StorageError::InvalidName { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_reserved_names() {
        let set = DeviceSet::new(vec![(MemDevice::new(), 0)]).unwrap();
        let config = SafsConfig {
            print_io_stat: true,
            prof_file: "graph.prof".to_string(),
            ..config(8, RaidPolicy::Raid0)
        };
        let safs = Safs::with_devices(config, set, Catalog::in_memory()).unwrap();
        for name in ["graph.prof", CATALOG_FILE_NAME, "safs-catalog.json.tmp"] {
            assert!(
                matches!(safs.create(name).await, Err(StorageError::InvalidName { .. })),
                "{name} accepted"
            );
        }
        assert!(safs.list().is_empty());
    }

    #[tokio::test]
    async fn test_layout_change_requires_reimport() {
        let safs = safs(2, 8, RaidPolicy::Raid0);
        let stale = RaidLayout {
            policy: RaidPolicy::Raid5,
            ..safs.layout()
        };
        safs.catalog().register("old", stale).unwrap();
        assert!(matches!(
            safs.open("old").await,
            Err(StorageError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_invalidates_handles() {
        let safs = safs(2, 8, RaidPolicy::Raid0);
        let file = safs.create("gone").await.unwrap();
        file.write(0, &[1; 100]).await.unwrap();
        safs.remove("gone").await.unwrap();

        assert!(!safs.exists("gone"));
        assert!(matches!(file.read(0, 1).await, Err(StorageError::FileNotFound { .. })));
        assert!(safs.cache().resident_pages().is_empty());
        assert!(matches!(
            safs.remove("gone").await,
            Err(StorageError::FileNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_mirror_roundtrip() {
        let safs = safs(3, 4, RaidPolicy::Mirror);
        let file = safs.create("m").await.unwrap();
        let data = pattern(10 * 4096, 11);
        file.write(0, &data).await.unwrap();
        file.flush().await.unwrap();
        for dev in safs.scheduler().devices().iter() {
            assert_eq!(dev.backend().part_bytes(file.id()), data);
        }
        assert_eq!(file.read(0, data.len()).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_flush_records_size_and_clears_checksum() {
        let safs = safs(1, 8, RaidPolicy::Raid0);
        let file = safs.create("c").await.unwrap();
        safs.catalog().update("c", |e| e.checksum = Some(42)).unwrap();
        file.write(0, &[9; 10]).await.unwrap();
        file.flush().await.unwrap();
        let entry = safs.catalog().get("c").unwrap();
        assert_eq!(entry.size, 10);
        assert_eq!(entry.checksum, None);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_everything() {
        let safs = safs(2, 16, RaidPolicy::Raid0);
        let file = safs.create("s").await.unwrap();
        file.write(0, &pattern(3 * 4096, 1)).await.unwrap();
        assert!(safs.cache().dirty_count() > 0);
        safs.shutdown().await.unwrap();
        assert_eq!(safs.cache().dirty_count(), 0);
        assert_eq!(safs.stats().files, 1);
    }
}
