#![warn(missing_docs)]

//! SAFS storage core: multi-device set-associative files over a NUMA-partitioned page cache
//!
//! This crate stores logical files too large for memory across several
//! devices. Pages are striped or mirrored by a RAID mapper, moved by a
//! per-device asynchronous scheduler that merges adjacent requests, and
//! cached in a set-associative cache partitioned by NUMA node.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod device;
pub mod error;
pub mod file_manager;
pub mod io_engine;
pub mod io_scheduler;
pub mod metrics;
pub mod page;
pub mod raid;
pub mod saf;

pub use cache::{CacheStats, FlushScope, PageCache, PageCacheConfig, PageGuard, ReplacementPolicy};
pub use catalog::{validate_name, Catalog, CatalogEntry};
pub use config::{parse_size, SafsConfig, CATALOG_FILE_NAME, CATALOG_TMP_NAME};
pub use device::{DeviceConfig, DeviceSet, ManagedDevice};
pub use error::{StorageError, StorageResult};
pub use file_manager::{FileManager, ImportPolicy, ImportReport};
pub use io_engine::{BlockDevice, DeviceEvent, DeviceEventKind, FileDevice, MemDevice};
pub use io_scheduler::{IoCompletion, IoRequest, IoRequestId, IoScheduler, IoSchedulerConfig, IoSchedulerStats, IoTicket};
pub use metrics::SafsStats;
pub use page::{page_spans, ByteRange, FileId, IoDirection, PageId};
pub use raid::{PhysicalLocation, RaidLayout, RaidMapper, RaidPolicy};
pub use saf::{SafFile, Safs};
