//! I/O statistics reporting.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::CacheStats;
use crate::error::StorageResult;
use crate::io_scheduler::IoSchedulerStats;

/// Combined statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SafsStats {
    /// Registered logical files
    pub files: usize,
    /// Logical files with at least one open handle
    pub open_files: usize,
    /// Scheduler counters
    pub io: IoSchedulerStats,
    /// Cache counters
    pub cache: CacheStats,
}

impl SafsStats {
    /// Logs the snapshot at info level.
    pub fn log_summary(&self) {
        info!(
            "I/O stats: submitted={}, dispatched={}, merged={}, cancelled={}, failed={}, \
             read={}B, written={}B, per_device={:?}",
            self.io.submitted,
            self.io.dispatched,
            self.io.merged,
            self.io.cancelled,
            self.io.failed,
            self.io.bytes_read,
            self.io.bytes_written,
            self.io.per_device_ops
        );
        info!(
            "Cache stats: hits={}, misses={}, hit_rate={:.3}, evictions={}, writebacks={}, \
             failed_writebacks={}, resident={}/{}",
            self.cache.hits,
            self.cache.misses,
            self.cache.hit_rate(),
            self.cache.evictions,
            self.cache.writebacks,
            self.cache.failed_writebacks,
            self.cache.resident_frames,
            self.cache.capacity_frames
        );
    }

    /// Writes the snapshot as pretty JSON.
    pub fn write_profile(&self, path: &Path) -> StorageResult<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        info!("Wrote I/O profile to {}", path.display());
        Ok(())
    }
}
