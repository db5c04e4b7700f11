//! Process configuration for the storage engine.
//!
//! The configuration is a flat `key=value` file read once at startup.
//! Parsing produces an explicit [`SafsConfig`] that is passed by handle to
//! each component; there is no process-wide mutable settings object.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::ReplacementPolicy;
use crate::catalog::validate_name;
use crate::device::DeviceConfig;
use crate::error::{StorageError, StorageResult};
use crate::file_manager::ImportPolicy;
use crate::raid::RaidPolicy;

/// Name of the catalog file kept in the data root.
pub const CATALOG_FILE_NAME: &str = "safs-catalog.json";

/// Temporary name the catalog is written under before the rename.
pub const CATALOG_TMP_NAME: &str = "safs-catalog.json.tmp";

/// Storage engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafsConfig {
    /// Striping policy (`RAID_mapping`).
    pub raid_mapping: RaidPolicy,
    /// Maximum in-flight requests per device (`io_depth`).
    pub io_depth: usize,
    /// Page cache capacity in bytes (`cache_size`).
    pub cache_size: u64,
    /// Number of NUMA nodes the cache is partitioned across (`num_nodes`).
    pub num_nodes: usize,
    /// Data root directory, or a file listing `node:path` device roots (`root_conf`).
    pub root_conf: PathBuf,
    /// Worker thread count (`threads`).
    pub threads: usize,
    /// Log and dump I/O statistics at shutdown (`print_io_stat`).
    pub print_io_stat: bool,
    /// Statistics output path (`prof_file`). Empty disables the dump.
    pub prof_file: String,
    /// Merge adjacent/overlapping queued requests (`merge_reqs`).
    pub merge_reqs: bool,
    /// Page size in bytes (`page_size`).
    pub page_size: u64,
    /// Stripe unit in pages (`RAID_block_size`).
    pub raid_block_size: u64,
    /// Frames per cache set (`cache_assoc`).
    pub cache_assoc: usize,
    /// Replacement policy inside a set (`cache_policy`).
    pub cache_policy: ReplacementPolicy,
    /// Behavior when a logical name is imported twice (`import_policy`).
    pub import_policy: ImportPolicy,
    /// How long a miss waits for a pinned set before failing (`cache_wait_ms`).
    pub cache_wait_ms: u64,
}

impl Default for SafsConfig {
    /// Mirrors the default configuration file layout.
    fn default() -> Self {
        Self {
            raid_mapping: RaidPolicy::Raid0,
            io_depth: 64,
            cache_size: 4 << 30,
            num_nodes: 4,
            root_conf: PathBuf::new(),
            threads: 4,
            print_io_stat: true,
            prof_file: "graph.prof".to_string(),
            merge_reqs: true,
            page_size: 4096,
            raid_block_size: 16,
            cache_assoc: 8,
            cache_policy: ReplacementPolicy::Lru,
            import_policy: ImportPolicy::Idempotent,
            cache_wait_ms: 30_000,
        }
    }
}

/// Parses a byte size with an optional binary `K`/`M`/`G`/`T` suffix.
pub fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let (digits, shift) = match value.chars().last()? {
        'k' | 'K' => (&value[..value.len() - 1], 10),
        'm' | 'M' => (&value[..value.len() - 1], 20),
        'g' | 'G' => (&value[..value.len() - 1], 30),
        't' | 'T' => (&value[..value.len() - 1], 40),
        _ => (value, 0),
    };
    let n: u64 = digits.parse().ok()?;
    n.checked_mul(1u64 << shift)
}

fn parse_uint<T: FromStr>(key: &str, value: &str) -> StorageResult<T> {
    value.parse().map_err(|_| {
        StorageError::config(format!("'{}' expects an unsigned integer, got '{}'", key, value))
    })
}

impl SafsConfig {
    /// Parses configuration text.
    ///
    /// Keys not present keep their defaults, except the presence flags
    /// (`print_io_stat`, `merge_reqs`) which are off unless listed.
    pub fn parse(text: &str) -> StorageResult<Self> {
        let mut config = SafsConfig {
            print_io_stat: false,
            merge_reqs: false,
            ..Default::default()
        };

        for raw in text.lines() {
            let line: String = raw.split_whitespace().collect();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once('=') {
                Some((k, v)) => (k, v),
                None => (line.as_str(), ""),
            };
            config.apply(key, value)?;
        }

        config.validate()?;
        debug!(?config, "parsed configuration");
        Ok(config)
    }

    /// Reads and parses a configuration file.
    pub fn from_file(path: &Path) -> StorageResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            StorageError::config(format!("cannot read '{}': {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    fn apply(&mut self, key: &str, value: &str) -> StorageResult<()> {
        match key {
            "RAID_mapping" => self.raid_mapping = value.parse()?,
            "io_depth" => self.io_depth = parse_uint(key, value)?,
            "cache_size" => {
                self.cache_size = parse_size(value).ok_or_else(|| {
                    StorageError::config(format!("'cache_size' expects a size like 4G, got '{}'", value))
                })?
            }
            "num_nodes" => self.num_nodes = parse_uint(key, value)?,
            "root_conf" => self.root_conf = PathBuf::from(value),
            "threads" => self.threads = parse_uint(key, value)?,
            "print_io_stat" => self.print_io_stat = true,
            "prof_file" => self.prof_file = value.to_string(),
            "merge_reqs" => self.merge_reqs = true,
            "page_size" => {
                self.page_size = parse_size(value).ok_or_else(|| {
                    StorageError::config(format!("'page_size' expects a size, got '{}'", value))
                })?
            }
            "RAID_block_size" => self.raid_block_size = parse_uint(key, value)?,
            "cache_assoc" => self.cache_assoc = parse_uint(key, value)?,
            "cache_policy" => self.cache_policy = value.parse()?,
            "import_policy" => self.import_policy = value.parse()?,
            "cache_wait_ms" => self.cache_wait_ms = parse_uint(key, value)?,
            _ => warn!(key, value, "ignoring unknown configuration key"),
        }
        Ok(())
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> StorageResult<()> {
        if self.io_depth == 0 {
            return Err(StorageError::config("io_depth must be at least 1"));
        }
        if self.num_nodes == 0 {
            return Err(StorageError::config("num_nodes must be at least 1"));
        }
        if self.threads == 0 {
            return Err(StorageError::config("threads must be at least 1"));
        }
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(StorageError::config(format!(
                "page_size must be a power of two, got {}",
                self.page_size
            )));
        }
        if self.raid_block_size == 0 {
            return Err(StorageError::config("RAID_block_size must be at least 1"));
        }
        if self.cache_assoc == 0 {
            return Err(StorageError::config("cache_assoc must be at least 1"));
        }
        if self.cache_size < self.page_size {
            return Err(StorageError::config(format!(
                "cache_size {} is smaller than one page ({})",
                self.cache_size, self.page_size
            )));
        }
        Ok(())
    }

    /// Hard ceiling on resident frames.
    pub fn total_frames(&self) -> usize {
        (self.cache_size / self.page_size) as usize
    }

    /// Stripe unit in bytes.
    pub fn stripe_unit_bytes(&self) -> u64 {
        self.raid_block_size * self.page_size
    }

    /// Time a miss waits on a fully pinned set.
    pub fn cache_wait(&self) -> Duration {
        Duration::from_millis(self.cache_wait_ms)
    }

    /// Directory holding the catalog and statistics output.
    pub fn data_root(&self) -> PathBuf {
        if self.root_conf.is_file() {
            self.root_conf
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default()
        } else {
            self.root_conf.clone()
        }
    }

    /// Checks a logical file name against [`validate_name`] and against
    /// the statistics dump, which shares the data root with the parts.
    pub fn validate_file_name(&self, name: &str) -> StorageResult<()> {
        validate_name(name)?;
        if Path::new(&self.prof_file).file_name() == Some(OsStr::new(name)) {
            return Err(StorageError::InvalidName {
                name: name.to_string(),
                reason: "name is reserved for the statistics dump",
            });
        }
        Ok(())
    }

    /// Location of the statistics dump, if enabled.
    pub fn prof_path(&self) -> Option<PathBuf> {
        if !self.print_io_stat || self.prof_file.is_empty() {
            return None;
        }
        let path = PathBuf::from(&self.prof_file);
        if path.is_absolute() {
            Some(path)
        } else {
            Some(self.data_root().join(path))
        }
    }

    /// Resolves the device topology from `root_conf`.
    ///
    /// A directory is a single device on NUMA node 0. A file lists one
    /// `node_id:path` device root per line; relative paths resolve against
    /// the file's directory.
    pub fn device_configs(&self) -> StorageResult<Vec<DeviceConfig>> {
        if self.root_conf.as_os_str().is_empty() {
            return Err(StorageError::config("root_conf is not set"));
        }
        if self.root_conf.is_dir() {
            return Ok(vec![DeviceConfig::new(self.root_conf.clone(), 0, 0)]);
        }
        let text = std::fs::read_to_string(&self.root_conf).map_err(|e| {
            StorageError::config(format!(
                "cannot read root_conf '{}': {}",
                self.root_conf.display(),
                e
            ))
        })?;
        let base = self.data_root();

        let mut devices = Vec::new();
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (node, path) = line.split_once(':').ok_or_else(|| {
                StorageError::config(format!("root_conf line '{}' is not node:path", line))
            })?;
            let numa_node: u16 = parse_uint("root_conf node", node.trim())?;
            let path = PathBuf::from(path.trim());
            let path = if path.is_absolute() { path } else { base.join(path) };
            let idx = u16::try_from(devices.len())
                .map_err(|_| StorageError::config("too many devices in root_conf"))?;
            devices.push(DeviceConfig::new(path, idx, numa_node));
        }

        if devices.is_empty() {
            return Err(StorageError::config("root_conf lists zero devices"));
        }
        Ok(devices)
    }
}
