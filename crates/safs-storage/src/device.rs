//! Device set management.
//!
//! A device set is the registered collection of storage devices, each
//! addressed as its own byte space and tagged with the NUMA node it is
//! attached to. Membership is fixed at configuration load; only the
//! outstanding-request counters change afterwards.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::io_engine::{BlockDevice, FileDevice};

/// Configuration for one device in the set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device root path
    pub path: PathBuf,
    /// Device index in the set (0-based)
    pub device_idx: u16,
    /// NUMA node the device is attached to
    pub numa_node: u16,
}

impl DeviceConfig {
    /// Create a new DeviceConfig with the given parameters.
    pub fn new(path: PathBuf, device_idx: u16, numa_node: u16) -> Self {
        Self {
            path,
            device_idx,
            numa_node,
        }
    }
}

/// A registered device with its backend and request bookkeeping.
pub struct ManagedDevice<D> {
    /// Device configuration
    pub config: DeviceConfig,
    backend: D,
    outstanding: AtomicUsize,
}

impl<D: BlockDevice> ManagedDevice<D> {
    /// Wrap a backend.
    pub fn new(config: DeviceConfig, backend: D) -> Self {
        Self {
            config,
            backend,
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Device index.
    pub fn idx(&self) -> u16 {
        self.config.device_idx
    }

    /// NUMA affinity.
    pub fn numa_node(&self) -> u16 {
        self.config.numa_node
    }

    /// Backend handle.
    pub fn backend(&self) -> &D {
        &self.backend
    }

    /// Capacity in bytes, if bounded.
    pub fn capacity_bytes(&self) -> Option<u64> {
        self.backend.capacity_bytes()
    }

    /// Requests submitted to this device and not yet completed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub(crate) fn begin_request(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn end_request(&self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The fixed set of devices backing a data root.
pub struct DeviceSet<D> {
    devices: Vec<Arc<ManagedDevice<D>>>,
}

// Manual impl: a derive would require `D: Clone`.
impl<D> Clone for DeviceSet<D> {
    fn clone(&self) -> Self {
        Self {
            devices: self.devices.clone(),
        }
    }
}

impl<D: BlockDevice> DeviceSet<D> {
    /// Builds a set from backends. Indices are assigned in order.
    ///
    /// An empty set is a fatal configuration error.
    pub fn new(devices: Vec<(D, u16)>) -> StorageResult<Self> {
        if devices.is_empty() {
            return Err(StorageError::config("device set needs at least one device"));
        }
        if devices.len() > u16::MAX as usize {
            return Err(StorageError::config("too many devices"));
        }
        let devices = devices
            .into_iter()
            .enumerate()
            .map(|(idx, (backend, numa_node))| {
                let config = DeviceConfig::new(
                    PathBuf::from(format!("device{}", idx)),
                    idx as u16,
                    numa_node,
                );
                debug!("Registering device {} on NUMA node {}", idx, numa_node);
                Arc::new(ManagedDevice::new(config, backend))
            })
            .collect();
        Ok(Self { devices })
    }

    /// Get a device by index.
    pub fn device(&self, idx: u16) -> Option<&Arc<ManagedDevice<D>>> {
        self.devices.get(idx as usize)
    }

    /// Returns the number of devices in the set.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Always false: an empty set cannot be constructed.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Returns an iterator over all devices.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ManagedDevice<D>>> {
        self.devices.iter()
    }

    /// NUMA node of a device (0 for unknown indices).
    pub fn numa_node(&self, idx: u16) -> u16 {
        self.device(idx).map(|d| d.numa_node()).unwrap_or(0)
    }
}

impl DeviceSet<FileDevice> {
    /// Opens directory-backed devices for each configured root.
    pub fn open(configs: &[DeviceConfig]) -> StorageResult<Self> {
        if configs.is_empty() {
            return Err(StorageError::config("device set needs at least one device"));
        }
        let mut devices = Vec::with_capacity(configs.len());
        for (pos, config) in configs.iter().enumerate() {
            if config.device_idx as usize != pos {
                return Err(StorageError::config(format!(
                    "device {} listed at position {}",
                    config.device_idx, pos
                )));
            }
            let backend = FileDevice::new(&config.path)?;
            devices.push(Arc::new(ManagedDevice::new(config.clone(), backend)));
        }
        Ok(Self { devices })
    }
}
