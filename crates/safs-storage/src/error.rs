//! Error types for the storage subsystem.

use std::path::PathBuf;

use thiserror::Error;

use crate::page::IoDirection;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error variants for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Wraps standard I/O errors that are not tied to a specific device request.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Missing or invalid settings. Fatal at startup.
    #[error("Configuration error: {reason}")]
    Configuration {
        /// Description of the problem.
        reason: String,
    },

    /// A device-level read or write failed.
    #[error("Device I/O error on device {device} at offset {offset} ({direction}): {reason}")]
    DeviceIo {
        /// Index of the device that failed.
        device: u16,
        /// Physical byte offset of the failed operation.
        offset: u64,
        /// Direction of the failed operation.
        direction: IoDirection,
        /// Description of the failure.
        reason: String,
    },

    /// The logical name is already registered with a different source.
    #[error("Duplicate import: logical file '{name}' already exists")]
    DuplicateImport {
        /// The logical name that collided.
        name: String,
    },

    /// The external file to import does not exist.
    #[error("Source not found: {}", path.display())]
    SourceNotFound {
        /// The missing source path.
        path: PathBuf,
    },

    /// No frame in the cache set could be freed before the wait timed out.
    #[error("Cache exhausted: all {frames} frames of set {set} in partition {partition} are pinned")]
    CacheExhausted {
        /// NUMA partition index.
        partition: usize,
        /// Set index inside the partition.
        set: usize,
        /// Number of frames in the set.
        frames: usize,
    },

    /// The logical file is not registered.
    #[error("Logical file not found: {name}")]
    FileNotFound {
        /// The requested logical name.
        name: String,
    },

    /// The logical name cannot be used as a file name on a device.
    #[error("Invalid logical name '{name}': {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A read reached past the end of a logical file.
    #[error("Out of range: {offset}+{len} exceeds file size {size}")]
    OutOfRange {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: u64,
        /// Current logical size.
        size: u64,
    },

    /// The request was cancelled before it reached a device.
    #[error("I/O request {id} cancelled before dispatch")]
    Cancelled {
        /// Scheduler request id.
        id: u64,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {reason}")]
    Serialization {
        /// Description of the error.
        reason: String,
    },
}

impl StorageError {
    /// Shorthand for a [`StorageError::Configuration`].
    pub fn config(reason: impl Into<String>) -> Self {
        StorageError::Configuration {
            reason: reason.into(),
        }
    }

    /// Returns true for transient failures the caller may retry.
    ///
    /// Configuration, naming and import errors are structural: retrying
    /// the same call cannot succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::DeviceIo { .. }
                | StorageError::CacheExhausted { .. }
                | StorageError::Cancelled { .. }
                | StorageError::Io(_)
        )
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization {
            reason: e.to_string(),
        }
    }
}
