//! Device backends.
//!
//! This module provides a trait-based abstraction ([`BlockDevice`]) for
//! positional device I/O, with a file-backed implementation for real data
//! roots and an in-memory implementation for testing. A device holds one
//! part per logical file; each part is an independent linear byte space.

use std::collections::HashMap;
use std::future::Future;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};
use crate::page::FileId;

/// Trait for the device abstraction.
/// Implementations can be file-backed or in-memory for testing.
pub trait BlockDevice: Send + Sync + 'static {
    /// Prepare the part holding `file`'s bytes on this device.
    fn open_part(&self, file: FileId, name: &str) -> impl Future<Output = StorageResult<()>> + Send;

    /// Read `len` bytes at `offset` of `file`'s part. Unwritten bytes read as zero.
    fn read_at(
        &self,
        file: FileId,
        offset: u64,
        len: usize,
    ) -> impl Future<Output = StorageResult<Vec<u8>>> + Send;

    /// Write `data` at `offset` of `file`'s part.
    fn write_at(
        &self,
        file: FileId,
        offset: u64,
        data: Vec<u8>,
    ) -> impl Future<Output = StorageResult<()>> + Send;

    /// Make completed writes to `file`'s part durable.
    fn sync(&self, file: FileId) -> impl Future<Output = StorageResult<()>> + Send;

    /// Delete `file`'s part.
    fn remove_part(&self, file: FileId, name: &str) -> impl Future<Output = StorageResult<()>> + Send;

    /// Capacity bound, if the device has one.
    fn capacity_bytes(&self) -> Option<u64>;
}

/// Directory-backed device. Each logical file is stored as `<root>/<name>`.
pub struct FileDevice {
    root: PathBuf,
    parts: DashMap<FileId, Arc<std::fs::File>>,
    capacity: Option<u64>,
}

impl FileDevice {
    /// Opens (creating if needed) a device rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        info!("Opened device root {}", root.display());
        Ok(Self {
            root,
            parts: DashMap::new(),
            capacity: None,
        })
    }

    /// Bounds the bytes addressable on this device.
    pub fn with_capacity(mut self, capacity_bytes: u64) -> Self {
        self.capacity = Some(capacity_bytes);
        self
    }

    /// Returns the device root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn part(&self, file: FileId) -> StorageResult<Arc<std::fs::File>> {
        self.parts
            .get(&file)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| {
                StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} has no open part on {}", file, self.root.display()),
                ))
            })
    }

    fn check_capacity(&self, offset: u64, len: usize) -> StorageResult<()> {
        match self.capacity {
            Some(cap) if offset + len as u64 > cap => Err(StorageError::Io(std::io::Error::other(
                format!("write to {}+{} exceeds device capacity {}", offset, len, cap),
            ))),
            _ => Ok(()),
        }
    }
}

async fn blocking<T, F>(f: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(std::io::Error::other)?
        .map_err(StorageError::from)
}

impl BlockDevice for FileDevice {
    async fn open_part(&self, file: FileId, name: &str) -> StorageResult<()> {
        if self.parts.contains_key(&file) {
            return Ok(());
        }
        let path = self.root.join(name);
        let handle = blocking(move || {
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
        })
        .await?;
        debug!("Opened part {} for {} on {}", name, file, self.root.display());
        self.parts.insert(file, Arc::new(handle));
        Ok(())
    }

    async fn read_at(&self, file: FileId, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let part = self.part(file)?;
        blocking(move || {
            let mut buf = vec![0u8; len];
            let mut done = 0;
            while done < len {
                let n = part.read_at(&mut buf[done..], offset + done as u64)?;
                if n == 0 {
                    // Past the end of the part: the rest stays zero.
                    break;
                }
                done += n;
            }
            Ok(buf)
        })
        .await
    }

    async fn write_at(&self, file: FileId, offset: u64, data: Vec<u8>) -> StorageResult<()> {
        self.check_capacity(offset, data.len())?;
        let part = self.part(file)?;
        blocking(move || part.write_all_at(&data, offset)).await
    }

    async fn sync(&self, file: FileId) -> StorageResult<()> {
        let part = self.part(file)?;
        blocking(move || part.sync_data()).await
    }

    async fn remove_part(&self, file: FileId, name: &str) -> StorageResult<()> {
        self.parts.remove(&file);
        let path = self.root.join(name);
        blocking(move || match std::fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        })
        .await
    }

    fn capacity_bytes(&self) -> Option<u64> {
        self.capacity
    }
}

/// Kind of a recorded [`MemDevice`] event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventKind {
    /// A read was issued.
    ReadStart,
    /// A read returned.
    ReadDone,
    /// A write was issued.
    WriteStart,
    /// A write became visible.
    WriteDone,
}

/// One recorded [`MemDevice`] operation boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceEvent {
    /// What happened.
    pub kind: DeviceEventKind,
    /// Target part.
    pub file: FileId,
    /// Byte offset in the part.
    pub offset: u64,
    /// Length in bytes.
    pub len: usize,
}

/// In-memory device for testing.
/// Stores sparse parts in a HashMap and records every operation boundary.
pub struct MemDevice {
    parts: Mutex<HashMap<FileId, Vec<u8>>>,
    capacity: Option<u64>,
    read_latency: Duration,
    write_latency: Duration,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    events: Mutex<Vec<DeviceEvent>>,
}

impl MemDevice {
    /// Create an unbounded in-memory device.
    pub fn new() -> Self {
        Self {
            parts: Mutex::new(HashMap::new()),
            capacity: None,
            read_latency: Duration::ZERO,
            write_latency: Duration::ZERO,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Bounds the bytes addressable per part.
    pub fn with_capacity(mut self, capacity_bytes: u64) -> Self {
        self.capacity = Some(capacity_bytes);
        self
    }

    /// Delays every read and write.
    pub fn with_latency(mut self, read: Duration, write: Duration) -> Self {
        self.read_latency = read;
        self.write_latency = write;
        self
    }

    /// Makes subsequent reads fail (or succeed again).
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent writes fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Returns all events recorded so far.
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.events.lock().clone()
    }

    /// Number of completed writes.
    pub fn writes_completed(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == DeviceEventKind::WriteDone)
            .count()
    }

    /// Number of completed reads.
    pub fn reads_completed(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == DeviceEventKind::ReadDone)
            .count()
    }

    /// Raw bytes of a part.
    pub fn part_bytes(&self, file: FileId) -> Vec<u8> {
        self.parts.lock().get(&file).cloned().unwrap_or_default()
    }

    fn record(&self, kind: DeviceEventKind, file: FileId, offset: u64, len: usize) {
        self.events.lock().push(DeviceEvent {
            kind,
            file,
            offset,
            len,
        });
    }
}

impl Default for MemDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDevice for MemDevice {
    async fn open_part(&self, file: FileId, _name: &str) -> StorageResult<()> {
        self.parts.lock().entry(file).or_default();
        Ok(())
    }

    async fn read_at(&self, file: FileId, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.record(DeviceEventKind::ReadStart, file, offset, len);
        if !self.read_latency.is_zero() {
            tokio::time::sleep(self.read_latency).await;
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other("injected read failure")));
        }

        let mut buf = vec![0u8; len];
        {
            let parts = self.parts.lock();
            if let Some(part) = parts.get(&file) {
                let start = (offset as usize).min(part.len());
                let end = (offset as usize + len).min(part.len());
                buf[..end - start].copy_from_slice(&part[start..end]);
            }
        }
        self.record(DeviceEventKind::ReadDone, file, offset, len);
        Ok(buf)
    }

    async fn write_at(&self, file: FileId, offset: u64, data: Vec<u8>) -> StorageResult<()> {
        let len = data.len();
        self.record(DeviceEventKind::WriteStart, file, offset, len);
        if !self.write_latency.is_zero() {
            tokio::time::sleep(self.write_latency).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other("injected write failure")));
        }
        if let Some(cap) = self.capacity {
            if offset + len as u64 > cap {
                return Err(StorageError::Io(std::io::Error::other(format!(
                    "write to {}+{} exceeds device capacity {}",
                    offset, len, cap
                ))));
            }
        }

        {
            let mut parts = self.parts.lock();
            let part = parts.entry(file).or_default();
            let end = offset as usize + len;
            if part.len() < end {
                part.resize(end, 0);
            }
            part[offset as usize..end].copy_from_slice(&data);
        }
        self.record(DeviceEventKind::WriteDone, file, offset, len);
        Ok(())
    }

    async fn sync(&self, _file: FileId) -> StorageResult<()> {
        Ok(())
    }

    async fn remove_part(&self, file: FileId, _name: &str) -> StorageResult<()> {
        self.parts.lock().remove(&file);
        Ok(())
    }

    fn capacity_bytes(&self) -> Option<u64> {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_mem_write_read_roundtrip() {
        let dev = MemDevice::new();
        let file = FileId(1);
        dev.open_part(file, "a").await.unwrap();
        dev.write_at(file, 4096, vec![0xAB; 4096]).await.unwrap();

        let data = dev.read_at(file, 4096, 4096).await.unwrap();
        assert_eq!(data, vec![0xAB; 4096]);

        // Unwritten prefix reads as zero.
        let head = dev.read_at(file, 0, 16).await.unwrap();
        assert_eq!(head, vec![0; 16]);
    }

    #[tokio::test]
    async fn test_mem_read_past_end_is_zero_filled() {
        let dev = MemDevice::new();
        let file = FileId(1);
        dev.write_at(file, 0, vec![7; 10]).await.unwrap();
        let data = dev.read_at(file, 5, 10).await.unwrap();
        assert_eq!(&data[..5], &[7; 5]);
        assert_eq!(&data[5..], &[0; 5]);
    }

    #[tokio::test]
    async fn test_mem_injected_failures() {
        let dev = MemDevice::new();
        let file = FileId(1);
        dev.set_fail_writes(true);
        assert!(dev.write_at(file, 0, vec![1; 8]).await.is_err());
        dev.set_fail_writes(false);
        dev.write_at(file, 0, vec![1; 8]).await.unwrap();

        dev.set_fail_reads(true);
        assert!(dev.read_at(file, 0, 8).await.is_err());
    }

    #[tokio::test]
    async fn test_mem_capacity_bound() {
        let dev = MemDevice::new().with_capacity(8192);
        let file = FileId(1);
        dev.write_at(file, 4096, vec![1; 4096]).await.unwrap();
        assert!(dev.write_at(file, 8192, vec![1; 1]).await.is_err());
        assert_eq!(dev.capacity_bytes(), Some(8192));
    }

    #[tokio::test]
    async fn test_mem_event_log() {
        let dev = MemDevice::new();
        let file = FileId(3);
        dev.write_at(file, 0, vec![1; 4]).await.unwrap();
        dev.read_at(file, 0, 4).await.unwrap();

        let kinds: Vec<_> = dev.events().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                DeviceEventKind::WriteStart,
                DeviceEventKind::WriteDone,
                DeviceEventKind::ReadStart,
                DeviceEventKind::ReadDone
            ]
        );
        assert_eq!(dev.writes_completed(), 1);
        assert_eq!(dev.reads_completed(), 1);
    }

    #[tokio::test]
    async fn test_file_device_roundtrip() {
        let dir = TempDir::new().unwrap();
        let dev = FileDevice::new(dir.path().join("disk0")).unwrap();
        let file = FileId(1);
        dev.open_part(file, "graph.adj").await.unwrap();

        dev.write_at(file, 8192, vec![0x5A; 4096]).await.unwrap();
        dev.sync(file).await.unwrap();

        assert_eq!(dev.read_at(file, 8192, 4096).await.unwrap(), vec![0x5A; 4096]);
        // Hole before the write and tail past EOF read as zero.
        assert_eq!(dev.read_at(file, 0, 4096).await.unwrap(), vec![0; 4096]);
        assert_eq!(dev.read_at(file, 12288, 100).await.unwrap(), vec![0; 100]);
        assert!(dir.path().join("disk0").join("graph.adj").exists());
    }

    #[tokio::test]
    async fn test_file_device_unopened_part() {
        let dir = TempDir::new().unwrap();
        let dev = FileDevice::new(dir.path()).unwrap();
        assert!(dev.read_at(FileId(9), 0, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_file_device_remove_part() {
        let dir = TempDir::new().unwrap();
        let dev = FileDevice::new(dir.path()).unwrap();
        let file = FileId(1);
        dev.open_part(file, "x").await.unwrap();
        dev.write_at(file, 0, vec![1; 10]).await.unwrap();
        dev.remove_part(file, "x").await.unwrap();
        assert!(!dir.path().join("x").exists());
        // Removing twice is fine.
        dev.remove_part(file, "x").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_device_capacity() {
        let dir = TempDir::new().unwrap();
        let dev = FileDevice::new(dir.path()).unwrap().with_capacity(4096);
        let file = FileId(1);
        dev.open_part(file, "cap").await.unwrap();
        assert!(dev.write_at(file, 4096, vec![0; 1]).await.is_err());
    }
}
