//! Per-device asynchronous I/O scheduler with request merging.
//!
//! Every device owns a FIFO queue of pending operations and a bounded set
//! of in-flight operations (`io_depth`). Submission is synchronous and only
//! appends to the queue, so the order in which callers submit is the order
//! in which overlapping requests reach the device. Completion is delivered
//! through a per-request channel.
//!
//! Dispatch rules:
//! - at most `io_depth` operations are in flight per device;
//! - the queue head is not dispatched while it overlaps an in-flight
//!   operation on the same part, unless both are reads;
//! - with merging enabled, a new request is folded into a queued operation
//!   on the same part and direction whose range it overlaps or touches,
//!   provided no queued operation in between overlaps it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::device::DeviceSet;
use crate::error::{StorageError, StorageResult};
use crate::io_engine::BlockDevice;
use crate::page::{ByteRange, FileId, IoDirection, PageId};
use crate::raid::{PhysicalLocation, RaidMapper};

const STATE_PENDING: u8 = 0;
const STATE_DISPATCHED: u8 = 1;
const STATE_CANCELLED: u8 = 2;

/// Represents a scheduler request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IoRequestId(pub u64);

/// Configuration for the I/O scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoSchedulerConfig {
    /// Maximum concurrent in-flight operations per device.
    pub io_depth: usize,
    /// Whether queued requests may be merged.
    pub merge_reqs: bool,
    /// Upper bound on the size of a merged operation.
    pub max_merge_bytes: u64,
}

impl Default for IoSchedulerConfig {
    fn default() -> Self {
        Self {
            io_depth: 64,
            merge_reqs: false,
            max_merge_bytes: 1 << 20,
        }
    }
}

/// A page-granular read or write.
#[derive(Debug, Clone)]
pub struct IoRequest {
    /// Target page.
    pub page: PageId,
    /// Direction.
    pub direction: IoDirection,
    /// Page contents for writes.
    pub data: Option<Vec<u8>>,
}

impl IoRequest {
    /// Read one page.
    pub fn read(page: PageId) -> Self {
        Self {
            page,
            direction: IoDirection::Read,
            data: None,
        }
    }

    /// Write one full page.
    pub fn write(page: PageId, data: Vec<u8>) -> Self {
        Self {
            page,
            direction: IoDirection::Write,
            data: Some(data),
        }
    }
}

/// Result of a completed request.
#[derive(Debug)]
pub struct IoCompletion {
    /// Request that completed.
    pub id: IoRequestId,
    /// Page that was transferred.
    pub page: PageId,
    /// Physical range of the page on its first location.
    pub range: ByteRange,
    /// Page bytes, for reads.
    pub data: Option<Vec<u8>>,
}

/// Statistics for the I/O scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoSchedulerStats {
    /// Requests accepted by `submit`.
    pub submitted: u64,
    /// Requests folded into an already queued operation.
    pub merged: u64,
    /// Device operations started.
    pub dispatched: u64,
    /// Requests dropped because they were cancelled before dispatch.
    pub cancelled: u64,
    /// Request parts completed successfully.
    pub completed: u64,
    /// Request parts completed with a device error.
    pub failed: u64,
    /// Bytes transferred from devices.
    pub bytes_read: u64,
    /// Bytes transferred to devices.
    pub bytes_written: u64,
    /// Device operations started, per device.
    pub per_device_ops: Vec<u64>,
}

#[derive(Default)]
struct SchedulerCounters {
    submitted: AtomicU64,
    merged: AtomicU64,
    dispatched: AtomicU64,
    cancelled: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

type PartResult = StorageResult<Option<Vec<u8>>>;

/// One requester's share of a device operation.
struct Part {
    id: IoRequestId,
    range: ByteRange,
    data: Vec<u8>,
    state: Arc<AtomicU8>,
    tx: oneshot::Sender<PartResult>,
}

impl Part {
    /// Marks the part dispatched. Returns false if it was cancelled first.
    fn claim(&self) -> bool {
        match self
            .state
            .compare_exchange(STATE_PENDING, STATE_DISPATCHED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            // A mirror replica of this request was already dispatched.
            Err(current) => current == STATE_DISPATCHED,
        }
    }
}

/// A queued or in-flight device operation covering one contiguous range.
struct DeviceOp {
    file: FileId,
    direction: IoDirection,
    range: ByteRange,
    /// Parts in arrival order.
    parts: Vec<Part>,
}

impl DeviceOp {
    fn new(file: FileId, direction: IoDirection, part: Part) -> Self {
        Self {
            file,
            direction,
            range: part.range,
            parts: vec![part],
        }
    }

    fn absorb(&mut self, part: Part) {
        self.range = self.range.union(&part.range);
        self.parts.push(part);
    }

    /// Conflicts with another operation on the same part.
    fn conflicts(&self, file: FileId, direction: IoDirection, range: &ByteRange) -> bool {
        self.file == file
            && self.range.overlaps(range)
            && (self.direction == IoDirection::Write || direction == IoDirection::Write)
    }

    /// Builds the write buffer. Later parts overwrite earlier ones.
    fn assemble(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.range.len() as usize];
        for part in &self.parts {
            let at = (part.range.start - self.range.start) as usize;
            buf[at..at + part.data.len()].copy_from_slice(&part.data);
        }
        buf
    }

    /// Drops cancelled parts and regroups the rest into contiguous runs.
    fn into_runs(self, counters: &SchedulerCounters) -> Vec<DeviceOp> {
        let DeviceOp {
            file,
            direction,
            parts,
            ..
        } = self;

        let mut live: Vec<(usize, Part)> = Vec::with_capacity(parts.len());
        for (arrival, part) in parts.into_iter().enumerate() {
            if part.claim() {
                live.push((arrival, part));
            } else {
                counters.cancelled.fetch_add(1, Ordering::Relaxed);
                debug!("Dropping cancelled IO: id={:?}", part.id);
                let _ = part.tx.send(Err(StorageError::Cancelled { id: part.id.0 }));
            }
        }

        live.sort_by_key(|(_, p)| p.range.start);
        let mut runs: Vec<(ByteRange, Vec<(usize, Part)>)> = Vec::new();
        for (arrival, part) in live {
            match runs.last_mut() {
                Some((range, members)) if range.touches(&part.range) => {
                    *range = range.union(&part.range);
                    members.push((arrival, part));
                }
                _ => runs.push((part.range, vec![(arrival, part)])),
            }
        }

        runs.into_iter()
            .map(|(range, mut members)| {
                members.sort_by_key(|(arrival, _)| *arrival);
                DeviceOp {
                    file,
                    direction,
                    range,
                    parts: members.into_iter().map(|(_, p)| p).collect(),
                }
            })
            .collect()
    }
}

struct InflightOp {
    seq: u64,
    file: FileId,
    direction: IoDirection,
    range: ByteRange,
}

#[derive(Default)]
struct DeviceQueue {
    pending: VecDeque<DeviceOp>,
    inflight: Vec<InflightOp>,
}

impl DeviceQueue {
    fn head_blocked(&self) -> bool {
        match self.pending.front() {
            Some(head) => self
                .inflight
                .iter()
                .any(|f| head.conflicts(f.file, f.direction, &f.range)),
            None => true,
        }
    }

    /// Folds `part` into a queued operation if allowed, otherwise hands it back.
    fn try_merge(
        &mut self,
        file: FileId,
        direction: IoDirection,
        part: Part,
        max_bytes: u64,
    ) -> Option<Part> {
        for op in self.pending.iter_mut().rev() {
            if op.file != file {
                continue;
            }
            if op.direction == direction
                && op.range.touches(&part.range)
                && op.range.union(&part.range).len() <= max_bytes
            {
                op.absorb(part);
                return None;
            }
            if op.conflicts(file, direction, &part.range) {
                break;
            }
        }
        Some(part)
    }
}

struct SchedulerInner<D> {
    config: IoSchedulerConfig,
    devices: DeviceSet<D>,
    mapper: RaidMapper,
    queues: Vec<Mutex<DeviceQueue>>,
    per_device_ops: Vec<AtomicU64>,
    runtime: tokio::runtime::Handle,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    counters: SchedulerCounters,
}

/// Handle to a submitted request.
pub struct IoTicket {
    id: IoRequestId,
    page: PageId,
    direction: IoDirection,
    len: u64,
    state: Arc<AtomicU8>,
    receivers: Vec<(PhysicalLocation, oneshot::Receiver<PartResult>)>,
}

impl IoTicket {
    /// The request id.
    pub fn id(&self) -> IoRequestId {
        self.id
    }

    /// Cancels the request if no part of it has been dispatched yet.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(STATE_PENDING, STATE_CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Waits for every location to complete. The first failure wins.
    pub async fn wait(self) -> StorageResult<IoCompletion> {
        let mut data = None;
        let mut first_error = None;
        let range = self
            .receivers
            .first()
            .map(|(loc, _)| ByteRange::new(loc.offset, self.len))
            .unwrap_or(ByteRange::new(0, 0));

        for (loc, rx) in self.receivers {
            match rx.await {
                Ok(Ok(payload)) => {
                    if let Some(bytes) = payload {
                        data.get_or_insert(bytes);
                    }
                }
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error.get_or_insert(StorageError::DeviceIo {
                        device: loc.device,
                        offset: loc.offset,
                        direction: self.direction,
                        reason: "scheduler dropped the request".to_string(),
                    });
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        Ok(IoCompletion {
            id: self.id,
            page: self.page,
            range,
            data,
        })
    }
}

/// Per-device asynchronous I/O scheduler.
pub struct IoScheduler<D> {
    inner: Arc<SchedulerInner<D>>,
}

impl<D> Clone for IoScheduler<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: BlockDevice> IoScheduler<D> {
    /// Creates a scheduler over `devices`. Must be called inside a tokio runtime.
    pub fn new(
        config: IoSchedulerConfig,
        devices: DeviceSet<D>,
        mapper: RaidMapper,
    ) -> StorageResult<Self> {
        if config.io_depth == 0 {
            return Err(StorageError::config("io_depth must be at least 1"));
        }
        if mapper.layout().num_devices as usize != devices.len() {
            return Err(StorageError::config(format!(
                "mapper spans {} devices but {} are registered",
                mapper.layout().num_devices,
                devices.len()
            )));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| StorageError::config("I/O scheduler requires a tokio runtime"))?;
        debug!(
            "Creating IoScheduler: devices={}, io_depth={}, merge_reqs={}",
            devices.len(),
            config.io_depth,
            config.merge_reqs
        );

        let n = devices.len();
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                config,
                queues: (0..n).map(|_| Mutex::new(DeviceQueue::default())).collect(),
                per_device_ops: (0..n).map(|_| AtomicU64::new(0)).collect(),
                devices,
                mapper,
                runtime,
                next_id: AtomicU64::new(1),
                next_seq: AtomicU64::new(1),
                counters: SchedulerCounters::default(),
            }),
        })
    }

    /// Queues a request and returns immediately.
    ///
    /// Writes go to every location of the page; reads go to the least
    /// loaded location.
    pub fn submit(&self, request: IoRequest) -> StorageResult<IoTicket> {
        let inner = &self.inner;
        let page_size = inner.mapper.layout().page_size;
        let data = match (request.direction, request.data) {
            (IoDirection::Write, Some(data)) if data.len() as u64 == page_size => data,
            (IoDirection::Write, _) => {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("write to {} must carry exactly {} bytes", request.page, page_size),
                )))
            }
            (IoDirection::Read, _) => Vec::new(),
        };

        let locations = match request.direction {
            IoDirection::Read => vec![self.read_location(request.page.index)],
            IoDirection::Write => inner.mapper.map(request.page.index),
        };

        let id = IoRequestId(inner.next_id.fetch_add(1, Ordering::Relaxed));
        let state = Arc::new(AtomicU8::new(STATE_PENDING));
        let mut receivers = Vec::with_capacity(locations.len());

        for loc in locations {
            let (tx, rx) = oneshot::channel();
            let part = Part {
                id,
                range: ByteRange::new(loc.offset, page_size),
                data: data.clone(),
                state: Arc::clone(&state),
                tx,
            };
            inner.enqueue(loc.device, request.page.file, request.direction, part);
            receivers.push((loc, rx));
        }
        inner.counters.submitted.fetch_add(1, Ordering::Relaxed);

        for (loc, _) in &receivers {
            inner.pump(loc.device);
        }

        Ok(IoTicket {
            id,
            page: request.page,
            direction: request.direction,
            len: page_size,
            state,
            receivers,
        })
    }

    /// Submits and waits.
    pub async fn execute(&self, request: IoRequest) -> StorageResult<IoCompletion> {
        self.submit(request)?.wait().await
    }

    fn read_location(&self, page_index: u64) -> PhysicalLocation {
        let locations = self.inner.mapper.map(page_index);
        if locations.len() == 1 {
            return locations[0];
        }
        locations
            .iter()
            .copied()
            .min_by_key(|loc| {
                self.inner
                    .devices
                    .device(loc.device)
                    .map(|d| d.outstanding())
                    .unwrap_or(usize::MAX)
            })
            .unwrap_or_else(|| self.inner.mapper.primary(page_index))
    }

    /// Makes completed writes to `file` durable on every device.
    pub async fn sync(&self, file: FileId) -> StorageResult<()> {
        for dev in self.inner.devices.iter() {
            dev.backend().sync(file).await?;
        }
        Ok(())
    }

    /// The mapper used to resolve pages.
    pub fn mapper(&self) -> &RaidMapper {
        &self.inner.mapper
    }

    /// The device set.
    pub fn devices(&self) -> &DeviceSet<D> {
        &self.inner.devices
    }

    /// Returns the configuration.
    pub fn config(&self) -> &IoSchedulerConfig {
        &self.inner.config
    }

    /// Operations queued on a device.
    pub fn pending_count(&self, device: u16) -> usize {
        self.inner
            .queues
            .get(device as usize)
            .map(|q| q.lock().pending.len())
            .unwrap_or(0)
    }

    /// Operations in flight on a device.
    pub fn inflight_count(&self, device: u16) -> usize {
        self.inner
            .queues
            .get(device as usize)
            .map(|q| q.lock().inflight.len())
            .unwrap_or(0)
    }

    /// Snapshot of the scheduler statistics.
    pub fn stats(&self) -> IoSchedulerStats {
        let c = &self.inner.counters;
        IoSchedulerStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            merged: c.merged.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            bytes_read: c.bytes_read.load(Ordering::Relaxed),
            bytes_written: c.bytes_written.load(Ordering::Relaxed),
            per_device_ops: self
                .inner
                .per_device_ops
                .iter()
                .map(|n| n.load(Ordering::Relaxed))
                .collect(),
        }
    }
}

impl<D: BlockDevice> SchedulerInner<D> {
    fn enqueue(&self, device: u16, file: FileId, direction: IoDirection, part: Part) {
        let mut queue = self.queues[device as usize].lock();
        let part = if self.config.merge_reqs {
            match queue.try_merge(file, direction, part, self.config.max_merge_bytes) {
                None => {
                    self.counters.merged.fetch_add(1, Ordering::Relaxed);
                    debug!("Merged IO into queued op on device {}", device);
                    return;
                }
                Some(part) => part,
            }
        } else {
            part
        };
        debug!(
            "Enqueued IO: id={:?}, device={}, {} {}, pending={}",
            part.id,
            device,
            direction,
            part.range,
            queue.pending.len() + 1
        );
        queue.pending.push_back(DeviceOp::new(file, direction, part));
    }

    /// Dispatches queued operations until the depth limit or a conflict.
    fn pump(self: &Arc<Self>, device: u16) {
        let mut ready = Vec::new();
        {
            let mut queue = self.queues[device as usize].lock();
            while queue.inflight.len() < self.config.io_depth && !queue.head_blocked() {
                let Some(op) = queue.pending.pop_front() else {
                    break;
                };
                let mut leftovers = Vec::new();
                for run in op.into_runs(&self.counters) {
                    if queue.inflight.len() < self.config.io_depth {
                        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                        queue.inflight.push(InflightOp {
                            seq,
                            file: run.file,
                            direction: run.direction,
                            range: run.range,
                        });
                        ready.push((seq, run));
                    } else {
                        leftovers.push(run);
                    }
                }
                for run in leftovers.into_iter().rev() {
                    queue.pending.push_front(run);
                }
            }
        }

        for (seq, op) in ready {
            self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
            self.per_device_ops[device as usize].fetch_add(1, Ordering::Relaxed);
            let inner = Arc::clone(self);
            self.runtime.spawn(async move {
                inner.run(device, seq, op).await;
            });
        }
    }

    async fn run(self: Arc<Self>, device: u16, seq: u64, op: DeviceOp) {
        let result = match self.devices.device(device) {
            Some(dev) => {
                dev.begin_request();
                let result = match op.direction {
                    IoDirection::Read => dev
                        .backend()
                        .read_at(op.file, op.range.start, op.range.len() as usize)
                        .await
                        .map(Some),
                    IoDirection::Write => dev
                        .backend()
                        .write_at(op.file, op.range.start, op.assemble())
                        .await
                        .map(|_| None),
                };
                dev.end_request();
                result
            }
            None => Err(StorageError::config(format!("unknown device {}", device))),
        };

        self.queues[device as usize]
            .lock()
            .inflight
            .retain(|f| f.seq != seq);
        self.deliver(device, op, result);
        self.pump(device);
    }

    fn deliver(&self, device: u16, op: DeviceOp, result: PartResult) {
        let c = &self.counters;
        match result {
            Ok(data) => {
                match op.direction {
                    IoDirection::Read => c.bytes_read.fetch_add(op.range.len(), Ordering::Relaxed),
                    IoDirection::Write => {
                        c.bytes_written.fetch_add(op.range.len(), Ordering::Relaxed)
                    }
                };
                c.completed.fetch_add(op.parts.len() as u64, Ordering::Relaxed);
                debug!(
                    "Completed IO on device {}: {} {} ({} parts)",
                    device,
                    op.direction,
                    op.range,
                    op.parts.len()
                );
                for part in op.parts {
                    let payload = data.as_ref().map(|buf| {
                        let at = (part.range.start - op.range.start) as usize;
                        buf[at..at + part.range.len() as usize].to_vec()
                    });
                    let _ = part.tx.send(Ok(payload));
                }
            }
            Err(e) => {
                c.failed.fetch_add(op.parts.len() as u64, Ordering::Relaxed);
                warn!(
                    "Device {} failed {} {}: {}",
                    device, op.direction, op.range, e
                );
                let reason = e.to_string();
                for part in op.parts {
                    let _ = part.tx.send(Err(StorageError::DeviceIo {
                        device,
                        offset: part.range.start,
                        direction: op.direction,
                        reason: reason.clone(),
                    }));
                }
            }
        }
    }
}
