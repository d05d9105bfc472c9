//! In-memory underlying device.
//!
//! Serves reads and writes from per-file byte images held in memory. Used
//! by tests and simulations: it counts issued requests, records write
//! shapes, and can hold completions back until drained so races around
//! io-pending pages can be exercised deterministically.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::constants::PAGE_SIZE;
use crate::device::{IoCallback, UnderlyingIo};
use crate::request::{AccessMethod, DeviceRequest};
use crate::status::IoStatus;

/// When completions are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// The callback fires inside `access`, after the data transfer
    Immediate,
    /// Completions are held until `drain_completions` is called
    Manual,
}

/// An `UnderlyingIo` backed by in-memory file images.
pub struct MemDevice {
    node_id: u32,
    mode: Mutex<CompletionMode>,
    files: Mutex<HashMap<u32, Vec<u8>>>,
    callback: RwLock<Option<Arc<dyn IoCallback>>>,
    held: Mutex<Vec<DeviceRequest>>,
    reads_issued: AtomicU64,
    writes_issued: AtomicU64,
    pages_read: AtomicU64,
    pages_written: AtomicU64,
    write_log: Mutex<Vec<(i64, usize)>>,
}

impl MemDevice {
    /// A device completing requests inside `access`
    pub fn new(node_id: u32) -> Arc<Self> {
        Self::with_mode(node_id, CompletionMode::Immediate)
    }

    /// A device with the given completion mode
    pub fn with_mode(node_id: u32, mode: CompletionMode) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            mode: Mutex::new(mode),
            files: Mutex::new(HashMap::new()),
            callback: RwLock::new(None),
            held: Mutex::new(Vec::new()),
            reads_issued: AtomicU64::new(0),
            writes_issued: AtomicU64::new(0),
            pages_read: AtomicU64::new(0),
            pages_written: AtomicU64::new(0),
            write_log: Mutex::new(Vec::new()),
        })
    }

    /// Switch the completion mode
    pub fn set_completion_mode(&self, mode: CompletionMode) {
        *self.mode.lock() = mode;
    }

    /// Install `data` as the image of `file_id`
    pub fn set_image(&self, file_id: u32, data: Vec<u8>) {
        self.files.lock().insert(file_id, data);
    }

    /// Snapshot the image of `file_id`
    pub fn image(&self, file_id: u32) -> Vec<u8> {
        self.files.lock().get(&file_id).cloned().unwrap_or_default()
    }

    /// Read requests submitted so far
    pub fn reads_issued(&self) -> u64 {
        self.reads_issued.load(Ordering::Relaxed)
    }

    /// Write requests submitted so far
    pub fn writes_issued(&self) -> u64 {
        self.writes_issued.load(Ordering::Relaxed)
    }

    /// Pages transferred by reads
    pub fn pages_read(&self) -> u64 {
        self.pages_read.load(Ordering::Relaxed)
    }

    /// Pages transferred by writes
    pub fn pages_written(&self) -> u64 {
        self.pages_written.load(Ordering::Relaxed)
    }

    /// `(offset, num_bufs)` of every write request, in submission order
    pub fn write_log(&self) -> Vec<(i64, usize)> {
        self.write_log.lock().clone()
    }

    /// Completions currently held back
    pub fn held_completions(&self) -> usize {
        self.held.lock().len()
    }

    /// Deliver all held completions; returns how many were delivered
    pub fn drain_completions(&self) -> usize {
        let held = std::mem::take(&mut *self.held.lock());
        let n = held.len();
        if n > 0 {
            if let Some(cb) = self.callback() {
                cb.invoke(held);
            }
        }
        n
    }

    /// Transfer data between the file image and the request's page buffers.
    fn perform(&self, req: &DeviceRequest) {
        let mut files = self.files.lock();
        let image = files.entry(req.file_id).or_default();
        let end = req.offset as usize + req.size();
        if image.len() < end {
            image.resize(end, 0);
        }
        for (i, buf) in req.bufs.iter().enumerate() {
            let off = req.offset as usize + i * PAGE_SIZE;
            let mut state = buf.page.lock();
            match req.method {
                AccessMethod::Read => {
                    state
                        .data_mut()
                        .copy_from_slice(&image[off..off + PAGE_SIZE]);
                }
                AccessMethod::Write => {
                    image[off..off + PAGE_SIZE].copy_from_slice(state.data());
                }
            }
        }
    }
}

impl UnderlyingIo for MemDevice {
    fn access(&self, requests: Vec<DeviceRequest>) -> Vec<IoStatus> {
        let statuses = vec![IoStatus::Pending; requests.len()];
        for req in requests {
            debug_assert!(!req.is_empty());
            match req.method {
                AccessMethod::Read => {
                    self.reads_issued.fetch_add(1, Ordering::Relaxed);
                    self.pages_read
                        .fetch_add(req.num_bufs() as u64, Ordering::Relaxed);
                }
                AccessMethod::Write => {
                    self.writes_issued.fetch_add(1, Ordering::Relaxed);
                    self.pages_written
                        .fetch_add(req.num_bufs() as u64, Ordering::Relaxed);
                    self.write_log.lock().push((req.offset, req.num_bufs()));
                }
            }
            self.perform(&req);
            let mode = *self.mode.lock();
            match mode {
                CompletionMode::Immediate => {
                    if let Some(cb) = self.callback() {
                        cb.invoke(vec![req]);
                    }
                }
                CompletionMode::Manual => self.held.lock().push(req),
            }
        }
        statuses
    }

    fn set_callback(&self, callback: Arc<dyn IoCallback>) {
        *self.callback.write() = Some(callback);
    }

    fn callback(&self) -> Option<Arc<dyn IoCallback>> {
        self.callback.read().clone()
    }

    fn flush_requests(&self) {}

    fn node_id(&self) -> u32 {
        self.node_id
    }
}
