//! Background write-back of dirty pages.
//!
//! The flush engine owns a bounded queue of cells whose dirty-page count
//! crossed a threshold. A worker thread drains the queue, turns each cell's
//! dirty pages into write requests, and grows every request forward and
//! backward through neighboring cells so adjacent dirty pages leave as one
//! large sequential write. Merging never crosses a RAID-block boundary.
//! Requests that stay a single page are dropped; their pages remain dirty
//! and will be queued again later.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};

use crate::cache::{AssociativeCache, CellRef};
use crate::constants::{MAX_NUM_DIRTY_CELLS_IN_QUEUE, PAGE_SIZE};
use crate::device::{IoCallback, UnderlyingIo};
use crate::page::Page;
use crate::request::{AccessMethod, DeviceRequest, ReqContext, requeue_chain};
use crate::utility::round_to;

/// The background flush worker of one cache.
pub struct FlushEngine {
    shared: Arc<FlushShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct FlushShared {
    cache: Weak<AssociativeCache>,
    io: Arc<dyn UnderlyingIo>,
    queue: ArrayQueue<CellRef>,
    signal: Mutex<bool>,
    wake: Condvar,
    running: AtomicBool,
    threshold: usize,
    raid_block_pages: usize,
    node_id: u32,
}

/// Completion receiver for a device used only by the flush engine. When a
/// front-end shares the device, its own callback routes flush completions
/// here instead.
struct FlushCallback {
    shared: Weak<FlushShared>,
}

impl IoCallback for FlushCallback {
    fn invoke(&self, requests: Vec<DeviceRequest>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        for req in requests {
            debug_assert!(matches!(req.context, ReqContext::Flush));
            shared.request_callback(req);
        }
    }
}

impl FlushEngine {
    /// Start the worker thread for `cache`, writing through `io`.
    pub fn start(
        cache: &Arc<AssociativeCache>,
        io: Arc<dyn UnderlyingIo>,
        threshold: usize,
        raid_block_pages: usize,
    ) -> Arc<Self> {
        let node_id = io.node_id();
        let shared = Arc::new(FlushShared {
            cache: Arc::downgrade(cache),
            io: io.clone(),
            queue: ArrayQueue::new(MAX_NUM_DIRTY_CELLS_IN_QUEUE),
            signal: Mutex::new(false),
            wake: Condvar::new(),
            running: AtomicBool::new(true),
            threshold,
            raid_block_pages,
            node_id,
        });
        // a device dedicated to flushing needs its own completion receiver;
        // a shared device keeps the front-end's, which routes to us
        if io.callback().is_none() {
            io.set_callback(Arc::new(FlushCallback {
                shared: Arc::downgrade(&shared),
            }));
        }
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("oxistripe-flush".to_string())
            .spawn(move || worker_shared.run());
        let engine = Arc::new(Self {
            shared,
            worker: Mutex::new(worker.ok()),
        });
        cache.set_flush_engine(engine.clone());
        engine
    }

    /// Inspect newly dirtied pages and queue any cell that crossed the
    /// dirty threshold.
    pub fn dirty_pages(&self, pages: &[Arc<Page>]) {
        let Some(cache) = self.shared.cache.upgrade() else {
            return;
        };
        let mut queued = false;
        for page in pages {
            let cell = cache.cell_for_offset(page.offset());
            if cell.is_in_queue() {
                continue;
            }
            // count only dirty pages without I/O in flight; the rest are
            // already being written back
            let dirty = cell.num_pages(crate::page::DIRTY, crate::page::IO_PENDING);
            if dirty > self.shared.threshold && !cell.set_in_queue(true) {
                queued |= self.push_cell(cell);
            }
        }
        if queued {
            self.activate();
        }
    }

    /// Queue one cell for flushing regardless of its dirty count. Returns
    /// false if it was already queued.
    pub fn queue_cell(&self, cell: CellRef) -> bool {
        if cell.set_in_queue(true) {
            return false;
        }
        let queued = self.push_cell(cell);
        if queued {
            self.activate();
        }
        queued
    }

    fn push_cell(&self, cell: CellRef) -> bool {
        match self.shared.queue.push(cell) {
            Ok(()) => true,
            Err(cell) => {
                tracing::warn!(cell = cell.hash(), "dirty cell queue is full");
                cell.set_in_queue(false);
                false
            }
        }
    }

    /// Wake the worker thread
    pub fn activate(&self) {
        let mut signaled = self.shared.signal.lock();
        *signaled = true;
        self.shared.wake.notify_one();
    }

    /// Handle the completion of a flush write: clear the dirty and
    /// io-pending bits of every written page and reissue anything that
    /// queued on the pages while the write was in flight.
    pub fn request_callback(&self, req: DeviceRequest) {
        self.shared.request_callback(req);
    }
}

impl Drop for FlushEngine {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        {
            let mut signaled = self.shared.signal.lock();
            *signaled = true;
            self.shared.wake.notify_one();
        }
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl FlushShared {
    fn run(self: Arc<Self>) {
        loop {
            {
                let mut signaled = self.signal.lock();
                while !*signaled && self.running.load(Ordering::Acquire) {
                    self.wake.wait(&mut signaled);
                }
                *signaled = false;
            }
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            while let Some(cell) = self.queue.pop() {
                self.flush_cell(&cell);
                cell.set_in_queue(false);
            }
        }
    }

    /// Turn a cell's dirty pages into write requests, merge them with
    /// neighbors, and dispatch everything that grew beyond one page.
    fn flush_cell(&self, cell: &CellRef) {
        let Some(cache) = self.cache.upgrade() else {
            return;
        };

        let mut dirty = BTreeMap::new();
        cell.get_dirty_pages(&mut dirty);

        let mut requests: Vec<DeviceRequest> = Vec::new();
        for (&off, page) in &dirty {
            let state = page.lock();
            debug_assert!(!page.is_old_dirty());
            debug_assert!(page.is_ready());
            if page.is_io_pending() {
                // already on its way to the device
                page.dec_ref();
                drop(state);
                continue;
            }
            page.set_io_pending(true);
            drop(state);
            let mut req = DeviceRequest::new(
                page.file_id(),
                off,
                AccessMethod::Write,
                self.node_id,
                ReqContext::Flush,
            );
            req.add_page(page.clone());
            requests.push(req);
        }

        // grow each request into the following cells
        let mut forward_complete = Vec::new();
        let mut curr = cell.clone();
        while !requests.is_empty() {
            let Some(next) = cache.get_next_cell(&curr) else {
                break;
            };
            let mut neighbor = BTreeMap::new();
            next.get_dirty_pages(&mut neighbor);
            self.merge_pages_to_reqs(&mut requests, neighbor, true, &mut forward_complete);
            curr = next;
        }
        forward_complete.append(&mut requests);

        // then into the preceding cells
        let mut complete = Vec::new();
        let mut curr = cell.clone();
        while !forward_complete.is_empty() {
            let Some(prev) = cache.get_prev_cell(&curr) else {
                break;
            };
            let mut neighbor = BTreeMap::new();
            prev.get_dirty_pages(&mut neighbor);
            self.merge_pages_to_reqs(&mut forward_complete, neighbor, false, &mut complete);
            curr = prev;
        }
        complete.append(&mut forward_complete);

        self.write_requests(complete);
    }

    /// Try to extend every request with adjacent pages from `neighbor`.
    ///
    /// A neighbor page is consumed when it is clean to take (ready, not
    /// old-dirty, no I/O in flight); a page already in flight closes the
    /// request. Requests that cannot extend move to `complete`. Extension
    /// stops at the request's RAID-block boundary.
    fn merge_pages_to_reqs(
        &self,
        requests: &mut Vec<DeviceRequest>,
        mut neighbor: BTreeMap<i64, Arc<Page>>,
        forward: bool,
        complete: &mut Vec<DeviceRequest>,
    ) {
        let raid_bytes = (self.raid_block_pages * PAGE_SIZE) as i64;
        let mut i = 0;
        while i < requests.len() {
            let mut extended = false;
            let mut closed = false;
            loop {
                let req = &mut requests[i];
                let block_off = round_to(req.offset, raid_bytes);
                let target = if forward {
                    if req.end_offset() >= block_off + raid_bytes {
                        break;
                    }
                    req.end_offset()
                } else {
                    if req.offset == block_off {
                        break;
                    }
                    req.offset - PAGE_SIZE as i64
                };
                let Some(page) = neighbor.remove(&target) else {
                    break;
                };
                let state = page.lock();
                debug_assert!(!page.is_old_dirty());
                debug_assert!(page.is_ready());
                if page.is_io_pending() {
                    // being written back elsewhere; close this request
                    page.dec_ref();
                    drop(state);
                    closed = true;
                    break;
                }
                page.set_io_pending(true);
                drop(state);
                if forward {
                    req.add_page(page);
                } else {
                    req.add_page_front(page);
                    req.offset = target;
                }
                extended = true;
            }
            if closed || !extended {
                complete.push(requests.remove(i));
            } else {
                i += 1;
            }
        }

        // release the pins on pages nobody consumed
        for page in neighbor.values() {
            page.dec_ref();
        }
    }

    /// Dispatch merged requests; requests that never grew beyond one page
    /// are dropped (their pages stay dirty and will be queued again).
    fn write_requests(&self, requests: Vec<DeviceRequest>) {
        for req in requests {
            if req.num_bufs() > 1 {
                let statuses = self.io.access(vec![req]);
                if statuses.iter().any(|s| s.is_fail()) {
                    tracing::error!("underlying io failure while flushing");
                    panic!("underlying io failure");
                }
            } else {
                let page = req.bufs[0].page.clone();
                let state = page.lock();
                page.set_io_pending(false);
                page.dec_ref();
                drop(state);
            }
        }
    }

    fn request_callback(&self, req: DeviceRequest) {
        let Some(cache) = self.cache.upgrade() else {
            return;
        };
        // re-resolve each written page through the cache; the flush pins
        // keep identities stable while the write is in flight
        let mut off = req.offset;
        for _ in 0..req.num_bufs() {
            match cache.search_hit(off) {
                Some(page) => {
                    let mut state = page.lock();
                    debug_assert!(page.is_dirty());
                    page.set_dirty(false);
                    page.set_io_pending(false);
                    let chain = state.take_reqs();
                    // one pin from the flush, one from the lookup above
                    page.dec_ref();
                    page.dec_ref();
                    drop(state);
                    requeue_chain(chain);
                }
                None => debug_assert!(false, "flushed page vanished from the cache"),
            }
            off += PAGE_SIZE as i64;
        }
    }
}
