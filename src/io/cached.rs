//! The cached I/O front-end.
//!
//! `access` decomposes each user request into page accesses against the
//! associative cache. Hits on ready pages complete synchronously; misses
//! claim pages and issue (possibly multi-page) reads to the underlying I/O;
//! concurrent misses on the same page collapse onto its pending queue. A
//! write smaller than a page is serialized behind a synthetic read that
//! fills the page first. Evicted dirty pages are written back by whichever
//! thread won the eviction; everyone else queues behind the old-dirty page.
//!
//! Completions arrive through the callback registered with the underlying
//! I/O. Each completion settles the page, copies data for every queued
//! sub-request, counts completed bytes on the original request, and
//! delivers the user notification when the count reaches the original's
//! size.

use std::sync::{Arc, Weak};

use crossbeam::queue::SegQueue;
use parking_lot::RwLock;

use crate::cache::{AssociativeCache, FrontendStats};
use crate::config::CacheParams;
use crate::constants::{MAX_NUM_IOVECS, PAGE_SIZE};
use crate::device::{IoCallback, UnderlyingIo};
use crate::page::{Page, PageState};
use crate::request::{
    AccessMethod, AccessRequest, DeviceRequest, OriginalRequest, PendingReq, ReqContext,
    RequestIo, SubRange, requeue_chain,
};
use crate::status::{CacheError, IoStatus};
use crate::utility::{round_page, round_to};

/// Outcome of one user request submitted through `access`.
pub enum AccessStatus {
    /// Completed synchronously; the completion handler was (or will not be)
    /// invoked depending on how the request completed
    Ok,
    /// Enqueued; the completion handler fires when the last byte lands
    Pending(Arc<OriginalRequest>),
    /// Rejected (for example, a write to a read-only cache)
    Fail,
}

impl AccessStatus {
    /// Whether the request completed synchronously
    pub fn is_ok(&self) -> bool {
        matches!(self, AccessStatus::Ok)
    }

    /// Whether the request is pending
    pub fn is_pending(&self) -> bool {
        matches!(self, AccessStatus::Pending(_))
    }
}

/// User-facing completion callback.
pub trait CompletionHandler: Send + Sync {
    /// `orig` has fully completed with `status`
    fn complete(&self, orig: &Arc<OriginalRequest>, status: IoStatus);
}

/// A per-thread cached I/O endpoint wrapping an underlying device.
pub struct CachedIo {
    shared: Arc<CachedIoShared>,
}

struct CachedIoShared {
    cache: Arc<AssociativeCache>,
    underlying: Arc<dyn UnderlyingIo>,
    pending: SegQueue<Box<PendingReq>>,
    handler: RwLock<Option<Arc<dyn CompletionHandler>>>,
    stats: FrontendStats,
    node_id: u32,
    raid_block_pages: usize,
    test_hit_rate: u32,
    writable: bool,
}

impl RequestIo for CachedIoShared {
    fn queue_pending(&self, req: Box<PendingReq>) {
        self.pending.push(req);
    }

    fn deliver(&self, orig: &Arc<OriginalRequest>, status: IoStatus) {
        if let Some(handler) = self.handler.read().clone() {
            handler.complete(orig, status);
        }
    }
}

struct AccessPageCallback {
    shared: Weak<CachedIoShared>,
}

impl IoCallback for AccessPageCallback {
    fn invoke(&self, requests: Vec<DeviceRequest>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        for req in requests {
            if matches!(req.context, ReqContext::Flush) {
                // issued by the flush engine, not by any front-end
                if let Some(flush) = shared.cache.flush_engine() {
                    flush.request_callback(req);
                }
            } else if req.num_bufs() > 1 {
                shared.multibuf_invoke(req);
            } else {
                shared.singlebuf_invoke(req);
            }
        }
    }
}

impl CachedIo {
    /// Wrap `underlying` with the cache, registering the completion
    /// callback that settles pages.
    pub fn new(
        cache: Arc<AssociativeCache>,
        underlying: Arc<dyn UnderlyingIo>,
        params: &CacheParams,
    ) -> Self {
        let node_id = underlying.node_id();
        let shared = Arc::new(CachedIoShared {
            cache,
            underlying: underlying.clone(),
            pending: SegQueue::new(),
            handler: RwLock::new(None),
            stats: FrontendStats::new(),
            node_id,
            raid_block_pages: params.raid_block_pages,
            test_hit_rate: params.test_hit_rate,
            writable: params.writable,
        });
        underlying.set_callback(Arc::new(AccessPageCallback {
            shared: Arc::downgrade(&shared),
        }));
        Self { shared }
    }

    /// Register the user completion callback
    pub fn set_callback(&self, handler: Arc<dyn CompletionHandler>) {
        *self.shared.handler.write() = Some(handler);
    }

    /// Front-end statistics
    pub fn stats(&self) -> &FrontendStats {
        &self.shared.stats
    }

    /// The cache this endpoint runs against
    pub fn cache(&self) -> &Arc<AssociativeCache> {
        &self.shared.cache
    }

    /// Node this endpoint serves
    pub fn node_id(&self) -> u32 {
        self.shared.node_id
    }

    /// Submit a batch of requests. A prefix of each request may complete
    /// synchronously (`Ok`); the remainder completes through the
    /// registered handler (`Pending`). Never blocks the caller.
    pub fn access(&self, requests: Vec<AccessRequest>) -> Vec<AccessStatus> {
        let shared_dyn: Arc<dyn RequestIo> = self.shared.clone();
        let io: Weak<dyn RequestIo> = Arc::downgrade(&shared_dyn);
        let origs = requests
            .into_iter()
            .map(|req| OriginalRequest::new(req, false, self.shared.node_id, io.clone()))
            .collect();
        self.shared.access_origs(origs)
    }

    /// Blocking read of `buf.len()` bytes at `offset`
    pub fn read_sync(&self, file_id: u32, offset: i64, buf: &mut [u8]) -> IoStatus {
        let req = AccessRequest {
            file_id,
            offset,
            method: AccessMethod::Read,
            buf: vec![0u8; buf.len()].into_boxed_slice(),
        };
        match self.sync_access(req) {
            SyncOutcome::Done(orig) => {
                orig.with_buf(|data| buf.copy_from_slice(data));
                IoStatus::Ok
            }
            SyncOutcome::Failed => IoStatus::Fail,
        }
    }

    /// Blocking write of `buf` at `offset`
    pub fn write_sync(&self, file_id: u32, offset: i64, buf: &[u8]) -> IoStatus {
        let req = AccessRequest {
            file_id,
            offset,
            method: AccessMethod::Write,
            buf: buf.to_vec().into_boxed_slice(),
        };
        match self.sync_access(req) {
            SyncOutcome::Done(_) => IoStatus::Ok,
            SyncOutcome::Failed => IoStatus::Fail,
        }
    }

    fn sync_access(&self, req: AccessRequest) -> SyncOutcome {
        let shared_dyn: Arc<dyn RequestIo> = self.shared.clone();
        let io: Weak<dyn RequestIo> = Arc::downgrade(&shared_dyn);
        let orig = OriginalRequest::new(req, true, self.shared.node_id, io);
        let statuses = self.shared.access_origs(vec![orig.clone()]);
        self.shared.underlying.flush_requests();
        match &statuses[0] {
            AccessStatus::Ok => SyncOutcome::Done(orig),
            AccessStatus::Pending(_) => {
                self.shared.stats.record_wait();
                // sub-requests parked on the pending queue are reissued by
                // the thread that owns the front-end, so drain while waiting
                loop {
                    if let Some(status) = orig.wait_timeout(std::time::Duration::from_millis(1)) {
                        break match status {
                            IoStatus::Ok => SyncOutcome::Done(orig),
                            _ => SyncOutcome::Failed,
                        };
                    }
                    self.shared.handle_pending();
                }
            }
            AccessStatus::Fail => SyncOutcome::Failed,
        }
    }

    /// Warm the cache over `[start, start + size)` without touching the
    /// device: pages are claimed and marked ready as-is.
    pub fn preload(&self, file_id: u32, start: i64, size: usize) -> Result<(), CacheError> {
        if size > self.shared.cache.manager().max_size() {
            return Err(CacheError::Init(
                "cannot preload more data than the cache holds".to_string(),
            ));
        }
        debug_assert_eq!(start, round_page(start));
        let mut offset = round_page(start);
        let end = start + size as i64;
        while offset < end {
            let outcome = self.shared.cache.search(offset, file_id);
            let page = outcome.page;
            if !page.is_ready() {
                let _state = page.lock();
                page.set_io_pending(false);
                page.set_data_ready(true);
            }
            page.dec_ref();
            offset += PAGE_SIZE as i64;
        }
        Ok(())
    }

    /// Drain the pending-request queue, reissuing every queued sub-request.
    /// Runs automatically at the start of each `access` call.
    pub fn process_pending_requests(&self) -> usize {
        self.shared.handle_pending()
    }
}

enum SyncOutcome {
    Done(Arc<OriginalRequest>),
    Failed,
}

impl CachedIoShared {
    fn access_origs(&self, origs: Vec<Arc<OriginalRequest>>) -> Vec<AccessStatus> {
        if !self.pending.is_empty() {
            self.handle_pending();
        }

        let mut statuses = Vec::with_capacity(origs.len());
        let mut cached: Vec<(Arc<OriginalRequest>, Arc<Page>)> = Vec::new();
        let mut dirty_pages: Vec<Arc<Page>> = Vec::new();

        for orig in origs {
            if matches!(orig.method(), AccessMethod::Write) && !self.writable {
                tracing::warn!("write rejected: cache opened read-only");
                statuses.push(AccessStatus::Fail);
                continue;
            }

            let (begin_pg, end_pg) = orig.page_span();
            let mut batch: Vec<Arc<Page>> = Vec::new();
            let mut bytes_done = 0usize;
            let mut fast_cached = false;

            let mut tmp = begin_pg;
            while tmp < end_pg {
                let mut outcome = self.cache.search(tmp, orig.file_id());
                let accesses = self.stats.record_access();

                if self.test_hit_rate > 0 && (accesses % 100) < self.test_hit_rate as u64 {
                    let page = &outcome.page;
                    if !page.is_ready() {
                        let _state = page.lock();
                        page.set_io_pending(false);
                        page.set_data_ready(true);
                        if page.is_old_dirty() {
                            page.set_dirty(false);
                            page.set_old_dirty(false);
                        }
                        outcome.hit = true;
                        outcome.old_off = -1;
                    }
                }

                if outcome.hit {
                    self.stats.record_hit();
                    // steal cached single-page requests from the normal
                    // path; no sub-requests are synthesized for them. A
                    // write racing an in-flight flush must queue instead.
                    let write_in_flight = matches!(orig.method(), AccessMethod::Write)
                        && outcome.page.is_io_pending();
                    if orig.within_one_page() && outcome.page.is_ready() && !write_in_flight {
                        cached.push((orig.clone(), outcome.page));
                        fast_cached = true;
                        break;
                    }
                }

                let p = outcome.page;

                // The page was evicted while dirty and its prior contents
                // are still in memory. Two threads may observe it; only
                // the one that received the old offset writes it back.
                if p.is_old_dirty() {
                    // issue the contiguous read collected so far first
                    if !batch.is_empty() {
                        bytes_done += self.read_batch(std::mem::take(&mut batch), &orig);
                    }

                    let anchor = make_unit(&orig, orig.extract(tmp, 1), p.clone());
                    if outcome.old_off != -1 && outcome.old_off != begin_pg {
                        // this thread evicted the dirty page; write it back
                        self.write_dirty_page(&p, outcome.old_off, anchor);
                        tmp += PAGE_SIZE as i64;
                        continue;
                    }
                    let mut state = p.lock();
                    if p.is_old_dirty() {
                        // another thread owns the write-back; queue behind
                        // it and proceed once it completes
                        state.add_req(anchor);
                        drop(state);
                        tmp += PAGE_SIZE as i64;
                        continue;
                    }
                    // the write-back finished in the meantime
                    drop(state);
                }

                match orig.method() {
                    AccessMethod::Write => {
                        // writes never span pages; large writes are broken
                        // into per-page sub-requests
                        let unit = make_unit(&orig, orig.extract(tmp, 1), p);
                        bytes_done += self.write_unit(unit, &mut dirty_pages);
                    }
                    AccessMethod::Read => {
                        batch.push(p);
                        let raid_bytes = (self.raid_block_pages * PAGE_SIZE) as i64;
                        let batch_end =
                            batch[0].offset() + (PAGE_SIZE * batch.len()) as i64;
                        if batch.len() == MAX_NUM_IOVECS || batch_end % raid_bytes == 0 {
                            bytes_done += self.read_batch(std::mem::take(&mut batch), &orig);
                        }
                    }
                }
                tmp += PAGE_SIZE as i64;
            }

            if !batch.is_empty() {
                bytes_done += self.read_batch(std::mem::take(&mut batch), &orig);
            }

            if fast_cached || bytes_done == orig.size() {
                statuses.push(AccessStatus::Ok);
            } else {
                statuses.push(AccessStatus::Pending(orig));
            }
        }

        self.process_cached_reqs(cached);
        self.cache.mark_dirty_pages(&dirty_pages);
        statuses
    }

    /// Complete single-page data-ready hits in one pass after the scan.
    fn process_cached_reqs(&self, cached: Vec<(Arc<OriginalRequest>, Arc<Page>)>) {
        if cached.is_empty() {
            return;
        }
        self.stats.record_fast_process(cached.len());
        let mut dirty_pages = Vec::new();
        for (orig, page) in cached {
            let sub = SubRange {
                offset: orig.offset(),
                size: orig.size(),
            };
            if complete_req(&orig, &sub, &page) {
                dirty_pages.push(page);
            }
            // synchronous callers learn completion from the Ok status
            if !orig.is_sync() {
                if let Some(io) = orig.io() {
                    io.deliver(&orig, IoStatus::Ok);
                }
            }
        }
        self.cache.mark_dirty_pages(&dirty_pages);
    }

    /// Apply one write sub-request to its page.
    ///
    /// Returns the bytes completed synchronously. A partial write to a page
    /// without data first issues a full-page read carrying the original
    /// request; the write is applied when the fill completes. A page-sized
    /// write overwrites in place. Anything racing an in-flight I/O queues
    /// on the page.
    fn write_unit(&self, unit: Box<PendingReq>, dirty_pages: &mut Vec<Arc<Page>>) -> usize {
        let p = unit.page.clone();
        let mut state = p.lock();
        debug_assert!(!p.is_old_dirty());
        if !p.is_ready() {
            if !p.is_io_pending() {
                debug_assert!(!p.is_dirty());
                if unit.size < PAGE_SIZE {
                    // fill the page before applying the partial write; the
                    // read carries the original, the partial is dropped
                    p.set_io_pending(true);
                    let orig = unit.orig.clone();
                    drop(state);
                    drop(unit);
                    let mut req = DeviceRequest::new(
                        p.file_id(),
                        p.offset(),
                        AccessMethod::Read,
                        self.node_id,
                        ReqContext::Fill(orig),
                    );
                    req.add_page(p.clone());
                    self.submit(req);
                    0
                } else {
                    // whole-page overwrite: no fill needed
                    let newly_dirty = complete_req_locked(&unit.orig, &unit.sub(), &p, &mut state);
                    if newly_dirty {
                        dirty_pages.push(p.clone());
                    }
                    p.set_data_ready(true);
                    drop(state);
                    let size = unit.size;
                    finalize_unit(unit);
                    size
                }
            } else {
                // a read-fill is in flight; apply the write after it lands
                state.add_req(unit);
                0
            }
        } else if p.is_io_pending() {
            // the page is being flushed; apply the write once the flush
            // completes so the device never sees interleaved content
            state.add_req(unit);
            0
        } else {
            drop(state);
            let newly_dirty = complete_req(&unit.orig, &unit.sub(), &p);
            if newly_dirty {
                dirty_pages.push(p.clone());
            }
            let size = unit.size;
            finalize_unit(unit);
            size
        }
    }

    /// Apply one read sub-request to its page.
    fn read_unit(&self, unit: Box<PendingReq>) -> usize {
        let p = unit.page.clone();
        let mut state = p.lock();
        if !p.is_ready() {
            if !p.is_io_pending() {
                p.set_io_pending(true);
                debug_assert!(!p.is_dirty());
                let orig = unit.orig.clone();
                drop(state);
                drop(unit);
                let mut req = DeviceRequest::new(
                    p.file_id(),
                    p.offset(),
                    AccessMethod::Read,
                    self.node_id,
                    ReqContext::Fill(orig),
                );
                req.add_page(p.clone());
                self.submit(req);
                0
            } else {
                state.add_req(unit);
                0
            }
        } else {
            drop(state);
            complete_req(&unit.orig, &unit.sub(), &p);
            let size = unit.size;
            finalize_unit(unit);
            size
        }
    }

    /// Issue a multi-page read over `pages`, breaking the batch at pages
    /// that are already ready or already have I/O in flight.
    ///
    /// Pages are locked in ascending offset order, so concurrent batches
    /// cannot deadlock.
    fn read_batch(&self, pages: Vec<Arc<Page>>, orig: &Arc<OriginalRequest>) -> usize {
        debug_assert!(pages.len() <= MAX_NUM_IOVECS);
        let mut bytes = 0usize;
        let mut multibuf: Option<DeviceRequest> = None;

        for p in pages {
            loop {
                let mut state = p.lock();
                if !p.is_ready() && !p.is_io_pending() {
                    p.set_io_pending(true);
                    debug_assert!(!p.is_dirty());
                    let req = multibuf.get_or_insert_with(|| {
                        DeviceRequest::new(
                            p.file_id(),
                            p.offset(),
                            AccessMethod::Read,
                            self.node_id,
                            ReqContext::Fill(orig.clone()),
                        )
                    });
                    req.add_page(p.clone());
                    drop(state);
                    break;
                } else if !p.is_ready() {
                    // I/O already in flight on this page
                    if multibuf.is_some() {
                        // close the batch collected so far, then look at
                        // this page again
                        drop(state);
                        if let Some(req) = multibuf.take() {
                            self.submit(req);
                        }
                        continue;
                    }
                    let unit = make_unit(orig, orig.extract(p.offset(), 1), p.clone());
                    state.add_req(unit);
                    drop(state);
                    break;
                } else {
                    // data is ready; the batch breaks and this page
                    // completes immediately
                    drop(state);
                    if let Some(req) = multibuf.take() {
                        self.submit(req);
                    }
                    let sub = orig.extract(p.offset(), 1);
                    bytes += sub.size;
                    complete_req(orig, &sub, &p);
                    finalize_partial(orig, sub.size);
                    break;
                }
            }
        }

        if let Some(req) = multibuf {
            if !req.is_empty() {
                self.submit(req);
            }
        }
        bytes
    }

    /// Write an evicted dirty page back to its old offset, merging adjacent
    /// dirty pages within the same RAID block into the request.
    fn write_dirty_page(&self, p: &Arc<Page>, old_off: i64, anchor: Box<PendingReq>) {
        {
            let _state = p.lock();
            debug_assert!(!p.is_io_pending());
            p.set_io_pending(true);
        }
        let mut req = DeviceRequest::new(
            p.file_id(),
            old_off,
            AccessMethod::Write,
            self.node_id,
            ReqContext::Evict(anchor),
        );
        req.add_page(p.clone());
        self.merge_pages_to_req(&mut req);
        self.submit(req);
    }

    /// Extend an eviction write forward and backward with neighboring dirty
    /// pages, bounded by the RAID block. Each neighbor is pinned by the
    /// lookup and locked one at a time in walk order.
    fn merge_pages_to_req(&self, req: &mut DeviceRequest) {
        let raid_bytes = (self.raid_block_pages * PAGE_SIZE) as i64;
        let base = req.offset;
        let block_off = round_to(base, raid_bytes);
        let block_end = block_off + raid_bytes;

        let mut forward = base + PAGE_SIZE as i64;
        while forward < block_end {
            let Some(p) = self.cache.search_hit(forward) else {
                break;
            };
            let state = p.lock();
            if !p.is_dirty() || p.is_io_pending() {
                p.dec_ref();
                drop(state);
                break;
            }
            p.set_io_pending(true);
            drop(state);
            req.add_page(p);
            forward += PAGE_SIZE as i64;
        }

        if base >= PAGE_SIZE as i64 {
            let mut backward = base - PAGE_SIZE as i64;
            while backward >= block_off {
                let Some(p) = self.cache.search_hit(backward) else {
                    break;
                };
                let state = p.lock();
                if !p.is_dirty() || p.is_io_pending() {
                    p.dec_ref();
                    drop(state);
                    break;
                }
                p.set_io_pending(true);
                drop(state);
                req.add_page_front(p);
                req.offset = backward;
                if backward < PAGE_SIZE as i64 {
                    break;
                }
                backward -= PAGE_SIZE as i64;
            }
        }
    }

    /// Reissue every request parked on the pending queue. They all target
    /// pages whose state is settled by now.
    fn handle_pending(&self) -> usize {
        let mut total = 0usize;
        let mut dirty_pages = Vec::new();
        while let Some(head) = self.pending.pop() {
            let mut chain = Some(head);
            while let Some(mut unit) = chain {
                chain = unit.next.take();
                debug_assert!(!unit.page.is_old_dirty());
                total += 1;
                match unit.method {
                    AccessMethod::Write => {
                        self.write_unit(unit, &mut dirty_pages);
                    }
                    AccessMethod::Read => {
                        self.read_unit(unit);
                    }
                }
            }
        }
        // dirty pages can show up here when a queued write overwrote an
        // entire page
        self.cache.mark_dirty_pages(&dirty_pages);
        total
    }

    /// Completion of a multi-page request issued by a front-end.
    fn multibuf_invoke(&self, req: DeviceRequest) {
        let DeviceRequest {
            offset,
            method,
            context,
            bufs,
            ..
        } = req;

        match (method, context) {
            (AccessMethod::Read, ReqContext::Fill(orig)) => {
                let mut dirty_pages = Vec::new();
                let mut chains = Vec::with_capacity(bufs.len());
                for buf in &bufs {
                    let p = &buf.page;
                    let mut state = p.lock();
                    debug_assert!(p.is_io_pending());
                    p.set_data_ready(true);
                    p.set_io_pending(false);
                    let chain = state.take_reqs();
                    let sub = orig.extract(p.offset(), 1);
                    if complete_req_locked(&orig, &sub, p, &mut state) {
                        dirty_pages.push(p.clone());
                    }
                    drop(state);
                    chains.push((p.clone(), chain));
                }

                let sub = orig.extract(offset, bufs.len());
                finalize_partial(&orig, sub.size);

                // everything queued on these pages is single-page and can
                // complete now
                for (page, mut chain) in chains {
                    while let Some(mut unit) = chain {
                        chain = unit.next.take();
                        if complete_req(&unit.orig, &unit.sub(), &page) {
                            dirty_pages.push(page.clone());
                        }
                        finalize_unit(unit);
                    }
                }
                self.cache.mark_dirty_pages(&dirty_pages);
            }
            (AccessMethod::Write, ReqContext::Evict(anchor)) => {
                // old-dirty write-back with merged neighbors
                for buf in &bufs {
                    let p = &buf.page;
                    let mut state = p.lock();
                    p.set_dirty(false);
                    p.set_old_dirty(false);
                    p.set_io_pending(false);
                    let chain = state.take_reqs();
                    if !Arc::ptr_eq(p, &anchor.page) {
                        // merged pages were pinned by the lookup; the
                        // anchor's pin is released when it completes
                        p.dec_ref();
                    }
                    drop(state);
                    requeue_chain(chain);
                }
                // the anchor is reissued from the pending queue; issuing a
                // write here could block the completion thread
                if let Some(io) = anchor.orig.io() {
                    io.queue_pending(anchor);
                }
            }
            _ => {
                debug_assert!(false, "unroutable multi-buffer completion");
            }
        }
    }

    /// Completion of a single-page request issued by a front-end.
    fn singlebuf_invoke(&self, req: DeviceRequest) {
        let DeviceRequest {
            offset,
            context,
            bufs,
            ..
        } = req;
        debug_assert_eq!(bufs.len(), 1);
        let p = bufs[0].page.clone();

        match context {
            ReqContext::Fill(orig) => {
                // a read-fill; the page is now authoritative
                let mut state = p.lock();
                p.set_data_ready(true);
                p.set_io_pending(false);
                let chain = state.take_reqs();

                let mut dirty_pages = Vec::new();
                let sub = orig.extract(offset, 1);
                if complete_req_locked(&orig, &sub, &p, &mut state) {
                    dirty_pages.push(p.clone());
                }
                drop(state);
                finalize_partial(&orig, sub.size);

                let mut chain = chain;
                while let Some(mut unit) = chain {
                    chain = unit.next.take();
                    if complete_req(&unit.orig, &unit.sub(), &p) {
                        dirty_pages.push(p.clone());
                    }
                    finalize_unit(unit);
                }
                self.cache.mark_dirty_pages(&dirty_pages);
            }
            ReqContext::Evict(mut anchor) => {
                // the old dirty contents are on the device; the page now
                // awaits data for its new identity
                let mut state = p.lock();
                p.set_old_dirty(false);
                p.set_io_pending(false);
                let chain = state.take_reqs();
                let ready = p.is_ready();
                drop(state);

                if ready {
                    // rare: the page became ready while the write-back ran
                    let mut dirty_pages = Vec::new();
                    if complete_req(&anchor.orig, &anchor.sub(), &p) {
                        dirty_pages.push(p.clone());
                    }
                    finalize_unit(anchor);
                    let mut chain = chain;
                    while let Some(mut unit) = chain {
                        chain = unit.next.take();
                        if complete_req(&unit.orig, &unit.sub(), &p) {
                            dirty_pages.push(p.clone());
                        }
                        finalize_unit(unit);
                    }
                    self.cache.mark_dirty_pages(&dirty_pages);
                } else {
                    // reissue the anchor and everything queued behind it
                    anchor.next = chain;
                    if let Some(io) = anchor.orig.io() {
                        io.queue_pending(anchor);
                    }
                }
            }
            ReqContext::Flush => unreachable!("flush completions are routed to the engine"),
        }
    }

    /// Submit one request to the underlying device. An I/O failure here is
    /// fatal: the cache would otherwise lose dirty data silently.
    fn submit(&self, req: DeviceRequest) {
        let statuses = self.underlying.access(vec![req]);
        if statuses.iter().any(|s| s.is_fail()) {
            tracing::error!("underlying io failure");
            panic!("underlying io failure");
        }
    }
}

/// Build the sub-request for `sub`; a sub-range covering the whole original
/// is not a partial.
fn make_unit(orig: &Arc<OriginalRequest>, sub: SubRange, page: Arc<Page>) -> Box<PendingReq> {
    if sub.size == orig.size() {
        Box::new(PendingReq::whole(orig.clone(), page))
    } else {
        Box::new(PendingReq::partial(orig.clone(), sub, page))
    }
}

/// Copy between the original's payload and the page for `sub`, with the
/// page lock already held. A write marks the page dirty; the return value
/// reports whether this request dirtied it first. Releases the pin taken by
/// the lookup that produced the page.
fn complete_req_locked(
    orig: &Arc<OriginalRequest>,
    sub: &SubRange,
    page: &Arc<Page>,
    state: &mut PageState,
) -> bool {
    let page_off = (sub.offset - round_page(sub.offset)) as usize;
    let buf_off = (sub.offset - orig.offset()) as usize;
    let mut newly_dirty = false;
    match orig.method() {
        AccessMethod::Write => {
            {
                let src = orig.buf();
                state.data_mut()[page_off..page_off + sub.size]
                    .copy_from_slice(&src[buf_off..buf_off + sub.size]);
            }
            newly_dirty = !page.set_dirty(true);
        }
        AccessMethod::Read => {
            let mut dst = orig.buf();
            dst[buf_off..buf_off + sub.size]
                .copy_from_slice(&state.data()[page_off..page_off + sub.size]);
        }
    }
    page.dec_ref();
    newly_dirty
}

/// Like `complete_req_locked`, taking the page lock itself.
fn complete_req(orig: &Arc<OriginalRequest>, sub: &SubRange, page: &Arc<Page>) -> bool {
    let mut state = page.lock();
    complete_req_locked(orig, sub, page, &mut state)
}

/// Count `size` completed bytes on `orig`; on the last byte, wake the
/// synchronous waiter or deliver the user notification.
fn finalize_partial(orig: &Arc<OriginalRequest>, size: usize) {
    if orig.complete_bytes(size) {
        if orig.is_sync() {
            orig.wakeup(IoStatus::Ok);
        } else if let Some(io) = orig.io() {
            io.deliver(orig, IoStatus::Ok);
        }
    }
}

/// Terminal accounting for one sub-request: partials count their bytes,
/// a whole-request unit completes its original outright.
fn finalize_unit(unit: Box<PendingReq>) {
    if unit.partial {
        finalize_partial(&unit.orig, unit.size);
    } else {
        let orig = &unit.orig;
        if orig.is_sync() {
            orig.wakeup(IoStatus::Ok);
        } else if let Some(io) = orig.io() {
            io.deliver(orig, IoStatus::Ok);
        }
    }
}
