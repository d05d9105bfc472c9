//! I/O requests.
//!
//! Three request shapes flow through the engine:
//!
//! - [`OriginalRequest`]: the heap copy of a user request. It owns the user
//!   payload buffer and a completion byte-counter; sub-requests reference it
//!   and the last completed byte delivers the user notification.
//! - [`PendingReq`]: a page-confined sub-request. A *partial* covers less
//!   than the original's span and holds a back-reference to it (the
//!   original never references another original, so the linkage is flat).
//!   Pending requests chain through `next` while queued on a page.
//! - [`DeviceRequest`]: a request issued to the underlying I/O, carrying one
//!   page buffer or a vector of them plus the context needed to route its
//!   completion.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex, MutexGuard};
use smallvec::SmallVec;

use crate::constants::{NUM_EMBEDDED_IOVECS, PAGE_SIZE};
use crate::page::Page;
use crate::status::IoStatus;
use crate::utility::{round_page, within_one_page};

/// Direction of an access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AccessMethod {
    /// Read from the device into the caller's buffer
    Read,
    /// Write the caller's buffer to the device
    Write,
}

/// A user request as submitted to the cached I/O front-end. Covers
/// `[offset, offset + buf.len())` of one file.
pub struct AccessRequest {
    /// File being accessed
    pub file_id: u32,
    /// Byte offset within the file (need not be page-aligned)
    pub offset: i64,
    /// Read or write
    pub method: AccessMethod,
    /// Owned payload: source bytes for a write, destination for a read
    pub buf: Box<[u8]>,
}

/// The front-end a request was submitted through. Completions resolve
/// pending re-queueing and user notification through this seam, so several
/// front-ends may share one cache.
pub trait RequestIo: Send + Sync {
    /// Queue a sub-request for reissue on the front-end's next drain
    fn queue_pending(&self, req: Box<PendingReq>);
    /// Invoke the user completion callback for `orig`
    fn deliver(&self, orig: &Arc<OriginalRequest>, status: IoStatus);
}

/// A byte range of an original request confined to whole-page extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubRange {
    /// Absolute byte offset of the sub-range
    pub offset: i64,
    /// Length in bytes
    pub size: usize,
}

/// The heap-allocated copy of a user request.
pub struct OriginalRequest {
    file_id: u32,
    offset: i64,
    size: usize,
    method: AccessMethod,
    node_id: u32,
    sync: bool,
    io: Weak<dyn RequestIo>,
    buf: Mutex<Box<[u8]>>,
    completed: AtomicUsize,
    done: Mutex<Option<IoStatus>>,
    cond: Condvar,
}

impl OriginalRequest {
    /// Duplicate a user request onto the heap, bound to its front-end.
    pub fn new(
        req: AccessRequest,
        sync: bool,
        node_id: u32,
        io: Weak<dyn RequestIo>,
    ) -> Arc<Self> {
        Arc::new(Self {
            file_id: req.file_id,
            offset: req.offset,
            size: req.buf.len(),
            method: req.method,
            node_id,
            sync,
            io,
            buf: Mutex::new(req.buf),
            completed: AtomicUsize::new(0),
            done: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    /// A request not bound to any front-end. Completions are counted but
    /// not delivered anywhere; intended for tests and internal probes.
    pub fn detached(req: AccessRequest) -> Arc<Self> {
        let io: Weak<dyn RequestIo> = Weak::<NullIo>::new();
        Self::new(req, false, 0, io)
    }

    /// File being accessed
    #[inline]
    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    /// Absolute byte offset of the request
    #[inline]
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Request length in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Read or write
    #[inline]
    pub fn method(&self) -> AccessMethod {
        self.method
    }

    /// Node the request was submitted from
    #[inline]
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Whether a caller is blocked waiting on this request
    #[inline]
    pub fn is_sync(&self) -> bool {
        self.sync
    }

    /// The issuing front-end, if still alive
    pub fn io(&self) -> Option<Arc<dyn RequestIo>> {
        self.io.upgrade()
    }

    /// Lock the payload buffer
    pub fn buf(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.buf.lock()
    }

    /// Run `f` on the payload buffer
    pub fn with_buf<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.buf.lock())
    }

    /// Whether the whole request fits in one page
    #[inline]
    pub fn within_one_page(&self) -> bool {
        within_one_page(self.offset, self.size)
    }

    /// First and one-past-last page offsets covered by the request
    pub fn page_span(&self) -> (i64, i64) {
        (
            round_page(self.offset),
            crate::utility::round_up_page(self.offset + self.size as i64),
        )
    }

    /// The intersection of this request with the `npages` pages starting at
    /// the page-aligned `page_off`.
    pub fn extract(&self, page_off: i64, npages: usize) -> SubRange {
        debug_assert_eq!(page_off, round_page(page_off));
        let span = (npages * PAGE_SIZE) as i64;
        if page_off == round_page(self.offset) {
            // the sub-range starts at the request's own offset
            let size = (span - (self.offset - page_off)).min(self.size as i64);
            SubRange {
                offset: self.offset,
                size: size as usize,
            }
        } else {
            let remaining = self.size as i64 - (page_off - self.offset);
            debug_assert!(remaining > 0);
            SubRange {
                offset: page_off,
                size: remaining.min(span) as usize,
            }
        }
    }

    /// Record `n` completed bytes; returns true when the whole request has
    /// completed and the caller must deliver the terminal notification.
    pub fn complete_bytes(&self, n: usize) -> bool {
        let total = self.completed.fetch_add(n, Ordering::AcqRel) + n;
        debug_assert!(total <= self.size);
        total >= self.size
    }

    /// Bytes completed so far
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    /// Signal a blocked synchronous caller
    pub fn wakeup(&self, status: IoStatus) {
        let mut done = self.done.lock();
        *done = Some(status);
        self.cond.notify_all();
    }

    /// Block until `wakeup` is called (synchronous requests only)
    pub fn wait(&self) -> IoStatus {
        let mut done = self.done.lock();
        while done.is_none() {
            self.cond.wait(&mut done);
        }
        done.unwrap_or(IoStatus::Fail)
    }

    /// Wait for `wakeup` at most `dur`; `None` on timeout
    pub fn wait_timeout(&self, dur: std::time::Duration) -> Option<IoStatus> {
        let mut done = self.done.lock();
        if done.is_none() {
            let _ = self.cond.wait_for(&mut done, dur);
        }
        *done
    }
}

struct NullIo;

impl RequestIo for NullIo {
    fn queue_pending(&self, _req: Box<PendingReq>) {}
    fn deliver(&self, _orig: &Arc<OriginalRequest>, _status: IoStatus) {}
}

/// A page-confined sub-request, chainable on a page's pending queue.
pub struct PendingReq {
    /// The original request this derives from
    pub orig: Arc<OriginalRequest>,
    /// Absolute byte offset of the covered sub-range
    pub offset: i64,
    /// Length of the covered sub-range
    pub size: usize,
    /// True when the sub-range is smaller than the original's span
    pub partial: bool,
    /// Read or write
    pub method: AccessMethod,
    /// The page the sub-request targets
    pub page: Arc<Page>,
    /// Next request in the page's pending chain
    pub next: Option<Box<PendingReq>>,
}

impl PendingReq {
    /// A sub-request covering `sub` of `orig`
    pub fn partial(orig: Arc<OriginalRequest>, sub: SubRange, page: Arc<Page>) -> Self {
        debug_assert!(sub.size < orig.size());
        let method = orig.method();
        Self {
            orig,
            offset: sub.offset,
            size: sub.size,
            partial: true,
            method,
            page,
            next: None,
        }
    }

    /// A sub-request covering the whole of `orig`
    pub fn whole(orig: Arc<OriginalRequest>, page: Arc<Page>) -> Self {
        let (offset, size, method) = (orig.offset(), orig.size(), orig.method());
        Self {
            orig,
            offset,
            size,
            partial: false,
            method,
            page,
            next: None,
        }
    }

    /// The covered byte range
    #[inline]
    pub fn sub(&self) -> SubRange {
        SubRange {
            offset: self.offset,
            size: self.size,
        }
    }
}

/// Hand every request of a pending chain back to the front-end it was
/// submitted through.
pub(crate) fn requeue_chain(mut chain: Option<Box<PendingReq>>) {
    while let Some(mut unit) = chain {
        chain = unit.next.take();
        if let Some(io) = unit.orig.io() {
            io.queue_pending(unit);
        }
    }
}

/// One page buffer of a device request.
pub struct IoBuf {
    /// The page whose data buffer backs this io-vec entry
    pub page: Arc<Page>,
}

/// Routing context of a device request's completion.
pub enum ReqContext {
    /// Issued by the flush engine; completion clears dirty bits only
    Flush,
    /// A read issued on behalf of an original request (cache fill)
    Fill(Arc<OriginalRequest>),
    /// An old-dirty write-back anchored by a queued sub-request that must be
    /// reissued once the write completes
    Evict(Box<PendingReq>),
}

/// A request issued to the underlying asynchronous I/O. Either a single
/// page buffer or a vector of them; the first few io-vec entries are stored
/// inline, the rest spill to the heap.
pub struct DeviceRequest {
    /// File being accessed
    pub file_id: u32,
    /// Page-aligned byte offset of the first buffer
    pub offset: i64,
    /// Read or write
    pub method: AccessMethod,
    /// Node the request should complete on
    pub node_id: u32,
    /// Completion routing context
    pub context: ReqContext,
    /// Page buffers in ascending offset order
    pub bufs: SmallVec<[IoBuf; NUM_EMBEDDED_IOVECS]>,
}

impl DeviceRequest {
    /// An empty request; buffers are added with `add_page`
    pub fn new(
        file_id: u32,
        offset: i64,
        method: AccessMethod,
        node_id: u32,
        context: ReqContext,
    ) -> Self {
        Self {
            file_id,
            offset,
            method,
            node_id,
            context,
            bufs: SmallVec::new(),
        }
    }

    /// Append a page at the tail of the buffer vector
    pub fn add_page(&mut self, page: Arc<Page>) {
        self.bufs.push(IoBuf { page });
    }

    /// Prepend a page; the caller re-bases `offset`
    pub fn add_page_front(&mut self, page: Arc<Page>) {
        self.bufs.insert(0, IoBuf { page });
    }

    /// Number of page buffers
    #[inline]
    pub fn num_bufs(&self) -> usize {
        self.bufs.len()
    }

    /// Whether no buffer has been added yet
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    /// Total transfer size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.bufs.len() * PAGE_SIZE
    }

    /// One past the last covered byte
    #[inline]
    pub fn end_offset(&self) -> i64 {
        self.offset + self.size() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_orig(offset: i64, size: usize, method: AccessMethod) -> Arc<OriginalRequest> {
        OriginalRequest::detached(AccessRequest {
            file_id: 0,
            offset,
            method,
            buf: vec![0u8; size].into_boxed_slice(),
        })
    }

    #[test]
    fn test_extract_first_page_unaligned() {
        let orig = new_orig(50, 100, AccessMethod::Write);
        let sub = orig.extract(0, 1);
        assert_eq!(sub.offset, 50);
        assert_eq!(sub.size, 100);
    }

    #[test]
    fn test_extract_spanning_pages() {
        let orig = new_orig(100, 8192, AccessMethod::Read);
        let first = orig.extract(0, 1);
        assert_eq!(first.offset, 100);
        assert_eq!(first.size, 4096 - 100);
        let second = orig.extract(4096, 1);
        assert_eq!(second.offset, 4096);
        assert_eq!(second.size, 4096);
        let third = orig.extract(8192, 1);
        assert_eq!(third.offset, 8192);
        assert_eq!(third.size, 100);
    }

    #[test]
    fn test_extract_multi_page() {
        let orig = new_orig(0, 16384, AccessMethod::Read);
        let sub = orig.extract(0, 2);
        assert_eq!(sub.offset, 0);
        assert_eq!(sub.size, 8192);
        let tail = orig.extract(8192, 2);
        assert_eq!(tail.offset, 8192);
        assert_eq!(tail.size, 8192);
    }

    #[test]
    fn test_complete_bytes() {
        let orig = new_orig(0, 8192, AccessMethod::Read);
        assert!(!orig.complete_bytes(4096));
        assert_eq!(orig.completed(), 4096);
        assert!(orig.complete_bytes(4096));
    }

    #[test]
    fn test_within_one_page() {
        assert!(new_orig(50, 100, AccessMethod::Read).within_one_page());
        assert!(!new_orig(4000, 200, AccessMethod::Read).within_one_page());
    }

    #[test]
    fn test_page_span() {
        let orig = new_orig(100, 8192, AccessMethod::Read);
        assert_eq!(orig.page_span(), (0, 12288));
    }

    #[test]
    fn test_sync_wait_wakeup() {
        let orig = new_orig(0, 16, AccessMethod::Read);
        orig.wakeup(IoStatus::Ok);
        assert_eq!(orig.wait(), IoStatus::Ok);
    }

    #[test]
    fn test_device_request_front_rebases() {
        let page_a = Arc::new(Page::new(0, vec![0u8; PAGE_SIZE].into_boxed_slice()));
        let page_b = Arc::new(Page::new(0, vec![0u8; PAGE_SIZE].into_boxed_slice()));
        let mut req = DeviceRequest::new(0, 8192, AccessMethod::Write, 0, ReqContext::Flush);
        req.add_page(page_a);
        assert_eq!(req.end_offset(), 8192 + 4096);
        req.add_page_front(page_b);
        req.offset = 4096;
        assert_eq!(req.num_bufs(), 2);
        assert_eq!(req.end_offset(), 12288);
    }
}
