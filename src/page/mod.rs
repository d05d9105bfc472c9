//! Cache pages: fixed-size blocks of a striped file region.
//!
//! A page carries its identity (file id + page-aligned offset), a pin count,
//! a saturating 8-bit hit counter, a word of state flags readable without a
//! lock, and a lock-protected interior holding the data buffer and the chain
//! of requests waiting on the page.

mod cell_buffer;

pub use cell_buffer::CellBuffer;

use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU32, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::constants::{PAGE_INVALID_OFFSET, PAGE_SIZE};
use crate::request::PendingReq;

/// Page data is filled and valid
pub const DATA_READY: u8 = 1 << 0;
/// An underlying I/O request naming this page is outstanding
pub const IO_PENDING: u8 = 1 << 1;
/// Page content differs from the backing device
pub const DIRTY: u8 = 1 << 2;
/// The page identity was reassigned while its prior dirty contents are still
/// being written back
pub const OLD_DIRTY: u8 = 1 << 3;

/// One `PAGE_SIZE` block of a backing file region.
pub struct Page {
    file_id: AtomicU32,
    offset: AtomicI64,
    node_id: u32,
    refcnt: AtomicU32,
    hits: AtomicU8,
    flags: AtomicU8,
    state: Mutex<PageState>,
}

/// The lock-protected interior of a page: its data buffer and the pending
/// request chain.
pub struct PageState {
    data: Box<[u8]>,
    pending: Option<Box<PendingReq>>,
}

impl Page {
    /// Create a page backed by `data` (must be `PAGE_SIZE` bytes), with no
    /// identity and no state bits set.
    pub fn new(node_id: u32, data: Box<[u8]>) -> Self {
        assert_eq!(data.len(), PAGE_SIZE);
        Self {
            file_id: AtomicU32::new(0),
            offset: AtomicI64::new(PAGE_INVALID_OFFSET),
            node_id,
            refcnt: AtomicU32::new(0),
            hits: AtomicU8::new(0),
            flags: AtomicU8::new(0),
            state: Mutex::new(PageState {
                data,
                pending: None,
            }),
        }
    }

    /// Acquire the page lock, guarding data, flag transitions and the
    /// pending chain.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, PageState> {
        self.state.lock()
    }

    /// Current page-aligned offset, or `PAGE_INVALID_OFFSET`
    #[inline]
    pub fn offset(&self) -> i64 {
        self.offset.load(Ordering::Acquire)
    }

    /// Reassign the page's offset. Callers must hold the owning cell's lock
    /// so the new identity is visible before data is ready.
    #[inline]
    pub fn set_offset(&self, off: i64) {
        self.offset.store(off, Ordering::Release);
    }

    /// File the page belongs to
    #[inline]
    pub fn file_id(&self) -> u32 {
        self.file_id.load(Ordering::Acquire)
    }

    /// Reassign the page's file id (together with `set_offset`)
    #[inline]
    pub fn set_file_id(&self, file_id: u32) {
        self.file_id.store(file_id, Ordering::Release);
    }

    /// NUMA node the page's buffer was allocated on
    #[inline]
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// A page is initialized once it has held a real offset
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.offset() != PAGE_INVALID_OFFSET
    }

    /// Current pin count
    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    /// Pin the page; a pinned page may not be evicted
    #[inline]
    pub fn inc_ref(&self) {
        self.refcnt.fetch_add(1, Ordering::AcqRel);
    }

    /// Unpin the page
    #[inline]
    pub fn dec_ref(&self) {
        let prev = self.refcnt.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    /// Current hit count
    #[inline]
    pub fn hits(&self) -> u8 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Record a hit, saturating at 255. Returns the new count.
    #[inline]
    pub fn hit(&self) -> u8 {
        let prev = self
            .hits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |h| {
                if h == u8::MAX { None } else { Some(h + 1) }
            });
        match prev {
            Ok(h) => h + 1,
            Err(_) => u8::MAX,
        }
    }

    /// Overwrite the hit count
    #[inline]
    pub fn set_hits(&self, hits: u8) {
        self.hits.store(hits, Ordering::Relaxed);
    }

    /// Clear the hit count
    #[inline]
    pub fn reset_hits(&self) {
        self.hits.store(0, Ordering::Relaxed);
    }

    /// Test whether every bit of `set` is set and no bit of `clear` is
    #[inline]
    pub fn test_flags(&self, set: u8, clear: u8) -> bool {
        let flags = self.flags.load(Ordering::Acquire);
        flags & set == set && flags & clear == 0
    }

    #[inline]
    fn set_flag(&self, flag: u8, value: bool) -> bool {
        let prev = if value {
            self.flags.fetch_or(flag, Ordering::AcqRel)
        } else {
            self.flags.fetch_and(!flag, Ordering::AcqRel)
        };
        prev & flag != 0
    }

    /// Data is filled and valid
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.test_flags(DATA_READY, 0)
    }

    /// Mark the data valid or invalid
    #[inline]
    pub fn set_data_ready(&self, ready: bool) {
        self.set_flag(DATA_READY, ready);
    }

    /// Page content differs from the device
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.test_flags(DIRTY, 0)
    }

    /// Set or clear the dirty bit; returns the previous value
    #[inline]
    pub fn set_dirty(&self, dirty: bool) -> bool {
        self.set_flag(DIRTY, dirty)
    }

    /// An underlying request naming this page is outstanding
    #[inline]
    pub fn is_io_pending(&self) -> bool {
        self.test_flags(IO_PENDING, 0)
    }

    /// Set or clear the io-pending bit; returns the previous value
    #[inline]
    pub fn set_io_pending(&self, pending: bool) -> bool {
        self.set_flag(IO_PENDING, pending)
    }

    /// Prior dirty contents are still being written back
    #[inline]
    pub fn is_old_dirty(&self) -> bool {
        self.test_flags(OLD_DIRTY, 0)
    }

    /// Set or clear the old-dirty bit
    #[inline]
    pub fn set_old_dirty(&self, old_dirty: bool) {
        self.set_flag(OLD_DIRTY, old_dirty);
    }
}

impl PageState {
    /// Page data
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable page data
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Push a request onto the pending chain (LIFO)
    pub fn add_req(&mut self, mut req: Box<PendingReq>) {
        req.next = self.pending.take();
        self.pending = Some(req);
    }

    /// Atomically take the whole pending chain, leaving it empty
    pub fn take_reqs(&mut self) -> Option<Box<PendingReq>> {
        self.pending.take()
    }

    /// Whether any request is queued on the page
    pub fn has_reqs(&self) -> bool {
        self.pending.is_some()
    }
}
