//! Hash cells: the fixed-capacity buckets of the associative cache and its
//! unit of locking and eviction.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::cache::{AssociativeCache, MemoryManager};
use crate::constants::CELL_SIZE;
use crate::page::{CellBuffer, Page};
use crate::policy::{CachePolicyKind, EvictionPolicy};
use crate::status::CacheError;

/// The cell overflowed: a hot page was evicted and the table should grow
pub const CELL_OVERFLOW: u8 = 1 << 0;
/// The cell is queued for the flush engine
pub const CELL_IN_FLUSH_QUEUE: u8 = 1 << 1;

/// Signal that the directory was rehashed while a search was in progress;
/// the search must restart because the target cell may have changed.
#[derive(Debug)]
pub struct Expanded;

/// Result of a full cell search.
pub struct SearchOutcome {
    /// The page now holding the requested offset; pinned and hit-counted
    pub page: Arc<Page>,
    /// True when the offset was found by scan (no eviction happened)
    pub hit: bool,
    /// On a miss, the evictee's prior offset, or -1 when the page had never
    /// been used. Always -1 on a hit.
    pub old_off: i64,
}

struct CellInner {
    buf: CellBuffer,
    policy: EvictionPolicy,
}

/// A bucket of `CELL_SIZE` pages guarded by one lock.
pub struct HashCell {
    hash: usize,
    flags: AtomicU8,
    inner: Mutex<CellInner>,
}

impl HashCell {
    /// Build the cell at logical index `hash`, drawing page buffers from
    /// the memory manager.
    pub fn new(
        hash: usize,
        kind: CachePolicyKind,
        node_id: u32,
        manager: &MemoryManager,
        owner: Option<&AssociativeCache>,
    ) -> Result<Self, CacheError> {
        let bufs = manager
            .get_free_pages(CELL_SIZE, owner)
            .ok_or(CacheError::OutOfMemory(CELL_SIZE))?;
        let pages = bufs
            .into_iter()
            .map(|data| Arc::new(Page::new(node_id, data)))
            .collect();
        Ok(Self {
            hash,
            flags: AtomicU8::new(0),
            inner: Mutex::new(CellInner {
                buf: CellBuffer::new(pages),
                policy: EvictionPolicy::new(kind),
            }),
        })
    }

    /// The cell's logical index in the directory
    #[inline]
    pub fn hash(&self) -> usize {
        self.hash
    }

    /// Set a cell flag; returns true if it was already set
    pub fn set_flag(&self, flag: u8) -> bool {
        self.flags.fetch_or(flag, Ordering::AcqRel) & flag != 0
    }

    /// Clear a cell flag
    pub fn clear_flag(&self, flag: u8) {
        self.flags.fetch_and(!flag, Ordering::AcqRel);
    }

    /// Test a cell flag
    pub fn test_flag(&self, flag: u8) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    /// The cell overflowed and wants the table to grow
    pub fn is_overflow(&self) -> bool {
        self.test_flag(CELL_OVERFLOW)
    }

    /// Whether the cell sits in the flush queue
    pub fn is_in_queue(&self) -> bool {
        self.test_flag(CELL_IN_FLUSH_QUEUE)
    }

    /// Mark or unmark the cell as queued for flushing; returns the previous
    /// state when marking.
    pub fn set_in_queue(&self, in_queue: bool) -> bool {
        if in_queue {
            self.set_flag(CELL_IN_FLUSH_QUEUE)
        } else {
            self.clear_flag(CELL_IN_FLUSH_QUEUE);
            true
        }
    }

    /// Hit-only fast path: find `off` in the cell, pin it and count the hit.
    /// Returns `None` on a miss without evicting anything.
    pub fn search_hit(&self, off: i64) -> Option<Arc<Page>> {
        let inner = self.inner.lock();
        let mut ret = None;
        for i in 0..CELL_SIZE {
            let pg = inner.buf.get_page(i);
            if pg.offset() == off {
                ret = Some(pg.clone());
                break;
            }
        }
        if let Some(pg) = &ret {
            if pg.hits() == u8::MAX {
                inner.buf.scale_down_hits();
            }
            pg.inc_ref();
            pg.hit();
        }
        ret
    }

    /// Full search: find `off` or claim an empty page for it.
    ///
    /// On a miss, the evictee's offset is reassigned under the cell lock so
    /// other threads observe the new identity even before data is ready; a
    /// dirty evictee transitions to old-dirty. Returns `Err(Expanded)` when
    /// this thread ran a table expansion and the search must restart.
    pub fn search(
        &self,
        off: i64,
        file_id: u32,
        cache: &AssociativeCache,
    ) -> Result<SearchOutcome, Expanded> {
        let mut inner = self.inner.lock();

        let mut found = None;
        for i in 0..CELL_SIZE {
            let pg = inner.buf.get_page(i);
            if pg.offset() == off {
                found = Some(pg.clone());
                break;
            }
        }

        let (page, hit, old_off) = match found {
            Some(pg) => {
                let cell = &mut *inner;
                cell.policy.access_page(&pg, &cell.buf);
                (pg, true, -1)
            }
            None => {
                let (guard, pg) = self.get_empty_page(inner, cache)?;
                inner = guard;
                if pg.is_dirty() && !pg.is_old_dirty() {
                    pg.set_dirty(false);
                    pg.set_old_dirty(true);
                }
                let old_off = if pg.is_initialized() { pg.offset() } else { -1 };
                // reassign the identity while the lock is held
                pg.set_offset(off);
                pg.set_file_id(file_id);
                cache.stats().record_eviction();
                (pg, false, old_off)
            }
        };

        // data in the page may not be ready yet
        page.inc_ref();
        if page.hits() == u8::MAX {
            inner.buf.scale_down_hits();
        }
        page.hit();
        Ok(SearchOutcome { page, hit, old_off })
    }

    /// Claim an evictable page, waiting out fully-pinned cells and
    /// triggering a table expansion when the policy reports overflow.
    fn get_empty_page<'a>(
        &'a self,
        mut inner: MutexGuard<'a, CellInner>,
        cache: &AssociativeCache,
    ) -> Result<(MutexGuard<'a, CellInner>, Arc<Page>), Expanded> {
        let mut expanded = false;
        loop {
            let cell = &mut *inner;
            match cell.policy.evict_page(&cell.buf) {
                None => {
                    // every page is pinned; release the lock so other
                    // threads can still search, then poll for an unpin
                    tracing::warn!(cell = self.hash, "all pages in the cell are referenced");
                    cache.stats().record_busy_wait();
                    drop(inner);
                    loop {
                        std::hint::spin_loop();
                        let guard = self.inner.lock();
                        if (0..CELL_SIZE).any(|i| guard.buf.get_page(i).ref_count() == 0) {
                            inner = guard;
                            break;
                        }
                    }
                }
                Some(victim) => {
                    if cache.is_expandable() && inner.policy.expand_buffer(&victim) {
                        self.set_flag(CELL_OVERFLOW);
                        let below_average = cache.size_pages()
                            < cache.manager().average_cache_size();
                        if below_average && !expanded {
                            drop(inner);
                            if cache.expand(self) {
                                return Err(Expanded);
                            }
                            // another thread is expanding; retry the eviction
                            inner = self.inner.lock();
                            expanded = true;
                            continue;
                        }
                    }
                    return Ok((inner, victim));
                }
            }
        }
    }

    /// Move the pages that now map to `expanded` over to it.
    ///
    /// Both cell locks are taken in ascending hash order. A page mapping to
    /// neither cell is stale (inserted during a concurrent expansion round)
    /// and is marked with one hit so it dies quickly; a page that should
    /// move but is pinned is skipped the same way.
    pub fn rehash(&self, expanded: &HashCell, cache: &AssociativeCache) {
        debug_assert!(self.hash < expanded.hash);
        let mut this = self.inner.lock();
        let mut other = expanded.inner.lock();
        let mut j = 0;
        for i in 0..CELL_SIZE {
            let pg = this.buf.get_page(i).clone();
            if !pg.is_initialized() {
                continue;
            }
            let h1 = cache.rehash_index(pg.offset());
            if h1 != self.hash && h1 != expanded.hash {
                pg.set_hits(1);
                continue;
            }
            if h1 == expanded.hash {
                if pg.ref_count() > 0 {
                    pg.set_hits(1);
                    continue;
                }
                debug_assert!(j < CELL_SIZE);
                let free = other.buf.get_page(j).clone();
                debug_assert!(!free.is_initialized());
                this.buf.set(i, free);
                other.buf.set(j, pg);
                j += 1;
            }
        }
        drop(other);
        drop(this);
        cache.stats().record_rehash();
        self.clear_flag(CELL_OVERFLOW);
    }

    /// Collect every dirty page without pending I/O, pinned, keyed by
    /// offset. Pages already being written back are skipped.
    pub fn get_dirty_pages(&self, pages: &mut BTreeMap<i64, Arc<Page>>) {
        let inner = self.inner.lock();
        for i in 0..CELL_SIZE {
            let pg = inner.buf.get_page(i);
            // a pinned page can't be evicted, so it won't turn old-dirty
            // under us; skipping io-pending pages avoids handing the flush
            // engine work already in flight
            if pg.is_dirty() && !pg.is_io_pending() {
                pg.inc_ref();
                pages.insert(pg.offset(), pg.clone());
            }
        }
    }

    /// Count pages whose flags contain `set` and exclude `clear`
    pub fn num_pages(&self, set: u8, clear: u8) -> usize {
        let inner = self.inner.lock();
        (0..CELL_SIZE)
            .filter(|&i| inner.buf.get_page(i).test_flags(set, clear))
            .count()
    }
}
