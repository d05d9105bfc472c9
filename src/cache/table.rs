//! The associative cache: a linear-hashing directory of hash cells.
//!
//! The directory is two-level: a vector of pointers to fixed-size cell
//! segments of `init_ncells` each, guarded by a reader/writer lock. Readers
//! hold the lock only while computing an index and cloning a segment
//! pointer; the cell itself is used after the lock is released, because cell
//! operations may block on I/O. Writers hold the lock only to publish newly
//! allocated segments and to advance `split`/`level`.

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::cache::cell::{Expanded, HashCell, SearchOutcome};
use crate::cache::{CacheStats, MemoryManager};
use crate::config::CacheParams;
use crate::constants::{CELL_SIZE, DEFAULT_INIT_CACHE_SIZE, PAGE_SHIFT, PAGE_SIZE};
use crate::flush::FlushEngine;
use crate::page::Page;
use crate::policy::CachePolicyKind;
use crate::status::CacheError;

/// A fixed-size array of cells; the unit of directory growth.
pub struct CellSegment {
    cells: Box<[HashCell]>,
}

impl CellSegment {
    fn new(
        start: usize,
        count: usize,
        kind: CachePolicyKind,
        node_id: u32,
        manager: &MemoryManager,
        owner: Option<&AssociativeCache>,
    ) -> Result<Self, CacheError> {
        let mut cells = Vec::with_capacity(count);
        for i in 0..count {
            cells.push(HashCell::new(start + i, kind, node_id, manager, owner)?);
        }
        tracing::debug!(start, count, "created hash cells");
        Ok(Self {
            cells: cells.into_boxed_slice(),
        })
    }

    fn len(&self) -> usize {
        self.cells.len()
    }

    fn cell(&self, i: usize) -> &HashCell {
        &self.cells[i]
    }
}

/// A handle to one cell that outlives the directory lock. The segment
/// pointer keeps the cell alive across concurrent expansions.
pub struct CellRef {
    seg: Arc<CellSegment>,
    idx: usize,
}

impl Clone for CellRef {
    fn clone(&self) -> Self {
        Self {
            seg: self.seg.clone(),
            idx: self.idx,
        }
    }
}

impl std::ops::Deref for CellRef {
    type Target = HashCell;

    fn deref(&self) -> &HashCell {
        self.seg.cell(self.idx)
    }
}

struct Directory {
    segments: Vec<Arc<CellSegment>>,
    ncells: usize,
    split: usize,
    level: u32,
}

impl Directory {
    /// Cells addressed by `h1` in the current round
    fn size(&self, init_ncells: usize) -> usize {
        (1usize << self.level) * init_ncells
    }

    /// Cell index for a byte offset under the current `(level, split)`
    fn index_of(&self, off: i64, init_ncells: usize) -> usize {
        let pageno = (off as u64 >> PAGE_SHIFT) as usize;
        let size = self.size(init_ncells);
        let h1 = pageno % size;
        if h1 >= self.split {
            h1
        } else {
            pageno % (2 * size)
        }
    }
}

/// A concurrent page cache addressed by linear hashing.
pub struct AssociativeCache {
    init_ncells: usize,
    expandable: bool,
    policy: CachePolicyKind,
    node_id: u32,
    manager: Arc<MemoryManager>,
    table: RwLock<Directory>,
    /// Single-expander latch (`TABLE_EXPANDING`)
    expanding: AtomicBool,
    stats: CacheStats,
    flush: OnceLock<Arc<FlushEngine>>,
}

impl AssociativeCache {
    /// Create a cache able to grow up to `cache_size` bytes.
    ///
    /// An expandable cache starts at `init_cache_size` (default: the lesser
    /// of 128 MiB and `cache_size`) and doubles on demand; a non-expandable
    /// cache is built at full size immediately.
    pub fn new(
        cache_size: usize,
        init_cache_size: Option<usize>,
        policy: CachePolicyKind,
        node_id: u32,
        expandable: bool,
        manager: Arc<MemoryManager>,
    ) -> Result<Arc<Self>, CacheError> {
        let mut init_size = init_cache_size.unwrap_or(DEFAULT_INIT_CACHE_SIZE.min(cache_size));
        if !expandable {
            // nothing to grow into, build the whole table up front
            init_size = cache_size;
        }
        if init_size > cache_size {
            return Err(CacheError::Init(format!(
                "initial cache size {init_size} exceeds cache size {cache_size}"
            )));
        }
        let npages = init_size / PAGE_SIZE;
        if npages < CELL_SIZE {
            return Err(CacheError::Init(format!(
                "cache of {init_size} bytes is smaller than one cell"
            )));
        }
        let init_ncells = npages / CELL_SIZE;

        let cache = Arc::new(Self {
            init_ncells,
            expandable,
            policy,
            node_id,
            manager: manager.clone(),
            table: RwLock::new(Directory {
                segments: Vec::new(),
                ncells: 0,
                split: 0,
                level: 0,
            }),
            expanding: AtomicBool::new(false),
            stats: CacheStats::new(),
            flush: OnceLock::new(),
        });

        let seg = CellSegment::new(0, init_ncells, policy, node_id, &manager, Some(cache.as_ref()))?;
        {
            let mut dir = cache.table.write();
            dir.ncells = seg.len();
            dir.segments.push(Arc::new(seg));
        }
        manager.register_cache(&cache);
        Ok(cache)
    }

    /// Create a cache from resolved parameters
    pub fn with_params(
        params: &CacheParams,
        manager: Arc<MemoryManager>,
    ) -> Result<Arc<Self>, CacheError> {
        Self::new(
            params.cache_size,
            params.init_cache_size,
            params.cache_type,
            0,
            params.expandable,
            manager,
        )
    }

    /// Whether the table may grow
    #[inline]
    pub fn is_expandable(&self) -> bool {
        self.expandable
    }

    /// The configured eviction policy
    #[inline]
    pub fn policy(&self) -> CachePolicyKind {
        self.policy
    }

    /// Node the cache allocates on
    #[inline]
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// The shared buffer manager
    #[inline]
    pub fn manager(&self) -> &Arc<MemoryManager> {
        &self.manager
    }

    /// Cache statistics
    #[inline]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Current number of cells
    pub fn ncells(&self) -> usize {
        self.table.read().ncells
    }

    /// Current cache size in pages
    pub fn size_pages(&self) -> usize {
        self.ncells() * CELL_SIZE
    }

    /// Current expansion round
    pub fn level(&self) -> u32 {
        self.table.read().level
    }

    /// Next cell index to be rehashed
    pub fn split(&self) -> usize {
        self.table.read().split
    }

    /// The cell currently responsible for `off`
    pub fn cell_for_offset(&self, off: i64) -> CellRef {
        let dir = self.table.read();
        let idx = dir.index_of(off, self.init_ncells);
        CellRef {
            seg: dir.segments[idx / self.init_ncells].clone(),
            idx: idx % self.init_ncells,
        }
    }

    /// The cell at logical index `idx`
    fn cell_at(&self, idx: usize) -> CellRef {
        let dir = self.table.read();
        CellRef {
            seg: dir.segments[idx / self.init_ncells].clone(),
            idx: idx % self.init_ncells,
        }
    }

    /// The index a page maps to once the current round's split reaches it.
    /// Used by `rehash` to decide which of the two cells keeps a page.
    pub fn rehash_index(&self, off: i64) -> usize {
        let dir = self.table.read();
        let pageno = (off as u64 >> PAGE_SHIFT) as usize;
        pageno % (2 * dir.size(self.init_ncells))
    }

    /// Hit-only lookup: pin and return the page holding `off`, if cached
    pub fn search_hit(&self, off: i64) -> Option<Arc<Page>> {
        self.cell_for_offset(off).search_hit(off)
    }

    /// Full lookup: find `off` or claim a page for it, restarting whenever
    /// a concurrent expansion remapped the target cell.
    pub fn search(&self, off: i64, file_id: u32) -> SearchOutcome {
        loop {
            let cell = self.cell_for_offset(off);
            match cell.search(off, file_id, self) {
                Ok(outcome) => return outcome,
                Err(Expanded) => continue,
            }
        }
    }

    /// Grow the table until `trigger` is no longer overflowed.
    ///
    /// Returns true when this thread ran the expansion (searches in
    /// progress must restart); false when another thread already holds the
    /// expansion latch or allocation failed.
    pub fn expand(&self, trigger: &HashCell) -> bool {
        if self.expanding.swap(true, Ordering::AcqRel) {
            // another thread is expanding the table
            return false;
        }

        // single expander from here on
        while trigger.is_overflow() {
            let (split, size) = {
                let dir = self.table.read();
                (dir.split, dir.size(self.init_ncells))
            };
            let target = split + size;

            let seg_needed = target / self.init_ncells;
            let nsegs = self.table.read().segments.len();
            if seg_needed >= nsegs {
                // build the new segments outside the write lock
                let mut created = Vec::new();
                let mut out_of_memory = false;
                for s in nsegs..=seg_needed {
                    match CellSegment::new(
                        s * self.init_ncells,
                        self.init_ncells,
                        self.policy,
                        self.node_id,
                        &self.manager,
                        Some(self),
                    ) {
                        Ok(seg) => created.push(Arc::new(seg)),
                        Err(err) => {
                            tracing::warn!(%err, "cannot grow the cell table");
                            out_of_memory = true;
                            break;
                        }
                    }
                }
                if !created.is_empty() {
                    let mut dir = self.table.write();
                    for seg in created {
                        dir.ncells += seg.len();
                        dir.segments.push(seg);
                    }
                }
                if out_of_memory {
                    self.expanding.store(false, Ordering::Release);
                    return false;
                }
            }

            let src = self.cell_at(split);
            let dst = self.cell_at(target);
            src.rehash(&dst, self);
            self.stats.record_expansion();

            let mut dir = self.table.write();
            dir.split += 1;
            if dir.split == size {
                dir.level += 1;
                dir.split = 0;
                tracing::info!(level = dir.level, "increased hash table level");
                break;
            }
        }

        self.expanding.store(false, Ordering::Release);
        true
    }

    /// The logical neighbor after `cell`, if any
    pub fn get_next_cell(&self, cell: &CellRef) -> Option<CellRef> {
        let idx = cell.hash();
        if idx + 1 < self.ncells() {
            Some(self.cell_at(idx + 1))
        } else {
            None
        }
    }

    /// The logical neighbor before `cell`, if any
    pub fn get_prev_cell(&self, cell: &CellRef) -> Option<CellRef> {
        let idx = cell.hash();
        if idx > 0 { Some(self.cell_at(idx - 1)) } else { None }
    }

    /// Hand newly dirtied pages to the flush engine, which queues their
    /// cells once they cross the dirty threshold.
    pub fn mark_dirty_pages(&self, pages: &[Arc<Page>]) {
        if pages.is_empty() {
            return;
        }
        if let Some(flush) = self.flush.get() {
            flush.dirty_pages(pages);
        }
    }

    /// Attach the flush engine. Only the first attachment takes effect.
    pub fn set_flush_engine(&self, engine: Arc<FlushEngine>) {
        let _ = self.flush.set(engine);
    }

    /// The attached flush engine, if any
    pub fn flush_engine(&self) -> Option<&Arc<FlushEngine>> {
        self.flush.get()
    }

    /// Give pages back to the memory manager. Eviction happens inside
    /// cells; this cache type does not release buffers once allocated.
    pub(crate) fn shrink(&self, _npages: usize) -> usize {
        0
    }
}
