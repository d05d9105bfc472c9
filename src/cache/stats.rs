//! Cache and front-end statistics.
//!
//! Counters are incremented with relaxed atomics and no locks; approximate
//! accuracy under contention is acceptable.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by the associative cache itself.
#[derive(Default)]
pub struct CacheStats {
    evictions: AtomicU64,
    expansions: AtomicU64,
    rehashes: AtomicU64,
    busy_waits: AtomicU64,
}

impl CacheStats {
    /// Create zeroed statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a page eviction
    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed expansion round
    pub fn record_expansion(&self) {
        self.expansions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one cell rehash
    pub fn record_rehash(&self) {
        self.rehashes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a busy wait on a fully-referenced cell
    pub fn record_busy_wait(&self) {
        self.busy_waits.fetch_add(1, Ordering::Relaxed);
    }

    /// Pages evicted
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Expansion rounds run
    pub fn expansions(&self) -> u64 {
        self.expansions.load(Ordering::Relaxed)
    }

    /// Cells rehashed
    pub fn rehashes(&self) -> u64 {
        self.rehashes.load(Ordering::Relaxed)
    }

    /// Busy waits on fully-referenced cells
    pub fn busy_waits(&self) -> u64 {
        self.busy_waits.load(Ordering::Relaxed)
    }
}

/// Counters maintained by a cached I/O front-end.
#[derive(Default)]
pub struct FrontendStats {
    num_accesses: AtomicU64,
    cache_hits: AtomicU64,
    num_fast_process: AtomicU64,
    num_waits: AtomicU64,
}

impl FrontendStats {
    /// Create zeroed statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one page access; returns the running total
    pub fn record_access(&self) -> u64 {
        self.num_accesses.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record a cache hit
    pub fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `n` requests completed on the cached fast path
    pub fn record_fast_process(&self, n: usize) {
        self.num_fast_process.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Record a synchronous wait
    pub fn record_wait(&self) {
        self.num_waits.fetch_add(1, Ordering::Relaxed);
    }

    /// Page accesses seen
    pub fn num_accesses(&self) -> u64 {
        self.num_accesses.load(Ordering::Relaxed)
    }

    /// Page accesses that hit the cache
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Requests completed on the fast path
    pub fn num_fast_process(&self) -> u64 {
        self.num_fast_process.load(Ordering::Relaxed)
    }

    /// Synchronous waits taken
    pub fn num_waits(&self) -> u64 {
        self.num_waits.load(Ordering::Relaxed)
    }
}
