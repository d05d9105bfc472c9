//! The memory manager owns the page-buffer budget shared by every cell of a
//! cache, and possibly by several caches. Cells evict pages themselves; the
//! manager only allocates buffers and bounds the working set.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::cache::AssociativeCache;
use crate::constants::PAGE_SIZE;

/// Allocates page data buffers against a fixed budget.
pub struct MemoryManager {
    max_pages: usize,
    allocated: AtomicUsize,
    caches: Mutex<Vec<Weak<AssociativeCache>>>,
}

impl MemoryManager {
    /// A manager bounding the working set to `max_size` bytes
    pub fn new(max_size: usize) -> Arc<Self> {
        Arc::new(Self {
            max_pages: max_size / PAGE_SIZE,
            allocated: AtomicUsize::new(0),
            caches: Mutex::new(Vec::new()),
        })
    }

    /// Register a cache so it can be asked to shrink on shortage
    pub fn register_cache(&self, cache: &Arc<AssociativeCache>) {
        self.caches.lock().push(Arc::downgrade(cache));
    }

    /// Allocate `n` zeroed page buffers, or `None` on shortage.
    ///
    /// On shortage the registered caches (the caller first) are asked to
    /// shrink; the request fails if they cannot free enough pages.
    pub fn get_free_pages(
        &self,
        n: usize,
        caller: Option<&AssociativeCache>,
    ) -> Option<Vec<Box<[u8]>>> {
        loop {
            let cur = self.allocated.load(Ordering::Acquire);
            if cur + n > self.max_pages {
                if self.shrink_caches(n, caller) == 0 {
                    return None;
                }
                continue;
            }
            if self
                .allocated
                .compare_exchange(cur, cur + n, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        Some(
            (0..n)
                .map(|_| vec![0u8; PAGE_SIZE].into_boxed_slice())
                .collect(),
        )
    }

    fn shrink_caches(&self, npages: usize, caller: Option<&AssociativeCache>) -> usize {
        let mut freed = 0;
        if let Some(cache) = caller {
            freed += cache.shrink(npages);
        }
        let caches = self.caches.lock();
        for weak in caches.iter() {
            if freed >= npages {
                break;
            }
            if let Some(cache) = weak.upgrade() {
                freed += cache.shrink(npages - freed);
            }
        }
        freed
    }

    /// Pages handed out so far
    pub fn allocated_pages(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// The budget in pages
    pub fn max_pages(&self) -> usize {
        self.max_pages
    }

    /// The budget in bytes
    pub fn max_size(&self) -> usize {
        self.max_pages * PAGE_SIZE
    }

    /// The fair share of the budget per registered cache, in pages. Used as
    /// the growth threshold: a cache below its share may expand.
    pub fn average_cache_size(&self) -> usize {
        let ncaches = self.caches.lock().len().max(1);
        self.max_pages / ncaches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_within_budget() {
        let manager = MemoryManager::new(8 * PAGE_SIZE);
        let pages = manager.get_free_pages(4, None).unwrap();
        assert_eq!(pages.len(), 4);
        assert_eq!(pages[0].len(), PAGE_SIZE);
        assert_eq!(manager.allocated_pages(), 4);
    }

    #[test]
    fn test_allocation_exhausts_budget() {
        let manager = MemoryManager::new(4 * PAGE_SIZE);
        assert!(manager.get_free_pages(4, None).is_some());
        assert!(manager.get_free_pages(1, None).is_none());
    }

    #[test]
    fn test_average_with_no_caches() {
        let manager = MemoryManager::new(64 * PAGE_SIZE);
        assert_eq!(manager.average_cache_size(), 64);
    }
}
