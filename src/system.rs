//! The cache system object.
//!
//! One `CacheSystem` owns everything that used to be process-wide state:
//! the resolved parameters, the page-buffer manager, the shared cache and
//! its flush engine. The factories for caches and cached I/O endpoints hang
//! off it.

use std::sync::Arc;

use crate::cache::{AssociativeCache, MemoryManager};
use crate::config::CacheParams;
use crate::device::UnderlyingIo;
use crate::flush::FlushEngine;
use crate::io::CachedIo;
use crate::status::CacheError;

/// Owns one cache, its buffer budget and its flush engine.
pub struct CacheSystem {
    params: CacheParams,
    manager: Arc<MemoryManager>,
    cache: Arc<AssociativeCache>,
    flush: Option<Arc<FlushEngine>>,
}

impl CacheSystem {
    /// Build the manager and the cache from resolved parameters.
    pub fn new(params: CacheParams) -> Result<Self, CacheError> {
        let manager = MemoryManager::new(params.cache_size);
        let cache = AssociativeCache::with_params(&params, manager.clone())?;
        Ok(Self {
            params,
            manager,
            cache,
            flush: None,
        })
    }

    /// Start the background flush engine, writing back through `io`.
    /// Read-only systems do not flush; the call is ignored for them.
    pub fn start_flush_engine(&mut self, io: Arc<dyn UnderlyingIo>) {
        if !self.params.writable || self.flush.is_some() {
            return;
        }
        let engine = FlushEngine::start(
            &self.cache,
            io,
            self.params.dirty_pages_threshold,
            self.params.raid_block_pages,
        );
        self.flush = Some(engine);
    }

    /// Create a cached I/O endpoint wrapping `underlying`. Intended to be
    /// called once per I/O thread.
    pub fn create_cached_io(&self, underlying: Arc<dyn UnderlyingIo>) -> CachedIo {
        CachedIo::new(self.cache.clone(), underlying, &self.params)
    }

    /// The shared cache
    pub fn cache(&self) -> &Arc<AssociativeCache> {
        &self.cache
    }

    /// The page-buffer manager
    pub fn manager(&self) -> &Arc<MemoryManager> {
        &self.manager
    }

    /// The flush engine, once started
    pub fn flush_engine(&self) -> Option<&Arc<FlushEngine>> {
        self.flush.as_ref()
    }

    /// The resolved parameters
    pub fn params(&self) -> &CacheParams {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{CELL_SIZE, PAGE_SIZE};
    use crate::device::MemDevice;
    use crate::policy::CachePolicyKind;

    fn small_params() -> CacheParams {
        CacheParams {
            cache_size: 4 * CELL_SIZE * PAGE_SIZE,
            expandable: false,
            cache_type: CachePolicyKind::Lru,
            ..CacheParams::default()
        }
    }

    #[test]
    fn test_system_construction() {
        let system = CacheSystem::new(small_params()).unwrap();
        assert_eq!(system.cache().size_pages(), 4 * CELL_SIZE);
        assert!(system.flush_engine().is_none());
    }

    #[test]
    fn test_flush_engine_respects_writable() {
        let mut params = small_params();
        params.writable = false;
        let mut system = CacheSystem::new(params).unwrap();
        system.start_flush_engine(MemDevice::new(0));
        assert!(system.flush_engine().is_none());

        let mut system = CacheSystem::new(small_params()).unwrap();
        system.start_flush_engine(MemDevice::new(0));
        assert!(system.flush_engine().is_some());
    }

    #[test]
    fn test_create_cached_io() {
        let system = CacheSystem::new(small_params()).unwrap();
        let device = MemDevice::new(0);
        let io = system.create_cached_io(device.clone());
        assert_eq!(io.node_id(), 0);
        assert!(Arc::ptr_eq(io.cache(), system.cache()));
    }
}
