//! oxistripe - a concurrent associative page cache for striped files
//!
//! This crate implements the core page-cache engine of an asynchronous I/O
//! subsystem for large files striped across multiple storage devices:
//!
//! - **Associative cache**: a concurrent hash table of fixed-size cells, each
//!   holding a small bounded set of pages with per-cell pluggable eviction
//!   (LRU / LFU / FIFO / CLOCK / GCLOCK).
//! - **Linear hashing**: the table doubles one cell at a time, on demand,
//!   while serving live lookups.
//! - **Cached I/O front-end**: decomposes user requests into pages, collapses
//!   duplicate concurrent misses, and serializes partial-page writes behind
//!   synthetic read-fill requests.
//! - **Flush engine**: writes back dirty pages opportunistically, merging
//!   adjacent pages into large sequential writes bounded by the RAID block.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use oxistripe::prelude::*;
//!
//! let system = CacheSystem::new(CacheParams::default())?;
//! let io = system.create_cached_io(device);
//!
//! io.write_sync(0, 0, &data);
//! io.read_sync(0, 0, &mut buf);
//! ```

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod cache;
pub mod config;
pub mod device;
pub mod flush;
pub mod io;
pub mod mapper;
pub mod page;
pub mod policy;
pub mod request;
pub mod status;
pub mod system;
mod utility;

// Re-exports for convenience
pub use page::Page;
pub use request::{AccessMethod, AccessRequest};
pub use status::{CacheError, IoStatus};

/// Constants used throughout the library
pub mod constants {
    /// Size of a cache page in bytes
    pub const PAGE_SIZE: usize = 4096;

    /// log2 of the page size
    pub const PAGE_SHIFT: u32 = 12;

    /// Offset value of a page that has never held data
    pub const PAGE_INVALID_OFFSET: i64 = -1;

    /// Number of pages per hash cell
    pub const CELL_SIZE: usize = 16;

    /// Maximum number of pages batched into one read request
    pub const MAX_NUM_IOVECS: usize = 8;

    /// Io-vec entries stored inline in a request before spilling to the heap
    pub const NUM_EMBEDDED_IOVECS: usize = 4;

    /// Capacity of the flush engine's dirty-cell queue
    pub const MAX_NUM_DIRTY_CELLS_IN_QUEUE: usize = 256;

    /// Default initial size of an expandable cache (bytes)
    pub const DEFAULT_INIT_CACHE_SIZE: usize = 128 * 1024 * 1024;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::cache::{AssociativeCache, MemoryManager};
    pub use crate::config::{CacheParams, OxistripeConfig};
    pub use crate::device::UnderlyingIo;
    pub use crate::io::{AccessStatus, CachedIo};
    pub use crate::policy::CachePolicyKind;
    pub use crate::request::{AccessMethod, AccessRequest};
    pub use crate::status::{CacheError, IoStatus};
    pub use crate::system::CacheSystem;
}
