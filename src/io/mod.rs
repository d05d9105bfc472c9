//! The cached I/O front-end.

mod cached;

pub use cached::{AccessStatus, CachedIo, CompletionHandler};
