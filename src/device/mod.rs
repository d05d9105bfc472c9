//! The underlying asynchronous I/O layer: the contract the cache consumes,
//! plus an in-memory device for tests and simulation.

mod mem;
mod traits;

pub use mem::{CompletionMode, MemDevice};
pub use traits::{IoCallback, UnderlyingIo};
