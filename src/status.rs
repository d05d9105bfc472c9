//! Status codes and errors for cache operations.

use std::fmt;

/// Status of an I/O request issued to the cache or the underlying device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum IoStatus {
    /// Request completed successfully
    #[default]
    Ok = 0,
    /// Request was accepted and will complete via callback
    Pending = 1,
    /// Request failed in the underlying device
    Fail = 2,
    /// Request kind is not supported by the target
    Unsupported = 3,
}

impl IoStatus {
    /// Check if the status indicates success
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, IoStatus::Ok)
    }

    /// Check if the request is still pending
    #[inline]
    pub const fn is_pending(&self) -> bool {
        matches!(self, IoStatus::Pending)
    }

    /// Check if the request failed
    #[inline]
    pub const fn is_fail(&self) -> bool {
        matches!(self, IoStatus::Fail)
    }

    /// Get the status as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            IoStatus::Ok => "Ok",
            IoStatus::Pending => "Pending",
            IoStatus::Fail => "Fail",
            IoStatus::Unsupported => "Unsupported",
        }
    }
}

impl fmt::Display for IoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors raised while constructing or growing a cache
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The memory manager could not supply the requested page buffers.
    #[error("out of memory: cannot allocate {0} page buffers")]
    OutOfMemory(usize),
    /// Invalid construction parameter.
    #[error("init failure: {0}")]
    Init(String),
}
