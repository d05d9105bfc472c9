//! Contract of the underlying asynchronous block layer.

use std::sync::Arc;

use crate::request::DeviceRequest;
use crate::status::IoStatus;

/// Receiver of device-request completions.
///
/// The cached I/O front-end registers one of these with its underlying I/O;
/// the device invokes it once a request's data transfer has finished.
/// Multi-buffer requests are handed over whole.
pub trait IoCallback: Send + Sync {
    /// Deliver completed requests
    fn invoke(&self, requests: Vec<DeviceRequest>);
}

/// An asynchronous block device endpoint.
///
/// `access` never blocks on the data transfer: it returns per-request
/// statuses (`Pending` for accepted requests) and delivers completions
/// through the registered callback, on whichever thread the implementation
/// chooses. Requests carry a node id so completions can be placed on the
/// proper I/O thread.
pub trait UnderlyingIo: Send + Sync {
    /// Submit requests; returns one status per request
    fn access(&self, requests: Vec<DeviceRequest>) -> Vec<IoStatus>;

    /// Register the completion receiver
    fn set_callback(&self, callback: Arc<dyn IoCallback>);

    /// The registered completion receiver
    fn callback(&self) -> Option<Arc<dyn IoCallback>>;

    /// Push out any batched submissions
    fn flush_requests(&self);

    /// Node this endpoint serves
    fn node_id(&self) -> u32;
}
