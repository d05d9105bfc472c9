//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use oxistripe::config::CacheParams;
use oxistripe::constants::{CELL_SIZE, PAGE_SIZE};
use oxistripe::device::{CompletionMode, MemDevice};
use oxistripe::io::{CachedIo, CompletionHandler};
use oxistripe::policy::CachePolicyKind;
use oxistripe::request::OriginalRequest;
use oxistripe::status::IoStatus;
use oxistripe::system::CacheSystem;

/// A system + device + one front-end, wired together the way production
/// code does it.
pub struct TestRig {
    pub system: CacheSystem,
    pub device: Arc<MemDevice>,
    pub io: Arc<CachedIo>,
}

/// Build a rig; the flush engine shares the front-end's device.
pub fn rig(params: CacheParams) -> TestRig {
    rig_with_mode(params, CompletionMode::Immediate)
}

/// Build a rig with the given device completion mode.
pub fn rig_with_mode(params: CacheParams, mode: CompletionMode) -> TestRig {
    let device = MemDevice::with_mode(0, mode);
    let mut system = CacheSystem::new(params).expect("cache construction");
    system.start_flush_engine(device.clone());
    let io = Arc::new(system.create_cached_io(device.clone()));
    TestRig { system, device, io }
}

/// A fixed-size, non-expandable cache of `ncells` cells.
pub fn fixed_params(ncells: usize, kind: CachePolicyKind) -> CacheParams {
    CacheParams {
        cache_size: ncells * CELL_SIZE * PAGE_SIZE,
        expandable: false,
        cache_type: kind,
        // keep the flush engine quiet unless a test drives it
        dirty_pages_threshold: CELL_SIZE + 1,
        ..CacheParams::default()
    }
}

/// A deterministic byte pattern distinguishing every page and position.
pub fn patterned(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// Completion recorder registered as the front-end callback.
#[derive(Default)]
pub struct Recorder {
    count: AtomicUsize,
    completions: Mutex<Vec<(i64, usize, IoStatus)>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn completions(&self) -> Vec<(i64, usize, IoStatus)> {
        self.completions.lock().clone()
    }
}

impl CompletionHandler for Recorder {
    fn complete(&self, orig: &Arc<OriginalRequest>, status: IoStatus) {
        self.completions
            .lock()
            .push((orig.offset(), orig.size(), status));
        self.count.fetch_add(1, Ordering::AcqRel);
    }
}

/// Poll `cond` until it holds or the timeout elapses.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

pub const PG: i64 = PAGE_SIZE as i64;
