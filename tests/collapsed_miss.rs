//! Concurrent misses on the same page collapse onto one device read.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Recorder, fixed_params, patterned, rig_with_mode, wait_until};
use oxistripe::constants::PAGE_SIZE;
use oxistripe::device::CompletionMode;
use oxistripe::policy::CachePolicyKind;
use oxistripe::request::{AccessMethod, AccessRequest};

const THREADS: usize = 8;

#[test]
fn test_eight_concurrent_readers_issue_one_read() {
    let rig = rig_with_mode(
        fixed_params(1, CachePolicyKind::Lru),
        CompletionMode::Manual,
    );
    let image = patterned(PAGE_SIZE, 42);
    rig.device.set_image(0, image.clone());

    let recorder = Recorder::new();
    rig.io.set_callback(recorder.clone());

    // all threads miss on page 0 while completions are held back
    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let io = rig.io.clone();
        handles.push(std::thread::spawn(move || {
            let req = AccessRequest {
                file_id: 0,
                offset: 0,
                method: AccessMethod::Read,
                buf: vec![0u8; PAGE_SIZE].into_boxed_slice(),
            };
            io.access(vec![req]);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // exactly one underlying read was issued for the shared page
    assert_eq!(rig.device.reads_issued(), 1);
    assert_eq!(rig.device.held_completions(), 1);

    // completing it fires every caller's callback with identical bytes
    rig.device.drain_completions();
    assert!(wait_until(Duration::from_secs(5), || {
        recorder.count() == THREADS
    }));

    let completions = recorder.completions();
    assert_eq!(completions.len(), THREADS);
    for (offset, size, status) in completions {
        assert_eq!(offset, 0);
        assert_eq!(size, PAGE_SIZE);
        assert!(status.is_ok());
    }

    // the cached page serves everyone the same data
    let mut buf = vec![0u8; PAGE_SIZE];
    rig.device.set_completion_mode(CompletionMode::Immediate);
    let status = rig.io.read_sync(0, 0, &mut buf);
    assert!(status.is_ok());
    assert_eq!(buf, image);
    assert_eq!(rig.device.reads_issued(), 1);
}
