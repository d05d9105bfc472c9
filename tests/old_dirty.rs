//! Evicting a dirty page: the evictor writes the old contents back while
//! later arrivals queue behind the old-dirty page.

mod common;

use std::time::Duration;

use common::{PG, Recorder, fixed_params, patterned, rig, rig_with_mode, wait_until};
use oxistripe::constants::{CELL_SIZE, PAGE_SIZE};
use oxistripe::device::CompletionMode;
use oxistripe::policy::CachePolicyKind;
use oxistripe::request::{AccessMethod, AccessRequest};

/// Fill the single cell so the next distinct page evicts the oldest entry.
fn fill_cell(rig: &common::TestRig, skip: i64) {
    let mut buf = vec![0u8; PAGE_SIZE];
    for pageno in 0..CELL_SIZE as i64 {
        if pageno == skip {
            continue;
        }
        assert!(rig.io.read_sync(0, pageno * PG, &mut buf).is_ok());
    }
}

#[test]
fn test_evicted_dirty_page_is_written_back() {
    let rig = rig(fixed_params(1, CachePolicyKind::Lru));
    rig.device
        .set_image(0, patterned((CELL_SIZE + 2) * PAGE_SIZE, 3));

    // dirty page 0, then fill the rest of the cell behind it
    let payload = patterned(PAGE_SIZE, 0x40);
    assert!(rig.io.write_sync(0, 0, &payload).is_ok());
    fill_cell(&rig, 0);
    assert_eq!(rig.device.writes_issued(), 0);

    // one more page evicts the dirty page; its contents must reach the
    // device before the page serves its new identity
    let mut buf = vec![0u8; PAGE_SIZE];
    let extra = CELL_SIZE as i64;
    assert!(rig.io.read_sync(0, extra * PG, &mut buf).is_ok());

    assert_eq!(rig.device.writes_issued(), 1);
    assert_eq!(&rig.device.image(0)[..PAGE_SIZE], &payload[..]);
    // the new identity was read and served
    let expected = patterned((CELL_SIZE + 2) * PAGE_SIZE, 3);
    assert_eq!(
        &buf[..],
        &expected[extra as usize * PAGE_SIZE..(extra as usize + 1) * PAGE_SIZE]
    );
}

#[test]
fn test_second_observer_queues_behind_old_dirty_page() {
    let rig = rig_with_mode(
        fixed_params(1, CachePolicyKind::Lru),
        CompletionMode::Immediate,
    );
    rig.device
        .set_image(0, patterned((CELL_SIZE + 2) * PAGE_SIZE, 5));
    let recorder = Recorder::new();
    rig.io.set_callback(recorder.clone());

    // dirty page 0 and fill the cell
    let payload = patterned(PAGE_SIZE, 0x7c);
    assert!(rig.io.write_sync(0, 0, &payload).is_ok());
    fill_cell(&rig, 0);

    // hold the eviction write-back in flight
    rig.device.set_completion_mode(CompletionMode::Manual);
    let extra = CELL_SIZE as i64;
    let read_req = |pageno: i64| AccessRequest {
        file_id: 0,
        offset: pageno * PG,
        method: AccessMethod::Read,
        buf: vec![0u8; PAGE_SIZE].into_boxed_slice(),
    };

    // the first observer evicts the dirty page and owns the write-back
    let statuses = rig.io.access(vec![read_req(extra)]);
    assert!(statuses[0].is_pending());
    assert_eq!(rig.device.writes_issued(), 1);
    {
        let page = rig.system.cache().search_hit(extra * PG).expect("cached");
        assert!(page.is_old_dirty());
        page.dec_ref();
    }

    // the second observer sees the old-dirty page and queues; no second
    // write-back is issued
    let statuses = rig.io.access(vec![read_req(extra)]);
    assert!(statuses[0].is_pending());
    assert_eq!(rig.device.writes_issued(), 1);

    // completing the write-back requeues both readers; their reads then
    // fill the page's new identity
    rig.device.set_completion_mode(CompletionMode::Immediate);
    rig.device.drain_completions();
    rig.io.process_pending_requests();

    assert!(wait_until(Duration::from_secs(5), || recorder.count() == 2));
    assert_eq!(rig.device.writes_issued(), 1);
    assert_eq!(&rig.device.image(0)[..PAGE_SIZE], &payload[..]);

    {
        let page = rig.system.cache().search_hit(extra * PG).expect("cached");
        assert!(!page.is_old_dirty());
        assert!(page.is_ready());
        page.dec_ref();
    }
}
