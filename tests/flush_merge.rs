//! The flush engine merges adjacent dirty pages into large writes bounded
//! by the RAID block.

mod common;

use std::time::Duration;

use common::{PG, fixed_params, patterned, rig, wait_until};
use oxistripe::constants::PAGE_SIZE;
use oxistripe::policy::CachePolicyKind;

#[test]
fn test_sixteen_adjacent_pages_flush_as_one_write() {
    let rig = rig(fixed_params(16, CachePolicyKind::Lru));
    let engine = rig.system.flush_engine().expect("flush engine").clone();

    // dirty one full RAID block (16 pages); full-page writes need no fill
    for pageno in 0..16i64 {
        let payload = patterned(PAGE_SIZE, pageno as u8);
        assert!(rig.io.write_sync(0, pageno * PG, &payload).is_ok());
    }
    assert_eq!(rig.device.writes_issued(), 0);

    // flushing the first cell pulls the whole block along
    assert!(engine.queue_cell(rig.system.cache().cell_for_offset(0)));
    assert!(wait_until(Duration::from_secs(5), || {
        !rig.device.write_log().is_empty()
    }));

    assert_eq!(rig.device.write_log(), vec![(0, 16)]);

    // dirty bits are cleared once the write lands
    assert!(wait_until(Duration::from_secs(5), || {
        let page = rig.system.cache().search_hit(0).expect("page cached");
        let clean = !page.is_dirty() && !page.is_io_pending();
        page.dec_ref();
        clean
    }));

    // the device image holds every page's payload
    let image = rig.device.image(0);
    for pageno in 0..16usize {
        let expected = patterned(PAGE_SIZE, pageno as u8);
        assert_eq!(
            &image[pageno * PAGE_SIZE..(pageno + 1) * PAGE_SIZE],
            &expected[..],
            "page {pageno} content"
        );
    }
}

#[test]
fn test_straddling_pages_split_on_the_raid_boundary() {
    let rig = rig(fixed_params(16, CachePolicyKind::Lru));
    let engine = rig.system.flush_engine().expect("flush engine").clone();

    // 17 adjacent dirty pages crossing the block boundary at page 16
    for pageno in 8..=24i64 {
        let payload = patterned(PAGE_SIZE, pageno as u8);
        assert!(rig.io.write_sync(0, pageno * PG, &payload).is_ok());
    }

    // the cell holding page 8 anchors requests on both sides of the split
    assert!(engine.queue_cell(rig.system.cache().cell_for_offset(8 * PG)));
    assert!(wait_until(Duration::from_secs(5), || {
        rig.device.write_log().len() == 2
    }));

    // one write per RAID block, split exactly on the boundary
    assert_eq!(rig.device.write_log(), vec![(8 * PG, 8), (16 * PG, 9)]);

    let image = rig.device.image(0);
    for pageno in 8..=24usize {
        let expected = patterned(PAGE_SIZE, pageno as u8);
        assert_eq!(
            &image[pageno * PAGE_SIZE..(pageno + 1) * PAGE_SIZE],
            &expected[..],
            "page {pageno} content"
        );
    }
}

#[test]
fn test_dirty_threshold_queues_cells_automatically() {
    let mut params = fixed_params(2, CachePolicyKind::Lru);
    // every dirtied page pushes its cell over the threshold
    params.dirty_pages_threshold = 0;
    let rig = rig(params);
    assert!(rig.system.flush_engine().is_some());

    // two adjacent dirty pages: the flush worker picks their cells up on
    // its own and merges them into one write
    assert!(rig.io.write_sync(0, 0, &patterned(PAGE_SIZE, 1)).is_ok());
    assert!(rig.io.write_sync(0, PG, &patterned(PAGE_SIZE, 2)).is_ok());

    assert!(wait_until(Duration::from_secs(5), || {
        rig.device.pages_written() >= 2
    }));
}
