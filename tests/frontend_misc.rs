//! Front-end odds and ends: preload, simulated hit rate, read-only mode.

mod common;

use common::{PG, fixed_params, patterned, rig};
use oxistripe::constants::PAGE_SIZE;
use oxistripe::policy::CachePolicyKind;
use oxistripe::request::{AccessMethod, AccessRequest};

#[test]
fn test_preload_serves_reads_without_device_io() {
    let rig = rig(fixed_params(2, CachePolicyKind::Lru));
    rig.io.preload(0, 0, 8 * PAGE_SIZE).unwrap();

    let mut buf = vec![0u8; PAGE_SIZE];
    for pageno in 0..8i64 {
        assert!(rig.io.read_sync(0, pageno * PG, &mut buf).is_ok());
    }
    assert_eq!(rig.device.reads_issued(), 0);
    assert_eq!(rig.io.stats().cache_hits(), 8);
}

#[test]
fn test_preload_rejects_oversized_ranges() {
    let rig = rig(fixed_params(2, CachePolicyKind::Lru));
    let too_big = rig.system.manager().max_size() + PAGE_SIZE;
    assert!(rig.io.preload(0, 0, too_big).is_err());
}

#[test]
fn test_simulated_hit_rate_short_circuits_reads() {
    let mut params = fixed_params(2, CachePolicyKind::Lru);
    params.test_hit_rate = 100;
    let rig = rig(params);

    let mut buf = vec![0xffu8; PAGE_SIZE];
    assert!(rig.io.read_sync(0, 0, &mut buf).is_ok());
    // every access is simulated as a hit; the device is never touched and
    // the page serves its zeroed buffer
    assert_eq!(rig.device.reads_issued(), 0);
    assert!(buf.iter().all(|&b| b == 0));
}

#[test]
fn test_read_only_cache_rejects_writes() {
    let mut params = fixed_params(2, CachePolicyKind::Lru);
    params.writable = false;
    let rig = rig(params);

    assert!(rig.io.write_sync(0, 0, &patterned(PAGE_SIZE, 1)).is_fail());
    let statuses = rig.io.access(vec![AccessRequest {
        file_id: 0,
        offset: 0,
        method: AccessMethod::Write,
        buf: vec![0u8; 16].into_boxed_slice(),
    }]);
    assert!(matches!(statuses[0], oxistripe::io::AccessStatus::Fail));

    // reads still work
    rig.device.set_image(0, patterned(PAGE_SIZE, 2));
    let mut buf = vec![0u8; PAGE_SIZE];
    assert!(rig.io.read_sync(0, 0, &mut buf).is_ok());
}

#[test]
fn test_fast_path_counts_cached_requests() {
    let rig = rig(fixed_params(2, CachePolicyKind::Lru));
    rig.device.set_image(0, patterned(2 * PAGE_SIZE, 6));

    let mut buf = vec![0u8; 64];
    assert!(rig.io.read_sync(0, 0, &mut buf).is_ok());
    assert_eq!(rig.io.stats().num_fast_process(), 0);

    // a single-page hit on a ready page takes the stolen fast path
    assert!(rig.io.read_sync(0, 16, &mut buf).is_ok());
    assert_eq!(rig.io.stats().num_fast_process(), 1);
    assert_eq!(&buf[..], &patterned(2 * PAGE_SIZE, 6)[16..80]);
}
