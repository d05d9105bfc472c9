//! Linear-hashing expansion under a hot working set.

mod common;

use common::{PG, patterned, rig};
use oxistripe::config::CacheParams;
use oxistripe::constants::{CELL_SIZE, PAGE_SIZE};
use oxistripe::policy::CachePolicyKind;

/// An expandable cache starting at two cells inside a budget of sixteen.
fn expandable_params() -> CacheParams {
    CacheParams {
        cache_size: 16 * CELL_SIZE * PAGE_SIZE,
        init_cache_size: Some(2 * CELL_SIZE * PAGE_SIZE),
        expandable: true,
        cache_type: CachePolicyKind::Lru,
        dirty_pages_threshold: CELL_SIZE + 1,
        ..CacheParams::default()
    }
}

#[test]
fn test_rewritten_evictee_expands_the_table() {
    let rig = rig(expandable_params());
    let npages = 64;
    rig.device.set_image(0, patterned(npages * PAGE_SIZE, 11));
    let mut buf = vec![0u8; PAGE_SIZE];

    // fill cell 0: with two cells, even page numbers all hash to it
    let even_pages: Vec<i64> = (0..CELL_SIZE as i64).map(|i| 2 * i).collect();
    for &pageno in &even_pages {
        assert!(rig.io.read_sync(0, pageno * PG, &mut buf).is_ok());
    }
    assert_eq!(rig.system.cache().ncells(), 2);

    // touch everything again so every page in the cell is hot
    for &pageno in &even_pages {
        assert!(rig.io.read_sync(0, pageno * PG, &mut buf).is_ok());
    }

    // one more even page forces an eviction of a hot page, which
    // overflows the cell and doubles the table
    let extra = 2 * CELL_SIZE as i64;
    assert!(rig.io.read_sync(0, extra * PG, &mut buf).is_ok());

    let cache = rig.system.cache();
    assert!(
        cache.split() > 0 || cache.level() > 0,
        "expansion did not advance the split pointer"
    );
    assert!(cache.ncells() > 2);
    assert!(cache.stats().expansions() > 0);

    // at most one page (the evictee) misses; everything else survived the
    // rehash and is found at its new cell
    let mut misses = 0;
    for &pageno in &even_pages {
        let outcome = cache.search(pageno * PG, 0);
        if !outcome.hit {
            misses += 1;
        }
        outcome.page.dec_ref();
    }
    assert!(misses <= 1, "expansion lost {misses} pages");
}

#[test]
fn test_gclock_hot_victim_expands_the_table() {
    let mut params = expandable_params();
    params.cache_type = CachePolicyKind::Gclock;
    let rig = rig(params);
    rig.device.set_image(0, patterned(64 * PAGE_SIZE, 17));
    let mut buf = vec![0u8; PAGE_SIZE];

    // fill cell 0, then reheat it twice; claiming a slot costs its
    // predecessor one count under gclock, so two extra passes leave every
    // page with more than one hit
    let even_pages: Vec<i64> = (0..CELL_SIZE as i64).map(|i| 2 * i).collect();
    for _ in 0..3 {
        for &pageno in &even_pages {
            assert!(rig.io.read_sync(0, pageno * PG, &mut buf).is_ok());
        }
    }

    // the next eviction has to strip a hot victim, which overflows the
    // cell and doubles the table
    let extra = 2 * CELL_SIZE as i64;
    assert!(rig.io.read_sync(0, extra * PG, &mut buf).is_ok());

    let cache = rig.system.cache();
    assert!(
        cache.split() > 0 || cache.level() > 0,
        "gclock eviction did not trigger an expansion"
    );
    assert!(cache.ncells() > 2);
    assert!(cache.stats().expansions() > 0);

    let mut misses = 0;
    for &pageno in &even_pages {
        let outcome = cache.search(pageno * PG, 0);
        if !outcome.hit {
            misses += 1;
        }
        outcome.page.dec_ref();
    }
    assert!(misses <= 1, "expansion lost {misses} pages");
}

#[test]
fn test_expansion_preserves_data() {
    let rig = rig(expandable_params());
    let npages = 64;
    let image = patterned(npages * PAGE_SIZE, 23);
    rig.device.set_image(0, image.clone());
    let mut buf = vec![0u8; PAGE_SIZE];

    // same trigger sequence as above: fill, reheat, overflow
    let even_pages: Vec<i64> = (0..CELL_SIZE as i64).map(|i| 2 * i).collect();
    for _ in 0..2 {
        for &pageno in &even_pages {
            assert!(rig.io.read_sync(0, pageno * PG, &mut buf).is_ok());
        }
    }
    let extra = 2 * CELL_SIZE as i64;
    assert!(rig.io.read_sync(0, extra * PG, &mut buf).is_ok());
    assert!(rig.system.cache().ncells() > 2);

    // every page reads back correctly after the table doubled, whether it
    // was rehashed, left in place, or re-fetched
    for pageno in even_pages.into_iter().chain([extra]) {
        assert!(rig.io.read_sync(0, pageno * PG, &mut buf).is_ok());
        let base = pageno as usize * PAGE_SIZE;
        assert_eq!(&buf[..], &image[base..base + PAGE_SIZE]);
    }
}
