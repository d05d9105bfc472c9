//! Cache-level behaviors: hit-counter saturation and page identity.

mod common;

use std::sync::Arc;

use common::PG;
use oxistripe::cache::{AssociativeCache, MemoryManager};
use oxistripe::constants::{CELL_SIZE, PAGE_SIZE};
use oxistripe::policy::CachePolicyKind;

fn one_cell_cache() -> Arc<AssociativeCache> {
    let manager = MemoryManager::new(CELL_SIZE * PAGE_SIZE);
    AssociativeCache::new(
        CELL_SIZE * PAGE_SIZE,
        None,
        CachePolicyKind::Lru,
        0,
        false,
        manager,
    )
    .unwrap()
}

#[test]
fn test_hit_counter_saturates_and_halves_cell_wide() {
    let cache = one_cell_cache();

    // a cold neighbor whose count should halve along with the hot page
    let neighbor = cache.search(PG, 0);
    neighbor.page.dec_ref();
    let neighbor_page = neighbor.page;
    for _ in 0..4 {
        let outcome = cache.search(PG, 0);
        outcome.page.dec_ref();
    }
    let neighbor_hits_before = neighbor_page.hits();
    assert_eq!(neighbor_hits_before, 5);

    // hammer page 0 far past the 8-bit saturation point
    let hot = cache.search(0, 0);
    hot.page.dec_ref();
    let hot_page = hot.page;
    for _ in 0..300 {
        let outcome = cache.search(0, 0);
        outcome.page.dec_ref();
    }

    // saturation forced a cell-wide halving; relative order survives even
    // though absolute counts are approximate
    assert!(hot_page.hits() < u8::MAX);
    assert!(hot_page.hits() > neighbor_page.hits());
    assert!(neighbor_page.hits() < neighbor_hits_before);
}

#[test]
fn test_same_offset_resolves_to_one_page() {
    let cache = one_cell_cache();
    let first = cache.search(0, 0);
    let second = cache.search(0, 0);
    assert!(Arc::ptr_eq(&first.page, &second.page));
    assert!(second.hit);
    first.page.dec_ref();
    second.page.dec_ref();
}

#[test]
fn test_pinned_pages_are_not_evicted() {
    // CLOCK walks past pinned pages instead of waiting on them
    let manager = MemoryManager::new(CELL_SIZE * PAGE_SIZE);
    let cache = AssociativeCache::new(
        CELL_SIZE * PAGE_SIZE,
        None,
        CachePolicyKind::Clock,
        0,
        false,
        manager,
    )
    .unwrap();

    // pin one page, then fill and churn the rest of the cell
    let pinned = cache.search(0, 0);
    for round in 0..3i64 {
        for i in 1..CELL_SIZE as i64 {
            let outcome = cache.search((round * (CELL_SIZE as i64 - 1) + i) * PG, 0);
            outcome.page.dec_ref();
        }
    }

    // the pinned page kept its identity through all the churn
    assert_eq!(pinned.page.offset(), 0);
    let again = cache.search(0, 0);
    assert!(again.hit);
    assert!(Arc::ptr_eq(&again.page, &pinned.page));
    again.page.dec_ref();
    pinned.page.dec_ref();
}

#[test]
fn test_dirty_evictee_turns_old_dirty() {
    let cache = one_cell_cache();

    let victim = cache.search(0, 0);
    {
        let _state = victim.page.lock();
        victim.page.set_data_ready(true);
        victim.page.set_dirty(true);
    }
    victim.page.dec_ref();

    // fill the remaining slots, then push one more page through
    for i in 1..=CELL_SIZE as i64 {
        let outcome = cache.search(i * PG, 0);
        outcome.page.dec_ref();
    }

    // the dirty page was reassigned; its dirty bit moved to old-dirty
    let survivor = cache.search(CELL_SIZE as i64 * PG, 0);
    assert!(survivor.hit);
    let page = survivor.page;
    assert!(page.is_old_dirty() || !page.is_dirty());
    page.dec_ref();

    // the old offset no longer resolves to the page
    let replaced = cache.search_hit(0);
    assert!(replaced.is_none() || !Arc::ptr_eq(replaced.as_ref().unwrap(), &page));
    if let Some(p) = replaced {
        p.dec_ref();
    }
}
