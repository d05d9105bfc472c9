//! Per-cell eviction policies.
//!
//! Each policy picks a victim among the `CELL_SIZE` pages of one cell. The
//! policies are a closed set, modeled as a tagged enum dispatched by the
//! cell while holding its lock.

use std::str::FromStr;
use std::sync::Arc;

use crate::constants::CELL_SIZE;
use crate::page::{CellBuffer, Page};

/// Identifier of an eviction policy. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CachePolicyKind {
    /// Least recently used
    Lru,
    /// Least frequently used (hit-count scan)
    Lfu,
    /// Insertion order; for benchmarking only
    Fifo,
    /// Rotating hand, hits reset on second chance
    Clock,
    /// Rotating hand, hits decremented on second chance
    Gclock,
}

impl CachePolicyKind {
    /// Name used in configuration files
    pub const fn as_str(&self) -> &'static str {
        match self {
            CachePolicyKind::Lru => "lru",
            CachePolicyKind::Lfu => "lfu",
            CachePolicyKind::Fifo => "fifo",
            CachePolicyKind::Clock => "clock",
            CachePolicyKind::Gclock => "gclock",
        }
    }
}

impl FromStr for CachePolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(CachePolicyKind::Lru),
            "lfu" => Ok(CachePolicyKind::Lfu),
            "fifo" => Ok(CachePolicyKind::Fifo),
            "clock" => Ok(CachePolicyKind::Clock),
            "gclock" => Ok(CachePolicyKind::Gclock),
            other => Err(format!("unknown cache policy: {other}")),
        }
    }
}

impl std::fmt::Display for CachePolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Eviction state of one cell.
pub enum EvictionPolicy {
    /// LRU position vector; the back holds the most recently used slot
    Lru {
        /// Slot indices ordered oldest first
        order: Vec<usize>,
    },
    /// LFU scans hit counts on demand and keeps no state
    Lfu,
    /// FIFO cycles through slots in insertion order
    Fifo {
        /// Next slot to hand out
        next: usize,
    },
    /// CLOCK hand position
    Clock {
        /// Current hand position (modulo `CELL_SIZE` at use)
        hand: usize,
        /// Whether the last victim carried extra hits when the hand first
        /// stripped it
        victim_hot: bool,
    },
    /// GCLOCK hand position
    Gclock {
        /// Current hand position (modulo `CELL_SIZE` at use)
        hand: usize,
        /// Whether the last victim carried extra hits when the hand first
        /// stripped it
        victim_hot: bool,
    },
}

impl EvictionPolicy {
    /// Create the state for `kind`
    pub fn new(kind: CachePolicyKind) -> Self {
        match kind {
            CachePolicyKind::Lru => EvictionPolicy::Lru {
                order: Vec::with_capacity(CELL_SIZE),
            },
            CachePolicyKind::Lfu => EvictionPolicy::Lfu,
            CachePolicyKind::Fifo => EvictionPolicy::Fifo { next: 0 },
            CachePolicyKind::Clock => EvictionPolicy::Clock {
                hand: 0,
                victim_hot: false,
            },
            CachePolicyKind::Gclock => EvictionPolicy::Gclock {
                hand: 0,
                victim_hot: false,
            },
        }
    }

    /// The policy's identifier
    pub fn kind(&self) -> CachePolicyKind {
        match self {
            EvictionPolicy::Lru { .. } => CachePolicyKind::Lru,
            EvictionPolicy::Lfu => CachePolicyKind::Lfu,
            EvictionPolicy::Fifo { .. } => CachePolicyKind::Fifo,
            EvictionPolicy::Clock { .. } => CachePolicyKind::Clock,
            EvictionPolicy::Gclock { .. } => CachePolicyKind::Gclock,
        }
    }

    /// Pick a victim page and mark its data not-ready.
    ///
    /// Returns `None` when every page in the cell is pinned and nothing can
    /// be evicted; the caller must release the cell lock and wait.
    pub fn evict_page(&mut self, buf: &CellBuffer) -> Option<Arc<Page>> {
        match self {
            EvictionPolicy::Lru { order } => Some(evict_lru(order, buf)),
            EvictionPolicy::Lfu => Some(evict_lfu(buf)),
            EvictionPolicy::Fifo { next } => Some(evict_fifo(next, buf)),
            EvictionPolicy::Clock { hand, victim_hot } => {
                evict_clock(hand, victim_hot, buf, true)
            }
            EvictionPolicy::Gclock { hand, victim_hot } => {
                evict_clock(hand, victim_hot, buf, false)
            }
        }
    }

    /// Notify the policy of a hit on `page`
    pub fn access_page(&mut self, page: &Arc<Page>, buf: &CellBuffer) {
        if let EvictionPolicy::Lru { order } = self {
            if let Some(pos) = buf.get_idx(page) {
                if let Some(at) = order.iter().position(|&p| p == pos) {
                    order.remove(at);
                }
                order.push(pos);
            }
        }
    }

    /// Whether evicting `victim` should trigger a table expansion: the
    /// victim had been hit again after insertion, so the cell is too small
    /// for its working set. The clock policies consume hit counts while
    /// scanning, so they answer from the state recorded when the hand
    /// first stripped the victim.
    pub fn expand_buffer(&self, victim: &Page) -> bool {
        match self {
            EvictionPolicy::Lru { .. } => victim.hits() > 1,
            EvictionPolicy::Clock { victim_hot, .. }
            | EvictionPolicy::Gclock { victim_hot, .. } => *victim_hot,
            _ => false,
        }
    }
}

/// The front of the position vector holds the oldest slot. Spins until the
/// victim is unpinned; pins are held only for the duration of a copy or an
/// outstanding I/O.
fn evict_lru(order: &mut Vec<usize>, buf: &CellBuffer) -> Arc<Page> {
    let pos = if order.len() < CELL_SIZE {
        order.len()
    } else {
        order.remove(0)
    };
    let ret = buf.get_page(pos).clone();
    while ret.ref_count() > 0 {
        std::hint::spin_loop();
    }
    order.push(pos);
    ret.set_data_ready(false);
    ret
}

/// One scan for the unpinned page with the fewest hits; a fresh page (zero
/// hits) is taken immediately. Retries until a candidate appears.
fn evict_lfu(buf: &CellBuffer) -> Arc<Page> {
    loop {
        let mut ret: Option<Arc<Page>> = None;
        let mut min_hits = usize::MAX;
        let mut num_io_pending = 0;
        for i in 0..CELL_SIZE {
            let pg = buf.get_page(i);
            if pg.ref_count() > 0 {
                if pg.is_io_pending() {
                    num_io_pending += 1;
                }
                continue;
            }
            // the pin count only increases under the cell lock, so an
            // unpinned page seen here stays unpinned
            let hits = pg.hits() as usize;
            if hits < min_hits {
                min_hits = hits;
                ret = Some(pg.clone());
            }
            if min_hits == 0 {
                break;
            }
        }
        if let Some(pg) = ret {
            pg.set_data_ready(false);
            pg.reset_hits();
            return pg;
        }
        if num_io_pending == CELL_SIZE {
            tracing::warn!("all pages in the cell are io pending");
        }
        std::hint::spin_loop();
    }
}

fn evict_fifo(next: &mut usize, buf: &CellBuffer) -> Arc<Page> {
    loop {
        let pg = buf.get_page(*next).clone();
        *next = (*next + 1) % CELL_SIZE;
        if pg.ref_count() == 0 {
            pg.set_data_ready(false);
            return pg;
        }
        std::hint::spin_loop();
    }
}

/// Rotating-hand eviction. Pinned pages are skipped (counting them; a full
/// ring of pins returns `None`). Dirty pages are skipped on the first pass
/// and accepted once everything seen is dirty or pinned. The victim is the
/// first page with zero hits; otherwise the hand decrements (GCLOCK) or
/// clears (CLOCK) the count and advances.
///
/// Because the scan itself drives every count to zero, hotness has to be
/// captured up front: a slot whose count was above one when the hand first
/// stripped it is remembered, and `victim_hot` reports whether the chosen
/// victim was such a slot.
fn evict_clock(
    hand: &mut usize,
    victim_hot: &mut bool,
    buf: &CellBuffer,
    reset_hits: bool,
) -> Option<Arc<Page>> {
    let mut num_referenced = 0;
    let mut num_dirty = 0;
    let mut avoid_dirty = true;
    let mut hot_slots: u32 = 0;
    loop {
        let slot = *hand % CELL_SIZE;
        let pg = buf.get_page(slot);
        if num_dirty + num_referenced >= CELL_SIZE {
            num_dirty = 0;
            num_referenced = 0;
            avoid_dirty = false;
        }
        if pg.ref_count() > 0 {
            num_referenced += 1;
            if num_referenced >= CELL_SIZE {
                return None;
            }
            *hand = hand.wrapping_add(1);
            continue;
        }
        if avoid_dirty && pg.is_dirty() {
            num_dirty += 1;
            *hand = hand.wrapping_add(1);
            continue;
        }
        if pg.hits() == 0 {
            *victim_hot = hot_slots & (1 << slot) != 0;
            let ret = pg.clone();
            ret.set_data_ready(false);
            return Some(ret);
        }
        if pg.hits() > 1 {
            hot_slots |= 1 << slot;
        }
        if reset_hits {
            pg.reset_hits();
        } else {
            pg.set_hits(pg.hits() - 1);
        }
        *hand = hand.wrapping_add(1);
    }
}
